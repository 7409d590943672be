//! Docker-backed sandbox.
//!
//! Each execution gets a fresh container with networking disabled and
//! no host mounts. Files are copied in as a tar archive and the container
//! is removed on every exit path.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    KillContainerOptions, ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    UploadToContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::ContainerWaitResponse;
use bollard::service::HostConfig;
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tar::{Builder, EntryType, Header};
use tracing::{debug, info, warn};

use super::{CancelToken, Sandbox, SandboxError, SandboxResult, SandboxSpec};
use crate::workspace::FileSnapshot;

/// Label attached to every container this sandbox creates.
pub(crate) const MANAGED_LABEL: &str = "refinery.managed";

/// Cap on captured output per stream.
const MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

const TRUNCATION_MARKER: &str = "\n[output truncated]\n";

/// Limit on each daemon-side setup stage before the command starts.
const SETUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Limit on the image stage when a pull is allowed.
const PULL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Runs commands in throwaway Docker containers.
#[derive(Debug, Clone)]
pub(crate) struct DockerSandbox {
    pull_missing: bool,
}

impl DockerSandbox {
    /// Creates a sandbox. When `pull_missing` is set, absent images are
    /// pulled before the first container is created.
    pub fn new(pull_missing: bool) -> Self {
        Self { pull_missing }
    }

    async fn connect() -> Result<Docker, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::docker_unavailable(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| SandboxError::docker_unavailable(e.to_string()))?;
        Ok(docker)
    }

    async fn ensure_image(&self, docker: &Docker, image: &str) -> Result<(), SandboxError> {
        match docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(SandboxError::container_failed(format!("inspect image: {e}"))),
        }
        if !self.pull_missing {
            return Err(SandboxError::image_not_found(image));
        }

        info!(event = "image_pull", image = %image, "Pulling runner image");
        let mut stream = std::pin::pin!(docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        ));
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => {
                    if let Some(error) = output.error {
                        warn!(image = %image, error = %error, "Image pull failed");
                        return Err(SandboxError::image_not_found(image));
                    }
                }
                Err(e) => {
                    warn!(image = %image, error = %e, "Image pull failed");
                    return Err(SandboxError::image_not_found(image));
                }
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        spec: &SandboxSpec,
        snapshot: &FileSnapshot,
        cancel: &CancelToken,
        started: Instant,
    ) -> Result<SandboxResult, SandboxError> {
        let image_limit = if self.pull_missing {
            PULL_TIMEOUT
        } else {
            SETUP_TIMEOUT
        };
        let image_stage = async {
            let docker = Self::connect().await?;
            self.ensure_image(&docker, spec.image()).await?;
            Ok::<_, SandboxError>(docker)
        };
        let docker = match race_setup(image_stage, "image check", image_limit, cancel).await? {
            Setup::Ready(docker) => docker,
            Setup::Cancelled => return Ok(cancelled_during_setup(started)),
        };

        let container_stage = prepare_container(&docker, spec, snapshot);
        let (name, guard) =
            match race_setup(container_stage, "container setup", SETUP_TIMEOUT, cancel).await? {
                Setup::Ready(prepared) => prepared,
                Setup::Cancelled => return Ok(cancelled_during_setup(started)),
            };

        let finish = {
            let mut wait = std::pin::pin!(docker.wait_container(
                &name,
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            ));
            tokio::select! {
                next = wait.next() => Finish::Exited(exit_code(next)?),
                () = tokio::time::sleep(spec.timeout()) => Finish::TimedOut,
                () = cancel.cancelled() => Finish::Cancelled,
            }
        };

        if !matches!(finish, Finish::Exited(_)) {
            kill(&docker, &name).await;
        }

        let (stdout, stderr) = collect_logs(&docker, &name).await;
        guard.release().await;

        let duration = started.elapsed();
        Ok(match finish {
            Finish::Exited(code) => SandboxResult::completed(code, stdout, stderr, duration),
            Finish::TimedOut => SandboxResult::timed_out(stdout, stderr, duration),
            Finish::Cancelled => SandboxResult::cancelled(stdout, stderr, duration),
        })
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn execute(
        &self,
        spec: &SandboxSpec,
        snapshot: &FileSnapshot,
        cancel: &CancelToken,
    ) -> SandboxResult {
        let started = Instant::now();
        if cancel.is_cancelled() {
            return SandboxResult::cancelled(String::new(), String::new(), started.elapsed());
        }

        info!(
            event = "sandbox_start",
            image = %spec.image(),
            files = snapshot.len(),
            bytes = snapshot.total_bytes(),
            timeout_secs = spec.timeout().as_secs(),
            "Starting sandboxed execution"
        );

        let result = match self.run(spec, snapshot, cancel, started).await {
            Ok(result) => result,
            Err(e) => {
                warn!(event = "sandbox_error", error = %e, "Sandbox infrastructure failure");
                let mut diagnostic = e.to_string();
                if e.is_image_not_found() {
                    diagnostic.push_str(" (build it with: docker build -t <image> -f runner.Dockerfile .)");
                }
                SandboxResult::sandbox_error(diagnostic, started.elapsed())
            }
        };

        info!(
            event = "sandbox_end",
            status = %result.status,
            exit_code = ?result.exit_code,
            duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            "Sandboxed execution finished"
        );
        result
    }

    async fn cleanup_orphaned(&self) -> Result<u32> {
        let docker = Self::connect().await?;

        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{MANAGED_LABEL}=true")]);
        let containers = docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("Failed to list containers")?;

        let mut removed = 0;
        for container in containers {
            let Some(id) = container.id else { continue };
            match docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => {
                    debug!(container = %id, "Removed orphaned container");
                    removed += 1;
                }
                Err(e) => warn!(container = %id, error = %e, "Failed to remove container"),
            }
        }
        Ok(removed)
    }
}

/// Result of a setup stage raced against cancellation.
enum Setup<T> {
    Ready(T),
    Cancelled,
}

/// Runs one setup stage until it finishes, `limit` elapses or `cancel`
/// fires. A stage dropped midway releases its resources through drop
/// guards.
async fn race_setup<T, F>(
    stage: F,
    step: &'static str,
    limit: Duration,
    cancel: &CancelToken,
) -> Result<Setup<T>, SandboxError>
where
    F: Future<Output = Result<T, SandboxError>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!(step, "Sandbox setup cancelled");
            Ok(Setup::Cancelled)
        }
        result = tokio::time::timeout(limit, stage) => match result {
            Ok(ready) => ready.map(Setup::Ready),
            Err(_) => Err(SandboxError::setup_timed_out(step, limit)),
        },
    }
}

fn cancelled_during_setup(started: Instant) -> SandboxResult {
    SandboxResult::cancelled(String::new(), String::new(), started.elapsed())
}

/// Creates, checks, fills and starts a container.
///
/// The guard is armed before the create request so a stage dropped while
/// that request is in flight still removes the container.
async fn prepare_container(
    docker: &Docker,
    spec: &SandboxSpec,
    snapshot: &FileSnapshot,
) -> Result<(String, ContainerGuard), SandboxError> {
    let name = container_name();
    let guard = ContainerGuard::new(docker.clone(), name.clone());

    debug!(container = %name, image = %spec.image(), "Creating container");
    docker
        .create_container(
            Some(CreateContainerOptions {
                name: name.clone(),
                platform: None,
            }),
            build_container_config(spec),
        )
        .await
        .map_err(|e| SandboxError::container_failed(format!("create: {e}")))?;

    verify_isolation(docker, &name).await?;

    let archive = build_archive(snapshot, spec.workdir())
        .map_err(|e| SandboxError::upload_failed(e.to_string()))?;
    docker
        .upload_to_container(
            &name,
            Some(UploadToContainerOptions {
                path: "/".to_string(),
                ..Default::default()
            }),
            archive,
        )
        .await
        .map_err(|e| SandboxError::upload_failed(e.to_string()))?;

    docker
        .start_container::<String>(&name, None)
        .await
        .map_err(|e| SandboxError::container_failed(format!("start: {e}")))?;

    Ok((name, guard))
}

enum Finish {
    Exited(i64),
    TimedOut,
    Cancelled,
}

/// Removes the container when dropped unless released first.
///
/// Covers early returns and a dropped `execute` future.
struct ContainerGuard {
    docker: Docker,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(docker: Docker, name: String) -> Self {
        Self {
            docker,
            name,
            armed: true,
        }
    }

    async fn release(mut self) {
        self.armed = false;
        remove(&self.docker, &self.name).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let docker = self.docker.clone();
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { remove(&docker, &name).await });
            }
            Err(_) => warn!(container = %name, "No runtime available to remove container"),
        }
    }
}

async fn remove(docker: &Docker, name: &str) {
    let result = docker
        .remove_container(
            name,
            Some(RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            }),
        )
        .await;
    match result {
        Ok(()) => debug!(container = %name, "Removed container"),
        Err(e) if is_not_found(&e) => {}
        Err(e) => warn!(container = %name, error = %e, "Failed to remove container"),
    }
}

async fn kill(docker: &Docker, name: &str) {
    if let Err(e) = docker
        .kill_container(name, Some(KillContainerOptions { signal: "SIGKILL" }))
        .await
    {
        // Already stopped containers answer 409.
        debug!(container = %name, error = %e, "Kill failed");
    }
}

async fn verify_isolation(docker: &Docker, name: &str) -> Result<(), SandboxError> {
    let inspect = docker
        .inspect_container(name, None::<InspectContainerOptions>)
        .await
        .map_err(|e| SandboxError::container_failed(format!("inspect: {e}")))?;
    let mode = inspect
        .host_config
        .and_then(|host| host.network_mode)
        .unwrap_or_default();
    if mode == "none" {
        Ok(())
    } else {
        Err(SandboxError::network_not_isolated(mode))
    }
}

async fn collect_logs(docker: &Docker, name: &str) -> (String, String) {
    let mut stdout = CappedBuffer::default();
    let mut stderr = CappedBuffer::default();

    let mut stream = std::pin::pin!(docker.logs(
        name,
        Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        }),
    ));
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(LogOutput::StdOut { message }) => stdout.push(&message),
            Ok(LogOutput::StdErr { message }) => stderr.push(&message),
            Ok(_) => {}
            Err(e) => {
                warn!(container = %name, error = %e, "Error reading container logs");
                break;
            }
        }
    }
    (stdout.finish(), stderr.finish())
}

#[derive(Default)]
struct CappedBuffer {
    bytes: Vec<u8>,
    truncated: bool,
}

impl CappedBuffer {
    fn push(&mut self, chunk: &[u8]) {
        let room = MAX_OUTPUT_BYTES.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn finish(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

fn exit_code(next: Option<Result<ContainerWaitResponse, DockerError>>) -> Result<i64, SandboxError> {
    match next {
        Some(Ok(response)) => Ok(response.status_code),
        // Non-zero exits surface as a wait error carrying the code.
        Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
        Some(Err(e)) => Err(SandboxError::container_failed(format!("wait: {e}"))),
        None => Err(SandboxError::container_failed(
            "wait stream ended without an exit status",
        )),
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn container_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("refinery-{}", &id[..8])
}

fn build_container_config(spec: &SandboxSpec) -> ContainerConfig<String> {
    let limits = spec.limits();
    let mut labels = HashMap::new();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

    ContainerConfig {
        image: Some(spec.image().to_string()),
        entrypoint: Some(spec.command().to_vec()),
        working_dir: Some(spec.workdir().to_string()),
        network_disabled: Some(spec.network_disabled()),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        labels: Some(labels),
        env: Some(vec![
            "PYTHONDONTWRITEBYTECODE=1".to_string(),
            "PYTHONUNBUFFERED=1".to_string(),
        ]),
        host_config: Some(HostConfig {
            network_mode: Some("none".to_string()),
            memory: Some(limits.memory_bytes),
            memory_swap: Some(limits.memory_bytes),
            nano_cpus: Some(limits.nano_cpus),
            pids_limit: Some(limits.pids_limit),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Packs the snapshot into a tar rooted at `/`, under `workdir`.
fn build_archive(snapshot: &FileSnapshot, workdir: &str) -> std::io::Result<Bytes> {
    let prefix = PathBuf::from(workdir.trim_start_matches('/'));

    let mut dirs = BTreeSet::new();
    for ancestor in prefix.ancestors() {
        if !ancestor.as_os_str().is_empty() {
            dirs.insert(ancestor.to_path_buf());
        }
    }
    for (path, _) in snapshot.iter() {
        let mut parent = path.parent();
        while let Some(dir) = parent.filter(|d| !d.as_os_str().is_empty()) {
            dirs.insert(prefix.join(dir));
            parent = dir.parent();
        }
    }

    let mut buf = Vec::new();
    {
        let mut tar = Builder::new(&mut buf);
        // BTreeSet order puts parents before children.
        for dir in &dirs {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            tar.append_data(&mut header, dir, std::io::empty())?;
        }
        for (path, contents) in snapshot.iter() {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(contents.len() as u64);
            tar.append_data(&mut header, prefix.join(path), contents)?;
        }
        tar.finish()?;
    }
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxStatus;

    fn test_image() -> String {
        std::env::var("REFINERY_TEST_IMAGE").unwrap_or_else(|_| "alpine:3".to_string())
    }

    /// Docker tests only run when the daemon is up and the image is already local.
    async fn docker_ready() -> bool {
        let Ok(docker) = Docker::connect_with_local_defaults() else {
            return false;
        };
        docker.ping().await.is_ok() && docker.inspect_image(&test_image()).await.is_ok()
    }

    /// True when a managed container whose command mentions `marker` still exists.
    async fn container_left_behind(marker: &str) -> bool {
        let docker = Docker::connect_with_local_defaults().unwrap();
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{MANAGED_LABEL}=true")]);
        let remaining = docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .unwrap();
        remaining
            .iter()
            .any(|c| c.command.as_deref().is_some_and(|cmd| cmd.contains(marker)))
    }

    fn marker() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    fn shell_spec(script: &str, timeout: Duration) -> SandboxSpec {
        SandboxSpec::new(
            test_image(),
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout,
        )
        .unwrap()
    }

    fn entry_paths(archive: &[u8]) -> Vec<PathBuf> {
        let mut reader = tar::Archive::new(archive);
        reader
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().into_owned())
            .collect()
    }

    #[test]
    fn test_archive_layout() {
        let mut snapshot = FileSnapshot::new();
        snapshot.insert("calculator.py", b"def add(a, b): return a + b\n".to_vec());
        snapshot.insert("tests/test_calc.py", b"".to_vec());

        let archive = build_archive(&snapshot, "/workspace").unwrap();

        assert_eq!(
            entry_paths(&archive),
            vec![
                PathBuf::from("workspace"),
                PathBuf::from("workspace/tests"),
                PathBuf::from("workspace/calculator.py"),
                PathBuf::from("workspace/tests/test_calc.py"),
            ]
        );
    }

    #[test]
    fn test_archive_nested_workdir() {
        let archive = build_archive(&FileSnapshot::new(), "/srv/app").unwrap();
        assert_eq!(
            entry_paths(&archive),
            vec![PathBuf::from("srv"), PathBuf::from("srv/app")]
        );
    }

    #[test]
    fn test_container_config_is_isolated() {
        let spec = SandboxSpec::new("img", vec!["pytest".to_string()], Duration::from_secs(5))
            .unwrap();
        let config = build_container_config(&spec);
        let host = config.host_config.unwrap();

        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert!(host.binds.is_none());
        assert!(host.mounts.is_none());
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(
            config.labels.unwrap().get(MANAGED_LABEL).map(String::as_str),
            Some("true")
        );
        assert_eq!(config.entrypoint, Some(vec!["pytest".to_string()]));
    }

    #[test]
    fn test_capped_buffer_truncates() {
        let mut buf = CappedBuffer::default();
        buf.push(&vec![b'a'; MAX_OUTPUT_BYTES - 1]);
        buf.push(b"bcd");
        let text = buf.finish();
        assert!(text.ends_with(TRUNCATION_MARKER));
        assert_eq!(text.len(), MAX_OUTPUT_BYTES + TRUNCATION_MARKER.len());
    }

    #[test]
    fn test_exit_code_from_wait_error() {
        let err = DockerError::DockerContainerWaitError {
            error: String::new(),
            code: 3,
        };
        assert_eq!(exit_code(Some(Err(err))).unwrap(), 3);
        assert!(exit_code(None).is_err());
    }

    #[test]
    fn test_container_name_prefix() {
        let name = container_name();
        assert!(name.starts_with("refinery-"));
        assert_eq!(name.len(), "refinery-".len() + 8);
    }

    #[tokio::test]
    async fn test_execute_precancelled_skips_docker() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let spec = shell_spec("true", Duration::from_secs(5));

        let result = DockerSandbox::new(false)
            .execute(&spec, &FileSnapshot::new(), &cancel)
            .await;

        assert_eq!(result.status, SandboxStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_execute_reports_exit_code_and_files() {
        if !docker_ready().await {
            return;
        }
        let mut snapshot = FileSnapshot::new();
        snapshot.insert("data/input.txt", b"hello".to_vec());
        let spec = shell_spec(
            "cat data/input.txt; echo oops >&2; exit 3",
            Duration::from_secs(60),
        );

        let result = DockerSandbox::new(false)
            .execute(&spec, &snapshot, &CancelToken::new())
            .await;

        assert_eq!(result.status, SandboxStatus::Completed, "{result:?}");
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout, "hello");
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        if !docker_ready().await {
            return;
        }
        let marker = marker();
        let spec = shell_spec(&format!("true {marker}; sleep 30"), Duration::from_secs(2));

        let result = DockerSandbox::new(false)
            .execute(&spec, &FileSnapshot::new(), &CancelToken::new())
            .await;

        assert_eq!(result.status, SandboxStatus::TimedOut, "{result:?}");
        assert_eq!(result.exit_code, None);
        assert!(result.duration < Duration::from_secs(25));
        assert!(!container_left_behind(&marker).await);
    }

    #[tokio::test]
    async fn test_execute_has_no_network() {
        if !docker_ready().await {
            return;
        }
        // Only the loopback interface may exist.
        let spec = shell_spec(
            "ls /sys/class/net | grep -v '^lo$' && exit 1 || exit 0",
            Duration::from_secs(60),
        );

        let result = DockerSandbox::new(false)
            .execute(&spec, &FileSnapshot::new(), &CancelToken::new())
            .await;

        assert_eq!(result.status, SandboxStatus::Completed, "{result:?}");
        assert_eq!(result.exit_code, Some(0), "stdout: {}", result.stdout);
    }

    #[tokio::test]
    async fn test_execute_cannot_open_connections() {
        if !docker_ready().await {
            return;
        }
        // The default bridge gateway is the host; 1.1.1.1 is a public resolver.
        // Exit 2 means wget is missing, exit 1 means a connection worked.
        let spec = shell_spec(
            "command -v wget >/dev/null || exit 2; \
             for addr in 172.17.0.1 1.1.1.1; do \
               wget -T 3 -q -O /dev/null \"http://$addr/\" && { echo \"reached $addr\"; exit 1; }; \
             done; exit 0",
            Duration::from_secs(60),
        );

        let result = DockerSandbox::new(false)
            .execute(&spec, &FileSnapshot::new(), &CancelToken::new())
            .await;

        assert_eq!(result.status, SandboxStatus::Completed, "{result:?}");
        if result.exit_code == Some(2) {
            return;
        }
        assert_eq!(result.exit_code, Some(0), "stdout: {}", result.stdout);
    }

    #[tokio::test]
    async fn test_execute_cancelled() {
        if !docker_ready().await {
            return;
        }
        let marker = marker();
        let spec = shell_spec(&format!("true {marker}; sleep 30"), Duration::from_secs(60));
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let result = DockerSandbox::new(false)
            .execute(&spec, &FileSnapshot::new(), &cancel)
            .await;

        assert_eq!(result.status, SandboxStatus::Cancelled, "{result:?}");
        assert!(!container_left_behind(&marker).await);
    }

    #[tokio::test]
    async fn test_execute_removes_container() {
        if !docker_ready().await {
            return;
        }
        let marker = marker();
        let spec = shell_spec(&format!("true {marker}"), Duration::from_secs(60));
        let _ = DockerSandbox::new(false)
            .execute(&spec, &FileSnapshot::new(), &CancelToken::new())
            .await;

        assert!(!container_left_behind(&marker).await);
    }

    #[tokio::test]
    async fn test_setup_stage_stops_on_cancel() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let hung = std::future::pending::<Result<(), SandboxError>>();

        let setup = race_setup(hung, "image check", Duration::from_secs(300), &cancel)
            .await
            .unwrap();

        assert!(matches!(setup, Setup::Cancelled));
    }

    #[tokio::test]
    async fn test_setup_stage_times_out() {
        let hung = std::future::pending::<Result<(), SandboxError>>();

        let err = race_setup(hung, "container setup", Duration::from_millis(20), &CancelToken::new())
            .await
            .err()
            .unwrap();

        assert!(matches!(
            err,
            SandboxError::SetupTimedOut {
                step: "container setup",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_setup_stage_passes_result_through() {
        let ready = async { Ok::<_, SandboxError>(7) };
        let setup = race_setup(ready, "image check", Duration::from_secs(5), &CancelToken::new())
            .await
            .unwrap();
        assert!(matches!(setup, Setup::Ready(7)));

        let failing = async { Err::<(), _>(SandboxError::docker_unavailable("refused")) };
        let err = race_setup(failing, "image check", Duration::from_secs(5), &CancelToken::new())
            .await
            .err()
            .unwrap();
        assert!(err.is_docker_unavailable());
    }

    #[tokio::test]
    async fn test_execute_missing_image_without_pull() {
        let Ok(docker) = Docker::connect_with_local_defaults() else {
            return;
        };
        if docker.ping().await.is_err() {
            return;
        }
        let spec = SandboxSpec::new(
            "refinery-test/does-not-exist:never",
            vec!["true".to_string()],
            Duration::from_secs(10),
        )
        .unwrap();

        let result = DockerSandbox::new(false)
            .execute(&spec, &FileSnapshot::new(), &CancelToken::new())
            .await;

        assert_eq!(result.status, SandboxStatus::SandboxError);
        assert!(result.diagnostic.unwrap().contains("not found"));
    }
}
