//! Domain-specific error types for sandbox operations.
//!
//! These never escape `Sandbox::execute`; they are rendered into the
//! diagnostic of a `SandboxError` result.

/// Infrastructure failures while preparing or running a container.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Docker daemon is not running or not accessible.
    #[error("Docker is not available: {message}")]
    DockerUnavailable { message: String },

    /// Runner image is missing and could not be pulled.
    #[error("Container image not found: {image}")]
    ImageNotFound { image: String },

    /// The created container is attached to a network.
    #[error("Container network is not isolated (network mode: {mode})")]
    NetworkNotIsolated { mode: String },

    /// Copying the file snapshot into the container failed.
    #[error("Failed to upload files into container: {message}")]
    UploadFailed { message: String },

    /// A setup step did not finish within its time limit.
    #[error("Sandbox setup timed out during {step} after {secs}s")]
    SetupTimedOut { step: &'static str, secs: u64 },

    /// Container operation failed (create, start, wait, etc.).
    #[error("Container operation failed: {message}")]
    ContainerFailed { message: String },
}

impl SandboxError {
    /// Creates a `DockerUnavailable` error.
    pub fn docker_unavailable(message: impl Into<String>) -> Self {
        Self::DockerUnavailable {
            message: message.into(),
        }
    }

    /// Creates an `ImageNotFound` error.
    pub fn image_not_found(image: impl Into<String>) -> Self {
        Self::ImageNotFound {
            image: image.into(),
        }
    }

    /// Creates a `NetworkNotIsolated` error.
    pub fn network_not_isolated(mode: impl Into<String>) -> Self {
        Self::NetworkNotIsolated { mode: mode.into() }
    }

    /// Creates an `UploadFailed` error.
    pub fn upload_failed(message: impl Into<String>) -> Self {
        Self::UploadFailed {
            message: message.into(),
        }
    }

    /// Creates a `SetupTimedOut` error.
    pub fn setup_timed_out(step: &'static str, limit: std::time::Duration) -> Self {
        Self::SetupTimedOut {
            step,
            secs: limit.as_secs(),
        }
    }

    /// Creates a `ContainerFailed` error.
    pub fn container_failed(message: impl Into<String>) -> Self {
        Self::ContainerFailed {
            message: message.into(),
        }
    }

    /// Returns true if this is a Docker unavailability error.
    pub fn is_docker_unavailable(&self) -> bool {
        matches!(self, Self::DockerUnavailable { .. })
    }

    /// Returns true if this is an image not found error.
    pub fn is_image_not_found(&self) -> bool {
        matches!(self, Self::ImageNotFound { .. })
    }
}
