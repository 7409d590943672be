//! Embedded templates for `refinery init`.

/// Default `refinery.toml` configuration.
pub(crate) const REFINERY_TOML: &str = include_str!("refinery.toml");

/// Dockerfile for the default pytest runner image.
pub(crate) const RUNNER_DOCKERFILE: &str = include_str!("runner.Dockerfile");
