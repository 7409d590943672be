//! CLI command implementations.
//!
//! Each submodule implements one `refinery` subcommand, with formatting
//! kept in pure functions separate from IO.

pub mod clean;
pub mod exec;
pub mod init;
pub mod run;
pub mod status;
