//! Docker exec channels over a local pseudo-terminal.
//!
//! Provides:
//! - `DockerExecRuntime` - A `ContainerRuntime` that runs `docker exec -it`
//! - Exec command building with shell-style splitting
//! - Executable lookup for the runtime CLI

pub mod command;
pub mod docker;
pub mod locate;

pub use command::{ExecCommand, ExecCommandError};
pub use docker::{DockerExecRuntime, DockerSettings};
pub use locate::resolve_executable_path;
