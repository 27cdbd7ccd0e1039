//! ITF target backends
//!
//! Concrete [`itf_common::Target`] builders: containers through the docker
//! CLI, QEMU guests reached over SSH, and the OpenSSH-client sessions both
//! rely on.

mod command;
pub mod docker;
pub mod qemu;
pub mod ssh;

pub use command::shell_quote;
pub use docker::{ContainerRuntime, DockerConfig, DockerContainer, DockerFactory};
pub use qemu::{QemuConfig, QemuFactory, QemuLaunch};
pub use ssh::{OpenSshSession, ScpTransfer, SshEndpoint, SshSessionFactory};
