//! QEMU guests: validated configuration, process control and the target

pub mod config;
pub mod process;
pub mod target;

pub use config::{PortForward, QemuConfig, QemuNetwork};
pub use process::{QemuLaunch, QemuProcess};
pub use target::{QemuFactory, QemuGuest};
