//! QEMU process management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::config::{QemuConfig, LOOPBACK_ADAPTER};
use itf_common::{Error, Result};

/// Host-side settings for launching a guest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QemuLaunch {
    /// QEMU system emulator binary
    pub binary: String,

    /// Guest disk image
    pub image: PathBuf,

    /// Discard guest writes on exit
    pub snapshot: bool,

    pub extra_args: Vec<String>,

    /// Time QEMU gets to exit after SIGTERM before it is killed
    pub stop_grace: Duration,
}

impl Default for QemuLaunch {
    fn default() -> Self {
        Self {
            binary: "qemu-system-x86_64".to_string(),
            image: PathBuf::new(),
            snapshot: true,
            extra_args: Vec::new(),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl QemuLaunch {
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }
}

fn image_format(image: &Path) -> &'static str {
    match image.extension().and_then(|e| e.to_str()) {
        Some("qcow2") => "qcow2",
        Some("vmdk") => "vmdk",
        Some("vdi") => "vdi",
        _ => "raw",
    }
}

/// Command line for the emulator
pub fn build_args(launch: &QemuLaunch, config: &QemuConfig) -> Vec<String> {
    let mut args = Vec::new();

    args.extend(["-m".to_string(), config.qemu_ram_size.clone()]);
    args.extend(["-smp".to_string(), config.qemu_num_cores.to_string()]);
    args.push("-nographic".to_string());

    let snapshot = if launch.snapshot { ",snapshot=on" } else { "" };
    args.extend([
        "-drive".to_string(),
        format!(
            "file={},format={},if=virtio{}",
            launch.image.display(),
            image_format(&launch.image),
            snapshot
        ),
    ]);

    for (idx, network) in config.networks.iter().enumerate() {
        let netdev = if network.name == LOOPBACK_ADAPTER {
            // User-mode networking, reachable through forwarded host ports
            let mut netdev = format!("user,id=net{}", idx);
            for forward in &config.port_forwarding {
                netdev.push_str(&format!(
                    ",hostfwd=tcp::{}-:{}",
                    forward.host_port, forward.guest_port
                ));
            }
            netdev
        } else {
            format!(
                "tap,id=net{},ifname={},script=no,downscript=no",
                idx, network.name
            )
        };
        args.extend([
            "-netdev".to_string(),
            netdev,
            "-device".to_string(),
            format!("virtio-net-pci,netdev=net{}", idx),
        ]);
    }

    args.extend(launch.extra_args.iter().cloned());
    args
}

/// A guest owned by the test run
pub struct QemuProcess {
    launch: QemuLaunch,
    args: Vec<String>,
    child: Mutex<Option<Child>>,
}

impl QemuProcess {
    pub async fn start(launch: QemuLaunch, config: &QemuConfig) -> Result<Self> {
        let args = build_args(&launch, config);
        let process = Self {
            launch,
            args,
            child: Mutex::new(None),
        };
        process.spawn().await?;
        Ok(process)
    }

    async fn spawn(&self) -> Result<()> {
        if !self.launch.image.is_file() {
            return Err(Error::environment(
                "qemu",
                format!("image not found: {}", self.launch.image.display()),
            ));
        }
        debug!("QEMU command: {} {}", self.launch.binary, self.args.join(" "));

        let mut child = Command::new(&self.launch.binary)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::environment("qemu", format!("failed to spawn QEMU: {}", e)))?;

        // Bad arguments make QEMU exit right away
        sleep(Duration::from_millis(200)).await;
        if let Some(status) = child.try_wait()? {
            return Err(Error::environment(
                "qemu",
                format!("QEMU exited immediately with {}", status),
            ));
        }

        info!("QEMU started with PID {}", child.id().unwrap_or_default());
        *self.child.lock().await = Some(child);
        Ok(())
    }

    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }

    pub async fn is_running(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// SIGTERM, then kill once the grace period is over
    pub async fn stop(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        match timeout(self.launch.stop_grace, child.wait()).await {
            Ok(status) => debug!("QEMU exited with {}", status?),
            Err(_) => {
                warn!("QEMU ignored SIGTERM, killing it");
                child.kill().await?;
            }
        }
        info!("QEMU stopped");
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.spawn().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str) -> QemuConfig {
        QemuConfig::from_json(json).unwrap()
    }

    #[test]
    fn test_build_args_tap() {
        let config = config(
            r#"{"networks": [{"name": "tap0",
                              "ip_address": "169.254.158.190",
                              "gateway": "169.254.21.88"}],
                "ssh_port": 22, "qemu_num_cores": 2, "qemu_ram_size": "1G"}"#,
        );
        let args = build_args(&QemuLaunch::new("/images/guest.qcow2"), &config);

        assert_eq!(&args[..5], ["-m", "1G", "-smp", "2", "-nographic"]);
        let drive = "file=/images/guest.qcow2,format=qcow2,if=virtio,snapshot=on";
        assert!(args.contains(&drive.to_string()));
        assert!(args.contains(&"tap,id=net0,ifname=tap0,script=no,downscript=no".to_string()));
        assert!(args.contains(&"virtio-net-pci,netdev=net0".to_string()));
    }

    #[test]
    fn test_build_args_port_forwarding() {
        let config = config(
            r#"{"networks": [{"name": "lo", "ip_address": "127.0.0.1", "gateway": "127.0.0.1"}],
                "ssh_port": 2222, "qemu_num_cores": 1, "qemu_ram_size": "512M",
                "port_forwarding": [{"host_port": 2222, "guest_port": 22},
                                    {"host_port": 8080, "guest_port": 80}]}"#,
        );
        let mut launch = QemuLaunch::new("guest.img");
        launch.snapshot = false;
        launch.extra_args = vec!["-enable-kvm".to_string()];
        let args = build_args(&launch, &config);

        assert!(args.contains(&"file=guest.img,format=raw,if=virtio".to_string()));
        assert!(args.contains(
            &"user,id=net0,hostfwd=tcp::2222-:22,hostfwd=tcp::8080-:80".to_string()
        ));
        assert_eq!(args.last().unwrap(), "-enable-kvm");
    }

    #[tokio::test]
    async fn test_missing_image_is_environment_error() {
        let config = config(
            r#"{"networks": [{"name": "lo", "ip_address": "127.0.0.1", "gateway": "127.0.0.1"}],
                "ssh_port": 2222, "qemu_num_cores": 1, "qemu_ram_size": "512M"}"#,
        );
        let err = QemuProcess::start(QemuLaunch::new("/nonexistent/guest.qcow2"), &config)
            .await
            .err()
            .unwrap();
        assert!(err.is_environment());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_and_restart_with_stand_in_emulator() {
        let config = config(
            r#"{"networks": [{"name": "lo", "ip_address": "127.0.0.1", "gateway": "127.0.0.1"}],
                "ssh_port": 2222, "qemu_num_cores": 1, "qemu_ram_size": "512M"}"#,
        );
        let image = tempfile::NamedTempFile::new().unwrap();
        let mut launch = QemuLaunch::new(image.path());
        // `sleep` rejects the emulator flags, so run it through sh
        launch.binary = "sh".to_string();
        launch.extra_args = vec![];
        let process = QemuProcess {
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            launch,
            child: Mutex::new(None),
        };
        process.spawn().await.unwrap();
        assert!(process.is_running().await);
        let first = process.pid().await;

        process.restart().await.unwrap();
        assert!(process.is_running().await);
        assert_ne!(process.pid().await, first);

        process.stop().await.unwrap();
        assert!(!process.is_running().await);
        process.stop().await.unwrap();
    }
}
