//! Bounded reachability polling
//!
//! Every check here carries an explicit timeout and poll interval; none of
//! them polls forever.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace};

use crate::{Error, Result};

/// Timeout and interval for a polling check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            interval: Duration::from_secs(1),
        }
    }
}

/// Poll `probe` until it reports true or the policy's timeout passes
pub async fn wait_until<F, Fut>(what: &str, policy: PollPolicy, mut probe: F) -> Result<Duration>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if probe().await {
            let elapsed = start.elapsed();
            debug!("{} reachable after {} attempt(s) ({:?})", what, attempts, elapsed);
            return Ok(elapsed);
        }

        let elapsed = start.elapsed();
        if elapsed >= policy.timeout {
            return Err(Error::ReachabilityTimeout {
                what: what.to_string(),
                elapsed,
                timeout: policy.timeout,
            });
        }

        trace!("{} not ready (attempt {})", what, attempts);
        sleep(policy.interval.min(policy.timeout - elapsed)).await;
    }
}

/// Poll `probe` until it reports false, e.g. while waiting for a reboot to begin
pub async fn wait_until_lost<F, Fut>(
    what: &str,
    policy: PollPolicy,
    mut probe: F,
) -> Result<Duration>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let lost = format!("loss of {}", what);
    wait_until(&lost, policy, || {
        let fut = probe();
        async move { !fut.await }
    })
    .await
}

/// Single ICMP echo via the system `ping` binary
pub async fn icmp_probe(address: IpAddr) -> bool {
    let mut cmd = Command::new("ping");
    cmd.arg("-c").arg("1").arg("-W").arg("1");
    if address.is_ipv6() {
        cmd.arg("-6");
    }
    cmd.arg(address.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    match cmd.status().await {
        Ok(status) => status.success(),
        Err(e) => {
            debug!("Failed to run ping: {}", e);
            false
        }
    }
}

/// Single TCP connect attempt bounded by `connect_timeout`
pub async fn tcp_probe(address: SocketAddr, connect_timeout: Duration) -> bool {
    matches!(
        timeout(connect_timeout, TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}

/// Wait until `address` answers ICMP echo requests
pub async fn ping(address: IpAddr, policy: PollPolicy) -> Result<Duration> {
    let elapsed = wait_until(&format!("ping {}", address), policy, || icmp_probe(address)).await?;
    info!("Target {} is pingable", address);
    Ok(elapsed)
}

/// Wait until `address` stops answering ICMP echo requests
pub async fn ping_lost(address: IpAddr, policy: PollPolicy) -> Result<Duration> {
    wait_until_lost(&format!("ping {}", address), policy, || icmp_probe(address)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_wait_until_succeeds_after_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = PollPolicy::new(Duration::from_secs(2), Duration::from_millis(10));

        wait_until("flaky", policy, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { n >= 3 }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_wait_until_times_out_with_diagnostics() {
        let policy = PollPolicy::new(Duration::from_millis(50), Duration::from_millis(10));
        let err = wait_until("never", policy, || async { false }).await.unwrap_err();

        match err {
            Error::ReachabilityTimeout { what, elapsed, timeout } => {
                assert_eq!(what, "never");
                assert!(elapsed >= timeout);
                assert_eq!(timeout, Duration::from_millis(50));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_wait_until_lost_inverts_probe() {
        let policy = PollPolicy::new(Duration::from_millis(200), Duration::from_millis(10));
        wait_until_lost("gone", policy, || async { false }).await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_probe_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(tcp_probe(addr, Duration::from_secs(1)).await);

        drop(listener);
        let policy = PollPolicy::new(Duration::from_millis(100), Duration::from_millis(20));
        let result =
            wait_until("closed port", policy, || tcp_probe(addr, Duration::from_millis(50))).await;
        assert!(result.is_err());
    }
}
