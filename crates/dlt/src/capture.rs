//! DLT capture: one reader task feeding one record
//!
//! The reader owns the transport (UDP socket, TCP stream, or the stdout of
//! an external receiver). Reader errors are logged and end the reader. An
//! external receiver that exits before the capture is stopped is reported by
//! [`DltCapture::stop`].

use bytes::BytesMut;
use futures::StreamExt;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::DltCodec;
use crate::config::{CaptureConfig, CaptureFilter, Receiver, Transport};
use crate::frame::DltFrame;
use crate::record::DltRecord;
use itf_common::{Error, Result};

/// Largest datagram a DLT sender may emit
const MAX_DATAGRAM: usize = 65_536;
/// Consecutive socket errors tolerated before the reader gives up
const MAX_CONSECUTIVE_ERRORS: u32 = 5;
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(2);
/// Time an external receiver gets to exit after SIGTERM
const TERMINATE_GRACE: Duration = Duration::from_secs(1);
/// Time the reader gets to drain a terminated receiver's output
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// An external receiver must stay up this long for the capture to count as started
const STARTUP_GRACE: Duration = Duration::from_millis(300);
/// Receiver stderr lines kept for error reports
const STDERR_TAIL: usize = 20;

/// Counters reported when a capture stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub received: u64,
    pub recorded: u64,
    pub filtered: u64,
    pub reconnects: u64,
}

/// Filters frames into the record
struct Sink {
    record: Arc<DltRecord>,
    filter: Option<CaptureFilter>,
    stats: CaptureStats,
}

impl Sink {
    fn publish(&mut self, frame: DltFrame) {
        self.stats.received += 1;
        if let Some(filter) = &self.filter {
            if !filter.allows(&frame) {
                self.stats.filtered += 1;
                return;
            }
        }
        if self.record.append(frame) {
            self.stats.recorded += 1;
        }
    }
}

fn start_error(what: impl std::fmt::Display, e: impl std::fmt::Display) -> Error {
    Error::CaptureStart(format!("{}: {}", what, e))
}

/// Last lines an external receiver wrote to stderr
struct ReceiverStderr {
    tail: Arc<Mutex<VecDeque<String>>>,
    reader: JoinHandle<()>,
}

impl ReceiverStderr {
    fn spawn(stderr: ChildStderr, name: String) -> Self {
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL)));
        let lines = tail.clone();
        let reader = tokio::spawn(async move {
            let mut stderr = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = stderr.next_line().await {
                debug!("{}: {}", name, line);
                let mut lines = lines.lock();
                if lines.len() == STDERR_TAIL {
                    lines.pop_front();
                }
                lines.push_back(line);
            }
        });
        Self { tail, reader }
    }

    /// Wait for the exited receiver's stderr to close and return its tail
    async fn collect(mut self) -> String {
        if timeout(DRAIN_TIMEOUT, &mut self.reader).await.is_err() {
            self.reader.abort();
        }
        let lines: Vec<String> = self.tail.lock().iter().cloned().collect();
        lines.join("; ")
    }
}

fn exited(status: ExitStatus, stderr: &str) -> String {
    if stderr.is_empty() {
        format!("exited ({})", status)
    } else {
        format!("exited ({}): {}", status, stderr)
    }
}

/// Running capture session
pub struct DltCapture {
    token: CancellationToken,
    reader: Option<JoinHandle<CaptureStats>>,
    child: Option<Child>,
    stderr: Option<ReceiverStderr>,
    local_addr: Option<SocketAddr>,
    description: String,
}

impl DltCapture {
    /// Open the transport and start the reader
    ///
    /// Returns once the transport is ready to receive. An external receiver
    /// must survive a short startup grace period. Every failure here is
    /// [`Error::CaptureStart`].
    pub async fn start(config: &CaptureConfig, record: Arc<DltRecord>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| start_error("invalid capture configuration", e))?;
        let filter = config
            .filter
            .as_deref()
            .map(str::parse::<CaptureFilter>)
            .transpose()?;
        let sink = Sink {
            record,
            filter,
            stats: CaptureStats::default(),
        };
        let token = CancellationToken::new();

        let capture = match &config.receiver {
            Receiver::Socket => match config.transport {
                Transport::Udp => {
                    let socket = bind_udp(config)?;
                    let local_addr = socket.local_addr().ok();
                    let description = format!(
                        "udp {}",
                        local_addr.map_or_else(|| "?".to_string(), |a| a.to_string())
                    );
                    let reader = tokio::spawn(read_datagrams(socket, sink, token.clone()));
                    Self {
                        token,
                        reader: Some(reader),
                        child: None,
                        stderr: None,
                        local_addr,
                        description,
                    }
                }
                Transport::Tcp => {
                    let peer = tcp_peer(config)?;
                    let stream = connect(peer)
                        .await
                        .map_err(|e| start_error(format!("connect to {}", peer), e))?;
                    let local_addr = stream.local_addr().ok();
                    let reader = tokio::spawn(read_tcp(peer, stream, sink, token.clone()));
                    Self {
                        token,
                        reader: Some(reader),
                        child: None,
                        stderr: None,
                        local_addr,
                        description: format!("tcp {}", peer),
                    }
                }
            },
            Receiver::Process { binary, .. } => {
                let args = config.process_args();
                debug!("Spawning {} {}", binary.display(), args.join(" "));
                let mut child = Command::new(binary)
                    .args(&args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| start_error(format!("spawn {}", binary.display()), e))?;
                let stderr = child
                    .stderr
                    .take()
                    .map(|stderr| ReceiverStderr::spawn(stderr, binary.display().to_string()));

                // A receiver that cannot bind or connect exits right away
                match timeout(STARTUP_GRACE, child.wait()).await {
                    Ok(Ok(status)) => {
                        let output = match stderr {
                            Some(stderr) => stderr.collect().await,
                            None => String::new(),
                        };
                        return Err(start_error(binary.display(), exited(status, &output)));
                    }
                    Ok(Err(e)) => {
                        return Err(start_error(format!("wait for {}", binary.display()), e));
                    }
                    Err(_) => {}
                }
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| start_error(binary.display(), "stdout not captured"))?;
                let frames = FramedRead::new(stdout, DltCodec::with_storage_header());
                let reader = tokio::spawn(read_receiver(frames, sink, token.clone()));
                Self {
                    token,
                    reader: Some(reader),
                    child: Some(child),
                    stderr,
                    local_addr: None,
                    description: format!("process {}", binary.display()),
                }
            }
        };

        info!("DLT capture started ({})", capture.description);
        Ok(capture)
    }

    /// Local address of the capture socket, if the capture owns one
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.reader.as_ref().is_some_and(|r| !r.is_finished())
    }

    /// Stop the capture and wait for the reader to exit
    ///
    /// An external receiver that already exited on its own is reported as an
    /// environment error once the reader has drained its output.
    pub async fn stop(mut self) -> Result<CaptureStats> {
        let Some(mut reader) = self.reader.take() else {
            return Ok(CaptureStats::default());
        };

        let mut joined = None;
        let mut receiver_exit = None;
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let output = match self.stderr.take() {
                        Some(stderr) => stderr.collect().await,
                        None => String::new(),
                    };
                    let reason = format!("receiver {}", exited(status, &output));
                    warn!("DLT capture ({}) lost its {}", self.description, reason);
                    receiver_exit = Some(Error::environment("dlt", reason));
                }
                _ => terminate(child).await,
            }
            // Let the reader consume what the receiver flushed before exiting
            match timeout(DRAIN_TIMEOUT, &mut reader).await {
                Ok(result) => joined = Some(result),
                Err(_) => warn!("Reader did not drain within {:?}", DRAIN_TIMEOUT),
            }
        }

        self.token.cancel();
        let stats = match joined {
            Some(result) => result,
            None => match timeout(DRAIN_TIMEOUT, &mut reader).await {
                Ok(result) => result,
                Err(_) => {
                    reader.abort();
                    reader.await
                }
            },
        };

        let stats = match stats {
            Ok(stats) => stats,
            Err(e) if e.is_cancelled() => CaptureStats::default(),
            Err(e) => return Err(Error::Internal(format!("DLT reader task failed: {}", e))),
        };
        if let Some(stderr) = self.stderr.take() {
            stderr.reader.abort();
        }
        info!(
            "DLT capture stopped ({}): {} received, {} recorded, {} filtered",
            self.description, stats.received, stats.recorded, stats.filtered
        );
        match receiver_exit {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

impl Drop for DltCapture {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            warn!("DLT capture ({}) dropped without stop", self.description);
            self.token.cancel();
            reader.abort();
        }
        if let Some(stderr) = self.stderr.take() {
            stderr.reader.abort();
        }
        // `kill_on_drop` takes care of an external receiver
    }
}

fn tcp_peer(config: &CaptureConfig) -> Result<SocketAddr> {
    config
        .target_address
        .map(|ip| SocketAddr::new(ip, config.port))
        .ok_or_else(|| Error::CaptureStart("TCP capture requires a target address".into()))
}

async fn connect(peer: SocketAddr) -> std::io::Result<TcpStream> {
    match timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(peer)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("no connection within {:?}", TCP_CONNECT_TIMEOUT),
        )),
    }
}

/// Address the UDP socket binds to
///
/// A single multicast group is bound directly on Unix so unicast datagrams
/// to the same port are not delivered. Several groups need the wildcard
/// address, which also accepts unicast traffic to the port.
fn udp_bind_ip(config: &CaptureConfig) -> IpAddr {
    match config.multicast_groups.as_slice() {
        [] => config.bind_address,
        [group] if cfg!(unix) => IpAddr::V4(*group),
        _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    }
}

/// Bind the UDP socket with address reuse and join the multicast groups
fn bind_udp(config: &CaptureConfig) -> Result<UdpSocket> {
    let bind = SocketAddr::new(udp_bind_ip(config), config.port);

    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| start_error("create UDP socket", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| start_error("set SO_REUSEADDR", e))?;
    #[cfg(unix)]
    {
        socket
            .set_reuse_port(true)
            .map_err(|e| start_error("set SO_REUSEPORT", e))?;
    }
    socket
        .set_recv_buffer_size(4 * MAX_DATAGRAM)
        .map_err(|e| start_error("set receive buffer", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| start_error("set non-blocking", e))?;
    socket
        .bind(&bind.into())
        .map_err(|e| start_error(format!("bind {}", bind), e))?;

    let interface = match config.bind_address {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };
    for group in &config.multicast_groups {
        socket
            .join_multicast_v4(group, &interface)
            .map_err(|e| {
                start_error(format!("join multicast group {} on {}", group, interface), e)
            })?;
        debug!("Joined multicast group {} on {}", group, interface);
    }

    UdpSocket::from_std(socket.into()).map_err(|e| start_error("register UDP socket", e))
}

async fn read_datagrams(
    socket: UdpSocket,
    mut sink: Sink,
    token: CancellationToken,
) -> CaptureStats {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut codec = DltCodec::new();
    let mut errors = 0u32;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, peer)) => {
                    errors = 0;
                    trace!("{} byte datagram from {}", n, peer);
                    let mut datagram = BytesMut::from(&buf[..n]);
                    for frame in codec.decode_all(&mut datagram) {
                        sink.publish(frame);
                    }
                }
                Err(e) => {
                    errors += 1;
                    if errors >= MAX_CONSECUTIVE_ERRORS {
                        warn!("UDP receive failed {} times, stopping reader: {}", errors, e);
                        break;
                    }
                    debug!("UDP receive failed: {}", e);
                    sleep(Duration::from_millis(50 * u64::from(errors))).await;
                }
            }
        }
    }
    sink.stats
}

/// Read a TCP stream, reconnecting with backoff until cancelled
async fn read_tcp(
    peer: SocketAddr,
    stream: TcpStream,
    mut sink: Sink,
    token: CancellationToken,
) -> CaptureStats {
    let mut stream = Some(stream);
    let mut attempt = 0u32;

    loop {
        let current = match stream.take() {
            Some(s) => s,
            None => {
                attempt += 1;
                let backoff = (Duration::from_millis(100) * 2u32.saturating_pow(attempt.min(5)))
                    .min(RECONNECT_BACKOFF_MAX);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(backoff) => {}
                }
                match connect(peer).await {
                    Ok(s) => {
                        info!("Reconnected to DLT daemon at {}", peer);
                        sink.stats.reconnects += 1;
                        attempt = 0;
                        s
                    }
                    Err(e) => {
                        debug!("Reconnect to {} failed: {}", peer, e);
                        continue;
                    }
                }
            }
        };

        let frames = FramedRead::new(current, DltCodec::new());
        sink = read_stream_into(frames, sink, &token).await;
        if token.is_cancelled() {
            break;
        }
        warn!("DLT connection to {} lost", peer);
    }
    sink.stats
}

/// Read an external receiver's output until it closes or the capture stops
async fn read_receiver<R>(
    frames: FramedRead<R, DltCodec>,
    sink: Sink,
    token: CancellationToken,
) -> CaptureStats
where
    R: AsyncRead + Unpin,
{
    let sink = read_stream_into(frames, sink, &token).await;
    if !token.is_cancelled() {
        warn!("DLT receiver output closed before the capture was stopped");
    }
    sink.stats
}

async fn read_stream_into<R>(
    mut frames: FramedRead<R, DltCodec>,
    mut sink: Sink,
    token: &CancellationToken,
) -> Sink
where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = frames.next() => match next {
                Some(Ok(frame)) => sink.publish(frame),
                Some(Err(e)) => {
                    warn!("DLT stream read failed: {}", e);
                    break;
                }
                None => {
                    debug!("DLT stream closed");
                    break;
                }
            }
        }
    }
    if frames.decoder().skipped_bytes() > 0 {
        debug!("Skipped {} undecodable bytes", frames.decoder().skipped_bytes());
    }
    sink
}

/// SIGTERM, grace period, then kill
async fn terminate(mut child: Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
                match timeout(TERMINATE_GRACE, child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!("Receiver {} exited: {}", pid, status);
                        return;
                    }
                    Ok(Err(e)) => debug!("Waiting for receiver {} failed: {}", pid, e),
                    Err(_) => debug!("Receiver {} ignored SIGTERM", pid),
                }
            }
        }
    }

    if let Err(e) = child.kill().await {
        debug!("Killing receiver failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FrameBuilder;
    use crate::codec::encode;
    use crate::frame::LogLevel;
    use crate::query::Query;

    fn loopback() -> CaptureConfig {
        CaptureConfig::udp("127.0.0.1".parse().unwrap(), 0)
    }

    async fn send(to: SocketAddr, apid: &str, counter: u8) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bytes = encode(
            &FrameBuilder::log(apid, "TEST", LogLevel::Info)
                .counter(counter)
                .text("payload"),
        )
        .unwrap();
        socket.send_to(&bytes, to).await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_capture_records_and_stops() {
        let record = Arc::new(DltRecord::new());
        let capture = DltCapture::start(&loopback(), record.clone()).await.unwrap();
        let addr = capture.local_addr().unwrap();
        assert!(capture.is_running());

        for i in 0..3 {
            send(addr, "APP1", i).await;
        }
        let query = Query::new().exact("apid", "APP1").unwrap();
        record.wait_for(&query, 3, Duration::from_secs(5)).await.unwrap();

        let stats = capture.stop().await.unwrap();
        assert_eq!(stats.recorded, 3);
    }

    #[tokio::test]
    async fn test_filter_applies_before_recording() {
        let record = Arc::new(DltRecord::new());
        let config = loopback().with_filter("KEEP");
        let capture = DltCapture::start(&config, record.clone()).await.unwrap();
        let addr = capture.local_addr().unwrap();

        send(addr, "DROP", 0).await;
        send(addr, "KEEP", 1).await;
        let query = Query::new().exact("apid", "KEEP").unwrap();
        record.wait_for(&query, 1, Duration::from_secs(5)).await.unwrap();

        let stats = capture.stop().await.unwrap();
        assert_eq!(record.apids(), vec!["KEEP"]);
        assert_eq!(stats.filtered, 1);
    }

    #[tokio::test]
    async fn test_tcp_connect_failure_is_capture_start_error() {
        // Reserve a port, then close it so nothing listens there
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let record = Arc::new(DltRecord::new());
        let err = DltCapture::start(&CaptureConfig::tcp(addr), record)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::CaptureStart(_)));
    }

    #[tokio::test]
    async fn test_missing_receiver_binary_is_capture_start_error() {
        let config = CaptureConfig::udp("127.0.0.1".parse().unwrap(), 3490).with_receiver(
            Receiver::Process {
                binary: "/nonexistent/dlt-receive".into(),
                args: Some(Vec::new()),
            },
        );
        let err = DltCapture::start(&config, Arc::new(DltRecord::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::CaptureStart(_)));
        assert!(err.is_environment());
    }

    fn shell_receiver(script: &str) -> CaptureConfig {
        CaptureConfig::udp("127.0.0.1".parse().unwrap(), 3490).with_receiver(Receiver::Process {
            binary: "sh".into(),
            args: Some(vec!["-c".to_string(), script.to_string()]),
        })
    }

    #[tokio::test]
    async fn test_receiver_failing_at_startup_is_capture_start_error() {
        let config = shell_receiver("echo 'bind failed' >&2; exit 3");
        let err = DltCapture::start(&config, Arc::new(DltRecord::new()))
            .await
            .err()
            .unwrap();

        match err {
            Error::CaptureStart(msg) => {
                assert!(msg.contains("bind failed"), "{}", msg);
                assert!(msg.contains('3'), "{}", msg);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_receiver_exit_after_start_is_reported_on_stop() {
        let config = shell_receiver("sleep 1; echo 'connection reset' >&2; exit 2");
        let capture = DltCapture::start(&config, Arc::new(DltRecord::new()))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while capture.is_running() && tokio::time::Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }
        sleep(Duration::from_millis(200)).await;

        let err = capture.stop().await.err().unwrap();
        assert!(err.is_environment());
        assert!(err.to_string().contains("connection reset"), "{}", err);
    }

    #[tokio::test]
    async fn test_running_receiver_stops_cleanly() {
        let config = shell_receiver("exec sleep 30");
        let capture = DltCapture::start(&config, Arc::new(DltRecord::new()))
            .await
            .unwrap();
        assert!(capture.is_running());

        let stats = capture.stop().await.unwrap();
        assert_eq!(stats.recorded, 0);
    }

    #[test]
    fn test_udp_bind_address() {
        let group = Ipv4Addr::new(239, 255, 42, 99);
        let unicast = loopback();
        assert_eq!(udp_bind_ip(&unicast), unicast.bind_address);

        let wildcard = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let one = CaptureConfig::udp(wildcard, 3490).with_multicast(group);
        let expected = if cfg!(unix) { IpAddr::V4(group) } else { wildcard };
        assert_eq!(udp_bind_ip(&one), expected);

        let two = one.with_multicast(Ipv4Addr::new(239, 255, 42, 100));
        assert_eq!(udp_bind_ip(&two), wildcard);
    }
}
