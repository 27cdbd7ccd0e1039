//! Scoped DLT capture

use chrono::{DateTime, Utc};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::capture::{CaptureStats, DltCapture};
use crate::config::CaptureConfig;
use crate::frame::DltFrame;
use crate::query::Query;
use crate::record::DltRecord;
use itf_common::Result;

/// A capture session bound to one record
///
/// Frames arriving while the window is open are appended to its record.
/// Closing stops the capture and seals the record, which stays readable.
pub struct DltWindow {
    capture: Option<DltCapture>,
    record: Arc<DltRecord>,
    opened_at: DateTime<Utc>,
}

impl DltWindow {
    pub async fn open(config: &CaptureConfig) -> Result<Self> {
        let record = Arc::new(DltRecord::new());
        let capture = DltCapture::start(config, record.clone()).await?;
        Ok(Self {
            capture: Some(capture),
            record,
            opened_at: Utc::now(),
        })
    }

    /// Open a window, run `body` and close the window whatever the outcome
    ///
    /// The record is passed to `body`; keep a clone to read it afterwards.
    pub async fn scoped<T, F, Fut>(config: &CaptureConfig, body: F) -> Result<T>
    where
        F: FnOnce(Arc<DltRecord>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let window = Self::open(config).await?;
        let outcome = body(window.record()).await;
        let closed = window.close().await;
        let value = outcome?;
        closed?;
        Ok(value)
    }

    pub fn record(&self) -> Arc<DltRecord> {
        self.record.clone()
    }

    pub fn find(&self, query: Option<&Query>) -> Vec<Arc<DltFrame>> {
        self.record.find(query)
    }

    pub async fn wait_for(
        &self,
        query: &Query,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<Arc<DltFrame>>> {
        self.record.wait_for(query, count, timeout).await
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Address the capture socket is bound to, for UDP and TCP captures
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.capture.as_ref().and_then(DltCapture::local_addr)
    }

    /// Stop the capture, seal and return the record
    pub async fn close(mut self) -> Result<Arc<DltRecord>> {
        self.stop().await?;
        Ok(self.record.clone())
    }

    async fn stop(&mut self) -> Result<CaptureStats> {
        let stats = match self.capture.take() {
            Some(capture) => capture.stop().await,
            None => Ok(CaptureStats::default()),
        };
        self.record.seal();
        debug!(
            "DLT window open since {} closed with {} frames",
            self.opened_at,
            self.record.len()
        );
        stats
    }
}

impl Drop for DltWindow {
    fn drop(&mut self) {
        if self.capture.take().is_some() {
            warn!("DLT window dropped without close; capture aborted");
            self.record.seal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FrameBuilder;
    use crate::codec::encode;
    use crate::frame::LogLevel;
    use itf_common::Error;
    use tokio::net::UdpSocket;

    fn loopback() -> CaptureConfig {
        CaptureConfig::udp("127.0.0.1".parse().unwrap(), 0)
    }

    async fn send(to: SocketAddr, apid: &str) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bytes = encode(&FrameBuilder::log(apid, "CTX", LogLevel::Info).text("hi")).unwrap();
        socket.send_to(&bytes, to).await.unwrap();
    }

    #[tokio::test]
    async fn test_record_survives_close() {
        let window = DltWindow::open(&loopback()).await.unwrap();
        send(window.local_addr().unwrap(), "APPA").await;
        window
            .wait_for(&Query::new(), 1, Duration::from_secs(5))
            .await
            .unwrap();

        let record = window.close().await.unwrap();
        assert!(record.is_sealed());
        assert_eq!(record.len(), 1);
        assert_eq!(record.find(None)[0].apid(), "APPA");
    }

    #[tokio::test]
    async fn test_scoped_closes_on_error() {
        let mut kept = None;
        let result: Result<()> = DltWindow::scoped(&loopback(), |record| {
            kept = Some(record);
            async { Err(Error::Internal("body failed".into())) }
        })
        .await;

        assert!(matches!(result, Err(Error::Internal(_))));
        assert!(kept.unwrap().is_sealed());
    }

    #[tokio::test]
    async fn test_drop_seals_record() {
        let window = DltWindow::open(&loopback()).await.unwrap();
        let record = window.record();
        drop(window);
        assert!(record.is_sealed());
    }
}
