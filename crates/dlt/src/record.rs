//! Append-only frame record shared between a capture and its readers

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::frame::DltFrame;
use crate::query::Query;
use itf_common::{Error, Result};

#[derive(Default)]
struct Frames {
    frames: Vec<Arc<DltFrame>>,
    /// Positions in `frames` per application ID
    by_apid: HashMap<String, Vec<usize>>,
}

/// Ordered frames from one capture
///
/// One producer appends; any number of readers query concurrently. Queries
/// take a snapshot of `Arc`s under a short read lock and filter outside it.
#[derive(Default)]
pub struct DltRecord {
    inner: RwLock<Frames>,
    appended: Notify,
    sealed: AtomicBool,
}

impl DltRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame; returns false once the record is sealed
    pub fn append(&self, frame: DltFrame) -> bool {
        if self.is_sealed() {
            warn!("Dropping frame appended to a sealed record");
            return false;
        }
        let frame = Arc::new(frame);
        {
            let mut inner = self.inner.write();
            let position = inner.frames.len();
            inner
                .by_apid
                .entry(frame.apid().to_string())
                .or_default()
                .push(position);
            inner.frames.push(frame);
        }
        self.appended.notify_waiters();
        true
    }

    /// Frames matching `query` in capture order; all frames without a query
    pub fn find(&self, query: Option<&Query>) -> Vec<Arc<DltFrame>> {
        let query = query.filter(|q| !q.is_empty());
        let snapshot: Vec<Arc<DltFrame>> = {
            let inner = self.inner.read();
            match query.and_then(Query::exact_apid) {
                Some(apid) => inner
                    .by_apid
                    .get(apid)
                    .map(|positions| positions.iter().map(|&i| inner.frames[i].clone()).collect())
                    .unwrap_or_default(),
                None => inner.frames.clone(),
            }
        };

        match query {
            Some(query) => snapshot.into_iter().filter(|f| query.matches(f)).collect(),
            None => snapshot,
        }
    }

    /// Number of frames matching `query`
    pub fn count(&self, query: Option<&Query>) -> usize {
        self.find(query).len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct application IDs seen so far, sorted
    pub fn apids(&self) -> Vec<String> {
        let mut apids: Vec<String> = self.inner.read().by_apid.keys().cloned().collect();
        apids.sort();
        apids
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Stop accepting frames and wake every waiter
    pub(crate) fn seal(&self) {
        if !self.sealed.swap(true, Ordering::AcqRel) {
            debug!("Sealed record with {} frames", self.len());
        }
        self.appended.notify_waiters();
    }

    /// Wait until at least `count` frames match `query`
    ///
    /// Fails with [`Error::Timeout`] when `timeout` passes first, or with
    /// [`Error::NotFound`] when the record is sealed short of `count`.
    pub async fn wait_for(
        &self,
        query: &Query,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<Arc<DltFrame>>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            // Register before checking so an append in between is not missed
            notified.as_mut().enable();

            let found = self.find(Some(query));
            if found.len() >= count {
                return Ok(found);
            }
            if self.is_sealed() {
                return Err(Error::NotFound(format!(
                    "{} of {} frames matching {} before the record was sealed",
                    found.len(),
                    count,
                    query
                )));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(
                    "Timed out waiting for {} frames matching {} ({} found)",
                    count,
                    query,
                    found.len()
                );
                return Err(Error::Timeout(timeout));
            }
        }
    }
}

impl std::fmt::Debug for DltRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DltRecord")
            .field("frames", &self.len())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}
