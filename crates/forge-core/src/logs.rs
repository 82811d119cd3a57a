//! Job log segments and their followers.
//!
//! A segment is an append-only list of lines bound to one job attempt. It is
//! closed when that attempt finishes; readers drain what is left and stop.

use std::{
    collections::HashMap,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use forge_model::{Attempt, JobId, LogResourceId};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::CoreError;

#[derive(Debug, Clone, Copy, Default)]
struct SegmentState {
    len: usize,
    closed: bool,
}

struct Segment {
    job_id: JobId,
    attempt: Attempt,
    lines: RwLock<Vec<String>>,
    state: watch::Sender<SegmentState>,
}

impl Segment {
    fn line(&self, index: usize) -> Option<String> {
        let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
        lines.get(index).cloned()
    }
}

#[derive(Default)]
struct LogBookInner {
    segments: HashMap<LogResourceId, Arc<Segment>>,
    by_job: HashMap<JobId, Vec<LogResourceId>>,
}

/// All log segments known to this process.
#[derive(Default)]
pub struct LogBook {
    inner: RwLock<LogBookInner>,
    readers: Arc<AtomicUsize>,
}

impl LogBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Job attempt that owns `resource`, if the resource exists.
    pub fn owner(&self, resource: &str) -> Option<(JobId, Attempt)> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .segments
            .get(resource)
            .map(|s| (s.job_id.clone(), s.attempt))
    }

    /// Number of lines in `resource` (0 if unknown).
    pub fn len(&self, resource: &str) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .segments
            .get(resource)
            .map(|s| s.state.borrow().len)
            .unwrap_or(0)
    }

    /// Append a line, creating the segment for `(job_id, attempt)` on first use.
    ///
    /// Returns the new line count.
    pub fn append(
        &self,
        job_id: &JobId,
        attempt: Attempt,
        resource: &str,
        line: String,
    ) -> Result<usize, CoreError> {
        let segment = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            match inner.segments.get(resource) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let segment = Arc::new(Segment {
                        job_id: job_id.clone(),
                        attempt,
                        lines: RwLock::new(Vec::new()),
                        state: watch::Sender::new(SegmentState::default()),
                    });
                    inner
                        .segments
                        .insert(resource.to_string(), Arc::clone(&segment));
                    inner
                        .by_job
                        .entry(job_id.clone())
                        .or_default()
                        .push(resource.to_string());
                    segment
                }
            }
        };

        if &segment.job_id != job_id || segment.attempt != attempt {
            return Err(CoreError::InvalidRequest(format!(
                "log resource {resource} belongs to {}#{}",
                segment.job_id, segment.attempt
            )));
        }
        if segment.state.borrow().closed {
            return Err(CoreError::InvalidRequest(format!(
                "log resource {resource} is closed"
            )));
        }

        let len = {
            let mut lines = segment.lines.write().unwrap_or_else(PoisonError::into_inner);
            lines.push(line);
            lines.len()
        };
        // Lines are visible before the new length is announced.
        segment.state.send_modify(|s| s.len = len);
        Ok(len)
    }

    /// Close every segment of `(job_id, attempt)`; followers finish once drained.
    pub fn close_attempt(&self, job_id: &JobId, attempt: Attempt) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let Some(resources) = inner.by_job.get(job_id) else {
            return 0;
        };

        let mut closed = 0;
        for resource in resources {
            if let Some(segment) = inner.segments.get(resource)
                && segment.attempt == attempt
            {
                segment.state.send_if_modified(|s| {
                    let changed = !s.closed;
                    s.closed = true;
                    changed
                });
                closed += 1;
            }
        }
        trace!(job = %job_id, attempt, closed, "log segments closed");
        closed
    }

    /// Snapshot of every line in `resource`.
    pub fn read_all(&self, resource: &str) -> Result<Vec<String>, CoreError> {
        let segment = self.segment(resource)?;
        let lines = segment.lines.read().unwrap_or_else(PoisonError::into_inner);
        Ok(lines.clone())
    }

    /// Follow `resource` from its first line until it closes or `ctx` is cancelled.
    pub fn open(&self, resource: &str, ctx: CancellationToken) -> Result<LogReader, CoreError> {
        let segment = self.segment(resource)?;
        let rx = segment.state.subscribe();
        self.readers.fetch_add(1, Ordering::AcqRel);

        Ok(LogReader {
            segment,
            rx,
            pos: 0,
            ctx,
            _lease: ReaderLease(Arc::clone(&self.readers)),
        })
    }

    /// Readers currently open.
    pub fn active_readers(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    fn segment(&self, resource: &str) -> Result<Arc<Segment>, CoreError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .segments
            .get(resource)
            .cloned()
            .ok_or_else(|| CoreError::LogNotFound(resource.to_string()))
    }
}

struct ReaderLease(Arc<AtomicUsize>);

impl Drop for ReaderLease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Follower over one log segment.
pub struct LogReader {
    segment: Arc<Segment>,
    rx: watch::Receiver<SegmentState>,
    pos: usize,
    ctx: CancellationToken,
    _lease: ReaderLease,
}

impl LogReader {
    /// Next line, waiting for appends.
    ///
    /// Returns `None` once the segment is closed and drained, or as soon as
    /// the reader's context is cancelled (even if lines are pending).
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if self.ctx.is_cancelled() {
                return None;
            }

            let state = *self.rx.borrow_and_update();
            if self.pos < state.len {
                let line = self.segment.line(self.pos)?;
                self.pos += 1;
                return Some(line);
            }
            if state.closed {
                return None;
            }

            tokio::select! {
                _ = self.ctx.cancelled() => return None,
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Lines delivered so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn job_id(&self) -> &JobId {
        &self.segment.job_id
    }

    pub fn attempt(&self) -> Attempt {
        self.segment.attempt
    }
}
