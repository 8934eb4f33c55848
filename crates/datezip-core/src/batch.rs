//! Batch session: fans one selection of files out over a worker pool and
//! collects the results into a [`BucketTree`].
//!
//! Every selection gets a fresh batch id. Workers carry the id of the batch
//! that spawned them; the session only accepts a result whose id matches the
//! current batch, so work from a superseded batch can never leak into the
//! tree of a newer one. Completion is an explicit counter compared against the
//! batch size, advanced for failures as well as successes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::bucket::{BucketTree, TranscodeResult};
use crate::cancel::CancellationToken;
use crate::date::{CaptureDate, DateExtractor};
use crate::error::{BatchError, TranscodeError};
use crate::input::InputFile;
use crate::progress::ThrottledProgress;
use crate::transcode::{TranscodePolicy, Transcoder};

/// The per-file work: how to transcode and where dates come from.
pub struct Pipeline {
    pub transcoder: Arc<dyn Transcoder>,
    pub extractor: Arc<dyn DateExtractor>,
    pub policy: TranscodePolicy,
}

impl Pipeline {
    fn process(&self, file: &InputFile) -> Result<(TranscodeResult, Option<CaptureDate>), TranscodeError> {
        let data = self.transcoder.transcode(file.raw.clone(), &self.policy)?;
        let date = self.extractor.extract_capture_date(&file.raw);
        Ok((
            TranscodeResult {
                output_name: file.output_name(),
                data,
                date,
            },
            date,
        ))
    }
}

/// A file that could not be converted; excluded from the tree.
#[derive(Debug)]
pub struct FileFailure {
    pub id: u64,
    pub name: String,
    pub error: TranscodeError,
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub id: u64,
    /// Number of files selected, failures included
    pub total: usize,
    pub tree: BucketTree,
    pub failures: Vec<FileFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchStatus {
    pub id: u64,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: bool,
}

struct BatchState {
    id: u64,
    total: usize,
    completed: usize,
    failed: usize,
    tree: BucketTree,
    failures: Vec<FileFailure>,
    token: CancellationToken,
    cancelled: bool,
    collected: bool,
}

impl BatchState {
    fn empty(id: u64, total: usize) -> Self {
        Self {
            id,
            total,
            completed: 0,
            failed: 0,
            tree: BucketTree::new(),
            failures: Vec::new(),
            token: CancellationToken::new(),
            cancelled: false,
            collected: false,
        }
    }

    fn is_complete(&self) -> bool {
        self.completed >= self.total
    }
}

struct Shared {
    state: Mutex<BatchState>,
    changed: Condvar,
    stale_discards: AtomicU64,
    progress: Option<ThrottledProgress>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(
        &self,
        batch_id: u64,
        file: &InputFile,
        outcome: Result<(TranscodeResult, Option<CaptureDate>), TranscodeError>,
    ) {
        let mut state = self.lock();
        if state.id != batch_id || state.cancelled {
            self.stale_discards.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(batch = batch_id, current = state.id, file = file.id, "Discarding result of a stale batch");
            return;
        }

        match outcome {
            Ok((result, date)) => {
                if date.is_none() {
                    tracing::debug!(file = file.id, name = %file.name, "No capture date; using no_date bucket");
                }
                state.tree.insert(result, date);
            }
            Err(error) => {
                tracing::warn!(file = file.id, name = %file.name, %error, "Failed to convert file");
                state.failed += 1;
                state.failures.push(FileFailure {
                    id: file.id,
                    name: file.name.clone(),
                    error,
                });
            }
        }
        state.completed += 1;

        let (completed, total) = (state.completed, state.total);
        if state.is_complete() {
            tracing::info!(
                batch = batch_id,
                total,
                failed = state.failed,
                "Batch complete"
            );
            self.changed.notify_all();
        }
        drop(state);

        if let Some(progress) = &self.progress {
            progress.report("convert", completed as u64, total as u64, &file.name);
        }
    }
}

/// Owns the worker pool and the one live batch.
pub struct Session {
    pipeline: Arc<Pipeline>,
    pool: rayon::ThreadPool,
    shared: Arc<Shared>,
    next_file_id: AtomicU64,
}

impl Session {
    /// `threads == 0` lets rayon pick one thread per CPU.
    pub fn new(pipeline: Pipeline, threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        Self::build(pipeline, threads, None)
    }

    pub fn with_progress(
        pipeline: Pipeline,
        threads: usize,
        progress: ThrottledProgress,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        Self::build(pipeline, threads, Some(progress))
    }

    fn build(
        pipeline: Pipeline,
        threads: usize,
        progress: Option<ThrottledProgress>,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("datezip-worker-{}", i))
            .build()?;
        let mut idle = BatchState::empty(0, 0);
        idle.collected = true;
        Ok(Self {
            pipeline: Arc::new(pipeline),
            pool,
            shared: Arc::new(Shared {
                state: Mutex::new(idle),
                changed: Condvar::new(),
                stale_discards: AtomicU64::new(0),
                progress,
            }),
            next_file_id: AtomicU64::new(0),
        })
    }

    /// Wrap raw selections as [`InputFile`]s with session-unique ids.
    pub fn input_files<I>(&self, selection: I) -> Vec<InputFile>
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
    {
        selection
            .into_iter()
            .map(|(name, raw)| {
                let id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
                InputFile::new(id, name, raw)
            })
            .collect()
    }

    /// Start a new batch, superseding whatever batch is in flight.
    pub fn select<I>(&self, selection: I) -> BatchHandle
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
    {
        let files = self.input_files(selection);
        self.select_files(files)
    }

    pub fn select_files(&self, files: Vec<InputFile>) -> BatchHandle {
        let (batch_id, token) = {
            let mut state = self.shared.lock();
            state.token.cancel();
            let id = state.id + 1;
            let superseded = std::mem::replace(&mut *state, BatchState::empty(id, files.len()));
            if !superseded.is_complete() {
                tracing::info!(batch = superseded.id, by = id, "Superseding unfinished batch");
            }
            (id, state.token.clone())
        };
        self.shared.changed.notify_all();
        tracing::info!(batch = batch_id, total = files.len(), "Batch selected");

        for file in files {
            if !file.looks_like_image() {
                tracing::warn!(file = file.id, name = %file.name, "File does not look like an image; trying anyway");
            }
            let shared = Arc::clone(&self.shared);
            let pipeline = Arc::clone(&self.pipeline);
            let token = token.clone();
            self.pool.spawn(move || {
                if token.check().is_err() {
                    shared.stale_discards.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                let outcome = pipeline.process(&file);
                shared.record(batch_id, &file, outcome);
            });
        }

        BatchHandle {
            id: batch_id,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Cancel the current batch. Its handle's waits return `Cancelled`.
    pub fn cancel(&self) {
        let mut state = self.shared.lock();
        if !state.is_complete() {
            tracing::info!(batch = state.id, "Cancelling batch");
        }
        state.token.cancel();
        state.cancelled = true;
        drop(state);
        self.shared.changed.notify_all();
    }

    pub fn status(&self) -> BatchStatus {
        let state = self.shared.lock();
        BatchStatus {
            id: state.id,
            total: state.total,
            completed: state.completed,
            failed: state.failed,
            in_progress: !state.is_complete() && !state.cancelled,
        }
    }

    /// Files of superseded or cancelled batches whose work was thrown away.
    pub fn stale_discards(&self) -> u64 {
        self.shared.stale_discards.load(Ordering::SeqCst)
    }
}

/// Join handle for one batch; waiting on it collects the outcome once.
pub struct BatchHandle {
    id: u64,
    shared: Arc<Shared>,
}

impl BatchHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until every file of this batch has resolved.
    pub fn wait(&self) -> Result<BatchOutcome, BatchError> {
        self.wait_until(None)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<BatchOutcome, BatchError> {
        self.wait_until(Some(Instant::now() + timeout))
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Result<BatchOutcome, BatchError> {
        let mut state = self.shared.lock();
        loop {
            if state.id != self.id {
                return Err(BatchError::Superseded(self.id));
            }
            if state.cancelled {
                return Err(BatchError::Cancelled(self.id));
            }
            if state.is_complete() {
                if state.collected {
                    return Err(BatchError::Collected(self.id));
                }
                state.collected = true;
                return Ok(BatchOutcome {
                    id: self.id,
                    total: state.total,
                    tree: std::mem::take(&mut state.tree),
                    failures: std::mem::take(&mut state.failures),
                });
            }

            state = match deadline {
                None => self
                    .shared
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(BatchError::TimedOut(self.id));
                    }
                    self.shared
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::NO_DATE_KEY;
    use std::sync::mpsc;

    /// Bytes are `"<y>-<m>-<d>:<name>"`, `"none:<name>"` or `"corrupt:<name>"`.
    struct FakeExtractor;

    impl DateExtractor for FakeExtractor {
        fn extract_capture_date(&self, raw: &[u8]) -> Option<CaptureDate> {
            let text = std::str::from_utf8(raw).ok()?;
            let (date, _) = text.split_once(':')?;
            let mut parts = date.split('-').map(|p| p.parse::<u32>().ok());
            let (y, m, d) = (parts.next()??, parts.next()??, parts.next()??);
            CaptureDate::new(y as i32, m, d)
        }
    }

    /// Echoes bytes back; `corrupt:` fails, `gate:` blocks until released.
    struct FakeTranscoder {
        started: Mutex<mpsc::Sender<()>>,
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl Transcoder for FakeTranscoder {
        fn transcode(&self, raw: Arc<[u8]>, _policy: &TranscodePolicy) -> Result<Vec<u8>, TranscodeError> {
            if raw.starts_with(b"corrupt:") {
                return Err(TranscodeError::Decode(image::load_from_memory(&raw).unwrap_err()));
            }
            if raw.starts_with(b"gate:") {
                self.started.lock().unwrap().send(()).unwrap();
                self.gate.lock().unwrap().recv().unwrap();
            }
            Ok(raw.to_vec())
        }
    }

    struct Harness {
        session: Session,
        started: mpsc::Receiver<()>,
        release: mpsc::Sender<()>,
    }

    fn harness() -> Harness {
        let (started_tx, started) = mpsc::channel();
        let (release, gate_rx) = mpsc::channel();
        let pipeline = Pipeline {
            transcoder: Arc::new(FakeTranscoder {
                started: Mutex::new(started_tx),
                gate: Mutex::new(gate_rx),
            }),
            extractor: Arc::new(FakeExtractor),
            policy: TranscodePolicy::default(),
        };
        Harness {
            session: Session::new(pipeline, 4).unwrap(),
            started,
            release,
        }
    }

    fn sel(items: &[(&str, &str)]) -> Vec<(String, Vec<u8>)> {
        items
            .iter()
            .map(|(name, raw)| (name.to_string(), raw.as_bytes().to_vec()))
            .collect()
    }

    fn paths(tree: &BucketTree) -> Vec<String> {
        let mut out: Vec<String> = tree
            .walk()
            .map(|(p, r)| format!("{}/{}", p.join("/"), r.output_name))
            .collect();
        out.sort();
        out
    }

    const WAIT: Duration = Duration::from_secs(10);

    #[test]
    fn test_three_file_scenario() {
        let h = harness();
        let batch = h.session.select(sel(&[
            ("a.jpg", "2023-5-10:a"),
            ("b.jpg", "2023-5-10:b"),
            ("c.jpg", "none:c"),
        ]));
        let outcome = batch.wait_timeout(WAIT).unwrap();

        assert_eq!(outcome.total, 3);
        assert!(outcome.failures.is_empty());
        assert_eq!(
            paths(&outcome.tree),
            vec!["2023/5/10/a.webp", "2023/5/10/b.webp", format!("{}/c.webp", NO_DATE_KEY).as_str()]
        );
    }

    #[test]
    fn test_decode_failure_is_isolated() {
        let h = harness();
        let batch = h.session.select(sel(&[
            ("good.png", "2020-1-1:good"),
            ("bad.png", "corrupt:bad"),
            ("other.png", "none:other"),
        ]));
        let outcome = batch.wait_timeout(WAIT).unwrap();

        assert_eq!(outcome.tree.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].name, "bad.png");
        assert!(matches!(outcome.failures[0].error, TranscodeError::Decode(_)));

        let status = h.session.status();
        assert_eq!((status.completed, status.total, status.failed), (3, 3, 1));
        assert!(!status.in_progress);
    }

    #[test]
    fn test_status_keeps_failure_count_after_collection() {
        let h = harness();
        let batch = h.session.select(sel(&[("bad.png", "corrupt:bad"), ("ok.png", "none:ok")]));
        let before = loop {
            let status = h.session.status();
            if !status.in_progress {
                break status;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        batch.wait_timeout(WAIT).unwrap();
        assert_eq!(before.failed, 1);
        assert_eq!(h.session.status(), before);
    }

    #[test]
    fn test_completion_does_not_follow_index_order() {
        let h = harness();
        // The last-indexed file finishes first; the gated first file finishes last
        let batch = h.session.select(sel(&[("slow.jpg", "gate:slow"), ("fast.jpg", "2022-3-4:fast")]));
        h.started.recv_timeout(WAIT).unwrap();

        assert_eq!(
            batch.wait_timeout(Duration::from_millis(100)).unwrap_err(),
            BatchError::TimedOut(batch.id())
        );
        assert!(h.session.status().in_progress);

        h.release.send(()).unwrap();
        let outcome = batch.wait_timeout(WAIT).unwrap();
        assert_eq!(outcome.tree.len(), 2);
    }

    #[test]
    fn test_superseded_batch_does_not_leak_into_new_tree() {
        let h = harness();
        let first = h.session.select(sel(&[
            ("a.jpg", "2023-5-10:a"),
            ("b.jpg", "2023-5-10:b"),
            ("c.jpg", "gate:c"),
        ]));
        h.started.recv_timeout(WAIT).unwrap();

        let second = h.session.select(sel(&[("d.jpg", "2024-1-2:d"), ("e.jpg", "none:e")]));
        assert_eq!(first.wait().unwrap_err(), BatchError::Superseded(first.id()));

        let outcome = second.wait_timeout(WAIT).unwrap();
        assert_eq!(
            paths(&outcome.tree),
            vec!["2024/1/2/d.webp", format!("{}/e.webp", NO_DATE_KEY).as_str()]
        );

        // Let the first batch's last file resolve; it must be thrown away
        h.release.send(()).unwrap();
        let deadline = Instant::now() + WAIT;
        while h.session.stale_discards() == 0 {
            assert!(Instant::now() < deadline, "stale result never arrived");
            std::thread::sleep(Duration::from_millis(10));
        }
        let status = h.session.status();
        assert_eq!((status.id, status.completed, status.total), (second.id(), 2, 2));
    }

    #[test]
    fn test_empty_selection_completes_immediately() {
        let h = harness();
        let batch = h.session.select(Vec::new());
        let outcome = batch.wait().unwrap();
        assert!(outcome.tree.is_empty());
        assert_eq!(outcome.total, 0);
    }

    #[test]
    fn test_outcome_is_collected_once() {
        let h = harness();
        let batch = h.session.select(sel(&[("a.jpg", "none:a")]));
        batch.wait_timeout(WAIT).unwrap();
        assert_eq!(batch.wait().unwrap_err(), BatchError::Collected(batch.id()));
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let h = harness();
        let batch = h.session.select(sel(&[("slow.jpg", "gate:slow")]));
        h.started.recv_timeout(WAIT).unwrap();

        h.session.cancel();
        assert_eq!(batch.wait().unwrap_err(), BatchError::Cancelled(batch.id()));
        assert!(!h.session.status().in_progress);
        h.release.send(()).unwrap();
    }

    #[test]
    fn test_file_ids_are_monotonic_across_batches() {
        let h = harness();
        let first = h.session.input_files(sel(&[("a.jpg", ""), ("b.jpg", "")]));
        let second = h.session.input_files(sel(&[("c.jpg", "")]));
        let ids: Vec<u64> = first.iter().chain(second.iter()).map(|f| f.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }
}
