//! Running the capacity test: the block loop, its accounting and finalization.

use crate::config::{BlockBudget, RunConfig};
use crate::error::{EngineError, EngineResult, WriteFailure};
use crate::event::{CleanupOutcome, ReportEvent, RunStatus, RunSummary};
use crate::garbage::{GarbageGenerator, STREAM_CHUNK};
use crate::scratch::{BlockStore, ScratchDir};
use crossbeam_channel::TryRecvError;
use std::{
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Instant,
};
use tracing::{debug, info, warn};

/// A cooperative stop signal, checked between blocks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters owned by the block loop.
#[derive(Debug, Default)]
struct RunState {
    blocks_written: u64,
    bytes_written: u64,
}

impl RunState {
    fn record_block(&mut self, size: u64) {
        self.blocks_written += 1;
        self.bytes_written += size;
    }
}

/// A validated run with its store ready, waiting to be executed.
#[derive(Debug)]
pub struct Run<S: BlockStore> {
    store: S,
    block_size: u64,
    budget: BlockBudget,
    cleanup_on_finish: bool,
    seed: Option<u64>,
}

impl Run<ScratchDir> {
    /// Validates `config` and creates the scratch directory under its target.
    ///
    /// Nothing is created unless every check passes.
    pub fn prepare(config: &RunConfig) -> EngineResult<Self> {
        let budget = config.budget()?;
        config.validate_target()?;
        let store = ScratchDir::create_in(&config.target_path)?;
        Ok(Self::assemble(config, store, budget))
    }
}

impl<S: BlockStore> Run<S> {
    /// Like [`Run::prepare`], but writes into `store` instead of a fresh
    /// scratch directory. `config.target_path` is not consulted.
    pub fn with_store(config: &RunConfig, store: S) -> EngineResult<Self> {
        let budget = config.budget()?;
        Ok(Self::assemble(config, store, budget))
    }

    fn assemble(config: &RunConfig, store: S, budget: BlockBudget) -> Self {
        Self {
            store,
            block_size: config.block_size,
            budget,
            cleanup_on_finish: config.cleanup_on_finish,
            seed: config.seed,
        }
    }

    pub fn budget(&self) -> BlockBudget {
        self.budget
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Where the blocks will be written.
    pub fn location(&self) -> PathBuf {
        self.store.location().to_path_buf()
    }

    /// Writes blocks until the budget is used up, a write fails or `cancel`
    /// is set, then cleans up. Every outcome ends in exactly one
    /// [`ReportEvent::Finished`], which is the last event emitted.
    #[tracing::instrument(name = "capacity test", skip_all, fields(location = ?self.store.location()))]
    pub fn execute(
        mut self,
        mut on_event: impl FnMut(ReportEvent),
        cancel: &CancelToken,
    ) -> RunSummary {
        let started = Instant::now();
        let scratch_dir = self.store.location().to_path_buf();
        on_event(ReportEvent::Info(format!(
            "Temporary directory: {}",
            scratch_dir.display()
        )));

        let generator = self
            .seed
            .map_or_else(GarbageGenerator::random, GarbageGenerator::new);
        on_event(ReportEvent::Info(format!(
            "Random data seed: {}",
            generator.seed()
        )));
        info!(
            block_size = self.block_size,
            budget = ?self.budget,
            seed = generator.seed(),
            "Starting write test"
        );

        let (state, status) = self.write_blocks(&generator, &mut on_event, cancel);
        let cleanup = self.finish_store(&mut on_event);

        let summary = RunSummary {
            blocks_written: state.blocks_written,
            bytes_written: state.bytes_written,
            status,
            scratch_dir,
            cleanup,
            elapsed: started.elapsed(),
        };
        info!(
            blocks = summary.blocks_written,
            bytes = summary.bytes_written,
            status = %summary.status,
            "Write test done"
        );
        on_event(ReportEvent::Finished(summary.clone()));
        summary
    }

    fn write_blocks(
        &mut self,
        generator: &GarbageGenerator,
        on_event: &mut impl FnMut(ReportEvent),
        cancel: &CancelToken,
    ) -> (RunState, RunStatus) {
        let mut state = RunState::default();
        // Blocks may be far larger than memory; they are streamed through this.
        let mut buf = vec![0; self.block_size.min(STREAM_CHUNK as u64) as usize];
        let size = self.block_size;
        let status = loop {
            if !self.budget.allows(state.blocks_written) {
                break RunStatus::CompletedLimitReached;
            }
            if cancel.is_cancelled() {
                info!(blocks = state.blocks_written, "Cancelled");
                break RunStatus::Cancelled;
            }
            let index = state.blocks_written;
            let block_started = Instant::now();
            match self.write_block(generator, index, &mut buf) {
                Ok(()) => {
                    state.record_block(size);
                    debug!(index, bytes = state.bytes_written, "Wrote block");
                    on_event(ReportEvent::BlockWritten {
                        index,
                        size,
                        bytes_written: state.bytes_written,
                        elapsed: block_started.elapsed(),
                    });
                }
                Err(error) => {
                    warn!(index, %error, kind = ?error.kind(), "Block write failed");
                    on_event(ReportEvent::WriteFailed {
                        index,
                        cause: WriteFailure::from(&error),
                    });
                    break RunStatus::CompletedWriteFailed;
                }
            }
        };
        (state, status)
    }

    /// Creates block `index`, streams its contents through `buf` and
    /// persists it. A partial block stays in the store for cleanup.
    fn write_block(
        &mut self,
        generator: &GarbageGenerator,
        index: u64,
        buf: &mut [u8],
    ) -> io::Result<()> {
        let mut block = self.store.create_block(index)?;
        generator.write_block(index, self.block_size, buf, &mut block)?;
        self.store.finish_block(block)
    }

    fn finish_store(&mut self, on_event: &mut impl FnMut(ReportEvent)) -> CleanupOutcome {
        if !self.cleanup_on_finish {
            self.store.keep();
            on_event(ReportEvent::Info(format!(
                "Keeping test files in {}",
                self.store.location().display()
            )));
            return CleanupOutcome::Kept;
        }
        on_event(ReportEvent::Info("Cleaning up test files...".to_string()));
        match self.store.cleanup() {
            Ok(()) => {
                on_event(ReportEvent::Info("Cleanup complete.".to_string()));
                CleanupOutcome::Removed
            }
            Err(error) => {
                warn!(%error, "Cleanup failed");
                on_event(ReportEvent::Warning(format!("Cleanup failed: {error}")));
                CleanupOutcome::Failed(error.to_string())
            }
        }
    }
}

/// Validates `config`, then writes and cleans up on the calling thread.
pub fn run(
    config: &RunConfig,
    on_event: impl FnMut(ReportEvent),
    cancel: &CancelToken,
) -> EngineResult<RunSummary> {
    Ok(Run::prepare(config)?.execute(on_event, cancel))
}

/// Runs capacity tests on a dedicated worker thread, one at a time.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    busy: Arc<AtomicBool>,
}

/// Clears the engine's busy flag when the worker exits, however it exits.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Executes `run` on a new worker thread. `on_event` is called from that
    /// thread, in order. Setting `cancel` (or calling [`RunHandle::cancel`])
    /// stops the run after the block in flight.
    pub fn spawn<S, F>(
        &self,
        run: Run<S>,
        cancel: CancelToken,
        on_event: F,
    ) -> EngineResult<RunHandle>
    where
        S: BlockStore + Send + 'static,
        F: FnMut(ReportEvent) + Send + 'static,
    {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::AlreadyRunning);
        }
        let guard = BusyGuard(self.busy.clone());
        let worker_cancel = cancel.clone();
        let thread = thread::Builder::new()
            .name("capacity-check".to_string())
            .spawn(move || {
                let _guard = guard;
                run.execute(on_event, &worker_cancel)
            })
            .map_err(EngineError::WorkerSpawn)?;
        Ok(RunHandle { cancel, thread })
    }

    /// Executes `run` on a new worker thread and hands back its events as a stream.
    pub fn stream<S>(
        &self,
        run: Run<S>,
        cancel: CancelToken,
    ) -> EngineResult<(RunHandle, EventStream)>
    where
        S: BlockStore + Send + 'static,
    {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let handle = self.spawn(run, cancel, move |event| {
            // A driver that stopped listening doesn't stop the run; cleanup
            // still has to happen.
            let _ = sender.send(event);
        })?;
        Ok((handle, EventStream { receiver }))
    }
}

/// Control over a run executing on a worker.
#[derive(Debug)]
pub struct RunHandle {
    cancel: CancelToken,
    thread: thread::JoinHandle<RunSummary>,
}

impl RunHandle {
    /// Asks the run to stop after the block currently being written.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that cancels this run, for handing to signal handlers and such.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the run (including cleanup) to end.
    pub fn join(self) -> EngineResult<RunSummary> {
        self.thread.join().map_err(|_| EngineError::WorkerPanicked)
    }
}

/// The events of one run, in order. Ends after [`ReportEvent::Finished`]
/// (or if the worker dies).
#[derive(Debug)]
pub struct EventStream {
    receiver: crossbeam_channel::Receiver<ReportEvent>,
}

/// What [`EventStream::poll`] found.
#[derive(Debug, Clone, PartialEq)]
pub enum Polled {
    Event(ReportEvent),
    /// The run is still going but has nothing new to report.
    Pending,
    /// Every event has been delivered and the worker is gone.
    Ended,
}

impl EventStream {
    /// Returns the next event if one is ready, without blocking.
    pub fn poll(&self) -> Polled {
        match self.receiver.try_recv() {
            Ok(event) => Polled::Event(event),
            Err(TryRecvError::Empty) => Polled::Pending,
            Err(TryRecvError::Disconnected) => Polled::Ended,
        }
    }
}

impl Iterator for EventStream {
    type Item = ReportEvent;

    fn next(&mut self) -> Option<ReportEvent> {
        self.receiver.recv().ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::{CleanupError, FailureKind};
    use std::{io, path::Path};
    use tracing_test::traced_test;

    /// A device that accepts `capacity` blocks, then reports a full disk.
    struct FullAfter {
        capacity: u64,
        written: Vec<u64>,
        cleaned: bool,
        cleanup_fails: bool,
    }

    impl FullAfter {
        fn new(capacity: u64) -> Self {
            Self {
                capacity,
                written: Vec::new(),
                cleaned: false,
                cleanup_fails: false,
            }
        }
    }

    impl BlockStore for &mut FullAfter {
        type Block = io::Sink;

        fn location(&self) -> &Path {
            Path::new("/simulated")
        }

        fn create_block(&mut self, index: u64) -> io::Result<io::Sink> {
            if self.written.len() as u64 >= self.capacity {
                return Err(io::Error::from_raw_os_error(28));
            }
            self.written.push(index);
            Ok(io::sink())
        }

        fn finish_block(&mut self, _block: io::Sink) -> io::Result<()> {
            Ok(())
        }

        fn cleanup(&mut self) -> Result<(), CleanupError> {
            self.cleaned = true;
            if self.cleanup_fails {
                return Err(CleanupError {
                    path: PathBuf::from("/simulated/test_block_0.bin"),
                    failed: 1,
                    source: io::Error::new(io::ErrorKind::PermissionDenied, "read-only"),
                });
            }
            Ok(())
        }
    }

    fn collect<S: BlockStore>(
        run: Run<S>,
        cancel: &CancelToken,
    ) -> (Vec<ReportEvent>, RunSummary) {
        let mut events = Vec::new();
        let summary = run.execute(|event| events.push(event), cancel);
        (events, summary)
    }

    fn blocks_written(events: &[ReportEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                ReportEvent::BlockWritten { index, .. } => Some(*index),
                _ => None,
            })
            .collect()
    }

    #[traced_test]
    #[test]
    fn stops_at_limit() {
        let mut device = FullAfter::new(100);
        let config = RunConfig::new("/unused").block_size(1000).max_total_bytes(5500);
        let run = Run::with_store(&config, &mut device).unwrap();
        let (events, summary) = collect(run, &CancelToken::new());

        assert_eq!(blocks_written(&events), vec![0, 1, 2, 3, 4]);
        assert_eq!(summary.status, RunStatus::CompletedLimitReached);
        assert_eq!(summary.bytes_written, 5000);
        assert_eq!(summary.cleanup, CleanupOutcome::Removed);
        assert_eq!(events.last(), Some(&ReportEvent::Finished(summary)));
        assert!(device.cleaned);
        assert!(logs_contain("Write test done"));
    }

    #[traced_test]
    #[test]
    fn stops_at_first_failure() {
        let mut device = FullAfter::new(3);
        let config = RunConfig::new("/unused").block_size(50);
        let run = Run::with_store(&config, &mut device).unwrap();
        let (events, summary) = collect(run, &CancelToken::new());

        assert_eq!(blocks_written(&events), vec![0, 1, 2]);
        let failures: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ReportEvent::WriteFailed { index, cause } => Some((*index, cause.kind)),
                _ => None,
            })
            .collect();
        assert_eq!(failures, vec![(3, FailureKind::OutOfSpace)]);
        assert_eq!(summary.status, RunStatus::CompletedWriteFailed);
        assert_eq!(summary.blocks_written, 3);
        assert_eq!(summary.bytes_written, 150);
        // No retry of the failed block, no further attempts:
        assert_eq!(device.written, vec![0, 1, 2]);
        assert!(device.cleaned);
        assert!(logs_contain("Block write failed"));
    }

    #[test]
    fn accounting_is_exact_at_every_block() {
        let mut device = FullAfter::new(7);
        let config = RunConfig::new("/unused").block_size(333);
        let run = Run::with_store(&config, &mut device).unwrap();
        let (events, summary) = collect(run, &CancelToken::new());
        for event in &events {
            if let ReportEvent::BlockWritten {
                index,
                size,
                bytes_written,
                ..
            } = event
            {
                assert_eq!(*size, 333);
                assert_eq!(*bytes_written, (index + 1) * 333);
            }
        }
        assert_eq!(summary.bytes_written, summary.blocks_written * 333);
    }

    #[test]
    fn cancel_between_blocks() {
        let mut device = FullAfter::new(100);
        let config = RunConfig::new("/unused").block_size(10);
        let run = Run::with_store(&config, &mut device).unwrap();
        let cancel = CancelToken::new();
        let mut events = Vec::new();
        let summary = run.execute(
            |event| {
                if matches!(event, ReportEvent::BlockWritten { index: 1, .. }) {
                    cancel.cancel();
                }
                events.push(event);
            },
            &cancel,
        );

        assert_eq!(summary.status, RunStatus::Cancelled);
        assert_eq!(blocks_written(&events), vec![0, 1]);
        assert!(!events
            .iter()
            .any(|e| matches!(e, ReportEvent::WriteFailed { .. })));
        assert_eq!(device.written, vec![0, 1]);
        assert!(device.cleaned);
    }

    #[test]
    fn cancelled_before_start_writes_nothing() {
        let mut device = FullAfter::new(100);
        let config = RunConfig::new("/unused").block_size(10);
        let run = Run::with_store(&config, &mut device).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let (events, summary) = collect(run, &cancel);
        assert_eq!(summary.status, RunStatus::Cancelled);
        assert_eq!(summary.blocks_written, 0);
        assert!(blocks_written(&events).is_empty());
    }

    #[test]
    fn keep_files_skips_cleanup() {
        let mut device = FullAfter::new(1);
        let config = RunConfig::new("/unused").block_size(10).keep_files();
        let run = Run::with_store(&config, &mut device).unwrap();
        let (_, summary) = collect(run, &CancelToken::new());
        assert_eq!(summary.cleanup, CleanupOutcome::Kept);
        assert!(!device.cleaned);
    }

    #[test]
    fn first_event_names_the_scratch_location() {
        let mut device = FullAfter::new(0);
        let config = RunConfig::new("/unused").block_size(10).seed(17);
        let run = Run::with_store(&config, &mut device).unwrap();
        let (events, _) = collect(run, &CancelToken::new());
        assert_eq!(
            events[0],
            ReportEvent::Info("Temporary directory: /simulated".to_string())
        );
        assert_eq!(events[1], ReportEvent::Info("Random data seed: 17".to_string()));
    }

    #[traced_test]
    #[test]
    fn failed_cleanup_is_a_warning_not_a_status() {
        let mut device = FullAfter::new(2);
        device.cleanup_fails = true;
        let config = RunConfig::new("/unused").block_size(10).max_total_bytes(100);
        let run = Run::with_store(&config, &mut device).unwrap();
        let (events, summary) = collect(run, &CancelToken::new());

        let warnings: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ReportEvent::Warning(_)))
            .collect();
        assert_eq!(warnings.len(), 1);
        assert!(matches!(summary.cleanup, CleanupOutcome::Failed(_)));
        // The write outcome stands; cleanup doesn't rewrite it.
        assert_eq!(summary.status, RunStatus::CompletedWriteFailed);
        assert_eq!(summary.blocks_written, 2);
        assert_eq!(events.last(), Some(&ReportEvent::Finished(summary)));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(logs_contain("Cleanup failed"));
    }

    #[test]
    fn huge_blocks_need_no_huge_buffer() {
        let mut device = FullAfter::new(0);
        let config = RunConfig::new("/unused").block_size(1 << 46);
        let run = Run::with_store(&config, &mut device).unwrap();
        assert_eq!(run.block_size(), 1 << 46);
        let (_, summary) = collect(run, &CancelToken::new());
        assert_eq!(summary.status, RunStatus::CompletedWriteFailed);
    }

    #[test]
    fn rejects_bad_config_before_touching_store() {
        let mut device = FullAfter::new(10);
        let config = RunConfig::new("/unused").block_size(0);
        assert!(matches!(
            Run::with_store(&config, &mut device),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
