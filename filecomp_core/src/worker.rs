use crate::comparison::CompareOrchestrator;
use crossbeam::channel::{bounded, Receiver, Sender};
use filecomp_common::{CompareOptions, CompareOutcome, FileCompError, ProgressEvent, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 64;

/// Event sent from the worker thread to its handle
#[derive(Debug)]
pub enum WorkerEvent {
    Progress(ProgressEvent),
    /// Always the last event; never dropped
    Finished(CompareOutcome),
}

#[derive(Debug, Clone)]
pub struct CompareRequest {
    pub left: PathBuf,
    pub right: PathBuf,
    pub options: CompareOptions,
}

/// Runs one comparison on a dedicated background thread
pub struct CompareWorker;

impl CompareWorker {
    pub fn spawn(orchestrator: Arc<CompareOrchestrator>, request: CompareRequest) -> Result<CompareHandle> {
        Self::spawn_with_cancel(orchestrator, request, Arc::new(AtomicBool::new(false)))
    }

    /// Spawn with an externally owned cancel flag
    pub fn spawn_with_cancel(
        orchestrator: Arc<CompareOrchestrator>,
        request: CompareRequest,
        cancel: Arc<AtomicBool>,
    ) -> Result<CompareHandle> {
        let (tx, rx) = bounded(EVENT_CAPACITY);
        let flag = Arc::clone(&cancel);

        let thread = std::thread::Builder::new()
            .name("filecomp-worker".to_string())
            .spawn(move || run(&orchestrator, &request, &flag, &tx))
            .map_err(|e| FileCompError::io("<worker thread>", e))?;

        Ok(CompareHandle {
            cancel,
            events: rx,
            thread: Some(thread),
        })
    }
}

fn run(orchestrator: &CompareOrchestrator, request: &CompareRequest, cancel: &AtomicBool, tx: &Sender<WorkerEvent>) {
    let mut sink = |event: ProgressEvent| {
        // a lagging consumer only misses intermediate progress
        let _ = tx.try_send(WorkerEvent::Progress(event));
    };
    let result = orchestrator.compare_files(&request.left, &request.right, &request.options, &mut sink, Some(cancel));
    let outcome = CompareOutcome::from(result);
    debug!("Worker finished: {}", outcome.label());

    if tx.send(WorkerEvent::Finished(outcome)).is_err() {
        debug!("Worker handle dropped before the result was delivered");
    }
}

/// Owner side of a running comparison
pub struct CompareHandle {
    cancel: Arc<AtomicBool>,
    events: Receiver<WorkerEvent>,
    thread: Option<JoinHandle<()>>,
}

impl CompareHandle {
    /// Request cancellation; the worker still delivers `Finished(Cancelled)`
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> &Receiver<WorkerEvent> {
        &self.events
    }

    /// Block until the terminal outcome arrives
    pub fn wait(self) -> CompareOutcome {
        self.wait_with(|_| {})
    }

    /// Block until the terminal outcome arrives, passing progress events to
    /// `on_progress`
    pub fn wait_with<F: FnMut(ProgressEvent)>(mut self, mut on_progress: F) -> CompareOutcome {
        let outcome = loop {
            match self.events.recv() {
                Ok(WorkerEvent::Progress(event)) => on_progress(event),
                Ok(WorkerEvent::Finished(outcome)) => break outcome,
                Err(_) => {
                    warn!("Worker exited without a result");
                    break CompareOutcome::Failed(FileCompError::InternalInvariant(
                        "worker exited without a result".to_string(),
                    ));
                }
            }
        };
        self.join();
        outcome
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
    }
}

impl Drop for CompareHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.cancel();
            // drain so a blocked terminal send can complete
            while self.events.recv().is_ok() {}
            self.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filecomp_common::{CompareResult, ErrorKind};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file
    }

    fn request(left: &NamedTempFile, right: &NamedTempFile) -> CompareRequest {
        CompareRequest {
            left: left.path().to_path_buf(),
            right: right.path().to_path_buf(),
            options: CompareOptions::default(),
        }
    }

    #[test]
    fn test_worker_delivers_result() {
        let (left, right) = (file(b"a\nb\n"), file(b"a\nc\n"));
        let handle = CompareWorker::spawn(Arc::new(CompareOrchestrator::default()), request(&left, &right)).unwrap();

        let mut progress = Vec::new();
        let outcome = handle.wait_with(|event| progress.push(event));
        assert!(matches!(outcome, CompareOutcome::Completed(CompareResult::TextDiff(_))));
        assert_eq!(progress.last().map(|e| e.percent), Some(100));
    }

    #[test]
    fn test_worker_cancelled() {
        let (left, right) = (file(b"a\n"), file(b"b\n"));
        let cancel = Arc::new(AtomicBool::new(true));
        let handle =
            CompareWorker::spawn_with_cancel(Arc::new(CompareOrchestrator::default()), request(&left, &right), cancel)
                .unwrap();
        assert!(handle.is_cancelled());
        assert!(matches!(handle.wait(), CompareOutcome::Cancelled));
    }

    #[test]
    fn test_worker_reports_io_failure() {
        let left = file(b"a\n");
        let dir = tempfile::tempdir().unwrap();
        let req = CompareRequest {
            left: left.path().to_path_buf(),
            right: dir.path().join("missing"),
            options: CompareOptions::default(),
        };
        let outcome = CompareWorker::spawn(Arc::new(CompareOrchestrator::default()), req).unwrap().wait();
        match outcome {
            CompareOutcome::Failed(e) => assert_eq!(e.kind(), ErrorKind::Io),
            other => panic!("unexpected outcome {}", other.label()),
        }
    }

    #[test]
    fn test_dropping_handle_stops_worker() {
        let (left, right) = (file(b"x\n"), file(b"y\n"));
        let handle = CompareWorker::spawn(Arc::new(CompareOrchestrator::default()), request(&left, &right)).unwrap();
        drop(handle);
    }
}
