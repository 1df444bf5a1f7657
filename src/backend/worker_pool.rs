// Bounded worker-pool copy (spec §4.5).
//
// Grounded on the original `axl_pthread.c`: a shared FIFO work queue behind
// one mutex, a fixed-size pool of `min(nprocs, MAX_THREADS, file_count)`
// workers that pop-copy-repeat until the queue drains. The mutex in the
// original is held only around pop/push of the linked list; this port keeps
// that contract with a `Mutex<VecDeque<PathBuf>>`. Workers are real OS
// threads (`std::thread`) rather than tokio tasks, since the work is
// synchronous blocking I/O best served by its own stack; `start`/`wait`
// bridge into async via `spawn_blocking`.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use async_trait::async_trait;

use crate::backend::{Backend, TestOutcome};
use crate::error::Result;
use crate::fileio;
use crate::model::{FileState, Handle, HandleId};
use crate::registry::SharedConfig;

const MAX_WORKERS: usize = 16;

struct FileOutcome {
    state: FileState,
    bytes_transferred: u64,
    crc32: Option<u32>,
    error: Option<String>,
}

struct PoolRun {
    workers: Vec<JoinHandle<()>>,
    cancel_flag: Arc<AtomicBool>,
    results: Arc<Mutex<HashMap<PathBuf, FileOutcome>>>,
}

impl PoolRun {
    fn all_finished(&self) -> bool {
        self.workers.iter().all(|w| w.is_finished())
    }
}

pub struct WorkerPoolBackend {
    config: SharedConfig,
    runs: Mutex<HashMap<HandleId, PoolRun>>,
}

impl WorkerPoolBackend {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Merges finished-worker results into `handle.files` and removes the
    /// run bookkeeping. Only called once every worker has exited.
    fn drain(&self, handle: &mut Handle, run: PoolRun) -> TestOutcome {
        let results = Arc::try_unwrap(run.results)
            .map(|m| m.into_inner().unwrap_or_default())
            .unwrap_or_default();

        for (path, outcome) in results {
            if let Some(entry) = handle.files.get_mut(&path) {
                entry.state = outcome.state;
                entry.bytes_transferred = outcome.bytes_transferred;
                if outcome.crc32.is_some() {
                    entry.crc32 = outcome.crc32;
                }
                entry.error_message = outcome.error;
                if let (FileState::AtDestination, Some(meta)) = (entry.state, entry.metadata.clone()) {
                    fileio::apply_metadata(&entry.destination, &meta);
                }
            }
        }

        if handle.any_file_errored() {
            TestOutcome::CompletedError
        } else if handle.all_files_at_destination() {
            TestOutcome::CompletedSuccess
        } else {
            TestOutcome::InProgress
        }
    }
}

fn worker_loop(
    queue: Arc<Mutex<VecDeque<(PathBuf, PathBuf)>>>,
    cancel_flag: Arc<AtomicBool>,
    results: Arc<Mutex<HashMap<PathBuf, FileOutcome>>>,
    buf_size: usize,
    verify_crc: bool,
) {
    loop {
        let work = {
            let mut q = queue.lock().expect("worker queue poisoned");
            q.pop_front()
        };
        let Some((source, destination)) = work else {
            return;
        };

        if cancel_flag.load(Ordering::Acquire) {
            results.lock().unwrap().insert(
                source,
                FileOutcome {
                    state: FileState::Error,
                    bytes_transferred: 0,
                    crc32: None,
                    error: Some("cancelled".to_string()),
                },
            );
            continue;
        }

        let outcome = copy_one(&source, &destination, buf_size, verify_crc, &cancel_flag);
        results.lock().unwrap().insert(source, outcome);
    }
}

/// Distinguishes a chunk loop that ran to EOF from one cut short by the
/// cancellation flag, so the caller never confuses a cancelled partial copy
/// with a completed one.
enum CopyOutcome {
    Finished(u64),
    Cancelled(u64),
}

fn copy_one(
    source: &PathBuf,
    destination: &PathBuf,
    buf_size: usize,
    verify_crc: bool,
    cancel_flag: &AtomicBool,
) -> FileOutcome {
    let result = (|| -> Result<CopyOutcome> {
        let mut src = fileio::open_read(source)?;
        let mut dst = fileio::open_write_create(destination)?;
        let mut offset = 0u64;
        loop {
            if cancel_flag.load(Ordering::Acquire) {
                return Ok(CopyOutcome::Cancelled(offset));
            }
            let n = fileio::copy_chunk(&mut src, &mut dst, offset, buf_size)?;
            if n == 0 {
                break;
            }
            offset += n;
        }
        Ok(CopyOutcome::Finished(offset))
    })();

    match result {
        Ok(CopyOutcome::Finished(bytes)) => FileOutcome {
            crc32: if verify_crc {
                fileio::crc32_file(source, buf_size).ok()
            } else {
                None
            },
            state: FileState::AtDestination,
            bytes_transferred: bytes,
            error: None,
        },
        // Cancelled mid-file: spec §4.5 requires this left `Error` (or
        // `AtSource` on resume-capable pools); `resume` already resets any
        // non-`AtDestination` entry to `AtSource` before restarting, so
        // marking it `Error` here is never a one-way door.
        Ok(CopyOutcome::Cancelled(bytes)) => FileOutcome {
            state: FileState::Error,
            bytes_transferred: bytes,
            crc32: None,
            error: Some("cancelled".to_string()),
        },
        Err(e) => FileOutcome {
            state: FileState::Error,
            bytes_transferred: 0,
            crc32: None,
            error: Some(e.to_string()),
        },
    }
}

#[async_trait]
impl Backend for WorkerPoolBackend {
    async fn start(&self, handle: &mut Handle) -> Result<()> {
        let pending: VecDeque<(PathBuf, PathBuf)> = handle
            .files
            .values()
            .filter(|e| e.state != FileState::AtDestination)
            .map(|e| (e.source.clone(), e.destination.clone()))
            .collect();

        for entry in handle.files.values_mut() {
            if entry.state == FileState::AtSource {
                entry.state = FileState::InProgress;
            }
        }

        let file_count = pending.len().max(1);
        let n_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_WORKERS)
            .min(file_count);

        let queue = Arc::new(Mutex::new(pending));
        let results = Arc::new(Mutex::new(HashMap::new()));
        let cancel_flag = Arc::new(AtomicBool::new(false));
        // Read the live, shared config at dispatch time rather than once at
        // construction, so a `config()` update made between handles takes
        // effect on the next `start` (spec §6).
        let (buf_size, verify_crc) = {
            let cfg = self.config.lock().unwrap();
            (cfg.file_buf_size as usize, cfg.verify_crc)
        };

        let mut workers = Vec::with_capacity(n_workers);
        for _ in 0..n_workers {
            let queue = queue.clone();
            let cancel_flag = cancel_flag.clone();
            let results = results.clone();
            workers.push(std::thread::spawn(move || {
                worker_loop(queue, cancel_flag, results, buf_size, verify_crc)
            }));
        }

        self.runs.lock().unwrap().insert(
            handle.id,
            PoolRun {
                workers,
                cancel_flag,
                results,
            },
        );
        Ok(())
    }

    async fn test(&self, handle: &mut Handle) -> Result<TestOutcome> {
        let finished = {
            let runs = self.runs.lock().unwrap();
            runs.get(&handle.id).map(PoolRun::all_finished).unwrap_or(true)
        };
        if !finished {
            return Ok(TestOutcome::InProgress);
        }
        let run = self.runs.lock().unwrap().remove(&handle.id);
        match run {
            Some(run) => Ok(self.drain(handle, run)),
            None => Ok(if handle.all_files_at_destination() {
                TestOutcome::CompletedSuccess
            } else if handle.any_file_errored() {
                TestOutcome::CompletedError
            } else {
                TestOutcome::InProgress
            }),
        }
    }

    async fn wait(&self, handle: &mut Handle) -> Result<TestOutcome> {
        let run = self.runs.lock().unwrap().remove(&handle.id);
        let Some(run) = run else {
            return self.test(handle).await;
        };
        let PoolRun {
            workers,
            cancel_flag,
            results,
        } = run;
        tokio::task::spawn_blocking(move || {
            for w in workers {
                let _ = w.join();
            }
        })
        .await
        .map_err(|e| crate::error::AtlError::BackendFailure(e.to_string()))?;

        Ok(self.drain(
            handle,
            PoolRun {
                workers: Vec::new(),
                cancel_flag,
                results,
            },
        ))
    }

    async fn cancel(&self, handle: &mut Handle) -> Result<()> {
        if let Some(run) = self.runs.lock().unwrap().get(&handle.id) {
            run.cancel_flag.store(true, Ordering::Release);
        }
        self.wait(handle).await?;
        Ok(())
    }

    async fn resume(&self, handle: &mut Handle) -> Result<()> {
        for entry in handle.files.values_mut() {
            if entry.state != FileState::AtDestination {
                entry.state = FileState::AtSource;
            }
        }
        self.start(handle).await
    }

    async fn free(&self, handle: &mut Handle) -> Result<()> {
        self.runs.lock().unwrap().remove(&handle.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;
    use crate::model::{FileEntry, TransferKind};
    use tempfile::tempdir;

    fn shared(config: GlobalConfig) -> SharedConfig {
        Arc::new(Mutex::new(config))
    }

    #[tokio::test]
    async fn transfers_every_file_exactly_once() {
        let dir = tempdir().unwrap();
        let mut handle = Handle::new(1, TransferKind::WorkerPool, "t".into());
        for i in 0..20 {
            let src = dir.path().join(format!("src-{i}"));
            let dst = dir.path().join(format!("dst-{i}"));
            std::fs::write(&src, format!("payload-{i}").repeat(64)).unwrap();
            handle.files.insert(src.clone(), FileEntry::new(src, dst));
        }

        let backend = WorkerPoolBackend::new(shared(GlobalConfig::default()));
        backend.start(&mut handle).await.unwrap();
        let outcome = backend.wait(&mut handle).await.unwrap();

        assert_eq!(outcome, TestOutcome::CompletedSuccess);
        assert!(handle.all_files_at_destination());
        for entry in handle.files.values() {
            assert_eq!(
                std::fs::read(&entry.destination).unwrap(),
                std::fs::read(&entry.source).unwrap()
            );
        }
    }

    #[tokio::test]
    async fn cancel_stops_further_progress() {
        let dir = tempdir().unwrap();
        let mut handle = Handle::new(2, TransferKind::WorkerPool, "t".into());
        for i in 0..4 {
            let src = dir.path().join(format!("src-{i}"));
            let dst = dir.path().join(format!("dst-{i}"));
            std::fs::write(&src, vec![0u8; 1024]).unwrap();
            handle.files.insert(src.clone(), FileEntry::new(src, dst));
        }

        let backend = WorkerPoolBackend::new(shared(GlobalConfig::default()));
        backend.start(&mut handle).await.unwrap();
        backend.cancel(&mut handle).await.unwrap();

        assert!(!handle
            .files
            .values()
            .any(|e| e.state == FileState::InProgress));
        // Invariant 4 plus spec §4.5: a file cut short by cancellation is
        // never reported `AtDestination`, even though the chunk loop's EOF
        // and cancellation exits both return a byte count.
        assert!(!handle
            .files
            .values()
            .any(|e| e.state == FileState::AtDestination));
    }

    #[test]
    fn copy_one_cancelled_mid_file_is_error_not_at_destination() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::write(&src, vec![0u8; 4096]).unwrap();

        // Pre-set so the very first iteration of the chunk loop observes it,
        // deterministically exercising the cancelled-partial path regardless
        // of scheduling.
        let cancel_flag = AtomicBool::new(true);
        let outcome = copy_one(&src, &dst, 1024, false, &cancel_flag);

        assert_eq!(outcome.state, FileState::Error);
        assert_eq!(outcome.bytes_transferred, 0);
        assert!(outcome.error.is_some());
    }
}
