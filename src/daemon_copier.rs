// The external daemon copy loop (spec §4.6).
//
// A single-process, single-threaded loop reading the *transfer file* under
// an advisory lock, copying one buffer per iteration, and writing progress
// back under the same lock. Grounded on `examples/original_source/src/axl_daemon.c`:
// the PID-file startup guard, the per-iteration snapshot read, the
// current-file cursor, and the bandwidth/duty-cycle throttle.

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::error::{AtlError, Result};
use crate::fileio;
use crate::kv::{Tree, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DaemonState {
    Running,
    Stopped,
    Exiting,
}

impl DaemonState {
    fn as_str(self) -> &'static str {
        match self {
            DaemonState::Running => "RUNNING",
            DaemonState::Stopped => "STOPPED",
            DaemonState::Exiting => "EXITING",
        }
    }
}

/// A `(handle_id, source_path)` pair currently being streamed, with cached
/// descriptors so repeated iterations against the same file skip reopening.
struct Cursor {
    handle_id: u64,
    source_key: String,
    src: File,
    dst: File,
}

pub struct DaemonCopier {
    transfer_file_path: PathBuf,
    pid_file_path: PathBuf,
    buf_size: usize,
    poll_interval: Duration,
    /// Debug hook (spec §6 `pause_after_bytes`, grounded on
    /// `axl_debug_pause_after` / `AXL_DEBUG_PAUSE_AFTER`): stop the loop once
    /// this many bytes have been copied since startup, without publishing
    /// `STOPPED`/`FLAG=DONE`, so a test can simulate a daemon crash mid-copy
    /// and exercise `resume`. Zero disables the hook.
    pause_after_bytes: u64,
    bytes_since_start: u64,
    cursor: Option<Cursor>,
    run_secs: f64,
    slept_secs: f64,
    last_write: Instant,
}

impl DaemonCopier {
    pub fn new(transfer_file_path: PathBuf, pid_file_path: PathBuf) -> Self {
        Self::with_config(transfer_file_path, pid_file_path, &crate::config::GlobalConfig::default())
    }

    /// Builds a copier honoring the `daemon_poll_secs` and `pause_after_bytes`
    /// options of `config` (spec §6), as read by the `atl-daemon` binary at
    /// startup.
    pub fn with_config(
        transfer_file_path: PathBuf,
        pid_file_path: PathBuf,
        config: &crate::config::GlobalConfig,
    ) -> Self {
        Self {
            transfer_file_path,
            pid_file_path,
            buf_size: config.file_buf_size.max(1) as usize,
            poll_interval: Duration::from_secs_f64(config.daemon_poll_secs.max(0.0)),
            pause_after_bytes: config.pause_after_bytes,
            bytes_since_start: 0,
            cursor: None,
            run_secs: 0.0,
            slept_secs: 0.0,
            last_write: Instant::now(),
        }
    }

    /// Writes the PID file, refusing to start if one already exists (spec
    /// §4.6 "refuse to start if one exists").
    fn write_pid_file(&self) -> Result<()> {
        if self.pid_file_path.exists() {
            return Err(AtlError::BackendFailure(format!(
                "pid file {:?} already exists; another daemon instance may be running",
                self.pid_file_path
            )));
        }
        let mut f = std::fs::File::create(&self.pid_file_path)
            .map_err(|e| AtlError::io(self.pid_file_path.display().to_string(), e))?;
        write!(f, "{}", std::process::id())
            .map_err(|e| AtlError::io(self.pid_file_path.display().to_string(), e))?;
        Ok(())
    }

    fn remove_pid_file(&self) {
        let _ = std::fs::remove_file(&self.pid_file_path);
    }

    /// Runs the main loop until `COMMAND == EXIT`.
    pub async fn run(&mut self) -> Result<()> {
        self.write_pid_file()?;
        info!("daemon copier started, transfer file {:?}", self.transfer_file_path);

        let result = self.run_loop().await;
        self.remove_pid_file();
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        loop {
            let path = self.transfer_file_path.clone();
            let snapshot = tokio::task::spawn_blocking(move || Tree::load(&path))
                .await
                .map_err(|e| AtlError::BackendFailure(e.to_string()))??;

            let command = snapshot.get_value("COMMAND").and_then(Value::as_str).unwrap_or("STOP");
            let daemon_state = match command {
                "EXIT" => DaemonState::Exiting,
                "RUN" => DaemonState::Running,
                _ => DaemonState::Stopped,
            };
            self.publish_state(daemon_state)?;

            if daemon_state == DaemonState::Exiting {
                info!("daemon copier exiting");
                return Ok(());
            }

            if daemon_state == DaemonState::Stopped {
                self.run_secs = 0.0;
                self.slept_secs = 0.0;
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            match self.step(&snapshot).await {
                Ok(Some(sleep_for)) => {
                    if self.should_pause() {
                        info!(
                            "pausing after {} bytes (AXL_DEBUG_PAUSE_AFTER-style debug hook)",
                            self.bytes_since_start
                        );
                        return Ok(());
                    }
                    if sleep_for > Duration::ZERO {
                        self.slept_secs += sleep_for.as_secs_f64();
                        tokio::time::sleep(sleep_for).await;
                    }
                }
                Ok(None) => {
                    // No selectable file: all done or all errored.
                    self.publish_state(DaemonState::Stopped)?;
                    self.set_flag_done()?;
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => {
                    error!("daemon copier step failed: {}", e);
                    self.publish_state(DaemonState::Stopped)?;
                    self.set_flag_done()?;
                }
            }
        }
    }

    fn publish_state(&self, state: DaemonState) -> Result<()> {
        let path = self.transfer_file_path.clone();
        Tree::persist_locked(&path, |tree| {
            tree.set("STATE", Value::Str(state.as_str().to_string()));
            Ok(())
        })
    }

    fn set_flag_done(&self) -> Result<()> {
        let path = self.transfer_file_path.clone();
        Tree::persist_locked(&path, |tree| {
            tree.set("FLAG", Value::Str("DONE".to_string()));
            Ok(())
        })
    }

    /// Selects a file to make progress on, copies one buffer, and publishes
    /// the new `WRITTEN` under the lock. Returns the sleep duration to apply
    /// before the next iteration, or `None` if no file could be selected.
    async fn step(&mut self, snapshot: &Tree) -> Result<Option<Duration>> {
        let selection = self.select_file(snapshot)?;
        let Some((handle_id, source_key, destination, written, size)) = selection else {
            return Ok(None);
        };

        if self
            .cursor
            .as_ref()
            .map(|c| c.handle_id != handle_id || c.source_key != source_key)
            .unwrap_or(true)
        {
            let src = fileio::open_read(Path::new(&source_key))?;
            let dst = fileio::open_write_create(Path::new(&destination))?;
            self.cursor = Some(Cursor {
                handle_id,
                source_key: source_key.clone(),
                src,
                dst,
            });
        }

        let cursor = self.cursor.as_mut().expect("just populated");
        let copy_result = fileio::copy_chunk(&mut cursor.src, &mut cursor.dst, written, self.buf_size)
            .and_then(|n| cursor.dst.sync_all().map(|_| n).map_err(|e| AtlError::io(destination.clone(), e)));

        let nread = match copy_result {
            Ok(n) => n,
            Err(e) => {
                self.record_error(handle_id, &source_key, &e.to_string())?;
                self.cursor = None;
                return Ok(Some(Duration::ZERO));
            }
        };

        let new_written = written + nread;
        self.bytes_since_start += nread;
        self.publish_written(handle_id, &source_key, new_written)?;

        if new_written >= size {
            self.cursor = None;
        }

        let now = Instant::now();
        let elapsed_since_last_write = now.duration_since(self.last_write).as_secs_f64();
        self.last_write = now;
        self.run_secs += elapsed_since_last_write;

        let (bw, percent) = self.throttle_limits(snapshot);
        let sleep_for = self.compute_sleep(nread, bw, percent);
        Ok(Some(sleep_for))
    }

    fn should_pause(&self) -> bool {
        self.pause_after_bytes > 0 && self.bytes_since_start >= self.pause_after_bytes
    }

    fn throttle_limits(&self, snapshot: &Tree) -> (f64, f64) {
        let bw = snapshot.get_value("BW").and_then(Value::as_f64).unwrap_or(0.0);
        let percent = snapshot.get_value("PERCENT").and_then(Value::as_f64).unwrap_or(0.0);
        (bw, percent)
    }

    /// Throttling algorithm (spec §4.6): couples a bandwidth limit and a
    /// duty-cycle limit, clamped to `[0, poll_interval]`.
    fn compute_sleep(&mut self, nread: u64, bw: f64, percent: f64) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_write).as_secs_f64();

        let bw_sleep = if bw > 0.0 {
            (nread as f64 / bw) - elapsed
        } else {
            0.0
        };
        let duty_sleep = if percent > 0.0 {
            (self.run_secs / (percent / 100.0)) - (self.run_secs + self.slept_secs)
        } else {
            0.0
        };

        let target = bw_sleep.max(duty_sleep).max(0.0);
        let capped = target.min(self.poll_interval.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Picks the file to progress: the current cursor if it is still valid,
    /// else the first `(handle_id, source)` in ascending handle id /
    /// insertion order with `WRITTEN < SIZE` and no `ERROR`.
    fn select_file(
        &self,
        snapshot: &Tree,
    ) -> Result<Option<(u64, String, String, u64, u64)>> {
        let Some(id_tree) = snapshot.get_tree("ID") else {
            return Ok(None);
        };

        if let Some(cursor) = &self.cursor {
            if let Some(record) = id_tree
                .get_tree(&cursor.handle_id.to_string())
                .and_then(|t| t.get_tree("FILES"))
                .and_then(|t| t.get_tree(&cursor.source_key))
            {
                if record.get_value("ERROR").is_none() {
                    let size = record.get_value("SIZE").and_then(Value::as_u64).unwrap_or(0);
                    let written = record.get_value("WRITTEN").and_then(Value::as_u64).unwrap_or(0);
                    if written < size {
                        let dest = record
                            .get_value("DESTINATION")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        return Ok(Some((cursor.handle_id, cursor.source_key.clone(), dest, written, size)));
                    }
                }
            }
        }

        let mut handle_ids: Vec<u64> = id_tree.iter().filter_map(|(k, _)| k.parse().ok()).collect();
        handle_ids.sort_unstable();

        for handle_id in handle_ids {
            let Some(files) = id_tree.get_tree(&handle_id.to_string()).and_then(|t| t.get_tree("FILES")) else {
                continue;
            };
            for (source_key, node) in files.iter() {
                let Some(record) = node.as_tree() else { continue };
                if record.get_value("ERROR").is_some() {
                    continue;
                }
                let size = record.get_value("SIZE").and_then(Value::as_u64).unwrap_or(0);
                let written = record.get_value("WRITTEN").and_then(Value::as_u64).unwrap_or(0);
                if written < size {
                    let dest = record
                        .get_value("DESTINATION")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    return Ok(Some((handle_id, source_key.clone(), dest, written, size)));
                }
            }
        }
        Ok(None)
    }

    fn publish_written(&self, handle_id: u64, source_key: &str, written: u64) -> Result<()> {
        let path = self.transfer_file_path.clone();
        let source_key = source_key.to_string();
        Tree::persist_locked(&path, move |tree| {
            if let Some(record) = tree
                .get_or_insert_tree_int("ID", handle_id)
                .get_or_insert_tree("FILES")
                .get_mut(&source_key)
                .and_then(|n| n.as_tree_mut())
            {
                record.set("WRITTEN", Value::ByteCount(written));
            }
            Ok(())
        })
    }

    fn record_error(&self, handle_id: u64, source_key: &str, message: &str) -> Result<()> {
        let path = self.transfer_file_path.clone();
        let source_key = source_key.to_string();
        let message = message.to_string();
        warn!("daemon copier: {} on {}/{}", message, handle_id, source_key);
        Tree::persist_locked(&path, move |tree| {
            let record = tree
                .get_or_insert_tree_int("ID", handle_id)
                .get_or_insert_tree("FILES")
                .get_or_insert_tree(&source_key);
            record.set("ERROR", Value::Str(message.clone()));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bandwidth_throttle_computes_expected_sleep() {
        let mut copier = DaemonCopier::new(PathBuf::from("/tmp/x"), PathBuf::from("/tmp/x.pid"));
        copier.last_write = Instant::now() - Duration::from_millis(10);
        let sleep = copier.compute_sleep(1_000_000, 10_000_000.0, 0.0);
        assert!(sleep.as_secs_f64() > 0.0);
        assert!(sleep.as_secs_f64() <= copier.poll_interval.as_secs_f64());
    }

    #[test]
    fn pause_after_bytes_hook_triggers_once_threshold_reached() {
        let mut config = crate::config::GlobalConfig::default();
        config.pause_after_bytes = 100;
        let mut copier = DaemonCopier::with_config(
            PathBuf::from("/tmp/x"),
            PathBuf::from("/tmp/x.pid"),
            &config,
        );
        assert!(!copier.should_pause());
        copier.bytes_since_start = 99;
        assert!(!copier.should_pause());
        copier.bytes_since_start = 100;
        assert!(copier.should_pause());
    }

    #[test]
    fn pid_file_guard_refuses_double_start() {
        let dir = tempdir().unwrap();
        let transfer = dir.path().join("transfer.kv");
        let pid = dir.path().join("transfer.kv.pid");
        std::fs::write(&pid, "1").unwrap();

        let copier = DaemonCopier::new(transfer, pid);
        assert!(copier.write_pid_file().is_err());
    }

    #[test]
    fn select_file_picks_first_incomplete_in_ascending_handle_order() {
        let dir = tempdir().unwrap();
        let transfer = dir.path().join("transfer.kv");
        let mut tree = Tree::new();
        let files = tree.get_or_insert_tree_int("ID", 5).get_or_insert_tree("FILES");
        let record = files.get_or_insert_tree("/src/a");
        record.set("SIZE", Value::ByteCount(100));
        record.set("WRITTEN", Value::ByteCount(100));
        record.set("DESTINATION", Value::Str("/dst/a".to_string()));

        let files2 = tree.get_or_insert_tree_int("ID", 2).get_or_insert_tree("FILES");
        let record2 = files2.get_or_insert_tree("/src/b");
        record2.set("SIZE", Value::ByteCount(100));
        record2.set("WRITTEN", Value::ByteCount(10));
        record2.set("DESTINATION", Value::Str("/dst/b".to_string()));
        tree.save(&transfer).unwrap();

        let copier = DaemonCopier::new(transfer, dir.path().join("pid"));
        let selection = copier.select_file(&tree).unwrap().unwrap();
        assert_eq!(selection.0, 2);
        assert_eq!(selection.1, "/src/b");
    }
}
