//! Per-file tailing state machine.

use std::fmt;
use std::path::{Path, PathBuf};

use futures_util::stream::StreamExt;
use tokio::fs::metadata;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{Change, ChangeKind, ChangeSource};
use crate::hub::HubHandle;
use crate::reader::{read_delta, trailing_partial, LineBatch};

/// A file being tailed, along with how much of it has been consumed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WatchedFile {
    path: PathBuf,
    last_known_size: u64,
}

impl WatchedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        WatchedFile {
            path: path.into(),
            last_known_size: 0,
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn last_known_size(&self) -> u64 {
        self.last_known_size
    }

    fn advance(&mut self, size: u64) {
        debug_assert!(size >= self.last_known_size);
        self.last_known_size = size;
    }

    fn reset(&mut self) {
        self.last_known_size = 0;
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MonitorState {
    /// Not yet registered with its change source.
    #[default]
    Idle,
    /// Waiting for the next change notification.
    Watching,
    /// Reading the delta since the last known size.
    Reading,
    /// A shrink or re-creation was seen; the cursor is back at 0.
    Reset,
}

/// Tails a single file, turning change notifications into [`LineBatch`]es.
///
/// Each monitor owns its cursor. Lines appended after
/// [`start`](TailMonitor::start) are emitted exactly once, in file order. A
/// line written across several notifications is held back until its newline
/// arrives.
pub struct TailMonitor<S> {
    file: WatchedFile,
    carry: Vec<u8>,
    source: S,
    state: MonitorState,
}

impl<S> fmt::Debug for TailMonitor<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TailMonitor")
            .field("file", &self.file)
            .field("carry", &self.carry.len())
            .field("state", &self.state)
            .finish()
    }
}

impl<S: ChangeSource> TailMonitor<S> {
    pub fn new(path: impl Into<PathBuf>, source: S) -> Self {
        TailMonitor {
            file: WatchedFile::new(path),
            carry: Vec::new(),
            source,
            state: MonitorState::default(),
        }
    }

    pub fn file(&self) -> &WatchedFile {
        &self.file
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Registers the file with the change source and positions the cursor at
    /// the current end of the file.
    ///
    /// Failure (missing file, permission denied, a directory) is fatal to this
    /// monitor only.
    pub async fn start(&mut self) -> Result<()> {
        let meta = metadata(&self.file.path).await?;
        if !meta.is_file() {
            return Err(Error::NotAFile(self.file.path.clone()));
        }

        let path = self.source.watch(&self.file.path)?;
        let size = meta.len();

        // Whatever follows the last newline is a line still being written.
        self.carry = trailing_partial(&path, size).await?;
        self.file.path = path;
        self.file.reset();
        self.file.advance(size);
        self.state = MonitorState::Watching;

        info!(path = %self.file.path.display(), size, "monitor started");

        Ok(())
    }

    /// Applies a single change notification.
    ///
    /// Returns the lines appended since the last call, if any. On error the
    /// cursor is left alone, so the next change retries the same range.
    pub async fn handle_change(&mut self, change: &Change) -> Result<Option<LineBatch>> {
        if change.kind == ChangeKind::Removed {
            debug!(path = %self.file.path.display(), "file removed, waiting for it to return");
            return Ok(None);
        }

        let size = metadata(&self.file.path).await?.len();

        if change.kind == ChangeKind::Created || size < self.file.last_known_size {
            info!(
                path = %self.file.path.display(),
                previous = self.file.last_known_size,
                size,
                "rotation detected, re-reading from start"
            );
            self.state = MonitorState::Reset;
            self.file.reset();
            self.carry.clear();
        }

        if size <= self.file.last_known_size {
            self.state = MonitorState::Watching;
            return Ok(None);
        }

        self.state = MonitorState::Reading;
        let from = self.file.last_known_size;

        let lines = match read_delta(&self.file.path, from, size, &mut self.carry).await {
            Ok(lines) => lines,
            Err(e) => {
                self.state = MonitorState::Watching;
                return Err(e.into());
            }
        };

        self.file.advance(size);
        self.state = MonitorState::Watching;

        if lines.is_empty() {
            Ok(None)
        } else {
            Ok(Some(LineBatch::new(self.file.path.clone(), lines)))
        }
    }

    /// Waits for the next batch of lines.
    ///
    /// Returns `None` once the change source ends. Errors are per-event; the
    /// monitor stays usable after one.
    pub async fn next_batch(&mut self) -> Option<Result<LineBatch>> {
        loop {
            let change = match self.source.next().await? {
                Ok(change) => change,
                Err(e) => return Some(Err(e)),
            };

            if change.path != self.file.path {
                continue;
            }

            match self.handle_change(&change).await {
                Ok(Some(batch)) => return Some(Ok(batch)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Forwards every batch to `hub` until the change source ends or the hub
    /// shuts down.
    pub async fn run(mut self, hub: HubHandle) {
        while let Some(res) = self.next_batch().await {
            match res {
                Ok(batch) => {
                    if hub.publish_batch(&batch).await.is_err() {
                        debug!(path = %self.file.path.display(), "hub closed");
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        path = %self.file.path.display(),
                        "tail failed, retrying on next change: {}", e
                    );
                }
            }
        }

        self.source.close();
        info!(path = %self.file.path.display(), "monitor stopped");
    }
}

impl<S: ChangeSource + 'static> TailMonitor<S> {
    /// Runs the monitor on its own task.
    pub fn spawn(self, hub: HubHandle) -> JoinHandle<()> {
        tokio::spawn(self.run(hub))
    }
}
