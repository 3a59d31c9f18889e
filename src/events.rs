//! Everything related to noticing that a watched file changed.
//!
//! [`TailMonitor`](crate::TailMonitor) only needs to know *that* a file may
//! have changed. It works out what changed by looking at the file size. The
//! capability it relies on is captured by [`ChangeSource`], so the monitor
//! can be driven by the real filesystem ([`NotifyWatcher`]) or by hand
//! ([`ChannelSource`]).

use std::collections::{HashSet, VecDeque};
use std::fmt::{self, Debug, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task;

use futures_util::ready;
use futures_util::stream::Stream as FuturesStream;
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// What happened to a watched path.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ChangeKind {
    /// The file was (re)created or moved into place.
    Created,
    /// The file contents may have changed.
    Modified,
    /// The file was removed or moved away.
    Removed,
}

/// A single change notification for a watched path.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Change {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl Change {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Change {
            path: path.into(),
            kind,
        }
    }
}

/// A source of change notifications for registered paths.
///
/// The stream half yields changes for every path registered with
/// [`watch`](ChangeSource::watch); it ends once the source is closed.
pub trait ChangeSource: FuturesStream<Item = Result<Change>> + Unpin + Send {
    /// Registers `path` and returns the normalized form that will appear in
    /// each [`Change`] for it.
    fn watch(&mut self, path: &Path) -> Result<PathBuf>;

    /// Stops all watches. The stream ends afterward.
    fn close(&mut self);
}

/// Filesystem-backed [`ChangeSource`] driven by [`notify`].
///
/// The parent directory of each file is watched rather than the file itself,
/// so a file that is removed and re-created (as with rename-style log
/// rotation) keeps being followed.
pub struct NotifyWatcher {
    inner: Option<notify::RecommendedWatcher>,
    watched_directories: HashSet<PathBuf>,
    watched_files: HashSet<PathBuf>,
    pending: VecDeque<Change>,
    event_stream: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
}

impl Debug for NotifyWatcher {
    fn fmt(&self, f: &mut Formatter) -> std::result::Result<(), fmt::Error> {
        f.debug_struct("NotifyWatcher")
            .field("watched_directories", &self.watched_directories)
            .field("watched_files", &self.watched_files)
            .field("pending", &self.pending)
            .finish()
    }
}

impl NotifyWatcher {
    /// Constructs a new `NotifyWatcher`. Fails if the platform watcher cannot
    /// be created.
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // The only way `send` can fail is if the receiver is dropped,
            // and `NotifyWatcher` controls both.
            let _ = tx.send(res);
        })?;

        Ok(NotifyWatcher {
            inner: Some(inner),
            watched_directories: HashSet::new(),
            watched_files: HashSet::new(),
            pending: VecDeque::new(),
            event_stream: rx,
        })
    }

    fn translate(&mut self, event: notify::Event) {
        let kind = match event.kind {
            EventKind::Create(CreateKind::File) | EventKind::Create(CreateKind::Any) => {
                ChangeKind::Created
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeKind::Created,
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeKind::Removed,
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                // paths are [from, to]
                for (idx, path) in event.paths.iter().enumerate() {
                    if self.watched_files.contains(path) {
                        let kind = if idx == 0 {
                            ChangeKind::Removed
                        } else {
                            ChangeKind::Created
                        };
                        self.pending.push_back(Change::new(path.clone(), kind));
                    }
                }
                return;
            }
            EventKind::Modify(ModifyKind::Metadata(_)) => return,
            EventKind::Modify(_) => ChangeKind::Modified,
            EventKind::Remove(_) => ChangeKind::Removed,
            // Access and other events don't warrant reading files
            _ => return,
        };

        for path in event.paths {
            if self.watched_files.contains(&path) {
                self.pending.push_back(Change::new(path, kind));
            }
        }
    }
}

impl ChangeSource for NotifyWatcher {
    fn watch(&mut self, path: &Path) -> Result<PathBuf> {
        let path = absolutify(path)?;

        if path.is_dir() {
            return Err(Error::NotAFile(path));
        }

        if self.watched_files.contains(&path) {
            return Ok(path);
        }

        let parent = path
            .parent()
            .ok_or_else(|| Error::NotAFile(path.clone()))?
            .to_path_buf();

        let inner = self.inner.as_mut().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "watcher has been closed",
            ))
        })?;

        if !self.watched_directories.contains(&parent) {
            inner
                .watch(&parent, RecursiveMode::NonRecursive)
                .map_err(|source| Error::Watch {
                    path: Some(path.clone()),
                    source,
                })?;
            self.watched_directories.insert(parent);
        }
        self.watched_files.insert(path.clone());

        Ok(path)
    }

    fn close(&mut self) {
        // Dropping the watcher drops its callback, which closes the channel.
        self.inner.take();
        self.watched_directories.clear();
        self.watched_files.clear();
        self.pending.clear();
    }
}

impl FuturesStream for NotifyWatcher {
    type Item = Result<Change>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        loop {
            if let Some(change) = self.pending.pop_front() {
                return task::Poll::Ready(Some(Ok(change)));
            }

            match ready!(self.event_stream.poll_recv(cx)) {
                Some(Ok(event)) => self.translate(event),
                Some(Err(e)) => return task::Poll::Ready(Some(Err(e.into()))),
                None => return task::Poll::Ready(None),
            }
        }
    }
}

/// Hand-driven [`ChangeSource`]. Every change sent through the paired
/// [`ChangeTrigger`] is yielded as-is.
///
/// Useful for tests, and for embedding where change detection happens
/// elsewhere (for example, a polling loop).
#[derive(Debug)]
pub struct ChannelSource {
    receiver: mpsc::UnboundedReceiver<Change>,
    closed: bool,
}

/// Sending half of a [`ChannelSource`].
#[derive(Clone, Debug)]
pub struct ChangeTrigger {
    sender: mpsc::UnboundedSender<Change>,
}

impl ChangeTrigger {
    /// Queues a change. Returns `false` once the source is gone.
    pub fn send(&self, change: Change) -> bool {
        self.sender.send(change).is_ok()
    }

    pub fn modified(&self, path: impl Into<PathBuf>) -> bool {
        self.send(Change::new(path, ChangeKind::Modified))
    }

    pub fn created(&self, path: impl Into<PathBuf>) -> bool {
        self.send(Change::new(path, ChangeKind::Created))
    }

    pub fn removed(&self, path: impl Into<PathBuf>) -> bool {
        self.send(Change::new(path, ChangeKind::Removed))
    }
}

impl ChannelSource {
    /// Creates a source along with the trigger that feeds it.
    pub fn pair() -> (Self, ChangeTrigger) {
        let (sender, receiver) = mpsc::unbounded_channel();

        (
            ChannelSource {
                receiver,
                closed: false,
            },
            ChangeTrigger { sender },
        )
    }
}

impl ChangeSource for ChannelSource {
    fn watch(&mut self, path: &Path) -> Result<PathBuf> {
        if path.is_dir() {
            return Err(Error::NotAFile(path.to_path_buf()));
        }
        Ok(path.to_path_buf())
    }

    fn close(&mut self) {
        self.closed = true;
        self.receiver.close();
    }
}

impl FuturesStream for ChannelSource {
    type Item = Result<Change>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        if self.closed {
            return task::Poll::Ready(None);
        }
        self.receiver.poll_recv(cx).map(|change| change.map(Ok))
    }
}

/// Resolves `path` to an absolute path with a canonical parent directory, so
/// it matches the paths `notify` reports. The file itself need not exist.
fn absolutify(path: impl Into<PathBuf>) -> io::Result<PathBuf> {
    let path = path.into();

    let parent = match path.parent() {
        None => std::env::current_dir()?,
        Some(parent) if parent == Path::new("") => std::env::current_dir()?,
        Some(parent) => parent.to_path_buf(),
    };
    let filename = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Filename not found in path"))?
        .to_os_string();

    let parent = parent.canonicalize().unwrap_or(parent);

    Ok(parent.join(filename))
}
