//! Live tailing of growing (namely log) files, fanned out to many concurrent
//! viewers.
//!
//! The crate is made of three layers:
//!
//! * [`snapshot_tail`] and [`read_delta`] read lines out of a file without
//!   touching more of it than needed.
//! * [`TailMonitor`] follows one file through a [`ChangeSource`], emitting each
//!   newly appended run of lines as a [`LineBatch`] and coping with truncation
//!   and rotation.
//! * [`BroadcastHub`] owns every connected viewer and fans batches out to
//!   them. A viewer that falls too far behind is disconnected rather than
//!   slowing anyone else down.
//!
//! ## Example
//!
//! ```no_run
//! use tailcast::{BroadcastHub, HubConfig, NotifyWatcher, TailMonitor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tailcast::Error> {
//!     let hub = BroadcastHub::spawn(HubConfig::default());
//!
//!     let mut monitor = TailMonitor::new("some/file.log", NotifyWatcher::new()?);
//!     monitor.start().await?;
//!     let task = monitor.spawn(hub.clone());
//!
//!     // Hand `hub` to whatever accepts viewers, e.g. `tailcast::serve`.
//!     task.await.ok();
//!     Ok(())
//! }
//! ```
//!
//! ## Caveats
//!
//! A monitor starts at the current end of its file, and the file must exist
//! when it starts. Its parent directory is what gets watched, so later
//! removal and re-creation of the file are followed.

mod error;
mod events;
mod hub;
mod monitor;
mod reader;
#[cfg(feature = "server")]
pub mod server;
mod subscriber;

pub use error::{Error, Result};
pub use events::{Change, ChangeKind, ChangeSource, ChangeTrigger, ChannelSource, NotifyWatcher};
pub use hub::{BroadcastHub, HubConfig, HubHandle, DEFAULT_INBOX_CAPACITY, DEFAULT_QUEUE_CAPACITY};
pub use monitor::{MonitorState, TailMonitor, WatchedFile};
pub use reader::{read_delta, snapshot_tail, split_lines, LineBatch};
pub use subscriber::{
    drain_loop, read_loop, serve, Frame, Outbound, Subscriber, SubscriberId, Transport,
};

#[cfg(doctest)]
doc_comment::doctest!("../README.md");
