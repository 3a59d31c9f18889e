//! Everything related to reading lines out of a byte range of a file.
//!
//! The reader is stateless: it never remembers offsets between calls. Keeping
//! track of how far a file has been consumed is the job of
//! [`TailMonitor`](crate::TailMonitor).

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::slice::Iter;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Size of each backward step when looking for line boundaries near the end
/// of a file.
pub const CHUNK_SIZE: u64 = 4096;

/// Batch of lines produced by a single delta read of a given source path.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct LineBatch {
    /// The path from where the lines were read.
    source: PathBuf,
    /// The lines, in file order, without their terminators.
    lines: Vec<String>,
}

impl LineBatch {
    pub(crate) fn new(source: PathBuf, lines: Vec<String>) -> Self {
        LineBatch { source, lines }
    }

    /// Returns a reference to the file from where the lines were read.
    pub fn source(&self) -> &Path {
        self.source.as_path()
    }

    /// Returns a slice to the vec of lines.
    pub fn lines(&self) -> &[String] {
        self.lines.as_slice()
    }

    /// Returns an iterator over the slice of lines.
    pub fn iter(&self) -> Iter<String> {
        self.lines().iter()
    }

    /// Returns the number of lines in the batch.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Returns `true` if the number of lines in the batch is zero.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Renders the batch as a single newline-delimited text frame.
    pub fn to_frame(&self) -> String {
        self.lines.join("\n")
    }

    /// Returns the internal components that make up a `LineBatch`.
    pub fn into_inner(self) -> (PathBuf, Vec<String>) {
        let LineBatch { source, lines } = self;

        (source, lines)
    }
}

impl IntoIterator for LineBatch {
    type Item = String;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.lines.into_iter()
    }
}

fn decode_line(mut raw: &[u8]) -> String {
    if let Some((&b'\r', rest)) = raw.split_last() {
        raw = rest;
    }
    String::from_utf8_lossy(raw).into_owned()
}

/// Splits `bytes` into complete lines, prepending whatever was left in `carry`
/// by a previous call.
///
/// Bytes after the final `\n` are not a line yet; they stay in `carry` until a
/// later call completes them.
pub fn split_lines(carry: &mut Vec<u8>, bytes: &[u8]) -> Vec<String> {
    let mut lines = Vec::new();
    let mut rest = bytes;

    while let Some(idx) = rest.iter().position(|b| *b == b'\n') {
        carry.extend_from_slice(&rest[..idx]);
        lines.push(decode_line(carry.as_slice()));
        carry.clear();
        rest = &rest[idx + 1..];
    }
    carry.extend_from_slice(rest);

    lines
}

/// Walks backward from `end` in `CHUNK_SIZE` steps until the collected bytes
/// hold at least `boundaries` newlines or the start of the file is reached.
///
/// Returns the offset the collected bytes start at, along with the bytes
/// covering `[start, end)`.
async fn scan_backward(
    file: &mut File,
    end: u64,
    boundaries: usize,
) -> io::Result<(u64, Vec<u8>)> {
    let mut start = end;
    let mut buf = Vec::new();
    let mut found = 0;

    while start > 0 && found < boundaries {
        let chunk_start = start.saturating_sub(CHUNK_SIZE);
        let mut chunk = vec![0u8; (start - chunk_start) as usize];

        file.seek(SeekFrom::Start(chunk_start)).await?;
        file.read_exact(&mut chunk).await?;

        found += chunk.iter().filter(|b| **b == b'\n').count();
        chunk.extend_from_slice(&buf);
        buf = chunk;
        start = chunk_start;
    }

    Ok((start, buf))
}

/// Returns the last `n` complete lines of the file at `path`, or all of them if
/// the file holds fewer than `n`.
///
/// Only the tail of the file is read. A final line that has no terminating
/// newline yet is still being written and is left out.
pub async fn snapshot_tail(path: impl AsRef<Path>, n: usize) -> io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut file = File::open(path.as_ref()).await?;
    let end = file.metadata().await?.len();

    // One extra boundary so the oldest line kept is known to be whole.
    let (_start, buf) = scan_backward(&mut file, end, n + 1).await?;

    let complete = match buf.iter().rposition(|b| *b == b'\n') {
        Some(idx) => &buf[..=idx],
        None => return Ok(Vec::new()),
    };

    let mut carry = Vec::new();
    let mut lines = split_lines(&mut carry, complete);
    let skip = lines.len().saturating_sub(n);

    Ok(lines.split_off(skip))
}

/// Returns the bytes following the last newline before `end`, i.e. the line
/// currently being written at that offset.
///
/// `end` is clamped to the current length, in case the file shrank since the
/// caller looked at it.
pub(crate) async fn trailing_partial(path: impl AsRef<Path>, end: u64) -> io::Result<Vec<u8>> {
    let mut file = File::open(path.as_ref()).await?;
    let end = end.min(file.metadata().await?.len());
    let (_start, buf) = scan_backward(&mut file, end, 1).await?;

    match buf.iter().rposition(|b| *b == b'\n') {
        Some(idx) => Ok(buf[idx + 1..].to_vec()),
        None => Ok(buf),
    }
}

/// Reads the bytes in `[from, to)` of the file at `path` and splits them into
/// lines.
///
/// `carry` holds the unterminated tail of the previous delta. It is prepended
/// to this one, and is left holding the new unterminated tail, if any.
pub async fn read_delta(
    path: impl AsRef<Path>,
    from: u64,
    to: u64,
    carry: &mut Vec<u8>,
) -> io::Result<Vec<String>> {
    if to <= from {
        return Ok(Vec::new());
    }

    let mut file = File::open(path.as_ref()).await?;
    file.seek(SeekFrom::Start(from)).await?;

    let mut bytes = Vec::with_capacity((to - from) as usize);
    file.take(to - from).read_to_end(&mut bytes).await?;

    Ok(split_lines(carry, &bytes))
}
