//! Tail reader - yields lines appended to a log file after it was opened
//!
//! The reader seeks to end of file on open, so existing content is never
//! replayed. If the file ends inside a line at that point, the rest of that
//! line is dropped when it arrives. Reaching EOF is not terminal: the reader
//! sleeps for the poll interval and tries again from the same position.
//! Incomplete trailing lines stay buffered until their terminator arrives.

use crate::LogEncoding;
use std::collections::VecDeque;
use std::io::{self, ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, trace};

/// Default delay between polls once the reader has caught up.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 16 * 1024;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const UTF16LE_BOM: &[u8] = &[0xFF, 0xFE];

#[derive(Debug)]
pub struct TailReader {
    path: PathBuf,
    file: File,
    offset: u64,
    chunk: Vec<u8>,
    buffer: Vec<u8>,
    /// Set while the bytes ahead belong to a line that started before `offset`.
    skip_partial: bool,
    lines: VecDeque<String>,
    encoding: LogEncoding,
    poll_interval: Duration,
}

impl TailReader {
    /// Open `path` positioned at its current end.
    pub async fn open(
        path: impl Into<PathBuf>,
        encoding: LogEncoding,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        let path = path.into();
        let mut file = File::open(&path).await?;
        let (offset, skip_partial) = seek_to_line_end(&mut file, encoding).await?;
        debug!(path = %path.display(), offset, skip_partial, "tail reader opened");

        Ok(Self {
            path,
            file,
            offset,
            chunk: vec![0u8; READ_CHUNK],
            buffer: Vec::new(),
            skip_partial,
            lines: VecDeque::new(),
            encoding,
            poll_interval,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the next read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Wait for the next complete line.
    ///
    /// Only returns an error for genuine I/O failures, including the file
    /// having been removed. Partial lines and already split lines live in the
    /// reader, so the returned future may be dropped (e.g. in `select!`).
    pub async fn next_line(&mut self) -> io::Result<String> {
        loop {
            if let Some(line) = self.lines.pop_front() {
                return Ok(line);
            }

            let n = self.file.read(&mut self.chunk).await?;
            if n == 0 {
                self.check_tailable().await?;
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            self.offset += n as u64;
            self.buffer.extend_from_slice(&self.chunk[..n]);
            if self.skip_partial {
                self.skip_partial = !skip_through_terminator(&mut self.buffer, self.encoding);
            }
            let lines = drain_lines(&mut self.buffer, self.encoding);
            trace!(path = %self.path.display(), count = lines.len(), "read log lines");
            self.lines.extend(lines);
        }
    }

    /// Called at EOF: errors if the file is gone, skips ahead if it shrank.
    async fn check_tailable(&mut self) -> io::Result<()> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(io::Error::new(
                    ErrorKind::NotFound,
                    format!("{} was removed", self.path.display()),
                ));
            }
            Err(e) => return Err(e),
        };

        if meta.len() < self.offset {
            debug!(path = %self.path.display(), "log truncated; skipping to new end");
            self.buffer.clear();
            (self.offset, self.skip_partial) =
                seek_to_line_end(&mut self.file, self.encoding).await?;
        }
        Ok(())
    }
}

fn code_unit_len(encoding: LogEncoding) -> u64 {
    match encoding {
        LogEncoding::Utf8 => 1,
        LogEncoding::Utf16Le => 2,
    }
}

/// Seek to the last code unit boundary at end of file.
///
/// Returns the new offset and whether the file ends inside a line. A file
/// holding nothing but a byte order mark counts as ending on a line boundary.
async fn seek_to_line_end(file: &mut File, encoding: LogEncoding) -> io::Result<(u64, bool)> {
    let len = file.seek(SeekFrom::End(0)).await?;
    let unit = code_unit_len(encoding);
    let end = len - len % unit;
    if end == 0 {
        file.seek(SeekFrom::Start(0)).await?;
        return Ok((0, false));
    }

    let bom = match encoding {
        LogEncoding::Utf8 => UTF8_BOM,
        LogEncoding::Utf16Le => UTF16LE_BOM,
    };
    let tail_len = if end == bom.len() as u64 { end } else { unit };
    let mut tail = vec![0u8; tail_len as usize];
    file.seek(SeekFrom::Start(end - tail_len)).await?;
    file.read_exact(&mut tail).await?;

    let at_line_start = tail == bom
        || match encoding {
            LogEncoding::Utf8 => tail.ends_with(b"\n"),
            LogEncoding::Utf16Le => tail.ends_with(&[0x0A, 0x00]),
        };
    Ok((end, !at_line_start))
}

/// Drop the front of `buffer` up to and including the first line terminator.
/// Returns `false` if no terminator has arrived yet.
fn skip_through_terminator(buffer: &mut Vec<u8>, encoding: LogEncoding) -> bool {
    let terminator_end = match encoding {
        LogEncoding::Utf8 => buffer.iter().position(|b| *b == b'\n').map(|idx| idx + 1),
        LogEncoding::Utf16Le => buffer
            .chunks_exact(2)
            .position(|pair| pair == [0x0A, 0x00])
            .map(|unit| unit * 2 + 2),
    };

    match terminator_end {
        Some(end) => {
            buffer.drain(..end);
            true
        }
        None => {
            // Keep a dangling odd byte so UTF-16 code units stay aligned.
            let whole = buffer.len() - buffer.len() % code_unit_len(encoding) as usize;
            buffer.drain(..whole);
            false
        }
    }
}

/// Split complete lines off the front of `buffer`, leaving any partial line.
fn drain_lines(buffer: &mut Vec<u8>, encoding: LogEncoding) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0usize;

    match encoding {
        LogEncoding::Utf8 => {
            for (idx, b) in buffer.iter().enumerate() {
                if *b != b'\n' {
                    continue;
                }
                push_line(&mut out, String::from_utf8_lossy(&buffer[start..idx]).into_owned());
                start = idx + 1;
            }
        }
        LogEncoding::Utf16Le => {
            let mut idx = 0usize;
            while idx + 1 < buffer.len() {
                if buffer[idx] == 0x0A && buffer[idx + 1] == 0x00 {
                    let units: Vec<u16> = buffer[start..idx]
                        .chunks_exact(2)
                        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                        .collect();
                    push_line(&mut out, String::from_utf16_lossy(&units));
                    start = idx + 2;
                }
                idx += 2;
            }
        }
    }

    if start > 0 {
        buffer.drain(..start);
    }
    out
}

fn push_line(out: &mut Vec<String>, raw: String) {
    let line = raw.trim_start_matches('\u{feff}').trim_end_matches('\r');
    if line.trim().is_empty() {
        return;
    }
    out.push(line.to_string());
}
