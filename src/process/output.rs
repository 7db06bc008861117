//! Child output handling
//!
//! Two reader tasks hang off every child: one drains stderr, re-logging the
//! transcoder's diagnostics and stamping the activity clock; the other (frame
//! pipelines only) splits stdout into JPEG images and forwards them as
//! [`ProcessEvent::Frame`]s.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

use super::event::ProcessEvent;
use super::profile::LogStyle;

/// JPEG start-of-image marker
const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Largest image accepted before the partial buffer is discarded
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;
const MAX_LOG_LINE: usize = 1024;

/// Time of the last byte seen on any child output
///
/// Stored as milliseconds since `origin` so readers can stamp it without a lock.
#[derive(Debug)]
pub struct ActivityClock {
    origin: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    /// Create a clock stamped "now"
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    /// Record activity now
    pub fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Instant of the last recorded activity
    pub fn last(&self) -> Instant {
        self.origin + std::time::Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Reassembles a byte stream into complete JPEG images
#[derive(Debug, Default)]
pub struct JpegSplitter {
    buf: BytesMut,
    in_image: bool,
    scan_from: usize,
}

impl JpegSplitter {
    /// Create an empty splitter
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every image it completes
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);
        let mut images = Vec::new();

        loop {
            if !self.in_image {
                match find_marker(&self.buf, 0, SOI) {
                    Some(pos) => {
                        self.buf.advance(pos);
                        self.in_image = true;
                        self.scan_from = SOI.len();
                    }
                    None => {
                        // a trailing 0xFF may be the first half of the next SOI
                        let keep = usize::from(self.buf.last() == Some(&0xFF));
                        let discard = self.buf.len() - keep;
                        self.buf.advance(discard);
                        break;
                    }
                }
            }

            match find_marker(&self.buf, self.scan_from, EOI) {
                Some(pos) => {
                    images.push(self.buf.split_to(pos + EOI.len()).freeze());
                    self.in_image = false;
                    self.scan_from = 0;
                }
                None => {
                    if self.buf.len() > MAX_FRAME_SIZE {
                        tracing::warn!(bytes = self.buf.len(), "Dropping oversized partial frame");
                        self.buf.clear();
                        self.in_image = false;
                        self.scan_from = 0;
                    } else {
                        self.scan_from = self.buf.len().saturating_sub(1).max(SOI.len());
                    }
                    break;
                }
            }
        }

        images
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn find_marker(buf: &[u8], from: usize, marker: [u8; 2]) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| pos + from)
}

/// Drain a child's stderr, re-logging lines and stamping `activity`
pub(crate) fn spawn_diagnostics_reader<R>(
    name: Arc<str>,
    style: LogStyle,
    mut stderr: R,
    activity: Arc<ActivityClock>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; 4096];
        let mut line = Vec::with_capacity(256);

        loop {
            let n = match stderr.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(camera = %name, error = %e, "stderr read failed");
                    break;
                }
            };
            activity.touch();

            for &byte in &chunk[..n] {
                // progress output is terminated with '\r' rather than '\n'
                if byte == b'\n' || byte == b'\r' {
                    if !line.is_empty() {
                        log_line(&name, style, &String::from_utf8_lossy(&line));
                        line.clear();
                    }
                } else if line.len() < MAX_LOG_LINE {
                    line.push(byte);
                }
            }
        }

        if !line.is_empty() {
            log_line(&name, style, &String::from_utf8_lossy(&line));
        }
    })
}

fn log_line(name: &str, style: LogStyle, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match style {
        LogStyle::Progress => {
            if line.starts_with("frame=") || line.contains("progress=") {
                tracing::trace!(camera = %name, "{}", line);
            } else {
                tracing::debug!(camera = %name, "{}", line);
            }
        }
        LogStyle::Warnings => tracing::warn!(camera = %name, "{}", line),
        LogStyle::ErrorsOnly => {
            let lower = line.to_ascii_lowercase();
            if lower.contains("error") || lower.contains("failed") {
                tracing::warn!(camera = %name, "{}", line);
            } else {
                tracing::trace!(camera = %name, "{}", line);
            }
        }
    }
}

/// Split a child's stdout into JPEG images and forward them as frame events
///
/// Frames are offered with `try_send`; a full queue drops the frame rather
/// than stalling the child.
pub(crate) fn spawn_frame_reader<R>(
    name: Arc<str>,
    mut stdout: R,
    events: mpsc::Sender<ProcessEvent>,
    activity: Arc<ActivityClock>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut splitter = JpegSplitter::new();

        loop {
            let n = match stdout.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(camera = %name, error = %e, "stdout read failed");
                    break;
                }
            };
            activity.touch();

            for image in splitter.push(&chunk[..n]) {
                match events.try_send(ProcessEvent::Frame(image)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::trace!(camera = %name, "Event queue full, frame dropped");
                    }
                    Err(TrySendError::Closed(_)) => return,
                }
            }
        }
    })
}
