//! Access and event logging.
//!
//! Workers format log lines inline and hand them to a single background
//! flush thread over a channel; file writes never happen on a worker.
//! The flush thread batches lines, takes an exclusive flock around each
//! append so multiple processes can share the file, reopens on error, and
//! never propagates failures to the data path.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{bounded, Receiver, Sender};
use protocol_http1::{HeaderMap, InlineName, Protocol};

use crate::stats::{Counter, Scope};
use crate::stream_info::RequestInfo;

/// Lines queued beyond this are dropped rather than stalling workers.
const MAX_QUEUED_LINES: usize = 64 * 1024;

/// Cheap cloneable handle workers log through.
#[derive(Clone)]
pub struct Sink {
    tx: Sender<String>,
}

impl Sink {
    /// Queue one line (newline appended by the writer). Drops on overflow.
    pub fn log(&self, line: String) {
        let _ = self.tx.try_send(line);
    }

    /// A sink that discards everything, for tests and disabled logging.
    pub fn disabled() -> Sink {
        let (tx, _rx) = bounded(1);
        Sink { tx }
    }
}

/// Start the background flush thread. Returns the worker-facing sink.
pub fn start(
    path: PathBuf,
    flush_interval: Duration,
    scope: &Scope,
) -> Sink {
    let (tx, rx) = bounded(MAX_QUEUED_LINES);
    let reopen_failed = scope.counter("reopen_failed");
    let write_failed = scope.counter("write_failed");
    std::thread::Builder::new()
        .name("log-flush".to_string())
        .spawn(move || flush_loop(path, flush_interval, rx, reopen_failed, write_failed))
        .expect("spawn log flush thread");
    Sink { tx }
}

fn flush_loop(
    path: PathBuf,
    interval: Duration,
    rx: Receiver<String>,
    reopen_failed: Counter,
    write_failed: Counter,
) {
    let mut file: Option<File> = None;
    let mut buffer = String::new();
    loop {
        match rx.recv_timeout(interval) {
            Ok(line) => {
                buffer.push_str(&line);
                buffer.push('\n');
                if buffer.len() < 64 * 1024 {
                    continue;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                flush(&path, &mut file, &mut buffer, &reopen_failed, &write_failed);
                return;
            }
        }
        flush(&path, &mut file, &mut buffer, &reopen_failed, &write_failed);
    }
}

fn flush(
    path: &PathBuf,
    file: &mut Option<File>,
    buffer: &mut String,
    reopen_failed: &Counter,
    write_failed: &Counter,
) {
    if buffer.is_empty() {
        return;
    }
    if file.is_none() {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => *file = Some(f),
            Err(_) => {
                reopen_failed.increment();
                // Keep the buffer; retry on the next flush.
                buffer.truncate(buffer.len().min(1024 * 1024));
                return;
            }
        }
    }
    let f = file.as_mut().expect("opened above");
    // Appends from cooperating processes are serialized by the file lock.
    let fd = f.as_raw_fd();
    unsafe {
        libc::flock(fd, libc::LOCK_EX);
    }
    let result = f.write_all(buffer.as_bytes()).and_then(|_| f.flush());
    unsafe {
        libc::flock(fd, libc::LOCK_UN);
    }
    match result {
        Ok(()) => buffer.clear(),
        Err(_) => {
            write_failed.increment();
            *file = None;
        }
    }
}

/// Default access-log line:
/// `[time] "METHOD path PROTOCOL" code flags bytes_received bytes_sent
/// duration_ms "request-id" "authority" "upstream-host"`.
pub fn format_access_line(
    request_headers: &HeaderMap,
    info: &RequestInfo,
    protocol: Protocol,
    duration: Duration,
) -> String {
    let protocol = match protocol {
        Protocol::Http10 => "HTTP/1.0",
        Protocol::Http11 => "HTTP/1.1",
    };
    let upstream = info
        .upstream_host
        .as_ref()
        .map(|h| h.address().to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "[{}] \"{} {} {}\" {} {} {} {} {} \"{}\" \"{}\" \"{}\"",
        format_timestamp(info.start_wall),
        request_headers.get_inline(InlineName::Method).unwrap_or("-"),
        request_headers.get_inline(InlineName::Path).unwrap_or("-"),
        protocol,
        info.response_code.map(|c| c.to_string()).unwrap_or_else(|| "0".into()),
        info.response_flags_string(),
        info.bytes_received,
        info.bytes_sent,
        duration.as_millis(),
        request_headers.get_inline(InlineName::RequestId).unwrap_or("-"),
        request_headers.get_inline(InlineName::Authority).unwrap_or("-"),
        upstream,
    )
}

fn format_timestamp(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time)
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
