//! Minimal HTTP/1.1 server for integration tests: HEAD and Range GET over
//! one static body.
//!
//! Every request is recorded so tests can assert which ranges were fetched.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
pub struct RangeServerOptions {
    /// GET ignores Range and always answers 200 with the full body.
    pub ignore_ranges: bool,
    /// Range GETs starting at or past this offset answer 503.
    pub unavailable_from: Option<u64>,
}

/// One request as the server saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub method: String,
    pub path: String,
    pub range_start: Option<u64>,
}

pub struct RangeServer {
    base: String,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl RangeServer {
    /// Serves `body` at `/file`; every other path is 404. Runs until the
    /// process exits.
    pub fn start(body: Vec<u8>) -> Self {
        Self::start_with_options(body, RangeServerOptions::default())
    }

    pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        let body = Arc::new(body);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let body = Arc::clone(&body);
                let log = Arc::clone(&log);
                thread::spawn(move || handle(stream, &body, opts, &log));
            }
        });
        Self {
            base: format!("http://127.0.0.1:{port}"),
            seen,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    /// Start offsets of every GET, sorted.
    pub fn get_starts(&self) -> Vec<u64> {
        let mut starts: Vec<u64> = self
            .seen()
            .into_iter()
            .filter(|s| s.method == "GET")
            .map(|s| s.range_start.unwrap_or(0))
            .collect();
        starts.sort_unstable();
        starts
    }
}

fn handle(mut stream: TcpStream, body: &[u8], opts: RangeServerOptions, log: &Mutex<Vec<Seen>>) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let Ok(request) = std::str::from_utf8(&buf[..n]) else {
        return;
    };
    let (method, path, range) = parse_request(request);
    log.lock().unwrap().push(Seen {
        method: method.to_string(),
        path: path.to_string(),
        range_start: range.map(|(s, _)| s),
    });

    if path != "/file" {
        let _ = stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        return;
    }
    let total = body.len() as u64;
    let accept_ranges = if opts.ignore_ranges { "" } else { "Accept-Ranges: bytes\r\n" };
    if method.eq_ignore_ascii_case("HEAD") {
        let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {total}\r\n{accept_ranges}Connection: close\r\n\r\n");
        let _ = stream.write_all(head.as_bytes());
        return;
    }
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
        return;
    }

    let range = range.filter(|_| !opts.ignore_ranges);
    if let (Some((start, _)), Some(from)) = (range, opts.unavailable_from) {
        if start >= from {
            let _ = stream
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            return;
        }
    }
    let (status, content_range, slice) = match range {
        Some((start, end_incl)) => {
            let end_incl = end_incl.min(total.saturating_sub(1));
            if start > end_incl {
                ("416 Range Not Satisfiable", format!("bytes */{total}"), &body[0..0])
            } else {
                (
                    "206 Partial Content",
                    format!("bytes {start}-{end_incl}/{total}"),
                    &body[start as usize..=end_incl as usize],
                )
            }
        }
        None => ("200 OK", String::new(), body),
    };
    let content_range = if content_range.is_empty() {
        String::new()
    } else {
        format!("Content-Range: {content_range}\r\n")
    };
    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\n{content_range}{accept_ranges}Connection: close\r\n\r\n",
        slice.len()
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(slice);
}

/// Returns (method, path, optional (start, end_inclusive) of `Range: bytes=X-Y`).
fn parse_request(request: &str) -> (&str, &str, Option<(u64, u64)>) {
    let mut lines = request.lines();
    let mut first = lines.next().unwrap_or("").split_whitespace();
    let method = first.next().unwrap_or("");
    let path = first.next().unwrap_or("");
    let mut range = None;
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("range") {
            continue;
        }
        let Some(spec) = value.trim().strip_prefix("bytes=") else {
            continue;
        };
        if let Some((a, b)) = spec.split_once('-') {
            let start = a.trim().parse::<u64>().unwrap_or(0);
            let end = b.trim().parse::<u64>().unwrap_or(u64::MAX);
            range = Some((start, end));
        }
    }
    (method, path, range)
}
