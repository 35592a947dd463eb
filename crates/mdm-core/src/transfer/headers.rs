//! Response header parsing for header requests and range validation.

use super::HeadInfo;

/// Status code of the last `HTTP/` status line.
pub fn parse_http_status(lines: &[String]) -> Option<u32> {
    lines
        .iter()
        .rev()
        .find(|l| l.starts_with("HTTP/"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
}

/// `Content-Range: bytes <first>-<last>/<total|*>` as `(first, last, total)`.
pub fn parse_content_range(lines: &[String]) -> Option<(u64, u64, Option<u64>)> {
    let value = header_value(lines, "content-range")?;
    let spec = value.strip_prefix("bytes")?.trim_start();
    let (range, total) = spec.split_once('/')?;
    let (first, last) = range.split_once('-')?;
    let first = first.trim().parse().ok()?;
    let last = last.trim().parse().ok()?;
    if last < first {
        return None;
    }
    Some((first, last, total.trim().parse().ok()))
}

/// Length, range support and filename hint from a header block.
pub fn parse_head_response(lines: &[String]) -> HeadInfo {
    HeadInfo {
        content_length: header_value(lines, "content-length").and_then(|v| v.parse().ok()),
        accept_ranges: header_value(lines, "accept-ranges")
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes")),
        content_disposition: header_value(lines, "content-disposition").map(str::to_string),
    }
}

fn header_value<'a>(lines: &'a [String], name: &str) -> Option<&'a str> {
    lines.iter().rev().find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.trim().eq_ignore_ascii_case(name).then(|| v.trim())
    })
}
