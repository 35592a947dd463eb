//! Output filename: `--out`, else Content-Disposition, else the URI path.
//! Whatever wins is made safe for a Linux filesystem.

const FALLBACK_NAME: &str = "index.html";
const NAME_MAX: usize = 255;

pub fn output_filename(out: Option<&str>, content_disposition: Option<&str>, uri: &str) -> String {
    let candidate = out
        .map(str::to_string)
        .or_else(|| content_disposition.and_then(disposition_filename))
        .or_else(|| uri_filename(uri));
    match candidate.map(|c| sanitize(&c)) {
        Some(name) if !name.is_empty() => name,
        _ => FALLBACK_NAME.to_string(),
    }
}

/// `filename*=UTF-8''...` wins over `filename=...`.
pub fn disposition_filename(header: &str) -> Option<String> {
    let mut plain = None;
    for param in header.split(';').map(str::trim) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                let encoded = value
                    .split_once("''")
                    .filter(|(charset, _)| charset.eq_ignore_ascii_case("utf-8"))
                    .map(|(_, rest)| rest);
                if let Some(name) = encoded.map(percent_decode).filter(|n| !n.is_empty()) {
                    return Some(name);
                }
            }
            "filename" => {
                let unquoted = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .map(|v| v.replace("\\\"", "\"").replace("\\\\", "\\"))
                    .unwrap_or_else(|| value.to_string());
                if !unquoted.is_empty() {
                    plain = Some(unquoted);
                }
            }
            _ => {}
        }
    }
    plain
}

/// Last non-empty path segment, percent-decoded.
fn uri_filename(uri: &str) -> Option<String> {
    let parsed = url::Url::parse(uri).ok()?;
    let last = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    Some(percent_decode(last))
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(decoded) = hex::decode(&bytes[i + 1..i + 3]) {
                out.extend_from_slice(&decoded);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// No separators, NUL or control characters; runs of replaced characters
/// collapse to one `_`; no leading or trailing dots, spaces or underscores.
fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let bad = matches!(c, '/' | '\\' | '\0' | ' ' | '\t') || c.is_control();
        if !bad {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches(|c| matches!(c, '.' | ' ' | '_'));
    let mut end = trimmed.len().min(NAME_MAX);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_beats_everything() {
        assert_eq!(
            output_filename(Some("mine.iso"), Some("attachment; filename=x.bin"), "http://h/y.zip"),
            "mine.iso"
        );
    }

    #[test]
    fn disposition_beats_uri_path() {
        assert_eq!(
            output_filename(None, Some("attachment; filename=\"report.pdf\""), "http://h/dl?id=3"),
            "report.pdf"
        );
        assert_eq!(
            output_filename(
                None,
                Some("attachment; filename=\"fallback.bin\"; filename*=UTF-8''real%20name.dat"),
                "http://h/x"
            ),
            "real_name.dat"
        );
    }

    #[test]
    fn uri_path_and_fallback() {
        assert_eq!(output_filename(None, None, "https://h/a/b/debian-12.iso?x=1"), "debian-12.iso");
        assert_eq!(output_filename(None, None, "ftp://h/pub/file%201.tar"), "file_1.tar");
        assert_eq!(output_filename(None, None, "file:///tmp/src.bin"), "src.bin");
        assert_eq!(output_filename(None, None, "https://h/"), "index.html");
        assert_eq!(output_filename(None, None, "https://h/.."), "index.html");
    }

    #[test]
    fn sanitize_strips_separators_and_edges() {
        assert_eq!(sanitize("../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize("  ..file.txt.. "), "file.txt");
        assert_eq!(sanitize("a\0b\\c"), "a_b_c");
        assert_eq!(sanitize(&"x".repeat(300)).len(), NAME_MAX);
    }

    #[test]
    fn percent_decode_keeps_bad_escapes() {
        assert_eq!(percent_decode("caf%C3%A9"), "café");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }
}
