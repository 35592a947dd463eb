//! Per-host transfer observations used to order mirror URIs.

use std::cmp::Reverse;
use std::collections::HashMap;

use anyhow::{Context, Result};

/// `(scheme, host, port)`; paths on the same origin share statistics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl HostKey {
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = url::Url::parse(url).with_context(|| format!("invalid URL: {url}"))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("URL has no host: {url}"))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| anyhow::anyhow!("URL has no port and no known default: {url}"))?;
        Ok(Self {
            scheme: parsed.scheme().to_string(),
            host,
            port,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStat {
    /// Last observed average download speed, bytes per second.
    pub download_speed: u64,
    /// The last download from this host failed.
    pub error: bool,
    pub successes: u32,
    pub failures: u32,
}

#[derive(Debug, Default)]
pub struct ServerStatMan {
    stats: HashMap<HostKey, ServerStat>,
}

impl ServerStatMan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uri: &str) -> Option<&ServerStat> {
        let key = HostKey::from_url(uri).ok()?;
        self.stats.get(&key)
    }

    pub fn record_success(&mut self, uri: &str, speed: u64) {
        let Ok(key) = HostKey::from_url(uri) else { return };
        let stat = self.stats.entry(key).or_default();
        stat.successes += 1;
        stat.error = false;
        if speed > 0 {
            stat.download_speed = speed;
        }
    }

    pub fn record_failure(&mut self, uri: &str) {
        let Ok(key) = HostKey::from_url(uri) else { return };
        let stat = self.stats.entry(key).or_default();
        stat.failures += 1;
        stat.error = true;
        tracing::debug!(host = %stat_host(uri), "host marked in error");
    }

    /// Sort key, lower first: hosts in error last, then faster hosts first.
    /// Unknown hosts rank with speed 0.
    pub fn rank(&self, uri: &str) -> (bool, Reverse<u64>) {
        match self.get(uri) {
            Some(s) => (s.error, Reverse(s.download_speed)),
            None => (false, Reverse(0)),
        }
    }
}

fn stat_host(uri: &str) -> String {
    HostKey::from_url(uri).map_or_else(|_| uri.to_string(), |k| format!("{}:{}", k.host, k.port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_uses_default_port() {
        let key = HostKey::from_url("http://example.com/path").unwrap();
        assert_eq!(key.scheme, "http");
        assert_eq!(key.host, "example.com");
        assert_eq!(key.port, 80);
        assert!(HostKey::from_url("not a url").is_err());
    }

    #[test]
    fn ranks_errors_last_and_fast_hosts_first() {
        let mut man = ServerStatMan::new();
        man.record_success("http://fast.example/a", 5_000);
        man.record_success("http://slow.example/a", 100);
        man.record_failure("http://broken.example/a");

        let mut uris = vec![
            "http://broken.example/f".to_string(),
            "http://slow.example/f".to_string(),
            "http://new.example/f".to_string(),
            "http://fast.example/f".to_string(),
        ];
        uris.sort_by_key(|u| man.rank(u));
        assert_eq!(
            uris,
            [
                "http://fast.example/f",
                "http://slow.example/f",
                "http://new.example/f",
                "http://broken.example/f",
            ]
        );
    }

    #[test]
    fn success_clears_error_flag() {
        let mut man = ServerStatMan::new();
        man.record_failure("https://mirror.example/x");
        assert!(man.get("https://mirror.example/y").unwrap().error);
        man.record_success("https://mirror.example/x", 0);
        let stat = man.get("https://mirror.example/x").unwrap();
        assert!(!stat.error);
        assert_eq!((stat.successes, stat.failures), (1, 1));
    }
}
