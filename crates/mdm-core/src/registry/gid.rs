use std::fmt;
use std::str::FromStr;

/// Download group id. Displayed as 16 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gid(pub u64);

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid GID: {0:?}")]
pub struct ParseGidError(String);

impl FromStr for Gid {
    type Err = ParseGidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 16 {
            return Err(ParseGidError(s.to_string()));
        }
        u64::from_str_radix(s, 16)
            .map(Gid)
            .map_err(|_| ParseGidError(s.to_string()))
    }
}

/// Hands out process-unique GIDs. One instance lives in the registry.
#[derive(Debug, Default)]
pub struct GidGenerator {
    last: u64,
}

impl GidGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> Gid {
        self.last += 1;
        Gid(self.last)
    }

    /// Account for a GID assigned elsewhere; later calls to
    /// [`next`](Self::next) hand out only larger ones.
    pub fn observe(&mut self, gid: Gid) {
        self.last = self.last.max(gid.0);
    }
}
