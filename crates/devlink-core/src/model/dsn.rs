// ── Device identity ──
//
// The device serial number is the only identity a device has across
// both transports. Everything keyed by device uses `Dsn`.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Device serial number.
///
/// Cheap to clone (`Arc<str>`), compared case-sensitively exactly as
/// the cloud reports it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dsn(Arc<str>);

impl Dsn {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(Arc::from(raw.as_ref().trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Dsn {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<&str> for Dsn {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Dsn {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for Dsn {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Dsn {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn dsn_trims_whitespace() {
        let dsn = Dsn::new("  AC000W000000001\n");
        assert_eq!(dsn.as_str(), "AC000W000000001");
    }

    #[test]
    fn dsn_from_str() {
        let dsn: Dsn = "AC000W000000001".parse().unwrap();
        assert_eq!(dsn.to_string(), "AC000W000000001");
    }

    #[test]
    fn dsn_borrows_as_str_for_map_lookups() {
        let mut map = std::collections::HashMap::new();
        map.insert(Dsn::new("A1"), 1);
        assert_eq!(map.get("A1"), Some(&1));
    }
}
