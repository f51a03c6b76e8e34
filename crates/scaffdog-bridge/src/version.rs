//! Version information and the engine version gate.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Bridge version from Cargo.toml
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Oldest local engine the worker will load instead of the bundled one.
pub const MIN_ENGINE_VERSION: EngineVersion = EngineVersion::new(2, 0, 0);

/// `major.minor.patch[-pre]`. Build metadata is ignored.
///
/// A pre-release sorts below its release, so `2.0.0-rc.1 < 2.0.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Dot-separated pre-release identifiers, empty for a release.
    pub pre: String,
}

impl EngineVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: String::new(),
        }
    }

    pub fn with_pre(mut self, pre: impl Into<String>) -> Self {
        self.pre = pre.into();
        self
    }

    pub fn is_prerelease(&self) -> bool {
        !self.pre.is_empty()
    }

    pub fn satisfies_minimum(&self) -> bool {
        *self >= MIN_ENGINE_VERSION
    }
}

/// Numeric identifiers compare numerically and sort below alphanumeric ones.
fn cmp_identifier(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

fn cmp_pre(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let mut left = a.split('.');
            let mut right = b.split('.');
            loop {
                match (left.next(), right.next()) {
                    (None, None) => return Ordering::Equal,
                    (None, Some(_)) => return Ordering::Less,
                    (Some(_), None) => return Ordering::Greater,
                    (Some(x), Some(y)) => match cmp_identifier(x, y) {
                        Ordering::Equal => {}
                        unequal => return unequal,
                    },
                }
            }
        }
    }
}

impl Ord for EngineVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| cmp_pre(&self.pre, &other.pre))
    }
}

impl PartialOrd for EngineVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if self.is_prerelease() {
            write!(f, "-{}", self.pre)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version `{0}`")]
pub struct VersionParseError(String);

impl FromStr for EngineVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('v');
        let without_build = trimmed.split('+').next().unwrap_or_default();
        let (core, pre) = match without_build.split_once('-') {
            Some((core, pre)) => {
                let valid = pre.split('.').all(|id| {
                    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                });
                if !valid {
                    return Err(VersionParseError(s.to_string()));
                }
                (core, pre)
            }
            None => (without_build, ""),
        };
        let mut parts = core.split('.').map(|p| p.parse::<u64>());
        let mut next = || match parts.next() {
            Some(Ok(n)) => Ok(n),
            _ => Err(VersionParseError(s.to_string())),
        };
        let version = Self::new(next()?, next()?, next()?).with_pre(pre);
        if parts.next().is_some() {
            return Err(VersionParseError(s.to_string()));
        }
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_suffixed_versions() {
        assert_eq!("4.0.0".parse::<EngineVersion>(), Ok(EngineVersion::new(4, 0, 0)));
        assert_eq!(
            "v2.1.3-beta.1".parse::<EngineVersion>(),
            Ok(EngineVersion::new(2, 1, 3).with_pre("beta.1"))
        );
        assert_eq!("1.0.0+build.5".parse::<EngineVersion>(), Ok(EngineVersion::new(1, 0, 0)));
    }

    #[test]
    fn rejects_malformed_versions() {
        assert!("4.0".parse::<EngineVersion>().is_err());
        assert!("4.0.0.1".parse::<EngineVersion>().is_err());
        assert!("four".parse::<EngineVersion>().is_err());
        assert!("2.0.0-".parse::<EngineVersion>().is_err());
        assert!("2.0.0-rc..1".parse::<EngineVersion>().is_err());
    }

    #[test]
    fn prerelease_sorts_below_its_release() {
        let parse = |s: &str| s.parse::<EngineVersion>().unwrap();
        assert!(parse("2.0.0-rc.1") < parse("2.0.0"));
        assert!(parse("2.0.0-alpha") < parse("2.0.0-alpha.1"));
        assert!(parse("2.0.0-alpha.1") < parse("2.0.0-beta"));
        assert!(parse("2.0.0-beta.2") < parse("2.0.0-beta.11"));
        assert!(parse("2.0.0-rc.1") < parse("2.0.0-rc.1a"));
        assert!(parse("2.0.0-rc.1") > parse("1.9.9"));
        assert_eq!(parse("2.0.0-rc.1+build.7").to_string(), "2.0.0-rc.1");
    }

    #[test]
    fn minimum_gate() {
        assert!(EngineVersion::new(2, 0, 0).satisfies_minimum());
        assert!(EngineVersion::new(10, 0, 0).satisfies_minimum());
        assert!(!EngineVersion::new(1, 9, 9).satisfies_minimum());
        assert!(!"2.0.0-rc.1".parse::<EngineVersion>().unwrap().satisfies_minimum());
        assert!(!"2.0.0-beta.1".parse::<EngineVersion>().unwrap().satisfies_minimum());
        assert!("2.0.1-rc.1".parse::<EngineVersion>().unwrap().satisfies_minimum());
    }

    #[test]
    fn bridge_version_is_set() {
        assert!(!BRIDGE_VERSION.is_empty());
    }
}
