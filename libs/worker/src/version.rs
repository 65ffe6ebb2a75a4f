//! Worker version compatibility.
//!
//! Workers advertise a version string when they register. A worker is
//! compatible with a required version when its release is the same, or newer
//! within the same major line.
//!
//! Only the release part of a version takes part in the comparison: anything
//! after the first `-` (pre-release) or `+` (build metadata) is ignored.
//! Missing trailing components compare as zero, so `2.3` equals `2.3.0`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from parsing a version string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("empty version")]
    Empty,

    #[error("invalid version component {0:?}")]
    InvalidComponent(String),
}

/// One dot-separated piece of a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    Numeric(u64),
    Alpha(String),
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Numeric(a), Self::Numeric(b)) => a.cmp(b),
            (Self::Alpha(a), Self::Alpha(b)) => a.cmp(b),
            (Self::Numeric(_), Self::Alpha(_)) => Ordering::Less,
            (Self::Alpha(_), Self::Numeric(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(n) => write!(f, "{n}"),
            Self::Alpha(s) => f.write_str(s),
        }
    }
}

/// The release components of a version, e.g. `[2, 3, 1]` for `2.3.1-rc.1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    release: Vec<Component>,
}

impl Version {
    pub fn release(&self) -> &[Component] {
        &self.release
    }

    /// The leading (major) component.
    pub fn major(&self) -> &Component {
        // Parsing guarantees at least one component.
        &self.release[0]
    }

    /// Compare release components, padding the shorter side with zeros.
    pub fn compare_release(&self, other: &Version) -> Ordering {
        let zero = Component::Numeric(0);
        let len = self.release.len().max(other.release.len());

        (0..len)
            .map(|i| {
                let a = self.release.get(i).unwrap_or(&zero);
                let b = other.release.get(i).unwrap_or(&zero);
                a.cmp(b)
            })
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let release = s.split(['-', '+']).next().unwrap_or_default();
        if release.is_empty() {
            return Err(VersionError::Empty);
        }

        let release = release
            .split('.')
            .map(|piece| {
                if !piece.is_empty() && piece.bytes().all(|b| b.is_ascii_digit()) {
                    piece
                        .parse()
                        .map(Component::Numeric)
                        .map_err(|_| VersionError::InvalidComponent(piece.to_string()))
                } else if !piece.is_empty() && piece.bytes().all(|b| b.is_ascii_alphanumeric()) {
                    Ok(Component::Alpha(piece.to_string()))
                } else {
                    Err(VersionError::InvalidComponent(piece.to_string()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { release })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, component) in self.release.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{component}")?;
        }
        Ok(())
    }
}

/// Decide whether a worker advertising `advertised` may serve work that
/// requires `required`.
///
/// Fails closed: a worker with no version, or one that does not parse, is
/// never compatible.
pub fn is_compatible(advertised: Option<&str>, required: &Version) -> bool {
    debug!(
        want_worker_version = %required,
        have_worker_version = ?advertised,
        "Checking worker version"
    );

    let Some(advertised) = advertised else {
        info!("Worker has no version");
        return false;
    };

    let have = match advertised.parse::<Version>() {
        Ok(v) => v,
        Err(e) => {
            warn!(version = %advertised, error = %e, "Failed to parse worker version");
            return false;
        }
    };

    match have.compare_release(required) {
        Ordering::Equal => true,
        Ordering::Less => false,
        Ordering::Greater => have.major() == required.major(),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[rstest]
    #[case("2.3.1", "2.3.1", true)]
    #[case("1.9.9", "2.0.0", false)]
    #[case("2.9.0", "2.0.0", true)]
    #[case("3.0.0", "2.0.0", false)]
    #[case("2.0", "2.0.0", true)]
    #[case("2.0.1-rc.1", "2.0.0", true)]
    #[case("2.0.0+build.7", "2.0.0", true)]
    fn test_is_compatible(#[case] have: &str, #[case] want: &str, #[case] expected: bool) {
        assert_eq!(is_compatible(Some(have), &v(want)), expected);
    }

    #[test]
    fn test_missing_version_is_incompatible() {
        assert!(!is_compatible(None, &v("1.0")));
    }

    #[rstest]
    #[case("")]
    #[case("banana!")]
    #[case("1..2")]
    #[case("-rc.1")]
    fn test_unparseable_version_is_incompatible(#[case] have: &str) {
        assert!(!is_compatible(Some(have), &v("1.0")));
    }

    #[test]
    fn test_version_display() {
        assert_eq!(v("2.3.1-rc.1").to_string(), "2.3.1");
    }

    #[test]
    fn test_alpha_components_sort_after_numeric() {
        assert_eq!(v("1.x").compare_release(&v("1.9")), Ordering::Greater);
    }
}
