//! App version parsing and gating.
//!
//! Device capabilities are gated on the installed app version. The parser
//! is deliberately tolerant: pre-release suffixes are ignored (`"2.4.9-rc1"`
//! parses as `2.4.9`) and missing components default to zero, so a gate can
//! never fail on formatting alone.

use core::fmt;

use crate::error::{Error, Result};
use crate::identity::Identity;

/// Minimum app version for context-bound signing (`sign_with_context`).
pub const SIGN_WITH_CONTEXT_MIN_VERSION: Version = Version::new(3, 0, 0);

/// App version that introduced on-device candid parsing of call arguments.
pub const CANDID_PARSER_VERSION: Version = Version::new(2, 2, 1);

/// A semantic version as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses a version string tolerantly.
    ///
    /// Only the leading digits of each dot-separated component count;
    /// anything after them (pre-release tags, build metadata) is dropped,
    /// and absent components are zero. `"1.0.0-beta.1"` equals `"1.0.0"`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        let mut parts = s.split('.').map(leading_number);
        Self {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            patch: parts.next().unwrap_or(0),
        }
    }

    /// Whether this version predates `min`.
    #[must_use]
    pub fn is_smaller_than(&self, min: &Self) -> bool {
        self < min
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn leading_number(component: &str) -> u32 {
    let digits: &str = component
        .split_once(|c: char| !c.is_ascii_digit())
        .map_or(component, |(head, _)| head);
    digits.parse().unwrap_or(0)
}

/// Fails when the identity's installed app predates `min`.
///
/// Identities without an installed app (anyone whose
/// [`Identity::installed_app_version`] is `None`) pass unconditionally, so
/// callers can gate uniformly without knowing the identity's backing.
///
/// # Errors
///
/// Returns [`Error::VersionTooOld`] when a version is reported and it is
/// below `min`; device errors from the version query pass through.
pub async fn assert_app_version(identity: &dyn Identity, min: &Version) -> Result<()> {
    let Some(current) = identity.installed_app_version().await? else {
        return Ok(());
    };
    if current.is_smaller_than(min) {
        return Err(Error::VersionTooOld {
            current: current.to_string(),
            min: min.to_string(),
        });
    }
    Ok(())
}
