//! Version parsing and ordering.
//!
//! Server and storage targets use two grammars:
//!
//! - quarterly: six or seven dot-separated integers, e.g. `21.2.11.0.0.220414.1`
//! - incremental: a six-digit build with an optional `.N` revision, e.g. `220414.1`
//!
//! Switches report firmware versions instead: two to five integers separated
//! by `.` or `-`, e.g. `2.2.16-1`, which orders as `2.2.16.1`.
//!
//! A trailing `kvm`/`rtg` marker (optionally joined with `.`, `_` or `-`) is
//! dropped before parsing; it names an image format, not a version.

use ipm_common::types::TargetKind;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Literal accepted in place of a concrete version for dom0 live updates.
pub const LATEST: &str = "LATEST";

const FORMAT_SUFFIXES: [&str; 2] = ["kvm", "rtg"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("'{0}' does not match the version grammar of the target")]
    InvalidFormat(String),

    #[error("'{version}' is only accepted for dom0 targets with live update enabled")]
    SentinelNotAllowed { version: String },
}

impl VersionError {
    pub fn version(&self) -> &str {
        match self {
            Self::InvalidFormat(version) | Self::SentinelNotAllowed { version } => version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionFamily {
    Quarterly,
    Incremental,
    Firmware,
}

/// A parsed version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    family: VersionFamily,
    components: Vec<u64>,
    raw: String,
}

impl Version {
    pub fn family(&self) -> VersionFamily {
        self.family
    }

    pub fn components(&self) -> &[u64] {
        &self.components
    }

    /// The string as given, including any format marker.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Parse `raw` in the grammar nodes of `target` report.
    pub fn parse_for(raw: &str, target: TargetKind) -> Result<Self, VersionError> {
        if target.is_switch() {
            parse_firmware(raw)
        } else {
            raw.parse()
        }
    }

    /// First token in `output` that parses as a version of `target`.
    pub fn find_in(output: &str, target: TargetKind) -> Option<Self> {
        output
            .split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '"' | '\'' | '(' | ')'))
            .map(|token| token.trim_start_matches(['v', 'V', ':']).trim_end_matches(['.', ':']))
            .find_map(|token| Self::parse_for(token, target).ok())
    }
}

fn parse_firmware(raw: &str) -> Result<Version, VersionError> {
    let raw = raw.trim();
    let invalid = || VersionError::InvalidFormat(raw.to_string());
    let components = raw
        .split(['.', '-'])
        .map(|p| {
            if !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) {
                p.parse::<u64>().ok()
            } else {
                None
            }
        })
        .collect::<Option<Vec<_>>>()
        .ok_or_else(invalid)?;
    if !(2..=5).contains(&components.len()) {
        return Err(invalid());
    }
    Ok(Version {
        family: VersionFamily::Firmware,
        components,
        raw: raw.to_string(),
    })
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let core = strip_format_suffix(raw);
        let invalid = || VersionError::InvalidFormat(raw.to_string());

        let parts: Vec<&str> = core.split('.').collect();
        if parts
            .iter()
            .any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(invalid());
        }
        let components = parts
            .iter()
            .map(|p| p.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid())?;

        let family = match parts.len() {
            6 | 7 => VersionFamily::Quarterly,
            1 | 2 if parts[0].len() == 6 => VersionFamily::Incremental,
            _ => return Err(invalid()),
        };

        Ok(Self {
            family,
            components,
            raw: raw.to_string(),
        })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        (0..len)
            .map(|i| {
                let a = self.components.get(i).copied().unwrap_or(0);
                let b = other.components.get(i).copied().unwrap_or(0);
                a.cmp(&b)
            })
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

fn strip_format_suffix(raw: &str) -> &str {
    let lower = raw.to_ascii_lowercase();
    for suffix in FORMAT_SUFFIXES {
        if lower.ends_with(suffix) {
            let cut = &raw[..raw.len() - suffix.len()];
            return cut.trim_end_matches(['.', '_', '-']);
        }
    }
    raw
}

/// What a request asks the nodes to move to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetVersion {
    /// Whatever the tool considers newest (dom0 live update only).
    Latest,
    Concrete(Version),
}

impl TargetVersion {
    pub fn concrete(&self) -> Option<&Version> {
        match self {
            Self::Latest => None,
            Self::Concrete(v) => Some(v),
        }
    }
}

impl fmt::Display for TargetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str(LATEST),
            Self::Concrete(v) => v.fmt(f),
        }
    }
}

/// Stateless comparator over the two version grammars.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionComparator;

impl VersionComparator {
    /// Order `a` relative to `b`.
    pub fn compare(&self, a: &str, b: &str) -> Result<Ordering, VersionError> {
        let a: Version = a.parse()?;
        let b: Version = b.parse()?;
        Ok(a.cmp(&b))
    }

    pub fn is_latest_sentinel_allowed(&self, version: &str, target: TargetKind, live_update: bool) -> bool {
        version.trim().eq_ignore_ascii_case(LATEST) && target == TargetKind::Dom0 && live_update
    }

    /// Validate a request's target version.
    pub fn target(&self, version: &str, target: TargetKind, live_update: bool) -> Result<TargetVersion, VersionError> {
        if version.trim().eq_ignore_ascii_case(LATEST) {
            return if self.is_latest_sentinel_allowed(version, target, live_update) {
                Ok(TargetVersion::Latest)
            } else {
                Err(VersionError::SentinelNotAllowed {
                    version: version.to_string(),
                })
            };
        }
        Version::parse_for(version, target).map(TargetVersion::Concrete)
    }
}
