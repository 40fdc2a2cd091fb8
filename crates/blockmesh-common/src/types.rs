//! Core type definitions for blockmesh
//!
//! Names of volumes and blocks, host list parsing and the human readable
//! size syntax accepted on the command line.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Default sector size used to align sizes when no block size is given
pub const DEFAULT_SECTOR_SIZE: u64 = 512;

/// Maximum length of a block or volume name
pub const MAX_NAME_LEN: usize = 255;

/// Name of a block inside a volume
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct BlockName(String);

impl BlockName {
    /// Create a new block name (validated)
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, NameError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self(name))
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the block name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BlockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockName({:?})", self.0)
    }
}

impl AsRef<str> for BlockName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Name of a storage volume hosting block journals and data objects
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct VolumeName(String);

impl VolumeName {
    /// Create a new volume name (validated)
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, NameError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self(name))
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the volume name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeName({:?})", self.0)
    }
}

impl AsRef<str> for VolumeName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors that can occur when validating a block or volume name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name must not be empty")]
    Empty,
    #[error("name must be at most {MAX_NAME_LEN} characters")]
    TooLong,
    #[error("name must not start with '.'")]
    LeadingDot,
    #[error("name contains invalid character: {0:?}")]
    InvalidChar(char),
}

fn validate_name(name: &str) -> std::result::Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong);
    }
    if name.starts_with('.') {
        return Err(NameError::LeadingDot);
    }
    if let Some(c) = name
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.'))
    {
        return Err(NameError::InvalidChar(c));
    }
    Ok(())
}

/// Split a `<volume>/<block>` argument
pub fn parse_volume_block(arg: &str) -> Result<(VolumeName, BlockName)> {
    let (volume, block) = arg.split_once('/').ok_or_else(|| {
        Error::invalid_argument(format!("expected <volume>/<block>, got '{arg}'"))
    })?;
    Ok((VolumeName::new(volume)?, BlockName::new(block)?))
}

/// Parse a comma separated host list, dropping blanks and duplicates
///
/// Order of first appearance is preserved since the first `mpath` hosts are
/// the ones configured before any spare.
#[must_use]
pub fn parse_host_list(hosts: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for host in hosts.split(',').map(str::trim).filter(|h| !h.is_empty()) {
        if !out.iter().any(|h| h == host) {
            out.push(host.to_string());
        }
    }
    out
}

/// Parse a human readable size such as `10GiB`, `512`, `1.5 t` or `4k`
///
/// The result is rounded down to `align` (or [`DEFAULT_SECTOR_SIZE`] when
/// `align` is zero) and must be at least one alignment unit.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn parse_size(value: &str, align: u64) -> Result<u64> {
    let align = if align == 0 { DEFAULT_SECTOR_SIZE } else { align };
    let value = value.trim();

    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (number, rest) = value.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| Error::InvalidSize(format!("'{value}' is not a number")))?;
    if number <= 0.0 {
        return Err(Error::InvalidSize(
            "size cannot be negative number or zero".to_string(),
        ));
    }

    let rest = rest.strip_prefix(' ').unwrap_or(rest);
    let mut chars = rest.chars();
    let unit = chars.next().map(|c| c.to_ascii_lowercase());
    let power: i32 = match unit {
        None | Some('b') => 0,
        Some('k') => 1,
        Some('m') => 2,
        Some('g') => 3,
        Some('t') => 4,
        Some('p') => 5,
        Some('e') => 6,
        Some(_) => return Err(unknown_unit(value)),
    };
    let suffix = chars.as_str().to_ascii_lowercase();
    if !suffix.is_empty() && (unit == Some('b') || !"ib".starts_with(suffix.as_str())) {
        return Err(unknown_unit(value));
    }

    let bytes = number * 1024f64.powi(power);
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(Error::InvalidSize(format!("'{value}' is too large")));
    }
    let bytes = bytes.floor() as u64;

    if bytes < align {
        return Err(Error::InvalidSize(format!(
            "minimum acceptable block size is {align} bytes"
        )));
    }
    Ok(bytes - bytes % align)
}

fn unknown_unit(value: &str) -> Error {
    Error::InvalidSize(format!(
        "unknown size unit in '{value}', use b/B, k/K(iB), m/M(iB), g/G(iB), t/T(iB), p/P(iB) or e/E(iB)"
    ))
}

/// Format a byte count as `<value> <unit>` with one decimal, e.g. `1.5 GiB`
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
    let mut value = bytes;
    let mut rem = 0;
    let mut unit = 0;
    while value >= 1024 && unit < UNITS.len() - 1 {
        rem = value % 1024;
        value /= 1024;
        unit += 1;
    }
    let shown = value as f64 + rem as f64 / 1024.0;
    format!("{shown:.1} {}", UNITS[unit])
}
