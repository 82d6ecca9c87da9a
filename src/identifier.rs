//! Human-readable case references.
//!
//! Format: `<PREFIX><YYYY><MM><NNNN>`, e.g. `BB2025060001`. The four-digit
//! sequence restarts every month per prefix and is issued by the store's
//! atomic counter, never by scanning for the highest existing reference.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CaseError, Result};

/// Largest sequence number that fits the four-digit suffix.
pub const MAX_SEQUENCE: u32 = 9_999;

static REFERENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z]{2,5})(\d{4})(\d{2})(\d{4})$").expect("reference pattern is valid")
});

static PREFIX_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{2,5}$").expect("prefix pattern is valid"));

/// Check that a configured prefix is 2-5 upper-case ASCII letters.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    if PREFIX_PATTERN.is_match(prefix) {
        Ok(())
    } else {
        Err(CaseError::validation(
            "prefix",
            format!("'{prefix}' must be 2-5 upper-case letters"),
        ))
    }
}

/// Counter key: one sequence per prefix and calendar month.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceKey {
    pub prefix: String,
    pub year: i32,
    pub month: u32,
}

impl SequenceKey {
    pub fn new(prefix: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            prefix: prefix.into(),
            year: at.year(),
            month: at.month(),
        }
    }

    /// `YYYYMM` part of every reference issued under this key.
    pub fn period(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix, self.period())
    }
}

/// Validated case reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CaseReference(String);

impl CaseReference {
    pub fn parse(value: &str) -> Result<Self> {
        let caps = REFERENCE_PATTERN.captures(value).ok_or_else(|| {
            CaseError::validation("reference", format!("'{value}' is not a case reference"))
        })?;
        let month: u32 = caps[3].parse().unwrap_or(0);
        if !(1..=12).contains(&month) {
            return Err(CaseError::validation(
                "reference",
                format!("'{value}' has month {month}"),
            ));
        }
        if &caps[4] == "0000" {
            return Err(CaseError::validation(
                "reference",
                format!("'{value}' has sequence 0000"),
            ));
        }
        Ok(Self(value.to_string()))
    }

    /// Build the reference for sequence number `sequence` under `key`.
    pub fn compose(key: &SequenceKey, sequence: u32) -> Result<Self> {
        if sequence == 0 || sequence > MAX_SEQUENCE {
            return Err(CaseError::SequenceExhausted {
                prefix: key.prefix.clone(),
                period: key.period(),
            });
        }
        validate_prefix(&key.prefix)?;
        Ok(Self(format!("{key}{sequence:04}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn prefix(&self) -> &str {
        &self.0[..self.0.len() - 10]
    }

    pub fn sequence(&self) -> u32 {
        self.0[self.0.len() - 4..].parse().unwrap_or(0)
    }

    pub fn sequence_key(&self) -> SequenceKey {
        let len = self.0.len();
        SequenceKey {
            prefix: self.prefix().to_string(),
            year: self.0[len - 10..len - 6].parse().unwrap_or(0),
            month: self.0[len - 6..len - 4].parse().unwrap_or(0),
        }
    }
}

impl fmt::Display for CaseReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CaseReference {
    type Error = CaseError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<CaseReference> for String {
    fn from(reference: CaseReference) -> Self {
        reference.0
    }
}

impl std::str::FromStr for CaseReference {
    type Err = CaseError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
