//! Engine configuration.
//!
//! Loaded from YAML. Every field has a default, so an empty file (or no file)
//! yields the stock BrandenBed setup:
//!
//! ```yaml
//! categories:
//!   maintenance: { sla_hours: 24, default_priority: high }
//!   emergency:   { sla_hours: 4,  default_priority: emergency }
//! prefixes:
//!   ticket: BB
//!   lead: LD
//! create_retry_limit: 3
//! due_soon_hours: 48
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{CaseError, Result};
use crate::identifier::validate_prefix;
use crate::types::{CaseType, Priority};

/// Environment variable naming the YAML file to load.
pub const CONFIG_PATH_ENV: &str = "BRANDENBED_CONFIG";

/// Allowed SLA range in hours (one hour to one week).
pub const SLA_HOURS_RANGE: std::ops::RangeInclusive<u32> = 1..=168;

/// Support category settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub sla_hours: u32,
    #[serde(default)]
    pub default_priority: Priority,
    #[serde(default)]
    pub description: String,
}

impl CategoryConfig {
    fn new(sla_hours: u32, default_priority: Priority, description: &str) -> Self {
        Self {
            sla_hours,
            default_priority,
            description: description.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub categories: BTreeMap<String, CategoryConfig>,
    /// Reference prefix per case type. Missing types use the built-in prefix.
    pub prefixes: BTreeMap<CaseType, String>,
    /// Attempts at issuing a fresh reference when an insert collides.
    pub create_retry_limit: u32,
    /// Default look-ahead for `list_due_soon`.
    pub due_soon_hours: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let categories = [
            ("maintenance", 24, Priority::High, "Maintenance & Repairs"),
            ("housekeeping", 24, Priority::Medium, "Housekeeping"),
            ("amenities", 24, Priority::Medium, "Amenities (WiFi, Power, etc.)"),
            ("access_security", 8, Priority::High, "Access & Security"),
            ("billing", 24, Priority::Medium, "Billing & Payments"),
            ("room_issues", 24, Priority::Medium, "Room Issues"),
            ("neighbor_complaints", 24, Priority::Medium, "Neighbor Complaints"),
            ("contract", 24, Priority::Medium, "Contract & Legal"),
            ("move_in_out", 24, Priority::Medium, "Move In/Out"),
            ("general_inquiry", 48, Priority::Low, "General Inquiry"),
            ("emergency", 4, Priority::Emergency, "Emergency"),
            ("other", 24, Priority::Medium, "Other"),
        ]
        .into_iter()
        .map(|(name, hours, priority, description)| {
            (name.to_string(), CategoryConfig::new(hours, priority, description))
        })
        .collect();

        let prefixes = CaseType::ALL
            .into_iter()
            .map(|t| (t, default_prefix(t).to_string()))
            .collect();

        Self {
            categories,
            prefixes,
            create_retry_limit: 3,
            due_soon_hours: 48,
        }
    }
}

/// Built-in reference prefix for a case type.
pub fn default_prefix(case_type: CaseType) -> &'static str {
    match case_type {
        CaseType::Lead => "LD",
        CaseType::Ticket => "BB",
        CaseType::Contract => "CON",
        CaseType::Maintenance => "MAINT",
        CaseType::Housekeeping => "HK",
    }
}

impl EngineConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| CaseError::Config(format!("{}: {e}", path.display())))?;
        let config = Self::from_yaml_str(&yaml)?;
        tracing::debug!(
            path = %path.display(),
            categories = config.categories.len(),
            "Loaded engine config"
        );
        Ok(config)
    }

    /// Load from `$BRANDENBED_CONFIG` when set, defaults otherwise.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, category) in &self.categories {
            if !SLA_HOURS_RANGE.contains(&category.sla_hours) {
                return Err(CaseError::Config(format!(
                    "category '{name}': sla_hours {} outside 1..=168",
                    category.sla_hours
                )));
            }
        }

        let mut seen = HashSet::new();
        for case_type in CaseType::ALL {
            let prefix = self.prefix(case_type);
            validate_prefix(prefix)
                .map_err(|e| CaseError::Config(format!("{case_type} prefix: {e}")))?;
            if !seen.insert(prefix) {
                return Err(CaseError::Config(format!(
                    "prefix '{prefix}' is used by more than one case type"
                )));
            }
        }

        if self.create_retry_limit == 0 {
            return Err(CaseError::Config("create_retry_limit must be at least 1".into()));
        }
        if self.due_soon_hours == 0 {
            return Err(CaseError::Config("due_soon_hours must be at least 1".into()));
        }
        Ok(())
    }

    pub fn category(&self, name: &str) -> Result<&CategoryConfig> {
        self.categories
            .get(name)
            .ok_or_else(|| CaseError::validation("category", format!("unknown category '{name}'")))
    }

    pub fn prefix(&self, case_type: CaseType) -> &str {
        self.prefixes
            .get(&case_type)
            .map(String::as_str)
            .unwrap_or_else(|| default_prefix(case_type))
    }

    pub fn due_soon_window(&self) -> Duration {
        Duration::hours(i64::from(self.due_soon_hours))
    }
}
