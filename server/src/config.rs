//! Configuration loading, target filtering, and validation.
//!
//! The broker reads a single JSON document at startup:
//!
//! ```json
//! {
//!   "group_by": ["environment", "region", "name"],
//!   "targets": [
//!     {
//!       "id": "prod-es-primary",
//!       "name": "Prod search (primary)",
//!       "driver_cmd": "python3 drivers/es-driver.py",
//!       "tags": { "environment": "prod", "region": "us", "name": "search", "variant": "primary" },
//!       "labels": { "team": "search" },
//!       "variables": { "index_prefix": "prod-" }
//!     }
//!   ],
//!   "variables": [
//!     { "when": { "environment": "prod" }, "then": { "readonly": true } }
//!   ]
//! }
//! ```
//!
//! Targets can be filtered at load time with a shell glob applied to each
//! target's composite group key (tag values under `group_by` joined with
//! [`crate::groups::KEY_SEPARATOR`]). An empty pattern or `*` loads everything.
//!
//! Configuration is immutable after load; there is no hot reload.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::groups::{composite_key, KEY_SEPARATOR};

/// Grouping dimensions used when the config omits `group_by`.
pub const DEFAULT_GROUP_BY: [&str; 3] = ["environment", "region", "name"];

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Ordered tag keys used to build composite group keys.
    #[serde(default)]
    pub group_by: Vec<String>,
    /// The targets to supervise.
    pub targets: Vec<TargetConfig>,
    /// Ordered variable rules applied on top of each target's own variables.
    #[serde(default)]
    pub variables: Vec<VariableRule>,
}

/// A single target system. Immutable after load.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetConfig {
    /// Globally unique, stable identifier.
    pub id: String,
    /// Human-readable display name.
    #[serde(default)]
    pub name: String,
    /// Tag keys drive grouping and variable rules.
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Free-form labels for UI filters; opaque to the broker.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Shell command that starts the driver process.
    pub driver_cmd: String,
    /// Presentation hints for the UI; opaque to the broker.
    #[serde(default)]
    pub visual: HashMap<String, String>,
    /// Baseline variables, overlaid by matching [`VariableRule`]s.
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// A conditional variable assignment: if every `when` entry equals the
/// target's tag of the same key, `then` is merged into the resolved variables.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariableRule {
    #[serde(default)]
    pub when: HashMap<String, String>,
    #[serde(default)]
    pub then: Map<String, Value>,
}

/// Errors produced while loading or validating configuration. All of them are
/// fatal at startup.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    Read { path: String, source: std::io::Error },
    /// The config file is not valid JSON (or has the wrong shape).
    Parse {
        path: String,
        source: serde_json::Error,
    },
    /// A target is missing the required `id` field.
    MissingId,
    /// Two targets share the same id.
    DuplicateId { id: String },
    /// A target is missing the required `driver_cmd` field.
    MissingDriverCmd { id: String },
    /// A tag value contains the reserved composite-key separator.
    SeparatorInTag { id: String, key: String },
    /// The target filter pattern is not a valid glob.
    BadPattern {
        pattern: String,
        source: glob::PatternError,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config file {path}: {source}")
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config file {path}: {source}")
            }
            ConfigError::MissingId => write!(f, "target missing required 'id' field"),
            ConfigError::DuplicateId { id } => {
                write!(f, "duplicate target ID {id:?} detected - IDs must be unique")
            }
            ConfigError::MissingDriverCmd { id } => {
                write!(f, "target {id:?} missing required 'driver_cmd'")
            }
            ConfigError::SeparatorInTag { id, key } => write!(
                f,
                "target {id:?} tag {key:?} contains reserved separator {KEY_SEPARATOR:?}"
            ),
            ConfigError::BadPattern { pattern, source } => {
                write!(f, "invalid target pattern {pattern:?}: {source}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load a config file without filtering.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_with_pattern(path, "")
    }

    /// Load a config file, keeping only targets whose composite group key
    /// matches `pattern` (shell glob: `*`, `?`, `[set]`).
    pub fn load_with_pattern(path: impl AsRef<Path>, pattern: &str) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Config =
            serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        if config.group_by.is_empty() {
            config.group_by = DEFAULT_GROUP_BY.iter().map(ToString::to_string).collect();
        }

        if !pattern.is_empty() && pattern != "*" {
            config.targets = filter_targets(config.targets, pattern, &config.group_by)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the rest of the broker relies on: non-empty unique
    /// ids, a driver command per target, and no reserved separator in tag
    /// values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for target in &self.targets {
            if target.id.is_empty() {
                return Err(ConfigError::MissingId);
            }
            if !seen.insert(&target.id) {
                return Err(ConfigError::DuplicateId {
                    id: target.id.clone(),
                });
            }
            if target.driver_cmd.is_empty() {
                return Err(ConfigError::MissingDriverCmd {
                    id: target.id.clone(),
                });
            }
            for (key, value) in &target.tags {
                if value.contains(KEY_SEPARATOR) {
                    return Err(ConfigError::SeparatorInTag {
                        id: target.id.clone(),
                        key: key.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Keep targets whose composite key matches the glob pattern.
fn filter_targets(
    targets: Vec<TargetConfig>,
    pattern: &str,
    group_by: &[String],
) -> Result<Vec<TargetConfig>, ConfigError> {
    let matcher = glob::Pattern::new(pattern).map_err(|source| ConfigError::BadPattern {
        pattern: pattern.to_string(),
        source,
    })?;
    Ok(targets
        .into_iter()
        .filter(|t| matcher.matches(&composite_key(&t.tags, group_by)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_minimal_config_with_default_group_by() {
        let file =
            write_config(r#"{"targets": [{"id": "t1", "driver_cmd": "python3 driver.py"}]}"#);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.group_by, vec!["environment", "region", "name"]);
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.targets[0].id, "t1");
        assert!(config.variables.is_empty());
    }

    #[test]
    fn rejects_missing_id() {
        let file = write_config(r#"{"targets": [{"id": "", "driver_cmd": "x"}]}"#);
        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("'id'"), "{err}");
    }

    #[test]
    fn rejects_duplicate_ids() {
        let file = write_config(
            r#"{"targets": [
                {"id": "t1", "driver_cmd": "a"},
                {"id": "t1", "driver_cmd": "b"}
            ]}"#,
        );
        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate"), "{err}");
    }

    #[test]
    fn rejects_missing_driver_cmd() {
        let file = write_config(r#"{"targets": [{"id": "t1", "driver_cmd": ""}]}"#);
        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("driver_cmd"), "{err}");
    }

    #[test]
    fn rejects_separator_in_tag_value() {
        let file = write_config(
            r#"{"targets": [
                {"id": "t1", "driver_cmd": "x", "tags": {"environment": "pro|d"}}
            ]}"#,
        );
        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("separator"), "{err}");
    }

    #[test]
    fn rejects_malformed_json() {
        let file = write_config("{not json");
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    fn two_env_config() -> tempfile::NamedTempFile {
        write_config(
            r#"{
                "group_by": ["environment", "region", "name"],
                "targets": [
                    {"id": "s1", "driver_cmd": "x",
                     "tags": {"environment": "staging", "region": "sg", "name": "app"}},
                    {"id": "p1", "driver_cmd": "x",
                     "tags": {"environment": "prod", "region": "us", "name": "app"}}
                ]
            }"#,
        )
    }

    #[test]
    fn glob_pattern_filters_by_composite_key() {
        let file = two_env_config();
        let config = Config::load_with_pattern(file.path(), "staging*").unwrap();
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.targets[0].id, "s1");
    }

    #[test]
    fn star_pattern_loads_everything() {
        let file = two_env_config();
        let config = Config::load_with_pattern(file.path(), "*").unwrap();
        assert_eq!(config.targets.len(), 2);
    }

    #[test]
    fn missing_tags_match_as_unknown() {
        let file = write_config(r#"{"targets": [{"id": "t1", "driver_cmd": "x"}]}"#);
        let config = Config::load_with_pattern(file.path(), "unknown|unknown|unknown").unwrap();
        assert_eq!(config.targets.len(), 1);
    }

    #[test]
    fn rejects_bad_pattern() {
        let file = two_env_config();
        let err = Config::load_with_pattern(file.path(), "[").unwrap_err();
        assert!(matches!(err, ConfigError::BadPattern { .. }));
    }
}
