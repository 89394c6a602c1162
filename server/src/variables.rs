//! Tag-driven variable resolution.
//!
//! A target's effective variables are its own `variables` map overlaid by
//! every [`VariableRule`] whose `when` clause matches the target's tags.
//! Rules apply in declared order and later matches win, so generic defaults
//! can be declared first and narrower overrides after.

use serde_json::{Map, Value};

use crate::config::{TargetConfig, VariableRule};

/// Resolve the effective variables for a target.
///
/// Pure: inputs are not mutated and no I/O happens. A rule matches when every
/// key in `when` is present in the target's tags with exactly the given value;
/// an empty `when` matches every target.
pub fn resolve(config: &TargetConfig, rules: &[VariableRule]) -> Map<String, Value> {
    let mut result = config.variables.clone();
    for rule in rules {
        let matches = rule
            .when
            .iter()
            .all(|(key, value)| config.tags.get(key) == Some(value));
        if matches {
            for (key, value) in &rule.then {
                result.insert(key.clone(), value.clone());
            }
        }
    }
    result
}
