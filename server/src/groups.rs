//! Composite group keys and target grouping.
//!
//! Targets are grouped by the values of the configured `group_by` tag
//! dimensions. The composite key is those values joined with
//! [`KEY_SEPARATOR`]; config validation rejects tag values containing the
//! separator, so [`parse_composite_key`] always inverts
//! [`format_composite_key`]. Within a group, the `variant` tag names the slot
//! (`primary`, `replica`, ...).
//!
//! Everything here is pure and operates on [`TargetSnapshot`] value copies.

use std::collections::HashMap;

use crate::target::state::TargetSnapshot;

/// Reserved separator between composite-key parts.
pub const KEY_SEPARATOR: char = '|';

/// Value substituted for a tag a target does not carry.
pub const UNKNOWN_TAG_VALUE: &str = "unknown";

/// Tag naming the slot of a target inside its group.
pub const VARIANT_TAG: &str = "variant";

/// Slot used when a target has no `variant` tag.
pub const DEFAULT_VARIANT: &str = "default";

/// A set of targets sharing the same values across the `group_by` dimensions,
/// indexed by variant. Recomputed per request; never stored.
#[derive(Debug, Clone)]
pub struct Group {
    /// Composite key, e.g. `prod|us|db`.
    pub key: String,
    /// Dimension name to tag value, e.g. `{environment: prod, region: us}`.
    pub values: HashMap<String, String>,
    /// Variant to target snapshot.
    pub targets: HashMap<String, TargetSnapshot>,
}

/// Look up a tag, falling back to `default` when absent.
pub fn tag_or<'a>(tags: &'a HashMap<String, String>, key: &str, default: &'a str) -> &'a str {
    tags.get(key).map_or(default, String::as_str)
}

/// Join key parts with [`KEY_SEPARATOR`].
pub fn format_composite_key<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut key = String::new();
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(part.as_ref());
    }
    key
}

/// Split a composite key back into its parts.
pub fn parse_composite_key(key: &str) -> Vec<String> {
    key.split(KEY_SEPARATOR).map(ToString::to_string).collect()
}

/// Build the composite key for a tag set under the given dimensions. Missing
/// tags contribute [`UNKNOWN_TAG_VALUE`].
pub fn composite_key(tags: &HashMap<String, String>, group_by: &[String]) -> String {
    format_composite_key(
        group_by
            .iter()
            .map(|dim| tag_or(tags, dim, UNKNOWN_TAG_VALUE)),
    )
}

/// Partition target snapshots into groups keyed by their composite key.
///
/// Every target lands in exactly one group; a target whose variant collides
/// with an earlier one in the same group replaces it. Output is sorted by key
/// so responses are stable across calls.
pub fn aggregate(snapshots: Vec<TargetSnapshot>, group_by: &[String]) -> Vec<Group> {
    let mut groups: HashMap<String, Group> = HashMap::new();

    for snapshot in snapshots {
        let tags = &snapshot.config.tags;
        let key = composite_key(tags, group_by);
        let variant = tag_or(tags, VARIANT_TAG, DEFAULT_VARIANT).to_string();

        let group = groups.entry(key.clone()).or_insert_with(|| {
            let values = group_by
                .iter()
                .map(|dim| {
                    (
                        dim.clone(),
                        tag_or(tags, dim, UNKNOWN_TAG_VALUE).to_string(),
                    )
                })
                .collect();
            Group {
                key,
                values,
                targets: HashMap::new(),
            }
        });
        group.targets.insert(variant, snapshot);
    }

    let mut list: Vec<Group> = groups.into_values().collect();
    list.sort_by(|a, b| a.key.cmp(&b.key));
    list
}
