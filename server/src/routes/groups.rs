//! Grouped target view for the notebook UI.

use std::collections::HashMap;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::groups::{aggregate, Group};
use crate::target::state::{TargetSnapshot, TargetStatus};

/// A target as it appears inside a group slot. Connection details are limited
/// to what the UI needs; the driver's control plane stays internal.
#[derive(Serialize)]
pub struct GroupTargetInfo {
    id: String,
    status: TargetStatus,
    #[serde(skip_serializing_if = "String::is_empty")]
    local_url: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    error: String,
}

impl From<TargetSnapshot> for GroupTargetInfo {
    fn from(snapshot: TargetSnapshot) -> Self {
        GroupTargetInfo {
            id: snapshot.config.id,
            status: snapshot.status,
            local_url: snapshot.connection.target_url,
            headers: snapshot.connection.headers,
            error: snapshot.error,
        }
    }
}

/// One group: the composite key, its dimension values, and the variant slots.
#[derive(Serialize)]
pub struct GroupInfo {
    key: String,
    values: HashMap<String, String>,
    targets: HashMap<String, GroupTargetInfo>,
}

impl From<Group> for GroupInfo {
    fn from(group: Group) -> Self {
        GroupInfo {
            key: group.key,
            values: group.values,
            targets: group
                .targets
                .into_iter()
                .map(|(variant, snapshot)| (variant, GroupTargetInfo::from(snapshot)))
                .collect(),
        }
    }
}

/// `GET /api/groups` — targets partitioned by the configured dimensions,
/// recomputed from live snapshots on every call.
pub async fn list_groups(State(state): State<AppState>) -> Json<Vec<GroupInfo>> {
    let snapshots = state.manager.snapshots().await;
    let groups = aggregate(snapshots, state.manager.group_by());
    Json(groups.into_iter().map(GroupInfo::from).collect())
}
