// Record types - wire shapes for entity data and mutation outcomes

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fields the server owns; clients send them back unchanged and the
/// server strips or rewrites them on save.
pub const SERVER_MANAGED_FIELDS: &[&str] = &[
    "uid",
    "real_type",
    "is_deleted",
    "deleted_and_has_dependent_nodes",
    "is_merged_item",
    "merged_items",
    "createdBy",
    "createdWhen",
    "modifiedBy",
    "modifiedWhen",
];

/// Where a record stands in the two-step deletion protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionState {
    Active,
    /// Deletion requested but other entities still point here.
    PendingWithDependents,
    /// Deletion requested and nothing depends on it any more.
    PendingSafe,
}

impl DeletionState {
    pub fn of(is_deleted: bool, has_dependents: bool) -> Self {
        match (is_deleted, has_dependents) {
            (false, _) => DeletionState::Active,
            (true, true) => DeletionState::PendingWithDependents,
            (true, false) => DeletionState::PendingSafe,
        }
    }

    pub fn is_pending(&self) -> bool {
        !matches!(self, DeletionState::Active)
    }
}

/// One row of a list response: enough to render a listing and to seed
/// relation autocomplete, never the full record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySummary {
    pub uid: String,
    #[serde(default)]
    pub label: String,
    pub real_type: String,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub deleted_and_has_dependent_nodes: bool,
    #[serde(default)]
    pub is_merged_item: bool,
    #[serde(default)]
    pub merged_items: Vec<EntitySummary>,
}

impl EntitySummary {
    pub fn deletion_state(&self) -> DeletionState {
        DeletionState::of(self.is_deleted, self.deleted_and_has_dependent_nodes)
    }
}

/// A linked entity as stored under a relation field, with any data
/// carried on the edge itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationTarget {
    pub uid: String,
    #[serde(default)]
    pub label: String,
    pub real_type: String,
    #[serde(rename = "relData", default)]
    pub rel_data: Map<String, Value>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub deleted_and_has_dependent_nodes: bool,
}

impl RelationTarget {
    pub fn from_summary(summary: &EntitySummary) -> Self {
        Self {
            uid: summary.uid.clone(),
            label: summary.label.clone(),
            real_type: summary.real_type.clone(),
            rel_data: Map::new(),
            is_deleted: summary.is_deleted,
            deleted_and_has_dependent_nodes: summary.deleted_and_has_dependent_nodes,
        }
    }
}

/// Incremental list response for `?lastRefreshedTimestamp=` requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeltaPayload {
    #[serde(default)]
    pub created_modified: Vec<EntitySummary>,
    #[serde(default)]
    pub deleted: Vec<DeletedRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedRef {
    pub uid: String,
}

/// Response to creating an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOutcome {
    pub uid: String,
    #[serde(default)]
    pub label: String,
    pub saved: bool,
}

/// Response to updating an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub uid: String,
    pub saved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteResult {
    /// Entity removed outright, leaving a tombstone.
    Success,
    /// Entity flagged for deletion while dependents remain.
    Pending,
    Fail,
}

/// Response to a delete or restore request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub result: DeleteResult,
    #[serde(default)]
    pub detail: String,
}

/// One candidate from an external import source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportHit {
    pub uri: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub label_extra: String,
    /// Set when the source record was already imported.
    #[serde(default)]
    pub already_in_db: bool,
}

/// Search page returned by an import endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportList {
    #[serde(default)]
    pub data: Vec<ImportHit>,
    #[serde(rename = "totalItems", default)]
    pub total_items: u64,
}

/// Entity minted by POSTing identifiers to an import endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportedEntity {
    pub uid: String,
    #[serde(default)]
    pub label: String,
    pub real_type: String,
}

/// A full record as fetched from a detail endpoint. Field values stay
/// dynamic; the schema decides how each one is interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityRecord(pub Map<String, Value>);

impl EntityRecord {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn set(&mut self, field: &str, value: Value) {
        self.0.insert(field.to_string(), value);
    }

    fn text(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    fn flag(&self, field: &str) -> bool {
        self.0.get(field).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn uid(&self) -> Option<&str> {
        self.text("uid")
    }

    pub fn label(&self) -> &str {
        self.text("label").unwrap_or("")
    }

    pub fn real_type(&self) -> Option<&str> {
        self.text("real_type")
    }

    pub fn is_deleted(&self) -> bool {
        self.flag("is_deleted")
    }

    pub fn has_dependent_nodes(&self) -> bool {
        self.flag("deleted_and_has_dependent_nodes")
    }

    pub fn deletion_state(&self) -> DeletionState {
        DeletionState::of(self.is_deleted(), self.has_dependent_nodes())
    }

    pub fn is_merged_item(&self) -> bool {
        self.flag("is_merged_item")
    }

    pub fn merged_items(&self) -> Vec<EntitySummary> {
        self.0
            .get("merged_items")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn created_by(&self) -> Option<&str> {
        self.text("createdBy")
    }

    pub fn created_when(&self) -> Option<&str> {
        self.text("createdWhen")
    }

    pub fn modified_by(&self) -> Option<&str> {
        self.text("modifiedBy")
    }

    pub fn modified_when(&self) -> Option<&str> {
        self.text("modifiedWhen")
    }

    /// Targets of a relation field; rows that do not parse are skipped.
    pub fn relation_targets(&self, field: &str) -> Vec<RelationTarget> {
        match self.0.get(field).and_then(Value::as_array) {
            Some(items) => items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deletion_state_mapping() {
        assert_eq!(DeletionState::of(false, false), DeletionState::Active);
        assert_eq!(DeletionState::of(false, true), DeletionState::Active);
        assert_eq!(
            DeletionState::of(true, true),
            DeletionState::PendingWithDependents
        );
        assert_eq!(DeletionState::of(true, false), DeletionState::PendingSafe);
    }

    #[test]
    fn test_summary_defaults_for_sparse_rows() {
        let summary: EntitySummary =
            serde_json::from_value(json!({"uid": "u1", "label": "Ada", "real_type": "person"}))
                .unwrap();
        assert!(!summary.is_deleted);
        assert!(!summary.is_merged_item);
        assert!(summary.merged_items.is_empty());
    }

    #[test]
    fn test_relation_target_reads_wire_rel_data_key() {
        let target: RelationTarget = serde_json::from_value(json!({
            "uid": "u1",
            "label": "Anne",
            "real_type": "person",
            "relData": {"certainty": "1"}
        }))
        .unwrap();
        assert_eq!(target.rel_data.get("certainty"), Some(&json!("1")));
        let out = serde_json::to_value(&target).unwrap();
        assert!(out.get("relData").is_some());
    }

    #[test]
    fn test_delete_result_parses_lowercase() {
        let outcome: DeleteOutcome = serde_json::from_value(json!({
            "result": "pending",
            "detail": "Marked Person 'Ada' as deletion desired"
        }))
        .unwrap();
        assert_eq!(outcome.result, DeleteResult::Pending);
    }

    #[test]
    fn test_record_accessors() {
        let record: EntityRecord = serde_json::from_value(json!({
            "uid": "u1",
            "label": "Ada",
            "real_type": "person",
            "is_deleted": true,
            "deleted_and_has_dependent_nodes": true,
            "createdBy": "mika",
            "parents": [
                {"uid": "p1", "label": "Anne", "real_type": "person", "relData": {}}
            ]
        }))
        .unwrap();
        assert_eq!(record.uid(), Some("u1"));
        assert_eq!(record.deletion_state(), DeletionState::PendingWithDependents);
        assert_eq!(record.created_by(), Some("mika"));
        assert_eq!(record.relation_targets("parents").len(), 1);
        assert!(record.relation_targets("label").is_empty());
    }

    #[test]
    fn test_delta_payload_tolerates_missing_sections() {
        let delta: DeltaPayload = serde_json::from_value(json!({
            "created_modified": [{"uid": "u1", "label": "Ada", "real_type": "person"}]
        }))
        .unwrap();
        assert_eq!(delta.created_modified.len(), 1);
        assert!(delta.deleted.is_empty());
    }
}
