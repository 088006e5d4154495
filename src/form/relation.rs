// Relation editing - linking targets and the data carried on edges

use regex::RegexBuilder;
use serde_json::{json, Map, Value};

use crate::error::{AppError, AppResult};
use crate::form::inputs;
use crate::records::EntitySummary;
use crate::schema::{Field, PropertyField, RelationField};

/// Edits one relation field's array of linked targets in place.
pub struct RelationEditor<'a> {
    name: &'a str,
    field: &'a RelationField,
}

impl<'a> RelationEditor<'a> {
    pub fn new(name: &'a str, field: &'a RelationField) -> Self {
        Self { name, field }
    }

    pub fn linked_count(&self, value: &Value) -> usize {
        value.as_array().map(Vec::len).unwrap_or(0)
    }

    /// A relation at its cardinality's capacity takes no more targets.
    pub fn can_add(&self, value: &Value) -> bool {
        !self.field.cardinality.at_capacity(self.linked_count(value))
    }

    /// Candidates matching `query` that are not already linked. The
    /// query runs as a case-insensitive pattern over labels, falling
    /// back to a plain substring match when it is not a valid pattern.
    pub fn filter_candidates(
        &self,
        value: &Value,
        query: &str,
        candidates: &'a [EntitySummary],
    ) -> Vec<&'a EntitySummary> {
        let linked: Vec<&str> = value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.get("uid").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default();

        let matcher = RegexBuilder::new(query).case_insensitive(true).build();
        candidates
            .iter()
            .filter(|c| !linked.contains(&c.uid.as_str()))
            .filter(|c| match &matcher {
                Ok(re) => re.is_match(&c.label),
                Err(_) => c.label.to_lowercase().contains(&query.to_lowercase()),
            })
            .collect()
    }

    /// Links an existing entity.
    pub fn add(&self, value: &mut Value, target: &EntitySummary) -> AppResult<()> {
        self.add_target(value, &target.uid, &target.label, &target.real_type)
    }

    /// Links an entity just created through an embedded form.
    pub fn add_created(
        &self,
        value: &mut Value,
        uid: &str,
        label: &str,
        real_type: &str,
    ) -> AppResult<()> {
        self.add_target(value, uid, label, real_type)
    }

    fn add_target(
        &self,
        value: &mut Value,
        uid: &str,
        label: &str,
        real_type: &str,
    ) -> AppResult<()> {
        if !self.can_add(value) {
            return Err(AppError::Validation(format!(
                "'{}' already holds as many targets as its cardinality allows",
                self.name
            )));
        }
        let items = items_mut(value);
        if items
            .iter()
            .any(|i| i.get("uid").and_then(Value::as_str) == Some(uid))
        {
            return Err(AppError::Validation(format!(
                "'{}' already links {}",
                self.name, uid
            )));
        }
        items.push(json!({
            "uid": uid,
            "label": label,
            "real_type": real_type,
            "relData": {},
        }));
        Ok(())
    }

    pub fn remove(&self, value: &mut Value, uid: &str) -> AppResult<()> {
        let items = items_mut(value);
        let before = items.len();
        items.retain(|i| i.get("uid").and_then(Value::as_str) != Some(uid));
        if items.len() == before {
            return Err(AppError::Validation(format!(
                "'{}' does not link {}",
                self.name, uid
            )));
        }
        Ok(())
    }

    /// Sets a property stored on the edge to one linked target,
    /// masked by the edge field's property type.
    pub fn set_edge_value(
        &self,
        value: &mut Value,
        uid: &str,
        edge_field: &str,
        raw: &str,
    ) -> AppResult<()> {
        let property = self.edge_property(edge_field)?;
        let items = items_mut(value);
        let item = items
            .iter_mut()
            .find(|i| i.get("uid").and_then(Value::as_str) == Some(uid))
            .ok_or_else(|| {
                AppError::Validation(format!("'{}' does not link {}", self.name, uid))
            })?;

        let current = edge_value(item, edge_field, property);
        let next = inputs::apply_input(&property.property_type, &current, raw);
        let object = item.as_object_mut().ok_or_else(|| {
            AppError::Validation(format!("'{}' holds a malformed target", self.name))
        })?;
        match object.get_mut("relData").and_then(Value::as_object_mut) {
            Some(rel_data) => {
                rel_data.insert(edge_field.to_string(), next);
            }
            None => {
                let mut rel_data = Map::new();
                rel_data.insert(edge_field.to_string(), next);
                object.insert("relData".to_string(), Value::Object(rel_data));
            }
        }
        Ok(())
    }

    fn edge_property(&self, edge_field: &str) -> AppResult<&PropertyField> {
        match self.field.relation_fields.get(edge_field) {
            Some(Field::Property(property)) => Ok(property),
            Some(Field::Relation(_)) => Err(AppError::SchemaError(format!(
                "edge field '{}' of '{}' is not a property",
                edge_field, self.name
            ))),
            None => Err(AppError::SchemaError(format!(
                "'{}' has no edge field named '{}'",
                self.name, edge_field
            ))),
        }
    }
}

/// The value shown for an edge field: stored data first, the field's
/// default second, empty last.
pub fn edge_value(item: &Value, edge_field: &str, property: &PropertyField) -> Value {
    if let Some(stored) = item
        .get("relData")
        .and_then(|d| d.get(edge_field))
        .filter(|v| !v.is_null())
    {
        return stored.clone();
    }
    property
        .default_value
        .clone()
        .filter(|v| !v.is_null())
        .unwrap_or_else(|| Value::String(String::new()))
}

fn items_mut(value: &mut Value) -> &mut Vec<Value> {
    if !value.is_array() {
        *value = Value::Array(Vec::new());
    }
    match value.as_array_mut() {
        Some(items) => items,
        // Unreachable after the reset above.
        None => unreachable!(),
    }
}
