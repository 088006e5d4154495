// Inline relations - polymorphic nested objects edited in place

use std::collections::HashSet;

use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::schema::{RelationField, Schema};

/// Bounds recursive rendering of inline objects. Each descent burns
/// one level of depth and marks the type visited; a type seen twice
/// on one path, or a path past the depth limit, renders collapsed
/// instead of recursing forever.
#[derive(Debug, Clone)]
pub struct RenderBudget {
    remaining_depth: usize,
    visited: HashSet<String>,
}

impl RenderBudget {
    pub fn new(max_depth: usize) -> Self {
        Self {
            remaining_depth: max_depth,
            visited: HashSet::new(),
        }
    }

    /// The budget for rendering inside an inline object of
    /// `entity_type`, or `None` when rendering must stop here.
    pub fn descend(&self, entity_type: &str) -> Option<RenderBudget> {
        let key = entity_type.to_lowercase();
        if self.remaining_depth == 0 || self.visited.contains(&key) {
            return None;
        }
        let mut next = self.clone();
        next.remaining_depth -= 1;
        next.visited.insert(key);
        Some(next)
    }
}

/// The subtype currently chosen for an inline value, if any.
pub fn selected_type(value: &Value) -> Option<&str> {
    value
        .get("type")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
}

/// Switches an inline value to another concrete subtype. Picking the
/// current subtype again keeps the entered values; picking a
/// different one resets the object, since its fields do not carry
/// over.
pub fn switch_type(
    schema: &Schema,
    relation: &RelationField,
    value: &mut Value,
    new_type: &str,
) -> AppResult<()> {
    let options = schema.inline_subtype_options(&relation.relation_to)?;
    let key = new_type.to_lowercase();
    if !options.contains(&key) {
        return Err(AppError::Validation(format!(
            "'{}' is not one of: {}",
            new_type,
            options.join(", ")
        )));
    }

    if selected_type(value) == Some(key.as_str()) {
        return Ok(());
    }
    *value = json!({ "type": key });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        serde_json::from_value(json!({
            "birth": {
                "app": "core",
                "fields": {
                    "date": {
                        "type": "property",
                        "property_type": "DateProperty"
                    }
                },
                "meta": { "inline_only": true },
                "subclasses_list": ["BirthApproximate"],
                "json_schema": {}
            },
            "birthapproximate": {
                "app": "core",
                "fields": {
                    "date": {
                        "type": "property",
                        "property_type": "DateProperty"
                    },
                    "precision": {
                        "type": "property",
                        "property_type": "StringProperty"
                    }
                },
                "meta": { "inline_only": true },
                "json_schema": {}
            }
        }))
        .unwrap()
    }

    fn birth_relation() -> RelationField {
        serde_json::from_value(json!({
            "relation_type": "HAS_BIRTH_EVENT",
            "relation_to": "Birth",
            "cardinality": "ZeroOrOne",
            "inline_relation": true
        }))
        .unwrap()
    }

    #[test]
    fn test_switch_to_other_subtype_resets_values() {
        let schema = sample_schema();
        let relation = birth_relation();
        let mut value = json!({"type": "birth", "date": "1815-12-10"});

        switch_type(&schema, &relation, &mut value, "birthapproximate").unwrap();
        assert_eq!(value, json!({"type": "birthapproximate"}));
    }

    #[test]
    fn test_switch_to_same_subtype_keeps_values() {
        let schema = sample_schema();
        let relation = birth_relation();
        let mut value = json!({"type": "birth", "date": "1815-12-10"});

        switch_type(&schema, &relation, &mut value, "Birth").unwrap();
        assert_eq!(value["date"], json!("1815-12-10"));
    }

    #[test]
    fn test_switch_rejects_type_outside_hierarchy() {
        let schema = sample_schema();
        let relation = birth_relation();
        let mut value = json!({"type": ""});
        assert!(switch_type(&schema, &relation, &mut value, "person").is_err());
    }

    #[test]
    fn test_selected_type_ignores_blank_selection() {
        assert_eq!(selected_type(&json!({"type": ""})), None);
        assert_eq!(selected_type(&json!({"type": "birth"})), Some("birth"));
        assert_eq!(selected_type(&json!([])), None);
    }

    #[test]
    fn test_budget_stops_on_depth_and_revisit() {
        let budget = RenderBudget::new(2);
        let first = budget.descend("birth").unwrap();
        // The same type on one path renders collapsed.
        assert!(first.descend("birth").is_none());
        let second = first.descend("birthapproximate").unwrap();
        assert!(second.descend("death").is_none());
    }
}
