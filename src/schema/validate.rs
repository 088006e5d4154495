// Form validation - JSON Schema subset plus descriptor-driven checks

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::AppResult;
use crate::schema::{Field, Schema};

/// Inline objects nest inline objects; validation stops descending here.
const MAX_INLINE_DEPTH: usize = 8;

/// One violation, addressed by a `#/field/...` instance location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub instance_location: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(location: &str, message: impl Into<String>) -> Self {
        Self {
            instance_location: location.to_string(),
            message: message.into(),
        }
    }
}

/// All violations found in one validation pass.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    /// Issues grouped by the first path segment of their location.
    /// Issues addressing the record root carry no field segment and
    /// are dropped from the grouping.
    pub fn by_field(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for issue in &self.issues {
            let mut parts = issue.instance_location.split('/');
            parts.next();
            match parts.next() {
                Some(field) if !field.is_empty() => {
                    grouped
                        .entry(field.to_string())
                        .or_default()
                        .push(issue.message.clone());
                }
                _ => {}
            }
        }
        grouped
    }
}

/// Validates `data` for `entity_type`: the server-derived JSON Schema
/// subset first, then checks the schema cannot express, such as
/// relation cardinality bounds and inline subtype selection.
pub fn validate_record(schema: &Schema, entity_type: &str, data: &Value) -> AppResult<ValidationReport> {
    let desc = schema.descriptor(entity_type)?;
    let mut report = ValidationReport::default();
    if desc.json_schema.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
        check_json_schema(&desc.json_schema, data, "#", &mut report.issues);
    }
    check_descriptor(schema, entity_type, data, "#", MAX_INLINE_DEPTH, &mut report.issues)?;
    Ok(report)
}

/// Evaluates the keyword subset the server actually emits: `type`,
/// `properties`, `required`, `minLength`, `minItems` and `items`.
pub fn check_json_schema(
    node: &Value,
    data: &Value,
    location: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(keywords) = node.as_object() else {
        return;
    };

    if let Some(expected) = keywords.get("type").and_then(Value::as_str) {
        if !type_matches(expected, data) {
            issues.push(ValidationIssue::new(
                location,
                format!("Expected a value of type {}", expected),
            ));
        }
    }

    if let Some(required) = keywords.get("required").and_then(Value::as_array) {
        if let Some(object) = data.as_object() {
            for name in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(name) {
                    issues.push(ValidationIssue::new(
                        &format!("{}/{}", location, name),
                        "Value is required",
                    ));
                }
            }
        }
    }

    if let Some(min) = keywords.get("minLength").and_then(Value::as_u64) {
        if let Some(text) = data.as_str() {
            if (text.chars().count() as u64) < min {
                issues.push(ValidationIssue::new(
                    location,
                    format!("Must be at least {} characters long", min),
                ));
            }
        }
    }

    if let Some(min) = keywords.get("minItems").and_then(Value::as_u64) {
        if let Some(items) = data.as_array() {
            if (items.len() as u64) < min {
                issues.push(ValidationIssue::new(
                    location,
                    format!("Must have at least {} entries", min),
                ));
            }
        }
    }

    if let Some(item_schema) = keywords.get("items") {
        if let Some(items) = data.as_array() {
            for (idx, item) in items.iter().enumerate() {
                check_json_schema(item_schema, item, &format!("{}/{}", location, idx), issues);
            }
        }
    }

    if let Some(properties) = keywords.get("properties").and_then(Value::as_object) {
        if let Some(object) = data.as_object() {
            for (name, child_schema) in properties {
                if let Some(child) = object.get(name) {
                    check_json_schema(child_schema, child, &format!("{}/{}", location, name), issues);
                }
            }
        }
    }
}

fn type_matches(expected: &str, data: &Value) -> bool {
    match expected {
        "string" => data.is_string(),
        "number" => data.is_number(),
        "integer" => data.is_i64() || data.is_u64(),
        "boolean" => data.is_boolean(),
        "array" => data.is_array(),
        "object" => data.is_object(),
        "null" => data.is_null(),
        _ => true,
    }
}

fn check_descriptor(
    schema: &Schema,
    entity_type: &str,
    data: &Value,
    location: &str,
    depth: usize,
    issues: &mut Vec<ValidationIssue>,
) -> AppResult<()> {
    let desc = schema.descriptor(entity_type)?;
    let Some(object) = data.as_object() else {
        issues.push(ValidationIssue::new(location, "Expected an object"));
        return Ok(());
    };

    for (name, field) in &desc.fields {
        if desc.is_internal_field(name) {
            continue;
        }
        let child_location = format!("{}/{}", location, name);
        let value = object.get(name);

        match field {
            Field::Property(property) => {
                if property.required && !has_content(value) {
                    issues.push(ValidationIssue::new(&child_location, "Value is required"));
                }
            }
            Field::Relation(relation) if relation.inline_relation => {
                check_inline(schema, relation, value, &child_location, depth, issues)?;
            }
            Field::Relation(relation) => {
                let len = value.and_then(Value::as_array).map(Vec::len).unwrap_or(0);
                if relation.cardinality.requires_at_least_one() && len == 0 {
                    issues.push(ValidationIssue::new(
                        &child_location,
                        "At least one target is required",
                    ));
                }
                if len > 1 && relation.cardinality.at_capacity(1) {
                    issues.push(ValidationIssue::new(
                        &child_location,
                        "Holds more targets than the relation allows",
                    ));
                }
            }
        }
    }
    Ok(())
}

fn check_inline(
    schema: &Schema,
    relation: &crate::schema::RelationField,
    value: Option<&Value>,
    location: &str,
    depth: usize,
    issues: &mut Vec<ValidationIssue>,
) -> AppResult<()> {
    let Some(object) = value.and_then(Value::as_object) else {
        issues.push(ValidationIssue::new(location, "Expected a nested object"));
        return Ok(());
    };

    // No selection means no nested entity; that is only a problem when
    // the cardinality demands one.
    let selected = object.get("type").and_then(Value::as_str).unwrap_or("");
    if selected.is_empty() {
        if relation.cardinality.requires_at_least_one() {
            issues.push(ValidationIssue::new(location, "A type must be selected"));
        }
        return Ok(());
    }

    let options = schema.inline_subtype_options(&relation.relation_to)?;
    if !options.iter().any(|o| o == &selected.to_lowercase()) {
        issues.push(ValidationIssue::new(
            location,
            format!("'{}' is not a valid type here", selected),
        ));
        return Ok(());
    }

    if depth == 0 {
        return Ok(());
    }
    check_descriptor(
        schema,
        selected,
        &Value::Object(object.clone()),
        location,
        depth - 1,
        issues,
    )
}

fn has_content(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}
