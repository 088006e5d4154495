// Form engine - schema-driven editing state over one record

pub mod inline;
pub mod inputs;
pub mod relation;

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::error::{AppError, AppResult};
use crate::records::{EntityRecord, EntitySummary};
use crate::schema::label as label_template;
use crate::schema::validate::{validate_record, ValidationReport};
use crate::schema::{EntityDescriptor, Field, Schema};
use inline::RenderBudget;
use relation::RelationEditor;

/// Field names as shown in forms and views.
pub fn field_display_name(name: &str) -> String {
    name.replace('_', " ").to_uppercase()
}

/// One rendered line of a form: a property input, a relation header,
/// a linked target, or a nested inline field.
#[derive(Debug, Clone)]
pub struct FormRow {
    pub indent: usize,
    /// Dotted path usable with the editing commands; empty for rows
    /// that are display-only, such as linked targets.
    pub path: String,
    pub name: String,
    pub detail: String,
    pub help: Option<String>,
    pub errors: Vec<String>,
}

/// Editing state for one record: the data under edit, a dirty flag
/// for the navigation guard, and the validation errors of the last
/// check, grouped per top-level field.
#[derive(Debug, Clone)]
pub struct FormState {
    entity_type: String,
    data: Value,
    dirty: bool,
    errors: BTreeMap<String, Vec<String>>,
}

impl FormState {
    /// A blank form for creating an entity: properties start empty,
    /// relations unlinked, inline relations with no subtype selected.
    pub fn blank(schema: &Schema, entity_type: &str) -> AppResult<Self> {
        let desc = schema.descriptor(entity_type)?;
        let mut data = Map::new();
        for (name, field) in &desc.fields {
            let value = match field {
                Field::Relation(r) if r.inline_relation => json!({"type": ""}),
                Field::Relation(_) => json!([]),
                Field::Property(_) => json!(""),
            };
            data.insert(name.clone(), value);
        }
        Ok(Self {
            entity_type: entity_type.to_lowercase(),
            data: Value::Object(data),
            dirty: false,
            errors: BTreeMap::new(),
        })
    }

    /// A form seeded with a fetched record, for editing. The record
    /// goes in whole; the renderer only shows schema fields, and the
    /// server strips its own fields again on save.
    pub fn from_record(
        schema: &Schema,
        entity_type: &str,
        record: EntityRecord,
    ) -> AppResult<Self> {
        schema.descriptor(entity_type)?;
        Ok(Self {
            entity_type: entity_type.to_lowercase(),
            data: record.into_value(),
            dirty: false,
            errors: BTreeMap::new(),
        })
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// The body submitted on save.
    pub fn payload(&self) -> &Value {
        &self.data
    }

    pub fn uid(&self) -> Option<&str> {
        self.data.get("uid").and_then(Value::as_str)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_saved(&mut self) {
        self.dirty = false;
    }

    pub fn errors(&self) -> &BTreeMap<String, Vec<String>> {
        &self.errors
    }

    /// The label as it stands: template-derived when the type has a
    /// label template, the stored label field otherwise.
    pub fn label(&self, schema: &Schema) -> String {
        if let Some(desc) = schema.get(&self.entity_type) {
            if let Some(template) = &desc.meta.label_template {
                return label_template::render(template, &self.data);
            }
        }
        self.data
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    }

    fn recompute_label(&mut self, schema: &Schema) {
        if let Some(desc) = schema.get(&self.entity_type) {
            if let Some(template) = &desc.meta.label_template {
                let rendered = label_template::render(template, &self.data);
                if let Some(object) = self.data.as_object_mut() {
                    object.insert("label".to_string(), Value::String(rendered));
                }
            }
        }
    }

    fn touched(&mut self, schema: &Schema) {
        self.dirty = true;
        self.recompute_label(schema);
    }

    // ========== Editing ==========

    /// Sets a field by dotted path. Properties take masked input; an
    /// inline field takes a subtype name, switching the nested object
    /// to it. A template-derived label cannot be set directly.
    pub fn set_field(&mut self, schema: &Schema, path: &str, raw: &str) -> AppResult<()> {
        let segments = split_path(path)?;
        let (last, lead) = split_last(&segments);

        if lead.is_empty() && last == "label" {
            let desc = schema.descriptor(&self.entity_type)?;
            if desc.meta.label_template.is_some() {
                return Err(AppError::Validation(
                    "The label is derived from other fields here".to_string(),
                ));
            }
        }

        let walk = descend_mut(schema, &self.entity_type, &mut self.data, lead)?;
        let desc = schema.descriptor(&walk.entity_type)?;
        let declared = walk.declared.as_deref().and_then(|d| schema.get(d));
        ensure_editable(desc, declared, last)?;

        match desc.field(last) {
            Some(Field::Property(property)) => {
                let object = as_object_mut(walk.value)?;
                let current = object
                    .get(last)
                    .cloned()
                    .unwrap_or(Value::String(String::new()));
                let next = inputs::apply_input(&property.property_type, &current, raw);
                object.insert(last.to_string(), next);
            }
            Some(Field::Relation(relation)) if relation.inline_relation => {
                let object = as_object_mut(walk.value)?;
                let child = object
                    .entry(last.to_string())
                    .or_insert_with(|| json!({"type": ""}));
                inline::switch_type(schema, relation, child, raw)?;
            }
            Some(Field::Relation(_)) => {
                return Err(AppError::InvalidCommand(format!(
                    "'{}' is a relation; use add or remove",
                    last
                )));
            }
            None => {
                return Err(AppError::SchemaError(format!(
                    "'{}' has no field named '{}'",
                    walk.entity_type, last
                )));
            }
        }
        self.touched(schema);
        Ok(())
    }

    /// Resets a field to its blank state: properties to empty,
    /// relations to unlinked, inline relations to no selection.
    pub fn unset(&mut self, schema: &Schema, path: &str) -> AppResult<()> {
        let segments = split_path(path)?;
        let (last, lead) = split_last(&segments);
        let walk = descend_mut(schema, &self.entity_type, &mut self.data, lead)?;
        let desc = schema.descriptor(&walk.entity_type)?;

        let blank = match desc.field(last) {
            Some(Field::Property(_)) => json!(""),
            Some(Field::Relation(r)) if r.inline_relation => json!({"type": ""}),
            Some(Field::Relation(_)) => json!([]),
            None => {
                return Err(AppError::SchemaError(format!(
                    "'{}' has no field named '{}'",
                    walk.entity_type, last
                )));
            }
        };
        as_object_mut(walk.value)?.insert(last.to_string(), blank);
        self.touched(schema);
        Ok(())
    }

    /// Links an existing entity to a relation field.
    pub fn add_target(
        &mut self,
        schema: &Schema,
        path: &str,
        target: &EntitySummary,
    ) -> AppResult<()> {
        self.with_relation(schema, path, |editor, value| editor.add(value, target))?;
        self.touched(schema);
        Ok(())
    }

    /// Links an entity just created through an embedded form.
    pub fn add_created_target(
        &mut self,
        schema: &Schema,
        path: &str,
        uid: &str,
        label: &str,
        real_type: &str,
    ) -> AppResult<()> {
        self.with_relation(schema, path, |editor, value| {
            editor.add_created(value, uid, label, real_type)
        })?;
        self.touched(schema);
        Ok(())
    }

    pub fn remove_target(&mut self, schema: &Schema, path: &str, uid: &str) -> AppResult<()> {
        self.with_relation(schema, path, |editor, value| editor.remove(value, uid))?;
        self.touched(schema);
        Ok(())
    }

    /// Sets a property carried on the edge to one linked target.
    pub fn set_edge(
        &mut self,
        schema: &Schema,
        path: &str,
        uid: &str,
        edge_field: &str,
        raw: &str,
    ) -> AppResult<()> {
        self.with_relation(schema, path, |editor, value| {
            editor.set_edge_value(value, uid, edge_field, raw)
        })?;
        self.touched(schema);
        Ok(())
    }

    fn with_relation<F>(&mut self, schema: &Schema, path: &str, op: F) -> AppResult<()>
    where
        F: FnOnce(&RelationEditor, &mut Value) -> AppResult<()>,
    {
        let segments = split_path(path)?;
        let (last, lead) = split_last(&segments);
        let walk = descend_mut(schema, &self.entity_type, &mut self.data, lead)?;
        let desc = schema.descriptor(&walk.entity_type)?;

        let relation = match desc.field(last) {
            Some(Field::Relation(r)) if !r.inline_relation => r,
            Some(Field::Relation(_)) => {
                return Err(AppError::InvalidCommand(format!(
                    "'{}' is inline; set it to a subtype and edit its fields",
                    last
                )));
            }
            Some(Field::Property(_)) => {
                return Err(AppError::InvalidCommand(format!(
                    "'{}' is a property; use set",
                    last
                )));
            }
            None => {
                return Err(AppError::SchemaError(format!(
                    "'{}' has no field named '{}'",
                    walk.entity_type, last
                )));
            }
        };

        let editor = RelationEditor::new(last, relation);
        let object = as_object_mut(walk.value)?;
        let value = object.entry(last.to_string()).or_insert_with(|| json!([]));
        op(&editor, value)
    }

    /// The entity type a relation field links to; candidates for the
    /// field are of this type or its subclasses.
    pub fn relation_target_type(&self, schema: &Schema, path: &str) -> AppResult<String> {
        let (_, relation) = self.relation_field(schema, path)?;
        if relation.inline_relation {
            return Err(AppError::InvalidCommand(format!(
                "'{}' is inline; set it to a subtype and edit its fields",
                path
            )));
        }
        Ok(relation.target_key())
    }

    fn relation_field<'s>(
        &self,
        schema: &'s Schema,
        path: &str,
    ) -> AppResult<(String, &'s crate::schema::RelationField)> {
        let segments = split_path(path)?;
        let (last, lead) = split_last(&segments);
        let owner_type = descend_type(schema, &self.entity_type, &self.data, lead)?;
        let desc = schema.descriptor(&owner_type)?;
        match desc.field(last) {
            Some(Field::Relation(r)) => Ok((owner_type, r)),
            Some(Field::Property(_)) => Err(AppError::InvalidCommand(format!(
                "'{}' is a property, not a relation",
                last
            ))),
            None => Err(AppError::SchemaError(format!(
                "'{}' has no field named '{}'",
                owner_type, last
            ))),
        }
    }

    /// Candidates matching `query` that the field does not already
    /// link, in candidate list order.
    pub fn matching_candidates(
        &self,
        schema: &Schema,
        path: &str,
        query: &str,
        candidates: &[EntitySummary],
    ) -> AppResult<Vec<EntitySummary>> {
        let segments = split_path(path)?;
        let (last, lead) = split_last(&segments);
        let owner_type = descend_type(schema, &self.entity_type, &self.data, lead)?;
        let desc = schema.descriptor(&owner_type)?;
        let relation = match desc.field(last) {
            Some(Field::Relation(r)) if !r.inline_relation => r,
            _ => {
                return Err(AppError::InvalidCommand(format!(
                    "'{}' is not a linkable relation",
                    last
                )));
            }
        };
        let editor = RelationEditor::new(last, relation);
        let value = read_at(&self.data, lead, last).unwrap_or(Value::Array(Vec::new()));
        Ok(editor
            .filter_candidates(&value, query, candidates)
            .into_iter()
            .cloned()
            .collect())
    }

    // ========== Validation ==========

    /// Validates the current data and stores the errors for display.
    pub fn validate(&mut self, schema: &Schema) -> AppResult<ValidationReport> {
        let report = validate_record(schema, &self.entity_type, &self.data)?;
        self.errors = report.by_field();
        Ok(report)
    }

    // ========== Rendering ==========

    /// Flattens the form into display rows: ordered fields at indent
    /// zero, linked targets and inline fields nested below, recursion
    /// bounded by `max_inline_depth`.
    pub fn rows(&self, schema: &Schema, max_inline_depth: usize) -> AppResult<Vec<FormRow>> {
        let mut rows = Vec::new();
        collect_rows(
            schema,
            &self.entity_type,
            &self.data,
            "",
            0,
            &RenderBudget::new(max_inline_depth),
            None,
            &self.errors,
            &mut rows,
        )?;
        Ok(rows)
    }
}

// ========== Path walking ==========

fn split_path(path: &str) -> AppResult<Vec<&str>> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(AppError::InvalidCommand("Empty field path".to_string()));
    }
    Ok(segments)
}

fn split_last<'a>(segments: &'a [&'a str]) -> (&'a str, &'a [&'a str]) {
    let (last, lead) = segments
        .split_last()
        .map(|(l, rest)| (*l, rest))
        .unwrap_or(("", &[]));
    (last, lead)
}

struct Walk<'v> {
    /// Selected subtype owning the leaf field.
    entity_type: String,
    /// Declared target type of the innermost inline hop, whose meta
    /// hides internal fields at this level.
    declared: Option<String>,
    value: &'v mut Value,
}

/// Walks the leading path segments, each naming an inline relation
/// field, descending into the nested objects along the way.
fn descend_mut<'v>(
    schema: &Schema,
    entity_type: &str,
    data: &'v mut Value,
    lead: &[&str],
) -> AppResult<Walk<'v>> {
    let mut current_type = entity_type.to_lowercase();
    let mut declared = None;
    let mut current = data;

    for seg in lead {
        let desc = schema.descriptor(&current_type)?;
        let relation = match desc.field(seg) {
            Some(Field::Relation(r)) if r.inline_relation => r,
            Some(_) => {
                return Err(AppError::InvalidCommand(format!(
                    "'{}' is not an inline field; only inline fields nest",
                    seg
                )));
            }
            None => {
                return Err(AppError::SchemaError(format!(
                    "'{}' has no field named '{}'",
                    current_type, seg
                )));
            }
        };
        declared = Some(relation.target_key());

        let object = as_object_mut(current)?;
        let child = object
            .entry(seg.to_string())
            .or_insert_with(|| json!({"type": ""}));
        match inline::selected_type(child) {
            Some(selected) => current_type = selected.to_string(),
            None => {
                return Err(AppError::Validation(format!(
                    "Select a type for '{}' before editing inside it",
                    seg
                )));
            }
        }
        current = child;
    }

    Ok(Walk {
        entity_type: current_type,
        declared,
        value: current,
    })
}

/// Read-only variant of the walk; resolves the selected type at the
/// end of the leading segments.
fn descend_type(
    schema: &Schema,
    entity_type: &str,
    data: &Value,
    lead: &[&str],
) -> AppResult<String> {
    let mut current_type = entity_type.to_lowercase();
    let mut current = data;

    for seg in lead {
        let desc = schema.descriptor(&current_type)?;
        match desc.field(seg) {
            Some(Field::Relation(r)) if r.inline_relation => {}
            Some(_) => {
                return Err(AppError::InvalidCommand(format!(
                    "'{}' is not an inline field; only inline fields nest",
                    seg
                )));
            }
            None => {
                return Err(AppError::SchemaError(format!(
                    "'{}' has no field named '{}'",
                    current_type, seg
                )));
            }
        }
        let child = current.get(*seg);
        match (child, child.and_then(inline::selected_type)) {
            (Some(value), Some(selected)) => {
                current_type = selected.to_string();
                current = value;
            }
            _ => {
                return Err(AppError::Validation(format!(
                    "Select a type for '{}' before editing inside it",
                    seg
                )));
            }
        }
    }
    Ok(current_type)
}

fn read_at(data: &Value, lead: &[&str], last: &str) -> Option<Value> {
    let mut current = data;
    for seg in lead {
        current = current.get(*seg)?;
    }
    current.get(last).cloned()
}

fn as_object_mut(value: &mut Value) -> AppResult<&mut Map<String, Value>> {
    value
        .as_object_mut()
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("record data is not an object")))
}

fn ensure_editable(
    desc: &EntityDescriptor,
    declared: Option<&EntityDescriptor>,
    field: &str,
) -> AppResult<()> {
    let hidden = desc.is_internal_field(field)
        || declared.map(|d| d.is_internal_field(field)).unwrap_or(false);
    if hidden {
        return Err(AppError::SchemaError(format!(
            "'{}' is internal and not editable",
            field
        )));
    }
    Ok(())
}

// ========== Row collection ==========

#[allow(clippy::too_many_arguments)]
fn collect_rows(
    schema: &Schema,
    entity_type: &str,
    data: &Value,
    prefix: &str,
    indent: usize,
    budget: &RenderBudget,
    declared_internal: Option<&EntityDescriptor>,
    errors: &BTreeMap<String, Vec<String>>,
    rows: &mut Vec<FormRow>,
) -> AppResult<()> {
    let desc = schema.descriptor(entity_type)?;

    for (name, field) in desc.ordered_fields() {
        if desc.is_internal_field(name) {
            continue;
        }
        if let Some(declared) = declared_internal {
            if declared.is_internal_field(name) {
                continue;
            }
        }

        let path = join_path(prefix, name);
        let row_errors = if indent == 0 {
            errors.get(name.as_str()).cloned().unwrap_or_default()
        } else {
            Vec::new()
        };
        let value = data.get(name.as_str()).unwrap_or(&Value::Null);

        match field {
            Field::Property(property) => {
                let mut detail = display_scalar(value);
                if name == "label" && desc.meta.label_template.is_some() {
                    detail.push_str(" (derived)");
                }
                let mut merged_errors = row_errors;
                if let Some(warning) = inputs::soft_warning(&property.property_type, value) {
                    merged_errors.push(warning);
                }
                rows.push(FormRow {
                    indent,
                    path,
                    name: field_display_name(name),
                    detail,
                    help: property.help_text.clone(),
                    errors: merged_errors,
                });
            }
            Field::Relation(relation) if relation.inline_relation => {
                let selected = inline::selected_type(value);
                let options = schema.inline_subtype_options(&relation.relation_to)?;
                let detail = match selected {
                    Some(t) => schema.display_name(t),
                    None => format!("(none; options: {})", options.join(", ")),
                };
                rows.push(FormRow {
                    indent,
                    path: path.clone(),
                    name: field_display_name(name),
                    detail,
                    help: relation.help_text.clone(),
                    errors: row_errors,
                });

                if let Some(selected) = selected {
                    match budget.descend(selected) {
                        Some(next_budget) => {
                            let declared = schema.descriptor(&relation.target_key())?;
                            collect_rows(
                                schema,
                                selected,
                                value,
                                &path,
                                indent + 1,
                                &next_budget,
                                Some(declared),
                                errors,
                                rows,
                            )?;
                        }
                        None => {
                            rows.push(FormRow {
                                indent: indent + 1,
                                path: String::new(),
                                name: "...".to_string(),
                                detail: "(collapsed)".to_string(),
                                help: None,
                                errors: Vec::new(),
                            });
                        }
                    }
                }
            }
            Field::Relation(relation) => {
                let editor = RelationEditor::new(name, relation);
                let count = editor.linked_count(value);
                let detail = format!(
                    "{} linked -> {}",
                    count,
                    schema.display_name(&relation.target_key())
                );
                rows.push(FormRow {
                    indent,
                    path: path.clone(),
                    name: field_display_name(name),
                    detail,
                    help: relation.help_text.clone(),
                    errors: row_errors,
                });

                if let Some(items) = value.as_array() {
                    for item in items {
                        rows.push(FormRow {
                            indent: indent + 1,
                            path: String::new(),
                            name: "-".to_string(),
                            detail: display_target(item, relation),
                            help: None,
                            errors: Vec::new(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn display_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn display_target(item: &Value, relation: &crate::schema::RelationField) -> String {
    let label = item.get("label").and_then(Value::as_str).unwrap_or("?");
    let real_type = item.get("real_type").and_then(Value::as_str).unwrap_or("?");
    let uid = item.get("uid").and_then(Value::as_str).unwrap_or("?");
    let mut text = format!("{} [{}] ({})", label, real_type, uid);

    let edges: Vec<String> = relation
        .relation_fields
        .iter()
        .filter_map(|(edge_name, edge_field)| match edge_field {
            Field::Property(p) => {
                let value = relation::edge_value(item, edge_name, p);
                Some(format!("{}={}", edge_name, display_scalar(&value)))
            }
            Field::Relation(_) => None,
        })
        .collect();
    if !edges.is_empty() {
        text.push_str(&format!(" {{{}}}", edges.join(", ")));
    }
    if item.get("is_deleted").and_then(Value::as_bool).unwrap_or(false) {
        text.push_str(" [deleted]");
    }
    text
}
