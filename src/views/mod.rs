// Views - plain-text rendering of lists, records and comparisons

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::AppResult;
use crate::form::inline::RenderBudget;
use crate::form::{field_display_name, FormState};
use crate::records::{DeletionState, EntityRecord, EntitySummary, ImportList, RelationTarget};
use crate::schema::{EntityDescriptor, Field, RelationField, Schema};

/// Schema fields never shown in record views; they surface as badges
/// and banners instead.
const HIDDEN_DETAIL_FIELDS: &[&str] = &["is_deleted", "merged"];

pub fn deletion_badge(state: DeletionState) -> &'static str {
    match state {
        DeletionState::Active => "",
        DeletionState::PendingWithDependents => " [deleted: awaiting dependent references]",
        DeletionState::PendingSafe => " [deleted: safe to remove]",
    }
}

// ========== Type directory ==========

pub fn render_types(schema: &Schema) -> String {
    // Servers that flag top-level types drive the directory with the
    // flag; otherwise every non-inline type is listed.
    let flagged = schema.iter().any(|(_, desc)| desc.top_level);
    let mut out = String::from("Entity types\n");
    for (name, desc) in schema.iter() {
        if desc.meta.inline_only || (flagged && !desc.top_level) {
            continue;
        }
        let mut line = format!("  {} - {}", name, schema.display_name_plural(name));
        if desc.meta.is_abstract {
            line.push_str(" (abstract)");
        }
        if desc.meta.importable || !desc.meta.importers.is_empty() {
            line.push_str(" (importable)");
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

// ========== Lists ==========

/// Renders a type listing grouped by concrete type, with deletion and
/// merge badges per row. Items are expected ordered by real type then
/// label, as the cache and the server both return them.
pub fn render_list(
    schema: &Schema,
    entity_type: &str,
    items: &[EntitySummary],
    filter: Option<&str>,
) -> String {
    let mut out = String::new();
    let mut current_group: Option<&str> = None;

    for item in items {
        if current_group != Some(item.real_type.as_str()) {
            current_group = Some(item.real_type.as_str());
            out.push_str(&format!(
                "== {} ==\n",
                schema.display_name_plural(&item.real_type)
            ));
        }
        out.push_str(&format!(
            "  {}  {}{}",
            item.uid,
            item.label,
            deletion_badge(item.deletion_state())
        ));
        if !item.merged_items.is_empty() {
            let merged: Vec<&str> =
                item.merged_items.iter().map(|m| m.label.as_str()).collect();
            out.push_str(&format!(" [merged: {}]", merged.join(", ")));
        }
        out.push('\n');
    }

    match filter {
        Some(filter) => out.push_str(&format!(
            "({} {} matching '{}')\n",
            items.len(),
            schema.display_name_plural(entity_type),
            filter
        )),
        None => out.push_str(&format!(
            "({} {})\n",
            items.len(),
            schema.display_name_plural(entity_type)
        )),
    }
    out
}

// ========== Record detail ==========

/// Renders one record: banners, fields in display order, reverse
/// relations, audit line and the actions its state allows.
pub fn render_detail(
    schema: &Schema,
    entity_type: &str,
    record: &EntityRecord,
    max_inline_depth: usize,
) -> AppResult<String> {
    let desc = schema.descriptor(entity_type)?;
    let mut out = String::new();

    out.push_str(&format!(
        "{}: {}",
        schema.display_name(entity_type),
        record.label()
    ));
    if let Some(uid) = record.uid() {
        out.push_str(&format!(" ({})", uid));
    }
    let merged = record.merged_items();
    if !merged.is_empty() {
        let labels: Vec<&str> = merged.iter().map(|m| m.label.as_str()).collect();
        out.push_str(&format!(" [merged: {}]", labels.join(", ")));
    }
    out.push('\n');

    match record.deletion_state() {
        DeletionState::Active => {}
        DeletionState::PendingWithDependents => {
            out.push_str(
                "! Marked for deletion, pending removal of references from dependent entities\n",
            );
        }
        DeletionState::PendingSafe => {
            out.push_str("! Marked for deletion\n");
        }
    }
    if references_deleted_entity(desc, record) {
        out.push_str("! References a deleted entity\n");
    }
    out.push('\n');

    let data = record.as_value();
    detail_fields(
        schema,
        entity_type,
        &data,
        1,
        &RenderBudget::new(max_inline_depth),
        None,
        &mut out,
    )?;

    render_reverse_relations(schema, entity_type, record, &mut out)?;

    out.push('\n');
    out.push_str(&audit_line(record, Utc::now()));
    out.push('\n');
    out.push_str(&format!("Actions: {}\n", actions_line(desc.meta.mergeable, record)));
    Ok(out)
}

fn actions_line(mergeable: bool, record: &EntityRecord) -> String {
    let mut actions: Vec<&str> = Vec::new();
    if record.is_deleted() {
        actions.push("restore");
    } else {
        actions.push("edit");
        actions.push("delete");
        if mergeable {
            actions.push("merge");
        }
    }
    actions.join(", ")
}

/// A record that links a target already marked deleted gets a warning
/// banner; inline objects carry no links of their own at this level.
fn references_deleted_entity(desc: &EntityDescriptor, record: &EntityRecord) -> bool {
    desc.fields.iter().any(|(name, field)| match field {
        Field::Relation(r) if !r.inline_relation => record
            .relation_targets(name)
            .iter()
            .any(|t| t.is_deleted),
        _ => false,
    })
}

fn detail_fields(
    schema: &Schema,
    entity_type: &str,
    data: &Value,
    indent: usize,
    budget: &RenderBudget,
    declared_internal: Option<&EntityDescriptor>,
    out: &mut String,
) -> AppResult<()> {
    let desc = schema.descriptor(entity_type)?;
    let pad = "  ".repeat(indent);

    for (name, field) in desc.ordered_fields() {
        if HIDDEN_DETAIL_FIELDS.contains(&name.as_str()) || desc.is_internal_field(name) {
            continue;
        }
        if let Some(declared) = declared_internal {
            if declared.is_internal_field(name) {
                continue;
            }
        }
        let value = data.get(name.as_str()).unwrap_or(&Value::Null);

        match field {
            Field::Property(_) => {
                out.push_str(&format!(
                    "{}{}: {}\n",
                    pad,
                    field_display_name(name),
                    scalar_text(value)
                ));
            }
            Field::Relation(relation) if relation.inline_relation => {
                let selected = value
                    .get("type")
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty());
                match selected {
                    Some(subtype) => {
                        out.push_str(&format!(
                            "{}{} ({}):\n",
                            pad,
                            field_display_name(name),
                            schema.display_name(subtype)
                        ));
                        match budget.descend(subtype) {
                            Some(next) => {
                                let declared = schema.descriptor(&relation.target_key())?;
                                detail_fields(
                                    schema,
                                    subtype,
                                    value,
                                    indent + 1,
                                    &next,
                                    Some(declared),
                                    out,
                                )?;
                            }
                            None => out.push_str(&format!("{}  ...\n", pad)),
                        }
                    }
                    None => {
                        out.push_str(&format!("{}{}: -\n", pad, field_display_name(name)));
                    }
                }
            }
            Field::Relation(relation) => {
                let heading = desc
                    .meta
                    .forward_label(name)
                    .map(field_display_name)
                    .unwrap_or_else(|| field_display_name(name));
                out.push_str(&format!(
                    "{}{} -> {}:\n",
                    pad,
                    heading,
                    schema.display_name(&relation.target_key())
                ));
                let targets: Vec<RelationTarget> = value
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|i| serde_json::from_value(i.clone()).ok())
                            .collect()
                    })
                    .unwrap_or_default();
                if targets.is_empty() {
                    out.push_str(&format!("{}  -\n", pad));
                }
                for target in targets {
                    out.push_str(&format!("{}  - {}\n", pad, target_line(&target, relation)));
                }
            }
        }
    }
    Ok(())
}

fn target_line(target: &RelationTarget, relation: &RelationField) -> String {
    let mut line = format!("{} [{}] ({})", target.label, target.real_type, target.uid);
    let edges: Vec<String> = relation
        .relation_fields
        .iter()
        .filter_map(|(edge_name, edge_field)| match edge_field {
            Field::Property(p) => {
                let value = crate::form::relation::edge_value(
                    &Value::Object(
                        [
                            (
                                "relData".to_string(),
                                Value::Object(target.rel_data.clone()),
                            ),
                        ]
                        .into_iter()
                        .collect(),
                    ),
                    edge_name,
                    p,
                );
                Some(format!("{}={}", edge_name, scalar_text(&value)))
            }
            Field::Relation(_) => None,
        })
        .collect();
    if !edges.is_empty() {
        line.push_str(&format!(" {{{}}}", edges.join(", ")));
    }
    line.push_str(deletion_badge(DeletionState::of(
        target.is_deleted,
        target.deleted_and_has_dependent_nodes,
    )));
    line
}

fn render_reverse_relations(
    schema: &Schema,
    entity_type: &str,
    record: &EntityRecord,
    out: &mut String,
) -> AppResult<()> {
    let desc = schema.descriptor(entity_type)?;
    for (name, _reverse) in &desc.reverse_relations {
        let targets = record.relation_targets(name);
        if targets.is_empty() {
            continue;
        }
        let heading = desc
            .meta
            .reverse_label(name)
            .map(field_display_name)
            .unwrap_or_else(|| field_display_name(name));
        out.push_str(&format!("\n  {} <-\n", heading));

        let mut current_group: Option<&str> = None;
        for target in &targets {
            if current_group != Some(target.real_type.as_str()) {
                current_group = Some(target.real_type.as_str());
                out.push_str(&format!(
                    "    [{}]\n",
                    schema.display_name_plural(&target.real_type)
                ));
            }
            out.push_str(&format!(
                "    - {} ({}){}\n",
                target.label,
                target.uid,
                deletion_badge(DeletionState::of(
                    target.is_deleted,
                    target.deleted_and_has_dependent_nodes
                ))
            ));
        }
    }
    Ok(())
}

fn audit_line(record: &EntityRecord, now: DateTime<Utc>) -> String {
    let created_by = record.created_by().unwrap_or("Auto");
    let mut line = format!("Created by {}", created_by);
    if let Some(when) = record.created_when() {
        line.push_str(&format!(" {}", relative_from(now, when)));
    }
    if let Some(modified_when) = record.modified_when() {
        let modified_by = record.modified_by().unwrap_or("Auto");
        line.push_str(&format!(
            "; modified by {} {}",
            modified_by,
            relative_from(now, modified_when)
        ));
    }
    line
}

/// Rough relative rendering of an ISO timestamp; unparseable input
/// falls back to the raw text.
fn relative_from(now: DateTime<Utc>, iso: &str) -> String {
    let when = match DateTime::parse_from_rfc3339(iso) {
        Ok(when) => when.with_timezone(&Utc),
        Err(_) => return iso.to_string(),
    };
    let secs = (now - when).num_seconds();
    if secs < 60 {
        return "just now".to_string();
    }
    let (count, unit) = if secs < 3600 {
        (secs / 60, "minute")
    } else if secs < 86_400 {
        (secs / 3600, "hour")
    } else if secs < 2_592_000 {
        (secs / 86_400, "day")
    } else if secs < 31_536_000 {
        (secs / 2_592_000, "month")
    } else {
        (secs / 31_536_000, "year")
    };
    if count == 1 {
        format!("1 {} ago", unit)
    } else {
        format!("{} {}s ago", count, unit)
    }
}

// ========== Forms ==========

/// Renders the form under edit: header, rows with nesting, errors and
/// help beneath the rows they belong to.
pub fn render_form(schema: &Schema, form: &FormState, max_inline_depth: usize) -> AppResult<String> {
    let mut out = String::new();
    let label = form.label(schema);
    match form.uid() {
        Some(uid) => out.push_str(&format!(
            "Edit {}: {} ({})",
            schema.display_name(form.entity_type()),
            label,
            uid
        )),
        None => out.push_str(&format!(
            "New {}: {}",
            schema.display_name(form.entity_type()),
            label
        )),
    }
    if form.is_dirty() {
        out.push_str(" [unsaved]");
    }
    out.push('\n');

    for row in form.rows(schema, max_inline_depth)? {
        let pad = "  ".repeat(row.indent + 1);
        out.push_str(&format!("{}{}: {}\n", pad, row.name, row.detail));
        if let Some(help) = &row.help {
            out.push_str(&format!("{}  ({})\n", pad, help));
        }
        for error in &row.errors {
            out.push_str(&format!("{}  ! {}\n", pad, error));
        }
    }
    Ok(out)
}

// ========== Merge comparison ==========

/// Side-by-side read-only comparison of two records of one type,
/// field by field in display order.
pub fn render_merge(
    schema: &Schema,
    entity_type: &str,
    left: &EntityRecord,
    right: &EntityRecord,
) -> AppResult<String> {
    let desc = schema.descriptor(entity_type)?;
    let mut out = format!(
        "Comparing {}: {} ({}) <> {} ({})\n",
        schema.display_name(entity_type),
        left.label(),
        left.uid().unwrap_or("?"),
        right.label(),
        right.uid().unwrap_or("?")
    );

    for (name, field) in desc.ordered_fields() {
        if HIDDEN_DETAIL_FIELDS.contains(&name.as_str()) || desc.is_internal_field(name) {
            continue;
        }
        out.push_str(&format!("  {}:\n", field_display_name(name)));
        out.push_str(&format!(
            "    < {}\n",
            compact_value(left.get(name).unwrap_or(&Value::Null), field)
        ));
        out.push_str(&format!(
            "    > {}\n",
            compact_value(right.get(name).unwrap_or(&Value::Null), field)
        ));
    }
    Ok(out)
}

/// One-line rendering of a field value for comparison columns.
fn compact_value(value: &Value, field: &Field) -> String {
    match field {
        Field::Property(_) => scalar_text(value),
        Field::Relation(r) if r.inline_relation => match value.get("type") {
            Some(Value::String(t)) if !t.is_empty() => {
                let parts: Vec<String> = value
                    .as_object()
                    .map(|o| {
                        o.iter()
                            .filter(|(k, _)| k.as_str() != "type")
                            .map(|(k, v)| format!("{}={}", k, scalar_text(v)))
                            .collect()
                    })
                    .unwrap_or_default();
                format!("{} ({})", t, parts.join(", "))
            }
            _ => "-".to_string(),
        },
        Field::Relation(_) => {
            let labels: Vec<String> = value
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .map(|i| {
                            i.get("label")
                                .and_then(Value::as_str)
                                .unwrap_or("?")
                                .to_string()
                        })
                        .collect()
                })
                .unwrap_or_default();
            if labels.is_empty() {
                "-".to_string()
            } else {
                labels.join("; ")
            }
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ========== Import results ==========

pub fn render_import_hits(list: &ImportList) -> String {
    let mut out = String::new();
    for (idx, hit) in list.data.iter().enumerate() {
        out.push_str(&format!("  [{}] {}", idx + 1, hit.label));
        if !hit.label_extra.is_empty() {
            out.push_str(&format!(" - {}", hit.label_extra));
        }
        if hit.already_in_db {
            out.push_str(" (already imported)");
        }
        out.push('\n');
    }
    out.push_str(&format!(
        "({} of {} results)\n",
        list.data.len(),
        list.total_items
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_schema() -> Schema {
        serde_json::from_value(json!({
            "person": {
                "app": "core",
                "fields": {
                    "label": {
                        "type": "property",
                        "property_type": "StringProperty"
                    },
                    "forename": {
                        "type": "property",
                        "property_type": "StringProperty"
                    },
                    "birth_event": {
                        "type": "relation",
                        "relation_type": "HAS_BIRTH_EVENT",
                        "relation_to": "Birth",
                        "cardinality": "ZeroOrOne",
                        "inline_relation": true
                    },
                    "employer": {
                        "type": "relation",
                        "relation_type": "HAS_EMPLOYER",
                        "relation_to": "Organisation",
                        "cardinality": "ZeroOrMore"
                    }
                },
                "reverse_relations": {
                    "children": { "relation_to": "Person" }
                },
                "meta": {
                    "display_name": "Person",
                    "display_name_plural": "People",
                    "override_labels": { "employer": ["works for", "employs"] },
                    "mergeable": true
                },
                "json_schema": {}
            },
            "organisation": {
                "app": "core",
                "fields": {
                    "label": { "type": "property", "property_type": "StringProperty" }
                },
                "meta": {},
                "json_schema": {}
            },
            "birth": {
                "app": "core",
                "fields": {
                    "date": { "type": "property", "property_type": "DateProperty" }
                },
                "meta": { "inline_only": true },
                "json_schema": {}
            }
        }))
        .unwrap()
    }

    fn summary(uid: &str, label: &str, real_type: &str) -> EntitySummary {
        EntitySummary {
            uid: uid.to_string(),
            label: label.to_string(),
            real_type: real_type.to_string(),
            is_deleted: false,
            deleted_and_has_dependent_nodes: false,
            is_merged_item: false,
            merged_items: Vec::new(),
        }
    }

    #[test]
    fn test_list_groups_by_real_type_with_plural_headings() {
        let schema = sample_schema();
        let items = vec![
            summary("o1", "Acme", "organisation"),
            summary("u1", "Ada", "person"),
            summary("u2", "George", "person"),
        ];
        let out = render_list(&schema, "person", &items, None);
        assert!(out.contains("== organisations =="));
        assert!(out.contains("== People =="));
        assert!(out.contains("u1  Ada"));
        assert!(out.contains("(3 People)"));
    }

    #[test]
    fn test_type_directory_honors_top_level_flags() {
        let schema: Schema = serde_json::from_value(json!({
            "person": {
                "app": "core",
                "top_level": true,
                "fields": {},
                "meta": { "display_name_plural": "People" },
                "json_schema": {}
            },
            "politician": {
                "app": "core",
                "top_level": false,
                "fields": {},
                "meta": {},
                "json_schema": {}
            }
        }))
        .unwrap();
        let out = render_types(&schema);
        assert!(out.contains("person - People"));
        assert!(!out.contains("politician"));

        // Without any flags the directory falls back to every type.
        let out = render_types(&sample_schema());
        assert!(out.contains("organisation"));
    }

    #[test]
    fn test_list_badges_distinguish_deletion_states() {
        let schema = sample_schema();
        let mut pending = summary("u1", "Ada", "person");
        pending.is_deleted = true;
        pending.deleted_and_has_dependent_nodes = true;
        let mut safe = summary("u2", "George", "person");
        safe.is_deleted = true;

        let out = render_list(&schema, "person", &[pending, safe], None);
        assert!(out.contains("Ada [deleted: awaiting dependent references]"));
        assert!(out.contains("George [deleted: safe to remove]"));
    }

    #[test]
    fn test_detail_shows_fields_relations_and_audit() {
        let schema = sample_schema();
        let record: EntityRecord = serde_json::from_value(json!({
            "uid": "u1",
            "label": "Ada Lovelace",
            "real_type": "person",
            "forename": "Ada",
            "birth_event": {"type": "birth", "date": "1815-12-10"},
            "employer": [
                {"uid": "o1", "label": "Acme", "real_type": "organisation", "relData": {}}
            ],
            "createdBy": "mika",
            "createdWhen": "2020-01-01T00:00:00Z"
        }))
        .unwrap();
        let out = render_detail(&schema, "person", &record, 4).unwrap();
        assert!(out.contains("Person: Ada Lovelace (u1)"));
        assert!(out.contains("FORENAME: Ada"));
        assert!(out.contains("BIRTH EVENT (birth):"));
        assert!(out.contains("DATE: 1815-12-10"));
        // The forward override label replaces the field name.
        assert!(out.contains("WORKS FOR -> organisation:"));
        assert!(out.contains("Acme [organisation] (o1)"));
        assert!(out.contains("Created by mika"));
        assert!(out.contains("Actions: edit, delete, merge"));
    }

    #[test]
    fn test_detail_banners_for_deletion_and_deleted_references() {
        let schema = sample_schema();
        let record: EntityRecord = serde_json::from_value(json!({
            "uid": "u1",
            "label": "Ada",
            "real_type": "person",
            "forename": "",
            "birth_event": {"type": ""},
            "is_deleted": true,
            "deleted_and_has_dependent_nodes": true,
            "employer": [
                {"uid": "o1", "label": "Acme", "real_type": "organisation",
                 "relData": {}, "is_deleted": true}
            ]
        }))
        .unwrap();
        let out = render_detail(&schema, "person", &record, 4).unwrap();
        assert!(out.contains("! Marked for deletion, pending removal of references"));
        assert!(out.contains("! References a deleted entity"));
        assert!(out.contains("Actions: restore"));
    }

    #[test]
    fn test_detail_lists_reverse_relations_when_present() {
        let schema = sample_schema();
        let record: EntityRecord = serde_json::from_value(json!({
            "uid": "u1",
            "label": "Anne",
            "real_type": "person",
            "forename": "Anne",
            "birth_event": {"type": ""},
            "employer": [],
            "children": [
                {"uid": "u2", "label": "Ada", "real_type": "person", "relData": {}}
            ]
        }))
        .unwrap();
        let out = render_detail(&schema, "person", &record, 4).unwrap();
        assert!(out.contains("CHILDREN <-"));
        assert!(out.contains("- Ada (u2)"));

        let without: EntityRecord = serde_json::from_value(json!({
            "uid": "u1",
            "label": "Anne",
            "real_type": "person",
            "forename": "Anne",
            "birth_event": {"type": ""},
            "employer": [],
            "children": []
        }))
        .unwrap();
        let out = render_detail(&schema, "person", &without, 4).unwrap();
        assert!(!out.contains("CHILDREN <-"));
    }

    #[test]
    fn test_merge_renders_both_columns() {
        let schema = sample_schema();
        let left: EntityRecord = serde_json::from_value(json!({
            "uid": "u1", "label": "Ada", "real_type": "person",
            "forename": "Ada", "birth_event": {"type": ""}, "employer": []
        }))
        .unwrap();
        let right: EntityRecord = serde_json::from_value(json!({
            "uid": "u2", "label": "A. Lovelace", "real_type": "person",
            "forename": "Augusta Ada", "birth_event": {"type": ""},
            "employer": [{"uid": "o1", "label": "Acme", "real_type": "organisation"}]
        }))
        .unwrap();
        let out = render_merge(&schema, "person", &left, &right).unwrap();
        assert!(out.contains("Comparing Person: Ada (u1) <> A. Lovelace (u2)"));
        assert!(out.contains("< Ada"));
        assert!(out.contains("> Augusta Ada"));
        assert!(out.contains("> Acme"));
    }

    #[test]
    fn test_relative_dates() {
        let now = DateTime::parse_from_rfc3339("2020-01-10T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(relative_from(now, "2020-01-09T23:59:30Z"), "just now");
        assert_eq!(relative_from(now, "2020-01-09T23:30:00Z"), "30 minutes ago");
        assert_eq!(relative_from(now, "2020-01-09T00:00:00Z"), "1 day ago");
        assert_eq!(relative_from(now, "2019-01-10T00:00:00Z"), "1 year ago");
        assert_eq!(relative_from(now, "not a date"), "not a date");
    }

    #[test]
    fn test_import_hits_render_with_markers() {
        let list: ImportList = serde_json::from_value(json!({
            "data": [
                {"uri": "x:1", "id": "1", "label": "Ada", "label_extra": "1815-1852",
                 "already_in_db": true},
                {"uri": "x:2", "id": "2", "label": "Adam", "label_extra": ""}
            ],
            "totalItems": 40
        }))
        .unwrap();
        let out = render_import_hits(&list);
        assert!(out.contains("[1] Ada - 1815-1852 (already imported)"));
        assert!(out.contains("[2] Adam"));
        assert!(out.contains("(2 of 40 results)"));
    }
}
