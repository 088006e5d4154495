// Schema model - server-described entity types, fields and metadata

pub mod label;
pub mod validate;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, AppResult};

/// Property kinds the server can declare for a field.
///
/// Unknown kinds deserialize into `Other` so a newer server cannot break
/// the client; they edit as plain text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyType {
    #[serde(rename = "StringProperty")]
    String,
    #[serde(rename = "EmailProperty")]
    Email,
    #[serde(rename = "IntegerProperty")]
    Integer,
    #[serde(rename = "FloatProperty")]
    Float,
    #[serde(rename = "BooleanProperty")]
    Boolean,
    #[serde(rename = "DateProperty")]
    Date,
    #[serde(rename = "DateTimeProperty")]
    DateTime,
    #[serde(untagged)]
    Other(String),
}

/// How many targets a relation field may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    ZeroOrOne,
    One,
    OneOrMore,
    ZeroOrMore,
}

impl Default for Cardinality {
    fn default() -> Self {
        Cardinality::ZeroOrMore
    }
}

impl Cardinality {
    /// True when a relation holding `len` targets cannot take another.
    pub fn at_capacity(&self, len: usize) -> bool {
        match self {
            Cardinality::ZeroOrOne | Cardinality::One => len >= 1,
            Cardinality::OneOrMore | Cardinality::ZeroOrMore => false,
        }
    }

    /// True when an empty relation violates the cardinality.
    pub fn requires_at_least_one(&self) -> bool {
        matches!(self, Cardinality::One | Cardinality::OneOrMore)
    }
}

/// A scalar field on an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyField {
    pub property_type: PropertyType,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub help_text: Option<String>,
}

/// A link field pointing at other entities, optionally carrying edge data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationField {
    /// Edge name on the server, uppercase by convention.
    pub relation_type: String,
    /// Target entity type, PascalCase as served.
    pub relation_to: String,
    #[serde(default)]
    pub cardinality: Cardinality,
    /// Properties stored on the edge itself.
    #[serde(default)]
    pub relation_fields: IndexMap<String, Field>,
    /// Inline relations embed the related entity as a nested object
    /// instead of linking to a standalone one.
    #[serde(default)]
    pub inline_relation: bool,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub help_text: Option<String>,
}

impl RelationField {
    /// Lowercase form of the target type, usable as a schema key.
    pub fn target_key(&self) -> String {
        self.relation_to.to_lowercase()
    }
}

/// One field of an entity type, property or relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Property(PropertyField),
    Relation(RelationField),
}

impl Field {
    pub fn is_relation(&self) -> bool {
        matches!(self, Field::Relation(_))
    }

    pub fn is_inline_relation(&self) -> bool {
        matches!(self, Field::Relation(r) if r.inline_relation)
    }

    pub fn help_text(&self) -> Option<&str> {
        match self {
            Field::Property(p) => p.help_text.as_deref(),
            Field::Relation(r) => r.help_text.as_deref(),
        }
    }
}

/// Display metadata attached to an entity type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityMeta {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub display_name_plural: Option<String>,
    #[serde(rename = "abstract", default)]
    pub is_abstract: bool,
    /// Template with `{field}` placeholders used to derive labels.
    #[serde(default)]
    pub label_template: Option<String>,
    /// Inline-only types exist solely nested inside other entities and
    /// have no endpoints of their own.
    #[serde(default)]
    pub inline_only: bool,
    /// Per-field `[forward, reverse]` label overrides.
    #[serde(default)]
    pub override_labels: IndexMap<String, Vec<String>>,
    /// When `Some(false)` list responses must never be cached.
    #[serde(default)]
    pub use_list_cache: Option<bool>,
    #[serde(default)]
    pub importable: bool,
    /// Importer name to endpoint slug.
    #[serde(default)]
    pub importers: IndexMap<String, String>,
    /// Display order; unlisted fields sort after listed ones.
    #[serde(default)]
    pub order_fields: Vec<String>,
    /// Fields hidden from nested inline editors.
    #[serde(default)]
    pub internal_fields: Vec<String>,
    #[serde(default)]
    pub mergeable: bool,
}

impl EntityMeta {
    /// List caching is on unless the server switched it off.
    pub fn list_cache_enabled(&self) -> bool {
        self.use_list_cache != Some(false)
    }

    /// Forward label override for a relation field, if any.
    pub fn forward_label(&self, field: &str) -> Option<&str> {
        self.override_labels.get(field)?.first().map(String::as_str)
    }

    /// Reverse label override for a relation field, if any.
    pub fn reverse_label(&self, field: &str) -> Option<&str> {
        self.override_labels.get(field)?.get(1).map(String::as_str)
    }
}

/// Reverse edge pointing back at this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseRelation {
    pub relation_to: String,
}

/// Recursive subclass hierarchy as served under `subclasses`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubclassTree {
    #[serde(default)]
    pub subclasses: IndexMap<String, SubclassTree>,
}

/// Everything the server says about one entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// Flagged types make up the type directory; subclasses stay
    /// reachable through their parent's list.
    #[serde(default)]
    pub top_level: bool,
    #[serde(default)]
    pub fields: IndexMap<String, Field>,
    #[serde(default)]
    pub reverse_relations: IndexMap<String, ReverseRelation>,
    /// Server app the type belongs to; first path segment of its endpoints.
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub meta: EntityMeta,
    #[serde(default)]
    pub subclasses: IndexMap<String, SubclassTree>,
    /// Flattened subclass names, PascalCase as served.
    #[serde(default)]
    pub subclasses_list: Vec<String>,
    /// JSON Schema the server derived for this type's form data.
    #[serde(default)]
    pub json_schema: Value,
}

impl EntityDescriptor {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    /// Fields in display order: `label` first, then `meta.order_fields`
    /// order, then the rest in served order.
    pub fn ordered_fields(&self) -> Vec<(&String, &Field)> {
        let mut entries: Vec<(&String, &Field)> = self.fields.iter().collect();
        entries.sort_by_key(|(name, _)| self.field_sort_key(name));
        entries
    }

    fn field_sort_key(&self, name: &str) -> i64 {
        if name == "label" {
            return -1;
        }
        match self.meta.order_fields.iter().position(|f| f == name) {
            Some(idx) => idx as i64,
            None => 1000,
        }
    }

    pub fn is_internal_field(&self, name: &str) -> bool {
        self.meta.internal_fields.iter().any(|f| f == name)
    }

    /// Relation fields that embed their target rather than link to it.
    pub fn has_inline_fields(&self) -> bool {
        self.fields.values().any(Field::is_inline_relation)
    }
}

/// The full type catalogue fetched from `/api/schema/`, keyed by
/// lowercase type name in served order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    entities: IndexMap<String, EntityDescriptor>,
}

impl Schema {
    pub fn get(&self, entity_type: &str) -> Option<&EntityDescriptor> {
        self.entities.get(&entity_type.to_lowercase())
    }

    /// Descriptor lookup, failing with a schema error for unknown types.
    pub fn descriptor(&self, entity_type: &str) -> AppResult<&EntityDescriptor> {
        self.get(entity_type).ok_or_else(|| {
            AppError::SchemaError(format!("Unknown entity type '{}'", entity_type))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &EntityDescriptor)> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Singular display name, falling back to the type name itself.
    pub fn display_name(&self, entity_type: &str) -> String {
        match self.get(entity_type) {
            Some(desc) => desc
                .meta
                .display_name
                .clone()
                .unwrap_or_else(|| entity_type.to_string()),
            None => entity_type.to_string(),
        }
    }

    /// Plural display name, falling back to the singular plus "s".
    pub fn display_name_plural(&self, entity_type: &str) -> String {
        match self.get(entity_type) {
            Some(desc) => match &desc.meta.display_name_plural {
                Some(plural) => plural.clone(),
                None => format!("{}s", self.display_name(entity_type)),
            },
            None => format!("{}s", entity_type),
        }
    }

    /// Types that have their own list endpoints, in served order.
    pub fn listable_types(&self) -> Vec<&str> {
        self.entities
            .iter()
            .filter(|(_, desc)| !desc.meta.inline_only)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Concrete choices for an inline relation declared against
    /// `declared_type`: the declared type itself when not abstract,
    /// then its non-abstract subclasses.
    pub fn inline_subtype_options(&self, declared_type: &str) -> AppResult<Vec<String>> {
        let declared_key = declared_type.to_lowercase();
        let desc = self.descriptor(&declared_key)?;
        let mut options = Vec::new();
        if !desc.meta.is_abstract {
            options.push(declared_key.clone());
        }
        for subclass in &desc.subclasses_list {
            let key = subclass.to_lowercase();
            if key == declared_key {
                continue;
            }
            if let Some(sub) = self.get(&key) {
                if sub.meta.is_abstract {
                    continue;
                }
            }
            options.push(key);
        }
        Ok(options)
    }

    /// Checks referential integrity of the catalogue.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (entity_name, desc) in &self.entities {
            for (field_name, field) in &desc.fields {
                if let Field::Relation(relation) = field {
                    let target = relation.target_key();
                    if !self.entities.contains_key(&target) {
                        errors.push(format!(
                            "Entity '{}' field '{}' points at unknown type '{}'",
                            entity_name, field_name, relation.relation_to
                        ));
                    }
                    if relation.inline_relation {
                        match self.inline_subtype_options(&target) {
                            Ok(options) if options.is_empty() => {
                                errors.push(format!(
                                    "Entity '{}' inline field '{}' has no concrete subtype",
                                    entity_name, field_name
                                ));
                            }
                            _ => {}
                        }
                    }
                }
            }
            for (field_name, reverse) in &desc.reverse_relations {
                if !self.entities.contains_key(&reverse.relation_to.to_lowercase()) {
                    errors.push(format!(
                        "Entity '{}' reverse relation '{}' points at unknown type '{}'",
                        entity_name, field_name, reverse.relation_to
                    ));
                }
            }
            for subclass in &desc.subclasses_list {
                if !self.entities.contains_key(&subclass.to_lowercase()) {
                    errors.push(format!(
                        "Entity '{}' lists unknown subclass '{}'",
                        entity_name, subclass
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_schema() -> Schema {
        serde_json::from_value(json!({
            "person": {
                "top_level": true,
                "app": "core",
                "fields": {
                    "label": {
                        "type": "property",
                        "property_type": "StringProperty",
                        "default_value": "",
                        "required": true
                    },
                    "forename": {
                        "type": "property",
                        "property_type": "StringProperty",
                        "default_value": "",
                        "required": false
                    },
                    "surname": {
                        "type": "property",
                        "property_type": "StringProperty",
                        "default_value": "",
                        "required": false
                    },
                    "birth_event": {
                        "type": "relation",
                        "relation_type": "HAS_BIRTH_EVENT",
                        "relation_to": "Birth",
                        "cardinality": "ZeroOrOne",
                        "inline_relation": true
                    },
                    "parents": {
                        "type": "relation",
                        "relation_type": "HAS_PARENT",
                        "relation_to": "Person",
                        "cardinality": "ZeroOrMore",
                        "relation_fields": {
                            "certainty": {
                                "type": "property",
                                "property_type": "IntegerProperty",
                                "default_value": 1
                            }
                        }
                    }
                },
                "reverse_relations": {
                    "children": { "relation_to": "Person" }
                },
                "meta": {
                    "display_name": "Person",
                    "label_template": "{forename} {surname}",
                    "order_fields": ["forename", "surname"]
                },
                "subclasses_list": [],
                "json_schema": {}
            },
            "birth": {
                "top_level": false,
                "app": "core",
                "fields": {
                    "date": {
                        "type": "property",
                        "property_type": "DateProperty",
                        "default_value": "",
                        "required": false
                    },
                    "place": {
                        "type": "property",
                        "property_type": "StringProperty",
                        "default_value": "",
                        "required": false
                    }
                },
                "meta": {
                    "abstract": false,
                    "inline_only": true
                },
                "subclasses_list": ["BirthApproximate"],
                "json_schema": {}
            },
            "birthapproximate": {
                "top_level": false,
                "app": "core",
                "fields": {},
                "meta": { "inline_only": true },
                "subclasses_list": [],
                "json_schema": {}
            }
        }))
        .unwrap()
    }

    // ========== Deserialization ==========

    #[test]
    fn test_field_dispatch_on_type_tag() {
        let schema = sample_schema();
        let person = schema.descriptor("person").unwrap();
        assert!(matches!(
            person.field("forename"),
            Some(Field::Property(p)) if p.property_type == PropertyType::String
        ));
        assert!(person.field("parents").unwrap().is_relation());
        assert!(person.field("birth_event").unwrap().is_inline_relation());
    }

    #[test]
    fn test_unknown_property_type_is_preserved() {
        let field: Field = serde_json::from_value(json!({
            "type": "property",
            "property_type": "GeoPointProperty"
        }))
        .unwrap();
        match field {
            Field::Property(p) => {
                assert_eq!(p.property_type, PropertyType::Other("GeoPointProperty".into()))
            }
            _ => panic!("expected property field"),
        }
    }

    #[test]
    fn test_relation_edge_fields_deserialize() {
        let schema = sample_schema();
        let person = schema.descriptor("person").unwrap();
        match person.field("parents") {
            Some(Field::Relation(r)) => {
                assert_eq!(r.relation_type, "HAS_PARENT");
                assert_eq!(r.target_key(), "person");
                assert!(r.relation_fields.contains_key("certainty"));
            }
            _ => panic!("expected relation field"),
        }
    }

    // ========== Lookup and display names ==========

    #[test]
    fn test_descriptor_lookup_is_case_insensitive() {
        let schema = sample_schema();
        assert!(schema.descriptor("Person").is_ok());
        assert!(schema.descriptor("PERSON").is_ok());
        assert!(schema.descriptor("planet").is_err());
    }

    #[test]
    fn test_display_name_fallbacks() {
        let schema = sample_schema();
        assert_eq!(schema.display_name("person"), "Person");
        assert_eq!(schema.display_name_plural("person"), "Persons");
        // No display_name set: the raw type name stands in.
        assert_eq!(schema.display_name("birth"), "birth");
        assert_eq!(schema.display_name_plural("birth"), "births");
    }

    // ========== Field ordering ==========

    #[test]
    fn test_order_fields_put_label_first_and_unlisted_last() {
        let schema = sample_schema();
        let person = schema.descriptor("person").unwrap();
        let names: Vec<&str> = person
            .ordered_fields()
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["label", "forename", "surname", "birth_event", "parents"]
        );
    }

    #[test]
    fn test_served_order_stands_without_order_fields() {
        let schema = sample_schema();
        let birth = schema.descriptor("birth").unwrap();
        let names: Vec<&str> = birth
            .ordered_fields()
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(names, vec!["date", "place"]);
    }

    // ========== Cardinality ==========

    #[test]
    fn test_cardinality_capacity() {
        assert!(Cardinality::One.at_capacity(1));
        assert!(Cardinality::ZeroOrOne.at_capacity(1));
        assert!(!Cardinality::ZeroOrOne.at_capacity(0));
        assert!(!Cardinality::ZeroOrMore.at_capacity(10));
        assert!(!Cardinality::OneOrMore.at_capacity(10));
    }

    #[test]
    fn test_cardinality_lower_bound() {
        assert!(Cardinality::One.requires_at_least_one());
        assert!(Cardinality::OneOrMore.requires_at_least_one());
        assert!(!Cardinality::ZeroOrOne.requires_at_least_one());
        assert!(!Cardinality::ZeroOrMore.requires_at_least_one());
    }

    // ========== Inline subtype options ==========

    #[test]
    fn test_inline_options_declared_type_first() {
        let schema = sample_schema();
        let options = schema.inline_subtype_options("Birth").unwrap();
        assert_eq!(options, vec!["birth", "birthapproximate"]);
    }

    #[test]
    fn test_inline_options_skip_abstract_declared_type() {
        let mut schema = sample_schema();
        let birth = schema.entities.get_mut("birth").unwrap();
        birth.meta.is_abstract = true;
        let options = schema.inline_subtype_options("Birth").unwrap();
        assert_eq!(options, vec!["birthapproximate"]);
    }

    // ========== Catalogue validation ==========

    #[test]
    fn test_validate_accepts_consistent_schema() {
        assert!(sample_schema().validate().is_ok());
    }

    #[test]
    fn test_validate_flags_dangling_relation_target() {
        let mut schema = sample_schema();
        let person = schema.entities.get_mut("person").unwrap();
        if let Some(Field::Relation(r)) = person.fields.get_mut("parents") {
            r.relation_to = "Ghost".to_string();
        }
        let errors = schema.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("unknown type 'Ghost'")));
    }

    #[test]
    fn test_listable_types_exclude_inline_only() {
        let schema = sample_schema();
        assert_eq!(schema.listable_types(), vec!["person"]);
    }

    #[test]
    fn test_list_cache_flag_defaults_on() {
        let schema = sample_schema();
        let person = schema.descriptor("person").unwrap();
        assert!(person.meta.list_cache_enabled());
        let meta = EntityMeta {
            use_list_cache: Some(false),
            ..Default::default()
        };
        assert!(!meta.list_cache_enabled());
    }
}
