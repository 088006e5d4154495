// Label templates - derive display labels from record data

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(.*?)\}").unwrap());
static MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s\s+").unwrap());

/// Key that maps every element of an array instead of the first one.
const ALL_ELEMENTS: &str = "__all__";

/// Renders `template` against `data`, substituting each `{path}`
/// placeholder. Paths may be dotted to reach into nested objects and
/// relation arrays; values that are missing or null render as the
/// empty string. Runs of whitespace collapse to a single space.
pub fn render(template: &str, data: &Value) -> String {
    let substituted = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        let path: Vec<&str> = caps[1].split('.').collect();
        lookup(data, &path).unwrap_or_default()
    });
    MULTI_SPACE.replace_all(&substituted, " ").into_owned()
}

/// Walks a dotted path through nested objects and relation arrays.
///
/// A non-terminal array step descends into the first element, except
/// for the `__all__` key which maps the remaining path over every
/// element and joins the results with ", ". A terminal array step
/// reads the key off the first element.
fn lookup(nested: &Value, path: &[&str]) -> Option<String> {
    let (key, rest) = path.split_first()?;
    if !rest.is_empty() {
        return match nested {
            Value::Array(items) => {
                if *key == ALL_ELEMENTS {
                    let parts: Vec<String> = items
                        .iter()
                        .filter_map(|item| lookup(item, rest))
                        .collect();
                    Some(parts.join(", "))
                } else {
                    lookup(items.first()?.get(*key)?, rest)
                }
            }
            _ => lookup(nested.get(*key)?, rest),
        };
    }
    let value = match nested {
        Value::Array(items) => items.first()?.get(*key)?,
        _ => nested.get(*key)?,
    };
    scalar_text(value)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
