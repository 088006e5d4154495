// Typed inputs - editing masks applied per property type

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::schema::PropertyType;

static FLOAT_MASK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d*(?:\.\d*)?$").unwrap());
static INTEGER_MASK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[+-]?\d*$").unwrap());
static EMAIL_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());

/// Applies an edit under the property type's mask and returns the
/// value to store. Input the mask rejects reverts to `current`, so a
/// bad keystroke can never corrupt the record.
///
/// Numeric values stay strings in the record, exactly as the server
/// takes them; booleans become real booleans.
pub fn apply_input(property_type: &PropertyType, current: &Value, raw: &str) -> Value {
    match property_type {
        PropertyType::Float => {
            if FLOAT_MASK.is_match(raw) {
                Value::String(raw.to_string())
            } else {
                current.clone()
            }
        }
        PropertyType::Integer => {
            if INTEGER_MASK.is_match(raw) {
                Value::String(raw.to_string())
            } else {
                current.clone()
            }
        }
        PropertyType::Boolean => match parse_bool(raw) {
            Some(flag) => Value::Bool(flag),
            None => current.clone(),
        },
        PropertyType::Date => {
            if raw.is_empty() || NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok() {
                Value::String(raw.to_string())
            } else {
                current.clone()
            }
        }
        // Emails always accept; validity is reported separately so the
        // user can keep typing. Datetimes edit as free ISO text.
        PropertyType::String
        | PropertyType::Email
        | PropertyType::DateTime
        | PropertyType::Other(_) => Value::String(raw.to_string()),
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Empty is fine; required-ness is validation's business.
pub fn email_is_valid(text: &str) -> bool {
    text.is_empty() || EMAIL_SHAPE.is_match(text)
}

/// Warning shown beside a field whose current value does not fit its
/// type, without blocking further edits.
pub fn soft_warning(property_type: &PropertyType, value: &Value) -> Option<String> {
    if let (PropertyType::Email, Some(text)) = (property_type, value.as_str()) {
        if !email_is_valid(text) {
            return Some("not a valid email address".to_string());
        }
    }
    None
}
