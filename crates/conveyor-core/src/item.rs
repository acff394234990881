//! Typed key/value items, the smallest unit of record data.

use chrono::format::StrftimeItems;
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::str::FromStr;

const DEFAULT_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const DATETIME_INPUT_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S",
];

const DATE_INPUT_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y%m%d"];

/// Declared type of a field's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Bool,
    Int,
    Decimal,
    DateTime,
    #[default]
    String,
}

impl FromStr for ItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bool" | "boolean" | "b" => Ok(ItemType::Bool),
            "int" | "integer" | "i" => Ok(ItemType::Int),
            "decimal" | "dec" | "m" => Ok(ItemType::Decimal),
            "datetime" | "date" | "d" => Ok(ItemType::DateTime),
            "string" | "str" | "s" => Ok(ItemType::String),
            other => Err(format!("unknown item type '{}'", other)),
        }
    }
}

/// A field value.
///
/// `Null` is a present key without a value; `Void` means the key does not
/// exist at all and is only ever produced by lookups, never stored.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Decimal(Decimal),
    DateTime(NaiveDateTime),
    String(String),
    Null,
    #[default]
    Void,
}

impl Value {
    /// The neutral value of a type, used when text cannot be parsed.
    pub fn default_for(item_type: ItemType) -> Value {
        match item_type {
            ItemType::Bool => Value::Bool(false),
            ItemType::Int => Value::Int(0),
            ItemType::Decimal => Value::Decimal(Decimal::ZERO),
            ItemType::DateTime => Value::DateTime(NaiveDateTime::default()),
            ItemType::String => Value::String(String::new()),
        }
    }

    /// Parse external text into a value of `item_type`.
    ///
    /// `format` is tried first for date/times. Text that does not parse yields
    /// [`Value::default_for`].
    pub fn parse(text: &str, item_type: ItemType, format: &str) -> Value {
        let parsed = match item_type {
            ItemType::String => return Value::String(text.to_string()),
            ItemType::Bool => parse_bool(text.trim()).map(Value::Bool),
            ItemType::Int => text.trim().parse::<i64>().ok().map(Value::Int),
            ItemType::Decimal => Decimal::from_str(text.trim()).ok().map(Value::Decimal),
            ItemType::DateTime => parse_datetime(text.trim(), format).map(Value::DateTime),
        };

        parsed.unwrap_or_else(|| {
            tracing::debug!(text, ?item_type, "unparseable value, using type default");
            Value::default_for(item_type)
        })
    }

    pub fn item_type(&self) -> Option<ItemType> {
        match self {
            Value::Bool(_) => Some(ItemType::Bool),
            Value::Int(_) => Some(ItemType::Int),
            Value::Decimal(_) => Some(ItemType::Decimal),
            Value::DateTime(_) => Some(ItemType::DateTime),
            Value::String(_) => Some(ItemType::String),
            Value::Null | Value::Void => None,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Decimal(d) => Some(*d),
            Value::Int(i) => Some(Decimal::from(*i)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    /// Render for output. An empty `format` selects the type's default rendering;
    /// for numerics a format of digits is the number of decimal places (decimal)
    /// or the zero-padded width (int).
    pub fn render(&self, format: &str) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => match format.trim().parse::<usize>() {
                Ok(width) => format!("{:0width$}", i, width = width),
                Err(_) => i.to_string(),
            },
            Value::Decimal(d) => match format.trim().parse::<usize>() {
                Ok(places) => format!("{:.*}", places, d),
                Err(_) => d.to_string(),
            },
            Value::DateTime(dt) => {
                let pattern = if format.is_empty() {
                    DEFAULT_DATETIME_FORMAT
                } else {
                    format
                };
                let mut rendered = String::new();
                if write!(rendered, "{}", dt.format(pattern)).is_ok() {
                    return rendered;
                }
                tracing::debug!(format = pattern, "invalid datetime format, using default");
                dt.format(DEFAULT_DATETIME_FORMAT).to_string()
            },
            Value::String(s) => s.clone(),
            Value::Null | Value::Void => String::new(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Decimal> for Value {
    fn from(d: Decimal) -> Self {
        Value::Decimal(d)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(dt: NaiveDateTime) -> Self {
        Value::DateTime(dt)
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

/// Whether `format` is a strftime pattern chrono can render.
pub fn is_valid_datetime_format(format: &str) -> bool {
    !StrftimeItems::new(format).any(|item| matches!(item, chrono::format::Item::Error))
}

pub(crate) fn parse_datetime(text: &str, format: &str) -> Option<NaiveDateTime> {
    if !format.is_empty() {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    DATETIME_INPUT_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
        .or_else(|| {
            DATE_INPUT_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(text, f).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// An immutable key/value pair with its output format.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    key: String,
    value: Value,
    format: String,
}

impl Item {
    pub fn new(key: impl Into<String>, value: impl Into<Value>, format: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            format: format.into(),
        }
    }

    /// The not-found sentinel for `key`.
    pub fn void(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Value::Void,
            format: String::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn is_void(&self) -> bool {
        self.value.is_void()
    }

    pub fn item_type(&self) -> Option<ItemType> {
        self.value.item_type()
    }

    /// The value rendered with this item's format.
    pub fn string_value(&self) -> String {
        self.value.render(&self.format)
    }

    /// A copy of this item carrying `value` instead.
    pub fn with_value(&self, value: impl Into<Value>) -> Item {
        Item {
            key: self.key.clone(),
            value: value.into(),
            format: self.format.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_typed_values() {
        assert_eq!(Value::parse(" 42 ", ItemType::Int, ""), Value::Int(42));
        assert_eq!(Value::parse("yes", ItemType::Bool, ""), Value::Bool(true));
        assert_eq!(
            Value::parse("12.50", ItemType::Decimal, ""),
            Value::Decimal(Decimal::new(1250, 2))
        );
        assert_eq!(
            Value::parse("2024-03-01", ItemType::DateTime, "")
                .as_datetime()
                .map(|d| d.to_string()),
            Some("2024-03-01 00:00:00".to_string())
        );
    }

    #[test]
    fn test_unparseable_text_falls_back_to_default() {
        assert_eq!(Value::parse("abc", ItemType::Int, ""), Value::Int(0));
        assert_eq!(Value::parse("", ItemType::Bool, ""), Value::Bool(false));
    }

    #[test]
    fn test_datetime_honours_custom_format() {
        let value = Value::parse("01.02.2023", ItemType::DateTime, "%d.%m.%Y");
        assert_eq!(value.render("%Y/%m/%d"), "2023/02/01");
    }

    #[test]
    fn test_invalid_datetime_format_renders_default() {
        let value = Value::parse("2024-03-01 10:20:30", ItemType::DateTime, "");
        let item = Item::new("WHEN", value, "%Y-%Q");
        assert_eq!(item.string_value(), "2024-03-01 10:20:30");

        assert!(is_valid_datetime_format("%d.%m.%Y %H:%M"));
        assert!(!is_valid_datetime_format("%Y-%Q"));
    }

    #[test]
    fn test_render_numeric_formats() {
        assert_eq!(Value::Int(7).render("3"), "007");
        assert_eq!(Value::Decimal(Decimal::new(5, 1)).render("2"), "0.50");
        assert_eq!(Value::Null.render(""), "");
    }

    #[test]
    fn test_void_item_is_sentinel() {
        let item = Item::void("MISSING");
        assert!(item.is_void());
        assert_eq!(item.key(), "MISSING");
        assert_eq!(item.item_type(), None);
        assert_eq!(item.string_value(), "");
    }

    #[test]
    fn test_with_value_keeps_key_and_format() {
        let item = Item::new("AMT", Decimal::new(1, 0), "2");
        let changed = item.with_value(Decimal::new(25, 1));
        assert_eq!(changed.key(), "AMT");
        assert_eq!(changed.string_value(), "2.50");
        assert_eq!(item.string_value(), "1.00");
    }
}
