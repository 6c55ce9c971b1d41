//! Rename to canonical columns and coerce to the declared types.

use std::collections::BTreeMap;

use biosync_core::{ColumnType, SchemaDescriptor, Value};
use chrono::NaiveDate;
use tracing::debug;

/// Keeps exactly the descriptor's columns, keyed by canonical name. Unknown
/// source fields are dropped and absent ones become `Null`.
pub fn project(mut fields: BTreeMap<String, Value>, descriptor: &SchemaDescriptor) -> BTreeMap<String, Value> {
    descriptor
        .columns()
        .iter()
        .map(|column| {
            let raw = fields.remove(&column.source).unwrap_or_default();
            let value = coerce(&raw, column.column_type).unwrap_or_else(|| {
                debug!(column = %column.canonical, value = %raw, "value does not coerce, storing null");
                Value::Null
            });
            (column.canonical.clone(), value)
        })
        .collect()
}

/// `None` means the value was present but could not be coerced.
pub fn coerce(value: &Value, column_type: ColumnType) -> Option<Value> {
    if value.is_missing() {
        return Some(Value::Null);
    }
    match column_type {
        ColumnType::String => value.as_text().map(Value::Str),
        ColumnType::Integer => match value {
            Value::Bool(_) | Value::List(_) | Value::Date(_) => None,
            other => other.as_i64().map(Value::Int),
        },
        ColumnType::Date => match value {
            Value::Date(d) => Some(Value::Date(*d)),
            Value::Str(s) => parse_date(s).map(Value::Date),
            _ => None,
        },
        ColumnType::Boolean => match value {
            Value::Bool(b) => Some(Value::Bool(*b)),
            Value::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                "none" => Some(Value::Null),
                _ => None,
            },
            _ => None,
        },
    }
}

/// Strict `YYYY-MM-DD`.
fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let shaped = raw.len() == 10
        && raw
            .bytes()
            .enumerate()
            .all(|(i, b)| if i == 4 || i == 7 { b == b'-' } else { b.is_ascii_digit() });
    if !shaped {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use biosync_core::{fields, ColumnSpec, MergeStrategy};

    #[test]
    fn dates_are_strict() {
        assert_eq!(
            coerce(&Value::from("2024-06-01"), ColumnType::Date),
            Some(Value::Date(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()))
        );
        assert_eq!(coerce(&Value::from("2024-6-1"), ColumnType::Date), None);
        assert_eq!(coerce(&Value::from("2024-06-01T10:00"), ColumnType::Date), None);
        assert_eq!(coerce(&Value::from("2024-02-30"), ColumnType::Date), None);
    }

    #[test]
    fn booleans_accept_none_as_null() {
        assert_eq!(coerce(&Value::from("TRUE"), ColumnType::Boolean), Some(Value::Bool(true)));
        assert_eq!(coerce(&Value::from("None"), ColumnType::Boolean), Some(Value::Null));
        assert_eq!(coerce(&Value::from("yes"), ColumnType::Boolean), None);
    }

    #[test]
    fn integers_and_strings() {
        assert_eq!(coerce(&Value::from(" 42 "), ColumnType::Integer), Some(Value::Int(42)));
        assert_eq!(coerce(&Value::Float(3.0), ColumnType::Integer), Some(Value::Int(3)));
        assert_eq!(coerce(&Value::Float(3.5), ColumnType::Integer), None);
        assert_eq!(coerce(&Value::Int(7), ColumnType::String), Some(Value::from("7")));
        assert_eq!(coerce(&Value::from("nan"), ColumnType::String), Some(Value::Null));
    }

    #[test]
    fn projection_renames_synthesizes_and_drops() {
        let descriptor = SchemaDescriptor::from_columns(vec![
            ColumnSpec::new(fields::NATURAL_KEY, "occurrence_id", ColumnType::String, MergeStrategy::First),
            ColumnSpec::new(fields::LOCAL_KEY, "local_id", ColumnType::String, MergeStrategy::First),
            ColumnSpec::new(fields::LOAD_DATE, "load_date", ColumnType::Date, MergeStrategy::Max),
            ColumnSpec::new(fields::MUNICIPALITY, "municipality", ColumnType::String, MergeStrategy::GroupBy),
            ColumnSpec::new(fields::MERGE_COUNT, "merged_count", ColumnType::Integer, MergeStrategy::Sum),
        ])
        .unwrap();
        let mut source = BTreeMap::new();
        source.insert(fields::NATURAL_KEY.to_string(), Value::from("http://tun.fi/JX.1#1"));
        source.insert(fields::LOAD_DATE.to_string(), Value::from("not a date"));
        source.insert("unit.somethingElse".to_string(), Value::from("dropped"));

        let projected = project(source, &descriptor);
        assert_eq!(projected.len(), 5);
        assert_eq!(projected["occurrence_id"], Value::from("http://tun.fi/JX.1#1"));
        assert_eq!(projected["load_date"], Value::Null);
        assert_eq!(projected["municipality"], Value::Null);
        assert!(!projected.contains_key("unit.somethingElse"));
    }
}
