//! Enumeration code → label translation for columns tagged in the schema.

use biosync_core::{RawRecord, SchemaDescriptor, Translation, Value, ValueRanges};

/// Drops a leading `http://<host>/` or `https://<host>/`.
pub fn strip_url_prefix(value: &str) -> &str {
    let Some(rest) = value
        .strip_prefix("http://")
        .or_else(|| value.strip_prefix("https://"))
    else {
        return value;
    };
    match rest.find('/') {
        Some(slash) => &rest[slash + 1..],
        None => value,
    }
}

/// Translate one raw value; unmapped values come back unchanged.
pub fn translate_value(value: &Value, kind: Translation, ranges: &ValueRanges) -> Value {
    if kind == Translation::None || value.is_missing() {
        return value.clone();
    }
    let Some(text) = value.as_text() else {
        return value.clone();
    };
    match kind {
        Translation::None => value.clone(),
        Translation::Direct => ranges
            .label_for(&text)
            .map(Value::from)
            .unwrap_or_else(|| value.clone()),
        Translation::UrlStripped => ranges
            .label_for(strip_url_prefix(&text))
            .map(Value::from)
            .unwrap_or_else(|| value.clone()),
        Translation::Multi => {
            let tokens = text
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(|token| {
                    ranges
                        .label_for(token)
                        .or_else(|| ranges.label_for(strip_url_prefix(token)))
                        .unwrap_or(token)
                })
                .collect::<Vec<_>>();
            Value::Str(tokens.join(", "))
        }
    }
}

pub fn translate_values(records: &mut [RawRecord], descriptor: &SchemaDescriptor, ranges: &ValueRanges) {
    let translated = descriptor
        .columns()
        .iter()
        .filter(|c| c.translation != Translation::None)
        .collect::<Vec<_>>();
    if translated.is_empty() {
        return;
    }
    for record in records {
        for column in &translated {
            if let Some(value) = record.fields.get_mut(&column.source) {
                *value = translate_value(value, column.translation, ranges);
            }
        }
    }
}
