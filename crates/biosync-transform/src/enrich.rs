//! Attribute enrichment stages that run on source field names, before projection.

use std::collections::{BTreeMap, BTreeSet};

use biosync_core::{fields, CollectionNames, RawRecord, SchemaDescriptor, TaxonomyTable, Value};
use regex::Regex;
use tracing::warn;

use crate::translate::strip_url_prefix;
use crate::TransformError;

/// Looks up the informal taxon group of each record.
pub struct TaxonomyEnricher {
    pattern: Regex,
    field: String,
}

impl TaxonomyEnricher {
    pub fn new(field: impl Into<String>) -> Result<Self, TransformError> {
        Ok(Self {
            pattern: Regex::new(r"MVL\.\d+")?,
            field: field.into(),
        })
    }

    pub fn group_id(&self, record: &RawRecord) -> Option<String> {
        let raw = record.text(&self.field)?;
        self.pattern.find(&raw).map(|m| m.as_str().to_string())
    }

    /// Rows without a recognizable or known group keep null taxonomy fields.
    pub fn apply(&self, records: &mut [RawRecord], table: &TaxonomyTable) {
        for record in records {
            let id = self.group_id(record);
            let group = id.as_deref().and_then(|id| table.get(id));
            let name = group.and_then(|g| g.name.clone());
            let name_en = group.and_then(|g| g.name_en.clone());
            record.set(fields::TAXON_GROUP_ID, id.map(Value::Str).unwrap_or_default());
            record.set(fields::TAXON_GROUP_NAME, name.map(Value::Str).unwrap_or_default());
            record.set(fields::TAXON_GROUP_NAME_EN, name_en.map(Value::Str).unwrap_or_default());
        }
    }
}

/// Pivots `<prefix>[n].fact` / `<prefix>[n].value` pairs into named columns.
pub struct FactFlattener {
    pattern: Regex,
    prefixes: BTreeSet<String>,
}

#[derive(Default)]
struct FactPair {
    name: Option<String>,
    value: Value,
}

impl FactFlattener {
    pub fn new(prefixes: &[String]) -> Result<Self, TransformError> {
        Ok(Self {
            pattern: Regex::new(r"^(.+)\[(\d+)\]\.(fact|value)$")?,
            prefixes: prefixes.iter().cloned().collect(),
        })
    }

    pub fn apply(&self, records: &mut [RawRecord], descriptor: &SchemaDescriptor) {
        let mut unknown = BTreeSet::new();
        for record in records.iter_mut() {
            self.flatten(record, descriptor, &mut unknown);
        }
        for name in unknown {
            warn!(fact = %name, "dropping fact that no schema column recognizes");
        }
    }

    fn flatten(&self, record: &mut RawRecord, descriptor: &SchemaDescriptor, unknown: &mut BTreeSet<String>) {
        let mut pairs: BTreeMap<(String, usize), FactPair> = BTreeMap::new();
        let mut indexed = Vec::new();

        for key in record.fields.keys() {
            let Some(caps) = self.pattern.captures(key) else {
                continue;
            };
            let prefix = &caps[1];
            if !self.prefixes.contains(prefix) {
                continue;
            }
            let Ok(index) = caps[2].parse::<usize>() else {
                continue;
            };
            indexed.push((key.clone(), prefix.to_string(), index, &caps[3] == "fact"));
        }

        for (key, prefix, index, is_name) in indexed {
            let value = record.remove(&key).unwrap_or_default();
            let pair = pairs.entry((prefix, index)).or_default();
            if is_name {
                pair.name = value.as_text().map(|n| strip_url_prefix(&n).to_string());
            } else {
                pair.value = value;
            }
        }

        for pair in pairs.into_values() {
            let Some(name) = pair.name else {
                continue;
            };
            if descriptor.contains_source(&name) {
                record.set(name, pair.value);
            } else {
                unknown.insert(name);
            }
        }
    }
}

/// Index of a `base[n]` column, if `key` is one.
fn repeated_index(key: &str, base: &str) -> Option<usize> {
    key.strip_prefix(base)?
        .strip_prefix('[')?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Combines `base[0]`, `base[1]`, ... of every column tagged repeated into `base`.
pub fn combine_repeated(records: &mut [RawRecord], descriptor: &SchemaDescriptor) {
    let bases = descriptor.repeated_sources();
    if bases.is_empty() {
        return;
    }
    for record in records {
        for base in &bases {
            let mut members = record
                .fields
                .keys()
                .filter_map(|key| repeated_index(key, base).map(|i| (i, key.clone())))
                .collect::<Vec<_>>();
            if members.is_empty() {
                continue;
            }
            members.sort_unstable_by_key(|(i, _)| *i);

            let parts = members
                .into_iter()
                .filter_map(|(_, key)| record.remove(&key))
                .filter_map(|value| value.as_text())
                .filter(|text| !text.trim().is_empty())
                .collect::<Vec<_>>();
            let combined = if parts.is_empty() {
                Value::Null
            } else {
                Value::Str(parts.join(","))
            };
            record.set(*base, combined);
        }
    }
}

/// Occurrence status, collection name, local key and the initial merge count.
pub fn computed_fields(records: &mut [RawRecord], collections: &CollectionNames) {
    for record in records {
        let status = match record.get(fields::INDIVIDUAL_COUNT) {
            Some(value) if !value.is_missing() => match value.as_f64() {
                Some(count) if count > 0.0 => Value::from("present"),
                Some(_) => Value::from("absent"),
                None => Value::Null,
            },
            _ => Value::Null,
        };
        record.set(fields::OCCURRENCE_STATUS, status);

        let collection = record
            .text(fields::COLLECTION_ID)
            .and_then(|id| {
                let fragment = id.rsplit('/').next().unwrap_or(&id).to_string();
                collections.long_name(&fragment).map(Value::from)
            })
            .unwrap_or_default();
        record.set(fields::COLLECTION_NAME, collection);

        let local = record
            .text(fields::NATURAL_KEY)
            .map(|key| Value::Str(local_key(&key)))
            .unwrap_or_default();
        record.set(fields::LOCAL_KEY, local);
        record.set(fields::MERGE_COUNT, Value::Int(1));
    }
}

/// Storage-safe form of a natural key.
pub fn local_key(natural_key: &str) -> String {
    natural_key.replace('#', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use biosync_core::{ColumnSpec, ColumnType, MergeStrategy, TaxonGroup};

    fn descriptor() -> SchemaDescriptor {
        SchemaDescriptor::from_columns(vec![
            ColumnSpec::new(fields::NATURAL_KEY, "occurrence_id", ColumnType::String, MergeStrategy::First),
            ColumnSpec::new(fields::LOCAL_KEY, "local_id", ColumnType::String, MergeStrategy::First),
            ColumnSpec::new(fields::LOAD_DATE, "load_date", ColumnType::Date, MergeStrategy::Max),
            ColumnSpec::new(fields::MUNICIPALITY, "municipality", ColumnType::String, MergeStrategy::GroupBy),
            ColumnSpec::new(fields::MERGE_COUNT, "merged_count", ColumnType::Integer, MergeStrategy::Sum),
            ColumnSpec::new("MY.weather", "weather", ColumnType::String, MergeStrategy::First),
            ColumnSpec::new("unit.keywords", "keywords", ColumnType::String, MergeStrategy::Aggregate).repeated(),
        ])
        .expect("descriptor")
    }

    #[test]
    fn taxonomy_join_keeps_unmatched_rows() {
        let table = TaxonomyTable::new([TaxonGroup {
            id: "MVL.1".into(),
            name: Some("Linnut".into()),
            name_en: Some("Birds".into()),
        }]);
        let enricher = TaxonomyEnricher::new(fields::TAXON_GROUPS).unwrap();
        let mut records = vec![
            RawRecord::new().with_field(fields::TAXON_GROUPS, "http://tun.fi/MVL.1"),
            RawRecord::new().with_field(fields::TAXON_GROUPS, "http://tun.fi/MVL.99"),
            RawRecord::new(),
        ];
        enricher.apply(&mut records, &table);

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].text(fields::TAXON_GROUP_NAME_EN).as_deref(), Some("Birds"));
        assert_eq!(records[1].text(fields::TAXON_GROUP_ID).as_deref(), Some("MVL.99"));
        assert_eq!(records[1].get(fields::TAXON_GROUP_NAME), Some(&Value::Null));
        assert_eq!(records[2].get(fields::TAXON_GROUP_ID), Some(&Value::Null));
    }

    #[test]
    fn facts_become_columns_and_unknown_facts_are_dropped() {
        let flattener = FactFlattener::new(&["unit.facts".to_string(), "gathering.facts".to_string()]).unwrap();
        let mut records = vec![RawRecord::new()
            .with_field("unit.facts[0].fact", "http://tun.fi/MY.weather")
            .with_field("unit.facts[0].value", "sunny")
            .with_field("gathering.facts[3].fact", "http://tun.fi/MY.unknownThing")
            .with_field("gathering.facts[3].value", "x")
            .with_field("document.facts[0].fact", "http://tun.fi/MY.weather")];
        flattener.apply(&mut records, &descriptor());

        let record = &records[0];
        assert_eq!(record.text("MY.weather").as_deref(), Some("sunny"));
        assert!(record.get("MY.unknownThing").is_none());
        assert!(record.get("unit.facts[0].fact").is_none());
        assert!(record.get("gathering.facts[3].value").is_none());
        // prefixes outside the configured set are left alone
        assert!(record.get("document.facts[0].fact").is_some());
    }

    #[test]
    fn repeated_columns_join_in_index_order() {
        let mut records = vec![RawRecord::new()
            .with_field("unit.keywords[10]", "c")
            .with_field("unit.keywords[2]", "b")
            .with_field("unit.keywords[0]", "a")
            .with_field("unit.keywords[1]", Value::Null)
            .with_field("unit.notKeywords[0]", "z")];
        combine_repeated(&mut records, &descriptor());

        let record = &records[0];
        assert_eq!(record.text("unit.keywords").as_deref(), Some("a,b,c"));
        assert!(record.get("unit.keywords[0]").is_none());
        assert!(record.get("unit.notKeywords[0]").is_some());
    }

    #[test]
    fn computed_fields_classify_counts_and_keys() {
        let collections = CollectionNames::new([("HR.128", "Vihko observations")]);
        let mut records = vec![
            RawRecord::new()
                .with_field(fields::NATURAL_KEY, "http://tun.fi/JX.1#2")
                .with_field(fields::INDIVIDUAL_COUNT, 3_i64)
                .with_field(fields::COLLECTION_ID, "http://tun.fi/HR.128"),
            RawRecord::new().with_field(fields::INDIVIDUAL_COUNT, 0_i64),
            RawRecord::new().with_field(fields::INDIVIDUAL_COUNT, "NaN"),
        ];
        computed_fields(&mut records, &collections);

        assert_eq!(records[0].text(fields::OCCURRENCE_STATUS).as_deref(), Some("present"));
        assert_eq!(records[1].text(fields::OCCURRENCE_STATUS).as_deref(), Some("absent"));
        assert_eq!(records[2].get(fields::OCCURRENCE_STATUS), Some(&Value::Null));
        assert_eq!(
            records[0].text(fields::COLLECTION_NAME).as_deref(),
            Some("Vihko observations")
        );
        assert_eq!(records[0].text(fields::LOCAL_KEY).as_deref(), Some("http://tun.fi/JX.1_2"));
        assert_eq!(records[1].get(fields::MERGE_COUNT), Some(&Value::Int(1)));
    }
}
