//! Read-only reference tables loaded once per run.

use std::collections::HashMap;

use geo::MultiPolygon;

use crate::Crs;

/// Enumeration code → display label, with a normalized reverse index for filters.
#[derive(Debug, Clone, Default)]
pub struct ValueRanges {
    labels: HashMap<String, String>,
    codes_by_label: HashMap<String, String>,
}

fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl ValueRanges {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut labels = HashMap::new();
        let mut codes_by_label = HashMap::new();
        for (code, label) in entries {
            let code = code.into();
            let label = label.into();
            // first code wins when two codes share a label
            codes_by_label
                .entry(normalize_label(&label))
                .or_insert_with(|| code.clone());
            labels.insert(code, label);
        }
        Self {
            labels,
            codes_by_label,
        }
    }

    pub fn label_for(&self, code: &str) -> Option<&str> {
        self.labels.get(code).map(String::as_str)
    }

    /// Case- and whitespace-insensitive reverse lookup.
    pub fn code_for_label(&self, label: &str) -> Option<&str> {
        self.codes_by_label
            .get(&normalize_label(label))
            .map(String::as_str)
    }

    /// Filter-side translation: labels become codes, anything else passes through.
    pub fn translate_filter(&self, value: &str) -> String {
        value
            .split(',')
            .map(|token| {
                let token = token.trim();
                self.code_for_label(token).unwrap_or(token).to_string()
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectionNames {
    names: HashMap<String, String>,
}

impl CollectionNames {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            names: entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn long_name(&self, collection_id: &str) -> Option<&str> {
        self.names.get(collection_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonGroup {
    pub id: String,
    pub name: Option<String>,
    pub name_en: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaxonomyTable {
    groups: HashMap<String, TaxonGroup>,
}

impl TaxonomyTable {
    pub fn new(groups: impl IntoIterator<Item = TaxonGroup>) -> Self {
        Self {
            groups: groups.into_iter().map(|g| (g.id.clone(), g)).collect(),
        }
    }

    pub fn get(&self, group_id: &str) -> Option<&TaxonGroup> {
        self.groups.get(group_id)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Municipality polygon tagged with the ELY area it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaPolygon {
    pub municipality: String,
    pub ely: String,
    pub geometry: MultiPolygon<f64>,
}

#[derive(Debug, Clone)]
pub struct ReferenceTables {
    pub value_ranges: ValueRanges,
    pub collections: CollectionNames,
    pub taxonomy: TaxonomyTable,
    pub areas: Vec<AreaPolygon>,
    pub areas_crs: Crs,
}

impl Default for ReferenceTables {
    fn default() -> Self {
        Self {
            value_ranges: ValueRanges::default(),
            collections: CollectionNames::default(),
            taxonomy: TaxonomyTable::default(),
            areas: Vec::new(),
            areas_crs: Crs::Wgs84,
        }
    }
}
