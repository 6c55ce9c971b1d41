//! Typed schema descriptor: source field → canonical column, type, merge strategy.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use crate::fields;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Integer,
    Boolean,
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    GroupBy,
    Aggregate,
    First,
    Sum,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Translation {
    #[default]
    None,
    /// Raw value looked up as-is.
    Direct,
    /// `http://<host>/` prefix removed before lookup.
    UrlStripped,
    /// Comma separated list, each token looked up.
    Multi,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub source: String,
    pub canonical: String,
    pub column_type: ColumnType,
    pub merge: MergeStrategy,
    pub repeated: bool,
    pub translation: Translation,
}

impl ColumnSpec {
    pub fn new(source: &str, canonical: &str, column_type: ColumnType, merge: MergeStrategy) -> Self {
        Self {
            source: source.to_string(),
            canonical: canonical.to_string(),
            column_type,
            merge,
            repeated: false,
            translation: Translation::None,
        }
    }

    pub fn repeated(mut self) -> Self {
        self.repeated = true;
        self
    }

    pub fn translated(mut self, translation: Translation) -> Self {
        self.translation = translation;
        self
    }
}

/// Canonical names of the columns the store treats specially.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roles {
    pub natural_key: String,
    pub local_key: String,
    pub load_timestamp: String,
    pub area_label: String,
    pub merge_count: String,
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("reading schema descriptor: {0}")]
    Csv(#[from] csv::Error),
    #[error("line {line}: unknown column type `{value}`")]
    UnknownType { line: usize, value: String },
    #[error("line {line}: unknown merge strategy `{value}`")]
    UnknownMerge { line: usize, value: String },
    #[error("line {line}: unknown translation kind `{value}`")]
    UnknownTranslation { line: usize, value: String },
    #[error("line {line}: repeated flag must be true or false, got `{value}`")]
    InvalidRepeated { line: usize, value: String },
    #[error("schema descriptor has no columns")]
    Empty,
    #[error("source field `{0}` is described more than once")]
    DuplicateSource(String),
    #[error("canonical column `{0}` is produced by more than one source field")]
    DuplicateCanonical(String),
    #[error("no column is tagged GROUPBY")]
    NoGroupBy,
    #[error("column `{column}`: merge strategy {merge} cannot apply to {column_type} values")]
    IncompatibleMerge {
        column: String,
        merge: MergeStrategy,
        column_type: ColumnType,
    },
    #[error("required {role} column (source `{source_field}`) is missing")]
    MissingRole {
        role: &'static str,
        source_field: &'static str,
    },
    #[error("{role} column `{column}` must be of type {expected}")]
    RoleType {
        role: &'static str,
        column: String,
        expected: ColumnType,
    },
}

impl FromStr for ColumnType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" | "str" | "text" => Ok(ColumnType::String),
            "integer" | "int" => Ok(ColumnType::Integer),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "date" => Ok(ColumnType::Date),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::String => "string",
            ColumnType::Integer => "integer",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
        };
        f.write_str(name)
    }
}

impl FromStr for MergeStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GROUPBY" => Ok(MergeStrategy::GroupBy),
            "AGGREGATE" => Ok(MergeStrategy::Aggregate),
            "FIRST" => Ok(MergeStrategy::First),
            "SUM" => Ok(MergeStrategy::Sum),
            "MAX" => Ok(MergeStrategy::Max),
            _ => Err(()),
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeStrategy::GroupBy => "GROUPBY",
            MergeStrategy::Aggregate => "AGGREGATE",
            MergeStrategy::First => "FIRST",
            MergeStrategy::Sum => "SUM",
            MergeStrategy::Max => "MAX",
        };
        f.write_str(name)
    }
}

impl FromStr for Translation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Translation::None),
            "direct" => Ok(Translation::Direct),
            "url" => Ok(Translation::UrlStripped),
            "multi" => Ok(Translation::Multi),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DescriptorRow {
    source: String,
    canonical: String,
    #[serde(rename = "type")]
    column_type: String,
    merge: String,
    #[serde(default)]
    repeated: String,
    #[serde(default)]
    translate: String,
}

impl DescriptorRow {
    fn into_spec(self, line: usize) -> Result<ColumnSpec, SchemaError> {
        let column_type = self.column_type.parse().map_err(|_| SchemaError::UnknownType {
            line,
            value: self.column_type.clone(),
        })?;
        let merge = self.merge.parse().map_err(|_| SchemaError::UnknownMerge {
            line,
            value: self.merge.clone(),
        })?;
        let translation = self.translate.parse().map_err(|_| SchemaError::UnknownTranslation {
            line,
            value: self.translate.clone(),
        })?;
        let repeated = match self.repeated.trim().to_ascii_lowercase().as_str() {
            "" | "false" | "no" | "0" => false,
            "true" | "yes" | "1" => true,
            _ => {
                return Err(SchemaError::InvalidRepeated {
                    line,
                    value: self.repeated,
                })
            }
        };
        Ok(ColumnSpec {
            source: self.source.trim().to_string(),
            canonical: self.canonical.trim().to_string(),
            column_type,
            merge,
            repeated,
            translation,
        })
    }
}

/// Validated column table shared by the transform pipeline and the store.
#[derive(Debug, Clone)]
pub struct SchemaDescriptor {
    columns: Vec<ColumnSpec>,
    by_source: HashMap<String, usize>,
    by_canonical: HashMap<String, usize>,
    roles: Roles,
}

impl SchemaDescriptor {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path.as_ref())?;
        Self::from_csv(reader)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, SchemaError> {
        let reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        Self::from_csv(reader)
    }

    fn from_csv<R: Read>(mut reader: csv::Reader<R>) -> Result<Self, SchemaError> {
        let mut columns = Vec::new();
        for (index, row) in reader.deserialize::<DescriptorRow>().enumerate() {
            // header is line 1
            columns.push(row?.into_spec(index + 2)?);
        }
        Self::from_columns(columns)
    }

    pub fn from_columns(columns: Vec<ColumnSpec>) -> Result<Self, SchemaError> {
        if columns.is_empty() {
            return Err(SchemaError::Empty);
        }

        let mut by_source = HashMap::new();
        let mut by_canonical = HashMap::new();
        for (index, column) in columns.iter().enumerate() {
            if by_source.insert(column.source.clone(), index).is_some() {
                return Err(SchemaError::DuplicateSource(column.source.clone()));
            }
            if by_canonical.insert(column.canonical.clone(), index).is_some() {
                return Err(SchemaError::DuplicateCanonical(column.canonical.clone()));
            }
            validate_merge(column)?;
        }

        if !columns.iter().any(|c| c.merge == MergeStrategy::GroupBy) {
            return Err(SchemaError::NoGroupBy);
        }

        let role = |role: &'static str, source: &'static str| -> Result<&ColumnSpec, SchemaError> {
            by_source
                .get(source)
                .map(|i| &columns[*i])
                .ok_or(SchemaError::MissingRole {
                    role,
                    source_field: source,
                })
        };
        let natural_key = role("natural key", fields::NATURAL_KEY)?;
        let local_key = role("local key", fields::LOCAL_KEY)?;
        let load_timestamp = role("load timestamp", fields::LOAD_DATE)?;
        let area_label = role("area label", fields::MUNICIPALITY)?;
        let merge_count = role("merge count", fields::MERGE_COUNT)?;

        for (name, column, expected) in [
            ("natural key", natural_key, ColumnType::String),
            ("local key", local_key, ColumnType::String),
            ("area label", area_label, ColumnType::String),
            ("merge count", merge_count, ColumnType::Integer),
        ] {
            if column.column_type != expected {
                return Err(SchemaError::RoleType {
                    role: name,
                    column: column.canonical.clone(),
                    expected,
                });
            }
        }

        let roles = Roles {
            natural_key: natural_key.canonical.clone(),
            local_key: local_key.canonical.clone(),
            load_timestamp: load_timestamp.canonical.clone(),
            area_label: area_label.canonical.clone(),
            merge_count: merge_count.canonical.clone(),
        };

        Ok(Self {
            columns,
            by_source,
            by_canonical,
            roles,
        })
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn roles(&self) -> &Roles {
        &self.roles
    }

    pub fn column_for_source(&self, source: &str) -> Option<&ColumnSpec> {
        self.by_source.get(source).map(|i| &self.columns[*i])
    }

    pub fn column(&self, canonical: &str) -> Option<&ColumnSpec> {
        self.by_canonical.get(canonical).map(|i| &self.columns[*i])
    }

    pub fn contains_source(&self, source: &str) -> bool {
        self.by_source.contains_key(source)
    }

    pub fn canonical_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.canonical.as_str())
    }

    pub fn with_merge(&self, merge: MergeStrategy) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.iter().filter(move |c| c.merge == merge)
    }

    pub fn repeated_sources(&self) -> HashSet<&str> {
        self.columns
            .iter()
            .filter(|c| c.repeated)
            .map(|c| c.source.as_str())
            .collect()
    }
}

fn validate_merge(column: &ColumnSpec) -> Result<(), SchemaError> {
    let compatible = match column.merge {
        MergeStrategy::GroupBy | MergeStrategy::First => true,
        MergeStrategy::Aggregate => column.column_type == ColumnType::String,
        MergeStrategy::Sum => column.column_type == ColumnType::Integer,
        MergeStrategy::Max => matches!(column.column_type, ColumnType::Integer | ColumnType::Date),
    };
    if compatible {
        Ok(())
    } else {
        Err(SchemaError::IncompatibleMerge {
            column: column.canonical.clone(),
            merge: column.merge,
            column_type: column.column_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HEADER: &str = "source,canonical,type,merge,repeated,translate\n";
    const ROLES: &str = "unit.unitId,occurrence_id,string,AGGREGATE,,\n\
computed.localId,local_id,string,AGGREGATE,,\n\
document.loadDate,load_date,date,MAX,,\n\
computed.municipality,municipality,string,GROUPBY,,\n\
computed.mergeCount,merged_count,integer,FIRST,,\n";

    fn parse(extra: &str) -> Result<SchemaDescriptor, SchemaError> {
        let text = format!("{HEADER}{ROLES}{extra}");
        SchemaDescriptor::from_reader(text.as_bytes())
    }

    #[test]
    fn loads_columns_and_roles() {
        let descriptor = parse(
            "unit.linkings.taxon.scientificName,scientific_name,string,GROUPBY,,\n\
             unit.interpretations.individualCount,individual_count,integer,SUM,,\n\
             unit.keywords,keywords,string,AGGREGATE,true,\n\
             unit.sex,sex,string,FIRST,,multi\n",
        )
        .expect("descriptor");

        assert_eq!(descriptor.columns().len(), 9);
        assert_eq!(descriptor.roles().natural_key, "occurrence_id");
        assert_eq!(descriptor.roles().merge_count, "merged_count");
        let keywords = descriptor.column_for_source("unit.keywords").unwrap();
        assert!(keywords.repeated);
        assert_eq!(
            descriptor.column("sex").unwrap().translation,
            Translation::Multi
        );
        assert_eq!(descriptor.with_merge(MergeStrategy::GroupBy).count(), 2);
        assert!(descriptor.repeated_sources().contains("unit.keywords"));
    }

    #[test]
    fn loads_from_path() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "{HEADER}{ROLES}").expect("write");
        let descriptor = SchemaDescriptor::from_path(file.path()).expect("descriptor");
        assert_eq!(descriptor.canonical_names().count(), 5);
    }

    #[test]
    fn rejects_unknown_merge_tag_with_line_number() {
        let err = parse("unit.sex,sex,string,AVERAGE,,\n").unwrap_err();
        assert!(matches!(err, SchemaError::UnknownMerge { line: 7, .. }), "{err}");
    }

    #[test]
    fn rejects_sum_on_strings() {
        let err = parse("unit.sex,sex,string,SUM,,\n").unwrap_err();
        assert!(matches!(err, SchemaError::IncompatibleMerge { .. }));
    }

    #[test]
    fn rejects_max_on_strings() {
        let err = parse("unit.sex,sex,string,MAX,,\n").unwrap_err();
        assert!(matches!(err, SchemaError::IncompatibleMerge { .. }), "{err}");
        assert!(parse("gathering.accuracy,accuracy,integer,MAX,,\n").is_ok());
    }

    #[test]
    fn rejects_duplicate_canonical_names() {
        let err = parse("unit.sex,municipality,string,FIRST,,\n").unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateCanonical(name) if name == "municipality"));
    }

    #[test]
    fn requires_role_columns() {
        let text = format!("{HEADER}unit.unitId,occurrence_id,string,GROUPBY,,\n");
        let err = SchemaDescriptor::from_reader(text.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            SchemaError::MissingRole {
                source_field: fields::LOCAL_KEY,
                ..
            }
        ));
    }

    #[test]
    fn requires_a_groupby_column() {
        let columns = vec![ColumnSpec::new("a", "a", ColumnType::String, MergeStrategy::First)];
        assert!(matches!(
            SchemaDescriptor::from_columns(columns),
            Err(SchemaError::NoGroupBy)
        ));
    }
}
