//! Core domain model for biosync: record values, canonical records, partitions,
//! the schema descriptor and the read-only reference tables.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use geo::{Geometry, LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod crs;
pub mod reference;
pub mod schema;

pub use crs::Crs;
pub use reference::{AreaPolygon, CollectionNames, ReferenceTables, TaxonGroup, TaxonomyTable, ValueRanges};
pub use schema::{ColumnSpec, ColumnType, MergeStrategy, Roles, SchemaDescriptor, SchemaError, Translation};

pub const CRATE_NAME: &str = "biosync-core";

/// Source field names the pipeline reads or synthesizes.
pub mod fields {
    pub const NATURAL_KEY: &str = "unit.unitId";
    pub const LOAD_DATE: &str = "document.loadDate";
    pub const COLLECTION_ID: &str = "document.collectionId";
    pub const INDIVIDUAL_COUNT: &str = "unit.interpretations.individualCount";
    pub const TAXON_GROUPS: &str = "unit.linkings.taxon.informalTaxonGroups[0]";

    pub const TAXON_GROUP_ID: &str = "taxonomy.informalGroupId";
    pub const TAXON_GROUP_NAME: &str = "taxonomy.informalGroupName";
    pub const TAXON_GROUP_NAME_EN: &str = "taxonomy.informalGroupNameEn";

    pub const OCCURRENCE_STATUS: &str = "computed.occurrenceStatus";
    pub const COLLECTION_NAME: &str = "computed.collectionName";
    pub const LOCAL_KEY: &str = "computed.localId";
    pub const MERGE_COUNT: &str = "computed.mergeCount";
    pub const MUNICIPALITY: &str = "computed.municipality";
    pub const ELY_AREA: &str = "computed.elyArea";
}

/// A single attribute value as it moves through the pipeline.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    List(Vec<Value>),
}

const MISSING_SENTINELS: [&str; 4] = ["nan", "NaN", "None", "null"];

impl Value {
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(_) => Value::Str(value.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for null, NaN and the string sentinels the warehouse uses for "no value".
    pub fn is_missing(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Float(f) => f.is_nan(),
            Value::Str(s) => MISSING_SENTINELS.contains(&s.trim()),
            Value::List(items) => items.iter().all(Value::is_missing),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// String cast used by joins and the `string` column type. Missing values yield `None`.
    pub fn as_text(&self) -> Option<String> {
        if self.is_missing() {
            return None;
        }
        match self {
            Value::Null => None,
            Value::Str(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Value::List(items) => {
                let parts = items.iter().filter_map(Value::as_text).collect::<Vec<_>>();
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join(", "))
                }
            }
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) if !f.is_nan() => Some(*f),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Stable textual identity used when grouping rows by value.
    pub fn group_key(&self) -> String {
        match self {
            Value::Null => "\u{0}null".to_string(),
            Value::Str(s) => format!("s:{s}"),
            Value::Int(i) => format!("i:{i}"),
            Value::Float(f) => format!("f:{f}"),
            Value::Bool(b) => format!("b:{b}"),
            Value::Date(d) => format!("d:{d}"),
            Value::List(items) => {
                let inner = items.iter().map(Value::group_key).collect::<Vec<_>>();
                format!("l:[{}]", inner.join("|"))
            }
        }
    }

    /// Ordering between comparable non-null values; mixed or null operands are unordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("null"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

/// Flat source record: dotted field names plus one optional geometry.
///
/// The same shape carries records through the transform stages until the final
/// stage turns them into [`CanonicalRecord`]s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    pub fields: BTreeMap<String, Value>,
    pub geometry: Option<Geometry<f64>>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_geometry(mut self, geometry: impl Into<Geometry<f64>>) -> Self {
        self.geometry = Some(geometry.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Option<String> {
        self.fields.get(name).and_then(Value::as_text)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }
}

/// Geometry family that decides the partition a record lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeometryKind {
    Point,
    Line,
    Polygon,
}

impl GeometryKind {
    pub const ALL: [GeometryKind; 3] = [GeometryKind::Point, GeometryKind::Line, GeometryKind::Polygon];

    /// `None` for geometry collections, which never reach a partition.
    pub fn of(geometry: &Geometry<f64>) -> Option<Self> {
        match geometry {
            Geometry::Point(_) | Geometry::MultiPoint(_) => Some(GeometryKind::Point),
            Geometry::Line(_) | Geometry::LineString(_) | Geometry::MultiLineString(_) => {
                Some(GeometryKind::Line)
            }
            Geometry::Polygon(_) | Geometry::MultiPolygon(_) | Geometry::Rect(_) | Geometry::Triangle(_) => {
                Some(GeometryKind::Polygon)
            }
            Geometry::GeometryCollection(_) => None,
        }
    }

    pub fn table_suffix(self) -> &'static str {
        match self {
            GeometryKind::Point => "points",
            GeometryKind::Line => "lines",
            GeometryKind::Polygon => "polygons",
        }
    }
}

/// One persisted table: `{region}_{points|lines|polygons}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub region: String,
    pub kind: GeometryKind,
}

impl Partition {
    pub fn new(region: &str, kind: GeometryKind) -> Self {
        Self {
            region: sanitize_region(region),
            kind,
        }
    }

    pub fn table_name(&self) -> String {
        format!("{}_{}", self.region, self.kind.table_suffix())
    }

    pub fn all_for_region(region: &str) -> Vec<Partition> {
        GeometryKind::ALL
            .iter()
            .map(|kind| Partition::new(region, *kind))
            .collect()
    }
}

pub fn sanitize_region(name: &str) -> String {
    let cleaned = name
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>();
    let cleaned = cleaned.trim_matches('_').to_string();
    if cleaned.is_empty() {
        "region".to_string()
    } else {
        cleaned
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("record has an empty natural key")]
    EmptyNaturalKey,
    #[error("geometry collections cannot be persisted")]
    GeometryCollection,
}

/// Fully transformed record ready for persistence.
///
/// The geometry is always a point, line string or polygon (or a multi variant);
/// `Line`, `Rect` and `Triangle` inputs are widened on construction.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    natural_key: String,
    local_key: String,
    attributes: BTreeMap<String, Value>,
    geometry: Geometry<f64>,
}

static NULL: Value = Value::Null;

impl CanonicalRecord {
    pub fn new(
        natural_key: impl Into<String>,
        local_key: impl Into<String>,
        attributes: BTreeMap<String, Value>,
        geometry: Geometry<f64>,
    ) -> Result<Self, RecordError> {
        let natural_key = natural_key.into();
        if natural_key.trim().is_empty() {
            return Err(RecordError::EmptyNaturalKey);
        }
        let geometry = canonical_geometry(geometry).ok_or(RecordError::GeometryCollection)?;
        Ok(Self {
            natural_key,
            local_key: local_key.into(),
            attributes,
            geometry,
        })
    }

    pub fn natural_key(&self) -> &str {
        &self.natural_key
    }

    pub fn local_key(&self) -> &str {
        &self.local_key
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> &Value {
        self.attributes.get(name).unwrap_or(&NULL)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: Value) {
        self.attributes.insert(name.into(), value);
    }

    pub fn geometry(&self) -> &Geometry<f64> {
        &self.geometry
    }

    pub fn kind(&self) -> GeometryKind {
        // canonical_geometry never admits collections
        GeometryKind::of(&self.geometry).unwrap_or(GeometryKind::Point)
    }
}

fn canonical_geometry(geometry: Geometry<f64>) -> Option<Geometry<f64>> {
    match geometry {
        Geometry::Line(line) => Some(Geometry::LineString(LineString::new(vec![line.start, line.end]))),
        Geometry::Rect(rect) => Some(Geometry::Polygon(rect.to_polygon())),
        Geometry::Triangle(triangle) => Some(Geometry::Polygon(triangle.to_polygon())),
        Geometry::GeometryCollection(_) => None,
        other => Some(other),
    }
}

/// Human-readable geometry type name, used in logs and reports.
pub fn geometry_type_name(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

/// Convenience constructors kept here so every crate builds fixtures the same way.
pub fn point(x: f64, y: f64) -> Geometry<f64> {
    Geometry::Point(Point::new(x, y))
}

pub fn multi_point(points: Vec<Point<f64>>) -> Geometry<f64> {
    Geometry::MultiPoint(MultiPoint::new(points))
}

pub fn multi_line(lines: Vec<LineString<f64>>) -> Geometry<f64> {
    Geometry::MultiLineString(MultiLineString::new(lines))
}

pub fn multi_polygon(polygons: Vec<Polygon<f64>>) -> Geometry<f64> {
    Geometry::MultiPolygon(MultiPolygon::new(polygons))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{line_string, Rect};

    #[test]
    fn missing_sentinels_are_detected() {
        assert!(Value::Null.is_missing());
        assert!(Value::Float(f64::NAN).is_missing());
        assert!(Value::from("NaN").is_missing());
        assert!(Value::from(" None ").is_missing());
        assert!(!Value::from("0").is_missing());
        assert!(!Value::Int(0).is_missing());
    }

    #[test]
    fn text_cast_joins_lists_and_skips_missing() {
        let value = Value::List(vec![Value::from("a"), Value::Null, Value::Int(3)]);
        assert_eq!(value.as_text().as_deref(), Some("a, 3"));
        assert_eq!(Value::Float(4.0).as_text().as_deref(), Some("4"));
        assert_eq!(Value::Null.as_text(), None);
    }

    #[test]
    fn json_numbers_keep_integer_precision() {
        let json = serde_json::json!({"a": 12, "b": 1.5, "c": [1, "x"]});
        assert_eq!(Value::from_json(&json["a"]), Value::Int(12));
        assert_eq!(Value::from_json(&json["b"]), Value::Float(1.5));
        assert_eq!(
            Value::from_json(&json["c"]),
            Value::List(vec![Value::Int(1), Value::from("x")])
        );
    }

    #[test]
    fn partitions_are_named_by_region_and_kind() {
        let p = Partition::new("Etelä-Häme", GeometryKind::Line);
        assert_eq!(p.table_name(), "etel__h_me_lines");
        let names = Partition::all_for_region("invasive")
            .iter()
            .map(Partition::table_name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["invasive_points", "invasive_lines", "invasive_polygons"]);
    }

    #[test]
    fn canonical_record_rejects_collections_and_widens_rects() {
        let collection = Geometry::GeometryCollection(geo::GeometryCollection::new_from(vec![point(1.0, 2.0)]));
        assert_eq!(
            CanonicalRecord::new("k", "k", BTreeMap::new(), collection),
            Err(RecordError::GeometryCollection)
        );

        let rect = Rect::new((0.0, 0.0), (1.0, 1.0));
        let record = CanonicalRecord::new("k", "k", BTreeMap::new(), Geometry::Rect(rect)).unwrap();
        assert_eq!(record.kind(), GeometryKind::Polygon);
        assert!(matches!(record.geometry(), Geometry::Polygon(_)));

        let line = Geometry::LineString(line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0)]);
        let record = CanonicalRecord::new("k", "k", BTreeMap::new(), line).unwrap();
        assert_eq!(record.kind(), GeometryKind::Line);
    }

    #[test]
    fn empty_natural_key_is_rejected() {
        assert_eq!(
            CanonicalRecord::new("  ", "", BTreeMap::new(), point(0.0, 0.0)),
            Err(RecordError::EmptyNaturalKey)
        );
    }
}
