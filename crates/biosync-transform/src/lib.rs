//! Record transformation: raw warehouse records in, canonical records out.

use std::sync::Arc;

use biosync_core::{fields, CanonicalRecord, Crs, RawRecord, ReferenceTables, SchemaDescriptor, Value};
use thiserror::Error;
use tracing::{debug, warn};

pub mod area;
pub mod enrich;
pub mod geometry;
pub mod project;
pub mod translate;

pub use area::{load_area_polygons, AreaError, AreaResolver};
pub use geometry::{normalize_collection, repair, Repair};

pub const CRATE_NAME: &str = "biosync-transform";

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Clone)]
pub struct TransformConfig {
    /// Buffer applied to points and lines when a mixed collection is unioned.
    pub buffer_distance: f64,
    /// CRS the records arrive in; area polygons are reprojected into it.
    pub records_crs: Crs,
    pub fact_prefixes: Vec<String>,
    pub taxon_group_field: String,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            buffer_distance: 10.0,
            records_crs: Crs::EurefFin,
            fact_prefixes: vec![
                "unit.facts".to_string(),
                "gathering.facts".to_string(),
                "document.facts".to_string(),
            ],
            taxon_group_field: fields::TAXON_GROUPS.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct TransformOutput {
    pub records: Vec<CanonicalRecord>,
    pub collections_converted: u64,
    pub geometries_repaired: u64,
    /// Records without a natural key or without a usable geometry.
    pub dropped: u64,
}

pub struct TransformPipeline {
    descriptor: Arc<SchemaDescriptor>,
    references: Arc<ReferenceTables>,
    config: TransformConfig,
    taxonomy: enrich::TaxonomyEnricher,
    facts: enrich::FactFlattener,
    areas: AreaResolver,
}

impl TransformPipeline {
    pub fn new(
        descriptor: Arc<SchemaDescriptor>,
        references: Arc<ReferenceTables>,
        config: TransformConfig,
    ) -> Result<Self, TransformError> {
        let taxonomy = enrich::TaxonomyEnricher::new(config.taxon_group_field.clone())?;
        let facts = enrich::FactFlattener::new(&config.fact_prefixes)?;
        let areas = AreaResolver::new(references.areas.clone(), references.areas_crs, config.records_crs);
        Ok(Self {
            descriptor,
            references,
            config,
            taxonomy,
            facts,
            areas,
        })
    }

    pub fn descriptor(&self) -> &SchemaDescriptor {
        &self.descriptor
    }

    /// Run every stage over one batch. Per-record problems null the affected
    /// field; only records that cannot be keyed or placed are dropped.
    pub fn run(&self, mut records: Vec<RawRecord>) -> TransformOutput {
        let refs = &self.references;
        self.taxonomy.apply(&mut records, &refs.taxonomy);
        self.facts.apply(&mut records, &self.descriptor);
        enrich::combine_repeated(&mut records, &self.descriptor);
        translate::translate_values(&mut records, &self.descriptor, &refs.value_ranges);
        enrich::computed_fields(&mut records, &refs.collections);

        let (municipalities, elys) = self.areas.resolve_areas(records.iter().map(|r| r.geometry.as_ref()));
        for ((record, municipality), ely) in records.iter_mut().zip(municipalities).zip(elys) {
            record.set(fields::MUNICIPALITY, Value::Str(municipality));
            record.set(fields::ELY_AREA, Value::Str(ely));
        }

        let mut output = TransformOutput::default();
        let input = records.len();
        for record in records {
            match self.finalize(record, &mut output) {
                Some(canonical) => output.records.push(canonical),
                None => output.dropped += 1,
            }
        }
        debug!(
            input,
            emitted = output.records.len(),
            dropped = output.dropped,
            converted = output.collections_converted,
            repaired = output.geometries_repaired,
            "batch transformed"
        );
        output
    }

    fn finalize(&self, mut record: RawRecord, output: &mut TransformOutput) -> Option<CanonicalRecord> {
        let natural_key = record.text(fields::NATURAL_KEY);
        let geometry = record.geometry.take();
        let attributes = project::project(record.fields, &self.descriptor);

        let Some(natural_key) = natural_key else {
            debug!("dropping record without natural key");
            return None;
        };

        let geometry = geometry.and_then(|g| {
            let (normalized, converted) = normalize_collection(g, self.config.buffer_distance);
            if converted {
                output.collections_converted += 1;
            }
            normalized
        });
        let geometry = match geometry.map(repair) {
            Some(Repair::Valid(g)) => g,
            Some(Repair::Repaired(g)) => {
                output.geometries_repaired += 1;
                g
            }
            Some(Repair::Unrepairable) => {
                warn!(unit = %natural_key, "dropping record with unrepairable geometry");
                return None;
            }
            None => {
                debug!(unit = %natural_key, "dropping record without geometry");
                return None;
            }
        };

        let local_key = attributes
            .get(&self.descriptor.roles().local_key)
            .and_then(Value::as_text)
            .unwrap_or_else(|| enrich::local_key(&natural_key));
        match CanonicalRecord::new(natural_key, local_key, attributes, geometry) {
            Ok(canonical) => Some(canonical),
            Err(err) => {
                warn!(error = %err, "record rejected");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use biosync_core::{
        multi_point, point, AreaPolygon, CollectionNames, ColumnSpec, ColumnType, GeometryKind, MergeStrategy,
        TaxonGroup, TaxonomyTable, Translation, ValueRanges,
    };
    use geo::{line_string, polygon, Geometry, GeometryCollection, MultiPolygon, Validation};

    fn descriptor() -> Arc<SchemaDescriptor> {
        Arc::new(
            SchemaDescriptor::from_columns(vec![
                ColumnSpec::new(fields::NATURAL_KEY, "occurrence_id", ColumnType::String, MergeStrategy::First),
                ColumnSpec::new(fields::LOCAL_KEY, "local_id", ColumnType::String, MergeStrategy::First),
                ColumnSpec::new(fields::LOAD_DATE, "load_date", ColumnType::Date, MergeStrategy::Max),
                ColumnSpec::new(fields::MUNICIPALITY, "municipality", ColumnType::String, MergeStrategy::GroupBy),
                ColumnSpec::new(fields::ELY_AREA, "ely_area", ColumnType::String, MergeStrategy::First),
                ColumnSpec::new(fields::MERGE_COUNT, "merged_count", ColumnType::Integer, MergeStrategy::Sum),
                ColumnSpec::new(fields::TAXON_GROUP_NAME_EN, "taxon_group", ColumnType::String, MergeStrategy::GroupBy),
                ColumnSpec::new(fields::OCCURRENCE_STATUS, "status", ColumnType::String, MergeStrategy::First),
                ColumnSpec::new(fields::COLLECTION_NAME, "collection", ColumnType::String, MergeStrategy::First),
                ColumnSpec::new("unit.sex", "sex", ColumnType::String, MergeStrategy::First)
                    .translated(Translation::UrlStripped),
                ColumnSpec::new("MY.weather", "weather", ColumnType::String, MergeStrategy::First),
                ColumnSpec::new(fields::INDIVIDUAL_COUNT, "individual_count", ColumnType::Integer, MergeStrategy::Sum),
            ])
            .expect("descriptor"),
        )
    }

    fn references() -> Arc<ReferenceTables> {
        Arc::new(ReferenceTables {
            value_ranges: ValueRanges::new([("MY.sexF", "female")]),
            collections: CollectionNames::new([("HR.1", "Test collection")]),
            taxonomy: TaxonomyTable::new([TaxonGroup {
                id: "MVL.2".into(),
                name: Some("Nisäkkäät".into()),
                name_en: Some("Mammals".into()),
            }]),
            areas: vec![AreaPolygon {
                municipality: "Espoo".into(),
                ely: "Uusimaa".into(),
                geometry: MultiPolygon::new(vec![polygon![
                    (x: 0.0, y: 0.0),
                    (x: 100.0, y: 0.0),
                    (x: 100.0, y: 100.0),
                    (x: 0.0, y: 100.0),
                    (x: 0.0, y: 0.0),
                ]]),
            }],
            areas_crs: Crs::EurefFin,
        })
    }

    fn pipeline() -> TransformPipeline {
        TransformPipeline::new(descriptor(), references(), TransformConfig::default()).expect("pipeline")
    }

    #[test]
    fn full_record_flows_through_every_stage() {
        let raw = RawRecord::new()
            .with_field(fields::NATURAL_KEY, "http://tun.fi/JX.7#3")
            .with_field(fields::LOAD_DATE, "2024-05-02")
            .with_field(fields::COLLECTION_ID, "http://tun.fi/HR.1")
            .with_field(fields::INDIVIDUAL_COUNT, 2_i64)
            .with_field(fields::TAXON_GROUPS, "http://tun.fi/MVL.2")
            .with_field("unit.sex", "http://tun.fi/MY.sexF")
            .with_field("unit.facts[0].fact", "http://tun.fi/MY.weather")
            .with_field("unit.facts[0].value", "rain")
            .with_field("unit.unknownField", "x")
            .with_geometry(point(10.0, 10.0));

        let output = pipeline().run(vec![raw]);
        assert_eq!(output.dropped, 0);
        let record = &output.records[0];
        assert_eq!(record.natural_key(), "http://tun.fi/JX.7#3");
        assert_eq!(record.local_key(), "http://tun.fi/JX.7_3");
        assert_eq!(record.attribute("municipality"), &Value::from("Espoo"));
        assert_eq!(record.attribute("ely_area"), &Value::from("Uusimaa"));
        assert_eq!(record.attribute("taxon_group"), &Value::from("Mammals"));
        assert_eq!(record.attribute("status"), &Value::from("present"));
        assert_eq!(record.attribute("collection"), &Value::from("Test collection"));
        assert_eq!(record.attribute("sex"), &Value::from("female"));
        assert_eq!(record.attribute("weather"), &Value::from("rain"));
        assert_eq!(record.attribute("merged_count"), &Value::Int(1));
        assert_eq!(record.attributes().len(), 12);
        assert!(matches!(record.attribute("load_date"), Value::Date(_)));
    }

    #[test]
    fn unkeyed_and_unplaced_records_are_dropped() {
        let records = vec![
            RawRecord::new().with_geometry(point(1.0, 1.0)),
            RawRecord::new().with_field(fields::NATURAL_KEY, "http://tun.fi/JX.1#1"),
            RawRecord::new()
                .with_field(fields::NATURAL_KEY, "http://tun.fi/JX.1#2")
                .with_geometry(Geometry::GeometryCollection(GeometryCollection::new_from(Vec::new()))),
            RawRecord::new()
                .with_field(fields::NATURAL_KEY, "http://tun.fi/JX.1#3")
                .with_geometry(point(500.0, 500.0)),
        ];
        let output = pipeline().run(records);
        assert_eq!(output.dropped, 3);
        assert_eq!(output.collections_converted, 1);
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].attribute("municipality"), &Value::from(""));
        assert_eq!(output.records[0].attribute("ely_area"), &Value::from(""));
    }

    #[test]
    fn emitted_geometries_are_valid_and_never_collections() {
        let mixed = Geometry::GeometryCollection(GeometryCollection::new_from(vec![
            point(5.0, 5.0),
            Geometry::LineString(line_string![(x: 20.0, y: 20.0), (x: 40.0, y: 20.0)]),
        ]));
        let degenerate = Geometry::LineString(line_string![(x: 3.0, y: 3.0), (x: 3.0, y: 3.0)]);
        let records = vec![
            RawRecord::new()
                .with_field(fields::NATURAL_KEY, "http://tun.fi/JX.2#1")
                .with_geometry(mixed),
            RawRecord::new()
                .with_field(fields::NATURAL_KEY, "http://tun.fi/JX.2#2")
                .with_geometry(degenerate),
            RawRecord::new()
                .with_field(fields::NATURAL_KEY, "http://tun.fi/JX.2#3")
                .with_geometry(multi_point(vec![geo::Point::new(1.0, 1.0), geo::Point::new(2.0, 2.0)])),
        ];
        let output = pipeline().run(records);
        assert_eq!(output.records.len(), 3);
        assert_eq!(output.collections_converted, 1);
        assert_eq!(output.geometries_repaired, 1);
        let kinds = output.records.iter().map(CanonicalRecord::kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![GeometryKind::Polygon, GeometryKind::Point, GeometryKind::Point]);
        assert!(output.records.iter().all(|r| r.geometry().is_valid()));
    }
}
