//! Spatial join of record geometries against municipality / ELY polygons.

use std::fs;
use std::path::{Path, PathBuf};

use biosync_core::crs::reproject;
use biosync_core::{AreaPolygon, Crs};
use geo::{BoundingRect, Geometry, Intersects, MultiPolygon, Rect};
use geojson::GeoJson;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AreaError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    GeoJson {
        path: PathBuf,
        #[source]
        source: Box<geojson::Error>,
    },
    #[error("{} is not a FeatureCollection", path.display())]
    NotFeatureCollection { path: PathBuf },
    #[error("feature {index} has no string `municipality` property")]
    MissingMunicipality { index: usize },
    #[error("feature {index} is not a polygon or multipolygon")]
    NotAreal { index: usize },
}

struct IndexedArea {
    bbox: Rect<f64>,
    area: AreaPolygon,
}

pub struct AreaResolver {
    areas: Vec<IndexedArea>,
}

impl AreaResolver {
    /// Reprojects the polygons into `records_crs` once, up front.
    pub fn new(polygons: Vec<AreaPolygon>, polygons_crs: Crs, records_crs: Crs) -> Self {
        let areas = polygons
            .into_iter()
            .filter_map(|mut area| {
                if polygons_crs != records_crs {
                    area.geometry = reproject(&area.geometry, polygons_crs, records_crs);
                }
                let bbox = area.geometry.bounding_rect()?;
                Some(IndexedArea { bbox, area })
            })
            .collect::<Vec<_>>();
        debug!(areas = areas.len(), from = %polygons_crs, to = %records_crs, "area polygons indexed");
        Self { areas }
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// `(municipality, ely)` labels for one geometry; empty strings when nothing intersects.
    pub fn resolve(&self, geometry: Option<&Geometry<f64>>) -> (String, String) {
        let Some(geometry) = geometry else {
            return (String::new(), String::new());
        };
        let Some(bbox) = geometry.bounding_rect() else {
            return (String::new(), String::new());
        };

        let mut municipalities = Vec::new();
        let mut elys: Vec<&str> = Vec::new();
        for indexed in &self.areas {
            if !indexed.bbox.intersects(&bbox) || !geometry.intersects(&indexed.area.geometry) {
                continue;
            }
            municipalities.push(indexed.area.municipality.as_str());
            let ely = indexed.area.ely.trim();
            if !ely.is_empty() && !elys.contains(&ely) {
                elys.push(ely);
            }
        }
        (municipalities.join(", "), elys.join(", "))
    }

    /// Labels for every geometry, index-aligned with the input.
    pub fn resolve_areas<'g, I>(&self, geometries: I) -> (Vec<String>, Vec<String>)
    where
        I: IntoIterator<Item = Option<&'g Geometry<f64>>>,
    {
        geometries.into_iter().map(|g| self.resolve(g)).unzip()
    }
}

/// Read a GeoJSON FeatureCollection whose features carry `municipality` and `ely` properties.
pub fn load_area_polygons(path: impl AsRef<Path>) -> Result<Vec<AreaPolygon>, AreaError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| AreaError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let geojson = text.parse::<GeoJson>().map_err(|source| AreaError::GeoJson {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    let GeoJson::FeatureCollection(collection) = geojson else {
        return Err(AreaError::NotFeatureCollection {
            path: path.to_path_buf(),
        });
    };

    let mut areas = Vec::with_capacity(collection.features.len());
    for (index, feature) in collection.features.into_iter().enumerate() {
        let municipality = feature
            .property("municipality")
            .and_then(JsonValue::as_str)
            .ok_or(AreaError::MissingMunicipality { index })?
            .to_string();
        let ely = feature
            .property("ely")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        let geometry = feature
            .geometry
            .and_then(|g| Geometry::<f64>::try_from(g).ok())
            .and_then(|g| match g {
                Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p])),
                Geometry::MultiPolygon(mp) => Some(mp),
                _ => None,
            })
            .ok_or(AreaError::NotAreal { index })?;
        areas.push(AreaPolygon {
            municipality,
            ely,
            geometry,
        });
    }
    Ok(areas)
}
