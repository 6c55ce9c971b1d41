//! Warehouse query model and the page source contract.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use biosync_core::{Crs, RawRecord, Value, ValueRanges};
use chrono::{DateTime, Utc};
use geo::Geometry;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::{FetchError, HttpFetcher};

pub const LOADED_SINCE_FILTER: &str = "loadedSameOrAfter";

/// Filter parameters of one warehouse query. Paging and credentials are added per request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarehouseQuery {
    filters: BTreeMap<String, String>,
}

impl WarehouseQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    /// Filter whose operator-facing value may be a display label rather than a code.
    pub fn with_translated_filter(self, key: impl Into<String>, value: &str, ranges: &ValueRanges) -> Self {
        let translated = ranges.translate_filter(value);
        self.with_filter(key, translated)
    }

    /// The warehouse filters loads by calendar day, so every record loaded on
    /// `since`'s date comes back again. Dedup drops those repeats.
    pub fn loaded_since(self, since: DateTime<Utc>) -> Self {
        self.with_filter(LOADED_SINCE_FILTER, since.format("%Y-%m-%d").to_string())
    }

    pub fn filters(&self) -> &BTreeMap<String, String> {
        &self.filters
    }

    pub fn to_params(&self) -> Vec<(String, String)> {
        self.filters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct WarehousePage {
    pub page: u32,
    pub total: u64,
    pub last_page: Option<u32>,
    pub records: Vec<RawRecord>,
}

#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, query: &WarehouseQuery, page: u32, page_size: u32) -> Result<WarehousePage, FetchError>;

    /// Number of records the query matches, from the cheap count endpoint.
    async fn fetch_total(&self, query: &WarehouseQuery) -> Result<u64, FetchError>;
}

/// Page source backed by the warehouse REST API.
#[derive(Debug, Clone)]
pub struct HttpPageSource {
    http: Arc<HttpFetcher>,
    base_url: String,
    access_token: String,
    crs: Crs,
}

impl HttpPageSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>, access_token: impl Into<String>, crs: Crs) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            crs,
        }
    }

    fn list_url(&self) -> String {
        format!("{}/warehouse/query/unit/list", self.base_url)
    }

    fn count_url(&self) -> String {
        format!("{}/warehouse/query/unit/count", self.base_url)
    }

    fn params(&self, query: &WarehouseQuery) -> Vec<(String, String)> {
        let mut params = query.to_params();
        params.push(("access_token".to_string(), self.access_token.clone()));
        params
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_page(&self, query: &WarehouseQuery, page: u32, page_size: u32) -> Result<WarehousePage, FetchError> {
        let url = self.list_url();
        let mut params = self.params(query);
        params.extend([
            ("page".to_string(), page.to_string()),
            ("pageSize".to_string(), page_size.to_string()),
            ("format".to_string(), "geojson".to_string()),
            ("featureType".to_string(), "ORIGINAL_FEATURE".to_string()),
            ("crs".to_string(), self.crs.api_name().to_string()),
        ]);
        let body = self.http.get_json(&url, &params).await?;
        decode_page(&url, page, &body)
    }

    async fn fetch_total(&self, query: &WarehouseQuery) -> Result<u64, FetchError> {
        let url = self.count_url();
        let body = self.http.get_json(&url, &self.params(query)).await?;
        body.get("total")
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| FetchError::Malformed {
                url,
                message: "count response has no numeric `total`".to_string(),
            })
    }
}

/// Decode one GeoJSON list response into raw records.
///
/// A feature whose geometry cannot be decoded is kept with no geometry; the
/// transform pipeline drops it later and counts it.
pub fn decode_page(url: &str, page: u32, body: &JsonValue) -> Result<WarehousePage, FetchError> {
    let malformed = |message: &str| FetchError::Malformed {
        url: url.to_string(),
        message: message.to_string(),
    };

    let total = body
        .get("total")
        .and_then(JsonValue::as_u64)
        .ok_or_else(|| malformed("missing numeric `total`"))?;
    let features = body
        .get("features")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| malformed("missing `features` array"))?;
    let last_page = body
        .get("lastPage")
        .and_then(JsonValue::as_u64)
        .and_then(|v| u32::try_from(v).ok());

    let records = features.iter().map(|f| decode_feature(page, f)).collect();
    Ok(WarehousePage {
        page,
        total,
        last_page,
        records,
    })
}

fn decode_feature(page: u32, feature: &JsonValue) -> RawRecord {
    let mut record = RawRecord::new();
    if let Some(props) = feature.get("properties").and_then(JsonValue::as_object) {
        for (key, value) in props {
            record.set(key.clone(), Value::from_json(value));
        }
    }
    record.geometry = match feature.get("geometry") {
        None | Some(JsonValue::Null) => None,
        Some(raw) => match decode_geometry(raw) {
            Ok(geometry) => Some(geometry),
            Err(message) => {
                warn!(page, unit = ?record.text(biosync_core::fields::NATURAL_KEY), %message, "undecodable geometry");
                None
            }
        },
    };
    record
}

fn decode_geometry(raw: &JsonValue) -> Result<Geometry<f64>, String> {
    let geometry = geojson::Geometry::from_json_value(raw.clone()).map_err(|e| e.to_string())?;
    Geometry::<f64>::try_from(geometry).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_features_into_raw_records() {
        let body = json!({
            "total": 2,
            "lastPage": 1,
            "features": [
                {
                    "type": "Feature",
                    "geometry": {"type": "Point", "coordinates": [385000.0, 6672000.0]},
                    "properties": {"unit.unitId": "http://tun.fi/JX.1#2", "unit.interpretations.individualCount": 3}
                },
                {
                    "type": "Feature",
                    "geometry": {"type": "Bogus", "coordinates": []},
                    "properties": {"unit.unitId": "http://tun.fi/JX.1#3"}
                }
            ]
        });
        let page = decode_page("http://example/list", 1, &body).expect("page");
        assert_eq!(page.total, 2);
        assert_eq!(page.last_page, Some(1));
        assert_eq!(page.records.len(), 2);
        assert!(matches!(page.records[0].geometry, Some(Geometry::Point(_))));
        assert_eq!(
            page.records[0].get("unit.interpretations.individualCount"),
            Some(&Value::Int(3))
        );
        assert!(page.records[1].geometry.is_none());
    }

    #[test]
    fn missing_features_is_malformed() {
        let err = decode_page("u", 1, &json!({"total": 5})).unwrap_err();
        assert!(matches!(err, FetchError::Malformed { .. }));
    }

    #[test]
    fn translated_filters_use_codes() {
        let ranges = ValueRanges::new([("MY.recordQualityExpertVerified", "Expert verified")]);
        let query = WarehouseQuery::new()
            .with_translated_filter("recordQuality", "expert VERIFIED", &ranges)
            .with_filter("biogeographicalProvinceId", "ML.251");
        assert_eq!(
            query.filters().get("recordQuality").map(String::as_str),
            Some("MY.recordQualityExpertVerified")
        );
        assert_eq!(query.to_params().len(), 2);
    }

    #[test]
    fn loaded_since_sends_the_calendar_day() {
        use chrono::TimeZone;

        let since = Utc.with_ymd_and_hms(2024, 3, 9, 17, 45, 12).unwrap();
        let query = WarehouseQuery::new().loaded_since(since);
        assert_eq!(
            query.filters().get(LOADED_SINCE_FILTER).map(String::as_str),
            Some("2024-03-09")
        );
    }
}
