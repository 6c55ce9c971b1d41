//! One-shot loading of the network dictionaries used by the transform pipeline.

use std::sync::Arc;

use biosync_core::{CollectionNames, TaxonGroup, TaxonomyTable, ValueRanges};
use serde_json::Value as JsonValue;
use tracing::info;

use crate::{with_retries, FetchError, HttpFetcher, RetryPolicy};

pub struct ReferenceClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    access_token: String,
    retry: RetryPolicy,
}

impl ReferenceClient {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>, access_token: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            retry,
        }
    }

    async fn get(&self, path: &str, extra: &[(&str, &str)]) -> Result<(String, JsonValue), FetchError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut params = extra
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<Vec<_>>();
        params.push(("access_token".to_string(), self.access_token.clone()));
        let body = with_retries(&self.retry, path, || self.http.get_json(&url, &params)).await?;
        Ok((url, body))
    }

    pub async fn value_ranges(&self) -> Result<ValueRanges, FetchError> {
        let (url, body) = self
            .get("metadata/ranges", &[("lang", "fi"), ("asLookUpObject", "true")])
            .await?;
        let ranges = decode_value_ranges(&url, &body)?;
        info!(entries = ranges.len(), "loaded value ranges");
        Ok(ranges)
    }

    pub async fn collection_names(&self) -> Result<CollectionNames, FetchError> {
        let (url, body) = self
            .get("collections", &[("lang", "fi"), ("pageSize", "1000")])
            .await?;
        let names = decode_collections(&url, &body)?;
        info!(entries = names.len(), "loaded collection names");
        Ok(names)
    }

    pub async fn taxonomy(&self) -> Result<TaxonomyTable, FetchError> {
        let (url, body) = self
            .get("informal-taxon-groups", &[("lang", "multi"), ("pageSize", "1000")])
            .await?;
        let table = decode_taxon_groups(&url, &body)?;
        info!(entries = table.len(), "loaded informal taxon groups");
        Ok(table)
    }
}

fn malformed(url: &str, message: &str) -> FetchError {
    FetchError::Malformed {
        url: url.to_string(),
        message: message.to_string(),
    }
}

fn results<'a>(url: &str, body: &'a JsonValue) -> Result<&'a Vec<JsonValue>, FetchError> {
    body.get("results")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| malformed(url, "missing `results` array"))
}

/// `{code: label}` lookup object; non-string labels are skipped.
pub fn decode_value_ranges(url: &str, body: &JsonValue) -> Result<ValueRanges, FetchError> {
    let object = body
        .as_object()
        .ok_or_else(|| malformed(url, "value ranges must be a lookup object"))?;
    Ok(ValueRanges::new(
        object
            .iter()
            .filter_map(|(code, label)| label.as_str().map(|l| (code.clone(), l.to_string()))),
    ))
}

pub fn decode_collections(url: &str, body: &JsonValue) -> Result<CollectionNames, FetchError> {
    let entries = results(url, body)?
        .iter()
        .filter_map(|c| {
            let id = c.get("id")?.as_str()?;
            let name = c.get("longName").or_else(|| c.get("collectionName"))?.as_str()?;
            Some((id.to_string(), name.to_string()))
        })
        .collect::<Vec<_>>();
    Ok(CollectionNames::new(entries))
}

/// Taxon group names arrive either as plain strings or as `{fi, en, ...}` objects.
pub fn decode_taxon_groups(url: &str, body: &JsonValue) -> Result<TaxonomyTable, FetchError> {
    let groups = results(url, body)?
        .iter()
        .filter_map(|g| {
            let id = g.get("id")?.as_str()?.to_string();
            let (name, name_en) = match g.get("name") {
                Some(JsonValue::String(s)) => (Some(s.clone()), None),
                Some(JsonValue::Object(names)) => (
                    names.get("fi").and_then(JsonValue::as_str).map(ToString::to_string),
                    names.get("en").and_then(JsonValue::as_str).map(ToString::to_string),
                ),
                _ => (None, None),
            };
            Some(TaxonGroup { id, name, name_en })
        })
        .collect::<Vec<_>>();
    Ok(TaxonomyTable::new(groups))
}
