//! Source adapter contract + the LH lease-notice adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pickly_core::{
    compute_status, CategoryMap, CategoryRules, NormalizedAnnouncement, RawAnnouncementItem,
};
use pickly_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "pickly-adapters";

pub const LH_SOURCE_ID: &str = "lh-lease-notice";
pub const DEFAULT_LH_API_URL: &str = "https://apis.data.go.kr/B552555/lhLeaseNoticeInfo1";
pub const LH_ORGANIZATION: &str = "LH 한국토지주택공사";

const UNTITLED: &str = "제목 없음";
const NATIONWIDE_TAG: &str = "전국";
const LH_TAG: &str = "LH공사";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingTarget {
    pub url: String,
    pub service_key: String,
    pub page: u32,
    pub per_page: u32,
}

impl ListingTarget {
    /// The single page the ingestion run asks for: page 1, up to 100 records.
    pub fn first_page(url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            service_key: service_key.into(),
            page: 1,
            per_page: 100,
        }
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("serviceKey", self.service_key.clone()),
            ("page", self.page.to_string()),
            ("perPage", self.per_page.to_string()),
        ]
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        target: &ListingTarget,
    ) -> Result<JsonValue, AdapterError>;

    /// Records found in a decoded listing body. Unknown shapes yield no records.
    fn parse_listing(&self, body: &JsonValue) -> Vec<RawAnnouncementItem>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LhLeaseNoticeAdapter;

#[async_trait]
impl SourceAdapter for LhLeaseNoticeAdapter {
    fn source_id(&self) -> &'static str {
        LH_SOURCE_ID
    }

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        target: &ListingTarget,
    ) -> Result<JsonValue, AdapterError> {
        Ok(http.get_json(&target.url, &target.query()).await?)
    }

    fn parse_listing(&self, body: &JsonValue) -> Vec<RawAnnouncementItem> {
        let Some((envelope, records)) = ENVELOPE_EXTRACTORS
            .iter()
            .find_map(|(name, extract)| extract(body).map(|records| (*name, records)))
        else {
            warn!(source = LH_SOURCE_ID, "no known envelope in response; treating as empty");
            return Vec::new();
        };

        let items: Vec<RawAnnouncementItem> = records
            .iter()
            .enumerate()
            .filter_map(|(index, record)| record_to_item(index, record))
            .collect();
        info!(source = LH_SOURCE_ID, envelope, count = items.len(), "extracted announcements");
        items
    }
}

type Extractor = fn(&JsonValue) -> Option<&[JsonValue]>;

/// Tried in order; the first extractor that finds an array wins.
const ENVELOPE_EXTRACTORS: &[(&str, Extractor)] = &[
    ("data", extract_data),
    ("datas", extract_datas),
    ("body.items", extract_body_items),
    ("body.item", extract_body_item),
    ("array", extract_bare_array),
];

fn array_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a [JsonValue]> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_array().map(Vec::as_slice)
}

fn extract_data(value: &JsonValue) -> Option<&[JsonValue]> {
    array_at(value, &["data"])
}

fn extract_datas(value: &JsonValue) -> Option<&[JsonValue]> {
    array_at(value, &["datas"])
}

fn extract_body_items(value: &JsonValue) -> Option<&[JsonValue]> {
    array_at(value, &["body", "items"])
}

fn extract_body_item(value: &JsonValue) -> Option<&[JsonValue]> {
    array_at(value, &["body", "item"])
}

fn extract_bare_array(value: &JsonValue) -> Option<&[JsonValue]> {
    array_at(value, &[])
}

fn record_to_item(index: usize, record: &JsonValue) -> Option<RawAnnouncementItem> {
    if !record.is_object() {
        warn!(index, "skipping non-object record");
        return None;
    }
    match serde_json::from_value(record.clone()) {
        Ok(item) => Some(item),
        Err(err) => {
            warn!(index, error = %err, "skipping unreadable record");
            None
        }
    }
}

/// A normalized row plus the housing-type label chosen while classifying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedAnnouncement {
    pub announcement: NormalizedAnnouncement,
    pub housing_type: String,
}

fn text_or_none(value: Option<&str>) -> Option<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(ToString::to_string)
}

fn summary_for(item: &RawAnnouncementItem) -> Option<String> {
    let units = item
        .supply_units
        .filter(|n| *n > 0)
        .map(|n| format!("공급호수: {n}세대"))
        .unwrap_or_default();
    let address = item.address.as_deref().unwrap_or_default();
    let summary = format!("{address} {units}");
    text_or_none(Some(summary.trim()))
}

/// Map one raw record to the stored row: classify, resolve the category id and derive status at `now`.
pub fn normalize_item(
    item: &RawAnnouncementItem,
    categories: &CategoryMap,
    rules: &CategoryRules,
    now: DateTime<Utc>,
) -> MappedAnnouncement {
    let title = text_or_none(item.name.as_deref()).unwrap_or_else(|| UNTITLED.to_string());
    let subtitle = text_or_none(item.complex_name.as_deref());

    let classification = rules.classify(&title, subtitle.as_deref().unwrap_or_default());
    let category_id = categories.resolve(&classification.slug);
    info!("\"{}\" → {} ({})", title, classification.housing_type, category_id);

    let region = text_or_none(item.region.as_deref()).unwrap_or_else(|| NATIONWIDE_TAG.to_string());
    let tags = vec![region, classification.housing_type.clone(), LH_TAG.to_string()];

    let application_period_start = text_or_none(item.application_start.as_deref());
    let application_period_end = text_or_none(item.application_end.as_deref());
    let status = compute_status(
        application_period_start.as_deref(),
        application_period_end.as_deref(),
        now,
    );

    MappedAnnouncement {
        announcement: NormalizedAnnouncement {
            category_id,
            external_id: text_or_none(item.announcement_no.as_deref()),
            title,
            subtitle,
            organization: LH_ORGANIZATION.to_string(),
            application_period_start,
            application_period_end,
            announcement_date: text_or_none(item.announced_on.as_deref()),
            status,
            summary: summary_for(item),
            external_url: text_or_none(item.detail_url.as_deref()),
            tags,
            is_featured: false,
            views_count: 0,
        },
        housing_type: classification.housing_type,
    }
}
