//! Core domain model for the Pickly housing feed.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pickly-core";

/// Key under which the parent category is always present in a [`CategoryMap`].
pub const DEFAULT_CATEGORY_KEY: &str = "default";

/// Housing-type label used when no classification rule matches.
pub const DEFAULT_HOUSING_TYPE: &str = "LH공사";

/// One record as returned by the LH lease-notice API. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAnnouncementItem {
    #[serde(rename = "공고번호", default, deserialize_with = "de_opt_text", skip_serializing_if = "Option::is_none")]
    pub announcement_no: Option<String>,
    #[serde(rename = "공고명", default, deserialize_with = "de_opt_text", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "공고일자", default, deserialize_with = "de_opt_text", skip_serializing_if = "Option::is_none")]
    pub announced_on: Option<String>,
    #[serde(rename = "지역", default, deserialize_with = "de_opt_text", skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(rename = "모집시작일", default, deserialize_with = "de_opt_text", skip_serializing_if = "Option::is_none")]
    pub application_start: Option<String>,
    #[serde(rename = "모집종료일", default, deserialize_with = "de_opt_text", skip_serializing_if = "Option::is_none")]
    pub application_end: Option<String>,
    #[serde(rename = "입주시작일", default, deserialize_with = "de_opt_text", skip_serializing_if = "Option::is_none")]
    pub occupancy_start: Option<String>,
    #[serde(rename = "입주종료일", default, deserialize_with = "de_opt_text", skip_serializing_if = "Option::is_none")]
    pub occupancy_end: Option<String>,
    #[serde(rename = "소재지", default, deserialize_with = "de_opt_text", skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(rename = "단지명", default, deserialize_with = "de_opt_text", skip_serializing_if = "Option::is_none")]
    pub complex_name: Option<String>,
    #[serde(rename = "공급호수", default, deserialize_with = "de_opt_count", skip_serializing_if = "Option::is_none")]
    pub supply_units: Option<u64>,
    #[serde(rename = "상세URL", default, deserialize_with = "de_opt_text", skip_serializing_if = "Option::is_none")]
    pub detail_url: Option<String>,
}

fn de_opt_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        Some(JsonValue::String(s)) => Some(s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn de_opt_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        Some(JsonValue::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Some(JsonValue::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Lifecycle status derived from the application window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnouncementStatus {
    Upcoming,
    Recruiting,
    Closed,
    Draft,
}

impl AnnouncementStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upcoming => "upcoming",
            Self::Recruiting => "recruiting",
            Self::Closed => "closed",
            Self::Draft => "draft",
        }
    }
}

impl fmt::Display for AnnouncementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse the date shapes the LH API is known to emit. Naive values are read as UTC.
pub fn parse_announcement_date(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .map(|n| n.and_utc())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Status of an application window at `now`.
///
/// A missing bound yields [`AnnouncementStatus::Draft`]. A bound that does not
/// parse never compares true, so a malformed window reads as recruiting unless
/// the other bound decides it.
pub fn compute_status(
    start: Option<&str>,
    end: Option<&str>,
    now: DateTime<Utc>,
) -> AnnouncementStatus {
    let (Some(start), Some(end)) = (non_blank(start), non_blank(end)) else {
        return AnnouncementStatus::Draft;
    };
    let start = parse_announcement_date(start);
    let end = parse_announcement_date(end);

    if start.is_some_and(|s| now < s) {
        AnnouncementStatus::Upcoming
    } else if end.is_some_and(|e| now > e) {
        AnnouncementStatus::Closed
    } else {
        AnnouncementStatus::Recruiting
    }
}

/// A benefit category row as needed for classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
}

/// Slug → category id for one ingestion run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryMap {
    entries: BTreeMap<String, Uuid>,
}

impl CategoryMap {
    /// The `default` entry always points at `parent_id`, even if a child claims that slug.
    pub fn new(parent_id: Uuid, children: impl IntoIterator<Item = Category>) -> Self {
        let mut entries: BTreeMap<String, Uuid> = children
            .into_iter()
            .map(|category| (category.slug, category.id))
            .collect();
        entries.insert(DEFAULT_CATEGORY_KEY.to_string(), parent_id);
        Self { entries }
    }

    pub fn default_id(&self) -> Uuid {
        self.entries[DEFAULT_CATEGORY_KEY]
    }

    pub fn get(&self, slug: &str) -> Option<Uuid> {
        self.entries.get(slug).copied()
    }

    /// Id for `slug`, or the parent id when the slug is unknown.
    pub fn resolve(&self, slug: &str) -> Uuid {
        self.get(slug).unwrap_or_else(|| self.default_id())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Uuid)> {
        self.entries.iter().map(|(slug, id)| (slug.as_str(), *id))
    }
}

/// One row of the keyword classification table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub patterns: Vec<String>,
    pub slug: String,
    pub housing_type: String,
}

impl CategoryRule {
    fn new(patterns: &[&str], slug: &str, housing_type: &str) -> Self {
        Self {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            slug: slug.to_string(),
            housing_type: housing_type.to_string(),
        }
    }

    fn matches(&self, haystack: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| haystack.contains(&pattern.to_lowercase()))
    }
}

/// Result of classifying one announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Matched rule slug, or [`DEFAULT_CATEGORY_KEY`].
    pub slug: String,
    pub housing_type: String,
}

/// Ordered classification table. The first rule with any matching pattern wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRules {
    pub rules: Vec<CategoryRule>,
    #[serde(default = "default_housing_type")]
    pub default_housing_type: String,
}

fn default_housing_type() -> String {
    DEFAULT_HOUSING_TYPE.to_string()
}

impl Default for CategoryRules {
    fn default() -> Self {
        Self::housing_defaults()
    }
}

impl CategoryRules {
    /// Built-in LH housing table. Order matters: "행복" is tested before "국민".
    pub fn housing_defaults() -> Self {
        Self {
            rules: vec![
                CategoryRule::new(&["행복주택", "행복"], "housing-happiness", "행복주택"),
                CategoryRule::new(&["국민임대", "국민"], "housing-public", "국민임대주택"),
                CategoryRule::new(&["영구임대", "영구"], "housing-permanent", "영구임대주택"),
                CategoryRule::new(&["매입임대", "매입"], "housing-purchased", "매입임대주택"),
                CategoryRule::new(
                    &["신혼희망타운", "신혼", "희망타운"],
                    "housing-newlywed",
                    "신혼희망타운",
                ),
            ],
            default_housing_type: default_housing_type(),
        }
    }

    pub fn classify(&self, title: &str, subtitle: &str) -> Classification {
        let haystack = format!("{title} {subtitle}").to_lowercase();
        match self.rules.iter().find(|rule| rule.matches(&haystack)) {
            Some(rule) => Classification {
                slug: rule.slug.clone(),
                housing_type: rule.housing_type.clone(),
            },
            None => Classification {
                slug: DEFAULT_CATEGORY_KEY.to_string(),
                housing_type: self.default_housing_type.clone(),
            },
        }
    }
}

/// Canonical announcement row written to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedAnnouncement {
    pub category_id: Uuid,
    /// Natural key for upserts. `None` rows can never be matched by a later run.
    pub external_id: Option<String>,
    pub title: String,
    pub subtitle: Option<String>,
    pub organization: String,
    pub application_period_start: Option<String>,
    pub application_period_end: Option<String>,
    pub announcement_date: Option<String>,
    pub status: AnnouncementStatus,
    pub summary: Option<String>,
    pub external_url: Option<String>,
    pub tags: Vec<String>,
    pub is_featured: bool,
    pub views_count: i64,
}

/// Identity of a row returned by an upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertedAnnouncement {
    pub id: Uuid,
    pub title: String,
    pub external_id: Option<String>,
}
