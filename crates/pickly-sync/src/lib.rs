//! Ingestion pipeline orchestration: config, category map, fetch, normalize, upsert.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pickly_adapters::{
    normalize_item, AdapterError, LhLeaseNoticeAdapter, ListingTarget, SourceAdapter,
    DEFAULT_LH_API_URL,
};
use pickly_core::{CategoryMap, CategoryRules, NormalizedAnnouncement, UpsertedAnnouncement};
use pickly_storage::{
    AnnouncementStore, FetchError, HttpClientConfig, HttpFetcher, PgAnnouncementStore, StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "pickly-sync";

/// Slug of the parent category every LH announcement lives under.
pub const PARENT_CATEGORY_SLUG: &str = "housing";

const EMPTY_FEED_MESSAGE: &str = "LH API에서 데이터가 없습니다.";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub api_key: Option<String>,
    pub api_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub database_url: Option<String>,
    pub category_rules_path: Option<PathBuf>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: DEFAULT_LH_API_URL.to_string(),
            http_timeout_secs: 15,
            user_agent: "pickly-fetcher/0.1".to_string(),
            database_url: None,
            category_rules_path: None,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("LH_API_KEY").ok(),
            api_url: std::env::var("LH_API_URL").unwrap_or(defaults.api_url),
            http_timeout_secs: std::env::var("LH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("PICKLY_USER_AGENT").unwrap_or(defaults.user_agent),
            database_url: std::env::var("DATABASE_URL").ok(),
            category_rules_path: std::env::var("PICKLY_CATEGORY_RULES").ok().map(PathBuf::from),
        }
    }

    fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }
}

/// Read a classification table from YAML. Same first-match-wins semantics as the built-in table.
pub fn load_category_rules(path: &Path) -> Result<CategoryRules> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let rules: CategoryRules =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if rules.rules.iter().any(|rule| rule.patterns.is_empty()) {
        anyhow::bail!("{}: every rule needs at least one pattern", path.display());
    }
    Ok(rules)
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{0} is not configured")]
    MissingConfig(&'static str),
    #[error("active category with slug '{0}' not found")]
    ParentCategoryNotFound(String),
    #[error("category lookup failed: {0}")]
    ParentCategoryLookup(#[source] StoreError),
    #[error("subcategory lookup failed: {0}")]
    SubcategoryLookup(#[source] StoreError),
    #[error(
        "LH API 접속에 {attempts}번 실패했습니다. 외부 API 서버에 문제가 있거나 서비스 키가 유효하지 않을 수 있습니다. 상세: {detail}"
    )]
    ExternalApi { attempts: usize, detail: String },
    #[error("LH API response is not valid JSON: {0}")]
    Decode(String),
    #[error("{0}")]
    Store(#[source] StoreError),
}

impl From<AdapterError> for IngestError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Fetch(FetchError::Exhausted { attempts, last }) => Self::ExternalApi {
                attempts,
                detail: last,
            },
            AdapterError::Fetch(FetchError::Decode(e)) => Self::Decode(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub message: String,
    pub count: usize,
    pub announcements: Vec<UpsertedAnnouncement>,
}

/// Wire shape of one fetch invocation, success or failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announcements: Option<Vec<UpsertedAnnouncement>>,
}

impl FetchOutcome {
    pub fn succeeded(summary: IngestSummary) -> Self {
        let announcements = (summary.count > 0).then_some(summary.announcements);
        Self {
            success: true,
            message: Some(summary.message),
            error: None,
            count: Some(summary.count),
            announcements,
        }
    }

    pub fn failed(err: &IngestError) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(err.to_string()),
            count: None,
            announcements: None,
        }
    }

    pub fn status_code(&self) -> u16 {
        if self.success {
            200
        } else {
            500
        }
    }
}

/// Collapse rows sharing an external id. The last occurrence's content wins, in the first one's slot.
/// Rows without an external id are all kept.
pub fn collapse_duplicate_ids(rows: Vec<NormalizedAnnouncement>) -> Vec<NormalizedAnnouncement> {
    let mut out: Vec<NormalizedAnnouncement> = Vec::with_capacity(rows.len());
    let mut slots: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let Some(external_id) = row.external_id.clone() else {
            out.push(row);
            continue;
        };
        match slots.get(&external_id) {
            Some(&slot) => {
                warn!(%external_id, "duplicate external id in batch; keeping the later record");
                out[slot] = row;
            }
            None => {
                slots.insert(external_id, out.len());
                out.push(row);
            }
        }
    }
    out
}

pub struct IngestPipeline {
    config: IngestConfig,
    http: HttpFetcher,
    source: Box<dyn SourceAdapter>,
    store: Arc<dyn AnnouncementStore>,
    rules: CategoryRules,
    clock: Box<dyn Clock>,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig, store: Arc<dyn AnnouncementStore>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let rules = match &config.category_rules_path {
            Some(path) => load_category_rules(path)?,
            None => CategoryRules::housing_defaults(),
        };
        Ok(Self {
            config,
            http,
            source: Box::new(LhLeaseNoticeAdapter),
            store,
            rules,
            clock: Box::new(SystemClock),
        })
    }

    pub fn with_source(mut self, source: Box<dyn SourceAdapter>) -> Self {
        self.source = source;
        self
    }

    pub fn with_http(mut self, http: HttpFetcher) -> Self {
        self.http = http;
        self
    }

    pub fn with_rules(mut self, rules: CategoryRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn run_once(&self) -> Result<IngestSummary, IngestError> {
        let api_key = self
            .config
            .api_key()
            .ok_or(IngestError::MissingConfig("LH_API_KEY"))?;

        let parent = self
            .store
            .find_active_category(PARENT_CATEGORY_SLUG)
            .await
            .map_err(IngestError::ParentCategoryLookup)?
            .ok_or_else(|| IngestError::ParentCategoryNotFound(PARENT_CATEGORY_SLUG.to_string()))?;
        let children = self
            .store
            .active_children(parent.id)
            .await
            .map_err(IngestError::SubcategoryLookup)?;
        let categories = CategoryMap::new(parent.id, children);
        info!(parent = %parent.id, entries = categories.len(), "built category map");

        let target = ListingTarget::first_page(&self.config.api_url, api_key);
        let body = self.source.fetch_listing(&self.http, &target).await?;
        let items = self.source.parse_listing(&body);
        info!(count = items.len(), "found announcements in feed");

        if items.is_empty() {
            return Ok(IngestSummary {
                message: EMPTY_FEED_MESSAGE.to_string(),
                count: 0,
                announcements: Vec::new(),
            });
        }

        let now = self.clock.now();
        let rows: Vec<NormalizedAnnouncement> = items
            .iter()
            .map(|item| normalize_item(item, &categories, &self.rules, now).announcement)
            .collect();
        let rows = collapse_duplicate_ids(rows);

        let announcements = self
            .store
            .upsert_announcements(&rows)
            .await
            .map_err(IngestError::Store)?;
        let count = announcements.len();
        info!(count, "upserted announcements");

        Ok(IngestSummary {
            message: format!("LH 공고 {count}개를 성공적으로 가져왔습니다."),
            count,
            announcements,
        })
    }

    /// Run once and fold any failure into the outcome. Never returns an error.
    pub async fn invoke(&self) -> FetchOutcome {
        let span = info_span!("ingest", source = self.source.source_id());
        match self.run_once().instrument(span).await {
            Ok(summary) => FetchOutcome::succeeded(summary),
            Err(err) => {
                error!(error = %err, "ingestion failed");
                FetchOutcome::failed(&err)
            }
        }
    }
}

/// Pipeline backed by PostgreSQL, configured from the environment. Fails fast without `DATABASE_URL`.
pub fn pipeline_from_env() -> Result<IngestPipeline> {
    let config = IngestConfig::from_env();
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL is not set")?;
    let store = PgAnnouncementStore::connect_lazy(&database_url).context("creating database pool")?;
    IngestPipeline::new(config, Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;
    use pickly_core::{AnnouncementStatus, Category, RawAnnouncementItem};
    use pickly_storage::MemoryAnnouncementStore;
    use serde_json::{json, Value as JsonValue};
    use uuid::Uuid;

    #[derive(Clone)]
    enum Canned {
        Body(JsonValue),
        Unreachable { attempts: usize, last: String },
    }

    struct StubSource {
        canned: Canned,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SourceAdapter for StubSource {
        fn source_id(&self) -> &'static str {
            "stub"
        }

        async fn fetch_listing(
            &self,
            _http: &HttpFetcher,
            _target: &ListingTarget,
        ) -> Result<JsonValue, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.canned {
                Canned::Body(body) => Ok(body.clone()),
                Canned::Unreachable { attempts, last } => Err(AdapterError::Fetch(FetchError::Exhausted {
                    attempts: *attempts,
                    last: last.clone(),
                })),
            }
        }

        fn parse_listing(&self, body: &JsonValue) -> Vec<RawAnnouncementItem> {
            LhLeaseNoticeAdapter.parse_listing(body)
        }
    }

    struct Fixture {
        store: Arc<MemoryAnnouncementStore>,
        parent: Uuid,
        happiness: Uuid,
        calls: Arc<AtomicUsize>,
    }

    fn mid_january() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).single().unwrap()
    }

    fn seeded_store() -> (Arc<MemoryAnnouncementStore>, Uuid, Uuid) {
        let store = Arc::new(MemoryAnnouncementStore::new());
        let parent = Uuid::new_v4();
        let happiness = Uuid::new_v4();
        store.add_category(
            Category { id: parent, name: "주거".into(), slug: PARENT_CATEGORY_SLUG.into() },
            None,
            true,
        );
        store.add_category(
            Category { id: happiness, name: "행복주택".into(), slug: "housing-happiness".into() },
            Some(parent),
            true,
        );
        (store, parent, happiness)
    }

    fn build_pipeline(
        store: Arc<MemoryAnnouncementStore>,
        api_key: Option<&str>,
        canned: Canned,
    ) -> (IngestPipeline, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = IngestConfig {
            api_key: api_key.map(ToString::to_string),
            ..Default::default()
        };
        let pipeline = IngestPipeline::new(config, store)
            .unwrap()
            .with_source(Box::new(StubSource { canned, calls: calls.clone() }))
            .with_clock(Box::new(FixedClock(mid_january())));
        (pipeline, calls)
    }

    fn fixture(canned: Canned) -> (IngestPipeline, Fixture) {
        let (store, parent, happiness) = seeded_store();
        let (pipeline, calls) = build_pipeline(store.clone(), Some("key"), canned);
        (pipeline, Fixture { store, parent, happiness, calls })
    }

    fn feed(records: JsonValue) -> Canned {
        Canned::Body(json!({ "data": records }))
    }

    #[tokio::test]
    async fn happiness_notice_ingests_end_to_end() {
        let (pipeline, fx) = fixture(feed(json!([{
            "공고번호": "2024-001",
            "공고명": "2024년 행복주택 모집공고",
            "지역": "서울",
            "모집시작일": "2024-01-10",
            "모집종료일": "2024-01-31"
        }])));

        let outcome = pipeline.invoke().await;
        assert!(outcome.success, "{outcome:?}");
        assert_eq!(outcome.count, Some(1));
        assert_eq!(outcome.status_code(), 200);
        assert_eq!(outcome.message.as_deref(), Some("LH 공고 1개를 성공적으로 가져왔습니다."));

        let stored = fx.store.announcements();
        assert_eq!(stored.len(), 1);
        let row = &stored[0].announcement;
        assert_eq!(row.category_id, fx.happiness);
        assert_eq!(row.status, AnnouncementStatus::Recruiting);
        assert!(row.tags.contains(&"행복주택".to_string()));

        let listed = outcome.announcements.unwrap();
        assert_eq!(listed[0].id, stored[0].id);
        assert_eq!(listed[0].external_id.as_deref(), Some("2024-001"));
    }

    #[tokio::test]
    async fn repeated_runs_are_idempotent() {
        let (pipeline, fx) = fixture(feed(json!([
            {"공고번호": "A-1", "공고명": "국민임대 모집"},
            {"공고번호": "A-2", "공고명": "영구임대 모집"}
        ])));

        let first = pipeline.run_once().await.unwrap();
        let second = pipeline.run_once().await.unwrap();

        assert_eq!(fx.store.announcements().len(), 2);
        let ids = |s: &IngestSummary| s.announcements.iter().map(|a| a.id).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }

    #[tokio::test]
    async fn unknown_subcategory_falls_back_to_parent() {
        let (pipeline, fx) = fixture(feed(json!([
            {"공고번호": "B-1", "공고명": "신혼희망타운 입주자 모집"},
            {"공고번호": "B-2", "공고명": "공공분양 안내"}
        ])));

        pipeline.run_once().await.unwrap();
        let stored = fx.store.announcements();
        assert!(stored.iter().all(|s| s.announcement.category_id == fx.parent));
        assert_eq!(stored[0].announcement.tags[1], "신혼희망타운");
        assert_eq!(stored[1].announcement.tags[1], "LH공사");
    }

    #[tokio::test]
    async fn duplicate_ids_in_one_batch_collapse_to_last() {
        let (pipeline, fx) = fixture(feed(json!([
            {"공고번호": "C-1", "공고명": "첫 번째"},
            {"공고명": "번호 없음"},
            {"공고번호": "C-1", "공고명": "두 번째"},
            {"공고명": "번호 없음"}
        ])));

        let summary = pipeline.run_once().await.unwrap();
        assert_eq!(summary.count, 3);
        let titles: Vec<String> = fx
            .store
            .announcements()
            .into_iter()
            .map(|s| s.announcement.title)
            .collect();
        assert_eq!(titles, vec!["두 번째", "번호 없음", "번호 없음"]);
    }

    #[tokio::test]
    async fn missing_api_key_fails_before_any_io() {
        let (store, _, _) = seeded_store();
        for key in [None, Some("   ")] {
            let (pipeline, calls) = build_pipeline(store.clone(), key, feed(json!([])));
            let outcome = pipeline.invoke().await;
            assert!(!outcome.success);
            assert_eq!(outcome.status_code(), 500);
            assert_eq!(outcome.error.as_deref(), Some("LH_API_KEY is not configured"));
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn missing_parent_category_fails_without_fetching() {
        let store = Arc::new(MemoryAnnouncementStore::new());
        store.add_category(
            Category { id: Uuid::new_v4(), name: "주거".into(), slug: PARENT_CATEGORY_SLUG.into() },
            None,
            false,
        );
        let (pipeline, calls) = build_pipeline(store, Some("key"), feed(json!([])));

        let err = pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, IngestError::ParentCategoryNotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn category_lookup_failure_fails_without_fetching() {
        let (pipeline, fx) = fixture(feed(json!([])));
        fx.store.fail_category_lookups_with("permission denied for table categories");

        let outcome = pipeline.invoke().await;
        assert!(!outcome.success);
        assert_eq!(outcome.status_code(), 500);
        assert_eq!(
            outcome.error.as_deref(),
            Some("category lookup failed: permission denied for table categories")
        );
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn subcategory_lookup_failure_fails_without_fetching() {
        let (pipeline, fx) = fixture(feed(json!([])));
        fx.store.fail_child_lookups_with("statement timeout");

        let err = pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, IngestError::SubcategoryLookup(_)), "{err}");

        let outcome = pipeline.invoke().await;
        assert!(!outcome.success);
        assert_eq!(outcome.status_code(), 500);
        assert_eq!(
            outcome.error.as_deref(),
            Some("subcategory lookup failed: statement timeout")
        );
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ambiguous_parent_category_is_a_lookup_failure() {
        let (store, _, _) = seeded_store();
        store.add_category(
            Category { id: Uuid::new_v4(), name: "주거 (복제)".into(), slug: PARENT_CATEGORY_SLUG.into() },
            None,
            true,
        );
        let (pipeline, calls) = build_pipeline(store, Some("key"), feed(json!([])));

        let err = pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, IngestError::ParentCategoryLookup(_)), "{err}");
        assert!(err.to_string().starts_with("category lookup failed: "));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_feed_succeeds_without_upsert() {
        let (pipeline, fx) = fixture(Canned::Body(json!({"response": "nothing here"})));

        let outcome = pipeline.invoke().await;
        assert!(outcome.success);
        assert_eq!(outcome.count, Some(0));
        assert_eq!(outcome.message.as_deref(), Some("LH API에서 데이터가 없습니다."));
        assert!(outcome.announcements.is_none());
        assert!(fx.store.announcements().is_empty());
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_api_reports_attempts_and_detail() {
        let (pipeline, _fx) = fixture(Canned::Unreachable {
            attempts: 3,
            last: "upstream returned status 503: upstream down".into(),
        });

        let outcome = pipeline.invoke().await;
        let error = outcome.error.unwrap();
        assert!(error.contains("3번"), "{error}");
        assert!(error.contains("503: upstream down"), "{error}");
    }

    #[tokio::test]
    async fn storage_failure_is_surfaced_verbatim() {
        let (pipeline, fx) = fixture(feed(json!([{"공고번호": "D-1", "공고명": "매입임대"}])));
        fx.store.fail_upserts_with("duplicate key value violates unique constraint");

        let outcome = pipeline.invoke().await;
        assert!(!outcome.success);
        assert_eq!(
            outcome.error.as_deref(),
            Some("duplicate key value violates unique constraint")
        );
        assert!(fx.store.announcements().is_empty());
    }

    #[test]
    fn failure_outcome_serializes_without_success_fields() {
        let outcome = FetchOutcome::failed(&IngestError::MissingConfig("LH_API_KEY"));
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            value,
            json!({"success": false, "error": "LH_API_KEY is not configured"})
        );
    }

    #[test]
    fn yaml_rules_replace_builtin_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(
            &path,
            "rules:\n  - patterns: [청년]\n    slug: housing-youth\n    housing_type: 청년주택\n",
        )
        .unwrap();

        let rules = load_category_rules(&path).unwrap();
        assert_eq!(rules.default_housing_type, "LH공사");
        assert_eq!(rules.classify("청년 매입임대", "").slug, "housing-youth");
        assert_eq!(rules.classify("행복주택", "").slug, "default");
    }

    #[test]
    fn yaml_rules_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "rules:\n  - slug: x\n    housing_type: y\n    patterns: []\n").unwrap();

        let err = load_category_rules(&path).unwrap_err();
        assert!(format!("{err:#}").contains("broken.yaml"));
        assert!(load_category_rules(&dir.path().join("absent.yaml")).is_err());
    }

    #[test]
    fn shipped_rules_file_matches_builtin_table() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules/categories.yaml");
        assert_eq!(load_category_rules(&path).unwrap(), CategoryRules::housing_defaults());
    }
}
