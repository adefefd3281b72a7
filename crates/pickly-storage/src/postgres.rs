//! PostgreSQL-backed announcement store.

use async_trait::async_trait;
use pickly_core::{Category, NormalizedAnnouncement, UpsertedAnnouncement};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::{AnnouncementStore, StoreError};

const UPSERT_ANNOUNCEMENT_SQL: &str = r#"
    INSERT INTO benefit_announcements (
        category_id, external_id, title, subtitle, organization,
        application_period_start, application_period_end, announcement_date,
        status, summary, external_url, tags, is_featured, views_count
    )
    VALUES (
        $1, $2, $3, $4, $5,
        CAST($6 AS DATE), CAST($7 AS DATE), CAST($8 AS DATE),
        $9, $10, $11, $12, $13, $14
    )
    ON CONFLICT (external_id) DO UPDATE SET
        category_id = EXCLUDED.category_id,
        title = EXCLUDED.title,
        subtitle = EXCLUDED.subtitle,
        organization = EXCLUDED.organization,
        application_period_start = EXCLUDED.application_period_start,
        application_period_end = EXCLUDED.application_period_end,
        announcement_date = EXCLUDED.announcement_date,
        status = EXCLUDED.status,
        summary = EXCLUDED.summary,
        external_url = EXCLUDED.external_url,
        tags = EXCLUDED.tags,
        is_featured = EXCLUDED.is_featured,
        views_count = EXCLUDED.views_count,
        updated_at = NOW()
    RETURNING id, title, external_id
"#;

#[derive(Debug, Clone)]
pub struct PgAnnouncementStore {
    pool: PgPool,
}

impl PgAnnouncementStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a pool without opening a connection; bad URLs fail here, unreachable hosts on first query.
    pub fn connect_lazy(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }
}

fn category_from_row(row: &PgRow) -> Result<Category, sqlx::Error> {
    Ok(Category {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
    })
}

#[async_trait]
impl AnnouncementStore for PgAnnouncementStore {
    async fn find_active_category(&self, slug: &str) -> Result<Option<Category>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, slug
              FROM benefit_categories
             WHERE slug = $1
               AND is_active = TRUE
             LIMIT 2
            "#,
        )
        .bind(slug)
        .fetch_all(&self.pool)
        .await?;

        if rows.len() > 1 {
            return Err(StoreError::Message(format!(
                "expected a single active category with slug {slug}, found several"
            )));
        }
        rows.first()
            .map(category_from_row)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn active_children(&self, parent_id: Uuid) -> Result<Vec<Category>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, slug
              FROM benefit_categories
             WHERE parent_id = $1
               AND is_active = TRUE
             ORDER BY slug
            "#,
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(category_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn upsert_announcements(
        &self,
        rows: &[NormalizedAnnouncement],
    ) -> Result<Vec<UpsertedAnnouncement>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut out = Vec::with_capacity(rows.len());

        for row in rows {
            let returned = sqlx::query(UPSERT_ANNOUNCEMENT_SQL)
                .bind(row.category_id)
                .bind(&row.external_id)
                .bind(&row.title)
                .bind(&row.subtitle)
                .bind(&row.organization)
                .bind(&row.application_period_start)
                .bind(&row.application_period_end)
                .bind(&row.announcement_date)
                .bind(row.status.as_str())
                .bind(&row.summary)
                .bind(&row.external_url)
                .bind(&row.tags)
                .bind(row.is_featured)
                .bind(row.views_count)
                .fetch_one(&mut *tx)
                .await?;

            out.push(UpsertedAnnouncement {
                id: returned.try_get("id")?,
                title: returned.try_get("title")?,
                external_id: returned.try_get("external_id")?,
            });
        }

        tx.commit().await?;
        debug!(rows = out.len(), "committed announcement upsert");
        Ok(out)
    }
}
