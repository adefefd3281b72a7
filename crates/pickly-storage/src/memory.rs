//! In-process announcement store with the same upsert semantics as PostgreSQL.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use pickly_core::{Category, NormalizedAnnouncement, UpsertedAnnouncement};
use uuid::Uuid;

use crate::{AnnouncementStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAnnouncement {
    pub id: Uuid,
    pub announcement: NormalizedAnnouncement,
}

#[derive(Debug, Clone)]
struct CategoryRow {
    category: Category,
    parent_id: Option<Uuid>,
    is_active: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    categories: Vec<CategoryRow>,
    announcements: Vec<StoredAnnouncement>,
    upsert_failure: Option<String>,
    category_failure: Option<String>,
    children_failure: Option<String>,
}

#[derive(Debug, Default)]
pub struct MemoryAnnouncementStore {
    state: Mutex<MemoryState>,
}

impl MemoryAnnouncementStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_category(&self, category: Category, parent_id: Option<Uuid>, is_active: bool) {
        self.lock().categories.push(CategoryRow {
            category,
            parent_id,
            is_active,
        });
    }

    /// Every subsequent upsert fails with `message` and leaves the rows untouched.
    pub fn fail_upserts_with(&self, message: impl Into<String>) {
        self.lock().upsert_failure = Some(message.into());
    }

    /// Every subsequent `find_active_category` call fails with `message`.
    pub fn fail_category_lookups_with(&self, message: impl Into<String>) {
        self.lock().category_failure = Some(message.into());
    }

    /// Every subsequent `active_children` call fails with `message`.
    pub fn fail_child_lookups_with(&self, message: impl Into<String>) {
        self.lock().children_failure = Some(message.into());
    }

    pub fn announcements(&self) -> Vec<StoredAnnouncement> {
        self.lock().announcements.clone()
    }
}

#[async_trait]
impl AnnouncementStore for MemoryAnnouncementStore {
    async fn find_active_category(&self, slug: &str) -> Result<Option<Category>, StoreError> {
        let state = self.lock();
        if let Some(message) = &state.category_failure {
            return Err(StoreError::Message(message.clone()));
        }
        let mut matches = state
            .categories
            .iter()
            .filter(|row| row.is_active && row.category.slug == slug);
        let first = matches.next().map(|row| row.category.clone());
        if matches.next().is_some() {
            return Err(StoreError::Message(format!(
                "expected a single active category with slug {slug}, found several"
            )));
        }
        Ok(first)
    }

    async fn active_children(&self, parent_id: Uuid) -> Result<Vec<Category>, StoreError> {
        let state = self.lock();
        if let Some(message) = &state.children_failure {
            return Err(StoreError::Message(message.clone()));
        }
        Ok(state
            .categories
            .iter()
            .filter(|row| row.is_active && row.parent_id == Some(parent_id))
            .map(|row| row.category.clone())
            .collect())
    }

    async fn upsert_announcements(
        &self,
        rows: &[NormalizedAnnouncement],
    ) -> Result<Vec<UpsertedAnnouncement>, StoreError> {
        let mut state = self.lock();
        if let Some(message) = &state.upsert_failure {
            return Err(StoreError::Message(message.clone()));
        }

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let existing = row.external_id.as_ref().and_then(|external_id| {
                state
                    .announcements
                    .iter_mut()
                    .find(|stored| stored.announcement.external_id.as_ref() == Some(external_id))
            });

            let id = match existing {
                Some(stored) => {
                    stored.announcement = row.clone();
                    stored.id
                }
                None => {
                    let id = Uuid::new_v4();
                    state.announcements.push(StoredAnnouncement {
                        id,
                        announcement: row.clone(),
                    });
                    id
                }
            };

            out.push(UpsertedAnnouncement {
                id,
                title: row.title.clone(),
                external_id: row.external_id.clone(),
            });
        }
        Ok(out)
    }
}
