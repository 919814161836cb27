use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ChapterIdentity, ChapterStatus};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheManifest {
    pub book_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    pub toc_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub cached_chapter_ids: BTreeSet<ChapterIdentity>,
    #[serde(default)]
    pub failed_chapter_ids: BTreeSet<ChapterIdentity>,
    #[serde(default)]
    pub locked_chapter_ids: BTreeSet<ChapterIdentity>,
}

impl CacheManifest {
    pub fn new(init: CacheInit, now: DateTime<Utc>) -> Self {
        Self {
            book_id: init.book_id,
            title: init.title,
            source: init.source,
            server: init.server,
            toc_hash: init.toc_hash,
            created_at: now,
            updated_at: now,
            cached_chapter_ids: BTreeSet::new(),
            failed_chapter_ids: BTreeSet::new(),
            locked_chapter_ids: BTreeSet::new(),
        }
    }

    /// Moves `identity` into the set matching `status`, keeping it in at most
    /// one set.
    pub fn record(
        &mut self,
        identity: &ChapterIdentity,
        status: ChapterStatus,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        match status {
            ChapterStatus::Downloaded | ChapterStatus::Volume => {
                self.failed_chapter_ids.remove(identity);
                self.locked_chapter_ids.remove(identity);
                self.cached_chapter_ids.insert(identity.clone());
            }
            ChapterStatus::Failed | ChapterStatus::Locked
                if self.cached_chapter_ids.contains(identity) =>
            {
                anyhow::bail!("chapter {identity} is already cached and cannot be marked {status}");
            }
            ChapterStatus::Failed => {
                self.locked_chapter_ids.remove(identity);
                self.failed_chapter_ids.insert(identity.clone());
            }
            ChapterStatus::Locked => {
                self.failed_chapter_ids.remove(identity);
                self.locked_chapter_ids.insert(identity.clone());
            }
            ChapterStatus::Pending => {
                anyhow::bail!("chapter {identity} cannot be saved with status pending");
            }
        }
        self.updated_at = now;
        Ok(())
    }
}

/// Arguments for [`super::CacheStore::initialize`].
#[derive(Debug, Clone, Default)]
pub struct CacheInit {
    pub book_id: String,
    pub toc_hash: String,
    pub title: Option<String>,
    pub source: Option<String>,
    pub server: Option<String>,
}

impl CacheInit {
    pub fn new(book_id: impl Into<String>, toc_hash: impl Into<String>) -> Self {
        Self {
            book_id: book_id.into(),
            toc_hash: toc_hash.into(),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CachedChapter {
    pub identity: ChapterIdentity,
    #[serde(default)]
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub status: ChapterStatus,
    /// Wrapped fragment: markers followed by the body or a placeholder.
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
}

impl CachedChapter {
    pub fn new(
        identity: ChapterIdentity,
        order: u32,
        status: ChapterStatus,
        content: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            order,
            title: None,
            status,
            content: content.into(),
            fail_reason: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_fail_reason(mut self, reason: impl Into<String>) -> Self {
        self.fail_reason = Some(reason.into());
        self
    }
}

/// Read-only projection of a manifest.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheState {
    pub book_id: String,
    pub title: Option<String>,
    pub source: Option<String>,
    pub server: Option<String>,
    pub toc_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cached: BTreeSet<ChapterIdentity>,
    pub failed: BTreeSet<ChapterIdentity>,
    pub locked: BTreeSet<ChapterIdentity>,
}

impl CacheState {
    pub fn is_valid(&self, expected_fingerprint: &str) -> bool {
        self.toc_hash == expected_fingerprint
    }

    pub fn is_cached(&self, identity: &ChapterIdentity) -> bool {
        self.cached.contains(identity)
    }

    pub fn is_failed(&self, identity: &ChapterIdentity) -> bool {
        self.failed.contains(identity)
    }

    pub fn is_locked(&self, identity: &ChapterIdentity) -> bool {
        self.locked.contains(identity)
    }
}

impl From<CacheManifest> for CacheState {
    fn from(manifest: CacheManifest) -> Self {
        Self {
            book_id: manifest.book_id,
            title: manifest.title,
            source: manifest.source,
            server: manifest.server,
            toc_hash: manifest.toc_hash,
            created_at: manifest.created_at,
            updated_at: manifest.updated_at,
            cached: manifest.cached_chapter_ids,
            failed: manifest.failed_chapter_ids,
            locked: manifest.locked_chapter_ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> CacheManifest {
        CacheManifest::new(CacheInit::new("book-1", "abcd"), Utc::now())
    }

    #[test]
    fn success_clears_failure_and_lock() -> anyhow::Result<()> {
        let mut manifest = manifest();
        let id = ChapterIdentity::Index(1);
        manifest.record(&id, ChapterStatus::Failed, Utc::now())?;
        assert!(manifest.failed_chapter_ids.contains(&id));

        manifest.record(&id, ChapterStatus::Downloaded, Utc::now())?;
        assert!(manifest.cached_chapter_ids.contains(&id));
        assert!(manifest.failed_chapter_ids.is_empty());
        assert!(manifest.locked_chapter_ids.is_empty());
        Ok(())
    }

    #[test]
    fn cached_chapters_cannot_regress() -> anyhow::Result<()> {
        let mut manifest = manifest();
        let id = ChapterIdentity::id("c1");
        manifest.record(&id, ChapterStatus::Volume, Utc::now())?;
        assert!(manifest.record(&id, ChapterStatus::Failed, Utc::now()).is_err());
        assert!(manifest.record(&id, ChapterStatus::Pending, Utc::now()).is_err());
        assert!(manifest.failed_chapter_ids.is_empty());
        Ok(())
    }

    #[test]
    fn manifest_json_uses_camel_case_and_tolerates_missing_locked_set() -> anyhow::Result<()> {
        let json = serde_json::to_value(manifest())?;
        assert!(json.get("cachedChapterIds").is_some());
        assert!(json.get("tocHash").is_some());

        let legacy = r#"{
            "bookId": "b",
            "tocHash": "h",
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-02T00:00:00Z",
            "cachedChapterIds": [0, 1],
            "failedChapterIds": [2]
        }"#;
        let parsed: CacheManifest = serde_json::from_str(legacy)?;
        assert_eq!(parsed.cached_chapter_ids.len(), 2);
        assert!(parsed.locked_chapter_ids.is_empty());
        Ok(())
    }
}
