//! Working cache for one book's in-progress synchronization.
//!
//! Layout under the cache root:
//!
//! ```text
//! manifest.json
//! chapters/<identity stem>.json
//! images/<image id>
//! ```

mod model;
mod store;

use anyhow::Context as _;
use async_trait::async_trait;

pub use model::{CacheInit, CacheManifest, CacheState, CachedChapter};
pub use store::LocalFsCacheStore;

use crate::cli::CacheDirArgs;
use crate::model::ChapterIdentity;

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Creates the directory tree and the initial manifest. Callers check
    /// [`CacheStore::exists`] first.
    async fn initialize(&self, init: CacheInit) -> anyhow::Result<()>;

    /// True iff both the root directory and the manifest file are present.
    async fn exists(&self) -> bool;

    /// `None` when the manifest is missing or unreadable.
    async fn load_manifest(&self) -> Option<CacheManifest>;
    async fn save_manifest(&self, manifest: &CacheManifest) -> anyhow::Result<()>;

    /// Persists the chapter file and records its status in the manifest.
    async fn save_chapter(&self, chapter: &CachedChapter) -> anyhow::Result<()>;
    async fn load_chapter(&self, identity: &ChapterIdentity) -> Option<CachedChapter>;
    async fn load_all_chapters(&self) -> Vec<CachedChapter>;

    async fn save_image(&self, image_id: &str, data: &[u8]) -> anyhow::Result<()>;
    async fn load_image(&self, image_id: &str) -> Option<Vec<u8>>;
    async fn image_exists(&self, image_id: &str) -> bool;
    async fn list_image_ids(&self) -> Vec<String>;

    /// Best effort; failures are logged, never returned.
    async fn cleanup(&self);

    async fn snapshot(&self) -> Option<CacheState>;
}

pub async fn status(args: CacheDirArgs) -> anyhow::Result<()> {
    let store = LocalFsCacheStore::new(&args.dir);
    if !store.exists().await {
        anyhow::bail!("no chapter cache at {}", args.dir);
    }
    let Some(state) = store.snapshot().await else {
        anyhow::bail!("cache manifest is unreadable: {}", args.dir);
    };
    let json = serde_json::to_string_pretty(&state).context("serialize cache state")?;
    println!("{json}");
    Ok(())
}

pub async fn clean(args: CacheDirArgs) -> anyhow::Result<()> {
    LocalFsCacheStore::new(&args.dir).cleanup().await;
    Ok(())
}
