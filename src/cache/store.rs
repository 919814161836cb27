use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tokio::sync::Mutex;

use super::model::{CacheInit, CacheManifest, CacheState, CachedChapter};
use super::CacheStore;
use crate::model::{ChapterIdentity, ChapterStatus, is_filename_safe};

const MANIFEST_FILE: &str = "manifest.json";
const CHAPTERS_DIR: &str = "chapters";
const IMAGES_DIR: &str = "images";

/// Directory-backed cache. Share it through `Arc` between chapter tasks; the
/// manifest read-modify-write is serialized by `manifest_lock`.
#[derive(Debug)]
pub struct LocalFsCacheStore {
    root: PathBuf,
    manifest_lock: Mutex<()>,
}

impl LocalFsCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            manifest_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    fn chapters_dir(&self) -> PathBuf {
        self.root.join(CHAPTERS_DIR)
    }

    fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    fn chapter_path(&self, identity: &ChapterIdentity) -> PathBuf {
        self.chapters_dir()
            .join(format!("{}.json", identity.file_stem()))
    }

    fn image_path(&self, image_id: &str) -> anyhow::Result<PathBuf> {
        if !is_filename_safe(image_id) {
            anyhow::bail!("image id is not filename-safe: {image_id:?}");
        }
        Ok(self.images_dir().join(image_id))
    }

    async fn read_manifest(&self) -> Option<CacheManifest> {
        let path = self.manifest_path();
        match read_json(&path).await {
            Ok(manifest) => manifest,
            Err(err) => {
                tracing::warn!(path = %path.display(), ?err, "ignoring unreadable cache manifest");
                None
            }
        }
    }
}

#[async_trait]
impl CacheStore for LocalFsCacheStore {
    async fn initialize(&self, init: CacheInit) -> anyhow::Result<()> {
        for dir in [self.root.clone(), self.chapters_dir(), self.images_dir()] {
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("create cache dir: {}", dir.display()))?;
        }

        let manifest = CacheManifest::new(init, Utc::now());
        let _guard = self.manifest_lock.lock().await;
        write_json_atomic(&self.manifest_path(), &manifest)
            .await
            .context("write initial manifest")?;

        tracing::info!(
            root = %self.root.display(),
            book_id = %manifest.book_id,
            toc_hash = %manifest.toc_hash,
            "initialized chapter cache"
        );
        Ok(())
    }

    async fn exists(&self) -> bool {
        let root_is_dir = fs::metadata(&self.root)
            .await
            .is_ok_and(|meta| meta.is_dir());
        root_is_dir
            && fs::metadata(self.manifest_path())
                .await
                .is_ok_and(|meta| meta.is_file())
    }

    async fn load_manifest(&self) -> Option<CacheManifest> {
        let _guard = self.manifest_lock.lock().await;
        self.read_manifest().await
    }

    async fn save_manifest(&self, manifest: &CacheManifest) -> anyhow::Result<()> {
        let _guard = self.manifest_lock.lock().await;
        write_json_atomic(&self.manifest_path(), manifest)
            .await
            .context("write manifest")
    }

    async fn save_chapter(&self, chapter: &CachedChapter) -> anyhow::Result<()> {
        if chapter.status == ChapterStatus::Pending {
            anyhow::bail!(
                "chapter {} cannot be saved with status pending",
                chapter.identity
            );
        }

        let _guard = self.manifest_lock.lock().await;
        let Some(mut manifest) = self.read_manifest().await else {
            anyhow::bail!(
                "chapter cache is not initialized: {}",
                self.root.display()
            );
        };
        manifest
            .record(&chapter.identity, chapter.status, Utc::now())
            .context("record chapter status")?;

        let path = self.chapter_path(&chapter.identity);
        write_json_atomic(&path, chapter)
            .await
            .with_context(|| format!("write chapter {}", chapter.identity))?;
        write_json_atomic(&self.manifest_path(), &manifest)
            .await
            .context("write manifest")?;

        tracing::debug!(
            identity = %chapter.identity,
            status = %chapter.status,
            "saved chapter"
        );
        Ok(())
    }

    async fn load_chapter(&self, identity: &ChapterIdentity) -> Option<CachedChapter> {
        let path = self.chapter_path(identity);
        match read_json::<CachedChapter>(&path).await {
            Ok(chapter) => chapter,
            Err(err) => {
                tracing::warn!(path = %path.display(), ?err, "skipping unreadable chapter file");
                None
            }
        }
    }

    async fn load_all_chapters(&self) -> Vec<CachedChapter> {
        let dir = self.chapters_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::debug!(dir = %dir.display(), ?err, "no chapter directory");
                return Vec::new();
            }
        };

        let mut chapters = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(dir = %dir.display(), ?err, "stopped listing chapter files");
                    break;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<CachedChapter>(&path).await {
                Ok(Some(chapter)) => chapters.push(chapter),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), ?err, "skipping unreadable chapter file");
                }
            }
        }

        chapters.sort_by(|a, b| {
            a.order
                .cmp(&b.order)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        chapters
    }

    async fn save_image(&self, image_id: &str, data: &[u8]) -> anyhow::Result<()> {
        let path = self.image_path(image_id)?;
        write_bytes_atomic(&path, data)
            .await
            .with_context(|| format!("write image {image_id}"))
    }

    async fn load_image(&self, image_id: &str) -> Option<Vec<u8>> {
        let path = self.image_path(image_id).ok()?;
        match fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                tracing::warn!(path = %path.display(), ?err, "skipping unreadable image");
                None
            }
        }
    }

    async fn image_exists(&self, image_id: &str) -> bool {
        let Ok(path) = self.image_path(image_id) else {
            return false;
        };
        fs::metadata(&path).await.is_ok_and(|meta| meta.is_file())
    }

    async fn list_image_ids(&self) -> Vec<String> {
        let Ok(mut entries) = fs::read_dir(self.images_dir()).await else {
            return Vec::new();
        };

        let mut ids = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
            let name = entry.file_name().to_string_lossy().to_string();
            if is_file && !name.starts_with('.') {
                ids.push(name);
            }
        }
        ids.sort();
        ids
    }

    async fn cleanup(&self) {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => tracing::info!(root = %self.root.display(), "removed chapter cache"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(root = %self.root.display(), ?err, "failed to remove chapter cache");
            }
        }
    }

    async fn snapshot(&self) -> Option<CacheState> {
        self.load_manifest().await.map(CacheState::from)
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    write_bytes_atomic(path, &data).await
}

/// Writes to a hidden temp file next to `path`, then renames it into place,
/// so readers never observe a half-written file.
async fn write_bytes_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", path.display()))?
        .to_string_lossy();

    let tmp_path = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp_path, data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}
