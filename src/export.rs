use std::path::PathBuf;

use anyhow::Context as _;
use chrono::{DateTime, Utc};

use crate::cache::{CacheStore, CachedChapter, LocalFsCacheStore};
use crate::cli::ExportArgs;
use crate::epub::{BookExport, ExportChapter, WriteEpubOptions, write_epub};
use crate::marker::MarkerCodec;
use crate::model::{ChapterStatus, ImageResource};
use crate::placeholder;

/// Book-level fields that the cache does not carry, or that override it.
#[derive(Debug, Clone)]
pub struct ExportMeta {
    pub title: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub sync_time: DateTime<Utc>,
}

impl Default for ExportMeta {
    fn default() -> Self {
        Self {
            title: None,
            author: None,
            description: None,
            sync_time: Utc::now(),
        }
    }
}

pub async fn run(args: ExportArgs, codec: MarkerCodec) -> anyhow::Result<()> {
    let store = LocalFsCacheStore::new(&args.cache);
    if !store.exists().await {
        anyhow::bail!("no chapter cache at {}", args.cache);
    }

    let meta = ExportMeta {
        title: args.title,
        author: args.author,
        description: args.description,
        sync_time: Utc::now(),
    };
    let book = export_from_cache(&store, &codec, meta).await?;

    let out = PathBuf::from(&args.out);
    let options = WriteEpubOptions {
        force: args.force,
        lang: args.lang,
    };
    tokio::task::spawn_blocking(move || write_epub(&book, &out, &options))
        .await
        .context("join epub writer task")??;
    Ok(())
}

/// Assembles an exportable book from everything the cache holds.
///
/// Chapters whose stored content already carries markers are exported as
/// is; the rest get markers or a placeholder matching their status.
pub async fn export_from_cache<S>(store: &S, codec: &MarkerCodec, meta: ExportMeta) -> anyhow::Result<BookExport>
where
    S: CacheStore + ?Sized,
{
    let Some(manifest) = store.load_manifest().await else {
        anyhow::bail!("cache manifest is missing or unreadable");
    };

    let mut chapters = Vec::new();
    for chapter in store.load_all_chapters().await {
        if chapter.status == ChapterStatus::Pending {
            continue;
        }
        let title = chapter
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| format!("Chapter {}", chapter.identity));
        let fragment = chapter_fragment(codec, &chapter, &title);
        chapters.push(ExportChapter { title, fragment });
    }

    let mut images = Vec::new();
    for id in store.list_image_ids().await {
        match store.load_image(&id).await {
            Some(data) => images.push(ImageResource::new(id, data)),
            None => tracing::warn!(image_id = %id, "image listed but unreadable; leaving it out"),
        }
    }

    let title = meta
        .title
        .or_else(|| manifest.title.clone())
        .unwrap_or_else(|| manifest.book_id.clone());

    tracing::info!(
        book_id = %manifest.book_id,
        chapters = chapters.len(),
        failed = manifest.failed_chapter_ids.len(),
        locked = manifest.locked_chapter_ids.len(),
        images = images.len(),
        "assembled book from cache"
    );

    Ok(BookExport {
        namespace: codec.profile().namespace().to_string(),
        book_id: manifest.book_id,
        title,
        author: meta.author,
        description: meta.description,
        source: manifest.source,
        server: manifest.server,
        toc_hash: Some(manifest.toc_hash),
        sync_time: meta.sync_time,
        failed: manifest.failed_chapter_ids.into_iter().collect(),
        locked: manifest.locked_chapter_ids.into_iter().collect(),
        chapters,
        images,
    })
}

fn chapter_fragment(codec: &MarkerCodec, chapter: &CachedChapter, title: &str) -> String {
    if codec.extract_identity(&chapter.content).as_ref() == Some(&chapter.identity) {
        return chapter.content.clone();
    }

    let identity = &chapter.identity;
    match chapter.status {
        ChapterStatus::Failed => placeholder::failed_placeholder(
            codec,
            identity,
            title,
            chapter.order,
            chapter.fail_reason.as_deref(),
        ),
        ChapterStatus::Locked => placeholder::locked_placeholder(codec, identity, title, chapter.order),
        ChapterStatus::Volume if chapter.content.trim().is_empty() => {
            placeholder::volume_placeholder(codec, identity, title, chapter.order)
        }
        status => codec.wrap(identity, chapter.order, status, &chapter.content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChapterIdentity, IdentityKind, SourceProfile};

    fn codec() -> MarkerCodec {
        MarkerCodec::new(SourceProfile::new("ns", IdentityKind::Id).unwrap()).unwrap()
    }

    #[test]
    fn unmarked_chapters_get_markers_for_their_status() {
        let codec = codec();
        let downloaded = CachedChapter::new(
            ChapterIdentity::id("a"),
            0,
            ChapterStatus::Downloaded,
            "<p>A</p>",
        );
        let html = chapter_fragment(&codec, &downloaded, "A");
        assert_eq!(codec.extract_identity(&html), Some(ChapterIdentity::id("a")));
        assert_eq!(codec.extract_status(&html), ChapterStatus::Downloaded);
        assert!(html.ends_with("<p>A</p>"));

        let failed = CachedChapter::new(ChapterIdentity::id("b"), 1, ChapterStatus::Failed, "")
            .with_fail_reason("timeout");
        let html = chapter_fragment(&codec, &failed, "B");
        assert_eq!(codec.extract_status(&html), ChapterStatus::Failed);
        assert_eq!(codec.extract_fail_reason(&html).as_deref(), Some("timeout"));
    }

    #[test]
    fn marked_content_is_kept_verbatim() {
        let codec = codec();
        let id = ChapterIdentity::id("a");
        let content = codec.wrap(&id, 0, ChapterStatus::Downloaded, "<p>A</p>");
        let chapter = CachedChapter::new(id, 0, ChapterStatus::Downloaded, content.clone());
        assert_eq!(chapter_fragment(&codec, &chapter, "A"), content);
    }
}
