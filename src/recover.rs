//! Rebuilds sync state from a previously written EPUB when the working cache
//! is gone.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::Serialize;

use crate::cli::{ExtractArgs, InspectArgs};
use crate::epub::{BookContainer, ContentEntry, EpubArchive, resolve_href};
use crate::marker::MarkerCodec;
use crate::model::{
    ChapterIdentity, ChapterStatus, IdentityKind, ImageResource, image_id_from_filename,
    media_type_for_path,
};

/// Resume state recovered from an output file. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpubStateSnapshot {
    pub book_id: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub source: Option<String>,
    pub server: Option<String>,
    pub toc_hash: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub downloaded: Vec<ChapterIdentity>,
    pub failed: Vec<ChapterIdentity>,
    pub locked: Vec<ChapterIdentity>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterContent {
    /// Inner HTML of the chapter, markers included.
    pub body: String,
    pub images: Vec<ImageResource>,
}

#[derive(Debug, Clone)]
pub struct EpubRecoverer {
    codec: MarkerCodec,
}

impl EpubRecoverer {
    pub fn new(codec: MarkerCodec) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &MarkerCodec {
        &self.codec
    }

    pub fn analyze(&self, path: &Path) -> Option<EpubStateSnapshot> {
        let mut archive = match EpubArchive::open(path) {
            Ok(archive) => archive,
            Err(err) => {
                tracing::debug!(path = %path.display(), ?err, "no readable output file");
                return None;
            }
        };
        self.analyze_container(&mut archive)
    }

    /// `None` unless the container carries this profile's book id, either as
    /// `ns:book-id` metadata or as an `ns:`-prefixed identifier.
    pub fn analyze_container<C: BookContainer>(&self, container: &mut C) -> Option<EpubStateSnapshot> {
        let profile = self.codec.profile();
        let book_id = non_empty(container.metadata(&profile.field("book-id"))).or_else(|| {
            let prefix = format!("{}:", profile.namespace());
            container
                .identifier()
                .and_then(|id| non_empty(id.strip_prefix(&prefix).map(str::to_owned)))
        });
        let Some(book_id) = book_id else {
            tracing::debug!(namespace = profile.namespace(), "output file carries no book id");
            return None;
        };

        let failed_list = container.metadata(&profile.field("failed-chapters"));
        let mut failed = identity_list(profile.identity_kind(), failed_list.as_deref());
        let locked_list = container.metadata(&profile.field("locked-chapters"));
        let mut locked: Vec<ChapterIdentity> =
            identity_list(profile.identity_kind(), locked_list.as_deref())
                .into_iter()
                .filter(|identity| !failed.contains(identity))
                .collect();
        let known_failed: BTreeSet<ChapterIdentity> = failed.iter().cloned().collect();

        let mut downloaded = Vec::new();
        let mut seen = BTreeSet::new();
        for entry in chapter_entries(container) {
            let text = match container.read_text(&entry.path) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(path = %entry.path, ?err, "skipping unreadable chapter entry");
                    continue;
                }
            };
            let Some(identity) = self.codec.extract_identity(&text) else {
                continue;
            };
            if known_failed.contains(&identity) || locked.contains(&identity) {
                continue;
            }

            match self.codec.extract_status(&text) {
                status if status.counts_as_downloaded() => {
                    if seen.insert(identity.clone()) {
                        downloaded.push(identity);
                    }
                }
                ChapterStatus::Failed => {
                    if !failed.contains(&identity) {
                        failed.push(identity);
                    }
                }
                ChapterStatus::Locked => locked.push(identity),
                _ => {}
            }
        }

        let last_sync = container
            .metadata(&profile.field("sync-time"))
            .or_else(|| container.metadata("dcterms:modified"))
            .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
            .map(|time| time.with_timezone(&Utc));

        let snapshot = EpubStateSnapshot {
            book_id,
            title: non_empty(container.title()),
            author: non_empty(container.creator()),
            description: non_empty(container.description()),
            source: non_empty(container.metadata(&profile.field("source"))),
            server: non_empty(container.metadata(&profile.field("server"))),
            toc_hash: non_empty(container.metadata(&profile.field("toc-hash"))),
            last_sync,
            downloaded,
            failed,
            locked,
        };
        tracing::info!(
            book_id = %snapshot.book_id,
            downloaded = snapshot.downloaded.len(),
            failed = snapshot.failed.len(),
            locked = snapshot.locked.len(),
            "recovered sync state from output file"
        );
        Some(snapshot)
    }

    pub fn read_chapter_content(&self, path: &Path, identity: &ChapterIdentity) -> Option<ChapterContent> {
        let mut archive = match EpubArchive::open(path) {
            Ok(archive) => archive,
            Err(err) => {
                tracing::debug!(path = %path.display(), ?err, "no readable output file");
                return None;
            }
        };
        self.read_chapter_content_from(&mut archive, identity)
    }

    pub fn read_chapter_content_from<C: BookContainer>(
        &self,
        container: &mut C,
        identity: &ChapterIdentity,
    ) -> Option<ChapterContent> {
        let text = chapter_entries(container).into_iter().find_map(|entry| {
            let text = container.read_text(&entry.path).ok()?;
            (self.codec.extract_identity(&text).as_ref() == Some(identity)).then_some(text)
        })?;

        let body = self.extract_body(&text);
        let images = collect_images(container, &body);
        Some(ChapterContent { body, images })
    }

    /// Content container first, then `<body>`, then the entry itself when it
    /// has no document wrapper.
    fn extract_body(&self, text: &str) -> String {
        let document = Html::parse_document(text);
        let container_class = format!(".{}-chapter", self.codec.profile().namespace());
        if let Ok(selector) = Selector::parse(&container_class)
            && let Some(section) = document.select(&selector).next()
        {
            return section.inner_html().trim().to_string();
        }

        if text.to_ascii_lowercase().contains("<body")
            && let Ok(selector) = Selector::parse("body")
            && let Some(body) = document.select(&selector).next()
        {
            return body.inner_html().trim().to_string();
        }

        text.trim().to_string()
    }
}

pub fn inspect(args: InspectArgs, codec: MarkerCodec) -> anyhow::Result<()> {
    let path = Path::new(&args.epub);
    let Some(snapshot) = EpubRecoverer::new(codec).analyze(path) else {
        anyhow::bail!("no sync state found in {}", path.display());
    };
    let json = serde_json::to_string_pretty(&snapshot).context("serialize snapshot")?;
    println!("{json}");
    Ok(())
}

pub fn extract(args: ExtractArgs, codec: MarkerCodec) -> anyhow::Result<()> {
    let kind = codec.profile().identity_kind();
    let Some(identity) = ChapterIdentity::parse(kind, &args.chapter) else {
        anyhow::bail!("invalid chapter identity for {kind:?}: {:?}", args.chapter);
    };

    let path = Path::new(&args.epub);
    let Some(content) = EpubRecoverer::new(codec).read_chapter_content(path, &identity) else {
        anyhow::bail!("chapter {identity} not found in {}", path.display());
    };

    let out_dir = Path::new(&args.out);
    let images_dir = out_dir.join("images");
    std::fs::create_dir_all(&images_dir)
        .with_context(|| format!("create output dir: {}", images_dir.display()))?;

    let chapter_path = out_dir.join("chapter.html");
    std::fs::write(&chapter_path, &content.body)
        .with_context(|| format!("write chapter: {}", chapter_path.display()))?;
    for image in &content.images {
        let image_path = images_dir.join(&image.id);
        std::fs::write(&image_path, &image.data)
            .with_context(|| format!("write image: {}", image_path.display()))?;
    }

    tracing::info!(
        chapter = %identity,
        images = content.images.len(),
        out = %out_dir.display(),
        "extracted chapter"
    );
    Ok(())
}

fn chapter_entries<C: BookContainer>(container: &C) -> Vec<ContentEntry> {
    container
        .spine_entries()
        .into_iter()
        .filter(|entry| !entry.is_navigation())
        .collect()
}

fn collect_images<C: BookContainer>(container: &mut C, body: &str) -> Vec<ImageResource> {
    let Ok(selector) = Selector::parse("img[src]") else {
        return Vec::new();
    };
    let fragment = Html::parse_fragment(body);
    let resources = container.resources();

    let mut images: Vec<ImageResource> = Vec::new();
    for img in fragment.select(&selector) {
        let Some(src) = img.value().attr("src") else {
            continue;
        };
        let src_path = resolve_href("", src);
        let file_name = src_path.rsplit('/').next().unwrap_or_default();
        if file_name.is_empty() {
            continue;
        }
        let id = image_id_from_filename(file_name);
        if images.iter().any(|image| image.id == id) {
            continue;
        }
        let Some(resource) = resources.iter().find(|r| r.file_name() == file_name) else {
            tracing::debug!(src, "image not found among output resources");
            continue;
        };
        let data = match container.read_bytes(&resource.path) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(path = %resource.path, ?err, "skipping unreadable image");
                continue;
            }
        };
        let media_type = if resource.media_type.trim().is_empty() {
            media_type_for_path(file_name).to_string()
        } else {
            resource.media_type.clone()
        };
        images.push(ImageResource {
            id,
            media_type,
            data,
        });
    }
    images
}

/// Comma-separated identities from a metadata field, deduplicated in order.
fn identity_list(kind: IdentityKind, raw: Option<&str>) -> Vec<ChapterIdentity> {
    let mut out = Vec::new();
    for part in raw.unwrap_or_default().split(',') {
        if let Some(identity) = ChapterIdentity::parse(kind, part)
            && !out.contains(&identity)
        {
            out.push(identity);
        }
    }
    out
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::model::SourceProfile;

    #[derive(Default)]
    struct MemoryBook {
        meta: HashMap<String, String>,
        dc: HashMap<String, String>,
        spine: Vec<ContentEntry>,
        extra: Vec<ContentEntry>,
        files: HashMap<String, Vec<u8>>,
    }

    impl MemoryBook {
        fn chapter(mut self, path: &str, text: &str) -> Self {
            self.spine.push(entry(path, "application/xhtml+xml"));
            self.files.insert(path.to_string(), text.as_bytes().to_vec());
            self
        }

        fn image(mut self, path: &str, media_type: &str, data: &[u8]) -> Self {
            self.extra.push(entry(path, media_type));
            self.files.insert(path.to_string(), data.to_vec());
            self
        }
    }

    fn entry(path: &str, media_type: &str) -> ContentEntry {
        ContentEntry {
            id: path.to_string(),
            path: path.to_string(),
            media_type: media_type.to_string(),
            properties: Vec::new(),
        }
    }

    impl BookContainer for MemoryBook {
        fn metadata(&self, name: &str) -> Option<String> {
            self.meta.get(name).cloned()
        }

        fn dublin_core(&self, element: &str) -> Option<String> {
            self.dc.get(element).cloned()
        }

        fn spine_entries(&self) -> Vec<ContentEntry> {
            self.spine.clone()
        }

        fn resources(&self) -> Vec<ContentEntry> {
            self.spine.iter().chain(&self.extra).cloned().collect()
        }

        fn read_text(&mut self, path: &str) -> anyhow::Result<String> {
            Ok(String::from_utf8_lossy(&self.read_bytes(path)?).into_owned())
        }

        fn read_bytes(&mut self, path: &str) -> anyhow::Result<Vec<u8>> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("missing entry: {path}"))
        }
    }

    fn recoverer(kind: IdentityKind) -> EpubRecoverer {
        let profile = SourceProfile::new("ns", kind).unwrap();
        EpubRecoverer::new(MarkerCodec::new(profile).unwrap())
    }

    #[test]
    fn snapshot_lists_downloaded_and_failed_chapters() {
        let r = recoverer(IdentityKind::Index);
        let codec = r.codec().clone();
        let mut book = MemoryBook::default()
            .chapter("nav.xhtml", "<!-- ns:chapter-index=9 --><!-- ns:status=downloaded -->")
            .chapter(
                "c0.xhtml",
                &codec.wrap(&ChapterIdentity::Index(0), 0, ChapterStatus::Downloaded, "<p>a</p>"),
            )
            .chapter(
                "c1.xhtml",
                &codec.wrap(&ChapterIdentity::Index(1), 1, ChapterStatus::Failed, ""),
            )
            .chapter(
                "c2.xhtml",
                &codec.wrap(&ChapterIdentity::Index(2), 2, ChapterStatus::Volume, "<h1>V</h1>"),
            );
        book.meta.insert("ns:book-id".into(), "b-1".into());
        book.meta.insert("ns:toc-hash".into(), "abcdef0123456789".into());
        book.meta.insert("ns:sync-time".into(), "2024-05-01T10:00:00Z".into());

        let snapshot = r.analyze_container(&mut book).unwrap();
        assert_eq!(snapshot.book_id, "b-1");
        assert_eq!(snapshot.toc_hash.as_deref(), Some("abcdef0123456789"));
        assert_eq!(
            snapshot.downloaded,
            vec![ChapterIdentity::Index(0), ChapterIdentity::Index(2)]
        );
        assert_eq!(snapshot.failed, vec![ChapterIdentity::Index(1)]);
        assert!(snapshot.last_sync.is_some());
    }

    #[test]
    fn failed_metadata_wins_over_chapter_markers() {
        let r = recoverer(IdentityKind::Id);
        let codec = r.codec().clone();
        let mut book = MemoryBook::default()
            .chapter(
                "a.xhtml",
                &codec.wrap(&ChapterIdentity::id("a"), 0, ChapterStatus::Downloaded, "<p>a</p>"),
            )
            .chapter(
                "b.xhtml",
                &codec.wrap(&ChapterIdentity::id("b"), 1, ChapterStatus::Failed, ""),
            );
        book.dc.insert("identifier".into(), "ns:book-9".into());
        book.meta.insert("ns:failed-chapters".into(), "b, a,b".into());

        let snapshot = r.analyze_container(&mut book).unwrap();
        assert_eq!(snapshot.book_id, "book-9");
        assert!(snapshot.downloaded.is_empty());
        assert_eq!(
            snapshot.failed,
            vec![ChapterIdentity::id("b"), ChapterIdentity::id("a")]
        );
    }

    #[test]
    fn locked_chapters_survive_recovery() {
        let r = recoverer(IdentityKind::Id);
        let codec = r.codec().clone();
        let mut book = MemoryBook::default()
            .chapter(
                "a.xhtml",
                &codec.wrap(&ChapterIdentity::id("a"), 0, ChapterStatus::Downloaded, "<p>a</p>"),
            )
            .chapter(
                "paid.xhtml",
                &codec.wrap(&ChapterIdentity::id("paid"), 1, ChapterStatus::Locked, ""),
            )
            .chapter(
                "vip.xhtml",
                &codec.wrap(&ChapterIdentity::id("vip"), 2, ChapterStatus::Locked, ""),
            );
        book.meta.insert("ns:book-id".into(), "b".into());
        book.meta.insert("ns:locked-chapters".into(), "vip,extra".into());

        let snapshot = r.analyze_container(&mut book).unwrap();
        assert_eq!(snapshot.downloaded, vec![ChapterIdentity::id("a")]);
        assert!(snapshot.failed.is_empty());
        assert_eq!(
            snapshot.locked,
            vec![
                ChapterIdentity::id("vip"),
                ChapterIdentity::id("extra"),
                ChapterIdentity::id("paid"),
            ]
        );
    }

    #[test]
    fn unreadable_entries_are_skipped() {
        let r = recoverer(IdentityKind::Id);
        let codec = r.codec().clone();
        let mut book = MemoryBook::default().chapter(
            "a.xhtml",
            &codec.wrap(&ChapterIdentity::id("a"), 0, ChapterStatus::Downloaded, "<p>a</p>"),
        );
        book.spine.insert(0, entry("gone.xhtml", "application/xhtml+xml"));
        book.meta.insert("ns:book-id".into(), "b".into());

        let snapshot = r.analyze_container(&mut book).unwrap();
        assert_eq!(snapshot.downloaded, vec![ChapterIdentity::id("a")]);
    }

    #[test]
    fn foreign_books_are_not_recognized() {
        let r = recoverer(IdentityKind::Id);
        let mut book = MemoryBook::default();
        book.dc.insert("identifier".into(), "urn:isbn:123".into());
        book.meta.insert("other:book-id".into(), "x".into());
        assert!(r.analyze_container(&mut book).is_none());
    }

    #[test]
    fn chapter_content_prefers_the_content_container() {
        let r = recoverer(IdentityKind::Id);
        let page = concat!(
            "<html><body><header>skip</header><section class=\"ns-chapter\">",
            "<!-- ns:chapter-id=c1 --><p>Hi <img src=\"images/pic.png\"/></p>",
            "</section></body></html>"
        );
        let mut book = MemoryBook::default()
            .chapter("c1.xhtml", page)
            .image("OEBPS/images/pic.png", "", b"PNG");

        let content = r
            .read_chapter_content_from(&mut book, &ChapterIdentity::id("c1"))
            .unwrap();
        assert!(content.body.starts_with("<!-- ns:chapter-id=c1 -->"));
        assert!(!content.body.contains("skip"));
        assert_eq!(content.images.len(), 1);
        assert_eq!(content.images[0].id, "pic.png");
        assert_eq!(content.images[0].media_type, "image/png");
        assert_eq!(content.images[0].data, b"PNG");
    }

    #[test]
    fn chapter_content_falls_back_to_body_then_bare_fragment() {
        let r = recoverer(IdentityKind::Id);
        let mut book = MemoryBook::default()
            .chapter("a.xhtml", "<html><body><!-- ns:chapter-id=a --><p>A</p></body></html>")
            .chapter("b.xhtml", "<!-- ns:chapter-id=b -->\n<p>B</p>\n");

        let a = r
            .read_chapter_content_from(&mut book, &ChapterIdentity::id("a"))
            .unwrap();
        assert_eq!(a.body, "<!-- ns:chapter-id=a --><p>A</p>");

        let b = r
            .read_chapter_content_from(&mut book, &ChapterIdentity::id("b"))
            .unwrap();
        assert_eq!(b.body, "<!-- ns:chapter-id=b -->\n<p>B</p>");
        assert!(b.images.is_empty());

        assert!(
            r.read_chapter_content_from(&mut book, &ChapterIdentity::id("zz"))
                .is_none()
        );
    }
}
