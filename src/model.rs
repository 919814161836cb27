use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::Digest as _;

/// How a content source identifies its chapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    /// Provider-assigned chapter id, stable across syncs.
    Id,
    /// Per-book chapter index, stable only while the TOC keeps its shape.
    Index,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChapterIdentity {
    Index(u32),
    Id(String),
}

impl ChapterIdentity {
    pub fn id(id: impl Into<String>) -> Self {
        Self::Id(id.into())
    }

    /// Parses a bare textual identity. Returns `None` for empty input or a
    /// non-numeric index.
    pub fn parse(kind: IdentityKind, raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match kind {
            IdentityKind::Id => Some(Self::Id(raw.to_owned())),
            IdentityKind::Index => raw.parse().ok().map(Self::Index),
        }
    }

    pub fn kind(&self) -> IdentityKind {
        match self {
            Self::Index(_) => IdentityKind::Index,
            Self::Id(_) => IdentityKind::Id,
        }
    }

    /// Marker field name carrying this identity (`chapter-id` or `chapter-index`).
    pub fn marker_key(&self) -> &'static str {
        marker_key_for(self.kind())
    }

    /// Filename-safe stem for `chapters/<stem>.json`.
    ///
    /// Ids that need sanitizing get a short hash suffix so that e.g. `a/b` and
    /// `a_b` never share a file.
    pub fn file_stem(&self) -> String {
        match self {
            Self::Index(index) => format!("index-{index}"),
            Self::Id(id) => {
                let safe = sanitize_file_component(id);
                if safe == *id {
                    safe
                } else {
                    format!("{safe}-{}", short_hash(id))
                }
            }
        }
    }
}

impl fmt::Display for ChapterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{index}"),
            Self::Id(id) => f.write_str(id),
        }
    }
}

pub(crate) fn marker_key_for(kind: IdentityKind) -> &'static str {
    match kind {
        IdentityKind::Id => "chapter-id",
        IdentityKind::Index => "chapter-index",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChapterStatus {
    #[default]
    Pending,
    Downloaded,
    Failed,
    Locked,
    Volume,
}

impl ChapterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloaded => "downloaded",
            Self::Failed => "failed",
            Self::Locked => "locked",
            Self::Volume => "volume",
        }
    }

    /// Case-insensitive decoding; anything unrecognized is `Pending`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "downloaded" => Self::Downloaded,
            "failed" => Self::Failed,
            "locked" => Self::Locked,
            "volume" => Self::Volume,
            _ => Self::Pending,
        }
    }

    /// Volume chapters carry no fetched content but belong with the
    /// downloaded ones for cache and recovery membership.
    pub fn counts_as_downloaded(self) -> bool {
        matches!(self, Self::Downloaded | Self::Volume)
    }
}

impl<'de> Deserialize<'de> for ChapterStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

impl fmt::Display for ChapterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chapter as reported by a content source's table of contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TocEntry {
    /// Position in the reading order.
    pub index: u32,
    /// Identity value hashed by the fingerprint: the chapter id, or the
    /// source URL for index-based sources.
    pub key: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub is_volume: bool,
}

impl TocEntry {
    pub fn new(index: u32, key: impl Into<String>) -> Self {
        Self {
            index,
            key: key.into(),
            title: String::new(),
            is_volume: false,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn volume(mut self) -> Self {
        self.is_volume = true;
        self
    }

    pub fn identity(&self, kind: IdentityKind) -> ChapterIdentity {
        match kind {
            IdentityKind::Id => ChapterIdentity::Id(self.key.clone()),
            IdentityKind::Index => ChapterIdentity::Index(self.index),
        }
    }
}

/// Marker namespace and identity scheme of one content source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceProfile {
    namespace: String,
    identity_kind: IdentityKind,
}

impl SourceProfile {
    pub const DEFAULT_NAMESPACE: &'static str = "booksync";

    pub fn new(namespace: impl Into<String>, identity_kind: IdentityKind) -> anyhow::Result<Self> {
        let namespace = namespace.into();
        let valid = namespace
            .bytes()
            .next()
            .is_some_and(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
            && namespace
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        if !valid {
            anyhow::bail!("invalid marker namespace (expected [a-z0-9][a-z0-9-]*): {namespace:?}");
        }
        Ok(Self {
            namespace,
            identity_kind,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn identity_kind(&self) -> IdentityKind {
        self.identity_kind
    }

    /// Namespaced metadata / comment field name, e.g. `booksync:toc-hash`.
    pub fn field(&self, name: &str) -> String {
        format!("{}:{name}", self.namespace)
    }

    /// Namespaced `data-*` attribute name, e.g. `data-booksync-status`.
    pub fn data_attr(&self, name: &str) -> String {
        format!("data-{}-{name}", self.namespace)
    }
}

impl Default for SourceProfile {
    fn default() -> Self {
        Self {
            namespace: Self::DEFAULT_NAMESPACE.to_string(),
            identity_kind: IdentityKind::Id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageResource {
    pub id: String,
    pub media_type: String,
    pub data: Vec<u8>,
}

impl ImageResource {
    pub fn new(id: impl Into<String>, data: Vec<u8>) -> Self {
        let id = id.into();
        let media_type = media_type_for_path(&id).to_string();
        Self {
            id,
            media_type,
            data,
        }
    }
}

/// Stable image id from a filename or URL: last path segment, query and
/// fragment stripped, unsafe characters replaced.
pub fn image_id_from_filename(name: &str) -> String {
    let name = name.split(['?', '#']).next().unwrap_or_default();
    let name = name.rsplit(['/', '\\']).next().unwrap_or_default();
    sanitize_file_component(name)
}

pub fn is_filename_safe(name: &str) -> bool {
    !name.is_empty() && sanitize_file_component(name) == name
}

pub fn media_type_for_path(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}

fn sanitize_file_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for (i, ch) in raw.chars().enumerate() {
        let keep = ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || (ch == '.' && i > 0);
        out.push(if keep { ch } else { '_' });
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

fn short_hash(input: &str) -> String {
    let digest = sha2::Sha256::digest(input.as_bytes());
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_serializes_as_number_or_string() -> anyhow::Result<()> {
        let ids = vec![ChapterIdentity::Index(3), ChapterIdentity::id("c7")];
        let json = serde_json::to_string(&ids)?;
        assert_eq!(json, r#"[3,"c7"]"#);
        let back: Vec<ChapterIdentity> = serde_json::from_str(&json)?;
        assert_eq!(back, ids);
        Ok(())
    }

    #[test]
    fn file_stem_disambiguates_sanitized_ids() {
        let plain = ChapterIdentity::id("a_b").file_stem();
        let slashed = ChapterIdentity::id("a/b").file_stem();
        assert_eq!(plain, "a_b");
        assert_ne!(plain, slashed);
        assert!(slashed.starts_with("a_b-"));
        assert_eq!(ChapterIdentity::Index(12).file_stem(), "index-12");
        assert_eq!(ChapterIdentity::id("..").file_stem().chars().next(), Some('_'));
    }

    #[test]
    fn status_parsing_defaults_to_pending() {
        assert_eq!(ChapterStatus::parse("Downloaded"), ChapterStatus::Downloaded);
        assert_eq!(ChapterStatus::parse(" locked "), ChapterStatus::Locked);
        assert_eq!(ChapterStatus::parse("purchased"), ChapterStatus::Pending);
        assert_eq!(ChapterStatus::parse(""), ChapterStatus::Pending);
        assert!(ChapterStatus::Volume.counts_as_downloaded());
        assert!(!ChapterStatus::Locked.counts_as_downloaded());
    }

    #[test]
    fn profile_rejects_namespaces_that_break_markup() {
        assert!(SourceProfile::new("novel-a", IdentityKind::Id).is_ok());
        assert!(SourceProfile::new("", IdentityKind::Id).is_err());
        assert!(SourceProfile::new("Bad NS", IdentityKind::Id).is_err());
        assert!(SourceProfile::new("-x", IdentityKind::Index).is_err());
    }

    #[test]
    fn image_ids_come_from_the_last_path_segment() {
        assert_eq!(image_id_from_filename("https://x.test/a/b/pic.png?w=2#f"), "pic.png");
        assert_eq!(image_id_from_filename("../images/my pic.jpg"), "my_pic.jpg");
        assert!(is_filename_safe("cover.jpg"));
        assert!(!is_filename_safe("../cover.jpg"));
        assert_eq!(media_type_for_path("x.JPEG"), "image/jpeg");
    }
}
