//! Output-file container. The recoverer only talks to [`BookContainer`]; the
//! EPUB archive is the production implementation.

mod reader;
mod writer;

pub use reader::EpubArchive;
pub(crate) use reader::resolve_href;
pub use writer::{BookExport, ExportChapter, WriteEpubOptions, write_epub};

/// One item of the package manifest, with its path resolved to a full
/// archive path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    pub id: String,
    pub path: String,
    pub media_type: String,
    pub properties: Vec<String>,
}

impl ContentEntry {
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Navigation documents and tables of contents, as opposed to chapters.
    pub fn is_navigation(&self) -> bool {
        if self.properties.iter().any(|p| p == "nav") {
            return true;
        }
        if self.media_type == "application/x-dtbncx+xml" {
            return true;
        }
        let name = self.file_name().to_ascii_lowercase();
        let stem = name.split('.').next().unwrap_or_default();
        matches!(stem, "nav" | "toc") || name.ends_with(".ncx")
    }
}

pub trait BookContainer {
    /// Custom metadata by name, in either `<meta name content>` or
    /// `<meta property>value</meta>` form.
    fn metadata(&self, name: &str) -> Option<String>;

    /// First value of a Dublin Core element such as `identifier` or `title`.
    fn dublin_core(&self, element: &str) -> Option<String>;

    fn identifier(&self) -> Option<String> {
        self.dublin_core("identifier")
    }

    fn title(&self) -> Option<String> {
        self.dublin_core("title")
    }

    fn creator(&self) -> Option<String> {
        self.dublin_core("creator")
    }

    fn description(&self) -> Option<String> {
        self.dublin_core("description")
    }

    /// Reading-order entries.
    fn spine_entries(&self) -> Vec<ContentEntry>;

    /// Every manifest item, spine documents included.
    fn resources(&self) -> Vec<ContentEntry>;

    fn read_text(&mut self, path: &str) -> anyhow::Result<String>;

    fn read_bytes(&mut self, path: &str) -> anyhow::Result<Vec<u8>>;
}
