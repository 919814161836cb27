use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use zip::write::SimpleFileOptions;

use crate::html::{self, escape as xml_escape};
use crate::model::{ChapterIdentity, ImageResource};

#[derive(Debug, Clone)]
pub struct WriteEpubOptions {
    pub force: bool,
    /// BCP-47 language tag used for EPUB metadata and XHTML documents.
    pub lang: String,
}

impl Default for WriteEpubOptions {
    fn default() -> Self {
        Self {
            force: false,
            lang: "und".to_string(),
        }
    }
}

/// Everything the writer needs to produce an output file that doubles as a
/// sync checkpoint.
#[derive(Debug, Clone)]
pub struct BookExport {
    pub namespace: String,
    pub book_id: String,
    pub title: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub source: Option<String>,
    pub server: Option<String>,
    pub toc_hash: Option<String>,
    pub sync_time: DateTime<Utc>,
    pub failed: Vec<ChapterIdentity>,
    pub locked: Vec<ChapterIdentity>,
    pub chapters: Vec<ExportChapter>,
    pub images: Vec<ImageResource>,
}

#[derive(Debug, Clone)]
pub struct ExportChapter {
    pub title: String,
    /// Marker-wrapped fragment. Images are referenced as `images/<id>`.
    pub fragment: String,
}

pub fn write_epub(book: &BookExport, out_path: &Path, options: &WriteEpubOptions) -> anyhow::Result<()> {
    if book.chapters.is_empty() {
        anyhow::bail!("refusing to write an epub without chapters: {}", out_path.display());
    }
    if out_path.exists() && !options.force {
        anyhow::bail!("epub output already exists: {}", out_path.display());
    }
    if let Some(parent) = out_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create epub parent dir: {}", parent.display()))?;
    }

    let lang = options.lang.trim();
    let lang = if lang.is_empty() { "und" } else { lang };
    let modified = book
        .sync_time
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    // The previous output is the recovery checkpoint; it is only replaced
    // once the new archive is complete.
    let tmp_path = temp_sibling(out_path)?;
    if let Err(err) = write_archive(book, &tmp_path, lang, &modified) {
        if let Err(remove_err) = fs::remove_file(&tmp_path) {
            tracing::debug!(path = %tmp_path.display(), ?remove_err, "remove partial epub");
        }
        return Err(err);
    }
    fs::rename(&tmp_path, out_path)
        .with_context(|| format!("rename tmp epub to final: {}", out_path.display()))?;

    tracing::info!(
        out = %out_path.display(),
        chapters = book.chapters.len(),
        images = book.images.len(),
        failed = book.failed.len(),
        locked = book.locked.len(),
        "wrote epub"
    );
    Ok(())
}

fn temp_sibling(out_path: &Path) -> anyhow::Result<PathBuf> {
    let file_name = out_path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("epub output has no file name: {}", out_path.display()))?
        .to_string_lossy();
    let tmp_name = format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple());
    Ok(match out_path.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    })
}

fn write_archive(book: &BookExport, path: &Path, lang: &str, modified: &str) -> anyhow::Result<()> {
    let out_file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("open epub output: {}", path.display()))?;

    let mut zip = zip::ZipWriter::new(out_file);

    // `mimetype` must be the first entry and stored uncompressed.
    let mimetype_options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o644);
    zip.start_file("mimetype", mimetype_options)
        .context("epub start_file mimetype")?;
    zip.write_all(b"application/epub+zip")
        .context("epub write mimetype")?;

    let deflated_options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let documents = [
        ("META-INF/container.xml", render_container_xml()),
        ("OEBPS/content.opf", render_content_opf(book, lang, modified)),
        ("OEBPS/nav.xhtml", render_nav_xhtml(book, lang)),
        ("OEBPS/toc.ncx", render_toc_ncx(book)),
        ("OEBPS/style.css", default_style_css(&book.namespace)),
    ];
    for (name, contents) in &documents {
        zip.start_file(*name, deflated_options)
            .with_context(|| format!("epub start_file {name}"))?;
        zip.write_all(contents.as_bytes())
            .with_context(|| format!("epub write {name}"))?;
    }

    for (idx, chapter) in book.chapters.iter().enumerate() {
        let fragment = html::ensure_xhtml_void_tags(&chapter.fragment);
        let xhtml = wrap_xhtml_document(&chapter.title, lang, &book.namespace, &fragment);
        let name = format!("OEBPS/{}", chapter_file_name(idx));
        zip.start_file(name.as_str(), deflated_options)
            .with_context(|| format!("epub start_file chapter: {name}"))?;
        zip.write_all(xhtml.as_bytes())
            .with_context(|| format!("epub write chapter: {name}"))?;
    }

    for image in &book.images {
        let name = format!("OEBPS/images/{}", image.id);
        zip.start_file(name.as_str(), deflated_options)
            .with_context(|| format!("epub start_file image: {}", image.id))?;
        zip.write_all(&image.data)
            .with_context(|| format!("epub write image: {}", image.id))?;
    }

    let file = zip.finish().context("epub finish zip")?;
    file.sync_all()
        .with_context(|| format!("sync epub output: {}", path.display()))?;
    Ok(())
}

fn chapter_file_name(idx: usize) -> String {
    format!("chapter-{:04}.xhtml", idx + 1)
}

fn chapter_item_id(idx: usize) -> String {
    format!("chapter-{:04}", idx + 1)
}

fn render_container_xml() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#
    .to_string()
}

fn default_style_css(namespace: &str) -> String {
    format!(
        r#"@charset "utf-8";

html {{ font-family: serif; }}
body {{ margin: 0; padding: 0 1.2em; line-height: 1.6; }}
img {{ max-width: 100%; height: auto; }}
.{namespace}-placeholder {{ margin: 2em 0; padding: 1em; border: 1px dashed #999; color: #555; }}
.{namespace}-volume h1 {{ text-align: center; margin-top: 30%; }}
"#
    )
}

fn render_nav_xhtml(book: &BookExport, lang: &str) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" lang=\"{}\" xml:lang=\"{}\">\n",
        xml_escape(lang),
        xml_escape(lang)
    ));
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(&book.title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str("  <nav epub:type=\"toc\" id=\"toc\">\n");
    out.push_str("    <ol>\n");
    for (idx, ch) in book.chapters.iter().enumerate() {
        out.push_str(&format!(
            "      <li><a href=\"{}\">{}</a></li>\n",
            chapter_file_name(idx),
            xml_escape(&ch.title)
        ));
    }
    out.push_str("    </ol>\n");
    out.push_str("  </nav>\n");
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

fn render_toc_ncx(book: &BookExport) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\">\n");
    out.push_str("  <head>\n");
    out.push_str(&format!(
        "    <meta name=\"dtb:uid\" content=\"{}\" />\n",
        xml_escape(&book_identifier(book))
    ));
    out.push_str("    <meta name=\"dtb:depth\" content=\"1\" />\n");
    out.push_str("  </head>\n");
    out.push_str("  <docTitle><text>");
    out.push_str(&xml_escape(&book.title));
    out.push_str("</text></docTitle>\n");
    out.push_str("  <navMap>\n");
    for (idx, ch) in book.chapters.iter().enumerate() {
        let play = idx + 1;
        out.push_str(&format!(
            "    <navPoint id=\"navPoint-{play}\" playOrder=\"{play}\">\n"
        ));
        out.push_str("      <navLabel><text>");
        out.push_str(&xml_escape(&ch.title));
        out.push_str("</text></navLabel>\n");
        out.push_str(&format!(
            "      <content src=\"{}\" />\n",
            chapter_file_name(idx)
        ));
        out.push_str("    </navPoint>\n");
    }
    out.push_str("  </navMap>\n");
    out.push_str("</ncx>\n");
    out
}

fn book_identifier(book: &BookExport) -> String {
    format!("{}:{}", book.namespace, book.book_id)
}

fn render_content_opf(book: &BookExport, lang: &str, modified: &str) -> String {
    let ns = &book.namespace;
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(&format!(
        "<package xmlns=\"http://www.idpf.org/2007/opf\" unique-identifier=\"bookid\" version=\"3.0\" xml:lang=\"{}\">\n",
        xml_escape(lang)
    ));
    out.push_str("  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n");
    out.push_str(&format!(
        "    <dc:identifier id=\"bookid\">{}</dc:identifier>\n",
        xml_escape(&book_identifier(book))
    ));
    out.push_str(&format!("    <dc:title>{}</dc:title>\n", xml_escape(&book.title)));
    out.push_str(&format!(
        "    <dc:language>{}</dc:language>\n",
        xml_escape(lang)
    ));
    if let Some(author) = &book.author {
        out.push_str(&format!("    <dc:creator>{}</dc:creator>\n", xml_escape(author)));
    }
    if let Some(description) = &book.description {
        out.push_str(&format!(
            "    <dc:description>{}</dc:description>\n",
            xml_escape(description)
        ));
    }
    out.push_str(&format!(
        "    <meta property=\"dcterms:modified\">{}</meta>\n",
        xml_escape(modified)
    ));

    let mut custom = vec![
        ("book-id", Some(book.book_id.clone())),
        ("sync-time", Some(modified.to_string())),
        ("toc-hash", book.toc_hash.clone()),
        ("source", book.source.clone()),
        ("server", book.server.clone()),
    ];
    for (field, ids) in [("failed-chapters", &book.failed), ("locked-chapters", &book.locked)] {
        if ids.is_empty() {
            continue;
        }
        let list = ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        custom.push((field, Some(list)));
    }
    for (field, value) in custom {
        let Some(value) = value else {
            continue;
        };
        out.push_str(&format!(
            "    <meta name=\"{ns}:{field}\" content=\"{}\" />\n",
            xml_escape(&value)
        ));
    }

    out.push_str("  </metadata>\n");
    out.push_str("  <manifest>\n");
    out.push_str(
        "    <item id=\"nav\" href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\" />\n",
    );
    out.push_str(
        "    <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\" />\n",
    );
    out.push_str("    <item id=\"css\" href=\"style.css\" media-type=\"text/css\" />\n");

    for idx in 0..book.chapters.len() {
        out.push_str(&format!(
            "    <item id=\"{}\" href=\"{}\" media-type=\"application/xhtml+xml\" />\n",
            chapter_item_id(idx),
            chapter_file_name(idx)
        ));
    }

    for (idx, image) in book.images.iter().enumerate() {
        out.push_str(&format!(
            "    <item id=\"image-{}\" href=\"images/{}\" media-type=\"{}\" />\n",
            idx + 1,
            xml_escape(&image.id),
            xml_escape(&image.media_type)
        ));
    }

    out.push_str("  </manifest>\n");
    out.push_str("  <spine toc=\"ncx\">\n");
    for idx in 0..book.chapters.len() {
        out.push_str(&format!("    <itemref idref=\"{}\" />\n", chapter_item_id(idx)));
    }
    out.push_str("  </spine>\n");
    out.push_str("</package>\n");
    out
}

fn wrap_xhtml_document(title: &str, lang: &str, namespace: &str, fragment: &str) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" lang=\"{}\" xml:lang=\"{}\">\n",
        xml_escape(lang),
        xml_escape(lang)
    ));
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str("  <link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\" />\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(&format!("<section class=\"{namespace}-chapter\">\n"));
    out.push_str(fragment);
    if !fragment.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("</section>\n");
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}
