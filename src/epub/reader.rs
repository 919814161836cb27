use std::fs::File;
use std::io::{BufReader, Read as _};
use std::path::Path;

use anyhow::Context as _;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use super::{BookContainer, ContentEntry};
use crate::html;

const CONTAINER_PATH: &str = "META-INF/container.xml";

/// Read-only view of an EPUB file: the parsed package document plus the zip
/// archive for reading entries on demand.
pub struct EpubArchive {
    zip: zip::ZipArchive<BufReader<File>>,
    package: Package,
}

impl std::fmt::Debug for EpubArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpubArchive")
            .field("package", &self.package)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Package {
    dublin_core: Vec<(String, String)>,
    named_meta: Vec<(String, String)>,
    items: Vec<ContentEntry>,
    spine: Vec<String>,
}

impl EpubArchive {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("open epub: {}", path.display()))?;
        let mut zip = zip::ZipArchive::new(BufReader::new(file))
            .with_context(|| format!("read zip: {}", path.display()))?;

        let container_xml = read_entry_text(&mut zip, CONTAINER_PATH)?;
        let opf_path = parse_rootfile_path(&container_xml)
            .context("parse container.xml")?
            .ok_or_else(|| anyhow::anyhow!("container.xml has no rootfile: {}", path.display()))?;

        let opf = read_entry_text(&mut zip, &opf_path)?;
        let base_dir = match opf_path.rsplit_once('/') {
            Some((dir, _)) => dir.to_string(),
            None => String::new(),
        };
        let package = parse_package(&opf, &base_dir)
            .with_context(|| format!("parse package document: {opf_path}"))?;

        tracing::debug!(
            path = %path.display(),
            items = package.items.len(),
            spine = package.spine.len(),
            "opened epub"
        );
        Ok(Self { zip, package })
    }
}

impl BookContainer for EpubArchive {
    fn metadata(&self, name: &str) -> Option<String> {
        self.package
            .named_meta
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    }

    fn dublin_core(&self, element: &str) -> Option<String> {
        self.package
            .dublin_core
            .iter()
            .find(|(key, _)| key == element)
            .map(|(_, value)| value.clone())
    }

    fn spine_entries(&self) -> Vec<ContentEntry> {
        self.package
            .spine
            .iter()
            .filter_map(|idref| self.package.items.iter().find(|item| &item.id == idref))
            .cloned()
            .collect()
    }

    fn resources(&self) -> Vec<ContentEntry> {
        self.package.items.clone()
    }

    fn read_text(&mut self, path: &str) -> anyhow::Result<String> {
        read_entry_text(&mut self.zip, path)
    }

    fn read_bytes(&mut self, path: &str) -> anyhow::Result<Vec<u8>> {
        let mut entry = self
            .zip
            .by_name(path)
            .with_context(|| format!("find zip entry: {path}"))?;
        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .with_context(|| format!("read zip entry: {path}"))?;
        Ok(buf)
    }
}

fn read_entry_text(zip: &mut zip::ZipArchive<BufReader<File>>, path: &str) -> anyhow::Result<String> {
    let mut entry = zip
        .by_name(path)
        .with_context(|| format!("find zip entry: {path}"))?;
    let mut buf = Vec::new();
    entry
        .read_to_end(&mut buf)
        .with_context(|| format!("read zip entry: {path}"))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn parse_rootfile_path(container_xml: &str) -> anyhow::Result<Option<String>> {
    let mut reader = Reader::from_str(container_xml);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event().context("read container.xml event")? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"rootfile" => {
                if let Some(full_path) = attribute(&reader, &e, b"full-path") {
                    return Ok(Some(full_path));
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Which text-bearing metadata element is currently open.
enum Capture {
    DublinCore(String),
    Property(String),
}

fn parse_package(opf: &str, base_dir: &str) -> anyhow::Result<Package> {
    // Text is not trimmed per event: entity references split text events and
    // the surrounding spaces belong to the value.
    let mut reader = Reader::from_str(opf);

    let mut package = Package::default();
    let mut in_metadata = false;
    let mut capture: Option<Capture> = None;
    let mut text = String::new();

    loop {
        let event = reader.read_event().context("read package event")?;
        match event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"metadata" => in_metadata = true,
                b"meta" if in_metadata => {
                    if let Some(property) = attribute(&reader, &e, b"property") {
                        capture = Some(Capture::Property(property));
                        text.clear();
                    } else {
                        push_named_meta(&reader, &e, &mut package);
                    }
                }
                name if in_metadata && is_dublin_core(e.name().as_ref()) => {
                    capture = Some(Capture::DublinCore(
                        String::from_utf8_lossy(name).into_owned(),
                    ));
                    text.clear();
                }
                b"item" => push_item(&reader, &e, base_dir, &mut package),
                b"itemref" => push_itemref(&reader, &e, &mut package),
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"meta" if in_metadata => push_named_meta(&reader, &e, &mut package),
                b"item" => push_item(&reader, &e, base_dir, &mut package),
                b"itemref" => push_itemref(&reader, &e, &mut package),
                _ => {}
            },
            Event::Text(e) => {
                if capture.is_some() {
                    let raw = reader.decoder().decode(&e).unwrap_or_default();
                    text.push_str(&html::unescape(&raw));
                }
            }
            Event::CData(e) => {
                if capture.is_some() {
                    text.push_str(&reader.decoder().decode(&e).unwrap_or_default());
                }
            }
            Event::GeneralRef(e) => {
                if capture.is_some() {
                    let name = reader.decoder().decode(&e).unwrap_or_default();
                    text.push_str(&html::unescape(&format!("&{name};")));
                }
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"metadata" {
                    in_metadata = false;
                }
                match capture.take() {
                    Some(Capture::DublinCore(element)) => {
                        package
                            .dublin_core
                            .push((element, text.trim().to_string()));
                    }
                    Some(Capture::Property(property)) => {
                        package
                            .named_meta
                            .push((property, text.trim().to_string()));
                    }
                    None => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(package)
}

fn is_dublin_core(qualified_name: &[u8]) -> bool {
    qualified_name.starts_with(b"dc:")
}

fn push_named_meta(reader: &Reader<&[u8]>, e: &BytesStart<'_>, package: &mut Package) {
    if let (Some(name), Some(content)) = (
        attribute(reader, e, b"name"),
        attribute(reader, e, b"content"),
    ) {
        package.named_meta.push((name, content));
    }
}

fn push_item(reader: &Reader<&[u8]>, e: &BytesStart<'_>, base_dir: &str, package: &mut Package) {
    let (Some(id), Some(href)) = (attribute(reader, e, b"id"), attribute(reader, e, b"href"))
    else {
        return;
    };
    package.items.push(ContentEntry {
        id,
        path: resolve_href(base_dir, &href),
        media_type: attribute(reader, e, b"media-type").unwrap_or_default(),
        properties: attribute(reader, e, b"properties")
            .map(|p| p.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default(),
    });
}

fn push_itemref(reader: &Reader<&[u8]>, e: &BytesStart<'_>, package: &mut Package) {
    if let Some(idref) = attribute(reader, e, b"idref") {
        package.spine.push(idref);
    }
}

fn attribute(reader: &Reader<&[u8]>, e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == key)
        .map(|attr| {
            let raw = reader
                .decoder()
                .decode(attr.value.as_ref())
                .unwrap_or_default();
            html::unescape(&raw)
        })
}

/// Joins a manifest href onto the package directory, dropping any fragment,
/// percent-decoding, and folding `.`/`..` segments.
pub(crate) fn resolve_href(base_dir: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or_default();
    let href = percent_decode(href);

    let mut segments: Vec<&str> = if href.starts_with('/') {
        Vec::new()
    } else {
        base_dir.split('/').filter(|s| !s.is_empty()).collect()
    };
    for segment in href.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let Some(value) = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        {
            out.push(value);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
