use std::path::Path;

use anyhow::Context as _;
use sha2::Digest as _;

use crate::cli::FingerprintArgs;
use crate::model::TocEntry;

const SEPARATOR: &str = "\n";
const FINGERPRINT_BYTES: usize = 8;

/// Short hash over the ordered identity keys of a TOC.
///
/// Entries are ordered by `index`, not by slice order. Titles and volume flags
/// do not participate. Good for drift detection only.
pub fn fingerprint(entries: &[TocEntry]) -> String {
    let mut ordered = entries.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|entry| entry.index);

    let joined = ordered
        .iter()
        .map(|entry| entry.key.as_str())
        .collect::<Vec<_>>()
        .join(SEPARATOR);

    let digest = sha2::Sha256::digest(joined.as_bytes());
    hex::encode(&digest[..FINGERPRINT_BYTES])
}

pub fn run(args: FingerprintArgs) -> anyhow::Result<()> {
    let toc = read_toc(Path::new(&args.toc))?;
    println!("{}", fingerprint(&toc));
    Ok(())
}

/// Reads a TOC JSON array of `{index, key, title, isVolume}` objects.
pub fn read_toc(path: &Path) -> anyhow::Result<Vec<TocEntry>> {
    let bytes = std::fs::read(path).with_context(|| format!("read toc: {}", path.display()))?;
    let toc: Vec<TocEntry> =
        serde_json::from_slice(&bytes).with_context(|| format!("parse toc: {}", path.display()))?;
    if toc.is_empty() {
        anyhow::bail!("toc is empty: {}", path.display());
    }
    Ok(toc)
}
