use clap::{Args, Parser, Subcommand};

use crate::marker::MarkerCodec;
use crate::model::{IdentityKind, SourceProfile};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(flatten)]
    pub source: SourceArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct SourceArgs {
    /// Marker namespace used in chapter HTML and book metadata.
    #[arg(long, global = true, default_value = SourceProfile::DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// How the content source identifies chapters.
    #[arg(long, global = true, value_enum, default_value_t = IdentityKind::Id)]
    pub identity: IdentityKind,
}

impl SourceArgs {
    pub fn profile(&self) -> anyhow::Result<SourceProfile> {
        SourceProfile::new(self.namespace.clone(), self.identity)
    }

    pub fn codec(&self) -> anyhow::Result<MarkerCodec> {
        MarkerCodec::new(self.profile()?)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the fingerprint of a table of contents.
    Fingerprint(FingerprintArgs),
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
    /// Print the sync state recovered from a previously written EPUB.
    Inspect(InspectArgs),
    /// Write one chapter of a previously written EPUB, with its images, to a directory.
    Extract(ExtractArgs),
    /// Print which chapters a resumed sync would reuse, fetch or skip.
    Plan(PlanArgs),
    /// Build an EPUB from a chapter cache.
    Export(ExportArgs),
}

#[derive(Debug, Args)]
pub struct FingerprintArgs {
    /// Table of contents JSON: `[{"index", "key", "title", "isVolume"}]`.
    #[arg(long)]
    pub toc: String,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Print the cache manifest summary as JSON.
    Status(CacheDirArgs),
    /// Delete the cache directory.
    Clean(CacheDirArgs),
}

#[derive(Debug, Args)]
pub struct CacheDirArgs {
    /// Cache root directory.
    #[arg(long)]
    pub dir: String,
}

#[derive(Debug, Args)]
pub struct InspectArgs {
    /// EPUB written by a previous sync.
    #[arg(long)]
    pub epub: String,
}

#[derive(Debug, Args)]
pub struct ExtractArgs {
    /// EPUB written by a previous sync.
    #[arg(long)]
    pub epub: String,

    /// Chapter id, or chapter index with `--identity index`.
    #[arg(long)]
    pub chapter: String,

    /// Output directory for `chapter.html` and `images/`.
    #[arg(long)]
    pub out: String,
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Current table of contents JSON.
    #[arg(long)]
    pub toc: String,

    /// Cache root directory.
    #[arg(long)]
    pub cache: String,

    /// Previous output, consulted when the cache is missing or stale.
    #[arg(long)]
    pub epub: Option<String>,

    /// Plan locked chapters for fetching again.
    #[arg(long, default_value_t = false)]
    pub retry_locked: bool,

    /// Leave failed chapters out of the fetch list.
    #[arg(long, default_value_t = false)]
    pub skip_failed: bool,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Cache root directory.
    #[arg(long)]
    pub cache: String,

    /// Output EPUB path.
    #[arg(long)]
    pub out: String,

    /// Book title (default: the cached title, then the book id).
    #[arg(long)]
    pub title: Option<String>,

    #[arg(long)]
    pub author: Option<String>,

    #[arg(long)]
    pub description: Option<String>,

    /// BCP-47 language tag for EPUB metadata.
    #[arg(long, default_value = "und")]
    pub lang: String,

    /// Overwrite the output file if it exists.
    #[arg(long, default_value_t = false)]
    pub force: bool,
}
