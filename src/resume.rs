//! Decides which chapters a sync run can reuse and which it has to fetch.

use std::path::Path;

use anyhow::Context as _;
use serde::Serialize;

use crate::cache::{CacheState, CacheStore, LocalFsCacheStore};
use crate::cli::PlanArgs;
use crate::fingerprint::{fingerprint, read_toc};
use crate::marker::MarkerCodec;
use crate::model::{ChapterIdentity, IdentityKind, TocEntry};
use crate::recover::{EpubRecoverer, EpubStateSnapshot};

/// Common view over the two places sync state can come from.
pub trait SyncState {
    fn state_book_id(&self) -> &str;

    /// Fingerprint of the TOC the state was recorded against, if known.
    fn state_toc_hash(&self) -> Option<&str>;

    fn has_downloaded(&self, identity: &ChapterIdentity) -> bool;
    fn has_failed(&self, identity: &ChapterIdentity) -> bool;

    fn has_locked(&self, _identity: &ChapterIdentity) -> bool {
        false
    }
}

impl SyncState for CacheState {
    fn state_book_id(&self) -> &str {
        &self.book_id
    }

    fn state_toc_hash(&self) -> Option<&str> {
        Some(&self.toc_hash)
    }

    fn has_downloaded(&self, identity: &ChapterIdentity) -> bool {
        self.is_cached(identity)
    }

    fn has_failed(&self, identity: &ChapterIdentity) -> bool {
        self.is_failed(identity)
    }

    fn has_locked(&self, identity: &ChapterIdentity) -> bool {
        self.is_locked(identity)
    }
}

impl SyncState for EpubStateSnapshot {
    fn state_book_id(&self) -> &str {
        &self.book_id
    }

    fn state_toc_hash(&self) -> Option<&str> {
        self.toc_hash.as_deref()
    }

    fn has_downloaded(&self, identity: &ChapterIdentity) -> bool {
        self.downloaded.contains(identity)
    }

    fn has_failed(&self, identity: &ChapterIdentity) -> bool {
        self.failed.contains(identity)
    }

    fn has_locked(&self, identity: &ChapterIdentity) -> bool {
        self.locked.contains(identity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeSource {
    Cache(CacheState),
    Output(EpubStateSnapshot),
    Fresh,
}

impl ResumeSource {
    pub fn state(&self) -> Option<&dyn SyncState> {
        match self {
            Self::Cache(state) => Some(state),
            Self::Output(snapshot) => Some(snapshot),
            Self::Fresh => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Cache(_) => "cache",
            Self::Output(_) => "output",
            Self::Fresh => "fresh",
        }
    }
}

/// Picks the state a run resumes from: a cache recorded against
/// `fingerprint`, else the previous output file, else nothing.
pub async fn resolve_state<S>(
    store: &S,
    previous_output: Option<&Path>,
    recoverer: &EpubRecoverer,
    fingerprint: &str,
) -> ResumeSource
where
    S: CacheStore + ?Sized,
{
    if store.exists().await {
        match store.snapshot().await {
            Some(state) if state.is_valid(fingerprint) => return ResumeSource::Cache(state),
            Some(state) => {
                tracing::warn!(
                    book_id = %state.book_id,
                    cached = %state.toc_hash,
                    current = fingerprint,
                    "cache was built for a different table of contents; ignoring it"
                );
            }
            None => tracing::warn!("cache exists but its manifest is unreadable; ignoring it"),
        }
    }

    let Some(path) = previous_output else {
        return ResumeSource::Fresh;
    };
    let path = path.to_path_buf();
    let recoverer = recoverer.clone();
    let snapshot = match tokio::task::spawn_blocking(move || recoverer.analyze(&path)).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            tracing::warn!(?err, "output file analysis task failed");
            None
        }
    };

    match snapshot {
        Some(snapshot) if snapshot.toc_hash.as_deref().is_none_or(|hash| hash == fingerprint) => {
            ResumeSource::Output(snapshot)
        }
        Some(snapshot) => {
            tracing::warn!(
                book_id = %snapshot.book_id,
                "output file was built for a different table of contents; ignoring it"
            );
            ResumeSource::Fresh
        }
        None => ResumeSource::Fresh,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeOptions {
    pub retry_failed: bool,
    /// Locked chapters are never fetched again unless this is set.
    pub retry_locked: bool,
}

impl Default for ResumeOptions {
    fn default() -> Self {
        Self {
            retry_failed: true,
            retry_locked: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumePlan {
    pub reuse: Vec<ChapterIdentity>,
    pub fetch: Vec<ChapterIdentity>,
    pub skipped_locked: Vec<ChapterIdentity>,
    pub skipped_failed: Vec<ChapterIdentity>,
}

/// Splits the TOC, in reading order, into chapters to reuse, fetch or skip.
///
/// A state recorded against a different fingerprint is ignored and every
/// chapter is fetched.
pub fn plan(
    toc: &[TocEntry],
    kind: IdentityKind,
    state: Option<&dyn SyncState>,
    fingerprint: &str,
    options: &ResumeOptions,
) -> ResumePlan {
    let state = state.filter(|s| match s.state_toc_hash() {
        Some(hash) if hash != fingerprint => {
            tracing::info!(
                book_id = s.state_book_id(),
                "previous state does not match the current table of contents"
            );
            false
        }
        _ => true,
    });

    let mut entries: Vec<&TocEntry> = toc.iter().collect();
    entries.sort_by_key(|entry| entry.index);

    let mut out = ResumePlan::default();
    for entry in entries {
        let identity = entry.identity(kind);
        let Some(state) = state else {
            out.fetch.push(identity);
            continue;
        };

        if state.has_downloaded(&identity) {
            out.reuse.push(identity);
        } else if state.has_locked(&identity) && !options.retry_locked {
            out.skipped_locked.push(identity);
        } else if state.has_failed(&identity) && !options.retry_failed {
            out.skipped_failed.push(identity);
        } else {
            out.fetch.push(identity);
        }
    }

    tracing::debug!(
        reuse = out.reuse.len(),
        fetch = out.fetch.len(),
        skipped_locked = out.skipped_locked.len(),
        skipped_failed = out.skipped_failed.len(),
        "planned resume"
    );
    out
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlanReport<'a> {
    fingerprint: &'a str,
    source: &'static str,
    book_id: Option<&'a str>,
    #[serde(flatten)]
    plan: &'a ResumePlan,
}

pub async fn run(args: PlanArgs, codec: MarkerCodec) -> anyhow::Result<()> {
    let toc = read_toc(Path::new(&args.toc))?;
    let fingerprint = fingerprint(&toc);
    let kind = codec.profile().identity_kind();

    let store = LocalFsCacheStore::new(&args.cache);
    let recoverer = EpubRecoverer::new(codec);
    let source = resolve_state(
        &store,
        args.epub.as_deref().map(Path::new),
        &recoverer,
        &fingerprint,
    )
    .await;

    let options = ResumeOptions {
        retry_failed: !args.skip_failed,
        retry_locked: args.retry_locked,
    };
    let state = source.state();
    let resume_plan = plan(&toc, kind, state, &fingerprint, &options);

    let report = PlanReport {
        fingerprint: &fingerprint,
        source: source.label(),
        book_id: state.map(|s| s.state_book_id()),
        plan: &resume_plan,
    };
    let json = serde_json::to_string_pretty(&report).context("serialize plan")?;
    println!("{json}");
    Ok(())
}
