//! Stand-in fragments for chapters without fetched content, plus the wrapper
//! for chapters that were fetched. Everything here is pure.

use crate::html;
use crate::marker::{DEFAULT_FAIL_REASON, MarkerCodec};
use crate::model::{ChapterIdentity, ChapterStatus};

const LOCKED_EXPLANATION: &str = "This chapter is locked by the content source. \
It requires a purchase or an authorization that was not available during synchronization.";

pub fn failed_placeholder(
    codec: &MarkerCodec,
    identity: &ChapterIdentity,
    title: &str,
    order: u32,
    reason: Option<&str>,
) -> String {
    let reason = reason
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_FAIL_REASON);
    let body = placeholder_block(
        codec,
        identity,
        ChapterStatus::Failed,
        title,
        &[
            "This chapter failed to download and will be retried on the next synchronization.",
            &format!("Reason: {reason}"),
        ],
    );
    codec.wrap_with_reason(identity, order, ChapterStatus::Failed, Some(reason), &body)
}

pub fn locked_placeholder(
    codec: &MarkerCodec,
    identity: &ChapterIdentity,
    title: &str,
    order: u32,
) -> String {
    let body = placeholder_block(
        codec,
        identity,
        ChapterStatus::Locked,
        title,
        &[LOCKED_EXPLANATION],
    );
    codec.wrap(identity, order, ChapterStatus::Locked, &body)
}

/// Section heading inserted into the reading order for a volume entry.
pub fn volume_placeholder(
    codec: &MarkerCodec,
    identity: &ChapterIdentity,
    title: &str,
    order: u32,
) -> String {
    let body = format!(
        "<div class=\"{ns}-volume\"{attrs}>\n<h1>{title}</h1>\n</div>\n",
        ns = codec.profile().namespace(),
        attrs = codec.data_attributes(identity, ChapterStatus::Volume),
        title = html::escape(title),
    );
    codec.wrap(identity, order, ChapterStatus::Volume, &body)
}

/// Prepends the markers to an already fetched and paragraph-indexed body.
pub fn wrap_downloaded(
    codec: &MarkerCodec,
    identity: &ChapterIdentity,
    order: u32,
    body: &str,
) -> String {
    codec.wrap(identity, order, ChapterStatus::Downloaded, body)
}

fn placeholder_block(
    codec: &MarkerCodec,
    identity: &ChapterIdentity,
    status: ChapterStatus,
    title: &str,
    lines: &[&str],
) -> String {
    let mut out = format!(
        "<div class=\"{}-placeholder\"{}>\n",
        codec.profile().namespace(),
        codec.data_attributes(identity, status)
    );
    out.push_str(&format!("<h2>{}</h2>\n", html::escape(title)));
    for line in lines {
        out.push_str(&format!("<p>{}</p>\n", html::escape(line)));
    }
    out.push_str("</div>\n");
    out
}
