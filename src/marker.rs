use anyhow::Context as _;
use regex::Regex;

use crate::html;
use crate::model::{ChapterIdentity, ChapterStatus, IdentityKind, SourceProfile, marker_key_for};

pub const DEFAULT_FAIL_REASON: &str = "The chapter could not be downloaded.";

/// Embeds and extracts per-chapter identity and status markers.
///
/// Three encodings are understood, tried in this order when decoding:
///
/// 1. HTML comments: `<!-- ns:chapter-id=ID -->`, `<!-- ns:status=STATUS -->`
/// 2. legacy meta tags: `<meta name="ns:chapter-id" content="ID">`
/// 3. data attributes: `data-ns-chapter-id="ID"`, `data-ns-status="STATUS"`
///
/// The codec holds only compiled patterns, so one instance can be shared
/// across tasks.
#[derive(Debug, Clone)]
pub struct MarkerCodec {
    profile: SourceProfile,
    identity_comment: Regex,
    status_comment: Regex,
    order_comment: Regex,
    fail_reason_comment: Regex,
    identity_attr: Regex,
    status_attr: Regex,
    meta_tag: Regex,
    attribute: Regex,
    block_tag: Regex,
}

impl MarkerCodec {
    pub fn new(profile: SourceProfile) -> anyhow::Result<Self> {
        let ns = regex::escape(profile.namespace());
        let comment = |field: &str| {
            Regex::new(&format!(r"(?s)<!--\s*{ns}:{field}\s*=\s*(.*?)\s*-->"))
                .with_context(|| format!("compile comment marker pattern: {field}"))
        };

        Ok(Self {
            identity_comment: comment("chapter-(id|index)")?,
            status_comment: comment("status")?,
            order_comment: comment("chapter-order")?,
            fail_reason_comment: comment("fail-reason")?,
            identity_attr: Regex::new(&format!(
                r#"data-{ns}-chapter-(id|index)\s*=\s*(?:"([^"]*)"|'([^']*)')"#
            ))
            .context("compile identity attribute pattern")?,
            status_attr: Regex::new(&format!(
                r#"data-{ns}-status\s*=\s*(?:"([^"]*)"|'([^']*)')"#
            ))
            .context("compile status attribute pattern")?,
            meta_tag: Regex::new(r"(?i)<meta\b[^>]*>").context("compile meta tag pattern")?,
            attribute: Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
                .context("compile attribute pattern")?,
            block_tag: Regex::new(
                r"(?i)<(/?)(p|h[1-6]|blockquote|pre|ul|ol|table|figure)\b([^>]*)>",
            )
            .context("compile block tag pattern")?,
            profile,
        })
    }

    pub fn profile(&self) -> &SourceProfile {
        &self.profile
    }

    pub fn wrap(
        &self,
        identity: &ChapterIdentity,
        order: u32,
        status: ChapterStatus,
        body: &str,
    ) -> String {
        self.wrap_with_reason(identity, order, status, None, body)
    }

    /// Prepends the comment markers to `body`. A fail-reason marker is only
    /// written for `Failed`, falling back to [`DEFAULT_FAIL_REASON`].
    pub fn wrap_with_reason(
        &self,
        identity: &ChapterIdentity,
        order: u32,
        status: ChapterStatus,
        fail_reason: Option<&str>,
        body: &str,
    ) -> String {
        let ns = self.profile.namespace();
        let mut out = String::with_capacity(body.len() + 160);
        out.push_str(&format!(
            "<!-- {ns}:{}={} -->\n",
            identity.marker_key(),
            html::escape_comment_value(&identity.to_string())
        ));
        out.push_str(&format!("<!-- {ns}:chapter-order={order} -->\n"));
        out.push_str(&format!("<!-- {ns}:status={} -->\n", status.as_str()));
        if status == ChapterStatus::Failed {
            let reason = fail_reason.unwrap_or(DEFAULT_FAIL_REASON);
            out.push_str(&format!(
                "<!-- {ns}:fail-reason={} -->\n",
                html::escape_comment_value(reason)
            ));
        }
        out.push_str(body);
        out
    }

    /// Secondary `data-*` encoding, rendered as attributes with a leading
    /// space, ready to be placed inside an opening tag.
    pub fn data_attributes(&self, identity: &ChapterIdentity, status: ChapterStatus) -> String {
        format!(
            " {}=\"{}\" {}=\"{}\"",
            self.profile.data_attr(identity.marker_key()),
            html::escape(&identity.to_string()),
            self.profile.data_attr("status"),
            status.as_str()
        )
    }

    pub fn extract_identity(&self, fragment: &str) -> Option<ChapterIdentity> {
        if let Some(caps) = self.identity_comment.captures(fragment)
            && let Some(identity) = decode_identity(&caps[1], &html::unescape(&caps[2]))
        {
            return Some(identity);
        }

        for kind in [IdentityKind::Id, IdentityKind::Index] {
            let name = self.profile.field(marker_key_for(kind));
            if let Some(value) = self.meta_content(fragment, &name)
                && let Some(identity) = ChapterIdentity::parse(kind, &html::unescape(&value))
            {
                return Some(identity);
            }
        }

        let caps = self.identity_attr.captures(fragment)?;
        let value = caps.get(2).or_else(|| caps.get(3))?.as_str();
        decode_identity(&caps[1], &html::unescape(value))
    }

    /// Status from the first encoding that carries one; `Pending` when none
    /// does or the value is unknown.
    pub fn extract_status(&self, fragment: &str) -> ChapterStatus {
        if let Some(caps) = self.status_comment.captures(fragment) {
            return ChapterStatus::parse(&caps[1]);
        }
        if let Some(value) = self.meta_content(fragment, &self.profile.field("status")) {
            return ChapterStatus::parse(&value);
        }
        self.status_attr
            .captures(fragment)
            .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
            .map(|value| ChapterStatus::parse(value.as_str()))
            .unwrap_or_default()
    }

    pub fn extract_order(&self, fragment: &str) -> Option<u32> {
        let caps = self.order_comment.captures(fragment)?;
        caps[1].parse().ok()
    }

    pub fn extract_fail_reason(&self, fragment: &str) -> Option<String> {
        let caps = self.fail_reason_comment.captures(fragment)?;
        Some(html::unescape(&caps[1]))
    }

    /// Tags each top-level paragraph-like element with its zero-based position
    /// and the owning chapter. Elements that already carry a position keep it,
    /// so running this twice changes nothing.
    pub fn index_paragraphs(&self, fragment: &str, identity: &ChapterIdentity) -> String {
        let index_attr = self.profile.data_attr("index");
        let owner_attr = self.profile.data_attr(identity.marker_key());
        let owner_value = html::escape(&identity.to_string());
        let already_tagged = format!("{index_attr}=");

        let mut out = String::with_capacity(fragment.len() + fragment.len() / 4);
        let mut last = 0;
        let mut open: Vec<String> = Vec::new();
        let mut position = 0_usize;

        for caps in self.block_tag.captures_iter(fragment) {
            let Some(tag) = caps.get(0) else {
                continue;
            };
            let name = caps[2].to_ascii_lowercase();
            if !caps[1].is_empty() {
                if let Some(at) = open.iter().rposition(|n| *n == name) {
                    open.truncate(at);
                }
                continue;
            }

            // Any block start closes an open paragraph, as in HTML parsing.
            if open.last().is_some_and(|n| n == "p") {
                open.pop();
            }

            let attrs = &caps[3];
            let self_closing = attrs.trim_end().ends_with('/');
            if open.is_empty() {
                if !attrs.contains(&already_tagged) {
                    let text = tag.as_str();
                    let (head, tail) = if self_closing {
                        text.split_at(text.len() - 2)
                    } else {
                        text.split_at(text.len() - 1)
                    };
                    out.push_str(&fragment[last..tag.start()]);
                    out.push_str(head.trim_end());
                    out.push_str(&format!(
                        " {index_attr}=\"{position}\" {owner_attr}=\"{owner_value}\""
                    ));
                    out.push_str(tail);
                    last = tag.end();
                }
                position += 1;
            }
            if !self_closing {
                open.push(name);
            }
        }

        out.push_str(&fragment[last..]);
        out
    }

    fn meta_content(&self, fragment: &str, name: &str) -> Option<String> {
        for tag in self.meta_tag.find_iter(fragment) {
            let mut meta_name = None;
            let mut content = None;
            for caps in self.attribute.captures_iter(tag.as_str()) {
                let value = caps
                    .get(2)
                    .or_else(|| caps.get(3))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match caps[1].to_ascii_lowercase().as_str() {
                    "name" => meta_name = Some(value),
                    "content" => content = Some(value),
                    _ => {}
                }
            }
            if meta_name == Some(name) {
                return content.map(str::to_owned);
            }
        }
        None
    }
}

fn decode_identity(key: &str, value: &str) -> Option<ChapterIdentity> {
    let kind = match key {
        "id" => IdentityKind::Id,
        "index" => IdentityKind::Index,
        _ => return None,
    };
    ChapterIdentity::parse(kind, value)
}
