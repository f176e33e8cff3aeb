//! RSS/Atom parsing and normalization.
//!
//! Upstream feeds are untyped in practice: titles may be missing, links may
//! carry no rel, categories may be bare strings. `feed-rs` handles the
//! format zoo; this layer flattens its model into the few fields the engines
//! need and never aborts on a single odd entry.

use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, Feed as RawFeed};
use feeder_core::{Error, Result};

/// A normalized feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub description: Option<String>,
    /// First feed-level `rel=hub` link
    pub hub_url: Option<String>,
    /// First feed-level `rel=self` link
    pub self_url: Option<String>,
    /// Entries in document order
    pub entries: Vec<ParsedEntry>,
}

/// A normalized entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedEntry {
    /// Stable identifier: the entry id, else its first link
    pub guid: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub categories: Vec<String>,
}

impl ParsedEntry {
    /// Best-known content instant, preferring `updated` over `published`.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.updated.or(self.published)
    }
}

/// Parse raw bytes as RSS or Atom.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed> {
    let raw = feed_rs::parser::parse(bytes).map_err(|e| Error::feed_parse(e.to_string()))?;
    Ok(normalize(raw))
}

fn normalize(raw: RawFeed) -> ParsedFeed {
    let hub_url = link_with_rel(&raw.links, "hub");
    let self_url = link_with_rel(&raw.links, "self");

    ParsedFeed {
        title: raw.title.map(|t| t.content),
        description: raw.description.map(|t| t.content),
        hub_url,
        self_url,
        entries: raw.entries.into_iter().map(normalize_entry).collect(),
    }
}

fn link_with_rel(links: &[feed_rs::model::Link], rel: &str) -> Option<String> {
    links
        .iter()
        .find(|l| {
            l.rel
                .as_deref()
                .map(|r| r.eq_ignore_ascii_case(rel))
                .unwrap_or(false)
        })
        .map(|l| l.href.clone())
}

fn normalize_entry(entry: Entry) -> ParsedEntry {
    let url = entry.links.first().map(|l| l.href.clone());
    let guid = if entry.id.trim().is_empty() {
        url.clone()
    } else {
        Some(entry.id)
    };

    if guid.is_none() {
        tracing::debug!("Entry without id or link, will be skipped downstream");
    }

    ParsedEntry {
        guid,
        url,
        title: entry.title.map(|t| t.content),
        author: entry
            .authors
            .into_iter()
            .next()
            .map(|person| person.name)
            .filter(|name| !name.trim().is_empty()),
        published: entry.published,
        updated: entry.updated,
        categories: entry
            .categories
            .into_iter()
            .map(|c| if c.term.trim().is_empty() {
                c.label.unwrap_or_default()
            } else {
                c.term
            })
            .filter(|c| !c.is_empty())
            .collect(),
    }
}
