//! WebSub hub and feed discovery.
//!
//! Given any URL, find the hub to subscribe at and/or the feed to poll:
//! `Link` response headers first, then hub links inside a parseable feed
//! body, then `<link>` tags scanned out of HTML. A feed URL found in HTML
//! gets one recursive look (depth 1) for a hub of its own.

use feeder_core::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::fetch::FetchClient;
use crate::parser;

static LINK_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<link\b[^>]*>").expect("static regex"));
static HREF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)href\s*=\s*["']([^"']+)["']"#).expect("static regex"));
static REL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)rel\s*=\s*["']([^"']+)["']"#).expect("static regex"));
static TYPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)type\s*=\s*["']([^"']+)["']"#).expect("static regex"));

/// What discovery found for a URL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryResult {
    pub hub_url: Option<String>,
    pub feed_url: Option<String>,
}

/// Locates hubs and feeds starting from an arbitrary URL.
#[derive(Clone)]
pub struct Discovery {
    client: FetchClient,
}

impl Discovery {
    pub fn new(client: FetchClient) -> Self {
        Self { client }
    }

    /// Discover the hub and/or feed behind `url`.
    pub async fn discover(&self, url: &str) -> Result<DiscoveryResult> {
        let base = Url::parse(url)
            .map_err(|_| Error::invalid_input("url", format!("not an absolute URL: {url}")))?;

        let response = self.client.get(url, None).await?;
        if !response.is_success() {
            return Err(Error::upstream(
                url,
                response.status,
                "discovery fetch failed",
            ));
        }

        let mut result = DiscoveryResult::default();

        // Header hub wins over anything found in the body.
        if let Some(link) = response.link_with_rel("hub") {
            if Url::parse(&link.url).is_ok() {
                result.hub_url = Some(link.url.clone());
            }
        }
        if let Some(link) = response.link_with_rel("self") {
            result.feed_url = Some(link.url.clone());
        }

        match parser::parse_feed(&response.body) {
            Ok(feed) => {
                if result.hub_url.is_none() {
                    result.hub_url = feed.hub_url;
                }
                // The target itself is a feed
                if result.feed_url.is_none() {
                    result.feed_url = feed.self_url.or_else(|| Some(url.to_string()));
                }
            }
            Err(_) => {
                if is_html(response.content_type.as_deref()) {
                    let body = String::from_utf8_lossy(&response.body);
                    if result.hub_url.is_none() {
                        result.hub_url = scan_html_hub(&body, &base);
                    }
                    if result.feed_url.is_none() {
                        result.feed_url = scan_html_feed(&body, &base);
                    }

                    // One hop into a discovered feed to look for its hub
                    if result.hub_url.is_none() {
                        if let Some(feed_url) = result.feed_url.clone() {
                            match self.hub_for_feed(&feed_url).await {
                                Ok(nested_hub) => result.hub_url = nested_hub,
                                Err(err) => {
                                    tracing::debug!(
                                        url = %feed_url,
                                        error = %err,
                                        "Nested feed discovery failed"
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }

        tracing::debug!(
            url = %url,
            hub = ?result.hub_url,
            feed = ?result.feed_url,
            "Discovery complete"
        );
        Ok(result)
    }

    /// The depth-1 hop: look for a hub advertised by a feed URL, in its
    /// `Link` headers or feed body. Never recurses further.
    async fn hub_for_feed(&self, url: &str) -> Result<Option<String>> {
        let response = self.client.get(url, None).await?;
        if !response.is_success() {
            return Err(Error::upstream(url, response.status, "feed fetch failed"));
        }
        if let Some(link) = response.link_with_rel("hub") {
            if Url::parse(&link.url).is_ok() {
                return Ok(Some(link.url.clone()));
            }
        }
        match parser::parse_feed(&response.body) {
            Ok(feed) => Ok(feed.hub_url),
            Err(_) => Ok(None),
        }
    }
}

fn is_html(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false)
}

fn attr(tag: &str, re: &Regex) -> Option<String> {
    re.captures(tag)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn resolve(base: &Url, href: &str) -> Option<String> {
    base.join(href).ok().map(|u| u.to_string())
}

/// First `<link rel="hub" href="…">` in the document.
fn scan_html_hub(html: &str, base: &Url) -> Option<String> {
    for tag in LINK_TAG_RE.find_iter(html) {
        let tag = tag.as_str();
        let Some(rel) = attr(tag, &REL_RE) else { continue };
        if !rel
            .split_ascii_whitespace()
            .any(|r| r.eq_ignore_ascii_case("hub"))
        {
            continue;
        }
        if let Some(href) = attr(tag, &HREF_RE) {
            if let Some(resolved) = resolve(base, &href) {
                return Some(resolved);
            }
        }
    }
    None
}

/// First `<link rel="alternate"|"feed">` that plausibly points at a feed.
fn scan_html_feed(html: &str, base: &Url) -> Option<String> {
    for tag in LINK_TAG_RE.find_iter(html) {
        let tag = tag.as_str();
        let Some(rel) = attr(tag, &REL_RE) else { continue };
        let is_feed_rel = rel.split_ascii_whitespace().any(|r| {
            r.eq_ignore_ascii_case("alternate") || r.eq_ignore_ascii_case("feed")
        });
        if !is_feed_rel {
            continue;
        }
        // rel=alternate is also used for translations and AMP pages; require
        // a feed-ish type when one is declared.
        if let Some(media_type) = attr(tag, &TYPE_RE) {
            let lowered = media_type.to_ascii_lowercase();
            if !(lowered.contains("rss") || lowered.contains("atom") || lowered.contains("xml")) {
                continue;
            }
        }
        if let Some(href) = attr(tag, &HREF_RE) {
            if let Some(resolved) = resolve(base, &href) {
                return Some(resolved);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::build_http_client;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn discovery() -> Discovery {
        Discovery::new(FetchClient::new(
            build_http_client().unwrap(),
            Duration::from_secs(5),
            1024 * 1024,
        ))
    }

    const FEED_WITH_HUB: &str = r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:atom="http://www.w3.org/2005/Atom"><channel>
  <title>t</title>
  <atom:link rel="hub" href="https://hub.body.example/"/>
  <item><guid>1</guid></item>
</channel></rss>"#;

    const PLAIN_FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>t</title><item><guid>1</guid></item></channel></rss>"#;

    #[test]
    fn html_scans_resolve_relative_hrefs() {
        let base = Url::parse("https://ex.com/blog/index.html").unwrap();
        let html = r#"<html><head>
            <link rel="hub" href="/hub">
            <link rel="alternate" type="application/atom+xml" href="feed.xml">
            </head></html>"#;
        assert_eq!(
            scan_html_hub(html, &base).as_deref(),
            Some("https://ex.com/hub")
        );
        assert_eq!(
            scan_html_feed(html, &base).as_deref(),
            Some("https://ex.com/blog/feed.xml")
        );
    }

    #[test]
    fn html_feed_scan_skips_non_feed_alternates() {
        let base = Url::parse("https://ex.com/").unwrap();
        let html = r#"<link rel="alternate" type="text/html" hreflang="de" href="/de">
                      <link rel="alternate" type="application/rss+xml" href="/feed">"#;
        assert_eq!(
            scan_html_feed(html, &base).as_deref(),
            Some("https://ex.com/feed")
        );
    }

    #[tokio::test]
    async fn header_hub_wins_over_body_hub() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(FEED_WITH_HUB)
                    .insert_header("Link", "<https://hub.header.example/>; rel=\"hub\""),
            )
            .mount(&server)
            .await;

        let result = discovery()
            .discover(&format!("{}/feed", server.uri()))
            .await
            .unwrap();
        assert_eq!(result.hub_url.as_deref(), Some("https://hub.header.example/"));
    }

    #[tokio::test]
    async fn feed_body_supplies_hub_and_self() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FEED_WITH_HUB))
            .mount(&server)
            .await;

        let url = format!("{}/feed", server.uri());
        let result = discovery().discover(&url).await.unwrap();
        assert_eq!(result.hub_url.as_deref(), Some("https://hub.body.example/"));
        assert_eq!(result.feed_url.as_deref(), Some(url.as_str()));
    }

    #[tokio::test]
    async fn html_page_leads_to_feed_without_hub() {
        let server = MockServer::start().await;
        let html = r#"<html><head>
            <link rel="alternate" type="application/atom+xml" href="/feed.xml">
            </head><body>hi</body></html>"#;
        Mock::given(method("GET"))
            .and(path("/blog.html"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(html)
                    .insert_header("Content-Type", "text/html; charset=utf-8"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PLAIN_FEED))
            .mount(&server)
            .await;

        let result = discovery()
            .discover(&format!("{}/blog.html", server.uri()))
            .await
            .unwrap();
        assert!(result.hub_url.is_none());
        assert_eq!(
            result.feed_url.as_deref(),
            Some(format!("{}/feed.xml", server.uri()).as_str())
        );
    }

    #[tokio::test]
    async fn html_page_recurses_into_feed_for_hub() {
        let server = MockServer::start().await;
        let html = r#"<link rel="alternate" type="application/rss+xml" href="/feed.xml">"#;
        Mock::given(method("GET"))
            .and(path("/blog.html"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(html)
                    .insert_header("Content-Type", "text/html"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FEED_WITH_HUB))
            .mount(&server)
            .await;

        let result = discovery()
            .discover(&format!("{}/blog.html", server.uri()))
            .await
            .unwrap();
        assert_eq!(result.hub_url.as_deref(), Some("https://hub.body.example/"));
    }

    #[tokio::test]
    async fn non_success_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = discovery().discover(&server.uri()).await.unwrap_err();
        assert!(matches!(err, Error::Upstream { .. }));
    }
}
