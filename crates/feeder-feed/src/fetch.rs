//! Outbound HTTP fetching.
//!
//! One shared `reqwest::Client` serves the whole process: User-Agent set,
//! redirects capped at 5 hops. Feed fetches support conditional GET and a
//! body size cap enforced while streaming.

use feeder_core::{user_agent, Error, Result};
use futures::StreamExt;
use reqwest::header;
use std::time::Duration;

/// Build the shared HTTP client.
pub fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent())
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(|e| Error::configuration(format!("Failed to build HTTP client: {e}")))
}

/// Validators captured from a previous fetch, replayed as conditional headers.
#[derive(Debug, Clone, Default)]
pub struct ConditionalHeaders {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// A `Link` header entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRel {
    pub url: String,
    pub rel: String,
}

/// The interesting parts of an upstream response.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub links: Vec<LinkRel>,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }

    /// First `Link` header entry carrying the given rel.
    pub fn link_with_rel(&self, rel: &str) -> Option<&LinkRel> {
        self.links.iter().find(|l| l.rel.eq_ignore_ascii_case(rel))
    }
}

/// Fetches URLs with per-call timeouts and a streaming size cap.
#[derive(Clone)]
pub struct FetchClient {
    http: reqwest::Client,
    timeout: Duration,
    max_body_bytes: usize,
}

impl FetchClient {
    pub fn new(http: reqwest::Client, timeout: Duration, max_body_bytes: usize) -> Self {
        Self {
            http,
            timeout,
            max_body_bytes,
        }
    }

    /// GET a URL, optionally replaying cache validators.
    pub async fn get(
        &self,
        url: &str,
        conditional: Option<&ConditionalHeaders>,
    ) -> Result<FetchedResponse> {
        let mut request = self.http.get(url).timeout(self.timeout);

        if let Some(cond) = conditional {
            if let Some(etag) = &cond.etag {
                request = request.header(header::IF_NONE_MATCH, etag);
            }
            if let Some(modified) = &cond.last_modified {
                request = request.header(header::IF_MODIFIED_SINCE, modified);
            }
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::timeout(url)
            } else {
                Error::upstream_io(url, e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let header_str = |name: header::HeaderName| {
            response
                .headers()
                .get(&name)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string)
        };

        let content_type = header_str(header::CONTENT_TYPE);
        let etag = header_str(header::ETAG);
        let last_modified = header_str(header::LAST_MODIFIED);
        let links = response
            .headers()
            .get_all(header::LINK)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(parse_link_header)
            .collect();

        let body = self.read_capped(url, response).await?;

        Ok(FetchedResponse {
            status,
            body,
            content_type,
            etag,
            last_modified,
            links,
        })
    }

    async fn read_capped(&self, url: &str, response: reqwest::Response) -> Result<Vec<u8>> {
        if let Some(len) = response.content_length() {
            if len as usize > self.max_body_bytes {
                return Err(Error::upstream_io(
                    url,
                    format!("response of {len} bytes exceeds cap"),
                ));
            }
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::upstream_io(url, e.to_string()))?;
            if body.len().saturating_add(chunk.len()) > self.max_body_bytes {
                return Err(Error::upstream_io(url, "response exceeds size cap"));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

/// Parse a `Link` header value into `(url, rel)` pairs.
///
/// Handles the common shape `<url>; rel="hub", <url2>; rel=self`; entries
/// without a rel parameter are dropped.
pub fn parse_link_header(value: &str) -> Vec<LinkRel> {
    let mut out = Vec::new();
    for part in value.split(',') {
        let mut url = None;
        let mut rel = None;
        for piece in part.split(';') {
            let piece = piece.trim();
            if piece.starts_with('<') && piece.ends_with('>') {
                url = Some(piece[1..piece.len() - 1].to_string());
            } else if let Some(value) = piece.strip_prefix("rel=") {
                rel = Some(value.trim_matches('"').to_string());
            }
        }
        if let (Some(url), Some(rel)) = (url, rel) {
            out.push(LinkRel { url, rel });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parses_multi_entry_link_header() {
        let links =
            parse_link_header(r#"<https://hub.ex/>; rel="hub", <https://ex.com/feed>; rel=self"#);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].url, "https://hub.ex/");
        assert_eq!(links[0].rel, "hub");
        assert_eq!(links[1].rel, "self");
    }

    #[test]
    fn drops_entries_without_rel() {
        let links = parse_link_header("<https://ex.com/page2>");
        assert!(links.is_empty());
    }

    #[tokio::test]
    async fn captures_validators_and_links() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<rss/>")
                    .insert_header("Content-Type", "application/rss+xml")
                    .insert_header("ETag", "\"abc\"")
                    .insert_header("Last-Modified", "Wed, 01 Jan 2025 00:00:00 GMT")
                    .insert_header("Link", "<https://hub.ex/>; rel=\"hub\""),
            )
            .mount(&server)
            .await;

        let client = FetchClient::new(
            build_http_client().unwrap(),
            Duration::from_secs(5),
            1024,
        );
        let fetched = client
            .get(&format!("{}/feed", server.uri()), None)
            .await
            .unwrap();
        assert!(fetched.is_success());
        assert_eq!(fetched.etag.as_deref(), Some("\"abc\""));
        assert_eq!(
            fetched.last_modified.as_deref(),
            Some("Wed, 01 Jan 2025 00:00:00 GMT")
        );
        assert_eq!(fetched.link_with_rel("hub").unwrap().url, "https://hub.ex/");
        assert_eq!(fetched.body, b"<rss/>");
    }

    #[tokio::test]
    async fn replays_conditional_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(header("If-None-Match", "\"abc\""))
            .and(header("If-Modified-Since", "Wed, 01 Jan 2025 00:00:00 GMT"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let client = FetchClient::new(
            build_http_client().unwrap(),
            Duration::from_secs(5),
            1024,
        );
        let conditional = ConditionalHeaders {
            etag: Some("\"abc\"".into()),
            last_modified: Some("Wed, 01 Jan 2025 00:00:00 GMT".into()),
        };
        let fetched = client
            .get(&format!("{}/feed", server.uri()), Some(&conditional))
            .await
            .unwrap();
        assert!(fetched.is_not_modified());
    }

    #[tokio::test]
    async fn rejects_oversized_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 2048]))
            .mount(&server)
            .await;

        let client = FetchClient::new(
            build_http_client().unwrap(),
            Duration::from_secs(5),
            1024,
        );
        let err = client.get(&server.uri(), None).await.unwrap_err();
        assert!(matches!(err, Error::Upstream { .. }));
    }
}
