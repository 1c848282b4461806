//! Resource fetching for direct-content user inputs.
//!
//! When a user submits a bare URL, the orchestrator fetches the referenced
//! content and attaches it to the message as source detail. The fetcher is
//! a boundary trait so tests and embedders can substitute their own
//! retrieval (including PDF-capable ones); the bundled implementation
//! handles static HTML and plain text over HTTP(S).

use async_trait::async_trait;
use reqwest::Client;
use std::net::IpAddr;

use crate::error::{ChatError, Result};
use crate::http_client::build_http_client;
use crate::session::MimeKind;
use crate::text_utils::floor_char_boundary;

const MAX_CONTENT_LENGTH: usize = 12000;

/// Content retrieved for a direct-content input.
#[derive(Debug, Clone)]
pub struct FetchedResource {
    pub content: String,
    pub byte_size: usize,
    pub mime_kind: MimeKind,
}

/// Boundary trait for retrieving referenced content.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedResource>;
}

/// Whether the input is a bare fetchable resource locator.
pub fn is_direct_url(input: &str) -> bool {
    let trimmed = input.trim();
    if trimmed.split_whitespace().count() != 1 {
        return false;
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return false;
    }
    url::Url::parse(trimmed).is_ok()
}

/// Validate a URL before fetching. Blocks non-HTTP schemes and
/// internal/private network targets.
fn validate_url(raw: &str) -> std::result::Result<(), String> {
    let parsed = url::Url::parse(raw).map_err(|e| format!("Invalid URL: {}", e))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(format!(
                "Scheme '{}' is not allowed. Only HTTP and HTTPS are permitted.",
                scheme
            ));
        }
    }

    let host = match parsed.host_str() {
        Some(h) => h,
        None => return Err("URL must have a host".to_string()),
    };

    if host.eq_ignore_ascii_case("localhost")
        || host == "0.0.0.0"
        || host == "::1"
        || host == "[::1]"
    {
        return Err("Access to localhost is not allowed".to_string());
    }

    if let Ok(ip) = host.parse::<IpAddr>()
        && is_restricted_ip(&ip)
    {
        return Err(format!(
            "Access to restricted IP address {} is not allowed",
            ip
        ));
    }

    Ok(())
}

/// Check if an IP address is in a restricted range.
fn is_restricted_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                // CGNAT: 100.64.0.0/10
                || matches!(v4.octets(), [100, 64..=127, ..])
                // Metadata and protocol assignments: 192.0.0.0/24
                || matches!(v4.octets(), [192, 0, 0, _])
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_multicast()
                // Unique local: fc00::/7
                || matches!(v6.segments(), [0xfc00..=0xfdff, ..])
                // Link-local: fe80::/10
                || matches!(v6.segments(), [0xfe80..=0xfebf, ..])
        }
    }
}

/// Extract readable text from an HTML document.
fn extract_text(html: &str) -> String {
    let document = scraper::Html::parse_document(html);
    let selector = scraper::Selector::parse("body").expect("static selector");

    let text: String = match document.select(&selector).next() {
        Some(body) => body.text().collect::<Vec<_>>().join(" "),
        None => document.root_element().text().collect::<Vec<_>>().join(" "),
    };

    // Collapse runs of whitespace left behind by markup.
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_content(content: String) -> String {
    if content.len() <= MAX_CONTENT_LENGTH {
        return content;
    }
    let end = floor_char_boundary(&content, MAX_CONTENT_LENGTH);
    content[..end].to_string()
}

/// HTTP(S) resource fetcher for static pages and plain text.
pub struct HttpResourceFetcher {
    client: Client,
}

impl Default for HttpResourceFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpResourceFetcher {
    pub fn new() -> Self {
        Self {
            client: build_http_client(),
        }
    }
}

#[async_trait]
impl ResourceFetcher for HttpResourceFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedResource> {
        validate_url(url).map_err(ChatError::FetchFailed)?;

        let response = self
            .client
            .get(url)
            .header("User-Agent", "Mozilla/5.0 (compatible; chatflow/0.1)")
            .send()
            .await
            .map_err(|e| ChatError::FetchFailed(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ChatError::FetchFailed(format!(
                "HTTP {} for {}",
                response.status().as_u16(),
                url
            )));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_lowercase();

        let mime_kind = if content_type.contains("text/html") {
            MimeKind::Html
        } else if content_type.contains("application/pdf") {
            MimeKind::Pdf
        } else {
            MimeKind::PlainText
        };

        if mime_kind == MimeKind::Pdf {
            return Err(ChatError::FetchFailed(
                "PDF extraction is not supported by the bundled fetcher".to_string(),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ChatError::FetchFailed(format!("body read failed: {}", e)))?;
        let byte_size = body.len();

        let content = match mime_kind {
            MimeKind::Html => extract_text(&body),
            _ => body,
        };

        Ok(FetchedResource {
            content: truncate_content(content),
            byte_size,
            mime_kind,
        })
    }
}
