//! Published-to-web source: the public HTML rendering of a spreadsheet.
//!
//! The `pubhtml` page lists its tabs in an inline script of the form
//! `items.push({name: "...", pageUrl: "...", gid: "..."})`. Each tab's page
//! references assets with root-relative URLs, which are rewritten to absolute
//! provider URLs so the HTML still renders when served from this host.
//!
//! The markup is not a stable interface; everything that depends on its shape
//! lives in [`list_tabs_from_html`] and [`rewrite_root_relative_urls`].

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::{Captures, Regex};

use super::{http_client, send};
use crate::cache::{TabDescriptor, TabSource};
use crate::error::UpstreamError;

pub const GOOGLE_DOCS_ORIGIN: &str = "https://docs.google.com";

lazy_static! {
    static ref TAB_ITEM_REGEX: Regex = Regex::new(
        r#"items\.push\(\{\s*name:\s*"((?:[^"\\]|\\.)*)",\s*pageUrl:\s*"((?:[^"\\]|\\.)*)",\s*gid:\s*"((?:[^"\\]|\\.)*)""#
    )
    .unwrap();
    static ref ROOT_RELATIVE_ATTR_REGEX: Regex =
        Regex::new(r#"(?i)(\b(?:src|href|action)\s*=\s*["'])/([^/])"#).unwrap();
    static ref ROOT_RELATIVE_CSS_URL_REGEX: Regex =
        Regex::new(r#"(url\(\s*["']?)/([^/])"#).unwrap();
    static ref TITLE_REGEX: Regex = Regex::new(r"(?is)<title>(.*?)</title>").unwrap();
}

/// Address of the published rendering of a document.
///
/// Ids minted by "Publish to the web" (`2PACX-...`) live under `/d/e/`.
pub fn pubhtml_url(document_id: &str) -> String {
    if document_id.starts_with("2PACX-") {
        format!("{}/spreadsheets/d/e/{}/pubhtml", GOOGLE_DOCS_ORIGIN, document_id)
    } else {
        format!("{}/spreadsheets/d/{}/pubhtml", GOOGLE_DOCS_ORIGIN, document_id)
    }
}

/// Address of a single tab's page when the listing did not provide one.
pub fn tab_page_url(document_id: &str, gid: &str) -> String {
    format!("{}/sheet?headers=false&gid={}", pubhtml_url(document_id), gid)
}

/// Extract tab descriptors from a `pubhtml` document.
///
/// # Examples
/// ```
/// use rollcall::upstream::published::list_tabs_from_html;
///
/// let html = r#"<script>items.push({name: "Sheet1", pageUrl: "https:\/\/docs.google.com\/x", gid: "0",initialSheet: true});</script>"#;
/// let tabs = list_tabs_from_html(html);
/// assert_eq!(tabs[0].name, "Sheet1");
/// assert_eq!(tabs[0].page_url.as_deref(), Some("https://docs.google.com/x"));
/// ```
pub fn list_tabs_from_html(markup: &str) -> Vec<TabDescriptor<String>> {
    TAB_ITEM_REGEX
        .captures_iter(markup)
        .map(|caps| {
            let page_url = absolutize(&js_unescape(&caps[2]));
            TabDescriptor::new(js_unescape(&caps[1]), js_unescape(&caps[3])).with_page_url(page_url)
        })
        .collect()
}

fn absolutize(url: &str) -> String {
    if url.starts_with('/') && !url.starts_with("//") {
        format!("{}{}", GOOGLE_DOCS_ORIGIN, url)
    } else {
        url.to_string()
    }
}

/// Decode the escapes found in a double-quoted JavaScript string literal.
pub fn js_unescape(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    let mut chars = literal.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('u') => push_hex_escape(&mut out, &mut chars, 4, 'u'),
            Some('x') => push_hex_escape(&mut out, &mut chars, 2, 'x'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn push_hex_escape(out: &mut String, chars: &mut std::str::Chars<'_>, width: usize, marker: char) {
    let digits: String = chars.clone().take(width).collect();
    let decoded = (digits.len() == width)
        .then(|| u32::from_str_radix(&digits, 16).ok())
        .flatten()
        .and_then(char::from_u32);
    match decoded {
        Some(ch) => {
            out.push(ch);
            for _ in 0..width {
                chars.next();
            }
        }
        None => {
            out.push('\\');
            out.push(marker);
        }
    }
}

/// Point root-relative `src`, `href`, `action` and CSS `url(...)` references
/// at `origin`. Protocol-relative (`//host/...`) references are left alone.
///
/// # Examples
/// ```
/// use rollcall::upstream::published::rewrite_root_relative_urls;
///
/// let html = r#"<link href="/static/a.css"><img src="//ssl.gstatic.com/b.png">"#;
/// assert_eq!(
///     rewrite_root_relative_urls(html, "https://docs.google.com"),
///     r#"<link href="https://docs.google.com/static/a.css"><img src="//ssl.gstatic.com/b.png">"#
/// );
/// ```
pub fn rewrite_root_relative_urls(html: &str, origin: &str) -> String {
    let html = ROOT_RELATIVE_ATTR_REGEX.replace_all(html, |caps: &Captures| prefix_origin(caps, origin));
    ROOT_RELATIVE_CSS_URL_REGEX
        .replace_all(&html, |caps: &Captures| prefix_origin(caps, origin))
        .into_owned()
}

fn prefix_origin(caps: &Captures, origin: &str) -> String {
    format!("{}{}/{}", &caps[1], origin, &caps[2])
}

/// Reads the public HTML rendering of a document.
pub struct PublishedSource {
    client: reqwest::Client,
    document_id: String,
}

impl PublishedSource {
    pub fn new(document_id: impl Into<String>) -> Result<Self, UpstreamError> {
        Ok(Self {
            client: http_client()?,
            document_id: document_id.into(),
        })
    }

    async fn get_text(&self, url: &str) -> Result<String, UpstreamError> {
        send(self.client.get(url), url)
            .await?
            .text()
            .await
            .map_err(|e| UpstreamError::http(url, e))
    }
}

/// Single-tab documents carry no tab script; treat the document as tab `0`.
fn single_tab_fallback(document_id: &str, markup: &str) -> Option<TabDescriptor<String>> {
    let title = TITLE_REGEX.captures(markup)?[1].trim().to_string();
    let name = if title.is_empty() { "Sheet1".to_string() } else { title };
    Some(TabDescriptor::new(name, "0".to_string()).with_page_url(tab_page_url(document_id, "0")))
}

#[async_trait]
impl TabSource for PublishedSource {
    type Id = String;
    type Payload = String;

    async fn list_tabs(&self) -> Result<Vec<TabDescriptor<String>>, UpstreamError> {
        let url = pubhtml_url(&self.document_id);
        let markup = self.get_text(&url).await?;
        let tabs = list_tabs_from_html(&markup);
        if !tabs.is_empty() {
            return Ok(tabs);
        }
        single_tab_fallback(&self.document_id, &markup)
            .map(|tab| vec![tab])
            .ok_or_else(|| UpstreamError::Parse(format!("no tabs found in {}", url)))
    }

    async fn fetch_tab(&self, tab: &TabDescriptor<String>) -> Result<String, UpstreamError> {
        let url = tab
            .page_url
            .clone()
            .unwrap_or_else(|| tab_page_url(&self.document_id, &tab.id));
        let html = self.get_text(&url).await?;
        Ok(rewrite_root_relative_urls(&html, GOOGLE_DOCS_ORIGIN))
    }
}
