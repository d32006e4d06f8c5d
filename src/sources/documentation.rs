//! Documentation sources: a breadth-first crawl of one documentation site.
//!
//! The crawl stays on the start URL's origin and under its directory,
//! follows links up to `max_depth`, and stops after `max_pages` fetches.
//! Each page becomes one source file whose path is the page URL without
//! its scheme and whose content is the page's visible text, with headings
//! rendered as markdown `#` lines so the prose chunker splits on them.
//!
//! `url_patterns` restrict which pages are indexed; `exclude_patterns`
//! remove pages from both indexing and link following. Both are globs
//! matched against the full URL.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use globset::GlobSet;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use resource_index_core::chunk::{Chunker, ProseChunker};
use resource_index_core::models::{
    CrawlOptions, Resource, ResourceKind, SourceFile, SourceOptions, SourceSnapshot,
};

use super::{build_globset, SourceKind};
use crate::config::Config;
use crate::error::EngineError;

const SKIPPED_ELEMENTS: [&str; 8] = [
    "script", "style", "noscript", "iframe", "svg", "head", "template", "button",
];
const CHROME_ELEMENTS: [&str; 4] = ["nav", "header", "footer", "aside"];
const BLOCK_ELEMENTS: [&str; 24] = [
    "p", "div", "section", "article", "main", "li", "ul", "ol", "table", "tr", "blockquote",
    "h1", "h2", "h3", "h4", "h5", "h6", "dt", "dd", "dl", "figure", "figcaption", "hr", "body",
];

pub struct DocumentationSource {
    client: reqwest::Client,
    max_depth: usize,
    max_pages: usize,
    chunker: ProseChunker,
}

impl DocumentationSource {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.documentation.user_agent.clone())
            .timeout(Duration::from_secs(config.documentation.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            max_depth: config.documentation.max_depth,
            max_pages: config.documentation.max_pages,
            chunker: ProseChunker::new(config.chunking.max_tokens),
        })
    }

    async fn get_page(&self, url: &Url, cancel: &CancellationToken) -> Result<Option<Page>> {
        let response = tokio::select! {
            r = self.client.get(url.clone()).send() => r?,
            _ = cancel.cancelled() => bail!("cancelled"),
        };
        let status = response.status();
        if !status.is_success() {
            bail!("HTTP {}", status.as_u16());
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_ascii_lowercase();
        let kind = if content_type.contains("html") {
            PageKind::Html
        } else if content_type.starts_with("text/") {
            PageKind::Text
        } else {
            return Ok(None);
        };

        let body = tokio::select! {
            b = response.text() => b?,
            _ = cancel.cancelled() => bail!("cancelled"),
        };
        Ok(Some(Page {
            url: final_url,
            kind,
            body,
        }))
    }
}

enum PageKind {
    Html,
    Text,
}

struct Page {
    url: Url,
    kind: PageKind,
    body: String,
}

/// Which URLs a crawl may visit and which it indexes.
struct CrawlScope {
    start: Url,
    base_path: String,
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl CrawlScope {
    fn new(start: Url, options: &CrawlOptions) -> Result<Self> {
        let include = if options.url_patterns.is_empty() {
            None
        } else {
            Some(build_globset(&options.url_patterns)?)
        };
        Ok(Self {
            base_path: base_path(&start),
            include,
            exclude: build_globset(&options.exclude_patterns)?,
            start,
        })
    }

    /// May the crawl fetch `url` at all?
    fn may_visit(&self, url: &Url) -> bool {
        url.origin() == self.start.origin()
            && (url.path().starts_with(&self.base_path) || url.path() == self.start.path())
            && !self.exclude.is_match(url.as_str())
    }

    /// Should a fetched page be indexed?
    fn should_index(&self, url: &Url) -> bool {
        self.include
            .as_ref()
            .map_or(true, |set| set.is_match(url.as_str()))
            && !self.exclude.is_match(url.as_str())
    }
}

#[async_trait]
impl SourceKind for DocumentationSource {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Documentation
    }

    fn validate(&self, locator: &str, options: &SourceOptions) -> Result<String, EngineError> {
        let SourceOptions::Documentation(crawl) = options else {
            return Err(EngineError::invalid("documentation resources need crawl options"));
        };
        let locator = locator.trim();
        let mut url = Url::parse(locator).map_err(|e| {
            EngineError::invalid(format!("invalid documentation URL '{locator}': {e}"))
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(EngineError::invalid(format!(
                "documentation URL must be http(s) with a host: '{locator}'"
            )));
        }
        // The stored locator is the URL the crawl fetches, so a trailing
        // slash the site depends on survives.
        url.set_fragment(None);
        for pattern in crawl.url_patterns.iter().chain(&crawl.exclude_patterns) {
            globset::Glob::new(pattern).map_err(|e| {
                EngineError::invalid(format!("invalid URL pattern '{pattern}': {e}"))
            })?;
        }
        Ok(url.to_string())
    }

    async fn fetch(
        &self,
        resource: &Resource,
        cancel: &CancellationToken,
    ) -> Result<SourceSnapshot> {
        let options = match &resource.options {
            SourceOptions::Documentation(options) => options.clone(),
            _ => CrawlOptions::default(),
        };
        let start = Url::parse(&resource.source_locator)
            .with_context(|| format!("invalid start URL {}", resource.source_locator))?;
        let scope = CrawlScope::new(start.clone(), &options)?;
        let max_depth = options.max_depth.unwrap_or(self.max_depth);
        let max_pages = options.max_pages.unwrap_or(self.max_pages).max(1);

        let mut snapshot = SourceSnapshot::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(Url, usize)> = VecDeque::new();
        let mut fetched = 0usize;

        visited.insert(visit_key(&start));
        queue.push_back((start.clone(), 0));

        tracing::info!(url = %start, max_depth, max_pages, "crawl started");

        while let Some((url, depth)) = queue.pop_front() {
            if cancel.is_cancelled() {
                bail!("cancelled");
            }
            if fetched >= max_pages {
                snapshot.warnings.push(format!(
                    "stopped after {max_pages} pages; {} queued URLs skipped",
                    queue.len() + 1
                ));
                break;
            }
            fetched += 1;

            let page = match self.get_page(&url, cancel).await {
                Ok(Some(page)) => page,
                Ok(None) => continue,
                Err(e) if cancel.is_cancelled() => return Err(e),
                Err(e) if depth == 0 => {
                    return Err(anyhow!("failed to fetch {url}: {e:#}"));
                }
                Err(e) => {
                    snapshot.warnings.push(format!("{url}: {e:#}"));
                    continue;
                }
            };

            // Redirects are followed by the client; the page they land on
            // must still be inside the crawl scope.
            if page.url != url && !scope.may_visit(&page.url) {
                snapshot
                    .warnings
                    .push(format!("{url}: redirected outside the crawl scope to {}", page.url));
                continue;
            }
            visited.insert(visit_key(&page.url));

            let text = match page.kind {
                PageKind::Html => extract_text(&page.body, options.only_main_content),
                PageKind::Text => page.body.clone(),
            };
            if scope.should_index(&page.url) && !text.trim().is_empty() {
                snapshot.files.push(SourceFile {
                    path: page_path(&page.url),
                    bytes: text.into_bytes(),
                });
            }

            if depth >= max_depth || !matches!(page.kind, PageKind::Html) {
                continue;
            }
            for link in extract_links(&page.body, &page.url) {
                if scope.may_visit(&link) && visited.insert(visit_key(&link)) {
                    queue.push_back((link, depth + 1));
                }
            }
        }

        // Redirects can land two URLs on the same page.
        snapshot.files.sort_by(|a, b| a.path.cmp(&b.path));
        snapshot.files.dedup_by(|a, b| a.path == b.path);

        tracing::info!(url = %start, pages = snapshot.files.len(), fetched, "crawl finished");
        Ok(snapshot)
    }

    fn chunker(&self) -> &dyn Chunker {
        &self.chunker
    }
}

/// Directory prefix a crawl is confined to. `/docs/intro.html` and
/// `/docs/` both confine to `/docs/`; an extensionless last segment such as
/// `/docs` is treated as a directory.
fn base_path(start: &Url) -> String {
    let path = start.path();
    if path.ends_with('/') {
        return path.to_string();
    }
    match path.rsplit_once('/') {
        Some((dir, last)) if last.contains('.') => format!("{dir}/"),
        _ => format!("{path}/"),
    }
}

/// Deduplication key: no fragment, no trailing slash.
fn visit_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.as_str().trim_end_matches('/').to_string()
}

/// Source path of a page: the URL without scheme and fragment.
pub fn page_path(url: &Url) -> String {
    let mut path = url.host_str().unwrap_or_default().to_string();
    if let Some(port) = url.port() {
        path.push_str(&format!(":{port}"));
    }
    path.push_str(url.path());
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    path
}

/// Absolute http(s) links of a page, fragments removed, in document order
/// without duplicates.
pub fn extract_links(html: &str, base: &Url) -> Vec<Url> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
            continue;
        }
        let Ok(mut absolute) = base.join(href) else {
            continue;
        };
        if !matches!(absolute.scheme(), "http" | "https") {
            continue;
        }
        absolute.set_fragment(None);
        if seen.insert(absolute.to_string()) {
            links.push(absolute);
        }
    }
    links
}

/// Visible text of an HTML page, one paragraph per block element.
///
/// With `main_only`, text comes from the first `<main>`, `<article>` or
/// `[role=main]` element when the page has one, and navigation chrome is
/// dropped otherwise.
pub fn extract_text(html: &str, main_only: bool) -> String {
    let document = Html::parse_document(html);
    let mut out = String::new();

    let main = if main_only {
        Selector::parse("main, article, [role=main]")
            .ok()
            .and_then(|s| document.select(&s).next())
    } else {
        None
    };

    match main {
        Some(element) => walk(element, false, &mut out),
        None => {
            let root = Selector::parse("body")
                .ok()
                .and_then(|s| document.select(&s).next())
                .unwrap_or_else(|| document.root_element());
            walk(root, main_only, &mut out);
        }
    }
    out.trim().to_string()
}

fn walk(element: ElementRef<'_>, skip_chrome: bool, out: &mut String) {
    let name = element.value().name();
    if SKIPPED_ELEMENTS.contains(&name) || (skip_chrome && CHROME_ELEMENTS.contains(&name)) {
        return;
    }
    if name == "br" {
        out.push('\n');
        return;
    }
    if name == "pre" {
        paragraph_break(out);
        out.push_str(element.text().collect::<String>().trim_end());
        paragraph_break(out);
        return;
    }

    let block = BLOCK_ELEMENTS.contains(&name);
    if block {
        paragraph_break(out);
    }
    if let Some(level) = heading_level(name) {
        out.push_str(&"#".repeat(level));
        out.push(' ');
    }

    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
                if collapsed.is_empty() {
                    continue;
                }
                let glued = collapsed.starts_with(['.', ',', ';', ':', '!', '?', ')']);
                if !out.is_empty() && !out.ends_with(char::is_whitespace) && !glued {
                    out.push(' ');
                }
                out.push_str(&collapsed);
            }
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    walk(child, skip_chrome, out);
                }
            }
            _ => {}
        }
    }

    if block {
        paragraph_break(out);
    }
}

fn heading_level(name: &str) -> Option<usize> {
    match name {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

fn paragraph_break(out: &mut String) {
    let trimmed_len = out.trim_end_matches([' ', '\t']).len();
    out.truncate(trimmed_len);
    if out.is_empty() || out.ends_with("\n\n") {
        return;
    }
    if out.ends_with('\n') {
        out.push('\n');
    } else {
        out.push_str("\n\n");
    }
}
