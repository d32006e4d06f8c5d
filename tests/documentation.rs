use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use resource_index::config::Config;
use resource_index::engine::Engine;
use resource_index::error::EngineError;
use resource_index::query::SearchRequest;
use resource_index_core::models::{CrawlOptions, JobState, ResourceState};

const WAIT: Duration = Duration::from_secs(30);

const INDEX: &str = r#"<html><head><title>Docs</title></head><body>
<nav><a href="/docs/">Home</a> | <a href="/blog/post.html">Blog</a></nav>
<main><h1>HTTP kit documentation</h1>
<p>Start with the <a href="/docs/intro.html">introduction</a>.</p>
<p>Reference: <a href="/docs/api/client.html">Client</a>, <a href="/docs/old/legacy.html">legacy API</a>.</p>
</main></body></html>"#;

const INTRO: &str = r#"<html><body><main><h1>Introduction</h1>
<p>Install the kit with cargo and create a session.</p>
<a href="/docs/">Back</a></main></body></html>"#;

const CLIENT: &str = r#"<html><body><main><h1>Client</h1>
<h2>Retries</h2>
<p>The client retries failed requests with exponential backoff, doubling the delay each attempt.</p>
</main></body></html>"#;

const LEGACY: &str = r#"<html><body><main><h1>Legacy API</h1>
<p>Deprecated synchronous interface.</p></main></body></html>"#;

const BLOG: &str = "<html><body><p>Release announcement.</p></body></html>";

/// Minimal HTTP/1.1 server over a fixed set of pages and redirects. With
/// `slash_redirect`, a path without a trailing slash redirects when only the
/// slashed form exists.
struct Site {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

struct Routes {
    pages: HashMap<String, String>,
    redirects: HashMap<String, String>,
    slash_redirect: bool,
}

impl Routes {
    fn new(pages: &[(&str, &str)]) -> Self {
        Routes {
            pages: pages
                .iter()
                .map(|(path, body)| (path.to_string(), body.to_string()))
                .collect(),
            redirects: HashMap::new(),
            slash_redirect: true,
        }
    }

    fn respond(&self, path: &str) -> String {
        let slashed = format!("{path}/");
        if let Some(body) = self.pages.get(path) {
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
        } else if let Some(location) = self.redirects.get(path) {
            format!(
                "HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            )
        } else if self.slash_redirect && self.pages.contains_key(&slashed) {
            format!(
                "HTTP/1.1 301 Moved Permanently\r\nLocation: {slashed}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            )
        } else {
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
        }
    }
}

impl Site {
    async fn start(pages: &[(&str, &str)]) -> Self {
        Self::serve(Routes::new(pages)).await
    }

    async fn serve(routes: Routes) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes = Arc::new(routes);
        let requests = Arc::new(Mutex::new(Vec::new()));

        let log = requests.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let routes = routes.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let mut read = 0;
                    loop {
                        let n = stream.read(&mut buf[read..]).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        read += n;
                        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") || read == buf.len() {
                            break;
                        }
                    }
                    let request = String::from_utf8_lossy(&buf[..read]).to_string();
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                    log.lock().unwrap().push(path.clone());

                    let response = routes.respond(&path);
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Site { addr, requests }
    }

    async fn docs() -> Self {
        Self::start(&[
            ("/docs/", INDEX),
            ("/docs/intro.html", INTRO),
            ("/docs/api/client.html", CLIENT),
            ("/docs/old/legacy.html", LEGACY),
            ("/blog/post.html", BLOG),
        ])
        .await
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn requested(&self, path: &str) -> bool {
        self.requests.lock().unwrap().iter().any(|p| p == path)
    }
}

async fn open_engine(tmp: &TempDir) -> Engine {
    // Loopback requests must not go through a proxy from the environment.
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let mut config = Config::with_workdir(tmp.path().join("work"));
    config.packages.discover_site_packages = false;
    Engine::open(config).await.unwrap()
}

#[tokio::test]
async fn test_crawl_and_search_documentation() {
    let site = Site::docs().await;
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;

    let receipt = engine
        .index_documentation(&site.url("/docs/"), CrawlOptions::default())
        .await
        .unwrap();
    assert_eq!(receipt.display_name, "docs");
    let job = engine.wait_for_job(&receipt.job_id, WAIT).await.unwrap();
    assert_eq!(job.state, JobState::Succeeded, "job error: {:?}", job.error);

    let status = engine.resource_status(&receipt.resource_id).await.unwrap();
    assert_eq!(status.resource.state, ResourceState::Ready);
    assert_eq!(status.generation.unwrap().file_count, 4);
    assert!(!site.requested("/blog/post.html"));

    let hits = engine
        .search_documentation(&SearchRequest::new("exponential backoff"))
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert!(hits[0].source_path.ends_with("/docs/api/client.html"));
    assert!(hits[0].text.contains("exponential backoff"));

    // Documentation is not part of code search.
    let code = engine
        .search_codebase(&SearchRequest::new("exponential backoff"))
        .await
        .unwrap();
    assert!(code.is_empty());

    // Pages read back from the index; import graphs are code only.
    let page = engine
        .read_source_content(&receipt.resource_id, &hits[0].source_path)
        .await
        .unwrap();
    assert!(page.text.contains("exponential backoff"));
    assert!(matches!(
        engine.visualize_codebase(&receipt.resource_id).await,
        Err(EngineError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_crawl_exclude_patterns() {
    let site = Site::docs().await;
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;

    let crawl = CrawlOptions {
        exclude_patterns: vec!["*/old/*".to_string()],
        ..Default::default()
    };
    let receipt = engine
        .index_documentation(&site.url("/docs/"), crawl)
        .await
        .unwrap();
    let job = engine.wait_for_job(&receipt.job_id, WAIT).await.unwrap();
    assert_eq!(job.state, JobState::Succeeded);

    let status = engine.resource_status(&receipt.resource_id).await.unwrap();
    assert_eq!(status.generation.unwrap().file_count, 3);
    assert!(!site.requested("/docs/old/legacy.html"));
}

#[tokio::test]
async fn test_crawl_url_patterns_limit_indexing() {
    let site = Site::docs().await;
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;

    let crawl = CrawlOptions {
        url_patterns: vec!["*/api/*".to_string()],
        ..Default::default()
    };
    let receipt = engine
        .index_documentation(&site.url("/docs/"), crawl)
        .await
        .unwrap();
    let job = engine.wait_for_job(&receipt.job_id, WAIT).await.unwrap();
    assert_eq!(job.state, JobState::Succeeded);

    let status = engine.resource_status(&receipt.resource_id).await.unwrap();
    assert_eq!(status.generation.unwrap().file_count, 1);
    // Pages outside the patterns are still followed for links.
    assert!(site.requested("/docs/intro.html"));
}

#[tokio::test]
async fn test_crawl_page_limit() {
    let site = Site::docs().await;
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;

    let crawl = CrawlOptions {
        max_pages: Some(1),
        ..Default::default()
    };
    let receipt = engine
        .index_documentation(&site.url("/docs/"), crawl)
        .await
        .unwrap();
    let job = engine.wait_for_job(&receipt.job_id, WAIT).await.unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.progress.files_seen, 1);
    assert!(job.progress.warnings.iter().any(|w| w.contains("stopped after 1 pages")));
}

#[tokio::test]
async fn test_crawl_depth_zero() {
    let site = Site::docs().await;
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;

    let crawl = CrawlOptions {
        max_depth: Some(0),
        ..Default::default()
    };
    let receipt = engine
        .index_documentation(&site.url("/docs/"), crawl)
        .await
        .unwrap();
    let job = engine.wait_for_job(&receipt.job_id, WAIT).await.unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.progress.files_seen, 1);
    assert!(!site.requested("/docs/intro.html"));
}

#[tokio::test]
async fn test_unreachable_start_page_fails_job() {
    let site = Site::docs().await;
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;

    let receipt = engine
        .index_documentation(&site.url("/missing/"), CrawlOptions::default())
        .await
        .unwrap();
    let job = engine.wait_for_job(&receipt.job_id, WAIT).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    let error = job.error.unwrap();
    assert!(error.contains("source fetch failed"), "{error}");
    assert!(error.contains("HTTP 404"), "{error}");

    let status = engine.resource_status(&receipt.resource_id).await.unwrap();
    assert_eq!(status.resource.state, ResourceState::Failed);
}

#[tokio::test]
async fn test_start_url_keeps_trailing_slash() {
    let mut routes = Routes::new(&[("/docs/", INDEX), ("/docs/intro.html", INTRO)]);
    routes.slash_redirect = false;
    let site = Site::serve(routes).await;
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;

    let receipt = engine
        .index_documentation(&site.url("/docs/"), CrawlOptions::default())
        .await
        .unwrap();
    let job = engine.wait_for_job(&receipt.job_id, WAIT).await.unwrap();
    assert_eq!(job.state, JobState::Succeeded, "job error: {:?}", job.error);
    assert!(!site.requested("/docs"));

    let status = engine.resource_status(&receipt.resource_id).await.unwrap();
    assert_eq!(status.resource.source_locator, site.url("/docs/"));
    assert_eq!(status.resource.display_name, "docs");
}

#[tokio::test]
async fn test_redirect_off_origin_is_not_indexed() {
    let other = Site::start(&[(
        "/ext.html",
        "<html><body><main><p>Zebra crossings are striped.</p></main></body></html>",
    )])
    .await;

    let index = r#"<html><body><main><h1>Docs</h1>
<p>Read the <a href="/docs/out.html">external notes</a> or the <a href="/docs/intro.html">introduction</a>.</p>
</main></body></html>"#;
    let mut routes = Routes::new(&[("/docs/", index), ("/docs/intro.html", INTRO)]);
    routes
        .redirects
        .insert("/docs/out.html".to_string(), other.url("/ext.html"));
    let site = Site::serve(routes).await;

    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;
    let receipt = engine
        .index_documentation(&site.url("/docs/"), CrawlOptions::default())
        .await
        .unwrap();
    let job = engine.wait_for_job(&receipt.job_id, WAIT).await.unwrap();
    assert_eq!(job.state, JobState::Succeeded, "job error: {:?}", job.error);
    assert!(job
        .progress
        .warnings
        .iter()
        .any(|w| w.contains("redirected outside the crawl scope")));

    let status = engine.resource_status(&receipt.resource_id).await.unwrap();
    assert_eq!(status.generation.unwrap().file_count, 2);

    let hits = engine
        .search_documentation(&SearchRequest::new("zebra crossings"))
        .await
        .unwrap();
    assert!(hits.iter().all(|h| !h.source_path.contains("/ext.html")));
}
