//! The three free search backends: DuckDuckGo HTML, the Wikipedia opensearch
//! API, and the arXiv Atom API.
//!
//! HTTP hygiene: one shared client, a plain User-Agent, no cookies, no
//! credentials; every request carries the per-source timeout.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;

use crate::{SearchError, SearchHit, SearchSource};

const USER_AGENT: &str = "Mozilla/5.0 (Linux) Meridian/0.1";

/// Results kept per source.
const PER_SOURCE_LIMIT: usize = 5;

fn client(timeout: Duration) -> Result<reqwest::Client, SearchError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|err| SearchError::Transport(err.to_string()))
}

fn transport(err: reqwest::Error) -> SearchError {
    if err.is_timeout() {
        SearchError::Timeout
    } else {
        SearchError::Transport(err.to_string())
    }
}

// ── DuckDuckGo ───────────────────────────────────────────────────────────────

/// HTML-endpoint search; no API key required.
pub struct DuckDuckGoSearch {
    timeout: Duration,
}

impl DuckDuckGoSearch {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn parse(html: &str) -> Vec<SearchHit> {
        static RESULT: LazyLock<Selector> =
            LazyLock::new(|| Selector::parse("div.result").expect("valid selector"));
        static TITLE: LazyLock<Selector> =
            LazyLock::new(|| Selector::parse("a.result__a").expect("valid selector"));
        static SNIPPET: LazyLock<Selector> =
            LazyLock::new(|| Selector::parse("a.result__snippet").expect("valid selector"));

        let document = Html::parse_document(html);
        let mut hits = Vec::new();
        for result in document.select(&RESULT) {
            let Some(title_el) = result.select(&TITLE).next() else { continue };
            let title = title_el.text().collect::<String>().trim().to_string();
            let url = title_el.value().attr("href").unwrap_or_default().to_string();
            let snippet = result
                .select(&SNIPPET)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string())
                .unwrap_or_default();

            if !title.is_empty() {
                hits.push(SearchHit {
                    title,
                    url,
                    snippet,
                    source: "DuckDuckGo".to_string(),
                });
                if hits.len() >= PER_SOURCE_LIMIT {
                    break;
                }
            }
        }
        hits
    }
}

#[async_trait]
impl SearchSource for DuckDuckGoSearch {
    fn name(&self) -> &str {
        "DuckDuckGo"
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        let response = client(self.timeout)?
            .post("https://html.duckduckgo.com/html/")
            .form(&[("q", query)])
            .send()
            .await
            .map_err(transport)?;
        let html = response.text().await.map_err(transport)?;
        Ok(Self::parse(&html))
    }
}

// ── Wikipedia ────────────────────────────────────────────────────────────────

pub struct WikipediaSearch {
    timeout: Duration,
}

impl WikipediaSearch {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn parse(body: &Value) -> Result<Vec<SearchHit>, SearchError> {
        // opensearch returns [query, [titles], [descriptions], [urls]].
        let arrays = body
            .as_array()
            .filter(|a| a.len() >= 4)
            .ok_or_else(|| SearchError::Malformed("unexpected opensearch shape".to_string()))?;

        let titles = arrays[1].as_array().cloned().unwrap_or_default();
        let descriptions = arrays[2].as_array().cloned().unwrap_or_default();
        let urls = arrays[3].as_array().cloned().unwrap_or_default();

        Ok(titles
            .iter()
            .zip(urls.iter())
            .enumerate()
            .filter_map(|(i, (title, url))| {
                Some(SearchHit {
                    title: title.as_str()?.to_string(),
                    url: url.as_str()?.to_string(),
                    snippet: descriptions
                        .get(i)
                        .and_then(|d| d.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    source: "Wikipedia".to_string(),
                })
            })
            .collect())
    }
}

#[async_trait]
impl SearchSource for WikipediaSearch {
    fn name(&self) -> &str {
        "Wikipedia"
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        let body: Value = client(self.timeout)?
            .get("https://en.wikipedia.org/w/api.php")
            .query(&[
                ("action", "opensearch"),
                ("search", query),
                ("limit", "3"),
                ("format", "json"),
            ])
            .send()
            .await
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)?;
        Self::parse(&body)
    }
}

// ── arXiv ────────────────────────────────────────────────────────────────────

/// Preprint search over the arXiv Atom API.  The feed is regular enough that
/// a light regex pass beats pulling in a full XML parser.
pub struct ArxivSearch {
    timeout: Duration,
}

impl ArxivSearch {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn parse(xml: &str) -> Vec<SearchHit> {
        static ENTRY: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?s)<entry>(.*?)</entry>").expect("valid entry regex")
        });
        static TITLE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?s)<title>(.*?)</title>").expect("valid title regex")
        });
        static SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?s)<summary>(.*?)</summary>").expect("valid summary regex")
        });
        static ID: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"(?s)<id>(.*?)</id>").expect("valid id regex"));

        ENTRY
            .captures_iter(xml)
            .take(3)
            .filter_map(|entry| {
                let body = &entry[1];
                let title = TITLE.captures(body)?[1].trim().to_string();
                let url = ID.captures(body)?[1].trim().to_string();
                let snippet = SUMMARY
                    .captures(body)
                    .map(|c| {
                        let text = c[1].trim().to_string();
                        text.chars().take(200).collect()
                    })
                    .unwrap_or_default();
                Some(SearchHit {
                    title,
                    url,
                    snippet,
                    source: "ArXiv".to_string(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl SearchSource for ArxivSearch {
    fn name(&self) -> &str {
        "ArXiv"
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        let xml = client(self.timeout)?
            .get("http://export.arxiv.org/api/query")
            .query(&[
                ("search_query", format!("all:{query}").as_str()),
                ("start", "0"),
                ("max_results", "3"),
                ("sortBy", "relevance"),
                ("sortOrder", "descending"),
            ])
            .send()
            .await
            .map_err(transport)?
            .text()
            .await
            .map_err(transport)?;
        Ok(Self::parse(&xml))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
