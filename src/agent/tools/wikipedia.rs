use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use super::{ToolContext, ToolResult};
use crate::models::ensure_success;

pub const MAX_CONTENT_CHARS: usize = 4000;
const TOOL_TOP_K: usize = 3;
const NO_RESULT: &str = "No good Wikipedia Search Result was found";

#[derive(Debug, Clone, PartialEq)]
pub struct WikiPage {
    pub title: String,
    pub url: Option<String>,
    pub text: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse { query: Option<SearchQuery> }

#[derive(Debug, Deserialize)]
struct SearchQuery { #[serde(default)] search: Vec<SearchHit> }

#[derive(Debug, Deserialize)]
struct SearchHit { title: String }

#[derive(Debug, Deserialize)]
struct PagesResponse { query: Option<PagesQuery> }

#[derive(Debug, Deserialize)]
struct PagesQuery { #[serde(default)] pages: HashMap<String, PageEntry> }

#[derive(Debug, Deserialize)]
struct PageEntry { title: String, extract: Option<String>, fullurl: Option<String>, missing: Option<Value> }

fn api_url(base_url: &str) -> String {
    format!("{}/w/api.php", base_url.trim_end_matches('/'))
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Looks up `top_k` articles for `query`. `intro_only` limits each text to
/// the lead section.
pub async fn search_pages(
    http: &reqwest::Client,
    base_url: &str,
    query: &str,
    top_k: usize,
    intro_only: bool,
) -> anyhow::Result<Vec<WikiPage>> {
    let limit = top_k.to_string();
    let resp = http
        .get(api_url(base_url))
        .query(&[("action", "query"), ("list", "search"), ("srsearch", query), ("srlimit", limit.as_str()), ("format", "json")])
        .send()
        .await?;
    let hits: SearchResponse = ensure_success(resp, "wikipedia search").await?.json().await?;
    let titles: Vec<String> = hits.query.map(|q| q.search).unwrap_or_default().into_iter().map(|h| h.title).take(top_k).collect();
    debug!(query, hits = titles.len(), "wikipedia search");

    let mut pages = Vec::with_capacity(titles.len());
    for title in titles {
        let mut params = vec![
            ("action", "query"),
            ("prop", "extracts|info"),
            ("inprop", "url"),
            ("explaintext", "1"),
            ("redirects", "1"),
            ("format", "json"),
            ("titles", title.as_str()),
        ];
        if intro_only {
            params.push(("exintro", "1"));
        }
        let resp = http.get(api_url(base_url)).query(&params).send().await?;
        let body: PagesResponse = ensure_success(resp, "wikipedia page").await?.json().await?;
        let entries = body.query.map(|q| q.pages).unwrap_or_default();
        for entry in entries.into_values().filter(|e| e.missing.is_none()) {
            let text = entry.extract.unwrap_or_default();
            if text.trim().is_empty() {
                continue;
            }
            pages.push(WikiPage { title: entry.title, url: entry.fullurl, text: truncate_chars(&text, MAX_CONTENT_CHARS) });
        }
    }
    Ok(pages)
}

pub fn format_summaries(pages: &[WikiPage]) -> String {
    if pages.is_empty() {
        return NO_RESULT.to_string();
    }
    let joined = pages
        .iter()
        .map(|p| match &p.url {
            Some(url) => format!("Page: {}\nURL: {}\nSummary: {}", p.title, url, p.text),
            None => format!("Page: {}\nSummary: {}", p.title, p.text),
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    truncate_chars(&joined, MAX_CONTENT_CHARS)
}

pub async fn search_tool(ctx: &ToolContext, query: &str) -> anyhow::Result<ToolResult> {
    let pages = search_pages(&ctx.http, &ctx.wikipedia_base_url, query, TOOL_TOP_K, true).await?;
    let output = format_summaries(&pages);
    Ok(ToolResult { summary: format!("wikipedia:{} pages:{}", query, pages.len()), output, artifact: None })
}
