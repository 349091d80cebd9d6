use scraper::{Html, Selector};
use serde::Serialize;
use tracing::debug;

use super::{ToolContext, ToolResult};
use crate::models::ensure_success;

const MAX_RESULTS: usize = 5;
const NO_RESULT: &str = "No good DuckDuckGo Search Result was found";
const USER_AGENT: &str = "Mozilla/5.0 (compatible; gpt-series/0.1)";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

fn selector(css: &str) -> anyhow::Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow::anyhow!("bad selector {}: {:?}", css, e))
}

/// Result links on the HTML endpoint go through a `/l/?uddg=` redirect.
fn resolve_href(href: &str) -> String {
    let absolute = if href.starts_with("//") { format!("https:{}", href) } else { href.to_string() };
    match url::Url::parse(&absolute) {
        Ok(u) if u.path() == "/l/" => u
            .query_pairs()
            .find(|(k, _)| k == "uddg")
            .map(|(_, v)| v.into_owned())
            .unwrap_or(absolute),
        _ => absolute,
    }
}

fn text_of(el: scraper::ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn parse_results(html: &str, max: usize) -> anyhow::Result<Vec<SearchHit>> {
    let doc = Html::parse_document(html);
    let result_sel = selector("div.result")?;
    let link_sel = selector("a.result__a")?;
    let snippet_sel = selector(".result__snippet")?;
    let mut hits = Vec::new();
    for result in doc.select(&result_sel) {
        if hits.len() >= max { break; }
        let Some(link) = result.select(&link_sel).next() else { continue };
        let Some(href) = link.value().attr("href") else { continue };
        let snippet = result.select(&snippet_sel).next().map(text_of).unwrap_or_default();
        hits.push(SearchHit { title: text_of(link), url: resolve_href(href), snippet });
    }
    Ok(hits)
}

pub fn format_hits(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return NO_RESULT.to_string();
    }
    hits.iter()
        .map(|h| format!("Title: {}\nURL: {}\nSnippet: {}", h.title, h.url, h.snippet))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub async fn search_tool(ctx: &ToolContext, query: &str) -> anyhow::Result<ToolResult> {
    let resp = ctx
        .http
        .get(&ctx.duckduckgo_url)
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .query(&[("q", query)])
        .send()
        .await?;
    let body = ensure_success(resp, "duckduckgo search").await?.text().await?;
    let hits = parse_results(&body, MAX_RESULTS)?;
    debug!(query, hits = hits.len(), "duckduckgo search");
    Ok(ToolResult { summary: format!("duckduckgo:{} results:{}", query, hits.len()), output: format_hits(&hits), artifact: None })
}
