use futures::StreamExt;
use scraper::Html;
use tracing::debug;

use super::{ToolContext, ToolResult};
use crate::models::ensure_success;

const SKIPPED_ELEMENTS: [&str; 4] = ["script", "style", "noscript", "template"];
/// Upper bound on raw HTML read from one page.
const MAX_HTML_BYTES: usize = 2 * 1024 * 1024;

/// Visible text of an HTML document, one line per text node.
pub fn extract_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let mut lines = Vec::new();
    for node in doc.tree.root().descendants() {
        let Some(text) = node.value().as_text() else { continue };
        let hidden = node.ancestors().any(|a| {
            a.value().as_element().map(|e| SKIPPED_ELEMENTS.contains(&e.name())).unwrap_or(false)
        });
        if hidden {
            continue;
        }
        let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines.join("\n")
}

fn cap_utf8(mut s: String, max_bytes: usize) -> String {
    if s.len() > max_bytes {
        let mut cut = max_bytes;
        while !s.is_char_boundary(cut) { cut -= 1; }
        s.truncate(cut);
    }
    s
}

/// Reads at most `limit` bytes of the body; the rest is never downloaded.
async fn read_capped(resp: reqwest::Response, limit: usize) -> anyhow::Result<String> {
    if let Some(len) = resp.content_length().filter(|n| *n as usize > limit) {
        debug!(content_length = len, limit, "page body truncated");
    }
    let mut body: Vec<u8> = Vec::new();
    let mut chunks = resp.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        let room = limit - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

pub async fn fetch_and_extract(http: &reqwest::Client, url: &str, max_bytes: usize) -> anyhow::Result<String> {
    let parsed = url::Url::parse(url)?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("unsupported scheme: {}", parsed.scheme());
    }
    parsed.host_str().ok_or_else(|| anyhow::anyhow!("invalid host"))?;
    let resp = ensure_success(http.get(parsed).send().await?, "page fetch").await?;
    let body = read_capped(resp, MAX_HTML_BYTES).await?;
    let text = extract_text(&body);
    debug!(url, html_bytes = body.len(), text_bytes = text.len(), "page loaded");
    Ok(cap_utf8(text, max_bytes))
}

pub async fn load_tool(ctx: &ToolContext, url: &str) -> anyhow::Result<ToolResult> {
    let content = fetch_and_extract(&ctx.http, url, ctx.max_page_bytes).await?;
    Ok(ToolResult { summary: format!("url:{} bytes:{}", url, content.len()), output: content, artifact: None })
}
