use chrono::Utc;
use tracing::info;

use super::{ReportArtifact, ToolContext, ToolResult};

/// Overwrites the report file with `text`.
pub async fn save_tool(ctx: &ToolContext, text: &str) -> anyhow::Result<ToolResult> {
    if let Some(parent) = ctx.report_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&ctx.report_path, text.as_bytes()).await?;
    let file_name = ctx
        .report_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "research_report.txt".into());
    info!(path = %ctx.report_path.display(), bytes = text.len(), "research report saved");
    Ok(ToolResult {
        summary: format!("write:{} bytes:{}", file_name, text.len()),
        output: format!("saved {}", file_name),
        artifact: Some(ReportArtifact { file_name, content: text.to_string(), saved_at: Utc::now() }),
    })
}
