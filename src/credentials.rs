use reqwest::StatusCode;
use tracing::debug;

/// Checks a key against the provider's model listing. Fails closed: transport
/// errors count as an invalid key.
pub async fn is_valid(http: &reqwest::Client, base_url: &str, api_key: &str) -> bool {
    if api_key.trim().is_empty() {
        return false;
    }
    let url = format!("{}/models", base_url.trim_end_matches('/'));
    match http.get(url).bearer_auth(api_key).send().await {
        Ok(resp) => {
            let ok = resp.status() == StatusCode::OK;
            debug!(status = %resp.status(), valid = ok, "credential check");
            ok
        }
        Err(e) => {
            debug!(error = %e, "credential check transport failure");
            false
        }
    }
}
