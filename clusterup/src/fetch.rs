//! Artifact download for packaged components.

use std::path::Path;

use crate::errors::InstallerResult;

/// Download `url` to `dest`, optionally authenticating against a private
/// package registry with a `PRIVATE-TOKEN` header.
pub async fn download(
    client: &reqwest::Client,
    url: &str,
    token: Option<&str>,
    dest: &Path,
) -> InstallerResult<()> {
    tracing::info!(url, dest = %dest.display(), "downloading artifact");

    let mut request = client.get(url);
    if let Some(token) = token {
        request = request.header("PRIVATE-TOKEN", token);
    }

    let response = request.send().await?.error_for_status()?;
    let body = response.bytes().await?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(dest, &body).await?;

    tracing::debug!(bytes = body.len(), dest = %dest.display(), "artifact written");
    Ok(())
}
