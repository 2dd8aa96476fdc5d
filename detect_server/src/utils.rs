//! Utility functions
//!
use std::{fs::File, io::Cursor, path::Path};

use anyhow::{Context, Result};
use reqwest::Client;

/// Download a file from a URL to a given filepath.
pub async fn download_file(client: &Client, url: &str, filepath: impl AsRef<Path>) -> Result<()> {
    let filepath = filepath.as_ref();
    log::info!("Downloading {} to {}", url, filepath.display());

    let resp = client.get(url).send().await?.error_for_status()?;
    // The file is only created once the whole body arrived
    let mut content = Cursor::new(resp.bytes().await?);

    let mut file = File::create(filepath)
        .with_context(|| format!("failed to create {}", filepath.display()))?;
    std::io::copy(&mut content, &mut file)?;

    Ok(())
}
