//! Bootstrap domain list.
//!
//! The daemon can start from a static list or from a newline-separated list
//! served over HTTP. With neither configured it starts empty and relies on
//! the admin API.

use tracing::{debug, info};

use crate::config::BootstrapConfig;
use crate::error::Error;

/// Split a fetched body into domain names, dropping blanks and `#` comments.
fn parse_list(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

/// Produce the initial domain list.
pub async fn fetch(config: &BootstrapConfig) -> Result<Vec<String>, Error> {
    if !config.list.is_empty() {
        debug!(domains = config.list.len(), "using static domain list");
        return Ok(config.list.clone());
    }

    let Some(link) = config.link.as_deref() else {
        info!("no bootstrap source configured, starting empty");
        return Ok(Vec::new());
    };

    let client = reqwest::Client::builder()
        .timeout(config.timeout())
        .build()?;

    let response = client.get(link).send().await?;
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(Error::Config(format!(
            "bootstrap fetch of {link:?} failed with status {status}"
        )));
    }

    let domains = parse_list(&body);
    info!(domains = domains.len(), link, "fetched bootstrap domain list");
    Ok(domains)
}
