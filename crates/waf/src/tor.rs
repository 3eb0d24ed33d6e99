//! TOR exit-node blocking
//!
//! Fetches the published exit-node list and merges it into the active IP
//! blacklist. The list is refreshed on a configurable interval; a failed
//! fetch keeps the previously merged set.

use ipnet::IpNet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use palisade_common::{PalisadeError, PalisadeResult};

use crate::blacklist::parse_entry;
use crate::engine::Waf;

/// Download and parse the exit list: one IP per line, `#` comments.
pub async fn fetch_exit_list(url: &str) -> PalisadeResult<Vec<IpNet>> {
    let client = reqwest::Client::builder()
        .user_agent("palisade-waf")
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| PalisadeError::config(format!("failed to build TOR fetch client: {e}")))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| PalisadeError::config(format!("TOR blocklist fetch failed: {e}")))?;

    if !response.status().is_success() {
        return Err(PalisadeError::config(format!(
            "TOR blocklist fetch returned status {}",
            response.status()
        )));
    }

    let body = response
        .text()
        .await
        .map_err(|e| PalisadeError::config(format!("failed to read TOR blocklist body: {e}")))?;

    Ok(parse_exit_list(&body))
}

/// Parse the response body; unparsable lines are skipped.
pub fn parse_exit_list(body: &str) -> Vec<IpNet> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match parse_entry(line) {
            Ok(net) => Some(net),
            Err(e) => {
                warn!(entry = %line, error = %e, "Skipping invalid TOR exit entry");
                None
            }
        })
        .collect()
}

/// Spawn the periodic fetch-and-merge task. The first fetch happens
/// immediately.
pub fn spawn_refresh(waf: Arc<Waf>) -> JoinHandle<()> {
    let url = waf.config.tor.blocklist_url.clone();
    let interval = Duration::from_secs(waf.config.tor.refresh_interval_secs.max(60));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match fetch_exit_list(&url).await {
                Ok(exits) => {
                    info!(exits = exits.len(), "Fetched TOR exit list");
                    waf.merge_tor_exits(exits);
                }
                Err(e) => {
                    // Previously merged exits stay in force.
                    warn!(error = %e, "TOR exit list refresh failed");
                }
            }
        }
    })
}
