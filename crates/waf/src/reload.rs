//! Hot reload supervision
//!
//! Watches the configured rule and blacklist files and rebuilds the affected
//! artifact on change. Every rebuild produces a complete replacement that is
//! swapped in atomically; a failed rebuild logs the error and leaves the
//! previous generation serving. Requests holding an old generation finish
//! against it.

use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::Waf;

/// Which artifact a watched file feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Artifact {
    Rules,
    IpBlacklist,
    DnsBlacklist,
}

/// Spawn the watcher task for every configured reloadable file.
///
/// Files that do not exist at provision time are skipped with a warning;
/// they are not picked up retroactively.
pub fn spawn_watchers(waf: Arc<Waf>) -> Vec<JoinHandle<()>> {
    let mut watched: Vec<(PathBuf, Artifact)> = Vec::new();
    for path in &waf.config.rule_files {
        watched.push((path.clone(), Artifact::Rules));
    }
    if let Some(path) = &waf.config.ip_blacklist_file {
        watched.push((path.clone(), Artifact::IpBlacklist));
    }
    if let Some(path) = &waf.config.dns_blacklist_file {
        watched.push((path.clone(), Artifact::DnsBlacklist));
    }

    // Resolve to canonical paths so watcher events compare equal.
    let watched: Vec<(PathBuf, Artifact)> = watched
        .into_iter()
        .filter_map(|(path, artifact)| match std::fs::canonicalize(&path) {
            Ok(canonical) => Some((canonical, artifact)),
            Err(_) => {
                warn!(file = %path.display(), "Skipping file watch, file does not exist");
                None
            }
        })
        .collect();

    if watched.is_empty() {
        return Vec::new();
    }

    let (tx, mut rx) = mpsc::channel::<PathBuf>(16);

    let handle = tokio::spawn(async move {
        let mut watcher =
            match notify::recommended_watcher(move |event: Result<Event, notify::Error>| {
                if let Ok(event) = event {
                    if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        for path in &event.paths {
                            let _ = tx.blocking_send(path.clone());
                        }
                    }
                }
            }) {
                Ok(watcher) => watcher,
                Err(e) => {
                    error!(error = %e, "Failed to start file watcher, hot reload disabled");
                    return;
                }
            };

        for (path, _) in &watched {
            if let Err(e) = watcher.watch(path, RecursiveMode::NonRecursive) {
                warn!(file = %path.display(), error = %e, "Failed to watch file");
            } else {
                info!(file = %path.display(), "Watching for changes");
            }
        }

        while let Some(changed) = rx.recv().await {
            handle_change(&waf, &watched, &changed);
        }
    });

    vec![handle]
}

/// Rebuild the artifact behind a changed path.
fn handle_change(waf: &Waf, watched: &[(PathBuf, Artifact)], changed: &Path) {
    let canonical = std::fs::canonicalize(changed).unwrap_or_else(|_| changed.to_path_buf());
    let Some((_, artifact)) = watched.iter().find(|(path, _)| *path == canonical) else {
        debug!(file = %changed.display(), "Ignoring change to unwatched path");
        return;
    };

    info!(file = %changed.display(), "Detected configuration change, reloading");
    let result = match artifact {
        Artifact::Rules => waf.reload_rules(),
        Artifact::IpBlacklist => waf.reload_ip_blacklist(),
        Artifact::DnsBlacklist => waf.reload_dns_blacklist(),
    };

    match result {
        Ok(()) => info!(file = %changed.display(), "Reload succeeded"),
        Err(e) => {
            // The previous generation stays active.
            error!(file = %changed.display(), error = %e, "Reload failed, keeping previous generation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_config::Config;
    use std::io::Write;
    use std::time::Duration;

    fn rules_json(id: &str) -> String {
        format!(
            r#"[{{"id": "{id}", "phase": 1, "pattern": "x", "targets": ["PATH"], "score": 1, "mode": "log"}}]"#
        )
    }

    #[tokio::test]
    async fn test_watcher_reloads_rules_on_change() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", rules_json("before")).unwrap();
        file.flush().unwrap();

        let mut config = Config::default();
        config.rule_files = vec![file.path().to_path_buf()];
        let (waf, _worker) = Waf::build(config).unwrap();
        let tasks = spawn_watchers(Arc::clone(&waf));
        assert_eq!(tasks.len(), 1);

        // Give the watcher a moment to register before writing.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(file.path(), rules_json("after")).unwrap();

        let mut reloaded = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if waf.current_rules().rule_ids() == vec!["after"] {
                reloaded = true;
                break;
            }
        }
        assert!(reloaded, "watcher did not pick up the rule change");

        for task in tasks {
            task.abort();
        }
    }

    #[tokio::test]
    async fn test_broken_rewrite_keeps_previous_generation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", rules_json("stable")).unwrap();
        file.flush().unwrap();

        let mut config = Config::default();
        config.rule_files = vec![file.path().to_path_buf()];
        let (waf, _worker) = Waf::build(config).unwrap();
        let tasks = spawn_watchers(Arc::clone(&waf));

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(file.path(), "{not json").unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // The bad rewrite was rejected; the old generation still serves.
        assert_eq!(waf.current_rules().rule_ids(), vec!["stable"]);

        for task in tasks {
            task.abort();
        }
    }

    #[tokio::test]
    async fn test_missing_files_are_skipped() {
        let mut config = Config::default();
        config.ip_blacklist_file = Some(PathBuf::from("/nonexistent/ips.txt"));
        let (waf, _worker) = Waf::build(config).unwrap();

        let tasks = spawn_watchers(waf);
        assert!(tasks.is_empty());
    }
}
