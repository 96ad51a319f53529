//! Config hot-reload watcher.
//!
//! Watches a `mooring.toml` file for modifications and invokes a callback
//! with the freshly parsed [`MooringConfig`] after a debounce window.

use mooring_core::{MooringError, MooringResult};
use mooring_mcp::ServerDescriptor;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;

/// The mooring configuration file: a list of server descriptors.
#[derive(Debug, Deserialize)]
pub struct MooringConfig {
    /// The servers to supervise, `[[servers]]` entries in the TOML file.
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
}

/// Watches a config file on disk and calls back on every (debounced) change.
///
/// The watcher is kept alive as long as this struct is alive; dropping it
/// stops the background thread and releases the file-system watch.
pub struct ConfigWatcher {
    /// Stored to prevent the watcher from being dropped (which would stop
    /// watching the file).
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `config_path` for modifications.
    ///
    /// * `debounce_ms` -- minimum milliseconds between two successive
    ///   reload callbacks.  Use `500` as a sensible default.
    /// * `on_reload` -- called on a background thread each time the config
    ///   file is modified and successfully parsed.  Parse errors are
    ///   logged via `tracing::warn` and do **not** invoke the callback.
    pub fn start<F>(config_path: PathBuf, debounce_ms: u64, on_reload: F) -> MooringResult<Self>
    where
        F: Fn(MooringConfig) + Send + Sync + 'static,
    {
        let (tx, rx) = std_mpsc::channel();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    if matches!(event.kind, EventKind::Modify(_)) {
                        let _ = tx.send(());
                    }
                }
            })
            .map_err(|e| MooringError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(config_path.as_ref(), RecursiveMode::NonRecursive)
            .map_err(|e| MooringError::Config(format!("Failed to watch config file: {e}")))?;

        let path = config_path.clone();
        std::thread::spawn(move || {
            let mut last_reload = std::time::Instant::now();
            let debounce = std::time::Duration::from_millis(debounce_ms);

            while rx.recv().is_ok() {
                // Drain any additional events that arrived during the
                // debounce window so we only reload once per burst of
                // writes.
                while rx.try_recv().is_ok() {}

                let now = std::time::Instant::now();
                if now.duration_since(last_reload) < debounce {
                    std::thread::sleep(debounce - now.duration_since(last_reload));
                }

                last_reload = std::time::Instant::now();

                match parse_config(&path) {
                    Ok(config) => on_reload(config),
                    Err(e) => tracing::warn!(error = %e, "Failed to reload config"),
                }
            }

            tracing::debug!("Config watcher thread exiting");
        });

        tracing::info!(path = %config_path.display(), "Config hot-reload watcher started");

        Ok(Self { _watcher: watcher })
    }
}

/// Read and parse a TOML config file into a [`MooringConfig`].
///
/// Rejects configurations with duplicate server names — `name` is the
/// primary key across all supervisor state.
pub fn parse_config(path: &Path) -> MooringResult<MooringConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        MooringError::Config(format!("Failed to read config '{}': {}", path.display(), e))
    })?;
    let config: MooringConfig = toml::from_str(&content).map_err(|e| {
        MooringError::Config(format!("Failed to parse config '{}': {}", path.display(), e))
    })?;

    let mut seen = HashSet::new();
    for server in &config.servers {
        if !seen.insert(server.name.as_str()) {
            return Err(MooringError::Config(format!(
                "Duplicate server name '{}' in '{}'",
                server.name,
                path.display()
            )));
        }
    }

    Ok(config)
}
