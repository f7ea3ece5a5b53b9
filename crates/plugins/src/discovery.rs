//! Plugin discovery
//!
//! Every executable regular file in the plugin directory is a plugin, named
//! after its file name. Settings come from the node config when present.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use oracle_core::{CoreError, CoreResult, PluginConfig};

use crate::source::PluginSpec;
use crate::supervisor::PluginSupervisor;

/// Scan `dir` for plugin binaries, sorted by name.
///
/// Plugins disabled in `configs` are skipped. A missing directory is an
/// error; an empty one is not.
pub fn discover_plugins(dir: &Path, configs: &[PluginConfig]) -> CoreResult<Vec<PluginSpec>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        CoreError::InvalidConfig(format!("plugin dir {}: {}", dir.display(), e))
    })?;

    let mut specs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = std::fs::metadata(&path) else {
            continue;
        };
        if !metadata.is_file() || !is_executable(&metadata) {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }

        let config = configs
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .unwrap_or_else(|| PluginConfig::named(&name));
        if config.disabled {
            debug!(plugin = %name, "Skipping disabled plugin");
            continue;
        }

        let mut spec = PluginSpec::new(config, path);
        spec.modified = metadata.modified().ok();
        specs.push(spec);
    }

    specs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(specs)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

/// Periodically rescan the plugin directory and reconcile the supervisor
pub async fn run_discovery(
    supervisor: Arc<PluginSupervisor>,
    dir: std::path::PathBuf,
    configs: Vec<PluginConfig>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Watching {} for plugin changes every {:?}", dir.display(), interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; startup already scanned
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match discover_plugins(&dir, &configs) {
                    Ok(specs) => supervisor.reconcile(specs).await,
                    Err(e) => warn!("Plugin rescan failed: {}", e),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Plugin discovery stopped");
}
