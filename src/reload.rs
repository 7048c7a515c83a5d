//! Policy change propagation.
//!
//! Two sources change the limits a check runs under: an owner's active
//! embedded config, and the default policy file. Both clear the shared quota
//! state so new limits take effect from a clean slate.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::intake::ConfigCache;
use crate::policy::{parse_embedded, parse_policy, PolicyHandle};
use crate::store::{StateStore, StoreError};

/// Apply one per-owner config change notification.
///
/// `Some((config, id))` makes that document the owner's active config and
/// flushes the store. `None` means the owner no longer has an active config.
pub async fn apply_config_change<S: StateStore + ?Sized>(
    owner_id: &str,
    active: Option<(Value, String)>,
    cache: &ConfigCache,
    store: &S,
) -> std::result::Result<(), StoreError> {
    let Some((config, config_id)) = active else {
        cache.remove(owner_id);
        info!(owner_id, "Active config removed");
        return Ok(());
    };

    if let Err(e) = parse_embedded(&config) {
        // Still cached: submissions under it are rejected as invalid_config.
        warn!(owner_id, config_id = %config_id, error = %e, "Active config does not validate");
    }
    cache.set(owner_id, config, config_id.clone());
    info!(owner_id, config_id = %config_id, "Active config updated, flushing quota state");
    store.flush().await
}

/// Polls the policy file and publishes valid changes.
pub struct PolicyWatcher<S: StateStore> {
    path: PathBuf,
    handle: Arc<PolicyHandle>,
    store: Arc<S>,
    /// Contents seen by the last poll
    last: Option<String>,
}

impl<S: StateStore + 'static> PolicyWatcher<S> {
    pub fn new(path: impl Into<PathBuf>, handle: Arc<PolicyHandle>, store: Arc<S>) -> Self {
        Self {
            path: path.into(),
            handle,
            store,
            last: None,
        }
    }

    /// Treat `contents` as already published.
    pub fn with_baseline(mut self, contents: impl Into<String>) -> Self {
        self.last = Some(contents.into());
        self
    }

    /// Read the file once, returning whether a new policy was published.
    ///
    /// A file that fails to parse or validate leaves the active policy in
    /// place and is not retried until its contents change again.
    pub async fn poll_once(&mut self) -> Result<bool> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        if self.last.as_deref() == Some(contents.as_str()) {
            return Ok(false);
        }
        let parsed = parse_policy(&contents);
        self.last = Some(contents);
        let policy = parsed?;

        self.handle.publish(policy);
        if let Err(e) = self.store.flush().await {
            warn!(error = %e, "Failed to flush quota state after policy reload");
        }
        Ok(true)
    }

    /// Poll every `interval` until `shutdown` turns true.
    pub fn spawn(
        mut self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(path = %self.path.display(), ?interval, "Policy watcher started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.poll_once().await {
                            Ok(true) => info!(path = %self.path.display(), "Policy reloaded"),
                            Ok(false) => debug!("Policy unchanged"),
                            Err(e) => warn!(
                                path = %self.path.display(),
                                error = %e,
                                "Policy reload rejected, keeping active policy"
                            ),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Policy watcher stopped");
        })
    }
}
