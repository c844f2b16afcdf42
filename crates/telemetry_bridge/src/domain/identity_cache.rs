use arc_swap::ArcSwap;
use common::domain::{DeviceMapping, DeviceMappingSource, DomainError, DomainResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct IdentityCacheConfig {
    /// Interval between full reloads (default: 5 minutes)
    pub refresh_interval: Duration,
    /// Upper bound for one load from the source
    pub load_timeout: Duration,
}

impl Default for IdentityCacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(300),
            load_timeout: Duration::from_secs(30),
        }
    }
}

type MappingSnapshot = HashMap<String, DeviceMapping>;

/// In-memory external-id → device identity map.
///
/// Lookups read the current snapshot without locking. A refresh builds a
/// brand-new map and swaps it in only when the load succeeded, so a failed
/// refresh leaves the last good snapshot in place.
pub struct IdentityCache {
    source: Arc<dyn DeviceMappingSource>,
    snapshot: ArcSwap<MappingSnapshot>,
    config: IdentityCacheConfig,
}

impl IdentityCache {
    pub fn new(source: Arc<dyn DeviceMappingSource>, config: IdentityCacheConfig) -> Self {
        Self {
            source,
            snapshot: ArcSwap::from_pointee(HashMap::new()),
            config,
        }
    }

    /// Case-insensitive lookup against the last loaded snapshot
    pub fn lookup(&self, external_id: &str) -> Option<DeviceMapping> {
        let key = DeviceMapping::normalize_external_id(external_id);
        self.snapshot.load().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First load before message processing starts.
    ///
    /// A failure is logged and the cache stays empty; lookups return none
    /// until a later refresh succeeds.
    pub async fn initialize(&self) {
        match self.refresh().await {
            Ok(count) => info!(mappings = count, "identity cache initialized"),
            Err(e) => warn!(
                error = %e,
                "initial identity load failed, starting with an empty cache"
            ),
        }
    }

    /// Reload every mapping from the source and swap the snapshot in.
    ///
    /// Returns the number of mappings installed. On error the previous
    /// snapshot is kept.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> DomainResult<usize> {
        let mappings = tokio::time::timeout(self.config.load_timeout, self.source.load_device_mappings())
            .await
            .map_err(|_| {
                DomainError::Timeout(format!(
                    "device mapping load exceeded {:?}",
                    self.config.load_timeout
                ))
            })??;

        let snapshot = build_snapshot(mappings);
        let count = snapshot.len();
        self.snapshot.store(Arc::new(snapshot));

        debug!(mappings = count, "identity snapshot installed");
        Ok(count)
    }

    /// Periodically refresh until the token is cancelled
    pub async fn run_refresh_loop(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.refresh_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; initialize() already loaded
        interval.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("identity refresh loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    match self.refresh().await {
                        Ok(count) => debug!(mappings = count, "identity cache refreshed"),
                        Err(e) => warn!(
                            error = %e,
                            retained = self.len(),
                            "identity refresh failed, keeping previous snapshot"
                        ),
                    }
                }
            }
        }
    }
}

fn build_snapshot(mappings: Vec<DeviceMapping>) -> MappingSnapshot {
    let mut snapshot: MappingSnapshot = HashMap::with_capacity(mappings.len());
    for mut mapping in mappings {
        let key = DeviceMapping::normalize_external_id(&mapping.external_id);
        if key.is_empty() {
            continue;
        }
        if let Some(existing) = snapshot.get(&key) {
            warn!(
                external_id = %key,
                kept_device = %existing.platform_device_id,
                ignored_device = %mapping.platform_device_id,
                "duplicate external identifier in device mappings"
            );
            continue;
        }
        mapping.external_id = key.clone();
        snapshot.insert(key, mapping);
    }
    snapshot
}
