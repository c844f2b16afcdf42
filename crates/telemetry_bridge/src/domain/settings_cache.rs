use arc_swap::ArcSwap;
use common::domain::{DomainError, DomainResult, SettingsSource, SystemSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct SettingsCacheConfig {
    pub refresh_interval: Duration,
    pub load_timeout: Duration,
}

impl Default for SettingsCacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(300),
            load_timeout: Duration::from_secs(10),
        }
    }
}

/// Periodically refreshed integration settings with built-in defaults
pub struct SettingsCache {
    source: Arc<dyn SettingsSource>,
    current: ArcSwap<SystemSettings>,
    changes: watch::Sender<Arc<SystemSettings>>,
    config: SettingsCacheConfig,
}

impl SettingsCache {
    pub fn new(source: Arc<dyn SettingsSource>, config: SettingsCacheConfig) -> Self {
        let defaults = Arc::new(SystemSettings::default());
        let (changes, _) = watch::channel(Arc::clone(&defaults));
        Self {
            source,
            current: ArcSwap::new(defaults),
            changes,
            config,
        }
    }

    /// Current settings; defaults until a load succeeds
    pub fn current(&self) -> Arc<SystemSettings> {
        self.current.load_full()
    }

    /// Receiver notified whenever a refresh installs different settings
    pub fn subscribe(&self) -> watch::Receiver<Arc<SystemSettings>> {
        self.changes.subscribe()
    }

    /// Reload settings. A missing row resets to defaults; an error keeps the
    /// current value.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> DomainResult<Arc<SystemSettings>> {
        let loaded = tokio::time::timeout(self.config.load_timeout, self.source.load_settings())
            .await
            .map_err(|_| {
                DomainError::ConfigurationSourceError(format!(
                    "settings load exceeded {:?}",
                    self.config.load_timeout
                ))
            })??;

        let settings = Arc::new(loaded.unwrap_or_default());
        self.current.store(Arc::clone(&settings));
        self.changes.send_if_modified(|previous| {
            if **previous == *settings {
                false
            } else {
                info!(
                    enabled = settings.chirp_stack_integration_enabled,
                    topic_pattern = %settings.topic_pattern,
                    "system settings changed"
                );
                *previous = Arc::clone(&settings);
                true
            }
        });

        Ok(settings)
    }

    pub async fn initialize(&self) {
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "initial settings load failed, using defaults");
        }
    }

    pub async fn run_refresh_loop(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.refresh_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("settings refresh loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "settings refresh failed, keeping current settings");
                    }
                }
            }
        }
    }
}
