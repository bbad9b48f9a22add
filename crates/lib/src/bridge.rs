//! Bridge lifecycle: enable, disable, reconfigure.
//!
//! `enable` spawns the stream supervisor under a fresh cancellation token. `disable`
//! takes the running handle out before cancelling, so repeated calls find nothing to stop.

use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Settings};
use crate::connection::{ConnectionState, SharedSettings, StreamClient};
use crate::dispatch::Dispatcher;
use crate::error::{ConfigError, DeliveryError};
use crate::event::InboundEvent;

/// Name, version, and description reported in lifecycle logs.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
}

pub fn plugin_info() -> PluginInfo {
    PluginInfo {
        name: "hookrelay",
        version: env!("CARGO_PKG_VERSION"),
        description: "forward stream notifications to webhook servers",
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the settings and the background supervisor of one bridge instance.
pub struct Bridge {
    settings: SharedSettings,
    client: Arc<StreamClient>,
    running: Mutex<Option<Running>>,
}

impl Bridge {
    /// Validate `config` and build a stopped bridge.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::from_settings(config.validate()?))
    }

    pub fn from_settings(settings: Settings) -> Self {
        let settings: SharedSettings = Arc::new(RwLock::new(Arc::new(settings)));
        let client = Arc::new(StreamClient::new(settings.clone()));
        Self {
            settings,
            client,
            running: Mutex::new(None),
        }
    }

    /// Start the supervisor. A no-op when already enabled.
    pub async fn enable(&self) {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            log::debug!("bridge already enabled");
            return;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.client.clone().supervise(cancel.clone()));
        *running = Some(Running { cancel, task });
        let info = plugin_info();
        log::info!(
            "{} {} enabled, streaming from {}",
            info.name,
            info.version,
            self.settings.read().await.stream_url
        );
    }

    /// Stop the supervisor and wait for the session to close. Safe to call repeatedly.
    pub async fn disable(&self) {
        let Some(Running { cancel, task }) = self.running.lock().await.take() else {
            log::debug!("bridge not enabled, nothing to disable");
            return;
        };
        cancel.cancel();
        if let Err(e) = task.await {
            log::error!("stream supervisor ended abnormally: {}", e);
        }
        let info = plugin_info();
        log::info!("{} {} disabled", info.name, info.version);
    }

    pub async fn is_enabled(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Replace the settings. An active session keeps its snapshot; the new settings apply
    /// from the next connect cycle.
    pub async fn reconfigure(&self, config: &Config) -> Result<(), ConfigError> {
        let settings = config.validate()?;
        *self.settings.write().await = Arc::new(settings);
        log::info!("configuration updated; applies on next connect");
        Ok(())
    }

    pub async fn settings(&self) -> Arc<Settings> {
        self.settings.read().await.clone()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.client.state()
    }

    /// Fan `event` out once against the current destinations, outside any session.
    pub async fn dispatch_once(
        &self,
        event: &InboundEvent,
        cancel: &CancellationToken,
    ) -> Vec<DeliveryError> {
        let destinations = self.settings.read().await.destinations.clone();
        Dispatcher::new(destinations).dispatch(event, cancel).await
    }
}
