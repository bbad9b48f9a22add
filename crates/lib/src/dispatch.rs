//! Fan-out of one inbound event to every configured destination.
//!
//! Each destination is attempted in its own task. Failures are collected, never retried,
//! and never affect sibling destinations.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Destination;
use crate::error::DeliveryError;
use crate::event::InboundEvent;
use crate::payload::build_payload;

/// Delivers events to a fixed destination list over a shared HTTP client.
#[derive(Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    destinations: Arc<[Destination]>,
}

impl Dispatcher {
    pub fn new(destinations: Arc<[Destination]>) -> Self {
        Self::with_client(reqwest::Client::new(), destinations)
    }

    pub fn with_client(client: reqwest::Client, destinations: Arc<[Destination]>) -> Self {
        Self {
            client,
            destinations,
        }
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    /// Send `event` to every eligible destination concurrently. Returns once every attempt
    /// has finished; an empty result means full success.
    pub async fn dispatch(
        &self,
        event: &InboundEvent,
        cancel: &CancellationToken,
    ) -> Vec<DeliveryError> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let event = Arc::new(event.clone());
        let mut tasks = JoinSet::new();

        for index in 0..self.destinations.len() {
            let client = self.client.clone();
            let destinations = self.destinations.clone();
            let event = event.clone();
            let cancel = cancel.clone();
            let errors = errors.clone();
            tasks.spawn(async move {
                let destination = &destinations[index];
                if let Err(e) = deliver(&client, destination, &event, &cancel).await {
                    errors.lock().await.push(e);
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                log::error!("delivery task for event {} failed: {}", event.id, e);
            }
        }

        let mut errors = errors.lock().await;
        std::mem::take(&mut *errors)
    }
}

/// One attempt for one destination. `Ok` covers both success and an allow-list skip.
async fn deliver(
    client: &reqwest::Client,
    destination: &Destination,
    event: &InboundEvent,
    cancel: &CancellationToken,
) -> Result<(), DeliveryError> {
    let url = destination.label.as_str();
    if cancel.is_cancelled() {
        return Err(DeliveryError::Cancelled {
            url: url.to_string(),
        });
    }

    // Only events from allowed applications are forwarded.
    if !destination.accepts(event.appid) {
        log::debug!(
            "event {} from app {} not forwarded to {}",
            event.id,
            event.appid,
            url
        );
        return Ok(());
    }

    let body = build_payload(&destination.body, event).map_err(|source| DeliveryError::Template {
        url: url.to_string(),
        source,
    })?;

    let request = client
        .request(destination.method.clone(), destination.url.clone())
        .headers(destination.headers.clone())
        .body(body)
        .send();

    let res = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(DeliveryError::Cancelled { url: url.to_string() });
        }
        res = request => res.map_err(|source| DeliveryError::Transport {
            url: url.to_string(),
            source,
        })?,
    };

    let status = res.status();
    if !status.is_success() {
        return Err(DeliveryError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    log::debug!("event {} delivered to {} ({})", event.id, url, status);
    Ok(())
}
