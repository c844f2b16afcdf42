use crate::domain::{exponential_backoff, BridgeMetrics, MessageHandler, SettingsCache};
use crate::mqtt::topic::{subscription_changes, subscription_topics};
use crate::mqtt::ConnectionState;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use common::domain::{DomainError, DomainResult, IngestionMessage};
use futures::FutureExt;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck, SubscribeReasonCode,
};
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};

const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MqttSubscriberConfig {
    /// `mqtt://host:port`, `tcp://host:port` or `host:port`
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Failed connection attempts tolerated before the first session
    pub startup_max_attempts: u32,
    /// Upper bound on concurrently running message handlers
    pub max_in_flight: usize,
    /// Time in-flight handlers get to finish on shutdown
    pub drain_timeout: Duration,
    pub channel_capacity: usize,
}

impl Default for MqttSubscriberConfig {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://localhost:1883".to_string(),
            client_id: "telemetry-bridge".to_string(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            clean_session: false,
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            startup_max_attempts: 10,
            max_in_flight: 256,
            drain_timeout: Duration::from_secs(10),
            channel_capacity: 100,
        }
    }
}

/// Long-lived MQTT ingestion.
///
/// Reconnects on its own with jittered exponential backoff; only failing to
/// reach the broker at startup is fatal. Each inbound message is handed to
/// the handler on its own task.
pub struct MqttSubscriber {
    config: MqttSubscriberConfig,
    handler: Arc<dyn MessageHandler>,
    settings: Arc<SettingsCache>,
    metrics: Arc<BridgeMetrics>,
    state: watch::Sender<ConnectionState>,
}

struct Session<'a> {
    token: &'a CancellationToken,
    tracker: &'a TaskTracker,
    permits: &'a Arc<Semaphore>,
    settings_rx: &'a mut watch::Receiver<Arc<common::domain::SystemSettings>>,
    connected: bool,
}

impl MqttSubscriber {
    pub fn new(
        config: MqttSubscriberConfig,
        handler: Arc<dyn MessageHandler>,
        settings: Arc<SettingsCache>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            handler,
            settings,
            metrics,
            state,
        }
    }

    /// Observe connection state transitions
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "mqtt connection state changed");
        }
    }

    fn reconnect_backoff(&self) -> ExponentialBackoff {
        exponential_backoff(
            self.config.reconnect_base_delay,
            self.config.reconnect_max_delay,
        )
    }

    /// Run until cancelled. Returns an error only when the broker could not
    /// be reached within `startup_max_attempts` before any session succeeded.
    #[instrument(
        name = "mqtt_subscriber",
        skip_all,
        fields(broker_url = %self.config.broker_url, client_id = %self.config.client_id)
    )]
    pub async fn run(&self, token: CancellationToken) -> DomainResult<()> {
        let (host, port) = parse_broker_url(&self.config.broker_url)?;
        if self.config.client_id.is_empty() && !self.config.clean_session {
            return Err(DomainError::InvalidBrokerConfig(
                "a persistent session requires a client id".to_string(),
            ));
        }
        info!(host, port, "starting MQTT subscriber");

        let tracker = TaskTracker::new();
        let permits = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut settings_rx = self.settings.subscribe();
        let mut backoff = self.reconnect_backoff();
        let mut ever_connected = false;
        let mut failures = 0u32;

        let result = loop {
            if token.is_cancelled() {
                break Ok(());
            }

            self.set_state(ConnectionState::Connecting);
            let mut session = Session {
                token: &token,
                tracker: &tracker,
                permits: &permits,
                settings_rx: &mut settings_rx,
                connected: false,
            };
            let outcome = self.run_session(host, port, &mut session).await;

            if session.connected {
                ever_connected = true;
                failures = 0;
                backoff.reset();
            }

            let e = match outcome {
                Ok(()) => break Ok(()),
                Err(e) => e,
            };

            self.set_state(ConnectionState::Disconnected);
            failures += 1;

            if !ever_connected && failures >= self.config.startup_max_attempts {
                error!(
                    attempts = failures,
                    error = %e,
                    "MQTT broker unreachable at startup, giving up"
                );
                break Err(DomainError::BrokerConnectionError(format!(
                    "broker {} unreachable after {} attempts: {}",
                    self.config.broker_url, failures, e
                )));
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or(self.config.reconnect_max_delay);
            warn!(
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "MQTT connection lost, reconnecting"
            );

            tokio::select! {
                _ = token.cancelled() => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.drain_in_flight(&tracker).await;
        self.set_state(ConnectionState::Disconnected);
        info!("MQTT subscriber stopped");
        result
    }

    async fn run_session(
        &self,
        host: &str,
        port: u16,
        session: &mut Session<'_>,
    ) -> DomainResult<()> {
        let mut options = MqttOptions::new(&self.config.client_id, host, port);
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(self.config.clean_session);
        if let Some(username) = &self.config.username {
            options.set_credentials(
                username.clone(),
                self.config.password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(options, self.config.channel_capacity);
        let mut subscribed: BTreeSet<String> = BTreeSet::new();
        let mut awaiting_suback = 0usize;
        let mut watching_settings = true;

        loop {
            tokio::select! {
                _ = session.token.cancelled() => {
                    debug!("MQTT subscriber cancellation received");
                    // Stop reading, let handlers finish, then leave the broker
                    self.drain_in_flight(session.tracker).await;
                    disconnect(&client, &mut eventloop).await;
                    return Ok(());
                }
                changed = session.settings_rx.changed(), if watching_settings => {
                    if changed.is_err() {
                        watching_settings = false;
                        continue;
                    }
                    if !session.connected {
                        continue;
                    }
                    let desired = subscription_topics(&session.settings_rx.borrow_and_update());
                    let (added, removed) = subscription_changes(&subscribed, &desired);
                    for topic in removed {
                        client.unsubscribe(&topic).await.map_err(|e| {
                            DomainError::BrokerConnectionError(format!("failed to unsubscribe: {}", e))
                        })?;
                        info!(topic = %topic, "unsubscribed from MQTT topic");
                        subscribed.remove(&topic);
                    }
                    for topic in added {
                        client.subscribe(&topic, QoS::AtLeastOnce).await.map_err(|e| {
                            DomainError::BrokerConnectionError(format!("failed to subscribe: {}", e))
                        })?;
                        info!(topic = %topic, "subscribed to MQTT topic");
                        subscribed.insert(topic);
                    }
                }
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            session.connected = true;
                            self.set_state(ConnectionState::Connected);
                            info!("connected to MQTT broker");

                            let desired =
                                subscription_topics(&session.settings_rx.borrow_and_update());
                            self.set_state(ConnectionState::Subscribing);
                            for topic in &desired {
                                client.subscribe(topic, QoS::AtLeastOnce).await.map_err(|e| {
                                    DomainError::BrokerConnectionError(format!(
                                        "failed to subscribe: {}",
                                        e
                                    ))
                                })?;
                            }
                            awaiting_suback = desired.len();
                            info!(topics = ?desired, "subscribing to MQTT topics");
                            subscribed = desired;
                        }
                        Ok(Event::Incoming(Packet::SubAck(suback))) => {
                            let refused = refused_subscriptions(&suback);
                            if refused > 0 {
                                error!(
                                    pkid = suback.pkid,
                                    refused,
                                    "MQTT broker refused subscription"
                                );
                                return Err(DomainError::BrokerConnectionError(format!(
                                    "broker refused {} subscription(s)",
                                    refused
                                )));
                            }
                            awaiting_suback = awaiting_suback.saturating_sub(1);
                            if awaiting_suback == 0 && *self.state.borrow() == ConnectionState::Subscribing {
                                self.set_state(ConnectionState::Active);
                                info!("MQTT subscriber active");
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let message = IngestionMessage {
                                topic: publish.topic.clone(),
                                raw_payload: publish.payload.to_vec(),
                                qos: publish.qos as u8,
                                retained: publish.retain,
                                received_at: Utc::now(),
                            };

                            let permit = tokio::select! {
                                _ = session.token.cancelled() => continue,
                                permit = Arc::clone(session.permits).acquire_owned() => {
                                    permit.map_err(|_| {
                                        DomainError::BrokerConnectionError(
                                            "handler semaphore closed".to_string(),
                                        )
                                    })?
                                }
                            };

                            session.tracker.spawn(handle_mqtt_message(
                                Arc::clone(&self.handler),
                                Arc::clone(&self.metrics),
                                message,
                                permit,
                            ));
                        }
                        Ok(Event::Incoming(Packet::PingResp)) => {
                            // Ping response - connection is healthy
                        }
                        Ok(_) => {
                            // Other events (outgoing, etc.)
                        }
                        Err(e) => {
                            return Err(DomainError::BrokerConnectionError(format!(
                                "MQTT event loop error: {}",
                                e
                            )));
                        }
                    }
                }
            }
        }
    }

    async fn drain_in_flight(&self, tracker: &TaskTracker) {
        tracker.close();
        if tracker.is_empty() {
            return;
        }

        info!(in_flight = tracker.len(), "waiting for in-flight messages");
        if tokio::time::timeout(self.config.drain_timeout, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = tracker.len(),
                timeout_ms = self.config.drain_timeout.as_millis() as u64,
                "in-flight messages did not finish before the drain timeout"
            );
        }
    }
}

fn refused_subscriptions(suback: &SubAck) -> usize {
    suback
        .return_codes
        .iter()
        .filter(|code| matches!(code, SubscribeReasonCode::Failure))
        .count()
}

async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if client.disconnect().await.is_err() {
        return;
    }
    // The DISCONNECT packet is only written while the event loop is polled
    let _ = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
}

/// Handle one inbound MQTT message on its own root span.
///
/// Errors and panics are contained here: the message is dropped and logged,
/// never retried.
pub(crate) async fn handle_mqtt_message(
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<BridgeMetrics>,
    message: IngestionMessage,
    _permit: OwnedSemaphorePermit,
) {
    // Create a new root span for this message (independent trace)
    let span = info_span!(
        parent: Span::none(),
        "mqtt_message",
        topic = %message.topic,
        payload_size = message.raw_payload.len(),
        qos = message.qos,
        retained = message.retained,
        tenant_id = tracing::field::Empty,
        device_id = tracing::field::Empty,
    );

    let outcome = AssertUnwindSafe(async move { handler.handle(message).await })
        .catch_unwind()
        .instrument(span.clone())
        .await;

    span.in_scope(|| match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_validation() => warn!(error = %e, "invalid telemetry dropped"),
        Ok(Err(e @ DomainError::UnresolvedIdentity(_))) => {
            warn!(error = %e, "telemetry from unknown device dropped")
        }
        Ok(Err(e)) => warn!(error = %e, "telemetry handling failed, message dropped"),
        Err(panic) => {
            metrics.record_handler_failure();
            error!(panic = %panic_message(&*panic), "message handler panicked, message dropped");
        }
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Parse broker URL in format mqtt://host:port or tcp://host:port or host:port
fn parse_broker_url(url: &str) -> DomainResult<(&str, u16)> {
    let url = url.trim_start_matches("mqtt://");
    let url = url.trim_start_matches("tcp://");

    let parts: Vec<&str> = url.split(':').collect();
    match parts.as_slice() {
        [host] if !host.is_empty() => Ok((*host, 1883)), // Default MQTT port
        [host, port] if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| {
                DomainError::InvalidBrokerConfig(format!("Invalid port in broker URL: {}", port))
            })?;
            Ok((*host, port))
        }
        _ => Err(DomainError::InvalidBrokerConfig(format!(
            "Invalid broker URL format: {}",
            url
        ))),
    }
}
