//! MQTT-backed event bus and notification channel
//!
//! Both adapters share one MQTT client:
//! - `{prefix}/{bus_name}` - out-of-jurisdiction events as JSON (QoS 1)
//! - notification topic - plain-text owner notices fanned out to subscribers (QoS 1)
//!
//! A publish returns `Ok` only once the broker has sent its PUBACK. Packet
//! ids are assigned by the eventloop in the order requests enter the client,
//! so waiters are queued in that same order and bound to the id when the
//! eventloop reports the outgoing publish. A lost connection fails every
//! outstanding publish back to its caller instead of replaying it.

use crate::domain::types::{BusEvent, NotificationMessage};
use crate::infra::config::Config;
use crate::io::collaborators::{EventBus, NotificationChannel};
use anyhow::{bail, Context};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Back-off after an eventloop error before reconnecting
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Publishes waiting for their PUBACK
#[derive(Default)]
struct AckTracker {
    connected: bool,
    /// Handed to the client, packet id not assigned yet (client order)
    unassigned: VecDeque<oneshot::Sender<()>>,
    inflight: FxHashMap<u16, oneshot::Sender<()>>,
}

impl AckTracker {
    fn on_connected(&mut self) {
        self.connected = true;
    }

    fn on_outgoing_publish(&mut self, pkid: u16) {
        // Waiters that already gave up
        self.inflight.retain(|_, waiter| !waiter.is_closed());
        if let Some(waiter) = self.unassigned.pop_front() {
            self.inflight.insert(pkid, waiter);
        }
    }

    fn on_puback(&mut self, pkid: u16) {
        if let Some(waiter) = self.inflight.remove(&pkid) {
            let _ = waiter.send(());
        }
    }

    /// Drop every waiter, failing its publish. Returns how many were outstanding.
    fn on_disconnected(&mut self) -> usize {
        self.connected = false;
        let outstanding = self.unassigned.len() + self.inflight.len();
        self.unassigned.clear();
        self.inflight.clear();
        outstanding
    }

    fn outstanding(&self) -> usize {
        self.unassigned.iter().filter(|w| !w.is_closed()).count()
            + self.inflight.values().filter(|w| !w.is_closed()).count()
    }
}

/// Shared MQTT client whose publishes complete on broker acknowledgement
pub struct MqttPublisher {
    client: AsyncClient,
    acks: Arc<Mutex<AckTracker>>,
    /// Keeps waiter order identical to request order
    send_lock: tokio::sync::Mutex<()>,
    ack_timeout: Duration,
}

/// Connect to the configured broker and spawn the eventloop driver.
///
/// The driver keeps running after shutdown until outstanding publishes are
/// acknowledged or the ack timeout elapses.
pub fn connect(config: &Config, shutdown: watch::Receiver<bool>) -> (Arc<MqttPublisher>, JoinHandle<()>) {
    let client_id = format!("violation-pipeline-{}", std::process::id());
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    mqttoptions.set_clean_session(true);

    // Set credentials if configured
    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    MqttPublisher::spawn(mqttoptions, Duration::from_millis(config.mqtt_ack_timeout_ms()), shutdown)
}

impl MqttPublisher {
    pub fn spawn(
        options: MqttOptions,
        ack_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (client, eventloop) = AsyncClient::new(options, 100);
        let acks = Arc::new(Mutex::new(AckTracker::default()));
        let driver = tokio::spawn(drive(eventloop, acks.clone(), shutdown, ack_timeout));
        let publisher = Arc::new(Self { client, acks, send_lock: tokio::sync::Mutex::new(()), ack_timeout });
        (publisher, driver)
    }

    /// Publish at QoS 1 and wait for the broker's PUBACK
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let acked = {
            let _order = self.send_lock.lock().await;
            let (tx, rx) = oneshot::channel();
            {
                let mut acks = self.acks.lock();
                if !acks.connected {
                    bail!("MQTT broker not connected, {topic} not published");
                }
                acks.unassigned.push_back(tx);
            }
            if let Err(e) = self.client.publish(topic, QoS::AtLeastOnce, false, payload).await {
                self.acks.lock().unassigned.pop_back();
                return Err(e).with_context(|| format!("Failed to queue publish to {topic}"));
            }
            rx
        };

        match tokio::time::timeout(self.ack_timeout, acked).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => bail!("MQTT connection lost before {topic} publish was acknowledged"),
            Err(_) => bail!("No PUBACK for {topic} publish within {:?}", self.ack_timeout),
        }
    }
}

async fn drive(
    mut eventloop: EventLoop,
    acks: Arc<Mutex<AckTracker>>,
    mut shutdown: watch::Receiver<bool>,
    drain_timeout: Duration,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            result = eventloop.poll() => {
                if !track(&mut eventloop, &acks, result) {
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    }

    // Let publishes already handed to the client reach the broker
    let deadline = tokio::time::Instant::now() + drain_timeout;
    loop {
        let outstanding = acks.lock().outstanding();
        if outstanding == 0 {
            break;
        }
        match tokio::time::timeout_at(deadline, eventloop.poll()).await {
            Ok(result) => {
                if !track(&mut eventloop, &acks, result) {
                    break;
                }
            }
            Err(_) => {
                warn!(outstanding, "mqtt_bus_drain_timed_out");
                break;
            }
        }
    }
    info!("mqtt_bus_shutdown");
}

/// Apply one eventloop result to the tracker; false on a connection error
fn track(eventloop: &mut EventLoop, acks: &Mutex<AckTracker>, result: Result<Event, ConnectionError>) -> bool {
    match result {
        Ok(Event::Incoming(Packet::ConnAck(_))) => {
            acks.lock().on_connected();
            info!("mqtt_bus_connected");
        }
        Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.lock().on_outgoing_publish(pkid),
        Ok(Event::Incoming(Packet::PubAck(ack))) => {
            debug!(pkid = ack.pkid, "mqtt_bus_puback");
            acks.lock().on_puback(ack.pkid);
        }
        Ok(_) => {}
        Err(e) => {
            let failed = acks.lock().on_disconnected();
            // Failed publishes are retried by their callers, not replayed here
            eventloop.pending.clear();
            eventloop.state.events.clear();
            warn!(error = %e, failed, "mqtt_bus_error");
            return false;
        }
    }
    true
}

/// Topic an event for `bus_name` is published on
pub fn bus_topic(prefix: &str, bus_name: &str) -> String {
    if prefix.is_empty() {
        bus_name.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), bus_name)
    }
}

pub struct MqttEventBus {
    publisher: Arc<MqttPublisher>,
    topic_prefix: String,
}

impl MqttEventBus {
    pub fn new(publisher: Arc<MqttPublisher>, topic_prefix: &str) -> Self {
        Self { publisher, topic_prefix: topic_prefix.to_string() }
    }
}

#[async_trait]
impl EventBus for MqttEventBus {
    async fn publish(&self, event: BusEvent) -> anyhow::Result<()> {
        let topic = bus_topic(&self.topic_prefix, &event.bus_name);
        let json = serde_json::to_vec(&event)?;
        self.publisher
            .publish(&topic, json)
            .await
            .with_context(|| format!("Failed to publish event to {topic}"))?;
        debug!(topic = %topic, image_key = %event.detail.image_key, "bus_event_published");
        Ok(())
    }
}

pub struct MqttNotificationChannel {
    publisher: Arc<MqttPublisher>,
    topic: String,
}

impl MqttNotificationChannel {
    pub fn new(publisher: Arc<MqttPublisher>, topic: &str) -> Self {
        Self { publisher, topic: topic.to_string() }
    }
}

#[async_trait]
impl NotificationChannel for MqttNotificationChannel {
    async fn publish(&self, message: NotificationMessage) -> anyhow::Result<()> {
        self.publisher
            .publish(&self.topic, message.body.into_bytes())
            .await
            .with_context(|| format!("Failed to publish notice to {}", self.topic))?;
        debug!(topic = %self.topic, recipient = %message.recipient_contact, "notice_sent");
        Ok(())
    }
}
