use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::MqttError;
use crate::topic::{topic_matches, valid_filter};

const CONNECT_WATCHDOG: Duration = Duration::from_secs(10);

/// A message delivered by the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Per-subscription callback. Errors are logged by the router and never
/// affect delivery to other handlers.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(
        &self,
        message: &InboundMessage,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

impl<F> MessageHandler for F
where
    F: Fn(&InboundMessage) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync
        + 'static,
{
    fn handle(
        &self,
        message: &InboundMessage,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self(message)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

impl ConnectOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
        }
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

#[derive(Clone)]
struct Subscription {
    filter: String,
    qos: QoS,
    handler: Arc<dyn MessageHandler>,
}

/// Route a message to every handler whose filter matches. Returns the number
/// of handlers invoked; a failing handler counts and is logged.
fn dispatch(subscriptions: &[Subscription], message: &InboundMessage) -> usize {
    let mut delivered = 0;
    for sub in subscriptions {
        if !topic_matches(&sub.filter, &message.topic) {
            continue;
        }
        delivered += 1;
        if let Err(e) = sub.handler.handle(message) {
            warn!(
                topic = %message.topic,
                filter = %sub.filter,
                error = %e,
                "message handler failed"
            );
        }
    }
    delivered
}

struct Inner {
    client: RwLock<Option<AsyncClient>>,
    subscriptions: RwLock<Vec<Subscription>>,
    connected_tx: watch::Sender<bool>,
    /// Dedup gate for concurrent connect attempts: later callers wait on the
    /// first attempt instead of opening a second connection.
    connect_gate: Mutex<()>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    reconnect_period: Duration,
}

/// The one broker connection for the whole agent. Constructed at start and
/// passed explicitly to every consumer; cheap to clone.
#[derive(Clone)]
pub struct MqttClient {
    inner: Arc<Inner>,
}

impl MqttClient {
    pub fn new() -> Self {
        let (connected_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                client: RwLock::new(None),
                subscriptions: RwLock::new(Vec::new()),
                connected_tx,
                connect_gate: Mutex::new(()),
                loop_task: Mutex::new(None),
                closed: AtomicBool::new(false),
                reconnect_period: Duration::from_secs(5),
            }),
        }
    }

    /// Connect to the broker. Idempotent: a connected client returns
    /// immediately, a concurrent attempt waits for the in-flight one.
    pub async fn connect(&self, url: &str, options: ConnectOptions) -> Result<(), MqttError> {
        let _gate = self.inner.connect_gate.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.inner.closed.store(false, Ordering::SeqCst);

        let (host, port) = parse_broker_url(url)?;
        let mut mqtt_options = MqttOptions::new(options.client_id.clone(), host, port);
        mqtt_options.set_keep_alive(options.keep_alive);
        if let (Some(user), Some(pass)) = (&options.username, &options.password) {
            mqtt_options.set_credentials(user.clone(), pass.clone());
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, 64);
        *self.inner.client.write().await = Some(client);

        let inner = self.inner.clone();
        let task = tokio::spawn(async move { run_event_loop(inner, event_loop).await });
        if let Some(old) = self.inner.loop_task.lock().await.replace(task) {
            old.abort();
        }

        // Connect watchdog: fail the call if no ConnAck arrives in time.
        // The event loop keeps retrying in the background either way.
        let mut rx = self.inner.connected_tx.subscribe();
        let result = match timeout(CONNECT_WATCHDOG, rx.wait_for(|c| *c)).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(MqttError::ConnectTimeout),
        };
        result
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected_tx.borrow()
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
    ) -> Result<(), MqttError> {
        let client = self
            .inner
            .client
            .read()
            .await
            .clone()
            .ok_or(MqttError::NotConnected)?;
        client.publish(topic, qos, false, payload.into()).await?;
        Ok(())
    }

    /// Register `handler` for `filter`. Multiple handlers per filter are
    /// allowed; all matching handlers receive every message. Subscriptions
    /// survive reconnects.
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), MqttError> {
        if !valid_filter(filter) {
            return Err(MqttError::InvalidFilter(filter.to_string()));
        }
        self.inner.subscriptions.write().await.push(Subscription {
            filter: filter.to_string(),
            qos,
            handler,
        });
        if self.is_connected() {
            if let Some(client) = self.inner.client.read().await.clone() {
                client.subscribe(filter, qos).await?;
            }
        }
        Ok(())
    }

    /// Drop every handler registered for `filter`.
    pub async fn unsubscribe(&self, filter: &str) -> Result<(), MqttError> {
        self.inner
            .subscriptions
            .write()
            .await
            .retain(|s| s.filter != filter);
        if self.is_connected() {
            if let Some(client) = self.inner.client.read().await.clone() {
                client.unsubscribe(filter).await?;
            }
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), MqttError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(client) = self.inner.client.write().await.take() {
            client.disconnect().await?;
        }
        if let Some(task) = self.inner.loop_task.lock().await.take() {
            // Let the loop observe the disconnect; it exits on the closed flag.
            task.abort();
        }
        let _ = self.inner.connected_tx.send(false);
        Ok(())
    }
}

impl Default for MqttClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_event_loop(inner: Arc<Inner>, mut event_loop: EventLoop) {
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            debug!("mqtt event loop stopping");
            return;
        }
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(code = ?ack.code, "mqtt connected");
                let _ = inner.connected_tx.send(true);
                resubscribe(&inner).await;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                // Snapshot outside the lock so a handler may (un)subscribe.
                let subs = inner.subscriptions.read().await.clone();
                let delivered = dispatch(&subs, &message);
                debug!(topic = %message.topic, delivered, "routed inbound message");
            }
            Ok(_) => {}
            Err(e) => {
                let was_connected = *inner.connected_tx.borrow();
                let _ = inner.connected_tx.send(false);
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                if was_connected {
                    warn!(error = %e, "mqtt connection lost, reconnecting");
                } else {
                    debug!(error = %e, "mqtt connect attempt failed, retrying");
                }
                tokio::time::sleep(inner.reconnect_period).await;
            }
        }
    }
}

async fn resubscribe(inner: &Arc<Inner>) {
    let client = inner.client.read().await.clone();
    let Some(client) = client else { return };
    let subs = inner.subscriptions.read().await;
    for sub in subs.iter() {
        if let Err(e) = client.subscribe(&sub.filter, sub.qos).await {
            warn!(filter = %sub.filter, error = %e, "resubscribe failed");
        }
    }
}

/// Accepts `mqtt://host[:port]`, `tcp://host[:port]` or bare `host[:port]`.
/// Port defaults to 1883.
fn parse_broker_url(url: &str) -> Result<(String, u16), MqttError> {
    let rest = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);
    if rest.is_empty() || rest.contains('/') {
        return Err(MqttError::InvalidBrokerUrl(url.to_string()));
    }
    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| MqttError::InvalidBrokerUrl(url.to_string()))?;
            Ok((host.to_string(), port))
        }
        None => Ok((rest.to_string(), 1883)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
        Arc::new(
            move |_m: &InboundMessage| -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
    }

    fn message(topic: &str) -> InboundMessage {
        InboundMessage { topic: topic.into(), payload: b"{}".to_vec() }
    }

    #[test]
    fn dispatch_routes_to_all_matching_handlers() {
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let subs = vec![
            Subscription {
                filter: "sensor/+/temp".into(),
                qos: QoS::AtLeastOnce,
                handler: counting_handler(a.clone()),
            },
            Subscription {
                filter: "sensor/#".into(),
                qos: QoS::AtLeastOnce,
                handler: counting_handler(b.clone()),
            },
            Subscription {
                filter: "other/topic".into(),
                qos: QoS::AtLeastOnce,
                handler: counting_handler(Arc::new(AtomicUsize::new(0))),
            },
        ];

        let delivered = dispatch(&subs, &message("sensor/a/temp"));
        assert_eq!(delivered, 2);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_handler_does_not_block_others() {
        let ok = Arc::new(AtomicUsize::new(0));
        let subs = vec![
            Subscription {
                filter: "t/#".into(),
                qos: QoS::AtMostOnce,
                handler: Arc::new(|_m: &InboundMessage| {
                    Err::<(), Box<dyn std::error::Error + Send + Sync>>("boom".into())
                }),
            },
            Subscription {
                filter: "t/#".into(),
                qos: QoS::AtMostOnce,
                handler: counting_handler(ok.clone()),
            },
        ];

        let delivered = dispatch(&subs, &message("t/x"));
        assert_eq!(delivered, 2);
        assert_eq!(ok.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn broker_url_parsing() {
        assert_eq!(parse_broker_url("mqtt://broker:1884").unwrap(), ("broker".into(), 1884));
        assert_eq!(parse_broker_url("tcp://10.0.0.1:1883").unwrap(), ("10.0.0.1".into(), 1883));
        assert_eq!(parse_broker_url("broker.local").unwrap(), ("broker.local".into(), 1883));
        assert!(parse_broker_url("mqtt://").is_err());
        assert!(parse_broker_url("mqtt://host/path").is_err());
    }

    #[tokio::test]
    async fn publish_before_connect_is_rejected() {
        let client = MqttClient::new();
        let err = client.publish("t", "x", QoS::AtMostOnce).await.unwrap_err();
        assert!(matches!(err, MqttError::NotConnected));
    }

    #[tokio::test]
    async fn subscribe_rejects_invalid_filter() {
        let client = MqttClient::new();
        let err = client
            .subscribe("a/#/b", QoS::AtMostOnce, counting_handler(Arc::new(AtomicUsize::new(0))))
            .await
            .unwrap_err();
        assert!(matches!(err, MqttError::InvalidFilter(_)));
    }
}
