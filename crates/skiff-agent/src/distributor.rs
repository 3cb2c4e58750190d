use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A feature behind one top-level config key. Handlers own the persistence
/// and lifecycle for their key and serialize their own work.
#[async_trait]
pub trait ConfigHandler: Send + Sync + 'static {
    async fn handle_change(
        &self,
        key: &str,
        new_value: Option<&Value>,
        prev_value: Option<&Value>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Fans incoming target config out to typed feature handlers, one event per
/// changed key. A key that disappears is delivered with `new_value = None`.
pub struct ConfigDistributor {
    handlers: BTreeMap<String, Arc<dyn ConfigHandler>>,
    last: Mutex<BTreeMap<String, Value>>,
}

impl ConfigDistributor {
    pub fn new() -> Self {
        Self { handlers: BTreeMap::new(), last: Mutex::new(BTreeMap::new()) }
    }

    pub fn register(&mut self, key: impl Into<String>, handler: Arc<dyn ConfigHandler>) {
        self.handlers.insert(key.into(), handler);
    }

    /// Diff `config` against the previously dispatched blob and notify the
    /// handler of every changed key, in key order. A failing handler only
    /// affects its own key.
    pub async fn dispatch(&self, config: &BTreeMap<String, Value>) {
        let mut last = self.last.lock().await;

        let keys: BTreeSet<&String> = last.keys().chain(config.keys()).collect();
        for key in keys {
            let new_value = config.get(key.as_str());
            let prev_value = last.get(key.as_str());
            if new_value == prev_value {
                continue;
            }
            match self.handlers.get(key.as_str()) {
                Some(handler) => {
                    debug!(key = %key, removed = new_value.is_none(), "config key changed");
                    if let Err(e) = handler.handle_change(key, new_value, prev_value).await {
                        warn!(key = %key, error = %e, "config handler rejected change");
                    }
                }
                None => debug!(key = %key, "no handler registered for config key"),
            }
        }

        *last = config.clone();
    }
}

impl Default for ConfigDistributor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct Recorder {
        events: AsyncMutex<Vec<(String, Option<Value>, Option<Value>)>>,
        fail: bool,
    }

    #[async_trait]
    impl ConfigHandler for Recorder {
        async fn handle_change(
            &self,
            key: &str,
            new_value: Option<&Value>,
            prev_value: Option<&Value>,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.events
                .lock()
                .await
                .push((key.to_string(), new_value.cloned(), prev_value.cloned()));
            if self.fail {
                return Err("refused".into());
            }
            Ok(())
        }
    }

    fn blob(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn unchanged_keys_are_not_redispatched() {
        let recorder = Arc::new(Recorder::default());
        let mut distributor = ConfigDistributor::new();
        distributor.register("sensors", recorder.clone());

        let config = blob(&[("sensors", json!([{"name": "a"}]))]);
        distributor.dispatch(&config).await;
        distributor.dispatch(&config).await;

        assert_eq!(recorder.events.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn removal_delivers_none() {
        let recorder = Arc::new(Recorder::default());
        let mut distributor = ConfigDistributor::new();
        distributor.register("sensors", recorder.clone());

        distributor.dispatch(&blob(&[("sensors", json!([1]))])).await;
        distributor.dispatch(&BTreeMap::new()).await;

        let events = recorder.events.lock().await;
        assert_eq!(events.len(), 2);
        assert!(events[1].1.is_none());
        assert_eq!(events[1].2, Some(json!([1])));
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_other_keys() {
        let failing = Arc::new(Recorder { fail: true, ..Default::default() });
        let healthy = Arc::new(Recorder::default());
        let mut distributor = ConfigDistributor::new();
        distributor.register("logging", failing.clone());
        distributor.register("sensors", healthy.clone());

        distributor
            .dispatch(&blob(&[
                ("logging", json!({"level": "debug"})),
                ("sensors", json!([])),
            ]))
            .await;

        assert_eq!(failing.events.lock().await.len(), 1);
        assert_eq!(healthy.events.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn unregistered_keys_are_ignored() {
        let distributor = ConfigDistributor::new();
        // Must not panic or error.
        distributor.dispatch(&blob(&[("unknown", json!(1))])).await;
    }
}
