use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use skiff_domain::AdapterDevice;
use skiff_store::DeviceStore;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{ConnectionState, DeviceClient, DEFAULT_RETRY_DELAY};
use crate::error::AdapterError;
use crate::output::SampleWriter;
use crate::transport::Connector;

/// Owns one [`DeviceClient`] per enabled adapter row and keeps the persisted
/// rows in sync with the config distributor's view.
pub struct AdapterManager {
    store: Arc<dyn DeviceStore>,
    connector: Arc<dyn Connector>,
    writer: SampleWriter,
    cancel: CancellationToken,
    retry_delay: Duration,
    clients: Mutex<HashMap<String, DeviceClient>>,
}

impl AdapterManager {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        connector: Arc<dyn Connector>,
        writer: SampleWriter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            connector,
            writer,
            cancel,
            retry_delay: DEFAULT_RETRY_DELAY,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Start clients for every enabled row already in the store (boot path,
    /// before the first cloud config arrives).
    pub async fn start_from_store(&self) -> Result<(), AdapterError> {
        let rows = self.store.list_adapter_devices().await?;
        let mut clients = self.clients.lock().await;
        for row in rows {
            if row.enabled {
                self.spawn_into(&mut clients, row);
            }
        }
        Ok(())
    }

    /// Reconcile the full set of adapter rows against what is running.
    ///
    /// Rows failing validation are refused individually and leave every other
    /// row untouched. Rows absent from `rows` are stopped and deleted.
    pub async fn apply_devices(&self, rows: Vec<AdapterDevice>) -> Result<(), AdapterError> {
        let mut valid = Vec::with_capacity(rows.len());
        for row in rows {
            match row.validate() {
                Ok(()) => valid.push(row),
                Err(e) => warn!(device = %row.name, error = %e, "refusing adapter device row"),
            }
        }

        let incoming: HashSet<String> = valid.iter().map(|d| d.name.clone()).collect();
        let mut clients = self.clients.lock().await;

        // Removals.
        for existing in self.store.list_adapter_devices().await? {
            if incoming.contains(&existing.name) {
                continue;
            }
            info!(device = %existing.name, "removing adapter device");
            if let Some(client) = clients.remove(&existing.name) {
                client.shutdown().await;
            }
            self.store.delete_adapter_device(&existing.name).await?;
        }

        // Additions and changes.
        for row in valid {
            self.store.upsert_adapter_device(&row).await?;

            let unchanged = clients.get(&row.name).map_or(false, |c| c.device() == &row);
            if unchanged {
                continue;
            }
            if let Some(client) = clients.remove(&row.name) {
                info!(device = %row.name, "restarting adapter device with new config");
                client.shutdown().await;
            }
            if row.enabled {
                self.spawn_into(&mut clients, row);
            }
        }
        Ok(())
    }

    fn spawn_into(&self, clients: &mut HashMap<String, DeviceClient>, row: AdapterDevice) {
        let name = row.name.clone();
        let client = DeviceClient::spawn(
            row,
            self.connector.clone(),
            self.writer.clone(),
            &self.cancel,
            self.retry_delay,
        );
        clients.insert(name, client);
    }

    /// Connection state per device, for the stats surface.
    pub async fn states(&self) -> HashMap<String, ConnectionState> {
        let clients = self.clients.lock().await;
        clients.iter().map(|(name, c)| (name.clone(), c.state())).collect()
    }

    /// Stop every client, joining their tasks.
    pub async fn shutdown(&self) {
        let mut clients = self.clients.lock().await;
        for (_, client) in clients.drain() {
            client.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use skiff_domain::{Connection, OutputConfig, Protocol};
    use skiff_store::InMemoryStore;

    use crate::transport::{RegisterSource, TransportError};

    struct NeverConnects;

    #[async_trait]
    impl Connector for NeverConnects {
        async fn connect(
            &self,
            _connection: &Connection,
        ) -> Result<Box<dyn RegisterSource>, TransportError> {
            Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            )))
        }
    }

    fn row(name: &str, enabled: bool) -> AdapterDevice {
        AdapterDevice {
            name: name.into(),
            protocol: Protocol::Modbus,
            enabled,
            poll_interval_ms: 50,
            connection: Connection::ModbusTcp {
                host: "10.0.0.9".into(),
                port: 502,
                unit_id: 1,
                timeout_ms: 100,
            },
            data_points: vec![],
            metadata: serde_json::Value::Null,
        }
    }

    fn manager(store: Arc<InMemoryStore>) -> AdapterManager {
        AdapterManager::new(
            store,
            Arc::new(NeverConnects),
            SampleWriter::new(OutputConfig::for_protocol(Protocol::Modbus, "/tmp/x")),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn apply_spawns_enabled_and_skips_disabled() {
        let store = Arc::new(InMemoryStore::new());
        let m = manager(store.clone());

        m.apply_devices(vec![row("a", true), row("b", false)]).await.unwrap();

        let states = m.states().await;
        assert!(states.contains_key("a"));
        assert!(!states.contains_key("b"));
        // Both rows persisted regardless of enablement.
        assert_eq!(store.list_adapter_devices().await.unwrap().len(), 2);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn missing_rows_are_stopped_and_deleted() {
        let store = Arc::new(InMemoryStore::new());
        let m = manager(store.clone());
        m.apply_devices(vec![row("a", true), row("b", true)]).await.unwrap();

        m.apply_devices(vec![row("a", true)]).await.unwrap();

        assert!(!m.states().await.contains_key("b"));
        let names: Vec<String> = store
            .list_adapter_devices()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["a"]);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_row_refused_without_affecting_others() {
        let store = Arc::new(InMemoryStore::new());
        let m = manager(store.clone());

        let mut bad = row("bad", true);
        bad.protocol = Protocol::Opcua; // mismatched with modbus connection

        m.apply_devices(vec![bad, row("good", true)]).await.unwrap();

        assert!(m.states().await.contains_key("good"));
        assert!(!m.states().await.contains_key("bad"));
        assert_eq!(store.list_adapter_devices().await.unwrap().len(), 1);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn unchanged_row_keeps_running_client() {
        let store = Arc::new(InMemoryStore::new());
        let m = manager(store.clone());
        m.apply_devices(vec![row("a", true)]).await.unwrap();
        m.apply_devices(vec![row("a", true)]).await.unwrap();
        assert!(m.states().await.contains_key("a"));

        // Disable stops the client but keeps the row.
        m.apply_devices(vec![row("a", false)]).await.unwrap();
        assert!(!m.states().await.contains_key("a"));
        assert_eq!(store.list_adapter_devices().await.unwrap().len(), 1);
        m.shutdown().await;
    }
}
