use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use skiff_domain::{AdapterDevice, DeviceIdentity, OutputConfig, Protocol};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::hash::compute_state_hash;
use crate::store::{DeviceStore, SnapshotKind, StateSnapshot};

// Named, forward-only migrations. Each is applied exactly once, recorded by
// name in the `migrations` table. Never edit a shipped migration — append.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_device",
        r#"
CREATE TABLE IF NOT EXISTS device (
    uuid                 TEXT PRIMARY KEY,
    device_id            TEXT,
    device_name          TEXT NOT NULL,
    device_type          TEXT NOT NULL,
    device_api_key       TEXT NOT NULL,
    provisioning_api_key TEXT,
    api_key              TEXT, -- legacy column, retained for old databases
    api_endpoint         TEXT,
    registered_at        TEXT,
    provisioned          INTEGER NOT NULL DEFAULT 0,
    application_id       INTEGER,
    mac_address          TEXT,
    os_version           TEXT,
    agent_version        TEXT,
    mqtt_broker_url      TEXT,
    mqtt_username        TEXT,
    mqtt_password        TEXT,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL
);
"#,
    ),
    (
        "0002_state_snapshot",
        r#"
CREATE TABLE IF NOT EXISTS state_snapshot (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    type       TEXT NOT NULL UNIQUE,
    state      TEXT NOT NULL,
    state_hash CHAR(64) NOT NULL,
    created_at TEXT NOT NULL
);
"#,
    ),
    (
        "0003_protocol_adapter_devices",
        r#"
CREATE TABLE IF NOT EXISTS protocol_adapter_devices (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT NOT NULL UNIQUE,
    protocol      TEXT NOT NULL,
    enabled       INTEGER NOT NULL DEFAULT 1,
    poll_interval INTEGER NOT NULL,
    connection    TEXT NOT NULL,
    data_points   TEXT NOT NULL,
    metadata      TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
"#,
    ),
    (
        "0004_protocol_adapter_outputs",
        r#"
CREATE TABLE IF NOT EXISTS protocol_adapter_outputs (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    protocol            TEXT NOT NULL UNIQUE,
    socket_path         TEXT NOT NULL,
    data_format         TEXT NOT NULL,
    delimiter           TEXT NOT NULL,
    include_timestamp   INTEGER NOT NULL DEFAULT 1,
    include_device_name INTEGER NOT NULL DEFAULT 1,
    logging             TEXT
);
"#,
    ),
];

#[derive(sqlx::FromRow)]
struct DeviceRow {
    uuid: String,
    device_id: Option<String>,
    device_name: String,
    device_type: String,
    device_api_key: String,
    provisioning_api_key: Option<String>,
    api_endpoint: Option<String>,
    registered_at: Option<DateTime<Utc>>,
    provisioned: bool,
    application_id: Option<i64>,
    mac_address: Option<String>,
    os_version: Option<String>,
    agent_version: Option<String>,
    mqtt_broker_url: Option<String>,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
}

impl From<DeviceRow> for DeviceIdentity {
    fn from(row: DeviceRow) -> Self {
        DeviceIdentity {
            uuid: row.uuid,
            device_id: row.device_id,
            device_name: row.device_name,
            device_type: row.device_type,
            device_api_key: row.device_api_key,
            provisioning_api_key: row.provisioning_api_key,
            api_endpoint: row.api_endpoint,
            application_id: row.application_id,
            mac_address: row.mac_address,
            os_version: row.os_version,
            agent_version: row.agent_version,
            provisioned: row.provisioned,
            registered_at: row.registered_at,
            mqtt_broker_url: row.mqtt_broker_url,
            mqtt_username: row.mqtt_username,
            mqtt_password: row.mqtt_password,
        }
    }
}

/// Persistent state store backed by a SQLite database file.
///
/// Writers are serialized by the single-connection pool; snapshot writes are
/// additionally gated by content hash so unchanged state never touches disk.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply pending migrations.
    ///
    /// Parent directories are created automatically.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS migrations (
                 name       TEXT PRIMARY KEY,
                 applied_at TEXT NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;

        for (name, sql) in MIGRATIONS {
            let applied: Option<(String,)> =
                sqlx::query_as("SELECT name FROM migrations WHERE name = ?")
                    .bind(name)
                    .fetch_optional(&self.pool)
                    .await?;
            if applied.is_some() {
                continue;
            }

            info!(migration = name, "applying migration");
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(sql).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO migrations (name, applied_at) VALUES (?, ?)")
                .bind(name)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for SqliteStore {
    // ── Device identity ───────────────────────────────────────────────────────

    async fn load_identity(&self) -> Result<Option<DeviceIdentity>, StoreError> {
        let row: Option<DeviceRow> = sqlx::query_as(
            "SELECT uuid, device_id, device_name, device_type, device_api_key,
                    provisioning_api_key, api_endpoint, registered_at, provisioned,
                    application_id, mac_address, os_version, agent_version,
                    mqtt_broker_url, mqtt_username, mqtt_password
             FROM device LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(DeviceIdentity::from))
    }

    async fn save_identity(&self, identity: &DeviceIdentity) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO device (
                 uuid, device_id, device_name, device_type, device_api_key,
                 provisioning_api_key, api_endpoint, registered_at, provisioned,
                 application_id, mac_address, os_version, agent_version,
                 mqtt_broker_url, mqtt_username, mqtt_password, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (uuid) DO UPDATE SET
                 device_id            = excluded.device_id,
                 device_name          = excluded.device_name,
                 device_type          = excluded.device_type,
                 device_api_key       = excluded.device_api_key,
                 provisioning_api_key = excluded.provisioning_api_key,
                 api_endpoint         = excluded.api_endpoint,
                 registered_at        = excluded.registered_at,
                 provisioned          = excluded.provisioned,
                 application_id       = excluded.application_id,
                 mac_address          = excluded.mac_address,
                 os_version           = excluded.os_version,
                 agent_version        = excluded.agent_version,
                 mqtt_broker_url      = excluded.mqtt_broker_url,
                 mqtt_username        = excluded.mqtt_username,
                 mqtt_password        = excluded.mqtt_password,
                 updated_at           = excluded.updated_at",
        )
        .bind(&identity.uuid)
        .bind(&identity.device_id)
        .bind(&identity.device_name)
        .bind(&identity.device_type)
        .bind(&identity.device_api_key)
        .bind(&identity.provisioning_api_key)
        .bind(&identity.api_endpoint)
        .bind(identity.registered_at)
        .bind(identity.provisioned)
        .bind(identity.application_id)
        .bind(&identity.mac_address)
        .bind(&identity.os_version)
        .bind(&identity.agent_version)
        .bind(&identity.mqtt_broker_url)
        .bind(&identity.mqtt_username)
        .bind(&identity.mqtt_password)
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn factory_reset(&self) -> Result<(), StoreError> {
        let identity = self.load_identity().await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM state_snapshot").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM protocol_adapter_devices").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM protocol_adapter_outputs").execute(&mut *tx).await?;
        if let Some(mut identity) = identity {
            identity.reset();
            sqlx::query(
                "UPDATE device SET
                     device_id = NULL, provisioning_api_key = NULL,
                     application_id = NULL, provisioned = 0, registered_at = NULL,
                     mqtt_broker_url = NULL, mqtt_username = NULL,
                     mqtt_password = NULL, updated_at = ?
                 WHERE uuid = ?",
            )
            .bind(Utc::now())
            .bind(&identity.uuid)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ── State snapshots ───────────────────────────────────────────────────────

    async fn load_snapshot(&self, kind: SnapshotKind) -> Result<Option<StateSnapshot>, StoreError> {
        let row: Option<(String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT state, state_hash, created_at FROM state_snapshot WHERE type = ?",
        )
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(state, state_hash, created_at)| {
            Ok(StateSnapshot {
                kind,
                state: serde_json::from_str(&state)?,
                state_hash,
                created_at,
            })
        })
        .transpose()
    }

    async fn save_snapshot(&self, kind: SnapshotKind, state: &Value) -> Result<bool, StoreError> {
        let hash = compute_state_hash(state);
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT state_hash FROM state_snapshot WHERE type = ?")
                .bind(kind.as_str())
                .fetch_optional(&self.pool)
                .await?;
        if existing.map_or(false, |(h,)| h == hash) {
            debug!(kind = %kind, "snapshot unchanged, skipping write");
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO state_snapshot (type, state, state_hash, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (type) DO UPDATE SET
                 state = excluded.state,
                 state_hash = excluded.state_hash,
                 created_at = excluded.created_at",
        )
        .bind(kind.as_str())
        .bind(serde_json::to_string(state)?)
        .bind(&hash)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    // ── Protocol adapter rows ─────────────────────────────────────────────────

    async fn list_adapter_devices(&self) -> Result<Vec<AdapterDevice>, StoreError> {
        let rows: Vec<(String, String, bool, i64, String, String, Option<String>)> =
            sqlx::query_as(
                "SELECT name, protocol, enabled, poll_interval, connection, data_points, metadata
                 FROM protocol_adapter_devices ORDER BY name",
            )
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|(name, protocol, enabled, poll_interval, connection, data_points, metadata)| {
                Ok(AdapterDevice {
                    name,
                    protocol: serde_json::from_value(Value::String(protocol))?,
                    enabled,
                    poll_interval_ms: poll_interval as u64,
                    connection: serde_json::from_str(&connection)?,
                    data_points: serde_json::from_str(&data_points)?,
                    metadata: metadata
                        .map(|m| serde_json::from_str(&m))
                        .transpose()?
                        .unwrap_or(Value::Null),
                })
            })
            .collect()
    }

    async fn upsert_adapter_device(&self, device: &AdapterDevice) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO protocol_adapter_devices
                 (name, protocol, enabled, poll_interval, connection, data_points,
                  metadata, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (name) DO UPDATE SET
                 protocol      = excluded.protocol,
                 enabled       = excluded.enabled,
                 poll_interval = excluded.poll_interval,
                 connection    = excluded.connection,
                 data_points   = excluded.data_points,
                 metadata      = excluded.metadata,
                 updated_at    = excluded.updated_at",
        )
        .bind(&device.name)
        .bind(device.protocol.to_string())
        .bind(device.enabled)
        .bind(device.poll_interval_ms as i64)
        .bind(serde_json::to_string(&device.connection)?)
        .bind(serde_json::to_string(&device.data_points)?)
        .bind(serde_json::to_string(&device.metadata)?)
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_adapter_device(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM protocol_adapter_devices WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_output_config(
        &self,
        protocol: Protocol,
    ) -> Result<Option<OutputConfig>, StoreError> {
        let row: Option<(String, String, String, bool, bool, Option<String>)> = sqlx::query_as(
            "SELECT socket_path, data_format, delimiter, include_timestamp,
                    include_device_name, logging
             FROM protocol_adapter_outputs WHERE protocol = ?",
        )
        .bind(protocol.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(
            |(socket_path, data_format, delimiter, include_timestamp, include_device_name, logging)| {
                Ok(OutputConfig {
                    protocol,
                    socket_path,
                    data_format,
                    delimiter,
                    include_timestamp,
                    include_device_name,
                    logging: logging
                        .map(|l| serde_json::from_str(&l))
                        .transpose()?
                        .unwrap_or(Value::Null),
                })
            },
        )
        .transpose()
    }

    async fn upsert_output_config(&self, config: &OutputConfig) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO protocol_adapter_outputs
                 (protocol, socket_path, data_format, delimiter, include_timestamp,
                  include_device_name, logging)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (protocol) DO UPDATE SET
                 socket_path         = excluded.socket_path,
                 data_format         = excluded.data_format,
                 delimiter           = excluded.delimiter,
                 include_timestamp   = excluded.include_timestamp,
                 include_device_name = excluded.include_device_name,
                 logging             = excluded.logging",
        )
        .bind(config.protocol.to_string())
        .bind(&config.socket_path)
        .bind(&config.data_format)
        .bind(&config.delimiter)
        .bind(config.include_timestamp)
        .bind(config.include_device_name)
        .bind(serde_json::to_string(&config.logging)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skiff_domain::{Connection, DataPoint, DataType, Endianness, FunctionCode};

    async fn temp_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("skiff.db")).await.unwrap();
        (store, dir)
    }

    fn adapter_device(name: &str) -> AdapterDevice {
        AdapterDevice {
            name: name.into(),
            protocol: Protocol::Modbus,
            enabled: true,
            poll_interval_ms: 1_000,
            connection: Connection::ModbusTcp {
                host: "10.0.0.5".into(),
                port: 502,
                unit_id: 1,
                timeout_ms: 3_000,
            },
            data_points: vec![DataPoint {
                name: "temp".into(),
                address: 0,
                function_code: FunctionCode::ReadHoldingRegisters,
                data_type: DataType::Uint16,
                count: 1,
                endianness: Endianness::Big,
                scale: 1.0,
                offset: 0.0,
                unit: None,
            }],
            metadata: Value::Null,
        }
    }

    #[tokio::test]
    async fn migrations_apply_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skiff.db");
        let store = SqliteStore::open(&path).await.unwrap();
        // Re-opening must not re-apply (unique primary key on name would fail).
        drop(store);
        SqliteStore::open(&path).await.unwrap();
    }

    #[tokio::test]
    async fn identity_round_trips() {
        let (store, _dir) = temp_store().await;
        let mut identity = DeviceIdentity::bootstrap("bench", "generic");
        identity.provisioning_api_key = Some("pk_test".into());
        store.save_identity(&identity).await.unwrap();

        let got = store.load_identity().await.unwrap().unwrap();
        assert_eq!(got, identity);

        identity.mark_provisioned("42".into(), Utc::now());
        store.save_identity(&identity).await.unwrap();
        let got = store.load_identity().await.unwrap().unwrap();
        assert!(got.provisioned);
        assert!(got.provisioning_api_key.is_none());
    }

    #[tokio::test]
    async fn snapshot_write_is_hash_gated() {
        let (store, _dir) = temp_store().await;
        let state = json!({"apps": {}});
        assert!(store.save_snapshot(SnapshotKind::Current, &state).await.unwrap());
        assert!(!store.save_snapshot(SnapshotKind::Current, &state).await.unwrap());

        let loaded = store.load_snapshot(SnapshotKind::Current).await.unwrap().unwrap();
        assert_eq!(loaded.state, state);
        assert_eq!(loaded.state_hash, compute_state_hash(&state));
    }

    #[tokio::test]
    async fn adapter_devices_round_trip() {
        let (store, _dir) = temp_store().await;
        let device = adapter_device("plc-1");
        store.upsert_adapter_device(&device).await.unwrap();
        store.upsert_adapter_device(&adapter_device("plc-0")).await.unwrap();

        let listed = store.list_adapter_devices().await.unwrap();
        assert_eq!(listed.len(), 2);
        // Ordered by name
        assert_eq!(listed[0].name, "plc-0");
        assert_eq!(listed[1], device);

        store.delete_adapter_device("plc-1").await.unwrap();
        assert_eq!(store.list_adapter_devices().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn output_config_round_trips() {
        let (store, _dir) = temp_store().await;
        assert!(store.get_output_config(Protocol::Modbus).await.unwrap().is_none());

        let config = OutputConfig::for_protocol(Protocol::Modbus, "/run/skiff/modbus.sock");
        store.upsert_output_config(&config).await.unwrap();
        let got = store.get_output_config(Protocol::Modbus).await.unwrap().unwrap();
        assert_eq!(got, config);
    }

    #[tokio::test]
    async fn factory_reset_clears_rows_but_keeps_identity_core() {
        let (store, _dir) = temp_store().await;
        let mut identity = DeviceIdentity::bootstrap("bench", "generic");
        identity.mark_provisioned("42".into(), Utc::now());
        store.save_identity(&identity).await.unwrap();
        store.upsert_adapter_device(&adapter_device("plc-1")).await.unwrap();
        store.save_snapshot(SnapshotKind::Target, &json!({"apps": {}})).await.unwrap();

        store.factory_reset().await.unwrap();

        let got = store.load_identity().await.unwrap().unwrap();
        assert_eq!(got.uuid, identity.uuid);
        assert_eq!(got.device_api_key, identity.device_api_key);
        assert!(!got.provisioned);
        assert!(store.list_adapter_devices().await.unwrap().is_empty());
        assert!(store.load_snapshot(SnapshotKind::Target).await.unwrap().is_none());
    }
}
