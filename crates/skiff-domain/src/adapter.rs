use serde::{Deserialize, Serialize};

use crate::error::DomainError;

// ── Protocol & connection ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Modbus,
    Can,
    Opcua,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Modbus => write!(f, "modbus"),
            Protocol::Can => write!(f, "can"),
            Protocol::Opcua => write!(f, "opcua"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// How to reach a protocol-adapter device. Tagged by `type`; a row whose
/// connection tag disagrees with its `protocol` is refused whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Connection {
    ModbusTcp {
        host: String,
        port: u16,
        #[serde(default = "default_unit_id")]
        unit_id: u8,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    ModbusRtu {
        port: String,
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
        #[serde(default)]
        parity: Parity,
        #[serde(default = "default_unit_id")]
        unit_id: u8,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    Opcua {
        endpoint: String,
    },
    Can {
        interface: String,
    },
}

fn default_unit_id() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    3_000
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl Connection {
    pub fn protocol(&self) -> Protocol {
        match self {
            Connection::ModbusTcp { .. } | Connection::ModbusRtu { .. } => Protocol::Modbus,
            Connection::Opcua { .. } => Protocol::Opcua,
            Connection::Can { .. } => Protocol::Can,
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        match self {
            Connection::ModbusTcp { timeout_ms, .. } => *timeout_ms,
            Connection::ModbusRtu { timeout_ms, .. } => *timeout_ms,
            _ => default_timeout_ms(),
        }
    }
}

// ── Data points ───────────────────────────────────────────────────────────────

/// Modbus read operation. Serialized as the numeric function code on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
}

impl TryFrom<u8> for FunctionCode {
    type Error = DomainError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(FunctionCode::ReadCoils),
            2 => Ok(FunctionCode::ReadDiscreteInputs),
            3 => Ok(FunctionCode::ReadHoldingRegisters),
            4 => Ok(FunctionCode::ReadInputRegisters),
            other => Err(DomainError::InvalidFunctionCode(other)),
        }
    }
}

impl From<FunctionCode> for u8 {
    fn from(fc: FunctionCode) -> u8 {
        match fc {
            FunctionCode::ReadCoils => 1,
            FunctionCode::ReadDiscreteInputs => 2,
            FunctionCode::ReadHoldingRegisters => 3,
            FunctionCode::ReadInputRegisters => 4,
        }
    }
}

impl FunctionCode {
    /// Whether this read returns single bits rather than 16-bit registers.
    pub fn is_bit_read(&self) -> bool {
        matches!(self, FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    String,
}

impl DataType {
    /// Number of 16-bit registers a value of this type occupies, when fixed.
    /// `String` length is governed by the data point's `count`.
    pub fn register_count(&self) -> Option<u16> {
        match self {
            DataType::Bool => Some(1),
            DataType::Int16 | DataType::Uint16 => Some(1),
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => Some(2),
            DataType::String => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub name: String,
    pub address: u16,
    pub function_code: FunctionCode,
    pub data_type: DataType,
    #[serde(default = "default_count")]
    pub count: u16,
    #[serde(default)]
    pub endianness: Endianness,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

fn default_count() -> u16 {
    1
}

fn default_scale() -> f64 {
    1.0
}

impl DataPoint {
    fn validate(&self) -> Result<(), DomainError> {
        if self.name.is_empty() {
            return Err(DomainError::InvalidDataPoint {
                name: "<unnamed>".into(),
                message: "name must not be empty".into(),
            });
        }
        if self.count == 0 {
            return Err(DomainError::InvalidDataPoint {
                name: self.name.clone(),
                message: "count must be at least 1".into(),
            });
        }
        if let Some(required) = self.data_type.register_count() {
            if !self.function_code.is_bit_read() && self.count < required {
                return Err(DomainError::InvalidDataPoint {
                    name: self.name.clone(),
                    message: format!(
                        "data type {:?} needs {} registers, count is {}",
                        self.data_type, required, self.count
                    ),
                });
            }
        }
        if self.function_code.is_bit_read() && self.data_type != DataType::Bool {
            return Err(DomainError::InvalidDataPoint {
                name: self.name.clone(),
                message: "coil and discrete-input reads must be bool".into(),
            });
        }
        Ok(())
    }
}

// ── Device row ────────────────────────────────────────────────────────────────

/// One configured protocol-adapter device, as stored in
/// `protocol_adapter_devices` and delivered via target config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterDevice {
    /// Unique across all adapter devices.
    pub name: String,
    pub protocol: Protocol,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    pub connection: Connection,
    #[serde(default)]
    pub data_points: Vec<DataPoint>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

impl AdapterDevice {
    /// Validate the whole row. Validation failures refuse the row entirely;
    /// other rows are unaffected.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.is_empty() {
            return Err(DomainError::InvalidAdapterDevice {
                name: "<unnamed>".into(),
                message: "name must not be empty".into(),
            });
        }
        if self.connection.protocol() != self.protocol {
            return Err(DomainError::ConnectionProtocolMismatch {
                connection: self.connection.protocol().to_string(),
                protocol: self.protocol.to_string(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(DomainError::InvalidAdapterDevice {
                name: self.name.clone(),
                message: "poll_interval_ms must be at least 1".into(),
            });
        }
        for dp in &self.data_points {
            dp.validate()?;
        }
        let mut names: Vec<&str> = self.data_points.iter().map(|d| d.name.as_str()).collect();
        names.sort();
        names.dedup();
        if names.len() != self.data_points.len() {
            return Err(DomainError::InvalidAdapterDevice {
                name: self.name.clone(),
                message: "duplicate data point names".into(),
            });
        }
        Ok(())
    }
}

// ── Output socket configuration ───────────────────────────────────────────────

/// How the adapter subsystem frames samples onto its local IPC socket,
/// as stored in `protocol_adapter_outputs` (one row per protocol).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub protocol: Protocol,
    pub socket_path: String,
    #[serde(default = "default_data_format")]
    pub data_format: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_true")]
    pub include_timestamp: bool,
    #[serde(default = "default_true")]
    pub include_device_name: bool,
    #[serde(default)]
    pub logging: serde_json::Value,
}

fn default_data_format() -> String {
    "json".into()
}

fn default_delimiter() -> String {
    "\n".into()
}

fn default_true() -> bool {
    true
}

impl OutputConfig {
    pub fn for_protocol(protocol: Protocol, socket_path: impl Into<String>) -> Self {
        Self {
            protocol,
            socket_path: socket_path.into(),
            data_format: default_data_format(),
            delimiter: default_delimiter(),
            include_timestamp: true,
            include_device_name: true,
            logging: serde_json::Value::Null,
        }
    }
}
