use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Quality ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Quality {
    Good,
    Bad,
}

/// Why a sample is BAD. Classified from the transport error that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityCode {
    Timeout,
    ConnectionRefused,
    HostUnreachable,
    ConnectionReset,
    PortNotFound,
    ModbusException,
    ReadError,
    DeviceOffline,
}

impl std::fmt::Display for QualityCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QualityCode::Timeout => "TIMEOUT",
            QualityCode::ConnectionRefused => "CONNECTION_REFUSED",
            QualityCode::HostUnreachable => "HOST_UNREACHABLE",
            QualityCode::ConnectionReset => "CONNECTION_RESET",
            QualityCode::PortNotFound => "PORT_NOT_FOUND",
            QualityCode::ModbusException => "MODBUS_EXCEPTION",
            QualityCode::ReadError => "READ_ERROR",
            QualityCode::DeviceOffline => "DEVICE_OFFLINE",
        };
        write!(f, "{}", s)
    }
}

// ── Values ────────────────────────────────────────────────────────────────────

/// A decoded data point value. Untagged: serializes as the bare JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for SampleValue {
    fn from(v: bool) -> Self {
        SampleValue::Bool(v)
    }
}

impl From<i64> for SampleValue {
    fn from(v: i64) -> Self {
        SampleValue::Integer(v)
    }
}

impl From<f64> for SampleValue {
    fn from(v: f64) -> Self {
        SampleValue::Float(v)
    }
}

impl From<String> for SampleValue {
    fn from(v: String) -> Self {
        SampleValue::Text(v)
    }
}

// ── Sample ────────────────────────────────────────────────────────────────────

/// One timestamped protocol-adapter reading.
///
/// Invariant: `value.is_none() ⇔ quality == Bad`. The constructors are the
/// only way this crate builds samples, so the invariant holds by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub device_name: String,
    pub register_name: String,
    pub value: Option<SampleValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub quality: Quality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_code: Option<QualityCode>,
}

impl Sample {
    pub fn good(
        device_name: impl Into<String>,
        register_name: impl Into<String>,
        value: SampleValue,
        unit: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            device_name: device_name.into(),
            register_name: register_name.into(),
            value: Some(value),
            unit,
            timestamp,
            quality: Quality::Good,
            quality_code: None,
        }
    }

    pub fn bad(
        device_name: impl Into<String>,
        register_name: impl Into<String>,
        unit: Option<String>,
        timestamp: DateTime<Utc>,
        code: QualityCode,
    ) -> Self {
        Self {
            device_name: device_name.into(),
            register_name: register_name.into(),
            value: None,
            unit,
            timestamp,
            quality: Quality::Bad,
            quality_code: Some(code),
        }
    }

    /// The invariant every emitted sample must satisfy.
    pub fn invariant_holds(&self) -> bool {
        match self.quality {
            Quality::Good => self.value.is_some(),
            Quality::Bad => self.value.is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn good_and_bad_respect_invariant() {
        let good = Sample::good("plc", "temp", SampleValue::Float(21.5), None, Utc::now());
        let bad = Sample::bad("plc", "temp", None, Utc::now(), QualityCode::Timeout);
        assert!(good.invariant_holds());
        assert!(bad.invariant_holds());
        assert_eq!(bad.quality_code, Some(QualityCode::Timeout));
    }

    #[test]
    fn sample_round_trips_for_every_data_type() {
        let now = Utc::now();
        let samples = [
            Sample::good("d", "a", SampleValue::Bool(true), None, now),
            Sample::good("d", "b", SampleValue::Integer(-7), None, now),
            Sample::good("d", "c", SampleValue::Float(123.45), Some("C".into()), now),
            Sample::good("d", "e", SampleValue::Text("PUMP-1".into()), None, now),
            Sample::bad("d", "f", None, now, QualityCode::ConnectionRefused),
        ];
        for sample in samples {
            let json = serde_json::to_string(&sample).unwrap();
            let back: Sample = serde_json::from_str(&json).unwrap();
            assert_eq!(sample, back, "round trip failed for {}", json);
        }
    }

    #[test]
    fn quality_serializes_uppercase() {
        let s = Sample::bad("d", "r", None, Utc::now(), QualityCode::DeviceOffline);
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["quality"], "BAD");
        assert_eq!(v["quality_code"], "DEVICE_OFFLINE");
        assert!(v["value"].is_null());
    }
}
