pub mod adapter;
pub mod error;
pub mod identity;
pub mod sample;
pub mod shadow;
pub mod types;

pub use adapter::{
    AdapterDevice, Connection, DataPoint, DataType, Endianness, FunctionCode, OutputConfig,
    Parity, Protocol,
};
pub use error::DomainError;
pub use identity::{generate_api_key, DeviceIdentity};
pub use sample::{Quality, QualityCode, Sample, SampleValue};
pub use shadow::{shadow_topic, ShadowDocument, ShadowOp, ShadowResult, ShadowState};
pub use types::{
    App, AppId, DeviceState, RestartPolicy, Service, ServiceConfig, ServiceId, ServiceStatus,
    TargetDocument,
};
