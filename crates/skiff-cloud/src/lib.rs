pub mod backoff;
pub mod client;
pub mod error;
pub mod provision;
pub mod sync;

pub use backoff::Backoff;
pub use client::{
    CloudClient, MqttCredentials, MqttTopics, RegisterRequest, RegisterResponse, TargetFetch,
};
pub use error::CloudError;
pub use provision::{ensure_provisioned, run_provisioning_loop, ProvisionSettings};
pub use sync::{CloudSync, ReportSource, SyncSettings, TargetHandler};
