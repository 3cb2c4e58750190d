pub mod docker;
pub mod error;
pub mod runtime;
pub mod simulated;

pub use docker::DockerRuntime;
pub use error::RuntimeError;
pub use runtime::{
    named_volumes, ContainerRuntime, ManagedContainer, APP_ID_LABEL, APP_NAME_LABEL,
    CONFIG_LABEL, MANAGED_LABEL, SERVICE_ID_LABEL, SERVICE_NAME_LABEL,
};
pub use simulated::SimulatedRuntime;
