pub mod app;
pub mod auth;
pub mod error;
pub mod handlers;
pub mod state;

pub use app::{build_router, serve};
pub use error::ApiError;
pub use state::{ApiState, DeviceInfo};
