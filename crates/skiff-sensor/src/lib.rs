pub mod config;
pub mod error;
pub mod framing;
pub mod manager;
pub mod publisher;
pub mod sensor;

pub use config::SensorConfig;
pub use error::SensorError;
pub use framing::{Framer, FramerOutput};
pub use manager::{SensorManager, MAX_SENSORS};
pub use publisher::{MessagePublisher, PublishQos};
pub use sensor::{Sensor, SensorState, SensorStats};
