use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("too many sensors: {0} (maximum 10)")]
    TooManySensors(usize),

    #[error("duplicate sensor name: {0}")]
    DuplicateName(String),

    #[error("sensor '{name}': invalid delimiter regex: {source}")]
    InvalidRegex {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("sensor '{name}': buffer_capacity {capacity} is below the 1024-byte minimum")]
    CapacityTooSmall { name: String, capacity: usize },

    #[error("sensor '{name}': missing required field '{field}'")]
    MissingField { name: String, field: &'static str },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
