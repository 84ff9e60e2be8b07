pub mod ids;
pub mod options;
pub mod envelope;
pub mod state;
pub mod events;

pub use ids::{JobId, ConsumerTag, DeliveryTag};
pub use options::{JobOptions, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS};
pub use envelope::JobEnvelope;
pub use state::ConnectionState;
pub use events::{JobEvent, DeadLetterReason};
