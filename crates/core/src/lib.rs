pub mod associator;
pub mod message;
pub mod metrics;
pub mod quota;
pub mod timestamp;
pub mod transport;

pub use associator::{GiftAssociator, GiftMap, QuantityMode, total_units};
pub use message::{Delivery, InboundEvent, InboundMessage, SlashCommand};
pub use metrics::{InMemoryMetrics, MetricsSink, MetricsSnapshot, Outcome};
pub use quota::QuotaDecision;
pub use timestamp::{TimestampError, format_instant, parse_token};
pub use transport::{
    Outbound, Transport, TransportError, TransportSession, UserDirectory, UserProfile,
};
