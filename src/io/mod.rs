//! Node transport: framing, in-flight tracking, multiplexed connections

pub mod connection;
pub mod factory;
pub mod frame;
pub mod in_flight;
pub mod stream;
#[cfg(feature = "tls")]
pub mod tls;

pub use connection::{
    live_connection_count, Connection, ConnectionError, ConnectionSettings,
    MultiplexingConnection, ServerPushSink,
};
pub use factory::{ConnectionFactory, ConnectionInitializer, NoopInitializer, TcpConnectionFactory};
pub use frame::{FrameCodec, ServerPush};
pub use in_flight::{InFlightConfig, InFlightError, InFlightOperationSet, InFlightSlot};
pub use stream::MaybeSecureStream;
