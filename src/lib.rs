pub mod bucket;
pub mod cluster;
pub mod io;
pub mod observability;
pub mod operation;
pub mod options;
pub mod pool;
pub mod retry;
pub mod topology;

pub use bucket::{vbucket_for_key, BucketRouter, BucketSettings, ClusterMapFetcher, RoutingError};
pub use cluster::{ClusterContext, ClusterError, ClusterServices, PushRelay};
pub use io::{Connection, ConnectionError, ConnectionFactory, ConnectionInitializer, MultiplexingConnection};
pub use operation::{Operation, OperationError, OperationResult};
pub use options::{ClusterOptions, OptionsError};
pub use pool::{ConnectionPool, MultiplexingConnectionPool, PoolError, ScaleController, SingleConnectionPool};
pub use topology::{BucketConfig, ConfigError, ConfigHandler, ConfigPushHandler, ConfigVersion};
