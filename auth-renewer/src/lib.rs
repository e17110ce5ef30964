pub mod authorization;
pub mod authorizer;
pub mod config;
pub mod credentials;
pub mod error;
pub mod keys;
pub mod kv;
pub mod metrics;
pub mod renewer;
pub mod storage;
pub mod upstream;

pub use authorization::Authorization;
pub use authorizer::Authorizer;
pub use config::Config;
pub use credentials::Credentials;
pub use error::{AuthorizerError, KvError, RenewerError, StorageError, UpstreamError};
pub use kv::{KvStore, RedisKvStore};
pub use metrics::RenewerMetrics;
pub use renewer::{PoolSize, PriorityAuthRenewer};
pub use storage::Storage;
pub use upstream::{ReqwestUpstreamClient, Upstream};
