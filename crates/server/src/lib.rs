pub mod config;
pub mod credentials;
pub mod http;
pub mod metrics;
pub mod shutdown;
