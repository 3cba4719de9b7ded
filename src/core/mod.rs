pub mod config;
pub mod error;
pub mod retry;
pub mod types;

pub use config::HarvestConfig;
pub use error::CrawlError;
pub use retry::RetryPolicy;
