pub mod core;
pub mod features;
pub mod persistence;
pub mod scraping;
pub mod tools;

// --- Primary core exports ---
pub use crate::core::types;
pub use crate::core::types::*;
pub use crate::core::{CrawlError, HarvestConfig, RetryPolicy};

// --- Short module paths ---
pub use features::{diagnostics, proxy_preflight, session_store};
pub use persistence::{pool, sink, store};
pub use scraping::{browser_manager, driver, extraction, navigation};
pub use tools::crawl;
pub use tools::CrawlOrchestrator;
