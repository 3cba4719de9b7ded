pub mod crawl;

pub use crawl::CrawlOrchestrator;
