pub mod browser_manager;
pub mod chromium;
pub mod driver;
pub mod extraction;
pub mod feed_profile;
pub mod navigation;
