pub mod diagnostics;
pub mod proxy_preflight;
pub mod session_store;
