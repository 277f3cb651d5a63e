/// Telegram delivery backed by the core `Delivery` trait
pub mod delivery;
/// Command, text and callback handlers
pub mod handlers;
/// Resilient send/edit wrappers with automatic retry
pub mod resilient;
/// Per-user cache of live search results
pub mod search_cache;
/// User dialogue state
pub mod state;

pub use search_cache::SearchCache;
