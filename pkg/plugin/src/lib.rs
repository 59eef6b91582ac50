pub mod cache;
pub mod isolator;

pub use cache::QuotaCache;
pub use isolator::IsolatorPlugin;
