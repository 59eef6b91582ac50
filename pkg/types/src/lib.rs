pub mod quota;
pub mod validate;

pub use quota::{NamespaceQuota, NamespaceQuotaSpec, NamespaceQuotaStatus};
