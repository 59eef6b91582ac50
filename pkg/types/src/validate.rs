use anyhow::{Result, bail};

/// Namespace names follow the RFC 1123 label rules.
const MAX_NAMESPACE_LEN: usize = 63;

/// Validate a namespace name before it is embedded in a slice unit name.
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
/// A name that fails here would produce a malformed `<prefix>-<ns>.slice`
/// unit or an unsafe systemctl argument.
pub fn validate_namespace_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("namespace name must not be empty");
    }
    if name.len() > MAX_NAMESPACE_LEN {
        bail!(
            "namespace name '{}' exceeds {} characters",
            name,
            MAX_NAMESPACE_LEN
        );
    }
    if name.starts_with('-') || name.ends_with('-') {
        bail!("namespace name '{}' must not start or end with a hyphen", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "namespace name '{}' must contain only [a-z0-9-]",
            name
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_namespaces() {
        assert!(validate_namespace_name("default").is_ok());
        assert!(validate_namespace_name("tenant-a").is_ok());
        assert!(validate_namespace_name("team-42").is_ok());
        assert!(validate_namespace_name("x").is_ok());
    }

    #[test]
    fn rejects_slice_unsafe_namespaces() {
        assert!(validate_namespace_name("").is_err());
        assert!(validate_namespace_name("Tenant-A").is_err());
        assert!(validate_namespace_name("tenant_a").is_err());
        assert!(validate_namespace_name("-tenant").is_err());
        assert!(validate_namespace_name("tenant-").is_err());
        assert!(validate_namespace_name("tenant.a").is_err());
        assert!(validate_namespace_name(&"n".repeat(64)).is_err());
    }
}
