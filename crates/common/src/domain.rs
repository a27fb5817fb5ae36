//! Domain name keys

/// Key identifying the DNS-01 challenge owner of a domain
///
/// Lower-cased with the wildcard label removed: `*.example.com` is validated
/// at `_acme-challenge.example.com`, and the CA reports its authorization
/// under `example.com`.
pub fn normalize_domain(domain: &str) -> String {
    let lower = domain.trim().to_ascii_lowercase();
    match lower.strip_prefix("*.") {
        Some(base) => base.to_string(),
        None => lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("Example.COM"), "example.com");
        assert_eq!(normalize_domain("*.example.com"), "example.com");
        assert_eq!(normalize_domain(" sub.example.com "), "sub.example.com");
    }
}
