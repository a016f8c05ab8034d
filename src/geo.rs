//! Country resolution for request telemetry.
//!
//! Private and loopback addresses short-circuit to `"LOCAL"` without any
//! I/O. Everything else is delegated to an optional pluggable lookup; the
//! external geolocation service plugs in behind [`CountryLookup`].

use std::sync::Arc;

use async_trait::async_trait;

pub const LOCAL_COUNTRY: &str = "LOCAL";

/// Seam for an external `ip -> country-code` service.
#[async_trait]
pub trait CountryLookup: Send + Sync {
    async fn lookup(&self, ip: &str) -> Option<String>;
}

#[derive(Clone, Default)]
pub struct CountryResolver {
    lookup: Option<Arc<dyn CountryLookup>>,
}

impl CountryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lookup(lookup: Arc<dyn CountryLookup>) -> Self {
        Self {
            lookup: Some(lookup),
        }
    }

    /// Addresses that can never resolve to a country.
    pub fn is_private(ip: &str) -> bool {
        ip.is_empty()
            || ip == "unknown"
            || ip == "localhost"
            || ip == "::1"
            || ip.starts_with("127.")
            || ip.starts_with("192.168.")
            || ip.starts_with("10.")
    }

    pub async fn resolve(&self, ip: &str) -> Option<String> {
        if Self::is_private(ip) {
            return Some(LOCAL_COUNTRY.to_string());
        }
        match &self.lookup {
            Some(lookup) => lookup.lookup(ip).await,
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A lookup that fails the test if it is ever consulted.
    struct PanickingLookup;

    #[async_trait]
    impl CountryLookup for PanickingLookup {
        async fn lookup(&self, ip: &str) -> Option<String> {
            panic!("lookup called for {ip}");
        }
    }

    #[tokio::test]
    async fn private_ranges_short_circuit() {
        let resolver = CountryResolver::with_lookup(Arc::new(PanickingLookup));

        for ip in ["127.0.0.1", "192.168.1.50", "10.0.0.7", "unknown", "::1"] {
            assert_eq!(
                resolver.resolve(ip).await.as_deref(),
                Some(LOCAL_COUNTRY),
                "{ip} should resolve locally"
            );
        }
    }

    #[tokio::test]
    async fn public_ip_without_lookup_is_unresolved() {
        let resolver = CountryResolver::new();
        assert_eq!(resolver.resolve("8.8.8.8").await, None);
    }

    #[tokio::test]
    async fn public_ip_delegates_to_lookup() {
        struct Fixed;

        #[async_trait]
        impl CountryLookup for Fixed {
            async fn lookup(&self, _ip: &str) -> Option<String> {
                Some("DE".to_string())
            }
        }

        let resolver = CountryResolver::with_lookup(Arc::new(Fixed));
        assert_eq!(resolver.resolve("93.184.216.34").await.as_deref(), Some("DE"));
    }
}
