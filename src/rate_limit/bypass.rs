//! Static bypass allow-lists.
//!
//! An explicit, injected object — never ambient global state — holding the
//! IPs and API keys that skip rate limiting entirely. Mutations go through
//! the same read-write-lock discipline as the rule registry, so admin
//! updates are safe while requests are in flight.

use crate::rate_limit::RequestContext;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::RwLock;

/// Allow-lists consulted before any store traffic.
#[derive(Debug, Default)]
pub struct BypassList {
    ips: RwLock<HashSet<IpAddr>>,
    api_keys: RwLock<HashSet<String>>,
}

impl BypassList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_ip(&self, ip: IpAddr) {
        self.ips.write().expect("bypass list poisoned").insert(ip);
    }

    pub fn remove_ip(&self, ip: &IpAddr) -> bool {
        self.ips.write().expect("bypass list poisoned").remove(ip)
    }

    pub fn allow_api_key(&self, key: impl Into<String>) {
        self.api_keys.write().expect("bypass list poisoned").insert(key.into());
    }

    pub fn remove_api_key(&self, key: &str) -> bool {
        self.api_keys.write().expect("bypass list poisoned").remove(key)
    }

    /// True when the request's IP or API key is allow-listed, or the caller
    /// marked it as an internal service-to-service call.
    pub fn exempts(&self, ctx: &RequestContext) -> bool {
        if ctx.internal {
            return true;
        }
        if let Some(ip) = ctx.ip {
            if self.ips.read().expect("bypass list poisoned").contains(&ip) {
                return true;
            }
        }
        if let Some(key) = &ctx.api_key {
            if self.api_keys.read().expect("bypass list poisoned").contains(key) {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_flag_always_exempts() {
        let bypass = BypassList::new();
        assert!(bypass.exempts(&RequestContext::new("GET", "/x").internal()));
        assert!(!bypass.exempts(&RequestContext::new("GET", "/x")));
    }

    #[test]
    fn ip_allow_list_add_and_remove() {
        let bypass = BypassList::new();
        let ip: IpAddr = "192.168.1.1".parse().expect("valid ip");
        let ctx = RequestContext::new("GET", "/x").with_ip(ip);

        assert!(!bypass.exempts(&ctx));
        bypass.allow_ip(ip);
        assert!(bypass.exempts(&ctx));
        assert!(bypass.remove_ip(&ip));
        assert!(!bypass.exempts(&ctx));
        assert!(!bypass.remove_ip(&ip));
    }

    #[test]
    fn api_key_allow_list_add_and_remove() {
        let bypass = BypassList::new();
        let ctx = RequestContext::new("GET", "/x").with_api_key("svc-key");

        assert!(!bypass.exempts(&ctx));
        bypass.allow_api_key("svc-key");
        assert!(bypass.exempts(&ctx));
        assert!(bypass.remove_api_key("svc-key"));
        assert!(!bypass.exempts(&ctx));
    }
}
