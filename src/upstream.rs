// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The external routing collaborator interface (spec §1 "out of scope:
//! upstream load balancing"; spec §4.10 step 1 "Resolve upstream ...
//! delegated to the external routing collaborator"). The gateway core only
//! needs a single resolved address + scheme per request; how that address
//! is chosen (DNS, service discovery, weighted LB) is someone else's job.

use anyhow::{anyhow, Result};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Ws,
}

#[derive(Debug, Clone)]
pub struct ResolvedUpstream {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Resolves a route's configured upstream string into a single address.
/// The default implementation here just parses the route's static
/// `upstream` URL; a real deployment would plug in its load balancer here.
pub trait UpstreamResolver: Send + Sync {
    fn resolve(&self, upstream: &str) -> Result<ResolvedUpstream>;
}

pub struct StaticUpstreamResolver;

impl UpstreamResolver for StaticUpstreamResolver {
    fn resolve(&self, upstream: &str) -> Result<ResolvedUpstream> {
        let url = Url::parse(upstream).map_err(|e| anyhow!("invalid upstream url {upstream}: {e}"))?;
        let tls = matches!(url.scheme(), "https" | "wss");
        let scheme = match url.scheme() {
            "ws" | "wss" => Scheme::Ws,
            _ => Scheme::Http,
        };
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("upstream url {upstream} has no host"))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow!("upstream url {upstream} has no resolvable port"))?;
        Ok(ResolvedUpstream {
            scheme,
            host,
            port,
            tls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_ws_scheme_and_default_port() {
        let resolved = StaticUpstreamResolver.resolve("ws://node.internal/rpc").unwrap();
        assert_eq!(resolved.scheme, Scheme::Ws);
        assert_eq!(resolved.port, 80);
        assert!(!resolved.tls);
    }

    #[test]
    fn resolves_wss_scheme_with_tls() {
        let resolved = StaticUpstreamResolver.resolve("wss://node.internal/rpc").unwrap();
        assert_eq!(resolved.scheme, Scheme::Ws);
        assert_eq!(resolved.port, 443);
        assert!(resolved.tls);
    }
}
