use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A logical address in `scheme://host/queue` form, e.g.
/// `correio://localhost/orders`. Endpoints identify message senders and
/// recipients; the queue strategy maps them to physical queues.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    uri: String,
    host: String,
    queue_name: String,
}

impl Endpoint {
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidEndpoint(uri.to_string());
        let (scheme, rest) = uri.split_once("://").ok_or_else(invalid)?;
        let (host, name) = rest.split_once('/').ok_or_else(invalid)?;
        let name = name.trim_end_matches('/');
        if scheme.is_empty() || host.is_empty() || name.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            uri: uri.to_string(),
            host: host.to_string(),
            queue_name: name.to_string(),
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The endpoint's queue name component, used by the queue strategy as
    /// the physical queue name (flat) or the subqueue label (subqueue).
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = ConfigError;

    fn try_from(uri: String) -> Result<Self, Self::Error> {
        Endpoint::parse(&uri)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.uri
    }
}

/// Routing metadata for an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The endpoint is served by this process; its queue can be created here.
    Local,
    /// The endpoint belongs to another process; `physical` is its address.
    Remote { physical: String },
}

/// Resolves a logical endpoint to routing metadata. Implemented by the
/// container; the crate ships a host-matching [`StaticRouter`].
pub trait EndpointRouter: Send + Sync {
    fn route(&self, endpoint: &Endpoint) -> Route;
}

/// Routes by host: endpoints on the local host are `Local`, everything else
/// is `Remote` with the endpoint uri as the physical address.
pub struct StaticRouter {
    local_host: String,
}

impl StaticRouter {
    pub fn new(local_host: impl Into<String>) -> Self {
        Self {
            local_host: local_host.into(),
        }
    }
}

impl EndpointRouter for StaticRouter {
    fn route(&self, endpoint: &Endpoint) -> Route {
        if endpoint.host() == self.local_host {
            Route::Local
        } else {
            Route::Remote {
                physical: endpoint.uri().to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_uri() {
        let e = Endpoint::parse("correio://localhost/orders").unwrap();
        assert_eq!(e.host(), "localhost");
        assert_eq!(e.queue_name(), "orders");
        assert_eq!(e.uri(), "correio://localhost/orders");
    }

    #[test]
    fn parse_trims_trailing_slash() {
        let e = Endpoint::parse("correio://localhost/orders/").unwrap();
        assert_eq!(e.queue_name(), "orders");
    }

    #[test]
    fn parse_rejects_malformed_uris() {
        for uri in ["", "orders", "correio://", "correio://host", "://host/q", "correio://host/"] {
            assert!(Endpoint::parse(uri).is_err(), "should reject {uri:?}");
        }
    }

    #[test]
    fn serde_round_trip() {
        let e = Endpoint::parse("correio://localhost/orders").unwrap();
        let json = serde_json::to_string(&e).unwrap();
        assert_eq!(json, "\"correio://localhost/orders\"");
        let back: Endpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn serde_rejects_malformed_uri() {
        let result: Result<Endpoint, _> = serde_json::from_str("\"not-a-uri\"");
        assert!(result.is_err());
    }

    #[test]
    fn static_router_splits_by_host() {
        let router = StaticRouter::new("localhost");
        let local = Endpoint::parse("correio://localhost/orders").unwrap();
        let remote = Endpoint::parse("correio://billing-host/invoices").unwrap();
        assert_eq!(router.route(&local), Route::Local);
        assert_eq!(
            router.route(&remote),
            Route::Remote {
                physical: "correio://billing-host/invoices".to_string()
            }
        );
    }
}
