//! Inbound rate limiting
//!
//! Keyed by the authenticated user when present, the client IP otherwise.

use axum::extract::ConnectInfo;
use axum::http::Request;
use std::net::{IpAddr, SocketAddr};
use tower_governor::{errors::GovernorError, key_extractor::KeyExtractor};

use crate::auth::USER_HEADER;

// 300 requests/minute = 1 request every 200ms
pub const API_PERIOD_MS: u64 = 200;
pub const API_BURST_SIZE: u32 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    User(String),
    Ip(IpAddr),
}

#[derive(Clone)]
pub struct UserOrIpKeyExtractor;

impl KeyExtractor for UserOrIpKeyExtractor {
    type Key = RateLimitKey;

    fn extract<B>(&self, req: &Request<B>) -> Result<Self::Key, GovernorError> {
        if let Some(user) = req
            .headers()
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            return Ok(RateLimitKey::User(user.to_string()));
        }

        if let Some(header) = req.headers().get("x-forwarded-for") {
            if let Ok(value) = header.to_str() {
                if let Some(client_ip) = value.split(',').next() {
                    if let Ok(ip) = client_ip.trim().parse::<IpAddr>() {
                        return Ok(RateLimitKey::Ip(ip));
                    }
                }
            }
        }

        if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
            return Ok(RateLimitKey::Ip(addr.ip()));
        }

        // No identity at all (e.g. behind a socket-less test harness):
        // share one anonymous bucket rather than failing the request.
        Ok(RateLimitKey::Ip(IpAddr::from([0, 0, 0, 0])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_user_header_wins_over_ip() {
        let extractor = UserOrIpKeyExtractor;

        let mut req = Request::new(Body::empty());
        req.headers_mut()
            .insert(USER_HEADER, "user-1".parse().unwrap());
        let addr: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));

        assert_eq!(
            extractor.extract(&req).unwrap(),
            RateLimitKey::User("user-1".to_string())
        );
    }

    #[test]
    fn test_forwarded_for_beats_connect_info() {
        let extractor = UserOrIpKeyExtractor;

        let mut req = Request::new(Body::empty());
        let addr: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req.headers_mut()
            .insert("x-forwarded-for", "203.0.113.195".parse().unwrap());

        assert_eq!(
            extractor.extract(&req).unwrap(),
            RateLimitKey::Ip("203.0.113.195".parse().unwrap())
        );
    }
}
