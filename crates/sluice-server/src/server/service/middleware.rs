use super::{error::ApiError, handler::AppState};
use crate::server::telemetry::{increment_admitted, increment_rejected};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;

/// Header set by a fronting proxy with the originating client address.
pub const REMOTE_ADDR_HEADER: &str = "remote_addr";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Resolves the key a request is rate limited under.
///
/// Lookup order: the configured mock address, the `REMOTE_ADDR` header, the
/// first `X-Forwarded-For` entry, then the peer IP. Returns `None` when none
/// of them yields a non-empty value.
pub fn client_key(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    mock: Option<&str>,
) -> Option<String> {
    if let Some(mock) = mock {
        return Some(mock.to_owned());
    }

    header_value(headers, REMOTE_ADDR_HEADER)
        .or_else(|| {
            header_value(headers, FORWARDED_FOR_HEADER)
                .and_then(|list| list.split(',').next())
                .map(str::trim)
                .filter(|first| !first.is_empty())
        })
        .map(str::to_owned)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Increment-then-check admission in front of every API route.
///
/// Requests without a resolvable client key are refused with 400; clients
/// over their budget for the current window get 429.
pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let Some(key) = client_key(request.headers(), peer, state.mock_remote_addr()) else {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            "Refusing request to {} without a client address",
            request.uri().path()
        );
        return Err(ApiError::missing_client_key());
    };

    match state.admission().check(&key) {
        Ok(_count) => {
            increment_admitted();
            #[cfg(feature = "tracing")]
            tracing::trace!("Admitted request {_count} from {key}");
            Ok(next.run(request).await)
        }
        Err(err) => {
            increment_rejected();
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(*value));
        }
        headers
    }

    fn peer() -> Option<SocketAddr> {
        Some(SocketAddr::from(([192, 0, 2, 9], 51_000)))
    }

    #[test]
    fn remote_addr_header_wins_over_forwarded_for() {
        let headers = headers(&[
            (REMOTE_ADDR_HEADER, "203.0.113.1"),
            (FORWARDED_FOR_HEADER, "198.51.100.1"),
        ]);
        assert_eq!(
            client_key(&headers, peer(), None).as_deref(),
            Some("203.0.113.1")
        );
    }

    #[test]
    fn first_forwarded_for_entry_is_used() {
        let headers = headers(&[(FORWARDED_FOR_HEADER, " 198.51.100.1 , 10.0.0.1")]);
        assert_eq!(
            client_key(&headers, peer(), None).as_deref(),
            Some("198.51.100.1")
        );
    }

    #[test]
    fn peer_ip_is_the_fallback() {
        assert_eq!(
            client_key(&HeaderMap::new(), peer(), None).as_deref(),
            Some("192.0.2.9")
        );
    }

    #[test]
    fn mock_address_overrides_everything() {
        let headers = headers(&[(REMOTE_ADDR_HEADER, "203.0.113.1")]);
        assert_eq!(
            client_key(&headers, peer(), Some("127.0.0.1")).as_deref(),
            Some("127.0.0.1")
        );
    }

    #[test]
    fn no_source_means_no_key() {
        let headers = headers(&[(REMOTE_ADDR_HEADER, "  "), (FORWARDED_FOR_HEADER, ",")]);
        assert_eq!(client_key(&headers, None, None), None);
    }
}
