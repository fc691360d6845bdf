//! Federation peer authentication middleware.
//!
//! Federation endpoints authenticate with `Authorization: Bearer
//! <share-token>`. After the token resolves to a share, the share's IP
//! allow-list is applied to the effective client address: the last
//! untrusted hop of `X-Forwarded-For` when the socket peer is a trusted
//! proxy, otherwise the socket peer itself. A non-empty allow-list with
//! no match answers `{code:403, msg:"IP not allowed"}` without running
//! the handler.

use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use ipnet::IpNet;

use crate::api::dto::R;
use crate::api::SharedState;
use crate::models::peer_share::PeerShare;

/// Extension carrying the share resolved from the Bearer token.
#[derive(Debug, Clone)]
pub struct ShareExtension(pub PeerShare);

/// Federation authentication middleware.
pub async fn peer_auth_middleware(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or("");

    if token.is_empty() {
        return R::err(401, "Invalid or expired token").into_response();
    }

    let share = match PeerShare::by_token(&state.db, token).await {
        Ok(Some(share)) => share,
        Ok(None) => return R::err(401, "Invalid or expired token").into_response(),
        Err(err) => return err.into_response(),
    };

    if !share.allowed_ips.trim().is_empty() {
        let remote = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip());
        let xff = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok());

        let trusted = parse_trusted_proxies(&state.config.trusted_proxies);
        let effective = remote.map(|ip| effective_client_ip(ip, xff, &trusted));

        let allowed = effective
            .map(|ip| ip_allowed(ip, &share.allowed_ips))
            .unwrap_or(false);
        if !allowed {
            tracing::warn!(
                share_id = share.id,
                remote = ?remote,
                "federation request blocked by IP allow-list"
            );
            return R::err(403, "IP not allowed").into_response();
        }
    }

    request.extensions_mut().insert(ShareExtension(share));
    next.run(request).await
}

/// Parse the configured trusted-proxy list; bare IPs become host-length
/// networks, unparseable entries are dropped.
pub fn parse_trusted_proxies(raw: &str) -> Vec<IpNet> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|entry| {
            entry
                .parse::<IpNet>()
                .ok()
                .or_else(|| entry.parse::<IpAddr>().ok().map(IpNet::from))
        })
        .collect()
}

fn is_trusted(ip: IpAddr, trusted: &[IpNet]) -> bool {
    trusted.iter().any(|net| net.contains(&ip))
}

/// Resolve the effective client address.
///
/// When the socket peer is a trusted proxy, walk `X-Forwarded-For` from
/// the right and return the first untrusted hop (the last address an
/// untrusted party could have set). A chain of only trusted hops falls
/// back to its leftmost entry; no usable header falls back to the
/// socket peer.
pub fn effective_client_ip(remote: IpAddr, xff: Option<&str>, trusted: &[IpNet]) -> IpAddr {
    if !is_trusted(remote, trusted) {
        return remote;
    }

    let Some(xff) = xff else {
        return remote;
    };

    let hops: Vec<IpAddr> = xff
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect();
    if hops.is_empty() {
        return remote;
    }

    for &hop in hops.iter().rev() {
        if !is_trusted(hop, trusted) {
            return hop;
        }
    }
    hops[0]
}

/// Match an address against a comma-separated exact-IP/CIDR allow-list.
/// An empty list allows everything.
pub fn ip_allowed(ip: IpAddr, allow_list: &str) -> bool {
    let mut empty = true;
    for entry in allow_list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        empty = false;

        if let Ok(exact) = entry.parse::<IpAddr>() {
            if exact == ip {
                return true;
            }
            continue;
        }
        if let Ok(net) = entry.parse::<IpNet>() {
            if net.contains(&ip) {
                return true;
            }
        }
    }
    empty
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn default_trusted() -> Vec<IpNet> {
        parse_trusted_proxies("10.0.0.0/8,172.16.0.0/12,192.168.0.0/16,127.0.0.0/8,::1/128")
    }

    // -----------------------------------------------------------------------
    // parse_trusted_proxies
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_trusted_proxies_mixed_entries() {
        let nets = parse_trusted_proxies("10.0.0.0/8, 203.0.113.9, garbage,");
        assert_eq!(nets.len(), 2);
        assert!(is_trusted(ip("10.1.2.3"), &nets));
        assert!(is_trusted(ip("203.0.113.9"), &nets));
        assert!(!is_trusted(ip("203.0.113.10"), &nets));
    }

    // -----------------------------------------------------------------------
    // effective_client_ip
    // -----------------------------------------------------------------------

    #[test]
    fn test_untrusted_remote_ignores_xff() {
        let effective = effective_client_ip(
            ip("203.0.113.99"),
            Some("198.51.100.20, 172.20.0.3"),
            &default_trusted(),
        );
        assert_eq!(effective, ip("203.0.113.99"));
    }

    #[test]
    fn test_trusted_proxy_resolves_last_untrusted_hop() {
        let effective = effective_client_ip(
            ip("172.20.0.3"),
            Some("198.51.100.20, 172.20.0.3"),
            &default_trusted(),
        );
        assert_eq!(effective, ip("198.51.100.20"));
    }

    #[test]
    fn test_spoofed_prefix_is_skipped() {
        // The client-controlled leftmost entry must not win over the
        // rightmost untrusted hop.
        let effective = effective_client_ip(
            ip("10.0.0.2"),
            Some("1.2.3.4, 198.51.100.7, 10.0.0.5"),
            &default_trusted(),
        );
        assert_eq!(effective, ip("198.51.100.7"));
    }

    #[test]
    fn test_all_trusted_chain_falls_back_to_leftmost() {
        let effective = effective_client_ip(
            ip("10.0.0.2"),
            Some("10.0.0.7, 10.0.0.5"),
            &default_trusted(),
        );
        assert_eq!(effective, ip("10.0.0.7"));
    }

    #[test]
    fn test_missing_or_garbage_xff_falls_back_to_remote() {
        assert_eq!(
            effective_client_ip(ip("10.0.0.2"), None, &default_trusted()),
            ip("10.0.0.2")
        );
        assert_eq!(
            effective_client_ip(ip("10.0.0.2"), Some("not, an, ip"), &default_trusted()),
            ip("10.0.0.2")
        );
    }

    // -----------------------------------------------------------------------
    // ip_allowed
    // -----------------------------------------------------------------------

    #[test]
    fn test_exact_ip_match() {
        assert!(ip_allowed(ip("203.0.113.10"), "203.0.113.10"));
        assert!(!ip_allowed(ip("203.0.113.99"), "203.0.113.10"));
    }

    #[test]
    fn test_cidr_match() {
        assert!(ip_allowed(ip("203.0.113.11"), "203.0.113.0/24"));
        assert!(!ip_allowed(ip("203.0.114.11"), "203.0.113.0/24"));
    }

    #[test]
    fn test_v6_entries() {
        assert!(ip_allowed(ip("2001:db8::7"), "2001:db8::/64"));
        assert!(ip_allowed(ip("2001:db8::1"), "2001:db8::1"));
        assert!(!ip_allowed(ip("2001:db9::1"), "2001:db8::/64"));
    }

    #[test]
    fn test_empty_list_allows_everything() {
        assert!(ip_allowed(ip("203.0.113.10"), ""));
        assert!(ip_allowed(ip("203.0.113.10"), " , "));
    }

    #[test]
    fn test_multiple_entries_any_match_wins() {
        let list = "198.51.100.20, 203.0.113.0/24";
        assert!(ip_allowed(ip("198.51.100.20"), list));
        assert!(ip_allowed(ip("203.0.113.5"), list));
        assert!(!ip_allowed(ip("192.0.2.1"), list));
    }
}
