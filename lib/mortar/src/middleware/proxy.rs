use crate::http::request::HttpRequest;
use hashbrown::HashSet;
use std::net::IpAddr;

/// Which peers are believed when they forward client identity.
#[derive(Debug, Clone)]
pub enum TrustPolicy {
    /// Forwarding headers are ignored entirely.
    None,
    /// Every peer is believed.
    All,
    /// Only the listed addresses are believed.
    Addresses(HashSet<IpAddr>),
}

impl Default for TrustPolicy {
    fn default() -> TrustPolicy {
        TrustPolicy::None
    }
}

impl TrustPolicy {
    pub fn addresses<I: IntoIterator<Item = IpAddr>>(addrs: I) -> TrustPolicy {
        TrustPolicy::Addresses(addrs.into_iter().collect())
    }

    fn trusts(&self, ip: Option<IpAddr>) -> bool {
        match self {
            TrustPolicy::None => false,
            TrustPolicy::All => true,
            TrustPolicy::Addresses(set) => ip.map_or(false, |ip| set.contains(&ip)),
        }
    }
}

/// Derives the effective client identity from forwarding headers when the
/// immediate peer is trusted; otherwise the direct peer stands.
pub fn apply(request: &mut HttpRequest, policy: &TrustPolicy) {
    if !policy.trusts(request.peer.ip()) {
        return;
    }

    request.forwarded.client_ip = client_from_xff(request, policy)
        .or_else(|| client_from_forwarded(request, policy));

    request.forwarded.proto = request
        .header("x-forwarded-proto")
        .map(|value| first_item(value).to_ascii_lowercase());

    request.forwarded.host = request
        .header("x-forwarded-host")
        .map(|value| first_item(value).to_string());
}

fn first_item(value: &str) -> &str {
    value.split(',').next().unwrap_or("").trim()
}

/// Walks the `X-Forwarded-For` chain right to left, skipping hops the
/// policy trusts; the first untrusted entry is the client. A chain of only
/// trusted hops falls back to its leftmost entry.
fn client_from_xff(request: &HttpRequest, policy: &TrustPolicy) -> Option<IpAddr> {
    let header = request.header("x-forwarded-for")?;
    let mut chain = Vec::new();

    for item in header.split(',') {
        chain.push(item.trim().parse::<IpAddr>().ok()?);
    }

    pick_client(&chain, policy)
}

/// Minimal RFC 7239 `Forwarded` support: the `for=` pairs form the chain.
fn client_from_forwarded(request: &HttpRequest, policy: &TrustPolicy) -> Option<IpAddr> {
    let header = request.header("forwarded")?;
    let mut chain = Vec::new();

    for element in header.split(',') {
        for pair in element.split(';') {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next().unwrap_or("").trim();

            if !key.eq_ignore_ascii_case("for") {
                continue;
            }

            let value = parts.next().unwrap_or("").trim().trim_matches('"');
            let value = value.strip_prefix('[').unwrap_or(value);
            let value = match value.find(']') {
                Some(end) => &value[..end],
                None => match value.rfind(':') {
                    // v4:port, but a bare v6 keeps its colons.
                    Some(colon) if value[..colon].parse::<IpAddr>().is_ok() => &value[..colon],
                    _ => value,
                },
            };

            chain.push(value.parse::<IpAddr>().ok()?);
        }
    }

    pick_client(&chain, policy)
}

fn pick_client(chain: &[IpAddr], policy: &TrustPolicy) -> Option<IpAddr> {
    for ip in chain.iter().rev() {
        if !policy.trusts(Some(*ip)) {
            return Some(*ip);
        }
    }

    chain.first().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::limits::HttpLimits;
    use crate::http::request::Parser;
    use crate::net::addr::PeerAddress;
    use crate::net::buffer::Buffer;

    fn request_from(peer: &str, headers: &[(&str, &str)]) -> HttpRequest {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();

        for (name, value) in headers {
            raw.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }

        raw.extend_from_slice(b"\r\n");

        let mut buffer = Buffer::new(65536);
        buffer.append(&raw);

        let peer = PeerAddress::Inet(format!("{}:9", peer).parse().unwrap());

        Parser::new(HttpLimits::default())
            .advance(&mut buffer, &peer)
            .unwrap()
            .unwrap()
    }

    fn loopback_policy() -> TrustPolicy {
        TrustPolicy::addresses(vec!["127.0.0.1".parse().unwrap()])
    }

    #[test]
    fn test_trusted_peer_xff() {
        let mut request = request_from("127.0.0.1", &[("X-Forwarded-For", "203.0.113.42")]);

        apply(&mut request, &loopback_policy());

        assert_eq!(
            request.effective_ip(),
            Some("203.0.113.42".parse().unwrap())
        );
    }

    #[test]
    fn test_untrusted_peer_headers_ignored() {
        let mut request = request_from("198.51.100.7", &[("X-Forwarded-For", "203.0.113.42")]);

        apply(&mut request, &loopback_policy());

        assert_eq!(
            request.effective_ip(),
            Some("198.51.100.7".parse().unwrap())
        );
        assert!(request.forwarded.proto.is_none());
    }

    #[test]
    fn test_trusted_hops_are_stripped() {
        let mut request = request_from(
            "127.0.0.1",
            &[("X-Forwarded-For", "203.0.113.42, 127.0.0.1")],
        );

        apply(&mut request, &loopback_policy());

        assert_eq!(
            request.effective_ip(),
            Some("203.0.113.42".parse().unwrap())
        );
    }

    #[test]
    fn test_all_trusted_falls_back_to_leftmost() {
        let policy = TrustPolicy::All;
        let mut request = request_from("10.0.0.1", &[("X-Forwarded-For", "10.0.0.2, 10.0.0.3")]);

        apply(&mut request, &policy);

        assert_eq!(request.effective_ip(), Some("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_rfc7239_forwarded() {
        let mut request = request_from(
            "127.0.0.1",
            &[("Forwarded", "for=192.0.2.60;proto=http, for=127.0.0.1")],
        );

        apply(&mut request, &loopback_policy());

        assert_eq!(request.effective_ip(), Some("192.0.2.60".parse().unwrap()));
    }

    #[test]
    fn test_forwarded_quoted_v6() {
        let mut request = request_from(
            "127.0.0.1",
            &[("Forwarded", "for=\"[2001:db8::17]:4711\"")],
        );

        apply(&mut request, &loopback_policy());

        assert_eq!(
            request.effective_ip(),
            Some("2001:db8::17".parse().unwrap())
        );
    }

    #[test]
    fn test_proto_and_host() {
        let mut request = request_from(
            "127.0.0.1",
            &[
                ("X-Forwarded-Proto", "HTTPS"),
                ("X-Forwarded-Host", "edge.example.org"),
            ],
        );

        apply(&mut request, &loopback_policy());

        assert_eq!(request.forwarded.proto.as_deref(), Some("https"));
        assert_eq!(request.forwarded.host.as_deref(), Some("edge.example.org"));
    }

    #[test]
    fn test_malformed_chain_falls_back_to_peer() {
        let mut request = request_from("127.0.0.1", &[("X-Forwarded-For", "not-an-ip")]);

        apply(&mut request, &loopback_policy());

        assert_eq!(request.effective_ip(), Some("127.0.0.1".parse().unwrap()));
    }
}
