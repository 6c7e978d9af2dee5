//! Network-egress SSRF filter used to validate the sandbox's requested
//! network permissions and to guard any outbound URL the broker itself
//! might resolve.
//!
//! Grounded on the teacher's `utils/url_security` module, generalized with
//! the IP-encoding normalization and cloud-metadata string matches the
//! broker's sandbox-permission model requires.

use ipnet::Ipv6Net;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::errors::BrokerError;

/// Hostnames that are always blocked regardless of how they resolve.
const BLOCKED_HOSTNAMES: &[&str] = &[
    "localhost",
    "metadata.google.internal",
    "instance-data.ec2.internal",
];

/// Result of [`validate_url`].
#[derive(Debug, Clone)]
pub struct UrlValidation {
    pub allowed: bool,
    pub reason: Option<String>,
}

/// Result of [`validate_network_permissions`].
#[derive(Debug, Clone, Default)]
pub struct NetworkPermissionCheck {
    pub valid: bool,
    pub blocked_hosts: Vec<String>,
    pub warnings: Vec<String>,
}

/// Strip an optional port suffix. IPv6 addresses may be bracketed
/// (`[::1]:8080`); a trailing `:` followed by a 4-5 digit number in
/// 1000-65535 is treated as a port on a bare host. Internal `::` inside a
/// bracketed IPv6 literal is preserved.
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
        return host;
    }
    if let Some(idx) = host.rfind(':') {
        let port_str = &host[idx + 1..];
        if port_str.len() >= 4
            && port_str.len() <= 5
            && port_str.chars().all(|c| c.is_ascii_digit())
            && let Ok(port) = port_str.parse::<u32>()
            && (1000..=65535).contains(&port)
            // A bare IPv6 address (no brackets) has more than one ':' — only
            // strip the port when there's exactly one colon, i.e. this isn't
            // a raw IPv6 literal.
            && host[..idx].matches(':').count() == 0
        {
            return &host[..idx];
        }
    }
    host
}

/// Parse a decimal, hex, octal, dotted-octal, dotted-hex, or shorthand IPv4
/// encoding into a canonical [`Ipv4Addr`].
fn parse_ipv4_encodings(s: &str) -> Option<Ipv4Addr> {
    // Pure decimal integer (e.g. "2130706433").
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(n) = s.parse::<u32>() {
            return Some(Ipv4Addr::from(n));
        }
    }
    // Full hex (e.g. "0x7f000001").
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
        && !hex.contains('.')
        && let Ok(n) = u32::from_str_radix(hex, 16)
    {
        return Some(Ipv4Addr::from(n));
    }

    // Dotted forms: up to four dot-separated components, each possibly
    // decimal, hex (0x..), or octal (leading 0). Shorthand fills trailing
    // octets with zero when fewer than four components are given, except
    // the last component absorbs the remaining bit-width (standard BSD
    // `inet_aton` shorthand: `a.b`, `a.b.c`, `a`).
    let parts: Vec<&str> = s.split('.').collect();
    if parts.is_empty() || parts.len() > 4 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    let mut values = Vec::with_capacity(parts.len());
    for part in &parts {
        let v = parse_component(part)?;
        values.push(v);
    }
    match values.len() {
        1 => Some(Ipv4Addr::from(values[0])),
        2 => {
            if values[0] > 0xff || values[1] > 0x00ff_ffff {
                return None;
            }
            Some(Ipv4Addr::from((values[0] << 24) | values[1]))
        }
        3 => {
            if values[0] > 0xff || values[1] > 0xff || values[2] > 0xffff {
                return None;
            }
            Some(Ipv4Addr::from(
                (values[0] << 24) | (values[1] << 16) | values[2],
            ))
        }
        4 => {
            if values.iter().any(|&v| v > 0xff) {
                return None;
            }
            Some(Ipv4Addr::new(
                values[0] as u8,
                values[1] as u8,
                values[2] as u8,
                values[3] as u8,
            ))
        }
        _ => None,
    }
}

fn parse_component(part: &str) -> Option<u32> {
    if let Some(hex) = part.strip_prefix("0x").or_else(|| part.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).ok();
    }
    if part.len() > 1 && part.starts_with('0') && part.chars().all(|c| c.is_ascii_digit()) {
        return u32::from_str_radix(part, 8).ok();
    }
    part.parse::<u32>().ok()
}

/// Classify an already-resolved IP address as blocked or not.
fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => is_blocked_ipv6(v6),
    }
}

fn is_blocked_ipv4(v4: Ipv4Addr) -> bool {
    const METADATA: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);
    const METADATA_ALT: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 253);

    if v4 == METADATA || v4 == METADATA_ALT {
        return true;
    }
    v4.is_loopback()
        || v4.is_private()
        || v4.is_link_local()
        || v4.is_broadcast()
        || v4.is_unspecified()
        || v4.octets()[0] == 0
}

fn is_blocked_ipv6(v6: Ipv6Addr) -> bool {
    const METADATA_V6: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0x6563, 0x0254); // fd00:ec2::254

    if v6 == METADATA_V6 || v6.is_loopback() || v6.is_unspecified() {
        return true;
    }
    if let Some(mapped) = v6.to_ipv4_mapped() {
        return is_blocked_ipv4(mapped);
    }

    let segments = v6.segments();
    // fe80::/10 link-local
    if segments[0] & 0xffc0 == 0xfe80 {
        return true;
    }
    // fc00::/7 unique-local
    if segments[0] & 0xfe00 == 0xfc00 {
        return true;
    }
    // ff00::/8 multicast
    if (segments[0] >> 8) == 0xff {
        return true;
    }
    // Teredo: 2001:0::/32
    if let Ok(net) = "2001::/32".parse::<Ipv6Net>()
        && net.contains(&v6)
    {
        return true;
    }
    // 6to4: 2002::/16
    if let Ok(net) = "2002::/16".parse::<Ipv6Net>()
        && net.contains(&v6)
    {
        return true;
    }
    // Documentation range: 2001:db8::/32
    if let Ok(net) = "2001:db8::/32".parse::<Ipv6Net>()
        && net.contains(&v6)
    {
        return true;
    }
    false
}

/// An unbracketed `::ffff:a.b.c.d` IPv4-mapped literal optionally followed
/// by `:port` is syntactically ambiguous (the port delimiter looks just
/// like another address colon), but callers are expected to pass it anyway.
/// Recognize the `::ffff:` prefix explicitly and peel off a trailing port
/// before falling back to generic parsing.
fn try_ipv4_mapped_with_optional_port(host: &str) -> Option<Ipv6Addr> {
    let rest = host.strip_prefix("::ffff:")?;
    let candidate = match rest.matches(':').count() {
        0 => rest,
        1 => rest.split(':').next()?,
        _ => return None,
    };
    let v4: Ipv4Addr = candidate.parse().ok()?;
    Some(v4.to_ipv6_mapped())
}

/// Check whether a bare host string (no scheme, optional port) resolves to
/// a blocked destination. Never throws; syntactically odd hosts that can't
/// be classified as an IP are treated as domains and matched by string.
pub fn is_blocked_host(host: &str) -> bool {
    let lower_raw = host.to_ascii_lowercase();
    if let Some(v6) = try_ipv4_mapped_with_optional_port(&lower_raw) {
        return is_blocked_ipv6(v6);
    }

    let stripped = strip_port(host);
    let lower = stripped.to_ascii_lowercase();

    if BLOCKED_HOSTNAMES.contains(&lower.as_str()) {
        return true;
    }

    if let Ok(ip) = lower.parse::<IpAddr>() {
        return is_blocked_ip(ip);
    }
    if let Some(v4) = parse_ipv4_encodings(&lower) {
        return is_blocked_ipv4(v4);
    }
    false
}

/// Validate a full URL string. Fails with `InvalidInput` for syntactically
/// bad URLs or non-http(s) schemes; otherwise never throws.
pub fn validate_url(url_str: &str) -> Result<UrlValidation, BrokerError> {
    let parsed = url::Url::parse(url_str)
        .map_err(|e| BrokerError::InvalidInput(format!("invalid URL '{url_str}': {e}")))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(BrokerError::InvalidInput(format!(
            "only http/https allowed, got '{}'",
            parsed.scheme()
        )));
    }

    let Some(host) = parsed.host_str() else {
        return Err(BrokerError::InvalidInput(format!(
            "URL '{url_str}' has no host"
        )));
    };

    if is_blocked_host(host) {
        return Ok(UrlValidation {
            allowed: false,
            reason: Some(format!("host '{host}' resolves to a blocked destination")),
        });
    }
    Ok(UrlValidation {
        allowed: true,
        reason: None,
    })
}

/// Validate the set of hosts a sandbox execution asked for network
/// permission to reach. `localhost`/`127.0.0.1` are stripped before
/// evaluation — the proxy itself listens on loopback, and denying the
/// sandbox access to it would break tool calls.
pub fn validate_network_permissions(hosts: &[String]) -> NetworkPermissionCheck {
    let mut blocked = Vec::new();
    let mut warnings = Vec::new();

    for host in hosts {
        let stripped = strip_port(host).to_ascii_lowercase();
        if stripped == "localhost" || stripped == "127.0.0.1" {
            continue;
        }
        if is_blocked_host(host) {
            blocked.push(host.clone());
        } else if host.parse::<IpAddr>().is_err() && parse_ipv4_encodings(&stripped).is_none() {
            // Domain names can't be fully verified without a live DNS
            // resolution; flag for operator awareness without blocking.
            warnings.push(format!("host '{host}' allowed based on name only"));
        }
    }

    NetworkPermissionCheck {
        valid: blocked.is_empty(),
        blocked_hosts: blocked,
        warnings,
    }
}
