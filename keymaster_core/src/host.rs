//! C4: pure host-endpoint string normalization. Used wherever a hostname
//! crosses a boundary: known-hosts storage key, SSH dial target, log
//! display (spec.md §4.C4).

const DEFAULT_PORT: &str = "22";

/// Strip a leading `user@`, if present.
fn strip_user_prefix(s: &str) -> &str {
    match s.find('@') {
        Some(idx) => &s[idx + 1..],
        None => s,
    }
}

/// Strip `[` `]` brackets around an IPv6 address iff both are present.
pub fn strip_ipv6_brackets(s: &str) -> &str {
    if s.starts_with('[') && s.ends_with(']') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn is_bare_ipv6(s: &str) -> bool {
    !s.starts_with('[') && s.matches(':').count() > 1
}

/// Parse into `(host, port)`; port is empty when not present. Accepts
/// IPv6 both bracketed (`[::1]:22`) and unbracketed (`::1`, with no port).
pub fn parse_host_port(input: &str) -> (String, String) {
    let s = strip_user_prefix(input.trim());

    if s.starts_with('[') {
        // [addr]:port or [addr]
        if let Some(close) = s.find(']') {
            let addr = &s[1..close];
            let after = &s[close + 1..];
            let port = after.strip_prefix(':').unwrap_or("");
            return (addr.to_string(), port.to_string());
        }
        return (s.trim_matches(|c| c == '[' || c == ']').to_string(), String::new());
    }

    if is_bare_ipv6(s) {
        // Bare IPv6 with no bracket can't carry a port unambiguously.
        return (s.to_string(), String::new());
    }

    // host or host:port (IPv4 or hostname)
    match s.rfind(':') {
        Some(idx) => (s[..idx].to_string(), s[idx + 1..].to_string()),
        None => (s.to_string(), String::new()),
    }
}

/// Canonicalize a host string to `host:port` form, bracketing IPv6
/// addresses. Rules (spec.md §4.C4):
/// - strip leading `user@`
/// - bare hostname/IPv4 ⇒ append `:22`
/// - bare IPv6 (multiple `:`, no `[`) ⇒ wrap as `[addr]:22`
/// - pre-bracketed `[addr]:port` ⇒ unchanged
/// - `host:port` ⇒ unchanged
pub fn canonicalize_host_port(input: &str) -> String {
    let s = strip_user_prefix(input.trim());

    if s.starts_with('[') {
        if s.contains("]:") {
            return s.to_string();
        }
        // [addr] with no port
        let addr = strip_ipv6_brackets(s);
        return format!("[{}]:{}", addr, DEFAULT_PORT);
    }

    if is_bare_ipv6(s) {
        return format!("[{}]:{}", s, DEFAULT_PORT);
    }

    if s.rfind(':').is_some() {
        // host:port (IPv4 or hostname with exactly one colon)
        return s.to_string();
    }

    format!("{}:{}", s, DEFAULT_PORT)
}
