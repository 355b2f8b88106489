//! Shared normalizer + fingerprint used by both sides of every drift check
//! (C3's dirty-flag hook and C9's audits must agree, spec.md §9).

use sha2::{Digest, Sha256};

/// CRLF → LF, then trim surrounding whitespace. No other per-line
/// transformation (spec.md §9's resolved Open Question on trailing
/// newlines: one normalizer, applied identically on both sides).
pub fn normalize(content: &str) -> String {
    content.replace("\r\n", "\n").trim().to_string()
}

/// Lower-hex SHA-256 of the normalized content.
pub fn fingerprint(content: &str) -> String {
    let normalized = normalize(content);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_converts_crlf_and_trims() {
        assert_eq!(normalize("\r\nfoo\r\nbar\r\n"), "foo\nbar");
    }

    #[test]
    fn fingerprint_is_stable_across_line_ending_style() {
        let a = fingerprint("foo\nbar\n");
        let b = fingerprint("foo\r\nbar\r\n");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_changes_on_content_change() {
        assert_ne!(fingerprint("foo\n"), fingerprint("foo \n"));
    }

    #[test]
    fn fingerprint_is_64_hex_chars() {
        let f = fingerprint("anything");
        assert_eq!(f.len(), 64);
        assert!(f.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
