//! C1: parse/render a single `authorized_keys` line, and parse the
//! managed-block header line's serial.

use regex::Regex;
use failure::ResultExt;

use crate::error::ErrorKind;
use crate::Result;

/// The three fields of a single authorized_keys line, with any leading
/// SSH "options" string (e.g. `command="..."`) stripped off first by the
/// caller that needs it (C2's restricted system-key line builds its own
/// options prefix; C1 only ever sees `<alg> <key-data> <comment?>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKeyLine {
    pub algorithm: String,
    pub key_data: String,
    pub comment: String,
}

/// Parse a single non-empty, non-comment authorized_keys line.
///
/// Empty lines and `#`-prefixed lines are comments and are rejected here;
/// callers are expected to filter them out beforehand (spec.md §4.C1).
/// Fails when fewer than two whitespace-separated fields remain after
/// trimming. The comment is whatever text follows the second field; an
/// empty comment is only a failure when the caller requires one (the
/// `require_comment` flag), matching spec.md's "comment required by the
/// caller" wording.
pub fn parse(line: &str, require_comment: bool) -> Result<ParsedKeyLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Err(ErrorKind::ErrOther(format!("line is a comment or empty: {:?}", line)).into());
    }

    let mut fields = trimmed.splitn(3, char::is_whitespace);
    let algorithm = fields.next().unwrap_or("");
    let rest = trimmed[algorithm.len()..].trim_start();
    let mut rest_fields = rest.splitn(2, char::is_whitespace);
    let key_data = rest_fields.next().unwrap_or("");
    let comment = rest_fields.next().unwrap_or("").trim();

    if algorithm.is_empty() || key_data.is_empty() {
        return Err(ErrorKind::ErrOther(format!("not enough fields in line: {:?}", line)).into());
    }
    if require_comment && comment.is_empty() {
        return Err(ErrorKind::ErrOther(format!("missing comment in line: {:?}", line)).into());
    }

    Ok(ParsedKeyLine {
        algorithm: algorithm.to_string(),
        key_data: key_data.to_string(),
        comment: comment.to_string(),
    })
}

/// Render `(algorithm, key_data, comment)` back into authorized_keys form.
/// Two-field form (no trailing comment) when `comment` is empty.
pub fn render(algorithm: &str, key_data: &str, comment: &str) -> String {
    if comment.is_empty() {
        format!("{} {}", algorithm, key_data)
    } else {
        format!("{} {} {}", algorithm, key_data, comment)
    }
}

/// Extract `N` from a line matching
/// `# Keymaster Managed Keys (Serial: N)`; fails otherwise.
pub fn parse_serial(header: &str) -> Result<i64> {
    let re = Regex::new(r"^#\s*Keymaster Managed Keys \(Serial:\s*(\d+)\)\s*$")
        .expect("static header regex must compile");
    let caps = re.captures(header.trim())
        .ok_or_else(|| ErrorKind::ErrOther(format!("not a Keymaster header line: {:?}", header)))?;
    caps[1].parse::<i64>()
        .context(ErrorKind::ErrOther(format!("malformed serial in header: {:?}", header)))
        .map_err(Into::into)
}

/// Render the managed-block header line (including trailing newline).
pub fn render_header(serial: i64) -> String {
    format!("# Keymaster Managed Keys (Serial: {})\n", serial)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_field_line() {
        let p = parse("ssh-ed25519 AAAAC3 alice@laptop", true).unwrap();
        assert_eq!(p.algorithm, "ssh-ed25519");
        assert_eq!(p.key_data, "AAAAC3");
        assert_eq!(p.comment, "alice@laptop");
    }

    #[test]
    fn parses_two_field_line_without_comment_when_not_required() {
        let p = parse("ssh-ed25519 AAAAC3", false).unwrap();
        assert_eq!(p.comment, "");
    }

    #[test]
    fn rejects_two_field_line_when_comment_required() {
        assert!(parse("ssh-ed25519 AAAAC3", true).is_err());
    }

    #[test]
    fn rejects_comment_and_empty_lines() {
        assert!(parse("", true).is_err());
        assert!(parse("   ", true).is_err());
        assert!(parse("# a comment", true).is_err());
    }

    #[test]
    fn rejects_single_field_line() {
        assert!(parse("ssh-ed25519", false).is_err());
    }

    #[test]
    fn render_round_trips() {
        let line = render("ssh-ed25519", "AAAAC3", "alice@laptop");
        let parsed = parse(&line, true).unwrap();
        assert_eq!(parsed.algorithm, "ssh-ed25519");
        assert_eq!(parsed.key_data, "AAAAC3");
        assert_eq!(parsed.comment, "alice@laptop");
    }

    #[test]
    fn render_omits_comment_field_when_empty() {
        assert_eq!(render("ssh-ed25519", "AAAAC3", ""), "ssh-ed25519 AAAAC3");
    }

    #[test]
    fn parses_serial_header() {
        assert_eq!(parse_serial("# Keymaster Managed Keys (Serial: 7)").unwrap(), 7);
    }

    #[test]
    fn rejects_non_header_line() {
        assert!(parse_serial("ssh-ed25519 AAAAC3 alice").is_err());
        assert!(parse_serial("# Keymaster Managed Keys (Serial: abc)").is_err());
    }

    #[test]
    fn header_round_trips_serial() {
        let header = render_header(42);
        assert_eq!(parse_serial(header.trim_end()).unwrap(), 42);
    }
}
