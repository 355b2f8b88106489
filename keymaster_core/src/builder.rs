//! C2: pure, deterministic renderer of the managed `authorized_keys`
//! block (spec.md §4.C2/§6).

use std::collections::BTreeMap;
use chrono::{DateTime, Utc};

use crate::error::ErrorKind;
use crate::model::{PublicKey, SystemKey};
use crate::Result;

/// The restrictions on the system-key line are mandatory: they are what
/// keeps the system key from being usable for anything beyond `sftp`
/// (spec.md §4.C2 rule 2).
const SYSTEM_KEY_RESTRICTIONS: &str =
    "command=\"internal-sftp\",no-port-forwarding,no-x11-forwarding,no-agent-forwarding,no-pty";

/// Union-merge `global` and `account` keys by id (later duplicates
/// overwrite earlier; account keys override global keys sharing an id),
/// filtering out anything expired as of `now`.
fn merge_and_filter<'a>(
    global: &'a [PublicKey],
    account: &'a [PublicKey],
    now: DateTime<Utc>,
) -> BTreeMap<i64, &'a PublicKey> {
    let mut merged: BTreeMap<i64, &PublicKey> = BTreeMap::new();
    for k in global.iter().chain(account.iter()) {
        if !k.is_expired_at(now) {
            merged.insert(k.id, k);
        } else {
            merged.remove(&k.id);
        }
    }
    merged
}

/// Build the canonical managed `authorized_keys` content.
///
/// `system_key` must be present or this fails with `ErrBuildRejected`
/// (spec.md §4.C2 rule 6). The merged key set is sorted by comment
/// (lexicographic, stable) before rendering, so output is independent of
/// input ordering (testable property #2 in spec.md §8).
pub fn build(
    system_key: Option<&SystemKey>,
    global_keys: &[PublicKey],
    account_keys: &[PublicKey],
    now: DateTime<Utc>,
) -> Result<String> {
    let system_key = system_key.ok_or_else(|| {
        ErrorKind::ErrBuildRejected("no system key provided".to_string())
    })?;

    let merged = merge_and_filter(global_keys, account_keys, now);

    let mut out = String::new();
    out.push_str(&crate::keys::render_header(system_key.serial));
    out.push_str(&format!("{} {}\n", SYSTEM_KEY_RESTRICTIONS, system_key.public_key));

    if !merged.is_empty() {
        let mut lines: Vec<&PublicKey> = merged.into_values().collect();
        lines.sort_by(|a, b| a.comment.cmp(&b.comment));

        out.push('\n');
        out.push_str("# User Keys\n");
        for k in lines {
            out.push_str(&k.authorized_line());
            out.push('\n');
        }
    }

    Ok(out)
}

/// Same as [`build`] but excludes a caller-chosen set of key ids from the
/// rendered user-keys section, used by C10's selective decommission to
/// re-render the managed block minus the keys being stripped.
pub fn build_selective(
    system_key: Option<&SystemKey>,
    global_keys: &[PublicKey],
    account_keys: &[PublicKey],
    excluded_ids: &[i64],
    now: DateTime<Utc>,
) -> Result<String> {
    let filtered_global: Vec<PublicKey> = global_keys
        .iter()
        .filter(|k| !excluded_ids.contains(&k.id))
        .cloned()
        .collect();
    let filtered_account: Vec<PublicKey> = account_keys
        .iter()
        .filter(|k| !excluded_ids.contains(&k.id))
        .cloned()
        .collect();
    build(system_key, &filtered_global, &filtered_account, now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sys() -> SystemKey {
        SystemKey {
            serial: 1,
            public_key: "ssh-ed25519 SYSPUB sys".to_string(),
            private_key: "irrelevant".to_string(),
            is_active: true,
        }
    }

    fn key(id: i64, comment: &str) -> PublicKey {
        PublicKey {
            id,
            algorithm: "ssh-ed25519".to_string(),
            key_data: format!("DATA{}", id),
            comment: comment.to_string(),
            is_global: false,
            expires_at: None,
        }
    }

    #[test]
    fn header_is_first_line() {
        let out = build(Some(&sys()), &[], &[], Utc::now()).unwrap();
        assert!(out.starts_with("# Keymaster Managed Keys (Serial: 1)\n"));
    }

    #[test]
    fn no_system_key_is_rejected() {
        assert!(build(None, &[], &[], Utc::now()).is_err());
    }

    #[test]
    fn omits_user_keys_section_when_empty() {
        let out = build(Some(&sys()), &[], &[], Utc::now()).unwrap();
        assert!(!out.contains("# User Keys"));
    }

    #[test]
    fn sorts_user_keys_by_comment() {
        let globals = vec![key(1, "zed"), key(2, "alice")];
        let out = build(Some(&sys()), &globals, &[], Utc::now()).unwrap();
        let alice_pos = out.find("alice").unwrap();
        let zed_pos = out.find("zed").unwrap();
        assert!(alice_pos < zed_pos);
    }

    #[test]
    fn determinism_regardless_of_input_order() {
        let g1 = vec![key(1, "a"), key(2, "b")];
        let g2 = vec![key(2, "b"), key(1, "a")];
        let now = Utc::now();
        assert_eq!(
            build(Some(&sys()), &g1, &[], now).unwrap(),
            build(Some(&sys()), &g2, &[], now).unwrap()
        );
    }

    #[test]
    fn account_key_overrides_global_of_same_id() {
        let mut overridden = key(1, "alice-account");
        overridden.key_data = "OVERRIDDEN".to_string();
        let globals = vec![key(1, "alice-global")];
        let accounts = vec![overridden];
        let out = build(Some(&sys()), &globals, &accounts, Utc::now()).unwrap();
        assert!(out.contains("alice-account"));
        assert!(!out.contains("alice-global"));
    }

    #[test]
    fn expired_keys_are_excluded() {
        let mut expired = key(1, "alice");
        expired.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        let out = build(Some(&sys()), &[expired], &[], Utc::now()).unwrap();
        assert!(!out.contains("alice"));
    }

    #[test]
    fn now_itself_counts_as_expired() {
        let now = Utc::now();
        let mut expiring_now = key(1, "alice");
        expiring_now.expires_at = Some(now);
        let out = build(Some(&sys()), &[expiring_now], &[], now).unwrap();
        assert!(!out.contains("alice"));
    }

    #[test]
    fn system_key_line_carries_mandatory_restrictions() {
        let out = build(Some(&sys()), &[], &[], Utc::now()).unwrap();
        assert!(out.contains("command=\"internal-sftp\",no-port-forwarding,no-x11-forwarding,no-agent-forwarding,no-pty ssh-ed25519 SYSPUB sys"));
    }

    #[test]
    fn header_round_trips_via_parse_serial() {
        let out = build(Some(&sys()), &[], &[], Utc::now()).unwrap();
        let first_line = out.lines().next().unwrap();
        assert_eq!(crate::keys::parse_serial(first_line).unwrap(), 1);
    }

    #[test]
    fn selective_build_excludes_chosen_ids() {
        let accounts = vec![key(1, "a"), key(2, "b")];
        let out = build_selective(Some(&sys()), &[], &accounts, &[1], Utc::now()).unwrap();
        assert!(!out.contains("DATA1"));
        assert!(out.contains("DATA2"));
    }
}
