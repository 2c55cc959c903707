//! File-backed known-hosts store behaviour.

use ferrule_proto::ssh::{Ed25519HostKey, Error, KnownHostsStore, PublicKey, TrustDecision};
use proptest::prelude::*;
use std::sync::Arc;

fn key(seed: u8) -> PublicKey {
    Ed25519HostKey::from_bytes(&[seed; 32]).unwrap().public_key()
}

#[test]
fn test_first_use_then_match() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ssh").join("known_hosts");
    let store = KnownHostsStore::open(&path);
    let server = key(1);

    assert_eq!(store.classify("localhost", 22, &server), TrustDecision::NotFound);
    store.trust("localhost", 22, &server).unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content, format!("localhost {}\n", server.to_openssh()));
    assert_eq!(
        store.classify("localhost", 22, &server),
        TrustDecision::Match { line: 1 }
    );

    // A second process opening the same file sees the entry.
    let reopened = KnownHostsStore::open(&path);
    assert!(reopened.classify("LOCALHOST", 22, &server).is_match());
    assert_eq!(reopened.classify("localhost", 2222, &server), TrustDecision::NotFound);
}

#[test]
fn test_non_default_port_uses_brackets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("known_hosts");
    let store = KnownHostsStore::open(&path);

    store.trust("build.internal", 2222, &key(2)).unwrap();
    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.starts_with("[build.internal]:2222 ssh-ed25519 "));
}

#[test]
fn test_external_edits_are_seen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("known_hosts");
    let store = KnownHostsStore::open(&path);
    store.trust("a.example", 22, &key(3)).unwrap();

    // Someone replaces the key behind our back.
    std::fs::write(&path, format!("# rotated\na.example {}\n", key(4).to_openssh())).unwrap();
    assert!(matches!(
        store.classify("a.example", 22, &key(3)),
        TrustDecision::Mismatch { line: 2, .. }
    ));
}

#[test]
fn test_append_fixes_missing_newline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("known_hosts");
    std::fs::write(&path, format!("old.example {}", key(5).to_openssh())).unwrap();

    let store = KnownHostsStore::open(&path);
    store.trust("new.example", 22, &key(6)).unwrap();

    let entries = store.entries().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(store.classify("old.example", 22, &key(5)).is_match());
    assert!(store.classify("new.example", 22, &key(6)).is_match());
}

#[test]
fn test_trust_refuses_to_replace() {
    let dir = tempfile::tempdir().unwrap();
    let store = KnownHostsStore::open(dir.path().join("known_hosts"));
    store.trust("host", 22, &key(7)).unwrap();

    let err = store.trust("host", 22, &key(8)).unwrap_err();
    assert!(matches!(err, Error::Trust(_)));

    assert_eq!(store.revoke("host", 22, "ssh-ed25519").unwrap(), 1);
    store.trust("host", 22, &key(8)).unwrap();
    assert!(store.classify("host", 22, &key(8)).is_match());
    assert_eq!(store.entries().unwrap().len(), 1);
}

#[test]
fn test_revoke_keeps_other_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("known_hosts");
    std::fs::write(
        &path,
        format!(
            "# managed by ops\nkeep.example {}\ndrop.example {}\n",
            key(9).to_openssh(),
            key(10).to_openssh()
        ),
    )
    .unwrap();

    let store = KnownHostsStore::open(&path);
    assert_eq!(store.revoke("drop.example", 22, "ssh-ed25519").unwrap(), 1);
    assert_eq!(store.revoke("drop.example", 22, "ssh-ed25519").unwrap(), 0);

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.starts_with("# managed by ops\nkeep.example "));
    assert!(!content.contains("drop.example"));
}

#[test]
fn test_hashed_entries_hide_hostname() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("known_hosts");
    let store = KnownHostsStore::open(&path).hash_hostnames(true);

    store.trust("secret.example", 22, &key(11)).unwrap();
    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.starts_with("|1|"));
    assert!(!content.contains("secret.example"));

    assert!(store.classify("secret.example", 22, &key(11)).is_match());
    assert_eq!(store.classify("other.example", 22, &key(11)), TrustDecision::NotFound);
}

#[test]
fn test_unreadable_store_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    // A directory where the file should be.
    let store = KnownHostsStore::open(dir.path());
    assert!(matches!(
        store.classify("host", 22, &key(12)),
        TrustDecision::Error(_)
    ));
}

#[test]
fn test_concurrent_trust_writes_whole_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("known_hosts");
    let store = Arc::new(KnownHostsStore::open(&path));

    let handles: Vec<_> = (0..8u8)
        .map(|i| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                store
                    .trust(&format!("host{}.example", i), 22, &key(20 + i))
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let entries = store.entries().unwrap();
    assert_eq!(entries.len(), 8);
    for i in 0..8u8 {
        assert!(store
            .classify(&format!("host{}.example", i), 22, &key(20 + i))
            .is_match());
    }
}

proptest! {
    #[test]
    fn prop_classify_never_modifies(host in "[a-z]{1,12}(\\.[a-z]{2,6})?", port in 1u16..) {
        let store = KnownHostsStore::from_content(&format!(
            "known.example {}\n[other.example]:2222 {}\n",
            key(30).to_openssh(),
            key(31).to_openssh()
        ));
        let before = store.entries().unwrap();

        let first = store.classify(&host, port, &key(32));
        let second = store.classify(&host, port, &key(32));
        prop_assert_eq!(first, second);
        prop_assert_eq!(store.entries().unwrap(), before);
    }

    #[test]
    fn prop_trusted_key_matches(host in "[a-z][a-z0-9-]{0,20}", port in 1u16..) {
        let store = KnownHostsStore::in_memory();
        store.trust(&host, port, &key(33)).unwrap();
        prop_assert!(store.classify(&host, port, &key(33)).is_match());
        let is_mismatch = matches!(
            store.classify(&host, port, &key(34)),
            TrustDecision::Mismatch { .. }
        );
        prop_assert!(is_mismatch);
    }
}
