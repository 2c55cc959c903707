//! Known-hosts trust store (OpenSSH format).
//!
//! # Format
//!
//! Each line in a known_hosts file has the format:
//! ```text
//! [hostnames] keytype base64-key [comment]
//! ```
//!
//! Hostnames can be:
//! - Standard: `example.com` or `[example.com]:2222`
//! - Hashed: `|1|salt|hash` (HMAC-SHA1 hashed hostname)
//! - Wildcard: `*.example.com`
//! - Multiple: `host1,host2,host3`
//! - Negated: `*.example.com,!bad.example.com`
//!
//! `@cert-authority` and `@revoked` lines are skipped. Malformed lines are
//! skipped with a warning.
//!
//! # Trust decisions
//!
//! [`KnownHostsStore::classify`] never writes. Adding a key is the separate
//! [`KnownHostsStore::trust`] call, made after the caller accepted the key;
//! replacing a key requires an explicit [`KnownHostsStore::revoke`] first.
//!
//! # Example
//!
//! ```rust
//! use ferrule_proto::ssh::hostkey::Ed25519HostKey;
//! use ferrule_proto::ssh::known_hosts::{KnownHostsStore, TrustDecision};
//!
//! let store = KnownHostsStore::in_memory();
//! let key = Ed25519HostKey::generate().public_key();
//!
//! assert_eq!(store.classify("localhost", 22, &key), TrustDecision::NotFound);
//! store.trust("localhost", 22, &key).unwrap();
//! assert!(matches!(store.classify("localhost", 22, &key), TrustDecision::Match { .. }));
//! ```

use super::error::{Error, StoreError, TrustError};
use super::hostkey::{Fingerprint, PublicKey};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use sha1::Sha1;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

type HmacSha1 = Hmac<Sha1>;

/// A single known_hosts entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHost {
    /// Hostname pattern (standard, hashed, or wildcard)
    hostname_pattern: String,
    /// Key type (e.g., "ssh-ed25519")
    key_type: String,
    /// Public key blob (SSH wire format)
    key_data: Vec<u8>,
    /// Optional comment
    comment: String,
    /// 1-based line number in the source (0 if not read from a file)
    line: usize,
}

impl KnownHost {
    /// Creates an entry for `host:port`, optionally with a hashed hostname.
    pub fn for_host(host: &str, port: u16, key: &PublicKey, hashed: bool) -> Self {
        let name = host_token(host, port);
        let hostname_pattern = if hashed { hash_hostname(&name) } else { name };
        Self {
            hostname_pattern,
            key_type: key.algorithm().to_string(),
            key_data: key.blob().to_vec(),
            comment: String::new(),
            line: 0,
        }
    }

    /// Returns the hostname pattern.
    pub fn hostname_pattern(&self) -> &str {
        &self.hostname_pattern
    }

    /// Returns the key type.
    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    /// Returns the key blob.
    pub fn key_data(&self) -> &[u8] {
        &self.key_data
    }

    /// Returns the comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Returns the source line number.
    pub fn line(&self) -> usize {
        self.line
    }

    /// Fingerprint of the stored key.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.key_data)
    }

    /// Checks whether this entry applies to `hostname:port`.
    ///
    /// A matching negated pattern excludes the host even if another pattern
    /// on the same line matches.
    pub fn matches(&self, hostname: &str, port: u16) -> bool {
        let full_host = host_token(hostname, port);

        let mut matched = false;
        for pattern in self.hostname_pattern.split(',') {
            let pattern = pattern.trim();
            if let Some(negated) = pattern.strip_prefix('!') {
                if matches_pattern(negated, &full_host) {
                    return false;
                }
            } else if matches_pattern(pattern, &full_host) {
                matched = true;
            }
        }
        matched
    }

    /// Parses a single line.
    ///
    /// Returns `Ok(None)` for blank lines, comments and marker lines.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ferrule_proto::ssh::known_hosts::KnownHost;
    ///
    /// let line = "example.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIJdD7y3aLq454yWBdwLWbieU1ebz9/cu7/QEXn9OIeZJ user@host";
    /// let entry = KnownHost::parse_line(line, 1).unwrap().unwrap();
    /// assert_eq!(entry.hostname_pattern(), "example.com");
    /// assert_eq!(entry.key_type(), "ssh-ed25519");
    /// assert_eq!(entry.comment(), "user@host");
    /// ```
    pub fn parse_line(line: &str, line_number: usize) -> Result<Option<Self>, StoreError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        if line.starts_with('@') {
            debug!("Skipping marker line {} in known hosts", line_number);
            return Ok(None);
        }

        let parse_error = |reason: String| StoreError::Parse {
            line: line_number,
            reason,
        };

        let mut fields = line.split_whitespace();
        let (Some(hostname_pattern), Some(key_type), Some(base64_key)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(parse_error("too few fields (need at least 3)".to_string()));
        };

        let key = PublicKey::from_openssh(key_type, base64_key)
            .map_err(|e| parse_error(e.to_string()))?;

        Ok(Some(Self {
            hostname_pattern: hostname_pattern.to_string(),
            key_type: key_type.to_string(),
            key_data: key.blob().to_vec(),
            comment: fields.collect::<Vec<_>>().join(" "),
            line: line_number,
        }))
    }

    /// Formats the entry as a known_hosts line (without newline).
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{} {} {}",
            self.hostname_pattern,
            self.key_type,
            STANDARD.encode(&self.key_data)
        );
        if !self.comment.is_empty() {
            line.push(' ');
            line.push_str(&self.comment);
        }
        line
    }
}

/// `host` for port 22, `[host]:port` otherwise.
fn host_token(host: &str, port: u16) -> String {
    let host = host.to_ascii_lowercase();
    if port == 22 {
        host
    } else {
        format!("[{}]:{}", host, port)
    }
}

fn matches_pattern(pattern: &str, hostname: &str) -> bool {
    if pattern.starts_with("|1|") {
        return verify_hashed_hostname(pattern, hostname);
    }
    if pattern.contains('*') || pattern.contains('?') {
        return wildcard_match(pattern.as_bytes(), hostname.as_bytes());
    }
    pattern.eq_ignore_ascii_case(hostname)
}

/// Checks `|1|salt|hash` where hash = HMAC-SHA1(salt, hostname).
fn verify_hashed_hostname(hashed: &str, hostname: &str) -> bool {
    let parts: Vec<&str> = hashed.split('|').collect();
    if parts.len() != 4 || !parts[0].is_empty() || parts[1] != "1" {
        return false;
    }

    let (Ok(salt), Ok(expected)) = (STANDARD.decode(parts[2]), STANDARD.decode(parts[3])) else {
        debug!("Ignoring hashed hostname with invalid base64");
        return false;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(&salt) else {
        return false;
    };
    mac.update(hostname.as_bytes());
    let computed = mac.finalize().into_bytes();

    computed.ct_eq(&expected[..]).into()
}

fn hash_hostname(hostname: &str) -> String {
    let mut salt = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut salt);
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha1::new_from_slice(&salt) {
        Ok(mac) => mac,
        Err(_) => return hostname.to_string(),
    };
    mac.update(hostname.as_bytes());
    format!(
        "|1|{}|{}",
        STANDARD.encode(salt),
        STANDARD.encode(mac.finalize().into_bytes())
    )
}

/// `*` matches any run of characters, `?` exactly one.
fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(c) if *c == b'?' || c.eq_ignore_ascii_case(&text[t]) => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == b'*')
}

/// Another key known for a host, reported with [`TrustDecision::UnknownKeyType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownKeySummary {
    /// Algorithm of the stored key
    pub key_type: String,
    /// Fingerprint of the stored key
    pub fingerprint: Fingerprint,
    /// Source line
    pub line: usize,
}

/// Outcome of [`KnownHostsStore::classify`].
#[derive(Debug, Clone)]
pub enum TrustDecision {
    /// A stored key for this algorithm equals the presented key.
    Match {
        /// Matching line
        line: usize,
    },
    /// A stored key for this algorithm differs from the presented key.
    Mismatch {
        /// Fingerprint of the stored key
        expected: Fingerprint,
        /// Line of the stored key
        line: usize,
    },
    /// The host is known, but only with other key algorithms.
    UnknownKeyType {
        /// Keys stored for the host
        known: Vec<KnownKeySummary>,
    },
    /// The host is not in the store.
    NotFound,
    /// The store could not be read.
    Error(Arc<StoreError>),
}

impl TrustDecision {
    /// Whether the presented key is already trusted.
    pub fn is_match(&self) -> bool {
        matches!(self, TrustDecision::Match { .. })
    }
}

impl PartialEq for TrustDecision {
    fn eq(&self, other: &Self) -> bool {
        use TrustDecision::*;
        match (self, other) {
            (Match { line: a }, Match { line: b }) => a == b,
            (
                Mismatch {
                    expected: a,
                    line: la,
                },
                Mismatch {
                    expected: b,
                    line: lb,
                },
            ) => a == b && la == lb,
            (UnknownKeyType { known: a }, UnknownKeyType { known: b }) => a == b,
            (NotFound, NotFound) => true,
            (Error(a), Error(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}

impl fmt::Display for TrustDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustDecision::Match { line } => write!(f, "matches known hosts line {}", line),
            TrustDecision::Mismatch { expected, line } => write!(
                f,
                "HOST KEY MISMATCH: known hosts line {} holds {}",
                line, expected
            ),
            TrustDecision::UnknownKeyType { known } => {
                let types: Vec<&str> = known.iter().map(|k| k.key_type.as_str()).collect();
                write!(f, "host is known only with {}", types.join(", "))
            }
            TrustDecision::NotFound => f.write_str("host not in known hosts"),
            TrustDecision::Error(err) => write!(f, "known hosts unreadable: {}", err),
        }
    }
}

enum Backend {
    File(PathBuf),
    Memory(Vec<KnownHost>),
}

/// Known-hosts store, file-backed or in memory.
///
/// Reads share a lock; `trust` and `revoke` take it exclusively, so one
/// store can be shared between sessions through an `Arc`.
pub struct KnownHostsStore {
    backend: RwLock<Backend>,
    hash_hostnames: bool,
}

impl KnownHostsStore {
    /// Opens a file-backed store. A missing file is an empty store; it is
    /// created on the first [`trust`](Self::trust).
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self {
            backend: RwLock::new(Backend::File(path.as_ref().to_path_buf())),
            hash_hostnames: false,
        }
    }

    /// Creates an empty in-memory store.
    pub fn in_memory() -> Self {
        Self {
            backend: RwLock::new(Backend::Memory(Vec::new())),
            hash_hostnames: false,
        }
    }

    /// Creates an in-memory store from known_hosts text.
    pub fn from_content(content: &str) -> Self {
        Self {
            backend: RwLock::new(Backend::Memory(parse_content(content))),
            hash_hostnames: false,
        }
    }

    /// Writes new entries with hashed hostnames.
    pub fn hash_hostnames(mut self, enabled: bool) -> Self {
        self.hash_hostnames = enabled;
        self
    }

    /// File path for file-backed stores.
    pub fn path(&self) -> Option<PathBuf> {
        match &*self.backend.read() {
            Backend::File(path) => Some(path.clone()),
            Backend::Memory(_) => None,
        }
    }

    /// Current entries.
    pub fn entries(&self) -> Result<Vec<KnownHost>, StoreError> {
        load(&self.backend.read())
    }

    /// Classifies a presented host key. Never modifies the store.
    ///
    /// File-backed stores re-read the file, so external edits are seen.
    pub fn classify(&self, host: &str, port: u16, key: &PublicKey) -> TrustDecision {
        let entries = match load(&self.backend.read()) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read known hosts: {}", e);
                return TrustDecision::Error(Arc::new(e));
            }
        };

        let decision = classify_entries(&entries, host, port, key);
        match &decision {
            TrustDecision::UnknownKeyType { known } => {
                warn!(
                    "Host {}:{} presented a {} key but is known with other key types",
                    host,
                    port,
                    key.algorithm()
                );
                for summary in known {
                    warn!(
                        "  known {} key {} (line {})",
                        summary.key_type, summary.fingerprint, summary.line
                    );
                }
            }
            TrustDecision::Mismatch { expected, line } => warn!(
                "Host key for {}:{} does not match known hosts line {}: expected {}, got {}",
                host,
                port,
                line,
                expected,
                key.fingerprint()
            ),
            _ => {}
        }
        decision
    }

    /// Adds `key` for `host:port` after the caller accepted it.
    ///
    /// A no-op if the key is already trusted. File appends create parent
    /// directories, write one complete line and sync it to disk.
    ///
    /// # Errors
    ///
    /// [`Error::Trust`] if a different key of the same type is stored (use
    /// [`revoke`](Self::revoke) first), [`Error::Store`] if persisting fails.
    pub fn trust(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), Error> {
        let mut backend = self.backend.write();
        let entries = load(&backend)?;

        match classify_entries(&entries, host, port, key) {
            TrustDecision::Match { .. } => return Ok(()),
            decision @ TrustDecision::Mismatch { .. } => {
                return Err(TrustError {
                    host: host.to_string(),
                    port,
                    key_type: key.algorithm().to_string(),
                    fingerprint: key.fingerprint(),
                    decision,
                }
                .into());
            }
            _ => {}
        }

        let entry = KnownHost::for_host(host, port, key, self.hash_hostnames);
        match &mut *backend {
            Backend::File(path) => append_line(path, &entry.to_line())?,
            Backend::Memory(entries) => {
                let mut entry = entry;
                entry.line = entries.iter().map(|e| e.line).max().unwrap_or(0) + 1;
                entries.push(entry);
            }
        }

        info!(
            "Added {} key {} for {}:{} to known hosts",
            key.algorithm(),
            key.fingerprint(),
            host,
            port
        );
        Ok(())
    }

    /// Removes every entry for `host:port` with `key_type`.
    ///
    /// Files are rewritten atomically (temporary file plus rename). Lines
    /// listing several hosts are removed whole. Returns the number of
    /// entries removed.
    pub fn revoke(&self, host: &str, port: u16, key_type: &str) -> Result<usize, StoreError> {
        let mut backend = self.backend.write();
        let removed = match &mut *backend {
            Backend::Memory(entries) => {
                let before = entries.len();
                entries.retain(|e| !(e.key_type == key_type && e.matches(host, port)));
                before - entries.len()
            }
            Backend::File(path) => {
                let Some(content) = read_file(path)? else {
                    return Ok(0);
                };
                let mut removed = 0;
                let mut kept = String::with_capacity(content.len());
                for (index, line) in content.lines().enumerate() {
                    let revoked = matches!(
                        KnownHost::parse_line(line, index + 1),
                        Ok(Some(ref e)) if e.key_type == key_type && e.matches(host, port)
                    );
                    if revoked {
                        removed += 1;
                    } else {
                        kept.push_str(line);
                        kept.push('\n');
                    }
                }
                if removed > 0 {
                    rewrite_atomically(path, &kept)?;
                }
                removed
            }
        };

        if removed > 0 {
            info!(
                "Revoked {} {} key(s) for {}:{} from known hosts",
                removed, key_type, host, port
            );
        }
        Ok(removed)
    }
}

impl fmt::Debug for KnownHostsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnownHostsStore")
            .field("path", &self.path())
            .field("hash_hostnames", &self.hash_hostnames)
            .finish()
    }
}

fn classify_entries(entries: &[KnownHost], host: &str, port: u16, key: &PublicKey) -> TrustDecision {
    let for_host: Vec<&KnownHost> = entries.iter().filter(|e| e.matches(host, port)).collect();
    if for_host.is_empty() {
        return TrustDecision::NotFound;
    }

    let same_type: Vec<&&KnownHost> = for_host
        .iter()
        .filter(|e| e.key_type == key.algorithm())
        .collect();
    if let Some(entry) = same_type.iter().find(|e| e.key_data == key.blob()) {
        return TrustDecision::Match { line: entry.line };
    }
    if let Some(entry) = same_type.first() {
        return TrustDecision::Mismatch {
            expected: entry.fingerprint(),
            line: entry.line,
        };
    }

    TrustDecision::UnknownKeyType {
        known: for_host
            .iter()
            .map(|e| KnownKeySummary {
                key_type: e.key_type.clone(),
                fingerprint: e.fingerprint(),
                line: e.line,
            })
            .collect(),
    }
}

fn parse_content(content: &str) -> Vec<KnownHost> {
    let mut entries = Vec::new();
    for (index, line) in content.lines().enumerate() {
        match KnownHost::parse_line(line, index + 1) {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => {}
            Err(e) => warn!("Skipping known hosts entry: {}", e),
        }
    }
    entries
}

fn load(backend: &Backend) -> Result<Vec<KnownHost>, StoreError> {
    match backend {
        Backend::Memory(entries) => Ok(entries.clone()),
        Backend::File(path) => Ok(read_file(path)?
            .map(|content| parse_content(&content))
            .unwrap_or_default()),
    }
}

fn io_error(path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Reads the file, `None` if it does not exist.
fn read_file(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path, e)),
    }
}

fn append_line(path: &Path, line: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }

    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .map_err(|e| io_error(path, e))?;

    // Never glue the new entry onto an unterminated last line.
    let mut existing = Vec::new();
    file.read_to_end(&mut existing).map_err(|e| io_error(path, e))?;
    let mut record = String::with_capacity(line.len() + 2);
    if existing.last().is_some_and(|b| *b != b'\n') {
        record.push('\n');
    }
    record.push_str(line);
    record.push('\n');

    file.write_all(record.as_bytes())
        .map_err(|e| io_error(path, e))?;
    file.sync_all().map_err(|e| io_error(path, e))
}

fn rewrite_atomically(path: &Path, content: &str) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "known_hosts".to_string());
    let temp = path.with_file_name(format!(".{}.tmp", file_name));

    let mut file = fs::File::create(&temp).map_err(|e| io_error(&temp, e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| io_error(&temp, e))?;
    file.sync_all().map_err(|e| io_error(&temp, e))?;
    fs::rename(&temp, path).map_err(|e| io_error(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::Ed25519HostKey;

    fn key() -> PublicKey {
        Ed25519HostKey::generate().public_key()
    }

    fn line_for(pattern: &str, key: &PublicKey) -> String {
        format!("{} {}", pattern, key.to_openssh())
    }

    #[test]
    fn test_parse_with_port_and_comment() {
        let k = key();
        let line = format!("[example.com]:2222 {} admin key", k.to_openssh());
        let entry = KnownHost::parse_line(&line, 7).unwrap().unwrap();
        assert_eq!(entry.hostname_pattern(), "[example.com]:2222");
        assert_eq!(entry.comment(), "admin key");
        assert_eq!(entry.line(), 7);
        assert!(entry.matches("example.com", 2222));
        assert!(!entry.matches("example.com", 22));
    }

    #[test]
    fn test_parse_skips_comments_and_markers() {
        let k = key();
        assert_eq!(KnownHost::parse_line("   ", 1).unwrap(), None);
        assert_eq!(KnownHost::parse_line("# comment", 1).unwrap(), None);
        let marker = format!("@cert-authority *.example.com {}", k.to_openssh());
        assert_eq!(KnownHost::parse_line(&marker, 1).unwrap(), None);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            KnownHost::parse_line("host ssh-ed25519", 3),
            Err(StoreError::Parse { line: 3, .. })
        ));
        assert!(KnownHost::parse_line("host ssh-ed25519 !!!notbase64", 4).is_err());

        let openssh = key().to_openssh();
        let blob = openssh.split_whitespace().nth(1).unwrap();
        let wrong_type = format!("host ssh-rsa {}", blob);
        assert!(KnownHost::parse_line(&wrong_type, 5).is_err());
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match(b"*.example.com", b"host.example.com"));
        assert!(wildcard_match(b"host?.example.com", b"host1.example.com"));
        assert!(!wildcard_match(b"host?.example.com", b"host12.example.com"));
        assert!(wildcard_match(b"*", b""));
        assert!(wildcard_match(b"a*b*c", b"aXXbYYc"));
        assert!(!wildcard_match(b"a*b*c", b"aXXbYY"));
    }

    #[test]
    fn test_negation_wins_regardless_of_order() {
        let k = key();
        let entry = KnownHost::parse_line(&line_for("*.example.com,!bad.example.com", &k), 1)
            .unwrap()
            .unwrap();
        assert!(entry.matches("good.example.com", 22));
        assert!(!entry.matches("bad.example.com", 22));

        let reversed = KnownHost::parse_line(&line_for("!bad.example.com,*.example.com", &k), 1)
            .unwrap()
            .unwrap();
        assert!(!reversed.matches("bad.example.com", 22));
    }

    #[test]
    fn test_hashed_hostname() {
        let k = key();
        let entry = KnownHost::for_host("secret.example.com", 2222, &k, true);
        assert!(entry.hostname_pattern().starts_with("|1|"));
        assert!(entry.matches("secret.example.com", 2222));
        assert!(!entry.matches("secret.example.com", 22));
        assert!(!entry.matches("other.example.com", 2222));
    }

    #[test]
    fn test_hostname_case_insensitive() {
        let k = key();
        let entry = KnownHost::parse_line(&line_for("Example.COM", &k), 1)
            .unwrap()
            .unwrap();
        assert!(entry.matches("example.com", 22));
    }

    #[test]
    fn test_classify_outcomes() {
        let k1 = key();
        let k2 = key();
        let store = KnownHostsStore::from_content(&format!(
            "# header\n{}\n",
            line_for("localhost", &k1)
        ));

        assert_eq!(
            store.classify("localhost", 22, &k1),
            TrustDecision::Match { line: 2 }
        );
        assert_eq!(
            store.classify("localhost", 22, &k2),
            TrustDecision::Mismatch {
                expected: k1.fingerprint(),
                line: 2
            }
        );
        assert_eq!(store.classify("localhost", 2222, &k1), TrustDecision::NotFound);
    }

    #[test]
    fn test_unknown_key_type_lists_known_keys() {
        let k1 = key();
        // Same blob shape with a different algorithm name.
        let mut blob = Vec::new();
        crate::ssh::wire::SshBufMut::put_ssh_string(&mut blob, b"ssh-foo");
        crate::ssh::wire::SshBufMut::put_ssh_string(&mut blob, &[1u8; 32]);
        let other = PublicKey::from_blob(&blob).unwrap();

        let store = KnownHostsStore::from_content(&line_for("localhost", &k1));
        match store.classify("localhost", 22, &other) {
            TrustDecision::UnknownKeyType { known } => {
                assert_eq!(known.len(), 1);
                assert_eq!(known[0].key_type, "ssh-ed25519");
                assert_eq!(known[0].fingerprint, k1.fingerprint());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_trust_refuses_mismatch() {
        let k1 = key();
        let k2 = key();
        let store = KnownHostsStore::in_memory();
        store.trust("host", 22, &k1).unwrap();
        store.trust("host", 22, &k1).unwrap();
        assert_eq!(store.entries().unwrap().len(), 1);

        match store.trust("host", 22, &k2) {
            Err(Error::Trust(err)) => {
                assert_eq!(err.fingerprint, k2.fingerprint());
                assert!(matches!(err.decision, TrustDecision::Mismatch { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_revoke_then_trust_replaces_key() {
        let k1 = key();
        let k2 = key();
        let store = KnownHostsStore::in_memory();
        store.trust("host", 22, &k1).unwrap();

        assert_eq!(store.revoke("host", 22, "ssh-ed25519").unwrap(), 1);
        assert_eq!(store.classify("host", 22, &k1), TrustDecision::NotFound);
        store.trust("host", 22, &k2).unwrap();
        assert!(store.classify("host", 22, &k2).is_match());
    }

    #[test]
    fn test_decision_display() {
        let fingerprint = key().fingerprint();
        let decision = TrustDecision::Mismatch {
            expected: fingerprint.clone(),
            line: 4,
        };
        let text = decision.to_string();
        assert!(text.contains("MISMATCH"));
        assert!(text.contains(&fingerprint.to_string()));
    }
}
