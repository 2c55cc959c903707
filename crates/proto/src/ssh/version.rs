//! Protocol version exchange (RFC 4253 Section 4.2).
//!
//! Each side sends one identification line before any binary packet:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may send other lines first (banners, load balancer notices). Those
//! are skipped by [`scan_identification`], bounded by
//! [`MAX_PRE_BANNER_LINES`].
//!
//! # Example
//!
//! ```rust
//! use ferrule_proto::ssh::version::Version;
//!
//! let ours = Version::new("Ferrule_0.1.0", None);
//! assert_eq!(ours.to_string(), "SSH-2.0-Ferrule_0.1.0");
//!
//! let theirs = Version::parse("SSH-2.0-OpenSSH_9.6 Debian-2\r\n").unwrap();
//! assert_eq!(theirs.software(), "OpenSSH_9.6");
//! assert_eq!(theirs.comments(), Some("Debian-2"));
//! ```

use bytes::BytesMut;
use thiserror::Error;

/// Maximum length of an identification line, CR LF included.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of non-identification lines accepted before the
/// identification line.
pub const MAX_PRE_BANNER_LINES: usize = 1024;

/// Identification line failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    /// Line longer than [`MAX_VERSION_LENGTH`].
    #[error("identification line too long ({0} bytes)")]
    TooLong(usize),
    /// Line contains a NUL byte or is not UTF-8.
    #[error("identification line contains invalid characters")]
    InvalidCharacters,
    /// Line does not follow `SSH-x.y-software`.
    #[error("malformed identification line {0:?}")]
    Malformed(String),
    /// Protocol version other than 2.0 or 1.99.
    #[error("unsupported protocol version {0:?}")]
    Unsupported(String),
    /// Too many lines before the identification line.
    #[error("more than {MAX_PRE_BANNER_LINES} lines before the identification line")]
    TooManyBannerLines,
}

/// SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
    /// Line exactly as exchanged, without CR LF; feeds the exchange hash.
    raw: String,
}

impl Version {
    /// Creates an SSH-2.0 identification.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        let mut raw = format!("SSH-2.0-{}", software);
        if let Some(comments) = comments {
            raw.push(' ');
            raw.push_str(comments);
        }
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
            raw,
        }
    }

    /// Identification used when the caller configures none.
    pub fn default_ferrule() -> Self {
        Self::new(&format!("Ferrule_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification line (CR LF optional).
    ///
    /// # Errors
    ///
    /// Returns [`VersionError`] for over-long lines, NUL bytes, a missing
    /// `SSH-` prefix or a protocol version other than `2.0`/`1.99`.
    pub fn parse(line: &str) -> Result<Self, VersionError> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(VersionError::TooLong(line.len()));
        }
        if line.contains('\0') {
            return Err(VersionError::InvalidCharacters);
        }

        let rest = line
            .strip_prefix("SSH-")
            .ok_or_else(|| VersionError::Malformed(line.to_string()))?;
        let (proto_version, rest) = rest
            .split_once('-')
            .ok_or_else(|| VersionError::Malformed(line.to_string()))?;

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(VersionError::Unsupported(proto_version.to_string()));
        }

        let (software_version, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software, Some(comments.trim().to_string())),
            None => (rest, None),
        };
        if software_version.is_empty() {
            return Err(VersionError::Malformed(line.to_string()));
        }

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version: software_version.to_string(),
            comments,
            raw: line.to_string(),
        })
    }

    /// Protocol version (`2.0` or `1.99`).
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Software version field.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Comments after the software version.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Line as exchanged, without CR LF.
    pub fn as_exchanged(&self) -> &str {
        &self.raw
    }

    /// Line to put on the wire, with CR LF.
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self.raw).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Consumes complete lines from `buffer` until the identification line.
///
/// Returns `Ok(None)` when more input is needed. Bytes after the
/// identification line stay in `buffer`; they belong to the first binary
/// packet. `skipped` counts pre-banner lines across calls.
///
/// # Errors
///
/// Fails on an invalid identification line, a pre-banner line longer than
/// [`MAX_VERSION_LENGTH`] or more than [`MAX_PRE_BANNER_LINES`] of them.
pub fn scan_identification(
    buffer: &mut BytesMut,
    skipped: &mut usize,
) -> Result<Option<Version>, VersionError> {
    loop {
        let Some(newline) = buffer.iter().position(|b| *b == b'\n') else {
            if buffer.len() > MAX_VERSION_LENGTH {
                return Err(VersionError::TooLong(buffer.len()));
            }
            return Ok(None);
        };

        let line = buffer.split_to(newline + 1);
        if line.len() > MAX_VERSION_LENGTH {
            return Err(VersionError::TooLong(line.len()));
        }
        let text = std::str::from_utf8(&line).map_err(|_| VersionError::InvalidCharacters)?;

        if text.starts_with("SSH-") {
            return Version::parse(text).map(Some);
        }

        *skipped += 1;
        if *skipped > MAX_PRE_BANNER_LINES {
            return Err(VersionError::TooManyBannerLines);
        }
        tracing::debug!("Skipping pre-identification line: {:?}", text.trim_end());
    }
}
