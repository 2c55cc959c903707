//! SSH authentication protocol (RFC 4252).
//!
//! Client-side user authentication messages:
//! - "password" - Password authentication
//! - "none" - Queries the methods the server accepts
//!
//! Service requests (RFC 4253 Section 10) live here too, since the
//! `ssh-userauth` service is the only one requested before authentication.
//!
//! # Security
//!
//! Passwords are held in [`Zeroizing`] buffers, cleared on drop and never
//! printed by `Debug`.
//!
//! # Example
//!
//! ```rust
//! use ferrule_proto::ssh::auth::{AuthMethod, AuthRequest, SERVICE_CONNECTION};
//!
//! let auth = AuthRequest::new(
//!     "user",
//!     SERVICE_CONNECTION,
//!     AuthMethod::password("secret"),
//! );
//! assert_eq!(auth.method().name(), "password");
//! ```

use super::message::MessageType;
use super::wire::{Reader, SshBufMut, WireError};
use bytes::{BufMut, BytesMut};
use std::fmt;
use zeroize::Zeroizing;

/// Service requested before authentication.
pub const SERVICE_USERAUTH: &str = "ssh-userauth";

/// Service started by a successful authentication.
pub const SERVICE_CONNECTION: &str = "ssh-connection";

/// SSH authentication method.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Lists the methods that can continue.
    None,
    /// Password authentication.
    Password(Zeroizing<String>),
}

impl AuthMethod {
    /// Password method from a plain string.
    pub fn password(password: &str) -> Self {
        AuthMethod::Password(Zeroizing::new(password.to_string()))
    }

    /// Returns the method name.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::None => f.write_str("None"),
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// User credentials handed to [`Session::authenticate`](super::Session::authenticate).
#[derive(Clone)]
pub struct Credentials {
    user: String,
    password: Zeroizing<String>,
}

impl Credentials {
    /// Password credentials for `user`.
    pub fn password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    /// User name.
    pub fn user(&self) -> &str {
        &self.user
    }

    pub(crate) fn method(&self) -> AuthMethod {
        AuthMethod::Password(self.password.clone())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// SSH_MSG_SERVICE_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    name: String,
}

impl ServiceRequest {
    /// Requests the named service.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ServiceRequest as u8);
        buf.put_ssh_string(self.name.as_bytes());
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::message(data, MessageType::ServiceRequest as u8)?;
        Ok(Self::new(reader.read_utf8("service name")?))
    }
}

/// SSH_MSG_SERVICE_ACCEPT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccept {
    name: String,
}

impl ServiceAccept {
    /// Accepts the named service.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ServiceAccept as u8);
        buf.put_ssh_string(self.name.as_bytes());
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::message(data, MessageType::ServiceAccept as u8)?;
        Ok(Self::new(reader.read_utf8("service name")?))
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// User name
    user_name: String,
    /// Service name (usually "ssh-connection")
    service_name: String,
    /// Authentication method
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a new authentication request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes the authentication request to bytes.
    ///
    /// Format (RFC 4252 Section 5, 8):
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// boolean   FALSE                      (password only)
    /// string    plaintext password         (password only)
    /// ```
    ///
    /// The returned buffer holds the password and is cleared on drop.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut buf = Vec::new();
        buf.put_u8(MessageType::UserauthRequest as u8);
        buf.put_ssh_string(self.user_name.as_bytes());
        buf.put_ssh_string(self.service_name.as_bytes());
        buf.put_ssh_string(self.method.name().as_bytes());

        if let AuthMethod::Password(password) = &self.method {
            buf.put_ssh_bool(false);
            buf.put_ssh_string(password.as_bytes());
        }

        Zeroizing::new(buf)
    }

    /// Parses an authentication request from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] for truncated data, password change requests
    /// and methods other than `none` and `password`.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::message(data, MessageType::UserauthRequest as u8)?;
        let user_name = reader.read_utf8("user name")?;
        let service_name = reader.read_utf8("service name")?;
        let method_name = reader.read_utf8("method name")?;

        let method = match method_name {
            "none" => AuthMethod::None,
            "password" => {
                if reader.read_bool("change password")? {
                    return Err(WireError::Invalid {
                        field: "change password",
                        reason: "password change is not supported".to_string(),
                    });
                }
                let password = reader.read_utf8("password")?;
                AuthMethod::password(password)
            }
            other => {
                return Err(WireError::Invalid {
                    field: "method name",
                    reason: format!("unsupported authentication method '{}'", other),
                })
            }
        };

        Ok(Self::new(user_name, service_name, method))
    }
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
///
/// Sent by the server when authentication fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    /// Authentications that can continue
    methods_can_continue: Vec<String>,
    /// Partial success flag
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a new authentication failure message.
    ///
    /// # Example
    ///
    /// ```rust
    /// use ferrule_proto::ssh::auth::AuthFailure;
    ///
    /// let failure = AuthFailure::new(
    ///     vec!["publickey".to_string(), "password".to_string()],
    ///     false,
    /// );
    /// assert!(failure.allows("password"));
    /// ```
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Returns the methods that can continue.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Whether `method` may be tried next.
    pub fn allows(&self, method: &str) -> bool {
        self.methods_can_continue.iter().any(|m| m == method)
    }

    /// Returns whether partial success was achieved.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        buf.put_name_list(&self.methods_can_continue);
        buf.put_ssh_bool(self.partial_success);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::message(data, MessageType::UserauthFailure as u8)?;
        let methods = reader.read_name_list("authentications that can continue")?;
        let partial_success = reader.read_bool("partial success")?;
        Ok(Self::new(methods, partial_success))
    }
}

/// SSH_MSG_USERAUTH_BANNER message (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    message: String,
    language: String,
}

impl AuthBanner {
    /// Creates a banner.
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
            language: String::new(),
        }
    }

    /// Banner text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Language tag.
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthBanner as u8);
        buf.put_ssh_string(self.message.as_bytes());
        buf.put_ssh_string(self.language.as_bytes());
        buf.to_vec()
    }

    /// Parses from bytes. Invalid UTF-8 in the text is replaced.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::message(data, MessageType::UserauthBanner as u8)?;
        let message = String::from_utf8_lossy(reader.read_string("banner message")?).into_owned();
        let language = String::from_utf8_lossy(reader.read_string("language tag")?).into_owned();
        Ok(Self { message, language })
    }
}

/// SSH_MSG_USERAUTH_SUCCESS.
pub fn auth_success() -> Vec<u8> {
    vec![MessageType::UserauthSuccess as u8]
}

/// Server answer to a USERAUTH_REQUEST, as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponse {
    /// Authentication succeeded.
    Success,
    /// Authentication failed.
    Failure(AuthFailure),
    /// Banner, sent before the final answer.
    Banner(AuthBanner),
    /// The server demands a password change.
    PasswordChangeRequired(String),
}

impl AuthResponse {
    /// Parses any of the userauth server messages.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        match data.first().copied().and_then(MessageType::from_u8) {
            Some(MessageType::UserauthSuccess) => Ok(AuthResponse::Success),
            Some(MessageType::UserauthFailure) => {
                Ok(AuthResponse::Failure(AuthFailure::from_bytes(data)?))
            }
            Some(MessageType::UserauthBanner) => {
                Ok(AuthResponse::Banner(AuthBanner::from_bytes(data)?))
            }
            Some(MessageType::UserauthPasswdChangereq) => {
                let mut reader =
                    Reader::message(data, MessageType::UserauthPasswdChangereq as u8)?;
                let prompt = String::from_utf8_lossy(reader.read_string("prompt")?).into_owned();
                Ok(AuthResponse::PasswordChangeRequired(prompt))
            }
            _ => Err(WireError::Invalid {
                field: "message type",
                reason: format!(
                    "expected a userauth response, got {}",
                    data.first().copied().unwrap_or_default()
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_request_layout() {
        let request = AuthRequest::new("alice", SERVICE_CONNECTION, AuthMethod::password("pw"));
        let bytes = request.to_bytes();
        assert_eq!(bytes[0], 50);

        let parsed = AuthRequest::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(parsed.user_name(), "alice");
        assert_eq!(parsed.service_name(), "ssh-connection");
    }

    #[test]
    fn test_none_request_has_no_method_fields() {
        let bytes = AuthRequest::new("bob", SERVICE_CONNECTION, AuthMethod::None).to_bytes();
        let expected_len = 1 + (4 + 3) + (4 + 14) + (4 + 4);
        assert_eq!(bytes.len(), expected_len);
    }

    #[test]
    fn test_password_change_request_rejected() {
        let mut buf = Vec::new();
        buf.put_u8(50);
        buf.put_ssh_string(b"alice");
        buf.put_ssh_string(b"ssh-connection");
        buf.put_ssh_string(b"password");
        buf.put_ssh_bool(true);
        buf.put_ssh_string(b"old");
        buf.put_ssh_string(b"new");
        assert!(AuthRequest::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_failure_message() {
        let failure = AuthFailure::new(vec!["publickey".into(), "password".into()], true);
        let parsed = AuthFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert!(parsed.partial_success());
        assert!(parsed.allows("password"));
        assert!(!parsed.allows("keyboard-interactive"));
    }

    #[test]
    fn test_response_dispatch() {
        assert_eq!(
            AuthResponse::from_bytes(&auth_success()).unwrap(),
            AuthResponse::Success
        );
        let banner = AuthBanner::new("Authorized use only\n");
        assert_eq!(
            AuthResponse::from_bytes(&banner.to_bytes()).unwrap(),
            AuthResponse::Banner(banner)
        );
        assert!(AuthResponse::from_bytes(&[MessageType::ChannelData as u8]).is_err());
        assert!(AuthResponse::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_service_messages() {
        let request = ServiceRequest::new(SERVICE_USERAUTH);
        assert_eq!(
            ServiceRequest::from_bytes(&request.to_bytes()).unwrap(),
            request
        );
        let accept = ServiceAccept::new(SERVICE_USERAUTH);
        assert_eq!(ServiceAccept::from_bytes(&accept.to_bytes()).unwrap().name(), "ssh-userauth");
    }

    #[test]
    fn test_secrets_not_in_debug() {
        let credentials = Credentials::password("alice", "hunter2");
        assert!(!format!("{:?}", credentials).contains("hunter2"));
        let request = AuthRequest::new("alice", SERVICE_CONNECTION, credentials.method());
        assert!(!format!("{:?}", request).contains("hunter2"));
    }
}
