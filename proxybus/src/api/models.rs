use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use zvariant::OwnedValue;

use crate::types::constants::{error_names, timeouts};

/// Identifier of the session a remote object is reached through.
///
/// `0` means no session (the object is reached over the bus itself).
pub type SessionId = u32;

/// Property values of one interface keyed by property name.
pub type PropertyMap = HashMap<String, OwnedValue>;

/// Configuration shared by every call made through a proxy.
///
/// # Example
///
/// ```rust
/// use proxybus::ProxyConfig;
/// use std::time::Duration;
///
/// let config = ProxyConfig::new()
///     .with_call_timeout(Duration::from_secs(5))
///     .with_property_caching(true);
///
/// assert!(config.cache_properties);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Timeout used by calls that pass `None` as their timeout.
    pub call_timeout: Duration,
    /// Enable the property cache as soon as the proxy is built.
    pub cache_properties: bool,
    /// Force encryption for every interface that does not turn it off.
    pub secure: bool,
}

impl ProxyConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default timeout for remote calls.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Turns property caching on or off at build time.
    #[must_use]
    pub fn with_property_caching(mut self, enabled: bool) -> Self {
        self.cache_properties = enabled;
        self
    }

    /// Marks the proxy as secure.
    #[must_use]
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }
}

impl Default for ProxyConfig {
    /// Returns the default configuration.
    ///
    /// Defaults:
    /// - `call_timeout`: 25 seconds
    /// - `cache_properties`: `false`
    /// - `secure`: `false`
    fn default() -> Self {
        Self {
            call_timeout: timeouts::default_call_timeout(),
            cache_properties: false,
            secure: false,
        }
    }
}

/// Errors that can occur while talking to a remote object.
#[derive(Debug, Error)]
pub enum BusError {
    /// The proxy does not implement the requested interface.
    #[error("object does not implement interface {0}")]
    NoSuchInterface(String),

    /// The interface descriptor store has no interface with this name.
    #[error("interface {0} is not known to the bus")]
    UnknownInterface(String),

    /// The interface exists but has no member with this name.
    #[error("interface {interface} has no member {member}")]
    NoSuchMember { interface: String, member: String },

    /// The interface exists but has no property with this name.
    #[error("interface {interface} has no property {property}")]
    NoSuchProperty { interface: String, property: String },

    /// The interface is already bound to this proxy.
    #[error("interface {0} is already bound")]
    InterfaceAlreadyExists(String),

    /// A child path is malformed or not below the parent's path.
    #[error("bad child path: {0}")]
    BadChildPath(String),

    /// A child object with this path already exists.
    #[error("object already exists: {0}")]
    ObjectAlreadyExists(String),

    /// No child object with this path exists.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// The bus endpoint is closing or not connected.
    #[error("endpoint is closing")]
    EndpointClosing,

    /// A synchronous call was made from the bus's own dispatch thread.
    #[error("blocking call not allowed on the bus dispatch thread")]
    BlockingCallNotAllowed,

    /// The call requires encryption but peer security is not enabled.
    #[error("peer security is not enabled")]
    SecurityNotEnabled,

    /// The remote peer denied the call.
    #[error("permission denied: {description}")]
    PermissionDenied { description: String },

    /// The reply was an error message without a more specific meaning.
    #[error("reply is error message {name}: {description}")]
    ReplyIsError { name: String, description: String },

    /// The reply carried an AllJoyn status code.
    #[error("remote status {code:#06x}: {description}")]
    Status { code: u16, description: String },

    /// No reply arrived before the call timeout.
    #[error("method call timed out")]
    Timeout,

    /// The call was aborted because the proxy is shutting down.
    #[error("method call aborted")]
    MethodCallAborted,

    /// The proxy is shutting down and accepts no new blocking calls.
    #[error("proxy is stopping")]
    Stopping,

    /// Unregistering a listener from inside its own callback.
    #[error("unregistering a listener from its own callback would deadlock")]
    Deadlock,

    /// The destination service does not exist.
    #[error("no such service: {0}")]
    NoSuchService(String),

    /// The reply did not have the expected shape.
    #[error("invalid reply: {0}")]
    InvalidReply(String),

    /// The reply handler was dropped without ever being invoked.
    #[error("reply handler dropped without a reply")]
    ReplyDropped,

    /// The transport failed to send or register something.
    #[error("transport error: {0}")]
    Transport(String),

    /// The bus does not provide the requested facility.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A value could not be converted.
    #[error("malformed value: {0}")]
    Value(#[from] zvariant::Error),

    /// A bus, interface or member name is invalid.
    #[error("invalid name: {0}")]
    Name(#[from] zbus::names::Error),
}

impl BusError {
    /// Returns the error name of the remote error reply this error came from.
    pub fn error_name(&self) -> Option<&str> {
        match self {
            BusError::PermissionDenied { .. } => Some(error_names::PERMISSION_DENIED),
            BusError::ReplyIsError { name, .. } => Some(name),
            BusError::Status { .. } | BusError::Timeout => Some(error_names::ER_STATUS),
            BusError::NoSuchService(_) => Some(error_names::SERVICE_UNKNOWN),
            _ => None,
        }
    }

    /// Returns the human-readable description sent by the remote peer.
    pub fn error_description(&self) -> Option<&str> {
        match self {
            BusError::PermissionDenied { description }
            | BusError::ReplyIsError { description, .. }
            | BusError::Status { description, .. } => Some(description),
            BusError::NoSuchService(description) => Some(description),
            _ => None,
        }
    }

    /// Returns `true` for errors that were reported by the remote peer.
    pub fn is_remote(&self) -> bool {
        self.error_name().is_some()
    }
}
