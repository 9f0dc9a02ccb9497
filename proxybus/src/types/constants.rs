//! Constants for well-known bus names, error names and status codes.
//!
//! These correspond to the names used by the D-Bus specification and the
//! AllJoyn extensions that remote peers put on the wire.

/// Standard interfaces every remote object may implement.
pub mod interfaces {
    pub const PROPERTIES: &str = "org.freedesktop.DBus.Properties";
    pub const PEER: &str = "org.freedesktop.DBus.Peer";
    pub const INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";
}

/// Members of the standard interfaces.
pub mod members {
    pub const GET: &str = "Get";
    pub const SET: &str = "Set";
    pub const GET_ALL: &str = "GetAll";
    pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";
    pub const INTROSPECT: &str = "Introspect";
    pub const PING: &str = "Ping";
    pub const GET_MACHINE_ID: &str = "GetMachineId";
}

/// Error names carried by error replies.
pub mod error_names {
    /// Sent by a peer whose security policy rejected the call.
    pub const PERMISSION_DENIED: &str = "org.alljoyn.Bus.Security.Error.PermissionDenied";
    /// Generic AllJoyn error; the second argument is a `u16` status code.
    pub const ER_STATUS: &str = "org.alljoyn.Bus.ErStatus";
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
}

/// Status codes found in `org.alljoyn.Bus.ErStatus` error replies.
pub mod status {
    pub const OK: u16 = 0x0000;
    pub const FAIL: u16 = 0x0001;
    /// Synthesized by the transport's reply timer.
    pub const TIMEOUT: u16 = 0x000A;
    /// The peer's security policy rejected the call.
    pub const PERMISSION_DENIED: u16 = 0x910A;
}

/// Serial-number arithmetic.
pub mod serial {
    /// Half of the 32-bit serial space. A serial less than this distance
    /// ahead of the last accepted one (mod 2^32) is considered newer.
    pub const VALIDITY_WINDOW: u32 = 1 << 31;
}

/// Timeout constants for remote calls.
pub mod timeouts {
    use std::time::Duration;

    /// Default time to wait for a method reply (25 seconds).
    const DEFAULT_CALL_TIMEOUT_MS: u64 = 25_000;

    /// Returns the default method call timeout.
    pub fn default_call_timeout() -> Duration {
        Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS)
    }
}
