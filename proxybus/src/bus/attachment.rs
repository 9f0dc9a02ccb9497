//! The bus attachment a proxy talks through.
//!
//! A [`BusAttachment`] owns the connection to the bus: it frames and routes
//! messages, runs reply timers, keeps the interface descriptor store and
//! delivers signals. Proxies only see this trait, so any transport (a real
//! router connection or an in-process loopback) can back them.

use std::sync::Arc;
use std::time::Duration;

use crate::Result;
use crate::api::models::BusError;
use crate::api::proxy_object::ProxyBusObject;
use crate::bus::interface::InterfaceDescription;
use crate::bus::message::Message;

/// Invoked exactly once with the reply (or the timeout reply) to a call.
pub type ReplyHandler = Box<dyn FnOnce(Message) + Send>;

/// Invoked once the bus confirmed or rejected an `AddMatch`.
pub type MatchCompletion = Box<dyn FnOnce(Result<()>) + Send>;

/// Invoked for every signal matching a registration.
pub type SignalHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Work deferred to the bus's dispatch context.
pub type Task = Box<dyn FnOnce() + Send>;

/// Identifies a signal handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalHandlerId(pub u64);

/// Connection to a message bus.
///
/// Implementations must be callable from any thread. None of these methods
/// are called while a proxy holds its internal lock, so implementations may
/// invoke handlers and completions inline.
pub trait BusAttachment: Send + Sync {
    /// Returns `false` once the endpoint is closing.
    fn is_connected(&self) -> bool;

    /// Allocates the serial for the next outgoing message.
    fn next_serial(&self) -> u32;

    /// Sends a message.
    fn send_message(&self, msg: Message) -> Result<()>;

    /// Routes the reply to the call with `serial` to `handler`.
    ///
    /// If no reply arrives within `timeout` the handler receives
    /// [`Message::timeout_reply`].
    fn register_reply_handler(
        &self,
        serial: u32,
        handler: ReplyHandler,
        timeout: Duration,
    ) -> Result<()>;

    /// Removes a reply handler. Returns `false` if it already ran.
    fn unregister_reply_handler(&self, serial: u32) -> bool;

    /// Asks the bus to deliver signals matching `rule`.
    fn add_match_async(&self, rule: &str, completion: MatchCompletion) -> Result<()>;

    /// Withdraws a match rule without waiting for the bus to confirm.
    fn remove_match_non_blocking(&self, rule: &str) -> Result<()>;

    /// Calls `handler` for every `interface.member` signal emitted by the
    /// object at `path`, whoever sent it.
    fn register_signal_handler(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        handler: SignalHandler,
    ) -> Result<SignalHandlerId>;

    /// Removes a signal handler. May be called from within that handler.
    fn unregister_signal_handler(&self, id: SignalHandlerId);

    /// Resolves a well-known name to the unique name that owns it.
    fn get_name_owner(&self, alias: &str) -> Result<String>;

    fn is_peer_security_enabled(&self) -> bool;

    /// Returns `true` if the current thread is the bus's own dispatch
    /// thread and blocking calls from it have not been allowed.
    fn is_reentrant_call(&self) -> bool;

    /// Runs `task` later on the bus's dispatch context.
    fn schedule(&self, task: Task);

    /// Looks up an interface in the descriptor store.
    fn get_interface(&self, name: &str) -> Option<Arc<InterfaceDescription>>;

    /// Establishes a secure connection with the peer owning `name`.
    fn secure_connection(&self, name: &str, force_auth: bool) -> Result<()> {
        let _ = force_auth;
        Err(BusError::NotSupported(format!("secure connection to {name}")))
    }

    /// Starts establishing a secure connection without waiting for it.
    fn secure_connection_async(&self, name: &str, force_auth: bool) -> Result<()> {
        let _ = force_auth;
        Err(BusError::NotSupported(format!("secure connection to {name}")))
    }

    /// Populates `proxy` with the interfaces and children described by an
    /// introspection document. `ident` names the source in diagnostics.
    fn parse_introspection(&self, proxy: &ProxyBusObject, xml: &str, ident: &str) -> Result<()> {
        let _ = (proxy, xml);
        Err(BusError::NotSupported(format!("introspection of {ident}")))
    }
}
