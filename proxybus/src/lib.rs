//! A runtime for proxies of objects exposed by remote peers on a message bus.
//!
//! A [`ProxyBusObject`] stands in for one remote object. Through it you can:
//!
//! - Call remote methods, blocking, with a callback, or as a future
//! - Read and write remote properties, with an optional local cache kept
//!   fresh by `PropertiesChanged` signals
//! - Listen for property changes on selected properties
//! - Organise proxies in a tree of child objects
//!
//! The transport, the interface descriptor store and the introspection
//! parser are supplied by the application through the [`BusAttachment`]
//! trait.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use proxybus::{BusAttachment, ProxyBusObject, ProxyConfig};
//!
//! # fn example(bus: Arc<dyn BusAttachment>) -> proxybus::Result<()> {
//! let proxy = ProxyBusObject::builder(bus, "org.example.Lamp", "/org/example/lamp")
//!     .config(ProxyConfig::new().with_property_caching(true))
//!     .build()?;
//! proxy.add_interface_by_name("org.example.Lamp")?;
//!
//! // Served from the cache once the change subscription is installed.
//! let all = proxy.get_all_properties("org.example.Lamp", None)?;
//! for (name, value) in &all {
//!     println!("{name} = {value:?}");
//! }
//!
//! proxy.method_call("org.example.Lamp", "Toggle", vec![], None)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Error Handling
//!
//! All operations return `Result<T, BusError>`. Error replies from the remote
//! side are translated into specific variants: permission failures and
//! status codes are told apart from generic error replies, and the remote
//! error name and description stay available through
//! [`BusError::error_name`] and [`BusError::error_description`].
//!
//! # Property Cache
//!
//! With caching enabled, every bound interface with cacheable properties
//! gets a cache and a match rule for its `PropertiesChanged` signal. Updates
//! are ordered by message serial; an update that arrives out of order
//! clears the whole interface cache, so a read either hits fresh data or
//! goes to the remote object.
//!
//! # Logging
//!
//! This crate uses the [`log`](https://docs.rs/log) facade for logging. To see
//! log output, add a logging implementation like `env_logger`. For example:
//!
//! ```no_run,ignore
//! env_logger::init();
//! // ...
//! ```

// Internal implementation modules
mod core;
mod types;
mod util;

// Public API modules
pub mod api;
pub mod bus;

// Re-exported public API
pub use api::listener::PropertiesChangedListener;
pub use api::models::{BusError, PropertyMap, ProxyConfig, SessionId};
pub use api::proxy_object::{ProxyBuilder, ProxyBusObject};
pub use bus::{
    BusAttachment, InterfaceBuilder, InterfaceDescription, MatchCompletion, Member, MemberKind,
    Message, MessageFlags, MessageType, Property, PropertyAccess, ReplyHandler, SecurityPolicy,
    SignalHandler, SignalHandlerId, Task,
};
pub use types::constants;

/// A specialized `Result` type for proxy operations.
pub type Result<T> = std::result::Result<T, BusError>;
