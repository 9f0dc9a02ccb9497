//! Contracts with the bus layer.
//!
//! The transport, the interface descriptor store and the introspection
//! parser live outside this crate. This module defines what the proxy
//! runtime needs from them.

pub mod attachment;
pub mod interface;
pub mod message;

pub use attachment::{
    BusAttachment, MatchCompletion, ReplyHandler, SignalHandler, SignalHandlerId, Task,
};
pub use interface::{
    InterfaceBuilder, InterfaceDescription, Member, MemberKind, Property, PropertyAccess,
    SecurityPolicy,
};
pub use message::{Message, MessageFlags, MessageType};
