//! Remote method calls.
//!
//! Synchronous calls park the calling thread on a [`SyncReplySlot`] until the
//! transport delivers the reply (a timeout is delivered as a reply too) or the
//! proxy aborts the call during shutdown. Asynchronous calls hand the reply
//! to a callback instead.

use log::{debug, warn};
use std::mem;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use zvariant::OwnedValue;

use crate::Result;
use crate::api::models::BusError;
use crate::bus::interface::{InterfaceDescription, Member, SecurityPolicy};
use crate::bus::message::{Message, MessageFlags};
use crate::core::internal::ProxyInternal;
use crate::types::constants::{error_names, status};

enum SlotState {
    Waiting,
    Replied(Message),
    Aborted,
    Consumed,
}

/// How a synchronous call ended.
pub(crate) enum SyncOutcome {
    Reply(Message),
    Aborted,
}

/// Single-shot rendezvous between a blocked caller and the reply handler.
pub(crate) struct SyncReplySlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl SyncReplySlot {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::Waiting),
            ready: Condvar::new(),
        })
    }

    /// Hands a reply to the waiting caller. Ignored once resolved.
    pub(crate) fn deliver(&self, reply: Message) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, SlotState::Waiting) {
            *state = SlotState::Replied(reply);
            self.ready.notify_all();
        }
    }

    /// Aborts the call. Wins over a reply the caller has not picked up yet.
    pub(crate) fn abort(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*state, SlotState::Consumed) {
            *state = SlotState::Aborted;
            self.ready.notify_all();
        }
    }

    pub(crate) fn wait(&self) -> SyncOutcome {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match mem::replace(&mut *state, SlotState::Consumed) {
                SlotState::Waiting => {
                    *state = SlotState::Waiting;
                    state = self
                        .ready
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                SlotState::Replied(reply) => return SyncOutcome::Reply(reply),
                SlotState::Aborted | SlotState::Consumed => return SyncOutcome::Aborted,
            }
        }
    }
}

/// Translates an error reply into the most specific error it describes.
pub(crate) fn error_from_reply(reply: &Message) -> BusError {
    let name = reply.error_name.clone().unwrap_or_default();
    let description = reply.arg_str(0).unwrap_or_default().to_string();
    match name.as_str() {
        error_names::PERMISSION_DENIED => BusError::PermissionDenied { description },
        error_names::ER_STATUS => match reply.arg_u16(1) {
            Some(status::TIMEOUT) => BusError::Timeout,
            Some(status::PERMISSION_DENIED) => BusError::PermissionDenied { description },
            Some(code) => BusError::Status { code, description },
            None => BusError::ReplyIsError { name, description },
        },
        error_names::SERVICE_UNKNOWN => BusError::NoSuchService(description),
        _ => BusError::ReplyIsError { name, description },
    }
}

/// Whether calls on `iface` must be encrypted by a proxy whose secure flag is
/// `secure`.
pub(crate) fn security_applies(iface: &InterfaceDescription, secure: bool) -> bool {
    match iface.security_policy() {
        SecurityPolicy::Required => true,
        SecurityPolicy::Off => false,
        SecurityPolicy::Inherit => secure,
    }
}

impl ProxyInternal {
    /// Looks up `interface.member` among the bound interfaces.
    pub(crate) fn member(&self, interface: &str, member: &str) -> Result<Member> {
        let iface = self
            .interface(interface)
            .ok_or_else(|| BusError::NoSuchInterface(interface.to_string()))?;
        iface
            .member(member)
            .cloned()
            .ok_or_else(|| BusError::NoSuchMember {
                interface: interface.to_string(),
                member: member.to_string(),
            })
    }

    /// Extra flags required to call members of `iface`.
    pub(crate) fn security_flags(&self, iface: &InterfaceDescription) -> MessageFlags {
        if security_applies(iface, self.lock().secure) {
            MessageFlags::ENCRYPTED
        } else {
            MessageFlags::empty()
        }
    }

    // Checks the interface is bound and works out the final flags.
    fn prepare_call(
        &self,
        member: &Member,
        args: Vec<OwnedValue>,
        flags: MessageFlags,
    ) -> Result<Message> {
        let iface = self
            .interface(&member.interface)
            .ok_or_else(|| BusError::NoSuchInterface(member.interface.clone()))?;
        let flags = flags | self.security_flags(&iface);
        if flags.contains(MessageFlags::ENCRYPTED) && !self.bus.is_peer_security_enabled() {
            return Err(BusError::SecurityNotEnabled);
        }
        let destination = {
            let state = self.lock();
            if state.unique_name.is_empty() {
                self.service_name.clone()
            } else {
                state.unique_name.clone()
            }
        };
        Ok(Message::method_call(
            self.bus.next_serial(),
            &destination,
            &self.path,
            &member.interface,
            &member.name,
            args,
        )
        .with_flags(flags)
        .with_session(self.session_id)
        .with_signature(&member.input_signature))
    }

    /// Checks a reply and learns the unique name from its sender.
    pub(crate) fn accept_reply(&self, reply: Message) -> Result<Message> {
        if reply.is_error() {
            return Err(error_from_reply(&reply));
        }
        if !reply.sender.is_empty() {
            let mut state = self.lock();
            if state.unique_name.is_empty() {
                state.unique_name = reply.sender.clone();
            }
        }
        Ok(reply)
    }

    /// Calls `member` and blocks until the reply arrives.
    ///
    /// With [`MessageFlags::NO_REPLY_EXPECTED`] the call is only sent and an
    /// empty reply is returned.
    pub(crate) fn call_sync(
        &self,
        member: &Member,
        args: Vec<OwnedValue>,
        flags: MessageFlags,
        timeout: Duration,
    ) -> Result<Message> {
        if !self.bus.is_connected() {
            return Err(BusError::EndpointClosing);
        }
        if self.bus.is_reentrant_call() {
            return Err(BusError::BlockingCallNotAllowed);
        }
        if self.lock().exiting {
            return Err(BusError::Stopping);
        }
        let call = self.prepare_call(member, args, flags)?;
        let serial = call.serial;

        if call.flags.contains(MessageFlags::NO_REPLY_EXPECTED) {
            let empty = Message::method_return(&call, 0, "", Vec::new());
            self.bus.send_message(call)?;
            return Ok(empty);
        }

        let slot = SyncReplySlot::new();
        let deliver = Arc::clone(&slot);
        self.bus.register_reply_handler(
            serial,
            Box::new(move |reply| deliver.deliver(reply)),
            timeout,
        )?;
        if let Err(e) = self.bus.send_message(call) {
            self.bus.unregister_reply_handler(serial);
            return Err(e);
        }

        let call_id = {
            let mut state = self.lock();
            if state.exiting {
                drop(state);
                self.bus.unregister_reply_handler(serial);
                return Err(BusError::Stopping);
            }
            state.next_call_id += 1;
            let id = state.next_call_id;
            state.sync_calls.insert(id, Arc::clone(&slot));
            id
        };

        let outcome = slot.wait();

        {
            let mut state = self.lock();
            state.sync_calls.remove(&call_id);
            self.sync_call_done.notify_all();
        }

        match outcome {
            SyncOutcome::Reply(reply) => self.accept_reply(reply),
            SyncOutcome::Aborted => {
                debug!(
                    "Call {}.{} on {} aborted",
                    member.interface, member.name, self.path
                );
                self.bus.unregister_reply_handler(serial);
                Err(BusError::MethodCallAborted)
            }
        }
    }

    /// Calls `member` and passes the reply to `callback` later.
    ///
    /// The callback runs if and only if this returns `Ok`.
    pub(crate) fn call_async<F>(
        &self,
        member: &Member,
        args: Vec<OwnedValue>,
        flags: MessageFlags,
        timeout: Duration,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<Message>) + Send + 'static,
    {
        if !self.bus.is_connected() {
            return Err(BusError::EndpointClosing);
        }
        let call = self.prepare_call(member, args, flags - MessageFlags::NO_REPLY_EXPECTED)?;
        let serial = call.serial;

        let weak = self.weak_self.clone();
        self.bus.register_reply_handler(
            serial,
            Box::new(move |reply| {
                let result = match weak.upgrade() {
                    Some(internal) => internal.accept_reply(reply),
                    None if reply.is_error() => Err(error_from_reply(&reply)),
                    None => Ok(reply),
                };
                callback(result);
            }),
            timeout,
        )?;

        if let Err(e) = self.bus.send_message(call) {
            if self.bus.unregister_reply_handler(serial) {
                return Err(e);
            }
            warn!("Send of call {serial} failed after its reply handler ran: {e}");
        }
        Ok(())
    }

    /// Sends a call that expects no reply.
    pub(crate) fn call_no_reply(
        &self,
        member: &Member,
        args: Vec<OwnedValue>,
        flags: MessageFlags,
    ) -> Result<()> {
        if !self.bus.is_connected() {
            return Err(BusError::EndpointClosing);
        }
        let call = self.prepare_call(member, args, flags | MessageFlags::NO_REPLY_EXPECTED)?;
        self.bus.send_message(call)
    }
}
