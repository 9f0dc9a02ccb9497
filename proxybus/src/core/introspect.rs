//! Introspection-driven population of a proxy.

use log::debug;
use std::time::Duration;

use crate::Result;
use crate::api::models::BusError;
use crate::api::proxy_object::ProxyBusObject;
use crate::bus::interface::Member;
use crate::bus::message::{Message, MessageFlags};
use crate::types::constants::{interfaces, members};

fn introspect_member(proxy: &ProxyBusObject) -> Result<Member> {
    proxy
        .internal
        .bind_standard_interface(interfaces::INTROSPECTABLE)
        .ok_or_else(|| BusError::UnknownInterface(interfaces::INTROSPECTABLE.to_string()))?;
    proxy
        .internal
        .member(interfaces::INTROSPECTABLE, members::INTROSPECT)
}

fn parse_reply(proxy: &ProxyBusObject, reply: &Message) -> Result<()> {
    let xml = reply
        .arg_str(0)
        .ok_or_else(|| BusError::InvalidReply("Introspect reply without XML".to_string()))?;
    let ident = format!("{} : {}", reply.sender, proxy.path());
    debug!("Parsing introspection data from {ident}");
    proxy.internal.bus.parse_introspection(proxy, xml, &ident)
}

pub(crate) fn introspect(proxy: &ProxyBusObject, timeout: Option<Duration>) -> Result<()> {
    let member = introspect_member(proxy)?;
    let internal = &proxy.internal;
    let reply = internal.call_sync(
        &member,
        Vec::new(),
        MessageFlags::empty(),
        internal.call_timeout(timeout),
    )?;
    parse_reply(proxy, &reply)
}

pub(crate) fn introspect_async<F>(
    proxy: &ProxyBusObject,
    timeout: Option<Duration>,
    callback: F,
) -> Result<()>
where
    F: FnOnce(Result<()>) + Send + 'static,
{
    let member = introspect_member(proxy)?;
    let internal = &proxy.internal;
    let weak = internal.weak_self.clone();
    internal.call_async(
        &member,
        Vec::new(),
        MessageFlags::empty(),
        internal.call_timeout(timeout),
        move |result| {
            let parsed = result.and_then(|reply| match weak.upgrade() {
                Some(internal) => parse_reply(&ProxyBusObject::from_internal(internal), &reply),
                None => Err(BusError::Stopping),
            });
            callback(parsed);
        },
    )
}
