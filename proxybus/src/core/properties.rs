//! Property access through `org.freedesktop.DBus.Properties`.
//!
//! Reads are answered from the property cache when possible. Replies to
//! `Get` and `GetAll` feed the cache; `Set` does not, the change signal the
//! remote object emits takes care of that.

use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use zvariant::{OwnedValue, Value};

use crate::Result;
use crate::api::models::{BusError, PropertyMap};
use crate::bus::interface::{InterfaceDescription, Member};
use crate::bus::message::{Message, decode_property_map, owned_value};
use crate::core::internal::ProxyInternal;
use crate::core::property_cache::PropertyCache;
use crate::types::constants::{interfaces, members};

// Converts a GetAll reply, dropping the interface's cache if it is malformed.
fn property_map_from_reply(
    internal: Option<&ProxyInternal>,
    interface: &str,
    reply: &Message,
) -> Result<PropertyMap> {
    let decoded = reply
        .arg(0)
        .ok_or_else(|| BusError::InvalidReply("GetAll reply without values".to_string()))
        .and_then(decode_property_map);
    let values = match decoded {
        Ok(values) => values,
        Err(e) => {
            if let Some(internal) = internal {
                warn!("Malformed GetAll reply for {interface}, invalidating cache: {e}");
                internal.with_cache(interface, |cache| cache.invalidate());
            }
            return Err(e);
        }
    };
    if let Some(internal) = internal {
        internal.with_cache(interface, |cache| cache.apply_get_reply(&values, reply.serial));
    }
    Ok(values.into_iter().collect())
}

fn value_from_get_reply(
    internal: Option<&ProxyInternal>,
    interface: &str,
    property: &str,
    reply: &Message,
) -> Result<OwnedValue> {
    let value = reply.arg_value(0)?;
    if let Some(internal) = internal {
        internal.with_cache(interface, |cache| {
            cache.apply_set_reply(property, &value, reply.serial)
        });
    }
    Ok(value)
}

impl ProxyInternal {
    /// Runs `f` on the cache of `interface` if caching is on and it exists.
    pub(crate) fn with_cache<F>(&self, interface: &str, f: F)
    where
        F: FnOnce(&mut PropertyCache),
    {
        let mut state = self.lock();
        if !state.cache_properties {
            return;
        }
        if let Some(cache) = state.caches.get_mut(interface) {
            f(cache);
        }
    }

    pub(crate) fn cached_property(&self, interface: &str, property: &str) -> Option<OwnedValue> {
        let state = self.lock();
        if !state.cache_properties {
            return None;
        }
        state.caches.get(interface)?.get(property)
    }

    pub(crate) fn cached_properties(&self, interface: &str) -> Option<PropertyMap> {
        let state = self.lock();
        if !state.cache_properties {
            return None;
        }
        state.caches.get(interface)?.get_all()
    }

    // The descriptor of the interface owning the property, and the member of
    // the properties interface to call.
    fn property_call(
        &self,
        interface: &str,
        member: &str,
    ) -> Result<(Arc<InterfaceDescription>, Member)> {
        let value_iface = self
            .bus
            .get_interface(interface)
            .ok_or_else(|| BusError::NoSuchInterface(interface.to_string()))?;
        let props = self
            .bus
            .get_interface(interfaces::PROPERTIES)
            .ok_or_else(|| BusError::UnknownInterface(interfaces::PROPERTIES.to_string()))?;
        let member = props
            .member(member)
            .cloned()
            .ok_or_else(|| BusError::NoSuchMember {
                interface: interfaces::PROPERTIES.to_string(),
                member: member.to_string(),
            })?;
        Ok((value_iface, member))
    }

    pub(crate) fn get_property(
        &self,
        interface: &str,
        property: &str,
        timeout: Option<Duration>,
    ) -> Result<OwnedValue> {
        let (value_iface, member) = self.property_call(interface, members::GET)?;
        if let Some(value) = self.cached_property(interface, property) {
            debug!("Cache hit for {interface}.{property}");
            return Ok(value);
        }
        let args = vec![owned_value(interface)?, owned_value(property)?];
        let flags = self.security_flags(&value_iface);
        let reply = self.call_sync(&member, args, flags, self.call_timeout(timeout))?;
        value_from_get_reply(Some(self), interface, property, &reply)
    }

    pub(crate) fn get_property_async<F>(
        &self,
        interface: &str,
        property: &str,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<OwnedValue>) + Send + 'static,
    {
        let (value_iface, member) = self.property_call(interface, members::GET)?;
        if let Some(value) = self.cached_property(interface, property) {
            debug!("Cache hit for {interface}.{property}, scheduling reply");
            self.bus.schedule(Box::new(move || callback(Ok(value))));
            return Ok(());
        }
        let args = vec![owned_value(interface)?, owned_value(property)?];
        let flags = self.security_flags(&value_iface);
        let weak = self.weak_self.clone();
        let iface_name = interface.to_string();
        let prop_name = property.to_string();
        self.call_async(&member, args, flags, self.call_timeout(timeout), move |result| {
            let internal = weak.upgrade();
            callback(result.and_then(|reply| {
                value_from_get_reply(internal.as_deref(), &iface_name, &prop_name, &reply)
            }));
        })
    }

    pub(crate) fn get_all_properties(
        &self,
        interface: &str,
        timeout: Option<Duration>,
    ) -> Result<PropertyMap> {
        let (value_iface, member) = self.property_call(interface, members::GET_ALL)?;
        if let Some(values) = self.cached_properties(interface) {
            debug!("Cache hit for all properties of {interface}");
            return Ok(values);
        }
        let args = vec![owned_value(interface)?];
        let flags = self.security_flags(&value_iface);
        let reply = self.call_sync(&member, args, flags, self.call_timeout(timeout))?;
        property_map_from_reply(Some(self), interface, &reply)
    }

    pub(crate) fn get_all_properties_async<F>(
        &self,
        interface: &str,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<PropertyMap>) + Send + 'static,
    {
        let (value_iface, member) = self.property_call(interface, members::GET_ALL)?;
        if let Some(values) = self.cached_properties(interface) {
            debug!("Cache hit for all properties of {interface}, scheduling reply");
            self.bus.schedule(Box::new(move || callback(Ok(values))));
            return Ok(());
        }
        let args = vec![owned_value(interface)?];
        let flags = self.security_flags(&value_iface);
        let weak = self.weak_self.clone();
        let iface_name = interface.to_string();
        self.call_async(&member, args, flags, self.call_timeout(timeout), move |result| {
            let internal = weak.upgrade();
            callback(
                result.and_then(|reply| {
                    property_map_from_reply(internal.as_deref(), &iface_name, &reply)
                }),
            );
        })
    }

    fn set_args(interface: &str, property: &str, value: OwnedValue) -> Result<Vec<OwnedValue>> {
        Ok(vec![
            owned_value(interface)?,
            owned_value(property)?,
            owned_value(Value::Value(Box::new(Value::from(value))))?,
        ])
    }

    pub(crate) fn set_property(
        &self,
        interface: &str,
        property: &str,
        value: OwnedValue,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let (value_iface, member) = self.property_call(interface, members::SET)?;
        let args = Self::set_args(interface, property, value)?;
        let flags = self.security_flags(&value_iface);
        self.call_sync(&member, args, flags, self.call_timeout(timeout))?;
        Ok(())
    }

    pub(crate) fn set_property_async<F>(
        &self,
        interface: &str,
        property: &str,
        value: OwnedValue,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let (value_iface, member) = self.property_call(interface, members::SET)?;
        let args = Self::set_args(interface, property, value)?;
        let flags = self.security_flags(&value_iface);
        self.call_async(&member, args, flags, self.call_timeout(timeout), move |result| {
            callback(result.map(|_| ()));
        })
    }
}
