//! Per-interface cache of remote property values.
//!
//! Every update carries the serial of the message it came from. Serials are a
//! wrapping 32-bit counter: an update is only admitted if its serial is ahead
//! of the last admitted one. Anything else means messages were reordered, and
//! the whole interface is dropped from the cache rather than risk serving a
//! stale value.

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use zvariant::OwnedValue;

use crate::api::models::PropertyMap;
use crate::bus::interface::InterfaceDescription;
use crate::types::constants::serial::VALIDITY_WINDOW;

/// Result of comparing an incoming serial with the last admitted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SerialOrder {
    Newer,
    Duplicate,
    Stale,
}

/// Orders `serial` against `last` in wrapping arithmetic.
pub(crate) fn order_serial(last: Option<u32>, serial: u32) -> SerialOrder {
    match last {
        None => SerialOrder::Newer,
        Some(last) if last == serial => SerialOrder::Duplicate,
        Some(last) if serial.wrapping_sub(last) < VALIDITY_WINDOW => SerialOrder::Newer,
        Some(_) => SerialOrder::Stale,
    }
}

#[derive(Debug)]
pub(crate) struct PropertyCache {
    interface: Arc<InterfaceDescription>,
    values: HashMap<String, OwnedValue>,
    fully_cacheable: bool,
    property_count: usize,
    last_serial: Option<u32>,
    enabled: bool,
}

impl PropertyCache {
    pub(crate) fn new(interface: Arc<InterfaceDescription>) -> Self {
        Self {
            fully_cacheable: interface.is_fully_cacheable(),
            property_count: interface.property_count(),
            interface,
            values: HashMap::new(),
            last_serial: None,
            enabled: false,
        }
    }

    /// Starts admitting updates. Only call once the match rule delivering
    /// change signals for this interface is installed.
    pub(crate) fn enable(&mut self) {
        if !self.enabled {
            debug!("Property cache enabled for {}", self.interface.name());
        }
        self.enabled = true;
    }

    #[cfg(test)]
    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn get(&self, property: &str) -> Option<OwnedValue> {
        if !self.enabled {
            return None;
        }
        self.values.get(property)?.try_clone().ok()
    }

    /// Returns every property value, or `None` unless the interface is fully
    /// cacheable and every one of its properties is cached.
    pub(crate) fn get_all(&self) -> Option<PropertyMap> {
        if !self.enabled
            || !self.fully_cacheable
            || self.property_count == 0
            || self.values.len() != self.property_count
        {
            return None;
        }
        self.values
            .iter()
            .map(|(name, value)| Some((name.clone(), value.try_clone().ok()?)))
            .collect()
    }

    /// Applies the values of a `GetAll` reply.
    pub(crate) fn apply_get_reply(&mut self, values: &[(String, OwnedValue)], serial: u32) {
        if !self.enabled || !self.admit(serial) {
            return;
        }
        for (name, value) in values {
            self.store(name, value);
        }
    }

    /// Applies the value of a single-property `Get` reply.
    pub(crate) fn apply_set_reply(&mut self, property: &str, value: &OwnedValue, serial: u32) {
        if !self.enabled || !self.interface.is_cacheable(property) || !self.admit(serial) {
            return;
        }
        self.store(property, value);
    }

    /// Applies a `PropertiesChanged` signal.
    pub(crate) fn apply_change_signal(
        &mut self,
        changed: &[(String, OwnedValue)],
        invalidated: &[String],
        serial: u32,
    ) {
        if !self.enabled || !self.admit(serial) {
            return;
        }
        for (name, value) in changed {
            self.store(name, value);
        }
        for name in invalidated {
            self.values.remove(name);
        }
    }

    /// Drops every cached value.
    pub(crate) fn invalidate(&mut self) {
        self.values.clear();
    }

    fn store(&mut self, name: &str, value: &OwnedValue) {
        if !self.interface.is_cacheable(name) {
            return;
        }
        match value.try_clone() {
            Ok(value) => {
                self.values.insert(name.to_string(), value);
            }
            Err(_) => {
                self.values.remove(name);
            }
        }
    }

    fn admit(&mut self, serial: u32) -> bool {
        match order_serial(self.last_serial, serial) {
            SerialOrder::Newer => {
                self.last_serial = Some(serial);
                true
            }
            SerialOrder::Duplicate => false,
            SerialOrder::Stale => {
                warn!(
                    "Serial {serial} is older than {:?}, invalidating cache for {}",
                    self.last_serial,
                    self.interface.name()
                );
                self.invalidate();
                false
            }
        }
    }
}
