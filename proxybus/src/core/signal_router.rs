//! PropertiesChanged dispatch.
//!
//! Signal registration on the bus is by object path only, so every signal is
//! first checked against the unique name of the remote object. Accepted
//! signals update the property cache and are then handed to the listeners
//! registered when the signal arrived, one at a time and without the proxy
//! lock held. Each registration counts the callbacks running for it, which is
//! what unregistration waits on.

use log::{debug, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread;
use zvariant::OwnedValue;

use crate::Result;
use crate::api::listener::PropertiesChangedListener;
use crate::api::models::BusError;
use crate::api::proxy_object::ProxyBusObject;
use crate::bus::attachment::SignalHandler;
use crate::bus::message::{Message, decode_property_map, decode_string_array};
use crate::core::internal::ProxyInternal;
use crate::types::constants::{interfaces, members};

/// One listener registered for one interface.
pub(crate) struct Registration {
    pub(crate) id: u64,
    /// Properties the listener wants; empty means all of them.
    pub(crate) properties: BTreeSet<String>,
    pub(crate) listener: Arc<dyn PropertiesChangedListener>,
}

impl Registration {
    fn wants(&self, property: &str) -> bool {
        self.properties.is_empty() || self.properties.contains(property)
    }
}

/// Outcome of [`ListenerRegistry::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Inserted {
    pub(crate) id: u64,
    /// An earlier registration of the same listener was replaced.
    pub(crate) replaced: bool,
}

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    by_interface: HashMap<String, Vec<Arc<Registration>>>,
    running: HashMap<u64, usize>,
    next_id: u64,
}

impl ListenerRegistry {
    /// Registers `listener`, replacing an earlier registration of the same
    /// listener for `interface`.
    pub(crate) fn insert(
        &mut self,
        interface: &str,
        properties: BTreeSet<String>,
        listener: Arc<dyn PropertiesChangedListener>,
    ) -> Inserted {
        self.next_id += 1;
        let id = self.next_id;
        let registration = Arc::new(Registration {
            id,
            properties,
            listener,
        });
        let list = self.by_interface.entry(interface.to_string()).or_default();
        match list
            .iter_mut()
            .find(|r| Arc::ptr_eq(&r.listener, &registration.listener))
        {
            Some(slot) => {
                *slot = registration;
                Inserted { id, replaced: true }
            }
            None => {
                list.push(registration);
                Inserted {
                    id,
                    replaced: false,
                }
            }
        }
    }

    pub(crate) fn find(
        &self,
        interface: &str,
        listener: &Arc<dyn PropertiesChangedListener>,
    ) -> Option<Arc<Registration>> {
        self.by_interface
            .get(interface)?
            .iter()
            .find(|r| Arc::ptr_eq(&r.listener, listener))
            .cloned()
    }

    pub(crate) fn remove(&mut self, interface: &str, id: u64) -> Option<Arc<Registration>> {
        let list = self.by_interface.get_mut(interface)?;
        let index = list.iter().position(|r| r.id == id)?;
        let removed = list.remove(index);
        if list.is_empty() {
            self.by_interface.remove(interface);
        }
        Some(removed)
    }

    pub(crate) fn snapshot(&self, interface: &str) -> Vec<Arc<Registration>> {
        self.by_interface.get(interface).cloned().unwrap_or_default()
    }

    pub(crate) fn is_registered(&self, interface: &str, id: u64) -> bool {
        self.by_interface
            .get(interface)
            .is_some_and(|list| list.iter().any(|r| r.id == id))
    }

    pub(crate) fn running(&self, id: u64) -> usize {
        self.running.get(&id).copied().unwrap_or(0)
    }

    fn enter(&mut self, id: u64) {
        *self.running.entry(id).or_default() += 1;
    }

    fn leave(&mut self, id: u64) {
        if let Some(count) = self.running.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.running.remove(&id);
            }
        }
    }
}

/// Decoded body of a PropertiesChanged signal.
pub(crate) struct PropertiesChanged {
    pub(crate) interface: String,
    pub(crate) changed: Vec<(String, OwnedValue)>,
    pub(crate) invalidated: Vec<String>,
}

pub(crate) fn parse_properties_changed(msg: &Message) -> Result<PropertiesChanged> {
    let missing = |what: &str| BusError::InvalidReply(format!("PropertiesChanged without {what}"));
    let interface = msg.arg_str(0).ok_or_else(|| missing("interface"))?.to_string();
    let changed = decode_property_map(msg.arg(1).ok_or_else(|| missing("changed properties"))?)?;
    let invalidated = decode_string_array(
        msg.arg(2)
            .ok_or_else(|| missing("invalidated properties"))?,
    )?;
    Ok(PropertiesChanged {
        interface,
        changed,
        invalidated,
    })
}

/// Narrows a change set down to what `registration` asked for.
pub(crate) fn filter_changes<'a>(
    registration: &Registration,
    changes: &'a PropertiesChanged,
) -> (Vec<(&'a str, &'a OwnedValue)>, Vec<&'a str>) {
    let changed = changes
        .changed
        .iter()
        .filter(|(name, _)| registration.wants(name))
        .map(|(name, value)| (name.as_str(), value))
        .collect();
    let invalidated = changes
        .invalidated
        .iter()
        .filter(|name| registration.wants(name))
        .map(String::as_str)
        .collect();
    (changed, invalidated)
}

// Marks a listener callback as running for as long as it lives, so a
// panicking listener cannot leave unregistration waiting forever.
struct RunningCallback<'a> {
    internal: &'a ProxyInternal,
    id: u64,
}

impl Drop for RunningCallback<'_> {
    fn drop(&mut self) {
        let mut state = self.internal.lock();
        state.listeners.leave(self.id);
        let me = thread::current().id();
        if let Some(current) = state.handler_threads.get_mut(&me).and_then(|s| s.last_mut()) {
            *current = None;
        }
        self.internal.listener_done.notify_all();
    }
}

impl ProxyInternal {
    /// Registers the PropertiesChanged handler for this object path once.
    pub(crate) fn ensure_signal_handler(&self) -> Result<()> {
        {
            let mut state = self.lock();
            if state.handler_registered {
                return Ok(());
            }
            state.handler_registered = true;
        }

        let weak = self.weak_self.clone();
        let handler: SignalHandler = Arc::new(move |msg: &Message| {
            if let Some(internal) = weak.upgrade() {
                internal.handle_properties_changed(msg);
            }
        });
        match self.bus.register_signal_handler(
            &self.path,
            interfaces::PROPERTIES,
            members::PROPERTIES_CHANGED,
            handler,
        ) {
            Ok(id) => {
                self.lock().signal_handler = Some(id);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to register PropertiesChanged handler on {}: {e}", self.path);
                self.lock().handler_registered = false;
                Err(e)
            }
        }
    }

    pub(crate) fn handle_properties_changed(self: &Arc<Self>, msg: &Message) {
        {
            let state = self.lock();
            if msg.sender != state.unique_name {
                debug!(
                    "Dropping PropertiesChanged from {} (expected {:?})",
                    msg.sender, state.unique_name
                );
                return;
            }
        }

        let changes = match parse_properties_changed(msg) {
            Ok(changes) => changes,
            Err(e) => {
                warn!("Dropping malformed PropertiesChanged on {}: {e}", self.path);
                return;
            }
        };

        let me = thread::current().id();
        let snapshot = {
            let mut state = self.lock();
            if state.cache_properties {
                if let Some(cache) = state.caches.get_mut(&changes.interface) {
                    cache.apply_change_signal(&changes.changed, &changes.invalidated, msg.serial);
                }
            }
            state.handler_threads.entry(me).or_default().push(None);
            state.listeners.snapshot(&changes.interface)
        };

        let proxy = ProxyBusObject::from_internal(Arc::clone(self));
        for registration in snapshot {
            {
                let mut state = self.lock();
                if !state
                    .listeners
                    .is_registered(&changes.interface, registration.id)
                {
                    continue;
                }
                state.listeners.enter(registration.id);
                if let Some(current) = state.handler_threads.get_mut(&me).and_then(|s| s.last_mut())
                {
                    *current = Some(registration.id);
                }
            }
            let _running = RunningCallback {
                internal: self,
                id: registration.id,
            };

            let (changed, invalidated) = filter_changes(&registration, &changes);
            if !changed.is_empty() || !invalidated.is_empty() {
                registration.listener.properties_changed(
                    &proxy,
                    &changes.interface,
                    &changed,
                    &invalidated,
                );
            }
        }

        let mut state = self.lock();
        if let Some(stack) = state.handler_threads.get_mut(&me) {
            stack.pop();
            if stack.is_empty() {
                state.handler_threads.remove(&me);
            }
        }
        self.handler_done.notify_all();
    }

    /// Registers `listener` for changes of `properties` (all of them when
    /// empty) on `interface`.
    pub(crate) fn register_listener(
        &self,
        interface: &str,
        properties: &[&str],
        listener: Arc<dyn PropertiesChangedListener>,
    ) -> Result<()> {
        let iface = self
            .bus
            .get_interface(interface)
            .ok_or_else(|| BusError::NoSuchInterface(interface.to_string()))?;
        for property in properties {
            if iface.property(property).is_none() {
                return Err(BusError::NoSuchProperty {
                    interface: interface.to_string(),
                    property: property.to_string(),
                });
            }
        }

        let names = properties.iter().map(|p| p.to_string()).collect();
        let inserted = {
            let mut state = self.lock();
            if state.exiting {
                return Err(BusError::Stopping);
            }
            state.listeners.insert(interface, names, listener)
        };
        if inserted.replaced {
            // The replaced registration holds the rule reference, but its
            // installation may still be in flight.
            let mut state = self.lock();
            while state.match_rules.is_installing(interface) {
                state = self.wait(&self.add_match_done, state);
            }
            if state.match_rules.is_installed(interface) {
                return Ok(());
            }
            state.listeners.remove(interface, inserted.id);
            return Err(BusError::Transport(format!(
                "match rule for {interface} was not installed"
            )));
        }

        self.ensure_unique_name();
        if let Err(e) = self.acquire_match_rule(interface, true) {
            self.lock().listeners.remove(interface, inserted.id);
            return Err(e);
        }
        Ok(())
    }

    /// Unregisters `listener` from `interface`, waiting for its callbacks in
    /// progress on other threads to return.
    pub(crate) fn unregister_listener(
        &self,
        interface: &str,
        listener: &Arc<dyn PropertiesChangedListener>,
    ) -> Result<()> {
        if self.bus.get_interface(interface).is_none() {
            return Err(BusError::NoSuchInterface(interface.to_string()));
        }
        let me = thread::current().id();
        let mut state = self.lock();
        let Some(registration) = state.listeners.find(interface, listener) else {
            return Ok(());
        };
        let in_own_callback = state
            .handler_threads
            .get(&me)
            .is_some_and(|stack| stack.contains(&Some(registration.id)));
        if in_own_callback {
            return Err(BusError::Deadlock);
        }

        state.listeners.remove(interface, registration.id);
        while state.listeners.running(registration.id) > 0 {
            state = self.wait(&self.listener_done, state);
        }
        drop(state);

        self.release_match_rule(interface);
        Ok(())
    }
}
