//! Shared state behind every handle to one remote object.
//!
//! All mutable state lives in [`ProxyState`] behind a single mutex. The
//! condition variables are the wait points of the proxy: match rule
//! installation, listener callbacks draining, signal dispatch draining and
//! synchronous calls leaving during shutdown.

use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::Result;
use crate::api::models::{BusError, ProxyConfig, SessionId};
use crate::api::proxy_object::ProxyBusObject;
use crate::bus::attachment::{BusAttachment, SignalHandlerId};
use crate::bus::interface::InterfaceDescription;
use crate::core::match_rules::{MatchRuleRegistry, properties_changed_rule};
use crate::core::method_call::SyncReplySlot;
use crate::core::property_cache::PropertyCache;
use crate::core::signal_router::ListenerRegistry;
use crate::types::constants::interfaces;

pub(crate) struct ProxyState {
    pub(crate) unique_name: String,
    pub(crate) secure: bool,
    pub(crate) interfaces: BTreeMap<String, Arc<InterfaceDescription>>,
    pub(crate) has_properties: bool,
    pub(crate) cache_properties: bool,
    pub(crate) caches: HashMap<String, PropertyCache>,
    pub(crate) match_rules: MatchRuleRegistry,
    pub(crate) listeners: ListenerRegistry,
    /// Threads currently dispatching a PropertiesChanged signal, with the
    /// registration each one is calling (innermost last).
    pub(crate) handler_threads: HashMap<ThreadId, Vec<Option<u64>>>,
    pub(crate) handler_registered: bool,
    pub(crate) signal_handler: Option<SignalHandlerId>,
    pub(crate) sync_calls: HashMap<u64, Arc<SyncReplySlot>>,
    pub(crate) next_call_id: u64,
    pub(crate) exiting: bool,
    pub(crate) children: Vec<ProxyBusObject>,
}

pub(crate) struct ProxyInternal {
    pub(crate) bus: Arc<dyn BusAttachment>,
    pub(crate) service_name: String,
    pub(crate) path: String,
    pub(crate) session_id: SessionId,
    pub(crate) config: ProxyConfig,
    pub(crate) weak_self: Weak<ProxyInternal>,
    state: Mutex<ProxyState>,
    pub(crate) add_match_done: Condvar,
    pub(crate) listener_done: Condvar,
    pub(crate) handler_done: Condvar,
    pub(crate) sync_call_done: Condvar,
}

impl ProxyInternal {
    pub(crate) fn new(
        bus: Arc<dyn BusAttachment>,
        service_name: String,
        unique_name: String,
        path: String,
        session_id: SessionId,
        config: ProxyConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            bus,
            service_name,
            path,
            session_id,
            weak_self: weak_self.clone(),
            state: Mutex::new(ProxyState {
                unique_name,
                secure: config.secure,
                interfaces: BTreeMap::new(),
                has_properties: false,
                cache_properties: false,
                caches: HashMap::new(),
                match_rules: MatchRuleRegistry::default(),
                listeners: ListenerRegistry::default(),
                handler_threads: HashMap::new(),
                handler_registered: false,
                signal_handler: None,
                sync_calls: HashMap::new(),
                next_call_id: 0,
                exiting: false,
                children: Vec::new(),
            }),
            config,
            add_match_done: Condvar::new(),
            listener_done: Condvar::new(),
            handler_done: Condvar::new(),
            sync_call_done: Condvar::new(),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ProxyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait<'a>(
        &self,
        cond: &Condvar,
        guard: MutexGuard<'a, ProxyState>,
    ) -> MutexGuard<'a, ProxyState> {
        cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn call_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.config.call_timeout)
    }

    pub(crate) fn interface(&self, name: &str) -> Option<Arc<InterfaceDescription>> {
        self.lock().interfaces.get(name).cloned()
    }

    /// Binds an interface.
    ///
    /// Binding the first interface with properties also binds the standard
    /// properties interface. With caching on, interfaces with cacheable
    /// properties get a cache and a PropertiesChanged match rule.
    pub(crate) fn add_interface(&self, iface: Arc<InterfaceDescription>) -> Result<()> {
        let name = iface.name().to_string();
        let (needs_rule, add_properties_iface) = {
            let mut state = self.lock();
            if state.interfaces.contains_key(&name) {
                return Err(BusError::InterfaceAlreadyExists(name));
            }
            state.interfaces.insert(name.clone(), Arc::clone(&iface));

            let needs_rule = state.cache_properties && iface.has_cacheable_properties();
            if needs_rule {
                state
                    .caches
                    .insert(name.clone(), PropertyCache::new(Arc::clone(&iface)));
            }

            let add_properties_iface = iface.has_properties() && !state.has_properties;
            if iface.has_properties() {
                state.has_properties = true;
            }
            (needs_rule, add_properties_iface)
        };

        if add_properties_iface {
            self.bind_standard_interface(interfaces::PROPERTIES);
        }
        if needs_rule {
            self.ensure_unique_name();
            if let Err(e) = self.acquire_match_rule(&name, false) {
                warn!("Failed to subscribe to property changes of {name}: {e}");
            }
        }
        Ok(())
    }

    /// Binds a well-known interface from the descriptor store, if present.
    pub(crate) fn bind_standard_interface(&self, name: &str) -> Option<Arc<InterfaceDescription>> {
        if let Some(bound) = self.interface(name) {
            return Some(bound);
        }
        let iface = self.bus.get_interface(name)?;
        match self.add_interface(Arc::clone(&iface)) {
            Ok(()) | Err(BusError::InterfaceAlreadyExists(_)) => self.interface(name),
            Err(e) => {
                debug!("Could not bind {name}: {e}");
                None
            }
        }
    }

    /// Turns on property caching for every bound interface.
    ///
    /// Only the first call has an effect.
    pub(crate) fn enable_property_caching(&self) {
        let names: Vec<String> = {
            let mut state = self.lock();
            if state.cache_properties || state.exiting {
                return;
            }
            state.cache_properties = true;
            let cacheable: Vec<Arc<InterfaceDescription>> = state
                .interfaces
                .values()
                .filter(|iface| iface.has_cacheable_properties())
                .cloned()
                .collect();
            for iface in &cacheable {
                state
                    .caches
                    .insert(iface.name().to_string(), PropertyCache::new(Arc::clone(iface)));
            }
            cacheable.iter().map(|iface| iface.name().to_string()).collect()
        };

        if !names.is_empty() {
            self.ensure_unique_name();
        }
        for name in names {
            if let Err(e) = self.acquire_match_rule(&name, false) {
                warn!("Failed to subscribe to property changes of {name}: {e}");
            }
        }
    }

    pub(crate) fn unique_name(&self) -> String {
        self.lock().unique_name.clone()
    }

    /// Resolves the unique name of the service if it is not known yet.
    pub(crate) fn ensure_unique_name(&self) {
        if !self.lock().unique_name.is_empty() {
            return;
        }
        match self.bus.get_name_owner(&self.service_name) {
            Ok(owner) => {
                let mut state = self.lock();
                if state.unique_name.is_empty() {
                    debug!("Resolved {} to {owner}", self.service_name);
                    state.unique_name = owner;
                }
            }
            Err(e) => warn!("Failed to resolve owner of {}: {e}", self.service_name),
        }
    }

    /// Starts the destruction protocol.
    ///
    /// Aborts synchronous calls in flight and waits for them to return,
    /// withdraws every match rule, removes the PropertiesChanged handler and
    /// waits for signal dispatch on other threads to finish.
    pub(crate) fn shutdown(&self) {
        let mut state = self.lock();
        if state.exiting {
            return;
        }
        state.exiting = true;
        if !state.sync_calls.is_empty() {
            debug!(
                "Aborting {} synchronous calls on {}",
                state.sync_calls.len(),
                self.path
            );
        }
        for slot in state.sync_calls.values() {
            slot.abort();
        }
        while !state.sync_calls.is_empty() {
            state = self.wait(&self.sync_call_done, state);
        }
        drop(state);

        self.release_all_match_rules();

        let handler = self.lock().signal_handler.take();
        if let Some(id) = handler {
            self.bus.unregister_signal_handler(id);
        }

        let me = thread::current().id();
        let mut state = self.lock();
        while state.handler_threads.keys().any(|tid| *tid != me) {
            state = self.wait(&self.handler_done, state);
        }
        debug!("Proxy for {} shut down", self.path);
    }
}

impl Drop for ProxyInternal {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.exiting = true;
        // Completions can no longer reach us, so rules still installing are
        // withdrawn without waiting.
        let rules = state.match_rules.drain();
        let handler = state.signal_handler.take();
        for iface in rules {
            if let Err(e) = self.bus.remove_match_non_blocking(&properties_changed_rule(&iface)) {
                warn!("Failed to remove match rule for {iface}: {e}");
            }
        }
        if let Some(id) = handler {
            self.bus.unregister_signal_handler(id);
        }
    }
}
