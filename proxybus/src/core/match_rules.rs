//! Reference-counted PropertiesChanged match rules.
//!
//! Caches and listeners of the same interface share a single match rule on
//! the bus. The first reference installs it asynchronously; while the bus has
//! not answered, the record is marked installing and both further acquirers
//! that want to block and releasers wait for the answer.

use log::{debug, warn};
use std::collections::HashMap;

use crate::Result;
use crate::api::models::BusError;
use crate::core::internal::ProxyInternal;
use crate::types::constants::{interfaces, members};

/// Match rule delivering PropertiesChanged signals for `interface`.
pub(crate) fn properties_changed_rule(interface: &str) -> String {
    format!(
        "type='signal',interface='{}',member='{}',arg0='{interface}'",
        interfaces::PROPERTIES,
        members::PROPERTIES_CHANGED
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MatchRuleRecord {
    pub(crate) installing: bool,
    pub(crate) ref_count: usize,
}

/// What an acquisition found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquisition {
    /// No record existed; the caller must install the rule.
    First,
    /// Another acquirer is installing the rule.
    Installing,
    Installed,
}

#[derive(Debug, Default)]
pub(crate) struct MatchRuleRegistry {
    records: HashMap<String, MatchRuleRecord>,
}

impl MatchRuleRegistry {
    pub(crate) fn acquire(&mut self, interface: &str) -> Acquisition {
        match self.records.get_mut(interface) {
            Some(record) => {
                record.ref_count += 1;
                if record.installing {
                    Acquisition::Installing
                } else {
                    Acquisition::Installed
                }
            }
            None => {
                self.records.insert(
                    interface.to_string(),
                    MatchRuleRecord {
                        installing: true,
                        ref_count: 1,
                    },
                );
                Acquisition::First
            }
        }
    }

    /// Records the bus's answer to an installation. A failed installation
    /// discards the record together with every reference taken meanwhile.
    /// Returns `true` if the rule is now installed.
    pub(crate) fn complete(&mut self, interface: &str, installed: bool) -> bool {
        if !installed {
            self.records.remove(interface);
            return false;
        }
        match self.records.get_mut(interface) {
            Some(record) => {
                record.installing = false;
                true
            }
            None => false,
        }
    }

    /// Drops one reference. Must not be called while the rule is installing.
    /// Returns `true` if that was the last reference and the rule must be
    /// removed from the bus.
    pub(crate) fn release(&mut self, interface: &str) -> bool {
        let Some(record) = self.records.get_mut(interface) else {
            return false;
        };
        record.ref_count = record.ref_count.saturating_sub(1);
        if record.ref_count == 0 {
            self.records.remove(interface);
            true
        } else {
            false
        }
    }

    pub(crate) fn is_installing(&self, interface: &str) -> bool {
        self.records.get(interface).is_some_and(|r| r.installing)
    }

    pub(crate) fn is_installed(&self, interface: &str) -> bool {
        self.records.get(interface).is_some_and(|r| !r.installing)
    }

    pub(crate) fn any_installing(&self) -> bool {
        self.records.values().any(|r| r.installing)
    }

    #[cfg(test)]
    pub(crate) fn get(&self, interface: &str) -> Option<MatchRuleRecord> {
        self.records.get(interface).copied()
    }

    /// Removes every record and returns the interface names.
    pub(crate) fn drain(&mut self) -> Vec<String> {
        self.records.drain().map(|(name, _)| name).collect()
    }
}

impl ProxyInternal {
    /// Takes a reference on the match rule for `interface`, installing it if
    /// this is the first one. With `blocking`, waits until the bus answered.
    pub(crate) fn acquire_match_rule(&self, interface: &str, blocking: bool) -> Result<()> {
        self.ensure_signal_handler()?;

        let acquisition = {
            let mut state = self.lock();
            if state.exiting {
                return Err(BusError::Stopping);
            }
            state.match_rules.acquire(interface)
        };

        if acquisition == Acquisition::First {
            let rule = properties_changed_rule(interface);
            debug!("Adding match rule: {rule}");
            let weak = self.weak_self.clone();
            let name = interface.to_string();
            let completion = Box::new(move |result: Result<()>| {
                if let Some(internal) = weak.upgrade() {
                    internal.on_match_rule_added(&name, result);
                }
            });
            if let Err(e) = self.bus.add_match_async(&rule, completion) {
                warn!("Failed to add match rule for {interface}: {e}");
                let mut state = self.lock();
                state.match_rules.complete(interface, false);
                self.add_match_done.notify_all();
                return Err(e);
            }
        }

        let mut state = self.lock();
        if state.match_rules.is_installed(interface) {
            if let Some(cache) = state.caches.get_mut(interface) {
                cache.enable();
            }
        }
        if !blocking {
            return Ok(());
        }
        while state.match_rules.is_installing(interface) {
            state = self.wait(&self.add_match_done, state);
        }
        if state.match_rules.is_installed(interface) {
            Ok(())
        } else {
            Err(BusError::Transport(format!(
                "match rule for {interface} was not installed"
            )))
        }
    }

    fn on_match_rule_added(&self, interface: &str, result: Result<()>) {
        let mut state = self.lock();
        match result {
            Ok(()) => {
                if state.match_rules.complete(interface, true) {
                    debug!("Match rule for {interface} installed");
                    if let Some(cache) = state.caches.get_mut(interface) {
                        cache.enable();
                    }
                }
            }
            Err(e) => {
                warn!("Bus rejected match rule for {interface}: {e}");
                state.match_rules.complete(interface, false);
            }
        }
        self.add_match_done.notify_all();
    }

    /// Drops a reference on the match rule for `interface`, removing the rule
    /// from the bus with the last one.
    pub(crate) fn release_match_rule(&self, interface: &str) {
        let mut state = self.lock();
        while state.match_rules.is_installing(interface) {
            state = self.wait(&self.add_match_done, state);
        }
        if !state.match_rules.release(interface) {
            return;
        }
        drop(state);
        self.remove_match_rule(interface);
    }

    /// Removes every match rule, waiting for installations in flight first.
    pub(crate) fn release_all_match_rules(&self) {
        let mut state = self.lock();
        while state.match_rules.any_installing() {
            state = self.wait(&self.add_match_done, state);
        }
        let rules = state.match_rules.drain();
        drop(state);
        for interface in rules {
            self.remove_match_rule(&interface);
        }
    }

    fn remove_match_rule(&self, interface: &str) {
        let rule = properties_changed_rule(interface);
        debug!("Removing match rule: {rule}");
        if let Err(e) = self.bus.remove_match_non_blocking(&rule) {
            warn!("Failed to remove match rule for {interface}: {e}");
        }
    }
}
