//! Core internal logic of the proxy runtime.
//!
//! This module contains the shared proxy state, the property cache, match
//! rule bookkeeping, method call dispatch and PropertiesChanged routing.

pub(crate) mod children;
pub(crate) mod internal;
pub(crate) mod introspect;
pub(crate) mod match_rules;
pub(crate) mod method_call;
pub(crate) mod properties;
pub(crate) mod property_cache;
pub(crate) mod signal_router;
