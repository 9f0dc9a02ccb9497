//! Public API module.
//!
//! This module contains the user-facing API of the `proxybus` crate: the
//! proxy object, its configuration and errors, and the listener trait.

pub mod listener;
pub mod models;
pub mod proxy_object;
