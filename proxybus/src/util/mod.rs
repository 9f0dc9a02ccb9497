//! Helper functions shared by the proxy internals.

pub(crate) mod utils;
