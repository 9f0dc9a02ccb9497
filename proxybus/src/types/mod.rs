//! Type definitions and constants.
//!
//! This module contains the well-known names and status codes shared by the
//! proxy runtime and its transport.

pub mod constants;
