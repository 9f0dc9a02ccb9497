//! Callbacks for property change notifications.

use zvariant::OwnedValue;

use crate::api::proxy_object::ProxyBusObject;

/// Receives PropertiesChanged notifications for a proxy.
///
/// Callbacks run on the thread that delivers the signal, without any proxy
/// lock held. A listener may call back into the proxy, including registering
/// or unregistering other listeners. Unregistering itself from within its own
/// callback fails with [`BusError::Deadlock`](crate::BusError::Deadlock).
///
/// Listeners are identified by their `Arc`: registering the same `Arc` twice
/// for one interface replaces the first registration.
///
/// # Example
///
/// ```rust
/// use proxybus::{PropertiesChangedListener, ProxyBusObject};
/// use zvariant::OwnedValue;
///
/// struct Printer;
///
/// impl PropertiesChangedListener for Printer {
///     fn properties_changed(
///         &self,
///         proxy: &ProxyBusObject,
///         interface: &str,
///         changed: &[(&str, &OwnedValue)],
///         invalidated: &[&str],
///     ) {
///         for (name, value) in changed {
///             println!("{}: {interface}.{name} = {value:?}", proxy.path());
///         }
///         for name in invalidated {
///             println!("{}: {interface}.{name} invalidated", proxy.path());
///         }
///     }
/// }
/// ```
pub trait PropertiesChangedListener: Send + Sync {
    /// Called with the changed and invalidated properties the listener
    /// asked for. Never called with both lists empty.
    fn properties_changed(
        &self,
        proxy: &ProxyBusObject,
        interface: &str,
        changed: &[(&str, &OwnedValue)],
        invalidated: &[&str],
    );
}
