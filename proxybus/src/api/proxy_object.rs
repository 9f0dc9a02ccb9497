use futures::channel::oneshot;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use zbus::names::BusName;
use zvariant::{ObjectPath, OwnedValue};

use crate::Result;
use crate::api::listener::PropertiesChangedListener;
use crate::api::models::{BusError, PropertyMap, ProxyConfig, SessionId};
use crate::bus::attachment::BusAttachment;
use crate::bus::interface::{InterfaceDescription, Member};
use crate::bus::message::{Message, MessageFlags};
use crate::core::internal::ProxyInternal;
use crate::core::{children, introspect};
use crate::types::constants::interfaces;

/// Local stand-in for an object exposed by a remote peer.
///
/// A proxy is identified by the service it belongs to, the unique name of
/// the connection owning that service, an object path and a session. It
/// carries the interfaces the remote object implements and a tree of child
/// proxies.
///
/// # Creating a proxy
///
/// ```no_run
/// use std::sync::Arc;
/// use proxybus::{BusAttachment, ProxyBusObject, ProxyConfig};
///
/// # fn example(bus: Arc<dyn BusAttachment>) -> proxybus::Result<()> {
/// let proxy = ProxyBusObject::builder(bus, "org.example.Lamp", "/org/example/lamp")
///     .config(ProxyConfig::new().with_property_caching(true))
///     .build()?;
/// proxy.add_interface_by_name("org.example.Lamp")?;
///
/// let brightness = proxy.get_property("org.example.Lamp", "Brightness", None)?;
/// println!("brightness: {brightness:?}");
/// # Ok(())
/// # }
/// ```
///
/// # Calls
///
/// Every remote operation comes in three shapes:
///
/// - a blocking one (`method_call`, `get_property`, ...), which parks the
///   calling thread until the reply arrives, the timeout expires or the
///   proxy is shut down;
/// - a callback one (`*_async`), whose callback runs exactly once if and
///   only if the call returned `Ok`;
/// - a future one (`*_future`) built on the callback one.
///
/// Timeouts are `Option<Duration>`; `None` uses
/// [`ProxyConfig::call_timeout`].
///
/// # Thread Safety
///
/// `ProxyBusObject` is `Clone`, `Send` and `Sync`. Clones are handles to the
/// same remote object and share interfaces, caches, listeners and children.
/// The remote object is torn down when the last handle is dropped.
#[derive(Clone)]
pub struct ProxyBusObject {
    pub(crate) internal: Arc<ProxyInternal>,
}

/// Builder for [`ProxyBusObject`].
pub struct ProxyBuilder {
    bus: Arc<dyn BusAttachment>,
    service_name: String,
    path: String,
    unique_name: Option<String>,
    session_id: SessionId,
    secure: Option<bool>,
    config: ProxyConfig,
}

impl ProxyBuilder {
    /// Sets the unique name of the connection owning the service.
    #[must_use]
    pub fn unique_name(mut self, name: impl Into<String>) -> Self {
        self.unique_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = session_id;
        self
    }

    /// Overrides [`ProxyConfig::secure`].
    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = Some(secure);
        self
    }

    #[must_use]
    pub fn config(mut self, config: ProxyConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the names and creates the proxy.
    ///
    /// # Errors
    ///
    /// Returns an error if the object path or the service name is malformed.
    pub fn build(self) -> Result<ProxyBusObject> {
        ObjectPath::try_from(self.path.as_str())?;
        BusName::try_from(self.service_name.as_str())?;
        if let Some(unique_name) = &self.unique_name {
            BusName::try_from(unique_name.as_str())?;
        }

        let unique_name = match self.unique_name {
            Some(name) => name,
            None if self.service_name.starts_with(':') => self.service_name.clone(),
            None => String::new(),
        };
        let mut config = self.config;
        if let Some(secure) = self.secure {
            config.secure = secure;
        }
        Ok(ProxyBusObject::create(
            self.bus,
            self.service_name,
            unique_name,
            self.path,
            self.session_id,
            config,
        ))
    }
}

impl ProxyBusObject {
    /// Starts building a proxy for the object at `path` of `service`.
    pub fn builder(
        bus: Arc<dyn BusAttachment>,
        service: impl Into<String>,
        path: impl Into<String>,
    ) -> ProxyBuilder {
        ProxyBuilder {
            bus,
            service_name: service.into(),
            path: path.into(),
            unique_name: None,
            session_id: 0,
            secure: None,
            config: ProxyConfig::default(),
        }
    }

    fn create(
        bus: Arc<dyn BusAttachment>,
        service_name: String,
        unique_name: String,
        path: String,
        session_id: SessionId,
        config: ProxyConfig,
    ) -> Self {
        let cache_properties = config.cache_properties;
        let internal = ProxyInternal::new(bus, service_name, unique_name, path, session_id, config);
        internal.bind_standard_interface(interfaces::PEER);
        if cache_properties {
            internal.enable_property_caching();
        }
        Self { internal }
    }

    pub(crate) fn from_internal(internal: Arc<ProxyInternal>) -> Self {
        Self { internal }
    }

    /// Creates an intermediate child at `path` sharing this proxy's bus,
    /// service and session.
    pub(crate) fn placeholder(&self, path: &str, unique_name: String, secure: bool) -> Self {
        let internal = &self.internal;
        Self::create(
            Arc::clone(&internal.bus),
            internal.service_name.clone(),
            unique_name,
            path.to_string(),
            internal.session_id,
            internal.config.clone().with_secure(secure),
        )
    }

    pub fn path(&self) -> &str {
        &self.internal.path
    }

    /// The well-known or unique name the proxy was created for.
    pub fn service_name(&self) -> &str {
        &self.internal.service_name
    }

    /// Unique name of the connection owning the service, empty until known.
    pub fn unique_name(&self) -> String {
        self.internal.unique_name()
    }

    pub fn session_id(&self) -> SessionId {
        self.internal.session_id
    }

    /// Whether calls default to encrypted delivery.
    pub fn is_secure(&self) -> bool {
        self.internal.lock().secure
    }

    /// Changes whether calls on interfaces without their own security
    /// policy are encrypted.
    pub fn set_secure(&self, secure: bool) {
        self.internal.lock().secure = secure;
    }

    /// Returns `false` once the bus is gone or the proxy was shut down.
    pub fn is_valid(&self) -> bool {
        self.internal.bus.is_connected() && !self.internal.lock().exiting
    }

    /// Whether this handle and `other` refer to the same proxy.
    pub fn ptr_eq(&self, other: &ProxyBusObject) -> bool {
        Arc::ptr_eq(&self.internal, &other.internal)
    }

    /// Declares that the remote object implements `iface`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InterfaceAlreadyExists`] if an interface with the
    /// same name is already bound.
    pub fn add_interface(&self, iface: Arc<InterfaceDescription>) -> Result<()> {
        self.internal.add_interface(iface)
    }

    /// Binds the interface named `name` from the bus's descriptor store.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnknownInterface`] if the store has no such
    /// interface, or [`BusError::InterfaceAlreadyExists`].
    pub fn add_interface_by_name(&self, name: &str) -> Result<()> {
        let iface = self
            .internal
            .bus
            .get_interface(name)
            .ok_or_else(|| BusError::UnknownInterface(name.to_string()))?;
        self.internal.add_interface(iface)
    }

    pub fn get_interface(&self, name: &str) -> Option<Arc<InterfaceDescription>> {
        self.internal.interface(name)
    }

    pub fn implements_interface(&self, name: &str) -> bool {
        self.internal.lock().interfaces.contains_key(name)
    }

    /// All bound interfaces, ordered by name.
    pub fn get_interfaces(&self) -> Vec<Arc<InterfaceDescription>> {
        self.internal.lock().interfaces.values().cloned().collect()
    }

    /// Turns on property caching.
    ///
    /// Cached values are only served once the PropertiesChanged match rule
    /// for their interface is installed on the bus.
    pub fn enable_property_caching(&self) {
        self.internal.enable_property_caching();
    }

    /// Calls `interface.member` and waits for the reply.
    ///
    /// # Errors
    ///
    /// Fails without sending anything if the interface is not bound, the
    /// member does not exist, the call must be encrypted while peer
    /// security is off, or the calling thread is delivering bus messages.
    /// Error replies are translated by [`BusError`].
    pub fn method_call(
        &self,
        interface: &str,
        member: &str,
        args: Vec<OwnedValue>,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        self.method_call_with_flags(interface, member, args, MessageFlags::empty(), timeout)
    }

    /// Like [`method_call`](Self::method_call) with extra message flags.
    ///
    /// With [`MessageFlags::NO_REPLY_EXPECTED`] the call returns as soon as
    /// it is sent, with an empty reply.
    pub fn method_call_with_flags(
        &self,
        interface: &str,
        member: &str,
        args: Vec<OwnedValue>,
        flags: MessageFlags,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let member = self.internal.member(interface, member)?;
        self.method_call_member(&member, args, flags, timeout)
    }

    /// Calls a member taken from an interface descriptor.
    pub fn method_call_member(
        &self,
        member: &Member,
        args: Vec<OwnedValue>,
        flags: MessageFlags,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let internal = &self.internal;
        internal.call_sync(member, args, flags, internal.call_timeout(timeout))
    }

    /// Sends a call without waiting for, or expecting, a reply.
    pub fn method_call_no_reply(
        &self,
        interface: &str,
        member: &str,
        args: Vec<OwnedValue>,
    ) -> Result<()> {
        let member = self.internal.member(interface, member)?;
        self.internal
            .call_no_reply(&member, args, MessageFlags::empty())
    }

    /// Calls `interface.member` and hands the reply to `callback`.
    pub fn method_call_async<F>(
        &self,
        interface: &str,
        member: &str,
        args: Vec<OwnedValue>,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<Message>) + Send + 'static,
    {
        let member = self.internal.member(interface, member)?;
        self.method_call_member_async(&member, args, MessageFlags::empty(), timeout, callback)
    }

    pub fn method_call_member_async<F>(
        &self,
        member: &Member,
        args: Vec<OwnedValue>,
        flags: MessageFlags,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<Message>) + Send + 'static,
    {
        let internal = &self.internal;
        internal.call_async(member, args, flags, internal.call_timeout(timeout), callback)
    }

    /// Future form of [`method_call_async`](Self::method_call_async).
    pub fn method_call_future(
        &self,
        interface: &str,
        member: &str,
        args: Vec<OwnedValue>,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Message>> + Send + use<> {
        let (tx, rx) = oneshot::channel();
        let started = self.method_call_async(interface, member, args, timeout, move |result| {
            let _ = tx.send(result);
        });
        await_callback(started, rx)
    }

    /// Reads a property, from the cache when possible.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoSuchInterface`] if the descriptor store does
    /// not know `interface`, and the translated error reply otherwise.
    pub fn get_property(
        &self,
        interface: &str,
        property: &str,
        timeout: Option<Duration>,
    ) -> Result<OwnedValue> {
        self.internal.get_property(interface, property, timeout)
    }

    /// Reads a property and hands the value to `callback`.
    ///
    /// A cached value is delivered through [`BusAttachment::schedule`],
    /// never before this returns.
    pub fn get_property_async<F>(
        &self,
        interface: &str,
        property: &str,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<OwnedValue>) + Send + 'static,
    {
        self.internal
            .get_property_async(interface, property, timeout, callback)
    }

    pub fn get_property_future(
        &self,
        interface: &str,
        property: &str,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<OwnedValue>> + Send + use<> {
        let (tx, rx) = oneshot::channel();
        let started = self.get_property_async(interface, property, timeout, move |result| {
            let _ = tx.send(result);
        });
        await_callback(started, rx)
    }

    /// Reads every property of `interface`.
    ///
    /// The cache answers only when it holds every property of a fully
    /// cacheable interface.
    pub fn get_all_properties(
        &self,
        interface: &str,
        timeout: Option<Duration>,
    ) -> Result<PropertyMap> {
        self.internal.get_all_properties(interface, timeout)
    }

    pub fn get_all_properties_async<F>(
        &self,
        interface: &str,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<PropertyMap>) + Send + 'static,
    {
        self.internal
            .get_all_properties_async(interface, timeout, callback)
    }

    pub fn get_all_properties_future(
        &self,
        interface: &str,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<PropertyMap>> + Send + use<> {
        let (tx, rx) = oneshot::channel();
        let started = self.get_all_properties_async(interface, timeout, move |result| {
            let _ = tx.send(result);
        });
        await_callback(started, rx)
    }

    /// Writes a property.
    ///
    /// The cache is not touched; the PropertiesChanged signal the remote
    /// object emits updates it.
    pub fn set_property(
        &self,
        interface: &str,
        property: &str,
        value: OwnedValue,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.internal
            .set_property(interface, property, value, timeout)
    }

    pub fn set_property_async<F>(
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
        self.internal
            .set_property_async(interface, property, value, timeout, callback)
    }

    pub fn set_property_future(
        &self,
        interface: &str,
        property: &str,
        value: OwnedValue,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send + use<> {
        let (tx, rx) = oneshot::channel();
        let started = self.set_property_async(interface, property, value, timeout, move |result| {
            let _ = tx.send(result);
        });
        await_callback(started, rx)
    }

    /// Registers `listener` for changes of `properties` on `interface`, or
    /// of every property when `properties` is empty.
    ///
    /// Blocks until the PropertiesChanged match rule is installed.
    /// Registering the same listener again replaces its property set.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoSuchInterface`] or [`BusError::NoSuchProperty`]
    /// for unknown names, and a transport error if the match rule could not
    /// be installed, in which case nothing is registered.
    pub fn register_properties_changed_listener(
        &self,
        interface: &str,
        properties: &[&str],
        listener: Arc<dyn PropertiesChangedListener>,
    ) -> Result<()> {
        self.internal
            .register_listener(interface, properties, listener)
    }

    /// Unregisters `listener`, waiting for its callbacks running on other
    /// threads to return.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Deadlock`] when called from the listener's own
    /// callback.
    pub fn unregister_properties_changed_listener(
        &self,
        interface: &str,
        listener: &Arc<dyn PropertiesChangedListener>,
    ) -> Result<()> {
        self.internal.unregister_listener(interface, listener)
    }

    /// Adds `child` below this proxy, creating placeholders for missing
    /// intermediate objects.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::BadChildPath`] if `child` does not live below
    /// this proxy and [`BusError::ObjectAlreadyExists`] if it is already
    /// present.
    pub fn add_child(&self, child: ProxyBusObject) -> Result<()> {
        children::add_child(self, child)
    }

    /// Finds a descendant by absolute or relative path.
    pub fn get_child(&self, path: &str) -> Option<ProxyBusObject> {
        children::get_child(self, path)
    }

    pub fn remove_child(&self, path: &str) -> Result<()> {
        children::remove_child(self, path)
    }

    /// Direct children of this proxy.
    pub fn get_children(&self) -> Vec<ProxyBusObject> {
        self.internal.lock().children.clone()
    }

    /// Asks the remote object to describe itself and lets the bus's
    /// introspection parser fill in interfaces and children.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoSuchService`] when nobody owns the service.
    pub fn introspect_remote_object(&self, timeout: Option<Duration>) -> Result<()> {
        introspect::introspect(self, timeout)
    }

    pub fn introspect_remote_object_async<F>(
        &self,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        introspect::introspect_async(self, timeout, callback)
    }

    /// Establishes a secure session with the remote peer.
    pub fn secure_connection(&self, force_auth: bool) -> Result<()> {
        if !self.internal.bus.is_peer_security_enabled() {
            return Err(BusError::SecurityNotEnabled);
        }
        self.internal
            .bus
            .secure_connection(self.service_name(), force_auth)
    }

    pub fn secure_connection_async(&self, force_auth: bool) -> Result<()> {
        if !self.internal.bus.is_peer_security_enabled() {
            return Err(BusError::SecurityNotEnabled);
        }
        self.internal
            .bus
            .secure_connection_async(self.service_name(), force_auth)
    }

    /// Starts tearing the proxy down.
    ///
    /// Synchronous calls in flight return [`BusError::MethodCallAborted`],
    /// later ones [`BusError::Stopping`]. Match rules and the
    /// PropertiesChanged handler are removed. Returns once calls and signal
    /// dispatch on other threads have drained.
    pub fn shutdown(&self) {
        self.internal.shutdown();
    }
}

async fn await_callback<T>(started: Result<()>, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    started?;
    rx.await.map_err(|_| BusError::ReplyDropped)?
}

impl fmt::Debug for ProxyBusObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyBusObject")
            .field("service_name", &self.internal.service_name)
            .field("path", &self.internal.path)
            .field("session_id", &self.internal.session_id)
            .finish_non_exhaustive()
    }
}
