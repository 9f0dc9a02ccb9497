//! Interface descriptors.
//!
//! An [`InterfaceDescription`] is immutable once built and shared between
//! proxies as `Arc<InterfaceDescription>`. Proxies never change the metadata
//! they were bound with, so per-interface facts such as "fully cacheable" are
//! computed once when a cache is created.

use std::collections::BTreeMap;
use zbus::names::{InterfaceName, MemberName};

use crate::Result;
use crate::types::constants::{interfaces, members};

/// Whether calls on an interface must be encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityPolicy {
    /// Follow the proxy's secure flag.
    #[default]
    Inherit,
    /// Always encrypt.
    Required,
    /// Never encrypt, even on a secure proxy.
    Off,
}

/// Access rights of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    Read,
    Write,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Method,
    Signal,
}

/// A method or signal of an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Name of the interface this member belongs to.
    pub interface: String,
    pub name: String,
    pub kind: MemberKind,
    pub input_signature: String,
    pub output_signature: String,
}

/// A property of an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub signature: String,
    pub access: PropertyAccess,
    /// Remote value may be kept in the proxy's property cache.
    pub cacheable: bool,
}

/// Metadata describing a named set of methods, signals and properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescription {
    name: String,
    members: BTreeMap<String, Member>,
    properties: BTreeMap<String, Property>,
    security: SecurityPolicy,
}

impl InterfaceDescription {
    /// Starts describing the interface `name`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use proxybus::{InterfaceDescription, PropertyAccess};
    ///
    /// # fn example() -> proxybus::Result<()> {
    /// let iface = InterfaceDescription::builder("org.example.Door")
    ///     .method("Open", "", "")
    ///     .property("IsOpen", "b", PropertyAccess::Read, true)
    ///     .build()?;
    /// assert!(iface.is_fully_cacheable());
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder(name: &str) -> InterfaceBuilder {
        InterfaceBuilder {
            desc: Self::unchecked(name, SecurityPolicy::Inherit),
        }
    }

    fn unchecked(name: &str, security: SecurityPolicy) -> Self {
        Self {
            name: name.to_string(),
            members: BTreeMap::new(),
            properties: BTreeMap::new(),
            security,
        }
    }

    fn push_member(&mut self, name: &str, kind: MemberKind, input: &str, output: &str) {
        self.members.insert(
            name.to_string(),
            Member {
                interface: self.name.clone(),
                name: name.to_string(),
                kind,
                input_signature: input.to_string(),
                output_signature: output.to_string(),
            },
        );
    }

    /// `org.freedesktop.DBus.Properties`.
    pub fn properties_interface() -> Self {
        let mut desc = Self::unchecked(interfaces::PROPERTIES, SecurityPolicy::Inherit);
        desc.push_member(members::GET, MemberKind::Method, "ss", "v");
        desc.push_member(members::SET, MemberKind::Method, "ssv", "");
        desc.push_member(members::GET_ALL, MemberKind::Method, "s", "a{sv}");
        desc.push_member(members::PROPERTIES_CHANGED, MemberKind::Signal, "sa{sv}as", "");
        desc
    }

    /// `org.freedesktop.DBus.Peer`.
    pub fn peer_interface() -> Self {
        let mut desc = Self::unchecked(interfaces::PEER, SecurityPolicy::Off);
        desc.push_member(members::PING, MemberKind::Method, "", "");
        desc.push_member(members::GET_MACHINE_ID, MemberKind::Method, "", "s");
        desc
    }

    /// `org.freedesktop.DBus.Introspectable`.
    pub fn introspectable_interface() -> Self {
        let mut desc = Self::unchecked(interfaces::INTROSPECTABLE, SecurityPolicy::Off);
        desc.push_member(members::INTROSPECT, MemberKind::Method, "", "s");
        desc
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn security_policy(&self) -> SecurityPolicy {
        self.security
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.properties.values()
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    pub fn has_properties(&self) -> bool {
        !self.properties.is_empty()
    }

    /// Returns `true` if at least one property may be cached.
    pub fn has_cacheable_properties(&self) -> bool {
        self.properties.values().any(|p| p.cacheable)
    }

    /// Returns `true` if every property may be cached, which is what allows
    /// a `GetAll` to be answered from the cache.
    pub fn is_fully_cacheable(&self) -> bool {
        self.properties.values().all(|p| p.cacheable)
    }

    /// Returns `true` if the property exists and may be cached.
    pub fn is_cacheable(&self, property: &str) -> bool {
        self.properties.get(property).is_some_and(|p| p.cacheable)
    }
}

/// Builder returned by [`InterfaceDescription::builder`].
///
/// Names are validated when [`build`](InterfaceBuilder::build) is called.
#[derive(Debug, Clone)]
pub struct InterfaceBuilder {
    desc: InterfaceDescription,
}

impl InterfaceBuilder {
    #[must_use]
    pub fn method(mut self, name: &str, input: &str, output: &str) -> Self {
        self.desc.push_member(name, MemberKind::Method, input, output);
        self
    }

    #[must_use]
    pub fn signal(mut self, name: &str, signature: &str) -> Self {
        self.desc.push_member(name, MemberKind::Signal, signature, "");
        self
    }

    #[must_use]
    pub fn property(
        mut self,
        name: &str,
        signature: &str,
        access: PropertyAccess,
        cacheable: bool,
    ) -> Self {
        self.desc.properties.insert(
            name.to_string(),
            Property {
                name: name.to_string(),
                signature: signature.to_string(),
                access,
                cacheable,
            },
        );
        self
    }

    #[must_use]
    pub fn security(mut self, policy: SecurityPolicy) -> Self {
        self.desc.security = policy;
        self
    }

    /// Validates the interface and member names and returns the descriptor.
    pub fn build(self) -> Result<InterfaceDescription> {
        InterfaceName::try_from(self.desc.name.as_str())?;
        for name in self.desc.members.keys().chain(self.desc.properties.keys()) {
            MemberName::try_from(name.as_str())?;
        }
        Ok(self.desc)
    }
}
