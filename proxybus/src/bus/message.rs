//! Messages exchanged with the transport.
//!
//! Marshaling is the transport's business. A [`Message`] is the decoded form:
//! header fields plus the body as a list of [`OwnedValue`] arguments. The
//! helpers at the bottom of this module convert the `a{sv}` and `as` payloads
//! used by the properties interface to and from plain Rust collections.

use bitflags::bitflags;
use std::collections::HashMap;
use zvariant::{Array, Dict, OwnedValue, Value};

use crate::Result;
use crate::api::models::{BusError, SessionId};
use crate::types::constants::{error_names, interfaces, members, status};

bitflags! {
    /// Header flags of a message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u8 {
        const NO_REPLY_EXPECTED = 0x01;
        const AUTO_START = 0x02;
        const ALLOW_REMOTE_MSG = 0x04;
        const SESSIONLESS = 0x10;
        const GLOBAL_BROADCAST = 0x20;
        const COMPRESSED = 0x40;
        const ENCRYPTED = 0x80;
    }
}

/// Kind of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

/// A decoded bus message.
#[derive(Debug)]
pub struct Message {
    pub msg_type: MessageType,
    /// Serial assigned by the sender.
    pub serial: u32,
    /// Serial of the call this message replies to (`0` for calls and signals).
    pub reply_serial: u32,
    pub flags: MessageFlags,
    pub sender: String,
    pub destination: String,
    pub session_id: SessionId,
    pub path: String,
    pub interface: String,
    pub member: String,
    /// Signature of the body.
    pub signature: String,
    /// Set on error replies only.
    pub error_name: Option<String>,
    pub args: Vec<OwnedValue>,
}

impl Message {
    fn empty(msg_type: MessageType, serial: u32) -> Self {
        Self {
            msg_type,
            serial,
            reply_serial: 0,
            flags: MessageFlags::empty(),
            sender: String::new(),
            destination: String::new(),
            session_id: 0,
            path: String::new(),
            interface: String::new(),
            member: String::new(),
            signature: String::new(),
            error_name: None,
            args: Vec::new(),
        }
    }

    /// Builds a method call.
    pub fn method_call(
        serial: u32,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
        args: Vec<OwnedValue>,
    ) -> Self {
        Self {
            destination: destination.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
            args,
            ..Self::empty(MessageType::MethodCall, serial)
        }
    }

    /// Builds a successful reply to `call`.
    pub fn method_return(call: &Message, serial: u32, sender: &str, args: Vec<OwnedValue>) -> Self {
        Self {
            reply_serial: call.serial,
            sender: sender.to_string(),
            destination: call.sender.clone(),
            session_id: call.session_id,
            args,
            ..Self::empty(MessageType::MethodReturn, serial)
        }
    }

    /// Builds an error reply to `call`. The description is the first argument.
    pub fn error_reply(
        call: &Message,
        serial: u32,
        sender: &str,
        name: &str,
        description: &str,
    ) -> Self {
        Self {
            reply_serial: call.serial,
            sender: sender.to_string(),
            destination: call.sender.clone(),
            session_id: call.session_id,
            error_name: Some(name.to_string()),
            signature: "s".to_string(),
            args: plain_args(vec![Value::from(description.to_string())]),
            ..Self::empty(MessageType::Error, serial)
        }
    }

    /// Builds an `org.alljoyn.Bus.ErStatus` error reply carrying `code`.
    pub fn status_reply(
        call: &Message,
        serial: u32,
        sender: &str,
        code: u16,
        description: &str,
    ) -> Self {
        let mut reply = Self::error_reply(call, serial, sender, error_names::ER_STATUS, description);
        reply.signature = "sq".to_string();
        reply.args.extend(plain_args(vec![Value::from(code)]));
        reply
    }

    /// Builds the reply a transport delivers when the reply timer for the call
    /// with serial `call_serial` expires.
    pub fn timeout_reply(call_serial: u32) -> Self {
        Self {
            reply_serial: call_serial,
            error_name: Some(error_names::ER_STATUS.to_string()),
            signature: "sq".to_string(),
            args: plain_args(vec![Value::from("ER_TIMEOUT"), Value::from(status::TIMEOUT)]),
            ..Self::empty(MessageType::Error, 0)
        }
    }

    /// Builds a signal.
    pub fn signal(
        serial: u32,
        sender: &str,
        path: &str,
        interface: &str,
        member: &str,
        args: Vec<OwnedValue>,
    ) -> Self {
        Self {
            sender: sender.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
            args,
            ..Self::empty(MessageType::Signal, serial)
        }
    }

    /// Builds an `org.freedesktop.DBus.Properties.PropertiesChanged` signal.
    pub fn properties_changed(
        serial: u32,
        sender: &str,
        path: &str,
        interface: &str,
        changed: Vec<(String, OwnedValue)>,
        invalidated: Vec<String>,
    ) -> Result<Self> {
        let args = vec![
            owned_value(interface.to_string())?,
            encode_property_map(changed)?,
            encode_string_array(invalidated)?,
        ];
        Ok(Self::signal(
            serial,
            sender,
            path,
            interfaces::PROPERTIES,
            members::PROPERTIES_CHANGED,
            args,
        )
        .with_signature("sa{sv}as"))
    }

    /// Sets the header flags.
    #[must_use]
    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the session the message travels on.
    #[must_use]
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = session_id;
        self
    }

    /// Sets the body signature.
    #[must_use]
    pub fn with_signature(mut self, signature: &str) -> Self {
        self.signature = signature.to_string();
        self
    }

    /// Copies the message. Fails only if an argument holds a file
    /// descriptor that cannot be duplicated.
    pub fn try_clone(&self) -> Result<Self> {
        let args = self
            .args
            .iter()
            .map(OwnedValue::try_clone)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            sender: self.sender.clone(),
            destination: self.destination.clone(),
            path: self.path.clone(),
            interface: self.interface.clone(),
            member: self.member.clone(),
            signature: self.signature.clone(),
            error_name: self.error_name.clone(),
            args,
            ..*self
        })
    }

    pub fn is_error(&self) -> bool {
        self.msg_type == MessageType::Error
    }

    /// Returns the argument at `index`.
    pub fn arg(&self, index: usize) -> Option<&OwnedValue> {
        self.args.get(index)
    }

    /// Returns the argument at `index` if it is a string.
    pub fn arg_str(&self, index: usize) -> Option<&str> {
        match &**self.args.get(index)? {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Returns the argument at `index` if it is a `u16`.
    pub fn arg_u16(&self, index: usize) -> Option<u16> {
        match &**self.args.get(index)? {
            Value::U16(code) => Some(*code),
            _ => None,
        }
    }

    /// Returns the argument at `index` with any variant wrapper removed.
    pub fn arg_value(&self, index: usize) -> Result<OwnedValue> {
        let arg = self
            .args
            .get(index)
            .ok_or_else(|| BusError::InvalidReply(format!("missing argument {index}")))?;
        unwrap_variant(arg.try_clone()?)
    }
}

// Values without file descriptors always convert.
fn plain_args(values: Vec<Value<'static>>) -> Vec<OwnedValue> {
    values
        .into_iter()
        .filter_map(|value| OwnedValue::try_from(value).ok())
        .collect()
}

/// Converts anything that turns into a [`Value`] into an [`OwnedValue`].
pub fn owned_value<'a>(value: impl Into<Value<'a>>) -> Result<OwnedValue> {
    Ok(OwnedValue::try_from(value.into())?)
}

/// Removes one level of variant (`v`) wrapping.
pub fn unwrap_variant(value: OwnedValue) -> Result<OwnedValue> {
    match Value::from(value) {
        Value::Value(inner) => Ok(OwnedValue::try_from(*inner)?),
        other => Ok(OwnedValue::try_from(other)?),
    }
}

/// Encodes property values as an `a{sv}` dictionary.
pub fn encode_property_map<I>(entries: I) -> Result<OwnedValue>
where
    I: IntoIterator<Item = (String, OwnedValue)>,
{
    let map: HashMap<String, OwnedValue> = entries.into_iter().collect();
    owned_value(Value::Dict(Dict::from(map)))
}

/// Decodes an `a{sv}` dictionary into name/value pairs.
pub fn decode_property_map(value: &OwnedValue) -> Result<Vec<(String, OwnedValue)>> {
    let Value::Dict(dict) = Value::from(unwrap_variant(value.try_clone()?)?) else {
        return Err(BusError::InvalidReply("expected a{sv}".to_string()));
    };
    let map = HashMap::<String, OwnedValue>::try_from(dict)?;
    map.into_iter()
        .map(|(name, value)| Ok((name, unwrap_variant(value)?)))
        .collect()
}

/// Encodes names as an `as` array.
pub fn encode_string_array(names: Vec<String>) -> Result<OwnedValue> {
    owned_value(Value::Array(Array::from(names)))
}

/// Decodes an `as` array.
pub fn decode_string_array(value: &OwnedValue) -> Result<Vec<String>> {
    let Value::Array(array) = Value::from(unwrap_variant(value.try_clone()?)?) else {
        return Err(BusError::InvalidReply("expected as".to_string()));
    };
    Ok(Vec::<String>::try_from(array)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn val(v: u32) -> OwnedValue {
        owned_value(v).unwrap()
    }

    #[test]
    fn test_property_map_round_trip() {
        let encoded =
            encode_property_map(vec![("a".to_string(), val(1)), ("b".to_string(), val(2))])
                .unwrap();
        let mut decoded = decode_property_map(&encoded).unwrap();
        decoded.sort_by(|l, r| l.0.cmp(&r.0));
        assert_eq!(decoded, vec![("a".to_string(), val(1)), ("b".to_string(), val(2))]);
    }

    #[test]
    fn test_decode_property_map_rejects_other_types() {
        assert!(matches!(
            decode_property_map(&val(7)),
            Err(BusError::InvalidReply(_))
        ));
    }

    #[test]
    fn test_string_array() {
        let encoded = encode_string_array(vec!["x".into(), "y".into()]).unwrap();
        assert_eq!(decode_string_array(&encoded).unwrap(), vec!["x", "y"]);
        assert!(decode_string_array(&val(1)).is_err());
    }

    #[test]
    fn test_unwrap_variant() {
        let wrapped = owned_value(Value::Value(Box::new(Value::from(5u32)))).unwrap();
        assert_eq!(unwrap_variant(wrapped).unwrap(), val(5));
        assert_eq!(unwrap_variant(val(6)).unwrap(), val(6));
    }

    #[test]
    fn test_status_reply_arguments() {
        let call = Message::method_call(4, ":1.7", "/obj", "a.b", "M", vec![]);
        let reply = Message::status_reply(&call, 9, ":1.7", 0x1234, "busy");
        assert!(reply.is_error());
        assert_eq!(reply.reply_serial, 4);
        assert_eq!(reply.error_name.as_deref(), Some(error_names::ER_STATUS));
        assert_eq!(reply.arg_str(0), Some("busy"));
        assert_eq!(reply.arg_u16(1), Some(0x1234));
    }

    #[test]
    fn test_timeout_reply() {
        let reply = Message::timeout_reply(12);
        assert_eq!(reply.reply_serial, 12);
        assert_eq!(reply.arg_u16(1), Some(status::TIMEOUT));
    }
}
