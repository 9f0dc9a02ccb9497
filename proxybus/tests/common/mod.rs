//! In-memory bus used by the integration tests.
//!
//! `MockBus` records everything a proxy sends, answers calls through a
//! responder closure and lets tests complete match rules, deliver replies
//! and emit signals at the moment they choose.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use proxybus::bus::message::{encode_property_map, owned_value};
use proxybus::{
    BusAttachment, BusError, InterfaceDescription, MatchCompletion, Message, MessageFlags,
    PropertiesChangedListener, PropertyAccess, PropertyMap, ProxyBusObject, ProxyConfig,
    ReplyHandler, SignalHandler, SignalHandlerId, Task,
};
use zvariant::{OwnedValue, Value};

pub const SERVICE: &str = "org.example.Service";
pub const OWNER: &str = ":1.42";
pub const PATH: &str = "/org/example/thing";
pub const IFACE: &str = "org.example.X";

/// Computes the reply to a call, or `None` to leave it pending.
pub type Responder = Box<dyn Fn(&Message) -> Option<Message> + Send + Sync>;

struct SignalRegistration {
    path: String,
    interface: String,
    member: String,
    handler: SignalHandler,
}

#[derive(Default)]
struct State {
    sent: Vec<Message>,
    reply_handlers: HashMap<u32, ReplyHandler>,
    pending_matches: Vec<(String, MatchCompletion)>,
    added_rules: Vec<String>,
    removed_rules: Vec<String>,
    signal_handlers: HashMap<u64, SignalRegistration>,
    scheduled: Vec<Task>,
    owners: HashMap<String, String>,
    introspected: Vec<(String, String)>,
}

pub struct MockBus {
    state: Mutex<State>,
    responder: Mutex<Option<Arc<Responder>>>,
    interfaces: Mutex<HashMap<String, Arc<InterfaceDescription>>>,
    serial: AtomicU32,
    next_handler: AtomicU64,
    pub connected: AtomicBool,
    pub peer_security: AtomicBool,
    pub reentrant: AtomicBool,
    pub defer_matches: AtomicBool,
    pub reject_matches: AtomicBool,
}

impl MockBus {
    pub fn new() -> Arc<Self> {
        let bus = Self {
            state: Mutex::new(State::default()),
            responder: Mutex::new(None),
            interfaces: Mutex::new(HashMap::new()),
            serial: AtomicU32::new(1000),
            next_handler: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            peer_security: AtomicBool::new(false),
            reentrant: AtomicBool::new(false),
            defer_matches: AtomicBool::new(false),
            reject_matches: AtomicBool::new(false),
        };
        bus.register_interface(InterfaceDescription::properties_interface());
        bus.register_interface(InterfaceDescription::peer_interface());
        bus.register_interface(InterfaceDescription::introspectable_interface());
        bus.register_interface(x_interface());
        bus.set_owner(SERVICE, OWNER);
        Arc::new(bus)
    }

    pub fn register_interface(&self, iface: InterfaceDescription) -> Arc<InterfaceDescription> {
        let iface = Arc::new(iface);
        self.interfaces
            .lock()
            .unwrap()
            .insert(iface.name().to_string(), Arc::clone(&iface));
        iface
    }

    pub fn set_owner(&self, alias: &str, owner: &str) {
        self.state
            .lock()
            .unwrap()
            .owners
            .insert(alias.to_string(), owner.to_string());
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&Message) -> Option<Message> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Arc::new(Box::new(responder)));
    }

    pub fn sent(&self) -> Vec<Message> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(|m| m.try_clone().unwrap())
            .collect()
    }

    /// Calls sent for `interface.member`.
    pub fn calls_to(&self, interface: &str, member: &str) -> Vec<Message> {
        self.sent()
            .into_iter()
            .filter(|m| m.interface == interface && m.member == member)
            .collect()
    }

    pub fn added_rules(&self) -> Vec<String> {
        self.state.lock().unwrap().added_rules.clone()
    }

    pub fn removed_rules(&self) -> Vec<String> {
        self.state.lock().unwrap().removed_rules.clone()
    }

    pub fn pending_replies(&self) -> Vec<u32> {
        self.state.lock().unwrap().reply_handlers.keys().copied().collect()
    }

    pub fn signal_handler_count(&self) -> usize {
        self.state.lock().unwrap().signal_handlers.len()
    }

    pub fn introspected(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().introspected.clone()
    }

    /// Delivers `reply` to the handler of the call with `call_serial`.
    pub fn deliver_reply(&self, call_serial: u32, reply: Message) -> bool {
        let handler = self.state.lock().unwrap().reply_handlers.remove(&call_serial);
        match handler {
            Some(handler) => {
                handler(reply);
                true
            }
            None => false,
        }
    }

    /// Fires the reply timer of the call with `call_serial`.
    pub fn expire(&self, call_serial: u32) -> bool {
        self.deliver_reply(call_serial, Message::timeout_reply(call_serial))
    }

    /// Answers every deferred `AddMatch`.
    pub fn complete_matches(&self, installed: bool) {
        let pending = std::mem::take(&mut self.state.lock().unwrap().pending_matches);
        for (rule, completion) in pending {
            if installed {
                completion(Ok(()));
            } else {
                completion(Err(BusError::Transport(format!("AddMatch {rule} rejected"))));
            }
        }
    }

    /// Delivers `signal` to every handler registered for it.
    pub fn emit(&self, signal: &Message) {
        let handlers: Vec<SignalHandler> = self
            .state
            .lock()
            .unwrap()
            .signal_handlers
            .values()
            .filter(|r| {
                r.path == signal.path && r.interface == signal.interface && r.member == signal.member
            })
            .map(|r| Arc::clone(&r.handler))
            .collect();
        for handler in handlers {
            handler(signal);
        }
    }

    /// Runs the tasks handed to [`BusAttachment::schedule`].
    pub fn run_scheduled(&self) -> usize {
        let tasks = std::mem::take(&mut self.state.lock().unwrap().scheduled);
        let count = tasks.len();
        for task in tasks {
            task();
        }
        count
    }
}

impl BusAttachment for MockBus {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn next_serial(&self) -> u32 {
        self.serial.fetch_add(1, Ordering::SeqCst)
    }

    fn send_message(&self, msg: Message) -> proxybus::Result<()> {
        if !self.is_connected() {
            return Err(BusError::EndpointClosing);
        }
        self.state
            .lock()
            .unwrap()
            .sent
            .push(msg.try_clone().unwrap());
        if msg.flags.contains(MessageFlags::NO_REPLY_EXPECTED) {
            return Ok(());
        }
        let responder = self.responder.lock().unwrap().clone();
        if let Some(reply) = responder.and_then(|respond| respond(&msg)) {
            self.deliver_reply(msg.serial, reply);
        }
        Ok(())
    }

    fn register_reply_handler(
        &self,
        serial: u32,
        handler: ReplyHandler,
        _timeout: Duration,
    ) -> proxybus::Result<()> {
        self.state
            .lock()
            .unwrap()
            .reply_handlers
            .insert(serial, handler);
        Ok(())
    }

    fn unregister_reply_handler(&self, serial: u32) -> bool {
        self.state
            .lock()
            .unwrap()
            .reply_handlers
            .remove(&serial)
            .is_some()
    }

    fn add_match_async(&self, rule: &str, completion: MatchCompletion) -> proxybus::Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.added_rules.push(rule.to_string());
            if self.defer_matches.load(Ordering::SeqCst) {
                state.pending_matches.push((rule.to_string(), completion));
                return Ok(());
            }
        }
        if self.reject_matches.load(Ordering::SeqCst) {
            completion(Err(BusError::Transport("AddMatch rejected".to_string())));
        } else {
            completion(Ok(()));
        }
        Ok(())
    }

    fn remove_match_non_blocking(&self, rule: &str) -> proxybus::Result<()> {
        self.state
            .lock()
            .unwrap()
            .removed_rules
            .push(rule.to_string());
        Ok(())
    }

    fn register_signal_handler(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        handler: SignalHandler,
    ) -> proxybus::Result<SignalHandlerId> {
        let id = self.next_handler.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().signal_handlers.insert(
            id,
            SignalRegistration {
                path: path.to_string(),
                interface: interface.to_string(),
                member: member.to_string(),
                handler,
            },
        );
        Ok(SignalHandlerId(id))
    }

    fn unregister_signal_handler(&self, id: SignalHandlerId) {
        self.state.lock().unwrap().signal_handlers.remove(&id.0);
    }

    fn get_name_owner(&self, alias: &str) -> proxybus::Result<String> {
        self.state
            .lock()
            .unwrap()
            .owners
            .get(alias)
            .cloned()
            .ok_or_else(|| BusError::NoSuchService(alias.to_string()))
    }

    fn is_peer_security_enabled(&self) -> bool {
        self.peer_security.load(Ordering::SeqCst)
    }

    fn is_reentrant_call(&self) -> bool {
        self.reentrant.load(Ordering::SeqCst)
    }

    fn schedule(&self, task: Task) {
        self.state.lock().unwrap().scheduled.push(task);
    }

    fn get_interface(&self, name: &str) -> Option<Arc<InterfaceDescription>> {
        self.interfaces.lock().unwrap().get(name).cloned()
    }

    fn secure_connection(&self, name: &str, _force_auth: bool) -> proxybus::Result<()> {
        self.get_name_owner(name).map(|_| ())
    }

    fn parse_introspection(
        &self,
        proxy: &ProxyBusObject,
        xml: &str,
        ident: &str,
    ) -> proxybus::Result<()> {
        self.state
            .lock()
            .unwrap()
            .introspected
            .push((ident.to_string(), xml.to_string()));
        for line in xml.lines() {
            if let Some(name) = line.trim().strip_prefix("interface ") {
                proxy.add_interface_by_name(name)?;
            }
        }
        Ok(())
    }
}

/// `org.example.X` with cacheable properties `a` and `b`, a method and a
/// signal.
pub fn x_interface() -> InterfaceDescription {
    InterfaceDescription::builder(IFACE)
        .property("a", "u", PropertyAccess::ReadWrite, true)
        .property("b", "u", PropertyAccess::ReadWrite, true)
        .method("Echo", "s", "s")
        .signal("Ping", "")
        .build()
        .unwrap()
}

pub fn u32_value(value: u32) -> OwnedValue {
    owned_value(value).unwrap()
}

pub fn variant(value: u32) -> OwnedValue {
    owned_value(Value::Value(Box::new(Value::from(value)))).unwrap()
}

pub fn props(entries: &[(&str, u32)]) -> Vec<(String, OwnedValue)> {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), u32_value(*value)))
        .collect()
}

pub fn get_all_reply(call: &Message, serial: u32, entries: &[(&str, u32)]) -> Message {
    Message::method_return(
        call,
        serial,
        OWNER,
        vec![encode_property_map(props(entries)).unwrap()],
    )
}

pub fn get_reply(call: &Message, serial: u32, value: u32) -> Message {
    Message::method_return(call, serial, OWNER, vec![variant(value)])
}

pub fn changed_signal(serial: u32, changed: &[(&str, u32)], invalidated: &[&str]) -> Message {
    changed_signal_from(OWNER, serial, changed, invalidated)
}

pub fn changed_signal_from(
    sender: &str,
    serial: u32,
    changed: &[(&str, u32)],
    invalidated: &[&str],
) -> Message {
    Message::properties_changed(
        serial,
        sender,
        PATH,
        IFACE,
        props(changed),
        invalidated.iter().map(|s| s.to_string()).collect(),
    )
    .unwrap()
}

pub fn proxy(bus: &Arc<MockBus>) -> ProxyBusObject {
    let bus: Arc<dyn BusAttachment> = bus.clone();
    let proxy = ProxyBusObject::builder(bus, SERVICE, PATH).build().unwrap();
    proxy.add_interface_by_name(IFACE).unwrap();
    proxy
}

pub fn caching_proxy(bus: &Arc<MockBus>) -> ProxyBusObject {
    let bus: Arc<dyn BusAttachment> = bus.clone();
    let proxy = ProxyBusObject::builder(bus, SERVICE, PATH)
        .config(ProxyConfig::new().with_property_caching(true))
        .build()
        .unwrap();
    proxy.add_interface_by_name(IFACE).unwrap();
    proxy
}

pub fn member_of(msg: &Message) -> (&str, &str) {
    (msg.interface.as_str(), msg.member.as_str())
}

pub fn str_arg(msg: &Message, index: usize) -> String {
    msg.arg_str(index).unwrap_or_default().to_string()
}

pub fn as_u32(value: &OwnedValue) -> u32 {
    match &**value {
        Value::U32(v) => *v,
        other => panic!("expected u32, got {other:?}"),
    }
}

/// One delivered notification: interface, changed values, invalidated names.
pub type Event = (String, Vec<(String, u32)>, Vec<String>);

/// Listener that records every notification it receives.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl PropertiesChangedListener for Recorder {
    fn properties_changed(
        &self,
        _proxy: &ProxyBusObject,
        interface: &str,
        changed: &[(&str, &OwnedValue)],
        invalidated: &[&str],
    ) {
        self.events.lock().unwrap().push((
            interface.to_string(),
            changed
                .iter()
                .map(|(name, value)| (name.to_string(), as_u32(value)))
                .collect(),
            invalidated.iter().map(|name| name.to_string()).collect(),
        ));
    }
}

pub fn u32_map(map: &PropertyMap) -> BTreeMap<String, u32> {
    map.iter()
        .map(|(name, value)| (name.clone(), as_u32(value)))
        .collect()
}

pub fn expected(entries: &[(&str, u32)]) -> BTreeMap<String, u32> {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect()
}
