//! Tests for remote method calls.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::*;
use proxybus::bus::message::owned_value;
use proxybus::constants::{error_names, interfaces, members, status};
use proxybus::{
    BusAttachment, BusError, InterfaceDescription, Message, MessageFlags, ProxyBusObject,
    SecurityPolicy,
};

fn echo(bus: &MockBus) {
    bus.respond_with(|call| {
        (call.member == "Echo").then(|| {
            let text = call.arg_str(0).unwrap_or_default().to_string();
            Message::method_return(call, 77, OWNER, vec![owned_value(text).unwrap()])
        })
    });
}

fn wait_for_sent(bus: &MockBus, count: usize) {
    while bus.sent().len() < count {
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_sync_call() {
    let bus = MockBus::new();
    echo(&bus);
    let proxy = proxy(&bus);
    assert_eq!(proxy.unique_name(), "");

    let args = vec![owned_value("hello").unwrap()];
    let reply = proxy.method_call(IFACE, "Echo", args, None).unwrap();
    assert_eq!(reply.arg_str(0), Some("hello"));

    let call = &bus.calls_to(IFACE, "Echo")[0];
    assert_eq!(call.destination, SERVICE);
    assert_eq!(call.path, PATH);
    assert_eq!(call.signature, "s");
    assert!(!call.flags.contains(MessageFlags::ENCRYPTED));

    // The reply taught us who owns the service.
    assert_eq!(proxy.unique_name(), OWNER);
    proxy
        .method_call(IFACE, "Echo", vec![owned_value("again").unwrap()], None)
        .unwrap();
    assert_eq!(bus.calls_to(IFACE, "Echo")[1].destination, OWNER);
}

#[test]
fn test_structural_errors_send_nothing() {
    let bus = MockBus::new();
    let proxy = proxy(&bus);

    let err = proxy
        .method_call("org.example.Missing", "Echo", vec![], None)
        .unwrap_err();
    assert!(matches!(err, BusError::NoSuchInterface(_)));

    let err = proxy.method_call(IFACE, "Nope", vec![], None).unwrap_err();
    assert!(matches!(err, BusError::NoSuchMember { member, .. } if member == "Nope"));

    assert!(bus.sent().is_empty());
}

#[test]
fn test_error_replies_are_refined() {
    let bus = MockBus::new();
    let proxy = proxy(&bus);

    bus.respond_with(|call| {
        Some(Message::error_reply(
            call,
            1,
            OWNER,
            error_names::PERMISSION_DENIED,
            "denied",
        ))
    });
    let err = proxy.method_call(IFACE, "Echo", vec![], None).unwrap_err();
    assert!(matches!(err, BusError::PermissionDenied { .. }));

    bus.respond_with(|call| Some(Message::status_reply(call, 2, OWNER, 0x9017, "busy")));
    let err = proxy.method_call(IFACE, "Echo", vec![], None).unwrap_err();
    assert!(matches!(err, BusError::Status { code: 0x9017, .. }));
    assert_eq!(err.error_name(), Some(error_names::ER_STATUS));

    bus.respond_with(|call| Some(Message::error_reply(call, 3, OWNER, "org.example.Broken", "x")));
    let err = proxy.method_call(IFACE, "Echo", vec![], None).unwrap_err();
    assert!(matches!(err, BusError::ReplyIsError { ref name, .. } if name == "org.example.Broken"));
    assert!(err.is_remote());
}

#[test]
fn test_timeout() {
    let bus = MockBus::new();
    let proxy = proxy(&bus);

    let caller = {
        let proxy = proxy.clone();
        thread::spawn(move || {
            proxy.method_call(IFACE, "Echo", vec![], Some(Duration::from_millis(10)))
        })
    };
    wait_for_sent(&bus, 1);
    let serial = bus.sent()[0].serial;
    assert!(bus.expire(serial));

    let err = caller.join().unwrap().unwrap_err();
    assert!(matches!(err, BusError::Timeout));
}

#[test]
fn test_shutdown_aborts_sync_calls() {
    let bus = MockBus::new();
    let proxy = proxy(&bus);

    let caller = {
        let proxy = proxy.clone();
        thread::spawn(move || proxy.method_call(IFACE, "Echo", vec![], None))
    };
    wait_for_sent(&bus, 1);
    thread::sleep(Duration::from_millis(50));

    proxy.shutdown();
    let err = caller.join().unwrap().unwrap_err();
    assert!(matches!(err, BusError::MethodCallAborted));

    // The late timeout finds nobody waiting.
    let serial = bus.sent()[0].serial;
    assert!(!bus.expire(serial));

    let err = proxy.method_call(IFACE, "Echo", vec![], None).unwrap_err();
    assert!(matches!(err, BusError::Stopping));
    assert_eq!(bus.sent().len(), 1);
    assert!(!proxy.is_valid());
}

#[test]
fn test_shutdown_withdraws_subscriptions() {
    let bus = MockBus::new();
    let proxy = caching_proxy(&bus);
    assert_eq!(bus.signal_handler_count(), 1);

    proxy.shutdown();
    assert_eq!(bus.removed_rules(), bus.added_rules());
    assert_eq!(bus.signal_handler_count(), 0);

    let recorder = Recorder::new();
    let err = proxy
        .register_properties_changed_listener(IFACE, &[], recorder)
        .unwrap_err();
    assert!(matches!(err, BusError::Stopping));
}

#[test]
fn test_reentrant_blocking_call_is_rejected() {
    let bus = MockBus::new();
    echo(&bus);
    let proxy = proxy(&bus);
    bus.reentrant.store(true, Ordering::SeqCst);

    let err = proxy.method_call(IFACE, "Echo", vec![], None).unwrap_err();
    assert!(matches!(err, BusError::BlockingCallNotAllowed));
    assert!(bus.sent().is_empty());

    // Callbacks do not block, so they are fine.
    proxy
        .method_call_async(IFACE, "Echo", vec![], None, |_| {})
        .unwrap();
    assert_eq!(bus.sent().len(), 1);
}

#[test]
fn test_closing_endpoint() {
    let bus = MockBus::new();
    let proxy = proxy(&bus);
    bus.connected.store(false, Ordering::SeqCst);

    let err = proxy.method_call(IFACE, "Echo", vec![], None).unwrap_err();
    assert!(matches!(err, BusError::EndpointClosing));
    let err = proxy
        .method_call_async(IFACE, "Echo", vec![], None, |_| {})
        .unwrap_err();
    assert!(matches!(err, BusError::EndpointClosing));
    assert!(!proxy.is_valid());
}

#[test]
fn test_secure_proxy_needs_peer_security() {
    let bus = MockBus::new();
    echo(&bus);
    let proxy = proxy(&bus);
    proxy.set_secure(true);
    assert!(proxy.is_secure());

    let err = proxy.method_call(IFACE, "Echo", vec![], None).unwrap_err();
    assert!(matches!(err, BusError::SecurityNotEnabled));
    assert!(bus.sent().is_empty());

    bus.peer_security.store(true, Ordering::SeqCst);
    proxy.method_call(IFACE, "Echo", vec![], None).unwrap();
    assert!(bus.sent()[0].flags.contains(MessageFlags::ENCRYPTED));
}

#[test]
fn test_interface_security_policy() {
    let bus = MockBus::new();
    bus.peer_security.store(true, Ordering::SeqCst);
    bus.respond_with(|call| Some(Message::method_return(call, 9, OWNER, vec![])));
    bus.register_interface(
        InterfaceDescription::builder("org.example.Vault")
            .method("Open", "", "")
            .security(SecurityPolicy::Required)
            .build()
            .unwrap(),
    );

    let proxy = proxy(&bus);
    proxy.add_interface_by_name("org.example.Vault").unwrap();
    proxy
        .method_call("org.example.Vault", "Open", vec![], None)
        .unwrap();
    assert!(bus.sent()[0].flags.contains(MessageFlags::ENCRYPTED));

    // Peer turns security off even on a secure proxy.
    proxy.set_secure(true);
    proxy
        .method_call(interfaces::PEER, members::PING, vec![], None)
        .unwrap();
    assert!(!bus.sent()[1].flags.contains(MessageFlags::ENCRYPTED));
}

#[test]
fn test_no_reply_call() {
    let bus = MockBus::new();
    let proxy = proxy(&bus);

    proxy
        .method_call_no_reply(IFACE, "Echo", vec![owned_value("x").unwrap()])
        .unwrap();
    let sent = bus.sent();
    assert!(sent[0].flags.contains(MessageFlags::NO_REPLY_EXPECTED));
    assert!(bus.pending_replies().is_empty());

    // Same through the flags of a blocking call.
    let reply = proxy
        .method_call_with_flags(
            IFACE,
            "Echo",
            vec![],
            MessageFlags::NO_REPLY_EXPECTED,
            None,
        )
        .unwrap();
    assert!(reply.args.is_empty());
    assert!(bus.pending_replies().is_empty());
}

#[test]
fn test_async_call() {
    let bus = MockBus::new();
    let proxy = proxy(&bus);

    let reply = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&reply);
    proxy
        .method_call_async(IFACE, "Echo", vec![owned_value("hi").unwrap()], None, move |r| {
            *slot.lock().unwrap() = Some(r.map(|m| m.arg_str(0).map(str::to_string)));
        })
        .unwrap();
    assert!(reply.lock().unwrap().is_none());

    let call = bus.sent().remove(0);
    let answer = Message::method_return(&call, 12, OWNER, vec![owned_value("hi").unwrap()]);
    assert!(bus.deliver_reply(call.serial, answer));
    assert!(matches!(
        reply.lock().unwrap().take(),
        Some(Ok(Some(text))) if text == "hi"
    ));
    assert_eq!(proxy.unique_name(), OWNER);
}

#[test]
fn test_async_call_error_reply() {
    let bus = MockBus::new();
    bus.respond_with(|call| {
        Some(Message::error_reply(
            call,
            1,
            OWNER,
            error_names::PERMISSION_DENIED,
            "nope",
        ))
    });
    let proxy = proxy(&bus);

    let result = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&result);
    proxy
        .method_call_async(IFACE, "Echo", vec![], None, move |r| {
            *slot.lock().unwrap() = Some(r.map(|_| ()));
        })
        .unwrap();
    assert!(matches!(
        result.lock().unwrap().take(),
        Some(Err(BusError::PermissionDenied { .. }))
    ));
}

#[test]
fn test_permission_denied_status_reply() {
    let bus = MockBus::new();
    bus.respond_with(|call| {
        Some(Message::status_reply(
            call,
            1,
            OWNER,
            status::PERMISSION_DENIED,
            "policy",
        ))
    });
    let proxy = proxy(&bus);

    let err = proxy.method_call(IFACE, "Echo", vec![], None).unwrap_err();
    assert!(matches!(err, BusError::PermissionDenied { ref description } if description == "policy"));

    let result = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&result);
    proxy
        .method_call_async(IFACE, "Echo", vec![], None, move |r| {
            *slot.lock().unwrap() = Some(r.map(|_| ()));
        })
        .unwrap();
    assert!(matches!(
        result.lock().unwrap().take(),
        Some(Err(BusError::PermissionDenied { .. }))
    ));
}

#[test]
fn test_call_by_member() {
    let bus = MockBus::new();
    echo(&bus);
    let proxy = proxy(&bus);
    let iface = proxy.get_interface(IFACE).unwrap();
    let member = iface.member("Echo").unwrap();

    let reply = proxy
        .method_call_member(
            member,
            vec![owned_value("m").unwrap()],
            MessageFlags::empty(),
            None,
        )
        .unwrap();
    assert_eq!(reply.arg_str(0), Some("m"));
}

#[test]
fn test_calls_outlive_dropped_proxy() {
    let bus = MockBus::new();
    let proxy = proxy(&bus);

    let reply = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&reply);
    proxy
        .method_call_async(IFACE, "Echo", vec![], None, move |r| {
            *slot.lock().unwrap() = Some(r.is_ok());
        })
        .unwrap();
    drop(proxy);

    let call = bus.sent().remove(0);
    let answer = Message::method_return(&call, 12, OWNER, vec![]);
    assert!(bus.deliver_reply(call.serial, answer));
    assert_eq!(*reply.lock().unwrap(), Some(true));
}

#[tokio::test]
async fn test_method_call_future() {
    let bus = MockBus::new();
    echo(&bus);
    let proxy = proxy(&bus);

    let reply = proxy
        .method_call_future(IFACE, "Echo", vec![owned_value("fut").unwrap()], None)
        .await
        .unwrap();
    assert_eq!(reply.arg_str(0), Some("fut"));

    let err = proxy
        .method_call_future(IFACE, "Nope", vec![], None)
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::NoSuchMember { .. }));
}

#[tokio::test]
async fn test_dropped_reply_handler_fails_future() {
    let bus = MockBus::new();
    let proxy = proxy(&bus);

    let pending = proxy.method_call_future(IFACE, "Echo", vec![], None);
    let serial = bus.sent()[0].serial;
    assert!(bus.unregister_reply_handler(serial));

    let err = pending.await.unwrap_err();
    assert!(matches!(err, BusError::ReplyDropped));
}

#[test]
fn test_proxy_is_shareable() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<ProxyBusObject>();
}
