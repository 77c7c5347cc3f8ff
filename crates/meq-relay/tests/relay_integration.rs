use meq_core::status::{format_compact, ExecPhase, ResultCode};
use meq_core::NodeIndex;
use meq_relay::{
    channel, Address, ConnectionState, EventRelay, MemoryLogSink, NodeFilter, RecordingTransport,
    RelayConfig, RelayEvent, SubscriptionHandle, WaitTimeout,
};
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

fn relay() -> (EventRelay, RecordingTransport) {
    let transport = RecordingTransport::new();
    let relay = EventRelay::new(RelayConfig::default(), Box::new(transport.clone()));
    (relay, transport)
}

fn record_events(relay: &EventRelay, pattern: &str) -> Rc<RefCell<Vec<RelayEvent>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    relay.subscribe(pattern, move |event: &RelayEvent| {
        sink.borrow_mut().push(event.clone());
        Ok(())
    });
    seen
}

#[test]
fn prefix_pattern_sees_stripped_name_once() {
    let (mut relay, _) = relay();
    let seen = record_events(&relay, "App.Out.*");
    let source = Address::from("srvA");

    relay
        .deliver("App.Out.Result", json!({"value": 1}), &source)
        .expect("deliver");
    relay
        .deliver("App.Debug.Result", json!({"value": 2}), &source)
        .expect("deliver");

    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].name, "Result");
    assert_eq!(seen[0].id, "App.Out.Result");
    assert_eq!(seen[0].payload, json!({"value": 1}));
    assert_eq!(seen[0].source, source);
}

#[test]
fn self_unsubscribe_mid_dispatch_keeps_the_other_two() {
    let (mut relay, _) = relay();
    let calls = Rc::new(RefCell::new(Vec::new()));
    let own: Rc<RefCell<Option<SubscriptionHandle>>> = Rc::new(RefCell::new(None));

    let log = calls.clone();
    relay.subscribe("App.Out.*", move |_: &RelayEvent| {
        log.borrow_mut().push("first");
        Ok(())
    });
    let log = calls.clone();
    let slot = own.clone();
    let handle = relay.subscribe("App.Out.*", move |_: &RelayEvent| {
        log.borrow_mut().push("second");
        if let Some(handle) = slot.borrow().as_ref() {
            handle.cancel();
        }
        Ok(())
    });
    *own.borrow_mut() = Some(handle);
    let log = calls.clone();
    relay.subscribe("App.Out.*", move |_: &RelayEvent| {
        log.borrow_mut().push("third");
        Ok(())
    });

    relay
        .deliver("App.Out.Tick", json!({}), &Address::from("srv"))
        .expect("deliver");
    assert_eq!(*calls.borrow(), vec!["first", "second", "third"]);
    assert_eq!(relay.subscriber_count(), 2);

    relay
        .deliver("App.Out.Tick", json!({}), &Address::from("srv"))
        .expect("deliver");
    assert_eq!(
        *calls.borrow(),
        vec!["first", "second", "third", "first", "third"]
    );
}

#[test]
fn failing_subscriber_does_not_stop_dispatch() {
    let (mut relay, _) = relay();
    relay.subscribe("App.Out.*", |_: &RelayEvent| {
        Err(anyhow::anyhow!("observer rejected event"))
    });
    relay.subscribe("App.Out.*", |_: &RelayEvent| -> anyhow::Result<()> {
        panic!("observer crashed")
    });
    let reached = Rc::new(Cell::new(0));
    let counter = reached.clone();
    relay.subscribe("App.Out.*", move |_: &RelayEvent| {
        counter.set(counter.get() + 1);
        Ok(())
    });

    relay
        .deliver("App.Out.Result", json!({}), &Address::from("srv"))
        .expect("deliver");
    assert_eq!(reached.get(), 1);
    assert_eq!(relay.subscriber_count(), 3);
}

#[test]
fn session_from_hello_to_remote_down() {
    let (mut relay, transport) = relay();
    let log = MemoryLogSink::new(16);
    relay.set_log_sink(Box::new(log.clone()));
    let lifecycle = record_events(&relay, "Relay.Connection.*");

    let changes = Rc::new(RefCell::new(Vec::new()));
    let sink = changes.clone();
    relay.subscribe_nodes(NodeFilter::All, move |change| {
        sink.borrow_mut()
            .push((change.node.index, format_compact(&change.new)));
        Ok(())
    });

    let server = Address::from("gw1.kernel");
    relay.auto_attach_rule(None, Some("node7".to_string()));
    relay
        .deliver(
            "App.Out.Hello",
            json!({"app_host": "node7", "pid": 4242, "session_name": "demo"}),
            &server,
        )
        .expect("hello");
    assert_eq!(relay.connections().current_address(), Some(&server));

    relay.request_node_list().expect("request");
    let sent = transport.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].destination, server);

    relay
        .deliver(
            "App.Out.Node.List",
            json!({
                "serial": 1,
                "nodeindex": [1, 2, 3],
                "name": ["solver", "condeq", "spigot"],
                "class": ["MeqSolver", "MeqCondeq", "MeqSpigot"],
                "children": [[2], [3, -1], []],
                "control_status": [0, 0, 0]
            }),
            &server,
        )
        .expect("snapshot");
    assert_eq!(relay.registry().len(), 3);
    assert_eq!(relay.registry().roots()[0].name.as_deref(), Some("solver"));

    relay
        .deliver(
            "App.Out.Node.Status.3",
            json!({"nodeindex": 3, "control_status": 0x4_0011}),
            &server,
        )
        .expect("status");
    let node = relay.registry().get_by_index(NodeIndex(3)).expect("spigot");
    let status = node.status();
    assert_eq!(status.exec_phase, ExecPhase::Eval);
    assert_eq!(status.result_code, ResultCode::Ok);
    assert_eq!(changes.borrow().len(), 1);
    assert_eq!(changes.borrow()[0].0, NodeIndex(3));

    relay
        .deliver(
            "App.Out.App.Notify.State",
            json!({"app_state": "paused", "message": "stopped at breakpoint"}),
            &server,
        )
        .expect("state");
    assert_eq!(
        relay.connections().current().expect("attached").state,
        ConnectionState::Paused
    );
    assert_eq!(log.records().len(), 1);

    relay
        .deliver(
            "App.Out.Remote.Down",
            json!({"gateway": "gw1"}),
            &Address::from("gw1"),
        )
        .expect("down");
    assert!(relay.connections().is_empty());
    assert!(relay.request_node_list().is_err());

    let kinds = lifecycle
        .borrow()
        .iter()
        .map(|event| event.id.clone())
        .collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![
            "Relay.Connection.Hello",
            "Relay.Connection.Attached",
            "Relay.Connection.Down",
            "Relay.Connection.Detached"
        ]
    );
}

#[tokio::test]
async fn worker_thread_messages_arrive_in_order() {
    let (mut relay, _) = relay();
    let (sender, mut inbox) = channel();
    let seen = record_events(&relay, "App.Out.Step.*");

    let worker = std::thread::spawn(move || {
        let source = Address::from("gw2.srv");
        sender.post("App.Out.Hello", json!({}), source.clone());
        for step in 0..5 {
            sender.post(format!("App.Out.Step.{step}"), json!({"step": step}), source.clone());
        }
    });
    worker.join().expect("worker");

    inbox
        .wait_until(
            &mut relay,
            WaitTimeout::After(Duration::from_secs(2)),
            |relay| relay.delivered() >= 6,
        )
        .await
        .expect("delivered");

    let steps = seen
        .borrow()
        .iter()
        .map(|event| event.payload["step"].as_i64().unwrap_or(-1))
        .collect::<Vec<_>>();
    assert_eq!(steps, vec![0, 1, 2, 3, 4]);
}
