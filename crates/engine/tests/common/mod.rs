#![allow(dead_code)]

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use bpdb_common::{
    types::{
        GraphId, NodeDescriptor, NodeId, NodeKind, NodeRef, ObjectHandle, PauseInfo, PinDescriptor,
        PinType, PropertyInfo, SessionEvent, Value,
    },
    DebuggerConfig,
};
use bpdb_engine::{DebugSession, HostObject, MemoryHost, SimVm};
use tokio::sync::broadcast::{self, error::TryRecvError};

pub const DOOR: GraphId = GraphId(1);
pub const HELPER: GraphId = GraphId(2);
pub const FLAT: GraphId = GraphId(3);
pub const RECURSE: GraphId = GraphId(4);

pub const OBJ: ObjectHandle = ObjectHandle(1);

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn node(graph: GraphId, id: u128) -> NodeRef {
    NodeRef::new(graph, NodeId(id))
}

/// A host with a few graphs:
///
/// - `DOOR`: A(1) event, B(2) calls `HELPER`, C(3) sets `Open` to true
/// - `HELPER`: D(10) entry, E(11) literal `Value` = 5, F(12) result
/// - `FLAT`: A(21) event, B(22) branch on `Condition`, C(23) generic
/// - `RECURSE`: R(31) calls `RECURSE`
pub fn door_host() -> Arc<MemoryHost> {
    let host = Arc::new(MemoryHost::new());
    host.put_object(
        OBJ,
        HostObject::new("Door_1", "BP_Door_C")
            .with_property(PropertyInfo::new("Open").with_category("State"), Value::Bool(false))
            .with_property(PropertyInfo::new("Health").with_category("Gameplay"), Value::Int(10)),
    );
    host.put_graph(
        DOOR,
        "/Game/BP_Door",
        vec![
            NodeDescriptor::new(NodeId(1), NodeKind::Event).with_title("Event BeginPlay"),
            NodeDescriptor::new(NodeId(2), NodeKind::CallFunction { callee: HELPER })
                .with_title("Call Helper"),
            NodeDescriptor::new(NodeId(3), NodeKind::VariableSet { variable: "Open".into() })
                .with_pin(PinDescriptor::input("Open", PinType::Bool).with_default("true"))
                .with_pin(PinDescriptor::output("Open", PinType::Bool)),
        ],
    );
    host.put_graph(
        HELPER,
        "/Game/BP_Door:Helper",
        vec![
            NodeDescriptor::new(NodeId(10), NodeKind::FunctionEntry),
            NodeDescriptor::new(NodeId(11), NodeKind::Literal)
                .with_pin(PinDescriptor::output("Value", PinType::Int).with_default("5")),
            NodeDescriptor::new(NodeId(12), NodeKind::FunctionResult),
        ],
    );
    host.put_graph(
        FLAT,
        "/Game/BP_Flat",
        vec![
            NodeDescriptor::new(NodeId(21), NodeKind::Event),
            NodeDescriptor::new(NodeId(22), NodeKind::Branch)
                .with_pin(PinDescriptor::input("Condition", PinType::Bool).with_default("true")),
            NodeDescriptor::new(NodeId(23), NodeKind::Generic { class_name: "K2Node_PrintString".into() }),
        ],
    );
    host.put_graph(
        RECURSE,
        "/Game/BP_Recurse",
        vec![NodeDescriptor::new(NodeId(31), NodeKind::CallFunction { callee: RECURSE })],
    );
    host
}

/// A session attached to `host`.
pub fn attached(host: &Arc<MemoryHost>, config: DebuggerConfig) -> Arc<DebugSession> {
    bpdb_common::logging::ensure_test_logging(None);
    let session = DebugSession::new(config, host.clone(), host.clone());
    session.attach(host.clone()).unwrap();
    session
}

pub fn vm(host: &Arc<MemoryHost>) -> SimVm {
    SimVm::new(host.clone())
}

/// Wait for the next event matching `pick`, skipping everything else.
pub fn wait_for<T>(
    rx: &mut broadcast::Receiver<SessionEvent>,
    mut pick: impl FnMut(&SessionEvent) -> Option<T>,
) -> T {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        match rx.try_recv() {
            Ok(event) => {
                if let Some(found) = pick(&event) {
                    return found;
                }
            }
            Err(TryRecvError::Empty) => {
                assert!(Instant::now() < deadline, "timed out waiting for an event");
                thread::sleep(Duration::from_millis(2));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("event channel closed"),
        }
    }
}

/// Wait for the next pause.
pub fn wait_for_pause(rx: &mut broadcast::Receiver<SessionEvent>) -> PauseInfo {
    wait_for(rx, |event| match event {
        SessionEvent::Paused(info) => Some(info.clone()),
        _ => None,
    })
}

/// Drain the channel and report whether any event matched.
pub fn drained_any(
    rx: &mut broadcast::Receiver<SessionEvent>,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> bool {
    let mut found = false;
    loop {
        match rx.try_recv() {
            Ok(event) => found |= pred(&event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return found,
        }
    }
}
