mod common;

use bpdb_common::{
    types::{Breakpoint, ContextEnd, NodeId, SessionEvent, Value, WatchRef},
    DebuggerConfig,
};
use common::*;
use tracing::info;

#[test]
fn test_live_reads_are_cached_per_step() {
    let host = door_host();
    let session = attached(&host, DebuggerConfig::default());
    info!("Running test");
    let mut rx = session.subscribe();

    session.set_breakpoint(Breakpoint::new(DOOR, NodeId(3), None, None)).unwrap();
    let (ctx, worker) = vm(&host).spawn(DOOR, OBJ).unwrap();
    let paused = wait_for_pause(&mut rx);

    let pin = WatchRef::pin(NodeId(3), "Open");
    let reads = host.read_count();
    let reading = session.read_watch(ctx, &pin).unwrap();
    assert_eq!(reading.value, Value::Bool(true));
    assert_eq!(reading.step, paused.step);
    assert!(!reading.stale);
    assert!(!reading.post_mortem);
    assert_eq!(session.read_watch(ctx, &pin).unwrap(), reading);
    assert_eq!(host.read_count(), reads + 1, "second read served from cache");

    let var = session.read_watch(ctx, &WatchRef::variable("Open")).unwrap();
    assert_eq!(var.value, Value::Bool(false));

    // Unknown names read as unset rather than failing.
    let missing = session.read_watch(ctx, &WatchRef::pin(NodeId(3), "Nope")).unwrap();
    assert_eq!(missing.value, Value::Unset);
    assert!(!missing.stale);

    session.resume(ctx).unwrap();
    assert_eq!(worker.join().unwrap().unwrap().end, ContextEnd::Completed);
}

#[test]
fn test_exited_frames_read_post_mortem_or_stale() {
    let host = door_host();
    let session = attached(&host, DebuggerConfig::default());
    info!("Running test");
    let mut rx = session.subscribe();

    session.set_breakpoint(Breakpoint::new(FLAT, NodeId(22), None, None)).unwrap();
    let (ctx, worker) = vm(&host).spawn(FLAT, OBJ).unwrap();
    wait_for_pause(&mut rx);

    let condition = WatchRef::pin(NodeId(22), "Condition");
    let live = session.read_watch(ctx, &condition).unwrap();
    assert_eq!(live.value, Value::Bool(true));
    assert!(!live.post_mortem);

    session.step_over(ctx).unwrap();
    let paused = wait_for_pause(&mut rx);
    assert_eq!(paused.node, node(FLAT, 23));

    // Node 22 just exited: readable, but flagged.
    let after = session.read_watch(ctx, &condition).unwrap();
    assert_eq!(after.value, Value::Bool(true));
    assert!(after.post_mortem);
    assert!(!after.stale);

    // Node 21 exited earlier: stale, with a notice.
    let stale = session.read_watch(ctx, &WatchRef::pin(NodeId(21), "Then")).unwrap();
    assert!(stale.stale);
    assert_eq!(stale.value, Value::Unset);
    assert!(drained_any(&mut rx, |e| matches!(
        e,
        SessionEvent::Notice(n) if n.context == Some(ctx)
    )));

    session.resume(ctx).unwrap();
    worker.join().unwrap().unwrap();
}

#[test]
fn test_zero_retention_makes_exited_frames_stale() {
    let host = door_host();
    let session = attached(&host, DebuggerConfig::default().with_post_mortem_retention_ms(0));
    info!("Running test");
    let mut rx = session.subscribe();

    session.set_breakpoint(Breakpoint::new(FLAT, NodeId(22), None, None)).unwrap();
    let (ctx, worker) = vm(&host).spawn(FLAT, OBJ).unwrap();
    wait_for_pause(&mut rx);
    session.step_over(ctx).unwrap();
    wait_for_pause(&mut rx);
    std::thread::sleep(std::time::Duration::from_millis(5));

    let reading = session.read_watch(ctx, &WatchRef::pin(NodeId(22), "Condition")).unwrap();
    assert!(reading.stale);

    session.resume(ctx).unwrap();
    worker.join().unwrap().unwrap();
}

#[test]
fn test_post_mortem_after_context_ends() {
    let host = door_host();
    let session = attached(&host, DebuggerConfig::default());
    info!("Running test");

    let report = vm(&host).run(DOOR, OBJ).unwrap();
    assert_eq!(report.end, ContextEnd::Completed);

    let var = session.read_watch(report.context, &WatchRef::variable("Open")).unwrap();
    assert_eq!(var.value, Value::Bool(true));
    assert!(var.post_mortem);

    let pin = session.read_watch(report.context, &WatchRef::pin(NodeId(3), "Open")).unwrap();
    assert_eq!(pin.value, Value::Bool(true));
    assert!(pin.post_mortem);

    let inner = session.read_watch(report.context, &WatchRef::pin(NodeId(11), "Value")).unwrap();
    assert!(inner.stale);
}

#[test]
fn test_inspect_variables() {
    let host = door_host();
    let session = attached(&host, DebuggerConfig::default());
    info!("Running test");

    let vars = session.inspect_variables(OBJ).unwrap();
    assert!(vars.running);
    let names: Vec<_> = vars.categories.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["Gameplay", "State"]);
    assert_eq!(vars.row("Health").unwrap().display, "10");

    assert!(session.inspect_variables(bpdb_common::types::ObjectHandle(99)).is_err());
}
