mod common;

use bpdb_common::{
    types::{Breakpoint, ContextEnd, ContextState, NodeId, SessionEvent},
    DebuggerConfig,
};
use bpdb_engine::{DebuggerError, ExecutionObserver};
use common::*;
use tracing::info;

#[test]
fn test_paused_context_does_not_block_others() {
    let host = door_host();
    let session = attached(&host, DebuggerConfig::default());
    info!("Running test");
    let mut rx = session.subscribe();

    session.set_breakpoint(Breakpoint::new(DOOR, NodeId(3), None, None)).unwrap();
    let (paused_ctx, paused_worker) = vm(&host).spawn(DOOR, OBJ).unwrap();
    assert_eq!(wait_for_pause(&mut rx).context, paused_ctx);

    // Other invocations run to completion on their own threads meanwhile.
    let workers: Vec<_> = (0..4).map(|_| vm(&host).spawn(FLAT, OBJ).unwrap()).collect();
    for (_, worker) in workers {
        assert_eq!(worker.join().unwrap().unwrap().end, ContextEnd::Completed);
    }

    let snapshot = session.snapshot();
    assert_eq!(snapshot.focused.as_ref().map(|p| p.context), Some(paused_ctx));
    let view = snapshot.contexts.iter().find(|c| c.id == paused_ctx).unwrap();
    assert_eq!(view.state, ContextState::Paused);
    assert_eq!(view.stack.len(), 1);

    session.resume(paused_ctx).unwrap();
    assert_eq!(paused_worker.join().unwrap().unwrap().end, ContextEnd::Completed);
    assert!(session.focused().is_none());
}

#[test]
fn test_focus_moves_between_paused_contexts() {
    let host = door_host();
    let session = attached(&host, DebuggerConfig::default());
    info!("Running test");
    let mut rx = session.subscribe();

    session.set_breakpoint(Breakpoint::new(FLAT, NodeId(22), None, None)).unwrap();
    let (first, first_worker) = vm(&host).spawn(FLAT, OBJ).unwrap();
    assert_eq!(wait_for_pause(&mut rx).context, first);
    let (second, second_worker) = vm(&host).spawn(FLAT, OBJ).unwrap();
    assert_eq!(wait_for_pause(&mut rx).context, second);

    let snapshot = session.snapshot();
    assert_eq!(snapshot.focused.map(|p| p.context), Some(first));
    assert_eq!(snapshot.paused_queue, vec![second]);

    assert_eq!(session.focus(second).unwrap().context, second);
    let snapshot = session.snapshot();
    assert_eq!(snapshot.focused.map(|p| p.context), Some(second));
    assert_eq!(snapshot.paused_queue, vec![first]);

    session.resume(second).unwrap();
    assert_eq!(session.focused().map(|p| p.context), Some(first));
    second_worker.join().unwrap().unwrap();

    session.resume(first).unwrap();
    first_worker.join().unwrap().unwrap();
    assert!(session.focused().is_none());
    assert_eq!(session.resume(first), Err(DebuggerError::DetachedContext(first)));
}

#[test]
fn test_context_ended_while_paused() {
    let host = door_host();
    let session = attached(&host, DebuggerConfig::default());
    info!("Running test");
    let mut rx = session.subscribe();

    session.set_breakpoint(Breakpoint::new(DOOR, NodeId(2), None, None)).unwrap();
    let (ctx, worker) = vm(&host).spawn(DOOR, OBJ).unwrap();
    wait_for_pause(&mut rx);

    // The host tears the invocation down from outside, e.g. the object was destroyed.
    session.end_context(ctx, ContextEnd::Aborted);
    let end = wait_for(&mut rx, |e| match e {
        SessionEvent::Detached { context, end } if *context == ctx => Some(*end),
        _ => None,
    });
    assert_eq!(end, ContextEnd::Aborted);

    let report = worker.join().unwrap().unwrap();
    assert_eq!(report.end, ContextEnd::Aborted);
    assert_eq!(report.executed, 1, "paused node never executed");
    assert_eq!(session.resume(ctx), Err(DebuggerError::DetachedContext(ctx)));
    assert!(session.focused().is_none());
}

#[test]
fn test_shutdown_aborts_paused_contexts() {
    let host = door_host();
    let session = attached(&host, DebuggerConfig::default());
    info!("Running test");
    let mut rx = session.subscribe();

    session.set_breakpoint(Breakpoint::new(FLAT, NodeId(23), None, None)).unwrap();
    let (ctx, worker) = vm(&host).spawn(FLAT, OBJ).unwrap();
    wait_for_pause(&mut rx);

    session.shutdown();
    assert!(session.is_closed());
    assert!(host.observer().is_none());
    let detached = wait_for(&mut rx, |e| match e {
        SessionEvent::Detached { context, end } => Some((*context, *end)),
        _ => None,
    });
    assert_eq!(detached, (ctx, ContextEnd::Aborted));
    assert_eq!(worker.join().unwrap().unwrap().end, ContextEnd::Aborted);

    // Later invocations are not observed at all.
    assert_eq!(vm(&host).run(FLAT, OBJ).unwrap().end, ContextEnd::Completed);
    assert_eq!(
        session.set_breakpoint(Breakpoint::new(FLAT, NodeId(22), None, None)),
        Err(DebuggerError::SessionClosed)
    );
}

#[test]
fn test_trace_digest_after_runs() {
    let host = door_host();
    let session = attached(&host, DebuggerConfig::default());
    info!("Running test");
    let mut rx = session.subscribe();

    let first = vm(&host).run(FLAT, OBJ).unwrap();
    let second = vm(&host).run(DOOR, OBJ).unwrap();
    let digest = session.publisher().flush().unwrap();
    assert_eq!(digest.steps, first.executed + second.executed);
    assert_eq!(digest.contexts.len(), 2);
    assert_eq!(
        digest.ended,
        vec![(first.context, ContextEnd::Completed), (second.context, ContextEnd::Completed)]
    );
    let max_depth = digest.contexts.iter().find(|c| c.context == second.context).unwrap().stats.max_depth;
    assert_eq!(max_depth, 2);
    assert!(drained_any(&mut rx, |e| matches!(e, SessionEvent::Trace(_))));
}
