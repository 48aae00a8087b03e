// BPDB - Blueprint Graph Debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Per-context pause state machine and the UI focus queue.
//!
//! ```text
//! Running --pause--> Paused(reason) --release--> Running
//!    \                    |
//!     +------detach-------+--> Detached(end)
//! ```
//!
//! A paused VM thread waits on the controller's condition variable; only a
//! release or a detach wakes it. Step commands arm a transient target depth
//! that the next node entries check against, so stepping never traces
//! anything beyond the node-entry hook that already runs.
//!
//! Step-into and step-out pause on their own once the target is reached.
//! Step-over does not: it runs the stepped-over node's calls with breakpoints
//! muted, and at the next entry back at the paused depth (or shallower) it
//! disarms, leaving that entry and the rest of the run to breakpoints alone.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, Ordering},
};

use bpdb_common::types::{
    ContextEnd, ContextState, ExecutionContextId, PauseInfo, PauseOutcome, ResumeCommand, StepKind,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::{DebuggerError, Result};

#[derive(Debug, Clone)]
enum RunState {
    Running,
    Paused(PauseInfo),
    Detached(ContextEnd),
}

/// Pending step target, relative to the depth the step was issued at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepTarget {
    None,
    Into,
    Over { depth: usize },
    Out { depth: usize },
}

impl StepTarget {
    fn arm(kind: StepKind, depth: usize) -> Self {
        match kind {
            StepKind::Into => Self::Into,
            StepKind::Over => Self::Over { depth },
            StepKind::Out => Self::Out { depth },
        }
    }

    /// Decision for a node entry at `depth`, and whether the target is used up.
    fn check(&self, depth: usize) -> (StepCheck, bool) {
        match *self {
            Self::None => (StepCheck::Free, false),
            Self::Into => (StepCheck::Pause(StepKind::Into), true),
            Self::Over { depth: from } if depth > from => (StepCheck::Muted, false),
            Self::Over { .. } => (StepCheck::Free, true),
            Self::Out { depth: from } if depth < from => (StepCheck::Pause(StepKind::Out), true),
            Self::Out { .. } => (StepCheck::Free, false),
        }
    }
}

/// What a pending step means for one node entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepCheck {
    /// Breakpoints apply as usual.
    Free,
    /// Inside a stepped-over call: breakpoints are ignored.
    Muted,
    /// The step target is reached; pause unless a breakpoint already does.
    Pause(StepKind),
}

#[derive(Debug)]
struct PauseState {
    run: RunState,
    step: StepTarget,
    /// Set at session shutdown: later pauses return immediately.
    disarmed: bool,
}

/// Pause state of one execution context.
#[derive(Debug)]
pub struct PauseController {
    context: ExecutionContextId,
    state: Mutex<PauseState>,
    released: Condvar,
    /// Mirrors `state.step != None` so node entries skip the lock when no step is pending.
    step_armed: AtomicBool,
    /// Mirrors `state.run == Detached`.
    detached: AtomicBool,
}

impl PauseController {
    /// A running controller.
    pub fn new(context: ExecutionContextId) -> Self {
        Self {
            context,
            state: Mutex::new(PauseState {
                run: RunState::Running,
                step: StepTarget::None,
                disarmed: false,
            }),
            released: Condvar::new(),
            step_armed: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        }
    }

    /// Block the calling VM thread until the context is released or detached.
    ///
    /// `on_paused` runs once the state is `Paused`, while this controller's
    /// lock is held, so a release cannot overtake the pause notification.
    /// A pending step target is cleared: whatever paused the context wins.
    pub fn pause(&self, info: PauseInfo, on_paused: impl FnOnce(&PauseInfo)) -> PauseOutcome {
        let mut state = self.state.lock();
        if let RunState::Detached(_) = state.run {
            return PauseOutcome::Aborted;
        }
        if state.disarmed {
            return PauseOutcome::Resumed;
        }
        state.step = StepTarget::None;
        self.step_armed.store(false, Ordering::Release);

        debug!(ctx = %self.context, node = %info.node, reason = ?info.reason, "Context paused");
        on_paused(&info);
        state.run = RunState::Paused(info);

        loop {
            match &state.run {
                RunState::Paused(_) => {}
                RunState::Running => return PauseOutcome::Resumed,
                RunState::Detached(_) => return PauseOutcome::Aborted,
            }
            self.released.wait(&mut state);
        }
    }

    /// Release a paused context with a resume or step command.
    ///
    /// `on_released` runs under this controller's lock, before the VM thread
    /// wakes up.
    pub fn release(&self, command: ResumeCommand, on_released: impl FnOnce()) -> Result<()> {
        let mut state = self.state.lock();
        let depth = match &state.run {
            RunState::Running => return Err(DebuggerError::NotPaused(self.context)),
            RunState::Detached(_) => return Err(DebuggerError::DetachedContext(self.context)),
            RunState::Paused(info) => info.depth,
        };

        state.step = match command {
            ResumeCommand::Continue => StepTarget::None,
            ResumeCommand::Step(kind) => StepTarget::arm(kind, depth),
        };
        self.step_armed.store(state.step != StepTarget::None, Ordering::Release);
        state.run = RunState::Running;
        debug!(ctx = %self.context, ?command, depth, "Context released");

        on_released();
        self.released.notify_all();
        Ok(())
    }

    /// Move to the terminal state, waking a paused thread with an abort.
    /// Returns whether the context was paused.
    pub fn detach(&self, end: ContextEnd) -> bool {
        let mut state = self.state.lock();
        let was_paused = matches!(state.run, RunState::Paused(_));
        if !matches!(state.run, RunState::Detached(_)) {
            state.run = RunState::Detached(end);
        }
        state.step = StepTarget::None;
        self.step_armed.store(false, Ordering::Release);
        self.detached.store(true, Ordering::Release);
        self.released.notify_all();
        debug!(ctx = %self.context, ?end, was_paused, "Context detached");
        was_paused
    }

    /// Abort a paused thread and turn every later pause into a no-op, leaving a
    /// running context running. Returns whether a paused thread was aborted.
    pub fn disarm(&self) -> bool {
        let mut state = self.state.lock();
        state.disarmed = true;
        state.step = StepTarget::None;
        self.step_armed.store(false, Ordering::Release);
        if !matches!(state.run, RunState::Paused(_)) {
            return false;
        }
        state.run = RunState::Detached(ContextEnd::Aborted);
        self.detached.store(true, Ordering::Release);
        self.released.notify_all();
        debug!(ctx = %self.context, "Paused context aborted by shutdown");
        true
    }

    /// Check a node entry at `depth` against the pending step target,
    /// consuming the target once it is reached.
    pub fn check_step(&self, depth: usize) -> StepCheck {
        if !self.step_armed.load(Ordering::Acquire) {
            return StepCheck::Free;
        }
        let mut state = self.state.lock();
        let (check, done) = state.step.check(depth);
        if done {
            trace!(ctx = %self.context, depth, ?check, "Step target reached");
            state.step = StepTarget::None;
            self.step_armed.store(false, Ordering::Release);
        }
        check
    }

    /// Whether a step target is pending.
    pub fn is_stepping(&self) -> bool {
        self.step_armed.load(Ordering::Acquire)
    }

    /// Current run state.
    pub fn state(&self) -> ContextState {
        match self.state.lock().run {
            RunState::Running => ContextState::Running,
            RunState::Paused(_) => ContextState::Paused,
            RunState::Detached(_) => ContextState::Detached,
        }
    }

    /// Whether the context is detached.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Pause details while paused.
    pub fn pause_info(&self) -> Option<PauseInfo> {
        match &self.state.lock().run {
            RunState::Paused(info) => Some(info.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct FocusState {
    focused: Option<ExecutionContextId>,
    waiting: VecDeque<ExecutionContextId>,
}

/// Which paused context the UI sees.
///
/// Lock order: a pause controller's lock may be held while taking this one,
/// never the other way round.
#[derive(Debug, Default)]
pub struct FocusQueue {
    inner: Mutex<FocusState>,
}

impl FocusQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context paused. It takes the focus if nothing holds it. Returns whether it did.
    pub fn push(&self, context: ExecutionContextId) -> bool {
        let mut inner = self.inner.lock();
        if inner.focused == Some(context) || inner.waiting.contains(&context) {
            return inner.focused == Some(context);
        }
        if inner.focused.is_none() {
            inner.focused = Some(context);
            true
        } else {
            inner.waiting.push_back(context);
            false
        }
    }

    /// A context is no longer paused. If it held the focus, the next waiting
    /// context takes it. Returns the focused context afterwards.
    pub fn remove(&self, context: ExecutionContextId) -> Option<ExecutionContextId> {
        let mut inner = self.inner.lock();
        if inner.focused == Some(context) {
            inner.focused = inner.waiting.pop_front();
        } else {
            inner.waiting.retain(|c| *c != context);
        }
        inner.focused
    }

    /// Focus a waiting context explicitly. The previously focused one goes to
    /// the front of the queue. Returns false if the context is not paused.
    pub fn focus(&self, context: ExecutionContextId) -> bool {
        let mut inner = self.inner.lock();
        if inner.focused == Some(context) {
            return true;
        }
        let Some(pos) = inner.waiting.iter().position(|c| *c == context) else {
            return false;
        };
        inner.waiting.remove(pos);
        if let Some(previous) = inner.focused.replace(context) {
            inner.waiting.push_front(previous);
        }
        true
    }

    /// Focused context.
    pub fn focused(&self) -> Option<ExecutionContextId> {
        self.inner.lock().focused
    }

    /// Focused context and the waiting ones, in order.
    pub fn snapshot(&self) -> (Option<ExecutionContextId>, Vec<ExecutionContextId>) {
        let inner = self.inner.lock();
        (inner.focused, inner.waiting.iter().copied().collect())
    }

    /// Drop everything.
    pub fn clear(&self) {
        *self.inner.lock() = FocusState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpdb_common::types::{GraphId, NodeId, NodeRef, ObjectHandle, PauseReason};
    use std::{sync::Arc, thread, time::Duration};

    fn info(depth: usize) -> PauseInfo {
        let node = NodeRef::new(GraphId(1), NodeId(1));
        PauseInfo {
            context: ExecutionContextId(1),
            graph: GraphId(1),
            object: ObjectHandle(1),
            reason: PauseReason::Breakpoint(node),
            node,
            depth,
            step: 1,
            stack: vec![],
            paused_at: chrono::Utc::now(),
        }
    }

    fn wait_paused(ctl: &PauseController) {
        for _ in 0..500 {
            if ctl.state() == ContextState::Paused {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("context never paused");
    }

    #[test]
    fn test_release_wakes_paused_thread() {
        let ctl = Arc::new(PauseController::new(ExecutionContextId(1)));
        assert_eq!(
            ctl.release(ResumeCommand::Continue, || {}),
            Err(DebuggerError::NotPaused(ExecutionContextId(1)))
        );

        let vm = {
            let ctl = ctl.clone();
            thread::spawn(move || ctl.pause(info(2), |_| {}))
        };
        wait_paused(&ctl);
        assert_eq!(ctl.pause_info().unwrap().depth, 2);

        let mut released = false;
        ctl.release(ResumeCommand::Step(StepKind::Over), || released = true).unwrap();
        assert!(released);
        assert_eq!(vm.join().unwrap(), PauseOutcome::Resumed);
        assert_eq!(ctl.state(), ContextState::Running);
        assert!(ctl.is_stepping());
    }

    #[test]
    fn test_detach_aborts_paused_thread() {
        let ctl = Arc::new(PauseController::new(ExecutionContextId(1)));
        let vm = {
            let ctl = ctl.clone();
            thread::spawn(move || ctl.pause(info(1), |_| {}))
        };
        wait_paused(&ctl);
        assert!(ctl.detach(ContextEnd::Aborted));
        assert_eq!(vm.join().unwrap(), PauseOutcome::Aborted);
        assert!(ctl.is_detached());
        assert_eq!(
            ctl.release(ResumeCommand::Continue, || {}),
            Err(DebuggerError::DetachedContext(ExecutionContextId(1)))
        );
        // Pausing a detached context aborts without blocking.
        assert_eq!(ctl.pause(info(1), |_| panic!("must not notify")), PauseOutcome::Aborted);
    }

    #[test]
    fn test_disarm() {
        let ctl = Arc::new(PauseController::new(ExecutionContextId(1)));
        assert!(!ctl.disarm());
        assert!(!ctl.is_detached());
        assert_eq!(ctl.pause(info(1), |_| panic!("must not notify")), PauseOutcome::Resumed);

        let ctl = Arc::new(PauseController::new(ExecutionContextId(2)));
        let vm = {
            let ctl = ctl.clone();
            thread::spawn(move || ctl.pause(info(1), |_| {}))
        };
        wait_paused(&ctl);
        assert!(ctl.disarm());
        assert_eq!(vm.join().unwrap(), PauseOutcome::Aborted);
        assert!(ctl.is_detached());
    }

    #[test]
    fn test_step_targets() {
        let into = StepTarget::arm(StepKind::Into, 2);
        assert_eq!(into.check(5), (StepCheck::Pause(StepKind::Into), true));

        let over = StepTarget::arm(StepKind::Over, 2);
        assert_eq!(over.check(3), (StepCheck::Muted, false));
        assert_eq!(over.check(2), (StepCheck::Free, true));
        assert_eq!(over.check(1), (StepCheck::Free, true));

        let out = StepTarget::arm(StepKind::Out, 2);
        assert_eq!(out.check(3), (StepCheck::Free, false));
        assert_eq!(out.check(2), (StepCheck::Free, false));
        assert_eq!(out.check(1), (StepCheck::Pause(StepKind::Out), true));
        assert_eq!(StepTarget::None.check(0), (StepCheck::Free, false));
    }

    #[test]
    fn test_check_step_consumes_target() {
        let ctl = Arc::new(PauseController::new(ExecutionContextId(1)));
        assert_eq!(ctl.check_step(1), StepCheck::Free);
        let vm = {
            let ctl = ctl.clone();
            thread::spawn(move || ctl.pause(info(1), |_| {}))
        };
        wait_paused(&ctl);
        ctl.release(ResumeCommand::Step(StepKind::Over), || {}).unwrap();
        vm.join().unwrap();

        assert_eq!(ctl.check_step(2), StepCheck::Muted);
        assert!(ctl.is_stepping());
        assert_eq!(ctl.check_step(1), StepCheck::Free);
        assert!(!ctl.is_stepping());
        assert_eq!(ctl.check_step(2), StepCheck::Free, "disarmed once back at the paused depth");
    }

    #[test]
    fn test_focus_queue() {
        let focus = FocusQueue::new();
        let (a, b, c) = (ExecutionContextId(1), ExecutionContextId(2), ExecutionContextId(3));
        assert!(focus.push(a));
        assert!(!focus.push(b));
        assert!(!focus.push(c));
        assert!(focus.push(a), "re-pushing the focused context is a no-op");
        assert_eq!(focus.snapshot(), (Some(a), vec![b, c]));

        assert!(focus.focus(c));
        assert_eq!(focus.snapshot(), (Some(c), vec![a, b]));
        assert!(!focus.focus(ExecutionContextId(9)));

        assert_eq!(focus.remove(b), Some(c));
        assert_eq!(focus.remove(c), Some(a));
        assert_eq!(focus.remove(a), None);
        assert_eq!(focus.focused(), None);
    }
}
