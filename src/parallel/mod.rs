//! Evaluator for parallel composition trees.
//!
//! Sequencing a [`Par`](crate::effect::Par) produces an asynchronous step.
//! When the step runs, the tree is flattened into an arena of nodes, one
//! fiber is forked per leaf, and leaf outcomes are propagated towards the
//! root as they arrive:
//!
//! - `Map` transforms a success or forwards a failure.
//! - `Apply` waits for both sides; the first failure is recorded, the other
//!   side's outstanding leaves are killed, and propagation continues once
//!   every kill has been acknowledged.
//! - `Alt` records the first success, kills the other side and continues
//!   after the kills are acknowledged. If both sides fail the left error
//!   is kept.
//!
//! Killing the fiber that waits on the evaluation cancels it: in-flight
//! sibling kills are revoked, every outstanding leaf is killed, and the
//! cancellation completes once all of them have acknowledged.
//!
//! All evaluator state lives behind one lock. Fiber operations (`kill`,
//! `run`) and user functions (`map`, `apply`) are always invoked with the
//! lock released.

mod cell;

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::effect::par::{ApplyFn, MapFn, ParTree};
use crate::effect::{Canceler, Completion, Program};
use crate::error::Error;
use crate::fiber::{FiberRef, Listener, ListenerToken};
use crate::runtime::Runtime;
use crate::supervisor::Supervisor;
use crate::tracing_compat::{debug, trace};
use crate::types::value::{Exit, unit};

use cell::ResultCell;

const ROOT: usize = 0;

/// Lifts a parallel tree into a sequential asynchronous program.
pub(crate) fn sequential(
    runtime: &Runtime,
    supervisor: Option<Supervisor>,
    tree: ParTree,
) -> Program {
    let runtime = runtime.clone();
    Program::Async(Box::new(move |completion| {
        let evaluator = Evaluator::start(&runtime, supervisor, tree, completion);
        Ok(evaluator.canceler())
    }))
}

enum NodeKind {
    Forked,
    Map {
        f: Option<MapFn>,
        child: usize,
    },
    Apply {
        f: Option<ApplyFn>,
        lhs: usize,
        rhs: usize,
    },
    Alt {
        lhs: usize,
        rhs: usize,
    },
}

#[derive(Clone, Copy)]
enum Shape {
    Forked,
    Map,
    Apply { lhs: usize, rhs: usize },
    Alt { lhs: usize, rhs: usize },
}

impl NodeKind {
    const fn shape(&self) -> Shape {
        match self {
            Self::Forked => Shape::Forked,
            Self::Map { .. } => Shape::Map,
            Self::Apply { lhs, rhs, .. } => Shape::Apply {
                lhs: *lhs,
                rhs: *rhs,
            },
            Self::Alt { lhs, rhs } => Shape::Alt {
                lhs: *lhs,
                rhs: *rhs,
            },
        }
    }
}

struct Node {
    parent: Option<usize>,
    kind: NodeKind,
    cell: ResultCell,
}

/// Where a subtree attaches to its parent while the arena is built.
#[derive(Clone, Copy)]
enum Slot {
    Root,
    Only(usize),
    Lhs(usize),
    Rhs(usize),
}

impl Slot {
    const fn parent(self) -> Option<usize> {
        match self {
            Self::Root => None,
            Self::Only(p) | Self::Lhs(p) | Self::Rhs(p) => Some(p),
        }
    }
}

struct State {
    nodes: Vec<Node>,
    /// Leaf index to the fiber still running it.
    fibers: BTreeMap<usize, FiberRef>,
    /// Sibling kills in flight, by kill id.
    kills: BTreeMap<u64, Vec<ListenerToken>>,
    next_kill: u64,
    interrupted: bool,
}

impl State {
    /// Fibers of unresolved leaves under `root`.
    fn pending_leaves(&self, root: usize) -> Vec<FiberRef> {
        let mut found = Vec::new();
        let mut stack = vec![root];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            match node.kind {
                NodeKind::Forked => {
                    if !node.cell.is_filled() {
                        if let Some(fiber) = self.fibers.get(&index) {
                            found.push(fiber.clone());
                        }
                    }
                }
                NodeKind::Map { child, .. } => stack.push(child),
                NodeKind::Apply { lhs, rhs, .. } | NodeKind::Alt { lhs, rhs } => {
                    stack.push(rhs);
                    stack.push(lhs);
                }
            }
        }
        found
    }
}

/// Flattens `tree` into an arena, forking (but not starting) one fiber per
/// leaf. Leaves are returned left to right.
fn build(
    runtime: &Runtime,
    supervisor: Option<&Supervisor>,
    tree: ParTree,
) -> (Vec<Node>, Vec<(usize, FiberRef)>) {
    let mut nodes: Vec<Node> = Vec::new();
    let mut leaves = Vec::new();
    let mut work = vec![(tree, Slot::Root)];
    while let Some((tree, slot)) = work.pop() {
        let index = nodes.len();
        match slot {
            Slot::Root => {}
            Slot::Only(p) => {
                if let NodeKind::Map { child, .. } = &mut nodes[p].kind {
                    *child = index;
                }
            }
            Slot::Lhs(p) => match &mut nodes[p].kind {
                NodeKind::Apply { lhs, .. } | NodeKind::Alt { lhs, .. } => *lhs = index,
                NodeKind::Forked | NodeKind::Map { .. } => {}
            },
            Slot::Rhs(p) => match &mut nodes[p].kind {
                NodeKind::Apply { rhs, .. } | NodeKind::Alt { rhs, .. } => *rhs = index,
                NodeKind::Forked | NodeKind::Map { .. } => {}
            },
        }
        let kind = match tree {
            ParTree::Leaf(program) => {
                let fiber = FiberRef::new(runtime, supervisor.cloned(), program.into_inner());
                leaves.push((index, fiber));
                NodeKind::Forked
            }
            ParTree::Map(f, child) => {
                work.push((child.into_inner(), Slot::Only(index)));
                NodeKind::Map {
                    f: Some(f),
                    child: usize::MAX,
                }
            }
            ParTree::Apply(f, lhs, rhs) => {
                work.push((rhs.into_inner(), Slot::Rhs(index)));
                work.push((lhs.into_inner(), Slot::Lhs(index)));
                NodeKind::Apply {
                    f: Some(f),
                    lhs: usize::MAX,
                    rhs: usize::MAX,
                }
            }
            ParTree::Alt(lhs, rhs) => {
                work.push((rhs.into_inner(), Slot::Rhs(index)));
                work.push((lhs.into_inner(), Slot::Lhs(index)));
                NodeKind::Alt {
                    lhs: usize::MAX,
                    rhs: usize::MAX,
                }
            }
        };
        nodes.push(Node {
            parent: slot.parent(),
            kind,
            cell: ResultCell::default(),
        });
    }
    (nodes, leaves)
}

/// Kills every fiber in `targets`, calling `on_done` once all have
/// acknowledged. `targets` must not be empty.
fn kill_fibers<F>(targets: &[FiberRef], cause: &Error, on_done: F) -> Vec<ListenerToken>
where
    F: FnOnce() + Send + 'static,
{
    let remaining = Arc::new(AtomicUsize::new(targets.len()));
    let on_done = Arc::new(Mutex::new(Some(on_done)));
    targets
        .iter()
        .map(|fiber| {
            let remaining = Arc::clone(&remaining);
            let on_done = Arc::clone(&on_done);
            fiber.kill(cause.clone(), move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let done = on_done.lock().take();
                    if let Some(done) = done {
                        done();
                    }
                }
            })
        })
        .collect()
}

enum Action {
    Wait,
    Propagate(Exit),
    Compute(Box<dyn FnOnce() -> Exit + Send>),
    Cancel { exit: Exit, sibling: usize },
}

struct Shared {
    state: Mutex<State>,
    on_done: Completion,
}

#[derive(Clone)]
struct Evaluator {
    shared: Arc<Shared>,
}

impl Evaluator {
    fn start(
        runtime: &Runtime,
        supervisor: Option<Supervisor>,
        tree: ParTree,
        on_done: Completion,
    ) -> Self {
        let (nodes, leaves) = build(runtime, supervisor.as_ref(), tree);
        let evaluator = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    nodes,
                    fibers: leaves.iter().cloned().collect(),
                    kills: BTreeMap::new(),
                    next_kill: 0,
                    interrupted: false,
                }),
                on_done,
            }),
        };
        for (index, fiber) in &leaves {
            let this = evaluator.clone();
            let index = *index;
            let _ = fiber.on_complete(Listener::new(false, move |exit| this.resolve(index, exit)));
            if let Some(supervisor) = &supervisor {
                supervisor.register(fiber);
            }
        }
        trace!(leaves = leaves.len(), "parallel evaluation started");
        for (_, fiber) in leaves {
            fiber.run();
        }
        evaluator
    }

    fn canceler(&self) -> Canceler {
        let this = self.clone();
        Canceler::from_program(move |cause| {
            Program::Async(Box::new(move |completion| {
                let tokens = this.cancel(&cause, move || completion.complete(Ok(unit())));
                Ok(Canceler::from_fn(move || {
                    for token in tokens {
                        token.revoke();
                    }
                }))
            }))
        })
    }

    /// Records a leaf outcome and propagates it.
    fn resolve(&self, index: usize, exit: Exit) {
        {
            let mut state = self.shared.state.lock();
            state.fibers.remove(&index);
            if !state.nodes[index].cell.set(exit.clone()) || state.interrupted {
                return;
            }
        }
        self.join(exit, index);
    }

    /// Propagates the outcome of `node` towards the root.
    fn join(&self, mut exit: Exit, mut node: usize) {
        loop {
            let mut state = self.shared.state.lock();
            if state.interrupted {
                return;
            }
            let Some(parent) = state.nodes[node].parent else {
                drop(state);
                trace!("parallel evaluation resolved");
                self.shared.on_done.complete(exit);
                return;
            };
            if state.nodes[parent].cell.is_filled() {
                return;
            }

            let action = match state.nodes[parent].kind.shape() {
                Shape::Forked => {
                    Action::Propagate(Err(Error::internal("leaf node has a child")))
                }
                Shape::Map => match exit {
                    Err(err) => Action::Propagate(Err(err)),
                    Ok(value) => match &mut state.nodes[parent].kind {
                        NodeKind::Map { f, .. } => match f.take() {
                            Some(f) => Action::Compute(Box::new(move || f(value))),
                            None => Action::Wait,
                        },
                        _ => Action::Wait,
                    },
                },
                Shape::Apply { lhs, rhs } => {
                    let sibling = if node == lhs { rhs } else { lhs };
                    match exit {
                        Err(err) => Action::Cancel {
                            exit: Err(err),
                            sibling,
                        },
                        Ok(_) => {
                            let operands = match (
                                state.nodes[lhs].cell.get(),
                                state.nodes[rhs].cell.get(),
                            ) {
                                (Some(Ok(a)), Some(Ok(b))) => Some((Arc::clone(a), Arc::clone(b))),
                                _ => None,
                            };
                            let f = match &mut state.nodes[parent].kind {
                                NodeKind::Apply { f, .. } if operands.is_some() => f.take(),
                                _ => None,
                            };
                            match (operands, f) {
                                (Some((a, b)), Some(f)) => {
                                    Action::Compute(Box::new(move || f(a, b)))
                                }
                                _ => Action::Wait,
                            }
                        }
                    }
                }
                Shape::Alt { lhs, rhs } => {
                    let sibling = if node == lhs { rhs } else { lhs };
                    match exit {
                        Ok(value) => Action::Cancel {
                            exit: Ok(value),
                            sibling,
                        },
                        Err(err) => match state.nodes[sibling].cell.get() {
                            Some(Err(other)) => {
                                let kept = if node == lhs { err } else { other.clone() };
                                Action::Propagate(Err(kept))
                            }
                            // Sibling pending, or succeeded and still cancelling.
                            _ => Action::Wait,
                        },
                    }
                }
            };

            match action {
                Action::Wait => return,
                Action::Propagate(out) => {
                    state.nodes[parent].cell.set(out.clone());
                    exit = out;
                    node = parent;
                }
                Action::Compute(run) => {
                    drop(state);
                    let out = run();
                    let mut state = self.shared.state.lock();
                    if state.interrupted || !state.nodes[parent].cell.set(out.clone()) {
                        return;
                    }
                    exit = out;
                    node = parent;
                }
                Action::Cancel { exit: out, sibling } => {
                    state.nodes[parent].cell.set(out.clone());
                    let targets = state.pending_leaves(sibling);
                    if targets.is_empty() {
                        exit = out;
                        node = parent;
                        continue;
                    }
                    let kill_id = state.next_kill;
                    state.next_kill += 1;
                    state.kills.insert(kill_id, Vec::new());
                    drop(state);
                    trace!(
                        node = parent,
                        targets = targets.len(),
                        "cancelling sibling branch"
                    );
                    let this = self.clone();
                    let tokens = kill_fibers(&targets, &Error::parallel_aborted(), move || {
                        this.after_sibling_kill(kill_id, out, parent);
                    });
                    let mut state = self.shared.state.lock();
                    if let Some(slot) = state.kills.get_mut(&kill_id) {
                        *slot = tokens;
                    }
                    return;
                }
            }
        }
    }

    fn after_sibling_kill(&self, kill_id: u64, exit: Exit, node: usize) {
        {
            let mut state = self.shared.state.lock();
            state.kills.remove(&kill_id);
            if state.interrupted {
                return;
            }
        }
        self.join(exit, node);
    }

    /// Cancels the whole evaluation.
    fn cancel<F>(&self, cause: &Error, on_done: F) -> Vec<ListenerToken>
    where
        F: FnOnce() + Send + 'static,
    {
        let (in_flight, targets) = {
            let mut state = self.shared.state.lock();
            state.interrupted = true;
            (mem::take(&mut state.kills), state.pending_leaves(ROOT))
        };
        for token in in_flight.into_values().flatten() {
            token.revoke();
        }
        debug!(leaves = targets.len(), cause = %cause, "cancelling parallel evaluation");
        if targets.is_empty() {
            on_done();
            return Vec::new();
        }
        kill_fibers(&targets, cause, on_done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::{Effect, Par};
    use crate::test_utils::{AsyncProbe, OutcomeSlot, init_test_logging};
    use crate::types::value::erase;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn build_links_parents_and_children() {
        init_test("build_links_parents_and_children");
        let runtime = Runtime::new();
        let tree = Par::new(Effect::pure(1_u8))
            .zip(Par::new(Effect::pure(2_u8)))
            .alt(Par::new(Effect::pure((0_u8, 0_u8))))
            .into_tree();
        let (nodes, leaves) = build(&runtime, None, tree);
        assert_eq!(nodes.len(), 5);
        assert_eq!(leaves.len(), 3);
        let Shape::Alt { lhs, rhs } = nodes[ROOT].kind.shape() else {
            panic!("root must be alt");
        };
        assert_eq!(nodes[lhs].parent, Some(ROOT));
        assert_eq!(nodes[rhs].parent, Some(ROOT));
        let Shape::Apply { lhs: a, rhs: b } = nodes[lhs].kind.shape() else {
            panic!("left must be apply");
        };
        // Leaves are forked left to right.
        assert_eq!(leaves[0].0, a);
        assert_eq!(leaves[1].0, b);
        assert_eq!(leaves[2].0, rhs);
        crate::test_complete!("build_links_parents_and_children");
    }

    #[test]
    fn pending_leaves_skips_resolved() {
        init_test("pending_leaves_skips_resolved");
        let runtime = Runtime::new();
        let tree = Par::new(Effect::pure(1_u8))
            .zip(Par::new(Effect::pure(2_u8)))
            .into_tree();
        let (mut nodes, leaves) = build(&runtime, None, tree);
        nodes[leaves[0].0].cell.set(Ok(erase(1_u8)));
        let state = State {
            nodes,
            fibers: leaves.iter().skip(1).cloned().collect(),
            kills: BTreeMap::new(),
            next_kill: 0,
            interrupted: false,
        };
        let pending = state.pending_leaves(ROOT);
        assert_eq!(pending.len(), 1);
        assert!(pending[0].same_fiber(&leaves[1].1));
        crate::test_complete!("pending_leaves_skips_resolved");
    }

    #[test]
    fn map_over_leaf() {
        init_test("map_over_leaf");
        let runtime = Runtime::new();
        let out = runtime.block_on(Par::new(Effect::pure(21_i32)).map(|x| x * 2).sequential());
        assert_eq!(out.expect("ok"), 42);
        crate::test_complete!("map_over_leaf");
    }

    #[test]
    fn apply_failure_kills_pending_sibling_once() {
        init_test("apply_failure_kills_pending_sibling_once");
        let runtime = Runtime::new();
        let failing = AsyncProbe::<u8>::new();
        let pending = AsyncProbe::<u8>::new();
        let par = Par::new(failing.effect()).zip(Par::new(pending.effect()));
        let slot = OutcomeSlot::new();
        let _fiber = runtime.run_with(par.sequential(), slot.sink());
        assert!(slot.get().is_none());
        failing.resolve(Err(Error::failure("left failed")));
        let err = slot.take().expect("resolved").expect_err("failed");
        assert_eq!(err.message(), Some("left failed"));
        let kills = pending.cancellations();
        crate::assert_with_log!(kills == 1, "pending leaf killed once", 1, kills);
        crate::test_complete!("apply_failure_kills_pending_sibling_once");
    }

    #[test]
    fn alt_first_success_wins() {
        init_test("alt_first_success_wins");
        let runtime = Runtime::new();
        let slow = AsyncProbe::<&'static str>::new();
        let par = Par::new(slow.effect()).alt(Par::new(Effect::pure("fast")));
        let out = runtime.block_on(par.sequential());
        assert_eq!(out.expect("ok"), "fast");
        assert_eq!(slow.cancellations(), 1);
        crate::test_complete!("alt_first_success_wins");
    }

    #[test]
    fn alt_double_failure_keeps_left() {
        init_test("alt_double_failure_keeps_left");
        let runtime = Runtime::new();
        let left = AsyncProbe::<u8>::new();
        let par = Par::new(left.effect()).alt(Par::new(Effect::fail(Error::failure("right"))));
        let slot = OutcomeSlot::new();
        let _fiber = runtime.run_with(par.sequential(), slot.sink());
        assert!(slot.get().is_none());
        left.resolve(Err(Error::failure("left")));
        let err = slot.take().expect("resolved").expect_err("both failed");
        assert_eq!(err.message(), Some("left"));
        crate::test_complete!("alt_double_failure_keeps_left");
    }

    #[test]
    fn killing_parent_cancels_every_leaf() {
        init_test("killing_parent_cancels_every_leaf");
        let runtime = Runtime::new();
        let a = AsyncProbe::<u8>::new();
        let b = AsyncProbe::<u8>::new();
        let par = Par::new(a.effect()).zip(Par::new(b.effect()));
        let slot = OutcomeSlot::new();
        let fiber = runtime.run_with(par.sequential(), slot.sink());
        let acked = OutcomeSlot::<()>::new();
        let _ = fiber.kill(Error::interrupted("shutdown"), acked.ack());
        assert!(acked.take().expect("acknowledged").is_ok());
        assert_eq!(a.cancellations(), 1);
        assert_eq!(b.cancellations(), 1);
        assert!(slot.take().expect("done").expect_err("killed").is_interrupt());
        crate::test_complete!("killing_parent_cancels_every_leaf");
    }
}
