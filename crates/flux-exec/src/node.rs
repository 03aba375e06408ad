//! DIA node & graph (C11) and the stage builder (C12), §4.8. A node's
//! identity, state, and parent edges are kept behind a type-erased
//! [`ExecNode`] trait object so the graph can hold nodes of different item
//! types in one list; everything that depends on a node's item type (the
//! function stack, the per-item push callback) stays fully typed and lives
//! in [`crate::dia::Dia`]/[`DataSource`](crate::dia::DataSource) instead.

use std::cell::Cell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use flux_core::Result;

/// §3 "DIA node": `{NEW, EXECUTING, EXECUTED, CACHED, DISPOSED}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    New,
    Executing,
    Executed,
    Cached,
    Disposed,
}

/// §3 "type ∈ {SOURCE, MAP/LAMBDA, DOP, ACTION, CACHE, COLLAPSE}".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Source,
    Dop,
    Action,
    Collapse,
}

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(0);

/// Fields common to every concrete node, embedded by value.
pub struct NodeCore {
    id: u64,
    kind: NodeKind,
    state: Cell<NodeState>,
    consume: Cell<bool>,
    parents: Vec<Rc<dyn ExecNode>>,
}

impl NodeCore {
    pub fn new(kind: NodeKind, parents: Vec<Rc<dyn ExecNode>>) -> Self {
        NodeCore {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            state: Cell::new(NodeState::New),
            // §4.8 Keep/Consume: "Consume() (the default for one-shot LOps)".
            consume: Cell::new(true),
            parents,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn state(&self) -> NodeState {
        self.state.get()
    }

    pub fn set_state(&self, state: NodeState) {
        self.state.set(state);
    }

    pub fn consume(&self) -> bool {
        self.consume.get()
    }

    pub fn set_consume(&self, flag: bool) {
        self.consume.set(flag);
    }

    pub fn parents(&self) -> &[Rc<dyn ExecNode>] {
        &self.parents
    }
}

/// The type-erased half of a graph node's lifecycle (§4.8 "Node contract").
pub trait ExecNode {
    fn core(&self) -> &NodeCore;

    /// Run this node's own DOp body: consume whatever its parents pushed
    /// into it earlier in this stage, and produce its own cached output.
    /// A no-op once the node is already `Executed`/`Cached`.
    fn execute(&self) -> Result<()>;

    /// Replay this node's cached output into every registered child
    /// callback, then apply the keep/consume decision (§4.8 step 3).
    fn push_data(&self) -> Result<()>;

    fn id(&self) -> u64 {
        self.core().id()
    }

    fn state(&self) -> NodeState {
        self.core().state()
    }

    fn parents(&self) -> &[Rc<dyn ExecNode>] {
        self.core().parents()
    }

    fn set_consume(&self, flag: bool) {
        self.core().set_consume(flag)
    }
}

/// §4.8 stage builder: walk `root`'s parents, halting recursion at any node
/// already `CACHED` (its cache stands in for re-executing its own ancestry),
/// and return the list in the order they must run: every ancestor before
/// any of its descendants, `root` last.
pub fn build_stage(root: Rc<dyn ExecNode>) -> Vec<Rc<dyn ExecNode>> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    visit(root, &mut order, &mut visited);
    order
}

fn visit(node: Rc<dyn ExecNode>, order: &mut Vec<Rc<dyn ExecNode>>, visited: &mut HashSet<u64>) {
    if !visited.insert(node.id()) {
        return;
    }
    if node.state() != NodeState::Cached {
        for parent in node.parents().to_vec() {
            visit(parent, order, visited);
        }
    }
    order.push(node);
}

/// Execute a stage built by [`build_stage`]: each node's `Execute`, then
/// `PushData` into its children (§4.8 step 3).
pub fn run_stage(order: &[Rc<dyn ExecNode>]) -> Result<()> {
    for node in order {
        node.execute()?;
        node.push_data()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting {
        core: NodeCore,
        runs: Cell<u32>,
    }

    impl ExecNode for Counting {
        fn core(&self) -> &NodeCore {
            &self.core
        }
        fn execute(&self) -> Result<()> {
            if self.state() == NodeState::Cached {
                return Ok(());
            }
            self.runs.set(self.runs.get() + 1);
            self.core.set_state(NodeState::Executed);
            Ok(())
        }
        fn push_data(&self) -> Result<()> {
            if self.core.consume() {
                self.core.set_state(NodeState::Disposed);
            } else {
                self.core.set_state(NodeState::Cached);
            }
            Ok(())
        }
    }

    #[test]
    fn cached_ancestor_halts_the_walk_but_still_runs() {
        let source = Rc::new(Counting { core: NodeCore::new(NodeKind::Source, vec![]), runs: Cell::new(0) });
        source.set_consume(false);
        let stage1 = build_stage(source.clone());
        run_stage(&stage1).unwrap();
        assert_eq!(source.runs.get(), 1);
        assert_eq!(source.state(), NodeState::Cached);

        let child: Rc<Counting> =
            Rc::new(Counting { core: NodeCore::new(NodeKind::Dop, vec![source.clone()]), runs: Cell::new(0) });
        let stage2 = build_stage(child.clone());
        // The cached source is still in the stage (so push_data reruns for
        // it) but its own `execute` must not bump the run counter again.
        assert_eq!(stage2.len(), 2);
        run_stage(&stage2).unwrap();
        assert_eq!(source.runs.get(), 1);
        assert_eq!(child.runs.get(), 1);
    }
}
