//! The build scheduler (§4.L): decides, independent of how commands are
//! actually run, which edges are wanted and which of those are currently
//! runnable. `Builder` drives this by calling `find_work`/`edge_finished`
//! in a loop and handing whatever `find_work` returns to a `CommandRunner`.
//!
//! Grounded in the teacher's `graph.rs` scheduling split (the graph owns
//! static structure, a separate object owns the dynamic want/ready state)
//! though the teacher calls its equivalent something else; the name and
//! shape here follow the spec's own Plan description.

use crate::buildlog::BuildLog;
use crate::disk::DiskInterface;
use crate::graph::{EdgeId, Mtime, NodeId, State, Want};
use crate::hash::hash_command;
use anyhow::Result;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeResult {
    Succeeded,
    Failed,
}

pub struct Plan {
    /// Edges currently wanted (mirrors `Edge.want`, kept here too so we can
    /// tell "never wanted" apart from "wanted, already finished").
    want: FxHashMap<EdgeId, Want>,
    /// For a wanted edge not yet in `ready`, how many of its inputs are
    /// still waiting on their own producing edge to finish.
    pending_inputs: FxHashMap<EdgeId, usize>,
    /// Edges whose inputs are all ready, not yet offered to a pool.
    ready: VecDeque<EdgeId>,
    /// Edges a pool has already reserved a slot for; `find_work` drains
    /// these before touching `ready` at all, so releasing a slot and
    /// handing it straight to the next waiter never double-counts.
    started: VecDeque<EdgeId>,
    /// Edges parked because their pool was at capacity when offered.
    pool_waiting: FxHashMap<String, VecDeque<EdgeId>>,
    pool_in_flight: FxHashMap<String, usize>,
    command_edges: usize,
    wanted_edges: usize,
    failures: usize,
    failures_allowed: usize,
    stopped: bool,
}

impl Plan {
    pub fn new(failures_allowed: usize) -> Self {
        Plan {
            want: FxHashMap::default(),
            pending_inputs: FxHashMap::default(),
            ready: VecDeque::new(),
            started: VecDeque::new(),
            pool_waiting: FxHashMap::default(),
            pool_in_flight: FxHashMap::default(),
            command_edges: 0,
            wanted_edges: 0,
            failures: 0,
            failures_allowed: failures_allowed.max(1),
            stopped: false,
        }
    }

    pub fn wanted_edges(&self) -> usize {
        self.wanted_edges
    }

    pub fn command_edges(&self) -> usize {
        self.command_edges
    }

    /// Whether there's still anything wanted that hasn't finished (or been
    /// cancelled), i.e. whether the builder's main loop should keep going.
    pub fn more_to_do(&self) -> bool {
        !self.want.is_empty()
    }

    fn node_ready(state: &State, node: NodeId) -> bool {
        match state.nodes.get(node).in_edge {
            None => true,
            Some(e) => state.edges.get(e).outputs_ready,
        }
    }

    /// Mark `node`'s producing edge (if any) wanted, recursing on its
    /// inputs. Idempotent: a node whose edge is already wanted (or already
    /// known up to date) is a no-op, so diamond dependencies are visited
    /// once regardless of how many targets reach them.
    pub fn add_target(&mut self, state: &mut State, node: NodeId) {
        let Some(edge_id) = state.nodes.get(node).in_edge else {
            return;
        };
        if self.want.contains_key(&edge_id) {
            return;
        }
        if state.edges.get(edge_id).outputs_ready {
            return;
        }

        self.want.insert(edge_id, Want::ToStart);
        state.edges.get_mut(edge_id).want = Want::ToStart;
        self.wanted_edges += 1;
        if !state.edges.get(edge_id).is_phony() {
            self.command_edges += 1;
        }

        let inputs: Vec<NodeId> = state.edges.get(edge_id).inputs.clone();
        for &input in &inputs {
            self.add_target(state, input);
        }

        let pending = inputs.iter().filter(|&&n| !Self::node_ready(state, n)).count();
        if pending == 0 {
            self.mark_ready(edge_id);
        } else {
            self.pending_inputs.insert(edge_id, pending);
        }
    }

    fn mark_ready(&mut self, edge_id: EdgeId) {
        self.ready.push_back(edge_id);
    }

    /// Pop the next edge the builder should start running, admitting it to
    /// its pool (if any) along the way. Returns `None` when there's nothing
    /// currently runnable (either genuinely idle, or stopped on failures).
    pub fn find_work(&mut self, state: &mut State) -> Option<EdgeId> {
        if self.stopped {
            return None;
        }
        if let Some(edge_id) = self.started.pop_front() {
            state.edges.get_mut(edge_id).want = Want::ToFinish;
            return Some(edge_id);
        }
        while let Some(edge_id) = self.ready.pop_front() {
            let pool = state.edges.get(edge_id).pool.clone();
            if pool.is_unlimited() {
                state.edges.get_mut(edge_id).want = Want::ToFinish;
                return Some(edge_id);
            }
            let slot = self.pool_in_flight.entry(pool.name.clone()).or_insert(0);
            if *slot < pool.depth {
                *slot += 1;
                state.edges.get_mut(edge_id).want = Want::ToFinish;
                return Some(edge_id);
            }
            self.pool_waiting
                .entry(pool.name.clone())
                .or_default()
                .push_back(edge_id);
        }
        None
    }

    fn release_pool_slot(&mut self, state: &State, edge_id: EdgeId) {
        let pool = state.edges.get(edge_id).pool.clone();
        if pool.is_unlimited() {
            return;
        }
        if let Some(c) = self.pool_in_flight.get_mut(&pool.name) {
            *c = c.saturating_sub(1);
        }
        if let Some(queue) = self.pool_waiting.get_mut(&pool.name) {
            if let Some(next) = queue.pop_front() {
                *self.pool_in_flight.entry(pool.name.clone()).or_insert(0) += 1;
                self.started.push_back(next);
            }
        }
    }

    /// Report that `edge_id` finished running. Releases its pool slot
    /// (admitting the next waiter, if any), then handles success/failure.
    pub fn edge_finished(
        &mut self,
        state: &mut State,
        disk: &dyn DiskInterface,
        build_log: Option<&BuildLog>,
        edge_id: EdgeId,
        result: EdgeResult,
    ) -> Result<()> {
        self.release_pool_slot(state, edge_id);
        match result {
            EdgeResult::Failed => {
                self.failures += 1;
                self.want.remove(&edge_id);
                self.pending_inputs.remove(&edge_id);
                state.edges.get_mut(edge_id).want = Want::None;
                if self.failures >= self.failures_allowed {
                    self.stopped = true;
                }
            }
            EdgeResult::Succeeded => {
                self.complete_success(state, disk, build_log, edge_id)?;
            }
        }
        Ok(())
    }

    fn complete_success(
        &mut self,
        state: &mut State,
        disk: &dyn DiskInterface,
        build_log: Option<&BuildLog>,
        edge_id: EdgeId,
    ) -> Result<()> {
        let restat = state.edges.get(edge_id).restat;
        let required: Vec<NodeId> = {
            let e = state.edges.get(edge_id);
            e.inputs[..e.explicit_deps + e.implicit_deps].to_vec()
        };
        let mut most_recent_input = Mtime::Missing;
        for &input in &required {
            let t = state.nodes.get(input).mtime;
            if t > most_recent_input {
                most_recent_input = t;
            }
        }

        let outputs: Vec<NodeId> = state.edges.get(edge_id).outputs.clone();
        for &out in &outputs {
            let path = state.nodes.get(out).original_path();
            let new_mtime = disk.stat(&path)?;
            if restat {
                let unchanged = matches!(
                    (new_mtime, most_recent_input),
                    (Mtime::Stamp(t), Mtime::Stamp(m)) if t <= m
                );
                if unchanged {
                    self.clean_node(state, build_log, out, new_mtime)?;
                    continue;
                }
            }
            let n = state.nodes.get_mut(out);
            n.mtime = new_mtime;
            n.exists = matches!(new_mtime, Mtime::Stamp(_));
            n.dirty = false;
        }

        self.mark_edge_outputs_ready(state, edge_id);
        Ok(())
    }

    /// A restat'd output whose mtime didn't advance: record it as clean and
    /// see whether that lets any edge still waiting on it be cancelled.
    fn clean_node(
        &mut self,
        state: &mut State,
        build_log: Option<&BuildLog>,
        node: NodeId,
        mtime: Mtime,
    ) -> Result<()> {
        {
            let n = state.nodes.get_mut(node);
            n.mtime = mtime;
            n.exists = matches!(mtime, Mtime::Stamp(_));
            n.dirty = false;
        }
        let consumers: Vec<EdgeId> = state.nodes.get(node).out_edges.clone();
        for edge_id in consumers {
            self.recompute_and_maybe_cancel(state, build_log, edge_id)?;
        }
        Ok(())
    }

    /// An edge downstream of a restat-cleaned output may no longer need to
    /// run at all: if every one of its non-order-only inputs is clean and
    /// every one of its outputs is already up to date (mtime and command
    /// hash both unchanged), drop it from the plan and mark it done without
    /// ever dispatching it.
    fn recompute_and_maybe_cancel(
        &mut self,
        state: &mut State,
        build_log: Option<&BuildLog>,
        edge_id: EdgeId,
    ) -> Result<()> {
        if !self.want.contains_key(&edge_id) {
            return Ok(());
        }
        if state.edges.get(edge_id).want != Want::ToStart {
            // Already dispatched (or finished) - too late to cancel.
            return Ok(());
        }

        let required: Vec<NodeId> = {
            let e = state.edges.get(edge_id);
            e.inputs[..e.explicit_deps + e.implicit_deps].to_vec()
        };
        let mut most_recent_input = Mtime::Missing;
        for &input in &required {
            let n = state.nodes.get(input);
            if n.dirty {
                return Ok(());
            }
            if n.mtime > most_recent_input {
                most_recent_input = n.mtime;
            }
        }

        let command_hash = hash_command(&state.command_for(edge_id));
        let outputs: Vec<NodeId> = state.edges.get(edge_id).outputs.clone();
        for &out in &outputs {
            let n = state.nodes.get(out);
            if !n.exists {
                return Ok(());
            }
            if matches!(most_recent_input, Mtime::Stamp(_)) && n.mtime < most_recent_input {
                return Ok(());
            }
            let clean = match build_log.and_then(|log| log.lookup(&n.path)) {
                Some(entry) => entry.command_hash == command_hash,
                None => false,
            };
            if !clean {
                return Ok(());
            }
        }

        self.want.remove(&edge_id);
        self.pending_inputs.remove(&edge_id);
        state.edges.get_mut(edge_id).want = Want::None;
        self.mark_edge_outputs_ready(state, edge_id);
        Ok(())
    }

    /// An edge is done (either it ran, or restat cancellation decided it
    /// didn't need to): remove it from `want` and wake up any dependent
    /// edge whose last pending input was this one.
    fn mark_edge_outputs_ready(&mut self, state: &mut State, edge_id: EdgeId) {
        state.edges.get_mut(edge_id).outputs_ready = true;
        self.want.remove(&edge_id);

        let mut consumers: FxHashSet<EdgeId> = FxHashSet::default();
        for &out in &state.edges.get(edge_id).outputs.clone() {
            for &consumer in &state.nodes.get(out).out_edges.clone() {
                consumers.insert(consumer);
            }
        }
        for consumer in consumers {
            if let Some(remaining) = self.pending_inputs.get_mut(&consumer) {
                *remaining -= 1;
                if *remaining == 0 {
                    self.pending_inputs.remove(&consumer);
                    self.mark_ready(consumer);
                }
            }
        }
    }
}
