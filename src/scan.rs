//! Dependency scanning (§4.J): computes transitive dirtiness for a set of
//! requested root nodes. Grounded in the teacher's `graph.rs` RecomputeDirty
//! (a DFS over in-edges with a tri-state visit flag per edge for cycle
//! detection), generalized here to the fuller dirtiness rule set this port
//! needs: BuildLog command-hash comparison, DepsLog staleness, and depfile
//! loading.

use crate::buildlog::BuildLog;
use crate::canon::canon_path;
use crate::depfile;
use crate::depslog::DepsLog;
use crate::disk::DiskInterface;
use crate::graph::{EdgeId, Mtime, NodeId, State, VisitState};
use crate::hash::hash_command;
use crate::scanner::Scanner;
use anyhow::{anyhow, Result};
use std::cell::RefCell;

/// Drives one dependency-scan pass over whatever subset of `State` the
/// requested targets transitively reach. Holds no state of its own besides
/// the DFS ancestor stack used to report cycles; `State` itself records the
/// durable result (each `Node`'s `mtime`/`exists`/`dirty`).
pub struct DependencyScan<'a> {
    disk: &'a dyn DiskInterface,
    build_log: Option<&'a BuildLog>,
    deps_log: Option<&'a DepsLog>,
    stack: RefCell<Vec<NodeId>>,
}

impl<'a> DependencyScan<'a> {
    pub fn new(
        disk: &'a dyn DiskInterface,
        build_log: Option<&'a BuildLog>,
        deps_log: Option<&'a DepsLog>,
    ) -> Self {
        DependencyScan {
            disk,
            build_log,
            deps_log,
            stack: RefCell::new(Vec::new()),
        }
    }

    pub fn recompute_dirty(&self, state: &mut State, targets: &[NodeId]) -> Result<()> {
        for &target in targets {
            self.visit_node(state, target)?;
        }
        Ok(())
    }

    /// Stat `node` if it hasn't been already, without recursing into its
    /// producing edge (used for a node we're already inside the visit of).
    fn ensure_stat(&self, state: &mut State, node: NodeId) -> Result<Mtime> {
        let cur = state.nodes.get(node).mtime;
        if cur != Mtime::Unknown {
            return Ok(cur);
        }
        let path = state.nodes.get(node).original_path();
        let mtime = self.disk.stat(&path)?;
        let n = state.nodes.get_mut(node);
        n.mtime = mtime;
        n.exists = matches!(mtime, Mtime::Stamp(_));
        Ok(mtime)
    }

    /// Visits a node's producing edge, unless it has none. Stat memoization
    /// lives in `ensure_stat`; re-entrance/cycle memoization lives in the
    /// edge's own `VisitState`, so this never shortcuts on the node alone —
    /// doing so would let a second path back to an in-progress edge through
    /// an already-stat'd node slip past cycle detection.
    fn visit_node(&self, state: &mut State, node: NodeId) -> Result<()> {
        self.ensure_stat(state, node)?;
        if let Some(edge_id) = state.nodes.get(node).in_edge {
            self.stack.borrow_mut().push(node);
            let result = self.visit_edge(state, edge_id);
            self.stack.borrow_mut().pop();
            result?;
        }
        Ok(())
    }

    fn cycle_error(&self, state: &State, edge_id: EdgeId) -> anyhow::Error {
        let stack = self.stack.borrow();
        let start = stack
            .iter()
            .position(|&n| state.nodes.get(n).in_edge == Some(edge_id))
            .unwrap_or(0);
        let names: Vec<String> = stack[start..]
            .iter()
            .map(|&n| state.nodes.get(n).original_path())
            .collect();
        anyhow!("dependency cycle: {}", names.join(" -> "))
    }

    fn visit_edge(&self, state: &mut State, edge_id: EdgeId) -> Result<()> {
        match state.edges.get(edge_id).visit {
            VisitState::Visited => return Ok(()),
            VisitState::InProgress => return Err(self.cycle_error(state, edge_id)),
            VisitState::NotVisited => {}
        }
        state.edges.get_mut(edge_id).visit = VisitState::InProgress;
        let result = self.visit_edge_inner(state, edge_id);
        // Even on error the edge is done being visited on this path; leave it
        // InProgress only while we're actually inside it.
        if result.is_ok() {
            state.edges.get_mut(edge_id).visit = VisitState::Visited;
        }
        result
    }

    fn visit_edge_inner(&self, state: &mut State, edge_id: EdgeId) -> Result<()> {
        let required: Vec<NodeId> = {
            let e = state.edges.get(edge_id);
            e.inputs[..e.explicit_deps + e.implicit_deps].to_vec()
        };
        let order_only: Vec<NodeId> = state.edges.get(edge_id).order_only_inputs().to_vec();

        let mut most_recent_input = Mtime::Missing;
        let mut inputs_dirty = false;
        for &input in &required {
            self.visit_node(state, input)?;
            let n = state.nodes.get(input);
            if n.in_edge.is_none() && !n.exists {
                anyhow::bail!("{}: missing and no known rule to make it", n.original_path());
            }
            if n.dirty {
                inputs_dirty = true;
            }
        }
        // Order-only inputs only enforce build ordering: they still need to
        // be built/visited and must exist afterward, but a dirty order-only
        // input does not by itself dirty the edge that depends on it.
        for &input in &order_only {
            self.visit_node(state, input)?;
            let n = state.nodes.get(input);
            if n.in_edge.is_none() && !n.exists {
                anyhow::bail!("{}: missing and no known rule to make it", n.original_path());
            }
        }
        // Order-only inputs must exist but don't push the most-recent-input
        // watermark forward.
        for &input in &required {
            let t = state.nodes.get(input).mtime;
            if t > most_recent_input {
                most_recent_input = t;
            }
        }

        let mut edge_forced_dirty = false;
        if !state.edges.get(edge_id).deps_loaded {
            let deps_mode = state.edge_variables(edge_id, "deps");
            if deps_mode == "gcc" || deps_mode == "msvc" {
                self.load_recorded_deps(state, edge_id, &mut most_recent_input, &mut inputs_dirty)?;
            } else {
                let depfile_path = state.edge_variables(edge_id, "depfile");
                if !depfile_path.is_empty() {
                    self.load_depfile_deps(
                        state,
                        edge_id,
                        &depfile_path,
                        &mut most_recent_input,
                        &mut inputs_dirty,
                        &mut edge_forced_dirty,
                    )?;
                }
            }
            state.edges.get_mut(edge_id).deps_loaded = true;
        }

        let is_phony = state.edges.get(edge_id).is_phony();
        let outputs: Vec<NodeId> = state.edges.get(edge_id).outputs.clone();
        for &out in &outputs {
            self.ensure_stat(state, out)?;
        }

        let any_dirty = if is_phony {
            for &out in &outputs {
                if !inputs_dirty {
                    state.nodes.get_mut(out).mtime = most_recent_input;
                }
            }
            inputs_dirty
        } else {
            let generator = !state.edge_variables(edge_id, "generator").is_empty();
            let command_hash = hash_command(&state.command_for(edge_id));
            let mut any = inputs_dirty || edge_forced_dirty;
            for &out in &outputs {
                if self.output_is_dirty(state, out, most_recent_input, command_hash, generator) {
                    any = true;
                }
            }
            any
        };

        for &out in &outputs {
            state.nodes.get_mut(out).dirty = any_dirty;
        }
        state.edges.get_mut(edge_id).outputs_ready = !any_dirty;
        Ok(())
    }

    fn output_is_dirty(
        &self,
        state: &State,
        out: NodeId,
        most_recent_input: Mtime,
        command_hash: u64,
        generator: bool,
    ) -> bool {
        let node = state.nodes.get(out);
        if !node.exists {
            return true;
        }
        if let Mtime::Stamp(_) = most_recent_input {
            if node.mtime < most_recent_input {
                return true;
            }
        }
        match self.build_log.and_then(|log| log.lookup(&node.path)) {
            Some(entry) => entry.command_hash != command_hash,
            None => !generator,
        }
    }

    fn load_recorded_deps(
        &self,
        state: &mut State,
        edge_id: EdgeId,
        most_recent_input: &mut Mtime,
        inputs_dirty: &mut bool,
    ) -> Result<()> {
        let out_path = {
            let first_out = state.edges.get(edge_id).outputs[0];
            state.nodes.get(first_out).path.clone()
        };
        let record = self
            .deps_log
            .and_then(|log| log.id_for(&out_path).and_then(|id| log.lookup(id).map(|r| (id, r))));
        let Some((_out_id, record)) = record else {
            // Never recorded: force a rebuild so the log gets populated.
            *inputs_dirty = true;
            state.edges.get_mut(edge_id).deps_missing = true;
            return Ok(());
        };
        if let Mtime::Stamp(t) = *most_recent_input {
            if record.mtime < t {
                *inputs_dirty = true;
            }
        }
        let deps_log = self.deps_log.unwrap();
        let mut extra = Vec::new();
        for &dep_id in &record.deps {
            let path = deps_log.paths[dep_id as usize].clone();
            let (canon, bits) = canon_path(&path)?;
            let node = state.get_node(&canon, bits);
            self.visit_node(state, node)?;
            let n = state.nodes.get(node);
            if n.mtime > *most_recent_input {
                *most_recent_input = n.mtime;
            }
            if n.dirty {
                *inputs_dirty = true;
            }
            extra.push(node);
        }
        self.add_implicit_inputs(state, edge_id, extra);
        Ok(())
    }

    fn load_depfile_deps(
        &self,
        state: &mut State,
        edge_id: EdgeId,
        depfile_path: &str,
        most_recent_input: &mut Mtime,
        inputs_dirty: &mut bool,
        edge_forced_dirty: &mut bool,
    ) -> Result<()> {
        let contents = match self.disk.read_file(depfile_path) {
            Ok(c) => c,
            Err(_) => {
                let first_out = state.edges.get(edge_id).outputs[0];
                self.ensure_stat(state, first_out)?;
                if state.nodes.get(first_out).exists {
                    *edge_forced_dirty = true;
                }
                state.edges.get_mut(edge_id).deps_missing = true;
                return Ok(());
            }
        };
        let mut buf = contents;
        let mut scanner = Scanner::new(&mut buf);
        let parsed = depfile::parse(&mut scanner)
            .map_err(|e| anyhow!(scanner.format_parse_error(depfile_path, e)))?;
        let mut extra = Vec::new();
        for input_path in &parsed.ins {
            let (canon, bits) = canon_path(input_path)?;
            let node = state.get_node(&canon, bits);
            self.visit_node(state, node)?;
            let n = state.nodes.get(node);
            if n.mtime > *most_recent_input {
                *most_recent_input = n.mtime;
            }
            if n.dirty {
                *inputs_dirty = true;
            }
            extra.push(node);
        }
        self.add_implicit_inputs(state, edge_id, extra);
        Ok(())
    }

    fn add_implicit_inputs(&self, state: &mut State, edge_id: EdgeId, extra: Vec<NodeId>) {
        if extra.is_empty() {
            return;
        }
        let insert_at = {
            let e = state.edges.get(edge_id);
            e.explicit_deps + e.implicit_deps
        };
        {
            let e = state.edges.get_mut(edge_id);
            for (i, &node) in extra.iter().enumerate() {
                e.inputs.insert(insert_at + i, node);
            }
            e.implicit_deps += extra.len();
        }
        for &node in &extra {
            state.add_out(node, edge_id);
        }
    }
}
