//! The build graph (§3 Data Model): `Node`s (files), `Edge`s (build actions),
//! `Pool`s (concurrency limits), and `State`, the arena + interning table
//! that owns them all. Mirrors the teacher's dense-arena approach to
//! `Node`/`Edge` identity (see `densemap`) rather than a pointer graph.

use crate::canon::SlashBits;
use crate::densemap::{DenseMap, Index};
use crate::eval::{BindingEnv, Env, EnvChain, EvalString, OwnScope, ParentScope, Rule};
use rustc_hash::FxHashMap;
use std::borrow::Cow;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);
impl Index for NodeId {
    fn index(&self) -> usize {
        self.0 as usize
    }
    fn from_index(i: usize) -> Self {
        NodeId(i as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(pub u32);
impl Index for EdgeId {
    fn index(&self) -> usize {
        self.0 as usize
    }
    fn from_index(i: usize) -> Self {
        EdgeId(i as u32)
    }
}

/// A file's mtime, or the fact that it hasn't been stat'd yet / doesn't exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mtime {
    Unknown,
    Missing,
    Stamp(i64),
}

impl Mtime {
    pub fn as_stamp(&self) -> i64 {
        match self {
            Mtime::Stamp(t) => *t,
            _ => 0,
        }
    }
}

pub struct Node {
    pub path: String,
    pub slash_bits: SlashBits,
    pub mtime: Mtime,
    pub exists: bool,
    pub dirty: bool,
    pub dyndep_pending: bool,
    pub in_edge: Option<EdgeId>,
    pub out_edges: Vec<EdgeId>,
    pub validation_out_edges: Vec<EdgeId>,
    /// Assigned lazily the first time DepsLog needs to refer to this node.
    pub deps_log_id: Option<u32>,
}

impl Node {
    fn new(path: String, slash_bits: SlashBits) -> Self {
        Node {
            path,
            slash_bits,
            mtime: Mtime::Unknown,
            exists: false,
            dirty: false,
            dyndep_pending: false,
            in_edge: None,
            out_edges: Vec::new(),
            validation_out_edges: Vec::new(),
            deps_log_id: None,
        }
    }

    /// The path as it should be passed to commands: canonical form with
    /// separators restored to how the manifest originally spelled them.
    pub fn original_path(&self) -> String {
        self.slash_bits.apply(&self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitState {
    NotVisited,
    InProgress,
    Visited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    None,
    ToStart,
    ToFinish,
}

pub struct Edge {
    pub rule: Rc<Rule>,
    pub pool: Rc<Pool>,
    pub env: Rc<BindingEnv>,
    /// inputs[..explicit_deps] are explicit, [explicit_deps..explicit_deps+implicit_deps]
    /// are implicit, and the remainder are order-only.
    pub inputs: Vec<NodeId>,
    pub explicit_deps: usize,
    pub implicit_deps: usize,
    pub order_only_deps: usize,
    /// outputs[..explicit_outs] are explicit, the remainder implicit.
    pub outputs: Vec<NodeId>,
    pub implicit_outs: usize,
    pub validations: Vec<NodeId>,
    pub dyndep: Option<NodeId>,
    /// Whether a successful run should only count as having changed an
    /// output if its mtime actually advanced (§4.L restat). Starts from the
    /// rule/edge `restat` binding but a dyndep file (§4.K) may flip it on.
    pub restat: bool,

    pub visit: VisitState,
    pub outputs_ready: bool,
    pub deps_loaded: bool,
    pub deps_missing: bool,
    pub want: Want,
}

impl Edge {
    pub fn explicit_inputs(&self) -> &[NodeId] {
        &self.inputs[..self.explicit_deps]
    }
    pub fn implicit_inputs(&self) -> &[NodeId] {
        &self.inputs[self.explicit_deps..self.explicit_deps + self.implicit_deps]
    }
    pub fn order_only_inputs(&self) -> &[NodeId] {
        &self.inputs[self.explicit_deps + self.implicit_deps..]
    }
    pub fn explicit_outputs(&self) -> &[NodeId] {
        &self.outputs[..self.outputs.len() - self.implicit_outs]
    }
    pub fn implicit_outputs(&self) -> &[NodeId] {
        &self.outputs[self.outputs.len() - self.implicit_outs..]
    }

    pub fn is_phony(&self) -> bool {
        self.rule.name == "phony"
    }
}

pub const DEFAULT_POOL_DEPTH_UNLIMITED: usize = 0;
pub const CONSOLE_POOL_NAME: &str = "console";

pub struct Pool {
    pub name: String,
    pub depth: usize,
}

impl Pool {
    pub fn is_unlimited(&self) -> bool {
        self.depth == 0
    }
}

/// Owns every Node/Edge/Pool/Rule created while parsing one manifest (and
/// any of its includes/subninjas); the single source of truth the rest of
/// the engine (scan, plan, builder) operates on.
pub struct State {
    pub nodes: DenseMap<NodeId, Node>,
    pub paths: FxHashMap<String, NodeId>,
    pub edges: DenseMap<EdgeId, Edge>,
    pub pools: FxHashMap<String, Rc<Pool>>,
    pub default_targets: Vec<NodeId>,
    pub root_env: Rc<BindingEnv>,
}

impl State {
    pub fn new() -> Self {
        let mut pools = FxHashMap::default();
        pools.insert(
            String::new(),
            Rc::new(Pool {
                name: String::new(),
                depth: 0,
            }),
        );
        pools.insert(
            CONSOLE_POOL_NAME.to_owned(),
            Rc::new(Pool {
                name: CONSOLE_POOL_NAME.to_owned(),
                depth: 1,
            }),
        );
        State {
            nodes: DenseMap::new(),
            paths: FxHashMap::default(),
            edges: DenseMap::new(),
            pools,
            default_targets: Vec::new(),
            root_env: Rc::new(BindingEnv::new(None)),
        }
    }

    /// Look up the interned node for `canonical_path`, creating it if this
    /// is the first time it's been referenced.
    pub fn get_node(&mut self, canonical_path: &str, slash_bits: SlashBits) -> NodeId {
        if let Some(&id) = self.paths.get(canonical_path) {
            return id;
        }
        let id = self.nodes.push(Node::new(canonical_path.to_owned(), slash_bits));
        self.paths.insert(canonical_path.to_owned(), id);
        id
    }

    pub fn lookup_node(&self, canonical_path: &str) -> Option<NodeId> {
        self.paths.get(canonical_path).copied()
    }

    pub fn add_out(&mut self, node: NodeId, edge: EdgeId) {
        self.nodes.get_mut(node).out_edges.push(edge);
    }

    pub fn add_validation_out(&mut self, node: NodeId, edge: EdgeId) {
        self.nodes.get_mut(node).validation_out_edges.push(edge);
    }

    pub fn add_pool(&mut self, pool: Pool) {
        self.pools.insert(pool.name.clone(), Rc::new(pool));
    }

    pub fn lookup_pool(&self, name: &str) -> Option<Rc<Pool>> {
        self.pools.get(name).cloned()
    }

    /// Render `edge`'s rule binding `name`, evaluated with `$in`/`$out`/
    /// `$in_newline` bound to this edge's actual paths, and with the edge's
    /// own build-level bindings taking precedence over the rule's bindings,
    /// which in turn take precedence over the enclosing scope.
    pub fn edge_variables(&self, edge_id: EdgeId, name: &str) -> String {
        let edge = self.edges.get(edge_id);
        match name {
            "in" => self.path_list(edge.explicit_inputs(), ' '),
            "in_newline" => self.path_list(edge.explicit_inputs(), '\n'),
            "out" => self.path_list(edge.explicit_outputs(), ' '),
            _ => {
                let own = OwnScope(&edge.env);
                let rule = RuleForEdge { state: self, edge_id, rule: &edge.rule };
                let parent = ParentScope(&edge.env);
                let chain = EnvChain(vec![&own as &dyn Env, &rule as &dyn Env, &parent as &dyn Env]);
                chain.get_var(name).map(|c| c.into_owned()).unwrap_or_default()
            }
        }
    }

    fn evaluate_for_edge(&self, template: &EvalString<String>, edge_id: EdgeId) -> String {
        use crate::eval::EvalPart;
        let mut out = String::new();
        for part in template.parts() {
            match part {
                EvalPart::Literal(s) => out.push_str(s),
                EvalPart::VarRef(name) => out.push_str(&self.edge_variables(edge_id, name)),
            }
        }
        out
    }

    fn path_list(&self, ids: &[NodeId], sep: char) -> String {
        let mut out = String::new();
        for (i, &id) in ids.iter().enumerate() {
            if i > 0 {
                out.push(sep);
            }
            out.push_str(&self.nodes.get(id).original_path());
        }
        out
    }

    pub fn command_for(&self, edge_id: EdgeId) -> String {
        self.edge_variables(edge_id, "command")
    }
}

/// `Rule::get_var` alone evaluates a rule binding's own `$in`/`$out`/other
/// var refs with no outer context; this wrapper reroutes that evaluation
/// back through `evaluate_for_edge` so a rule binding that references `$in`,
/// `$out`, or another name resolves with the same edge-aware precedence as
/// everything else.
struct RuleForEdge<'a> {
    state: &'a State,
    edge_id: EdgeId,
    rule: &'a Rule,
}

impl<'a> Env for RuleForEdge<'a> {
    fn get_var(&self, name: &str) -> Option<Cow<str>> {
        self.rule
            .binding(name)
            .map(|v| Cow::Owned(self.state.evaluate_for_edge(v, self.edge_id)))
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canon::canon_path;

    fn intern(state: &mut State, path: &str) -> NodeId {
        let (c, bits) = canon_path(path).unwrap();
        state.get_node(&c, bits)
    }

    #[test]
    fn interning_is_stable() {
        let mut state = State::new();
        let a = intern(&mut state, "foo/bar");
        let b = intern(&mut state, "foo/bar");
        assert_eq!(a, b);
        assert_eq!(state.nodes.len(), 1);
    }

    #[test]
    fn console_pool_has_depth_one() {
        let state = State::new();
        let console = state.lookup_pool("console").unwrap();
        assert_eq!(console.depth, 1);
    }

    #[test]
    fn edge_variables_substitute_in_and_out() {
        let mut state = State::new();
        let input = intern(&mut state, "in.c");
        let output = intern(&mut state, "out.o");
        let mut rule = Rule::new("cc".to_owned());
        rule.bindings.insert(
            "command".to_owned(),
            EvalString::new(vec![
                crate::eval::EvalPart::Literal("cc -c ".to_owned()),
                crate::eval::EvalPart::VarRef("in".to_owned()),
                crate::eval::EvalPart::Literal(" -o ".to_owned()),
                crate::eval::EvalPart::VarRef("out".to_owned()),
            ]),
        );
        let edge = Edge {
            rule: Rc::new(rule),
            pool: state.lookup_pool("").unwrap(),
            env: state.root_env.clone(),
            inputs: vec![input],
            explicit_deps: 1,
            implicit_deps: 0,
            order_only_deps: 0,
            outputs: vec![output],
            implicit_outs: 0,
            validations: Vec::new(),
            dyndep: None,
            restat: false,
            visit: VisitState::NotVisited,
            outputs_ready: false,
            deps_loaded: false,
            deps_missing: false,
            want: Want::None,
        };
        let edge_id = state.edges.push(edge);
        assert_eq!(state.command_for(edge_id), "cc -c in.c -o out.o");
    }

    #[test]
    fn edge_own_binding_shadows_rule_binding() {
        let mut state = State::new();
        let input = intern(&mut state, "in.c");
        let output = intern(&mut state, "out.o");

        let mut rule = Rule::new("cc".to_owned());
        rule.bindings.insert(
            "command".to_owned(),
            EvalString::new(vec![
                crate::eval::EvalPart::Literal("cc ".to_owned()),
                crate::eval::EvalPart::VarRef("cflags".to_owned()),
                crate::eval::EvalPart::Literal(" ".to_owned()),
                crate::eval::EvalPart::VarRef("in".to_owned()),
            ]),
        );
        rule.bindings.insert(
            "cflags".to_owned(),
            EvalString::new(vec![crate::eval::EvalPart::Literal("-O2".to_owned())]),
        );

        let edge_env = Rc::new(BindingEnv::new(Some(state.root_env.clone())));
        edge_env.add_binding(
            "cflags".to_owned(),
            EvalString::new(vec![crate::eval::EvalPart::Literal("-O0".to_owned())]),
        );

        let edge = Edge {
            rule: Rc::new(rule),
            pool: state.lookup_pool("").unwrap(),
            env: edge_env,
            inputs: vec![input],
            explicit_deps: 1,
            implicit_deps: 0,
            order_only_deps: 0,
            outputs: vec![output],
            implicit_outs: 0,
            validations: Vec::new(),
            dyndep: None,
            restat: false,
            visit: VisitState::NotVisited,
            outputs_ready: false,
            deps_loaded: false,
            deps_missing: false,
            want: Want::None,
        };
        let edge_id = state.edges.push(edge);
        assert_eq!(state.command_for(edge_id), "cc -O0 in.c");
    }
}
