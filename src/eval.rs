//! Represents parsed Ninja strings with embedded variable references, e.g.
//! `c++ $in -o $out`, and the lexically scoped environments (§3 BindingEnv)
//! used to expand them. Expansion is always lazy (done at use time, not at
//! parse time) because an edge's own bindings may shadow a rule- or
//! file-scope binding of the same name (§9 Design Notes).

use crate::smallmap::SmallMap;
use std::borrow::Cow;
use std::cell::RefCell;
use std::rc::Rc;

/// One token within an `EvalString`: either literal text or a variable
/// reference to be looked up against an `Env` at evaluation time.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalPart<T: AsRef<str>> {
    Literal(T),
    VarRef(T),
}

/// A parsed but unexpanded variable-reference string, e.g. `"cc $in -o $out"`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EvalString<T: AsRef<str>>(Vec<EvalPart<T>>);

impl<T: AsRef<str>> EvalString<T> {
    pub fn new(parts: Vec<EvalPart<T>>) -> Self {
        EvalString(parts)
    }

    pub fn parts(&self) -> &[EvalPart<T>] {
        &self.0
    }

    /// True if this string has no `$`-references at all, letting callers
    /// skip evaluation entirely for the common case of a plain literal.
    pub fn is_literal(&self) -> bool {
        matches!(self.0.as_slice(), [EvalPart::Literal(_)] | [])
    }
}

impl EvalString<&str> {
    pub fn into_owned(self) -> EvalString<String> {
        EvalString(
            self.0
                .into_iter()
                .map(|p| match p {
                    EvalPart::Literal(s) => EvalPart::Literal(s.to_owned()),
                    EvalPart::VarRef(s) => EvalPart::VarRef(s.to_owned()),
                })
                .collect(),
        )
    }
}

impl EvalString<String> {
    pub fn evaluate(&self, envs: &[&dyn Env]) -> String {
        let mut out = String::new();
        self.evaluate_into(&mut out, envs);
        out
    }

    pub fn evaluate_into(&self, out: &mut String, envs: &[&dyn Env]) {
        for part in &self.0 {
            match part {
                EvalPart::Literal(s) => out.push_str(s),
                EvalPart::VarRef(name) => {
                    if let Some(val) = lookup(name, envs) {
                        out.push_str(&val);
                    }
                }
            }
        }
    }
}

/// Look up `name` in the first env of `envs` that defines it.
fn lookup(name: &str, envs: &[&dyn Env]) -> Option<Cow<'static, str>> {
    for env in envs {
        if let Some(v) = env.get_var(name) {
            return Some(Cow::Owned(v.into_owned()));
        }
    }
    None
}

/// A source of variable bindings. `BindingEnv` is the main implementor;
/// small ad hoc envs (e.g. the magic `$in`/`$out` of an edge) also implement
/// it so they can be spliced into a lookup chain ahead of the "real" scope.
pub trait Env {
    fn get_var(&self, name: &str) -> Option<Cow<str>>;
}

/// Tries each env in order; the first to return `Some` wins. Used to give
/// edge-local bindings (and the magic `$in`/`$out`) precedence over the
/// rule's bindings, which in turn take precedence over the enclosing scope.
pub struct EnvChain<'a>(pub Vec<&'a dyn Env>);

impl<'a> Env for EnvChain<'a> {
    fn get_var(&self, name: &str) -> Option<Cow<str>> {
        for env in &self.0 {
            if let Some(v) = env.get_var(name) {
                return Some(Cow::Owned(v.into_owned()));
            }
        }
        None
    }
}

/// A `BindingEnv`'s own bindings only, with the parent-scope fallback
/// suppressed, so a rule binding for the same name can be spliced in
/// between via `EnvChain`.
pub struct OwnScope<'a>(pub &'a BindingEnv);

impl<'a> Env for OwnScope<'a> {
    fn get_var(&self, name: &str) -> Option<Cow<str>> {
        self.0
            .vars
            .borrow()
            .get(name)
            .map(|v| Cow::Owned(v.evaluate(&[self.0])))
    }
}

/// The scope enclosing a `BindingEnv`, skipping its own bindings (already
/// checked via `OwnScope`).
pub struct ParentScope<'a>(pub &'a BindingEnv);

impl<'a> Env for ParentScope<'a> {
    fn get_var(&self, name: &str) -> Option<Cow<str>> {
        self.0.parent.as_ref().and_then(|p| p.get_var(name))
    }
}

/// Bindings collected for a `rule` block or an edge's own scoped bindings;
/// never recursively defined until looked up.
pub type LazyVars = SmallMap<String, EvalString<String>>;

/// The reserved binding names a `rule` block may define (§3 Rule).
pub const RESERVED_RULE_BINDINGS: &[&str] = &[
    "command",
    "description",
    "depfile",
    "deps",
    "msvc_deps_prefix",
    "generator",
    "restat",
    "rspfile",
    "rspfile_content",
    "pool",
    "dyndep",
    "symlink_outputs",
];

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub bindings: LazyVars,
}

impl Rule {
    pub fn new(name: String) -> Self {
        Rule {
            name,
            bindings: LazyVars::new(),
        }
    }

    pub fn binding(&self, key: &str) -> Option<&EvalString<String>> {
        self.bindings.get(key)
    }
}

impl Env for Rule {
    fn get_var(&self, name: &str) -> Option<Cow<str>> {
        // A rule's own bindings may reference other rule bindings or fall
        // through to whatever env the rule is evaluated against; since Rule
        // alone doesn't carry the outer scope, unresolved names are absent
        // here and the caller's EnvChain supplies the rest.
        self.bindings.get(name).map(|v| Cow::Owned(v.evaluate(&[])))
    }
}

/// A lexically scoped variable + rule table (§3 BindingEnv). Child scopes
/// (one per `subninja`) point at their parent; bindings shadow outward.
/// Rule visibility is *not* inherited the same way variables are: a rule
/// defined in a subninja is visible only within that subninja's own scope
/// and its children, matching real Ninja's "subninja rules are private".
pub struct BindingEnv {
    // `RefCell`-wrapped so a scope can keep accumulating bindings while
    // already shared (via `Rc`) as the parent of a `subninja`'s child scope
    // or as the frozen environment an already-constructed `Edge` evaluates
    // its command against later.
    vars: RefCell<LazyVars>,
    rules: RefCell<rustc_hash::FxHashMap<String, Rc<Rule>>>,
    parent: Option<Rc<BindingEnv>>,
}

impl BindingEnv {
    pub fn new(parent: Option<Rc<BindingEnv>>) -> Self {
        BindingEnv {
            vars: RefCell::new(LazyVars::new()),
            rules: RefCell::new(rustc_hash::FxHashMap::default()),
            parent,
        }
    }

    pub fn add_binding(&self, name: String, value: EvalString<String>) {
        self.vars.borrow_mut().insert(name, value);
    }

    pub fn add_rule(&self, rule: Rule) {
        self.rules.borrow_mut().insert(rule.name.clone(), Rc::new(rule));
    }

    /// Look up a rule by name, walking outward through parent scopes.
    pub fn lookup_rule(&self, name: &str) -> Option<Rc<Rule>> {
        if let Some(r) = self.rules.borrow().get(name) {
            return Some(r.clone());
        }
        self.parent.as_ref().and_then(|p| p.lookup_rule(name))
    }

    /// Evaluate a top-level (non-edge) binding immediately, e.g. for pool
    /// depths or `ninja_required_version`.
    pub fn evaluate(&self, s: &EvalString<String>) -> String {
        s.evaluate(&[self])
    }
}

impl Env for BindingEnv {
    fn get_var(&self, name: &str) -> Option<Cow<str>> {
        if let Some(v) = self.vars.borrow().get(name) {
            return Some(Cow::Owned(v.evaluate(&[self])));
        }
        self.parent.as_ref().and_then(|p| p.get_var(name))
    }
}
