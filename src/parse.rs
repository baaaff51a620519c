//! The manifest parser (§4.D): drives the `Lexer`, builds `Rule`/`Pool`/
//! `Edge` objects into a `State`, and resolves `include`/`subninja`.
//! Grounded in the teacher's `load.rs` (the `$in`/`$out` implicit-vars env,
//! the rule-lookup-then-evaluate shape of `add_build`) adapted to this
//! port's token-based `Lexer` rather than the teacher's character scanner.

use crate::canon::canon_path;
use crate::disk::DiskInterface;
use crate::eval::{BindingEnv, Env, EvalPart, EvalString, Rule};
use crate::graph::{Edge, Pool, State, VisitState, Want};
use crate::lexer::{Lexer, StringMode, Token};
use anyhow::{anyhow, bail, Result};
use std::rc::Rc;

pub const ENGINE_VERSION: (u32, u32) = (1, 10);

#[derive(Clone, Copy, Default)]
pub struct StrictMode {
    pub dupbuild_err: bool,
    pub phonycycle_err: bool,
}

/// A dashmap-backed prefetch cache shared across one `parse_manifest` call:
/// before a file's own statements are parsed, its directly literal
/// `include`/`subninja` targets are read concurrently via `rayon` and
/// stashed here, so the single-threaded parse loop below picks them up
/// without a second blocking read (§1.1, §5). Purely an optimization —
/// anything not found here falls back to a direct `disk.read_file`.
#[derive(Default)]
struct FileCache(dashmap::DashMap<String, Vec<u8>>);

impl FileCache {
    fn take(&self, path: &str) -> Option<Vec<u8>> {
        self.0.remove(path).map(|(_, v)| v)
    }

    fn prefetch(&self, disk: &dyn DiskInterface, paths: &[String]) {
        use rayon::prelude::*;
        paths.par_iter().for_each(|p| {
            if self.0.contains_key(p) {
                return;
            }
            if let Ok(bytes) = disk.read_file(p) {
                self.0.insert(p.clone(), bytes);
            }
        });
    }
}

/// Best-effort scan for `include`/`subninja` targets that are plain
/// literal paths (no `$` references), the common case, so they can be
/// prefetched before the sequential loop below reaches them. Anything
/// dynamic, or anything this quick pass can't make sense of, is simply
/// read normally when the real parse loop gets to it.
fn prescan_include_paths(bytes: &[u8]) -> Vec<String> {
    let mut lexer = Lexer::new(bytes);
    let mut out = Vec::new();
    loop {
        let tok = match lexer.read_token() {
            Ok(t) => t,
            Err(_) => break,
        };
        match tok {
            Token::Teof => break,
            Token::Include | Token::Subninja => {
                lexer.skip_spaces();
                if let Ok(s) = lexer.read_eval_string(StringMode::Path) {
                    if let [EvalPart::Literal(lit)] = s.parts() {
                        if let Ok((canon, _)) = canon_path(lit) {
                            out.push(canon);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Parse `path` as the root manifest, populating `state`.
pub fn parse_manifest(
    state: &mut State,
    disk: &dyn DiskInterface,
    path: &str,
    strict: StrictMode,
) -> Result<()> {
    let root_env = state.root_env.clone();
    let cache = FileCache::default();
    parse_file(state, disk, path, root_env, strict, &cache)
}

fn describe(filename: &str, lexer: &Lexer<'_>, err: crate::lexer::ParseError) -> anyhow::Error {
    anyhow!(lexer.describe_error(filename, &err))
}

fn parse_file(
    state: &mut State,
    disk: &dyn DiskInterface,
    path: &str,
    env: Rc<BindingEnv>,
    strict: StrictMode,
    cache: &FileCache,
) -> Result<()> {
    let mut bytes = match cache.take(path) {
        Some(b) => b,
        None => disk
            .read_file(path)
            .map_err(|e| anyhow!("loading {}: {}", path, e))?,
    };
    bytes.push(0);

    let children = prescan_include_paths(&bytes);
    if !children.is_empty() {
        cache.prefetch(disk, &children);
    }

    let mut lexer = Lexer::new(&bytes);

    loop {
        let tok = lexer.read_token().map_err(|e| describe(path, &lexer, e))?;
        match tok {
            Token::Teof => break,
            Token::Newline => continue,
            Token::Pool => parse_pool(state, &env, &mut lexer, path)?,
            Token::Rule => parse_rule(&env, &mut lexer, path)?,
            Token::Build => parse_build(state, &env, &mut lexer, path, strict)?,
            Token::Default => parse_default(state, &env, &mut lexer, path)?,
            Token::Include => {
                let target = read_single_path(&env, &mut lexer, path)?;
                let (canon, _) = canon_path(&target)?;
                parse_file(state, disk, &canon, env.clone(), strict, cache)?;
            }
            Token::Subninja => {
                let target = read_single_path(&env, &mut lexer, path)?;
                let (canon, _) = canon_path(&target)?;
                let child = Rc::new(BindingEnv::new(Some(env.clone())));
                parse_file(state, disk, &canon, child, strict, cache)?;
            }
            Token::Ident => {
                lexer.unread_token();
                let name = lexer.read_ident().map_err(|e| describe(path, &lexer, e))?.to_owned();
                lexer.skip_spaces();
                lexer
                    .expect_byte(b'=')
                    .map_err(|e| describe(path, &lexer, e))?;
                lexer.skip_spaces();
                let value = lexer
                    .read_eval_string(StringMode::Value)
                    .map_err(|e| describe(path, &lexer, e))?
                    .into_owned();
                expect_newline(&mut lexer, path)?;
                let evaluated = value.evaluate(&[env.as_ref()]);
                if name == "ninja_required_version" {
                    check_required_version(&evaluated)?;
                }
                env.add_binding(name, EvalString::new(vec![EvalPart::Literal(evaluated)]));
            }
            other => {
                let err = lexer
                    .error::<Token>(format!("unexpected token {:?}", other))
                    .unwrap_err();
                return Err(describe(path, &lexer, err));
            }
        }
    }
    Ok(())
}

fn expect_newline(lexer: &mut Lexer<'_>, path: &str) -> Result<()> {
    let tok = lexer.read_token().map_err(|e| describe(path, lexer, e))?;
    if tok != Token::Newline && tok != Token::Teof {
        bail!("{}: expected newline, got {:?}", path, tok);
    }
    Ok(())
}

fn read_single_path(env: &Rc<BindingEnv>, lexer: &mut Lexer<'_>, path: &str) -> Result<String> {
    lexer.skip_spaces();
    let s = lexer
        .read_eval_string(StringMode::Path)
        .map_err(|e| describe(path, lexer, e))?
        .into_owned();
    expect_newline(lexer, path)?;
    Ok(s.evaluate(&[env.as_ref()]))
}

fn check_required_version(v: &str) -> Result<()> {
    let mut parts = v.splitn(2, '.');
    let major: u32 = parts.next().unwrap_or("0").parse().unwrap_or(0);
    let minor: u32 = parts
        .next()
        .unwrap_or("0")
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .unwrap_or("0")
        .parse()
        .unwrap_or(0);
    if (major, minor) > ENGINE_VERSION {
        bail!(
            "manifest requires version {}.{} but this engine supports up to {}.{}",
            major,
            minor,
            ENGINE_VERSION.0,
            ENGINE_VERSION.1
        );
    }
    Ok(())
}

/// Read a space-separated run of paths, stopping (without consuming) at the
/// first `:`/`|`/`||`/`|@`/newline/eof. `read_eval_string` already treats all
/// of those as path-mode terminators, so an empty result marks the end.
fn read_paths<'a>(lexer: &mut Lexer<'a>, path: &str) -> Result<Vec<EvalString<&'a str>>> {
    let mut out = Vec::new();
    loop {
        lexer.skip_spaces();
        let s = lexer
            .read_eval_string(StringMode::Path)
            .map_err(|e| describe(path, lexer, e))?;
        if s.parts().is_empty() {
            break;
        }
        out.push(s);
    }
    Ok(out)
}

fn parse_pool(state: &mut State, env: &Rc<BindingEnv>, lexer: &mut Lexer<'_>, path: &str) -> Result<()> {
    let name = lexer.read_ident().map_err(|e| describe(path, lexer, e))?.to_owned();
    expect_newline(lexer, path)?;
    let mut depth = None;
    while lexer.peek_token(Token::Indent).map_err(|e| describe(path, lexer, e))? {
        let key = lexer.read_ident().map_err(|e| describe(path, lexer, e))?.to_owned();
        lexer.skip_spaces();
        lexer.expect_byte(b'=').map_err(|e| describe(path, lexer, e))?;
        lexer.skip_spaces();
        let val = lexer
            .read_eval_string(StringMode::Value)
            .map_err(|e| describe(path, lexer, e))?
            .into_owned();
        expect_newline(lexer, path)?;
        match key.as_str() {
            "depth" => {
                let text = val.evaluate(&[env.as_ref()]);
                let n: i64 = text
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("{}: invalid pool depth {:?}", path, text))?;
                if n < 0 {
                    bail!("{}: pool depth must not be negative", path);
                }
                depth = Some(n as usize);
            }
            other => bail!("{}: unexpected pool binding {:?}", path, other),
        }
    }
    let depth = depth.ok_or_else(|| anyhow!("{}: pool {:?} missing 'depth'", path, name))?;
    state.add_pool(Pool { name, depth });
    Ok(())
}

fn parse_rule(env: &Rc<BindingEnv>, lexer: &mut Lexer<'_>, path: &str) -> Result<()> {
    let name = lexer.read_ident().map_err(|e| describe(path, lexer, e))?.to_owned();
    expect_newline(lexer, path)?;
    let mut rule = Rule::new(name);
    while lexer.peek_token(Token::Indent).map_err(|e| describe(path, lexer, e))? {
        let key = lexer.read_ident().map_err(|e| describe(path, lexer, e))?.to_owned();
        lexer.skip_spaces();
        lexer.expect_byte(b'=').map_err(|e| describe(path, lexer, e))?;
        lexer.skip_spaces();
        let val = lexer
            .read_eval_string(StringMode::Value)
            .map_err(|e| describe(path, lexer, e))?
            .into_owned();
        expect_newline(lexer, path)?;
        rule.bindings.insert(key, val);
    }
    if rule.binding("command").is_none() {
        bail!("{}: rule {:?} has no 'command'", path, rule.name);
    }
    if rule.binding("rspfile").is_some() != rule.binding("rspfile_content").is_some() {
        bail!(
            "{}: rule {:?} must define both 'rspfile' and 'rspfile_content', or neither",
            path,
            rule.name
        );
    }
    env.add_rule(rule);
    Ok(())
}

fn parse_default(state: &mut State, env: &Rc<BindingEnv>, lexer: &mut Lexer<'_>, path: &str) -> Result<()> {
    let paths = read_paths(lexer, path)?;
    expect_newline(lexer, path)?;
    if paths.is_empty() {
        bail!("{}: expected target after 'default'", path);
    }
    for p in paths {
        let text = p.into_owned().evaluate(&[env.as_ref()]);
        let (canon, bits) = canon_path(&text)?;
        let id = state.get_node(&canon, bits);
        state.default_targets.push(id);
    }
    Ok(())
}

fn parse_build(
    state: &mut State,
    env: &Rc<BindingEnv>,
    lexer: &mut Lexer<'_>,
    path: &str,
    strict: StrictMode,
) -> Result<()> {
    let mut outputs = read_paths(lexer, path)?;
    let mut outputs_implicit_n = 0usize;
    if lexer.peek_token(Token::Pipe).map_err(|e| describe(path, lexer, e))? {
        let more = read_paths(lexer, path)?;
        outputs_implicit_n = more.len();
        outputs.extend(more);
    }
    lexer.expect_byte(b':').map_err(|e| describe(path, lexer, e))?;
    lexer.skip_spaces();
    let rule_name = lexer.read_ident().map_err(|e| describe(path, lexer, e))?.to_owned();

    let mut inputs = read_paths(lexer, path)?;
    let explicit_deps = inputs.len();
    let mut implicit_deps = 0usize;
    if lexer.peek_token(Token::Pipe).map_err(|e| describe(path, lexer, e))? {
        let more = read_paths(lexer, path)?;
        implicit_deps = more.len();
        inputs.extend(more);
    }
    let mut order_only_deps = 0usize;
    if lexer.peek_token(Token::Pipe2).map_err(|e| describe(path, lexer, e))? {
        let more = read_paths(lexer, path)?;
        order_only_deps = more.len();
        inputs.extend(more);
    }
    let mut validations = Vec::new();
    if lexer.peek_token(Token::PipeAt).map_err(|e| describe(path, lexer, e))? {
        validations = read_paths(lexer, path)?;
    }
    expect_newline(lexer, path)?;

    let mut edge_bindings = crate::eval::LazyVars::new();
    while lexer.peek_token(Token::Indent).map_err(|e| describe(path, lexer, e))? {
        let key = lexer.read_ident().map_err(|e| describe(path, lexer, e))?.to_owned();
        lexer.skip_spaces();
        lexer.expect_byte(b'=').map_err(|e| describe(path, lexer, e))?;
        lexer.skip_spaces();
        let val = lexer
            .read_eval_string(StringMode::Value)
            .map_err(|e| describe(path, lexer, e))?
            .into_owned();
        expect_newline(lexer, path)?;
        edge_bindings.insert(key, val);
    }

    let rule = if rule_name == "phony" {
        Rc::new(Rule::new("phony".to_owned()))
    } else {
        env.lookup_rule(&rule_name)
            .ok_or_else(|| anyhow!("{}: unknown rule {:?}", path, rule_name))?
    };

    let pool_name = edge_bindings
        .get("pool")
        .map(|v| v.evaluate(&[env.as_ref()]))
        .or_else(|| rule.binding("pool").map(|v| v.evaluate(&[env.as_ref()])))
        .unwrap_or_default();
    let pool = state
        .lookup_pool(&pool_name)
        .ok_or_else(|| anyhow!("{}: unknown pool {:?}", path, pool_name))?;

    let edge_env = Rc::new({
        let e = BindingEnv::new(Some(env.clone()));
        for (k, v) in edge_bindings {
            e.add_binding(k, v);
        }
        e
    });

    let mut output_ids = Vec::with_capacity(outputs.len());
    for p in &outputs {
        let text = p.clone().into_owned().evaluate(&[edge_env.as_ref()]);
        let (canon, bits) = canon_path(&text)?;
        if canon.is_empty() {
            bail!("{}: build output canonicalizes to empty path", path);
        }
        output_ids.push(state.get_node(&canon, bits));
    }
    let mut input_ids = Vec::with_capacity(inputs.len());
    for p in &inputs {
        let text = p.clone().into_owned().evaluate(&[edge_env.as_ref()]);
        let (canon, bits) = canon_path(&text)?;
        input_ids.push(state.get_node(&canon, bits));
    }
    let mut validation_ids = Vec::with_capacity(validations.len());
    for p in &validations {
        let text = p.clone().into_owned().evaluate(&[edge_env.as_ref()]);
        let (canon, bits) = canon_path(&text)?;
        validation_ids.push(state.get_node(&canon, bits));
    }

    // Phony self-reference tolerance (CMake 2.8/3.0 compatibility): an
    // output that also names itself as one of its own inputs is dropped
    // from the input list rather than rejected, unless strict mode is set.
    if rule.name == "phony" {
        let before = input_ids.len();
        input_ids.retain(|id| !output_ids.contains(id));
        let removed = before - input_ids.len();
        if removed > 0 && strict.phonycycle_err {
            bail!("{}: phony edge output depends on itself", path);
        }
        implicit_deps = implicit_deps.saturating_sub(removed.min(implicit_deps));
    }

    let restat = edge_env
        .get_var("restat")
        .map(|v| !v.is_empty())
        .unwrap_or(false)
        || rule
            .binding("restat")
            .map(|v| !v.evaluate(&[env.as_ref()]).is_empty())
            .unwrap_or(false);

    let dyndep = match edge_env.get_var("dyndep").map(|c| c.into_owned()) {
        Some(text) => {
            let (canon, _) = canon_path(&text)?;
            let id = state
                .lookup_node(&canon)
                .ok_or_else(|| anyhow!("{}: dyndep {:?} is not a declared input", path, canon))?;
            if !input_ids.contains(&id) {
                bail!("{}: dyndep {:?} must be listed as an input", path, canon);
            }
            Some(id)
        }
        None => None,
    };

    // Duplicate-output handling: if every output of this edge is already
    // produced by an earlier edge, drop the edge entirely; if only some
    // outputs collide, drop those outputs (and implicit-out count) from
    // this edge, warning (or erroring in strict mode).
    let mut kept_outputs = Vec::with_capacity(output_ids.len());
    let mut kept_implicit_outs = 0usize;
    let total_outputs = output_ids.len();
    for (i, &id) in output_ids.iter().enumerate() {
        let is_implicit = i >= total_outputs - outputs_implicit_n;
        if state.nodes.get(id).in_edge.is_some() {
            if strict.dupbuild_err {
                bail!(
                    "{}: output {:?} of multiple build statements",
                    path,
                    state.nodes.get(id).path
                );
            }
            eprintln!(
                "warning: {}: multiple rules generate {} (ignoring later one)",
                path,
                state.nodes.get(id).path
            );
            continue;
        }
        kept_outputs.push(id);
        if is_implicit {
            kept_implicit_outs += 1;
        }
    }
    if kept_outputs.is_empty() {
        return Ok(());
    }

    let edge = Edge {
        rule,
        pool,
        env: edge_env,
        inputs: input_ids,
        explicit_deps,
        implicit_deps,
        order_only_deps,
        outputs: kept_outputs,
        implicit_outs: kept_implicit_outs,
        validations: validation_ids,
        dyndep,
        restat,
        visit: VisitState::NotVisited,
        outputs_ready: false,
        deps_loaded: false,
        deps_missing: false,
        want: Want::None,
    };

    let edge_id = state.edges.push(edge);
    let edge_ref = state.edges.get(edge_id);
    let out_ids = edge_ref.outputs.clone();
    let in_ids = edge_ref.inputs.clone();
    let val_ids = edge_ref.validations.clone();
    for id in out_ids {
        state.nodes.get_mut(id).in_edge = Some(edge_id);
    }
    for id in in_ids {
        state.add_out(id, edge_id);
    }
    for id in val_ids {
        state.add_validation_out(id, edge_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::fake::FakeDisk;
    use crate::graph::EdgeId;

    fn parse(text: &str) -> Result<State> {
        let disk = FakeDisk::new();
        disk.set_contents("build.ninja", text.as_bytes());
        let mut state = State::new();
        parse_manifest(&mut state, &disk, "build.ninja", StrictMode::default())?;
        Ok(state)
    }

    #[test]
    fn simple_build_edge() {
        let state = parse("rule cc\n  command = cc -c $in -o $out\n\nbuild out.o: cc in.c\n").unwrap();
        assert_eq!(state.edges.len(), 1);
        assert_eq!(state.command_for(EdgeId(0)), "cc -c in.c -o out.o");
    }

    #[test]
    fn unknown_rule_is_an_error() {
        let err = parse("build out.o: missing in.c\n").unwrap_err();
        assert!(err.to_string().contains("unknown rule"));
    }

    #[test]
    fn rule_without_command_is_an_error() {
        let err = parse("rule cc\n  description = noop\n").unwrap_err();
        assert!(err.to_string().contains("no 'command'"));
    }

    #[test]
    fn pool_depth_must_be_non_negative() {
        let err = parse("pool link_pool\n  depth = -1\n").unwrap_err();
        assert!(err.to_string().contains("negative"));
    }

    #[test]
    fn phony_self_reference_is_dropped() {
        let state = parse("build out.o: phony out.o other.o\n").unwrap();
        let edge = state.edges.get(EdgeId(0));
        assert_eq!(edge.inputs.len(), 1);
    }

    #[test]
    fn duplicate_output_drops_later_edge() {
        let state = parse(
            "rule cc\n  command = cc $in -o $out\nbuild out.o: cc a.c\nbuild out.o: cc b.c\n",
        )
        .unwrap();
        // Later edge's only output collided, so it's dropped entirely, but
        // both build statements still parsed without error.
        assert_eq!(state.edges.len(), 1);
        let out_id = state.lookup_node("out.o").unwrap();
        assert_eq!(state.nodes.get(out_id).in_edge, Some(EdgeId(0)));
    }

    #[test]
    fn include_shares_scope_subninja_is_isolated() {
        let disk = FakeDisk::new();
        disk.set_contents("inc.ninja", b"shared = 1\n");
        disk.set_contents("sub.ninja", b"rule r\n  command = x\nbuild fromsub: r\n");
        disk.set_contents(
            "build.ninja",
            b"include inc.ninja\nsubninja sub.ninja\nbuild out: phony\n",
        );
        let mut state = State::new();
        parse_manifest(&mut state, &disk, "build.ninja", StrictMode::default()).unwrap();
        assert_eq!(state.edges.len(), 2);
        assert!(state.root_env.get_var("shared").is_some());
    }

    #[test]
    fn multi_output_with_implicit_outs() {
        let state = parse("rule cc\n  command = cc $in -o $out\nbuild out.o | out.d: cc in.c\n").unwrap();
        let edge = state.edges.get(EdgeId(0));
        assert_eq!(edge.outputs.len(), 2);
        assert_eq!(edge.implicit_outs, 1);
        assert_eq!(edge.explicit_outputs().len(), 1);
    }

    #[test]
    fn order_only_and_validation_inputs_are_tracked() {
        let state = parse(
            "rule cc\n  command = cc $in -o $out\nbuild out.o: cc in.c || gen.h |@ lint.txt\n",
        )
        .unwrap();
        let edge = state.edges.get(EdgeId(0));
        assert_eq!(edge.order_only_inputs().len(), 1);
        assert_eq!(edge.validations.len(), 1);
    }
}
