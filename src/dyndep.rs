//! The dyndep loader (§4.K): a separate, much smaller grammar parsed with
//! the same token-based `Lexer` as the manifest itself, used to discover
//! extra implicit inputs/outputs for an edge only after some earlier part
//! of the build has run (code generators that can't know their own outputs
//! until they've executed). Grounded in the teacher's `load.rs` for the
//! "reuse the lexer, add a narrower grammar on top" approach, adapted to
//! this port's dyndep-specific statement shape.

use crate::canon::canon_path;
use crate::eval::{EvalPart, EvalString};
use crate::graph::{EdgeId, NodeId, State};
use crate::lexer::{nul_terminate, Lexer, StringMode, Token};
use anyhow::{anyhow, bail, Result};
use rustc_hash::FxHashSet;

pub struct DyndepBuild {
    pub primary_output: String,
    pub implicit_outputs: Vec<String>,
    pub implicit_inputs: Vec<String>,
    pub restat: bool,
}

pub struct DyndepFile {
    pub builds: Vec<DyndepBuild>,
}

fn describe(filename: &str, lexer: &Lexer<'_>, err: crate::lexer::ParseError) -> anyhow::Error {
    anyhow!(lexer.describe_error(filename, &err))
}

fn expect_newline(lexer: &mut Lexer<'_>, path: &str) -> Result<()> {
    let tok = lexer.read_token().map_err(|e| describe(path, lexer, e))?;
    if tok != Token::Newline && tok != Token::Teof {
        bail!("{}: expected newline, got {:?}", path, tok);
    }
    Ok(())
}

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

fn flatten(parts: Vec<EvalString<&str>>) -> Result<Vec<String>> {
    parts
        .into_iter()
        .map(|p| match p.parts() {
            [EvalPart::Literal(s)] => Ok((*s).to_owned()),
            _ => bail!("dyndep paths may not contain variable references"),
        })
        .collect()
}

/// `version` must be `1` or `1.0`, with an optional `-extra` suffix, e.g.
/// `1.0-mytool`.
fn check_version(v: &str) -> Result<()> {
    let base = v.split('-').next().unwrap_or(v);
    if base == "1" || base == "1.0" {
        return Ok(());
    }
    bail!("unsupported ninja_dyndep_version {:?}", v);
}

/// Parse the dyndep file already read into `contents` (not yet NUL-terminated).
pub fn parse(path: &str, mut contents: Vec<u8>) -> Result<DyndepFile> {
    nul_terminate(&mut contents);
    let mut lexer = Lexer::new(&contents);

    let tok = lexer.read_token().map_err(|e| describe(path, &lexer, e))?;
    if tok != Token::Ident {
        bail!("{}: expected ninja_dyndep_version, got {:?}", path, tok);
    }
    lexer.unread_token();
    let name = lexer.read_ident().map_err(|e| describe(path, &lexer, e))?;
    if name != "ninja_dyndep_version" {
        bail!("{}: expected ninja_dyndep_version, got {:?}", path, name);
    }
    lexer.skip_spaces();
    lexer.expect_byte(b'=').map_err(|e| describe(path, &lexer, e))?;
    lexer.skip_spaces();
    let version = lexer
        .read_eval_string(StringMode::Value)
        .map_err(|e| describe(path, &lexer, e))?
        .into_owned()
        .evaluate(&[]);
    check_version(version.trim())?;
    expect_newline(&mut lexer, path)?;

    let mut builds = Vec::new();
    loop {
        let tok = lexer.read_token().map_err(|e| describe(path, &lexer, e))?;
        match tok {
            Token::Teof => break,
            Token::Newline => continue,
            Token::Build => builds.push(parse_build_dyndep(&mut lexer, path)?),
            other => bail!("{}: unexpected token {:?} in dyndep file", path, other),
        }
    }
    Ok(DyndepFile { builds })
}

fn parse_build_dyndep(lexer: &mut Lexer<'_>, path: &str) -> Result<DyndepBuild> {
    let outputs = flatten(read_paths(lexer, path)?)?;
    if outputs.is_empty() {
        bail!("{}: expected output path after 'build'", path);
    }
    if outputs.len() > 1 {
        bail!("{}: dyndep build statements support only one explicit output", path);
    }
    let mut implicit_outputs = Vec::new();
    if lexer.peek_token(Token::Pipe).map_err(|e| describe(path, lexer, e))? {
        implicit_outputs = flatten(read_paths(lexer, path)?)?;
    }
    lexer.expect_byte(b':').map_err(|e| describe(path, lexer, e))?;
    lexer.skip_spaces();
    let rule = lexer.read_ident().map_err(|e| describe(path, lexer, e))?;
    if rule != "dyndep" {
        bail!("{}: dyndep build statements must use the 'dyndep' rule, got {:?}", path, rule);
    }

    let mut implicit_inputs = Vec::new();
    if lexer.peek_token(Token::Pipe).map_err(|e| describe(path, lexer, e))? {
        implicit_inputs = flatten(read_paths(lexer, path)?)?;
    }
    if lexer.peek_token(Token::Pipe2).map_err(|e| describe(path, lexer, e))? {
        bail!("{}: order-only inputs are not supported in dyndep files", path);
    }
    expect_newline(lexer, path)?;

    let mut restat = false;
    if lexer.peek_token(Token::Indent).map_err(|e| describe(path, lexer, e))? {
        let key = lexer.read_ident().map_err(|e| describe(path, lexer, e))?.to_owned();
        if key != "restat" {
            bail!("{}: unexpected dyndep binding {:?}", path, key);
        }
        lexer.skip_spaces();
        lexer.expect_byte(b'=').map_err(|e| describe(path, lexer, e))?;
        lexer.skip_spaces();
        let val = lexer
            .read_eval_string(StringMode::Value)
            .map_err(|e| describe(path, lexer, e))?
            .into_owned()
            .evaluate(&[]);
        expect_newline(lexer, path)?;
        restat = !val.is_empty();
    }

    Ok(DyndepBuild {
        primary_output: outputs.into_iter().next().unwrap(),
        implicit_outputs,
        implicit_inputs,
        restat,
    })
}

/// Apply a parsed dyndep file's statements to the graph: each statement
/// must name an existing output of some edge, and adds that statement's
/// implicit inputs/outputs to that edge (§4.K). `filename` is used only for
/// error messages.
pub fn apply(state: &mut State, filename: &str, file: &DyndepFile) -> Result<()> {
    let mut seen_edges: FxHashSet<EdgeId> = FxHashSet::default();

    for build in &file.builds {
        let (canon, _) = canon_path(&build.primary_output)?;
        let node = state
            .lookup_node(&canon)
            .ok_or_else(|| anyhow!("{}: {:?} is not an output in the build graph", filename, canon))?;
        let edge_id = state
            .nodes
            .get(node)
            .in_edge
            .ok_or_else(|| anyhow!("{}: {:?} is not built by any edge", filename, canon))?;
        if !seen_edges.insert(edge_id) {
            bail!(
                "{}: multiple dyndep statements for the same edge (via {:?})",
                filename,
                canon
            );
        }

        let mut new_outputs = Vec::with_capacity(build.implicit_outputs.len());
        for p in &build.implicit_outputs {
            let (c, bits) = canon_path(p)?;
            let id = state.get_node(&c, bits);
            if let Some(existing) = state.nodes.get(id).in_edge {
                if existing != edge_id {
                    bail!("{}: {:?} already has a producing edge", filename, c);
                }
            }
            new_outputs.push(id);
        }
        let mut new_inputs = Vec::with_capacity(build.implicit_inputs.len());
        for p in &build.implicit_inputs {
            let (c, bits) = canon_path(p)?;
            new_inputs.push(state.get_node(&c, bits));
        }

        {
            let edge = state.edges.get_mut(edge_id);
            for &id in &new_outputs {
                edge.outputs.push(id);
                edge.implicit_outs += 1;
            }
            let insert_at = edge.explicit_deps + edge.implicit_deps;
            for (i, &id) in new_inputs.iter().enumerate() {
                edge.inputs.insert(insert_at + i, id);
            }
            edge.implicit_deps += new_inputs.len();
            if build.restat {
                edge.restat = true;
            }
        }
        for &id in &new_outputs {
            state.nodes.get_mut(id).in_edge = Some(edge_id);
        }
        for &id in &new_inputs {
            state.add_out(id, edge_id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::fake::FakeDisk;
    use crate::disk::DiskInterface;
    use crate::parse::{parse_manifest, StrictMode};

    fn setup(manifest: &str) -> State {
        let disk = FakeDisk::new();
        disk.set_contents("build.ninja", manifest.as_bytes());
        let mut state = State::new();
        parse_manifest(&mut state, &disk, "build.ninja", StrictMode::default()).unwrap();
        state
    }

    #[test]
    fn version_must_be_supported() {
        let err = parse("dd.dyndep", b"ninja_dyndep_version = 2\n".to_vec()).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[test]
    fn version_with_extra_suffix_is_accepted() {
        let file = parse(
            "dd.dyndep",
            b"ninja_dyndep_version = 1.0-mytool\nbuild out.o: dyndep\n".to_vec(),
        )
        .unwrap();
        assert_eq!(file.builds.len(), 1);
    }

    #[test]
    fn applies_implicit_inputs_and_outputs() {
        let mut state = setup("rule cc\n  command = cc $in -o $out\nbuild out.o: cc in.c\n");
        let file = parse(
            "dd.dyndep",
            b"ninja_dyndep_version = 1\nbuild out.o | out.extra: dyndep | gen.h\n".to_vec(),
        )
        .unwrap();
        apply(&mut state, "dd.dyndep", &file).unwrap();

        let out = state.lookup_node("out.o").unwrap();
        let edge_id = state.nodes.get(out).in_edge.unwrap();
        let edge = state.edges.get(edge_id);
        assert_eq!(edge.implicit_outs, 1);
        assert!(edge.explicit_outputs().iter().any(|&id| id == out));
        let gen_h = state.lookup_node("gen.h").unwrap();
        assert!(edge.implicit_inputs().contains(&gen_h));
    }

    #[test]
    fn restat_binding_flips_edge_restat() {
        let mut state = setup("rule cc\n  command = cc $in -o $out\nbuild out.o: cc in.c\n");
        let file = parse(
            "dd.dyndep",
            b"ninja_dyndep_version = 1\nbuild out.o: dyndep\n  restat = 1\n".to_vec(),
        )
        .unwrap();
        apply(&mut state, "dd.dyndep", &file).unwrap();
        let out = state.lookup_node("out.o").unwrap();
        let edge_id = state.nodes.get(out).in_edge.unwrap();
        assert!(state.edges.get(edge_id).restat);
    }

    #[test]
    fn unknown_output_is_an_error() {
        let mut state = setup("rule cc\n  command = cc $in -o $out\nbuild out.o: cc in.c\n");
        let file = parse(
            "dd.dyndep",
            b"ninja_dyndep_version = 1\nbuild nope.o: dyndep\n".to_vec(),
        )
        .unwrap();
        let err = apply(&mut state, "dd.dyndep", &file).unwrap_err();
        assert!(err.to_string().contains("not an output"));
    }

    #[test]
    fn duplicate_statement_for_same_edge_is_an_error() {
        let mut state = setup(
            "rule cc\n  command = cc $in -o $out\nbuild out.o | out.d: cc in.c\n",
        );
        let file = parse(
            "dd.dyndep",
            b"ninja_dyndep_version = 1\nbuild out.o: dyndep\nbuild out.d: dyndep\n".to_vec(),
        )
        .unwrap();
        let err = apply(&mut state, "dd.dyndep", &file).unwrap_err();
        assert!(err.to_string().contains("multiple dyndep statements"));
    }

    #[test]
    fn order_only_inputs_are_rejected() {
        let err = parse(
            "dd.dyndep",
            b"ninja_dyndep_version = 1\nbuild out.o: dyndep || extra.h\n".to_vec(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("order-only"));
    }
}
