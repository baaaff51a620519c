//! Parses MSVC `/showIncludes` output (§4.G): separates the compiler's
//! include-path chatter from the rest of stderr/stdout so the includes can
//! feed the deps log while the remaining lines are re-emitted to the user.
//!
//! Unlike the manifest lexer or the depfile scanner, this is plain line
//! processing — MSVC's output has no real grammar, just a recognizable
//! prefix line the compiler prints once per header it opens.

pub const DEFAULT_MSVC_DEPS_PREFIX: &str = "Note: including file: ";

pub struct CLParseResult {
    /// Normalized include paths, deduplicated, excluding system headers.
    pub includes: Vec<String>,
    /// Everything else, to be re-emitted to the user verbatim (minus the
    /// input-filename echo ninja drops).
    pub output: String,
}

fn is_system_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.contains("program files") || lower.contains("microsoft visual studio")
}

/// Normalize an include path the way §4.F/§3 Canonicalization do: backslash
/// to forward slash, then resolve `.`/`..` and collapse repeats.
fn normalize(path: &str) -> String {
    let slashed = path.replace('\\', "/");
    crate::canon::canon_path(&slashed)
        .map(|(p, _)| p)
        .unwrap_or(slashed)
}

fn is_source_echo(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.contains(' ') || trimmed.contains(':') {
        return false;
    }
    let lower = trimmed.to_ascii_lowercase();
    [".c", ".cc", ".cxx", ".cpp"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

/// Parse the full output of one compiler invocation, splitting include
/// chatter (with the given `deps_prefix`, defaulting to
/// `DEFAULT_MSVC_DEPS_PREFIX`) away from everything else.
pub fn parse(text: &str, deps_prefix: &str) -> CLParseResult {
    let mut includes = Vec::new();
    let mut output = String::new();
    let mut seen_include = false;

    for raw_line in text.split_inclusive('\n') {
        let line = raw_line.trim_end_matches(['\r', '\n']);
        if let Some(rest) = line.strip_prefix(deps_prefix) {
            let path = rest.trim_start();
            seen_include = true;
            if !is_system_path(path) {
                let norm = normalize(path);
                if !includes.contains(&norm) {
                    includes.push(norm);
                }
            }
            continue;
        }
        if !seen_include && is_source_echo(line) {
            continue;
        }
        output.push_str(line);
        output.push('\n');
    }
    CLParseResult { includes, output }
}
