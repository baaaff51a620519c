//! Parsing of the GNU Make subset emitted as `.d` files by GCC/Clang
//! (§4.F). Grounded in the teacher's character-scanner style (`scanner.rs`,
//! itself carried over almost verbatim from the teacher's own file), but
//! implements the fuller escaping rules and multi-rule unification the
//! original teacher parser left out.

use crate::scanner::{ParseResult, Scanner};
use rustc_hash::FxHashSet;

/// The unified result of parsing a whole depfile: every output mentioned,
/// and the full set of inputs collected across all of its rules.
#[derive(Debug, Default)]
pub struct Depfile {
    pub outputs: Vec<String>,
    pub ins: Vec<String>,
}

/// Skip spaces and backslash-escaped newlines between paths.
fn skip_spaces(scanner: &mut Scanner) -> ParseResult<()> {
    loop {
        match scanner.peek() {
            ' ' => scanner.next(),
            '\\' => {
                scanner.next();
                if scanner.peek() == '\n' {
                    scanner.next();
                } else {
                    scanner.back();
                    break;
                }
            }
            _ => break,
        }
    }
    Ok(())
}

/// Read and unescape one path, per the escaping table in §4.F. Returns
/// `None` at a bare separator (`:`, newline, NUL) with nothing read.
fn read_path(scanner: &mut Scanner) -> ParseResult<Option<String>> {
    skip_spaces(scanner)?;
    let mut out = String::new();
    let mut any = false;
    loop {
        let c = scanner.peek();
        match c {
            '\0' | ':' | '\n' => break,
            ' ' => break,
            '\\' => {
                scanner.next();
                any = true;
                match scanner.peek() {
                    '#' => {
                        scanner.next();
                        out.push('#');
                    }
                    ':' => {
                        scanner.next();
                        out.push(':');
                    }
                    '\n' => {
                        scanner.next();
                        break;
                    }
                    '\\' => {
                        // Count the run of backslashes (we already consumed one).
                        let mut n = 1usize;
                        while scanner.peek() == '\\' {
                            scanner.next();
                            n += 1;
                        }
                        if scanner.peek() == ' ' {
                            scanner.next();
                            // odd run => n/2 backslashes + literal space (path continues)
                            // even run => n backslashes, space ends the path
                            if n % 2 == 1 {
                                out.push_str(&"\\".repeat(n / 2));
                                out.push(' ');
                            } else {
                                out.push_str(&"\\".repeat(n));
                                break;
                            }
                        } else {
                            out.push_str(&"\\".repeat(n));
                        }
                    }
                    _ => out.push('\\'),
                }
            }
            '$' => {
                scanner.next();
                any = true;
                if scanner.peek() == '$' {
                    scanner.next();
                    out.push('$');
                } else {
                    out.push('$');
                }
            }
            _ => {
                scanner.next();
                any = true;
                out.push(c);
            }
        }
    }
    if !any {
        return Ok(None);
    }
    Ok(Some(out))
}

/// Parse a whole `.d` file, which may contain multiple `target: deps` rules
/// (unified by output per §4.F).
pub fn parse(scanner: &mut Scanner) -> ParseResult<Depfile> {
    let mut depfile = Depfile::default();
    let mut outputs_seen: FxHashSet<String> = FxHashSet::default();
    let mut inputs_seen: FxHashSet<String> = FxHashSet::default();

    loop {
        scanner.skip_spaces();
        while scanner.skip('\n') {
            scanner.skip_spaces();
        }
        if scanner.peek() == '\0' {
            break;
        }

        let mut targets = Vec::new();
        loop {
            match read_path(scanner)? {
                Some(p) => targets.push(p),
                None => break,
            }
        }
        if targets.is_empty() {
            return scanner.parse_error("expected target path");
        }
        scanner.skip_spaces();
        if !scanner.skip(':') {
            return scanner.parse_error("expected ':' in depfile");
        }

        let mut ins = Vec::new();
        while let Some(p) = read_path(scanner)? {
            ins.push(p);
        }
        scanner.skip('\n');

        for t in &targets {
            if inputs_seen.contains(t) {
                return scanner.parse_error("inputs may not also have inputs");
            }
            if outputs_seen.insert(t.clone()) {
                depfile.outputs.push(t.clone());
            }
        }
        for i in ins {
            if outputs_seen.contains(&i) {
                // Already recorded as a target; still a legitimate dependency
                // edge, just don't duplicate it in `ins`.
            }
            if inputs_seen.insert(i.clone()) {
                depfile.ins.push(i);
            }
        }
    }

    if depfile.outputs.is_empty() {
        return scanner.parse_error("expected target path");
    }
    Ok(depfile)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_parse(text: &str) -> Depfile {
        let mut buf = text.as_bytes().to_vec();
        let mut scanner = Scanner::new(&mut buf);
        match parse(&mut scanner) {
            Ok(d) => d,
            Err(e) => panic!("{}", scanner.format_parse_error("test", e)),
        }
    }

    #[test]
    fn basic() {
        let d = must_parse("build/browse.o: src/browse.cc src/browse.h build/browse_py.h\n");
        assert_eq!(d.outputs, vec!["build/browse.o"]);
        assert_eq!(d.ins.len(), 3);
    }

    #[test]
    fn trailing_spaces() {
        let d = must_parse("build/browse.o: src/browse.cc   ");
        assert_eq!(d.outputs, vec!["build/browse.o"]);
        assert_eq!(d.ins, vec!["src/browse.cc"]);
    }

    #[test]
    fn line_continuation() {
        let d = must_parse("build/browse.o: src/browse.cc\\\n  build/browse_py.h\n");
        assert_eq!(d.ins.len(), 2);
    }

    #[test]
    fn no_trailing_newline() {
        let d = must_parse("build/browse.o: src/browse.cc");
        assert_eq!(d.ins, vec!["src/browse.cc"]);
    }

    #[test]
    fn escaped_hash_and_colon() {
        let d = must_parse("out.o: foo\\#bar.c C\\:baz.c\n");
        assert_eq!(d.ins, vec!["foo#bar.c", "C:baz.c"]);
    }

    #[test]
    fn escaped_space_in_path() {
        // a single backslash before a space means "literal space, path continues"
        let d = must_parse("out.o: My\\ Documents/foo.c\n");
        assert_eq!(d.ins, vec!["My Documents/foo.c"]);
    }

    #[test]
    fn dollar_dollar_is_literal_dollar() {
        let d = must_parse("out.o: weird$$name.c\n");
        assert_eq!(d.ins, vec!["weird$name.c"]);
    }

    #[test]
    fn multiple_rules_unify_by_output() {
        let d = must_parse("out.o: a.c\nout.o: b.c\n");
        assert_eq!(d.outputs, vec!["out.o"]);
        assert_eq!(d.ins, vec!["a.c", "b.c"]);
    }

    #[test]
    fn input_reused_as_output_is_an_error() {
        let mut buf = b"out.o: a.c\na.c: b.c\n".to_vec();
        let mut scanner = Scanner::new(&mut buf);
        let err = parse(&mut scanner).unwrap_err();
        let msg = scanner.format_parse_error("test", err);
        assert!(msg.contains("inputs may not also have inputs"));
    }
}
