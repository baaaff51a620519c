//! Tokenizer for the `.ninja` manifest language (§4.A).
//!
//! The manifest grammar is line-oriented: a statement starts a new keyword
//! at column 0, and indented lines that follow belong to it. The lexer's
//! job is mostly to tell the parser which of those two situations it's in,
//! plus to recognize the small set of punctuation tokens (`:`, `|`, `||`,
//! `|@`, `=`) that appear in a `build` line. Reading the actual path/value
//! text (with its `$`-escapes) is `read_eval_string`'s job, not
//! `read_token`'s, mirroring the way the source material keeps the
//! character-level scanner separate from path/value assembly.

use crate::eval::{EvalPart, EvalString};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Build,
    Rule,
    Pool,
    Default,
    Include,
    Subninja,
    Ident,
    Equals,
    Colon,
    Pipe,
    Pipe2,
    PipeAt,
    Indent,
    Newline,
    Teof,
    Error,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug)]
pub struct ParseError {
    pub msg: String,
    ofs: usize,
}
pub type ParseResult<T> = Result<T, ParseError>;

/// Reading mode for `read_eval_string`: in path mode, whitespace and the
/// build-line delimiters terminate the string; in value mode, only a
/// newline does (so `description = a : b | c` is one literal string).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringMode {
    Path,
    Value,
}

pub struct Lexer<'a> {
    buf: &'a [u8],
    ofs: usize,
    pub line: usize,
    /// True if the next `read_token` call is looking at the first
    /// non-whitespace of a logical line (so leading whitespace should be
    /// reported as `Indent` rather than silently skipped).
    at_bol: bool,
    last_token_ofs: usize,
    last_token_bol: bool,
}

impl<'a> Lexer<'a> {
    /// `buf` must already end with a NUL sentinel byte; callers typically
    /// arrange this once when loading the file (see `ManifestParser::new`).
    pub fn new(buf: &'a [u8]) -> Self {
        assert_eq!(buf.last(), Some(&0), "Lexer requires a NUL-terminated buffer");
        Lexer {
            buf,
            ofs: 0,
            line: 1,
            at_bol: true,
            last_token_ofs: 0,
            last_token_bol: true,
        }
    }

    fn peek(&self) -> u8 {
        self.buf[self.ofs]
    }

    fn advance(&mut self) {
        if self.buf[self.ofs] == b'\n' {
            self.line += 1;
        }
        self.ofs += 1;
    }

    pub fn error<T>(&self, msg: impl Into<String>) -> ParseResult<T> {
        Err(ParseError {
            msg: msg.into(),
            ofs: self.ofs,
        })
    }

    /// Format a parse error the way the source material does: a
    /// `file:line: message` header followed by the offending source line
    /// and a caret pointing at the column.
    pub fn describe_error(&self, filename: &str, err: &ParseError) -> String {
        let mut line_start = 0;
        let mut line_no = 1;
        for (i, &b) in self.buf.iter().enumerate() {
            if i >= err.ofs {
                break;
            }
            if b == b'\n' {
                line_start = i + 1;
                line_no += 1;
            }
        }
        let line_end = self.buf[line_start..]
            .iter()
            .position(|&b| b == b'\n' || b == 0)
            .map(|p| line_start + p)
            .unwrap_or(self.buf.len());
        let context = String::from_utf8_lossy(&self.buf[line_start..line_end]);
        let col = err.ofs - line_start;
        format!(
            "{}:{}: {}\n{}\n{}^\n",
            filename,
            line_no,
            err.msg,
            context,
            " ".repeat(col)
        )
    }

    /// Read the next token, consuming it.
    pub fn read_token(&mut self) -> ParseResult<Token> {
        self.last_token_ofs = self.ofs;
        self.last_token_bol = self.at_bol;

        if self.at_bol {
            let mut saw_space = false;
            while self.peek() == b' ' || self.peek() == b'\t' {
                self.advance();
                saw_space = true;
            }
            if saw_space && self.peek() != b'\n' && self.peek() != 0 {
                self.at_bol = false;
                return Ok(Token::Indent);
            }
            self.at_bol = false;
        } else {
            while self.peek() == b' ' {
                self.advance();
            }
        }

        match self.peek() {
            0 => Ok(Token::Teof),
            b'\n' => {
                self.advance();
                self.at_bol = true;
                Ok(Token::Newline)
            }
            b'#' => {
                while self.peek() != b'\n' && self.peek() != 0 {
                    self.advance();
                }
                self.read_token()
            }
            b'=' => {
                self.advance();
                Ok(Token::Equals)
            }
            b':' => {
                self.advance();
                Ok(Token::Colon)
            }
            b'|' => {
                self.advance();
                match self.peek() {
                    b'|' => {
                        self.advance();
                        Ok(Token::Pipe2)
                    }
                    b'@' => {
                        self.advance();
                        Ok(Token::PipeAt)
                    }
                    _ => Ok(Token::Pipe),
                }
            }
            c if is_ident_byte(c) => {
                let start = self.ofs;
                while is_ident_byte(self.peek()) {
                    self.advance();
                }
                let word = std::str::from_utf8(&self.buf[start..self.ofs]).unwrap();
                Ok(match word {
                    "build" => Token::Build,
                    "rule" => Token::Rule,
                    "pool" => Token::Pool,
                    "default" => Token::Default,
                    "include" => Token::Include,
                    "subninja" => Token::Subninja,
                    _ => Token::Ident,
                })
            }
            _ => self.error(format!("unexpected character {:?}", self.peek() as char)),
        }
    }

    /// Consume the next token iff it matches `tok`; otherwise leaves the
    /// lexer position unchanged.
    pub fn peek_token(&mut self, tok: Token) -> ParseResult<bool> {
        let save_ofs = self.ofs;
        let save_line = self.line;
        let save_bol = self.at_bol;
        let t = self.read_token()?;
        if t == tok {
            return Ok(true);
        }
        self.ofs = save_ofs;
        self.line = save_line;
        self.at_bol = save_bol;
        Ok(false)
    }

    /// Undo the most recent `read_token` call. Only one level of undo is
    /// supported, matching the grammar's single-token lookahead needs.
    pub fn unread_token(&mut self) {
        self.ofs = self.last_token_ofs;
        self.at_bol = self.last_token_bol;
    }

    /// Read a bare identifier (rule/pool name, binding key): letters,
    /// digits, `_`, `-`, `.`.
    pub fn read_ident(&mut self) -> ParseResult<&'a str> {
        while self.peek() == b' ' {
            self.advance();
        }
        let start = self.ofs;
        while is_ident_byte(self.peek()) {
            self.advance();
        }
        if self.ofs == start {
            return self.error("expected identifier");
        }
        Ok(std::str::from_utf8(&self.buf[start..self.ofs]).unwrap())
    }

    pub fn skip_spaces(&mut self) {
        while self.peek() == b' ' {
            self.advance();
        }
    }

    pub fn expect_byte(&mut self, b: u8) -> ParseResult<()> {
        if self.peek() != b {
            return self.error(format!(
                "expected {:?}, got {:?}",
                b as char, self.peek() as char
            ));
        }
        self.advance();
        Ok(())
    }

    /// Read an `EvalString` up to (not including) the mode's terminators,
    /// interpreting `$`-escapes per §4.A: `$$` -> `$`, `$ ` -> space,
    /// `$:` -> `:`, `${ident}`/`$ident` -> a variable reference, and a
    /// trailing `$` before a newline is a line continuation that swallows
    /// the following line's leading whitespace.
    pub fn read_eval_string(&mut self, mode: StringMode) -> ParseResult<EvalString<&'a str>> {
        let mut parts = Vec::new();
        let mut literal_start = self.ofs;
        loop {
            let c = self.peek();
            let stop = match mode {
                StringMode::Path => {
                    c == 0
                        || c == b' '
                        || c == b':'
                        || c == b'|'
                        || c == b'\n'
                }
                StringMode::Value => c == 0 || c == b'\n',
            };
            if stop {
                break;
            }
            if c == b'$' {
                if self.ofs > literal_start {
                    parts.push(EvalPart::Literal(
                        std::str::from_utf8(&self.buf[literal_start..self.ofs]).unwrap(),
                    ));
                }
                self.advance(); // consume '$'
                let part = self.read_dollar_escape()?;
                if let Some(p) = part {
                    parts.push(p);
                }
                literal_start = self.ofs;
                continue;
            }
            self.advance();
        }
        if self.ofs > literal_start {
            parts.push(EvalPart::Literal(
                std::str::from_utf8(&self.buf[literal_start..self.ofs]).unwrap(),
            ));
        }
        Ok(EvalString::new(parts))
    }

    fn read_dollar_escape(&mut self) -> ParseResult<Option<EvalPart<&'a str>>> {
        match self.peek() {
            b'\n' => {
                self.advance();
                self.skip_spaces();
                Ok(None)
            }
            b'$' => {
                self.advance();
                Ok(Some(EvalPart::Literal("$")))
            }
            b' ' => {
                self.advance();
                Ok(Some(EvalPart::Literal(" ")))
            }
            b':' => {
                self.advance();
                Ok(Some(EvalPart::Literal(":")))
            }
            b'{' => {
                self.advance();
                let start = self.ofs;
                while self.peek() != b'}' {
                    if self.peek() == 0 || self.peek() == b'\n' {
                        return self.error("unterminated ${...}");
                    }
                    self.advance();
                }
                let name = std::str::from_utf8(&self.buf[start..self.ofs]).unwrap();
                self.advance(); // consume '}'
                Ok(Some(EvalPart::VarRef(name)))
            }
            c if is_ident_byte(c) => {
                let start = self.ofs;
                while is_ident_byte(self.peek()) {
                    self.advance();
                }
                Ok(Some(EvalPart::VarRef(
                    std::str::from_utf8(&self.buf[start..self.ofs]).unwrap(),
                )))
            }
            c => self.error(format!("unexpected character after $: {:?}", c as char)),
        }
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.'
}

/// Append the trailing NUL the lexer requires. Centralized here so every
/// caller (file loads, tests, dyndep parsing) gets the same sentinel.
pub fn nul_terminate(bytes: &mut Vec<u8>) {
    bytes.push(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_keywords_and_punctuation() {
        let mut buf = b"build out: cat in1 | in2 || in3\n".to_vec();
        nul_terminate(&mut buf);
        let mut lex = Lexer::new(&buf);
        assert_eq!(lex.read_token().unwrap(), Token::Build);
        let s = lex.read_eval_string(StringMode::Path).unwrap();
        assert_eq!(s.parts(), [EvalPart::Literal("out")]);
        assert_eq!(lex.read_token().unwrap(), Token::Colon);
        assert_eq!(lex.read_ident().unwrap(), "cat");
        let s = lex.read_eval_string(StringMode::Path).unwrap();
        assert_eq!(s.parts(), [EvalPart::Literal("in1")]);
        assert_eq!(lex.read_token().unwrap(), Token::Pipe);
        let s = lex.read_eval_string(StringMode::Path).unwrap();
        assert_eq!(s.parts(), [EvalPart::Literal("in2")]);
        assert_eq!(lex.read_token().unwrap(), Token::Pipe2);
        let s = lex.read_eval_string(StringMode::Path).unwrap();
        assert_eq!(s.parts(), [EvalPart::Literal("in3")]);
        assert_eq!(lex.read_token().unwrap(), Token::Newline);
        assert_eq!(lex.read_token().unwrap(), Token::Teof);
    }

    #[test]
    fn indent_reported_only_at_bol() {
        let mut buf = b"rule cat\n  command = cat $in > $out\n".to_vec();
        nul_terminate(&mut buf);
        let mut lex = Lexer::new(&buf);
        assert_eq!(lex.read_token().unwrap(), Token::Rule);
        assert_eq!(lex.read_ident().unwrap(), "cat");
        assert_eq!(lex.read_token().unwrap(), Token::Newline);
        assert_eq!(lex.read_token().unwrap(), Token::Indent);
        assert_eq!(lex.read_ident().unwrap(), "command");
        assert_eq!(lex.read_token().unwrap(), Token::Equals);
        let val = lex.read_eval_string(StringMode::Value).unwrap();
        assert_eq!(
            val.parts(),
            [
                EvalPart::Literal("cat "),
                EvalPart::VarRef("in"),
                EvalPart::Literal(" > "),
                EvalPart::VarRef("out"),
            ]
        );
    }

    #[test]
    fn dollar_escapes() {
        let mut buf = b"a$$b$ c$:d\n".to_vec();
        nul_terminate(&mut buf);
        let mut lex = Lexer::new(&buf);
        let s = lex.read_eval_string(StringMode::Value).unwrap();
        let joined: String = s
            .parts()
            .iter()
            .map(|p| match p {
                EvalPart::Literal(s) => *s,
                EvalPart::VarRef(s) => *s,
            })
            .collect();
        assert_eq!(joined, "a$b c:d"); // '$ ' and '$:' yield literal space/colon
    }

    #[test]
    fn line_continuation_swallows_leading_whitespace() {
        let mut buf = b"a$\n   b\n".to_vec();
        nul_terminate(&mut buf);
        let mut lex = Lexer::new(&buf);
        let s = lex.read_eval_string(StringMode::Value).unwrap();
        let joined: String = s
            .parts()
            .iter()
            .map(|p| match p {
                EvalPart::Literal(s) => *s,
                EvalPart::VarRef(s) => *s,
            })
            .collect();
        assert_eq!(joined, "ab");
    }

    #[test]
    fn peek_token_only_consumes_on_match() {
        let mut buf = b"||\n".to_vec();
        nul_terminate(&mut buf);
        let mut lex = Lexer::new(&buf);
        assert!(!lex.peek_token(Token::Pipe).unwrap());
        assert!(lex.peek_token(Token::Pipe2).unwrap());
        assert_eq!(lex.read_token().unwrap(), Token::Newline);
    }
}
