//! Tokenizer producing logical lines from host method source.
//!
//! A logical line is one statement: bracket and backslash continuations are
//! joined, comments and blank lines disappear, and statements consisting only
//! of string literals (documentation blocks) are set aside.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Name,
    Number,
    Str,
    Op,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
}

impl Token {
    pub fn name(text: impl Into<String>) -> Self {
        Self {
            kind: TokenKind::Name,
            text: text.into(),
        }
    }

    pub fn op(text: impl Into<String>) -> Self {
        Self {
            kind: TokenKind::Op,
            text: text.into(),
        }
    }

    pub fn is_op(&self, text: &str) -> bool {
        self.kind == TokenKind::Op && self.text == text
    }

    pub fn is_name(&self, text: &str) -> bool {
        self.kind == TokenKind::Name && self.text == text
    }
}

/// One statement with its indentation and the physical line it starts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalLine {
    pub indent: usize,
    pub line: usize,
    pub tokens: Vec<Token>,
}

impl LogicalLine {
    pub fn contains_name(&self, name: &str) -> bool {
        self.tokens.iter().any(|t| t.is_name(name))
    }

    /// Whether the statement opens an indented block.
    pub fn is_block_header(&self) -> bool {
        self.tokens.last().is_some_and(|t| t.is_op(":"))
    }

    /// Space-separated rendering used in diagnostics and rewritten text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut prev: Option<&Token> = None;
        for token in &self.tokens {
            if let Some(p) = prev {
                if needs_space(p, token) {
                    out.push(' ');
                }
            }
            out.push_str(&token.text);
            prev = Some(token);
        }
        out
    }
}

impl fmt::Display for LogicalLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", " ".repeat(self.indent), self.render())
    }
}

fn needs_space(prev: &Token, next: &Token) -> bool {
    if [".", ",", ")", "]", ":"].iter().any(|o| next.is_op(o)) {
        return false;
    }
    if [".", "(", "["].iter().any(|o| prev.is_op(o)) {
        return false;
    }
    let callable = prev.kind == TokenKind::Name || prev.is_op(")") || prev.is_op("]");
    !(callable && (next.is_op("(") || next.is_op("[")))
}

/// A string-only statement removed from the token stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Docstring {
    pub line: usize,
    /// Number of logical lines preceding it.
    pub position: usize,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenizedBlock {
    pub lines: Vec<LogicalLine>,
    pub docstrings: Vec<Docstring>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub line: usize,
    pub message: String,
}

const OPERATORS: [&str; 30] = [
    "**=", "//=", "**", "//", "+=", "-=", "*=", "/=", "%=", "==", "!=", "<=", ">=", "->", "+",
    "-", "*", "/", "%", "<", ">", "=", "(", ")", "[", "]", ",", ":", ".", ";",
];

const TAB_WIDTH: usize = 8;

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    depth: usize,
    block: TokenizedBlock,
    current: Vec<Token>,
    current_indent: usize,
    current_line: usize,
}

/// Split `text` into logical lines. `first_line` is the line number of the
/// first line of `text` within its file.
pub fn tokenize(text: &str, first_line: usize) -> Result<TokenizedBlock, LexError> {
    let mut lexer = Lexer {
        chars: text.chars().collect(),
        pos: 0,
        line: first_line,
        depth: 0,
        block: TokenizedBlock::default(),
        current: Vec::new(),
        current_indent: 0,
        current_line: first_line,
    };
    lexer.run()?;
    Ok(lexer.block)
}

impl Lexer {
    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn error(&self, message: impl Into<String>) -> LexError {
        LexError {
            line: self.line,
            message: message.into(),
        }
    }

    fn run(&mut self) -> Result<(), LexError> {
        let mut at_line_start = true;
        while self.pos < self.chars.len() {
            if at_line_start && self.current.is_empty() {
                self.current_indent = self.measure_indent();
                self.current_line = self.line;
                at_line_start = false;
                continue;
            }
            let c = self.chars[self.pos];
            match c {
                '\n' => {
                    self.pos += 1;
                    self.line += 1;
                    if self.depth == 0 {
                        self.finish_line();
                        at_line_start = true;
                    }
                }
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '#' => {
                    while self.peek(0).is_some_and(|c| c != '\n') {
                        self.pos += 1;
                    }
                }
                '\\' => {
                    let mut ahead = 1;
                    while self.peek(ahead) == Some('\r') {
                        ahead += 1;
                    }
                    if self.peek(ahead) != Some('\n') {
                        return Err(self.error("unexpected `\\` inside a line"));
                    }
                    self.pos += ahead + 1;
                    self.line += 1;
                }
                '\'' | '"' => self.string(0)?,
                c if c.is_ascii_digit() => self.number(),
                '.' if self.peek(1).is_some_and(|n| n.is_ascii_digit()) && !self.follows_value() => {
                    self.number()
                }
                c if c.is_alphabetic() || c == '_' => {
                    let start = self.pos;
                    while self
                        .peek(0)
                        .is_some_and(|c| c.is_alphanumeric() || c == '_')
                    {
                        self.pos += 1;
                    }
                    let word: String = self.chars[start..self.pos].iter().collect();
                    let is_prefix = word.len() <= 2
                        && word.chars().all(|c| "rRuUbB".contains(c))
                        && matches!(self.peek(0), Some('\'') | Some('"'));
                    if is_prefix {
                        self.pos = start;
                        self.string(word.len())?;
                    } else {
                        self.current.push(Token::name(word));
                    }
                }
                _ => self.operator()?,
            }
        }
        if self.depth > 0 {
            return Err(self.error("unclosed bracket at end of block"));
        }
        self.finish_line();
        Ok(())
    }

    fn measure_indent(&mut self) -> usize {
        let mut width = 0;
        while let Some(c) = self.peek(0) {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / TAB_WIDTH + 1) * TAB_WIDTH,
                _ => break,
            }
            self.pos += 1;
        }
        width
    }

    fn follows_value(&self) -> bool {
        self.current.last().is_some_and(|t| {
            matches!(t.kind, TokenKind::Name | TokenKind::Number) || t.is_op(")") || t.is_op("]")
        })
    }

    fn finish_line(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let tokens = std::mem::take(&mut self.current);
        if tokens.iter().all(|t| t.kind == TokenKind::Str) {
            let text = tokens.iter().map(|t| string_value(&t.text)).collect();
            self.block.docstrings.push(Docstring {
                line: self.current_line,
                position: self.block.lines.len(),
                text,
            });
            return;
        }
        self.block.lines.push(LogicalLine {
            indent: self.current_indent,
            line: self.current_line,
            tokens,
        });
    }

    fn number(&mut self) {
        let start = self.pos;
        while self.peek(0).is_some_and(|c| c.is_ascii_digit() || c == '_') {
            self.pos += 1;
        }
        if self.peek(0) == Some('.') {
            self.pos += 1;
            while self.peek(0).is_some_and(|c| c.is_ascii_digit() || c == '_') {
                self.pos += 1;
            }
        }
        if matches!(self.peek(0), Some('e') | Some('E')) {
            let sign = usize::from(matches!(self.peek(1), Some('+') | Some('-')));
            if self.peek(1 + sign).is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1 + sign;
                while self.peek(0).is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }
        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        self.current.push(Token {
            kind: TokenKind::Number,
            text,
        });
    }

    fn string(&mut self, prefix: usize) -> Result<(), LexError> {
        let start = self.pos;
        self.pos += prefix;
        let quote = self.chars[self.pos];
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        let width = if triple { 3 } else { 1 };
        self.pos += width;
        loop {
            let Some(c) = self.peek(0) else {
                return Err(self.error("unterminated string literal"));
            };
            match c {
                '\\' => {
                    if self.peek(1) == Some('\n') {
                        self.line += 1;
                    }
                    self.pos += 2;
                }
                '\n' if !triple => return Err(self.error("unterminated string literal")),
                '\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                c if c == quote => {
                    if !triple {
                        self.pos += 1;
                        break;
                    }
                    if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                        self.pos += 3;
                        break;
                    }
                    self.pos += 1;
                }
                _ => self.pos += 1,
            }
        }
        let text: String = self.chars[start..self.pos.min(self.chars.len())]
            .iter()
            .collect();
        self.current.push(Token {
            kind: TokenKind::Str,
            text,
        });
        Ok(())
    }

    fn operator(&mut self) -> Result<(), LexError> {
        for op in OPERATORS {
            let matches = op
                .chars()
                .enumerate()
                .all(|(i, c)| self.peek(i) == Some(c));
            if matches {
                match op {
                    "(" | "[" => self.depth += 1,
                    ")" | "]" => {
                        if self.depth == 0 {
                            return Err(self.error(format!("unmatched `{op}`")));
                        }
                        self.depth -= 1;
                    }
                    _ => {}
                }
                self.pos += op.len();
                self.current.push(Token::op(op));
                return Ok(());
            }
        }
        Err(self.error(format!(
            "unexpected character `{}`",
            self.chars[self.pos]
        )))
    }
}

/// The content of a string literal token, without prefix and quotes.
pub fn string_value(raw: &str) -> String {
    let body = raw.trim_start_matches(|c: char| "rRuUbB".contains(c));
    for quotes in ["\"\"\"", "'''", "\"", "'"] {
        if body.len() >= 2 * quotes.len() && body.starts_with(quotes) && body.ends_with(quotes) {
            return body[quotes.len()..body.len() - quotes.len()].to_string();
        }
    }
    body.to_string()
}

/// Dedent documentation text the way a docstring is conventionally displayed.
///
/// The first line is taken as is; the common indentation of the remaining
/// non-empty lines is removed.
pub fn clean_doc_string(doc: &str) -> String {
    let lines: Vec<&str> = doc.lines().collect();
    if lines.is_empty() {
        return String::new();
    }

    let min_indent = lines
        .iter()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);

    let mut cleaned = vec![lines[0].trim()];
    cleaned.extend(lines.iter().skip(1).map(|line| {
        if line.len() >= min_indent {
            line[min_indent..].trim_end()
        } else {
            line.trim()
        }
    }));
    cleaned.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(line: &LogicalLine) -> Vec<&str> {
        line.tokens.iter().map(|t| t.text.as_str()).collect()
    }

    #[test]
    fn joins_bracket_and_backslash_continuations() {
        let block = tokenize(
            "x = (a +\n     b)  # comment\ny = c \\\n    + 1\n\n# only a comment\nz = 2\n",
            10,
        )
        .unwrap();
        assert_eq!(block.lines.len(), 3);
        assert_eq!(texts(&block.lines[0]), vec!["x", "=", "(", "a", "+", "b", ")"]);
        assert_eq!(block.lines[0].line, 10);
        assert_eq!(texts(&block.lines[1]), vec!["y", "=", "c", "+", "1"]);
        assert_eq!(block.lines[1].line, 12);
        assert_eq!(block.lines[2].line, 16);
    }

    #[test]
    fn docstrings_are_set_aside() {
        let block = tokenize(
            "def f(model):\n    \"\"\"Compute things.\n\n    More text.\n    \"\"\"\n    x = 'a'\n",
            1,
        )
        .unwrap();
        assert_eq!(block.lines.len(), 2);
        assert_eq!(block.docstrings.len(), 1);
        assert_eq!(block.docstrings[0].position, 1);
        assert_eq!(block.docstrings[0].line, 2);
        assert_eq!(
            clean_doc_string(&block.docstrings[0].text),
            "Compute things.\n\nMore text."
        );
        assert_eq!(block.lines[1].line, 6);
    }

    #[test]
    fn numbers_and_operators() {
        let block = tokenize("d_x **= .5e-3 // 2.\nx = a.b[1]\n", 1).unwrap();
        assert_eq!(texts(&block.lines[0]), vec!["d_x", "**=", ".5e-3", "//", "2."]);
        assert_eq!(
            texts(&block.lines[1]),
            vec!["x", "=", "a", ".", "b", "[", "1", "]"]
        );
        assert_eq!(block.lines[1].render(), "x = a.b[1]");
    }

    #[test]
    fn indentation_is_measured() {
        let block = tokenize("if x:\n    y = 1\n\tz = 2\n", 1).unwrap();
        let indents: Vec<usize> = block.lines.iter().map(|l| l.indent).collect();
        assert_eq!(indents, vec![0, 4, 8]);
        assert!(block.lines[0].is_block_header());
    }

    #[test]
    fn lexical_errors() {
        assert_eq!(tokenize("x = (1\n", 1).unwrap_err().line, 2);
        assert!(tokenize("x = 1)\n", 1).is_err());
        assert!(tokenize("x = 'open\n", 1).is_err());
        assert!(tokenize("x = a @ b\n", 1).is_err());
    }
}
