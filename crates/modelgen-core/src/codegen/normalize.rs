//! Statement normalization after reference rewriting.
//!
//! Drops fast-accessor bindings, expands augmented assignments into explicit
//! reassignments and types every free identifier. Comments, blank lines,
//! documentation strings and continuation lines are already handled by the
//! tokenizer.

use super::ast::{Builtin, LocalType, TypedName};
use super::lexer::{LogicalLine, Token, TokenKind};
use super::rewrite::RewrittenMethod;
use super::Site;
use crate::config::GeneratorConfig;
use crate::errors::ModelgenResult;
use crate::method::ModelMethod;

/// Words of the host language that are never identifiers.
pub const KEYWORDS: [&str; 15] = [
    "if", "elif", "else", "for", "in", "while", "return", "pass", "and", "or", "not", "True",
    "False", "range", "def",
];

const AUGMENTED: [&str; 7] = ["+=", "-=", "*=", "/=", "//=", "%=", "**="];

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMethod {
    pub lines: Vec<LogicalLine>,
    pub args: Vec<TypedName>,
    pub locals: Vec<TypedName>,
}

impl NormalizedMethod {
    pub fn text(&self) -> String {
        self.lines.iter().map(|l| format!("{l}\n")).collect()
    }
}

/// The type a local or argument takes from its name alone.
pub fn local_type(name: &str, accumulator_prefix: &str) -> LocalType {
    if name.starts_with(accumulator_prefix) {
        LocalType::Float
    } else {
        LocalType::Int
    }
}

pub fn normalize(
    model: &str,
    method: &ModelMethod,
    rewritten: &RewrittenMethod,
    config: &GeneratorConfig,
) -> ModelgenResult<NormalizedMethod> {
    let site = Site::new(model, &method.name);
    let typed = |name: &String| TypedName {
        name: name.clone(),
        ty: local_type(name, &config.accumulator_prefix),
    };
    let args: Vec<TypedName> = method.args().iter().map(typed).collect();
    let locals: Vec<TypedName> = method.locals.iter().map(typed).collect();

    let mut lines = Vec::with_capacity(rewritten.lines.len());
    for line in &rewritten.lines {
        if line.contains_name(&config.fastaccess_marker) {
            continue;
        }
        let line = expand_augmented(line);
        check_identifiers(&line, &args, &locals, &site, &method.name)?;
        lines.push(line);
    }
    Ok(NormalizedMethod {
        lines,
        args,
        locals,
    })
}

/// `x op= e` becomes `x = x op (e)`.
fn expand_augmented(line: &LogicalLine) -> LogicalLine {
    if line.is_block_header() {
        return line.clone();
    }
    let mut depth = 0usize;
    let mut position = None;
    for (idx, token) in line.tokens.iter().enumerate() {
        if token.kind != TokenKind::Op {
            continue;
        }
        match token.text.as_str() {
            "(" | "[" => depth += 1,
            ")" | "]" => depth = depth.saturating_sub(1),
            op if depth == 0 && AUGMENTED.contains(&op) => {
                position = Some(idx);
                break;
            }
            _ => {}
        }
    }
    let Some(idx) = position else {
        return line.clone();
    };
    let op = line.tokens[idx].text.trim_end_matches('=').to_string();
    let target = &line.tokens[..idx];
    let value = &line.tokens[idx + 1..];
    let mut tokens = Vec::with_capacity(2 * target.len() + value.len() + 4);
    tokens.extend_from_slice(target);
    tokens.push(Token::op("="));
    tokens.extend_from_slice(target);
    tokens.push(Token::op(op));
    tokens.push(Token::op("("));
    tokens.extend_from_slice(value);
    tokens.push(Token::op(")"));
    LogicalLine {
        indent: line.indent,
        line: line.line,
        tokens,
    }
}

fn check_identifiers(
    line: &LogicalLine,
    args: &[TypedName],
    locals: &[TypedName],
    site: &Site,
    method: &str,
) -> ModelgenResult<()> {
    let tokens = &line.tokens;
    for (idx, token) in tokens.iter().enumerate() {
        if token.kind == TokenKind::Str {
            return Err(site.unsupported(line.line, "string literals are not supported"));
        }
        if token.kind != TokenKind::Name || (idx > 0 && tokens[idx - 1].is_op(".")) {
            continue;
        }
        let name = token.text.as_str();
        let called = tokens.get(idx + 1).is_some_and(|t| t.is_op("("));
        let known = KEYWORDS.contains(&name)
            || name == "self"
            || (called && Builtin::from_name(name).is_some())
            || args.iter().chain(locals).any(|t| t.name == name);
        if !known {
            let message = if name == method {
                "methods must be called through `model`".to_string()
            } else {
                format!("undeclared identifier `{name}`")
            };
            return Err(site.unsupported(line.line, message));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::lexer::tokenize;
    use crate::errors::ModelgenError;
    use crate::method::{MethodKind, MethodReferences};
    use std::path::PathBuf;

    fn method(params: &[&str], locals: &[&str]) -> ModelMethod {
        ModelMethod {
            name: "calc".to_string(),
            kind: MethodKind::Run,
            source: String::new(),
            doc: String::new(),
            params: params.iter().map(|s| s.to_string()).collect(),
            locals: locals.iter().map(|s| s.to_string()).collect(),
            line: 1,
            origin: PathBuf::from("x.mdl"),
            references: MethodReferences::default(),
        }
    }

    fn rewritten(text: &str) -> RewrittenMethod {
        RewrittenMethod {
            lines: tokenize(text, 2).unwrap().lines,
            aliases: vec![],
        }
    }

    #[test]
    fn augmented_assignment_is_expanded() {
        let normalized = normalize(
            "m",
            &method(&["model"], &["d_sum", "idx"]),
            &rewritten("flu = model.sequences.fluxes.fastaccess\nd_sum = 0.\nfor idx in range(3):\n    d_sum += self.sequences.fluxes.qz[idx] * 2\n    self.sequences.fluxes.qz[idx] **= 2\n"),
            &GeneratorConfig::default(),
        )
        .unwrap();
        let text = normalized.text();
        assert!(!text.contains("fastaccess"));
        assert_eq!(
            text.lines().nth(2).unwrap(),
            "    d_sum = d_sum + (self.sequences.fluxes.qz[idx] * 2)"
        );
        assert_eq!(
            text.lines().nth(3).unwrap(),
            "    self.sequences.fluxes.qz[idx] = self.sequences.fluxes.qz[idx] ** (2)"
        );
    }

    #[test]
    fn types_follow_the_accumulator_prefix() {
        let normalized = normalize(
            "m",
            &method(&["model", "d_x", "k"], &["d_sum", "idx"]),
            &rewritten("d_sum = d_x * k\nidx = k\n"),
            &GeneratorConfig::default(),
        )
        .unwrap();
        let types: Vec<(&str, LocalType)> = normalized
            .args
            .iter()
            .chain(&normalized.locals)
            .map(|t| (t.name.as_str(), t.ty))
            .collect();
        assert_eq!(
            types,
            vec![
                ("d_x", LocalType::Float),
                ("k", LocalType::Int),
                ("d_sum", LocalType::Float),
                ("idx", LocalType::Int)
            ]
        );
    }

    #[test]
    fn free_identifiers_must_be_declared() {
        let err = normalize(
            "m",
            &method(&["model"], &["d_sum"]),
            &rewritten("d_sum = unknown + 1\n"),
            &GeneratorConfig::default(),
        )
        .unwrap_err();
        match err {
            ModelgenError::UnsupportedConstruct { line, message, .. } => {
                assert_eq!(line, 2);
                assert_eq!(message, "undeclared identifier `unknown`");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(normalize(
            "m",
            &method(&["model"], &["d_sum"]),
            &rewritten("d_sum = exp\n"),
            &GeneratorConfig::default(),
        )
        .is_err());
    }
}
