//! Builds the statement tree of a normalized method body.

use super::ast::{
    walk_exprs, BinaryOp, Builtin, Callee, Expr, GroupRef, LocalType, MethodBody, Stmt, Target,
    UnaryOp, VarPath,
};
use super::lexer::{LogicalLine, Token, TokenKind};
use super::normalize::NormalizedMethod;
use super::Site;
use crate::errors::{ModelgenError, ModelgenResult};
use crate::manifest::ModelDefinition;
use crate::method::ModelMethod;
use crate::schema::Family;

pub fn parse(
    definition: &ModelDefinition,
    method: &ModelMethod,
    normalized: &NormalizedMethod,
) -> ModelgenResult<MethodBody> {
    let site = Site::new(&definition.name, &method.name);
    let mut parser = Parser {
        definition,
        site,
        normalized,
        lines: &normalized.lines,
        idx: 0,
    };
    let indent = normalized.lines.first().map(|l| l.indent).unwrap_or(0);
    let body = parser.block(indent)?;
    if let Some(line) = parser.lines.get(parser.idx) {
        return Err(parser.site.unsupported(line.line, "unexpected dedent"));
    }

    let mut with_value = false;
    let mut without_value = None;
    visit_returns(&body, &mut |value, line| {
        if value {
            with_value = true;
        } else if without_value.is_none() {
            without_value = Some(line);
        }
    });
    if let (true, Some(line)) = (with_value, without_value) {
        return Err(parser
            .site
            .unsupported(line, "a method either always or never returns a value"));
    }

    Ok(MethodBody {
        name: method.name.clone(),
        kind: method.kind,
        doc: method.doc.clone(),
        args: normalized.args.clone(),
        locals: normalized.locals.clone(),
        body,
        returns_value: with_value,
    })
}

fn visit_returns(stmts: &[Stmt], visit: &mut dyn FnMut(bool, usize)) {
    for stmt in stmts {
        match stmt {
            Stmt::Return { value, line } => visit(value.is_some(), *line),
            Stmt::For { body, .. } | Stmt::While { body, .. } => visit_returns(body, visit),
            Stmt::If {
                branches, orelse, ..
            } => {
                for (_, body) in branches {
                    visit_returns(body, visit);
                }
                visit_returns(orelse, visit);
            }
            _ => {}
        }
    }
}

/// Method calls whose result is used as a value.
pub fn value_calls(body: &MethodBody) -> Vec<&Expr> {
    let mut statements = Vec::new();
    statement_calls(&body.body, &mut statements);
    let mut calls = Vec::new();
    walk_exprs(&body.body, &mut |e| {
        let is_method_call = matches!(
            e,
            Expr::Call {
                callee: Callee::Method { .. },
                ..
            }
        );
        if is_method_call && !statements.iter().any(|s| std::ptr::eq(*s, e)) {
            calls.push(e);
        }
    });
    calls
}

fn statement_calls<'a>(stmts: &'a [Stmt], out: &mut Vec<&'a Expr>) {
    for stmt in stmts {
        match stmt {
            Stmt::Expr { expr, .. } => out.push(expr),
            Stmt::For { body, .. } | Stmt::While { body, .. } => statement_calls(body, out),
            Stmt::If {
                branches, orelse, ..
            } => {
                for (_, body) in branches {
                    statement_calls(body, out);
                }
                statement_calls(orelse, out);
            }
            _ => {}
        }
    }
}

struct Parser<'a> {
    definition: &'a ModelDefinition,
    site: Site<'a>,
    normalized: &'a NormalizedMethod,
    lines: &'a [LogicalLine],
    idx: usize,
}

impl<'a> Parser<'a> {
    fn block(&mut self, indent: usize) -> ModelgenResult<Vec<Stmt>> {
        let lines = self.lines;
        let mut stmts = Vec::new();
        while let Some(line) = lines.get(self.idx) {
            if line.indent < indent {
                break;
            }
            if line.indent > indent {
                return Err(self.site.unsupported(line.line, "unexpected indent"));
            }
            stmts.push(self.statement(line)?);
        }
        Ok(stmts)
    }

    /// The block following a header line.
    fn suite(&mut self, header: &LogicalLine) -> ModelgenResult<Vec<Stmt>> {
        let lines = self.lines;
        match lines.get(self.idx) {
            Some(next) if next.indent > header.indent => self.block(next.indent),
            _ => Err(self
                .site
                .unsupported(header.line, "expected an indented block")),
        }
    }

    fn statement(&mut self, line: &'a LogicalLine) -> ModelgenResult<Stmt> {
        self.idx += 1;
        let tokens = line.tokens.as_slice();
        let first = &tokens[0];
        if first.kind == TokenKind::Name {
            match first.text.as_str() {
                "if" => return self.if_statement(line),
                "for" => return self.for_statement(line),
                "while" => {
                    let cond = self.expr_until_colon(line, 1)?;
                    let body = self.suite(line)?;
                    return Ok(Stmt::While {
                        cond,
                        body,
                        line: line.line,
                    });
                }
                "return" => {
                    let value = if tokens.len() > 1 {
                        Some(self.expression(line, &tokens[1..])?)
                    } else {
                        None
                    };
                    return Ok(Stmt::Return {
                        value,
                        line: line.line,
                    });
                }
                "pass" if tokens.len() == 1 => return Ok(Stmt::Pass),
                "elif" | "else" => {
                    return Err(self
                        .site
                        .unsupported(line.line, format!("`{}` without `if`", first.text)))
                }
                _ => {}
            }
        }
        if line.is_block_header() {
            return Err(self
                .site
                .unsupported(line.line, format!("unsupported statement `{}`", line.render())));
        }

        if let Some(eq) = top_level_position(tokens, |t| t.is_op("=")) {
            let target = self.target(line, &tokens[..eq])?;
            let value = self.expression(line, &tokens[eq + 1..])?;
            return Ok(Stmt::Assign {
                target,
                value,
                line: line.line,
            });
        }
        let expr = self.expression(line, tokens)?;
        if !matches!(
            expr,
            Expr::Call {
                callee: Callee::Method { .. },
                ..
            }
        ) {
            return Err(self.site.unsupported(
                line.line,
                "only method calls can be used as statements",
            ));
        }
        Ok(Stmt::Expr {
            expr,
            line: line.line,
        })
    }

    fn if_statement(&mut self, line: &'a LogicalLine) -> ModelgenResult<Stmt> {
        let mut branches = vec![(self.expr_until_colon(line, 1)?, self.suite(line)?)];
        let mut orelse = Vec::new();
        let lines = self.lines;
        while let Some(next) = lines.get(self.idx) {
            if next.indent != line.indent {
                break;
            }
            if next.tokens[0].is_name("elif") {
                self.idx += 1;
                let cond = self.expr_until_colon(next, 1)?;
                branches.push((cond, self.suite(next)?));
            } else if next.tokens[0].is_name("else") {
                if next.tokens.len() != 2 || !next.tokens[1].is_op(":") {
                    return Err(self.site.unsupported(next.line, "malformed `else`"));
                }
                self.idx += 1;
                orelse = self.suite(next)?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt::If {
            branches,
            orelse,
            line: line.line,
        })
    }

    fn for_statement(&mut self, line: &'a LogicalLine) -> ModelgenResult<Stmt> {
        let tokens = line.tokens.as_slice();
        let malformed = || {
            self.site.unsupported(
                line.line,
                "loops must have the form `for name in range(...):`",
            )
        };
        if tokens.len() < 8
            || tokens[1].kind != TokenKind::Name
            || !tokens[2].is_name("in")
            || !tokens[3].is_name("range")
            || !tokens[4].is_op("(")
            || !tokens[tokens.len() - 2].is_op(")")
            || !tokens[tokens.len() - 1].is_op(":")
        {
            return Err(malformed());
        }
        let var = tokens[1].text.clone();
        if self.local_type(&var).is_none() {
            return Err(malformed());
        }
        let inner = &tokens[5..tokens.len() - 2];
        let args = split_top_level(inner);
        let (start, stop, step_tokens) = match args.as_slice() {
            [stop] => (Expr::Int(0), self.expression(line, stop)?, None),
            [start, stop] => (
                self.expression(line, start)?,
                self.expression(line, stop)?,
                None,
            ),
            [start, stop, step] => (
                self.expression(line, start)?,
                self.expression(line, stop)?,
                Some(*step),
            ),
            _ => return Err(malformed()),
        };
        let step = match step_tokens {
            None => 1,
            Some(tokens) => literal_step(tokens).ok_or_else(|| {
                self.site.unsupported(
                    line.line,
                    "the step of a range must be a non-zero integer literal",
                )
            })?,
        };
        let body = self.suite(line)?;
        Ok(Stmt::For {
            var,
            start,
            stop,
            step,
            body,
            line: line.line,
        })
    }

    fn expr_until_colon(&self, line: &LogicalLine, from: usize) -> ModelgenResult<Expr> {
        let tokens = &line.tokens;
        if !line.is_block_header() || tokens.len() <= from + 1 {
            return Err(self.site.unsupported(line.line, "expected `condition:`"));
        }
        self.expression(line, &tokens[from..tokens.len() - 1])
    }

    fn target(&self, line: &LogicalLine, tokens: &[Token]) -> ModelgenResult<Target> {
        match tokens {
            [name] if name.kind == TokenKind::Name && self.local_type(&name.text).is_some() => {
                Ok(Target::Local(name.text.clone()))
            }
            _ => match self.expression(line, tokens)? {
                Expr::Var { path, indices } => Ok(Target::Var { path, indices }),
                _ => Err(self.site.unsupported(
                    line.line,
                    "only locals and model variables can be assigned to",
                )),
            },
        }
    }

    fn local_type(&self, name: &str) -> Option<LocalType> {
        self.normalized
            .args
            .iter()
            .chain(&self.normalized.locals)
            .find(|t| t.name == name)
            .map(|t| t.ty)
    }

    fn expression(&self, line: &LogicalLine, tokens: &[Token]) -> ModelgenResult<Expr> {
        if tokens.is_empty() {
            return Err(self.site.unsupported(line.line, "expected an expression"));
        }
        let mut cursor = Cursor {
            parser: self,
            line: line.line,
            tokens,
            pos: 0,
        };
        let expr = cursor.or_expr()?;
        if cursor.pos < tokens.len() {
            return Err(cursor.error(format!(
                "unexpected `{}`",
                tokens[cursor.pos].text
            )));
        }
        Ok(expr)
    }
}

/// Position of the first token matching `pred` outside any brackets.
fn top_level_position(tokens: &[Token], pred: impl Fn(&Token) -> bool) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, token) in tokens.iter().enumerate() {
        if token.is_op("(") || token.is_op("[") {
            depth += 1;
        } else if token.is_op(")") || token.is_op("]") {
            depth = depth.saturating_sub(1);
        } else if depth == 0 && pred(token) {
            return Some(idx);
        }
    }
    None
}

/// Split on top-level commas.
fn split_top_level(tokens: &[Token]) -> Vec<&[Token]> {
    let mut parts = Vec::new();
    let mut rest = tokens;
    while let Some(comma) = top_level_position(rest, |t| t.is_op(",")) {
        parts.push(&rest[..comma]);
        rest = &rest[comma + 1..];
    }
    if !rest.is_empty() {
        parts.push(rest);
    }
    parts
}

fn literal_step(tokens: &[Token]) -> Option<i64> {
    let (sign, digits) = match tokens {
        [minus, number] if minus.is_op("-") => (-1, number),
        [number] => (1, number),
        _ => return None,
    };
    if digits.kind != TokenKind::Number {
        return None;
    }
    let value: i64 = digits.text.parse().ok()?;
    (value != 0).then_some(sign * value)
}

struct Cursor<'p, 'a> {
    parser: &'p Parser<'a>,
    line: usize,
    tokens: &'p [Token],
    pos: usize,
}

impl Cursor<'_, '_> {
    fn error(&self, message: impl Into<String>) -> ModelgenError {
        self.parser.site.unsupported(self.line, message)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_op(op)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_name(&mut self, name: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_name(name)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> ModelgenResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{op}`")))
        }
    }

    fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    fn or_expr(&mut self) -> ModelgenResult<Expr> {
        let mut lhs = self.and_expr()?;
        while self.eat_name("or") {
            let rhs = self.and_expr()?;
            lhs = Self::binary(BinaryOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> ModelgenResult<Expr> {
        let mut lhs = self.not_expr()?;
        while self.eat_name("and") {
            let rhs = self.not_expr()?;
            lhs = Self::binary(BinaryOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> ModelgenResult<Expr> {
        if self.eat_name("not") {
            let operand = self.not_expr()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    fn comparison_op(&self) -> Option<BinaryOp> {
        self.peek()
            .filter(|t| t.kind == TokenKind::Op)
            .and_then(|t| BinaryOp::from_token(&t.text))
            .filter(|op| op.is_comparison())
    }

    fn comparison(&mut self) -> ModelgenResult<Expr> {
        let lhs = self.arith()?;
        let Some(op) = self.comparison_op() else {
            return Ok(lhs);
        };
        self.pos += 1;
        let rhs = self.arith()?;
        if self.comparison_op().is_some() {
            return Err(self.error("chained comparisons are not supported"));
        }
        Ok(Self::binary(op, lhs, rhs))
    }

    fn arith(&mut self) -> ModelgenResult<Expr> {
        let mut lhs = self.term()?;
        loop {
            let op = if self.eat_op("+") {
                BinaryOp::Add
            } else if self.eat_op("-") {
                BinaryOp::Sub
            } else {
                break;
            };
            let rhs = self.term()?;
            lhs = Self::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn term(&mut self) -> ModelgenResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat_op("*") {
                BinaryOp::Mul
            } else if self.eat_op("/") {
                BinaryOp::Div
            } else if self.eat_op("//") {
                BinaryOp::FloorDiv
            } else if self.eat_op("%") {
                BinaryOp::Mod
            } else {
                break;
            };
            let rhs = self.unary()?;
            lhs = Self::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> ModelgenResult<Expr> {
        let op = if self.eat_op("-") {
            UnaryOp::Neg
        } else if self.eat_op("+") {
            UnaryOp::Pos
        } else {
            return self.power();
        };
        let operand = self.unary()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn power(&mut self) -> ModelgenResult<Expr> {
        let base = self.atom()?;
        if self.eat_op("**") {
            let exponent = self.unary()?;
            return Ok(Self::binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn atom(&mut self) -> ModelgenResult<Expr> {
        let Some(token) = self.peek().cloned() else {
            return Err(self.error("unexpected end of expression"));
        };
        self.pos += 1;
        match token.kind {
            TokenKind::Number => number(&token.text).ok_or_else(|| {
                self.error(format!("invalid number `{}`", token.text))
            }),
            TokenKind::Op if token.text == "(" => {
                let inner = self.or_expr()?;
                self.expect_op(")")?;
                Ok(inner)
            }
            TokenKind::Name => match token.text.as_str() {
                "True" => Ok(Expr::Bool(true)),
                "False" => Ok(Expr::Bool(false)),
                "self" => self.qualified(),
                name => {
                    if self.peek().is_some_and(|t| t.is_op("(")) {
                        let builtin = Builtin::from_name(name)
                            .ok_or_else(|| self.error(format!("unknown function `{name}`")))?;
                        let args = self.call_args()?;
                        if args.len() != builtin.arity() {
                            return Err(self.error(format!(
                                "`{name}` takes {} argument(s), got {}",
                                builtin.arity(),
                                args.len()
                            )));
                        }
                        return Ok(Expr::Call {
                            callee: Callee::Builtin(builtin),
                            args,
                        });
                    }
                    if self.peek().is_some_and(|t| t.is_op("[")) {
                        return Err(self.error(format!("local `{name}` cannot be indexed")));
                    }
                    if self.parser.local_type(name).is_none() {
                        return Err(self.error(format!("undeclared identifier `{name}`")));
                    }
                    Ok(Expr::Local(name.to_string()))
                }
            },
            _ => Err(self.error(format!("unexpected `{}`", token.text))),
        }
    }

    fn call_args(&mut self) -> ModelgenResult<Vec<Expr>> {
        self.expect_op("(")?;
        let mut args = Vec::new();
        if self.eat_op(")") {
            return Ok(args);
        }
        loop {
            args.push(self.or_expr()?);
            if self.eat_op(")") {
                return Ok(args);
            }
            self.expect_op(",")?;
            if self.eat_op(")") {
                return Ok(args);
            }
        }
    }

    /// A `self.` chain: a variable (optionally indexed) or a method call.
    fn qualified(&mut self) -> ModelgenResult<Expr> {
        let mut segments = Vec::new();
        while self.eat_op(".") {
            match self.peek() {
                Some(t) if t.kind == TokenKind::Name => {
                    segments.push(t.text.clone());
                    self.pos += 1;
                }
                _ => return Err(self.error("expected a name after `.`")),
            }
        }
        let family_at = segments
            .iter()
            .position(|s| Family::from_attr_name(s).is_some());
        let Some(k) = family_at else {
            let Some((name, owner)) = segments.split_last() else {
                return Err(self.error("bare `self`"));
            };
            if !self.peek().is_some_and(|t| t.is_op("(")) {
                return Err(self.error(format!("`{name}` must be called")));
            }
            let args = self.call_args()?;
            return Ok(Expr::Call {
                callee: Callee::Method {
                    owner: owner.to_vec(),
                    name: name.clone(),
                },
                args,
            });
        };
        let (Some(family), [group, name]) = (Family::from_attr_name(&segments[k]), &segments[k + 1..])
        else {
            return Err(self.error(format!("malformed reference `self.{}`", segments.join("."))));
        };
        let group = GroupRef::from_attr_name(family, group)
            .ok_or_else(|| self.error(format!("unknown group `{group}`")))?;
        let path = VarPath {
            owner: segments[..k].to_vec(),
            group,
            name: name.clone(),
        };
        let ndim = self
            .parser
            .definition
            .descend(&path.owner)
            .and_then(|d| d.variable(group.kind(), &path.name))
            .map(|v| v.ndim)
            .ok_or_else(|| self.error(format!("unknown variable `{path}`")))?;

        let mut indices = Vec::new();
        if self.eat_op("[") {
            loop {
                indices.push(self.or_expr()?);
                if self.eat_op("]") {
                    break;
                }
                self.expect_op(",")?;
            }
        }
        if indices.len() != ndim {
            return Err(self.error(format!(
                "`{}` has {ndim} dimension(s) but is indexed with {}",
                path.name,
                indices.len()
            )));
        }
        Ok(Expr::Var { path, indices })
    }
}

fn number(text: &str) -> Option<Expr> {
    if text.contains(['.', 'e', 'E']) {
        text.parse::<f64>().ok().map(|value| Expr::Float {
            value,
            text: text.to_string(),
        })
    } else {
        text.parse::<i64>().ok().map(Expr::Int)
    }
}
