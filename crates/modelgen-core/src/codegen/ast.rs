//! Statement and expression tree of a normalized method body.
//!
//! The same tree is lowered to C and executed by the reference interpreter.

use crate::method::MethodKind;
use crate::schema::{Family, GroupKind};
use std::fmt;

/// A variable group as seen from a method body, including the previous-step states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupRef {
    Kind(GroupKind),
    OldStates,
}

impl GroupRef {
    pub fn attr_name(self) -> &'static str {
        match self {
            GroupRef::Kind(kind) => kind.attr_name(),
            GroupRef::OldStates => "old_states",
        }
    }

    pub fn family(self) -> Family {
        match self {
            GroupRef::Kind(kind) => kind.family(),
            GroupRef::OldStates => Family::Sequences,
        }
    }

    /// The group declaring the variable's metadata.
    pub fn kind(self) -> GroupKind {
        match self {
            GroupRef::Kind(kind) => kind,
            GroupRef::OldStates => GroupKind::States,
        }
    }

    pub fn from_attr_name(family: Family, name: &str) -> Option<Self> {
        if family == Family::Sequences && name == "old_states" {
            return Some(GroupRef::OldStates);
        }
        GroupKind::from_attr_name(name)
            .filter(|kind| kind.family() == family)
            .map(GroupRef::Kind)
    }
}

/// Fully qualified variable reference relative to the executing model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarPath {
    /// Sub-model attribute names leading to the owning model.
    pub owner: Vec<String>,
    pub group: GroupRef,
    pub name: String,
}

impl VarPath {
    pub fn new(group: GroupRef, name: impl Into<String>) -> Self {
        Self {
            owner: Vec::new(),
            group,
            name: name.into(),
        }
    }

    /// Key of the variable's storage slot, e.g. `states.y` or `loss.control.c`.
    pub fn slot_key(&self) -> String {
        let mut parts: Vec<&str> = self.owner.iter().map(String::as_str).collect();
        parts.push(self.group.attr_name());
        parts.push(&self.name);
        parts.join(".")
    }

    /// The same path seen from a model `prefix` levels up.
    pub fn prefixed(&self, prefix: &[String]) -> Self {
        let mut owner = prefix.to_vec();
        owner.extend(self.owner.iter().cloned());
        Self {
            owner,
            group: self.group,
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for VarPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "self.")?;
        for owner in &self.owner {
            write!(f, "{owner}.")?;
        }
        write!(
            f,
            "{}.{}.{}",
            self.group.family().attr_name(),
            self.group.attr_name(),
            self.name
        )
    }
}

/// Declared type of a local or argument, fixed by its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalType {
    Int,
    Float,
}

impl LocalType {
    pub fn c_type(self) -> &'static str {
        match self {
            LocalType::Int => "int",
            LocalType::Float => "double",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedName {
    pub name: String,
    pub ty: LocalType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Exp,
    Log,
    Abs,
    Fabs,
    Sqrt,
    Min,
    Max,
    Floor,
    SmoothLogistic1,
    SmoothLogistic2,
}

impl Builtin {
    pub const ALL: [Builtin; 10] = [
        Builtin::Exp,
        Builtin::Log,
        Builtin::Abs,
        Builtin::Fabs,
        Builtin::Sqrt,
        Builtin::Min,
        Builtin::Max,
        Builtin::Floor,
        Builtin::SmoothLogistic1,
        Builtin::SmoothLogistic2,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Exp => "exp",
            Builtin::Log => "log",
            Builtin::Abs => "abs",
            Builtin::Fabs => "fabs",
            Builtin::Sqrt => "sqrt",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Floor => "floor",
            Builtin::SmoothLogistic1 => "smooth_logistic1",
            Builtin::SmoothLogistic2 => "smooth_logistic2",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Builtin::ALL.into_iter().find(|b| b.name() == name)
    }

    pub fn arity(self) -> usize {
        match self {
            Builtin::Min | Builtin::Max | Builtin::SmoothLogistic1 | Builtin::SmoothLogistic2 => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    Builtin(Builtin),
    Method { owner: Vec<String>, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    pub fn from_token(text: &str) -> Option<Self> {
        Some(match text {
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "//" => BinaryOp::FloorDiv,
            "%" => BinaryOp::Mod,
            "**" => BinaryOp::Pow,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "and" => BinaryOp::And,
            "or" => BinaryOp::Or,
            _ => return None,
        })
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    /// Float literal with its source spelling, kept for readable output.
    Float { value: f64, text: String },
    Bool(bool),
    Local(String),
    Var { path: VarPath, indices: Vec<Expr> },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Call { callee: Callee, args: Vec<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Local(String),
    Var { path: VarPath, indices: Vec<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign {
        target: Target,
        value: Expr,
        line: usize,
    },
    /// `for var in range(start, stop, step)` with a literal, non-zero step.
    For {
        var: String,
        start: Expr,
        stop: Expr,
        step: i64,
        body: Vec<Stmt>,
        line: usize,
    },
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        orelse: Vec<Stmt>,
        line: usize,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
        line: usize,
    },
    Return {
        value: Option<Expr>,
        line: usize,
    },
    Pass,
    Expr {
        expr: Expr,
        line: usize,
    },
}

/// A parsed, fully typed method ready for lowering or interpretation.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodBody {
    pub name: String,
    pub kind: MethodKind,
    pub doc: String,
    /// Arguments following the model handle.
    pub args: Vec<TypedName>,
    pub locals: Vec<TypedName>,
    pub body: Vec<Stmt>,
    /// Whether the method returns a value, making it a `double` function.
    pub returns_value: bool,
}

impl MethodBody {
    pub fn local_type(&self, name: &str) -> Option<LocalType> {
        self.args
            .iter()
            .chain(self.locals.iter())
            .find(|t| t.name == name)
            .map(|t| t.ty)
    }
}

/// Visit every expression of a statement list, depth first.
pub fn walk_exprs<'a>(stmts: &'a [Stmt], visit: &mut dyn FnMut(&'a Expr)) {
    fn expr<'a>(e: &'a Expr, visit: &mut dyn FnMut(&'a Expr)) {
        visit(e);
        match e {
            Expr::Var { indices, .. } => indices.iter().for_each(|i| expr(i, visit)),
            Expr::Unary { operand, .. } => expr(operand, visit),
            Expr::Binary { lhs, rhs, .. } => {
                expr(lhs, visit);
                expr(rhs, visit);
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| expr(a, visit)),
            _ => {}
        }
    }
    for stmt in stmts {
        match stmt {
            Stmt::Assign { target, value, .. } => {
                if let Target::Var { indices, .. } = target {
                    indices.iter().for_each(|i| expr(i, visit));
                }
                expr(value, visit);
            }
            Stmt::For {
                start, stop, body, ..
            } => {
                expr(start, visit);
                expr(stop, visit);
                walk_exprs(body, visit);
            }
            Stmt::If {
                branches, orelse, ..
            } => {
                for (cond, body) in branches {
                    expr(cond, visit);
                    walk_exprs(body, visit);
                }
                walk_exprs(orelse, visit);
            }
            Stmt::While { cond, body, .. } => {
                expr(cond, visit);
                walk_exprs(body, visit);
            }
            Stmt::Return { value, .. } => {
                if let Some(value) = value {
                    expr(value, visit);
                }
            }
            Stmt::Expr { expr: e, .. } => expr(e, visit),
            Stmt::Pass => {}
        }
    }
}
