//! Renders parsed method bodies as C functions.

use super::ast::{
    BinaryOp, Builtin, Callee, Expr, LocalType, MethodBody, Stmt, Target, UnaryOp, VarPath,
};
use super::{CompiledMethod, CompiledModel, Site};
use crate::errors::ModelgenResult;
use std::fmt::Write;

const INDENT: &str = "    ";

/// C name of method `method` of model `model`.
pub fn function_name(model: &str, method: &str) -> String {
    format!("{model}_{method}")
}

/// The function signature without a trailing `;` or body.
pub fn signature(model: &CompiledModel, body: &MethodBody) -> String {
    let return_type = if body.returns_value { "double" } else { "void" };
    let mut params = vec![format!("{}_Model *self", model.name())];
    params.extend(
        body.args
            .iter()
            .map(|a| format!("{} {}", a.ty.c_type(), a.name)),
    );
    format!(
        "static {return_type} {}({})",
        function_name(model.name(), &body.name),
        params.join(", ")
    )
}

/// Complete C function for one compiled method of `model`.
pub fn lower_method(model: &CompiledModel, compiled: &CompiledMethod) -> ModelgenResult<String> {
    let body = &compiled.body;
    check_loop_counters(&body.body, body, &Site::new(model.name(), &body.name))?;
    let mut out = String::new();
    if let Some(summary) = body.doc.lines().next().filter(|l| !l.trim().is_empty()) {
        let _ = writeln!(out, "/* {} */", summary.replace("*/", "* /"));
    }
    let _ = writeln!(out, "{} {{", signature(model, body));
    for local in &body.locals {
        let _ = writeln!(out, "{INDENT}{} {};", local.ty.c_type(), local.name);
    }
    let lowerer = Lowerer { model };
    lowerer.stmts(&body.body, 1, &mut out);
    out.push_str("}\n");
    Ok(out)
}

/// C loops count in integers; a floating point counter would change the trip count.
fn check_loop_counters(stmts: &[Stmt], body: &MethodBody, site: &Site) -> ModelgenResult<()> {
    for stmt in stmts {
        match stmt {
            Stmt::For {
                var, body: inner, line, ..
            } => {
                if body.local_type(var) != Some(LocalType::Int) {
                    return Err(site.unsupported(
                        *line,
                        format!("loop variable `{var}` must be an integer local"),
                    ));
                }
                check_loop_counters(inner, body, site)?;
            }
            Stmt::While { body: inner, .. } => check_loop_counters(inner, body, site)?,
            Stmt::If {
                branches, orelse, ..
            } => {
                for (_, inner) in branches {
                    check_loop_counters(inner, body, site)?;
                }
                check_loop_counters(orelse, body, site)?;
            }
            _ => {}
        }
    }
    Ok(())
}

struct Lowerer<'a> {
    model: &'a CompiledModel,
}

impl Lowerer<'_> {
    fn stmts(&self, stmts: &[Stmt], depth: usize, out: &mut String) {
        for stmt in stmts {
            self.stmt(stmt, depth, out);
        }
    }

    fn stmt(&self, stmt: &Stmt, depth: usize, out: &mut String) {
        let pad = INDENT.repeat(depth);
        match stmt {
            Stmt::Assign { target, value, .. } => {
                let target = match target {
                    Target::Local(name) => name.clone(),
                    Target::Var { path, indices } => self.var(path, indices),
                };
                let _ = writeln!(out, "{pad}{target} = {};", self.expr(value));
            }
            Stmt::For {
                var,
                start,
                stop,
                step,
                body,
                ..
            } => {
                let cmp = if *step > 0 { "<" } else { ">" };
                let advance = match step {
                    1 => format!("{var}++"),
                    -1 => format!("{var}--"),
                    s => format!("{var} += {s}"),
                };
                let _ = writeln!(
                    out,
                    "{pad}for ({var} = {}; {var} {cmp} {}; {advance}) {{",
                    self.expr(start),
                    self.expr(stop)
                );
                self.stmts(body, depth + 1, out);
                let _ = writeln!(out, "{pad}}}");
            }
            Stmt::If {
                branches, orelse, ..
            } => {
                for (idx, (cond, body)) in branches.iter().enumerate() {
                    let keyword = if idx == 0 { "if" } else { "} else if" };
                    let _ = writeln!(out, "{pad}{keyword} ({}) {{", self.expr(cond));
                    self.stmts(body, depth + 1, out);
                }
                if !orelse.is_empty() {
                    let _ = writeln!(out, "{pad}}} else {{");
                    self.stmts(orelse, depth + 1, out);
                }
                let _ = writeln!(out, "{pad}}}");
            }
            Stmt::While { cond, body, .. } => {
                let _ = writeln!(out, "{pad}while ({}) {{", self.expr(cond));
                self.stmts(body, depth + 1, out);
                let _ = writeln!(out, "{pad}}}");
            }
            Stmt::Return { value, .. } => match value {
                Some(value) => {
                    let _ = writeln!(out, "{pad}return {};", self.expr(value));
                }
                None => {
                    let _ = writeln!(out, "{pad}return;");
                }
            },
            Stmt::Pass => {}
            Stmt::Expr { expr, .. } => {
                let _ = writeln!(out, "{pad}{};", self.expr(expr));
            }
        }
    }

    fn var(&self, path: &VarPath, indices: &[Expr]) -> String {
        let is_link = path.group.kind().is_link();
        let mut access = format!("self->{}", member_path(path));
        for index in indices {
            let _ = write!(access, "[{}]", self.expr(index));
        }
        if is_link {
            format!("(*{access})")
        } else {
            access
        }
    }

    fn expr(&self, expr: &Expr) -> String {
        match expr {
            Expr::Int(value) => value.to_string(),
            Expr::Float { text, .. } => float_literal(text),
            Expr::Bool(value) => if *value { "1" } else { "0" }.to_string(),
            Expr::Local(name) => name.clone(),
            Expr::Var { path, indices } => self.var(path, indices),
            Expr::Unary { op, operand } => {
                let operand = self.expr(operand);
                match op {
                    UnaryOp::Neg => format!("(-{operand})"),
                    UnaryOp::Pos => format!("(+{operand})"),
                    UnaryOp::Not => format!("(!{operand})"),
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let (l, r) = (self.expr(lhs), self.expr(rhs));
                let symbol = match op {
                    BinaryOp::Div => return format!("((double)({l}) / ({r}))"),
                    BinaryOp::FloorDiv => return format!("floor((double)({l}) / (double)({r}))"),
                    BinaryOp::Mod => return format!("fmod({l}, {r})"),
                    BinaryOp::Pow => return format!("pow({l}, {r})"),
                    BinaryOp::Add => "+",
                    BinaryOp::Sub => "-",
                    BinaryOp::Mul => "*",
                    BinaryOp::Lt => "<",
                    BinaryOp::Le => "<=",
                    BinaryOp::Gt => ">",
                    BinaryOp::Ge => ">=",
                    BinaryOp::Eq => "==",
                    BinaryOp::Ne => "!=",
                    BinaryOp::And => "&&",
                    BinaryOp::Or => "||",
                };
                format!("({l} {symbol} {r})")
            }
            Expr::Call { callee, args } => {
                let mut rendered: Vec<String> = args.iter().map(|a| self.expr(a)).collect();
                match callee {
                    Callee::Builtin(builtin) => {
                        format!("{}({})", c_builtin(*builtin), rendered.join(", "))
                    }
                    Callee::Method { owner, name } => {
                        let target = self
                            .model
                            .descend(owner)
                            .map(CompiledModel::name)
                            .unwrap_or(self.model.name());
                        let handle = if owner.is_empty() {
                            "self".to_string()
                        } else {
                            format!("&self->{}", owner.join("."))
                        };
                        rendered.insert(0, handle);
                        format!("{}({})", function_name(target, name), rendered.join(", "))
                    }
                }
            }
        }
    }
}

/// Member path below `self->`, e.g. `loss.parameters.control.c`.
pub fn member_path(path: &VarPath) -> String {
    let mut parts: Vec<&str> = path.owner.iter().map(String::as_str).collect();
    parts.push(path.group.family().attr_name());
    parts.push(path.group.attr_name());
    parts.push(&path.name);
    parts.join(".")
}

fn float_literal(text: &str) -> String {
    if text.starts_with('.') {
        format!("0{text}")
    } else {
        text.to_string()
    }
}

fn c_builtin(builtin: Builtin) -> &'static str {
    match builtin {
        Builtin::Exp => "mu_exp",
        Builtin::Log => "mu_log",
        Builtin::Abs | Builtin::Fabs => "mu_fabs",
        Builtin::Sqrt => "sqrt",
        Builtin::Min => "fmin",
        Builtin::Max => "fmax",
        Builtin::Floor => "floor",
        Builtin::SmoothLogistic1 => "su_logistic1",
        Builtin::SmoothLogistic2 => "su_logistic2",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::compile;
    use crate::config::GeneratorConfig;
    use crate::manifest::{ModelDefinition, SourceFile};
    use crate::method::MethodKind;
    use crate::schema::{GroupKind, Variable, VariableGroup};

    const SOURCE: &str = r#"
def calc_q(model):
    """Outflow of all zones."""
    con = model.parameters.control.fastaccess
    flu = model.sequences.fluxes.fastaccess
    inl = model.sequences.inlets.fastaccess
    d_sum = 0.
    for idx in range(con.nmb - 1, -1, -1):
        if con.k > 0 and not idx == 2:
            flu.qz[idx] = max(con.k ** 2, 1.0) // 3 + idx % 2
        else:
            flu.qz[idx] = exp(-con.k)
        d_sum += flu.qz[idx] / con.nmb
    flu.q = d_sum + inl.q
"#;

    fn compiled() -> CompiledModel {
        let definition = ModelDefinition::builder("zones")
            .source(SourceFile::new("zones.mdl", SOURCE))
            .group(
                VariableGroup::new(GroupKind::Control)
                    .variable(Variable::float("k"))
                    .variable(Variable::int("nmb")),
            )
            .group(
                VariableGroup::new(GroupKind::Fluxes)
                    .variable(Variable::float("q"))
                    .variable(Variable::float("qz").with_ndim(1)),
            )
            .group(VariableGroup::new(GroupKind::Inlets).variable(Variable::float("q")))
            .method(MethodKind::Run, "calc_q")
            .build()
            .unwrap();
        compile(&definition, &GeneratorConfig::default()).unwrap()
    }

    #[test]
    fn lowers_a_complete_method() {
        let model = compiled();
        let text = lower_method(&model, &model.methods[0]).unwrap();
        let expected = "/* Outflow of all zones. */
static void zones_calc_q(zones_Model *self) {
    double d_sum;
    int idx;
    d_sum = 0.;
    for (idx = (self->parameters.control.nmb - 1); idx > (-1); idx--) {
        if (((self->parameters.control.k > 0) && (!(idx == 2)))) {
            self->sequences.fluxes.qz[idx] = (floor((double)(fmax(pow(self->parameters.control.k, 2), 1.0)) / (double)(3)) + fmod(idx, 2));
        } else {
            self->sequences.fluxes.qz[idx] = mu_exp((-self->parameters.control.k));
        }
        d_sum = (d_sum + ((double)(self->sequences.fluxes.qz[idx]) / (self->parameters.control.nmb)));
    }
    self->sequences.fluxes.q = (d_sum + (*self->sequences.inlets.q));
}
";
        assert_eq!(text, expected);
    }

    #[test]
    fn floating_loop_counters_are_rejected() {
        let definition = ModelDefinition::builder("m")
            .source(SourceFile::new(
                "m.mdl",
                "def calc(model):\n    for d_x in range(3):\n        pass\n",
            ))
            .method(MethodKind::Run, "calc")
            .build()
            .unwrap();
        let model = compile(&definition, &GeneratorConfig::default()).unwrap();
        let err = lower_method(&model, &model.methods[0]).unwrap_err();
        assert!(err.to_string().contains("loop variable `d_x`"));
    }

    #[test]
    fn signatures() {
        let model = compiled();
        assert_eq!(
            signature(&model, &model.methods[0].body),
            "static void zones_calc_q(zones_Model *self)"
        );
    }
}
