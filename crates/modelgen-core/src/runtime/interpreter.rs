//! Direct execution of parsed method bodies.
//!
//! Arithmetic follows the generated C code: `/`, `//`, `%`, `**` and every
//! builtin produce floats, `+ - *` stay integral when both operands are, and
//! assignments to integer locals or variables truncate.

use super::instance::ModelInstance;
use crate::codegen::ast::{
    BinaryOp, Builtin, Callee, Expr, LocalType, MethodBody, Stmt, Target, UnaryOp, VarPath,
};
use crate::codegen::CompiledModel;
use crate::errors::{ModelgenError, ModelgenResult};
use crate::schema::ElementType;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Value {
    pub fn as_f64(self) -> f64 {
        match self {
            Value::Int(v) => v as f64,
            Value::Float(v) => v,
            Value::Bool(v) => f64::from(u8::from(v)),
        }
    }

    fn as_int(self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(v),
            Value::Bool(v) => Some(i64::from(v)),
            Value::Float(_) => None,
        }
    }

    fn is_true(self) -> bool {
        match self {
            Value::Int(v) => v != 0,
            Value::Float(v) => v != 0.0,
            Value::Bool(v) => v,
        }
    }

    fn cast(self, ty: LocalType) -> Value {
        match ty {
            LocalType::Float => Value::Float(self.as_f64()),
            LocalType::Int => Value::Int(self.as_int().unwrap_or(self.as_f64() as i64)),
        }
    }

    fn from_element(element: ElementType, raw: f64) -> Value {
        match element {
            ElementType::Float => Value::Float(raw),
            ElementType::Int => Value::Int(raw as i64),
            ElementType::Bool => Value::Bool(raw != 0.0),
        }
    }
}

/// Smoothed step from 0 to 1 around zero.
pub fn smooth_logistic1(value: f64, parameter: f64) -> f64 {
    if parameter <= 0.0 {
        if value > 0.0 {
            1.0
        } else if value < 0.0 {
            0.0
        } else {
            0.5
        }
    } else {
        1.0 / (1.0 + (-value / parameter).exp())
    }
}

/// Smoothed `max(value, 0)`.
pub fn smooth_logistic2(value: f64, parameter: f64) -> f64 {
    if parameter <= 0.0 {
        return value.max(0.0);
    }
    let temp = value / parameter;
    if temp > 700.0 {
        value
    } else {
        parameter * temp.exp().ln_1p()
    }
}

enum Flow {
    Next,
    Return(Option<Value>),
}

/// Executes the methods of a compiled model against a [`ModelInstance`].
#[derive(Debug, Clone, Copy)]
pub struct Interpreter<'m> {
    model: &'m CompiledModel,
}

impl<'m> Interpreter<'m> {
    pub fn new(model: &'m CompiledModel) -> Self {
        Self { model }
    }

    /// Run a method of the top-level model that takes no arguments.
    pub fn run(&self, instance: &mut ModelInstance, method: &str) -> ModelgenResult<()> {
        self.call(instance, &[], method, Vec::new()).map(|_| ())
    }

    /// Call method `name` of the model reached through `owner`.
    ///
    /// Returns the method's value, cast to float, when it returns one.
    pub fn call(
        &self,
        instance: &mut ModelInstance,
        owner: &[String],
        name: &str,
        args: Vec<Value>,
    ) -> ModelgenResult<Option<Value>> {
        let runtime_error = |message: String| ModelgenError::Runtime {
            method: name.to_string(),
            message,
        };
        let model = self
            .model
            .descend(owner)
            .ok_or_else(|| runtime_error(format!("no sub-model at `{}`", owner.join("."))))?;
        let body = &model
            .method(name)
            .ok_or_else(|| runtime_error(format!("model `{}` has no such method", model.name())))?
            .body;
        if body.args.len() != args.len() {
            return Err(runtime_error(format!(
                "expected {} argument(s), got {}",
                body.args.len(),
                args.len()
            )));
        }
        let mut locals: HashMap<&str, Value> = body
            .locals
            .iter()
            .map(|l| (l.name.as_str(), Value::Int(0).cast(l.ty)))
            .collect();
        for (arg, value) in body.args.iter().zip(args) {
            locals.insert(arg.name.as_str(), value.cast(arg.ty));
        }
        let mut frame = Frame {
            interpreter: self,
            owner,
            body,
            locals,
        };
        match frame.block(instance, &body.body)? {
            Flow::Return(Some(value)) => Ok(Some(Value::Float(value.as_f64()))),
            Flow::Return(None) | Flow::Next => Ok(None),
        }
    }
}

struct Frame<'a, 'm> {
    interpreter: &'a Interpreter<'m>,
    owner: &'a [String],
    body: &'a MethodBody,
    locals: HashMap<&'a str, Value>,
}

impl<'a> Frame<'a, '_> {
    fn error(&self, message: impl Into<String>) -> ModelgenError {
        ModelgenError::Runtime {
            method: self.body.name.clone(),
            message: message.into(),
        }
    }

    fn block(&mut self, instance: &mut ModelInstance, stmts: &'a [Stmt]) -> ModelgenResult<Flow> {
        for stmt in stmts {
            if let Flow::Return(value) = self.stmt(instance, stmt)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Next)
    }

    fn stmt(&mut self, instance: &mut ModelInstance, stmt: &'a Stmt) -> ModelgenResult<Flow> {
        match stmt {
            Stmt::Assign { target, value, .. } => {
                let value = self.expr(instance, value)?;
                match target {
                    Target::Local(name) => self.assign_local(name, value)?,
                    Target::Var { path, indices } => {
                        let index = self.indices(instance, indices)?;
                        instance.write(&self.resolve(path), &index, value.as_f64())?;
                    }
                }
            }
            Stmt::For {
                var,
                start,
                stop,
                step,
                body,
                ..
            } => {
                let start = self.integer(instance, start)?;
                let stop = self.integer(instance, stop)?;
                let mut counter = start;
                while (*step > 0 && counter < stop) || (*step < 0 && counter > stop) {
                    self.assign_local(var, Value::Int(counter))?;
                    if let Flow::Return(value) = self.block(instance, body)? {
                        return Ok(Flow::Return(value));
                    }
                    counter += step;
                }
                self.assign_local(var, Value::Int(counter))?;
            }
            Stmt::If {
                branches, orelse, ..
            } => {
                for (cond, body) in branches {
                    if self.expr(instance, cond)?.is_true() {
                        return self.block(instance, body);
                    }
                }
                return self.block(instance, orelse);
            }
            Stmt::While { cond, body, .. } => {
                while self.expr(instance, cond)?.is_true() {
                    if let Flow::Return(value) = self.block(instance, body)? {
                        return Ok(Flow::Return(value));
                    }
                }
            }
            Stmt::Return { value, .. } => {
                let value = match value {
                    Some(expr) => Some(self.expr(instance, expr)?),
                    None => None,
                };
                return Ok(Flow::Return(value));
            }
            Stmt::Pass => {}
            Stmt::Expr { expr, .. } => {
                self.expr(instance, expr)?;
            }
        }
        Ok(Flow::Next)
    }

    fn assign_local(&mut self, name: &str, value: Value) -> ModelgenResult<()> {
        let ty = self
            .body
            .local_type(name)
            .ok_or_else(|| self.error(format!("unknown local `{name}`")))?;
        match self.locals.get_mut(name) {
            Some(slot) => {
                *slot = value.cast(ty);
                Ok(())
            }
            None => Err(self.error(format!("unknown local `{name}`"))),
        }
    }

    fn resolve(&self, path: &VarPath) -> VarPath {
        path.prefixed(self.owner)
    }

    fn integer(&mut self, instance: &mut ModelInstance, expr: &'a Expr) -> ModelgenResult<i64> {
        let value = self.expr(instance, expr)?;
        value
            .as_int()
            .ok_or_else(|| self.error(format!("expected an integer, got {}", value.as_f64())))
    }

    fn indices(&mut self, instance: &mut ModelInstance, indices: &'a [Expr]) -> ModelgenResult<Vec<i64>> {
        indices.iter().map(|i| self.integer(instance, i)).collect()
    }

    fn expr(&mut self, instance: &mut ModelInstance, expr: &'a Expr) -> ModelgenResult<Value> {
        Ok(match expr {
            Expr::Int(value) => Value::Int(*value),
            Expr::Float { value, .. } => Value::Float(*value),
            Expr::Bool(value) => Value::Bool(*value),
            Expr::Local(name) => *self
                .locals
                .get(name.as_str())
                .ok_or_else(|| self.error(format!("unknown local `{name}`")))?,
            Expr::Var { path, indices } => {
                let index = self.indices(instance, indices)?;
                let path = self.resolve(path);
                let element = instance.slot(&path.slot_key())?.element;
                Value::from_element(element, instance.read(&path, &index)?)
            }
            Expr::Unary { op, operand } => {
                let value = self.expr(instance, operand)?;
                match (op, value) {
                    (UnaryOp::Not, v) => Value::Bool(!v.is_true()),
                    (UnaryOp::Neg, Value::Float(v)) => Value::Float(-v),
                    (UnaryOp::Neg, v) => Value::Int(v.as_int().unwrap_or_default().wrapping_neg()),
                    (UnaryOp::Pos, Value::Bool(v)) => Value::Int(i64::from(v)),
                    (UnaryOp::Pos, v) => v,
                }
            }
            Expr::Binary {
                op: BinaryOp::And,
                lhs,
                rhs,
            } => Value::Bool(self.expr(instance, lhs)?.is_true() && self.expr(instance, rhs)?.is_true()),
            Expr::Binary {
                op: BinaryOp::Or,
                lhs,
                rhs,
            } => Value::Bool(self.expr(instance, lhs)?.is_true() || self.expr(instance, rhs)?.is_true()),
            Expr::Binary { op, lhs, rhs } => {
                let l = self.expr(instance, lhs)?;
                let r = self.expr(instance, rhs)?;
                binary(*op, l, r)
            }
            Expr::Call { callee, args } => {
                let values = args
                    .iter()
                    .map(|a| self.expr(instance, a))
                    .collect::<ModelgenResult<Vec<_>>>()?;
                match callee {
                    Callee::Builtin(builtin) => builtin_call(*builtin, &values),
                    Callee::Method { owner, name } => {
                        let mut target = self.owner.to_vec();
                        target.extend(owner.iter().cloned());
                        self.interpreter
                            .call(instance, &target, name, values)?
                            .unwrap_or(Value::Float(0.0))
                    }
                }
            }
        })
    }
}

fn binary(op: BinaryOp, l: Value, r: Value) -> Value {
    let (a, b) = (l.as_f64(), r.as_f64());
    let ints = l.as_int().zip(r.as_int());
    match op {
        BinaryOp::Div => Value::Float(a / b),
        BinaryOp::FloorDiv => Value::Float((a / b).floor()),
        BinaryOp::Mod => Value::Float(a % b),
        BinaryOp::Pow => Value::Float(a.powf(b)),
        BinaryOp::Add => ints.map_or(Value::Float(a + b), |(x, y)| Value::Int(x.wrapping_add(y))),
        BinaryOp::Sub => ints.map_or(Value::Float(a - b), |(x, y)| Value::Int(x.wrapping_sub(y))),
        BinaryOp::Mul => ints.map_or(Value::Float(a * b), |(x, y)| Value::Int(x.wrapping_mul(y))),
        BinaryOp::Lt => Value::Bool(ints.map_or(a < b, |(x, y)| x < y)),
        BinaryOp::Le => Value::Bool(ints.map_or(a <= b, |(x, y)| x <= y)),
        BinaryOp::Gt => Value::Bool(ints.map_or(a > b, |(x, y)| x > y)),
        BinaryOp::Ge => Value::Bool(ints.map_or(a >= b, |(x, y)| x >= y)),
        BinaryOp::Eq => Value::Bool(ints.map_or(a == b, |(x, y)| x == y)),
        BinaryOp::Ne => Value::Bool(ints.map_or(a != b, |(x, y)| x != y)),
        BinaryOp::And => Value::Bool(l.is_true() && r.is_true()),
        BinaryOp::Or => Value::Bool(l.is_true() || r.is_true()),
    }
}

fn builtin_call(builtin: Builtin, args: &[Value]) -> Value {
    let arg = |i: usize| args.get(i).map_or(f64::NAN, |v| v.as_f64());
    Value::Float(match builtin {
        Builtin::Exp => arg(0).exp(),
        Builtin::Log => arg(0).ln(),
        Builtin::Abs | Builtin::Fabs => arg(0).abs(),
        Builtin::Sqrt => arg(0).sqrt(),
        Builtin::Min => arg(0).min(arg(1)),
        Builtin::Max => arg(0).max(arg(1)),
        Builtin::Floor => arg(0).floor(),
        Builtin::SmoothLogistic1 => smooth_logistic1(arg(0), arg(1)),
        Builtin::SmoothLogistic2 => smooth_logistic2(arg(0), arg(1)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::compile;
    use crate::config::GeneratorConfig;
    use crate::manifest::{ModelDefinition, SourceFile};
    use crate::method::MethodKind;
    use crate::schema::{GroupKind, Variable, VariableGroup};
    use is_close::is_close;
    use ndarray::array;

    const STORE: &str = r#"
def calc_q(model):
    """Outflow of all zones plus the loss."""
    con = model.parameters.control.fastaccess
    flu = model.sequences.fluxes.fastaccess
    sta = model.sequences.states.fastaccess
    d_sum = 0.
    for idx in range(con.nmb):
        flu.qz[idx] = con.k * sta.sz[idx]
        d_sum += flu.qz[idx]
    flu.q = d_sum + model.loss.get_loss(d_sum)
    n = 7 / 2
    flu.half = n + 7 // 2 + 7 % 4
    if flu.q > 10. and not con.nmb == 0:
        flu.big = True
    else:
        flu.big = False

def get_loss(model, d_value):
    con = model.parameters.control.fastaccess
    if d_value <= 0.:
        return 0.
    return con.c * d_value
"#;

    fn store() -> CompiledModel {
        let loss = ModelDefinition::builder("lloss")
            .source(SourceFile::new("lloss.mdl", STORE))
            .group(VariableGroup::new(GroupKind::Control).variable(Variable::float("c")))
            .method(MethodKind::Add, "get_loss")
            .build()
            .unwrap();
        let definition = ModelDefinition::builder("store")
            .source(SourceFile::new("store.mdl", STORE))
            .group(
                VariableGroup::new(GroupKind::Control)
                    .variable(Variable::int("nmb"))
                    .variable(Variable::float("k")),
            )
            .group(VariableGroup::new(GroupKind::States).variable(Variable::float("sz").with_ndim(1)))
            .group(
                VariableGroup::new(GroupKind::Fluxes)
                    .variable(Variable::float("qz").with_ndim(1))
                    .variable(Variable::float("q"))
                    .variable(Variable::int("half"))
                    .variable(Variable::bool("big")),
            )
            .method(MethodKind::Run, "calc_q")
            .submodel("loss", loss)
            .build()
            .unwrap();
        compile(&definition, &GeneratorConfig::default()).unwrap()
    }

    fn instance(model: &CompiledModel) -> ModelInstance {
        let mut instance = ModelInstance::new(&model.definition);
        instance.set_scalar("control.nmb", 3.0).unwrap();
        instance.set_scalar("control.k", 2.0).unwrap();
        instance.set_scalar("loss.control.c", 0.5).unwrap();
        instance
            .set_array("states.sz", array![1.0, 2.0, 3.0].into_dyn())
            .unwrap();
        instance.set_shape("fluxes.qz", &[3]).unwrap();
        instance
    }

    #[test]
    fn executes_loops_calls_and_c_arithmetic() {
        let model = store();
        let mut instance = instance(&model);
        Interpreter::new(&model).run(&mut instance, "calc_q").unwrap();
        assert_eq!(instance.flat("fluxes.qz").unwrap(), vec![2.0, 4.0, 6.0]);
        assert!(is_close!(instance.scalar("fluxes.q").unwrap(), 18.0));
        // n = 3 (truncated 3.5), 7 // 2 = 3.0, 7 % 4 = 3.0
        assert_eq!(instance.scalar("fluxes.half").unwrap(), 9.0);
        assert_eq!(instance.scalar("fluxes.big").unwrap(), 1.0);
    }

    #[test]
    fn add_methods_return_floats() {
        let model = store();
        let mut instance = instance(&model);
        let interpreter = Interpreter::new(&model);
        let loss = ["loss".to_string()];
        assert_eq!(
            interpreter
                .call(&mut instance, &loss, "get_loss", vec![Value::Int(4)])
                .unwrap(),
            Some(Value::Float(2.0))
        );
        assert_eq!(
            interpreter
                .call(&mut instance, &loss, "get_loss", vec![Value::Float(-1.0)])
                .unwrap(),
            Some(Value::Float(0.0))
        );
    }

    #[test]
    fn out_of_bounds_access_is_an_error() {
        let model = store();
        let mut instance = instance(&model);
        instance.set_scalar("control.nmb", 4.0).unwrap();
        let err = Interpreter::new(&model)
            .run(&mut instance, "calc_q")
            .unwrap_err();
        assert!(matches!(err, ModelgenError::IndexOutOfBounds { .. }));
    }

    #[test]
    fn smooth_functions_approach_their_limits() {
        assert_eq!(smooth_logistic1(0.0, 0.0), 0.5);
        assert_eq!(smooth_logistic1(-1.0, 0.0), 0.0);
        assert!(is_close!(smooth_logistic1(0.0, 0.1), 0.5));
        assert!(smooth_logistic1(5.0, 0.1) > 0.999);
        assert_eq!(smooth_logistic2(-3.0, 0.0), 0.0);
        assert!(is_close!(smooth_logistic2(1000.0, 1.0), 1000.0));
        assert!(is_close!(smooth_logistic2(0.0, 1.0), 2f64.ln()));
    }
}
