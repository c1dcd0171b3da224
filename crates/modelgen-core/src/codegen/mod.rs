//! Source-to-source pipeline from host method bodies to C.
//!
//! Every method listed in a model definition passes through
//! [`introspect`](introspect::introspect), [`rewrite`](rewrite::rewrite),
//! [`normalize`](normalize::normalize) and [`parse`](parser::parse). The
//! resulting [`CompiledModel`] is consumed both by the C emitters
//! ([`declarations`], [`lower`], [`scaffold`], assembled by [`unit`]) and by the
//! reference interpreter in [`crate::runtime`].

pub mod ast;
pub mod declarations;
pub mod introspect;
pub mod lexer;
pub mod lower;
pub mod normalize;
pub mod parser;
pub mod rewrite;
pub mod scaffold;
pub mod unit;

use crate::config::GeneratorConfig;
use crate::errors::{ModelgenError, ModelgenResult, Stage};
use crate::integration::IntegrationPlan;
use crate::manifest::ModelDefinition;
use crate::method::{MethodKind, ModelMethod};
use ast::{walk_exprs, Callee, Expr, MethodBody};
use tracing::debug;

/// Model and method an error refers to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Site<'a> {
    model: &'a str,
    method: &'a str,
}

impl<'a> Site<'a> {
    pub(crate) fn new(model: &'a str, method: &'a str) -> Self {
        Self { model, method }
    }

    pub(crate) fn unsupported(&self, line: usize, message: impl Into<String>) -> ModelgenError {
        ModelgenError::UnsupportedConstruct {
            model: self.model.to_string(),
            method: self.method.to_string(),
            line,
            message: message.into(),
        }
    }
}

/// An introspected method together with its parsed body.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledMethod {
    pub method: ModelMethod,
    pub body: MethodBody,
}

/// A model definition whose methods (and those of its sub-models) are parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledModel {
    pub definition: ModelDefinition,
    pub plan: IntegrationPlan,
    /// Methods in classification order.
    pub methods: Vec<CompiledMethod>,
    /// Sub-models by attribute name, in declaration order.
    pub submodels: Vec<(String, CompiledModel)>,
}

impl CompiledModel {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn method(&self, name: &str) -> Option<&CompiledMethod> {
        self.methods.iter().find(|m| m.method.name == name)
    }

    /// Methods of one classification, in declaration order.
    pub fn methods_of(&self, kind: MethodKind) -> impl Iterator<Item = &CompiledMethod> {
        self.methods.iter().filter(move |m| m.method.kind == kind)
    }

    pub fn submodel(&self, name: &str) -> Option<&CompiledModel> {
        self.submodels
            .iter()
            .find(|(attr, _)| attr == name)
            .map(|(_, model)| model)
    }

    /// Follow a chain of sub-model attribute names.
    pub fn descend(&self, owner: &[String]) -> Option<&CompiledModel> {
        let mut current = self;
        for name in owner {
            current = current.submodel(name)?;
        }
        Some(current)
    }

    /// This model and every nested sub-model, children before their parents,
    /// without repeating a definition name.
    pub fn dependency_order(&self) -> Vec<&CompiledModel> {
        fn visit<'m>(model: &'m CompiledModel, out: &mut Vec<&'m CompiledModel>) {
            for (_, sub) in &model.submodels {
                visit(sub, out);
            }
            if !out.iter().any(|m| m.name() == model.name()) {
                out.push(model);
            }
        }
        let mut out = Vec::new();
        visit(self, &mut out);
        out
    }
}

/// Run introspection, rewriting, normalization and parsing over every method
/// of `definition` and its sub-models.
pub fn compile(definition: &ModelDefinition, config: &GeneratorConfig) -> ModelgenResult<CompiledModel> {
    let model = compile_tree(definition, config)?;
    validate_calls(&model, &model)?;
    Ok(model)
}

fn compile_tree(definition: &ModelDefinition, config: &GeneratorConfig) -> ModelgenResult<CompiledModel> {
    let name = definition.name.as_str();
    let submodels = definition
        .submodels
        .iter()
        .map(|sub| Ok((sub.name.clone(), compile_tree(&sub.definition, config)?)))
        .collect::<ModelgenResult<Vec<_>>>()?;

    let mut methods = Vec::new();
    for (kind, method_name) in definition.methods.iter() {
        let method = introspect::introspect(definition, method_name, kind, &config.fastaccess_marker)
            .map_err(|e| e.in_stage(name, Stage::Introspection))?;
        if kind != MethodKind::Add && !method.args().is_empty() {
            return Err(Site::new(name, method_name)
                .unsupported(method.line, "only add methods take arguments besides `model`")
                .in_stage(name, Stage::Introspection));
        }
        let rewritten = rewrite::rewrite(definition, &method, config)
            .map_err(|e| e.in_stage(name, Stage::Rewriting))?;
        let normalized = normalize::normalize(name, &method, &rewritten, config)
            .map_err(|e| e.in_stage(name, Stage::Normalization))?;
        let body = parser::parse(definition, &method, &normalized)
            .map_err(|e| e.in_stage(name, Stage::Parsing))?;
        if kind != MethodKind::Add && body.returns_value {
            return Err(Site::new(name, method_name)
                .unsupported(method.line, "only add methods may return a value")
                .in_stage(name, Stage::Parsing));
        }
        debug!(model = name, method = method_name, kind = ?kind, "Compiled method");
        methods.push(CompiledMethod { method, body });
    }

    Ok(CompiledModel {
        definition: definition.clone(),
        plan: IntegrationPlan::for_definition(definition),
        methods,
        submodels,
    })
}

/// Every method call must name an existing method with matching arity, and
/// only returning methods may be used as values.
fn validate_calls(root: &CompiledModel, model: &CompiledModel) -> ModelgenResult<()> {
    for compiled in &model.methods {
        let site = Site::new(model.name(), &compiled.method.name);
        let line = compiled.method.line;
        let mut result = Ok(());
        walk_exprs(&compiled.body.body, &mut |e| {
            if result.is_err() {
                return;
            }
            if let Expr::Call {
                callee: Callee::Method { owner, name },
                args,
            } = e
            {
                result = match model.descend(owner).and_then(|m| m.method(name)) {
                    None => Err(site.unsupported(line, format!("call of unknown method `{name}`"))),
                    Some(target) if target.body.args.len() != args.len() => Err(site.unsupported(
                        line,
                        format!(
                            "`{name}` takes {} argument(s), got {}",
                            target.body.args.len(),
                            args.len()
                        ),
                    )),
                    Some(_) => Ok(()),
                };
            }
        });
        result.map_err(|e| e.in_stage(root.name(), Stage::Parsing))?;

        for call in parser::value_calls(&compiled.body) {
            if let Expr::Call {
                callee: Callee::Method { owner, name },
                ..
            } = call
            {
                let returns = model
                    .descend(owner)
                    .and_then(|m| m.method(name))
                    .is_some_and(|m| m.body.returns_value);
                if !returns {
                    return Err(site
                        .unsupported(line, format!("`{name}` returns no value"))
                        .in_stage(root.name(), Stage::Parsing));
                }
            }
        }
    }
    for (_, sub) in &model.submodels {
        validate_calls(root, sub)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::SourceFile;
    use crate::schema::{GroupKind, Variable, VariableGroup};

    fn storage(source: &str) -> ModelDefinition {
        let loss = ModelDefinition::builder("lloss")
            .source(SourceFile::new(
                "lloss.mdl",
                "def get_loss(model, d_storage):\n    con = model.parameters.control.fastaccess\n    return con.c * d_storage\n",
            ))
            .group(VariableGroup::new(GroupKind::Control).variable(Variable::float("c")))
            .method(MethodKind::Add, "get_loss")
            .build()
            .unwrap();
        ModelDefinition::builder("store")
            .source(SourceFile::new("store.mdl", source))
            .group(VariableGroup::new(GroupKind::States).variable(Variable::float("s")))
            .group(VariableGroup::new(GroupKind::Fluxes).variable(Variable::float("q")))
            .method(MethodKind::Run, "calc_q")
            .submodel("loss", loss)
            .build()
            .unwrap()
    }

    #[test]
    fn compiles_model_and_submodels() {
        let model = compile(
            &storage("def calc_q(model):\n    flu = model.sequences.fluxes.fastaccess\n    sta = model.sequences.states.fastaccess\n    flu.q = model.loss.get_loss(sta.s)\n"),
            &GeneratorConfig::default(),
        )
        .unwrap();
        assert_eq!(model.plan, IntegrationPlan::None);
        assert_eq!(model.methods.len(), 1);
        let loss = model.descend(&["loss".to_string()]).unwrap();
        assert!(loss.method("get_loss").unwrap().body.returns_value);
        let order: Vec<&str> = model.dependency_order().iter().map(|m| m.name()).collect();
        assert_eq!(order, vec!["lloss", "store"]);
    }

    #[test]
    fn call_arity_is_checked() {
        let err = compile(
            &storage("def calc_q(model):\n    flu = model.sequences.fluxes.fastaccess\n    flu.q = model.loss.get_loss()\n"),
            &GeneratorConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ModelgenError::Generation { stage: Stage::Parsing, .. }));
        assert!(err.to_string().contains("takes 1 argument(s), got 0"));
    }

    #[test]
    fn failures_carry_the_stage() {
        let err = compile(
            &storage("def calc_q(model):\n    flu = model.sequences.fluxes.fastaccess\n    flu.zz = 1.0\n"),
            &GeneratorConfig::default(),
        )
        .unwrap_err();
        match err {
            ModelgenError::Generation { model, stage, .. } => {
                assert_eq!(model, "store");
                assert_eq!(stage, Stage::Rewriting);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
