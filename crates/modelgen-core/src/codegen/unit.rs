//! Assembly of a complete generated unit.

use super::declarations::{io_functions, structs};
use super::lower::{lower_method, signature};
use super::scaffold::scaffold;
use super::{compile, CompiledModel};
use crate::config::{GeneratorConfig, SolverConfig};
use crate::errors::{ModelgenError, ModelgenResult, Stage};
use crate::manifest::ModelDefinition;
use crate::method::MethodKind;
use std::fmt::Write;
use tracing::debug;

/// Helper headers every unit includes, with their contents.
pub const SUPPORT_HEADERS: [(&str, &str); 3] = [
    ("mathutils.h", include_str!("../../csupport/mathutils.h")),
    ("pointerutils.h", include_str!("../../csupport/pointerutils.h")),
    ("smoothutils.h", include_str!("../../csupport/smoothutils.h")),
];

const SYSTEM_HEADERS: [&str; 5] = ["math.h", "stdbool.h", "stdio.h", "stdlib.h", "string.h"];

/// The complete text of one generated C unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedUnit {
    pub model: String,
    pub file_name: String,
    pub text: String,
}

/// Compile `definition` and render its unit.
///
/// Nothing is written; either the whole unit is produced or an error naming
/// the failing stage is returned.
pub fn assemble(
    definition: &ModelDefinition,
    generator: &GeneratorConfig,
    solver: &SolverConfig,
) -> ModelgenResult<GeneratedUnit> {
    let compiled = compile(definition, generator)?;
    let text = render(&compiled, solver)?;
    debug!(model = %definition.name, bytes = text.len(), "Assembled unit");
    Ok(GeneratedUnit {
        model: definition.name.clone(),
        file_name: generator.unit_file_name(&definition.name),
        text,
    })
}

/// Render the unit of an already compiled model.
pub fn render(model: &CompiledModel, solver: &SolverConfig) -> ModelgenResult<String> {
    let root = model.name();
    let models = model.dependency_order();
    for sub in models.iter().filter(|m| m.name() != root) {
        check_submodel(sub).map_err(|e| e.in_stage(root, Stage::Scaffold))?;
    }
    for m in &models {
        check_links(m).map_err(|e| e.in_stage(root, Stage::Declarations))?;
    }

    let mut out = String::new();
    let _ = writeln!(out, "/* Generated by modelgen for model `{root}`. Do not edit. */");
    let sources: Vec<String> = model
        .definition
        .source_paths()
        .iter()
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    if !sources.is_empty() {
        let _ = writeln!(out, "/* Sources: {} */", sources.join(", "));
    }
    out.push('\n');
    for header in SYSTEM_HEADERS {
        let _ = writeln!(out, "#include <{header}>");
    }
    for (header, _) in SUPPORT_HEADERS {
        let _ = writeln!(out, "#include \"{header}\"");
    }
    out.push('\n');

    for m in &models {
        out.push_str(&structs(m));
        out.push('\n');
    }
    for m in &models {
        for method in &m.methods {
            let _ = writeln!(out, "{};", signature(m, &method.body));
        }
    }
    out.push('\n');
    for m in &models {
        out.push_str(&io_functions(m, m.name() == root));
    }
    for m in &models {
        for method in &m.methods {
            let function = lower_method(m, method).map_err(|e| e.in_stage(root, Stage::Lowering))?;
            out.push_str(&function);
            out.push('\n');
        }
    }
    for m in &models {
        out.push_str(&scaffold(m, solver, m.name() == root));
    }
    while out.ends_with("\n\n") {
        out.pop();
    }
    Ok(out)
}

/// Sub-models are only reached through their add methods.
fn check_submodel(model: &CompiledModel) -> ModelgenResult<()> {
    let offending: Vec<&str> = MethodKind::ALL
        .into_iter()
        .filter(|kind| *kind != MethodKind::Add && model.methods_of(*kind).next().is_some())
        .map(MethodKind::list_name)
        .collect();
    if offending.is_empty() {
        Ok(())
    } else {
        Err(ModelgenError::Definition(format!(
            "sub-model `{}` declares {} methods; sub-models may only declare add methods",
            model.name(),
            offending.join(", ")
        )))
    }
}

/// Links are pointers to scalars or arrays of pointers.
fn check_links(model: &CompiledModel) -> ModelgenResult<()> {
    for group in model.definition.groups().iter().filter(|g| g.kind.is_link()) {
        if let Some(v) = group.variables.iter().find(|v| v.ndim > 1) {
            return Err(ModelgenError::Definition(format!(
                "link variable `{}.{}` of model `{}` has {} dimensions; links support at most one",
                group.kind,
                v.name,
                model.name(),
                v.ndim
            )));
        }
    }
    Ok(())
}
