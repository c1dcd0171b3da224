//! C declarations of one model: group structs, family aggregates, solver
//! structs, the model struct and the per-group disk/RAM routines.

use super::CompiledModel;
use crate::integration::IntegrationPlan;
use crate::manifest::ModelDefinition;
use crate::schema::{ElementType, Family, GroupKind, Variable, VariableGroup};
use std::fmt::Write;

const INDENT: &str = "    ";

pub fn group_struct_name(model: &str, kind: GroupKind) -> String {
    format!("{model}_{}", kind.struct_name())
}

pub fn model_struct_name(model: &str) -> String {
    format!("{model}_Model")
}

/// Declared C type of a variable's value field.
pub fn field_type(kind: GroupKind, variable: &Variable) -> String {
    if kind.is_link() {
        format!("double *{}", "*".repeat(variable.ndim))
    } else {
        let element = variable.element.c_type();
        if variable.ndim == 0 {
            format!("{element} ")
        } else {
            format!("{element} {}", "*".repeat(variable.ndim))
        }
    }
}

fn groups_of(definition: &ModelDefinition, family: Family) -> impl Iterator<Item = &VariableGroup> {
    definition
        .groups()
        .iter()
        .filter(move |g| g.kind.family() == family && !g.is_empty())
}

/// Emit `body(element, flat_index)` once for every element of a variable.
///
/// Rank 0 variables are addressed directly with flat index `0`; higher ranks
/// loop over `i0`, `i1`, `i2` and count the flat index in `k`.
pub(crate) fn element_loop(
    out: &mut String,
    depth: usize,
    prefix: &str,
    name: &str,
    ndim: usize,
    body: &dyn Fn(&str, &str) -> Vec<String>,
) {
    if ndim == 0 {
        for line in body(&format!("{prefix}{name}"), "0") {
            let _ = writeln!(out, "{}{line}", INDENT.repeat(depth));
        }
        return;
    }
    let _ = writeln!(out, "{}k = 0;", INDENT.repeat(depth));
    let mut element = format!("{prefix}{name}");
    for axis in 0..ndim {
        let _ = writeln!(
            out,
            "{}for (i{axis} = 0; i{axis} < {prefix}_{name}_length_{axis}; i{axis}++) {{",
            INDENT.repeat(depth + axis)
        );
        let _ = write!(element, "[i{axis}]");
    }
    let inner = INDENT.repeat(depth + ndim);
    for line in body(&element, "k") {
        let _ = writeln!(out, "{inner}{line}");
    }
    let _ = writeln!(out, "{inner}k++;");
    for axis in (0..ndim).rev() {
        let _ = writeln!(out, "{}}}", INDENT.repeat(depth + axis));
    }
}

/// Loop counter declarations needed by [`element_loop`] for the given ranks.
pub(crate) fn loop_counters(ndims: impl IntoIterator<Item = usize>) -> String {
    let max = ndims.into_iter().max().unwrap_or(0);
    if max == 0 {
        return String::new();
    }
    let mut out = format!("{INDENT}int k;\n");
    for axis in 0..max {
        let _ = writeln!(out, "{INDENT}int i{axis};");
    }
    out
}

/// All struct declarations of `model`, in dependency order within the model.
pub fn structs(model: &CompiledModel) -> String {
    let definition = &model.definition;
    let name = model.name();
    let adaptive = model.plan.is_adaptive();
    let counts_calls = model.plan != IntegrationPlan::None;
    let mut out = String::new();

    for group in definition.groups().iter().filter(|g| !g.is_empty()) {
        group_struct(&mut out, name, group, adaptive);
    }
    if let Some(states) = definition.group(GroupKind::States).filter(|g| !g.is_empty()) {
        let _ = writeln!(out, "typedef struct {name}_OldStateSequences {{");
        for variable in &states.variables {
            let _ = writeln!(
                out,
                "{INDENT}{}{};",
                field_type(GroupKind::States, variable),
                variable.name
            );
        }
        let _ = writeln!(out, "}} {name}_OldStateSequences;\n");
    }
    for family in [Family::Parameters, Family::Sequences] {
        if !has_family(model, family) {
            continue;
        }
        let _ = writeln!(out, "typedef struct {name}_{} {{", family.struct_name());
        for group in groups_of(definition, family) {
            let _ = writeln!(
                out,
                "{INDENT}{} {};",
                group_struct_name(name, group.kind),
                group.kind.attr_name()
            );
        }
        if family == Family::Sequences && has_old_states(definition) {
            let _ = writeln!(out, "{INDENT}{name}_OldStateSequences old_states;");
        }
        let _ = writeln!(out, "}} {name}_{};\n", family.struct_name());
    }

    if adaptive {
        let _ = writeln!(
            out,
            "typedef struct {name}_NumConsts {{
    int nmb_methods;
    int nmb_stages;
    double dt_increase;
    double dt_decrease;
    int accepts_before_growth;
    double a_coefs[4][4][4];
}} {name}_NumConsts;
"
        );
    }
    if counts_calls {
        let _ = writeln!(
            out,
            "typedef struct {name}_NumVars {{
    int nmb_calls;
    int idx_method;
    int idx_stage;
    double t0;
    double t1;
    double dt;
    double dt_est;
    double abserror;
    double relerror;
    double last_abserror;
    double last_relerror;
    double extrapolated_abserror;
    double extrapolated_relerror;
    bool f0_ready;
    bool use_relerror;
    int nmb_accepted;
}} {name}_NumVars;
"
        );
    }

    let _ = writeln!(out, "typedef struct {} {{", model_struct_name(name));
    for family in [Family::Parameters, Family::Sequences] {
        if has_family(model, family) {
            let _ = writeln!(
                out,
                "{INDENT}{name}_{} {};",
                family.struct_name(),
                family.attr_name()
            );
        }
    }
    if adaptive {
        let _ = writeln!(out, "{INDENT}{name}_NumConsts numconsts;");
    }
    if counts_calls {
        let _ = writeln!(out, "{INDENT}{name}_NumVars numvars;");
    }
    for (attr, sub) in &model.submodels {
        let _ = writeln!(out, "{INDENT}{} {attr};", model_struct_name(sub.name()));
    }
    let _ = writeln!(out, "}} {};", model_struct_name(name));
    out
}

pub(crate) fn has_family(model: &CompiledModel, family: Family) -> bool {
    groups_of(&model.definition, family).next().is_some()
}

pub(crate) fn has_old_states(definition: &ModelDefinition) -> bool {
    definition
        .group(GroupKind::States)
        .is_some_and(|g| !g.is_empty())
}

fn group_struct(out: &mut String, model: &str, group: &VariableGroup, adaptive: bool) {
    let kind = group.kind;
    let struct_name = group_struct_name(model, kind);
    let _ = writeln!(out, "typedef struct {struct_name} {{");
    for variable in &group.variables {
        let x = &variable.name;
        let _ = writeln!(out, "{INDENT}{}{x};", field_type(kind, variable));
        if kind.family() == Family::Sequences {
            let _ = writeln!(out, "{INDENT}int _{x}_ndim;");
            let _ = writeln!(out, "{INDENT}int _{x}_length;");
            for axis in 0..variable.ndim {
                let _ = writeln!(out, "{INDENT}int _{x}_length_{axis};");
            }
        }
        if kind.is_io_capable() {
            let _ = writeln!(out, "{INDENT}bool _{x}_diskflag_reading;");
            let _ = writeln!(out, "{INDENT}bool _{x}_diskflag_writing;");
            let _ = writeln!(out, "{INDENT}char *_{x}_path;");
            let _ = writeln!(out, "{INDENT}FILE *_{x}_file;");
            let _ = writeln!(out, "{INDENT}bool _{x}_ramflag;");
            let _ = writeln!(out, "{INDENT}double *_{x}_array;");
        }
        if adaptive {
            for role in variable.buffer_roles(kind) {
                let _ = writeln!(out, "{INDENT}double *{};", role.field_name(x));
            }
        }
    }
    let _ = writeln!(out, "}} {struct_name};\n");
}

/// Disk/RAM routines of every I/O capable group plus the model-level wrappers.
///
/// Every routine returns zero on success. The model-level wrappers close all
/// files of the model (and its sub-models) before reporting a failure.
pub fn io_functions(model: &CompiledModel, exported: bool) -> String {
    let name = model.name();
    let linkage = if exported { "" } else { "static " };
    let groups: Vec<&VariableGroup> = model
        .definition
        .groups()
        .iter()
        .filter(|g| g.kind.is_io_capable() && !g.is_empty())
        .collect();
    let mut out = String::new();
    for group in &groups {
        group_io(&mut out, name, group);
    }

    let self_param = format!("{} *self", model_struct_name(name));

    let _ = writeln!(out, "{linkage}int {name}_close_files({self_param}) {{");
    for group in &groups {
        let _ = writeln!(
            out,
            "{INDENT}{}_close_files({});",
            group_struct_name(name, group.kind),
            group_access(group)
        );
    }
    for (attr, sub) in &model.submodels {
        let _ = writeln!(out, "{INDENT}{}_close_files(&self->{attr});", sub.name());
    }
    let _ = writeln!(out, "{INDENT}return 0;\n}}\n");

    for (routine, param, arg) in [
        ("open_files", "", ""),
        ("load_data", ", int idx", ", idx"),
        ("save_data", ", int idx", ", idx"),
    ] {
        let _ = writeln!(out, "{linkage}int {name}_{routine}({self_param}{param}) {{");
        let calls = groups
            .iter()
            .map(|g| {
                format!(
                    "{}_{routine}({}{arg})",
                    group_struct_name(name, g.kind),
                    group_access(g)
                )
            })
            .chain(
                model
                    .submodels
                    .iter()
                    .map(|(attr, sub)| format!("{}_{routine}(&self->{attr}{arg})", sub.name())),
            );
        for call in calls {
            let _ = writeln!(
                out,
                "{INDENT}if ({call} != 0) {{\n{INDENT}{INDENT}{name}_close_files(self);\n{INDENT}{INDENT}return 1;\n{INDENT}}}"
            );
        }
        let _ = writeln!(out, "{INDENT}return 0;\n}}\n");
    }
    out
}

fn group_access(group: &VariableGroup) -> String {
    format!(
        "&self->{}.{}",
        group.kind.family().attr_name(),
        group.kind.attr_name()
    )
}

fn group_io(out: &mut String, model: &str, group: &VariableGroup) {
    let struct_name = group_struct_name(model, group.kind);
    let counters = loop_counters(group.variables.iter().map(|v| v.ndim));

    let _ = writeln!(out, "static int {struct_name}_close_files({struct_name} *self) {{");
    for variable in &group.variables {
        let x = &variable.name;
        let _ = writeln!(
            out,
            "{INDENT}if (self->_{x}_file != NULL) {{\n{INDENT}{INDENT}fclose(self->_{x}_file);\n{INDENT}{INDENT}self->_{x}_file = NULL;\n{INDENT}}}"
        );
    }
    let _ = writeln!(out, "{INDENT}return 0;\n}}\n");

    let _ = writeln!(out, "static int {struct_name}_open_files({struct_name} *self) {{");
    for variable in &group.variables {
        let x = &variable.name;
        let _ = writeln!(
            out,
            "{INDENT}if (self->_{x}_diskflag_reading || self->_{x}_diskflag_writing) {{
{INDENT}{INDENT}const char *mode = self->_{x}_diskflag_reading ? (self->_{x}_diskflag_writing ? \"r+b\" : \"rb\") : \"wb\";
{INDENT}{INDENT}self->_{x}_file = fopen(self->_{x}_path, mode);
{INDENT}{INDENT}if (self->_{x}_file == NULL) {{
{INDENT}{INDENT}{INDENT}{struct_name}_close_files(self);
{INDENT}{INDENT}{INDENT}return 1;
{INDENT}{INDENT}}}
{INDENT}}}"
        );
    }
    let _ = writeln!(out, "{INDENT}return 0;\n}}\n");

    let _ = writeln!(out, "static int {struct_name}_load_data({struct_name} *self, int idx) {{");
    out.push_str(&counters);
    let _ = writeln!(out, "{INDENT}double value;");
    for variable in &group.variables {
        let x = variable.name.clone();
        let cast = cast_from_double(variable.element);
        let _ = writeln!(out, "{INDENT}if (self->_{x}_diskflag_reading) {{");
        seek(out, &x);
        element_loop(out, 2, "self->", &x, variable.ndim, &|element, _| {
            vec![
                format!("if (fread(&value, sizeof(double), 1, self->_{x}_file) != 1) {{"),
                format!("{INDENT}return 1;"),
                "}".to_string(),
                format!("{element} = {cast}value;"),
            ]
        });
        let _ = writeln!(out, "{INDENT}}} else if (self->_{x}_ramflag) {{");
        element_loop(out, 2, "self->", &x, variable.ndim, &|element, k| {
            vec![format!(
                "{element} = {cast}self->_{x}_array[idx * self->_{x}_length + {k}];"
            )]
        });
        let _ = writeln!(out, "{INDENT}}}");
    }
    let _ = writeln!(out, "{INDENT}return 0;\n}}\n");

    let _ = writeln!(out, "static int {struct_name}_save_data({struct_name} *self, int idx) {{");
    out.push_str(&counters);
    let _ = writeln!(out, "{INDENT}double value;");
    for variable in &group.variables {
        let x = variable.name.clone();
        let _ = writeln!(out, "{INDENT}if (self->_{x}_diskflag_writing) {{");
        seek(out, &x);
        element_loop(out, 2, "self->", &x, variable.ndim, &|element, _| {
            vec![
                format!("value = (double) {element};"),
                format!("if (fwrite(&value, sizeof(double), 1, self->_{x}_file) != 1) {{"),
                format!("{INDENT}return 1;"),
                "}".to_string(),
            ]
        });
        let _ = writeln!(out, "{INDENT}}}");
        let _ = writeln!(out, "{INDENT}if (self->_{x}_ramflag) {{");
        element_loop(out, 2, "self->", &x, variable.ndim, &|element, k| {
            vec![format!(
                "self->_{x}_array[idx * self->_{x}_length + {k}] = (double) {element};"
            )]
        });
        let _ = writeln!(out, "{INDENT}}}");
    }
    let _ = writeln!(out, "{INDENT}return 0;\n}}\n");
}

fn seek(out: &mut String, x: &str) {
    let _ = writeln!(
        out,
        "{INDENT}{INDENT}if (fseek(self->_{x}_file, (long) idx * self->_{x}_length * (long) sizeof(double), SEEK_SET) != 0) {{
{INDENT}{INDENT}{INDENT}return 1;
{INDENT}{INDENT}}}"
    );
}

fn cast_from_double(element: ElementType) -> &'static str {
    match element {
        ElementType::Float => "",
        ElementType::Int => "(int) ",
        ElementType::Bool => "(bool) ",
    }
}
