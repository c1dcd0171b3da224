//! C integration scaffold: initialisation, buffer helpers and the adaptive
//! explicit solver, parametrized by a model's PartODE and FullODE methods.
//!
//! The emitted solver follows the same algorithm as
//! [`AdaptiveSolver`](crate::solver::AdaptiveSolver); both must be changed together.

use super::declarations::{element_loop, has_old_states, loop_counters};
use super::lower::function_name;
use super::CompiledModel;
use crate::config::SolverConfig;
use crate::integration::{IntegrationPlan, NumConsts, EXTRAPOLATION_SENTINEL, TIME_EPSILON};
use crate::method::MethodKind;
use crate::schema::{BufferRole, GroupKind, Variable};
use std::fmt::Write;

const INDENT: &str = "    ";

/// Scaffold functions of `model`. Only the top-level model of a unit (`root`)
/// receives the solver, the method sequencers and `simulate`; sub-models get
/// initialisation and `new2old`.
pub fn scaffold(model: &CompiledModel, solver: &SolverConfig, root: bool) -> String {
    let mut emitter = Emitter {
        model,
        name: model.name(),
        linkage: if root { "" } else { "static " },
        out: String::new(),
    };
    if model.plan.is_adaptive() {
        emitter.init_numconsts(solver);
    }
    emitter.init(solver);
    emitter.new2old();
    if root {
        emitter.sequencers();
        match model.plan {
            IntegrationPlan::Adaptive => {
                emitter.allocation();
                emitter.buffer_helpers();
                emitter.adaptive_solve();
            }
            IntegrationPlan::Direct => emitter.direct_solve(),
            IntegrationPlan::None => emitter.empty_solve(),
        }
        emitter.simulate();
    }
    emitter.out
}

struct Emitter<'a> {
    model: &'a CompiledModel,
    name: &'a str,
    linkage: &'static str,
    out: String,
}

impl Emitter<'_> {
    fn func(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.name)
    }

    fn open(&mut self, return_type: &str, suffix: &str, exported: bool, params: &str) {
        let linkage = if exported { self.linkage } else { "static " };
        let _ = writeln!(
            self.out,
            "{linkage}{return_type} {}({}_Model *self{params}) {{",
            self.func(suffix),
            self.name
        );
    }

    fn close(&mut self) {
        self.out.push_str("}\n\n");
    }

    fn line(&mut self, depth: usize, text: &str) {
        let _ = writeln!(self.out, "{}{text}", INDENT.repeat(depth));
    }

    fn numeric(&self, kind: GroupKind) -> Vec<Variable> {
        self.model
            .definition
            .group(kind)
            .map(|g| g.numeric_variables().cloned().collect())
            .unwrap_or_default()
    }

    fn init_numconsts(&mut self, solver: &SolverConfig) {
        let consts = NumConsts::from_config(solver);
        self.open("void", "init_numconsts", false, "");
        self.line(1, "memset(self->numconsts.a_coefs, 0, sizeof(self->numconsts.a_coefs));");
        self.line(1, &format!("self->numconsts.nmb_methods = {};", consts.nmb_methods));
        self.line(1, &format!("self->numconsts.nmb_stages = {};", consts.nmb_stages));
        self.line(1, &format!("self->numconsts.dt_increase = {:?};", consts.dt_increase));
        self.line(1, &format!("self->numconsts.dt_decrease = {:?};", consts.dt_decrease));
        self.line(
            1,
            &format!(
                "self->numconsts.accepts_before_growth = {};",
                consts.accepts_before_growth
            ),
        );
        for ((method, stage, term), value) in consts.a_coefs.indexed_iter() {
            if *value != 0.0 {
                self.line(
                    1,
                    &format!("self->numconsts.a_coefs[{method}][{stage}][{term}] = {value:?};"),
                );
            }
        }
        self.close();
    }

    fn init(&mut self, solver: &SolverConfig) {
        self.open("void", "init", true, "");
        if self.model.plan.is_adaptive() {
            self.line(1, &format!("{}(self);", self.func("init_numconsts")));
        }
        let numvars = if self.model.plan == IntegrationPlan::None {
            Vec::new()
        } else {
            vec![
                ("nmb_calls", "0".to_string()),
                ("idx_method", "0".to_string()),
                ("idx_stage", "0".to_string()),
                ("t0", "0.0".to_string()),
                ("t1", "1.0".to_string()),
                ("dt", "1.0".to_string()),
                ("dt_est", "1.0".to_string()),
                ("abserror", "0.0".to_string()),
                ("relerror", "0.0".to_string()),
                ("last_abserror", "INFINITY".to_string()),
                ("last_relerror", "INFINITY".to_string()),
                ("extrapolated_abserror", format!("{EXTRAPOLATION_SENTINEL:?}")),
                ("extrapolated_relerror", format!("{EXTRAPOLATION_SENTINEL:?}")),
                ("f0_ready", "false".to_string()),
                ("use_relerror", "false".to_string()),
                ("nmb_accepted", "0".to_string()),
            ]
        };
        for (field, value) in numvars {
            self.line(1, &format!("self->numvars.{field} = {value};"));
        }
        if self.model.plan.is_adaptive() {
            let rel = solver
                .rel_error_max
                .map(|v| format!("{v:?}"))
                .unwrap_or_else(|| "NAN".to_string());
            for (field, value) in [
                ("abserrormax", format!("{:?}", solver.abs_error_max)),
                ("relerrormax", rel),
                ("reldtmin", format!("{:?}", solver.rel_dt_min)),
                ("reldtmax", format!("{:?}", solver.rel_dt_max)),
            ] {
                self.line(1, &format!("self->parameters.solver.{field} = {value};"));
            }
        }
        let model = self.model;
        let adaptive = model.plan.is_adaptive();
        for group in model.definition.groups() {
            let kind = group.kind;
            let prefix = format!("self->sequences.{}.", kind.attr_name());
            for variable in &group.variables {
                let x = &variable.name;
                if kind.is_io_capable() {
                    self.line(1, &format!("{prefix}_{x}_diskflag_reading = false;"));
                    self.line(1, &format!("{prefix}_{x}_diskflag_writing = false;"));
                    self.line(1, &format!("{prefix}_{x}_ramflag = false;"));
                    self.line(1, &format!("{prefix}_{x}_file = NULL;"));
                }
                if adaptive {
                    for role in variable.buffer_roles(kind) {
                        self.line(1, &format!("{prefix}{} = NULL;", role.field_name(x)));
                    }
                }
            }
        }
        for (attr, sub) in &model.submodels {
            self.line(1, &format!("{}_init(&self->{attr});", sub.name()));
        }
        self.close();
    }

    fn new2old(&mut self) {
        self.open("void", "new2old", true, "");
        if has_old_states(&self.model.definition) {
            let states = self
                .model
                .definition
                .group(GroupKind::States)
                .map(|g| g.variables.clone())
                .unwrap_or_default();
            self.out
                .push_str(&loop_counters(states.iter().map(|v| v.ndim)));
            for variable in &states {
                element_loop(
                    &mut self.out,
                    1,
                    "self->sequences.states.",
                    &variable.name,
                    variable.ndim,
                    &|element, _| {
                        let old = element.replacen("sequences.states.", "sequences.old_states.", 1);
                        vec![format!("{old} = {element};")]
                    },
                );
            }
        }
        let model = self.model;
        for (attr, sub) in &model.submodels {
            self.line(1, &format!("{}_new2old(&self->{attr});", sub.name()));
        }
        self.close();
    }

    /// `run`, the link updates and the term calculators.
    fn sequencers(&mut self) {
        let model = self.model;
        for (suffix, kind) in [
            ("update_inlets", MethodKind::Inlet),
            ("run", MethodKind::Run),
            ("update_outlets", MethodKind::Outlet),
            ("update_receivers", MethodKind::Receiver),
            ("update_senders", MethodKind::Sender),
        ] {
            self.open("void", suffix, true, "");
            for method in model.methods_of(kind) {
                self.line(1, &format!("{}(self);", function_name(self.name, &method.method.name)));
            }
            self.close();
        }
        if model.plan == IntegrationPlan::None {
            return;
        }
        self.open("void", "calculate_single_terms", false, "");
        self.line(1, "self->numvars.nmb_calls++;");
        for method in model.methods_of(MethodKind::PartOde) {
            self.line(1, &format!("{}(self);", function_name(self.name, &method.method.name)));
        }
        self.close();
        self.open("void", "calculate_full_terms", false, "");
        for method in model.methods_of(MethodKind::FullOde) {
            self.line(1, &format!("{}(self);", function_name(self.name, &method.method.name)));
        }
        self.close();
    }

    fn allocation(&mut self) {
        let buffers: Vec<(GroupKind, Variable)> = [GroupKind::Fluxes, GroupKind::States]
            .into_iter()
            .flat_map(|kind| self.numeric(kind).into_iter().map(move |v| (kind, v)))
            .collect();

        self.open("void", "free_numerics", true, "");
        for (kind, variable) in &buffers {
            let prefix = format!("self->sequences.{}.", kind.attr_name());
            for role in variable.buffer_roles(*kind) {
                let field = format!("{prefix}{}", role.field_name(&variable.name));
                self.line(1, &format!("free({field});"));
                self.line(1, &format!("{field} = NULL;"));
            }
        }
        self.close();

        self.open("int", "allocate_numerics", true, "");
        for (kind, variable) in &buffers {
            let prefix = format!("self->sequences.{}.", kind.attr_name());
            for role in variable.buffer_roles(*kind) {
                let rows = match role {
                    BufferRole::Points => "(self->numconsts.nmb_stages + 1) * ",
                    BufferRole::Results => "(self->numconsts.nmb_methods + 1) * ",
                    BufferRole::Integrals | BufferRole::Sum => "",
                };
                let field = format!("{prefix}{}", role.field_name(&variable.name));
                self.line(
                    1,
                    &format!(
                        "{field} = (double *) calloc((size_t) ({rows}{prefix}_{}_length), sizeof(double));",
                        variable.name
                    ),
                );
                self.line(1, &format!("if ({field} == NULL) {{"));
                self.line(2, &format!("{}(self);", self.func("free_numerics")));
                self.line(2, "return 1;");
                self.line(1, "}");
            }
        }
        self.line(1, "return 0;");
        self.close();
    }

    fn buffer_helpers(&mut self) {
        let fluxes = self.numeric(GroupKind::Fluxes);
        let states = self.numeric(GroupKind::States);

        for (suffix, kind, variables, role, index) in [
            ("set_point_states", GroupKind::States, &states, "points", "self->numvars.idx_stage"),
            ("set_point_fluxes", GroupKind::Fluxes, &fluxes, "points", "self->numvars.idx_stage"),
            ("set_result_states", GroupKind::States, &states, "results", "self->numvars.idx_method"),
            ("set_result_fluxes", GroupKind::Fluxes, &fluxes, "results", "self->numvars.idx_method"),
        ] {
            self.buffer_routine(suffix, kind, variables, &|p, x, element, k| {
                vec![format!("{p}_{x}_{role}[{index} * {p}_{x}_length + {k}] = {element};")]
            });
        }

        self.open("void", "integrate_fluxes", false, "");
        self.line(1, "int jdx;");
        self.out.push_str(&loop_counters(fluxes.iter().map(|v| v.ndim)));
        for variable in &fluxes {
            let p = "self->sequences.fluxes.";
            let x = variable.name.clone();
            element_loop(&mut self.out, 1, p, &x, variable.ndim, &|element, k| {
                vec![
                    format!("{element} = 0.0;"),
                    "for (jdx = 0; jdx < self->numvars.idx_stage; jdx++) {".to_string(),
                    format!("{INDENT}{element} += self->numconsts.a_coefs[self->numvars.idx_method - 1][self->numvars.idx_stage - 1][jdx] * {p}_{x}_points[jdx * {p}_{x}_length + {k}];"),
                    "}".to_string(),
                    format!("{element} = self->numvars.dt * {element};"),
                    format!("{p}_{x}_integrals[{k}] = {element};"),
                ]
            });
        }
        self.close();

        self.buffer_routine("reset_sum_fluxes", GroupKind::Fluxes, &fluxes, &|p, x, _, k| {
            vec![format!("{p}_{x}_sum[{k}] = 0.0;")]
        });
        self.buffer_routine("addup_fluxes", GroupKind::Fluxes, &fluxes, &|p, x, _, k| {
            vec![format!("{p}_{x}_sum[{k}] += {p}_{x}_integrals[{k}];")]
        });
        self.buffer_routine("get_sum_fluxes", GroupKind::Fluxes, &fluxes, &|p, x, element, k| {
            vec![format!("{element} = {p}_{x}_sum[{k}];")]
        });

        self.open("void", "calculate_error", false, "");
        self.line(1, "double diff;");
        self.line(1, "double result;");
        self.out.push_str(&loop_counters(fluxes.iter().map(|v| v.ndim)));
        self.line(1, "self->numvars.abserror = 0.0;");
        self.line(1, "self->numvars.relerror = 0.0;");
        for variable in &fluxes {
            let p = "self->sequences.fluxes.";
            let x = variable.name.clone();
            element_loop(&mut self.out, 1, p, &x, variable.ndim, &|_, k| {
                vec![
                    format!("result = {p}_{x}_results[self->numvars.idx_method * {p}_{x}_length + {k}];"),
                    format!("diff = fabs(result - {p}_{x}_results[(self->numvars.idx_method - 1) * {p}_{x}_length + {k}]);"),
                    "self->numvars.abserror = fmax(self->numvars.abserror, diff);".to_string(),
                    "if (self->numvars.use_relerror) {".to_string(),
                    format!("{INDENT}if (result == 0.0) {{"),
                    format!("{INDENT}{INDENT}self->numvars.relerror = INFINITY;"),
                    format!("{INDENT}}} else {{"),
                    format!("{INDENT}{INDENT}self->numvars.relerror = fmax(self->numvars.relerror, fabs(diff / result));"),
                    format!("{INDENT}}}"),
                    "}".to_string(),
                ]
            });
        }
        self.close();

        self.open("void", "extrapolate_error", false, "");
        let sentinel = format!("{EXTRAPOLATION_SENTINEL:?}");
        for which in ["abserror", "relerror"] {
            self.line(1, "if (self->numvars.idx_method <= 2) {");
            self.line(2, &format!("self->numvars.extrapolated_{which} = {sentinel};"));
            self.line(1, &format!("}} else if (self->numvars.{which} > 0.0) {{"));
            self.line(
                2,
                &format!(
                    "self->numvars.extrapolated_{which} = exp(log(self->numvars.{which}) + (log(self->numvars.{which}) - log(self->numvars.last_{which})) * (self->numconsts.nmb_methods - self->numvars.idx_method));"
                ),
            );
            self.line(1, &format!("}} else if (self->numvars.{which} == 0.0) {{"));
            self.line(2, &format!("self->numvars.extrapolated_{which} = 0.0;"));
            self.line(1, "} else {");
            self.line(2, &format!("self->numvars.extrapolated_{which} = {sentinel};"));
            self.line(1, "}");
        }
        self.close();

        self.open("void", "accept_step", false, "");
        self.line(1, &format!("{}(self);", self.func("addup_fluxes")));
        self.line(1, "self->numvars.t0 += self->numvars.dt;");
        self.line(1, &format!("{}(self);", self.func("new2old")));
        self.line(1, "self->numvars.f0_ready = false;");
        self.line(1, "self->numvars.nmb_accepted++;");
        self.line(1, "if (self->numvars.nmb_accepted >= self->numconsts.accepts_before_growth) {");
        self.line(2, "self->numvars.dt_est = fmin(fmax(self->numvars.dt_est, self->numvars.dt) * self->numconsts.dt_increase, self->parameters.solver.reldtmax);");
        self.line(1, "}");
        self.close();

        self.open("void", "reject_step", false, "");
        self.line(1, "self->numvars.dt_est = fmax(self->numvars.dt / self->numconsts.dt_decrease, self->parameters.solver.reldtmin);");
        self.line(1, "self->numvars.f0_ready = true;");
        self.line(1, "self->numvars.nmb_accepted = 0;");
        self.close();
    }

    fn buffer_routine(
        &mut self,
        suffix: &str,
        kind: GroupKind,
        variables: &[Variable],
        body: &dyn Fn(&str, &str, &str, &str) -> Vec<String>,
    ) {
        self.open("void", suffix, false, "");
        self.out
            .push_str(&loop_counters(variables.iter().map(|v| v.ndim)));
        let prefix = format!("self->sequences.{}.", kind.attr_name());
        for variable in variables {
            let x = variable.name.as_str();
            element_loop(&mut self.out, 1, &prefix, x, variable.ndim, &|element, k| {
                body(&prefix, x, element, k)
            });
        }
        self.close();
    }

    fn adaptive_solve(&mut self) {
        let f = |suffix: &str| format!("{}(self);", self.func(suffix));
        let (single, full) = (f("calculate_single_terms"), f("calculate_full_terms"));
        let (point_states, point_fluxes) = (f("set_point_states"), f("set_point_fluxes"));
        let (result_states, result_fluxes) = (f("set_result_states"), f("set_result_fluxes"));
        let (accept, reject) = (f("accept_step"), f("reject_step"));
        let body = format!(
            "    {n}_NumVars *v = &self->numvars;
    bool decided;
    v->nmb_calls = 0;
    v->use_relerror = !isnan(self->parameters.solver.relerrormax);
    v->t0 = 0.0;
    v->t1 = 1.0;
    v->dt_est = self->parameters.solver.reldtmax;
    v->f0_ready = false;
    v->nmb_accepted = 0;
    {reset}
    while (v->t0 < v->t1 - {eps:e}) {{
        v->dt = fmin(v->t1 - v->t0, fmin(self->parameters.solver.reldtmax, fmax(v->dt_est, self->parameters.solver.reldtmin)));
        if (!v->f0_ready) {{
            {single}
            v->idx_stage = 0;
            {point_states}
            {point_fluxes}
            v->f0_ready = true;
        }}
        v->last_abserror = INFINITY;
        v->last_relerror = INFINITY;
        decided = false;
        for (v->idx_method = 1; v->idx_method <= self->numconsts.nmb_methods; v->idx_method++) {{
            for (v->idx_stage = 1; v->idx_stage <= v->idx_method; v->idx_stage++) {{
                {integrate}
                {full}
                {point_states}
                if (v->idx_stage < v->idx_method) {{
                    {single}
                    {point_fluxes}
                }}
            }}
            {result_fluxes}
            {result_states}
            if (v->idx_method >= 2) {{
                {error}
                {extrapolate}
                if ((v->abserror <= self->parameters.solver.abserrormax) || (v->use_relerror && (v->relerror <= self->parameters.solver.relerrormax))) {{
                    {accept}
                    decided = true;
                    break;
                }}
                if ((v->dt > self->parameters.solver.reldtmin) && (v->extrapolated_abserror > self->parameters.solver.abserrormax) && (!v->use_relerror || (v->extrapolated_relerror > self->parameters.solver.relerrormax))) {{
                    {reject}
                    decided = true;
                    break;
                }}
                v->last_abserror = v->abserror;
                v->last_relerror = v->relerror;
            }}
        }}
        if (!decided) {{
            if (v->dt <= self->parameters.solver.reldtmin) {{
                {accept}
            }} else {{
                {reject}
            }}
        }}
    }}
    {sums}
",
            n = self.name,
            eps = TIME_EPSILON,
            reset = f("reset_sum_fluxes"),
            integrate = f("integrate_fluxes"),
            error = f("calculate_error"),
            extrapolate = f("extrapolate_error"),
            sums = f("get_sum_fluxes"),
        );
        self.open("void", "solve", true, "");
        self.out.push_str(&body);
        self.close();
    }

    fn direct_solve(&mut self) {
        self.open("void", "solve", true, "");
        self.line(1, "self->numvars.nmb_calls = 0;");
        self.line(1, &format!("{}(self);", self.func("calculate_single_terms")));
        self.line(1, &format!("{}(self);", self.func("calculate_full_terms")));
        self.close();
    }

    fn empty_solve(&mut self) {
        self.open("void", "solve", true, "");
        self.close();
    }

    fn simulate(&mut self) {
        self.open("int", "simulate", true, ", int idx");
        self.line(1, &format!("if ({}(self, idx) != 0) {{", self.func("load_data")));
        self.line(2, "return 1;");
        self.line(1, "}");
        for suffix in ["update_inlets", "solve", "run", "update_outlets", "new2old"] {
            self.line(1, &format!("{}(self);", self.func(suffix)));
        }
        self.line(1, &format!("if ({}(self, idx) != 0) {{", self.func("save_data")));
        self.line(2, "return 1;");
        self.line(1, "}");
        self.line(1, "return 0;");
        self.close();
    }
}
