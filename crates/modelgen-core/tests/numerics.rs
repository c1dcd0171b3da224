//! Numerical tests of the adaptive explicit solver.
//!
//! These tests verify the convergence behaviour of the Runge-Kutta family and
//! compare complete simulations of an exponential decay model against an
//! independent Dormand-Prince integration.

use approx::assert_relative_eq;
use modelgen_core::config::{GeneratorConfig, SolverConfig};
use modelgen_core::errors::ModelgenResult;
use modelgen_core::manifest::{ModelDefinition, SourceFile};
use modelgen_core::method::MethodKind;
use modelgen_core::runtime::ReferenceModel;
use modelgen_core::schema::{GroupKind, Variable, VariableGroup};
use modelgen_core::solver::{AdaptiveSolver, OdeModel};
use ode_solvers::{Dopri5, System, Vector1};

const DECAY: &str = r#"
def calc_dy(model):
    con = model.parameters.control.fastaccess
    flu = model.sequences.fluxes.fastaccess
    new = model.sequences.states.fastaccess
    flu.dy = -con.k * new.y

def update_y(model):
    flu = model.sequences.fluxes.fastaccess
    old = model.sequences.old_states.fastaccess
    new = model.sequences.states.fastaccess
    new.y = old.y + flu.dy
"#;

/// dy/dt = -k y, integrated in-process.
struct Decay {
    k: f64,
    old: f64,
    new: f64,
    flux: f64,
}

impl Decay {
    fn new(k: f64) -> Self {
        Self {
            k,
            old: 1.0,
            new: 1.0,
            flux: 0.0,
        }
    }
}

impl OdeModel for Decay {
    fn calculate_single_terms(&mut self) -> ModelgenResult<()> {
        self.flux = -self.k * self.new;
        Ok(())
    }

    fn calculate_full_terms(&mut self) -> ModelgenResult<()> {
        self.new = self.old + self.flux;
        Ok(())
    }

    fn fluxes(&self) -> ModelgenResult<Vec<f64>> {
        Ok(vec![self.flux])
    }

    fn set_fluxes(&mut self, values: &[f64]) -> ModelgenResult<()> {
        self.flux = values[0];
        Ok(())
    }

    fn states(&self) -> ModelgenResult<Vec<f64>> {
        Ok(vec![self.new])
    }

    fn new2old(&mut self) -> ModelgenResult<()> {
        self.old = self.new;
        Ok(())
    }
}

/// The same decay as an `ode_solvers` system.
struct DecayRate(f64);

impl System<f64, Vector1<f64>> for DecayRate {
    fn system(&self, _t: f64, y: &Vector1<f64>, dy: &mut Vector1<f64>) {
        dy[0] = -self.0 * y[0];
    }
}

/// Value at `t_end`; the output grid spacing equals `t_end` so the last
/// dense output sample lies exactly on it.
fn dopri5(k: f64, t_end: f64) -> f64 {
    let mut stepper =
        Dopri5::new(DecayRate(k), 0.0, t_end, t_end, Vector1::new(1.0), 1e-12, 1e-12);
    stepper.integrate().unwrap();
    assert_relative_eq!(*stepper.x_out().last().unwrap(), t_end, epsilon = 1e-12);
    stepper.y_out().last().unwrap()[0]
}

fn decay_model(k: f64, solver: &SolverConfig) -> ReferenceModel {
    let definition = ModelDefinition::builder("decay")
        .source(SourceFile::new("models/decay.mdl", DECAY))
        .group(VariableGroup::new(GroupKind::Control).variable(Variable::float("k")))
        .group(VariableGroup::new(GroupKind::Fluxes).variable(Variable::float("dy").numeric()))
        .group(VariableGroup::new(GroupKind::States).variable(Variable::float("y").numeric()))
        .method(MethodKind::PartOde, "calc_dy")
        .method(MethodKind::FullOde, "update_y")
        .build()
        .unwrap();
    let mut model = ReferenceModel::new(&definition, &GeneratorConfig::default(), solver).unwrap();
    let instance = model.instance_mut();
    instance.set_scalar("control.k", k).unwrap();
    instance.set_scalar("states.y", 1.0).unwrap();
    instance.set_scalar("old_states.y", 1.0).unwrap();
    model
}

mod convergence {
    use super::*;

    /// The difference between methods of order `p` and `p - 1` scales with
    /// `dt^p`, so doubling the step multiplies it by `2^p`.
    #[test]
    fn test_order_errors_scale_with_step_size() {
        let config = SolverConfig::default();
        let dt = 0.05;
        let small = AdaptiveSolver::new(&config)
            .unwrap()
            .order_errors(&mut Decay::new(1.0), dt)
            .unwrap();
        let large = AdaptiveSolver::new(&config)
            .unwrap()
            .order_errors(&mut Decay::new(1.0), 2.0 * dt)
            .unwrap();
        assert_eq!(small.len(), 3);
        for (idx, (s, l)) in small.iter().zip(&large).enumerate() {
            let order = idx as i32 + 2;
            assert_relative_eq!(l / s, 2f64.powi(order), max_relative = 1e-6);
        }
    }

    #[test]
    fn test_higher_orders_have_smaller_errors() {
        let errors = AdaptiveSolver::new(&SolverConfig::default())
            .unwrap()
            .order_errors(&mut Decay::new(1.0), 0.1)
            .unwrap();
        for pair in errors.windows(2) {
            assert!(pair[1] < pair[0], "errors {errors:?} are not decreasing");
        }
        assert_relative_eq!(errors[0], 0.005, max_relative = 1e-9);
    }

    #[test]
    fn test_tighter_tolerances_are_more_accurate() {
        let exact = (-2f64).exp();
        let mut errors = Vec::new();
        let mut calls = Vec::new();
        for tolerance in [1e-2, 1e-4, 1e-6] {
            let config = SolverConfig::default()
                .with_abs_error_max(tolerance)
                .with_rel_dt_min(1e-6);
            let mut solver = AdaptiveSolver::new(&config).unwrap();
            let mut model = Decay::new(2.0);
            solver.solve(&mut model).unwrap();
            errors.push((model.new - exact).abs());
            calls.push(solver.vars.nmb_calls);
        }
        assert!(errors[2] < errors[0]);
        assert!(calls[2] > calls[0]);
        assert!(errors[2] < 1e-5);
    }
}

mod step_control {
    use super::*;

    #[test]
    fn test_accepted_steps_cover_the_macro_step() {
        let config = SolverConfig::default()
            .with_abs_error_max(1e-7)
            .with_rel_dt_min(1e-5);
        let mut solver = AdaptiveSolver::new(&config).unwrap();
        solver.solve(&mut Decay::new(4.0)).unwrap();
        let accepted: Vec<_> = solver.trace().iter().filter(|r| r.accepted).collect();
        assert_relative_eq!(accepted.iter().map(|r| r.dt).sum::<f64>(), 1.0, epsilon = 1e-12);
        for pair in accepted.windows(2) {
            assert_relative_eq!(pair[0].t0 + pair[0].dt, pair[1].t0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_steps_stay_within_bounds() {
        let config = SolverConfig::default()
            .with_abs_error_max(1e-9)
            .with_rel_dt_min(0.01)
            .with_rel_dt_max(0.25);
        let mut solver = AdaptiveSolver::new(&config).unwrap();
        solver.solve(&mut Decay::new(3.0)).unwrap();
        for record in solver.trace() {
            assert!(record.dt <= 0.25 + 1e-15);
            assert!(record.dt >= 0.01 - 1e-15 || record.t0 + record.dt >= 1.0 - 1e-12);
            assert!(record.dt_est >= 0.01 - 1e-15 && record.dt_est <= 0.25 + 1e-15);
        }
    }
}

mod reference_simulation {
    use super::*;

    #[test]
    fn test_single_step_matches_the_exact_solution() {
        let config = SolverConfig::default().with_abs_error_max(1e-6);
        let mut model = decay_model(1.0, &config);
        model.simulate(0).unwrap();
        let instance = model.instance();
        let y = instance.scalar("states.y").unwrap();
        assert_relative_eq!(y, (-1f64).exp(), epsilon = 1e-5);
        assert_relative_eq!(instance.scalar("old_states.y").unwrap(), y);
        // the flux holds the change over the whole macro step
        assert_relative_eq!(instance.scalar("fluxes.dy").unwrap(), y - 1.0, epsilon = 1e-12);
        assert!(model.solver().vars.nmb_calls > 0);
    }

    #[test]
    fn test_call_counter_restarts_every_step() {
        let config = SolverConfig::default().with_abs_error_max(1e-6);
        let mut model = decay_model(1.0, &config);
        let mut calls = Vec::new();
        for idx in 0..3 {
            model.simulate(idx).unwrap();
            calls.push(model.solver().vars.nmb_calls);
        }
        assert!(calls[0] > 0);
        // steps with smaller states need no more work than the first one
        for later in &calls[1..] {
            assert!(*later <= calls[0], "calls {calls:?} accumulate across steps");
        }
    }

    #[test]
    fn test_simulation_tracks_dormand_prince() {
        let config = SolverConfig::default().with_abs_error_max(1e-7);
        for k in [0.5, 3.0] {
            let mut model = decay_model(k, &config);
            for idx in 0..5 {
                model.simulate(idx).unwrap();
                let expected = dopri5(k, (idx + 1) as f64);
                let y = model.instance().scalar("states.y").unwrap();
                assert_relative_eq!(y, expected, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_solver_parameters_are_written_to_the_instance() {
        let config = SolverConfig::default()
            .with_abs_error_max(1e-4)
            .with_rel_error_max(Some(1e-3));
        let model = decay_model(1.0, &config);
        let instance = model.instance();
        assert_eq!(instance.scalar("solver.abserrormax").unwrap(), 1e-4);
        assert_eq!(instance.scalar("solver.relerrormax").unwrap(), 1e-3);
        assert_eq!(instance.scalar("solver.reldtmin").unwrap(), config.rel_dt_min);
    }
}
