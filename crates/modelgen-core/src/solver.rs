//! The adaptive explicit solver of the reference runtime.
//!
//! The algorithm is the one emitted into generated units by
//! [`scaffold`](crate::codegen::scaffold::scaffold): every trial step evaluates
//! Runge-Kutta methods of increasing order, estimates the local error from two
//! successive orders and accepts, rejects or escalates the order. One macro
//! step spans the relative time interval `[0, 1]`.

use crate::config::SolverConfig;
use crate::errors::ModelgenResult;
use crate::integration::{extrapolate, NumConsts, NumVars, TIME_EPSILON};
use tracing::{debug, warn};

/// A model advanced by [`AdaptiveSolver`].
///
/// Fluxes and states are exchanged as flat vectors over the numerically
/// integrated variables.
pub trait OdeModel {
    /// Evaluate the PartODE methods at the current states.
    fn calculate_single_terms(&mut self) -> ModelgenResult<()>;
    /// Apply the FullODE methods, updating states from the current fluxes.
    fn calculate_full_terms(&mut self) -> ModelgenResult<()>;
    fn fluxes(&self) -> ModelgenResult<Vec<f64>>;
    fn set_fluxes(&mut self, values: &[f64]) -> ModelgenResult<()>;
    fn states(&self) -> ModelgenResult<Vec<f64>>;
    fn new2old(&mut self) -> ModelgenResult<()>;
}

/// Outcome of one trial step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepRecord {
    /// Start of the trial step within the macro step.
    pub t0: f64,
    pub dt: f64,
    /// Highest method order evaluated.
    pub order: usize,
    pub accepted: bool,
    pub abserror: f64,
    /// Step size estimate after the decision.
    pub dt_est: f64,
}

#[derive(Debug, Clone, Default)]
struct Buffers {
    flux_points: Vec<Vec<f64>>,
    state_points: Vec<Vec<f64>>,
    flux_results: Vec<Vec<f64>>,
    state_results: Vec<Vec<f64>>,
    integrals: Vec<f64>,
    sum: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct AdaptiveSolver {
    pub consts: NumConsts,
    pub vars: NumVars,
    config: SolverConfig,
    buffers: Buffers,
    trace: Vec<StepRecord>,
}

impl AdaptiveSolver {
    /// Fails when `config` does not pass [`SolverConfig::validate`].
    pub fn new(config: &SolverConfig) -> ModelgenResult<Self> {
        config.validate()?;
        Ok(Self {
            consts: NumConsts::from_config(config),
            vars: NumVars::default(),
            config: config.clone(),
            buffers: Buffers::default(),
            trace: Vec::new(),
        })
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Trial steps of the most recent macro step.
    pub fn trace(&self) -> &[StepRecord] {
        &self.trace
    }

    /// Evaluate the PartODE methods once, counting the call.
    pub fn single_terms(&mut self, model: &mut dyn OdeModel) -> ModelgenResult<()> {
        self.vars.nmb_calls += 1;
        model.calculate_single_terms()
    }

    /// Advance a model without numerically integrated variables: PartODE
    /// once, then FullODE once.
    pub fn solve_direct(&mut self, model: &mut dyn OdeModel) -> ModelgenResult<()> {
        self.vars.nmb_calls = 0;
        self.single_terms(model)?;
        model.calculate_full_terms()
    }

    /// Advance `model` over one macro step. On return the model's fluxes hold
    /// their integrals over the whole step and `nmb_calls` counts the PartODE
    /// evaluations of this step only.
    pub fn solve(&mut self, model: &mut dyn OdeModel) -> ModelgenResult<()> {
        self.trace.clear();
        self.vars.nmb_calls = 0;
        self.vars.use_relerror = self.config.rel_error_max.is_some();
        self.vars.t0 = 0.0;
        self.vars.t1 = 1.0;
        self.vars.dt_est = self.config.rel_dt_max;
        self.vars.f0_ready = false;
        self.vars.nmb_accepted = 0;
        let nmb_fluxes = model.fluxes()?.len();
        self.buffers.sum = vec![0.0; nmb_fluxes];

        while self.vars.t0 < self.vars.t1 - TIME_EPSILON {
            self.vars.dt = (self.vars.t1 - self.vars.t0)
                .min(self.config.rel_dt_max.min(self.vars.dt_est.max(self.config.rel_dt_min)));
            if !self.vars.f0_ready {
                self.start_point(model)?;
            }
            self.vars.last_abserror = f64::INFINITY;
            self.vars.last_relerror = f64::INFINITY;
            let t0 = self.vars.t0;
            let mut decided = None;
            for order in 1..=self.consts.nmb_methods {
                self.try_order(model, order)?;
                if order < 2 {
                    continue;
                }
                self.calculate_error();
                self.vars.extrapolated_abserror = extrapolate(
                    self.vars.abserror,
                    self.vars.last_abserror,
                    self.consts.nmb_methods,
                    order,
                );
                self.vars.extrapolated_relerror = extrapolate(
                    self.vars.relerror,
                    self.vars.last_relerror,
                    self.consts.nmb_methods,
                    order,
                );
                if self.within_tolerance() {
                    self.accept_step(model)?;
                    decided = Some((order, true));
                    break;
                }
                if self.should_shrink() {
                    self.reject_step();
                    decided = Some((order, false));
                    break;
                }
                self.vars.last_abserror = self.vars.abserror;
                self.vars.last_relerror = self.vars.relerror;
            }
            let (order, accepted) = match decided {
                Some(decision) => decision,
                None if self.vars.dt <= self.config.rel_dt_min => {
                    warn!(
                        dt = self.vars.dt,
                        abserror = self.vars.abserror,
                        "Accepting a step at the minimum step size without meeting the tolerance"
                    );
                    self.accept_step(model)?;
                    (self.consts.nmb_methods, true)
                }
                None => {
                    self.reject_step();
                    (self.consts.nmb_methods, false)
                }
            };
            self.trace.push(StepRecord {
                t0,
                dt: self.vars.dt,
                order,
                accepted,
                abserror: self.vars.abserror,
                dt_est: self.vars.dt_est,
            });
        }
        model.set_fluxes(&self.buffers.sum)?;
        debug!(
            steps = self.trace.len(),
            calls = self.vars.nmb_calls,
            "Finished macro step"
        );
        Ok(())
    }

    /// Absolute errors of orders `2..=nmb_methods` for a single trial step of
    /// size `dt` from the model's current states, element `i` belonging to
    /// order `i + 2`. The model is left at the end of the highest order.
    pub fn order_errors(&mut self, model: &mut dyn OdeModel, dt: f64) -> ModelgenResult<Vec<f64>> {
        self.vars.dt = dt;
        self.vars.use_relerror = false;
        self.start_point(model)?;
        let mut errors = Vec::new();
        for order in 1..=self.consts.nmb_methods {
            self.try_order(model, order)?;
            if order >= 2 {
                self.calculate_error();
                errors.push(self.vars.abserror);
            }
        }
        Ok(errors)
    }

    fn start_point(&mut self, model: &mut dyn OdeModel) -> ModelgenResult<()> {
        self.single_terms(model)?;
        let (fluxes, states) = (model.fluxes()?, model.states()?);
        let b = &mut self.buffers;
        b.flux_points = vec![vec![0.0; fluxes.len()]; self.consts.nmb_stages + 1];
        b.state_points = vec![vec![0.0; states.len()]; self.consts.nmb_stages + 1];
        b.flux_results = vec![vec![0.0; fluxes.len()]; self.consts.nmb_methods + 1];
        b.state_results = vec![vec![0.0; states.len()]; self.consts.nmb_methods + 1];
        b.integrals = vec![0.0; fluxes.len()];
        if b.sum.len() != fluxes.len() {
            b.sum = vec![0.0; fluxes.len()];
        }
        self.vars.idx_stage = 0;
        b.flux_points[0] = fluxes;
        b.state_points[0] = states;
        self.vars.f0_ready = true;
        Ok(())
    }

    fn try_order(&mut self, model: &mut dyn OdeModel, order: usize) -> ModelgenResult<()> {
        self.vars.idx_method = order;
        for stage in 1..=order {
            self.vars.idx_stage = stage;
            self.integrate_fluxes();
            model.set_fluxes(&self.buffers.integrals)?;
            model.calculate_full_terms()?;
            self.buffers.state_points[stage] = model.states()?;
            if stage < order {
                self.single_terms(model)?;
                self.buffers.flux_points[stage] = model.fluxes()?;
            }
        }
        self.buffers.flux_results[order] = self.buffers.integrals.clone();
        self.buffers.state_results[order] = model.states()?;
        Ok(())
    }

    fn integrate_fluxes(&mut self) {
        let (method, stage) = (self.vars.idx_method, self.vars.idx_stage);
        let dt = self.vars.dt;
        let consts = &self.consts;
        let points = &self.buffers.flux_points;
        for (idx, integral) in self.buffers.integrals.iter_mut().enumerate() {
            let weighted: f64 = (0..stage)
                .map(|jdx| consts.coef(method, stage, jdx) * points[jdx][idx])
                .sum();
            *integral = dt * weighted;
        }
    }

    fn calculate_error(&mut self) {
        let order = self.vars.idx_method;
        let (current, previous) = (
            &self.buffers.flux_results[order],
            &self.buffers.flux_results[order - 1],
        );
        let mut abserror: f64 = 0.0;
        let mut relerror: f64 = 0.0;
        for (result, last) in current.iter().zip(previous) {
            let diff = (result - last).abs();
            abserror = abserror.max(diff);
            if self.vars.use_relerror {
                relerror = if *result == 0.0 {
                    f64::INFINITY
                } else {
                    relerror.max((diff / result).abs())
                };
            }
        }
        self.vars.abserror = abserror;
        self.vars.relerror = relerror;
    }

    fn within_tolerance(&self) -> bool {
        self.vars.abserror <= self.config.abs_error_max
            || self
                .config
                .rel_error_max
                .is_some_and(|rel| self.vars.relerror <= rel)
    }

    fn should_shrink(&self) -> bool {
        self.vars.dt > self.config.rel_dt_min
            && self.vars.extrapolated_abserror > self.config.abs_error_max
            && self
                .config
                .rel_error_max
                .map_or(true, |rel| self.vars.extrapolated_relerror > rel)
    }

    fn accept_step(&mut self, model: &mut dyn OdeModel) -> ModelgenResult<()> {
        for (sum, integral) in self.buffers.sum.iter_mut().zip(&self.buffers.integrals) {
            *sum += integral;
        }
        self.vars.t0 += self.vars.dt;
        model.new2old()?;
        self.vars.f0_ready = false;
        self.vars.nmb_accepted += 1;
        if self.vars.nmb_accepted >= self.consts.accepts_before_growth {
            self.vars.dt_est = (self.vars.dt_est.max(self.vars.dt) * self.consts.dt_increase)
                .min(self.config.rel_dt_max);
        }
        Ok(())
    }

    fn reject_step(&mut self) {
        self.vars.dt_est = (self.vars.dt / self.consts.dt_decrease).max(self.config.rel_dt_min);
        self.vars.f0_ready = true;
        self.vars.nmb_accepted = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use is_close::is_close;

    /// dy/dt = -k y with a single state and flux.
    struct Decay {
        k: f64,
        old: f64,
        new: f64,
        flux: f64,
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

    fn decay(k: f64) -> Decay {
        Decay {
            k,
            old: 1.0,
            new: 1.0,
            flux: 0.0,
        }
    }

    #[test]
    fn integrates_decay_within_tolerance() {
        let config = SolverConfig::default().with_abs_error_max(1e-6);
        let mut solver = AdaptiveSolver::new(&config).unwrap();
        let mut model = decay(1.0);
        solver.solve(&mut model).unwrap();
        assert!((model.new - (-1f64).exp()).abs() < 1e-5);
        // the flux reports the total change over the macro step
        assert!(is_close!(model.flux, model.new - 1.0, abs_tol = 1e-12));
        assert!(solver.trace().iter().any(|r| r.accepted));
        assert!(solver.vars.nmb_calls > 0);
    }

    #[test]
    fn loose_tolerance_accepts_a_single_step() {
        let mut solver = AdaptiveSolver::new(&SolverConfig::default().with_abs_error_max(1.0)).unwrap();
        let mut model = decay(0.1);
        solver.solve(&mut model).unwrap();
        assert_eq!(solver.trace().len(), 1);
        assert_eq!(solver.trace()[0].order, 2);
        assert!(solver.trace()[0].accepted);
    }

    #[test]
    fn rejections_shrink_and_acceptances_grow() {
        let config = SolverConfig::default()
            .with_abs_error_max(1e-8)
            .with_rel_dt_min(1e-4);
        let mut solver = AdaptiveSolver::new(&config).unwrap();
        let mut model = decay(5.0);
        solver.solve(&mut model).unwrap();
        let trace = solver.trace();
        assert!(trace.iter().any(|r| !r.accepted));
        for pair in trace.windows(2) {
            let (before, after) = (pair[0], pair[1]);
            if before.accepted {
                assert!(after.dt_est >= before.dt_est || !after.accepted);
            } else {
                assert!(before.dt_est < before.dt);
            }
        }
        assert!(is_close!(
            trace.iter().filter(|r| r.accepted).map(|r| r.dt).sum::<f64>(),
            1.0
        ));
    }

    #[test]
    fn minimum_step_is_accepted_without_meeting_the_tolerance() {
        let config = SolverConfig::default()
            .with_abs_error_max(1e-300)
            .with_rel_dt_min(0.5)
            .with_rel_dt_max(0.5);
        let mut solver = AdaptiveSolver::new(&config).unwrap();
        let mut model = decay(1.0);
        solver.solve(&mut model).unwrap();
        assert_eq!(solver.trace().len(), 2);
        assert!(solver.trace().iter().all(|r| r.accepted && r.order == 4));
    }

    #[test]
    fn call_counter_covers_the_latest_macro_step() {
        let config = SolverConfig::default().with_abs_error_max(1e-6);
        let mut solver = AdaptiveSolver::new(&config).unwrap();
        let mut model = decay(1.0);
        solver.solve(&mut model).unwrap();
        model.new2old().unwrap();
        let start = model.new;
        assert!(is_close!(start, (-1f64).exp(), rel_tol = 1e-4));
        solver.solve(&mut model).unwrap();

        // a fresh solver started from the same state does the same work
        let mut fresh = AdaptiveSolver::new(&config).unwrap();
        let mut restarted = Decay {
            k: 1.0,
            old: start,
            new: start,
            flux: 0.0,
        };
        fresh.solve(&mut restarted).unwrap();
        assert!(solver.vars.nmb_calls > 0);
        assert_eq!(solver.vars.nmb_calls, fresh.vars.nmb_calls);
    }

    #[test]
    fn direct_solve_counts_one_call() {
        let mut solver = AdaptiveSolver::new(&SolverConfig::default()).unwrap();
        let mut model = decay(0.5);
        for _ in 0..3 {
            solver.solve_direct(&mut model).unwrap();
            model.new2old().unwrap();
        }
        assert_eq!(solver.vars.nmb_calls, 1);
        assert!(is_close!(model.new, 0.125));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(AdaptiveSolver::new(&SolverConfig::default().with_rel_dt_min(0.0)).is_err());
        assert!(AdaptiveSolver::new(&SolverConfig::default().with_abs_error_max(f64::NAN)).is_err());
    }

    #[test]
    fn relative_tolerance_can_accept() {
        let config = SolverConfig::default()
            .with_abs_error_max(1e-300)
            .with_rel_error_max(Some(0.5));
        let mut solver = AdaptiveSolver::new(&config).unwrap();
        let mut model = decay(0.1);
        solver.solve(&mut model).unwrap();
        assert_eq!(solver.trace().len(), 1);
        assert!(solver.vars.use_relerror);
    }
}
