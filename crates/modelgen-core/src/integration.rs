//! Integration plans and the state of the adaptive explicit solver.

use crate::config::SolverConfig;
use crate::manifest::ModelDefinition;
use ndarray::Array3;
use serde::{Deserialize, Serialize};

/// How a model advances over one macro step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrationPlan {
    /// Multistage adaptive integration with error estimation.
    Adaptive,
    /// Evaluate the PartODE methods once, then the FullODE methods once.
    Direct,
    /// The model declares no ODE methods at all.
    None,
}

impl IntegrationPlan {
    pub fn for_definition(definition: &ModelDefinition) -> Self {
        let part = !definition.methods.part_ode.is_empty();
        let full = !definition.methods.full_ode.is_empty();
        if part && definition.has_numeric_variables() {
            IntegrationPlan::Adaptive
        } else if part || full {
            IntegrationPlan::Direct
        } else {
            IntegrationPlan::None
        }
    }

    pub fn is_adaptive(self) -> bool {
        self == IntegrationPlan::Adaptive
    }
}

/// Constants of the solver: method family, step resizing factors and coefficients.
#[derive(Debug, Clone, PartialEq)]
pub struct NumConsts {
    pub nmb_methods: usize,
    pub nmb_stages: usize,
    pub dt_increase: f64,
    pub dt_decrease: f64,
    pub accepts_before_growth: u32,
    /// `a_coefs[[order - 1, stage - 1, term]]`
    pub a_coefs: Array3<f64>,
}

impl NumConsts {
    /// Explicit Runge-Kutta methods of orders one to four.
    ///
    /// Method `m` has `m` stages. Row `s - 1` of method `m` weights the flux
    /// points `0..s` that form stage `s`; stage `m` is the method's result.
    pub fn runge_kutta() -> Self {
        let rows: [&[&[f64]]; 4] = [
            &[&[1.0]],
            &[&[1.0], &[0.5, 0.5]],
            &[&[0.5], &[-1.0, 2.0], &[1.0 / 6.0, 2.0 / 3.0, 1.0 / 6.0]],
            &[
                &[0.5],
                &[0.0, 0.5],
                &[0.0, 0.0, 1.0],
                &[1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0],
            ],
        ];
        let mut a_coefs = Array3::zeros((4, 4, 4));
        for (method, stages) in rows.iter().enumerate() {
            for (stage, terms) in stages.iter().enumerate() {
                for (term, value) in terms.iter().enumerate() {
                    a_coefs[[method, stage, term]] = *value;
                }
            }
        }
        let defaults = SolverConfig::default();
        Self {
            nmb_methods: 4,
            nmb_stages: 4,
            dt_increase: defaults.dt_increase,
            dt_decrease: defaults.dt_decrease,
            accepts_before_growth: defaults.accepts_before_growth,
            a_coefs,
        }
    }

    /// The Runge-Kutta family with step resizing taken from `config`.
    pub fn from_config(config: &SolverConfig) -> Self {
        Self {
            dt_increase: config.dt_increase,
            dt_decrease: config.dt_decrease,
            accepts_before_growth: config.accepts_before_growth,
            ..Self::runge_kutta()
        }
    }

    /// Weight of flux point `term` when forming stage `stage` of method `method` (both one-based).
    pub fn coef(&self, method: usize, stage: usize, term: usize) -> f64 {
        self.a_coefs[[method - 1, stage - 1, term]]
    }
}

impl Default for NumConsts {
    fn default() -> Self {
        Self::runge_kutta()
    }
}

/// Mutable solver state of one model instance.
#[derive(Debug, Clone, PartialEq)]
pub struct NumVars {
    pub nmb_calls: u64,
    pub idx_method: usize,
    pub idx_stage: usize,
    pub t0: f64,
    pub t1: f64,
    pub dt: f64,
    pub dt_est: f64,
    pub abserror: f64,
    pub relerror: f64,
    pub last_abserror: f64,
    pub last_relerror: f64,
    pub extrapolated_abserror: f64,
    pub extrapolated_relerror: f64,
    pub f0_ready: bool,
    pub use_relerror: bool,
    pub nmb_accepted: u32,
}

impl Default for NumVars {
    fn default() -> Self {
        Self {
            nmb_calls: 0,
            idx_method: 0,
            idx_stage: 0,
            t0: 0.0,
            t1: 1.0,
            dt: 1.0,
            dt_est: 1.0,
            abserror: 0.0,
            relerror: 0.0,
            last_abserror: f64::INFINITY,
            last_relerror: f64::INFINITY,
            extrapolated_abserror: EXTRAPOLATION_SENTINEL,
            extrapolated_relerror: EXTRAPOLATION_SENTINEL,
            f0_ready: false,
            use_relerror: false,
            nmb_accepted: 0,
        }
    }
}

/// Extrapolated error reported when no extrapolation is possible; never triggers a rejection.
pub const EXTRAPOLATION_SENTINEL: f64 = -999.9;

/// Minimum gap below which a macro step counts as complete.
pub const TIME_EPSILON: f64 = 1e-14;

/// Estimate the error the final method order would reach, given the errors of
/// the current and the previous order.
pub fn extrapolate(error: f64, last_error: f64, nmb_methods: usize, idx_method: usize) -> f64 {
    if idx_method <= 2 {
        return EXTRAPOLATION_SENTINEL;
    }
    if error > 0.0 {
        let remaining = (nmb_methods - idx_method) as f64;
        (error.ln() + (error.ln() - last_error.ln()) * remaining).exp()
    } else if error == 0.0 {
        0.0
    } else {
        EXTRAPOLATION_SENTINEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::MethodKind;
    use crate::schema::{GroupKind, Variable, VariableGroup};
    use is_close::is_close;

    #[test]
    fn every_method_row_sums_to_one() {
        let consts = NumConsts::runge_kutta();
        for method in 1..=consts.nmb_methods {
            let total: f64 = (0..method).map(|t| consts.coef(method, method, t)).sum();
            assert!(is_close!(total, 1.0), "method {method} sums to {total}");
        }
        assert_eq!(consts.coef(3, 2, 0), -1.0);
        assert_eq!(consts.coef(4, 3, 2), 1.0);
    }

    #[test]
    fn plans() {
        let adaptive = ModelDefinition::builder("a")
            .group(VariableGroup::new(GroupKind::States).variable(Variable::float("y").numeric()))
            .method(MethodKind::PartOde, "p")
            .method(MethodKind::FullOde, "f")
            .build()
            .unwrap();
        assert_eq!(
            IntegrationPlan::for_definition(&adaptive),
            IntegrationPlan::Adaptive
        );

        let direct = ModelDefinition::builder("d")
            .group(VariableGroup::new(GroupKind::States).variable(Variable::float("y")))
            .method(MethodKind::PartOde, "p")
            .method(MethodKind::FullOde, "f")
            .build()
            .unwrap();
        assert_eq!(
            IntegrationPlan::for_definition(&direct),
            IntegrationPlan::Direct
        );

        let none = ModelDefinition::builder("n")
            .method(MethodKind::Run, "r")
            .build()
            .unwrap();
        assert_eq!(IntegrationPlan::for_definition(&none), IntegrationPlan::None);
    }

    #[test]
    fn extrapolation() {
        assert_eq!(extrapolate(0.1, 1.0, 4, 2), EXTRAPOLATION_SENTINEL);
        assert_eq!(extrapolate(0.0, 1.0, 4, 3), 0.0);
        // one further order at the same rate of decrease
        assert!(is_close!(extrapolate(0.01, 0.1, 4, 3), 0.001));
        // last order: no further decrease
        assert!(is_close!(extrapolate(0.01, 0.1, 4, 4), 0.01));
    }
}
