//! Scenario tests for the bundled models.
//!
//! Every bundled model is simulated with the reference runtime and its
//! generated unit is assembled:
//! - Exponential decay follows the analytical solution
//! - The counter is updated once per step without a solver
//! - The zoned storage conserves water and calls its loss sub-model

use approx::assert_relative_eq;
use modelgen_core::codegen::unit::assemble;
use modelgen_core::config::Config;
use modelgen_core::integration::IntegrationPlan;
use modelgen_core::runtime::SequenceIo;
use modelgen_models::scenarios::{
    counter, decay, lstorage, CounterParameters, DecayParameters, LStorageParameters,
};
use modelgen_models::{definition, names};

mod decay_scenario {
    use super::*;

    #[test]
    fn test_decay_follows_the_exponential() {
        let mut config = Config::default();
        config.solver = config.solver.with_abs_error_max(1e-6);
        let parameters = DecayParameters { k: 0.7, y0: 2.0 };
        let mut model = decay(&parameters, &config).unwrap();
        for idx in 0..4 {
            model.simulate(idx).unwrap();
            let expected = 2.0 * (-0.7 * (idx + 1) as f64).exp();
            let y = model.instance().scalar("states.y").unwrap();
            assert_relative_eq!(y, expected, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_decay_is_integrated_adaptively() {
        let model = decay(&DecayParameters::default(), &Config::default()).unwrap();
        assert_eq!(model.model().plan, IntegrationPlan::Adaptive);
    }
}

mod counter_scenario {
    use super::*;

    #[test]
    fn test_counter_advances_once_per_step() {
        let parameters = CounterParameters {
            increment: 2.5,
            n0: 1.0,
        };
        let mut model = counter(&parameters, &Config::default()).unwrap();
        assert_eq!(model.model().plan, IntegrationPlan::Direct);
        for idx in 0..4 {
            model.simulate(idx).unwrap();
        }
        assert_relative_eq!(model.instance().scalar("states.n").unwrap(), 11.0);
        // the counter only covers the latest step
        assert_eq!(model.solver().vars.nmb_calls, 1);
    }
}

mod lstorage_scenario {
    use super::*;

    #[test]
    fn test_storage_balance() {
        let parameters = LStorageParameters::default();
        let mut model = lstorage(&parameters, &Config::default()).unwrap();
        assert_eq!(model.model().plan, IntegrationPlan::None);

        let mut inflow = 0.0;
        let mut outflow = 0.0;
        for (idx, p) in [1.0, 2.0, 0.0, 0.5].into_iter().enumerate() {
            model.instance_mut().set_scalar("inputs.p", p).unwrap();
            model.simulate(idx).unwrap();
            inflow += p;
            outflow += model.instance().scalar("fluxes.q").unwrap();
        }
        // zones receive the same input, so every zone holds the same content
        let s = model.instance().flat("states.s").unwrap();
        assert_eq!(s.len(), 2);
        assert_relative_eq!(s[0], s[1]);
        assert_relative_eq!(s[0], inflow - outflow, epsilon = 1e-12);
    }

    #[test]
    fn test_first_step_values() {
        let mut model = lstorage(&LStorageParameters::default(), &Config::default()).unwrap();
        model.instance_mut().set_scalar("inputs.p", 1.0).unwrap();
        model.simulate(0).unwrap();
        let instance = model.instance();
        assert_eq!(instance.flat("fluxes.qz").unwrap(), vec![0.1, 0.1]);
        assert_relative_eq!(instance.scalar("fluxes.q").unwrap(), 0.1);
        assert_eq!(instance.flat("old_states.s").unwrap(), vec![0.9, 0.9]);
    }

    #[test]
    fn test_smoothing_loses_water_from_an_empty_storage() {
        let parameters = LStorageParameters {
            beta: 0.5,
            ..Default::default()
        };
        let mut model = lstorage(&parameters, &Config::default()).unwrap();
        model.simulate(0).unwrap();
        let expected = 0.1 * 0.5 * 2f64.ln();
        assert_relative_eq!(
            model.instance().scalar("fluxes.q").unwrap(),
            expected,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_outflow_is_recorded_in_ram() {
        let mut model = lstorage(&LStorageParameters::default(), &Config::default()).unwrap();
        let files = model.files_mut();
        files.configure("inputs.p", SequenceIo::ram());
        files.set_series("inputs.p", vec![1.0, 2.0]).unwrap();
        files.configure("fluxes.q", SequenceIo::ram());
        files.set_series("fluxes.q", vec![0.0; 2]).unwrap();
        for idx in 0..2 {
            model.simulate(idx).unwrap();
        }
        let q = model.files().series("fluxes.q").unwrap();
        assert_relative_eq!(q[0], 0.1, epsilon = 1e-12);
        assert_relative_eq!(q[1], 0.29, epsilon = 1e-12);
    }
}

mod generated_units {
    use super::*;

    #[test]
    fn test_every_bundled_model_assembles() {
        let config = Config::default();
        for name in names() {
            let unit = assemble(&definition(name).unwrap(), &config.generator, &config.solver)
                .unwrap();
            assert_eq!(unit.file_name, format!("c_{name}.c"));
            assert!(unit.text.contains(&format!("void {name}_init({name}_Model *self) {{")));
        }
    }

    #[test]
    fn test_storage_unit_embeds_the_loss_model() {
        let config = Config::default();
        let unit = assemble(&definition("lstorage").unwrap(), &config.generator, &config.solver)
            .unwrap();
        let text = unit.text;
        let loss = text.find("} lloss_Model;").unwrap();
        let storage = text.find("} lstorage_Model;").unwrap();
        assert!(loss < storage);
        assert!(text.contains("lloss_Model loss;"));
        assert!(text.contains("su_logistic2("));
        assert!(!text.contains("allocate_numerics"));
    }
}
