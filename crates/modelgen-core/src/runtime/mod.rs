//! Reference execution of compiled models without a native toolchain.
//!
//! [`ReferenceModel`] runs the parsed method bodies through the
//! [`Interpreter`] on [`ModelInstance`] storage and integrates them with the
//! [`AdaptiveSolver`]. It follows the control flow of a generated unit's
//! `simulate` routine step by step.

pub mod instance;
pub mod interpreter;
pub mod io;
pub mod numeric;

pub use instance::{ModelInstance, Slot};
pub use interpreter::{Interpreter, Value};
pub use io::{SequenceFiles, SequenceIo};
pub use numeric::NumericLayout;

use crate::codegen::{compile, CompiledModel};
use crate::config::{GeneratorConfig, SolverConfig};
use crate::errors::ModelgenResult;
use crate::integration::IntegrationPlan;
use crate::manifest::{ModelDefinition, SOLVER_PARAMETERS};
use crate::method::MethodKind;
use crate::schema::GroupKind;
use crate::solver::{AdaptiveSolver, OdeModel};
use tracing::debug;

/// A model instance executed by the interpreter.
#[derive(Debug)]
pub struct ReferenceModel {
    model: CompiledModel,
    instance: ModelInstance,
    solver: AdaptiveSolver,
    fluxes: NumericLayout,
    states: NumericLayout,
    files: SequenceFiles,
}

impl ReferenceModel {
    pub fn new(
        definition: &ModelDefinition,
        generator: &GeneratorConfig,
        solver: &SolverConfig,
    ) -> ModelgenResult<Self> {
        let model = compile(definition, generator)?;
        Self::from_compiled(model, solver)
    }

    pub fn from_compiled(model: CompiledModel, solver: &SolverConfig) -> ModelgenResult<Self> {
        let adaptive = AdaptiveSolver::new(solver)?;
        let mut instance = ModelInstance::new(&model.definition);
        if model.plan.is_adaptive() {
            let values = [
                solver.abs_error_max,
                solver.rel_error_max_or_nan(),
                solver.rel_dt_min,
                solver.rel_dt_max,
            ];
            for (name, value) in SOLVER_PARAMETERS.iter().zip(values) {
                instance.set_scalar(&format!("{}.{name}", GroupKind::Solver.attr_name()), value)?;
            }
        }
        Ok(Self {
            fluxes: NumericLayout::new(&model.definition, GroupKind::Fluxes),
            states: NumericLayout::new(&model.definition, GroupKind::States),
            solver: adaptive,
            files: SequenceFiles::new(),
            instance,
            model,
        })
    }

    pub fn model(&self) -> &CompiledModel {
        &self.model
    }

    pub fn instance(&self) -> &ModelInstance {
        &self.instance
    }

    pub fn instance_mut(&mut self) -> &mut ModelInstance {
        &mut self.instance
    }

    pub fn solver(&self) -> &AdaptiveSolver {
        &self.solver
    }

    pub fn files(&self) -> &SequenceFiles {
        &self.files
    }

    pub fn files_mut(&mut self) -> &mut SequenceFiles {
        &mut self.files
    }

    /// Run every method of one classification in declaration order.
    pub fn run_methods(&mut self, kind: MethodKind) -> ModelgenResult<()> {
        let interpreter = Interpreter::new(&self.model);
        for method in self.model.methods_of(kind) {
            interpreter.run(&mut self.instance, &method.method.name)?;
        }
        Ok(())
    }

    /// Advance the model over one macro step according to its integration plan.
    pub fn solve(&mut self) -> ModelgenResult<()> {
        let mut view = OdeView {
            model: &self.model,
            instance: &mut self.instance,
            fluxes: &self.fluxes,
            states: &self.states,
        };
        match self.model.plan {
            IntegrationPlan::Adaptive => self.solver.solve(&mut view),
            IntegrationPlan::Direct => self.solver.solve_direct(&mut view),
            IntegrationPlan::None => Ok(()),
        }
    }

    /// Simulate step `idx`: load, inlets, solve, run, outlets, new2old, save.
    pub fn simulate(&mut self, idx: usize) -> ModelgenResult<()> {
        self.files.load(&mut self.instance, idx)?;
        self.run_methods(MethodKind::Inlet)?;
        self.solve()?;
        self.run_methods(MethodKind::Run)?;
        self.run_methods(MethodKind::Outlet)?;
        self.instance.new2old();
        self.files.save(&self.instance, idx)?;
        debug!(model = %self.model.name(), idx, "Simulated step");
        Ok(())
    }
}

struct OdeView<'a> {
    model: &'a CompiledModel,
    instance: &'a mut ModelInstance,
    fluxes: &'a NumericLayout,
    states: &'a NumericLayout,
}

impl OdeView<'_> {
    fn run(&mut self, kind: MethodKind) -> ModelgenResult<()> {
        let interpreter = Interpreter::new(self.model);
        for method in self.model.methods_of(kind) {
            interpreter.run(self.instance, &method.method.name)?;
        }
        Ok(())
    }
}

impl OdeModel for OdeView<'_> {
    fn calculate_single_terms(&mut self) -> ModelgenResult<()> {
        self.run(MethodKind::PartOde)
    }

    fn calculate_full_terms(&mut self) -> ModelgenResult<()> {
        self.run(MethodKind::FullOde)
    }

    fn fluxes(&self) -> ModelgenResult<Vec<f64>> {
        self.fluxes.gather(self.instance)
    }

    fn set_fluxes(&mut self, values: &[f64]) -> ModelgenResult<()> {
        self.fluxes.scatter(self.instance, values)
    }

    fn states(&self) -> ModelgenResult<Vec<f64>> {
        self.states.gather(self.instance)
    }

    fn new2old(&mut self) -> ModelgenResult<()> {
        self.instance.new2old();
        Ok(())
    }
}
