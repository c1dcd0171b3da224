//! End-to-end tests of C unit generation.
//!
//! These tests run complete model definitions through the pipeline and check
//! properties of the emitted unit rather than its exact text:
//! - Assembly is a pure function of the definition and the configuration
//! - No shorthand alias or fast-accessor binding survives rewriting
//! - Locals and arguments are typed by their name prefix
//! - Models without numeric variables get no solver machinery
//! - Unsupported constructs fail in the stage that detects them

use modelgen_core::codegen::introspect::introspect;
use modelgen_core::codegen::rewrite::rewrite;
use modelgen_core::codegen::unit::assemble;
use modelgen_core::codegen::compile;
use modelgen_core::config::{GeneratorConfig, SolverConfig};
use modelgen_core::errors::{ModelgenError, Stage};
use modelgen_core::manifest::{ModelDefinition, SourceFile};
use modelgen_core::method::{DeclaredRef, MethodKind, MethodReferences};
use modelgen_core::schema::{GroupKind, Variable, VariableGroup};

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

const ZONES: &str = r#"
def calc_total(model):
    con = model.parameters.control.fastaccess
    inp = model.sequences.inputs.fastaccess
    flu = model.sequences.fluxes.fastaccess
    d_total = 0.
    for idx in range(con.nmb):
        d_total += inp.p[idx] * con.w[idx]
    flu.total = d_total
    flu.count = idx
"#;

fn decay() -> ModelDefinition {
    ModelDefinition::builder("decay")
        .source(SourceFile::new("models/decay.mdl", DECAY))
        .group(VariableGroup::new(GroupKind::Control).variable(Variable::float("k")))
        .group(VariableGroup::new(GroupKind::Fluxes).variable(Variable::float("dy").numeric()))
        .group(VariableGroup::new(GroupKind::States).variable(Variable::float("y").numeric()))
        .method(MethodKind::PartOde, "calc_dy")
        .method(MethodKind::FullOde, "update_y")
        .build()
        .unwrap()
}

fn zones(source: &str) -> ModelDefinition {
    ModelDefinition::builder("zones")
        .source(SourceFile::new("models/zones.mdl", source))
        .group(
            VariableGroup::new(GroupKind::Control)
                .variable(Variable::int("nmb"))
                .variable(Variable::float("w").with_ndim(1)),
        )
        .group(VariableGroup::new(GroupKind::Inputs).variable(Variable::float("p").with_ndim(1)))
        .group(
            VariableGroup::new(GroupKind::Fluxes)
                .variable(Variable::float("total"))
                .variable(Variable::int("count")),
        )
        .method(MethodKind::Run, "calc_total")
        .build()
        .unwrap()
}

fn unit_text(definition: &ModelDefinition) -> String {
    assemble(definition, &GeneratorConfig::default(), &SolverConfig::default())
        .unwrap()
        .text
}

mod idempotence {
    use super::*;

    #[test]
    fn test_repeated_assembly_is_byte_identical() {
        for definition in [decay(), zones(ZONES)] {
            let first = unit_text(&definition);
            let second = unit_text(&definition);
            assert_eq!(first.as_bytes(), second.as_bytes());
        }
    }

    #[test]
    fn test_solver_settings_change_the_unit() {
        let config = GeneratorConfig::default();
        let strict = assemble(
            &decay(),
            &config,
            &SolverConfig::default().with_abs_error_max(1e-9),
        )
        .unwrap();
        let loose = assemble(&decay(), &config, &SolverConfig::default()).unwrap();
        assert_ne!(strict.text, loose.text);
        assert!(strict.text.contains("self->parameters.solver.abserrormax = 1e-9;"));
    }
}

mod rewriting {
    use super::*;

    #[test]
    fn test_no_alias_or_accessor_survives() {
        let definition = decay();
        let config = GeneratorConfig::default();
        for (kind, name) in definition.methods.iter() {
            let method = introspect(&definition, name, kind, &config.fastaccess_marker).unwrap();
            let text = rewrite(&definition, &method, &config).unwrap().text();
            let body: Vec<&str> = text
                .lines()
                .filter(|line| !line.contains(&config.fastaccess_marker))
                .collect();
            for line in &body {
                for alias in ["con.", "flu.", "new.", "old."] {
                    assert!(
                        !line.split_whitespace().any(|word| word.starts_with(alias)),
                        "alias `{alias}` survived in `{line}`"
                    );
                }
            }
        }

        let unit = unit_text(&definition);
        assert!(!unit.contains(&config.fastaccess_marker));
        assert!(unit.contains("self->sequences.fluxes.dy = ((-self->parameters.control.k) * self->sequences.states.y);"));
        assert!(unit.contains("self->sequences.states.y = (self->sequences.old_states.y + self->sequences.fluxes.dy);"));
    }

    #[test]
    fn test_declared_references_limit_access() {
        let references = MethodReferences {
            requires: vec![DeclaredRef::parse("control.k").unwrap()],
            results: vec![DeclaredRef::parse("fluxes.dy").unwrap()],
            updates: Vec::new(),
        };
        let err = ModelDefinition::builder("decay")
            .source(SourceFile::new("models/decay.mdl", DECAY))
            .group(VariableGroup::new(GroupKind::Control).variable(Variable::float("k")))
            .group(VariableGroup::new(GroupKind::Fluxes).variable(Variable::float("dy").numeric()))
            .group(VariableGroup::new(GroupKind::States).variable(Variable::float("y").numeric()))
            .method(MethodKind::PartOde, "calc_dy")
            .method(MethodKind::FullOde, "update_y")
            .references("calc_dy", references)
            .build()
            .and_then(|definition| compile(&definition, &GeneratorConfig::default()))
            .unwrap_err();
        assert!(matches!(
            err,
            ModelgenError::Generation {
                stage: Stage::Rewriting,
                ..
            }
        ));
        assert!(err.root().to_string().contains("is used but not declared"));
    }
}

mod typing {
    use super::*;

    #[test]
    fn test_locals_are_typed_by_prefix() {
        let unit = unit_text(&zones(ZONES));
        assert!(unit.contains("    double d_total;\n"));
        assert!(unit.contains("    int idx;\n"));
        assert!(unit.contains("static void zones_calc_total(zones_Model *self);"));
    }

    #[test]
    fn test_add_method_arguments_are_typed_by_prefix() {
        const HELPER: &str = "def scale(model, d_value, n):\n    con = model.parameters.control.fastaccess\n    return d_value * con.w[n]\n";
        let definition = ModelDefinition::builder("helper")
            .source(SourceFile::new("models/helper.mdl", HELPER))
            .group(VariableGroup::new(GroupKind::Control).variable(Variable::float("w").with_ndim(1)))
            .method(MethodKind::Add, "scale")
            .build()
            .unwrap();
        let unit = unit_text(&definition);
        assert!(unit.contains("static double helper_scale(helper_Model *self, double d_value, int n);"));
    }
}

mod integration_plans {
    use super::*;

    #[test]
    fn test_models_without_numeric_variables_have_no_buffers() {
        let unit = unit_text(&zones(ZONES));
        assert!(!unit.contains("allocate_numerics"));
        assert!(!unit.contains("_points"));
        assert!(!unit.contains("numconsts"));
        assert!(!unit.contains("numvars"));
        assert!(!unit.contains("zones_NumConsts"));
        assert!(!unit.contains("calculate_single_terms"));
        assert!(unit.contains("int zones_simulate(zones_Model *self, int idx) {"));
    }

    #[test]
    fn test_adaptive_models_carry_the_solver() {
        let unit = unit_text(&decay());
        assert!(unit.contains("decay_allocate_numerics"));
        assert!(unit.contains("decay_free_numerics"));
        assert!(unit.contains("self->sequences.fluxes._dy_points"));
        assert!(unit.contains("self->numconsts.nmb_methods = 4;"));
    }
}

mod unsupported_constructs {
    use super::*;

    fn stage_of(source: &str) -> (Stage, String) {
        match compile(&zones(source), &GeneratorConfig::default()) {
            Err(ModelgenError::Generation { stage, source, .. }) => (stage, source.to_string()),
            other => panic!("expected a generation failure, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_method_fails_introspection() {
        let (stage, message) = stage_of("def other(model):\n    pass\n");
        assert_eq!(stage, Stage::Introspection);
        assert!(message.contains("calc_total"));
    }

    #[test]
    fn test_string_literals_fail_normalization() {
        let source = "def calc_total(model):\n    flu = model.sequences.fluxes.fastaccess\n    flu.total = 'x'\n";
        let (stage, message) = stage_of(source);
        assert_eq!(stage, Stage::Normalization);
        assert!(message.contains("string literals are not supported"));
    }

    #[test]
    fn test_unknown_attribute_fails_rewriting() {
        let source = "def calc_total(model):\n    flu = model.sequences.fluxes.fastaccess\n    flu.total = model.missing.value\n";
        let (stage, _) = stage_of(source);
        assert_eq!(stage, Stage::Rewriting);
    }

    #[test]
    fn test_unsupported_statement_fails_parsing() {
        let source = "def calc_total(model):\n    flu = model.sequences.fluxes.fastaccess\n    if flu.total > 1.:\n        flu.total = 1.\n    else flu.total = 0.\n";
        let (stage, message) = stage_of(source);
        assert_eq!(stage, Stage::Parsing);
        assert!(message.contains("malformed `else`"));
    }

    #[test]
    fn test_run_methods_may_not_return_values() {
        let source = "def calc_total(model):\n    return 1.\n";
        let (stage, message) = stage_of(source);
        assert_eq!(stage, Stage::Parsing);
        assert!(message.contains("only add methods may return a value"));
    }
}
