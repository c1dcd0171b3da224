//! Variable schema for parameter and sequence groups.
//!
//! A model declares its parameters and sequences as explicit, ordered groups of
//! variables. The schema is plain data built once when a model definition is
//! loaded and is consumed by the declaration emitter, the reference rewriter
//! and the reference runtime.
//!
//! # Example
//!
//! ```
//! use modelgen_core::schema::{GroupKind, Variable, VariableGroup};
//!
//! let fluxes = VariableGroup::new(GroupKind::Fluxes)
//!     .variable(Variable::float("q").numeric())
//!     .variable(Variable::float("qz").with_ndim(1));
//! assert_eq!(fluxes.names(), vec!["q", "qz"]);
//! assert!(fluxes.get("q").unwrap().numeric);
//! ```

use crate::errors::{ModelgenError, ModelgenResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest supported dimensionality of a variable.
pub const MAX_NDIM: usize = 3;

/// Element type of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Bool,
    Int,
    #[default]
    Float,
}

impl ElementType {
    /// The C element type used in generated declarations.
    pub fn c_type(self) -> &'static str {
        match self {
            ElementType::Bool => "bool",
            ElementType::Int => "int",
            ElementType::Float => "double",
        }
    }
}

/// The two top-level families of variable groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    Parameters,
    Sequences,
}

impl Family {
    pub fn attr_name(self) -> &'static str {
        match self {
            Family::Parameters => "parameters",
            Family::Sequences => "sequences",
        }
    }

    pub fn from_attr_name(name: &str) -> Option<Self> {
        match name {
            "parameters" => Some(Family::Parameters),
            "sequences" => Some(Family::Sequences),
            _ => None,
        }
    }

    /// Struct name suffix of the family aggregate, e.g. `Parameters`.
    pub fn struct_name(self) -> &'static str {
        match self {
            Family::Parameters => "Parameters",
            Family::Sequences => "Sequences",
        }
    }
}

/// Kind of a variable group.
///
/// The declaration order of groups is fixed and given by [`GroupKind::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Control,
    Derived,
    Fixed,
    Solver,
    Inputs,
    Factors,
    Fluxes,
    States,
    Logs,
    Aides,
    Inlets,
    Outlets,
    Receivers,
    Senders,
}

impl GroupKind {
    pub const PARAMETERS: [GroupKind; 4] = [
        GroupKind::Control,
        GroupKind::Derived,
        GroupKind::Fixed,
        GroupKind::Solver,
    ];

    pub const SEQUENCES: [GroupKind; 10] = [
        GroupKind::Inputs,
        GroupKind::Factors,
        GroupKind::Fluxes,
        GroupKind::States,
        GroupKind::Logs,
        GroupKind::Aides,
        GroupKind::Inlets,
        GroupKind::Outlets,
        GroupKind::Receivers,
        GroupKind::Senders,
    ];

    pub const ALL: [GroupKind; 14] = [
        GroupKind::Control,
        GroupKind::Derived,
        GroupKind::Fixed,
        GroupKind::Solver,
        GroupKind::Inputs,
        GroupKind::Factors,
        GroupKind::Fluxes,
        GroupKind::States,
        GroupKind::Logs,
        GroupKind::Aides,
        GroupKind::Inlets,
        GroupKind::Outlets,
        GroupKind::Receivers,
        GroupKind::Senders,
    ];

    pub fn family(self) -> Family {
        match self {
            GroupKind::Control | GroupKind::Derived | GroupKind::Fixed | GroupKind::Solver => {
                Family::Parameters
            }
            _ => Family::Sequences,
        }
    }

    /// Attribute name of the group below its family, e.g. `control` or `fluxes`.
    pub fn attr_name(self) -> &'static str {
        match self {
            GroupKind::Control => "control",
            GroupKind::Derived => "derived",
            GroupKind::Fixed => "fixed",
            GroupKind::Solver => "solver",
            GroupKind::Inputs => "inputs",
            GroupKind::Factors => "factors",
            GroupKind::Fluxes => "fluxes",
            GroupKind::States => "states",
            GroupKind::Logs => "logs",
            GroupKind::Aides => "aides",
            GroupKind::Inlets => "inlets",
            GroupKind::Outlets => "outlets",
            GroupKind::Receivers => "receivers",
            GroupKind::Senders => "senders",
        }
    }

    /// Default shortcut alias used inside method bodies.
    pub fn shortcut(self) -> &'static str {
        match self {
            GroupKind::Control => "con",
            GroupKind::Derived => "der",
            GroupKind::Fixed => "fix",
            GroupKind::Solver => "sol",
            GroupKind::Inputs => "inp",
            GroupKind::Factors => "fac",
            GroupKind::Fluxes => "flu",
            GroupKind::States => "sta",
            GroupKind::Logs => "log",
            GroupKind::Aides => "aid",
            GroupKind::Inlets => "inl",
            GroupKind::Outlets => "out",
            GroupKind::Receivers => "rec",
            GroupKind::Senders => "sen",
        }
    }

    /// Name of the generated C struct (without model prefix).
    pub fn struct_name(self) -> &'static str {
        match self {
            GroupKind::Control => "ControlParameters",
            GroupKind::Derived => "DerivedParameters",
            GroupKind::Fixed => "FixedParameters",
            GroupKind::Solver => "SolverParameters",
            GroupKind::Inputs => "InputSequences",
            GroupKind::Factors => "FactorSequences",
            GroupKind::Fluxes => "FluxSequences",
            GroupKind::States => "StateSequences",
            GroupKind::Logs => "LogSequences",
            GroupKind::Aides => "AideSequences",
            GroupKind::Inlets => "InletSequences",
            GroupKind::Outlets => "OutletSequences",
            GroupKind::Receivers => "ReceiverSequences",
            GroupKind::Senders => "SenderSequences",
        }
    }

    pub fn from_attr_name(name: &str) -> Option<Self> {
        GroupKind::ALL.into_iter().find(|kind| kind.attr_name() == name)
    }

    /// Whether sequences of this kind can be read from or written to disk/RAM.
    pub fn is_io_capable(self) -> bool {
        matches!(
            self,
            GroupKind::Inputs | GroupKind::Factors | GroupKind::Fluxes | GroupKind::States
        )
    }

    /// Whether the variables of this kind are pointers into other instances.
    pub fn is_link(self) -> bool {
        matches!(
            self,
            GroupKind::Inlets | GroupKind::Outlets | GroupKind::Receivers | GroupKind::Senders
        )
    }

    /// Whether variables of this kind may participate in numerical integration.
    pub fn allows_numeric(self) -> bool {
        matches!(self, GroupKind::Fluxes | GroupKind::States)
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.attr_name())
    }
}

/// Auxiliary buffers owned by a numerically integrated variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// Values captured at every stage of the current trial step.
    Points,
    /// Results of every method order of the current trial step.
    Results,
    /// Integral of a flux over the current trial step.
    Integrals,
    /// Running sum of accepted flux integrals over the macro step.
    Sum,
}

impl BufferRole {
    /// Field name suffix, e.g. `_q_points`.
    pub fn suffix(self) -> &'static str {
        match self {
            BufferRole::Points => "points",
            BufferRole::Results => "results",
            BufferRole::Integrals => "integrals",
            BufferRole::Sum => "sum",
        }
    }

    /// Number of leading buffer axes (stage/order axis) added to the variable's shape.
    pub fn extra_axes(self) -> usize {
        match self {
            BufferRole::Points | BufferRole::Results => 1,
            BufferRole::Integrals | BufferRole::Sum => 0,
        }
    }

    pub fn field_name(self, variable: &str) -> String {
        format!("_{}_{}", variable, self.suffix())
    }
}

const STATE_ROLES: [BufferRole; 2] = [BufferRole::Points, BufferRole::Results];
const FLUX_ROLES: [BufferRole; 4] = [
    BufferRole::Points,
    BufferRole::Results,
    BufferRole::Integrals,
    BufferRole::Sum,
];

/// Declarative metadata of a single parameter or sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(default)]
    pub ndim: usize,
    #[serde(default, rename = "type")]
    pub element: ElementType,
    /// Whether the variable takes part in numerical (ODE) integration.
    #[serde(default)]
    pub numeric: bool,
}

impl Variable {
    pub fn new(name: impl Into<String>, element: ElementType) -> Self {
        Self {
            name: name.into(),
            ndim: 0,
            element,
            numeric: false,
        }
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, ElementType::Float)
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, ElementType::Int)
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, ElementType::Bool)
    }

    pub fn with_ndim(mut self, ndim: usize) -> Self {
        self.ndim = ndim;
        self
    }

    pub fn numeric(mut self) -> Self {
        self.numeric = true;
        self
    }

    /// The buffer roles this variable owns when the model integrates adaptively.
    pub fn buffer_roles(&self, kind: GroupKind) -> &'static [BufferRole] {
        if !self.numeric {
            return &[];
        }
        match kind {
            GroupKind::States => &STATE_ROLES,
            GroupKind::Fluxes => &FLUX_ROLES,
            _ => &[],
        }
    }
}

/// An ordered, named collection of variables of one [`GroupKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableGroup {
    pub kind: GroupKind,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

impl VariableGroup {
    pub fn new(kind: GroupKind) -> Self {
        Self {
            kind,
            variables: Vec::new(),
        }
    }

    /// Append a variable, keeping insertion order.
    pub fn variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        self.variables.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Numerically integrated variables, in declaration order.
    pub fn numeric_variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter().filter(|v| v.numeric)
    }

    /// Checks names, dimensionality, element types and numeric flags.
    pub fn validate(&self) -> ModelgenResult<()> {
        for (idx, variable) in self.variables.iter().enumerate() {
            if !is_identifier(&variable.name) {
                return Err(ModelgenError::Definition(format!(
                    "`{}` in group `{}` is not a valid identifier",
                    variable.name, self.kind
                )));
            }
            if self.variables[..idx]
                .iter()
                .any(|other| other.name == variable.name)
            {
                return Err(ModelgenError::Definition(format!(
                    "variable `{}` is declared twice in group `{}`",
                    variable.name, self.kind
                )));
            }
            if variable.ndim > MAX_NDIM {
                return Err(ModelgenError::Definition(format!(
                    "variable `{}` in group `{}` has {} dimensions, at most {} are supported",
                    variable.name, self.kind, variable.ndim, MAX_NDIM
                )));
            }
            if variable.numeric
                && (!self.kind.allows_numeric() || variable.element != ElementType::Float)
            {
                return Err(ModelgenError::Definition(format!(
                    "variable `{}` in group `{}` cannot be numerically integrated; only float states and fluxes can",
                    variable.name, self.kind
                )));
            }
            if self.kind.is_link() && variable.element != ElementType::Float {
                return Err(ModelgenError::Definition(format!(
                    "link variable `{}` in group `{}` must be of type float",
                    variable.name, self.kind
                )));
            }
        }
        Ok(())
    }
}

/// Whether `name` is an ASCII identifier (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_order_is_fixed() {
        let names: Vec<&str> = GroupKind::ALL.iter().map(|k| k.attr_name()).collect();
        assert_eq!(
            names,
            vec![
                "control", "derived", "fixed", "solver", "inputs", "factors", "fluxes", "states",
                "logs", "aides", "inlets", "outlets", "receivers", "senders"
            ]
        );
        assert!(GroupKind::PARAMETERS
            .iter()
            .all(|k| k.family() == Family::Parameters));
        assert!(GroupKind::SEQUENCES
            .iter()
            .all(|k| k.family() == Family::Sequences));
    }

    #[test]
    fn buffer_roles_follow_group_kind() {
        let state = Variable::float("s").numeric();
        let flux = Variable::float("q").numeric();
        assert_eq!(
            state.buffer_roles(GroupKind::States),
            &[BufferRole::Points, BufferRole::Results]
        );
        assert_eq!(flux.buffer_roles(GroupKind::Fluxes).len(), 4);
        assert!(Variable::float("q").buffer_roles(GroupKind::Fluxes).is_empty());
    }

    #[test]
    fn validate_rejects_bad_groups() {
        let duplicated = VariableGroup::new(GroupKind::Control)
            .variable(Variable::float("k"))
            .variable(Variable::int("k"));
        assert!(duplicated.validate().is_err());

        let too_deep = VariableGroup::new(GroupKind::Fluxes)
            .variable(Variable::float("q").with_ndim(4));
        assert!(too_deep.validate().is_err());

        let numeric_parameter =
            VariableGroup::new(GroupKind::Control).variable(Variable::float("k").numeric());
        assert!(numeric_parameter.validate().is_err());

        let numeric_int =
            VariableGroup::new(GroupKind::States).variable(Variable::int("n").numeric());
        assert!(numeric_int.validate().is_err());

        let bool_link = VariableGroup::new(GroupKind::Inlets).variable(Variable::bool("q"));
        assert!(bool_link.validate().is_err());

        let fine = VariableGroup::new(GroupKind::States)
            .variable(Variable::float("s").numeric().with_ndim(2));
        assert!(fine.validate().is_ok());
    }

    #[test]
    fn deserialises_variables_with_defaults() {
        let group: VariableGroup = toml::from_str(
            r#"
kind = "fluxes"
variables = [
    { name = "q", numeric = true },
    { name = "n", type = "int", ndim = 1 },
]
"#,
        )
        .unwrap();
        assert_eq!(group.kind, GroupKind::Fluxes);
        assert_eq!(group.variables[0], Variable::float("q").numeric());
        assert_eq!(group.variables[1], Variable::int("n").with_ndim(1));
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("d_sum"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier("a.b"));
        assert!(!is_identifier(""));
    }
}
