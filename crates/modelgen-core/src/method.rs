//! Method classification and the introspected method record.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Role of a method within a simulation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MethodKind {
    Inlet,
    Outlet,
    Receiver,
    Sender,
    Run,
    /// Right-hand-side term of the ODE, evaluated once per stage.
    PartOde,
    /// Whole-step update turning integrated fluxes into states.
    FullOde,
    /// Helper only reachable through calls from other methods.
    Add,
}

impl MethodKind {
    pub const ALL: [MethodKind; 8] = [
        MethodKind::Inlet,
        MethodKind::Outlet,
        MethodKind::Receiver,
        MethodKind::Sender,
        MethodKind::Run,
        MethodKind::PartOde,
        MethodKind::FullOde,
        MethodKind::Add,
    ];

    /// Name of the manifest list holding methods of this kind.
    pub fn list_name(self) -> &'static str {
        match self {
            MethodKind::Inlet => "inlet",
            MethodKind::Outlet => "outlet",
            MethodKind::Receiver => "receiver",
            MethodKind::Sender => "sender",
            MethodKind::Run => "run",
            MethodKind::PartOde => "part_ode",
            MethodKind::FullOde => "full_ode",
            MethodKind::Add => "add",
        }
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.list_name())
    }
}

/// The fixed-name method lists of a model definition.
///
/// Missing lists are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MethodLists {
    pub inlet: Vec<String>,
    pub outlet: Vec<String>,
    pub receiver: Vec<String>,
    pub sender: Vec<String>,
    pub run: Vec<String>,
    pub part_ode: Vec<String>,
    pub full_ode: Vec<String>,
    pub add: Vec<String>,
}

impl MethodLists {
    pub fn get(&self, kind: MethodKind) -> &[String] {
        match kind {
            MethodKind::Inlet => &self.inlet,
            MethodKind::Outlet => &self.outlet,
            MethodKind::Receiver => &self.receiver,
            MethodKind::Sender => &self.sender,
            MethodKind::Run => &self.run,
            MethodKind::PartOde => &self.part_ode,
            MethodKind::FullOde => &self.full_ode,
            MethodKind::Add => &self.add,
        }
    }

    pub fn get_mut(&mut self, kind: MethodKind) -> &mut Vec<String> {
        match kind {
            MethodKind::Inlet => &mut self.inlet,
            MethodKind::Outlet => &mut self.outlet,
            MethodKind::Receiver => &mut self.receiver,
            MethodKind::Sender => &mut self.sender,
            MethodKind::Run => &mut self.run,
            MethodKind::PartOde => &mut self.part_ode,
            MethodKind::FullOde => &mut self.full_ode,
            MethodKind::Add => &mut self.add,
        }
    }

    /// All methods with their kind, in list order.
    pub fn iter(&self) -> impl Iterator<Item = (MethodKind, &str)> {
        MethodKind::ALL
            .into_iter()
            .flat_map(move |kind| self.get(kind).iter().map(move |m| (kind, m.as_str())))
    }

    pub fn kind_of(&self, method: &str) -> Option<MethodKind> {
        self.iter()
            .find(|(_, name)| *name == method)
            .map(|(kind, _)| kind)
    }

    pub fn contains(&self, method: &str) -> bool {
        self.kind_of(method).is_some()
    }
}

/// A declared variable reference such as `flu.q` or `old_states.s`.
///
/// `group` is either a group shortcut, a group attribute name, `new` or `old`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeclaredRef {
    pub group: String,
    pub variable: String,
}

impl DeclaredRef {
    pub fn parse(text: &str) -> Option<Self> {
        let (group, variable) = text.trim().split_once('.')?;
        if group.is_empty() || variable.is_empty() || variable.contains('.') {
            return None;
        }
        Some(Self {
            group: group.to_string(),
            variable: variable.to_string(),
        })
    }
}

impl fmt::Display for DeclaredRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.variable)
    }
}

/// Ordered variable references a method declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodReferences {
    pub requires: Vec<DeclaredRef>,
    pub results: Vec<DeclaredRef>,
    pub updates: Vec<DeclaredRef>,
}

impl MethodReferences {
    pub fn is_empty(&self) -> bool {
        self.requires.is_empty() && self.results.is_empty() && self.updates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeclaredRef> {
        self.requires
            .iter()
            .chain(self.results.iter())
            .chain(self.updates.iter())
    }
}

/// One model method as recovered from its host source file.
///
/// Created once per model definition by the introspector and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMethod {
    pub name: String,
    pub kind: MethodKind,
    /// The complete block, header included, exactly as written.
    pub source: String,
    /// Cleaned documentation text, empty when the method has none.
    pub doc: String,
    /// Parameter names, the model handle first.
    pub params: Vec<String>,
    /// Assignment targets and loop variables in order of first appearance.
    pub locals: Vec<String>,
    /// One-based line number of the header in `origin`.
    pub line: usize,
    pub origin: PathBuf,
    pub references: MethodReferences,
}

impl ModelMethod {
    /// Parameters following the model handle.
    pub fn args(&self) -> &[String] {
        self.params.get(1..).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_report_kind_and_order() {
        let lists: MethodLists = toml::from_str(
            r#"
part_ode = ["calc_q", "calc_e"]
full_ode = ["update_s"]
"#,
        )
        .unwrap();
        assert_eq!(lists.kind_of("calc_e"), Some(MethodKind::PartOde));
        assert_eq!(lists.kind_of("update_s"), Some(MethodKind::FullOde));
        assert_eq!(lists.kind_of("missing"), None);
        assert!(lists.run.is_empty());
        let names: Vec<&str> = lists.iter().map(|(_, n)| n).collect();
        assert_eq!(names, vec!["calc_q", "calc_e", "update_s"]);
    }

    #[test]
    fn unknown_list_names_are_rejected() {
        assert!(toml::from_str::<MethodLists>("partode = [\"x\"]").is_err());
    }

    #[test]
    fn declared_refs() {
        let r = DeclaredRef::parse("flu.q").unwrap();
        assert_eq!(r.group, "flu");
        assert_eq!(r.variable, "q");
        assert_eq!(r.to_string(), "flu.q");
        assert!(DeclaredRef::parse("q").is_none());
        assert!(DeclaredRef::parse("a.b.c").is_none());
    }
}
