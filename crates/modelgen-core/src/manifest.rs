//! Model definitions and the TOML manifests they are loaded from.
//!
//! A manifest names the model, lists the host source files holding its method
//! bodies (in resolution order), declares its variable groups, classifies its
//! methods and optionally references sub-model manifests:
//!
//! ```toml
//! name = "decay"
//! sources = ["decay.mdl"]
//!
//! [[groups]]
//! kind = "states"
//! variables = [{ name = "y", numeric = true }]
//!
//! [methods]
//! part_ode = ["calc_dy"]
//! full_ode = ["update_y"]
//!
//! [references.calc_dy]
//! requires = ["sta.y", "con.k"]
//! results = ["flu.dy"]
//! ```
//!
//! Sub-model manifests are resolved relative to the referencing manifest and
//! must not form a cycle.

use crate::errors::{ModelgenError, ModelgenResult};
use crate::integration::IntegrationPlan;
use crate::method::{DeclaredRef, MethodKind, MethodLists, MethodReferences};
use crate::schema::{is_identifier, GroupKind, Variable, VariableGroup};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Solver parameters every adaptively integrated model carries.
pub const SOLVER_PARAMETERS: [&str; 4] = ["abserrormax", "relerrormax", "reldtmin", "reldtmax"];

/// Attribute names a sub-model may not take.
const RESERVED_NAMES: [&str; 6] = [
    "model",
    "self",
    "parameters",
    "sequences",
    "numconsts",
    "numvars",
];

/// A host source file contributing method bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub text: String,
}

impl SourceFile {
    pub fn new(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
        }
    }

    pub fn read(path: &Path) -> ModelgenResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ModelgenError::io(path, e))?;
        Ok(Self::new(path, text))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Submodel {
    /// Attribute name under which the parent reaches the sub-model.
    pub name: String,
    pub definition: ModelDefinition,
}

/// The complete declarative description of one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDefinition {
    pub name: String,
    pub manifest: Option<PathBuf>,
    pub sources: Vec<SourceFile>,
    groups: Vec<VariableGroup>,
    pub methods: MethodLists,
    pub references: BTreeMap<String, MethodReferences>,
    /// Extra alias name (dotted names allowed) to qualified chain, e.g. `"pc" = "model.parameters.control"`.
    pub aliases: BTreeMap<String, String>,
    pub submodels: Vec<Submodel>,
}

impl ModelDefinition {
    pub fn builder(name: impl Into<String>) -> ModelDefinitionBuilder {
        ModelDefinitionBuilder::new(name)
    }

    /// Load a manifest and, recursively, the manifests of its sub-models.
    pub fn load(path: &Path) -> ModelgenResult<Self> {
        let root = canonical(path)?;
        let mut graph: DiGraph<PathBuf, ()> = DiGraph::new();
        let mut nodes: HashMap<PathBuf, NodeIndex> = HashMap::new();
        let mut manifests: HashMap<PathBuf, ManifestFile> = HashMap::new();
        let mut pending = vec![root.clone()];

        while let Some(current) = pending.pop() {
            if manifests.contains_key(&current) {
                continue;
            }
            let manifest = ManifestFile::read(&current)?;
            let parent = node_for(&mut graph, &mut nodes, &current);
            for entry in &manifest.submodels {
                let child_path = canonical(&manifest_dir(&current).join(&entry.manifest))?;
                let child = node_for(&mut graph, &mut nodes, &child_path);
                graph.add_edge(parent, child, ());
                pending.push(child_path);
            }
            manifests.insert(current, manifest);
        }

        if let Err(cycle) = toposort(&graph, None) {
            return Err(ModelgenError::Definition(format!(
                "sub-model manifests form a cycle through {}",
                graph[cycle.node_id()].display()
            )));
        }
        debug!(manifest = %root.display(), manifests = manifests.len(), "Resolved model manifests");
        build_from_manifest(&root, &manifests)
    }

    pub fn groups(&self) -> &[VariableGroup] {
        &self.groups
    }

    pub fn group(&self, kind: GroupKind) -> Option<&VariableGroup> {
        self.groups.iter().find(|g| g.kind == kind)
    }

    pub fn variable(&self, kind: GroupKind, name: &str) -> Option<&Variable> {
        self.group(kind).and_then(|g| g.get(name))
    }

    pub fn submodel(&self, name: &str) -> Option<&Submodel> {
        self.submodels.iter().find(|s| s.name == name)
    }

    /// Follow a chain of sub-model attribute names.
    pub fn descend(&self, owner: &[String]) -> Option<&ModelDefinition> {
        let mut current = self;
        for name in owner {
            current = &current.submodel(name)?.definition;
        }
        Some(current)
    }

    pub fn references_of(&self, method: &str) -> Option<&MethodReferences> {
        self.references.get(method).filter(|r| !r.is_empty())
    }

    /// Whether any flux or state takes part in numerical integration.
    pub fn has_numeric_variables(&self) -> bool {
        self.groups
            .iter()
            .any(|g| g.numeric_variables().next().is_some())
    }

    /// Files whose modification invalidates the generated unit.
    ///
    /// Each model contributes its manifest, if it was loaded from one, and
    /// then its sources in resolution order. Sub-models follow depth-first
    /// and no path is listed twice.
    pub fn contributors(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        self.collect_paths(&mut paths, true);
        paths
    }

    /// Source files of the model and its sub-models, depth-first and unique.
    pub fn source_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        self.collect_paths(&mut paths, false);
        paths
    }

    fn collect_paths(&self, paths: &mut Vec<PathBuf>, manifests: bool) {
        let manifest = self.manifest.iter().filter(|_| manifests);
        for path in manifest.chain(self.sources.iter().map(|s| &s.path)) {
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }
        for sub in &self.submodels {
            sub.definition.collect_paths(paths, manifests);
        }
    }

    fn finalize(mut self) -> ModelgenResult<Self> {
        if !is_identifier(&self.name) {
            return Err(ModelgenError::Definition(format!(
                "model name `{}` is not a valid identifier",
                self.name
            )));
        }
        self.groups.sort_by_key(|g| g.kind);
        for pair in self.groups.windows(2) {
            if pair[0].kind == pair[1].kind {
                return Err(ModelgenError::Definition(format!(
                    "model `{}` declares group `{}` twice",
                    self.name, pair[0].kind
                )));
            }
        }
        for group in &self.groups {
            group.validate()?;
        }
        self.validate_methods()?;
        self.validate_submodels()?;
        for alias in self.aliases.keys() {
            if !alias.split('.').all(is_identifier) {
                return Err(ModelgenError::Definition(format!(
                    "alias `{alias}` of model `{}` is not a dotted identifier",
                    self.name
                )));
            }
        }
        if IntegrationPlan::for_definition(&self) == IntegrationPlan::Adaptive {
            self.inject_solver_parameters();
        }
        Ok(self)
    }

    fn validate_methods(&self) -> ModelgenResult<()> {
        let mut seen: Vec<&str> = Vec::new();
        for (kind, name) in self.methods.iter() {
            if !is_identifier(name) {
                return Err(ModelgenError::Definition(format!(
                    "{kind} method `{name}` of model `{}` is not a valid identifier",
                    self.name
                )));
            }
            if seen.contains(&name) {
                return Err(ModelgenError::Definition(format!(
                    "method `{name}` of model `{}` is classified more than once",
                    self.name
                )));
            }
            seen.push(name);
        }
        for method in self.references.keys() {
            if !self.methods.contains(method) {
                return Err(ModelgenError::Definition(format!(
                    "references declared for unknown method `{method}` of model `{}`",
                    self.name
                )));
            }
        }
        Ok(())
    }

    fn validate_submodels(&self) -> ModelgenResult<()> {
        for (idx, sub) in self.submodels.iter().enumerate() {
            let clashes = RESERVED_NAMES.contains(&sub.name.as_str())
                || self.methods.contains(&sub.name)
                || self.submodels[..idx].iter().any(|o| o.name == sub.name);
            if !is_identifier(&sub.name) || clashes {
                return Err(ModelgenError::Definition(format!(
                    "`{}` cannot name a sub-model of `{}`",
                    sub.name, self.name
                )));
            }
        }
        Ok(())
    }

    fn inject_solver_parameters(&mut self) {
        let group = match self.groups.iter_mut().find(|g| g.kind == GroupKind::Solver) {
            Some(group) => group,
            None => {
                self.groups.push(VariableGroup::new(GroupKind::Solver));
                self.groups.sort_by_key(|g| g.kind);
                match self.groups.iter_mut().find(|g| g.kind == GroupKind::Solver) {
                    Some(group) => group,
                    None => return,
                }
            }
        };
        for name in SOLVER_PARAMETERS {
            if !group.contains(name) {
                group.variables.push(Variable::float(name));
            }
        }
    }
}

/// Incrementally assembles a [`ModelDefinition`] in memory.
#[derive(Debug, Clone)]
pub struct ModelDefinitionBuilder {
    definition: ModelDefinition,
}

impl ModelDefinitionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            definition: ModelDefinition {
                name: name.into(),
                manifest: None,
                sources: Vec::new(),
                groups: Vec::new(),
                methods: MethodLists::default(),
                references: BTreeMap::new(),
                aliases: BTreeMap::new(),
                submodels: Vec::new(),
            },
        }
    }

    pub fn source(mut self, source: SourceFile) -> Self {
        self.definition.sources.push(source);
        self
    }

    pub fn group(mut self, group: VariableGroup) -> Self {
        self.definition.groups.push(group);
        self
    }

    pub fn method(mut self, kind: MethodKind, name: impl Into<String>) -> Self {
        self.definition.methods.get_mut(kind).push(name.into());
        self
    }

    pub fn references(mut self, method: impl Into<String>, references: MethodReferences) -> Self {
        self.definition.references.insert(method.into(), references);
        self
    }

    pub fn alias(mut self, alias: impl Into<String>, target: impl Into<String>) -> Self {
        self.definition.aliases.insert(alias.into(), target.into());
        self
    }

    pub fn submodel(mut self, name: impl Into<String>, definition: ModelDefinition) -> Self {
        self.definition.submodels.push(Submodel {
            name: name.into(),
            definition,
        });
        self
    }

    pub fn build(self) -> ModelgenResult<ModelDefinition> {
        self.definition.finalize()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestFile {
    name: String,
    #[serde(default)]
    sources: Vec<PathBuf>,
    #[serde(default)]
    groups: Vec<VariableGroup>,
    #[serde(default)]
    methods: MethodLists,
    #[serde(default)]
    references: BTreeMap<String, ReferenceTable>,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
    #[serde(default)]
    submodels: Vec<SubmodelEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ReferenceTable {
    requires: Vec<String>,
    results: Vec<String>,
    updates: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubmodelEntry {
    name: String,
    manifest: PathBuf,
}

impl ManifestFile {
    fn read(path: &Path) -> ModelgenResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ModelgenError::io(path, e))?;
        toml::from_str(&text).map_err(|source| ModelgenError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl ReferenceTable {
    fn parse(&self, method: &str) -> ModelgenResult<MethodReferences> {
        let parse_all = |items: &[String]| {
            items
                .iter()
                .map(|item| {
                    DeclaredRef::parse(item).ok_or_else(|| {
                        ModelgenError::Definition(format!(
                            "reference `{item}` of method `{method}` must have the form `group.variable`"
                        ))
                    })
                })
                .collect::<ModelgenResult<Vec<_>>>()
        };
        Ok(MethodReferences {
            requires: parse_all(&self.requires)?,
            results: parse_all(&self.results)?,
            updates: parse_all(&self.updates)?,
        })
    }
}

fn canonical(path: &Path) -> ModelgenResult<PathBuf> {
    std::fs::canonicalize(path).map_err(|e| ModelgenError::io(path, e))
}

fn manifest_dir(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

fn node_for(
    graph: &mut DiGraph<PathBuf, ()>,
    nodes: &mut HashMap<PathBuf, NodeIndex>,
    path: &Path,
) -> NodeIndex {
    *nodes
        .entry(path.to_path_buf())
        .or_insert_with(|| graph.add_node(path.to_path_buf()))
}

fn build_from_manifest(
    path: &Path,
    manifests: &HashMap<PathBuf, ManifestFile>,
) -> ModelgenResult<ModelDefinition> {
    let manifest = manifests.get(path).ok_or_else(|| {
        ModelgenError::Definition(format!("manifest {} was not resolved", path.display()))
    })?;
    let dir = manifest_dir(path);

    let mut builder = ModelDefinition::builder(&manifest.name);
    for source in &manifest.sources {
        builder = builder.source(SourceFile::read(&dir.join(source))?);
    }
    for group in &manifest.groups {
        builder = builder.group(group.clone());
    }
    builder.definition.methods = manifest.methods.clone();
    for (method, table) in &manifest.references {
        builder = builder.references(method, table.parse(method)?);
    }
    for (alias, target) in &manifest.aliases {
        builder = builder.alias(alias, target);
    }
    for entry in &manifest.submodels {
        let child = canonical(&dir.join(&entry.manifest))?;
        builder = builder.submodel(&entry.name, build_from_manifest(&child, manifests)?);
    }
    builder.definition.manifest = Some(path.to_path_buf());
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decay() -> ModelDefinitionBuilder {
        ModelDefinition::builder("decay")
            .source(SourceFile::new("decay.mdl", ""))
            .group(VariableGroup::new(GroupKind::States).variable(Variable::float("y").numeric()))
            .group(VariableGroup::new(GroupKind::Fluxes).variable(Variable::float("dy").numeric()))
            .group(VariableGroup::new(GroupKind::Control).variable(Variable::float("k")))
            .method(MethodKind::PartOde, "calc_dy")
            .method(MethodKind::FullOde, "update_y")
    }

    #[test]
    fn groups_are_ordered_and_solver_parameters_injected() {
        let definition = decay().build().unwrap();
        let kinds: Vec<GroupKind> = definition.groups().iter().map(|g| g.kind).collect();
        assert_eq!(
            kinds,
            vec![
                GroupKind::Control,
                GroupKind::Solver,
                GroupKind::Fluxes,
                GroupKind::States
            ]
        );
        assert_eq!(
            definition.group(GroupKind::Solver).unwrap().names(),
            SOLVER_PARAMETERS.to_vec()
        );
    }

    #[test]
    fn direct_models_get_no_solver_parameters() {
        let definition = ModelDefinition::builder("counter")
            .group(VariableGroup::new(GroupKind::States).variable(Variable::float("n")))
            .method(MethodKind::FullOde, "increment")
            .build()
            .unwrap();
        assert!(definition.group(GroupKind::Solver).is_none());
    }

    #[test]
    fn duplicate_classification_is_rejected() {
        let err = decay()
            .method(MethodKind::Run, "calc_dy")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn reserved_submodel_names_are_rejected() {
        let sub = ModelDefinition::builder("loss").build().unwrap();
        assert!(decay().submodel("sequences", sub.clone()).build().is_err());
        assert!(decay().submodel("calc_dy", sub.clone()).build().is_err());
        assert!(decay().submodel("loss", sub).build().is_ok());
    }

    #[test]
    fn contributors_are_depth_first_and_unique() {
        let leaf = ModelDefinition::builder("leaf")
            .source(SourceFile::new("shared.mdl", ""))
            .source(SourceFile::new("leaf.mdl", ""))
            .build()
            .unwrap();
        let definition = decay()
            .source(SourceFile::new("shared.mdl", ""))
            .submodel("leaf", leaf)
            .build()
            .unwrap();
        assert_eq!(
            definition.contributors(),
            vec![
                PathBuf::from("decay.mdl"),
                PathBuf::from("shared.mdl"),
                PathBuf::from("leaf.mdl")
            ]
        );
        assert_eq!(definition.source_paths(), definition.contributors());
        assert_eq!(
            definition
                .descend(&["leaf".to_string()])
                .map(|d| d.name.as_str()),
            Some("leaf")
        );
    }
}
