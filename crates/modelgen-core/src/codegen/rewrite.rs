//! Resolves group shortcuts and model chains into fully qualified references.
//!
//! Rewriting is structural: every dotted chain of names in a logical line is
//! matched against the alias table (longest prefix first) and then walked
//! through the model's schema. A chain that ends on a variable becomes
//! `self.[<sub>.]<family>.<group>.<variable>`, a chain ending on a method call
//! becomes `self.[<sub>.]<method>`. Anything else is rejected.

use super::ast::GroupRef;
use super::lexer::{tokenize, LogicalLine, Token, TokenKind};
use super::Site;
use crate::config::GeneratorConfig;
use crate::errors::ModelgenResult;
use crate::manifest::ModelDefinition;
use crate::method::ModelMethod;
use crate::schema::{Family, GroupKind};
use std::collections::BTreeSet;
use tracing::trace;

/// What a (partial) chain designates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Model {
        owner: Vec<String>,
    },
    Family {
        owner: Vec<String>,
        family: Family,
    },
    Group {
        owner: Vec<String>,
        group: GroupRef,
    },
    Variable {
        owner: Vec<String>,
        group: GroupRef,
        name: String,
    },
    Method {
        owner: Vec<String>,
        name: String,
    },
}

/// Alias names to the chain prefix they stand for.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    entries: Vec<(Vec<String>, Resolved)>,
}

impl AliasTable {
    /// Group shortcuts of the model itself: `con`, `flu`, `new`, `old` and so on.
    pub fn shortcuts() -> Self {
        let mut table = Self::default();
        for kind in GroupKind::ALL {
            table.insert(kind.shortcut(), group(GroupRef::Kind(kind)));
        }
        table.insert("new", group(GroupRef::Kind(GroupKind::States)));
        table.insert("old", group(GroupRef::OldStates));
        table
    }

    pub fn insert(&mut self, alias: &str, target: Resolved) {
        let key: Vec<String> = alias.split('.').map(str::to_string).collect();
        self.entries.retain(|(k, _)| *k != key);
        self.entries.push((key, target));
    }

    /// The longest alias that is a prefix of `segments`, with its length.
    pub fn longest_prefix(&self, segments: &[String]) -> Option<(usize, &Resolved)> {
        self.entries
            .iter()
            .filter(|(key, _)| key.len() <= segments.len() && segments[..key.len()] == key[..])
            .max_by_key(|(key, _)| key.len())
            .map(|(key, target)| (key.len(), target))
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.join(".")).collect()
    }

    pub fn is_group_alias(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|(key, target)| key.len() == 1 && key[0] == name && !matches!(target, Resolved::Variable { .. }))
    }
}

fn group(group: GroupRef) -> Resolved {
    Resolved::Group {
        owner: Vec::new(),
        group,
    }
}

/// A method body after reference rewriting.
#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenMethod {
    /// Body lines; fast-accessor bindings are kept for the normalizer to drop.
    pub lines: Vec<LogicalLine>,
    /// Every alias name that was in scope.
    pub aliases: Vec<String>,
}

impl RewrittenMethod {
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|l| format!("{l}\n"))
            .collect::<String>()
    }
}

pub struct Rewriter<'a> {
    definition: &'a ModelDefinition,
    config: &'a GeneratorConfig,
    site: Site<'a>,
    aliases: AliasTable,
    declared: Option<BTreeSet<(GroupRef, String)>>,
}

impl<'a> Rewriter<'a> {
    pub fn new(
        definition: &'a ModelDefinition,
        method: &'a ModelMethod,
        config: &'a GeneratorConfig,
    ) -> ModelgenResult<Self> {
        let mut rewriter = Self {
            definition,
            config,
            site: Site::new(&definition.name, &method.name),
            aliases: AliasTable::shortcuts(),
            declared: None,
        };
        for (alias, target) in &definition.aliases {
            let segments: Vec<String> = target.split('.').map(str::to_string).collect();
            let resolved = rewriter.resolve_target(&segments, method.line)?;
            rewriter.aliases.insert(alias, resolved);
        }
        if !method.references.is_empty() {
            let mut declared = BTreeSet::new();
            for reference in method.references.iter() {
                let group = rewriter
                    .declared_group(&reference.group)
                    .filter(|g| definition.variable(g.kind(), &reference.variable).is_some())
                    .ok_or_else(|| {
                        rewriter.site.unsupported(
                            method.line,
                            format!("declared reference `{reference}` does not name a variable"),
                        )
                    })?;
                declared.insert((group, reference.variable.clone()));
            }
            rewriter.declared = Some(declared);
        }
        Ok(rewriter)
    }

    fn declared_group(&self, name: &str) -> Option<GroupRef> {
        match self.aliases.longest_prefix(&[name.to_string()]) {
            Some((_, Resolved::Group { owner, group })) if owner.is_empty() => Some(*group),
            _ => GroupRef::from_attr_name(Family::Parameters, name)
                .or_else(|| GroupRef::from_attr_name(Family::Sequences, name)),
        }
    }

    /// Rewrite the body of `method`.
    pub fn rewrite(mut self, method: &ModelMethod) -> ModelgenResult<RewrittenMethod> {
        let block = tokenize(&method.source, method.line)
            .map_err(|e| self.site.unsupported(e.line, e.message))?;
        let mut lines = Vec::new();
        for line in block.lines.into_iter().skip(1) {
            if line.contains_name(&self.config.slowpath_marker) {
                if line.is_block_header() {
                    return Err(self.site.unsupported(
                        line.line,
                        "a block header may not reference the slow path",
                    ));
                }
                trace!(method = %method.name, line = line.line, "Dropping slow-path statement");
                continue;
            }
            if line.contains_name(&self.config.fastaccess_marker) {
                self.bind_alias(&line)?;
                lines.push(line);
                continue;
            }
            let tokens = self.rewrite_tokens(&line)?;
            lines.push(LogicalLine { tokens, ..line });
        }
        Ok(RewrittenMethod {
            lines,
            aliases: self.aliases.names(),
        })
    }

    /// Record `name = <chain>.fastaccess` as a new alias.
    fn bind_alias(&mut self, line: &LogicalLine) -> ModelgenResult<()> {
        let marker = &self.config.fastaccess_marker;
        let tokens = &line.tokens;
        let binding = tokens.len() >= 5
            && tokens[0].kind == TokenKind::Name
            && tokens[1].is_op("=")
            && tokens[tokens.len() - 1].is_name(marker)
            && tokens[tokens.len() - 2].is_op(".");
        let chain = binding.then(|| chain_segments(&tokens[2..tokens.len() - 2])).flatten();
        let Some(segments) = chain else {
            return Err(self.site.unsupported(
                line.line,
                format!("`{marker}` may only appear in an alias binding `name = <group>.{marker}`"),
            ));
        };
        let target = self.resolve_target(&segments, line.line)?;
        trace!(alias = %tokens[0].text, target = ?target, "Bound fast-accessor alias");
        self.aliases.insert(&tokens[0].text, target);
        Ok(())
    }

    /// Resolve an alias target, which may stop at a model, family or group.
    fn resolve_target(&self, segments: &[String], line: usize) -> ModelgenResult<Resolved> {
        let (start, rest) = self.chain_start(segments, false, line)?;
        let resolved = self.walk(start, rest, false, line)?;
        match resolved {
            Resolved::Variable { .. } | Resolved::Method { .. } => Err(self.site.unsupported(
                line,
                format!("`{}` cannot be aliased; only models and groups can", segments.join(".")),
            )),
            other => Ok(other),
        }
    }

    fn rewrite_tokens(&self, line: &LogicalLine) -> ModelgenResult<Vec<Token>> {
        let tokens = &line.tokens;
        let mut out = Vec::with_capacity(tokens.len());
        let mut i = 0;
        while i < tokens.len() {
            let token = &tokens[i];
            let after_dot = i > 0 && tokens[i - 1].is_op(".");
            if token.kind != TokenKind::Name || after_dot {
                out.push(token.clone());
                i += 1;
                continue;
            }
            if token.text == "self" {
                return Err(self
                    .site
                    .unsupported(line.line, "`self` is reserved and may not be used in method source"));
            }
            let mut segments = vec![token.text.clone()];
            let mut j = i;
            while j + 2 < tokens.len()
                && tokens[j + 1].is_op(".")
                && tokens[j + 2].kind == TokenKind::Name
            {
                segments.push(tokens[j + 2].text.clone());
                j += 2;
            }
            let call = tokens.get(j + 1).is_some_and(|t| t.is_op("("));
            match self.resolve_use(&segments, call, line.line)? {
                Some(replacement) => out.extend(replacement),
                None => out.extend(tokens[i..=j].iter().cloned()),
            }
            i = j + 1;
        }
        Ok(out)
    }

    /// `None` leaves the chain untouched (locals, arguments, builtins, keywords).
    fn resolve_use(
        &self,
        segments: &[String],
        call: bool,
        line: usize,
    ) -> ModelgenResult<Option<Vec<Token>>> {
        let head = segments[0].as_str();
        if segments.len() == 1 {
            if call {
                return Ok(None);
            }
            if head == "model" || self.aliases.is_group_alias(head) {
                return Err(self.site.unsupported(
                    line,
                    format!("bare `{head}` cannot be used as a value"),
                ));
            }
            if self.aliases.longest_prefix(segments).is_none() {
                return Ok(None);
            }
        }
        if head == self.config.helper_module
            && segments.len() == 2
            && self.aliases.longest_prefix(segments).is_none()
        {
            return Ok(Some(vec![Token::name(segments[1].clone())]));
        }
        let (start, rest) = self.chain_start(segments, true, line)?;
        match self.walk(start, rest, call, line)? {
            Resolved::Variable { owner, group, name } => {
                self.check_declared(&owner, group, &name, line)?;
                let mut path = owner.clone();
                path.push(group.family().attr_name().to_string());
                path.push(group.attr_name().to_string());
                path.push(name);
                Ok(Some(qualified(&path)))
            }
            Resolved::Method { owner, name } => {
                let mut path = owner;
                path.push(name);
                Ok(Some(qualified(&path)))
            }
            _ => Err(self.site.unsupported(
                line,
                format!("`{}` does not designate a variable", segments.join(".")),
            )),
        }
    }

    fn chain_start<'s>(
        &self,
        segments: &'s [String],
        in_body: bool,
        line: usize,
    ) -> ModelgenResult<(Resolved, &'s [String])> {
        if let Some((len, target)) = self.aliases.longest_prefix(segments) {
            return Ok((target.clone(), &segments[len..]));
        }
        if segments[0] == "model" {
            return Ok((Resolved::Model { owner: Vec::new() }, &segments[1..]));
        }
        let what = if in_body { "object" } else { "alias target" };
        Err(self.site.unsupported(
            line,
            format!(
                "attribute access on unknown {what} `{}`",
                segments.join(".")
            ),
        ))
    }

    fn walk(
        &self,
        start: Resolved,
        rest: &[String],
        call: bool,
        line: usize,
    ) -> ModelgenResult<Resolved> {
        let marker = self.config.fastaccess_marker.as_str();
        let mut position = start;
        for (idx, segment) in rest.iter().enumerate() {
            let last = idx + 1 == rest.len();
            position = match position {
                Resolved::Model { mut owner } => {
                    let model = self.model(&owner, line)?;
                    if let Some(family) = Family::from_attr_name(segment) {
                        Resolved::Family { owner, family }
                    } else if model.submodel(segment).is_some() {
                        owner.push(segment.clone());
                        Resolved::Model { owner }
                    } else if last && call && model.methods.contains(segment) {
                        Resolved::Method {
                            owner,
                            name: segment.clone(),
                        }
                    } else {
                        return Err(self.site.unsupported(
                            line,
                            format!(
                                "`{segment}` is neither a variable family, a sub-model nor a method of model `{}`",
                                model.name
                            ),
                        ));
                    }
                }
                Resolved::Family { owner, family } => {
                    let model = self.model(&owner, line)?;
                    match GroupRef::from_attr_name(family, segment) {
                        Some(group) if model.group(group.kind()).is_some() => {
                            Resolved::Group { owner, group }
                        }
                        _ => {
                            return Err(self.site.unsupported(
                                line,
                                format!(
                                    "unknown group `{segment}` in {} of model `{}`",
                                    family.attr_name(),
                                    model.name
                                ),
                            ))
                        }
                    }
                }
                Resolved::Group { owner, group } if segment == marker => {
                    Resolved::Group { owner, group }
                }
                Resolved::Group { owner, group } => {
                    let model = self.model(&owner, line)?;
                    if model.group(group.kind()).is_none() {
                        return Err(self.site.unsupported(
                            line,
                            format!(
                                "unknown group `{}` of model `{}`",
                                group.attr_name(),
                                model.name
                            ),
                        ));
                    }
                    if model.variable(group.kind(), segment).is_none() {
                        return Err(self.site.unsupported(
                            line,
                            format!(
                                "unknown variable `{segment}` in group `{}`",
                                group.attr_name()
                            ),
                        ));
                    }
                    Resolved::Variable {
                        owner,
                        group,
                        name: segment.clone(),
                    }
                }
                Resolved::Variable { name, .. } => {
                    return Err(self.site.unsupported(
                        line,
                        format!("attribute access `{segment}` on variable `{name}`"),
                    ))
                }
                Resolved::Method { name, .. } => {
                    return Err(self.site.unsupported(
                        line,
                        format!("attribute access `{segment}` on method `{name}`"),
                    ))
                }
            };
        }
        Ok(position)
    }

    fn model(&self, owner: &[String], line: usize) -> ModelgenResult<&'a ModelDefinition> {
        self.definition.descend(owner).ok_or_else(|| {
            self.site
                .unsupported(line, format!("unknown sub-model `{}`", owner.join(".")))
        })
    }

    fn check_declared(
        &self,
        owner: &[String],
        group: GroupRef,
        name: &str,
        line: usize,
    ) -> ModelgenResult<()> {
        let Some(declared) = &self.declared else {
            return Ok(());
        };
        if !owner.is_empty() {
            return Ok(());
        }
        let counterpart = match group {
            GroupRef::OldStates => Some(GroupRef::Kind(GroupKind::States)),
            GroupRef::Kind(GroupKind::States) => Some(GroupRef::OldStates),
            _ => None,
        };
        let known = declared.contains(&(group, name.to_string()))
            || counterpart.is_some_and(|c| declared.contains(&(c, name.to_string())));
        if known {
            Ok(())
        } else {
            Err(self.site.unsupported(
                line,
                format!(
                    "`{}.{name}` is used but not declared in the method's references",
                    group.attr_name()
                ),
            ))
        }
    }
}

/// Names of a purely dotted chain, `None` if the tokens are anything else.
fn chain_segments(tokens: &[Token]) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    for (idx, token) in tokens.iter().enumerate() {
        if idx % 2 == 0 {
            if token.kind != TokenKind::Name {
                return None;
            }
            segments.push(token.text.clone());
        } else if !token.is_op(".") {
            return None;
        }
    }
    (!segments.is_empty() && tokens.len() % 2 == 1).then_some(segments)
}

fn qualified(path: &[String]) -> Vec<Token> {
    let mut tokens = vec![Token::name("self")];
    for segment in path {
        tokens.push(Token::op("."));
        tokens.push(Token::name(segment.clone()));
    }
    tokens
}

/// Rewrite one introspected method of `definition`.
pub fn rewrite(
    definition: &ModelDefinition,
    method: &ModelMethod,
    config: &GeneratorConfig,
) -> ModelgenResult<RewrittenMethod> {
    Rewriter::new(definition, method, config)?.rewrite(method)
}
