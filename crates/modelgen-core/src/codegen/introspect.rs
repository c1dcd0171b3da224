//! Recovers method blocks from the host source files of a model.

use super::lexer::{clean_doc_string, tokenize, LogicalLine, TokenKind, TokenizedBlock};
use super::Site;
use crate::errors::{ModelgenError, ModelgenResult};
use crate::manifest::{ModelDefinition, SourceFile};
use crate::method::{MethodKind, ModelMethod};
use tracing::debug;

/// Locate and record method `name` of `definition`.
///
/// Source files are searched in resolution order and the first `def name(`
/// wins. The recorded block is lossless: the header plus every following line
/// that is blank or indented deeper than the header.
pub fn introspect(
    definition: &ModelDefinition,
    name: &str,
    kind: MethodKind,
    fastaccess_marker: &str,
) -> ModelgenResult<ModelMethod> {
    let site = Site::new(&definition.name, name);
    let Some((source, line, block)) = definition
        .sources
        .iter()
        .find_map(|source| find_block(source, name).map(|(line, block)| (source, line, block)))
    else {
        let searched = definition
            .sources
            .iter()
            .map(|s| s.path.display().to_string())
            .collect::<Vec<_>>();
        let detail = if searched.is_empty() {
            "the model has no source files".to_string()
        } else {
            format!("no `def {name}(` in {}", searched.join(", "))
        };
        return Err(ModelgenError::SourceIntrospection {
            model: definition.name.clone(),
            method: name.to_string(),
            detail,
        });
    };

    let tokenized = tokenize(&block, line).map_err(|e| site.unsupported(e.line, e.message))?;
    let header = tokenized
        .lines
        .first()
        .ok_or_else(|| site.unsupported(line, "empty method block"))?;
    let params = parse_header(header, name, &site)?;
    let body = &tokenized.lines[1..];
    match body.first() {
        Some(first) if first.indent > header.indent => {}
        _ => return Err(site.unsupported(line, "method has no indented body")),
    }

    let doc = docstring(&tokenized);
    let locals = collect_locals(body, &params, fastaccess_marker);
    debug!(
        model = %definition.name,
        method = name,
        origin = %source.path.display(),
        line,
        locals = locals.len(),
        "Introspected method"
    );
    Ok(ModelMethod {
        name: name.to_string(),
        kind,
        source: block,
        doc,
        params,
        locals,
        line,
        origin: source.path.clone(),
        references: definition
            .references
            .get(name)
            .cloned()
            .unwrap_or_default(),
    })
}

fn leading_width(line: &str) -> usize {
    let mut width = 0;
    for c in line.chars() {
        match c {
            ' ' => width += 1,
            '\t' => width = (width / 8 + 1) * 8,
            _ => break,
        }
    }
    width
}

fn is_header_of(line: &str, name: &str) -> bool {
    let Some(rest) = line.trim_start().strip_prefix("def") else {
        return false;
    };
    if !rest.starts_with([' ', '\t']) {
        return false;
    }
    rest.trim_start()
        .strip_prefix(name)
        .is_some_and(|after| after.trim_start().starts_with('('))
}

/// Returns the one-based header line and the raw block text.
fn find_block(source: &SourceFile, name: &str) -> Option<(usize, String)> {
    let lines: Vec<&str> = source.text.lines().collect();
    let start = lines.iter().position(|l| is_header_of(l, name))?;
    let indent = leading_width(lines[start]);
    let mut end = start + 1;
    while end < lines.len() {
        let line = lines[end];
        if !line.trim().is_empty() && leading_width(line) <= indent {
            break;
        }
        end += 1;
    }
    while end > start + 1 && lines[end - 1].trim().is_empty() {
        end -= 1;
    }
    let mut block = lines[start..end].join("\n");
    block.push('\n');
    Some((start + 1, block))
}

fn parse_header(header: &LogicalLine, name: &str, site: &Site) -> ModelgenResult<Vec<String>> {
    let tokens = &header.tokens;
    let malformed = || site.unsupported(header.line, format!("malformed header `{}`", header.render()));
    if tokens.len() < 5
        || !tokens[0].is_name("def")
        || !tokens[1].is_name(name)
        || !tokens[2].is_op("(")
        || !tokens[tokens.len() - 1].is_op(":")
        || !tokens[tokens.len() - 2].is_op(")")
    {
        return Err(malformed());
    }
    let mut params = Vec::new();
    let inner = &tokens[3..tokens.len() - 2];
    for (idx, chunk) in inner.split(|t| t.is_op(",")).enumerate() {
        match chunk {
            [token] if token.kind == TokenKind::Name => params.push(token.text.clone()),
            [] if idx > 0 && idx == inner.split(|t| t.is_op(",")).count() - 1 => {}
            _ => {
                return Err(site.unsupported(
                    header.line,
                    "parameters may not carry defaults, annotations or unpacking",
                ))
            }
        }
    }
    if params.first().map(String::as_str) != Some("model") {
        return Err(site.unsupported(
            header.line,
            "the first parameter of a method must be `model`",
        ));
    }
    Ok(params)
}

fn docstring(block: &TokenizedBlock) -> String {
    block
        .docstrings
        .iter()
        .find(|d| d.position == 1)
        .map(|d| clean_doc_string(&d.text))
        .unwrap_or_default()
}

/// Bare assignment targets and loop variables, in order of first appearance.
fn collect_locals(body: &[LogicalLine], params: &[String], fastaccess_marker: &str) -> Vec<String> {
    let mut locals: Vec<String> = Vec::new();
    for line in body {
        if line.contains_name(fastaccess_marker) {
            continue;
        }
        let candidate = match line.tokens.as_slice() {
            [for_kw, var, in_kw, ..] if for_kw.is_name("for") && in_kw.is_name("in") => Some(var),
            [target, op, ..]
                if target.kind == TokenKind::Name
                    && op.kind == TokenKind::Op
                    && op.text.ends_with('=')
                    && !["==", "<=", ">=", "!="].contains(&op.text.as_str()) =>
            {
                Some(target)
            }
            _ => None,
        };
        if let Some(token) = candidate {
            if token.kind == TokenKind::Name
                && !params.contains(&token.text)
                && !locals.contains(&token.text)
            {
                locals.push(token.text.clone());
            }
        }
    }
    locals
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
import modelutils

def calc_qz(model, d_scale):
    """Outflow of every zone.

    Scaled linearly.
    """
    con = model.parameters.control.fastaccess
    flu = model.sequences.fluxes.fastaccess
    d_sum = 0.0
    for idx in range(con.nmbzones):

        flu.qz[idx] = (d_scale *
                       con.k)
        d_sum += flu.qz[idx]
    flu.q = d_sum

def other(model):
    pass
"#;

    fn definition(text: &str) -> ModelDefinition {
        ModelDefinition::builder("zones")
            .source(SourceFile::new("empty.mdl", "def unrelated(model):\n    pass\n"))
            .source(SourceFile::new("zones.mdl", text))
            .method(MethodKind::Run, "calc_qz")
            .build()
            .unwrap()
    }

    #[test]
    fn records_block_doc_params_and_locals() {
        let method =
            introspect(&definition(SOURCE), "calc_qz", MethodKind::Run, "fastaccess").unwrap();
        assert_eq!(method.line, 4);
        assert_eq!(method.origin.to_str(), Some("zones.mdl"));
        assert_eq!(method.params, vec!["model", "d_scale"]);
        assert_eq!(method.args(), &["d_scale".to_string()]);
        assert_eq!(method.locals, vec!["d_sum", "idx"]);
        assert_eq!(method.doc, "Outflow of every zone.\n\nScaled linearly.");
        assert!(method.source.starts_with("def calc_qz(model, d_scale):"));
        assert!(method.source.trim_end().ends_with("flu.q = d_sum"));
        assert!(!method.source.contains("def other"));
    }

    #[test]
    fn missing_method_is_an_introspection_error() {
        let err = introspect(&definition(SOURCE), "calc_missing", MethodKind::Run, "fastaccess")
            .unwrap_err();
        match err {
            ModelgenError::SourceIntrospection { method, detail, .. } => {
                assert_eq!(method, "calc_missing");
                assert!(detail.contains("zones.mdl"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn first_parameter_must_be_the_model() {
        let err = introspect(
            &definition("def calc_qz(self):\n    pass\n"),
            "calc_qz",
            MethodKind::Run,
            "fastaccess",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ModelgenError::UnsupportedConstruct { line: 1, .. }
        ));
    }

    #[test]
    fn defaults_are_rejected() {
        assert!(introspect(
            &definition("def calc_qz(model, d_x=1.0):\n    pass\n"),
            "calc_qz",
            MethodKind::Run,
            "fastaccess",
        )
        .is_err());
    }
}
