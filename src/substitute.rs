//! Placeholder substitution for resource files.
//!
//! Resource files may embed `${...}` tokens that are resolved against the
//! databag before the file is handed to an external tool:
//!
//! ```text
//! name: ${cluster_name}                       databag lookup
//! token: ${env(API_TOKEN)}                    resolver call
//! endpoint: ${host':'port}                    lookups joined by a literal
//! auth: ${user':'env(PASSWORD)|base64}        transform chain
//! ```
//!
//! Single-quoted literals may contain `\'` for a literal quote and `|` is only
//! a transform separator outside literals. Every distinct token on a line is
//! resolved once and replaced everywhere it occurs. Lines that need no
//! substitution are copied byte for byte, line endings included.
//!
//! Any unresolvable token is fatal on `up`. On `down` the original content is
//! returned untouched: a teardown must not be blocked by a value that only
//! existed because the stage was once up.

use crate::databag::Databag;
use crate::error::{Result, StagehandError};
use crate::types::Verb;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Resolver functions callable as `name(argument)` inside a token
const RESOLVERS: &[(&str, fn(&str) -> Option<String>)] = &[("env", resolve_env)];

/// Transforms usable after `|` in a token
const TRANSFORMS: &[(&str, fn(&str) -> String)] = &[
    ("base64", base64_encode),
    ("upper", str::to_uppercase),
    ("lower", str::to_lowercase),
    ("trim", trim),
];

fn token_regex() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r"\$\{[^}]+\}").expect("token regex is valid"))
}

fn resolve_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn base64_encode(value: &str) -> String {
    STANDARD.encode(value)
}

fn trim(value: &str) -> String {
    value.trim().to_string()
}

/// One piece of a value expression
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Literal(String),
    Lookup(&'a str),
}

/// Resolve the inside of one `${...}` token
pub fn resolve_token(expression: &str, databag: &Databag) -> Result<String> {
    let parts = split_transforms(expression)?;
    let (value_expr, transforms) = parts
        .split_first()
        .ok_or_else(|| StagehandError::missing_value(expression, "empty expression"))?;

    let mut value = resolve_value(value_expr, databag)?;
    for name in transforms {
        let name = name.trim();
        let transform = TRANSFORMS
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, f)| f)
            .ok_or_else(|| {
                StagehandError::missing_value(expression, format!("unknown transform '{}'", name))
            })?;
        value = transform(&value);
    }
    Ok(value)
}

/// Resolve a value expression: lookups and literals concatenated in order
pub fn resolve_value(expression: &str, databag: &Databag) -> Result<String> {
    let segments = parse_segments(expression)?;
    if segments.is_empty() {
        return Err(StagehandError::missing_value(expression, "empty expression"));
    }

    let mut value = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(text) => value.push_str(&text),
            Segment::Lookup(lookup) => value.push_str(&resolve_lookup(lookup, databag)?),
        }
    }
    Ok(value)
}

fn resolve_lookup(lookup: &str, databag: &Databag) -> Result<String> {
    match parse_call(lookup)? {
        Some((function, argument)) => {
            let resolver = RESOLVERS
                .iter()
                .find(|(name, _)| *name == function)
                .map(|(_, f)| f)
                .ok_or_else(|| {
                    StagehandError::missing_value(lookup, format!("unknown function '{}'", function))
                })?;
            resolver(argument).ok_or_else(|| {
                StagehandError::missing_value(lookup, format!("{}({}) is not set", function, argument))
            })
        }
        None => databag
            .get(lookup)
            .map(str::to_string)
            .ok_or_else(|| StagehandError::missing_value(lookup, "not found in databag")),
    }
}

/// Split `name(argument)` into its parts; `None` for a plain databag key
fn parse_call(lookup: &str) -> Result<Option<(&str, &str)>> {
    let Some(open) = lookup.find('(') else {
        if lookup.contains(')') {
            return Err(StagehandError::missing_value(lookup, "unbalanced ')'"));
        }
        return Ok(None);
    };

    let Some(inner) = lookup[open + 1..].strip_suffix(')') else {
        return Err(StagehandError::missing_value(lookup, "expected ')' at end of call"));
    };
    if inner.contains('(') || inner.contains(')') {
        return Err(StagehandError::missing_value(lookup, "nested calls are not allowed"));
    }

    let function = lookup[..open].trim();
    if function.is_empty() || !function.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StagehandError::missing_value(lookup, "invalid function name"));
    }
    Ok(Some((function, inner.trim())))
}

/// Split a value expression into literal and lookup segments
fn parse_segments(expression: &str) -> Result<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    let mut lookup_start = 0;
    let mut chars = expression.char_indices().peekable();

    while let Some((index, c)) = chars.next() {
        if c != '\'' {
            continue;
        }
        push_lookup(&mut segments, &expression[lookup_start..index]);

        let mut literal = String::new();
        let mut closed = false;
        while let Some((end, c)) = chars.next() {
            match c {
                '\\' if matches!(chars.peek(), Some((_, '\''))) => {
                    literal.push('\'');
                    chars.next();
                }
                '\'' => {
                    closed = true;
                    lookup_start = end + 1;
                    break;
                }
                other => literal.push(other),
            }
        }
        if !closed {
            return Err(StagehandError::missing_value(
                expression,
                "unterminated string literal",
            ));
        }
        segments.push(Segment::Literal(literal));
    }
    push_lookup(&mut segments, &expression[lookup_start..]);

    Ok(segments)
}

fn push_lookup<'a>(segments: &mut Vec<Segment<'a>>, text: &'a str) {
    let lookup = text.trim();
    if !lookup.is_empty() {
        segments.push(Segment::Lookup(lookup));
    }
}

/// Split on `|` outside of string literals
fn split_transforms(expression: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_literal = false;
    let mut escaped = false;

    for (index, c) in expression.char_indices() {
        if in_literal {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '\'' => in_literal = false,
                _ => {}
            }
            continue;
        }
        match c {
            '\'' => in_literal = true,
            '|' => {
                parts.push(&expression[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    if in_literal {
        return Err(StagehandError::missing_value(
            expression,
            "unterminated string literal",
        ));
    }
    parts.push(&expression[start..]);
    Ok(parts)
}

/// Substitute every token on one line
pub fn substitute_line(line: &str, databag: &Databag) -> Result<String> {
    let re = token_regex();
    let mut resolved: HashMap<&str, String> = HashMap::new();
    for token in re.find_iter(line).map(|m| m.as_str()) {
        if resolved.contains_key(token) {
            continue;
        }
        let expression = &token[2..token.len() - 1];
        resolved.insert(token, resolve_token(expression, databag)?);
    }

    if resolved.is_empty() {
        return Ok(line.to_string());
    }

    Ok(re
        .replace_all(line, |caps: &Captures| resolved[&caps[0]].clone())
        .into_owned())
}

fn is_comment(line: &str, comment: Option<&str>) -> bool {
    comment.is_some_and(|marker| !marker.is_empty() && line.trim_start().starts_with(marker))
}

/// Substitute a whole document.
///
/// Lines starting with `comment` (after leading whitespace) are copied as-is.
pub fn substitute(
    content: &str,
    databag: &Databag,
    verb: Verb,
    comment: Option<&str>,
) -> Result<String> {
    let mut out = String::with_capacity(content.len());
    for line in content.split_inclusive('\n') {
        if is_comment(line, comment) {
            out.push_str(line);
            continue;
        }
        match substitute_line(line, databag) {
            Ok(substituted) => out.push_str(&substituted),
            Err(e) if verb == Verb::Down && e.is_missing_value() => {
                warn!("{} - system is going down, leaving placeholders unresolved", e);
                return Ok(content.to_string());
            }
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

/// Read `file` and return its substituted content
pub fn substitute_file_to_memory(
    file: &Path,
    databag: &Databag,
    verb: Verb,
    comment: Option<&str>,
) -> Result<String> {
    let content = fs::read_to_string(file)?;
    substitute(&content, databag, verb, comment)
        .map_err(|e| annotate(e, file))
}

/// Write the substituted copy of `file` into the processed tree and return its path
pub fn substitute_file_to_file(
    file: &Path,
    processed: &ProcessedTree,
    databag: &Databag,
    verb: Verb,
    comment: Option<&str>,
) -> Result<PathBuf> {
    let content = substitute_file_to_memory(file, databag, verb, comment)?;
    let target = processed.target_for(file);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&target, content)?;
    debug!("processed {} -> {}", file.display(), target.display());
    Ok(target)
}

fn annotate(err: StagehandError, file: &Path) -> StagehandError {
    match err {
        StagehandError::MissingValue { token, reason } => StagehandError::MissingValue {
            token,
            reason: format!("{} (in {})", reason, file.display()),
        },
        other => other,
    }
}

/// Mirrored output tree for substituted copies of resource files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedTree {
    root: PathBuf,
    dir: PathBuf,
}

impl ProcessedTree {
    /// `dir` is resolved against the project `root` when relative
    pub fn new(root: impl Into<PathBuf>, dir: impl AsRef<Path>) -> Self {
        let root = root.into();
        let dir = root.join(dir);
        Self { root, dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the processed copy of `file` lives
    pub fn target_for(&self, file: &Path) -> PathBuf {
        let relative = file.strip_prefix(&self.root).unwrap_or(file);
        let mut target = self.dir.clone();
        for component in relative.components() {
            if let Component::Normal(part) = component {
                target.push(part);
            }
        }
        target
    }
}
