#![forbid(unsafe_code)]

//! Variable interpolation.
//!
//! Replaces `$name`, `${name}`, `${name:format}`, `${name.path}`,
//! `[[name]]` and `[[name:format]]` tokens with formatted values.
//!
//! # Lookup order
//!
//! 1. Scoped variables passed by the caller (e.g. `__interval`).
//! 2. Macros: `__from`, `__to` (nearest time range, epoch ms) and
//!    `__all_variables` (every visible variable as query parameters).
//! 3. Scene variables, nearest definition first.
//!
//! Unknown names are left in place; [`interpolate_with`] can turn them into
//! an [`InterpolationError`] instead.

mod formats;

use std::collections::BTreeMap;
use std::fmt;

use regex::Captures;
use scenes_core::SceneObject;
use serde_json::Value;
use tracing::trace;

use crate::time_range::get_time_range;
use crate::variables::{
    ALL_VARIABLES_SENTINEL, ResolvedValue, VARIABLE_REGEX, lookup_variable, scalar_to_string,
    visible_variables,
};

pub use formats::{CustomFormat, FormatInput, VariableFormat};

/// A caller-supplied variable that shadows scene variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedVar {
    /// Display text.
    pub text: String,
    /// Value; objects can be addressed with `${name.path}`.
    pub value: Value,
}

impl ScopedVar {
    /// Scoped variable whose text is its value.
    pub fn new(value: impl Into<Value>) -> Self {
        let value = value.into();
        Self {
            text: scalar_to_string(&value),
            value,
        }
    }

    /// Override the display text.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }
}

/// Scoped variables by name.
pub type ScopedVars = BTreeMap<String, ScopedVar>;

/// Interpolation settings.
#[derive(Debug, Clone, Default)]
pub struct InterpolateOptions {
    /// Variables taking precedence over the scene.
    pub scoped_vars: Option<ScopedVars>,
    /// Format for tokens that do not name one; glob when unset.
    pub format: Option<VariableFormat>,
    /// Fail instead of leaving unknown tokens in place.
    pub error_on_missing: bool,
}

impl InterpolateOptions {
    /// Set scoped variables.
    #[must_use]
    pub fn with_scoped_vars(mut self, scoped_vars: ScopedVars) -> Self {
        self.scoped_vars = Some(scoped_vars);
        self
    }

    /// Set the default format.
    #[must_use]
    pub fn with_format(mut self, format: VariableFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Fail on unknown variables.
    #[must_use]
    pub fn with_error_on_missing(mut self, error_on_missing: bool) -> Self {
        self.error_on_missing = error_on_missing;
        self
    }
}

/// Tokens that named no known variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpolationError {
    /// Unresolved names, in order of appearance.
    pub missing: Vec<String>,
}

impl fmt::Display for InterpolationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variables: {}", self.missing.join(", "))
    }
}

impl std::error::Error for InterpolationError {}

enum Token {
    Value { value: ResolvedValue, text: String },
    Literal(String),
}

fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(fields) => fields.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn resolve_scoped(var: &ScopedVar, field_path: Option<&str>) -> Token {
    let value = match field_path {
        Some("text") => ResolvedValue::Text(var.text.clone()),
        Some(path) => json_path(&var.value, path)
            .map_or_else(|| ResolvedValue::Text(String::new()), ResolvedValue::from_json),
        None => ResolvedValue::from_json(&var.value),
    };
    Token::Value {
        value,
        text: var.text.clone(),
    }
}

fn all_variables_query(object: &SceneObject) -> String {
    visible_variables(object)
        .into_iter()
        .filter(|variable| !variable.skip_url_sync())
        .map(|variable| {
            VariableFormat::QueryParam.apply(&FormatInput {
                name: &variable.name(),
                value: &variable.get_value(None),
                text: &variable.get_value_text(),
            })
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn resolve(
    object: &SceneObject,
    name: &str,
    field_path: Option<&str>,
    scoped: Option<&ScopedVars>,
) -> Option<Token> {
    if let Some(var) = scoped.and_then(|vars| vars.get(name)) {
        return Some(resolve_scoped(var, field_path));
    }
    match name {
        "__from" | "__to" => {
            let range = get_time_range(object)?.value();
            let ms = if name == "__from" { range.from } else { range.to };
            return Some(Token::Value {
                value: ResolvedValue::Text(ms.to_string()),
                text: ms.to_string(),
            });
        }
        ALL_VARIABLES_SENTINEL => return Some(Token::Literal(all_variables_query(object))),
        _ => {}
    }
    let variable = lookup_variable(name, object)?;
    Some(Token::Value {
        value: variable.get_value(field_path),
        text: variable.get_value_text(),
    })
}

/// Interpolate with explicit settings.
///
/// # Errors
///
/// Returns [`InterpolationError`] when `error_on_missing` is set and a token
/// names no known variable.
pub fn interpolate_with(
    object: &SceneObject,
    text: &str,
    options: &InterpolateOptions,
) -> Result<String, InterpolationError> {
    if !text.contains('$') && !text.contains("[[") {
        return Ok(text.to_owned());
    }
    let mut missing = Vec::new();
    let out = VARIABLE_REGEX.replace_all(text, |caps: &Captures<'_>| {
        let Some(name) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(4)) else {
            return caps[0].to_owned();
        };
        let field_path = caps.get(5).map(|m| m.as_str());
        let token_format = caps
            .get(3)
            .or_else(|| caps.get(6))
            .map(|m| VariableFormat::from_name_or_default(m.as_str()));

        match resolve(object, name.as_str(), field_path, options.scoped_vars.as_ref()) {
            Some(Token::Literal(literal)) => literal,
            Some(Token::Value { value, text }) => {
                let format = token_format
                    .as_ref()
                    .or(options.format.as_ref())
                    .cloned()
                    .unwrap_or_default();
                format.apply(&FormatInput {
                    name: name.as_str(),
                    value: &value,
                    text: &text,
                })
            }
            None => {
                trace!(key = %object.key(), variable = name.as_str(), "unresolved variable");
                missing.push(name.as_str().to_owned());
                caps[0].to_owned()
            }
        }
    });
    if options.error_on_missing && !missing.is_empty() {
        return Err(InterpolationError { missing });
    }
    Ok(out.into_owned())
}

/// Interpolate `text` as seen from `object`. Unknown tokens are kept.
#[must_use]
pub fn interpolate(
    object: &SceneObject,
    text: &str,
    scoped: Option<&ScopedVars>,
    format: Option<&VariableFormat>,
) -> String {
    let options = InterpolateOptions {
        scoped_vars: scoped.cloned(),
        format: format.cloned(),
        error_on_missing: false,
    };
    interpolate_with(object, text, &options).unwrap_or_else(|_| text.to_owned())
}

/// Interpolate every string leaf of a JSON value.
///
/// # Errors
///
/// Same as [`interpolate_with`], reported for the first failing leaf.
pub fn interpolate_json(
    object: &SceneObject,
    value: &Value,
    options: &InterpolateOptions,
) -> Result<Value, InterpolationError> {
    Ok(match value {
        Value::String(s) => Value::String(interpolate_with(object, s, options)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| interpolate_json(object, item, options))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| Ok((k.clone(), interpolate_json(object, v, options)?)))
                .collect::<Result<_, InterpolationError>>()?,
        ),
        other => other.clone(),
    })
}
