#![forbid(unsafe_code)]

//! Variable kinds.

use std::rc::Rc;
use std::sync::LazyLock;

use regex::Regex;
use scenes_core::Deferred;
use serde_json::{Map, Value, json};
use tracing::warn;

use super::{
    AUTO_VARIABLE_VALUE, ResolvedValue, SceneVariable, VariableOption, VariableSource,
    scalar_to_string,
};
use crate::interpolate::interpolate;
use crate::time_range::{format_interval, get_time_range, parse_interval, round_interval};

type OptionsResult = Deferred<Result<Vec<VariableOption>, String>>;

static LABEL_VALUE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(.+)\s:\s(.+)$").expect("Invalid label/value regex"));

/// Split a custom-variable definition into options.
///
/// Entries are comma separated (`\,` escapes a comma); an entry of the form
/// `label : value` carries its own label.
#[must_use]
pub fn parse_custom_options(query: &str) -> Vec<VariableOption> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut chars = query.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&',') => {
                current.push(',');
                chars.next();
            }
            ',' => entries.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    entries.push(current);

    entries
        .into_iter()
        .filter(|entry| !entry.is_empty())
        .map(|entry| match LABEL_VALUE_REGEX.captures(&entry) {
            Some(caps) => VariableOption::new(caps[1].trim(), caps[2].trim()),
            None => VariableOption::same(entry.trim()),
        })
        .collect()
}

/// Options from a comma-separated list in the `query` field.
#[derive(Debug, Clone, Default)]
pub struct CustomSource {
    query: String,
}

impl CustomSource {
    /// Source for `query`, e.g. `"a,b,c"` or `"Prod : p, Dev : d"`.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
        }
    }
}

impl VariableSource for CustomSource {
    fn kind(&self) -> &'static str {
        "CustomVariable"
    }

    fn dependency_paths(&self) -> &'static [&'static str] {
        &["query"]
    }

    fn init_state(&self, state: &mut Map<String, Value>) {
        state.insert("query".into(), json!(self.query));
    }

    fn get_options(&self, variable: &SceneVariable) -> OptionsResult {
        let query = variable.object().state().get_str("query").unwrap_or_default().to_owned();
        let interpolated = interpolate(variable.object(), &query, None, None);
        Deferred::ready(Ok(parse_custom_options(&interpolated)))
    }
}

/// A fixed, hidden value.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantSource;

impl VariableSource for ConstantSource {
    fn kind(&self) -> &'static str {
        "ConstantVariable"
    }

    fn has_options(&self) -> bool {
        false
    }

    fn init_state(&self, state: &mut Map<String, Value>) {
        state.insert("hide".into(), json!(2));
        state.insert("skipUrlSync".into(), json!(true));
    }
}

/// Free text entered by the user.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextBoxSource;

impl VariableSource for TextBoxSource {
    fn kind(&self) -> &'static str {
        "TextBoxVariable"
    }

    fn has_options(&self) -> bool {
        false
    }
}

/// Options parsed from a JSON array in the `query` field.
///
/// Items are strings or objects with `value` and an optional `text`/`label`.
#[derive(Debug, Clone, Default)]
pub struct JsonSource {
    json: String,
}

impl JsonSource {
    /// Source for the given JSON document.
    #[must_use]
    pub fn new(json: impl Into<String>) -> Self {
        Self { json: json.into() }
    }

    fn parse(text: &str) -> Result<Vec<VariableOption>, String> {
        let parsed: Value =
            serde_json::from_str(text).map_err(|err| format!("invalid JSON options: {err}"))?;
        let Value::Array(items) = parsed else {
            return Err("JSON options must be an array".to_owned());
        };
        items
            .iter()
            .map(|item| match item {
                Value::Object(fields) => {
                    let value = fields
                        .get("value")
                        .map(scalar_to_string)
                        .ok_or_else(|| "JSON option is missing a value".to_owned())?;
                    let label = fields
                        .get("text")
                        .or_else(|| fields.get("label"))
                        .map_or_else(|| value.clone(), scalar_to_string);
                    Ok(VariableOption::new(label, value))
                }
                other => Ok(VariableOption::same(scalar_to_string(other))),
            })
            .collect()
    }
}

impl VariableSource for JsonSource {
    fn kind(&self) -> &'static str {
        "JsonVariable"
    }

    fn dependency_paths(&self) -> &'static [&'static str] {
        &["query"]
    }

    fn init_state(&self, state: &mut Map<String, Value>) {
        state.insert("query".into(), json!(self.json));
    }

    fn get_options(&self, variable: &SceneVariable) -> OptionsResult {
        let query = variable.object().state().get_str("query").unwrap_or_default().to_owned();
        let interpolated = interpolate(variable.object(), &query, None, None);
        Deferred::ready(Self::parse(&interpolated))
    }
}

/// A list of intervals, optionally with an automatic option computed from
/// the time range.
#[derive(Debug, Clone)]
pub struct IntervalSource {
    intervals: Vec<String>,
    auto: bool,
    auto_step_count: u32,
    auto_min_interval: String,
}

impl Default for IntervalSource {
    fn default() -> Self {
        Self::new(
            ["1m", "10m", "30m", "1h", "6h", "12h", "1d", "7d", "14d", "30d"]
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
        )
    }
}

impl IntervalSource {
    /// Source offering `intervals`.
    #[must_use]
    pub fn new(intervals: Vec<String>) -> Self {
        Self {
            intervals,
            auto: false,
            auto_step_count: 30,
            auto_min_interval: "10s".to_owned(),
        }
    }

    /// Add the automatic option, dividing the range into `step_count` steps
    /// no shorter than `min_interval`.
    #[must_use]
    pub fn with_auto(mut self, step_count: u32, min_interval: impl Into<String>) -> Self {
        self.auto = true;
        self.auto_step_count = step_count.max(1);
        self.auto_min_interval = min_interval.into();
        self
    }
}

impl VariableSource for IntervalSource {
    fn kind(&self) -> &'static str {
        "IntervalVariable"
    }

    fn init_state(&self, state: &mut Map<String, Value>) {
        state.insert("intervals".into(), json!(self.intervals));
        state.insert("autoEnabled".into(), json!(self.auto));
        state.insert("autoStepCount".into(), json!(self.auto_step_count));
        state.insert("autoMinInterval".into(), json!(self.auto_min_interval));
    }

    fn get_options(&self, variable: &SceneVariable) -> OptionsResult {
        let state = variable.object().state();
        let mut options = Vec::new();
        if state.get_bool("autoEnabled").unwrap_or(false) {
            options.push(VariableOption::new("Auto", AUTO_VARIABLE_VALUE));
        }
        if let Some(Value::Array(items)) = state.get("intervals") {
            options.extend(
                items
                    .iter()
                    .map(scalar_to_string)
                    .map(|i| i.trim().to_owned())
                    .filter(|i| !i.is_empty())
                    .map(VariableOption::same),
            );
        }
        Deferred::ready(Ok(options))
    }

    fn resolve_value(&self, variable: &SceneVariable) -> Option<ResolvedValue> {
        if variable.value().first() != Some(AUTO_VARIABLE_VALUE) {
            return None;
        }
        let state = variable.object().state();
        let steps = state.get_i64("autoStepCount").unwrap_or(30).max(1);
        let min_ms = state
            .get_str("autoMinInterval")
            .and_then(parse_interval)
            .unwrap_or(0);
        let span = get_time_range(variable.object())
            .map(|tr| tr.value())
            .map_or(0, |range| range.to - range.from);
        let interval = round_interval(span / steps).max(min_ms);
        Some(ResolvedValue::Text(format_interval(interval)))
    }
}

/// Fetches options for a [`QuerySource`].
pub trait OptionsProvider {
    /// Options for the interpolated `query`.
    fn fetch_options(&self, query: &str, variable: &SceneVariable) -> OptionsResult;
}

/// [`OptionsProvider`] backed by a closure.
#[derive(Clone)]
pub struct FnOptionsProvider {
    fetch: Rc<dyn Fn(&str, &SceneVariable) -> OptionsResult>,
}

impl FnOptionsProvider {
    /// Wrap `fetch`.
    pub fn new(fetch: impl Fn(&str, &SceneVariable) -> OptionsResult + 'static) -> Self {
        Self {
            fetch: Rc::new(fetch),
        }
    }
}

impl OptionsProvider for FnOptionsProvider {
    fn fetch_options(&self, query: &str, variable: &SceneVariable) -> OptionsResult {
        (self.fetch)(query, variable)
    }
}

/// Options fetched from an external provider.
///
/// The `query` field is interpolated against other variables first; an
/// optional `regex` field filters the results (capture group 1, when present,
/// becomes the value).
pub struct QuerySource {
    query: String,
    provider: Rc<dyn OptionsProvider>,
}

impl QuerySource {
    /// Source issuing `query` through `provider`.
    pub fn new(query: impl Into<String>, provider: impl OptionsProvider + 'static) -> Self {
        Self {
            query: query.into(),
            provider: Rc::new(provider),
        }
    }

    fn apply_regex(pattern: &str, options: Vec<VariableOption>) -> Result<Vec<VariableOption>, String> {
        let regex = Regex::new(pattern).map_err(|err| format!("invalid regex {pattern}: {err}"))?;
        Ok(options
            .into_iter()
            .filter_map(|option| {
                let caps = regex.captures(&option.value)?;
                match caps.get(1) {
                    Some(group) => {
                        let value = group.as_str().to_owned();
                        let label = if option.label == option.value {
                            value.clone()
                        } else {
                            option.label
                        };
                        Some(VariableOption::new(label, value))
                    }
                    None => Some(option),
                }
            })
            .collect())
    }
}

impl VariableSource for QuerySource {
    fn kind(&self) -> &'static str {
        "QueryVariable"
    }

    fn dependency_paths(&self) -> &'static [&'static str] {
        &["query", "regex", "datasource"]
    }

    fn init_state(&self, state: &mut Map<String, Value>) {
        state.insert("query".into(), json!(self.query));
    }

    fn get_options(&self, variable: &SceneVariable) -> OptionsResult {
        let state = variable.object().state();
        let query = interpolate(
            variable.object(),
            state.get_str("query").unwrap_or_default(),
            None,
            None,
        );
        let regex = state
            .get_str("regex")
            .filter(|r| !r.is_empty())
            .map(|r| interpolate(variable.object(), r, None, None));
        let name = variable.name();
        self.provider
            .fetch_options(&query, variable)
            .map(move |result| {
                let options = result?;
                match regex {
                    Some(pattern) => Self::apply_regex(&pattern, options).inspect_err(|err| {
                        warn!(variable = %name, error = %err, "query variable regex failed");
                    }),
                    None => Ok(options),
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::{VariableConfig, VariableValue};

    #[test]
    fn custom_parsing_handles_labels_and_escapes() {
        let options = parse_custom_options(r"a, b\,c , Prod : p");
        assert_eq!(
            options,
            vec![
                VariableOption::same("a"),
                VariableOption::same("b,c"),
                VariableOption::new("Prod", "p"),
            ]
        );
        assert!(parse_custom_options("").is_empty());
    }

    #[test]
    fn malformed_json_sets_error_field() {
        let v = SceneVariable::new("j", JsonSource::new("[1, 2"), VariableConfig::default());
        let result = v.validate_and_update().value().unwrap();
        assert!(result.is_err());
        assert!(v.error().unwrap().contains("invalid JSON"));
        assert!(!v.is_loading());
        assert_eq!(v.value(), VariableValue::from(""));
    }

    #[test]
    fn json_objects_carry_labels() {
        let v = SceneVariable::new(
            "j",
            JsonSource::new(r#"[{"text": "Europe", "value": "eu"}, "us"]"#),
            VariableConfig::default(),
        );
        v.validate_and_update();
        assert_eq!(
            v.options(),
            vec![VariableOption::new("Europe", "eu"), VariableOption::same("us")]
        );
        assert_eq!(v.get_value_text(), "Europe");
    }

    #[test]
    fn interval_options_include_auto() {
        let v = SceneVariable::new(
            "interval",
            IntervalSource::new(vec!["1m".into(), "5m".into()]).with_auto(30, "10s"),
            VariableConfig::default().with_value("5m"),
        );
        v.validate_and_update();
        assert_eq!(v.options()[0].value, AUTO_VARIABLE_VALUE);
        assert_eq!(v.value(), VariableValue::from("5m"));
    }

    #[test]
    fn query_regex_extracts_values() {
        let provider = FnOptionsProvider::new(|_, _| {
            Deferred::ready(Ok(vec![
                VariableOption::same("host-a.prod"),
                VariableOption::same("host-b.dev"),
            ]))
        });
        let v = SceneVariable::new("host", QuerySource::new("hosts", provider), VariableConfig::default());
        v.object()
            .set_state(scenes_core::StatePatch::new().set("regex", r"(.*)\.prod"));
        v.validate_and_update();
        assert_eq!(v.options(), vec![VariableOption::same("host-a")]);
    }

    #[test]
    fn constant_has_no_options() {
        let v = SceneVariable::new(
            "c",
            ConstantSource,
            VariableConfig::default().with_value("fixed"),
        );
        assert_eq!(v.validate_and_update().value(), Some(Ok(false)));
        assert!(v.skip_url_sync());
        assert_eq!(v.get_value(None), ResolvedValue::Text("fixed".into()));
    }
}
