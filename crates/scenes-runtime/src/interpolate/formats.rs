#![forbid(unsafe_code)]

//! Value formats applied during interpolation.
//!
//! | name           | single `a`   | list `a`,`b`          |
//! |----------------|--------------|-----------------------|
//! | `raw`          | `a`          | `a,b`                 |
//! | `regex`        | escaped `a`  | `(a\|b)`              |
//! | `glob`         | `a`          | `{a,b}`               |
//! | `pipe`         | `a`          | `a\|b`                |
//! | `csv`          | `a`          | `a,b`                 |
//! | `json`         | `"a"`        | `["a","b"]`           |
//! | `lucene`       | escaped `a`  | `("a" OR "b")`        |
//! | `percentencode`| encoded `a`  | encoded `{a,b}`       |
//! | `queryparam`   | `var-n=a`    | `var-n=a&var-n=b`     |
//! | `singlequote`  | `'a'`        | `'a','b'`             |
//! | `doublequote`  | `"a"`        | `"a","b"`             |
//! | `sqlstring`    | `'a'`        | `'a','b'`             |
//! | `text`         | display text | display text          |

use std::fmt;
use std::rc::Rc;

use serde_json::json;
use tracing::warn;

use crate::url_sync::encode_component;
use crate::variables::{ALL_VARIABLE_TEXT, ResolvedValue};

/// What a format sees for one token.
#[derive(Debug, Clone, Copy)]
pub struct FormatInput<'a> {
    /// Variable name.
    pub name: &'a str,
    /// Resolved value.
    pub value: &'a ResolvedValue,
    /// Display text.
    pub text: &'a str,
}

/// A user-supplied format.
#[derive(Clone)]
pub struct CustomFormat(Rc<dyn Fn(&FormatInput<'_>) -> String>);

impl CustomFormat {
    /// Wrap `format`.
    pub fn new(format: impl Fn(&FormatInput<'_>) -> String + 'static) -> Self {
        Self(Rc::new(format))
    }
}

impl fmt::Debug for CustomFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomFormat(..)")
    }
}

/// How a value is rendered into text.
#[derive(Debug, Clone, Default)]
pub enum VariableFormat {
    /// Values as-is, lists comma joined.
    Raw,
    /// Regex-escaped, lists as an alternation group.
    Regex,
    /// Lists as a `{a,b}` glob.
    #[default]
    Glob,
    /// Lists joined with `|`.
    Pipe,
    /// Lists joined with `,`.
    Csv,
    /// JSON string or array.
    Json,
    /// Lucene-escaped, lists as an `OR` group.
    Lucene,
    /// Percent-encoded.
    PercentEncode,
    /// `var-<name>=<value>` pairs.
    QueryParam,
    /// Single-quoted.
    SingleQuote,
    /// Double-quoted.
    DoubleQuote,
    /// SQL string literals.
    SqlString,
    /// The display text instead of the value.
    Text,
    /// A closure.
    Custom(CustomFormat),
}

impl VariableFormat {
    /// Look up a format by name (the part before any `:` argument).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let id = name.split(':').next().unwrap_or_default().trim();
        Some(match id {
            "raw" => Self::Raw,
            "regex" => Self::Regex,
            "glob" => Self::Glob,
            "pipe" => Self::Pipe,
            "csv" => Self::Csv,
            "json" => Self::Json,
            "lucene" => Self::Lucene,
            "percentencode" => Self::PercentEncode,
            "queryparam" => Self::QueryParam,
            "singlequote" => Self::SingleQuote,
            "doublequote" => Self::DoubleQuote,
            "sqlstring" => Self::SqlString,
            "text" => Self::Text,
            _ => return None,
        })
    }

    /// [`from_name`](Self::from_name), falling back to [`Glob`](Self::Glob).
    #[must_use]
    pub fn from_name_or_default(name: &str) -> Self {
        Self::from_name(name).unwrap_or_else(|| {
            warn!(format = name, "unknown interpolation format, using glob");
            Self::Glob
        })
    }

    /// Render `input`.
    #[must_use]
    pub fn apply(&self, input: &FormatInput<'_>) -> String {
        if let ResolvedValue::CustomAll(all) = input.value {
            return match self {
                Self::Text => ALL_VARIABLE_TEXT.to_owned(),
                Self::QueryParam => format!("var-{}={ALL_VARIABLE_TEXT}", input.name),
                Self::Custom(custom) => (custom.0)(input),
                _ => all.clone(),
            };
        }

        let values = input.value.as_list();
        let is_list = matches!(input.value, ResolvedValue::List(_));
        let single = |f: &dyn Fn(&str) -> String| {
            values.first().map(|v| f(v.as_str())).unwrap_or_default()
        };

        match self {
            Self::Raw | Self::Csv => values.join(","),
            Self::Pipe => values.join("|"),
            Self::Regex => {
                if is_list && values.len() > 1 {
                    let escaped: Vec<String> = values.iter().map(|v| regex::escape(v)).collect();
                    format!("({})", escaped.join("|"))
                } else {
                    single(&|v: &str| regex::escape(v))
                }
            }
            Self::Glob => {
                if is_list && values.len() > 1 {
                    format!("{{{}}}", values.join(","))
                } else {
                    values.join(",")
                }
            }
            Self::Json => {
                if is_list {
                    json!(values).to_string()
                } else {
                    single(&|v: &str| json!(v).to_string())
                }
            }
            Self::Lucene => {
                if is_list && values.len() != 1 {
                    let quoted: Vec<String> = values
                        .iter()
                        .map(|v| format!("\"{}\"", lucene_escape(v)))
                        .collect();
                    format!("({})", quoted.join(" OR "))
                } else {
                    single(&lucene_escape)
                }
            }
            Self::PercentEncode => {
                if is_list {
                    encode_component(&format!("{{{}}}", values.join(",")))
                } else {
                    single(&encode_component)
                }
            }
            Self::QueryParam => values
                .iter()
                .map(|v| format!("var-{}={}", input.name, encode_component(v)))
                .collect::<Vec<_>>()
                .join("&"),
            Self::SingleQuote => quote_each(&values, |v| format!("'{}'", v.replace('\'', "\\'"))),
            Self::DoubleQuote => quote_each(&values, |v| format!("\"{}\"", v.replace('"', "\\\""))),
            Self::SqlString => quote_each(&values, |v| format!("'{}'", v.replace('\'', "''"))),
            Self::Text => input.text.to_owned(),
            Self::Custom(custom) => (custom.0)(input),
        }
    }
}

fn quote_each(values: &[String], quote: impl Fn(&str) -> String) -> String {
    values.iter().map(|v| quote(v)).collect::<Vec<_>>().join(",")
}

fn lucene_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_whitespace() || "!*+-=<>&|()[]{}^~?:\\/\"".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
