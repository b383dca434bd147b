//! Typed test arguments.
//!
//! Tests declare their parameters up front; the operator supplies values as
//! `KEY=VAL` pairs or as a JSON object. Parsing validates names, required
//! keys and value kinds before any device is touched.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::StepError;

/// Value kind a parameter accepts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParamKind {
    /// Free text.
    Str,
    /// Signed integer.
    Int,
    /// Floating-point number.
    Float,
    /// `true`/`false`, also `1`/`0` and `yes`/`no`.
    Bool,
    /// Any JSON document.
    Json,
}

impl ParamKind {
    /// Lowercase name used in messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Str => "string",
            Self::Int => "integer",
            Self::Float => "float",
            Self::Bool => "boolean",
            Self::Json => "json",
        }
    }

    fn convert(self, raw: &str) -> Option<Value> {
        match self {
            Self::Str => Some(Value::String(raw.to_owned())),
            Self::Int => raw.trim().parse::<i64>().ok().map(Value::from),
            Self::Float => raw.trim().parse::<f64>().ok().map(Value::from),
            Self::Bool => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(Value::Bool(true)),
                "false" | "0" | "no" => Some(Value::Bool(false)),
                _ => None,
            },
            Self::Json => serde_json::from_str(raw).ok(),
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Str => value.is_string(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Json => true,
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared test parameter.
#[derive(Clone, Debug, PartialEq)]
pub struct TestParam {
    /// Argument key.
    pub name: String,
    /// Help text.
    pub desc: String,
    /// Whether the operator must supply it.
    pub required: bool,
    /// Value used when the operator does not supply one.
    pub default: Option<Value>,
    /// Accepted kind.
    pub kind: ParamKind,
}

impl TestParam {
    /// Optional parameter with a default.
    pub fn optional(name: &str, desc: &str, kind: ParamKind, default: Value) -> Self {
        Self {
            name: name.to_owned(),
            desc: desc.to_owned(),
            required: false,
            default: Some(default),
            kind,
        }
    }

    /// Required parameter.
    pub fn required(name: &str, desc: &str, kind: ParamKind) -> Self {
        Self {
            name: name.to_owned(),
            desc: desc.to_owned(),
            required: true,
            default: None,
            kind,
        }
    }

    /// `(required)` or `(default: x)`, as shown by `describe`.
    #[must_use]
    pub fn requirement_note(&self) -> String {
        if self.required {
            return String::from("(required)");
        }
        match &self.default {
            Some(Value::String(text)) => format!("(default: {text})"),
            Some(value) => format!("(default: {value})"),
            None => String::from("(default: none)"),
        }
    }
}

/// Parameters every test accepts.
#[must_use]
pub fn common_params() -> Vec<TestParam> {
    vec![
        TestParam::optional(
            "enable_fw_logs",
            "Enable firmware logging on radio nodes",
            ParamKind::Bool,
            Value::Bool(false),
        ),
        TestParam::optional(
            "disable_gps",
            "Disable GPS on radio nodes",
            ParamKind::Bool,
            Value::Bool(false),
        ),
    ]
}

/// Errors raised while parsing test arguments.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TestArgsError {
    /// The key is not a declared parameter.
    #[error("Unknown test argument '{key}'")]
    Unknown {
        /// Offending key.
        key: String,
    },
    /// A required parameter was not supplied.
    #[error("Missing required test argument '{key}'")]
    Missing {
        /// Missing key.
        key: String,
    },
    /// A value could not be converted to the parameter's kind.
    #[error("Invalid value '{value}' for test argument '{key}': expected {kind}")]
    Invalid {
        /// Parameter key.
        key: String,
        /// Supplied value.
        value: String,
        /// Expected kind.
        kind: ParamKind,
    },
    /// A `KEY=VAL` entry had no `=`.
    #[error("Malformed test argument '{entry}': expected KEY=VAL")]
    Malformed {
        /// Offending entry.
        entry: String,
    },
    /// `--json-args` was not a JSON object.
    #[error("Invalid JSON test arguments: {message}")]
    Json {
        /// Parser message.
        message: String,
    },
}

impl From<TestArgsError> for StepError {
    fn from(value: TestArgsError) -> Self {
        Self::TestUsage(value.to_string())
    }
}

/// Resolved argument values, defaults included.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TestArgs {
    values: BTreeMap<String, Value>,
}

impl TestArgs {
    /// Validates `pairs` (`KEY=VAL`) and the optional JSON overlay against
    /// `params`. JSON values win over pairs with the same key.
    ///
    /// # Errors
    ///
    /// Returns [`TestArgsError`] for unknown keys, missing required keys,
    /// unconvertible values and malformed input.
    pub fn parse(
        params: &[TestParam],
        pairs: &[String],
        json_args: Option<&str>,
    ) -> Result<Self, TestArgsError> {
        let lookup = |key: &str| {
            params
                .iter()
                .find(|param| param.name == key)
                .ok_or_else(|| TestArgsError::Unknown {
                    key: key.to_owned(),
                })
        };

        let mut values = BTreeMap::new();
        for entry in pairs {
            let (key, raw) = entry
                .split_once('=')
                .ok_or_else(|| TestArgsError::Malformed {
                    entry: entry.clone(),
                })?;
            let param = lookup(key.trim())?;
            let value = param.kind.convert(raw).ok_or_else(|| TestArgsError::Invalid {
                key: param.name.clone(),
                value: raw.to_owned(),
                kind: param.kind,
            })?;
            values.insert(param.name.clone(), value);
        }

        if let Some(text) = json_args.filter(|text| !text.trim().is_empty()) {
            for (key, value) in parse_json_object(text)? {
                let param = lookup(&key)?;
                let converted = if param.kind.accepts(&value) {
                    value
                } else {
                    value
                        .as_str()
                        .and_then(|raw| param.kind.convert(raw))
                        .ok_or_else(|| TestArgsError::Invalid {
                            key: key.clone(),
                            value: value.to_string(),
                            kind: param.kind,
                        })?
                };
                values.insert(key, converted);
            }
        }

        for param in params {
            if values.contains_key(&param.name) {
                continue;
            }
            match &param.default {
                Some(default) if !param.required => {
                    values.insert(param.name.clone(), default.clone());
                }
                _ if param.required => {
                    return Err(TestArgsError::Missing {
                        key: param.name.clone(),
                    });
                }
                _ => {}
            }
        }

        Ok(Self { values })
    }

    /// Raw value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// String value of `key`.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Integer value of `key`.
    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    /// Boolean value of `key`; absent keys read as `false`.
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Every resolved value, sorted by key.
    #[must_use]
    pub const fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }
}

fn parse_json_object(text: &str) -> Result<Map<String, Value>, TestArgsError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(TestArgsError::Json {
            message: format!("expected an object, got {other}"),
        }),
        Err(err) => Err(TestArgsError::Json {
            message: err.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use serde_json::json;

    use super::*;

    #[fixture]
    fn params() -> Vec<TestParam> {
        let mut params = common_params();
        params.push(TestParam::required("iterations", "Loop count", ParamKind::Int));
        params.push(TestParam::optional(
            "iface",
            "Interface",
            ParamKind::Str,
            json!("eth0"),
        ));
        params
    }

    fn pairs(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| (*item).to_owned()).collect()
    }

    #[rstest]
    fn defaults_fill_unspecified_params(params: Vec<TestParam>) {
        let args = TestArgs::parse(&params, &pairs(&["iterations=3"]), None).expect("args");
        assert_eq!(args.get_i64("iterations"), Some(3));
        assert_eq!(args.get_str("iface"), Some("eth0"));
        assert!(!args.flag("disable_gps"));
    }

    #[rstest]
    #[case(&["iterations=3", "colour=red"], "Unknown test argument 'colour'")]
    #[case(&["iface=eth1"], "Missing required test argument 'iterations'")]
    #[case(&["iterations=many"], "Invalid value 'many' for test argument 'iterations': expected integer")]
    #[case(&["iterations"], "Malformed test argument 'iterations': expected KEY=VAL")]
    fn bad_arguments_are_rejected(
        params: Vec<TestParam>,
        #[case] input: &[&str],
        #[case] message: &str,
    ) {
        let err = TestArgs::parse(&params, &pairs(input), None).expect_err("invalid");
        assert_eq!(err.to_string(), message);
        assert_eq!(
            StepError::from(err).kind(),
            crate::error::StepErrorKind::TestUsage
        );
    }

    #[rstest]
    fn json_overlay_wins_and_converts_strings(params: Vec<TestParam>) {
        let args = TestArgs::parse(
            &params,
            &pairs(&["iterations=3"]),
            Some(r#"{"iterations": "7", "disable_gps": true}"#),
        )
        .expect("args");
        assert_eq!(args.get_i64("iterations"), Some(7));
        assert!(args.flag("disable_gps"));
    }

    #[rstest]
    fn json_overlay_must_be_an_object(params: Vec<TestParam>) {
        let err = TestArgs::parse(&params, &pairs(&["iterations=1"]), Some("[1]"))
            .expect_err("array");
        assert!(matches!(err, TestArgsError::Json { .. }));
    }

    #[test]
    fn requirement_notes_render_defaults() {
        let param = TestParam::optional("iface", "", ParamKind::Str, json!("eth0"));
        assert_eq!(param.requirement_note(), "(default: eth0)");
        let required = TestParam::required("n", "", ParamKind::Int);
        assert_eq!(required.requirement_note(), "(required)");
    }
}
