//! SD-003: Parameter expressions.
//!
//! An expression is a template string with `{{ params.NAME }}` references.
//! Expansion is a single left-to-right pass: substituted values are never
//! re-scanned, so a value that itself contains `{{` stays literal.

use super::error::CompileError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*params\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid regex")
});

/// Resolved parameter values, keyed by parameter name.
pub type Params = HashMap<String, String>;

/// A templated manifest value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Expression(String);

impl Expression {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn template(&self) -> &str {
        &self.0
    }

    /// Expand all references against the resolved parameters.
    pub fn expand(&self, params: &Params) -> Result<String, CompileError> {
        expand(&self.0, params)
    }

    /// Expand, then parse the result as `T`.
    pub fn expand_typed<T: FromStr>(&self, params: &Params) -> Result<T, CompileError> {
        expand_typed(&self.0, params)
    }

    /// Names of the parameters this expression refers to, in order of appearance.
    pub fn references(&self) -> Vec<String> {
        REFERENCE
            .captures_iter(&self.0)
            .map(|c| c[1].to_string())
            .collect()
    }

    /// Check the template is well formed without resolving anything.
    pub fn check_syntax(&self) -> Result<(), CompileError> {
        scan(&self.0, |_| Ok(String::new())).map(|_| ())
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Expression {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// Manifest authors write `port: 5022` as often as `port: "5022"`; accept any scalar.
impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_yaml_ng::Value::deserialize(deserializer)?;
        match value {
            serde_yaml_ng::Value::String(s) => Ok(Self(s)),
            serde_yaml_ng::Value::Number(n) => Ok(Self(n.to_string())),
            serde_yaml_ng::Value::Bool(b) => Ok(Self(b.to_string())),
            other => Err(serde::de::Error::custom(format!(
                "expected a scalar expression, got {:?}",
                other
            ))),
        }
    }
}

/// Expand `{{ params.NAME }}` references in a template.
pub fn expand(template: &str, params: &Params) -> Result<String, CompileError> {
    scan(template, |name| {
        params
            .get(name)
            .cloned()
            .ok_or_else(|| CompileError::MissingExpressionParameter {
                template: template.to_string(),
                name: name.to_string(),
            })
    })
}

/// Expand a template and parse the result as `T`.
pub fn expand_typed<T: FromStr>(template: &str, params: &Params) -> Result<T, CompileError> {
    let value = expand(template, params)?;
    value
        .trim()
        .parse::<T>()
        .map_err(|_| CompileError::Conversion {
            template: template.to_string(),
            value: value.clone(),
            expected: short_type_name::<T>(),
        })
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

fn scan(
    template: &str,
    mut lookup: impl FnMut(&str) -> Result<String, CompileError>,
) -> Result<String, CompileError> {
    let malformed = |reason: String| CompileError::MalformedExpression {
        template: template.to_string(),
        reason,
    };

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(open) = rest.find("{{") {
        let close = rest[open..]
            .find("}}")
            .ok_or_else(|| malformed(format!("unclosed reference at position {}", offset + open)))?;
        let key = rest[open + 2..open + close].trim();
        let name = key
            .strip_prefix("params.")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| malformed(format!("unknown reference '{}'", key)))?;

        out.push_str(&rest[..open]);
        out.push_str(&lookup(name)?);

        let consumed = open + close + 2;
        rest = &rest[consumed..];
        offset += consumed;
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_sd003_expand_single() {
        let p = params(&[("server", "SQL01")]);
        assert_eq!(expand("{{params.server}}", &p).unwrap(), "SQL01");
    }

    #[test]
    fn test_sd003_expand_whitespace_and_text() {
        let p = params(&[("a", "X"), ("b", "Y")]);
        assert_eq!(
            expand("pre-{{ params.a }}-{{params.b}}-post", &p).unwrap(),
            "pre-X-Y-post"
        );
    }

    #[test]
    fn test_sd003_no_references_is_identity() {
        assert_eq!(expand("plain text", &Params::new()).unwrap(), "plain text");
    }

    #[test]
    fn test_sd003_missing_parameter() {
        let err = expand("{{params.ghost}}", &Params::new()).unwrap_err();
        assert_eq!(
            err,
            CompileError::MissingExpressionParameter {
                template: "{{params.ghost}}".to_string(),
                name: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn test_sd003_values_are_not_rescanned() {
        let p = params(&[("a", "{{params.b}}"), ("b", "boom")]);
        assert_eq!(expand("{{params.a}}", &p).unwrap(), "{{params.b}}");
    }

    #[test]
    fn test_sd003_unclosed_reference() {
        let err = expand("x {{params.a", &params(&[("a", "1")])).unwrap_err();
        assert!(matches!(err, CompileError::MalformedExpression { .. }));
        assert!(err.to_string().contains("unclosed"));
    }

    #[test]
    fn test_sd003_unknown_namespace() {
        let err = expand("{{server.host}}", &Params::new()).unwrap_err();
        assert!(err.to_string().contains("unknown reference"));
    }

    #[test]
    fn test_sd003_expand_typed_int() {
        let p = params(&[("ret", " 72 ")]);
        let v: i32 = expand_typed("{{params.ret}}", &p).unwrap();
        assert_eq!(v, 72);
    }

    #[test]
    fn test_sd003_expand_typed_conversion_error() {
        let p = params(&[("ret", "soon")]);
        let err = expand_typed::<i32>("{{params.ret}}", &p).unwrap_err();
        assert_eq!(
            err,
            CompileError::Conversion {
                template: "{{params.ret}}".to_string(),
                value: "soon".to_string(),
                expected: "i32",
            }
        );
    }

    #[test]
    fn test_sd003_references() {
        let e = Expression::new("{{params.a}} and {{ params.b }} and {{params.a}}");
        assert_eq!(e.references(), vec!["a", "b", "a"]);
    }

    #[test]
    fn test_sd003_check_syntax() {
        assert!(Expression::new("{{params.a}}").check_syntax().is_ok());
        assert!(Expression::new("{{params.}}").check_syntax().is_err());
        assert!(Expression::new("{{").check_syntax().is_err());
    }

    #[test]
    fn test_sd003_deserialize_scalars() {
        let e: Expression = serde_yaml_ng::from_str("5022").unwrap();
        assert_eq!(e.template(), "5022");
        let e: Expression = serde_yaml_ng::from_str("true").unwrap();
        assert_eq!(e.template(), "true");
        let e: Expression = serde_yaml_ng::from_str("\"{{params.x}}\"").unwrap();
        assert_eq!(e.template(), "{{params.x}}");
        assert!(serde_yaml_ng::from_str::<Expression>("[a, b]").is_err());
    }
}
