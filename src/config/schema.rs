//! Schema-driven decoding of raw configuration fragments.
//!
//! Every recognized key is declared once in [`FIELDS`] together with its
//! aliases, value kind, default and validation check. [`decode`] overlays the
//! fragments, rejects keys absent from the table, coerces each value to its
//! declared kind and applies defaults; [`validate`] then runs every check and
//! accumulates the violations.

use std::collections::HashMap;
use std::fs;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_yaml::{Mapping, Value};

use crate::error::{MultiError, ProvisionerError};
use crate::path;
use crate::provisioner::{ExecuteTemplate, InstallTemplate};
use crate::template::{Template, TemplateData};

use super::{
    DEFAULT_COMMAND, DEFAULT_EXECUTE_COMMAND, DEFAULT_GEMS, DEFAULT_INSTALL_COMMAND,
    DEFAULT_INSTALL_RETRY_TIMEOUT, DEFAULT_STAGING_DIR,
};

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+(?:\.\d*)?|\.\d+)(ns|us|µs|ms|s|m|h)").expect("duration regex")
});

/// Declared type of a configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Str,
    Bool,
    StrList,
    Duration,
    Map,
}

impl Kind {
    fn name(self) -> &'static str {
        match self {
            Kind::Str => "string",
            Kind::Bool => "bool",
            Kind::StrList => "[]string",
            Kind::Duration => "duration",
            Kind::Map => "map",
        }
    }
}

/// Value substituted when a key is absent (or empty, for strings and durations).
#[derive(Debug, Clone, Copy)]
pub(crate) enum Fallback {
    None,
    Str(&'static str),
    StrList(&'static [&'static str]),
    Duration(Duration),
    Bool(bool),
}

/// Validation applied to a decoded value.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Check {
    None,
    /// Entries must be `KEY=VALUE`; accepted entries are re-quoted for the shell.
    EnvVars,
    /// Must name an existing directory when set.
    Directory,
    /// Must name an existing file, relative to the source directory, when set.
    File,
    /// Must be present and non-empty, every entry following the `File` rule.
    Recipes,
    /// Must parse and render against a zero-valued record.
    Template(fn() -> Box<dyn TemplateData>),
}

/// One entry of the configuration schema.
#[derive(Debug)]
pub(crate) struct Field {
    pub key: &'static str,
    pub aliases: &'static [&'static str],
    pub kind: Kind,
    pub default: Fallback,
    pub check: Check,
}

const fn field(key: &'static str, kind: Kind) -> Field {
    Field {
        key,
        aliases: &[],
        kind,
        default: Fallback::None,
        check: Check::None,
    }
}

fn zero_install_template() -> Box<dyn TemplateData> {
    Box::new(InstallTemplate::default())
}

fn zero_execute_template() -> Box<dyn TemplateData> {
    Box::new(ExecuteTemplate::default())
}

/// The configuration schema.
///
/// Checks run in table order, so the order of entries is the order in which
/// violations are reported.
pub(crate) static FIELDS: &[Field] = &[
    Field {
        default: Fallback::StrList(&[]),
        check: Check::EnvVars,
        ..field("environment_vars", Kind::StrList)
    },
    Field {
        check: Check::Directory,
        ..field("source_directory", Kind::Str)
    },
    Field {
        aliases: &["json_path"],
        check: Check::File,
        ..field("node_json", Kind::Str)
    },
    Field {
        aliases: &["yaml_path"],
        check: Check::File,
        ..field("node_yaml", Kind::Str)
    },
    Field {
        check: Check::File,
        ..field("config_file", Kind::Str)
    },
    Field {
        check: Check::Recipes,
        ..field("recipes", Kind::StrList)
    },
    Field {
        default: Fallback::Str(DEFAULT_INSTALL_COMMAND),
        check: Check::Template(zero_install_template),
        ..field("install_command", Kind::Str)
    },
    Field {
        default: Fallback::Str(DEFAULT_EXECUTE_COMMAND),
        check: Check::Template(zero_execute_template),
        ..field("execute_command", Kind::Str)
    },
    Field {
        default: Fallback::Str(DEFAULT_COMMAND),
        ..field("command", Kind::Str)
    },
    Field {
        aliases: &["gem"],
        default: Fallback::StrList(DEFAULT_GEMS),
        ..field("gems", Kind::StrList)
    },
    Field {
        default: Fallback::Duration(DEFAULT_INSTALL_RETRY_TIMEOUT),
        ..field("install_retry_timeout", Kind::Duration)
    },
    field("skip_install", Kind::Bool),
    field("prevent_sudo", Kind::Bool),
    Field {
        default: Fallback::Str(DEFAULT_STAGING_DIR),
        ..field("staging_directory", Kind::Str)
    },
    field("clean_staging_directory", Kind::Bool),
    field("log_level", Kind::Str),
    field("shell", Kind::Str),
    Field {
        default: Fallback::Bool(false),
        ..field("color", Kind::Bool)
    },
    Field {
        default: Fallback::StrList(&[]),
        ..field("extra_arguments", Kind::StrList)
    },
    field("ignore_exit_codes", Kind::Bool),
    field("packer_build_name", Kind::Str),
    field("packer_builder_type", Kind::Str),
    field("packer_debug", Kind::Bool),
    field("packer_force", Kind::Bool),
    field("packer_on_error", Kind::Str),
    field("packer_template_path", Kind::Str),
    field("packer_user_variables", Kind::Map),
];

/// Looks up the schema entry for a key or one of its aliases.
pub(crate) fn lookup(key: &str) -> Option<&'static Field> {
    FIELDS
        .iter()
        .find(|f| f.key == key || f.aliases.contains(&key))
}

/// A value coerced to its declared kind.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FieldValue {
    Str(String),
    Bool(bool),
    StrList(Vec<String>),
    Duration(Duration),
    Map(Mapping),
}

/// Decoded configuration keyed by canonical key. Absent keys have no entry.
#[derive(Debug, Clone, Default)]
pub(crate) struct Decoded {
    values: HashMap<&'static str, FieldValue>,
}

impl Decoded {
    pub(crate) fn get(&self, key: &str) -> Option<&FieldValue> {
        self.values.get(key)
    }

    /// Returns a string value, or an empty string when absent.
    pub(crate) fn string(&self, key: &str) -> String {
        self.opt_string(key).unwrap_or_default()
    }

    /// Returns a string value, treating an empty string as absent.
    pub(crate) fn opt_string(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(FieldValue::Str(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }

    pub(crate) fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some(FieldValue::Bool(true)))
    }

    pub(crate) fn list(&self, key: &str) -> Option<&[String]> {
        match self.get(key) {
            Some(FieldValue::StrList(items)) => Some(items),
            _ => None,
        }
    }

    pub(crate) fn duration(&self, key: &str) -> Duration {
        match self.get(key) {
            Some(FieldValue::Duration(d)) => *d,
            _ => Duration::ZERO,
        }
    }

    fn insert(&mut self, key: &'static str, value: FieldValue) {
        self.values.insert(key, value);
    }
}

/// Overlays `fragments` in order and decodes the result against [`FIELDS`].
///
/// Unknown keys, non-mapping fragments and values that cannot be coerced are
/// all collected into a single `Decode` error.
pub(crate) fn decode(fragments: &[Value]) -> Result<Decoded, ProvisionerError> {
    let mut errs = MultiError::new();
    let merged = merge(fragments, &mut errs);

    let mut decoded = Decoded::default();
    for field in FIELDS {
        let value = match merged.get(field.key) {
            Some(raw) => match coerce(field, raw) {
                Ok(value) => value,
                Err(err) => {
                    errs.push(err);
                    continue;
                }
            },
            None => None,
        };
        if let Some(value) = apply_default(field.default, value) {
            decoded.insert(field.key, value);
        }
    }

    errs.into_result(ProvisionerError::Decode)?;
    Ok(decoded)
}

fn merge<'a>(fragments: &'a [Value], errs: &mut MultiError) -> HashMap<&'static str, &'a Value> {
    let mut merged = HashMap::new();
    for (index, fragment) in fragments.iter().enumerate() {
        let mapping = match fragment {
            Value::Null => continue,
            Value::Mapping(mapping) => mapping,
            other => {
                errs.push(ProvisionerError::Validation(format!(
                    "configuration fragment {} must be a mapping, got {}",
                    index,
                    describe(other)
                )));
                continue;
            }
        };
        for (key, value) in mapping {
            let Some(key) = key.as_str() else {
                errs.push(ProvisionerError::Validation(format!(
                    "configuration fragment {} has a non-string key of type {}",
                    index,
                    describe(key)
                )));
                continue;
            };
            match lookup(key) {
                Some(field) => {
                    merged.insert(field.key, value);
                }
                None => errs.push(ProvisionerError::UnknownKey(key.to_string())),
            }
        }
    }
    merged
}

fn apply_default(fallback: Fallback, value: Option<FieldValue>) -> Option<FieldValue> {
    match (fallback, value) {
        (Fallback::Str(default), None) => Some(FieldValue::Str(default.to_string())),
        (Fallback::Str(default), Some(FieldValue::Str(s))) if s.is_empty() => {
            Some(FieldValue::Str(default.to_string()))
        }
        (Fallback::StrList(default), None) => Some(FieldValue::StrList(
            default.iter().map(|s| s.to_string()).collect(),
        )),
        (Fallback::Duration(default), None) => Some(FieldValue::Duration(default)),
        (Fallback::Duration(default), Some(FieldValue::Duration(d))) if d.is_zero() => {
            Some(FieldValue::Duration(default))
        }
        (Fallback::Bool(default), None) => Some(FieldValue::Bool(default)),
        (_, value) => value,
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

fn invalid_type(field: &Field, value: &Value) -> ProvisionerError {
    ProvisionerError::InvalidType {
        key: field.key.to_string(),
        expected: field.kind.name(),
        got: describe(value).to_string(),
    }
}

/// Coerces a raw value to the field's kind. `null` decodes as absent.
fn coerce(field: &Field, raw: &Value) -> Result<Option<FieldValue>, ProvisionerError> {
    let raw = untag(raw);
    if raw.is_null() {
        return Ok(None);
    }

    let value = match field.kind {
        Kind::Str => FieldValue::Str(coerce_str(raw).ok_or_else(|| invalid_type(field, raw))?),
        Kind::Bool => FieldValue::Bool(coerce_bool(raw).ok_or_else(|| invalid_type(field, raw))?),
        Kind::StrList => {
            let items = match raw {
                Value::Sequence(items) => items
                    .iter()
                    .map(|item| coerce_str(untag(item)).ok_or_else(|| invalid_type(field, item)))
                    .collect::<Result<Vec<_>, _>>()?,
                scalar => vec![coerce_str(scalar).ok_or_else(|| invalid_type(field, scalar))?],
            };
            FieldValue::StrList(items)
        }
        Kind::Duration => FieldValue::Duration(coerce_duration(field, raw)?),
        Kind::Map => match raw {
            Value::Mapping(mapping) => FieldValue::Map(mapping.clone()),
            other => return Err(invalid_type(field, other)),
        },
    };
    Ok(Some(value))
}

fn untag(value: &Value) -> &Value {
    match value {
        Value::Tagged(tagged) => untag(&tagged.value),
        other => other,
    }
}

fn coerce_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(true) => Some("1".to_string()),
        Value::Bool(false) => Some("0".to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64().is_some_and(|f| f != 0.0)),
        Value::String(s) => parse_bool(s),
        _ => None,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "" | "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        _ => None,
    }
}

fn coerce_duration(field: &Field, value: &Value) -> Result<Duration, ProvisionerError> {
    let invalid = |shown: &dyn std::fmt::Display| {
        ProvisionerError::Validation(format!(
            "'{}' time: invalid duration \"{}\"",
            field.key, shown
        ))
    };
    match value {
        Value::Number(n) => {
            if n.as_i64().is_some_and(|secs| secs < 0) {
                return Err(ProvisionerError::Validation(format!(
                    "'{}' must be a non-negative number of seconds, got {}",
                    field.key, n
                )));
            }
            n.as_u64()
                .map(Duration::from_secs)
                .filter(|d| *d <= MAX_DURATION)
                .ok_or_else(|| invalid(n))
        }
        Value::String(s) => parse_duration(s).ok_or_else(|| invalid(s)),
        other => Err(invalid_type(field, other)),
    }
}

/// Longest representable duration: `i64::MAX` nanoseconds, roughly 292 years.
pub(crate) const MAX_DURATION: Duration = Duration::from_nanos(i64::MAX as u64);

/// Parses a duration such as `5m`, `1h30m` or `250ms`.
///
/// A bare `0` and the empty string are zero. Negative durations and
/// durations longer than [`MAX_DURATION`] are rejected.
pub(crate) fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.strip_prefix('+').unwrap_or(s);
    if s.is_empty() || s == "0" {
        return Some(Duration::ZERO);
    }

    let mut rest = s;
    let mut total = 0f64;
    while !rest.is_empty() {
        let caps = DURATION_RE.captures(rest)?;
        let number: f64 = caps[1].parse().ok()?;
        let unit_nanos = match &caps[2] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        total += number * unit_nanos;
        rest = &rest[caps[0].len()..];
    }

    let nanos = total.round();
    if !nanos.is_finite() || nanos > MAX_DURATION.as_nanos() as f64 {
        return None;
    }
    Some(Duration::from_nanos(nanos as u64).min(MAX_DURATION))
}

/// Runs every field check against `decoded`, collecting violations into `errs`.
///
/// Environment variables that pass are rewritten in place.
pub(crate) fn validate(decoded: &mut Decoded, errs: &mut MultiError) {
    let source_dir = decoded.opt_string("source_directory");
    for field in FIELDS {
        match field.check {
            Check::None => {}
            Check::EnvVars => {
                if let Some(vars) = decoded.list(field.key) {
                    let quoted = quote_env_vars(vars, errs);
                    decoded.insert(field.key, FieldValue::StrList(quoted));
                }
            }
            Check::Directory => {
                if let Some(dir) = decoded.opt_string(field.key)
                    && let Err(err) = validate_dir(&dir, field.key)
                {
                    errs.push(err);
                }
            }
            Check::File => {
                if let Some(file) = decoded.opt_string(field.key) {
                    let file = path::with_prefix(&file, source_dir.as_deref());
                    if let Err(err) = validate_file(&file, field.key) {
                        errs.push(err);
                    }
                }
            }
            Check::Recipes => match decoded.list(field.key) {
                None => errs.push(ProvisionerError::Validation(
                    "a list of recipes must be specified".to_string(),
                )),
                Some([]) => errs.push(ProvisionerError::Validation(
                    "a list of recipes cannot be empty".to_string(),
                )),
                Some(recipes) => {
                    for (index, recipe) in recipes.iter().enumerate() {
                        let recipe = path::with_prefix(recipe, source_dir.as_deref());
                        if let Err(err) = validate_file(&recipe, &format!("recipes[{}]", index)) {
                            errs.push(err);
                        }
                    }
                }
            },
            Check::Template(zero) => {
                let source = decoded.string(field.key);
                let data = zero();
                if let Err(err) = Template::parse(&source).and_then(|t| t.render(data.as_ref())) {
                    errs.push(ProvisionerError::template(field.key, err.to_string()));
                }
            }
        }
    }
}

fn quote_env_vars(vars: &[String], errs: &mut MultiError) -> Vec<String> {
    vars.iter()
        .map(|kv| match quote_env_var(kv) {
            Some(quoted) => quoted,
            None => {
                errs.push(ProvisionerError::Validation(format!(
                    "environment variable not in format 'key=value': {}",
                    kv
                )));
                kv.clone()
            }
        })
        .collect()
}

/// Rewrites `KEY=VALUE` as `KEY='VALUE'`, escaping single quotes for the shell.
///
/// Returns `None` when the entry has no `=` or an empty key.
pub fn quote_env_var(kv: &str) -> Option<String> {
    let (key, value) = kv.split_once('=')?;
    if key.is_empty() {
        return None;
    }
    Some(format!("{}='{}'", key, value.replace('\'', r#"'"'"'"#)))
}

fn validate_dir(path: &str, label: &str) -> Result<(), ProvisionerError> {
    let metadata = fs::metadata(path)
        .map_err(|e| ProvisionerError::io(format!("{}: {} is invalid", label, path), e))?;
    if !metadata.is_dir() {
        return Err(ProvisionerError::Validation(format!(
            "{}: {} must point to a directory",
            label, path
        )));
    }
    Ok(())
}

fn validate_file(path: &str, label: &str) -> Result<(), ProvisionerError> {
    let metadata = fs::metadata(path)
        .map_err(|e| ProvisionerError::io(format!("{}: {} is invalid", label, path), e))?;
    if metadata.is_dir() {
        return Err(ProvisionerError::Validation(format!(
            "{}: {} must point to a file",
            label, path
        )));
    }
    Ok(())
}
