//! Tool argument validation against a descriptor's input schema.
//!
//! Covers the subset of JSON Schema tool descriptors actually use:
//!
//! 1. `required` names must be present and non-null.
//! 2. `additionalProperties: false` rejects keys not in `properties`.
//! 3. Declared `type` per property, with safe coercions
//!    (`"42"` to `42` for integers, `"true"` to `true` for booleans,
//!    numbers to strings).
//! 4. `enum` membership, `minimum` / `maximum`, `minLength` / `maxLength`.
//!
//! Messages name the offending field so a calling model can fix its call.

use std::fmt::Write as _;

use serde_json::{Map, Value};

/// One problem with one argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    /// Argument name (empty for problems with the argument object itself)
    pub field: String,
    /// What is wrong
    pub message: String,
}

impl FieldViolation {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Outcome of validating one argument object
#[derive(Debug, Clone)]
pub struct Validated {
    /// Violations found; empty means valid
    pub violations: Vec<FieldViolation>,
    /// Arguments after coercion (the original arguments when invalid)
    pub arguments: Value,
}

impl Validated {
    /// Whether the arguments satisfied the schema
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// Names of the offending fields, in order of discovery
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        self.violations
            .iter()
            .map(|v| v.field.as_str())
            .filter(|f| !f.is_empty())
            .collect()
    }

    /// Render violations for a tool result
    #[must_use]
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for v in &self.violations {
            if v.field.is_empty() {
                let _ = writeln!(out, "- {}", v.message);
            } else {
                let _ = writeln!(out, "- Parameter '{}': {}", v.field, v.message);
            }
        }
        out.trim_end().to_string()
    }
}

/// Validate `arguments` against `schema`.
///
/// A null or empty schema accepts any object. A schema without `properties`
/// still enforces `required` and `additionalProperties: false`.
/// `null` arguments are treated as an empty object.
#[must_use]
pub fn validate_arguments(arguments: &Value, schema: &Value) -> Validated {
    let args = match arguments {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return Validated {
                violations: vec![FieldViolation::new(
                    "",
                    format!("arguments must be a JSON object, got {}", type_name(other)),
                )],
                arguments: arguments.clone(),
            };
        }
    };

    let empty = Map::new();
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let mut violations = Vec::new();

    for name in schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
    {
        match args.get(name) {
            None => violations.push(FieldViolation::new(name, "required parameter is missing")),
            Some(Value::Null) => {
                violations.push(FieldViolation::new(name, "required parameter must not be null"));
            }
            Some(_) => {}
        }
    }

    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
        let known: Vec<&str> = properties.keys().map(String::as_str).collect();
        for key in args.keys().filter(|k| !properties.contains_key(k.as_str())) {
            let message = if known.is_empty() {
                "unknown parameter, this tool takes no parameters".to_string()
            } else {
                format!("unknown parameter, valid parameters are: {}", known.join(", "))
            };
            violations.push(FieldViolation::new(key.as_str(), message));
        }
    }

    let mut coerced = args.clone();
    for (name, value) in &args {
        if value.is_null() {
            continue;
        }
        let Some(prop) = properties.get(name) else {
            continue;
        };
        match check_property(value, prop) {
            Ok(v) => {
                coerced.insert(name.clone(), v);
            }
            Err(message) => violations.push(FieldViolation::new(name.as_str(), message)),
        }
    }

    if violations.is_empty() {
        Validated {
            violations,
            arguments: Value::Object(coerced),
        }
    } else {
        Validated {
            violations,
            arguments: arguments.clone(),
        }
    }
}

fn check_property(value: &Value, prop: &Value) -> Result<Value, String> {
    let value = match prop.get("type") {
        Some(Value::String(ty)) => coerce(value, ty)?,
        // ["string", "null"] style unions: accept the first type that fits
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .find_map(|ty| coerce(value, ty).ok())
            .ok_or_else(|| format!("expected one of {}, got {}", Value::Array(types.clone()), type_name(value)))?,
        _ => value.clone(),
    };

    if let Some(options) = prop.get("enum").and_then(Value::as_array) {
        if !options.contains(&value) {
            let rendered: Vec<String> = options.iter().map(Value::to_string).collect();
            return Err(format!("must be one of: {}", rendered.join(", ")));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = prop.get("minimum").and_then(Value::as_f64) {
            if n < min {
                return Err(format!("must be >= {min}"));
            }
        }
        if let Some(max) = prop.get("maximum").and_then(Value::as_f64) {
            if n > max {
                return Err(format!("must be <= {max}"));
            }
        }
    }

    if let Some(s) = value.as_str() {
        let len = s.chars().count() as u64;
        if let Some(min) = prop.get("minLength").and_then(Value::as_u64) {
            if len < min {
                return Err(format!("must be at least {min} characters long"));
            }
        }
        if let Some(max) = prop.get("maxLength").and_then(Value::as_u64) {
            if len > max {
                return Err(format!("must be at most {max} characters long"));
            }
        }
    }

    Ok(value)
}

fn coerce(value: &Value, ty: &str) -> Result<Value, String> {
    let mismatch = || format!("expected {ty}, got {}", type_name(value));
    match (ty, value) {
        ("string", Value::String(_))
        | ("number", Value::Number(_))
        | ("boolean", Value::Bool(_))
        | ("array", Value::Array(_))
        | ("object", Value::Object(_))
        | ("null", Value::Null) => Ok(value.clone()),
        ("string", Value::Number(n)) => Ok(Value::String(n.to_string())),
        ("string", Value::Bool(b)) => Ok(Value::String(b.to_string())),
        ("integer", Value::Number(n)) => {
            if n.is_i64() || n.is_u64() {
                return Ok(value.clone());
            }
            match n.as_f64() {
                #[allow(clippy::cast_possible_truncation)]
                Some(f) if f.fract() == 0.0 => Ok(Value::from(f as i64)),
                _ => Err(format!("expected integer, got {n}")),
            }
        }
        ("integer", Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| format!("expected integer, got \"{s}\"")),
        ("number", Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("expected number, got \"{s}\"")),
        ("boolean", Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(format!("expected boolean, got \"{s}\"")),
        },
        ("string" | "integer" | "number" | "boolean" | "array" | "object" | "null", _) => {
            Err(mismatch())
        }
        // Unknown type keyword: pass through
        _ => Ok(value.clone()),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
