//! Coordination key resolution
//!
//! A guarded call declares its key either as a fixed literal, a template over
//! the call's named arguments, or a custom resolver function. Templates use
//! `{name}` placeholders with optional dotted field paths (`{order.id}`);
//! `{{` and `}}` produce literal braces. Templates are parsed once at setup so
//! syntax errors surface before any call is made.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use latchkey_common::{LatchError, LatchResult};
use serde::Serialize;
use serde_json::Value;

/// Named argument values of the call being guarded
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyArgs {
    args: BTreeMap<String, Value>,
}

impl KeyArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an argument. Values that fail to serialize are bound as null and
    /// rejected when a template references them.
    pub fn with(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        self.insert(name, serde_json::to_value(value).unwrap_or(Value::Null));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.args.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// Bind every top-level field of a serializable request as an argument
    pub fn from_fields(request: &impl Serialize) -> LatchResult<Self> {
        match serde_json::to_value(request) {
            Ok(Value::Object(fields)) => Ok(fields.into_iter().collect()),
            Ok(other) => Err(LatchError::KeyResolution(format!(
                "expected an object with named fields, got {}",
                value_kind(&other)
            ))),
            Err(e) => Err(LatchError::KeyResolution(e.to_string())),
        }
    }
}

impl FromIterator<(String, Value)> for KeyArgs {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            args: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Arg(Vec<String>),
}

/// A parsed key template such as `order:{orderId}` or `user:{req.user.id}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl KeyTemplate {
    pub fn parse(source: &str) -> LatchResult<Self> {
        let invalid = |reason: &str| {
            LatchError::Configuration(format!("invalid key template '{}': {}", source, reason))
        };

        let mut segments = Vec::new();
        let mut text = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    text.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    text.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') => return Err(invalid("nested '{'")),
                            Some(ch) => name.push(ch),
                            None => return Err(invalid("unterminated placeholder")),
                        }
                    }
                    let path: Vec<String> = name.trim().split('.').map(str::to_string).collect();
                    if path.iter().any(|part| !is_identifier(part)) {
                        return Err(invalid(&format!("bad placeholder '{{{}}}'", name)));
                    }
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Arg(path));
                }
                '}' => return Err(invalid("unmatched '}'")),
                other => text.push(other),
            }
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }
        if segments.is_empty() {
            return Err(invalid("template is empty"));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Names of the top-level arguments this template references
    pub fn arguments(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Arg(path) => path.first().map(String::as_str),
                Segment::Text(_) => None,
            })
            .collect()
    }

    /// Render the template against bound arguments
    pub fn render(&self, args: &KeyArgs) -> LatchResult<String> {
        let mut key = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => key.push_str(text),
                Segment::Arg(path) => key.push_str(&lookup(&self.source, path, args)?),
            }
        }
        Ok(key)
    }
}

impl FromStr for KeyTemplate {
    type Err = LatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for KeyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn is_identifier(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn lookup(template: &str, path: &[String], args: &KeyArgs) -> LatchResult<String> {
    let dotted = path.join(".");
    let missing = || {
        LatchError::KeyResolution(format!(
            "template '{}' references '{}' which is not bound",
            template, dotted
        ))
    };

    let (root, fields) = path.split_first().ok_or_else(missing)?;
    let mut value = args.get(root).ok_or_else(missing)?;
    for field in fields {
        value = match value {
            Value::Object(map) => map.get(field),
            Value::Array(items) => field.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
        .ok_or_else(missing)?;
    }

    match value {
        Value::Null => Err(LatchError::KeyResolution(format!(
            "template '{}' references '{}' which is null",
            template, dotted
        ))),
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        // Maps serialize with sorted keys, so equal values render equally
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value)
            .map_err(|e| LatchError::KeyResolution(e.to_string())),
    }
}

/// Function resolving a key from call arguments
pub type ResolverFn = dyn Fn(&KeyArgs) -> LatchResult<String> + Send + Sync;

/// How a guarded call derives its coordination key
#[derive(Clone)]
pub enum KeySpec {
    Literal(String),
    Template(KeyTemplate),
    Resolver(Arc<ResolverFn>),
}

impl KeySpec {
    pub fn literal(key: impl Into<String>) -> LatchResult<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(LatchError::Configuration(
                "literal key must not be empty".to_string(),
            ));
        }
        Ok(KeySpec::Literal(key))
    }

    pub fn template(source: &str) -> LatchResult<Self> {
        KeyTemplate::parse(source).map(KeySpec::Template)
    }

    pub fn resolver<F>(resolve: F) -> Self
    where
        F: Fn(&KeyArgs) -> LatchResult<String> + Send + Sync + 'static,
    {
        KeySpec::Resolver(Arc::new(resolve))
    }

    /// Resolve the concrete key (without scene prefix)
    pub fn resolve(&self, args: &KeyArgs) -> LatchResult<String> {
        let key = match self {
            KeySpec::Literal(key) => key.clone(),
            KeySpec::Template(template) => template.render(args)?,
            KeySpec::Resolver(resolve) => resolve(args)?,
        };
        if key.is_empty() {
            return Err(LatchError::KeyResolution(format!(
                "key {:?} resolved to an empty string",
                self
            )));
        }
        Ok(key)
    }
}

impl fmt::Debug for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpec::Literal(key) => f.debug_tuple("Literal").field(key).finish(),
            KeySpec::Template(template) => {
                f.debug_tuple("Template").field(&template.source).finish()
            }
            KeySpec::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}
