//! Typed variable values and their scopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Literal scope key shared by all flows
pub const GLOBAL_SCOPE: &str = "global";

/// A typed value: type tag plus raw JSON value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    #[serde(default)]
    pub value_type: String,
    #[serde(default)]
    pub value: Value,
}

impl Variable {
    pub fn new(value_type: &str, value: Value) -> Self {
        Self {
            value_type: value_type.to_string(),
            value,
        }
    }

    /// Tag a raw JSON value with the matching type name
    pub fn infer(value: Value) -> Self {
        let value_type = match &value {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(n) if n.is_i64() || n.is_u64() => "int",
            Value::Number(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) | Value::Object(_) => "object",
        };
        Self::new(value_type, value)
    }

    pub fn int(v: i64) -> Self {
        Self::new("int", Value::from(v))
    }

    pub fn float(v: f64) -> Self {
        Self::new("float", Value::from(v))
    }

    pub fn string(v: impl Into<String>) -> Self {
        Self::new("string", Value::String(v.into()))
    }

    pub fn bool(v: bool) -> Self {
        Self::new("bool", Value::Bool(v))
    }

    pub fn is_number(&self) -> bool {
        matches!(self.value_type.as_str(), "int" | "float" | "number") || self.value.is_number()
    }

    pub fn to_number(&self) -> Option<f64> {
        match &self.value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) if self.is_number() => s.parse().ok(),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value_type.is_empty() && self.value.is_null()
    }
}

/// Where a variable lives
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Visible to every flow
    Global,
    /// Visible only to nodes of this flow
    Flow(String),
}

impl Scope {
    pub fn flow(flow_id: impl Into<String>) -> Self {
        Scope::Flow(flow_id.into())
    }

    /// Nodes pick their scope with an `is_global` switch
    pub fn select(is_global: bool, flow_id: &str) -> Self {
        if is_global {
            Scope::Global
        } else {
            Scope::Flow(flow_id.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Scope::Global => GLOBAL_SCOPE,
            Scope::Flow(id) => id,
        }
    }
}

impl From<&str> for Scope {
    fn from(key: &str) -> Self {
        if key == GLOBAL_SCOPE {
            Scope::Global
        } else {
            Scope::Flow(key.to_string())
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored entry, as returned for inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub updated_at: DateTime<Utc>,
    pub variable: Variable,
    /// Not written to the backing store; lost on restart
    #[serde(default)]
    pub in_memory: bool,
}
