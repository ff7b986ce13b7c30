//! Conditional branching on the message value or context variables

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::cmp::Ordering;

use crate::error::Result;
use crate::flow::types::NodeId;
use crate::message::Message;
use crate::node::{BaseNode, Node};

/// Left-hand side of an expression
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Operand {
    /// The whole message value
    #[default]
    Msg,
    /// JSONPath into the message value, e.g. `$.temp.inside`
    Path { path: String },
    Variable {
        name: String,
        #[serde(default)]
        is_global: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Contains,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Join {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Expression {
    #[serde(default)]
    pub operand: Operand,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IfConfig {
    pub expressions: Vec<Expression>,
    #[serde(default)]
    pub join: Join,
    #[serde(default)]
    pub true_transition: String,
    #[serde(default)]
    pub false_transition: String,
}

pub struct IfNode {
    base: BaseNode,
    config: IfConfig,
}

impl IfNode {
    pub fn new(base: BaseNode) -> Result<Self> {
        let config = base.load_config()?;
        Ok(Self { base, config })
    }

    fn resolve(&self, operand: &Operand, msg: &Message) -> Result<Value> {
        match operand {
            Operand::Msg => Ok(msg.payload.value.clone()),
            Operand::Path { path } => {
                let found = jsonpath_lib::select(&msg.payload.value, path)
                    .map_err(|e| self.base.error(format!("bad path '{}': {:?}", path, e)))?;
                Ok(found.first().map(|v| (*v).clone()).unwrap_or(Value::Null))
            }
            Operand::Variable { name, is_global } => Ok(self
                .base
                .context()
                .get_variable(name, &self.base.scope(*is_global))?
                .value),
        }
    }

    fn evaluate(&self, msg: &Message) -> Result<bool> {
        let mut outcomes = Vec::with_capacity(self.config.expressions.len());
        for expr in &self.config.expressions {
            let left = self.resolve(&expr.operand, msg)?;
            outcomes.push(compare(&left, expr.operator, &expr.value));
        }
        Ok(match self.config.join {
            Join::And => outcomes.iter().all(|ok| *ok),
            Join::Or => outcomes.iter().any(|ok| *ok),
        })
    }
}

/// Numbers compare numerically, strings lexically; mismatched kinds only satisfy `ne`
pub fn compare(left: &Value, op: Operator, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };
    let equal = ordering.map_or_else(|| left == right, |o| o == Ordering::Equal);

    match op {
        Operator::Eq => equal,
        Operator::Ne => !equal,
        Operator::Gt => ordering == Some(Ordering::Greater),
        Operator::Lt => ordering == Some(Ordering::Less),
        Operator::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        Operator::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        Operator::Contains => match (left, right) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.contains(needle),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
    }
}

#[async_trait]
impl Node for IfNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    async fn on_input(&self, msg: &mut Message) -> Result<Vec<NodeId>> {
        let passed = self.evaluate(msg)?;
        tracing::debug!("Condition evaluated to {}", passed);

        let target = if passed {
            if self.config.true_transition.is_empty() {
                return Ok(self.base.success_next());
            }
            &self.config.true_transition
        } else {
            &self.config.false_transition
        };
        Ok(if target.is_empty() { Vec::new() } else { vec![target.clone()] })
    }
}
