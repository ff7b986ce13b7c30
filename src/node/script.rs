//! Lua script node
//!
//! The script sees `val`, `val_t`, `msg` (topic + payload) and a read-only
//! `get_variable(name, is_global)`. Its return value replaces the message
//! value; returning nothing leaves the message unchanged. Each run gets a
//! fresh interpreter with `os`, `io`, `debug` and `package` removed, and is
//! aborted once it runs past its time limit.

use async_trait::async_trait;
use mlua::{HookTriggers, Lua, LuaSerdeExt, VmState};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::{ContextStore, Scope, Variable};
use crate::error::{FlowError, Result};
use crate::flow::types::NodeId;
use crate::message::Message;
use crate::node::{BaseNode, Node};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptConfig {
    pub code: String,
    /// 0 means the engine's default request timeout
    #[serde(default)]
    pub timeout_secs: u64,
}

/// How often the interpreter checks the deadline
const DEADLINE_CHECK_INSTRUCTIONS: u32 = 1000;

pub struct ScriptNode {
    base: BaseNode,
    config: ScriptConfig,
    timeout: Duration,
}

impl ScriptNode {
    pub fn new(base: BaseNode) -> Result<Self> {
        let config: ScriptConfig = base.load_config()?;
        if config.code.trim().is_empty() {
            return Err(FlowError::config(base.id(), "script is empty"));
        }
        let timeout = match config.timeout_secs {
            0 => base.flow_context().engine.default_request_timeout_secs,
            secs => secs,
        };
        Ok(Self {
            base,
            config,
            timeout: Duration::from_secs(timeout.max(1)),
        })
    }
}

struct ScriptInput {
    value: Value,
    value_type: String,
    msg: Value,
    context: Arc<ContextStore>,
    flow_id: String,
}

fn run_script(code: &str, input: ScriptInput, deadline: Instant) -> mlua::Result<Option<Value>> {
    let lua = Lua::new();
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(DEADLINE_CHECK_INSTRUCTIONS),
        move |_, _| {
            if Instant::now() >= deadline {
                Err(mlua::Error::runtime("script ran past its deadline"))
            } else {
                Ok(VmState::Continue)
            }
        },
    )?;
    let globals = lua.globals();
    for module in ["os", "io", "debug", "package"] {
        globals.set(module, mlua::Nil)?;
    }

    globals.set("val", lua.to_value(&input.value)?)?;
    globals.set("val_t", input.value_type)?;
    globals.set("msg", lua.to_value(&input.msg)?)?;

    let context = input.context;
    let flow_id = input.flow_id;
    let get_variable = lua.create_function(move |lua, (name, is_global): (String, Option<bool>)| {
        match context.get_variable(&name, &Scope::select(is_global.unwrap_or(false), &flow_id)) {
            Ok(variable) => lua.to_value(&variable.value),
            Err(_) => Ok(mlua::Nil),
        }
    })?;
    globals.set("get_variable", get_variable)?;

    match lua.load(code).eval::<mlua::Value>()? {
        mlua::Value::Nil => Ok(None),
        result => lua.from_value(result).map(Some),
    }
}

#[async_trait]
impl Node for ScriptNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    async fn on_input(&self, msg: &mut Message) -> Result<Vec<NodeId>> {
        let code = self.config.code.clone();
        let input = ScriptInput {
            value: msg.payload.value.clone(),
            value_type: msg.payload.value_type.clone(),
            msg: json!({ "topic": msg.topic, "payload": msg.payload }),
            context: self.base.flow_context().context.clone(),
            flow_id: self.base.flow_id().to_string(),
        };

        // the interpreter is !Send; run it on the blocking pool
        let timeout = self.timeout;
        let outcome = tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + timeout;
            run_script(&code, input, deadline).map_err(|e| (Instant::now() >= deadline, e.to_string()))
        })
        .await
        .map_err(|e| self.base.error(format!("script task failed: {}", e)))?;

        let result = match outcome {
            Ok(result) => result,
            Err((true, _)) => {
                return Err(FlowError::Timeout(format!(
                    "script of node '{}' ran longer than {}s",
                    self.base.id(),
                    timeout.as_secs()
                )))
            }
            Err((false, e)) => return Err(self.base.error(format!("script error: {}", e))),
        };

        if let Some(value) = result {
            tracing::debug!("Script returned {}", value);
            msg.payload.set_variable(Variable::infer(value));
        }
        Ok(self.base.success_next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use crate::node::testing::{flow_context, meta};

    async fn script(code: &str) -> ScriptNode {
        script_with(json!({ "code": code })).await
    }

    async fn script_with(config: Value) -> ScriptNode {
        let (ctx, _) = flow_context().await;
        ScriptNode::new(BaseNode::new(meta("sc1", "script", config), ctx, false)).unwrap()
    }

    fn msg(value: Value) -> Message {
        Message::new("x", Payload::new("evt.sensor.report", "sensor_temp", "int", value))
    }

    #[tokio::test]
    async fn return_value_replaces_message_value() {
        let node = script("return val * 2").await;
        let mut m = msg(json!(21));
        node.on_input(&mut m).await.unwrap();
        assert_eq!(m.payload.value, json!(42));
        assert_eq!(m.payload.value_type, "int");
    }

    #[tokio::test]
    async fn sees_message_and_variables() {
        let node = script(r#"return { service = msg.payload.serv, level = get_variable("level") }"#).await;
        node.base
            .context()
            .set_variable("level", &Scope::flow("f1"), Variable::int(3))
            .await
            .unwrap();

        let mut m = msg(json!(1));
        node.on_input(&mut m).await.unwrap();
        assert_eq!(m.payload.value, json!({ "service": "sensor_temp", "level": 3 }));
        assert_eq!(m.payload.value_type, "object");
    }

    #[tokio::test]
    async fn nil_result_keeps_message() {
        let node = script("local x = 1").await;
        let mut m = msg(json!(5));
        node.on_input(&mut m).await.unwrap();
        assert_eq!(m.payload.value, json!(5));
    }

    #[tokio::test]
    async fn sandbox_and_runtime_errors_are_node_errors() {
        let node = script("return os.time()").await;
        let err = node.on_input(&mut msg(json!(1))).await.unwrap_err();
        assert!(matches!(err, FlowError::NodeExecution { .. }));
    }

    #[tokio::test]
    async fn endless_loop_is_cut_by_the_deadline() {
        let node = script_with(json!({ "code": "while true do end", "timeout_secs": 1 })).await;
        let started = Instant::now();
        let err = node.on_input(&mut msg(json!(1))).await.unwrap_err();
        assert!(matches!(err, FlowError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
