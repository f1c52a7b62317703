//! Lua-backed evaluator.
//!
//! A fresh Lua VM is created for every evaluation context, used once, and
//! dropped — evaluation contexts are single-use by contract, so nothing
//! leaks between calls. Host functions and bindings are installed into the
//! VM's globals before the chunk runs.
//!
//! Cooperative cancellation uses an instruction-count hook: every
//! `CANCEL_CHECK_INSTRUCTIONS` VM instructions the hook checks the cancel
//! flag and aborts the evaluation with a runtime error when it is set. A
//! chunk that never executes an instruction (e.g. blocked inside a host
//! function) will not observe cancellation until it returns to the VM.

use std::collections::HashMap;

use mlua::{HookTriggers, Lua, MultiValue, Table, VmState};
use wisp_core::{EvalOutcome, EvalRequest, Evaluator, OpaqueValue, ScriptError, Value};

/// Instructions between cancel-flag checks.
const CANCEL_CHECK_INSTRUCTIONS: u32 = 10_000;

/// Nesting limit for boundary conversions; self-referential tables abort
/// instead of recursing forever.
const MAX_CONVERT_DEPTH: usize = 32;

/// Userdata wrapper carrying an opaque host handle through the VM.
struct OpaqueHandle(OpaqueValue);

impl mlua::UserData for OpaqueHandle {}

pub struct LuaEvaluator {
    check_interval: u32,
}

impl LuaEvaluator {
    pub fn new() -> Self {
        Self {
            check_interval: CANCEL_CHECK_INSTRUCTIONS,
        }
    }

    fn prepare(&self, lua: &Lua, request: &EvalRequest<'_>) -> mlua::Result<()> {
        let globals = lua.globals();

        for (name, value) in request.bindings {
            globals.set(name.as_str(), value_to_lua(lua, value, 0)?)?;
        }

        for (name, callable) in request.functions {
            let callable = callable.clone();
            let function = lua.create_function(move |lua, args: MultiValue| {
                let mut host_args = Vec::with_capacity(args.len());
                for arg in args.iter() {
                    host_args.push(lua_to_value(arg, 0)?);
                }
                let result = callable(&host_args)
                    .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
                value_to_lua(lua, &result, 0)
            })?;
            globals.set(name.as_str(), function)?;
        }

        Ok(())
    }
}

impl Default for LuaEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator for LuaEvaluator {
    fn name(&self) -> &'static str {
        "lua"
    }

    fn eval(&self, request: EvalRequest<'_>) -> Result<EvalOutcome, ScriptError> {
        let lua = Lua::new();

        self.prepare(&lua, &request)
            .map_err(|e| ScriptError::execution(format_lua_error(&e)))?;

        let cancel = request.cancel.clone();
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(self.check_interval),
            move |_lua, _debug| {
                if cancel.is_cancelled() {
                    Err(mlua::Error::RuntimeError("execution cancelled".to_string()))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );

        let result: mlua::Result<mlua::Value> =
            lua.load(request.code).set_name(request.name).eval();
        lua.remove_hook();

        let value = match result {
            Ok(value) => lua_to_value(&value, 0)
                .map_err(|e| ScriptError::execution(format_lua_error(&e)))?,
            Err(e) => return Err(ScriptError::execution(format_lua_error(&e))),
        };

        let mut captured = HashMap::new();
        for name in request.capture {
            let raw: mlua::Value = lua
                .globals()
                .get(name.as_str())
                .unwrap_or(mlua::Value::Nil);
            let converted =
                lua_to_value(&raw, 0).map_err(|e| ScriptError::execution(format_lua_error(&e)))?;
            captured.insert(name.clone(), converted);
        }

        Ok(EvalOutcome { value, captured })
    }
}

/// Convert a host value into the VM. Opaque handles become userdata.
fn value_to_lua(lua: &Lua, value: &Value, depth: usize) -> mlua::Result<mlua::Value> {
    if depth > MAX_CONVERT_DEPTH {
        return Err(mlua::Error::RuntimeError(
            "value nesting too deep".to_string(),
        ));
    }

    match value {
        Value::Null => Ok(mlua::Value::Nil),
        Value::Bool(b) => Ok(mlua::Value::Boolean(*b)),
        Value::Number(n) => Ok(mlua::Value::Number(*n)),
        Value::String(s) => Ok(mlua::Value::String(lua.create_string(s)?)),
        Value::Sequence(items) => {
            let table = lua.create_table()?;
            for (index, item) in items.iter().enumerate() {
                table.raw_set(index + 1, value_to_lua(lua, item, depth + 1)?)?;
            }
            Ok(mlua::Value::Table(table))
        }
        Value::Mapping(entries) => {
            let table = lua.create_table()?;
            for (key, item) in entries {
                table.raw_set(key.as_str(), value_to_lua(lua, item, depth + 1)?)?;
            }
            Ok(mlua::Value::Table(table))
        }
        Value::Opaque(handle) => Ok(mlua::Value::UserData(
            lua.create_userdata(OpaqueHandle(handle.clone()))?,
        )),
    }
}

/// Convert a VM value back out. Numbers flatten to f64; array-like tables
/// become sequences, everything else table-shaped becomes a mapping;
/// functions and threads cannot outlive their VM and convert to null.
fn lua_to_value(value: &mlua::Value, depth: usize) -> mlua::Result<Value> {
    if depth > MAX_CONVERT_DEPTH {
        return Err(mlua::Error::RuntimeError(
            "value nesting too deep".to_string(),
        ));
    }

    match value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(*b)),
        mlua::Value::Integer(i) => Ok(Value::Number(*i as f64)),
        mlua::Value::Number(n) => Ok(Value::Number(*n)),
        mlua::Value::String(s) => Ok(Value::String(
            s.to_str()
                .map_or_else(|_| "<invalid utf8>".to_string(), |s| s.to_string()),
        )),
        mlua::Value::Table(table) => table_to_value(table, depth),
        mlua::Value::UserData(ud) => match ud.borrow::<OpaqueHandle>() {
            Ok(handle) => Ok(Value::Opaque(handle.0.clone())),
            Err(_) => Ok(Value::Null),
        },
        _ => Ok(Value::Null),
    }
}

fn table_to_value(table: &Table, depth: usize) -> mlua::Result<Value> {
    let len = table.raw_len();
    let mut pair_count = 0;
    let mut entries = HashMap::new();

    for pair in table.clone().pairs::<mlua::Value, mlua::Value>() {
        let (key, item) = pair?;
        pair_count += 1;

        let key = match &key {
            mlua::Value::String(s) => match s.to_str() {
                Ok(s) => s.to_string(),
                Err(_) => continue,
            },
            mlua::Value::Integer(i) => i.to_string(),
            mlua::Value::Number(n) => n.to_string(),
            // Exotic keys (tables, functions) have no host representation.
            _ => continue,
        };
        entries.insert(key, lua_to_value(&item, depth + 1)?);
    }

    // A table whose pairs are exactly 1..len is array-like.
    if len > 0 && pair_count == len {
        let mut items = Vec::with_capacity(len);
        for index in 1..=len {
            let item: mlua::Value = table.raw_get(index)?;
            items.push(lua_to_value(&item, depth + 1)?);
        }
        return Ok(Value::Sequence(items));
    }

    Ok(Value::Mapping(entries))
}

fn format_lua_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::CallbackError { cause, .. } => format_lua_error(cause),
        mlua::Error::SyntaxError { message, .. } => format!("compile error: {message}"),
        _ => format!("{err}"),
    }
}
