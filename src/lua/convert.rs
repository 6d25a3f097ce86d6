//! Conversion between host values and Lua values.

use mlua::{Lua, Result as LuaResult, Table, UserData, UserDataMethods, Value as LuaValue};

use crate::computer::{HostObject, Value};
use crate::http::WebsocketHandle;

/// Tables nested deeper than this are rejected when leaving Lua.
const MAX_DEPTH: usize = 32;

/// A host object visible to Lua as userdata.
pub(crate) struct LuaObject(pub HostObject);

impl UserData for LuaObject {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("url", |_, this, ()| Ok(websocket(this)?.url().to_string()));

        methods.add_method(
            "send",
            |_, this, (data, binary): (mlua::String, Option<bool>)| {
                let socket = websocket(this)?;
                Ok(match socket.send(data.as_bytes().to_vec(), binary.unwrap_or(false)) {
                    Ok(()) => (true, None),
                    Err(message) => (false, Some(message)),
                })
            },
        );

        methods.add_method("close", |_, this, ()| {
            websocket(this)?.close();
            Ok(())
        });

        methods.add_method("is_closed", |_, this, ()| Ok(websocket(this)?.is_closed()));
    }
}

fn websocket(object: &LuaObject) -> LuaResult<&WebsocketHandle> {
    object
        .0
        .downcast_ref::<WebsocketHandle>()
        .ok_or_else(|| mlua::Error::RuntimeError("object is not a websocket".to_string()))
}

/// Convert a host value into Lua.
pub(crate) fn to_lua(lua: &Lua, value: &Value) -> LuaResult<LuaValue> {
    Ok(match value {
        Value::Nil => LuaValue::Nil,
        Value::Bool(b) => LuaValue::Boolean(*b),
        Value::Number(n) => number_to_lua(*n),
        Value::String(s) => LuaValue::String(lua.create_string(s)?),
        Value::Bytes(b) => LuaValue::String(lua.create_string(b)?),
        Value::Table(entries) => {
            let table = lua.create_table_with_capacity(0, entries.len())?;
            for (key, value) in entries {
                table.raw_set(to_lua(lua, key)?, to_lua(lua, value)?)?;
            }
            LuaValue::Table(table)
        }
        Value::Object(object) => {
            LuaValue::UserData(lua.create_userdata(LuaObject(object.clone()))?)
        }
    })
}

/// Integral numbers become Lua integers so `1` prints as `1`, not `1.0`.
fn number_to_lua(n: f64) -> LuaValue {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 {
        LuaValue::Integer(n as i64)
    } else {
        LuaValue::Number(n)
    }
}

/// Convert a Lua value into a host value.
///
/// Functions, threads and foreign userdata cannot leave Lua.
pub(crate) fn from_lua(value: &LuaValue) -> LuaResult<Value> {
    from_lua_depth(value, 0)
}

fn from_lua_depth(value: &LuaValue, depth: usize) -> LuaResult<Value> {
    Ok(match value {
        LuaValue::Nil => Value::Nil,
        LuaValue::Boolean(b) => Value::Bool(*b),
        LuaValue::Integer(i) => Value::Number(*i as f64),
        LuaValue::Number(n) => Value::Number(*n),
        LuaValue::String(s) => {
            let bytes = s.as_bytes().to_vec();
            match String::from_utf8(bytes) {
                Ok(text) => Value::String(text),
                Err(e) => Value::Bytes(e.into_bytes()),
            }
        }
        LuaValue::Table(table) => table_from_lua(table, depth)?,
        LuaValue::UserData(data) => match data.borrow::<LuaObject>() {
            Ok(object) => Value::Object(object.0.clone()),
            Err(_) => return Err(cannot_convert(value)),
        },
        _ => return Err(cannot_convert(value)),
    })
}

fn table_from_lua(table: &Table, depth: usize) -> LuaResult<Value> {
    if depth >= MAX_DEPTH {
        return Err(mlua::Error::RuntimeError(
            "table is nested too deeply".to_string(),
        ));
    }

    let mut entries = Vec::new();
    for pair in table.clone().pairs::<LuaValue, LuaValue>() {
        let (key, value) = pair?;
        entries.push((from_lua_depth(&key, depth + 1)?, from_lua_depth(&value, depth + 1)?));
    }
    Ok(Value::Table(entries))
}

fn cannot_convert(value: &LuaValue) -> mlua::Error {
    mlua::Error::RuntimeError(format!("cannot pass a {} to the host", value.type_name()))
}
