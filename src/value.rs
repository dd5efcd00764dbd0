use std::collections::BTreeMap;

use crate::error::TasError;
use crate::shared_buffer::SharedBufferHandle;

/// The only value type allowed to cross a context boundary: message
/// payloads, shared-data entries, and request/response bodies are all
/// `SerializedValue`. Anything not representable here (functions,
/// coroutines, userdata) is rejected at the edge rather than carried
/// across.
#[derive(Debug, Clone, PartialEq)]
pub enum SerializedValue {
    Nil,
    Boolean(bool),
    Number(f64),
    String(String),
    Array(Vec<SerializedValue>),
    Table(BTreeMap<String, SerializedValue>),
    SharedBufferRef(SharedBufferHandle),
}

impl SerializedValue {
    pub fn is_nil(&self) -> bool {
        matches!(self, SerializedValue::Nil)
    }

    /// Converts a Lua value into a `SerializedValue`, rejecting anything
    /// that cannot cross a context boundary. Tables are inspected for a
    /// dense, 1-based integer-key sequence and treated as arrays;
    /// anything else with string keys becomes a table. Mixed key types
    /// are rejected.
    pub fn from_lua(value: &mlua::Value) -> Result<SerializedValue, TasError> {
        match value {
            mlua::Value::Nil => Ok(SerializedValue::Nil),
            mlua::Value::Boolean(b) => Ok(SerializedValue::Boolean(*b)),
            mlua::Value::Integer(i) => Ok(SerializedValue::Number(*i as f64)),
            mlua::Value::Number(n) => Ok(SerializedValue::Number(*n)),
            mlua::Value::String(s) => {
                let s = s.to_str().map_err(|e| {
                    TasError::SerializationRejected(format!("non-utf8 string: {e}"))
                })?;
                Ok(SerializedValue::String(s.to_string()))
            }
            mlua::Value::Table(t) => Self::table_from_lua(t),
            mlua::Value::LightUserData(_)
            | mlua::Value::UserData(_)
            | mlua::Value::Function(_)
            | mlua::Value::Thread(_)
            | mlua::Value::Error(_) => Err(TasError::SerializationRejected(
                "only nil, boolean, number, string, table values may cross a context boundary"
                    .to_string(),
            )),
            mlua::Value::Other(_) => Err(TasError::SerializationRejected(
                "unsupported Lua value type".to_string(),
            )),
        }
    }

    fn table_from_lua(table: &mlua::Table) -> Result<SerializedValue, TasError> {
        let len = table.raw_len();
        let mut is_array = len > 0;
        if is_array {
            for pair in table.clone().pairs::<mlua::Value, mlua::Value>() {
                let (k, _) = pair.map_err(|e| {
                    TasError::SerializationRejected(format!("table iteration failed: {e}"))
                })?;
                match k {
                    mlua::Value::Integer(i) if i >= 1 && (i as usize) <= len => {}
                    _ => {
                        is_array = false;
                        break;
                    }
                }
            }
        }
        if is_array {
            let mut out = Vec::with_capacity(len);
            for i in 1..=len {
                let v: mlua::Value = table.raw_get(i).map_err(|e| {
                    TasError::SerializationRejected(format!("array element {i} unreadable: {e}"))
                })?;
                out.push(SerializedValue::from_lua(&v)?);
            }
            return Ok(SerializedValue::Array(out));
        }
        let mut map = BTreeMap::new();
        let mut key_kind: Option<&'static str> = None;
        for pair in table.clone().pairs::<mlua::Value, mlua::Value>() {
            let (k, v) = pair.map_err(|e| {
                TasError::SerializationRejected(format!("table iteration failed: {e}"))
            })?;
            let (kind, key) = match k {
                mlua::Value::String(s) => (
                    "string",
                    s.to_str()
                        .map_err(|e| TasError::SerializationRejected(format!("non-utf8 key: {e}")))?
                        .to_string(),
                ),
                mlua::Value::Integer(i) if i >= 0 => ("integer", i.to_string()),
                mlua::Value::Integer(i) => {
                    return Err(TasError::SerializationRejected(format!(
                        "table integer keys must be non-negative, got {i}"
                    )))
                }
                _ => {
                    return Err(TasError::SerializationRejected(
                        "table keys must be strings or integers".to_string(),
                    ))
                }
            };
            match key_kind {
                None => key_kind = Some(kind),
                Some(prev) if prev != kind => {
                    return Err(TasError::SerializationRejected(
                        "table keys must not mix integer and string kinds".to_string(),
                    ))
                }
                Some(_) => {}
            }
            map.insert(key, SerializedValue::from_lua(&v)?);
        }
        Ok(SerializedValue::Table(map))
    }

    /// Reconstructs a Lua value from a `SerializedValue` in the given VM.
    pub fn to_lua(&self, lua: &mlua::Lua) -> mlua::Result<mlua::Value> {
        match self {
            SerializedValue::Nil => Ok(mlua::Value::Nil),
            SerializedValue::Boolean(b) => Ok(mlua::Value::Boolean(*b)),
            SerializedValue::Number(n) => Ok(mlua::Value::Number(*n)),
            SerializedValue::String(s) => Ok(mlua::Value::String(lua.create_string(s)?)),
            SerializedValue::Array(items) => {
                let t = lua.create_table()?;
                for (i, item) in items.iter().enumerate() {
                    t.raw_set(i + 1, item.to_lua(lua)?)?;
                }
                Ok(mlua::Value::Table(t))
            }
            SerializedValue::Table(map) => {
                let t = lua.create_table()?;
                for (k, v) in map {
                    t.raw_set(k.as_str(), v.to_lua(lua)?)?;
                }
                Ok(mlua::Value::Table(t))
            }
            SerializedValue::SharedBufferRef(handle) => {
                let ud = lua.create_any_userdata(handle.clone())?;
                Ok(mlua::Value::UserData(ud))
            }
        }
    }

    /// Encodes this value as a `serde_json::Value`, used for the JSON
    /// view of shared buffers and for the REPL's diagnostic output.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SerializedValue::Nil => serde_json::Value::Null,
            SerializedValue::Boolean(b) => serde_json::Value::Bool(*b),
            SerializedValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            SerializedValue::String(s) => serde_json::Value::String(s.clone()),
            SerializedValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(SerializedValue::to_json).collect())
            }
            SerializedValue::Table(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            SerializedValue::SharedBufferRef(handle) => {
                serde_json::json!({ "__shared_buffer__": handle.id() })
            }
        }
    }

    pub fn from_json(value: &serde_json::Value) -> SerializedValue {
        match value {
            serde_json::Value::Null => SerializedValue::Nil,
            serde_json::Value::Bool(b) => SerializedValue::Boolean(*b),
            serde_json::Value::Number(n) => {
                SerializedValue::Number(n.as_f64().unwrap_or_default())
            }
            serde_json::Value::String(s) => SerializedValue::String(s.clone()),
            serde_json::Value::Array(items) => {
                SerializedValue::Array(items.iter().map(SerializedValue::from_json).collect())
            }
            serde_json::Value::Object(map) => SerializedValue::Table(
                map.iter()
                    .map(|(k, v)| (k.clone(), SerializedValue::from_json(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_preserves_shape() {
        let mut table = BTreeMap::new();
        table.insert("a".to_string(), SerializedValue::Number(1.0));
        table.insert(
            "b".to_string(),
            SerializedValue::Array(vec![SerializedValue::String("x".into()), SerializedValue::Nil]),
        );
        let value = SerializedValue::Table(table);
        let json = value.to_json();
        let back = SerializedValue::from_json(&json);
        assert_eq!(value, back);
    }

    #[test]
    fn lua_array_detection_requires_dense_integer_keys() {
        let lua = mlua::Lua::new();
        let t = lua.create_table().unwrap();
        t.set(1, "a").unwrap();
        t.set(2, "b").unwrap();
        let v = SerializedValue::from_lua(&mlua::Value::Table(t)).unwrap();
        assert_eq!(
            v,
            SerializedValue::Array(vec![
                SerializedValue::String("a".into()),
                SerializedValue::String("b".into())
            ])
        );
    }

    #[test]
    fn mixed_integer_and_string_keys_are_rejected() {
        let lua = mlua::Lua::new();
        let t = lua.create_table().unwrap();
        t.set(1, "a").unwrap();
        t.set("x", "b").unwrap();
        let err = SerializedValue::from_lua(&mlua::Value::Table(t)).unwrap_err();
        assert!(matches!(err, TasError::SerializationRejected(_)));
    }

    #[test]
    fn negative_integer_keys_are_rejected() {
        let lua = mlua::Lua::new();
        let t = lua.create_table().unwrap();
        t.set(-1, "a").unwrap();
        let err = SerializedValue::from_lua(&mlua::Value::Table(t)).unwrap_err();
        assert!(matches!(err, TasError::SerializationRejected(_)));
    }

    #[test]
    fn lua_function_is_rejected() {
        let lua = mlua::Lua::new();
        let f = lua.create_function(|_, ()| Ok(())).unwrap();
        let err = SerializedValue::from_lua(&mlua::Value::Function(f)).unwrap_err();
        assert!(matches!(err, TasError::SerializationRejected(_)));
    }
}
