//! Deep-object query coder.
//!
//! Encodes a nested JSON object into bracketed query pairs and back:
//! `{"filter":{"age":{"gte":21}},"tags":["a","b"]}` becomes
//! `filter[age][gte]=21&tags=a&tags=b`. Arrays are repeated keys; a
//! repeated key decodes back into an array.

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Encode a JSON object as a deep-object query string.
pub fn encode(obj: &Value) -> String {
    let mut ser = form_urlencoded::Serializer::new(String::new());
    if let Value::Object(m) = obj {
        for (k, v) in m {
            walk(k, v, &mut ser);
        }
    }
    ser.finish()
}

fn walk(prefix: &str, v: &Value, ser: &mut form_urlencoded::Serializer<'_, String>) {
    match v {
        Value::Object(m) => {
            for (k, v2) in m {
                walk(&format!("{prefix}[{k}]"), v2, ser);
            }
        }
        Value::Array(a) => {
            for v2 in a {
                walk(prefix, v2, ser);
            }
        }
        Value::Null => {
            ser.append_pair(prefix, "");
        }
        Value::String(s) => {
            ser.append_pair(prefix, s);
        }
        other => {
            ser.append_pair(prefix, &other.to_string());
        }
    }
}

/// Decode a deep-object query string into a JSON object. Scalar values
/// are inferred: `true`/`false`, numbers, otherwise strings.
pub fn decode(query: &str) -> Result<Value> {
    let mut root = Map::new();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        let path = parse_key(&key)?;
        insert(&mut root, &path, infer(&value));
    }
    Ok(Value::Object(root))
}

/// `a[b][c]` → `["a","b","c"]`.
fn parse_key(key: &str) -> Result<Vec<String>> {
    let Some(open) = key.find('[') else {
        return Ok(vec![key.to_string()]);
    };
    let mut path = vec![key[..open].to_string()];
    let mut rest = &key[open..];
    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(Error::bad_request(format!("malformed query key '{key}'")));
        }
        let Some(close) = rest.find(']') else {
            return Err(Error::bad_request(format!("malformed query key '{key}'")));
        };
        path.push(rest[1..close].to_string());
        rest = &rest[close + 1..];
    }
    if path.iter().any(String::is_empty) {
        return Err(Error::bad_request(format!("malformed query key '{key}'")));
    }
    Ok(path)
}

fn insert(obj: &mut Map<String, Value>, path: &[String], value: Value) {
    let (first, rest) = match path.split_first() {
        Some(p) => p,
        None => return,
    };
    if rest.is_empty() {
        match obj.get_mut(first) {
            // Repeated key: promote to / extend an array.
            Some(Value::Array(a)) => a.push(value),
            Some(existing) => {
                let prev = existing.take();
                *existing = Value::Array(vec![prev, value]);
            }
            None => {
                obj.insert(first.clone(), value);
            }
        }
        return;
    }
    let slot = obj
        .entry(first.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        // A scalar was already here; the nested path wins.
        *slot = Value::Object(Map::new());
    }
    if let Value::Object(m) = slot {
        insert(m, rest, value);
    }
}

fn infer(s: &str) -> Value {
    match s {
        "" => Value::String(String::new()),
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => {
            if let Ok(i) = s.parse::<i64>() {
                Value::Number(i.into())
            } else if let Ok(f) = s.parse::<f64>() {
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or_else(|| Value::String(s.to_string()))
            } else {
                Value::String(s.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_nested() {
        let q = encode(&json!({"filter": {"age": {"gte": 21}}, "name": "a b"}));
        assert_eq!(q, "filter%5Bage%5D%5Bgte%5D=21&name=a+b");
    }

    #[test]
    fn round_trip() {
        let v = json!({
            "filter": {"age": {"gte": 21}, "active": true},
            "tags": ["x", "y"],
            "name": "jo se"
        });
        let back = decode(&encode(&v)).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn repeated_key_becomes_array() {
        let v = decode("a=1&a=2&a=3").unwrap();
        assert_eq!(v, json!({"a": [1, 2, 3]}));
    }

    #[test]
    fn scalar_inference() {
        let v = decode("i=42&f=2.5&b=true&s=hi&e=").unwrap();
        assert_eq!(v, json!({"i": 42, "f": 2.5, "b": true, "s": "hi", "e": ""}));
    }

    #[test]
    fn malformed_keys_fail() {
        assert!(decode("a[b=1").is_err());
        assert!(decode("a[]=1").is_err());
    }
}
