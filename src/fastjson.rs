//! fastjson — компактная тегированная двоичная кодировка дерева JSON.
//!
//! Формат (BE):
//!   0x10 null; 0x11 false; 0x12 true;
//!   0x13 int:    [i64];
//!   0x14 real:   [биты f64];
//!   0x15 string: [len u32][байты UTF-8];
//!   0x16 array:  [count u32][элементы];
//!   0x17 object: [count u32][klen u32][ключ][значение]...
//!
//! Вложенность ограничена 32 уровнями в обе стороны; циклы исключены
//! самим устройством дерева serde_json::Value.

use byteorder::{BigEndian, ByteOrder};
use serde_json::{Map, Number, Value};

use crate::consts::FASTJSON_NEST_LIMIT;
use crate::error::{Error, Result};

const TAG_NULL: u8 = 0x10;
const TAG_FALSE: u8 = 0x11;
const TAG_TRUE: u8 = 0x12;
const TAG_INT: u8 = 0x13;
const TAG_REAL: u8 = 0x14;
const TAG_STRING: u8 = 0x15;
const TAG_ARRAY: u8 = 0x16;
const TAG_OBJECT: u8 = 0x17;

/// Закодировать значение, дописав байты в out.
pub fn fastjson_encode(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    encode_value(value, out, 0)
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, v);
    out.extend_from_slice(&b);
}

fn encode_value(value: &Value, out: &mut Vec<u8>, depth: usize) -> Result<()> {
    if depth > FASTJSON_NEST_LIMIT {
        return Err(Error::Limit("JSON nesting deeper than 32 levels"));
    }
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(false) => out.push(TAG_FALSE),
        Value::Bool(true) => out.push(TAG_TRUE),
        Value::Number(n) => encode_number(n, out),
        Value::String(s) => {
            if s.len() > u32::MAX as usize {
                return Err(Error::Limit("string longer than 32 bits"));
            }
            out.push(TAG_STRING);
            put_u32(out, s.len() as u32);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            out.push(TAG_ARRAY);
            put_u32(out, items.len() as u32);
            for item in items {
                encode_value(item, out, depth + 1)?;
            }
        }
        Value::Object(map) => {
            out.push(TAG_OBJECT);
            put_u32(out, map.len() as u32);
            for (k, v) in map {
                if k.len() > u32::MAX as usize {
                    return Err(Error::Limit("object key longer than 32 bits"));
                }
                put_u32(out, k.len() as u32);
                out.extend_from_slice(k.as_bytes());
                encode_value(v, out, depth + 1)?;
            }
        }
    }
    Ok(())
}

fn encode_number(n: &Number, out: &mut Vec<u8>) {
    if let Some(i) = n.as_i64() {
        out.push(TAG_INT);
        let mut b = [0u8; 8];
        BigEndian::write_i64(&mut b, i);
        out.extend_from_slice(&b);
    } else {
        // u64 за пределами i64 и дроби уходят в real
        let f = n.as_f64().unwrap_or(0.0);
        out.push(TAG_REAL);
        let mut b = [0u8; 8];
        BigEndian::write_u64(&mut b, f.to_bits());
        out.extend_from_slice(&b);
    }
}

/// Раскодировать значение из начала среза. Хвост за значением не
/// считается ошибкой (вызывающий передаёт точный диапазон).
pub fn fastjson_decode(raw: &[u8]) -> Result<Value> {
    let mut pos = 0usize;
    let v = decode_value(raw, &mut pos, 0)?;
    Ok(v)
}

fn take(raw: &[u8], pos: &mut usize, n: usize) -> Result<usize> {
    let start = *pos;
    let end = start.checked_add(n).ok_or(Error::Corrupt("fast-JSON length overflow"))?;
    if end > raw.len() {
        return Err(Error::Corrupt("truncated fast-JSON value"));
    }
    *pos = end;
    Ok(start)
}

fn get_u32(raw: &[u8], pos: &mut usize) -> Result<u32> {
    let s = take(raw, pos, 4)?;
    Ok(BigEndian::read_u32(&raw[s..s + 4]))
}

fn decode_value(raw: &[u8], pos: &mut usize, depth: usize) -> Result<Value> {
    if depth > FASTJSON_NEST_LIMIT {
        return Err(Error::Limit("JSON nesting deeper than 32 levels"));
    }
    let s = take(raw, pos, 1)?;
    match raw[s] {
        TAG_NULL => Ok(Value::Null),
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_INT => {
            let s = take(raw, pos, 8)?;
            Ok(Value::Number(Number::from(BigEndian::read_i64(&raw[s..s + 8]))))
        }
        TAG_REAL => {
            let s = take(raw, pos, 8)?;
            let f = f64::from_bits(BigEndian::read_u64(&raw[s..s + 8]));
            match Number::from_f64(f) {
                Some(n) => Ok(Value::Number(n)),
                None => Err(Error::Corrupt("non-finite real in fast-JSON")),
            }
        }
        TAG_STRING => {
            let len = get_u32(raw, pos)? as usize;
            let s = take(raw, pos, len)?;
            let text = std::str::from_utf8(&raw[s..s + len])
                .map_err(|_| Error::Corrupt("fast-JSON string is not UTF-8"))?;
            Ok(Value::String(text.to_owned()))
        }
        TAG_ARRAY => {
            let count = get_u32(raw, pos)? as usize;
            let mut items = Vec::new();
            for _ in 0..count {
                items.push(decode_value(raw, pos, depth + 1)?);
            }
            Ok(Value::Array(items))
        }
        TAG_OBJECT => {
            let count = get_u32(raw, pos)? as usize;
            let mut map = Map::new();
            for _ in 0..count {
                let klen = get_u32(raw, pos)? as usize;
                let s = take(raw, pos, klen)?;
                let key = std::str::from_utf8(&raw[s..s + klen])
                    .map_err(|_| Error::Corrupt("fast-JSON key is not UTF-8"))?
                    .to_owned();
                let v = decode_value(raw, pos, depth + 1)?;
                map.insert(key, v);
            }
            Ok(Value::Object(map))
        }
        _ => Err(Error::Corrupt("unknown fast-JSON tag")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(v: Value) {
        let mut buf = Vec::new();
        fastjson_encode(&v, &mut buf).unwrap();
        let back = fastjson_decode(&buf).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn scalars() {
        roundtrip(json!(null));
        roundtrip(json!(true));
        roundtrip(json!(false));
        roundtrip(json!(0));
        roundtrip(json!(-1));
        roundtrip(json!(i64::MAX));
        roundtrip(json!(i64::MIN));
        roundtrip(json!(3.5));
        roundtrip(json!(""));
        roundtrip(json!("проверка"));
    }

    #[test]
    fn nested_structures() {
        roundtrip(json!({
            "name": "Alice",
            "age": 30,
            "tags": ["a", "b", ["c", {"deep": null}]],
            "meta": {"ok": true, "score": 1.25}
        }));
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let mut v = json!(1);
        for _ in 0..40 {
            v = Value::Array(vec![v]);
        }
        let mut buf = Vec::new();
        assert!(matches!(
            fastjson_encode(&v, &mut buf),
            Err(Error::Limit(_))
        ));
    }

    #[test]
    fn nesting_at_limit_is_fine() {
        let mut v = json!(1);
        for _ in 0..31 {
            v = Value::Array(vec![v]);
        }
        roundtrip(v);
    }

    #[test]
    fn truncated_input_is_corrupt() {
        let mut buf = Vec::new();
        fastjson_encode(&json!({"k": "value"}), &mut buf).unwrap();
        for cut in 0..buf.len() {
            assert!(fastjson_decode(&buf[..cut]).is_err(), "cut at {cut} must fail");
        }
    }

    #[test]
    fn unknown_tag_is_corrupt() {
        assert!(matches!(
            fastjson_decode(&[0xFF]),
            Err(Error::Corrupt(_))
        ));
    }
}
