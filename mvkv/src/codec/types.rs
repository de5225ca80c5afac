//! The tagged value container and the pluggable data-type system.
//!
//! Keys and values stored in a map are [`Value`]s; each map carries a
//! [`DataType`] for its keys and one for its values, owning comparison,
//! memory accounting and the wire encoding. Heterogeneous rows (the
//! transaction layer's `(txId, logId, value)` triples, undo-log records)
//! use the `Array` arm with the universal [`AnyType`].

use std::cmp::Ordering;
use std::fmt;
use std::io::Read;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::codec::{
    read_bytes, read_str, read_varint, read_varint_signed, write_bytes, write_str, write_varint,
    write_varint_signed,
};
use crate::error::{CResult, Error};

const TAG_NULL: u8 = 0;
const TAG_LONG: u8 = 1;
const TAG_BYTES: u8 = 2;
const TAG_TEXT: u8 = 3;
const TAG_ARRAY: u8 = 4;

/// A stored key or value. The variant order defines the cross-type sort
/// order; within a variant the natural order of the payload applies.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Null,
    Long(i64),
    Bytes(Vec<u8>),
    Text(String),
    Array(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_long(&self) -> CResult<i64> {
        match self {
            Value::Long(v) => Ok(*v),
            other => Err(Error::Internal(format!("expected long, got {:?}", other))),
        }
    }

    pub fn as_text(&self) -> CResult<&str> {
        match self {
            Value::Text(s) => Ok(s),
            other => Err(Error::Internal(format!("expected text, got {:?}", other))),
        }
    }

    pub fn as_array(&self) -> CResult<&[Value]> {
        match self {
            Value::Array(a) => Ok(a),
            other => Err(Error::Internal(format!("expected array, got {:?}", other))),
        }
    }

    /// Rough heap footprint, used to weigh pages in the cache and to decide
    /// page splits.
    pub fn memory(&self) -> usize {
        match self {
            Value::Null => 8,
            Value::Long(_) => 16,
            Value::Bytes(b) => 24 + b.len(),
            Value::Text(s) => 24 + s.len(),
            Value::Array(a) => 24 + a.iter().map(Value::memory).sum::<usize>(),
        }
    }

    /// Appends the tagged wire form.
    pub fn write_tagged(&self, buf: &mut BytesMut) {
        match self {
            Value::Null => buf.put_u8(TAG_NULL),
            Value::Long(v) => {
                buf.put_u8(TAG_LONG);
                write_varint_signed(buf, *v);
            }
            Value::Bytes(b) => {
                buf.put_u8(TAG_BYTES);
                write_bytes(buf, b);
            }
            Value::Text(s) => {
                buf.put_u8(TAG_TEXT);
                write_str(buf, s);
            }
            Value::Array(a) => {
                buf.put_u8(TAG_ARRAY);
                write_varint(buf, a.len() as u64);
                for v in a {
                    v.write_tagged(buf);
                }
            }
        }
    }

    /// Reads the tagged wire form.
    pub fn read_tagged(r: &mut (impl Read + ?Sized)) -> CResult<Value> {
        let mut tag = [0u8; 1];
        r.read_exact(&mut tag)
            .map_err(|e| Error::FileCorrupt(format!("truncated value: {}", e)))?;
        match tag[0] {
            TAG_NULL => Ok(Value::Null),
            TAG_LONG => Ok(Value::Long(read_varint_signed(r)?)),
            TAG_BYTES => Ok(Value::Bytes(read_bytes(r)?)),
            TAG_TEXT => Ok(Value::Text(read_str(r)?)),
            TAG_ARRAY => {
                let len = read_varint(r)? as usize;
                let mut a = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    a.push(Value::read_tagged(r)?);
                }
                Ok(Value::Array(a))
            }
            t => Err(Error::FileCorrupt(format!("unknown value tag {}", t))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Long(v) => write!(f, "{}", v),
            Value::Bytes(b) => write!(f, "x{}", b.iter().map(|b| format!("{:02x}", b)).collect::<String>()),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Array(a) => {
                write!(f, "[")?;
                for (i, v) in a.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// The capability set a map needs from its key and value types.
pub trait DataType: Send + Sync + fmt::Debug {
    /// Registry name, persisted in the map configuration.
    fn name(&self) -> String;

    fn compare(&self, a: &Value, b: &Value) -> Ordering;

    fn memory(&self, v: &Value) -> usize;

    fn write(&self, buf: &mut BytesMut, v: &Value) -> CResult<()>;

    fn read(&self, r: &mut impl Read) -> CResult<Value>
    where
        Self: Sized;

    /// Object-safe read used by page deserialization.
    fn read_dyn(&self, r: &mut dyn Read) -> CResult<Value>;
}

/// The universal type: any `Value`, tagged on the wire.
#[derive(Debug, Clone, Copy)]
pub struct AnyType;

impl DataType for AnyType {
    fn name(&self) -> String {
        "any".to_string()
    }

    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        a.cmp(b)
    }

    fn memory(&self, v: &Value) -> usize {
        v.memory()
    }

    fn write(&self, buf: &mut BytesMut, v: &Value) -> CResult<()> {
        v.write_tagged(buf);
        Ok(())
    }

    fn read(&self, r: &mut impl Read) -> CResult<Value> {
        Value::read_tagged(r)
    }

    fn read_dyn(&self, r: &mut dyn Read) -> CResult<Value> {
        Value::read_tagged(&mut *r)
    }
}

/// UTF-8 strings, stored length-prefixed without a tag.
#[derive(Debug, Clone, Copy)]
pub struct StringType;

impl DataType for StringType {
    fn name(&self) -> String {
        "string".to_string()
    }

    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        match (a, b) {
            (Value::Text(x), Value::Text(y)) => x.cmp(y),
            _ => a.cmp(b),
        }
    }

    fn memory(&self, v: &Value) -> usize {
        v.memory()
    }

    fn write(&self, buf: &mut BytesMut, v: &Value) -> CResult<()> {
        write_str(buf, v.as_text()?);
        Ok(())
    }

    fn read(&self, r: &mut impl Read) -> CResult<Value> {
        Ok(Value::Text(read_str(r)?))
    }

    fn read_dyn(&self, r: &mut dyn Read) -> CResult<Value> {
        Ok(Value::Text(read_str(&mut *r)?))
    }
}

/// Raw byte strings, stored length-prefixed.
#[derive(Debug, Clone, Copy)]
pub struct BytesType;

impl DataType for BytesType {
    fn name(&self) -> String {
        "bytes".to_string()
    }

    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        match (a, b) {
            (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
            _ => a.cmp(b),
        }
    }

    fn memory(&self, v: &Value) -> usize {
        v.memory()
    }

    fn write(&self, buf: &mut BytesMut, v: &Value) -> CResult<()> {
        match v {
            Value::Bytes(b) => {
                write_bytes(buf, b);
                Ok(())
            }
            other => Err(Error::Internal(format!("expected bytes, got {:?}", other))),
        }
    }

    fn read(&self, r: &mut impl Read) -> CResult<Value> {
        Ok(Value::Bytes(read_bytes(r)?))
    }

    fn read_dyn(&self, r: &mut dyn Read) -> CResult<Value> {
        Ok(Value::Bytes(read_bytes(&mut *r)?))
    }
}

/// Signed 64-bit integers, zigzag varint on the wire.
#[derive(Debug, Clone, Copy)]
pub struct LongType;

impl DataType for LongType {
    fn name(&self) -> String {
        "long".to_string()
    }

    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        match (a, b) {
            (Value::Long(x), Value::Long(y)) => x.cmp(y),
            _ => a.cmp(b),
        }
    }

    fn memory(&self, v: &Value) -> usize {
        v.memory()
    }

    fn write(&self, buf: &mut BytesMut, v: &Value) -> CResult<()> {
        write_varint_signed(buf, v.as_long()?);
        Ok(())
    }

    fn read(&self, r: &mut impl Read) -> CResult<Value> {
        Ok(Value::Long(read_varint_signed(r)?))
    }

    fn read_dyn(&self, r: &mut dyn Read) -> CResult<Value> {
        Ok(Value::Long(read_varint_signed(&mut *r)?))
    }
}

/// Arrays whose elements share one element type.
#[derive(Debug, Clone)]
pub struct ArrayType {
    elem: Arc<dyn DataType>,
}

impl ArrayType {
    pub fn new(elem: Arc<dyn DataType>) -> Self {
        Self { elem }
    }
}

impl DataType for ArrayType {
    fn name(&self) -> String {
        format!("array:{}", self.elem.name())
    }

    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        match (a, b) {
            (Value::Array(x), Value::Array(y)) => {
                for (xa, ya) in x.iter().zip(y.iter()) {
                    let c = self.elem.compare(xa, ya);
                    if c != Ordering::Equal {
                        return c;
                    }
                }
                x.len().cmp(&y.len())
            }
            _ => a.cmp(b),
        }
    }

    fn memory(&self, v: &Value) -> usize {
        v.memory()
    }

    fn write(&self, buf: &mut BytesMut, v: &Value) -> CResult<()> {
        let a = v.as_array()?;
        write_varint(buf, a.len() as u64);
        for e in a {
            // Null elements keep the tagged form so absent columns survive.
            if e.is_null() {
                Value::Null.write_tagged(buf);
            } else {
                buf.put_u8(0xff);
                self.elem.write(buf, e)?;
            }
        }
        Ok(())
    }

    fn read(&self, r: &mut impl Read) -> CResult<Value> {
        self.read_dyn(r)
    }

    fn read_dyn(&self, r: &mut dyn Read) -> CResult<Value> {
        let len = read_varint(&mut *r)? as usize;
        let mut a = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            let mut tag = [0u8; 1];
            r.read_exact(&mut tag)
                .map_err(|e| Error::FileCorrupt(format!("truncated array: {}", e)))?;
            if tag[0] == TAG_NULL {
                a.push(Value::Null);
            } else if tag[0] == 0xff {
                a.push(self.elem.read_dyn(&mut *r)?);
            } else {
                return Err(Error::FileCorrupt(format!("bad array element tag {}", tag[0])));
            }
        }
        Ok(Value::Array(a))
    }
}

/// Resolves a persisted type name back to a type instance.
pub fn data_type_by_name(name: &str) -> CResult<Arc<dyn DataType>> {
    match name {
        "any" => Ok(Arc::new(AnyType)),
        "string" => Ok(Arc::new(StringType)),
        "bytes" => Ok(Arc::new(BytesType)),
        "long" => Ok(Arc::new(LongType)),
        _ => {
            if let Some(elem) = name.strip_prefix("array:") {
                Ok(Arc::new(ArrayType::new(data_type_by_name(elem)?)))
            } else {
                Err(Error::UnsupportedFormat(format!("unknown data type {:?}", name)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn round_trip(t: &impl DataType, v: &Value) -> Value {
        let mut buf = BytesMut::new();
        t.write(&mut buf, v).unwrap();
        let mut cur = Cursor::new(&buf[..]);
        t.read(&mut cur).unwrap()
    }

    #[test]
    fn tagged_round_trip() {
        let values = vec![
            Value::Null,
            Value::Long(-42),
            Value::Long(i64::MAX),
            Value::Bytes(vec![0, 1, 2, 0xff]),
            Value::Text("hello".to_string()),
            Value::Array(vec![Value::Long(1), Value::Null, Value::Text("x".to_string())]),
        ];
        for v in values {
            assert_eq!(round_trip(&AnyType, &v), v);
        }
    }

    #[test]
    fn typed_round_trip() {
        assert_eq!(round_trip(&StringType, &Value::Text("abc".to_string())), Value::Text("abc".to_string()));
        assert_eq!(round_trip(&LongType, &Value::Long(-7)), Value::Long(-7));
        assert_eq!(round_trip(&BytesType, &Value::Bytes(vec![9, 8])), Value::Bytes(vec![9, 8]));
        let arr = ArrayType::new(Arc::new(LongType));
        let v = Value::Array(vec![Value::Long(1), Value::Null, Value::Long(3)]);
        assert_eq!(round_trip(&arr, &v), v);
    }

    #[test]
    fn type_mismatch() {
        let mut buf = BytesMut::new();
        assert!(StringType.write(&mut buf, &Value::Long(1)).is_err());
    }

    #[test]
    fn ordering() {
        // variant order, then payload order
        assert!(Value::Null < Value::Long(i64::MIN));
        assert!(Value::Long(1) < Value::Long(2));
        assert!(Value::Long(i64::MAX) < Value::Bytes(vec![]));
        assert!(Value::Text("a".to_string()) < Value::Text("b".to_string()));
        let t = StringType;
        assert_eq!(t.compare(&Value::Text("a".into()), &Value::Text("a".into())), Ordering::Equal);
    }

    #[test]
    fn registry() {
        for name in ["any", "string", "bytes", "long", "array:long", "array:array:string"] {
            assert_eq!(data_type_by_name(name).unwrap().name(), name);
        }
        assert!(data_type_by_name("float").is_err());
    }
}
