//! VM values and their fixed-width dataholder encoding.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use t3_format::{DataStream, Result};

/// Size of an encoded dataholder: a type byte and a 4-byte payload.
pub const DATAHOLDER_SIZE: usize = 5;

/// Object identifier. Zero never names a live object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjId(pub u32);

impl ObjId {
    pub const INVALID: ObjId = ObjId(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropId(pub u16);

/// Dataholder type codes.
mod tag {
    pub const NIL: u8 = 1;
    pub const TRUE: u8 = 2;
    pub const OBJ: u8 = 5;
    pub const PROP: u8 = 6;
    pub const INT: u8 = 7;
    pub const SSTRING: u8 = 8;
    pub const LIST: u8 = 10;
    pub const CODEOFS: u8 = 11;
    pub const FUNCPTR: u8 = 12;
    pub const EMPTY: u8 = 13;
    pub const ENUM: u8 = 15;
}

/// A VM datum.
///
/// `Empty` is the unset sentinel; it marks vacant lookup table slots and is
/// never a real key. `SString` and `List` are constant-pool offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Value {
    #[default]
    Empty,
    Nil,
    True,
    Obj(ObjId),
    Prop(PropId),
    Int(i32),
    Enum(u32),
    SString(u32),
    List(u32),
    CodeOfs(u32),
    FuncPtr(u32),
}

impl Value {
    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_obj(&self) -> Option<ObjId> {
        match *self {
            Value::Obj(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match *self {
            Value::Int(n) => Some(n),
            _ => None,
        }
    }

    pub fn from_bool(b: bool) -> Value {
        if b {
            Value::True
        } else {
            Value::Nil
        }
    }

    /// Encode as a dataholder.
    pub fn to_bytes(&self) -> [u8; DATAHOLDER_SIZE] {
        let (t, payload) = match *self {
            Value::Empty => (tag::EMPTY, 0),
            Value::Nil => (tag::NIL, 0),
            Value::True => (tag::TRUE, 0),
            Value::Obj(id) => (tag::OBJ, id.0),
            Value::Prop(p) => (tag::PROP, u32::from(p.0)),
            Value::Int(n) => (tag::INT, n as u32),
            Value::Enum(e) => (tag::ENUM, e),
            Value::SString(ofs) => (tag::SSTRING, ofs),
            Value::List(ofs) => (tag::LIST, ofs),
            Value::CodeOfs(ofs) => (tag::CODEOFS, ofs),
            Value::FuncPtr(ofs) => (tag::FUNCPTR, ofs),
        };
        let mut out = [0u8; DATAHOLDER_SIZE];
        out[0] = t;
        LittleEndian::write_u32(&mut out[1..], payload);
        out
    }

    /// Decode a dataholder. Type codes this VM does not model decode as nil.
    pub fn from_bytes(buf: &[u8; DATAHOLDER_SIZE]) -> Value {
        let payload = LittleEndian::read_u32(&buf[1..]);
        match buf[0] {
            tag::EMPTY => Value::Empty,
            tag::NIL => Value::Nil,
            tag::TRUE => Value::True,
            tag::OBJ => Value::Obj(ObjId(payload)),
            tag::PROP => Value::Prop(PropId(payload as u16)),
            tag::INT => Value::Int(payload as i32),
            tag::ENUM => Value::Enum(payload),
            tag::SSTRING => Value::SString(payload),
            tag::LIST => Value::List(payload),
            tag::CODEOFS => Value::CodeOfs(payload),
            tag::FUNCPTR => Value::FuncPtr(payload),
            other => {
                log::trace!("dataholder type {other} decoded as nil");
                Value::Nil
            }
        }
    }

    pub fn write_to<S: DataStream + ?Sized>(&self, fp: &mut S) -> Result<()> {
        fp.write_bytes(&self.to_bytes())
    }

    pub fn read_from<S: DataStream + ?Sized>(fp: &mut S) -> Result<Value> {
        let mut buf = [0u8; DATAHOLDER_SIZE];
        fp.read_bytes(&mut buf)?;
        Ok(Value::from_bytes(&buf))
    }

    /// Hash of everything except string objects, whose hash depends on
    /// their text and is computed by the object table.
    pub(crate) fn scalar_hash(&self) -> u32 {
        fn fold(x: u32) -> u32 {
            (x & 0xffff) ^ (x >> 16)
        }
        match *self {
            Value::Nil => 0,
            Value::True => 1,
            Value::Empty => 2,
            Value::Prop(p) => u32::from(p.0),
            Value::Obj(id) => fold(id.0),
            Value::Int(n) => fold(n as u32),
            Value::Enum(x)
            | Value::SString(x)
            | Value::List(x)
            | Value::CodeOfs(x)
            | Value::FuncPtr(x) => fold(x),
        }
    }
}

/// Value comparisons that need to look inside objects.
pub trait ValueContext {
    fn hash_value(&self, val: &Value) -> u32;
    fn values_equal(&self, a: &Value, b: &Value) -> bool;
    /// True while a collection is in progress and `val` refers to an
    /// object that is about to be deleted.
    fn is_value_deletable(&self, val: &Value) -> bool;
}

/// Context with no string objects, comparing values by tag and payload.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub(crate) struct ScalarContext {
    pub doomed: Vec<ObjId>,
}

#[cfg(test)]
impl ValueContext for ScalarContext {
    fn hash_value(&self, val: &Value) -> u32 {
        val.scalar_hash()
    }

    fn values_equal(&self, a: &Value, b: &Value) -> bool {
        a == b
    }

    fn is_value_deletable(&self, val: &Value) -> bool {
        val.as_obj().is_some_and(|id| self.doomed.contains(&id))
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n)
    }
}

impl From<ObjId> for Value {
    fn from(id: ObjId) -> Self {
        Value::Obj(id)
    }
}
