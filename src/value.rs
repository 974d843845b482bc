use crate::error::{Error, Result};
use crate::signature::{SignatureNode, SignatureTree};

use serde::ser::{self, SerializeMap, SerializeSeq, SerializeStruct, SerializeTuple};
use serde::Serialize;
use std::slice;
use std::sync::Arc;

#[cfg(unix)]
pub use std::os::fd::RawFd;

#[cfg(not(unix))]
pub type RawFd = i32;

/// A single value in a message body.
///
/// Application code works with bodies in "direct" form, where a field of
/// type `h` holds the descriptor itself as [`Value::UnixFd`]. On the wire
/// the same field holds an index into the message's descriptor array,
/// [`Value::UnixFdIndex`]. [`crate::fds`] converts between the two.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    /// A descriptor held directly. `None` marks a descriptor the peer
    /// referred to but never sent.
    UnixFd(Option<RawFd>),
    UnixFdIndex(u32),
    Array(Vec<Value>),
    /// The value of an `a{..}` field, pairs in wire order.
    Dict(Vec<(Value, Value)>),
    Struct(Vec<Value>),
    Variant(Box<Variant>),
}

impl Value {
    /// Short name of the value's shape, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Byte(_) => "byte",
            Value::Bool(_) => "bool",
            Value::Int16(_) => "int16",
            Value::UInt16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::ObjectPath(_) => "object path",
            Value::Signature(_) => "signature",
            Value::UnixFd(_) => "unix fd",
            Value::UnixFdIndex(_) => "unix fd index",
            Value::Array(_) => "array",
            Value::Dict(_) => "dict",
            Value::Struct(_) => "struct",
            Value::Variant(_) => "variant",
        }
    }

    /// Wrap `value` in a variant with the given signature.
    pub fn variant(signature: &str, value: Value) -> Result<Value> {
        Ok(Value::Variant(Box::new(Variant::new(signature, value)?)))
    }

    pub fn fd(fd: RawFd) -> Value {
        Value::UnixFd(Some(fd))
    }
}

macro_rules! value_from {
    ($type:ty, $variant:ident) => {
        impl From<$type> for Value {
            fn from(val: $type) -> Self {
                Value::$variant(val)
            }
        }
    };
}

value_from!(u8, Byte);
value_from!(bool, Bool);
value_from!(i16, Int16);
value_from!(u16, UInt16);
value_from!(i32, Int32);
value_from!(u32, UInt32);
value_from!(i64, Int64);
value_from!(u64, UInt64);
value_from!(f64, Double);
value_from!(String, Str);

impl From<&str> for Value {
    fn from(val: &str) -> Self {
        Value::Str(val.to_owned())
    }
}

impl From<Variant> for Value {
    fn from(val: Variant) -> Self {
        Value::Variant(Box::new(val))
    }
}

/// A self-describing value: a single complete type plus a value of that type.
#[derive(Clone, Debug, PartialEq)]
pub struct Variant {
    signature: Arc<SignatureTree>,
    value: Value,
}

impl Variant {
    pub fn new(signature: &str, value: Value) -> Result<Self> {
        let signature = SignatureTree::parse(signature)?;
        if !signature.is_single_complete_type() {
            return Err(Error::malformed(
                signature.signature(),
                "variant needs exactly one complete type",
            ));
        }
        signature.verify(slice::from_ref(&value))?;
        Ok(Self { signature, value })
    }

    pub fn signature(&self) -> &str {
        self.signature.signature()
    }

    pub fn tree(&self) -> &Arc<SignatureTree> {
        &self.signature
    }

    /// The one type node describing the contained value.
    pub fn node(&self) -> &SignatureNode {
        &self.signature.types()[0]
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: ser::Serializer,
    {
        match self {
            Value::Byte(val) => serializer.serialize_u8(*val),
            Value::Bool(val) => serializer.serialize_bool(*val),
            Value::Int16(val) => serializer.serialize_i16(*val),
            Value::UInt16(val) => serializer.serialize_u16(*val),
            Value::Int32(val) => serializer.serialize_i32(*val),
            Value::UInt32(val) => serializer.serialize_u32(*val),
            Value::Int64(val) => serializer.serialize_i64(*val),
            Value::UInt64(val) => serializer.serialize_u64(*val),
            Value::Double(val) => serializer.serialize_f64(*val),
            Value::Str(val) | Value::ObjectPath(val) | Value::Signature(val) => {
                serializer.serialize_str(val)
            }
            Value::UnixFd(Some(fd)) => serializer.serialize_i64(i64::from(*fd)),
            Value::UnixFd(None) => serializer.serialize_none(),
            Value::UnixFdIndex(ix) => serializer.serialize_u32(*ix),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Dict(pairs) => {
                let mut map = serializer.serialize_map(Some(pairs.len()))?;
                for (key, value) in pairs {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            Value::Struct(fields) => {
                let mut tuple = serializer.serialize_tuple(fields.len())?;
                for field in fields {
                    tuple.serialize_element(field)?;
                }
                tuple.end()
            }
            Value::Variant(variant) => variant.serialize(serializer),
        }
    }
}

impl Serialize for Variant {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: ser::Serializer,
    {
        let mut state = serializer.serialize_struct("Variant", 2)?;
        state.serialize_field("signature", self.signature())?;
        state.serialize_field("value", &self.value)?;
        state.end()
    }
}
