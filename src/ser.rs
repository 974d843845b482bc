//! Marshaling of message bodies.
//!
//! [`marshal_body`] writes a body in indexed form (descriptors already
//! replaced by [`crate::fds::to_indexed`]) into the DBus wire format.
//! Alignment is relative to the start of the body, which DBus always
//! places on an 8-byte boundary.

use crate::align::align;
use crate::error::{Error, Result};
use crate::primitives::WirePrimitive;
use crate::signature::{SignatureNode, SignatureTree, Token};
use crate::value::Value;

use byteorder::{ByteOrder, LE};
use log::trace;
use std::marker::PhantomData;

const MAX_ARRAY_LEN: usize = 1 << 26;

/// Marshal `body` as described by `tree`, little-endian.
pub fn marshal_body(tree: &SignatureTree, body: &[Value]) -> Result<Vec<u8>> {
    marshal_body_with::<LE>(tree, body)
}

pub fn marshal_body_with<B: ByteOrder>(tree: &SignatureTree, body: &[Value]) -> Result<Vec<u8>> {
    if body.len() != tree.types().len() {
        return Err(Error::mismatch(
            tree.signature(),
            format!("expected {} values, found {}", tree.types().len(), body.len()),
        ));
    }

    let mut writer = BodyWriter::<B>::new();
    for (value, node) in body.iter().zip(tree.types()) {
        writer.write_value(value, node)?;
    }
    trace!("marshaled {:?} into {} bytes", tree.signature(), writer.data.len());
    Ok(writer.data)
}

struct BodyWriter<B: ByteOrder> {
    data: Vec<u8>,
    phantom: PhantomData<B>,
}

impl<B: ByteOrder> BodyWriter<B> {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            phantom: PhantomData,
        }
    }

    fn pad(&mut self, alignment: usize) {
        self.data.resize(align(self.data.len(), alignment), 0);
    }

    fn write_primitive<T: WirePrimitive>(&mut self, val: T) {
        self.pad(T::SIZE);
        let start = self.data.len();
        self.data.resize(start + T::SIZE, 0);
        val.write::<B>(&mut self.data[start..]);
    }

    fn write_string(&mut self, val: &str) {
        self.write_primitive(val.len() as u32);
        self.data.extend_from_slice(val.as_bytes());
        self.data.push(0);
    }

    fn write_signature(&mut self, val: &str) {
        self.data.push(val.len() as u8);
        self.data.extend_from_slice(val.as_bytes());
        self.data.push(0);
    }

    fn write_value(&mut self, value: &Value, node: &SignatureNode) -> Result<()> {
        match (node.token(), value) {
            (Token::Byte, Value::Byte(val)) => self.write_primitive(*val),
            (Token::Boolean, Value::Bool(val)) => self.write_primitive(*val as u32),
            (Token::Int16, Value::Int16(val)) => self.write_primitive(*val),
            (Token::UInt16, Value::UInt16(val)) => self.write_primitive(*val),
            (Token::Int32, Value::Int32(val)) => self.write_primitive(*val),
            (Token::UInt32, Value::UInt32(val)) => self.write_primitive(*val),
            (Token::Int64, Value::Int64(val)) => self.write_primitive(*val),
            (Token::UInt64, Value::UInt64(val)) => self.write_primitive(*val),
            (Token::Double, Value::Double(val)) => self.write_primitive(*val),
            (Token::UnixFd, Value::UnixFdIndex(ix)) => self.write_primitive(*ix),
            (Token::String, Value::Str(val)) | (Token::ObjectPath, Value::ObjectPath(val)) => {
                self.write_string(val)
            }
            (Token::Signature, Value::Signature(val)) => {
                if val.len() > u8::MAX as usize {
                    return Err(Error::mismatch(node.signature(), "signature value too long"));
                }
                self.write_signature(val)
            }
            (Token::Array, value) => self.write_array(value, node)?,
            (Token::Struct, Value::Struct(fields)) | (Token::DictEntry, Value::Struct(fields)) => {
                self.write_struct(fields, node)?
            }
            (Token::Variant, Value::Variant(variant)) => {
                self.write_signature(variant.signature());
                self.write_value(variant.value(), variant.node())?;
            }
            (Token::UnixFd, Value::UnixFd(_)) => {
                return Err(Error::mismatch(
                    node.signature(),
                    "unix fd must be replaced by its index before marshaling",
                ))
            }
            (_, other) => {
                return Err(Error::mismatch(
                    node.signature(),
                    format!("cannot marshal {} as {}", other.kind(), node.token()),
                ))
            }
        }
        Ok(())
    }

    fn write_struct(&mut self, fields: &[Value], node: &SignatureNode) -> Result<()> {
        if fields.len() != node.children().len() {
            return Err(Error::mismatch(
                node.signature(),
                format!("expected {} fields, found {}", node.children().len(), fields.len()),
            ));
        }
        self.pad(8);
        for (field, child) in fields.iter().zip(node.children()) {
            self.write_value(field, child)?;
        }
        Ok(())
    }

    fn write_array(&mut self, value: &Value, node: &SignatureNode) -> Result<()> {
        let element = &node.children()[0];

        // The length is backfilled once the elements are written. It does not
        // count the padding between the length and the first element.
        self.pad(4);
        let length_ix = self.data.len();
        self.data.extend_from_slice(&[0u8; 4]);
        self.pad(element.token().alignment());
        let start = self.data.len();

        match (element.token(), value) {
            (Token::DictEntry, Value::Dict(pairs)) => {
                let key_node = &element.children()[0];
                let value_node = &element.children()[1];
                for (key, value) in pairs {
                    self.pad(8);
                    self.write_value(key, key_node)?;
                    self.write_value(value, value_node)?;
                }
            }
            (Token::DictEntry, other) => {
                return Err(Error::mismatch(
                    node.signature(),
                    format!("expected dict, found {}", other.kind()),
                ))
            }
            (_, Value::Array(items)) => {
                for item in items {
                    self.write_value(item, element)?;
                }
            }
            (_, other) => {
                return Err(Error::mismatch(
                    node.signature(),
                    format!("expected array, found {}", other.kind()),
                ))
            }
        }

        let length = self.data.len() - start;
        if length > MAX_ARRAY_LEN {
            return Err(Error::mismatch(
                node.signature(),
                format!("array of {} bytes exceeds the protocol limit", length),
            ));
        }
        B::write_u32(&mut self.data[length_ix..length_ix + 4], length as u32);
        Ok(())
    }
}
