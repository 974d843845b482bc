//! Unmarshaling of message bodies.
//!
//! The inverse of [`crate::ser`]: [`unmarshal_body`] reads a body in the
//! wire format and returns it in indexed form, with `h` fields as
//! [`Value::UnixFdIndex`]. The data comes from the peer, so every length and
//! offset is checked before use.

use crate::align::padding;
use crate::error::{Error, Result};
use crate::primitives::WirePrimitive;
use crate::signature::{SignatureNode, SignatureTree, Token};
use crate::value::{Value, Variant};

use byteorder::{ByteOrder, LE};
use log::{error, trace};
use std::marker::PhantomData;
use std::str::from_utf8;

// Containers plus variants, the DBus limit for a whole message.
const MAX_DEPTH: usize = 64;

/// Unmarshal a little-endian body described by `tree`.
pub fn unmarshal_body(tree: &SignatureTree, data: &[u8]) -> Result<Vec<Value>> {
    unmarshal_body_with::<LE>(tree, data)
}

pub fn unmarshal_body_with<B: ByteOrder>(tree: &SignatureTree, data: &[u8]) -> Result<Vec<Value>> {
    let mut buff = DataBuffer::<B>::new(data);
    let body = tree
        .types()
        .iter()
        .map(|node| buff.read_value(node, 0))
        .collect::<Result<Vec<_>>>()?;
    buff.complete()?;
    Ok(body)
}

struct DataBuffer<'de, B: ByteOrder> {
    data: &'de [u8],
    data_ix: usize,
    phantom: PhantomData<B>,
}

impl<'de, B: ByteOrder> DataBuffer<'de, B> {
    fn new(data: &'de [u8]) -> Self {
        Self {
            data,
            data_ix: 0,
            phantom: PhantomData,
        }
    }

    fn complete(self) -> Result<()> {
        let leftover_data = self.data.len() - self.data_ix;
        if leftover_data != 0 {
            return Err(Error::LeftoverData(leftover_data));
        }

        Ok(())
    }

    fn read(&mut self, len: usize) -> Result<&'de [u8]> {
        let old_ix = self.data_ix;
        let new_ix = old_ix
            .checked_add(len)
            .filter(|&new_ix| new_ix <= self.data.len())
            .ok_or_else(|| {
                error!("read of {} bytes at {} is out of bounds", len, old_ix);
                Error::Truncated {
                    offset: old_ix,
                    needed: len,
                }
            })?;
        self.data_ix = new_ix;
        Ok(&self.data[old_ix..new_ix])
    }

    fn align_reader(&mut self, alignment: usize) -> Result<()> {
        let pad = padding(self.data_ix, alignment);
        self.read(pad)?;
        Ok(())
    }

    fn read_primitive<T: WirePrimitive>(&mut self) -> Result<T> {
        self.align_reader(T::SIZE)?;
        Ok(T::read::<B>(self.read(T::SIZE)?))
    }

    fn read_terminated(&mut self, len: usize) -> Result<&'de str> {
        let offset = self.data_ix;
        let bytes = self.read(len + 1)?;
        let (string, terminator) = bytes.split_at(len);
        if terminator[0] != 0 {
            return Err(Error::MalformedString {
                offset,
                reason: "missing NUL terminator".to_owned(),
            });
        }
        if let Some(ix) = string.iter().position(|&byte| byte == 0) {
            return Err(Error::MalformedString {
                offset: offset + ix,
                reason: "embedded NUL".to_owned(),
            });
        }
        Ok(from_utf8(string)?)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_primitive::<u32>()? as usize;
        let string = self.read_terminated(len)?;
        trace!("string is {}", string);
        Ok(string.to_owned())
    }

    fn read_signature(&mut self) -> Result<&'de str> {
        let len = self.read_primitive::<u8>()? as usize;
        self.read_terminated(len)
    }

    fn read_value(&mut self, node: &SignatureNode, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(Error::mismatch(node.signature(), "value nested too deeply"));
        }

        let value = match node.token() {
            Token::Byte => Value::Byte(self.read_primitive()?),
            Token::Boolean => match self.read_primitive::<u32>()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(Error::InvalidBoolValue(other)),
            },
            Token::Int16 => Value::Int16(self.read_primitive()?),
            Token::UInt16 => Value::UInt16(self.read_primitive()?),
            Token::Int32 => Value::Int32(self.read_primitive()?),
            Token::UInt32 => Value::UInt32(self.read_primitive()?),
            Token::Int64 => Value::Int64(self.read_primitive()?),
            Token::UInt64 => Value::UInt64(self.read_primitive()?),
            Token::Double => Value::Double(self.read_primitive()?),
            Token::UnixFd => Value::UnixFdIndex(self.read_primitive()?),
            Token::String => Value::Str(self.read_string()?),
            Token::ObjectPath => Value::ObjectPath(self.read_string()?),
            Token::Signature => Value::Signature(self.read_signature()?.to_owned()),
            Token::Variant => {
                let signature = self.read_signature()?;
                let tree = SignatureTree::parse(signature)?;
                if !tree.is_single_complete_type() {
                    return Err(Error::malformed(signature, "variant needs exactly one complete type"));
                }
                let inner = self.read_value(&tree.types()[0], depth + 1)?;
                Value::Variant(Box::new(Variant::new(signature, inner)?))
            }
            Token::Struct | Token::DictEntry => {
                self.align_reader(8)?;
                let fields = node
                    .children()
                    .iter()
                    .map(|child| self.read_value(child, depth + 1))
                    .collect::<Result<Vec<_>>>()?;
                Value::Struct(fields)
            }
            Token::Array => self.read_array(node, depth)?,
        };
        Ok(value)
    }

    fn read_array(&mut self, node: &SignatureNode, depth: usize) -> Result<Value> {
        let element = &node.children()[0];
        let len = self.read_primitive::<u32>()? as usize;
        self.align_reader(element.token().alignment())?;
        let end_ix = self.data_ix + len;
        if end_ix > self.data.len() {
            return Err(Error::Truncated {
                offset: self.data_ix,
                needed: len,
            });
        }

        let value = if element.token() == Token::DictEntry {
            let key_node = &element.children()[0];
            let value_node = &element.children()[1];
            let mut pairs = Vec::new();
            while self.data_ix < end_ix {
                self.align_reader(8)?;
                let key = self.read_value(key_node, depth + 2)?;
                let value = self.read_value(value_node, depth + 2)?;
                pairs.push((key, value));
            }
            Value::Dict(pairs)
        } else {
            let mut items = Vec::new();
            while self.data_ix < end_ix {
                items.push(self.read_value(element, depth + 1)?);
            }
            Value::Array(items)
        };

        if self.data_ix != end_ix {
            return Err(Error::ArrayLengthMismatch {
                expected: end_ix,
                actual: self.data_ix,
            });
        }
        Ok(value)
    }
}
