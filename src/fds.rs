//! Unix fd passing support.
//!
//! DBus does not put descriptors in the message body. A field of type `h`
//! carries a `u32` index into an array of descriptors sent alongside the
//! message. Application code would rather see the descriptor itself, so
//! outgoing bodies go through [`to_indexed`] before marshaling and incoming
//! bodies through [`from_indexed`] after unmarshaling.
//!
//! Both directions share one walk over the body, guided by the signature,
//! and differ only in what they do at an `h` leaf.

use crate::error::{Error, Result};
use crate::signature::{SignatureNode, SignatureTree, Token};
use crate::value::{RawFd, Value};

use log::{debug, trace};
use std::slice;
use std::sync::Arc;

/// Check whether any field of `body` has type `token`, including fields
/// inside variants, whose types only the values themselves know.
pub fn signature_contains_type(tree: &SignatureTree, body: &[Value], token: Token) -> bool {
    let mut queue: Vec<&SignatureNode> = tree.types().iter().collect();
    let mut contains_variants = false;

    while let Some(node) = queue.pop() {
        if node.token() == token {
            return true;
        } else if node.token() == Token::Variant {
            contains_variants = true;
        }
        queue.extend(node.children());
    }

    if !contains_variants {
        return false;
    }

    let mut members: Vec<&Value> = body.iter().collect();
    while let Some(member) = members.pop() {
        match member {
            Value::Variant(variant) => {
                if signature_contains_type(variant.tree(), slice::from_ref(variant.value()), token) {
                    return true;
                }
            }
            Value::Array(items) | Value::Struct(items) => members.extend(items),
            Value::Dict(pairs) => members.extend(pairs.iter().map(|(_, value)| value)),
            _ => (),
        }
    }

    false
}

/// Replace every descriptor in `body` with its index into the returned
/// descriptor array. A descriptor that appears more than once is sent once.
pub fn to_indexed(tree: &SignatureTree, mut body: Vec<Value>) -> Result<(Vec<Value>, Vec<RawFd>)> {
    if !signature_contains_type(tree, &body, Token::UnixFd) {
        return Ok((body, Vec::new()));
    }

    let mut unix_fds: Vec<RawFd> = Vec::new();
    replace_fds(tree, &mut body, &mut |value: &mut Value| match *value {
        Value::UnixFd(Some(fd)) => {
            let ix = match unix_fds.iter().position(|&known| known == fd) {
                Some(ix) => ix,
                None => {
                    unix_fds.push(fd);
                    unix_fds.len() - 1
                }
            };
            *value = Value::UnixFdIndex(ix as u32);
            Ok(())
        }
        Value::UnixFd(None) => Err(Error::mismatch("h", "an absent unix fd cannot be sent")),
        ref other => Err(Error::mismatch(
            "h",
            format!("expected unix fd, found {}", other.kind()),
        )),
    })?;

    trace!("{} unix fds in body {:?}", unix_fds.len(), tree.signature());
    Ok((body, unix_fds))
}

/// Replace every fd index in `body` with the descriptor it refers to.
///
/// An index past the end of `unix_fds` becomes `Value::UnixFd(None)`: the
/// peer controls both the index and the array, so a bad index is not ours
/// to fail on.
pub fn from_indexed(tree: &SignatureTree, mut body: Vec<Value>, unix_fds: &[RawFd]) -> Result<Vec<Value>> {
    if !signature_contains_type(tree, &body, Token::UnixFd) {
        return Ok(body);
    }

    replace_fds(tree, &mut body, &mut |value: &mut Value| match *value {
        Value::UnixFdIndex(ix) => {
            let fd = unix_fds.get(ix as usize).copied();
            if fd.is_none() {
                debug!("unix fd index {} out of range ({} fds)", ix, unix_fds.len());
            }
            *value = Value::UnixFd(fd);
            Ok(())
        }
        ref other => Err(Error::mismatch(
            "h",
            format!("expected unix fd index, found {}", other.kind()),
        )),
    })?;

    Ok(body)
}

fn replace_fds<F>(tree: &SignatureTree, body: &mut [Value], replace: &mut F) -> Result<()>
where
    F: FnMut(&mut Value) -> Result<()>,
{
    replace_fds_in(tree.signature(), body, tree.types(), replace)
}

fn replace_fds_in<F>(signature: &str, values: &mut [Value], nodes: &[SignatureNode], replace: &mut F) -> Result<()>
where
    F: FnMut(&mut Value) -> Result<()>,
{
    if values.len() != nodes.len() {
        return Err(Error::mismatch(
            signature,
            format!("expected {} values, found {}", nodes.len(), values.len()),
        ));
    }

    for (value, node) in values.iter_mut().zip(nodes) {
        replace_fds_value(value, node, replace)?;
    }
    Ok(())
}

fn replace_fds_value<F>(value: &mut Value, node: &SignatureNode, replace: &mut F) -> Result<()>
where
    F: FnMut(&mut Value) -> Result<()>,
{
    if !node.may_contain(Token::UnixFd) {
        return Ok(());
    }

    match node.token() {
        Token::UnixFd => replace(value),
        Token::Array => {
            let element = &node.children()[0];
            match (element.token(), value) {
                (Token::DictEntry, Value::Dict(pairs)) => {
                    let key_node = &element.children()[0];
                    let value_node = &element.children()[1];
                    for (key, value) in pairs.iter_mut() {
                        // Keys are basic, so a key is either an fd or untouched.
                        if key_node.token() == Token::UnixFd {
                            replace(key)?;
                        }
                        replace_fds_value(value, value_node, replace)?;
                    }
                    Ok(())
                }
                (Token::DictEntry, other) => Err(Error::mismatch(
                    node.signature(),
                    format!("expected dict, found {}", other.kind()),
                )),
                (Token::UnixFd, Value::Array(items)) => items.iter_mut().try_for_each(|item| replace(item)),
                (_, Value::Array(items)) => items
                    .iter_mut()
                    .try_for_each(|item| replace_fds_value(item, element, replace)),
                (_, other) => Err(Error::mismatch(
                    node.signature(),
                    format!("expected array, found {}", other.kind()),
                )),
            }
        }
        Token::Struct | Token::DictEntry => match value {
            Value::Struct(fields) => replace_fds_in(node.signature(), fields, node.children(), replace),
            other => Err(Error::mismatch(
                node.signature(),
                format!("expected struct, found {}", other.kind()),
            )),
        },
        Token::Variant => match value {
            Value::Variant(variant) => {
                // The tree is shared with the variant; hold our own handle to
                // it so the value can be borrowed mutably.
                let tree = Arc::clone(variant.tree());
                let inner = &tree.types()[0];
                if inner.token() == Token::UnixFd {
                    replace(variant.value_mut())
                } else {
                    replace_fds_value(variant.value_mut(), inner, replace)
                }
            }
            other => Err(Error::mismatch(
                node.signature(),
                format!("expected variant, found {}", other.kind()),
            )),
        },
        _ => Ok(()),
    }
}
