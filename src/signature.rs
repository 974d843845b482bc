//! Parsing of DBus type signatures into trees.
//!
//! A signature such as `a{sv}(ih)` describes the shape of every value in a
//! message body. [`SignatureTree::parse`] turns it into an ordered list of
//! [`SignatureNode`]s, one per complete type, each carrying its children.
//! Trees are immutable and cached process-wide, since the same handful of
//! signatures shows up on almost every message.

use crate::error::{Error, Result};
use crate::value::Value;

use log::trace;
use std::collections::HashMap;
use std::fmt;
use std::slice;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

const MAX_SIGNATURE_LEN: usize = 255;
const MAX_ARRAY_DEPTH: usize = 32;
const MAX_STRUCT_DEPTH: usize = 32;

/// A single DBus type code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Token {
    Byte,
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
    Variant,
    Array,
    Struct,
    DictEntry,
}

impl Token {
    pub fn from_byte(code: u8) -> Option<Token> {
        let token = match code {
            b'y' => Token::Byte,
            b'b' => Token::Boolean,
            b'n' => Token::Int16,
            b'q' => Token::UInt16,
            b'i' => Token::Int32,
            b'u' => Token::UInt32,
            b'x' => Token::Int64,
            b't' => Token::UInt64,
            b'd' => Token::Double,
            b's' => Token::String,
            b'o' => Token::ObjectPath,
            b'g' => Token::Signature,
            b'h' => Token::UnixFd,
            b'v' => Token::Variant,
            b'a' => Token::Array,
            b'(' => Token::Struct,
            b'{' => Token::DictEntry,
            _ => return None,
        };
        Some(token)
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Token::Byte => b'y',
            Token::Boolean => b'b',
            Token::Int16 => b'n',
            Token::UInt16 => b'q',
            Token::Int32 => b'i',
            Token::UInt32 => b'u',
            Token::Int64 => b'x',
            Token::UInt64 => b't',
            Token::Double => b'd',
            Token::String => b's',
            Token::ObjectPath => b'o',
            Token::Signature => b'g',
            Token::UnixFd => b'h',
            Token::Variant => b'v',
            Token::Array => b'a',
            Token::Struct => b'(',
            Token::DictEntry => b'{',
        }
    }

    /// Wire alignment of a value of this type, relative to the body start.
    pub fn alignment(self) -> usize {
        match self {
            Token::Byte | Token::Signature | Token::Variant => 1,
            Token::Int16 | Token::UInt16 => 2,
            Token::Boolean
            | Token::Int32
            | Token::UInt32
            | Token::String
            | Token::ObjectPath
            | Token::UnixFd
            | Token::Array => 4,
            Token::Int64 | Token::UInt64 | Token::Double | Token::Struct | Token::DictEntry => 8,
        }
    }

    /// Basic types are the ones allowed as dict-entry keys.
    pub fn is_basic(self) -> bool {
        !matches!(
            self,
            Token::Variant | Token::Array | Token::Struct | Token::DictEntry
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_byte() as char)
    }
}

/// One complete type within a signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureNode {
    token: Token,
    signature: String,
    children: Vec<SignatureNode>,
}

impl SignatureNode {
    pub fn token(&self) -> Token {
        self.token
    }

    /// The slice of the signature this node covers, e.g. `a{sv}`.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Element type for arrays, key and value for dict entries,
    /// fields for structs. Empty for everything else.
    pub fn children(&self) -> &[SignatureNode] {
        &self.children
    }

    // True if `token` or a variant (whose content might hold `token`)
    // occurs anywhere in this node.
    pub(crate) fn may_contain(&self, token: Token) -> bool {
        self.signature
            .bytes()
            .any(|code| code == token.as_byte() || code == b'v')
    }
}

/// A parsed signature: the full shape of one message body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureTree {
    signature: String,
    types: Vec<SignatureNode>,
}

fn cache() -> &'static RwLock<HashMap<String, Arc<SignatureTree>>> {
    static CACHE: OnceLock<RwLock<HashMap<String, Arc<SignatureTree>>>> = OnceLock::new();
    CACHE.get_or_init(Default::default)
}

impl SignatureTree {
    /// Parse `signature`, reusing an earlier parse of the same string.
    pub fn parse(signature: &str) -> Result<Arc<SignatureTree>> {
        if let Some(tree) = cache()
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(signature)
        {
            return Ok(Arc::clone(tree));
        }

        let tree = Arc::new(Parser::new(signature).parse()?);
        trace!("caching signature tree for {:?}", signature);
        let mut cache = cache().write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(
            cache.entry(signature.to_owned()).or_insert(tree),
        ))
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Top-level complete types, in body order.
    pub fn types(&self) -> &[SignatureNode] {
        &self.types
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn is_single_complete_type(&self) -> bool {
        self.types.len() == 1
    }

    /// Check that `body` has the shape this signature describes, down into
    /// variants. Fd fields accept both direct and indexed form.
    pub fn verify(&self, body: &[Value]) -> Result<()> {
        verify_values(&self.signature, &self.types, body)
    }
}

fn verify_values(signature: &str, nodes: &[SignatureNode], values: &[Value]) -> Result<()> {
    if values.len() != nodes.len() {
        return Err(Error::mismatch(
            signature,
            format!("expected {} values, found {}", nodes.len(), values.len()),
        ));
    }
    nodes
        .iter()
        .zip(values)
        .try_for_each(|(node, value)| verify_value(node, value))
}

fn verify_value(node: &SignatureNode, value: &Value) -> Result<()> {
    let matches = match (node.token(), value) {
        (Token::Byte, Value::Byte(_))
        | (Token::Boolean, Value::Bool(_))
        | (Token::Int16, Value::Int16(_))
        | (Token::UInt16, Value::UInt16(_))
        | (Token::Int32, Value::Int32(_))
        | (Token::UInt32, Value::UInt32(_))
        | (Token::Int64, Value::Int64(_))
        | (Token::UInt64, Value::UInt64(_))
        | (Token::Double, Value::Double(_))
        | (Token::String, Value::Str(_))
        | (Token::ObjectPath, Value::ObjectPath(_))
        | (Token::UnixFd, Value::UnixFd(_) | Value::UnixFdIndex(_)) => true,
        (Token::Signature, Value::Signature(signature)) => {
            return SignatureTree::parse(signature).map(drop);
        }
        (Token::Array, _) => return verify_array(node, value),
        (Token::Struct | Token::DictEntry, Value::Struct(fields)) => {
            return verify_values(node.signature(), node.children(), fields);
        }
        (Token::Variant, Value::Variant(variant)) => {
            return variant.tree().verify(slice::from_ref(variant.value()));
        }
        _ => false,
    };

    if matches {
        Ok(())
    } else {
        Err(Error::mismatch(
            node.signature(),
            format!("found {}", value.kind()),
        ))
    }
}

fn verify_array(node: &SignatureNode, value: &Value) -> Result<()> {
    let element = &node.children()[0];
    match (element.token(), value) {
        (Token::DictEntry, Value::Dict(pairs)) => {
            let key_node = &element.children()[0];
            let value_node = &element.children()[1];
            pairs.iter().try_for_each(|(key, value)| {
                verify_value(key_node, key)?;
                verify_value(value_node, value)
            })
        }
        (Token::DictEntry, other) => Err(Error::mismatch(
            node.signature(),
            format!("expected dict, found {}", other.kind()),
        )),
        (_, Value::Array(items)) => items.iter().try_for_each(|item| verify_value(element, item)),
        (_, other) => Err(Error::mismatch(
            node.signature(),
            format!("expected array, found {}", other.kind()),
        )),
    }
}

impl fmt::Display for SignatureTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature)
    }
}

/// Convenience alias for [`SignatureTree::parse`].
pub fn parse_signature(signature: &str) -> Result<Arc<SignatureTree>> {
    SignatureTree::parse(signature)
}

// A container that has been opened but not yet closed.
struct OpenFrame {
    token: Token,
    start: usize,
    children: Vec<SignatureNode>,
}

struct Parser<'a> {
    source: &'a str,
    stack: Vec<OpenFrame>,
    types: Vec<SignatureNode>,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            stack: Vec::new(),
            types: Vec::new(),
        }
    }

    fn error(&self, reason: impl Into<String>) -> Error {
        Error::malformed(self.source, reason)
    }

    fn parse(mut self) -> Result<SignatureTree> {
        if self.source.len() > MAX_SIGNATURE_LEN {
            return Err(self.error(format!(
                "longer than {} bytes",
                MAX_SIGNATURE_LEN
            )));
        }

        let source = self.source;
        for (ix, code) in source.bytes().enumerate() {
            match code {
                b')' => self.close(ix, Token::Struct)?,
                b'}' => self.close(ix, Token::DictEntry)?,
                _ => {
                    let token = Token::from_byte(code).ok_or_else(|| {
                        self.error(format!("unrecognized type code {:?}", code as char))
                    })?;
                    self.open_or_leaf(ix, token)?;
                }
            }
        }

        if let Some(frame) = self.stack.last() {
            return Err(self.error(format!(
                "container opened at {} is never closed",
                frame.start
            )));
        }

        Ok(SignatureTree {
            signature: self.source.to_owned(),
            types: self.types,
        })
    }

    fn depth_of(&self, pred: impl Fn(Token) -> bool) -> usize {
        self.stack.iter().filter(|frame| pred(frame.token)).count()
    }

    fn open_or_leaf(&mut self, ix: usize, token: Token) -> Result<()> {
        match token {
            Token::Array => {
                if self.depth_of(|t| t == Token::Array) >= MAX_ARRAY_DEPTH {
                    return Err(self.error("arrays nested too deeply"));
                }
            }
            Token::Struct => {
                if self.depth_of(|t| t != Token::Array) >= MAX_STRUCT_DEPTH {
                    return Err(self.error("structs nested too deeply"));
                }
            }
            Token::DictEntry => {
                match self.stack.last() {
                    Some(frame) if frame.token == Token::Array => (),
                    _ => return Err(self.error(format!("dict entry at {} outside an array", ix))),
                }
                if self.depth_of(|t| t != Token::Array) >= MAX_STRUCT_DEPTH {
                    return Err(self.error("dict entries nested too deeply"));
                }
            }
            _ => {
                return self.attach(SignatureNode {
                    token,
                    signature: (token.as_byte() as char).to_string(),
                    children: Vec::new(),
                });
            }
        }

        self.stack.push(OpenFrame {
            token,
            start: ix,
            children: Vec::new(),
        });
        Ok(())
    }

    fn close(&mut self, ix: usize, token: Token) -> Result<()> {
        let frame = match self.stack.pop() {
            Some(frame) if frame.token == token => frame,
            _ => {
                return Err(self.error(format!(
                    "closing {:?} at {} has no matching opener",
                    self.source.as_bytes()[ix] as char,
                    ix
                )))
            }
        };

        match token {
            Token::Struct if frame.children.is_empty() => {
                return Err(self.error(format!("empty struct at {}", frame.start)));
            }
            Token::DictEntry if frame.children.len() != 2 => {
                return Err(self.error(format!(
                    "dict entry at {} has {} types, expected key and value",
                    frame.start,
                    frame.children.len()
                )));
            }
            _ => (),
        }

        self.attach(SignatureNode {
            token,
            signature: self.source[frame.start..=ix].to_owned(),
            children: frame.children,
        })
    }

    // Hand a completed node to the innermost open container. Arrays take
    // exactly one element, so they complete as soon as they receive it.
    fn attach(&mut self, mut node: SignatureNode) -> Result<()> {
        while let Some(frame) = self.stack.last_mut() {
            match frame.token {
                Token::Array => {
                    self.stack.pop();
                    node = SignatureNode {
                        token: Token::Array,
                        signature: format!("a{}", node.signature),
                        children: vec![node],
                    };
                }
                Token::DictEntry => {
                    if frame.children.is_empty() && !node.token.is_basic() {
                        let reason = format!("dict entry key {:?} is not a basic type", node.signature);
                        return Err(self.error(reason));
                    }
                    if frame.children.len() == 2 {
                        let reason = format!("dict entry at {} has more than two types", frame.start);
                        return Err(self.error(reason));
                    }
                    frame.children.push(node);
                    return Ok(());
                }
                _ => {
                    frame.children.push(node);
                    return Ok(());
                }
            }
        }

        self.types.push(node);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn tokens(nodes: &[SignatureNode]) -> Vec<Token> {
        nodes.iter().map(SignatureNode::token).collect()
    }

    #[test]
    fn parse_basic_types() -> Result<()> {
        let tree = SignatureTree::parse("ybnqiuxtdsogh")?;
        assert_eq!(tree.types().len(), 13);
        assert!(tree.types().iter().all(|node| node.children().is_empty()));
        assert_eq!(tree.types()[12].token(), Token::UnixFd);
        Ok(())
    }

    #[test]
    fn parse_empty_signature() -> Result<()> {
        let tree = SignatureTree::parse("")?;
        assert!(tree.is_empty());
        Ok(())
    }

    #[test]
    fn parse_nested_containers() -> Result<()> {
        let tree = SignatureTree::parse("a{sv}(s(ai)v)aah")?;
        let types = tree.types();
        assert_eq!(
            tokens(types),
            vec![Token::Array, Token::Struct, Token::Array]
        );

        let dict = &types[0];
        assert_eq!(dict.signature(), "a{sv}");
        assert_eq!(dict.children().len(), 1);
        let entry = &dict.children()[0];
        assert_eq!(entry.token(), Token::DictEntry);
        assert_eq!(entry.signature(), "{sv}");
        assert_eq!(tokens(entry.children()), vec![Token::String, Token::Variant]);

        let strukt = &types[1];
        assert_eq!(strukt.signature(), "(s(ai)v)");
        assert_eq!(
            tokens(strukt.children()),
            vec![Token::String, Token::Struct, Token::Variant]
        );
        assert_eq!(strukt.children()[1].children()[0].signature(), "ai");

        let nested = &types[2];
        assert_eq!(nested.signature(), "aah");
        assert_eq!(nested.children()[0].signature(), "ah");
        assert_eq!(nested.children()[0].children()[0].token(), Token::UnixFd);
        Ok(())
    }

    #[test]
    fn parse_is_cached() -> Result<()> {
        let first = SignatureTree::parse("a(ush)")?;
        let second = parse_signature("a(ush)")?;
        assert!(Arc::ptr_eq(&first, &second));
        Ok(())
    }

    #[test]
    fn single_complete_type() -> Result<()> {
        assert!(SignatureTree::parse("a{sa(ii)}")?.is_single_complete_type());
        assert!(!SignatureTree::parse("ii")?.is_single_complete_type());
        assert!(!SignatureTree::parse("")?.is_single_complete_type());
        Ok(())
    }

    #[test]
    fn malformed_signatures() {
        let bad = [
            "a",         // array without element
            "(",         // unclosed struct
            "(ii",       // unclosed struct
            "ii)",       // closer without opener
            "a{sv",      // unclosed dict entry
            "}",         // closer without opener
            "(i}",       // wrong closer
            "()",        // empty struct
            "a{}",       // dict entry with no types
            "a{s}",      // dict entry with one type
            "a{sss}",    // dict entry with three types
            "a{vs}",     // variant key
            "a{(i)s}",   // struct key
            "a{ass}",    // array key
            "{sv}",      // dict entry outside array
            "({sv})",    // dict entry outside array
            "z",         // unknown code
            "i z",       // unknown code
        ];
        for signature in bad.iter() {
            match SignatureTree::parse(signature) {
                Err(Error::MalformedSignature { signature: s, .. }) => assert_eq!(s, *signature),
                other => panic!("{:?} parsed as {:?}", signature, other),
            }
        }
    }

    #[test]
    fn malformed_is_deterministic() {
        let first = SignatureTree::parse("a{s}");
        let second = SignatureTree::parse("a{s}");
        assert!(first.is_err());
        assert_eq!(first, second);
    }

    #[test]
    fn nesting_limits() {
        let deep_arrays = format!("{}i", "a".repeat(33));
        assert!(SignatureTree::parse(&deep_arrays).is_err());
        let ok_arrays = format!("{}i", "a".repeat(32));
        assert!(SignatureTree::parse(&ok_arrays).is_ok());

        let deep_structs = format!("{}i{}", "(".repeat(33), ")".repeat(33));
        assert!(SignatureTree::parse(&deep_structs).is_err());

        let too_long = "i".repeat(256);
        assert!(SignatureTree::parse(&too_long).is_err());
    }

    #[test]
    fn verify_accepts_matching_body() -> Result<()> {
        let tree = SignatureTree::parse("sa{sv}(ih)aygb")?;
        let body = vec![
            "name".into(),
            Value::Dict(vec![
                ("a".into(), Value::variant("as", Value::Array(vec!["x".into()]))?),
                ("b".into(), Value::variant("h", Value::UnixFdIndex(0))?),
            ]),
            Value::Struct(vec![1i32.into(), Value::fd(3)]),
            Value::Array(vec![]),
            Value::Signature("a{sv}".to_owned()),
            true.into(),
        ];
        tree.verify(&body)?;
        SignatureTree::parse("")?.verify(&[])?;
        Ok(())
    }

    #[test]
    fn verify_rejects_wrong_shapes() -> Result<()> {
        let cases: Vec<(&str, Vec<Value>)> = vec![
            ("s", vec![1u32.into()]),
            ("ah", vec!["nope".into()]),
            ("ai", vec![Value::Array(vec![1i32.into(), "two".into()])]),
            ("a{sv}", vec![Value::Array(vec![])]),
            ("a{su}", vec![Value::Dict(vec![("k".into(), "v".into())])]),
            ("(is)", vec![Value::Struct(vec![1i32.into()])]),
            ("v", vec![1u8.into()]),
            ("ii", vec![1i32.into()]),
        ];
        for (signature, body) in cases {
            match SignatureTree::parse(signature)?.verify(&body) {
                Err(Error::BodyShapeMismatch { .. }) => (),
                other => panic!("{:?} accepted {:?}: {:?}", signature, body, other),
            }
        }

        let bad_signature = vec![Value::Signature("a{".to_owned())];
        assert!(matches!(
            SignatureTree::parse("g")?.verify(&bad_signature),
            Err(Error::MalformedSignature { .. })
        ));
        Ok(())
    }

    #[test]
    fn token_alignment() {
        assert_eq!(Token::Byte.alignment(), 1);
        assert_eq!(Token::Int16.alignment(), 2);
        assert_eq!(Token::UnixFd.alignment(), 4);
        assert_eq!(Token::DictEntry.alignment(), 8);
        assert_eq!(Token::from_byte(b'('), Some(Token::Struct));
        assert_eq!(Token::from_byte(b')'), None);
    }
}
