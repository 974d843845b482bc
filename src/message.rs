use crate::de::unmarshal_body;
use crate::error::{Error, Result};
use crate::fds::{from_indexed, to_indexed};
use crate::ser::marshal_body;
use crate::signature::SignatureTree;
use crate::value::{RawFd, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

/// A message as application code sees it: header fields plus a body in
/// direct form, with descriptors held in the body itself.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub no_reply_expected: bool,
    pub destination: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub sender: Option<String>,
    pub signature: String,
    pub body: Vec<Value>,
}

impl Message {
    fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            no_reply_expected: false,
            destination: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            sender: None,
            signature: String::new(),
            body: Vec::new(),
        }
    }

    pub fn method_call(
        destination: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            destination: Some(destination.into()),
            path: Some(path.into()),
            interface: Some(interface.into()),
            member: Some(member.into()),
            ..Self::new(MessageType::MethodCall)
        }
    }

    /// A successful reply to the call with the given serial.
    pub fn method_return(reply_serial: u32) -> Self {
        Self {
            reply_serial: Some(reply_serial),
            ..Self::new(MessageType::MethodReturn)
        }
    }

    /// An error reply to the call with the given serial. The message text,
    /// if any, travels as the first body field.
    pub fn error(reply_serial: u32, error_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            reply_serial: Some(reply_serial),
            error_name: Some(error_name.into()),
            signature: "s".to_owned(),
            body: vec![Value::Str(text.into())],
            ..Self::new(MessageType::Error)
        }
    }

    pub fn with_body(mut self, signature: impl Into<String>, body: Vec<Value>) -> Self {
        self.signature = signature.into();
        self.body = body;
        self
    }

    pub fn with_no_reply_expected(mut self) -> Self {
        self.no_reply_expected = true;
        self
    }

    /// Convert into the wire-level frame: fds moved out of the body into
    /// the side array, body marshaled. The serial is assigned by the caller.
    pub fn into_frame(self, serial: u32) -> Result<Frame> {
        let tree = SignatureTree::parse(&self.signature)?;
        let (body, unix_fds) = to_indexed(&tree, self.body)?;
        let data = marshal_body(&tree, &body)?;
        Ok(Frame {
            message_type: self.message_type,
            no_reply_expected: self.no_reply_expected,
            serial,
            destination: self.destination,
            path: self.path,
            interface: self.interface,
            member: self.member,
            error_name: self.error_name,
            reply_serial: self.reply_serial,
            sender: self.sender,
            signature: self.signature,
            data,
            unix_fds,
        })
    }

    /// Text of an error reply, taken from a leading string field.
    pub fn error_text(&self) -> String {
        match self.body.first() {
            Some(Value::Str(text)) => text.clone(),
            _ => String::new(),
        }
    }
}

/// A message as the transport sees it: marshaled body bytes and the
/// descriptors referenced by index from the body.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub message_type: MessageType,
    pub no_reply_expected: bool,
    pub serial: u32,
    pub destination: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub sender: Option<String>,
    pub signature: String,
    pub data: Vec<u8>,
    pub unix_fds: Vec<RawFd>,
}

impl Frame {
    /// Convert back into a [`Message`], restoring descriptors from the side
    /// array. Indices the array cannot satisfy come back as absent fds.
    pub fn into_message(self) -> Result<Message> {
        let tree = SignatureTree::parse(&self.signature)?;
        let body = unmarshal_body(&tree, &self.data)?;
        let body = from_indexed(&tree, body, &self.unix_fds)?;
        Ok(Message {
            message_type: self.message_type,
            no_reply_expected: self.no_reply_expected,
            destination: self.destination,
            path: self.path,
            interface: self.interface,
            member: self.member,
            error_name: self.error_name,
            reply_serial: self.reply_serial,
            sender: self.sender,
            signature: self.signature,
            body,
        })
    }

    pub fn is_reply(&self) -> bool {
        matches!(
            self.message_type,
            MessageType::MethodReturn | MessageType::Error
        )
    }
}

impl From<Message> for Error {
    fn from(reply: Message) -> Self {
        Error::MethodError {
            text: reply.error_text(),
            name: reply.error_name.unwrap_or_default(),
            body: reply.body,
        }
    }
}
