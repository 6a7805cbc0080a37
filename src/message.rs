use crate::api::header;
use crate::buffer::{BufferPool, ConstBuffer};
use crate::cmf::{self, ValueType};
use crate::hash::Hash256;
use std::io::{self, Read, Write};

/// One typed message: routing header plus a CMF body.
///
/// On the wire a message is `size: u16 LE | header-CMF | End(0) | body-CMF`.
/// The header carries the service and message id plus optional request
/// routing ints; the body is opaque to the framing layer.
#[derive(Clone, Debug, Default)]
pub struct Message {
    pub service_id: u32,
    pub message_id: u32,
    headers: Vec<(u32, i64)>,
    body: ConstBuffer,
}

impl Message {
    pub fn new(service_id: u32, message_id: u32) -> Message {
        Message {
            service_id,
            message_id,
            headers: Vec::new(),
            body: ConstBuffer::default(),
        }
    }

    pub fn with_body(service_id: u32, message_id: u32, body: ConstBuffer) -> Message {
        Message {
            service_id,
            message_id,
            headers: Vec::new(),
            body,
        }
    }

    pub fn body(&self) -> &ConstBuffer {
        &self.body
    }

    pub fn set_header_int(&mut self, tag: u32, value: i64) {
        for entry in self.headers.iter_mut() {
            if entry.0 == tag {
                entry.1 = value;
                return;
            }
        }
        self.headers.push((tag, value));
    }

    /// Returns -1 when the header is absent, matching what callers test for.
    pub fn header_int(&self, tag: u32) -> i64 {
        self.headers
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| *v)
            .unwrap_or(-1)
    }

    /// Serialize into a length-prefixed frame.
    pub fn write_frame(&self, out: &mut impl Write) -> io::Result<()> {
        let mut head = Vec::with_capacity(32);
        write_header_int(&mut head, header::SERVICE_ID, i64::from(self.service_id));
        write_header_int(&mut head, header::MESSAGE_ID, i64::from(self.message_id));
        for (tag, value) in &self.headers {
            write_header_int(&mut head, *tag, *value);
        }
        cmf::write_token(&mut head, header::END, ValueType::BoolTrue);

        let total = head.len() + self.body.len();
        if total > usize::from(u16::MAX) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message exceeds frame size",
            ));
        }
        out.write_all(&(total as u16).to_le_bytes())?;
        out.write_all(&head)?;
        out.write_all(&self.body)?;
        Ok(())
    }

    /// Read one frame. An EOF before the size prefix returns `Ok(None)`.
    pub fn read_frame(input: &mut impl Read) -> io::Result<Option<Message>> {
        let mut size_buf = [0u8; 2];
        match input.read_exact(&mut size_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let size = usize::from(u16::from_le_bytes(size_buf));
        let mut frame = vec![0u8; size];
        input.read_exact(&mut frame)?;
        Message::from_frame(ConstBuffer::from_vec(frame))
            .map(Some)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed message header"))
    }

    /// Split a frame (without the size prefix) into header fields and body.
    pub fn from_frame(frame: ConstBuffer) -> Option<Message> {
        let mut msg = Message::default();
        let mut parser = MessageParser::new(frame.clone());
        loop {
            match parser.next() {
                Token::Field { tag, .. } if tag == header::END => break,
                Token::Field { tag, .. } => {
                    let value = parser.int_data();
                    match tag {
                        header::SERVICE_ID => msg.service_id = value as u32,
                        header::MESSAGE_ID => msg.message_id = value as u32,
                        _ => msg.headers.push((tag, value)),
                    }
                }
                _ => return None,
            }
        }
        msg.body = frame.slice(parser.consumed(), frame.len());
        Some(msg)
    }
}

fn write_header_int(out: &mut Vec<u8>, tag: u32, value: i64) {
    if value < 0 {
        cmf::write_token(out, tag, ValueType::NegativeNumber);
        cmf::write_var_int(out, value.unsigned_abs());
    } else {
        cmf::write_token(out, tag, ValueType::PositiveNumber);
        cmf::write_var_int(out, value as u64);
    }
}

/// Builds a CMF body into a [BufferPool].
pub struct MessageBuilder {
    pool: BufferPool,
}

impl MessageBuilder {
    pub fn new() -> MessageBuilder {
        MessageBuilder {
            pool: BufferPool::default(),
        }
    }

    pub fn add_int(&mut self, tag: u32, value: i64) -> &mut Self {
        write_header_int(self.pool.data_mut(), tag, value);
        self
    }

    pub fn add_u64(&mut self, tag: u32, value: u64) -> &mut Self {
        let out = self.pool.data_mut();
        cmf::write_token(out, tag, ValueType::PositiveNumber);
        cmf::write_var_int(out, value);
        self
    }

    pub fn add_bool(&mut self, tag: u32, value: bool) -> &mut Self {
        let vtype = if value {
            ValueType::BoolTrue
        } else {
            ValueType::BoolFalse
        };
        cmf::write_token(self.pool.data_mut(), tag, vtype);
        self
    }

    pub fn add_bytes(&mut self, tag: u32, data: &[u8]) -> &mut Self {
        let out = self.pool.data_mut();
        cmf::write_token(out, tag, ValueType::ByteArray);
        cmf::write_var_int(out, data.len() as u64);
        out.extend_from_slice(data);
        self
    }

    pub fn add_string(&mut self, tag: u32, value: &str) -> &mut Self {
        let out = self.pool.data_mut();
        cmf::write_token(out, tag, ValueType::String);
        cmf::write_var_int(out, value.len() as u64);
        out.extend_from_slice(value.as_bytes());
        self
    }

    pub fn add_double(&mut self, tag: u32, value: f64) -> &mut Self {
        let out = self.pool.data_mut();
        cmf::write_token(out, tag, ValueType::Double);
        out.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn add_hash(&mut self, tag: u32, hash: &Hash256) -> &mut Self {
        self.add_bytes(tag, &hash.0)
    }

    /// Finish the body and wrap it in a message.
    pub fn message(&mut self, service_id: u32, message_id: u32) -> Message {
        Message::with_body(service_id, message_id, self.pool.commit())
    }

    pub fn body(&mut self) -> ConstBuffer {
        self.pool.commit()
    }
}

impl Default for MessageBuilder {
    fn default() -> Self {
        MessageBuilder::new()
    }
}

/// What [MessageParser::next] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Field { tag: u32, vtype: ValueType },
    EndOfDocument,
    Error,
}

/// Pull parser over a CMF body. Byte and string payloads stay views into
/// the parsed buffer.
pub struct MessageParser {
    buffer: ConstBuffer,
    position: usize,
    tag: u32,
    int_value: i64,
    bool_value: bool,
    double_value: f64,
    data_start: usize,
    data_len: usize,
    vtype: Option<ValueType>,
}

impl MessageParser {
    pub fn new(buffer: ConstBuffer) -> MessageParser {
        MessageParser {
            buffer,
            position: 0,
            tag: 0,
            int_value: 0,
            bool_value: false,
            double_value: 0.0,
            data_start: 0,
            data_len: 0,
            vtype: None,
        }
    }

    pub fn next(&mut self) -> Token {
        let data = &self.buffer[..];
        if self.position >= data.len() {
            return Token::EndOfDocument;
        }
        let (tag, vtype, used) = match cmf::read_token(&data[self.position..]) {
            Some(t) => t,
            None => return Token::Error,
        };
        let mut pos = self.position + used;
        self.tag = tag;
        self.vtype = Some(vtype);
        self.data_len = 0;
        match vtype {
            ValueType::PositiveNumber | ValueType::NegativeNumber => {
                let (value, used) = match cmf::read_var_int(&data[pos..]) {
                    Some(v) => v,
                    None => return Token::Error,
                };
                pos += used;
                self.int_value = if vtype == ValueType::NegativeNumber {
                    -(value as i64)
                } else {
                    value as i64
                };
            }
            ValueType::String | ValueType::ByteArray => {
                let (len, used) = match cmf::read_var_int(&data[pos..]) {
                    Some(v) => v,
                    None => return Token::Error,
                };
                pos += used;
                if pos + len as usize > data.len() {
                    return Token::Error;
                }
                self.data_start = pos;
                self.data_len = len as usize;
                pos += len as usize;
            }
            ValueType::BoolTrue => self.bool_value = true,
            ValueType::BoolFalse => self.bool_value = false,
            ValueType::Double => {
                if pos + 8 > data.len() {
                    return Token::Error;
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&data[pos..pos + 8]);
                self.double_value = f64::from_le_bytes(buf);
                pos += 8;
            }
        }
        self.position = pos;
        Token::Field { tag, vtype }
    }

    /// Tag of the next field without consuming it.
    pub fn peek_tag(&self) -> Option<u32> {
        let data = &self.buffer[..];
        if self.position >= data.len() {
            return None;
        }
        cmf::read_token(&data[self.position..]).map(|(tag, _, _)| tag)
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn consumed(&self) -> usize {
        self.position
    }

    pub fn is_int(&self) -> bool {
        matches!(
            self.vtype,
            Some(ValueType::PositiveNumber) | Some(ValueType::NegativeNumber)
        )
    }

    pub fn is_byte_array(&self) -> bool {
        matches!(self.vtype, Some(ValueType::ByteArray))
    }

    pub fn int_data(&self) -> i64 {
        if self.is_int() {
            self.int_value
        } else {
            0
        }
    }

    pub fn bool_data(&self) -> bool {
        match self.vtype {
            Some(ValueType::BoolTrue) | Some(ValueType::BoolFalse) => self.bool_value,
            _ => false,
        }
    }

    pub fn double_data(&self) -> f64 {
        match self.vtype {
            Some(ValueType::Double) => self.double_value,
            _ => 0.0,
        }
    }

    pub fn data_len(&self) -> usize {
        self.data_len
    }

    pub fn bytes_data(&self) -> ConstBuffer {
        match self.vtype {
            Some(ValueType::ByteArray) | Some(ValueType::String) => self
                .buffer
                .slice(self.data_start, self.data_start + self.data_len),
            _ => ConstBuffer::default(),
        }
    }

    pub fn string_data(&self) -> String {
        String::from_utf8_lossy(&self.bytes_data()).into_owned()
    }

    pub fn hash_data(&self) -> Option<Hash256> {
        Hash256::from_slice(&self.bytes_data())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{header, service, tag};

    #[test]
    fn test_body_roundtrip() {
        let mut builder = MessageBuilder::new();
        builder.add_int(tag::BLOCK_HEIGHT, 112);
        builder.add_int(tag::OFFSET_IN_BLOCK, -1);
        builder.add_bool(50, true);
        builder.add_bytes(tag::TX_ID, &[0xAB; 32]);
        builder.add_string(60, "hello");
        builder.add_double(61, 2.5);
        let body = builder.body();

        let mut parser = MessageParser::new(body);
        assert!(matches!(parser.next(), Token::Field { .. }));
        assert_eq!(parser.tag(), tag::BLOCK_HEIGHT);
        assert_eq!(parser.int_data(), 112);
        parser.next();
        assert_eq!(parser.int_data(), -1);
        parser.next();
        assert!(parser.bool_data());
        parser.next();
        assert_eq!(parser.data_len(), 32);
        assert_eq!(&parser.bytes_data()[..], &[0xAB; 32]);
        parser.next();
        assert_eq!(parser.string_data(), "hello");
        parser.next();
        assert_eq!(parser.double_data(), 2.5);
        assert_eq!(parser.next(), Token::EndOfDocument);
    }

    #[test]
    fn test_frame_roundtrip() {
        let mut builder = MessageBuilder::new();
        builder.add_int(tag::BLOCK_HEIGHT, 7);
        let mut msg = builder.message(service::BLOCKCHAIN, 3);
        msg.set_header_int(header::REQUEST_ID, 99);
        msg.set_header_int(header::SEARCH_REQUEST_ID, 5);

        let mut wire = Vec::new();
        msg.write_frame(&mut wire).unwrap();
        let back = Message::read_frame(&mut &wire[..]).unwrap().unwrap();
        assert_eq!(back.service_id, service::BLOCKCHAIN);
        assert_eq!(back.message_id, 3);
        assert_eq!(back.header_int(header::REQUEST_ID), 99);
        assert_eq!(back.header_int(header::SEARCH_REQUEST_ID), 5);
        assert_eq!(back.header_int(header::JOB_REQUEST_ID), -1);

        let mut parser = MessageParser::new(back.body().clone());
        parser.next();
        assert_eq!(parser.tag(), tag::BLOCK_HEIGHT);
        assert_eq!(parser.int_data(), 7);
    }

    #[test]
    fn test_eof_between_frames() {
        let mut empty: &[u8] = &[];
        assert!(Message::read_frame(&mut empty).unwrap().is_none());
    }

    #[test]
    fn test_truncated_byte_array_is_error() {
        let mut raw = Vec::new();
        crate::cmf::write_token(&mut raw, 9, ValueType::ByteArray);
        crate::cmf::write_var_int(&mut raw, 100); // promises more than present
        raw.push(1);
        let mut parser = MessageParser::new(ConstBuffer::from_vec(raw));
        assert_eq!(parser.next(), Token::Error);
    }
}
