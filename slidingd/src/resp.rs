//! Wire framing: inline commands in, RESP-style replies out.
//!
//! Requests arrive either as a plain line of whitespace-separated tokens or
//! as a RESP multibulk array (`*N` of `$len` bulk strings); both decode to
//! the same token vector. Replies use the RESP forms `+`, `$`, `:`, `*`
//! and `-`.

use crate::error::{ConnectionError, ReplyError};
use bstr::ByteSlice;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Write;
use std::str::FromStr;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Clone, PartialEq)]
pub enum Value {
    Simple(String),
    Bulk(Bytes),
    Integer(i64),
    Array(Vec<Reply>),
}

pub type Reply = Result<Value, ReplyError>;

impl Value {
    pub fn done() -> Self {
        Self::Simple("Done".to_owned())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Simple(value.to_owned())
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Self::Bulk(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::Integer(value as i64)
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple(s) => write!(f, "simple({s:?})"),
            Self::Bulk(s) => write!(f, "bulk({:?})", s.as_bstr()),
            Self::Integer(i) => write!(f, "int({i})"),
            Self::Array(values) => {
                f.write_str("array(")?;
                let mut is_first = true;
                for x in values {
                    if !is_first {
                        f.write_str(", ")?;
                    }
                    write!(f, "{x:?}")?;
                    is_first = false;
                }
                f.write_str(")")
            }
        }
    }
}

#[derive(Default)]
pub struct Codec {
    multibulk_len: Option<usize>,
    multibulk: Vec<Bytes>,
}

impl Decoder for Codec {
    type Item = Vec<Bytes>;
    type Error = ConnectionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let multibulk_len = match self.multibulk_len {
            None => {
                let Some(end) = src.find_byte(b'\n') else {
                    return Ok(None);
                };
                let line = src.split_to(end + 1).freeze();
                let line = trim_crlf(&line);
                match line.first() {
                    None => return Ok(Some(Vec::new())),
                    Some(b'*') => {
                        let len: i32 = parse_bytes(&line[1..]).ok_or_else(|| {
                            ConnectionError::Protocol("invalid multibulk length".to_owned())
                        })?;
                        if len <= 0 {
                            return Ok(Some(Vec::new()));
                        }
                        let multibulk_len = len as usize;
                        self.multibulk_len = Some(multibulk_len);
                        debug_assert!(self.multibulk.is_empty());
                        self.multibulk.reserve(multibulk_len);
                        multibulk_len
                    }
                    // inline command: whitespace-separated tokens
                    Some(_) => {
                        return Ok(Some(line.fields().map(Bytes::copy_from_slice).collect()));
                    }
                }
            }
            Some(len) => len,
        };

        for _ in self.multibulk.len()..multibulk_len {
            let Some(end) = src.find_byte(b'\r') else {
                return Ok(None);
            };
            if end + 1 >= src.len() {
                return Ok(None);
            }
            let [b'$', len_bytes @ ..] = &src[..end] else {
                return Err(ConnectionError::Protocol(format!(
                    "expected '$', got '{}'",
                    char::from(src[0])
                )));
            };
            let len: usize = parse_bytes(len_bytes)
                .ok_or_else(|| ConnectionError::Protocol("invalid bulk length".to_owned()))?;
            if end + 2 + len + 2 > src.len() {
                return Ok(None);
            }
            src.advance(end + 2);
            self.multibulk.push(src.split_to(len).freeze());
            src.advance(2);
        }

        self.multibulk_len = None;
        Ok(Some(std::mem::take(&mut self.multibulk)))
    }
}

impl Encoder<Reply> for Codec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Reply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode(&mut dst.writer(), &item)
    }
}

fn encode<W: Write>(writer: &mut W, reply: &Reply) -> std::io::Result<()> {
    match reply {
        Ok(Value::Simple(s)) => {
            writer.write_all(b"+")?;
            writer.write_all(s.as_bytes())?;
            writer.write_all(b"\r\n")
        }
        Ok(Value::Bulk(s)) => {
            write!(writer, "${}\r\n", s.len())?;
            writer.write_all(s)?;
            writer.write_all(b"\r\n")
        }
        Ok(Value::Integer(i)) => write!(writer, ":{i}\r\n"),
        Ok(Value::Array(values)) => {
            write!(writer, "*{}\r\n", values.len())?;
            for x in values {
                encode(writer, x)?;
            }
            Ok(())
        }
        Err(err) => write!(writer, "-{err}\r\n"),
    }
}

fn parse_bytes<T: FromStr>(s: &[u8]) -> Option<T> {
    s.to_str().ok()?.parse().ok()
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
