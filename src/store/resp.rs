//! RESP2 encoding and incremental decoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::event::CommandInvocation;
use crate::{Error, Result};

/// Nesting beyond this is rejected instead of recursing further.
const MAX_DEPTH: usize = 32;

/// Largest bulk string accepted, matching the server's own default limit.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    pub fn ok() -> Self {
        RespValue::Simple("OK".to_string())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RespValue::Bulk(Some(data.into()))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Bulk(None) | RespValue::Array(None))
    }

    /// Turns an error reply into [`Error::Server`].
    pub fn into_result(self) -> Result<RespValue> {
        match self {
            RespValue::Error(message) => Err(Error::Server(message)),
            other => Ok(other),
        }
    }

    /// Bytes of a bulk or simple string.
    pub fn into_bytes(self) -> Result<Bytes> {
        match self {
            RespValue::Bulk(Some(data)) => Ok(data),
            RespValue::Simple(s) => Ok(Bytes::from(s)),
            other => Err(unexpected("string", &other)),
        }
    }

    pub fn into_string(self) -> Result<String> {
        let data = self.into_bytes()?;
        String::from_utf8(data.to_vec())
            .map_err(|_| Error::Protocol("reply is not valid UTF-8".to_string()))
    }

    /// Elements of an array; a null array yields an empty vector.
    pub fn into_array(self) -> Result<Vec<RespValue>> {
        match self {
            RespValue::Array(Some(items)) => Ok(items),
            RespValue::Array(None) | RespValue::Bulk(None) => Ok(Vec::new()),
            other => Err(unexpected("array", &other)),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::Simple(s) => Some(s),
            RespValue::Bulk(Some(data)) => std::str::from_utf8(data).ok(),
            _ => None,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            RespValue::Simple(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Error(s) => {
                buf.put_u8(b'-');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Integer(i) => {
                buf.put_slice(format!(":{}\r\n", i).as_bytes());
            }
            RespValue::Bulk(None) => buf.put_slice(b"$-1\r\n"),
            RespValue::Bulk(Some(data)) => {
                buf.put_slice(format!("${}\r\n", data.len()).as_bytes());
                buf.put_slice(data);
                buf.put_slice(b"\r\n");
            }
            RespValue::Array(None) => buf.put_slice(b"*-1\r\n"),
            RespValue::Array(Some(items)) => {
                buf.put_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode(buf);
                }
            }
        }
    }
}

/// Encodes a command as an array of bulk strings.
pub fn encode_command(command: &CommandInvocation, buf: &mut BytesMut) {
    buf.put_slice(format!("*{}\r\n", command.args.len() + 1).as_bytes());
    put_bulk(buf, command.name.as_bytes());
    for arg in &command.args {
        put_bulk(buf, arg);
    }
}

fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
    buf.put_slice(format!("${}\r\n", data.len()).as_bytes());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
}

/// Decodes one value from the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched when the value is incomplete.
pub fn decode(buf: &mut BytesMut) -> Result<Option<RespValue>> {
    Decoder::default().decode(buf)
}

/// Decoder for a connection's read buffer.
///
/// Remembers how far the pending value has been scanned, so a reply that
/// arrives in many reads is walked once. The value is built only when it is
/// complete.
#[derive(Debug, Default)]
pub struct Decoder {
    /// Offset of the next unscanned element of the pending value.
    scanned: usize,
    /// Elements still expected by each open array, innermost last.
    open: Vec<i64>,
}

impl Decoder {
    /// Decodes one value from the front of `buf`, which must be the same
    /// buffer across calls until a value is returned.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when the value is
    /// incomplete.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RespValue>> {
        let complete = self.scan(buf).inspect_err(|_| self.reset())?;
        if !complete {
            return Ok(None);
        }
        self.reset();
        match parse(buf, 0, 0)? {
            Some((value, consumed)) => {
                buf.advance(consumed);
                Ok(Some(value))
            }
            None => Err(Error::Protocol("reply shorter than scanned".to_string())),
        }
    }

    fn reset(&mut self) {
        self.scanned = 0;
        self.open.clear();
    }

    /// Steps over buffered elements; true once a whole value is buffered.
    fn scan(&mut self, data: &[u8]) -> Result<bool> {
        loop {
            if self.open.len() > MAX_DEPTH {
                return Err(Error::Protocol("reply nested too deeply".to_string()));
            }
            let Some(&tag) = data.get(self.scanned) else {
                return Ok(false);
            };
            let Some((line, next)) = read_line(data, self.scanned + 1) else {
                return Ok(false);
            };

            let end = match tag {
                b'+' | b'-' | b':' => next,
                b'$' => match bulk_end(next, parse_int(line)?)? {
                    Some(end) if data.len() < end => return Ok(false),
                    Some(end) => end,
                    None => next,
                },
                b'*' => {
                    let len = parse_int(line)?;
                    if len > 0 {
                        self.open.push(len);
                        self.scanned = next;
                        continue;
                    }
                    next
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unknown reply type byte 0x{:02x}",
                        other
                    )))
                }
            };
            self.scanned = end;

            // A finished element may complete its enclosing arrays.
            loop {
                let Some(remaining) = self.open.last_mut() else {
                    return Ok(true);
                };
                *remaining -= 1;
                if *remaining > 0 {
                    break;
                }
                self.open.pop();
            }
        }
    }
}

/// End offset of a bulk string whose payload starts at `start`, or `None`
/// for a null bulk.
fn bulk_end(start: usize, len: i64) -> Result<Option<usize>> {
    if len < 0 {
        return Ok(None);
    }
    if len > MAX_BULK_LEN {
        return Err(Error::Protocol(format!("bulk string of {} bytes is too large", len)));
    }
    usize::try_from(len)
        .ok()
        .and_then(|len| start.checked_add(len))
        .and_then(|end| end.checked_add(2))
        .map(Some)
        .ok_or_else(|| Error::Protocol(format!("bulk length {} out of range", len)))
}

fn parse(data: &[u8], pos: usize, depth: usize) -> Result<Option<(RespValue, usize)>> {
    if depth > MAX_DEPTH {
        return Err(Error::Protocol("reply nested too deeply".to_string()));
    }
    let Some(&tag) = data.get(pos) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(data, pos + 1) else {
        return Ok(None);
    };

    match tag {
        b'+' => Ok(Some((RespValue::Simple(line_string(line)?), next))),
        b'-' => Ok(Some((RespValue::Error(line_string(line)?), next))),
        b':' => Ok(Some((RespValue::Integer(parse_int(line)?), next))),
        b'$' => {
            let Some(end) = bulk_end(next, parse_int(line)?)? else {
                return Ok(Some((RespValue::Bulk(None), next)));
            };
            if data.len() < end {
                return Ok(None);
            }
            if &data[end - 2..end] != b"\r\n" {
                return Err(Error::Protocol("bulk string not terminated".to_string()));
            }
            let value = Bytes::copy_from_slice(&data[next..end - 2]);
            Ok(Some((RespValue::Bulk(Some(value)), end)))
        }
        b'*' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((RespValue::Array(None), next)));
            }
            let mut items = Vec::with_capacity((len as usize).min(1024));
            let mut cursor = next;
            for _ in 0..len {
                match parse(data, cursor, depth + 1)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(Some(items)), cursor)))
        }
        other => Err(Error::Protocol(format!(
            "unknown reply type byte 0x{:02x}",
            other
        ))),
    }
}

fn read_line(data: &[u8], from: usize) -> Option<(&[u8], usize)> {
    let rest = data.get(from..)?;
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..end], from + end + 2))
}

fn line_string(line: &[u8]) -> Result<String> {
    Ok(String::from_utf8_lossy(line).to_string())
}

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("invalid integer {:?}", String::from_utf8_lossy(line))))
}

fn unexpected(wanted: &str, got: &RespValue) -> Error {
    Error::Protocol(format!("expected {} reply, got {:?}", wanted, got))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command() {
        let mut buf = BytesMut::new();
        encode_command(&CommandInvocation::new("SET").arg("k").arg("v1"), &mut buf);
        assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$2\r\nv1\r\n");
    }

    #[test]
    fn test_decode_nested_reply() {
        let mut buf = BytesMut::from(
            &b"*2\r\n$6\r\norders\r\n*1\r\n*2\r\n$3\r\n1-0\r\n*2\r\n$2\r\nid\r\n$1\r\n1\r\n"[..],
        );
        let value = decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());

        let items = value.into_array().unwrap();
        assert_eq!(items[0].as_str(), Some("orders"));
        let entries = items[1].clone().into_array().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_incomplete_input_is_left_in_place() {
        let full = b"$5\r\nhello\r\n+OK\r\n";
        for cut in 1..11 {
            let mut buf = BytesMut::from(&full[..cut]);
            assert_eq!(decode(&mut buf).unwrap(), None);
            assert_eq!(buf.len(), cut);
        }

        let mut buf = BytesMut::from(&full[..]);
        assert_eq!(decode(&mut buf).unwrap(), Some(RespValue::bulk("hello")));
        assert_eq!(decode(&mut buf).unwrap(), Some(RespValue::ok()));
        assert_eq!(decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_nulls_errors_and_integers() {
        let mut buf = BytesMut::from(&b"$-1\r\n*-1\r\n-ERR no such key\r\n:42\r\n"[..]);
        assert!(decode(&mut buf).unwrap().unwrap().is_null());
        assert!(decode(&mut buf).unwrap().unwrap().is_null());
        let err = decode(&mut buf).unwrap().unwrap().into_result().unwrap_err();
        assert!(matches!(err, Error::Server(ref m) if m == "ERR no such key"));
        assert_eq!(decode(&mut buf).unwrap(), Some(RespValue::Integer(42)));
    }

    #[test]
    fn test_encode_decode_agree() {
        let value = RespValue::Array(Some(vec![
            RespValue::Integer(-3),
            RespValue::Bulk(None),
            RespValue::bulk(Bytes::from_static(b"\r\nbinary\0")),
        ]));
        let mut buf = BytesMut::new();
        value.encode(&mut buf);
        assert_eq!(decode(&mut buf).unwrap(), Some(value));
    }

    #[test]
    fn test_reply_split_across_reads() {
        let full = b"*2\r\n$6\r\norders\r\n*1\r\n*2\r\n$3\r\n1-0\r\n*0\r\n:7\r\n";
        let mut decoder = Decoder::default();
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in full.iter() {
            buf.extend_from_slice(&[*byte]);
            while let Some(value) = decoder.decode(&mut buf).unwrap() {
                decoded.push(value);
            }
        }
        assert!(buf.is_empty());
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1], RespValue::Integer(7));
        let items = decoded[0].clone().into_array().unwrap();
        assert_eq!(items[0].as_str(), Some("orders"));
    }

    #[test]
    fn test_absurd_bulk_lengths_are_rejected() {
        for header in [
            &b"$9223372036854775807\r\nx"[..],
            &b"$536870913\r\nx"[..],
            &b"*1\r\n$9223372036854775807\r\nx"[..],
        ] {
            let mut buf = BytesMut::from(header);
            assert!(matches!(decode(&mut buf), Err(Error::Protocol(_))), "{:?}", header);
        }
        assert!(matches!(
            parse(b"$9223372036854775807\r\nx", 0, 0),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        let mut buf = BytesMut::from(&b"?what\r\n"[..]);
        assert!(matches!(decode(&mut buf), Err(Error::Protocol(_))));
    }
}
