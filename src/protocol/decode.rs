//! Protocol message decoding

use super::constants::{auth, tags, MAX_MESSAGE_LENGTH};
use super::message::{AuthenticationMessage, BackendMessage, ErrorFields, FieldDescription};
use bytes::Bytes;
use std::io;

/// Decode one backend message from the front of `data`.
///
/// Returns `Ok(None)` when `data` does not yet hold a complete message, and
/// `Ok(Some((msg, consumed)))` otherwise; the caller advances its buffer by
/// `consumed`. Malformed input is an `InvalidData` / `UnexpectedEof` error.
pub fn decode_message(data: &[u8]) -> io::Result<Option<(BackendMessage, usize)>> {
    if data.len() < 5 {
        return Ok(None);
    }

    let tag = data[0];
    let len = i32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    if len < 4 {
        return Err(invalid(format!("message length {} is too small", len)));
    }
    let len = len as usize;
    if len > MAX_MESSAGE_LENGTH {
        return Err(invalid(format!(
            "message length {} exceeds maximum allowed {}",
            len, MAX_MESSAGE_LENGTH
        )));
    }

    let total = len + 1;
    if data.len() < total {
        return Ok(None);
    }

    let mut body = Reader::new(&data[5..total]);
    let msg = match tag {
        tags::AUTHENTICATION => BackendMessage::Authentication(decode_authentication(&mut body)?),
        tags::BACKEND_KEY_DATA => BackendMessage::BackendKeyData {
            process_id: body.i32()?,
            secret_key: body.i32()?,
        },
        tags::COMMAND_COMPLETE => BackendMessage::CommandComplete(body.cstr()?),
        tags::DATA_ROW => decode_data_row(&mut body)?,
        tags::EMPTY_QUERY_RESPONSE => BackendMessage::EmptyQueryResponse,
        tags::ERROR_RESPONSE => BackendMessage::ErrorResponse(decode_error_fields(&mut body)?),
        tags::NOTICE_RESPONSE => BackendMessage::NoticeResponse(decode_error_fields(&mut body)?),
        tags::PARAMETER_STATUS => BackendMessage::ParameterStatus {
            name: body.cstr()?,
            value: body.cstr()?,
        },
        tags::READY_FOR_QUERY => BackendMessage::ReadyForQuery { status: body.u8()? },
        tags::ROW_DESCRIPTION => decode_row_description(&mut body)?,
        other => BackendMessage::Unknown { tag: other },
    };

    Ok(Some((msg, total)))
}

fn decode_authentication(body: &mut Reader<'_>) -> io::Result<AuthenticationMessage> {
    let msg = match body.i32()? {
        auth::OK => AuthenticationMessage::Ok,
        auth::CLEARTEXT_PASSWORD => AuthenticationMessage::CleartextPassword,
        auth::MD5_PASSWORD => {
            let mut salt = [0u8; 4];
            salt.copy_from_slice(body.take(4)?);
            AuthenticationMessage::Md5Password { salt }
        }
        auth::SASL => {
            let mut mechanisms = Vec::new();
            while !body.is_empty() {
                let name = body.cstr()?;
                if name.is_empty() {
                    break;
                }
                mechanisms.push(name);
            }
            AuthenticationMessage::Sasl { mechanisms }
        }
        auth::SASL_CONTINUE => AuthenticationMessage::SaslContinue {
            data: body.rest().to_vec(),
        },
        auth::SASL_FINAL => AuthenticationMessage::SaslFinal {
            data: body.rest().to_vec(),
        },
        other => AuthenticationMessage::Other(other),
    };
    Ok(msg)
}

fn decode_data_row(body: &mut Reader<'_>) -> io::Result<BackendMessage> {
    let count = body.i16()?;
    let mut columns = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let len = body.i32()?;
        let value = if len < 0 {
            None
        } else {
            Some(Bytes::copy_from_slice(body.take(len as usize)?))
        };
        columns.push(value);
    }
    Ok(BackendMessage::DataRow(columns))
}

fn decode_row_description(body: &mut Reader<'_>) -> io::Result<BackendMessage> {
    let count = body.i16()?;
    let mut fields = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let name = body.cstr()?;
        // table oid (4) + column attribute (2)
        body.take(6)?;
        let type_oid = body.i32()? as u32;
        // type size (2) + type modifier (4)
        body.take(6)?;
        let format_code = body.i16()?;
        fields.push(FieldDescription {
            name,
            type_oid,
            format_code,
        });
    }
    Ok(BackendMessage::RowDescription(fields))
}

fn decode_error_fields(body: &mut Reader<'_>) -> io::Result<ErrorFields> {
    let mut fields = ErrorFields::default();
    loop {
        let code = body.u8()?;
        if code == 0 {
            break;
        }
        let value = body.cstr()?;
        match code {
            b'S' => fields.severity = Some(value),
            b'C' => fields.code = Some(value),
            b'M' => fields.message = Some(value),
            b'D' => fields.detail = Some(value),
            b'H' => fields.hint = Some(value),
            _ => {}
        }
    }
    Ok(fields)
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Bounds-checked cursor over a message body
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("message body truncated: wanted {} bytes, {} left", n, self.data.len()),
            ));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn i16(&mut self) -> io::Result<i16> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> io::Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn cstr(&mut self) -> io::Result<String> {
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| invalid("missing null terminator in string"))?;
        let s = String::from_utf8_lossy(&self.data[..end]).into_owned();
        self.data = &self.data[end + 1..];
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_decode_authentication_ok() {
        let data = message(b'R', &[0, 0, 0, 0]);
        let (msg, consumed) = decode_message(&data).unwrap().unwrap();
        assert_eq!(msg, BackendMessage::Authentication(AuthenticationMessage::Ok));
        assert_eq!(consumed, 9);
    }

    #[test]
    fn test_decode_incomplete_returns_none() {
        let data = message(b'Z', b"I");
        assert!(decode_message(&data[..3]).unwrap().is_none());
        assert!(decode_message(&data[..5]).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_oversized_message() {
        let len = ((MAX_MESSAGE_LENGTH + 1) as i32).to_be_bytes();
        let data = [b'D', len[0], len[1], len[2], len[3]];
        let err = decode_message(&data).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_decode_rejects_negative_length() {
        let data = [b'D', 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(decode_message(&data).is_err());
    }

    #[test]
    fn test_decode_sasl_mechanisms() {
        let mut body = 10i32.to_be_bytes().to_vec();
        body.extend_from_slice(b"SCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0");
        let (msg, _) = decode_message(&message(b'R', &body)).unwrap().unwrap();
        assert_eq!(
            msg,
            BackendMessage::Authentication(AuthenticationMessage::Sasl {
                mechanisms: vec!["SCRAM-SHA-256-PLUS".into(), "SCRAM-SHA-256".into()],
            })
        );
    }

    #[test]
    fn test_decode_data_row_with_null() {
        let mut body = 2i16.to_be_bytes().to_vec();
        body.extend_from_slice(&2i32.to_be_bytes());
        body.extend_from_slice(b"on");
        body.extend_from_slice(&(-1i32).to_be_bytes());
        let (msg, _) = decode_message(&message(b'D', &body)).unwrap().unwrap();
        assert_eq!(
            msg,
            BackendMessage::DataRow(vec![Some(Bytes::from_static(b"on")), None])
        );
    }

    #[test]
    fn test_decode_data_row_truncated() {
        let mut body = 1i16.to_be_bytes().to_vec();
        body.extend_from_slice(&10i32.to_be_bytes());
        body.extend_from_slice(b"short");
        let err = decode_message(&message(b'D', &body)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_decode_row_description() {
        let mut body = 1i16.to_be_bytes().to_vec();
        body.extend_from_slice(b"archive_mode\0");
        body.extend_from_slice(&[0; 6]);
        body.extend_from_slice(&25i32.to_be_bytes());
        body.extend_from_slice(&(-1i16).to_be_bytes());
        body.extend_from_slice(&(-1i32).to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        let (msg, _) = decode_message(&message(b'T', &body)).unwrap().unwrap();
        assert_eq!(
            msg,
            BackendMessage::RowDescription(vec![FieldDescription {
                name: "archive_mode".into(),
                type_oid: 25,
                format_code: 0,
            }])
        );
    }

    #[test]
    fn test_decode_error_response() {
        let body = b"SFATAL\0C57P03\0Mthe database system is starting up\0\0";
        let (msg, _) = decode_message(&message(b'E', body)).unwrap().unwrap();
        match msg {
            BackendMessage::ErrorResponse(fields) => {
                assert_eq!(fields.code.as_deref(), Some("57P03"));
                assert_eq!(fields.severity.as_deref(), Some("FATAL"));
            }
            other => panic!("expected ErrorResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_tag_is_skippable() {
        let data = message(b'v', &[0, 0, 0, 0]);
        let (msg, consumed) = decode_message(&data).unwrap().unwrap();
        assert_eq!(msg, BackendMessage::Unknown { tag: b'v' });
        assert_eq!(consumed, data.len());
    }

    #[test]
    fn test_decode_two_messages_back_to_back() {
        let mut data = message(b'C', b"SHOW\0");
        data.extend(message(b'Z', b"I"));
        let (first, consumed) = decode_message(&data).unwrap().unwrap();
        assert_eq!(first, BackendMessage::CommandComplete("SHOW".into()));
        let (second, _) = decode_message(&data[consumed..]).unwrap().unwrap();
        assert_eq!(second, BackendMessage::ReadyForQuery { status: b'I' });
    }
}
