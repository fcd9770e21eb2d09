//! Protocol message encoding

use super::constants::{frontend, SSL_REQUEST_CODE};
use super::message::FrontendMessage;
use bytes::{BufMut, BytesMut};
use std::io;

/// Encode a frontend message into bytes
pub fn encode_message(msg: &FrontendMessage) -> io::Result<BytesMut> {
    let mut buf = BytesMut::new();

    match msg {
        FrontendMessage::Startup { version, params } => frame(&mut buf, None, |b| {
            b.put_i32(*version);
            for (key, value) in params {
                put_cstr(b, key)?;
                put_cstr(b, value)?;
            }
            b.put_u8(0);
            Ok(())
        })?,
        FrontendMessage::Password(password) => {
            frame(&mut buf, Some(frontend::PASSWORD), |b| put_cstr(b, password))?
        }
        FrontendMessage::SaslInitialResponse { mechanism, data } => {
            frame(&mut buf, Some(frontend::PASSWORD), |b| {
                put_cstr(b, mechanism)?;
                b.put_i32(len_i32(data.len())?);
                b.put_slice(data);
                Ok(())
            })?
        }
        FrontendMessage::SaslResponse { data } => frame(&mut buf, Some(frontend::PASSWORD), |b| {
            b.put_slice(data);
            Ok(())
        })?,
        FrontendMessage::Query(sql) => frame(&mut buf, Some(frontend::QUERY), |b| put_cstr(b, sql))?,
        FrontendMessage::Terminate => frame(&mut buf, Some(frontend::TERMINATE), |_| Ok(()))?,
        FrontendMessage::SslRequest => frame(&mut buf, None, |b| {
            b.put_i32(SSL_REQUEST_CODE);
            Ok(())
        })?,
    }

    Ok(buf)
}

/// Write `[tag] len body`, back-filling the length (which counts itself)
fn frame<F>(buf: &mut BytesMut, tag: Option<u8>, body: F) -> io::Result<()>
where
    F: FnOnce(&mut BytesMut) -> io::Result<()>,
{
    if let Some(tag) = tag {
        buf.put_u8(tag);
    }
    let len_pos = buf.len();
    buf.put_i32(0);
    body(buf)?;
    let len = len_i32(buf.len() - len_pos)?;
    buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

fn put_cstr(buf: &mut BytesMut, s: &str) -> io::Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "string contains an interior NUL byte",
        ));
    }
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}

fn len_i32(len: usize) -> io::Result<i32> {
    i32::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))
}
