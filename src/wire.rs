//! Framed binary wire protocol.
//!
//! All integers are big-endian and fixed width: 4-byte lengths/counts,
//! 8-byte OIDs, single-byte commands and statuses. `tokio::io`'s
//! `read_u32`/`write_u32` family already reads/writes network byte order,
//! so no separate byte-order crate is needed.
//!
//! Three composite frames recur throughout the protocol:
//! - counted byte string: `len:u32 | bytes[len]`
//! - OID vector: `count:u32 | oid[8]*count`
//! - status + record: `status:u8` followed, only when status is `Okay`,
//!   by a counted byte string.
//!
//! A short read that cannot be filled before the peer closes the
//! connection is an error that terminates the session. This is exactly
//! what `AsyncReadExt::read_exact`/`read_u32` etc. already do, so the
//! codec does no retrying of its own.

use crate::error::{DurusError, Result};
use crate::oid::Oid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The protocol version this crate speaks. Sent verbatim in response to `V`.
pub const PROTOCOL_VERSION: u32 = 20_001;

/// Status bytes that prefix every reply that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Okay = b'O',
    KeyError = b'K',
    Invalid = b'I',
}

impl Status {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'O' => Some(Status::Okay),
            b'K' => Some(Status::KeyError),
            b'I' => Some(Status::Invalid),
            _ => None,
        }
    }
}

pub async fn read_counted_bytes<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let len = reader.read_u32().await? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn write_counted_bytes<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

pub async fn read_oid<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Oid> {
    let mut buf = [0u8; Oid::SIZE];
    reader.read_exact(&mut buf).await?;
    Ok(Oid(buf))
}

pub async fn write_oid<W: AsyncWrite + Unpin>(writer: &mut W, oid: Oid) -> Result<()> {
    writer.write_all(oid.as_bytes()).await?;
    Ok(())
}

pub async fn read_oid_vector<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<Oid>> {
    let count = reader.read_u32().await? as usize;
    let mut oids = Vec::with_capacity(count);
    for _ in 0..count {
        oids.push(read_oid(reader).await?);
    }
    Ok(oids)
}

pub async fn write_oid_vector<W: AsyncWrite + Unpin>(writer: &mut W, oids: &[Oid]) -> Result<()> {
    writer.write_u32(oids.len() as u32).await?;
    for oid in oids {
        write_oid(writer, *oid).await?;
    }
    Ok(())
}

/// Writes a status byte, and for `Okay` the counted record that follows it.
pub async fn write_status_record<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: Status,
    record: Option<&[u8]>,
) -> Result<()> {
    writer.write_u8(status as u8).await?;
    if status == Status::Okay {
        let record = record.ok_or_else(|| {
            DurusError::Protocol("Okay status written without a record".to_string())
        })?;
        write_counted_bytes(writer, record).await?;
    }
    Ok(())
}

/// Writes a bare status byte with no trailing record, used by handlers
/// (commit, pack, open, close, destroy) whose reply is just an
/// acknowledgement rather than a status+record frame.
pub async fn write_status<W: AsyncWrite + Unpin>(writer: &mut W, status: Status) -> Result<()> {
    writer.write_u8(status as u8).await?;
    Ok(())
}

pub async fn read_status<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Status> {
    let byte = reader.read_u8().await?;
    Status::from_byte(byte).ok_or_else(|| DurusError::Protocol(format!("unknown status byte {byte:#04x}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn counted_bytes_round_trip() {
        let mut buf = Vec::new();
        write_counted_bytes(&mut buf, b"hello").await.unwrap();
        let mut cursor = Cursor::new(buf);
        let out = read_counted_bytes(&mut cursor).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn oid_vector_round_trip() {
        let oids = vec![Oid::from_u64(1), Oid::from_u64(2), Oid::from_u64(3)];
        let mut buf = Vec::new();
        write_oid_vector(&mut buf, &oids).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let out = read_oid_vector(&mut cursor).await.unwrap();
        assert_eq!(out, oids);
    }

    #[tokio::test]
    async fn status_record_round_trip_okay() {
        let mut buf = Vec::new();
        write_status_record(&mut buf, Status::Okay, Some(b"x")).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let status = read_status(&mut cursor).await.unwrap();
        assert_eq!(status, Status::Okay);
        let record = read_counted_bytes(&mut cursor).await.unwrap();
        assert_eq!(record, b"x");
    }

    #[tokio::test]
    async fn status_record_keyerror_has_no_trailing_record() {
        let mut buf = Vec::new();
        write_status_record(&mut buf, Status::KeyError, None).await.unwrap();
        assert_eq!(buf, vec![Status::KeyError as u8]);
    }
}
