//! Length-prefixed TCP framing helpers shared by the peer transport, the
//! external API, and the client stub.

use std::marker::Unpin;

use crate::utils::ViewstampError;

use bytes::{Buf, BytesMut};

use serde::Serialize;
use serde::de::DeserializeOwned;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Length of the big-endian `u64` length prefix.
const LEN_PREFIX: usize = 8;

/// Receives an object of type `T` from readable connection `conn_read`,
/// using `read_buf` as buffer storage for partial reads.
///
/// CANCELLATION SAFETY: we cannot use `read_u64()` and `read_exact()` here
/// because this function is intended to be used as a `tokio::select!` branch
/// and those two methods are not cancellation-safe. Bytes already read when
/// cancelled midway stay in `read_buf` and are picked up by the next call.
pub(crate) async fn safe_tcp_read<T, Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<T, ViewstampError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    // read length of obj first
    while read_buf.len() < LEN_PREFIX {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(ViewstampError::msg("connection closed by peer"));
        }
    }
    let mut len_bytes = [0u8; LEN_PREFIX];
    len_bytes.copy_from_slice(&read_buf[..LEN_PREFIX]);
    let obj_len = u64::from_be_bytes(len_bytes) as usize;

    // then read the obj itself
    let obj_end = LEN_PREFIX + obj_len;
    if read_buf.capacity() < obj_end {
        read_buf.reserve(obj_end - read_buf.len());
    }
    while read_buf.len() < obj_end {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(ViewstampError::msg("connection closed by peer"));
        }
    }
    let obj = decode_from_slice(&read_buf[LEN_PREFIX..obj_end])?;

    // no more awaits ahead, so no further cancellation is possible; discard
    // bytes consumed by this call and keep any tail of the next object
    read_buf.advance(obj_end);
    Ok(obj)
}

/// Sends an object of type `T` through writable connection `conn_write`.
/// Not cancellation-safe; call it from a select branch body, never from a
/// select branch future.
pub(crate) async fn tcp_write_obj<T, Conn>(
    obj: &T,
    conn_write: &mut Conn,
) -> Result<(), ViewstampError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let obj_bytes = encode_to_vec(obj)?;
    let mut frame = Vec::with_capacity(LEN_PREFIX + obj_bytes.len());
    frame.extend_from_slice(&(obj_bytes.len() as u64).to_be_bytes());
    frame.extend_from_slice(&obj_bytes);
    conn_write.write_all(&frame).await?;
    Ok(())
}
