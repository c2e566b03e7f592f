use std::io::Cursor;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, Chain};
use tokio_util::codec::Decoder;

use crate::codec::JsonRpcCodec;
use crate::error::Result;
use crate::message::ParseMessage;

/// A reader positioned right after the head message: buffered leftovers first,
/// then the rest of the underlying stream.
pub type Remainder<R> = Chain<Cursor<Bytes>, R>;

const READ_CHUNK: usize = 4096;

/// Read exactly one top-level message from `reader`.
///
/// Bytes read past the end of the message are not lost: they are handed back
/// in front of the reader. Returns `None` if the stream ends before any
/// message starts.
pub async fn read_head<T, R>(mut reader: R, max_message_bytes: usize) -> Result<(Option<T>, Remainder<R>)>
where
    T: ParseMessage,
    R: AsyncRead + Unpin,
{
    let mut codec = JsonRpcCodec::<T>::with_max_message_bytes(max_message_bytes);
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        if let Some(head) = codec.decode(&mut buf)? {
            return Ok((Some(head), remainder(buf, reader)));
        }
        buf.reserve(READ_CHUNK);
        if reader.read_buf(&mut buf).await? == 0 {
            let head = codec.decode_eof(&mut buf)?;
            return Ok((head, remainder(buf, reader)));
        }
    }
}

fn remainder<R: AsyncRead>(buf: BytesMut, reader: R) -> Remainder<R> {
    Cursor::new(buf.freeze()).chain(reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameError;
    use crate::message::JsonRpcRequest;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_leftover_bytes_follow_the_head() {
        let (mut tx, rx) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            tx.write_all(br#"{"jsonrpc":"2.0","method":"cat","id":null}raw payload"#)
                .await
                .unwrap();
        });

        let (head, mut rest) = read_head::<JsonRpcRequest, _>(rx, 1024).await.unwrap();
        assert_eq!(head.expect("head should be present").method, "cat");

        let mut tail = Vec::new();
        rest.read_to_end(&mut tail).await.unwrap();
        assert_eq!(tail, b"raw payload");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_stream_has_no_head() {
        let (tx, rx) = tokio::io::duplex(8);
        drop(tx);
        let (head, _) = read_head::<JsonRpcRequest, _>(rx, 1024).await.unwrap();
        assert!(head.is_none());
    }

    #[tokio::test]
    async fn test_oversized_head_is_rejected() {
        let payload = format!(r#"{{"jsonrpc":"2.0","method":"{}","id":null}}"#, "m".repeat(64));
        let result = read_head::<JsonRpcRequest, _>(payload.as_bytes(), 32).await;
        assert!(matches!(result, Err(FrameError::MessageLength { .. })));
    }
}
