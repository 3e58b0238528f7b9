//! Message-oriented framing over a byte-stream transport.
//!
//! 9P2000 frames are a 4-byte little-endian length (inclusive of itself)
//! followed by the message body. [`tokio_util::codec::LengthDelimitedCodec`]
//! already expresses exactly this shape, so the framer here is a thin
//! wrapper that yields/accepts whole [`Msg`] values instead of raw byte
//! frames, and is shared between the client multiplexer and the server
//! dispatcher.

use bytes::buf::{Buf, BufMut};
use futures::sink::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::fcall::Msg;
use crate::serialize;
use crate::utils::Result;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_codec()
}

/// Read half of a framed 9P connection; yields one decoded [`Msg`] per frame.
pub struct FramedReader<R> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(reader: R) -> Self {
        FramedReader {
            inner: FramedRead::new(reader, codec()),
        }
    }

    /// Read one 9P message, or `Ok(None)` on a clean EOF.
    pub async fn recv(&mut self) -> Result<Option<Msg>> {
        match self.inner.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(bytes)) => Ok(Some(serialize::read_msg(&mut bytes.reader())?)),
        }
    }
}

/// Write half of a framed 9P connection.
pub struct FramedWriter<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(writer: W) -> Self {
        FramedWriter {
            inner: FramedWrite::new(writer, codec()),
        }
    }

    /// Write one 9P message.
    pub async fn send(&mut self, msg: &Msg) -> Result<()> {
        let mut buf = bytes::BytesMut::with_capacity(4096).writer();
        serialize::write_msg(&mut buf, msg)?;
        self.inner.send(buf.into_inner().freeze()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::{FCall, NOTAG, P92000};

    #[tokio::test]
    async fn round_trips_through_an_in_memory_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);

        let mut writer = FramedWriter::new(client_w);
        let mut reader = FramedReader::new(server_r);
        let _ = client_r;
        let _ = server_w;

        let msg = Msg {
            tag: NOTAG,
            body: FCall::TVersion {
                msize: 8192,
                version: P92000.to_owned(),
            },
        };
        writer.send(&msg).await.unwrap();
        let got = reader.recv().await.unwrap().unwrap();
        assert_eq!(got, msg);
    }
}
