//! Framed packet I/O over a client transport.
//!
//! Owns the sequence counter for the physical connection. Reads reassemble
//! payloads split across `0xffffff`-byte packets; writes split them again.

use crate::error::ConnectionError;
use crate::protocol::mysql::{
    DEFAULT_MAX_ALLOWED_PACKET, MAX_PAYLOAD_LEN, OutgoingPacket, PacketCodec,
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;

/// Any byte stream a client can be served over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type BoxedTransport = Box<dyn Transport>;

pub struct PacketIo {
    reader: FramedRead<ReadHalf<BoxedTransport>, PacketCodec>,
    writer: WriteHalf<BoxedTransport>,
    encoder: PacketCodec,
    sequence: u8,
    max_payload: usize,
    cancel: CancellationToken,
}

impl PacketIo {
    /// Wraps `stream`. Cancelling `cancel` makes any pending or later read or
    /// write fail with [`ConnectionError::Closed`].
    pub fn new<T: Transport>(stream: T, cancel: CancellationToken) -> Self {
        let boxed: BoxedTransport = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);
        Self {
            reader: FramedRead::new(read_half, PacketCodec),
            writer: write_half,
            encoder: PacketCodec,
            sequence: 0,
            max_payload: DEFAULT_MAX_ALLOWED_PACKET,
            cancel,
        }
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Largest logical payload `read_packet` will assemble.
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    /// Starts a new command phase.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// Reads one logical payload. A payload growing past the configured
    /// maximum fails with [`ConnectionError::PacketTooLarge`] before the rest
    /// of it is buffered.
    pub async fn read_packet(&mut self) -> Result<Bytes, ConnectionError> {
        let mut assembled: Option<BytesMut> = None;
        loop {
            let packet = tokio::select! {
                _ = self.cancel.cancelled() => return Err(ConnectionError::Closed),
                next = self.reader.next() => match next {
                    Some(packet) => packet?,
                    None => return Err(ConnectionError::Closed),
                },
            };

            if packet.sequence_id != self.sequence {
                return Err(ConnectionError::OutOfOrder {
                    expected: self.sequence,
                    actual: packet.sequence_id,
                });
            }
            self.sequence = self.sequence.wrapping_add(1);

            let more = packet.payload.len() == MAX_PAYLOAD_LEN;
            let len = assembled.as_ref().map_or(0, |acc| acc.len()) + packet.payload.len();
            if len > self.max_payload {
                return Err(ConnectionError::PacketTooLarge {
                    len,
                    limit: self.max_payload,
                });
            }
            let payload = match assembled.take() {
                Some(mut acc) => {
                    acc.extend_from_slice(&packet.payload);
                    acc
                }
                None => packet.payload,
            };
            if !more {
                return Ok(payload.freeze());
            }
            assembled = Some(payload);
        }
    }

    /// Frames and writes one logical payload.
    pub async fn write_packet(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        let mut buf = BytesMut::with_capacity(payload.len() + 4);
        self.frame_into(&mut buf, payload)?;
        self.write_all(&buf).await
    }

    /// Frames `payload` onto `acc`; the accumulated bytes go out in a single
    /// write only when `flush` is set, after which the returned buffer is empty.
    pub async fn write_packet_batch(
        &mut self,
        mut acc: BytesMut,
        payload: &[u8],
        flush: bool,
    ) -> Result<BytesMut, ConnectionError> {
        self.frame_into(&mut acc, payload)?;
        if flush {
            self.write_all(&acc).await?;
            acc.clear();
        }
        Ok(acc)
    }

    fn frame_into(&mut self, dst: &mut BytesMut, payload: &[u8]) -> Result<(), ConnectionError> {
        let mut rest = payload;
        loop {
            let n = rest.len().min(MAX_PAYLOAD_LEN);
            let (chunk, tail) = rest.split_at(n);
            self.encoder.encode(
                OutgoingPacket {
                    sequence_id: self.sequence,
                    payload: chunk,
                },
                dst,
            )?;
            self.sequence = self.sequence.wrapping_add(1);
            rest = tail;
            // A full-size chunk is always followed by another, possibly empty.
            if n < MAX_PAYLOAD_LEN {
                return Ok(());
            }
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), ConnectionError> {
        let writer = &mut self.writer;
        let cancel = &self.cancel;
        if cancel.is_cancelled() {
            return Err(ConnectionError::Closed);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(ConnectionError::Closed),
            res = async {
                writer.write_all(buf).await?;
                writer.flush().await
            } => res.map_err(ConnectionError::from),
        }
    }

    /// Cancels pending I/O and shuts the write side down.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!(error = %e, "transport shutdown failed");
        }
    }
}
