use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::attestation::types::{PeerId, Phase};
use crate::attestation::TrustEngine;
use crate::error::{EngineError, FrameError, HandshakeError};
use crate::frame::codec::FrameCodec;
use crate::frame::{Frame, FrameType, PROTOCOL_VERSION};

use super::HandshakeConfig;

/// One side's message for one handshake phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub phase: Phase,
    pub version: u8,
    pub payload: Bytes,
}

impl HandshakeMessage {
    pub fn new(phase: Phase, payload: Bytes) -> Self {
        Self {
            phase,
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    pub fn into_frame(self) -> Frame {
        Frame::handshake(self.phase, self.payload)
    }

    /// Interpret `frame` as the peer's message for the `expected` phase.
    ///
    /// A disconnect frame means the peer refused our previous message.
    pub fn from_frame(frame: Frame, expected: Phase) -> Result<Self, HandshakeError> {
        let msg_type = frame.header.msg_type;
        if msg_type == FrameType::Disconnect {
            let (phase, reason) = frame.disconnect_reason();
            return Err(HandshakeError::PeerRejected {
                phase: phase.unwrap_or(expected),
                reason,
            });
        }
        if msg_type.phase() != Some(expected) {
            return Err(HandshakeError::UnexpectedMessage {
                expected,
                actual: format!("{msg_type:?} frame"),
            });
        }
        if frame.header.sequence != expected.index() {
            return Err(HandshakeError::UnexpectedMessage {
                expected,
                actual: format!("{msg_type:?} frame with sequence {}", frame.header.sequence),
            });
        }
        Ok(Self {
            phase: expected,
            version: frame.header.version,
            payload: frame.payload,
        })
    }
}

/// Run all four phases and the closing confirmation over `transport`,
/// bounded by the configured timeout.
///
/// `phase` tracks the phase in progress. On success returns the bytes read
/// past the last handshake frame, which belong to the trusted session.
pub async fn run<T: AsyncRead + AsyncWrite + Unpin>(
    transport: &mut T,
    engine: &dyn TrustEngine,
    peer: &PeerId,
    config: &HandshakeConfig,
    phase: &mut Phase,
) -> Result<BytesMut, HandshakeError> {
    let handshake = exchange(transport, engine, peer, config, phase);
    match tokio::time::timeout(config.handshake_timeout, handshake).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Timeout),
    }
}

async fn exchange<T: AsyncRead + AsyncWrite + Unpin>(
    transport: &mut T,
    engine: &dyn TrustEngine,
    peer: &PeerId,
    config: &HandshakeConfig,
    phase: &mut Phase,
) -> Result<BytesMut, HandshakeError> {
    let mut read_buf = BytesMut::with_capacity(4096);
    let mut codec = FrameCodec::with_max_payload_size(config.max_frame_size);

    for current in Phase::ALL {
        *phase = current;
        let received = exchange_phase(
            transport,
            &mut read_buf,
            &mut codec,
            engine,
            peer,
            config.max_frame_size,
            current,
        )
        .await?;

        tracing::debug!(
            %peer,
            phase = %current,
            size = received.payload.len(),
            "received handshake message"
        );

        match engine.verify(current, &received.payload, peer).await {
            Ok(()) => {}
            Err(EngineError::Rejected(reason)) => {
                send_rejection(transport, current, &reason, config.max_frame_size).await;
                return Err(HandshakeError::Rejected {
                    phase: current,
                    reason,
                });
            }
            Err(source) => {
                return Err(HandshakeError::Engine {
                    phase: current,
                    source,
                })
            }
        }
    }

    // Trust is granted only once the peer has also accepted every phase.
    confirm(transport, &mut read_buf, &mut codec, config.max_frame_size).await?;
    Ok(read_buf)
}

/// Send our confirmation while reading the peer's. A disconnect instead of a
/// confirmation means the peer refused our last payload.
async fn confirm<T: AsyncRead + AsyncWrite + Unpin>(
    transport: &mut T,
    read_buf: &mut BytesMut,
    codec: &mut FrameCodec,
    max_frame_size: u32,
) -> Result<(), HandshakeError> {
    let phase = Phase::ResponseKey;
    let (mut reader, mut writer) = tokio::io::split(&mut *transport);

    let (frame, written) = tokio::join!(
        read_frame(&mut reader, read_buf, codec, phase),
        write_frame(&mut writer, Frame::confirm(), max_frame_size),
    );
    let frame = frame?;

    match frame.header.msg_type {
        FrameType::Confirm if frame.header.sequence == Phase::ALL.len() as u32 => {}
        FrameType::Disconnect => {
            let (rejected, reason) = frame.disconnect_reason();
            return Err(HandshakeError::PeerRejected {
                phase: rejected.unwrap_or(phase),
                reason,
            });
        }
        other => {
            return Err(HandshakeError::UnexpectedMessage {
                expected: phase,
                actual: format!("{other:?} frame with sequence {}", frame.header.sequence),
            })
        }
    }
    written.map_err(|source| HandshakeError::Transport { phase, source })
}

/// Send our message for `phase` while reading the peer's.
///
/// The read is polled first and a read failure abandons the write, so a
/// malformed or oversized peer frame that is already buffered is refused
/// before the engine is asked for anything.
async fn exchange_phase<T: AsyncRead + AsyncWrite + Unpin>(
    transport: &mut T,
    read_buf: &mut BytesMut,
    codec: &mut FrameCodec,
    engine: &dyn TrustEngine,
    peer: &PeerId,
    max_frame_size: u32,
    phase: Phase,
) -> Result<HandshakeMessage, HandshakeError> {
    let (mut reader, mut writer) = tokio::io::split(&mut *transport);

    let (frame, written) = tokio::try_join!(
        read_frame(&mut reader, read_buf, codec, phase),
        async {
            let payload = engine
                .produce(phase, peer)
                .await
                .map_err(|source| HandshakeError::Engine { phase, source })?;
            let frame = HandshakeMessage::new(phase, payload).into_frame();
            // Write failures are reported after the read settles; a peer
            // that rejected us may close right after its disconnect frame.
            Ok::<_, HandshakeError>(write_frame(&mut writer, frame, max_frame_size).await)
        },
    )?;

    let message = HandshakeMessage::from_frame(frame, phase)?;
    written.map_err(|source| HandshakeError::Transport { phase, source })?;
    Ok(message)
}

async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    read_buf: &mut BytesMut,
    codec: &mut FrameCodec,
    phase: Phase,
) -> Result<Frame, HandshakeError> {
    loop {
        if let Some(frame) = codec
            .decode(read_buf)
            .map_err(|source| HandshakeError::Transport { phase, source })?
        {
            return Ok(frame);
        }
        let n = reader
            .read_buf(read_buf)
            .await
            .map_err(|e| HandshakeError::Transport {
                phase,
                source: FrameError::Io(e),
            })?;
        if n == 0 {
            return Err(HandshakeError::Closed { phase });
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: Frame,
    max_frame_size: u32,
) -> Result<(), FrameError> {
    let mut buf = BytesMut::new();
    FrameCodec::with_max_payload_size(max_frame_size).encode(frame, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Best-effort notice to the peer that its `phase` payload was refused.
async fn send_rejection<W: AsyncWrite + Unpin>(
    writer: &mut W,
    phase: Phase,
    reason: &str,
    max_frame_size: u32,
) {
    let frame = Frame::disconnect(0, Some(phase), reason);
    if let Err(e) = write_frame(writer, frame, max_frame_size).await {
        tracing::debug!(%phase, error = %e, "could not deliver handshake rejection");
    }
}
