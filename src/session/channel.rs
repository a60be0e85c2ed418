use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::attestation::types::{PeerId, Phase};
use crate::attestation::TrustEngine;
use crate::engine::types::ConfidentialTransaction;
use crate::error::{Error, HandshakeError, SessionError};
use crate::frame::codec::FrameCodec;
use crate::frame::{batch, Frame, FrameType};

use super::handshake;
use super::HandshakeConfig;

/// A message received from a trusted peer.
#[derive(Debug)]
pub enum Message {
    /// A relayed batch of confidential transactions.
    Transactions(Vec<ConfidentialTransaction>),
    /// Peer-initiated disconnect with its reason.
    Disconnect(String),
}

/// Connection to one remote node over an already encrypted transport.
///
/// Starts untrusted in the Auth phase. [`PeerSession::attest`] runs the
/// four-phase handshake and either returns the trusted session or consumes it.
/// Confidential relay is refused until then.
pub struct PeerSession<T> {
    transport: T,
    peer: PeerId,
    phase: Phase,
    trusted: bool,
    send_seq: u32,
    read_buf: BytesMut,
    codec: FrameCodec,
    config: HandshakeConfig,
}

impl<T: AsyncRead + AsyncWrite + Unpin> PeerSession<T> {
    /// Wrap an authenticated transport to `peer`.
    pub fn new(transport: T, peer: PeerId, config: HandshakeConfig) -> Self {
        let codec = FrameCodec::with_max_payload_size(config.max_payload_size);
        Self {
            transport,
            peer,
            phase: Phase::Auth,
            trusted: false,
            send_seq: 0,
            read_buf: BytesMut::new(),
            codec,
            config,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Phase reached by the handshake.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// Run the attestation handshake against the peer using `engine`.
    ///
    /// On failure the session, and with it the transport, is dropped; the
    /// caller has to redial to try again from the Auth phase.
    pub async fn attest(mut self, engine: &dyn TrustEngine) -> Result<Self, HandshakeError> {
        if self.trusted {
            return Ok(self);
        }

        tracing::debug!(peer = %self.peer, "starting attestation handshake");
        let result = handshake::run(
            &mut self.transport,
            engine,
            &self.peer,
            &self.config,
            &mut self.phase,
        )
        .await;

        match result {
            Ok(residual) => {
                self.read_buf = residual;
                self.trusted = true;
                tracing::info!(peer = %self.peer, "peer attested, confidential relay enabled");
                Ok(self)
            }
            Err(e) => {
                tracing::warn!(
                    peer = %self.peer,
                    phase = %self.phase,
                    error = %e,
                    "attestation handshake failed"
                );
                Err(e)
            }
        }
    }

    /// Relay a batch of confidential transactions to the peer.
    pub async fn send_transactions(&mut self, txs: &[ConfidentialTransaction]) -> Result<(), Error> {
        self.ensure_trusted()?;
        let mut payload = BytesMut::new();
        batch::encode(txs, &mut payload);
        let seq = self.next_seq();
        self.send_frame(Frame::transactions(seq, payload.freeze()))
            .await?;
        tracing::debug!(peer = %self.peer, count = txs.len(), "relayed confidential transactions");
        Ok(())
    }

    /// Receive the next message from the peer.
    pub async fn recv(&mut self) -> Result<Message, Error> {
        self.ensure_trusted()?;
        let frame = self.recv_frame().await?;

        match frame.header.msg_type {
            FrameType::Transactions => Ok(Message::Transactions(batch::decode(frame.payload)?)),
            FrameType::Disconnect => {
                let (_, reason) = frame.disconnect_reason();
                Ok(Message::Disconnect(reason))
            }
            other => Err(SessionError::UnexpectedMessage {
                expected: "Transactions/Disconnect",
                actual: format!("{other:?}"),
            }
            .into()),
        }
    }

    /// Tell the peer we are leaving.
    pub async fn disconnect(&mut self, reason: &str) -> Result<(), Error> {
        self.ensure_trusted()?;
        let seq = self.next_seq();
        self.send_frame(Frame::disconnect(seq, None, reason)).await
    }

    /// Give back the underlying transport.
    pub fn into_inner(self) -> T {
        self.transport
    }

    fn ensure_trusted(&self) -> Result<(), SessionError> {
        if self.trusted {
            Ok(())
        } else {
            Err(SessionError::NotTrusted)
        }
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.send_seq;
        self.send_seq = self.send_seq.wrapping_add(1);
        seq
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), Error> {
        let mut buf = BytesMut::new();
        self.codec.encode(frame, &mut buf).map_err(Error::Frame)?;
        self.transport.write_all(&buf).await.map_err(Error::Io)?;
        self.transport.flush().await.map_err(Error::Io)?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Frame, Error> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buf).map_err(Error::Frame)? {
                return Ok(frame);
            }
            let n = self
                .transport
                .read_buf(&mut self.read_buf)
                .await
                .map_err(Error::Io)?;
            if n == 0 {
                return Err(SessionError::Closed.into());
            }
        }
    }
}
