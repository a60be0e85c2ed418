use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

use super::types::ConfidentialTransaction;
use super::wire::{self, EngineRequest, EngineResponse};
use crate::error::{EngineError, Error};
use crate::frame::codec::FrameCodec;
use crate::frame::{batch, Frame};
use crate::transport::tcp;

/// Server side of the remote engine protocol.
///
/// Implemented by whatever answers engine calls: an emulator in tests, or a
/// bridge in front of a real engine.
#[async_trait]
pub trait EngineService: Send + Sync + 'static {
    /// Answer one request. An `Err` is sent back as an engine failure frame.
    async fn call(&self, request: EngineRequest) -> Result<EngineResponse, EngineError>;

    /// Open a feed of new confidential transaction batches. The stream ends
    /// when the returned channel closes.
    async fn subscribe_new_transactions(
        &self,
    ) -> Result<mpsc::Receiver<Vec<ConfidentialTransaction>>, EngineError>;
}

/// Accept engine connections on `listener` until `shutdown` is cancelled.
///
/// Each connection runs on its own task and observes the same token.
pub async fn serve<S: EngineService>(
    listener: TcpListener,
    service: Arc<S>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "engine service listening");
    }

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = tcp::accept(&listener) => accepted?,
        };

        let service = Arc::clone(&service);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tracing::debug!(%peer_addr, "accepted engine connection");
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = handle_connection(stream, service.as_ref()) => {
                    if let Err(e) = result {
                        tracing::warn!(%peer_addr, error = %e, "engine connection error");
                    }
                }
            }
        });
    }

    tracing::info!("engine service stopped");
    Ok(())
}

async fn write_frame(
    stream: &mut TcpStream,
    codec: &mut FrameCodec,
    frame: Frame,
) -> Result<(), Error> {
    let mut buf = BytesMut::new();
    codec.encode(frame, &mut buf)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

async fn handle_connection<S: EngineService + ?Sized>(
    mut stream: TcpStream,
    service: &S,
) -> Result<(), Error> {
    let mut codec = FrameCodec::new();
    let mut read_buf = BytesMut::with_capacity(4096);

    loop {
        let frame = loop {
            if let Some(frame) = codec.decode(&mut read_buf)? {
                break frame;
            }
            if stream.read_buf(&mut read_buf).await? == 0 {
                return Ok(());
            }
        };

        let call_id = frame.header.sequence;
        let request = match wire::decode_request(&frame) {
            Ok(request) => request,
            Err(e) => {
                write_frame(&mut stream, &mut codec, Frame::engine_failure(call_id, &e.to_string()))
                    .await?;
                return Err(e.into());
            }
        };

        if request == EngineRequest::SubscribeNewTransactions {
            return stream_transactions(stream, codec, call_id, service).await;
        }

        let name = request.name();
        let reply = match service.call(request).await {
            Ok(response) => wire::encode_response(call_id, &response)?,
            Err(e) => {
                tracing::debug!(call = name, call_id, error = %e, "engine call failed");
                Frame::engine_failure(call_id, &e.to_string())
            }
        };
        write_frame(&mut stream, &mut codec, reply).await?;
    }
}

async fn stream_transactions<S: EngineService + ?Sized>(
    mut stream: TcpStream,
    mut codec: FrameCodec,
    call_id: u32,
    service: &S,
) -> Result<(), Error> {
    let mut feed = match service.subscribe_new_transactions().await {
        Ok(feed) => feed,
        Err(e) => {
            let frame = Frame::engine_failure(call_id, &e.to_string());
            return write_frame(&mut stream, &mut codec, frame).await;
        }
    };
    let ack = wire::encode_response(call_id, &EngineResponse::Done)?;
    write_frame(&mut stream, &mut codec, ack).await?;

    let mut sequence = 0u32;
    while let Some(txs) = feed.recv().await {
        let mut payload = BytesMut::new();
        batch::encode(&txs, &mut payload);
        write_frame(
            &mut stream,
            &mut codec,
            Frame::stream_batch(sequence, payload.freeze()),
        )
        .await?;
        tracing::debug!(sequence, count = txs.len(), "streamed transaction batch");
        sequence = sequence.wrapping_add(1);
    }
    Ok(())
}
