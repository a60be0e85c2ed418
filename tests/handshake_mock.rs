#![cfg(feature = "mock")]

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::codec::{Decoder, Encoder};

use confidential_tx_relay::attestation::mock::{default_payload, EngineCall};
use confidential_tx_relay::error::FrameError;
use confidential_tx_relay::frame::codec::FrameCodec;
use confidential_tx_relay::frame::{FrameHeader, HEADER_SIZE, PROTOCOL_VERSION};
use confidential_tx_relay::{
    ConfidentialTransaction, EngineClient, EngineConfig, Error, Frame, FrameType,
    HandshakeConfig, HandshakeError, Message, PeerId, PeerSession, Phase, SessionError,
    StaticTrustEngine,
};

mod common;

const ALICE: PeerId = PeerId([0xA1; 32]);
const BOB: PeerId = PeerId([0xB0; 32]);

fn sessions(
    config: HandshakeConfig,
) -> (PeerSession<DuplexStream>, PeerSession<DuplexStream>) {
    common::init_tracing();
    let (a, b) = tokio::io::duplex(64 * 1024);
    (
        PeerSession::new(a, BOB, config.clone()),
        PeerSession::new(b, ALICE, config),
    )
}

fn encode(frame: Frame) -> BytesMut {
    let mut buf = BytesMut::new();
    FrameCodec::new().encode(frame, &mut buf).unwrap();
    buf
}

/// Read every frame the other side writes until it closes.
async fn drain_frames(mut transport: DuplexStream) -> Vec<Frame> {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    let mut frames = Vec::new();
    loop {
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        match transport.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return frames,
            Ok(_) => {}
        }
    }
}

/// Both peers use engines producing and expecting "auth", "verify",
/// "request key" and "response key".
#[tokio::test]
async fn fixed_payloads_complete_handshake() {
    let (alice, bob) = sessions(HandshakeConfig::default());
    let alice_engine = StaticTrustEngine::new();
    let bob_engine = StaticTrustEngine::new();

    let (alice, bob) = tokio::join!(alice.attest(&alice_engine), bob.attest(&bob_engine));
    let mut alice = alice.expect("alice handshake failed");
    let mut bob = bob.expect("bob handshake failed");

    assert!(alice.is_trusted());
    assert!(bob.is_trusted());
    assert_eq!(alice.phase(), Phase::ResponseKey);
    assert_eq!(alice.peer(), &BOB);
    assert_eq!(alice_engine.verified_phases(), Phase::ALL.to_vec());
    assert_eq!(bob_engine.verified_phases(), Phase::ALL.to_vec());

    // Each side saw exactly the other side's fixed payloads.
    let checked: Vec<EngineCall> = bob_engine
        .calls()
        .into_iter()
        .filter(|c| matches!(c, EngineCall::Verify(..)))
        .collect();
    let expected: Vec<EngineCall> = Phase::ALL
        .into_iter()
        .map(|p| EngineCall::Verify(p, default_payload(p)))
        .collect();
    assert_eq!(checked, expected);

    // Trusted sessions relay confidential transactions both ways.
    let txs = vec![
        ConfidentialTransaction::new(Bytes::from_static(b"sealed-1")),
        ConfidentialTransaction::new(Bytes::from_static(b"sealed-2")),
    ];
    alice.send_transactions(&txs).await.unwrap();
    match bob.recv().await.unwrap() {
        Message::Transactions(received) => assert_eq!(received, txs),
        other => panic!("expected transactions, got {other:?}"),
    }

    bob.disconnect("shutting down").await.unwrap();
    match alice.recv().await.unwrap() {
        Message::Disconnect(reason) => assert_eq!(reason, "shutting down"),
        other => panic!("expected disconnect, got {other:?}"),
    }
}

/// Bob's engine produces "AUTH"; Alice refuses it at the Auth phase and never
/// moves on to Verify.
#[tokio::test]
async fn mismatched_auth_fails_at_auth_phase() {
    let (alice, bob) = sessions(HandshakeConfig::default());
    let alice_engine = StaticTrustEngine::new();
    let bob_engine = StaticTrustEngine::new().producing(Phase::Auth, "AUTH");

    let (alice, bob) = tokio::join!(alice.attest(&alice_engine), bob.attest(&bob_engine));

    let alice_err = alice.err().expect("alice must fail");
    assert!(matches!(
        alice_err,
        HandshakeError::Rejected {
            phase: Phase::Auth,
            ..
        }
    ));
    assert!(alice_err.is_authentication_failure());

    match bob.err().expect("bob must fail") {
        HandshakeError::PeerRejected { phase, reason } => {
            assert_eq!(phase, Phase::Auth);
            assert!(reason.contains("auth"));
        }
        other => panic!("unexpected bob error: {other}"),
    }

    // Alice never produced anything past Auth.
    assert_eq!(
        alice_engine.calls(),
        vec![
            EngineCall::Produce(Phase::Auth),
            EngineCall::Verify(Phase::Auth, Bytes::from_static(b"AUTH")),
        ]
    );
}

/// Same failure seen on the wire: the rejecting side writes its Auth message
/// and a disconnect, and no Verify message.
#[tokio::test]
async fn rejecting_side_never_sends_verify_message() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let session = PeerSession::new(local, BOB, HandshakeConfig::default());
    let engine = StaticTrustEngine::new();

    remote
        .write_all(&encode(Frame::handshake(Phase::Auth, Bytes::from_static(b"AUTH"))))
        .await
        .unwrap();

    let observer = tokio::spawn(drain_frames(remote));
    let err = session.attest(&engine).await.err().expect("handshake must fail");
    assert_eq!(err.phase(), Some(Phase::Auth));

    let frames = observer.await.unwrap();
    let types: Vec<FrameType> = frames.iter().map(|f| f.header.msg_type).collect();
    assert_eq!(types, vec![FrameType::Auth, FrameType::Disconnect]);
    assert_eq!(frames[1].disconnect_reason().0, Some(Phase::Auth));
}

/// A rejection at any later phase ends both sessions, the last phase
/// included.
#[tokio::test]
async fn late_phase_rejection_fails_both_sides() {
    for phase in [Phase::Verify, Phase::RequestKey, Phase::ResponseKey] {
        let (alice, bob) = sessions(HandshakeConfig::default());
        let alice_engine = StaticTrustEngine::new();
        let bob_engine = StaticTrustEngine::new().producing(phase, "BAD");

        let (alice, bob) = tokio::join!(alice.attest(&alice_engine), bob.attest(&bob_engine));

        match alice.err() {
            Some(HandshakeError::Rejected { phase: at, .. }) => assert_eq!(at, phase),
            other => panic!("{phase}: alice expected rejection, got {other:?}"),
        }
        match bob.err() {
            Some(HandshakeError::PeerRejected { phase: at, .. }) => assert_eq!(at, phase),
            other => panic!("{phase}: bob expected peer rejection, got {other:?}"),
        }
        assert_eq!(alice_engine.verified_phases().last(), Some(&phase));
    }
}

/// On the wire the rejecting side stops at the refused phase: its own
/// message for that phase, then a disconnect, nothing later.
#[tokio::test]
async fn rejecting_side_sends_no_later_phase_message() {
    for rejected in [Phase::Verify, Phase::RequestKey, Phase::ResponseKey] {
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let session = PeerSession::new(local, BOB, HandshakeConfig::default());
        let engine = StaticTrustEngine::new();

        let mut script = BytesMut::new();
        for phase in Phase::ALL {
            let payload = if phase == rejected {
                Bytes::from_static(b"BAD")
            } else {
                default_payload(phase)
            };
            script.extend_from_slice(&encode(Frame::handshake(phase, payload)));
            if phase == rejected {
                break;
            }
        }
        remote.write_all(&script).await.unwrap();

        let observer = tokio::spawn(drain_frames(remote));
        let err = session.attest(&engine).await.err().expect("handshake must fail");
        assert_eq!(err.phase(), Some(rejected));

        let types: Vec<FrameType> = observer
            .await
            .unwrap()
            .iter()
            .map(|f| f.header.msg_type)
            .collect();
        let mut expected: Vec<FrameType> = Phase::ALL
            .into_iter()
            .take(rejected.index() as usize + 1)
            .map(FrameType::from)
            .collect();
        expected.push(FrameType::Disconnect);
        assert_eq!(types, expected, "rejected at {rejected}");
    }
}

/// An engine outage while verifying the last payload leaves the peer
/// untrusted too.
#[tokio::test]
async fn engine_failure_at_last_phase_fails_peer() {
    let (alice, bob) = sessions(HandshakeConfig::default());
    let alice_engine = StaticTrustEngine::new().unavailable_at(Phase::ResponseKey);
    let bob_engine = StaticTrustEngine::new();

    let (alice, bob) = tokio::join!(
        async {
            // Dropping the failed session closes the transport.
            alice.attest(&alice_engine).await.map(|_| ())
        },
        bob.attest(&bob_engine)
    );

    assert!(matches!(
        alice,
        Err(HandshakeError::Engine {
            phase: Phase::ResponseKey,
            ..
        })
    ));
    let err = bob.err().expect("bob must not be trusted");
    assert_eq!(err.phase(), Some(Phase::ResponseKey));
}

/// Before the confirmation arrives the peer is not trusted.
#[tokio::test]
async fn missing_confirmation_is_fatal() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let session = PeerSession::new(local, BOB, HandshakeConfig::default());

    let mut script = BytesMut::new();
    for phase in Phase::ALL {
        script.extend_from_slice(&encode(Frame::handshake(phase, default_payload(phase))));
    }
    script.extend_from_slice(&encode(Frame::transactions(0, Bytes::from_static(&[0; 4]))));
    remote.write_all(&script).await.unwrap();

    let err = session
        .attest(&StaticTrustEngine::new())
        .await
        .err()
        .expect("must fail");
    assert!(matches!(
        err,
        HandshakeError::UnexpectedMessage {
            expected: Phase::ResponseKey,
            ..
        }
    ));
    drop(remote);
}

#[tokio::test]
async fn oversized_handshake_frame_rejected_before_engine_call() {
    let config = HandshakeConfig::builder()
        .max_frame_size(1024)
        .build()
        .unwrap();
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let session = PeerSession::new(local, BOB, config);
    let engine = StaticTrustEngine::new();

    let mut header = BytesMut::new();
    FrameHeader {
        version: PROTOCOL_VERSION,
        msg_type: FrameType::Auth,
        sequence: 0,
        payload_len: 1025,
    }
    .encode(&mut header);
    remote.write_all(&header).await.unwrap();

    let err = session.attest(&engine).await.err().expect("must fail");
    assert!(matches!(
        err,
        HandshakeError::Transport {
            phase: Phase::Auth,
            source: FrameError::PayloadTooLarge {
                size: 1025,
                max: 1024
            },
        }
    ));
    assert!(engine.calls().is_empty());
    drop(remote);
}

#[tokio::test]
async fn out_of_order_phase_is_fatal() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let session = PeerSession::new(local, BOB, HandshakeConfig::default());
    let engine = StaticTrustEngine::new();

    remote
        .write_all(&encode(Frame::handshake(
            Phase::Verify,
            Bytes::from_static(b"verify"),
        )))
        .await
        .unwrap();

    let err = session.attest(&engine).await.err().expect("must fail");
    assert!(matches!(
        err,
        HandshakeError::UnexpectedMessage {
            expected: Phase::Auth,
            ..
        }
    ));
    assert!(engine.verified_phases().is_empty());
}

#[tokio::test]
async fn version_mismatch_is_fatal() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let session = PeerSession::new(local, BOB, HandshakeConfig::default());
    let engine = StaticTrustEngine::new();

    let mut frame = encode(Frame::handshake(Phase::Auth, Bytes::from_static(b"auth")));
    frame[2] = PROTOCOL_VERSION + 1;
    remote.write_all(&frame).await.unwrap();

    let err = session.attest(&engine).await.err().expect("must fail");
    assert!(matches!(
        err,
        HandshakeError::Transport {
            phase: Phase::Auth,
            source: FrameError::UnsupportedVersion(_),
        }
    ));
}

#[tokio::test]
async fn silent_peer_times_out() {
    let config = HandshakeConfig::builder()
        .handshake_timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let (local, _remote) = tokio::io::duplex(64 * 1024);
    let session = PeerSession::new(local, BOB, config);

    let err = session
        .attest(&StaticTrustEngine::new())
        .await
        .err()
        .expect("must time out");
    assert!(matches!(err, HandshakeError::Timeout));
    assert!(!err.is_authentication_failure());
}

#[tokio::test]
async fn peer_closing_mid_handshake_is_fatal() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let session = PeerSession::new(local, BOB, HandshakeConfig::default());

    remote
        .write_all(&encode(Frame::handshake(Phase::Auth, default_payload(Phase::Auth))))
        .await
        .unwrap();
    let observer = tokio::spawn(async move {
        // Take Alice's Auth message, then hang up.
        let mut buf = vec![0u8; HEADER_SIZE + 4];
        remote.read_exact(&mut buf).await.unwrap();
    });

    let err = session
        .attest(&StaticTrustEngine::new())
        .await
        .err()
        .expect("must fail");
    observer.await.unwrap();
    assert_eq!(err.phase(), Some(Phase::Verify));
    assert!(matches!(
        err,
        HandshakeError::Closed { .. } | HandshakeError::Transport { .. }
    ));
}

#[tokio::test]
async fn unreachable_engine_fails_handshake() {
    let (alice, _bob) = sessions(HandshakeConfig::default());
    let engine = EngineClient::new(EngineConfig::new(common::dead_endpoint().await));

    let err = alice.attest(&engine).await.err().expect("must fail");
    match err {
        HandshakeError::Engine { phase, .. } => assert_eq!(phase, Phase::Auth),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn handshake_frames_after_trust_are_rejected() {
    let (alice, bob) = sessions(HandshakeConfig::default());
    let alice_engine = StaticTrustEngine::new();
    let bob_engine = StaticTrustEngine::new();
    let (alice, bob) = tokio::join!(alice.attest(&alice_engine), bob.attest(&bob_engine));
    let mut alice = alice.unwrap();
    let mut raw = bob.unwrap().into_inner();

    raw.write_all(&encode(Frame::handshake(Phase::Auth, default_payload(Phase::Auth))))
        .await
        .unwrap();

    let err = alice.recv().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Session(SessionError::UnexpectedMessage { .. })
    ));
}

/// Relay bytes that arrive in the same read as the last handshake frame are
/// not lost.
#[tokio::test]
async fn relay_frame_pipelined_after_handshake_is_kept() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let session = PeerSession::new(local, BOB, HandshakeConfig::default());

    let mut script = BytesMut::new();
    for phase in Phase::ALL {
        script.extend_from_slice(&encode(Frame::handshake(phase, default_payload(phase))));
    }
    let mut batch = BytesMut::new();
    confidential_tx_relay::frame::batch::encode(
        &[ConfidentialTransaction::new(Bytes::from_static(b"early"))],
        &mut batch,
    );
    script.extend_from_slice(&encode(Frame::confirm()));
    script.extend_from_slice(&encode(Frame::transactions(0, batch.freeze())));
    remote.write_all(&script).await.unwrap();

    let reader = tokio::spawn(drain_frames(remote));
    let mut session = session.attest(&StaticTrustEngine::new()).await.unwrap();

    match session.recv().await.unwrap() {
        Message::Transactions(txs) => assert_eq!(txs[0].as_bytes(), b"early"),
        other => panic!("expected transactions, got {other:?}"),
    }
    drop(session);
    // Four phase messages and the confirmation.
    assert_eq!(reader.await.unwrap().len(), 5);
}
