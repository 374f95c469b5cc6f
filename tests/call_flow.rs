//! Call-Flow Szenarien gegen Fake-Transport, Fake-Signaling und PCM-Codec

mod common;

use common::{wait_until, FakeTrack, FakeTransport, PcmCodec, RecordingSignaling, WAIT};
use parking_lot::Mutex;
use pulse_call::call_engine::{
    AudioFrame, CallError, CallEvent, CallSession, CallState, EncodedPacket, EnqueueOutcome,
    TransportEvent, TransportState,
};
use pulse_call::config::CallConfig;
use pulse_call::signaling::{CandidateDescriptor, SignalingError, SignalingMessage};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// HELPERS
// ============================================================================

struct Harness {
    session: CallSession,
    transport: Arc<FakeTransport>,
    signaling: Arc<RecordingSignaling>,
}

fn harness_with(config: CallConfig, codec: PcmCodec) -> Harness {
    let transport = FakeTransport::new();
    let signaling = Arc::new(RecordingSignaling::default());
    let session = CallSession::new(
        config,
        "local-party".to_string(),
        transport.clone(),
        signaling.clone(),
        Arc::new(codec),
    )
    .unwrap();
    Harness {
        session,
        transport,
        signaling,
    }
}

fn harness() -> Harness {
    harness_with(CallConfig::default(), PcmCodec::default())
}

async fn wait_for_state(session: &CallSession, state: CallState) {
    wait_until(|| session.state() == state).await;
}

fn candidate(value: &str) -> CandidateDescriptor {
    CandidateDescriptor {
        candidate: value.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

/// Ausgehender Call bis `Connected`
async fn connected_outgoing() -> (Harness, String) {
    let h = harness();
    let call_id = h.session.start_call().await.unwrap();
    h.session
        .deliver(SignalingMessage::answer(&call_id, "remote-party", "v=0 answer".to_string()))
        .await;
    wait_for_state(&h.session, CallState::Negotiating).await;
    h.transport
        .emit(TransportEvent::StateChanged(TransportState::Connected));
    wait_for_state(&h.session, CallState::Connected).await;
    (h, call_id)
}

fn pcm_packet(sequence: u16) -> EncodedPacket {
    let frame = AudioFrame::new(vec![sequence as i16; 960]);
    EncodedPacket::new(sequence, u32::from(sequence) * 960, frame.to_le_bytes())
}

// ============================================================================
// OUTGOING CALL
// ============================================================================

#[tokio::test]
async fn test_outgoing_call_state_sequence() {
    let h = harness();
    let mut events = h.session.subscribe();

    assert_eq!(h.session.state(), CallState::Idle);
    let call_id = h.session.start_call().await.unwrap();
    assert!(call_id.starts_with("call-"));
    assert_eq!(h.session.state(), CallState::AwaitingAnswer);

    // Vor Connected werden keine Frames angenommen
    assert_eq!(
        h.session.enqueue_outgoing(AudioFrame::silence(960)),
        EnqueueOutcome::Rejected
    );

    h.session
        .deliver(SignalingMessage::answer(&call_id, "remote-party", "v=0 answer".to_string()))
        .await;
    wait_for_state(&h.session, CallState::Negotiating).await;
    h.transport
        .emit(TransportEvent::StateChanged(TransportState::Connected));
    wait_for_state(&h.session, CallState::Connected).await;

    let states = tokio::time::timeout(WAIT, async {
        let mut states = Vec::new();
        while let Ok(event) = events.recv().await {
            if let CallEvent::StateChanged(state) = event {
                states.push(state);
                if state == CallState::Connected {
                    break;
                }
            }
        }
        states
    })
    .await
    .unwrap();
    assert_eq!(
        states,
        vec![
            CallState::Inviting,
            CallState::AwaitingAnswer,
            CallState::Negotiating,
            CallState::Connected
        ]
    );

    assert_eq!(h.signaling.count("m.call.invite"), 1);
    assert_eq!(*h.transport.remote_answers.lock(), vec!["v=0 answer"]);
    assert_eq!(
        h.session.identity().remote_party_id.as_deref(),
        Some("remote-party")
    );
}

#[tokio::test]
async fn test_invite_wire_content() {
    let h = harness();
    let call_id = h.session.start_call().await.unwrap();

    let sent = h.signaling.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        SignalingMessage::Invite(invite) => {
            assert_eq!(invite.call_id, call_id);
            assert_eq!(invite.party_id, "local-party");
            assert_eq!(invite.version, "1");
            assert_eq!(invite.lifetime, 60000);
            assert_eq!(invite.offer.kind, "offer");
            assert_eq!(invite.offer.sdp, "v=0 fake-offer");
        }
        other => panic!("expected invite, got {:?}", other),
    }
}

#[tokio::test]
async fn test_silent_frame_produces_one_write() {
    let (h, _) = connected_outgoing().await;

    assert_eq!(
        h.session.enqueue_outgoing(AudioFrame::silence(960)),
        EnqueueOutcome::Queued
    );
    wait_until(|| h.transport.writes.lock().len() == 1).await;

    let writes = h.transport.writes.lock();
    assert_eq!(writes[0].1, Duration::from_millis(20));
    assert_eq!(writes[0].0.len(), 960 * 2);
    drop(writes);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.transport.writes.lock().len(), 1);
    assert_eq!(h.session.stats().frames_sent, 1);
}

#[tokio::test]
async fn test_answer_with_other_call_id_is_ignored() {
    let h = harness();
    h.session.start_call().await.unwrap();

    h.session
        .deliver(SignalingMessage::answer("call-other", "remote-party", "v=0".to_string()))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.session.state(), CallState::AwaitingAnswer);
    assert!(h.transport.remote_answers.lock().is_empty());
}

#[tokio::test]
async fn test_answer_without_call_id_applies_to_current_call() {
    let h = harness();
    let call_id = h.session.start_call().await.unwrap();

    h.session
        .deliver(SignalingMessage::answer("", "remote-party", "v=0 answer".to_string()))
        .await;
    wait_for_state(&h.session, CallState::Negotiating).await;

    assert_eq!(*h.transport.remote_answers.lock(), vec!["v=0 answer"]);
    assert_eq!(h.session.call_id().as_deref(), Some(call_id.as_str()));
    assert_eq!(
        h.session.identity().remote_party_id.as_deref(),
        Some("remote-party")
    );
}

#[tokio::test]
async fn test_answer_during_invite_is_replayed() {
    let h = harness();
    let release = h.signaling.hold_next_send();

    let session = h.session.clone();
    let call = tokio::spawn(async move { session.start_call().await });
    wait_until(|| h.signaling.held.load(Ordering::SeqCst)).await;
    assert_eq!(h.session.state(), CallState::Inviting);

    let call_id = h.session.call_id().unwrap();
    h.session
        .deliver(SignalingMessage::answer(&call_id, "remote-party", "v=0 early".to_string()))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.session.state(), CallState::Inviting);
    assert!(h.transport.remote_answers.lock().is_empty());

    release.send(()).unwrap();
    assert_eq!(call.await.unwrap().unwrap(), call_id);

    wait_for_state(&h.session, CallState::Negotiating).await;
    assert_eq!(*h.transport.remote_answers.lock(), vec!["v=0 early"]);
    assert_eq!(h.signaling.count("m.call.invite"), 1);
}

#[tokio::test]
async fn test_offer_failure_ends_call() {
    let h = harness();
    h.transport.fail_offer.store(true, Ordering::SeqCst);

    let result = h.session.start_call().await;
    assert!(matches!(result, Err(CallError::Transport(_))));
    assert_eq!(h.session.state(), CallState::Ended);
    assert!(h.transport.closed.load(Ordering::SeqCst));
    assert_eq!(h.signaling.count("m.call.invite"), 0);
}

#[tokio::test]
async fn test_start_call_twice_is_rejected() {
    let h = harness();
    h.session.start_call().await.unwrap();

    assert!(matches!(
        h.session.start_call().await,
        Err(CallError::InvalidState {
            actual: CallState::AwaitingAnswer,
            ..
        })
    ));
    assert_eq!(h.signaling.count("m.call.invite"), 1);
}

#[tokio::test]
async fn test_failed_invite_ends_call() {
    let h = harness();
    h.signaling.fail.store(true, Ordering::SeqCst);

    let result = h.session.start_call().await;
    assert!(matches!(
        result,
        Err(CallError::Signaling(SignalingError::Http { status: 502, .. }))
    ));
    assert_eq!(h.session.state(), CallState::Ended);
    assert!(h.transport.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_invite_timeout_sends_hangup() {
    let config = CallConfig {
        invite_lifetime_ms: 50,
        ..CallConfig::default()
    };
    let h = harness_with(config, PcmCodec::default());
    let call_id = h.session.start_call().await.unwrap();

    wait_for_state(&h.session, CallState::Ended).await;

    match h.signaling.sent().last() {
        Some(SignalingMessage::Hangup(hangup)) => {
            assert_eq!(hangup.call_id, call_id);
            assert_eq!(hangup.reason.as_deref(), Some("invite_timeout"));
        }
        other => panic!("expected hangup, got {:?}", other),
    }
}

// ============================================================================
// CANDIDATES
// ============================================================================

#[tokio::test]
async fn test_remote_candidates_buffered_until_answer() {
    let h = harness();
    let call_id = h.session.start_call().await.unwrap();

    h.session
        .deliver(SignalingMessage::candidates(
            &call_id,
            "remote-party",
            vec![candidate("candidate:1 1 udp 1 10.0.0.1 5000 typ host"), candidate("")],
        ))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.transport.remote_candidates.lock().is_empty());

    h.session
        .deliver(SignalingMessage::answer(&call_id, "remote-party", "v=0".to_string()))
        .await;
    wait_until(|| h.transport.remote_candidates.lock().len() == 1).await;
    assert_eq!(h.session.state(), CallState::Negotiating);

    // Nach der Answer direkt anwenden
    h.session
        .deliver(SignalingMessage::candidates(
            &call_id,
            "remote-party",
            vec![candidate("candidate:2 1 udp 1 10.0.0.2 5000 typ host")],
        ))
        .await;
    wait_until(|| h.transport.remote_candidates.lock().len() == 2).await;
}

#[tokio::test]
async fn test_candidates_for_other_call_ignored_once_remote_known() {
    let (h, _) = connected_outgoing().await;

    h.session
        .deliver(SignalingMessage::candidates(
            "call-other",
            "someone-else",
            vec![candidate("candidate:9 1 udp 1 10.0.0.9 5000 typ host")],
        ))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.transport.remote_candidates.lock().is_empty());
}

#[tokio::test]
async fn test_local_candidate_sent_individually() {
    let h = harness();
    let call_id = h.session.start_call().await.unwrap();

    h.transport.emit(TransportEvent::LocalCandidate(candidate(
        "candidate:3 1 udp 1 192.168.1.2 6000 typ host",
    )));
    wait_until(|| h.signaling.count("m.call.candidates") == 1).await;

    match h.signaling.sent().last() {
        Some(SignalingMessage::Candidates(content)) => {
            assert_eq!(content.call_id, call_id);
            assert_eq!(content.party_id, "local-party");
            assert_eq!(content.candidates.len(), 1);
        }
        other => panic!("expected candidates, got {:?}", other),
    }
}

// ============================================================================
// INCOMING CALL
// ============================================================================

#[tokio::test]
async fn test_incoming_call_accept_flow() {
    let h = harness();
    let mut events = h.session.subscribe();

    h.session
        .deliver(SignalingMessage::invite(
            "call-remote",
            "caller-party",
            60000,
            "v=0 remote-offer".to_string(),
        ))
        .await;
    wait_for_state(&h.session, CallState::InviteReceived).await;

    let incoming = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(CallEvent::IncomingCall { call_id }) = events.recv().await {
                return call_id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(incoming, "call-remote");

    h.session.accept().await.unwrap();
    assert_eq!(h.session.state(), CallState::Negotiating);
    assert_eq!(*h.transport.answered_offers.lock(), vec!["v=0 remote-offer"]);

    match h.signaling.sent().as_slice() {
        [SignalingMessage::Answer(answer)] => {
            assert_eq!(answer.call_id, "call-remote");
            assert_eq!(answer.party_id, "local-party");
            assert_eq!(answer.answer.sdp, "v=0 fake-answer");
        }
        other => panic!("expected exactly one answer, got {:?}", other),
    }

    h.transport
        .emit(TransportEvent::StateChanged(TransportState::Connected));
    wait_for_state(&h.session, CallState::Connected).await;
}

async fn invite_received(h: &Harness) {
    h.session
        .deliver(SignalingMessage::invite(
            "call-remote",
            "caller-party",
            60000,
            "v=0 remote-offer".to_string(),
        ))
        .await;
    wait_for_state(&h.session, CallState::InviteReceived).await;
}

#[tokio::test]
async fn test_candidates_before_accept_are_flushed() {
    let h = harness();
    invite_received(&h).await;

    h.session
        .deliver(SignalingMessage::candidates(
            "call-remote",
            "caller-party",
            vec![candidate("candidate:4 1 udp 1 10.0.0.4 5000 typ host")],
        ))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.transport.remote_candidates.lock().is_empty());
    assert_eq!(h.session.state(), CallState::InviteReceived);

    h.session.accept().await.unwrap();
    assert_eq!(h.transport.remote_candidates.lock().len(), 1);
    assert_eq!(
        h.transport.remote_candidates.lock()[0].candidate,
        "candidate:4 1 udp 1 10.0.0.4 5000 typ host"
    );
}

#[tokio::test]
async fn test_candidates_while_answer_in_flight_are_flushed() {
    let h = harness();
    invite_received(&h).await;
    let release = h.signaling.hold_next_send();

    let session = h.session.clone();
    let accept = tokio::spawn(async move { session.accept().await });
    wait_until(|| h.signaling.held.load(Ordering::SeqCst)).await;

    h.session
        .deliver(SignalingMessage::candidates(
            "",
            "caller-party",
            vec![candidate("candidate:5 1 udp 1 10.0.0.5 5000 typ host")],
        ))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.transport.remote_candidates.lock().is_empty());

    release.send(()).unwrap();
    accept.await.unwrap().unwrap();
    wait_until(|| h.transport.remote_candidates.lock().len() == 1).await;
}

#[tokio::test]
async fn test_transport_connected_before_answer_sent() {
    let h = harness();
    invite_received(&h).await;
    let release = h.signaling.hold_next_send();

    let session = h.session.clone();
    let accept = tokio::spawn(async move { session.accept().await });
    wait_until(|| h.signaling.held.load(Ordering::SeqCst)).await;

    h.transport
        .emit(TransportEvent::StateChanged(TransportState::Connected));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.session.state(), CallState::InviteReceived);

    release.send(()).unwrap();
    accept.await.unwrap().unwrap();
    assert_eq!(h.session.state(), CallState::Connected);

    assert_eq!(
        h.session.enqueue_outgoing(AudioFrame::silence(960)),
        EnqueueOutcome::Queued
    );
    wait_until(|| h.transport.writes.lock().len() == 1).await;
}

#[tokio::test]
async fn test_accept_without_invite_is_invalid() {
    let h = harness();
    assert!(matches!(
        h.session.accept().await,
        Err(CallError::InvalidState {
            actual: CallState::Idle,
            ..
        })
    ));
}

// ============================================================================
// RECEIVE PIPELINE
// ============================================================================

#[tokio::test]
async fn test_inbound_track_reordered_and_decoded() {
    let (h, _) = connected_outgoing().await;

    let (tx, rx) = mpsc::unbounded_channel();
    let track = FakeTrack::new(rx);
    h.transport.emit(TransportEvent::IncomingTrack(track));

    for seq in [1u16, 2, 4, 3] {
        tx.send(pcm_packet(seq)).unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..4 {
        let frame = tokio::time::timeout(WAIT, h.session.dequeue_incoming())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.len(), 960);
        received.push(frame.samples()[0]);
    }
    assert_eq!(received, vec![1, 2, 3, 4]);
    assert_eq!(h.session.stats().frames_decoded, 4);
}

// ============================================================================
// TEARDOWN
// ============================================================================

#[tokio::test]
async fn test_transport_failure_ends_call() {
    let (h, _) = connected_outgoing().await;

    h.transport
        .emit(TransportEvent::StateChanged(TransportState::Failed));
    wait_for_state(&h.session, CallState::Ended).await;

    assert!(TransportState::Failed.is_terminal());
    assert!(h.transport.closed.load(Ordering::SeqCst));
    assert_eq!(h.session.dequeue_incoming().await, None);
    assert_eq!(
        h.session.enqueue_outgoing(AudioFrame::silence(960)),
        EnqueueOutcome::Rejected
    );
}

#[tokio::test]
async fn test_transport_disconnect_is_transient() {
    let (h, _) = connected_outgoing().await;

    h.transport
        .emit(TransportEvent::StateChanged(TransportState::Disconnected));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.session.state(), CallState::Connected);
}

#[tokio::test]
async fn test_local_hangup() {
    let (h, call_id) = connected_outgoing().await;

    h.session.hangup(Some("user_hangup".to_string())).await.unwrap();
    assert_eq!(h.session.state(), CallState::Ended);

    match h.signaling.sent().last() {
        Some(SignalingMessage::Hangup(hangup)) => {
            assert_eq!(hangup.call_id, call_id);
            assert_eq!(hangup.reason.as_deref(), Some("user_hangup"));
        }
        other => panic!("expected hangup, got {:?}", other),
    }

    assert!(matches!(
        h.session.hangup(None).await,
        Err(CallError::NoActiveCall)
    ));
}

#[tokio::test]
async fn test_remote_hangup_for_current_call() {
    let (h, call_id) = connected_outgoing().await;

    h.session
        .deliver(SignalingMessage::hangup("call-other", "remote-party", None))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.session.state(), CallState::Connected);

    h.session
        .deliver(SignalingMessage::hangup(&call_id, "remote-party", None))
        .await;
    wait_for_state(&h.session, CallState::Ended).await;
    assert_eq!(h.signaling.count("m.call.hangup"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_end_during_encode_discards_frame() {
    let (started_tx, started_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let codec = PcmCodec {
        gate: Mutex::new(Some((started_tx, release_rx))),
    };
    let h = harness_with(CallConfig::default(), codec);

    let call_id = h.session.start_call().await.unwrap();
    h.session
        .deliver(SignalingMessage::answer(&call_id, "remote-party", "v=0".to_string()))
        .await;
    wait_for_state(&h.session, CallState::Negotiating).await;
    h.transport
        .emit(TransportEvent::StateChanged(TransportState::Connected));
    wait_for_state(&h.session, CallState::Connected).await;

    assert_eq!(
        h.session.enqueue_outgoing(AudioFrame::silence(960)),
        EnqueueOutcome::Queued
    );
    tokio::task::spawn_blocking(move || started_rx.recv_timeout(WAIT))
        .await
        .unwrap()
        .unwrap();

    h.session.hangup(None).await.unwrap();
    release_tx.send(()).unwrap();

    assert_eq!(h.session.dequeue_incoming().await, None);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.transport.writes.lock().is_empty());
    assert_eq!(h.session.state(), CallState::Ended);
}
