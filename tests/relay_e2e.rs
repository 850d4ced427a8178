//! End-to-end flows through a relay listening on a real socket.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use common::{wait_for_state, Call, MockFactory, Script, TIMEOUT};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use voice_room::connection::LinkState;
use voice_room::coordinator::{Coordinator, Notice};
use voice_room::relay::{RoomActor, RoomHandle};
use voice_room::server;
use voice_room::signaling::{ClientMessage, RelayMessage, SignalingClient};

struct Relay {
    url: String,
    room: RoomHandle,
    cancel_token: CancellationToken,
}

impl Relay {
    async fn start() -> Self {
        let cancel_token = CancellationToken::new();
        let (room, _task) = RoomActor::spawn("abc-def".to_string(), cancel_token.child_token());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(server::serve(listener, room.clone(), cancel_token.clone()));
        Self {
            url,
            room,
            cancel_token,
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

struct Participant {
    signaling: SignalingClient,
    coordinator: Coordinator<MockFactory>,
    factory: Arc<MockFactory>,
    _notices: mpsc::UnboundedReceiver<Notice>,
    id: String,
}

impl Participant {
    async fn join(relay: &Relay, name: &str, script: Script) -> Self {
        let mut signaling = SignalingClient::connect(&relay.url).await.unwrap();
        let factory = Arc::new(MockFactory::new(script));
        let (notices_tx, notices) = mpsc::unbounded_channel();
        let mut coordinator =
            Coordinator::new(Arc::clone(&factory), signaling.outbox(), notices_tx);

        signaling
            .send(ClientMessage::Join {
                display_name: name.to_string(),
            })
            .unwrap();
        let joined = next(&mut signaling).await;
        assert!(matches!(joined, RelayMessage::JoinedSelf { .. }));
        coordinator.handle_relay_message(joined);
        let id = coordinator.identity().unwrap().connection_id.clone();

        Self {
            signaling,
            coordinator,
            factory,
            _notices: notices,
            id,
        }
    }

    /// Handles relay traffic until `done` matches a message.
    async fn pump_until(&mut self, done: impl Fn(&RelayMessage) -> bool) -> RelayMessage {
        loop {
            let message = next(&mut self.signaling).await;
            let matched = done(&message);
            self.coordinator.handle_relay_message(message.clone());
            if matched {
                return message;
            }
        }
    }
}

async fn next(signaling: &mut SignalingClient) -> RelayMessage {
    tokio::time::timeout(TIMEOUT, signaling.receive())
        .await
        .expect("timed out waiting for relay")
        .expect("relay connection closed")
}

#[tokio::test]
async fn test_first_joiner_active_and_second_sees_roster() {
    let relay = Relay::start().await;

    let mut alice_ws = SignalingClient::connect(&relay.url).await.unwrap();
    alice_ws
        .send(ClientMessage::Join {
            display_name: "alice".to_string(),
        })
        .unwrap();
    let alice_id = match next(&mut alice_ws).await {
        RelayMessage::JoinedSelf {
            participant,
            is_active_participant,
            roster,
        } => {
            assert!(is_active_participant);
            assert!(roster.is_empty());
            participant.connection_id
        }
        other => panic!("unexpected message: {other:?}"),
    };

    let mut bob_ws = SignalingClient::connect(&relay.url).await.unwrap();
    bob_ws
        .send(ClientMessage::Join {
            display_name: "bob".to_string(),
        })
        .unwrap();
    let bob_id = match next(&mut bob_ws).await {
        RelayMessage::JoinedSelf {
            participant,
            is_active_participant,
            roster,
        } => {
            assert!(!is_active_participant);
            assert_eq!(roster.len(), 1);
            assert_eq!(roster[0].participant.connection_id, alice_id);
            assert!(roster[0].is_active_participant);
            participant.connection_id
        }
        other => panic!("unexpected message: {other:?}"),
    };

    match next(&mut alice_ws).await {
        RelayMessage::ParticipantJoined {
            participant,
            is_active_participant,
        } => {
            assert_eq!(participant.connection_id, bob_id);
            assert!(!is_active_participant);
        }
        other => panic!("unexpected message: {other:?}"),
    }

    let snapshot = relay.room.snapshot().await.unwrap();
    let ids: Vec<_> = snapshot
        .participants
        .iter()
        .map(|p| p.participant.connection_id.clone())
        .collect();
    assert_eq!(ids, vec![alice_id, bob_id]);
    assert_eq!(snapshot.active_count(), 1);
    assert!(snapshot.participants[0].is_active_participant);
}

#[tokio::test]
async fn test_handshake_and_departure() {
    let relay = Relay::start().await;
    let script = Script {
        gathered: vec!["host-candidate".to_string()],
        ..Default::default()
    };

    let mut alice = Participant::join(&relay, "alice", script.clone()).await;
    let mut bob = Participant::join(&relay, "bob", script).await;

    // Alice sees Bob arrive and calls him.
    alice
        .pump_until(|m| matches!(m, RelayMessage::ParticipantJoined { .. }))
        .await;
    let alice_link = alice.coordinator.link_monitor(&bob.id).unwrap();
    wait_for_state(&alice_link, LinkState::OfferSent).await;

    // Bob receives the offer with Alice's identity and the blob untouched.
    let call = bob
        .pump_until(|m| matches!(m, RelayMessage::IncomingCall { .. }))
        .await;
    assert_eq!(
        call,
        RelayMessage::IncomingCall {
            caller_id: alice.id.clone(),
            caller_name: Some("alice".to_string()),
            offer: format!("offer-to-{}", bob.id),
        }
    );
    let bob_link = bob.coordinator.link_monitor(&alice.id).unwrap();
    wait_for_state(&bob_link, LinkState::AnswerSent).await;

    // Alice gets Bob's answer.
    let answer = alice
        .pump_until(|m| matches!(m, RelayMessage::IncomingAnswer { .. }))
        .await;
    assert_eq!(
        answer,
        RelayMessage::IncomingAnswer {
            responder_id: bob.id.clone(),
            answer: format!("answer-to-{}", alice.id),
        }
    );
    wait_for_state(&alice_link, LinkState::AnswerReceived).await;

    // Alice's gathered candidate reaches Bob's engine.
    bob.pump_until(|m| matches!(m, RelayMessage::RemoteCandidate { .. }))
        .await;
    let bob_engine = bob.factory.recorder(&alice.id).unwrap();
    tokio::time::timeout(TIMEOUT, async {
        while bob_engine.candidates().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("candidate never applied");
    assert_eq!(bob_engine.candidates(), vec!["host-candidate"]);

    // Bob drops off while Alice's link is still waiting for media.
    let bob_id = bob.id.clone();
    drop(bob);

    let left = alice
        .pump_until(|m| matches!(m, RelayMessage::ParticipantLeft { .. }))
        .await;
    assert_eq!(
        left,
        RelayMessage::ParticipantLeft {
            connection_id: bob_id.clone(),
        }
    );
    assert!(!alice.coordinator.has_link(&bob_id));
    wait_for_state(&alice_link, LinkState::Closed).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(
        alice.factory.recorder(&bob_id).unwrap().count(&Call::Close),
        1
    );

    let snapshot = relay.room.snapshot().await.unwrap();
    assert_eq!(snapshot.participants.len(), 1);
    assert_eq!(snapshot.participants[0].participant.connection_id, alice.id);
    assert!(snapshot.participants[0].is_active_participant);
}

#[tokio::test]
async fn test_malformed_frame_reported_and_connection_kept() {
    let relay = Relay::start().await;
    let (mut ws, _) = connect_async(&relay.url).await.unwrap();

    ws.send(Message::Text(r#"{"message_type":"teleport"}"#.to_string()))
        .await
        .unwrap();
    let reply = tokio::time::timeout(TIMEOUT, ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply = RelayMessage::decode(reply.to_text().unwrap()).unwrap();
    assert!(matches!(reply, RelayMessage::Error { .. }));

    ws.send(Message::Text(
        ClientMessage::Join {
            display_name: "alice".to_string(),
        }
        .encode()
        .unwrap(),
    ))
    .await
    .unwrap();
    let reply = tokio::time::timeout(TIMEOUT, ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply = RelayMessage::decode(reply.to_text().unwrap()).unwrap();
    assert!(matches!(reply, RelayMessage::JoinedSelf { .. }));
}

#[tokio::test]
async fn test_chat_reaches_everyone_else() {
    let relay = Relay::start().await;
    let mut alice = Participant::join(&relay, "alice", Script::default()).await;
    let mut bob = Participant::join(&relay, "bob", Script::default()).await;
    alice
        .pump_until(|m| matches!(m, RelayMessage::ParticipantJoined { .. }))
        .await;

    bob.signaling
        .send(ClientMessage::Chat {
            sender_display_name: "bob".to_string(),
            text: "can you hear me?".to_string(),
        })
        .unwrap();

    let chat = alice
        .pump_until(|m| matches!(m, RelayMessage::Chat { .. }))
        .await;
    assert_eq!(
        chat,
        RelayMessage::Chat {
            sender_display_name: "bob".to_string(),
            text: "can you hear me?".to_string(),
        }
    );
}
