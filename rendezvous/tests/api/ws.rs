use awc::ws;
use futures_util::{SinkExt as _, StreamExt as _};
use presence_mesh::message::{ChannelKind, Envelope, SignalMessage};
use uuid::Uuid;

use crate::helper::TestApp;

type Socket = actix_codec::Framed<awc::BoxedSocket, ws::Codec>;

async fn connect(url: &str) -> Socket {
    let (_res, socket) = awc::Client::new()
        .ws(url)
        .connect()
        .await
        .expect("websocket connect failed");
    socket
}

async fn next_signal(socket: &mut Socket) -> SignalMessage {
    loop {
        match socket.next().await {
            Some(Ok(ws::Frame::Text(msg))) => {
                return serde_json::from_slice(&msg).expect("malformed signal")
            }
            Some(Ok(ws::Frame::Ping(msg))) => {
                socket.send(ws::Message::Pong(msg)).await.unwrap();
            }
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

#[actix_web::test]
async fn assigns_an_id_first() {
    let app = TestApp::spawn().await;
    let mut socket = connect(&app.ws_url()).await;

    assert!(matches!(next_signal(&mut socket).await, SignalMessage::Id(_)));
}

#[actix_web::test]
async fn honors_a_requested_id() {
    let app = TestApp::spawn().await;
    let requested = Uuid::new_v4();
    let mut socket = connect(&app.ws_url_with_id(requested)).await;

    match next_signal(&mut socket).await {
        SignalMessage::Id(id) => assert_eq!(id, requested),
        other => panic!("expected the requested id, got {other:?}"),
    }
}

#[actix_web::test]
async fn ping_pong() -> anyhow::Result<()> {
    let app = TestApp::spawn().await;
    let mut socket = connect(&app.ws_url()).await;

    let _ = socket.next().await; // ignore first message with Id

    socket
        .send(ws::Message::Ping(actix_web::web::Bytes::new()))
        .await?;

    let mut got_pong = false;
    if let Some(msg) = socket.next().await {
        if let Ok(ws::Frame::Pong(_)) = msg {
            got_pong = true;
        }
    }
    assert!(got_pong);
    Ok(())
}

#[actix_web::test]
async fn routes_envelopes_between_participants() {
    let app = TestApp::spawn().await;
    let mut alice = connect(&app.ws_url()).await;
    let mut bob = connect(&app.ws_url()).await;

    let SignalMessage::Id(alice_id) = next_signal(&mut alice).await else {
        panic!("no id for alice");
    };
    let SignalMessage::Id(bob_id) = next_signal(&mut bob).await else {
        panic!("no id for bob");
    };

    let envelope = Envelope {
        to: bob_id,
        content: SignalMessage::Offer {
            from: alice_id,
            kind: ChannelKind::Control,
            sdp: "v=0".to_string(),
        },
    };
    alice
        .send(ws::Message::Text(
            serde_json::to_string(&envelope).unwrap().into(),
        ))
        .await
        .unwrap();

    match next_signal(&mut bob).await {
        SignalMessage::Offer { from, kind, sdp } => {
            assert_eq!(from, alice_id);
            assert_eq!(kind, ChannelKind::Control);
            assert_eq!(sdp, "v=0");
        }
        other => panic!("expected the relayed offer, got {other:?}"),
    }
}

#[actix_web::test]
async fn signals_for_unknown_participants_are_dropped() {
    let app = TestApp::spawn().await;
    let mut alice = connect(&app.ws_url()).await;
    let SignalMessage::Id(alice_id) = next_signal(&mut alice).await else {
        panic!("no id for alice");
    };

    let envelope = Envelope {
        to: Uuid::new_v4(),
        content: SignalMessage::Offer {
            from: alice_id,
            kind: ChannelKind::Control,
            sdp: "v=0".to_string(),
        },
    };
    alice
        .send(ws::Message::Text(
            serde_json::to_string(&envelope).unwrap().into(),
        ))
        .await
        .unwrap();

    // The session must survive the drop: a ping still comes back.
    alice
        .send(ws::Message::Ping(actix_web::web::Bytes::new()))
        .await
        .unwrap();
    assert!(matches!(alice.next().await, Some(Ok(ws::Frame::Pong(_)))));
}

#[actix_web::test]
async fn refuses_a_taken_id() {
    let app = TestApp::spawn().await;
    let id = Uuid::new_v4();
    let mut first = connect(&app.ws_url_with_id(id)).await;
    assert!(matches!(
        next_signal(&mut first).await,
        SignalMessage::Id(assigned) if assigned == id
    ));

    let mut second = connect(&app.ws_url_with_id(id)).await;
    match second.next().await {
        None | Some(Ok(ws::Frame::Close(_))) => {}
        other => panic!("expected the duplicate session to be refused, got {other:?}"),
    }
}

#[actix_web::test]
async fn api_key_gates_the_session_endpoint() {
    let app = TestApp::spawn_with_key(Some("sesame")).await;

    let open_attempt = awc::Client::new().ws(app.ws_url()).connect().await;
    assert!(open_attempt.is_err());

    let (_res, mut socket) = awc::Client::new()
        .ws(app.ws_url())
        .basic_auth("participant", Some("sesame"))
        .connect()
        .await
        .expect("authorized connect failed");
    assert!(matches!(
        next_signal(&mut socket).await,
        SignalMessage::Id(_)
    ));
}
