use std::time::Duration;

use presence_mesh::session::webrtc::{RtcSessionConfigBuilder, WebRtcSession};
use presence_mesh::{Action, MeshConfig, MeshEvent, MeshManager};
use tokio::time::timeout;

use crate::helper::TestApp;

#[actix_web::test]
async fn mesh_over_webrtc_exchanges_state() {
    let app = TestApp::spawn().await;

    // Loopback host candidates are enough; no STUN required.
    let session = |app: &TestApp| {
        WebRtcSession::new(
            RtcSessionConfigBuilder::new()
                .host(&app.address)
                .port(app.port)
                .ice_servers(vec![])
                .build(),
        )
    };

    let mut alice = MeshManager::start(MeshConfig::default(), session(&app))
        .await
        .expect("alice failed to open a session");
    let mut bob = MeshManager::start(MeshConfig::default(), session(&app))
        .await
        .expect("bob failed to open a session");

    let bob_id = bob.local_id();
    let alice_handle = alice.handle();
    let mut alice_events = alice.events().unwrap();
    let mut bob_events = bob.events().unwrap();
    let _ = tokio::task::spawn_local(async move { alice.run().await });
    let _ = tokio::task::spawn_local(async move { bob.run().await });

    alice_handle
        .connect(bob_id)
        .await
        .expect("connect did not complete");

    let link = loop {
        match timeout(Duration::from_secs(15), bob_events.recv()).await {
            Ok(Some(MeshEvent::PeerConnected { link, .. })) => break link,
            Ok(Some(_)) => continue,
            other => panic!("bob never saw alice connect: {other:?}"),
        }
    };
    match timeout(Duration::from_secs(15), alice_events.recv()).await {
        Ok(Some(MeshEvent::PeerConnected { .. })) => {}
        other => panic!("alice never saw the link open: {other:?}"),
    }

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    link.attach(move |snapshot: &presence_mesh::ParticipantState| {
        let _ = seen_tx.send(snapshot.clone());
    });

    alice_handle
        .dispatch(Action::SetName("Ava".to_string()))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("bob never observed the name update");
        match timeout(remaining, seen_rx.recv()).await {
            Ok(Some(snapshot)) if snapshot.name == "Ava" => break,
            Ok(Some(_)) => continue,
            other => panic!("bob never observed the name update: {other:?}"),
        }
    }
}
