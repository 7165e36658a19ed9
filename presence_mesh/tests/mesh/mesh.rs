use std::time::Duration;

use presence_mesh::session::memory::MemoryHub;
use presence_mesh::{Action, Location, MediaHandle, MeshError};
use tokio::time::sleep;

use crate::helper::{
    assert_no_event, expect_connected_to, expect_disconnected, recording_observer, spawn_peer,
    wait_until,
};

#[actix_rt::test]
async fn dispatch_broadcasts_the_latest_location() {
    let hub = MemoryHub::new();
    let mut a = spawn_peer(&hub).await;
    let mut b = spawn_peer(&hub).await;
    let mut c = spawn_peer(&hub).await;

    a.handle.connect(b.id).await.unwrap();
    a.handle.connect(c.id).await.unwrap();
    expect_connected_to(&mut a, b.id).await;
    expect_connected_to(&mut a, c.id).await;
    let b_link = expect_connected_to(&mut b, a.id).await;
    let c_link = expect_connected_to(&mut c, a.id).await;

    let (b_seen, b_observer) = recording_observer();
    b_link.attach(b_observer);
    let (c_seen, c_observer) = recording_observer();
    c_link.attach(c_observer);

    a.handle
        .dispatch(Action::SetLocation(Location::new(1.0, 1.0)))
        .await
        .unwrap();
    let state = a
        .handle
        .dispatch(Action::SetLocation(Location::new(42.0, 7.0)))
        .await
        .unwrap();
    assert_eq!(state.location, Location::new(42.0, 7.0));

    let target = Location::new(42.0, 7.0);
    wait_until("both peers observe the latest location", || {
        b_seen.borrow().last().is_some_and(|s| s.location == target)
            && c_seen.borrow().last().is_some_and(|s| s.location == target)
    })
    .await;
}

#[actix_rt::test]
async fn name_round_trip_alters_nothing_else() {
    let hub = MemoryHub::new();
    let mut a = spawn_peer(&hub).await;
    let mut b = spawn_peer(&hub).await;

    a.handle.connect(b.id).await.unwrap();
    expect_connected_to(&mut a, b.id).await;
    let b_link = expect_connected_to(&mut b, a.id).await;

    let (seen, observer) = recording_observer();
    b_link.attach(observer);

    a.handle
        .dispatch(Action::SetName("Ava".to_string()))
        .await
        .unwrap();

    wait_until("the peer observes the name", || {
        seen.borrow().last().is_some_and(|s| s.name == "Ava")
    })
    .await;
    let last = seen.borrow().last().cloned().unwrap();
    assert_eq!(last.location, Location::default());
    assert_eq!(last.group, None);
    assert!(last.media.is_none());
}

#[actix_rt::test]
async fn media_handle_updates_stay_off_the_wire() {
    let hub = MemoryHub::new();
    let mut a = spawn_peer(&hub).await;
    let mut b = spawn_peer(&hub).await;

    // Connect first: a media handle set afterwards must never reach the peer.
    a.handle.connect(b.id).await.unwrap();
    expect_connected_to(&mut a, b.id).await;
    let b_link = expect_connected_to(&mut b, a.id).await;
    let (seen, observer) = recording_observer();
    b_link.attach(observer);

    a.handle
        .dispatch(Action::SetMedia(Some(MediaHandle::new("camera"))))
        .await
        .unwrap();
    a.handle
        .dispatch(Action::SetName("Ava".to_string()))
        .await
        .unwrap();

    wait_until("the peer observes the later name update", || {
        seen.borrow().last().is_some_and(|s| s.name == "Ava")
    })
    .await;
    assert!(
        seen.borrow().iter().all(|s| s.media.is_none()),
        "a media handle leaked onto the control channel"
    );
}

#[actix_rt::test]
async fn media_arrives_through_the_call_path() {
    let hub = MemoryHub::new();
    let mut a = spawn_peer(&hub).await;
    let mut b = spawn_peer(&hub).await;

    let a_media = MediaHandle::new("a-camera");
    let b_media = MediaHandle::new("b-camera");
    a.handle
        .dispatch(Action::SetMedia(Some(a_media.clone())))
        .await
        .unwrap();
    b.handle
        .dispatch(Action::SetMedia(Some(b_media.clone())))
        .await
        .unwrap();

    a.handle.connect(b.id).await.unwrap();
    let a_link = expect_connected_to(&mut a, b.id).await;
    let b_link = expect_connected_to(&mut b, a.id).await;

    let (a_seen, a_observer) = recording_observer();
    a_link.attach(a_observer);
    let (b_seen, b_observer) = recording_observer();
    b_link.attach(b_observer);

    wait_until("the callee observes the caller's media", || {
        b_seen
            .borrow()
            .last()
            .is_some_and(|s| s.media.as_ref().is_some_and(|m| m.same(&a_media)))
    })
    .await;
    wait_until("the caller observes the answered media", || {
        a_seen
            .borrow()
            .last()
            .is_some_and(|s| s.media.as_ref().is_some_and(|m| m.same(&b_media)))
    })
    .await;
}

#[actix_rt::test]
async fn attach_replays_the_current_snapshot() {
    let hub = MemoryHub::new();
    let mut a = spawn_peer(&hub).await;
    let mut b = spawn_peer(&hub).await;

    a.handle.connect(b.id).await.unwrap();
    expect_connected_to(&mut a, b.id).await;
    let b_link = expect_connected_to(&mut b, a.id).await;

    a.handle
        .dispatch(Action::SetName("Ava".to_string()))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    // A late subscriber starts from the latest cached snapshot.
    let (seen, observer) = recording_observer();
    b_link.attach(observer);
    wait_until("the replayed snapshot arrives", || !seen.borrow().is_empty()).await;
    assert_eq!(
        seen.borrow().first().map(|s| s.name.clone()).as_deref(),
        Some("Ava")
    );
}

#[actix_rt::test]
async fn malformed_frames_are_ignored() {
    use bytes::Bytes;
    use presence_mesh::Session as _;

    let hub = MemoryHub::new();
    let mut b = spawn_peer(&hub).await;

    // A hand-driven session standing in for a peer speaking garbage.
    let mut raw = hub.session();
    let raw_id = raw.open().await.unwrap();
    let channel = raw.dial(b.id).await.unwrap();
    let b_link = expect_connected_to(&mut b, raw_id).await;
    let (seen, observer) = recording_observer();
    b_link.attach(observer);

    assert!(channel.send(Bytes::from_static(b"not json")));
    assert!(channel.send(Bytes::from_static(br#"{"Name":"Ava"}"#)));

    wait_until("the valid frame still applies", || {
        seen.borrow().last().is_some_and(|s| s.name == "Ava")
    })
    .await;
    assert_no_event(&mut b);
}

#[actix_rt::test]
async fn stop_tears_down_links_and_rejects_later_calls() {
    let hub = MemoryHub::new();
    let mut a = spawn_peer(&hub).await;
    let mut b = spawn_peer(&hub).await;

    a.handle.connect(b.id).await.unwrap();
    expect_connected_to(&mut a, b.id).await;
    expect_connected_to(&mut b, a.id).await;

    a.handle.stop();
    let gone = expect_disconnected(&mut b).await;
    assert_eq!(gone, a.id);

    sleep(Duration::from_millis(100)).await;
    let err = a
        .handle
        .dispatch(Action::SetName("Ava".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Stopped));
}
