use std::time::Duration;

use presence_mesh::session::memory::MemoryHub;
use tokio::time::sleep;

use crate::helper::{
    assert_no_event, expect_connected_to, expect_disconnected, spawn_peer,
};

#[actix_rt::test]
async fn dormant_peer_is_evicted_exactly_once() {
    tokio::time::pause();
    let hub = MemoryHub::new();
    let mut a = spawn_peer(&hub).await;
    let silent = hub.register_silent();

    a.handle.connect(silent).await.unwrap();
    expect_connected_to(&mut a, silent).await;

    // The transport stays up but the peer never speaks; the heartbeat's
    // dormancy check reaps it.
    let gone = expect_disconnected(&mut a).await;
    assert_eq!(gone, silent);

    sleep(Duration::from_millis(500)).await;
    assert_no_event(&mut a);

    // Dead links are never revived; a fresh connect builds a new one.
    a.handle.connect(silent).await.unwrap();
    expect_connected_to(&mut a, silent).await;
}

#[actix_rt::test]
async fn heartbeats_keep_a_quiet_mesh_alive() {
    tokio::time::pause();
    let hub = MemoryHub::new();
    let mut a = spawn_peer(&hub).await;
    let mut b = spawn_peer(&hub).await;

    a.handle.connect(b.id).await.unwrap();
    expect_connected_to(&mut a, b.id).await;
    expect_connected_to(&mut b, a.id).await;

    // Neither side dispatches anything; periodic resyncs alone must keep
    // both links out of dormancy.
    sleep(Duration::from_secs(20)).await;
    assert_no_event(&mut a);
    assert_no_event(&mut b);
}
