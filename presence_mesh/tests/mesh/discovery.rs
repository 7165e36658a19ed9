use std::time::Duration;

use presence_mesh::session::memory::MemoryHub;
use presence_mesh::MeshError;
use tokio::time::sleep;
use uuid::Uuid;

use crate::helper::{assert_no_event, expect_connected_to, spawn_peer};

#[actix_rt::test]
async fn connect_to_self_is_a_noop() {
    let hub = MemoryHub::new();
    let mut a = spawn_peer(&hub).await;

    a.handle.connect(a.id).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_no_event(&mut a);
}

#[actix_rt::test]
async fn duplicate_connect_creates_exactly_one_link() {
    let hub = MemoryHub::new();
    let mut a = spawn_peer(&hub).await;
    let mut b = spawn_peer(&hub).await;

    let (first, second) = tokio::join!(a.handle.connect(b.id), a.handle.connect(b.id));
    first.unwrap();
    second.unwrap();

    expect_connected_to(&mut a, b.id).await;
    expect_connected_to(&mut b, a.id).await;
    sleep(Duration::from_millis(100)).await;
    assert_no_event(&mut a);
    assert_no_event(&mut b);
}

#[actix_rt::test]
async fn discovery_converges_to_a_full_mesh() {
    let hub = MemoryHub::new();
    let mut a = spawn_peer(&hub).await;
    let mut b = spawn_peer(&hub).await;
    let mut c = spawn_peer(&hub).await;

    b.handle.connect(c.id).await.unwrap();
    expect_connected_to(&mut b, c.id).await;
    expect_connected_to(&mut c, b.id).await;

    // Connecting to B alone is enough: B's announcement of C makes A dial C
    // on its own.
    a.handle.connect(b.id).await.unwrap();
    expect_connected_to(&mut a, b.id).await;
    expect_connected_to(&mut a, c.id).await;
    expect_connected_to(&mut b, a.id).await;
    expect_connected_to(&mut c, a.id).await;

    // Converged: further announcements must not create duplicate links.
    sleep(Duration::from_millis(200)).await;
    assert_no_event(&mut a);
    assert_no_event(&mut b);
    assert_no_event(&mut c);
}

#[actix_rt::test]
async fn negotiation_failure_rejects_only_the_caller() {
    let hub = MemoryHub::new();
    let mut a = spawn_peer(&hub).await;

    let ghost = Uuid::new_v4();
    let err = a.handle.connect(ghost).await.unwrap_err();
    assert!(matches!(err, MeshError::NegotiationFailed { id } if id == ghost));

    // A link that never reached open fires no disconnect.
    sleep(Duration::from_millis(100)).await;
    assert_no_event(&mut a);

    // The failed attempt leaves no stale link behind.
    let mut b = spawn_peer(&hub).await;
    a.handle.connect(b.id).await.unwrap();
    expect_connected_to(&mut a, b.id).await;
    expect_connected_to(&mut b, a.id).await;
}
