//! End-to-end protocol scenarios, driven over a real TCP socket against a
//! tempdir root, no mocking of the coordinator.

use durusd::client::{Client, Loaded};
use durusd::oid::Oid;
use durusd::server::Dispatcher;
use std::net::SocketAddr;
use std::path::PathBuf;

async fn spawn_server(root: PathBuf) -> SocketAddr {
    let dispatcher = Dispatcher::bind("127.0.0.1:0", root).await.unwrap();
    let addr = dispatcher.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = dispatcher.run().await;
    });
    addr
}

#[tokio::test]
async fn version_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(dir.path().to_path_buf()).await;
    // `Client::connect` performs the handshake internally and would have
    // returned a `VersionMismatch` error had the constant differed.
    Client::connect(&addr.to_string()).await.unwrap();
}

#[tokio::test]
async fn open_enumerate_close() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.durus"), b"").unwrap();
    std::fs::write(dir.path().join("b.durus"), b"").unwrap();
    let addr = spawn_server(dir.path().to_path_buf()).await;

    let mut client = Client::connect(&addr.to_string()).await.unwrap();

    let mut on_disk = client.enumerate_all().await.unwrap();
    on_disk.sort();
    assert_eq!(on_disk, vec!["a".to_string(), "b".to_string()]);
    assert!(client.enumerate_open().await.unwrap().is_empty());

    client.open("a").await.unwrap();
    assert_eq!(client.enumerate_open().await.unwrap(), vec!["a".to_string()]);

    client.close("a").await.unwrap();
    assert!(client.enumerate_open().await.unwrap().is_empty());
}

#[tokio::test]
async fn round_trip_store_load() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(dir.path().to_path_buf()).await;
    let mut client = Client::connect(&addr.to_string()).await.unwrap();
    client.open("a").await.unwrap();

    let oid = Oid::from_u64(1);
    client.stage("a", oid, b"hello".to_vec());
    client.commit("a", |_| Ok(())).await.unwrap();

    match client.load("a", oid).await.unwrap() {
        Loaded::Found(bytes) => assert_eq!(bytes, b"hello"),
        other => panic!("expected Found, got {other:?}"),
    }
}

#[tokio::test]
async fn cross_client_invalidation() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(dir.path().to_path_buf()).await;

    let mut c1 = Client::connect(&addr.to_string()).await.unwrap();
    let mut c2 = Client::connect(&addr.to_string()).await.unwrap();
    c1.open("a").await.unwrap();
    c2.open("a").await.unwrap();

    let oid = Oid::from_u64(2);

    // c2 must see INVALID for an oid it hasn't been told about yet, the
    // instant after c1 commits it but before c2 has synced.
    c1.stage("a", oid, b"x".to_vec());
    c1.commit("a", |_| Ok(())).await.unwrap();

    match c2.load("a", oid).await.unwrap() {
        Loaded::Invalid => {}
        other => panic!("expected Invalid before sync, got {other:?}"),
    }

    let invalidated = c2.sync("a").await.unwrap();
    assert!(invalidated.contains(&oid));

    match c2.load("a", oid).await.unwrap() {
        Loaded::Found(bytes) => assert_eq!(bytes, b"x"),
        other => panic!("expected Found after sync, got {other:?}"),
    }
}

#[tokio::test]
async fn unused_oid_protection_drops_the_offending_session() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(dir.path().to_path_buf()).await;

    let mut c1 = Client::connect(&addr.to_string()).await.unwrap();
    let mut c2 = Client::connect(&addr.to_string()).await.unwrap();
    c1.open("a").await.unwrap();
    c2.open("a").await.unwrap();

    let foreign_oid = c1.allocate("a").await.unwrap();

    // c2 tries to commit an oid that was handed to c1 and never used.
    c2.stage("a", foreign_oid, b"steal".to_vec());
    let result = c2.commit("a", |_| Ok(())).await;
    assert!(result.is_err(), "server must reject a foreign unused oid");

    // c1's own allocator keeps working afterward.
    let next = c1.allocate("a").await.unwrap();
    assert_ne!(next, foreign_oid);
}

#[tokio::test]
async fn destroy_while_open_is_silent_and_leaves_file_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(dir.path().to_path_buf()).await;

    let mut holder = Client::connect(&addr.to_string()).await.unwrap();
    holder.open("a").await.unwrap();

    let mut other = Client::connect(&addr.to_string()).await.unwrap();
    other.destroy("a").await.unwrap(); // silent no-op while open
    assert!(dir.path().join("a.durus").exists());

    holder.close("a").await.unwrap();
    other.destroy("a").await.unwrap();
    assert!(!dir.path().join("a.durus").exists());

    let on_disk = other.enumerate_all().await.unwrap();
    assert!(!on_disk.contains(&"a".to_string()));
}

#[tokio::test]
async fn new_oids_never_collide_with_an_invalid_set() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(dir.path().to_path_buf()).await;
    let mut client = Client::connect(&addr.to_string()).await.unwrap();
    client.open("a").await.unwrap();

    let mut seen = std::collections::HashSet::new();
    for _ in 0..255 {
        let oid = client.allocate("a").await.unwrap();
        assert!(seen.insert(oid), "allocator must never repeat an oid");
    }
}
