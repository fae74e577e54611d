use crate::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn saved_network_keeps_identity_and_required_peers() -> Result<()> {
    let b = start_host(test_config(), None, &[Recorder::new("test", 1)]).await?;
    let mut a = start_host(test_config(), None, &[Recorder::new("test", 1)]).await?;

    a.require_peer(b.node());
    wait_for(Duration::from_secs(5), || a.peer_count() == 1).await?;
    a.stop().await;
    wait_for(Duration::from_secs(3), || b.peer_count() == 0).await?;

    let blob = a.save_network()?;
    let a_id = a.id();

    let restored = Host::new(test_config(), Some(&blob));
    assert_eq!(restored.id(), a_id);
    assert!(restored.known_peers().iter().any(|n| n.id == b.id()));

    // The required peer is dialed again without being asked.
    let a2 = start_host(test_config(), Some(&blob), &[Recorder::new("test", 1)]).await?;
    assert_eq!(a2.id(), a_id);
    wait_for(Duration::from_secs(10), || a2.peer_count() == 1 && b.peer_count() == 1).await?;
    assert_eq!(b.peers()[0].id, a_id);
    Ok(())
}

#[tokio::test]
async fn corrupt_network_blob_yields_a_fresh_identity() -> Result<()> {
    let a = Host::new(test_config(), Some(&b"not a network"[..]));
    let b = Host::new(test_config(), Some(&b"not a network"[..]));
    assert_ne!(a.id(), b.id());
    assert!(a.known_peers().is_empty());
    Ok(())
}
