use crate::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hermit_rejects_peers_it_did_not_require() -> Result<()> {
    let hermit = start_host(
        HostConfig {
            hermit: true,
            ..test_config()
        },
        None,
        &[Recorder::new("test", 1)],
    )
    .await?;
    let stranger = start_host(test_config(), None, &[Recorder::new("test", 1)]).await?;

    stranger.add_node(hermit.node());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(hermit.peer_count(), 0);
    assert_eq!(stranger.peer_count(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hermit_still_connects_to_required_peers() -> Result<()> {
    let hermit = start_host(
        HostConfig {
            hermit: true,
            ..test_config()
        },
        None,
        &[Recorder::new("test", 1)],
    )
    .await?;
    let friend = start_host(test_config(), None, &[Recorder::new("test", 1)]).await?;

    hermit.require_peer(friend.node());
    wait_for(Duration::from_secs(5), || hermit.peer_count() == 1 && friend.peer_count() == 1)
        .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peers_without_shared_capabilities_are_dropped() -> Result<()> {
    let cap_a = Recorder::new("alpha", 1);
    let cap_b = Recorder::new("beta", 1);
    let a = start_host(test_config(), None, &[cap_a.clone()]).await?;
    let b = start_host(test_config(), None, &[cap_b.clone()]).await?;

    a.require_peer(b.node());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(a.peer_count(), 0);
    assert_eq!(b.peer_count(), 0);
    assert!(cap_a.connected.lock().is_empty());
    assert!(cap_b.connected.lock().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inbound_sessions_are_capped() -> Result<()> {
    let busy = start_host(
        HostConfig {
            ideal_peers: 1,
            peer_stretch: 1,
            ..test_config()
        },
        None,
        &[Recorder::new("test", 1)],
    )
    .await?;
    let b = start_host(test_config(), None, &[Recorder::new("test", 1)]).await?;
    let c = start_host(test_config(), None, &[Recorder::new("test", 1)]).await?;

    b.add_node(busy.node());
    c.add_node(busy.node());
    wait_for(Duration::from_secs(5), || busy.peer_count() == 1).await?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(busy.peer_count(), 1);
    assert_eq!(b.peer_count() + c.peer_count(), 1);
    Ok(())
}
