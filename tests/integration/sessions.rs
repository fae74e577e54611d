use crate::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn required_peer_is_connected_on_both_sides() -> Result<()> {
    let cap_a = Recorder::new("test", 2);
    let cap_b = Recorder::new("test", 2);
    let a = start_host(test_config(), None, &[cap_a.clone()]).await?;
    let b = start_host(test_config(), None, &[cap_b.clone(), Recorder::new("other", 1)]).await?;

    a.require_peer(b.node());
    wait_for(Duration::from_secs(5), || a.peer_count() == 1 && b.peer_count() == 1).await?;

    let seen_by_a = a.peers();
    assert_eq!(seen_by_a[0].id, b.id());
    assert_eq!(seen_by_a[0].listen_port, b.listen_port().unwrap_or_default());
    assert_eq!(seen_by_a[0].capabilities.len(), 1);
    assert_eq!(seen_by_a[0].capabilities[0].name, "test");
    assert_eq!(b.peers()[0].id, a.id());

    wait_for(Duration::from_secs(2), || {
        cap_a.connected.lock().len() == 1 && cap_b.connected.lock().len() == 1
    })
    .await?;
    assert_eq!(cap_a.connected.lock()[0], b.id());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_disconnect_is_reported_to_both_capabilities() -> Result<()> {
    let cap_a = Recorder::new("test", 1);
    let cap_b = Recorder::new("test", 1);
    let a = start_host(test_config(), None, &[cap_a.clone()]).await?;
    let b = start_host(test_config(), None, &[cap_b.clone()]).await?;

    a.add_node(b.node());
    wait_for(Duration::from_secs(5), || a.peer_count() == 1 && b.peer_count() == 1).await?;

    a.disconnect(&b.id(), DisconnectReason::ClientQuit);
    wait_for(Duration::from_secs(3), || a.peer_count() == 0 && b.peer_count() == 0).await?;
    wait_for(Duration::from_secs(2), || {
        cap_a.disconnected.lock().len() == 1 && cap_b.disconnected.lock().len() == 1
    })
    .await?;
    assert_eq!(cap_a.disconnected.lock()[0], (b.id(), DisconnectReason::ClientQuit));
    assert_eq!(cap_b.disconnected.lock()[0], (a.id(), DisconnectReason::ClientQuit));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopping_a_host_disconnects_its_peers() -> Result<()> {
    let cap_b = Recorder::new("test", 1);
    let mut a = start_host(test_config(), None, &[Recorder::new("test", 1)]).await?;
    let b = start_host(test_config(), None, &[cap_b.clone()]).await?;

    b.require_peer(a.node());
    wait_for(Duration::from_secs(5), || a.peer_count() == 1 && b.peer_count() == 1).await?;

    let a_id = a.id();
    a.stop().await;
    assert_eq!(a.peer_count(), 0);
    wait_for(Duration::from_secs(3), || b.peer_count() == 0).await?;
    wait_for(Duration::from_secs(2), || !cap_b.disconnected.lock().is_empty()).await?;
    assert_eq!(cap_b.disconnected.lock()[0], (a_id, DisconnectReason::ClientQuit));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn simultaneous_dials_leave_one_session() -> Result<()> {
    let a = start_host(test_config(), None, &[Recorder::new("test", 1)]).await?;
    let b = start_host(test_config(), None, &[Recorder::new("test", 1)]).await?;

    a.require_peer(b.node());
    b.require_peer(a.node());
    wait_for(Duration::from_secs(5), || a.peer_count() == 1 && b.peer_count() == 1).await?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.peer_count(), 1);
    assert_eq!(b.peer_count(), 1);
    Ok(())
}
