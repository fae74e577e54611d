use crate::*;

async fn burst_arrives_in_order(count: u32) -> Result<()> {
    let sender = Recorder::sending("test", 1, count);
    let receiver = Recorder::new("test", 1);
    let a = start_host(test_config(), None, &[sender]).await?;
    let b = start_host(test_config(), None, &[receiver.clone()]).await?;

    a.require_peer(b.node());
    wait_for(Duration::from_secs(10), || receiver.received_count() == count as usize).await?;

    let received = receiver.received.lock();
    for (i, (from, id, payload)) in received.iter().enumerate() {
        assert_eq!(*from, a.id());
        assert_eq!(*id, 0);
        assert_eq!(payload.as_slice(), (i as u32).to_be_bytes());
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_message_is_delivered() -> Result<()> {
    burst_arrives_in_order(1).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sixty_four_messages_arrive_in_order() -> Result<()> {
    burst_arrives_in_order(64).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn thousand_messages_arrive_in_order() -> Result<()> {
    burst_arrives_in_order(1000).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn capabilities_receive_only_their_own_messages() -> Result<()> {
    let alpha_out = Recorder::sending("alpha", 1, 3);
    let beta_out = Recorder::sending("beta", 1, 5);
    let alpha_in = Recorder::new("alpha", 1);
    let beta_in = Recorder::new("beta", 1);
    let a = start_host(test_config(), None, &[alpha_out, beta_out]).await?;
    let b = start_host(test_config(), None, &[alpha_in.clone(), beta_in.clone()]).await?;

    a.require_peer(b.node());
    wait_for(Duration::from_secs(5), || {
        alpha_in.received_count() == 3 && beta_in.received_count() == 5
    })
    .await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(alpha_in.received_count(), 3);
    assert_eq!(beta_in.received_count(), 5);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_messages_flow_both_ways_at_once() -> Result<()> {
    const COUNT: u32 = 300;
    const SIZE: usize = 32 * 1024;

    let left = Recorder::sending_sized("bulk", 1, COUNT, SIZE);
    let right = Recorder::sending_sized("bulk", 1, COUNT, SIZE);
    let a = start_host(test_config(), None, &[left.clone()]).await?;
    let b = start_host(test_config(), None, &[right.clone()]).await?;

    a.require_peer(b.node());
    wait_for(Duration::from_secs(30), || {
        left.received_count() == COUNT as usize && right.received_count() == COUNT as usize
    })
    .await?;

    for (rec, from) in [(&left, b.id()), (&right, a.id())] {
        let received = rec.received.lock();
        for (i, (peer, id, payload)) in received.iter().enumerate() {
            assert_eq!(*peer, from);
            assert_eq!(*id, 0);
            assert_eq!(*payload, numbered(i as u32, SIZE));
        }
    }
    assert_eq!(a.peers().len(), 1);
    assert_eq!(b.peers().len(), 1);
    Ok(())
}

/// Tries one payload too large for a frame, then a normal one.
struct Oversize {
    refused: Mutex<Option<CapabilityError>>,
}

impl Capability for Oversize {
    fn name(&self) -> &str {
        "test"
    }

    fn version(&self) -> u32 {
        1
    }

    fn message_count(&self) -> u16 {
        2
    }

    fn on_connect(&self, peer: &NodeId, host: &CapabilityHost) {
        if let Err(e) = host.send(peer, 0, vec![0u8; MAX_PAYLOAD_SIZE + 1]) {
            *self.refused.lock() = Some(e);
        }
        host.send(peer, 1, &b"after"[..]).unwrap();
    }

    fn interpret(&self, _: &NodeId, _: u16, _: &[u8], _: &CapabilityHost) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_send_is_refused_and_session_survives() -> Result<()> {
    let sender = Arc::new(Oversize {
        refused: Mutex::new(None),
    });
    let receiver = Recorder::new("test", 1);
    let mut a = Host::new(test_config(), None);
    a.register(sender.clone())?;
    a.start().await?;
    let b = start_host(test_config(), None, &[receiver.clone()]).await?;

    a.require_peer(b.node());
    wait_for(Duration::from_secs(5), || receiver.received_count() == 1).await?;

    assert!(matches!(
        *sender.refused.lock(),
        Some(CapabilityError::PayloadTooLarge { size, .. }) if size == MAX_PAYLOAD_SIZE + 1
    ));
    assert_eq!(receiver.received.lock()[0].2, b"after".to_vec());
    assert_eq!(b.peers().len(), 1);
    Ok(())
}
