use crate::*;

use tandem_net::NetError;

/// Client in cluster 1 to client in cluster 0: up to its server, over
/// the main server, down to the destination.
#[tokio::test]
async fn test_cross_cluster_send_is_relayed() {
    let overlay = Overlay::start(9).await.unwrap();
    let from = &overlay.nodes[8];
    let to = &overlay.nodes[7];
    let mut inbox = Inbox::subscribe(to, ModuleType::Chat);

    let report = from
        .send_data(Bytes::from_static(b"across"), &[to.local().clone()], ModuleType::Chat, 3)
        .await
        .unwrap();
    assert!(report.is_ok());

    assert_eq!(inbox.recv().await.unwrap(), Bytes::from_static(b"across"));
    overlay.close().await;
}

/// A payload three times the fragment size crosses two relays intact.
#[tokio::test]
async fn test_fragmented_payload_reassembles_after_relays() {
    let overlay = Overlay::start(10).await.unwrap();
    // nodes[9] is a client of cluster 2, nodes[8] a client of cluster 1.
    let from = &overlay.nodes[9];
    let to = &overlay.nodes[8];
    let mut inbox = Inbox::subscribe(to, ModuleType::ScreenSharing);

    let payload: Bytes = (0..40_000u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into();
    from.send_data(payload.clone(), &[to.local().clone()], ModuleType::ScreenSharing, 5)
        .await
        .unwrap();

    let received = inbox.recv().await.unwrap();
    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);
    assert!(inbox.is_quiet(Duration::from_millis(200)).await);

    overlay.close().await;
}

/// Every node but the sender gets exactly one copy.
#[tokio::test]
async fn test_broadcast_reaches_everyone_once() {
    let overlay = Overlay::start(9).await.unwrap();
    let sender = &overlay.nodes[8];

    let mut inboxes = vec![Inbox::subscribe(&overlay.main, ModuleType::Canvas)];
    for node in &overlay.nodes[..8] {
        inboxes.push(Inbox::subscribe(node, ModuleType::Canvas));
    }
    let mut own = Inbox::subscribe(sender, ModuleType::Canvas);

    let report = sender
        .broadcast(Bytes::from_static(b"stroke"), ModuleType::Canvas, 1)
        .await
        .unwrap();
    assert!(report.is_ok());

    for inbox in &mut inboxes {
        assert_eq!(inbox.recv().await.unwrap(), Bytes::from_static(b"stroke"));
    }
    for inbox in &mut inboxes {
        assert!(inbox.is_quiet(Duration::from_millis(200)).await, "duplicate broadcast");
    }
    assert!(own.is_quiet(Duration::from_millis(200)).await);

    overlay.close().await;
}

/// Coalesced records arrive separately, in order, at their own modules.
#[tokio::test]
async fn test_coalesced_records_are_split_on_arrival() {
    let overlay = Overlay::start(1).await.unwrap();
    let mut chat = Inbox::subscribe(&overlay.main, ModuleType::Chat);
    let mut ai = Inbox::subscribe(&overlay.main, ModuleType::Ai);
    let main = overlay.main.local().clone();
    let node = &overlay.nodes[0];

    node.send_coalesced(b"one", &main, ModuleType::Chat).await.unwrap();
    node.send_coalesced(b"prompt", &main, ModuleType::Ai).await.unwrap();
    node.send_coalesced(b"two", &main, ModuleType::Chat).await.unwrap();

    assert_eq!(chat.recv().await.unwrap(), Bytes::from_static(b"one"));
    assert_eq!(chat.recv().await.unwrap(), Bytes::from_static(b"two"));
    assert_eq!(ai.recv().await.unwrap(), Bytes::from_static(b"prompt"));

    overlay.close().await;
}

#[tokio::test]
async fn test_send_to_self_stays_local() {
    let main = start_main().await.unwrap();
    let mut inbox = Inbox::subscribe(&main, ModuleType::Controller);

    main.send_data(Bytes::from_static(b"me"), &[main.local().clone()], ModuleType::Controller, 0)
        .await
        .unwrap();
    assert_eq!(inbox.recv().await.unwrap(), Bytes::from_static(b"me"));
    assert_eq!(main.status().await.backlog, Default::default());

    main.close_networking().await;
}

/// One bad destination does not stop the others.
#[tokio::test]
async fn test_failures_are_reported_per_destination() {
    let overlay = Overlay::start(1).await.unwrap();
    let to = &overlay.nodes[0];
    let mut inbox = Inbox::subscribe(to, ModuleType::Cloud);
    let stranger = ClientNode::new(LOOPBACK, 9);

    let report = overlay
        .main
        .send_data(
            Bytes::from_static(b"sync"),
            &[stranger.clone(), to.local().clone()],
            ModuleType::Cloud,
            2,
        )
        .await
        .unwrap();

    assert_eq!(report.sent, vec![to.local().clone()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, stranger);
    assert!(matches!(report.failed[0].1, NetError::NoRoute(_)));
    assert_eq!(inbox.recv().await.unwrap(), Bytes::from_static(b"sync"));

    let err = overlay
        .main
        .send_data(Bytes::new(), &[to.local().clone()], ModuleType::Cloud, 8)
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::InvalidPriority(8)));

    overlay.close().await;
}

/// A second subscriber for a module is refused and the first keeps
/// receiving.
#[tokio::test]
async fn test_duplicate_subscription_keeps_first_listener() {
    let overlay = Overlay::start(1).await.unwrap();
    let node = &overlay.nodes[0];
    let mut first = Inbox::subscribe(node, ModuleType::UiUx);

    let ignored: Arc<dyn MessageListener> = Arc::new(|_: Bytes| panic!("second listener called"));
    assert!(!node.subscribe(ModuleType::UiUx, ignored));

    overlay
        .main
        .send_data(Bytes::from_static(b"click"), &[node.local().clone()], ModuleType::UiUx, 1)
        .await
        .unwrap();
    assert_eq!(first.recv().await.unwrap(), Bytes::from_static(b"click"));

    assert!(node.remove_subscription(ModuleType::UiUx));
    assert!(!node.remove_subscription(ModuleType::UiUx));

    overlay.close().await;
}
