use crate::*;

use tandem_services::Role;

/// A client that goes silent is evicted by its cluster server, and the
/// REMOVE reaches the rest of the overlay through the main server.
#[tokio::test]
async fn test_silent_client_is_removed_everywhere() {
    let mut overlay = Overlay::start(9).await.unwrap();
    // nodes[8] is a client of cluster 1; dropping it stops every task
    // without a goodbye.
    let gone = overlay.nodes.pop().unwrap();
    let gone_node = gone.local().clone();
    drop(gone);

    let (main, server, other) = (&overlay.main, &overlay.nodes[0], &overlay.nodes[4]);
    let g = &gone_node;
    let removed = eventually(Duration::from_secs(5), move || async move {
        !knows(main, g).await && !knows(server, g).await && !knows(other, g).await
    })
    .await;
    assert!(removed, "{gone_node} still in some view");
    assert_eq!(members(main).await, 9);

    overlay.close().await;
}

/// When a cluster server dies the main server promotes the next member,
/// which takes over the cluster-server role.
#[tokio::test]
async fn test_dead_cluster_server_is_replaced() {
    let mut overlay = Overlay::start(9).await.unwrap();
    let member = overlay.nodes.pop().unwrap(); // cluster 1
    let dead = overlay.nodes.remove(0); // leads cluster 1
    let dead_node = dead.local().clone();
    drop(dead);

    let (main, m) = (&overlay.main, &member);
    let promoted = eventually(Duration::from_secs(6), move || async move {
        m.role().await == Role::ClusterServer && main.structure().await.servers.get(1) == Some(m.local())
    })
    .await;
    assert!(promoted, "member was not promoted");
    assert!(!knows(main, &dead_node).await);
    assert!(!knows(&member, &dead_node).await);

    // The new server's heartbeats keep it in the overlay past the main
    // server's timeout.
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(knows(main, member.local()).await);
    assert_eq!(member.role().await, Role::ClusterServer);

    member.close_networking().await;
    overlay.close().await;
}

/// Heartbeats keep an idle overlay intact across several timeout periods.
#[tokio::test]
async fn test_idle_overlay_stays_intact() {
    let overlay = Overlay::start(9).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    assert_eq!(members(&overlay.main).await, 10);
    assert_eq!(members(&overlay.nodes[0]).await, 10);
    assert_eq!(members(&overlay.nodes[8]).await, 10);

    overlay.close().await;
}
