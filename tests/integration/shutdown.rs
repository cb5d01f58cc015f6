use crate::*;

use tandem_services::Role;

/// A client that closes says goodbye; the overlay forgets it well before
/// any liveness timeout could.
#[tokio::test]
async fn test_graceful_leave_is_announced() {
    let mut overlay = Overlay::start(8).await.unwrap();
    let leaving = overlay.nodes.pop().unwrap(); // cluster 0 client
    let node = leaving.local().clone();

    leaving.close_networking().await;
    assert!(leaving.is_closed());
    leaving.close_networking().await;

    let (main, server, n) = (&overlay.main, &overlay.nodes[3], &node);
    let forgotten = eventually(Duration::from_millis(500), move || async move {
        !knows(main, n).await && !knows(server, n).await
    })
    .await;
    assert!(forgotten);

    overlay.close().await;
}

/// A cluster server that leaves hands its cluster to the next member.
#[tokio::test]
async fn test_leaving_cluster_server_hands_over() {
    let mut overlay = Overlay::start(9).await.unwrap();
    let member = overlay.nodes.pop().unwrap(); // cluster 1
    let server = overlay.nodes.remove(0);
    server.close_networking().await;

    let m = &member;
    let promoted = eventually(Duration::from_secs(1), move || async move {
        m.role().await == Role::ClusterServer
    })
    .await;
    assert!(promoted);

    member.close_networking().await;
    overlay.close().await;
}

/// Closing the main server closes the whole overlay.
#[tokio::test]
async fn test_main_server_close_reaches_every_node() {
    let overlay = Overlay::start(9).await.unwrap();
    overlay.main.close_networking().await;

    for node in &overlay.nodes {
        let closed = tokio::time::timeout(SETTLE, node.closed()).await;
        assert!(closed.is_ok(), "{} still running", node.local());
    }
}
