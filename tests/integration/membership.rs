use crate::*;

use tandem_services::Role;

/// The first node to say HELLO opens cluster 1 and leads it.
#[tokio::test]
async fn test_first_joiner_leads_cluster_one() {
    let overlay = Overlay::start(1).await.unwrap();
    let node = &overlay.nodes[0];

    assert_eq!(node.cluster_index().await, Some(1));
    assert_eq!(node.role().await, Role::ClusterServer);
    assert_eq!(overlay.main.role().await, Role::MainServer);

    let structure = overlay.main.structure().await;
    assert_eq!(structure.servers, vec![overlay.main.local().clone(), node.local().clone()]);
    assert_eq!(structure.clusters[1], vec![node.local().clone()]);
    assert_eq!(node.structure().await, structure);

    overlay.close().await;
}

/// Seven joiners fill the cluster limit; the rest are spread round-robin.
#[tokio::test]
async fn test_clusters_fill_then_round_robin() {
    let overlay = Overlay::start(9).await.unwrap();
    let main = &overlay.main;

    let structure = main.structure().await;
    assert_eq!(structure.clusters.len(), 8);
    assert_eq!(structure.servers.len(), 8);

    for node in &overlay.nodes[..7] {
        assert_eq!(node.role().await, Role::ClusterServer, "{}", node.local());
    }
    assert_eq!(overlay.nodes[7].cluster_index().await, Some(0));
    assert_eq!(overlay.nodes[7].role().await, Role::Client);
    assert_eq!(overlay.nodes[8].cluster_index().await, Some(1));
    assert_eq!(overlay.nodes[8].role().await, Role::Client);

    // A late joiner learns everyone from its snapshot; earlier nodes learn
    // it through ADD, relayed by cluster servers to their members.
    let late = overlay.nodes[8].local();
    assert!(knows(&overlay.nodes[7], late).await);
    assert!(knows(&overlay.nodes[0], late).await);
    assert!(knows(&overlay.nodes[6], late).await);

    overlay.close().await;
}

/// A client started before its main server keeps saying HELLO until
/// someone answers.
#[tokio::test]
async fn test_join_retries_until_main_server_is_up() {
    // Reserve a port for the main server, then free it.
    let probe = tokio::net::TcpListener::bind((LOOPBACK, 0)).await.unwrap();
    let main_port = probe.local_addr().unwrap().port();
    drop(probe);
    let main_node = ClientNode::new(LOOPBACK, main_port);

    let early = Networking::add_user(ClientNode::new(LOOPBACK, 0), main_node.clone(), test_config())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(early.cluster_index().await, None);

    let main = Networking::add_user(main_node.clone(), main_node, test_config())
        .await
        .unwrap();
    let e = &early;
    assert!(eventually(SETTLE, move || async move { e.cluster_index().await == Some(1) }).await);

    early.close_networking().await;
    main.close_networking().await;
}
