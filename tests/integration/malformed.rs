use crate::*;

use tandem_core::{ClusterNetworkRecord, ConnectionType, NetworkStructure, PacketInfo, PacketType};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

// ── Raw peer ─────────────────────────────────────────────────────────────────

/// A bare TCP connection to a node, speaking the frame format directly.
struct RawPeer {
    stream: TcpStream,
    target: ClientNode,
}

impl RawPeer {
    async fn connect(target: &Networking) -> Result<Self> {
        let stream = TcpStream::connect(target.local_addr()).await?;
        Ok(Self { stream, target: target.local().clone() })
    }

    async fn send_frame(&mut self, packet: &[u8]) -> Result<()> {
        let mut frame = (packet.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(packet);
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    async fn send(&mut self, module: ModuleType, connection_type: ConnectionType, payload: Bytes) -> Result<()> {
        let info = PacketInfo::new(
            PacketType::Use,
            module,
            connection_type,
            self.target.socket_addr()?,
            payload,
        );
        self.send_frame(&info.encode()).await
    }

    async fn chat(&mut self, text: &'static str) -> Result<()> {
        self.send(ModuleType::Chat, ConnectionType::Data, Bytes::from_static(text.as_bytes()))
            .await
    }

    /// Every kind of bad control payload, one after the other.
    async fn send_garbage(&mut self) -> Result<()> {
        let stranger = ClientNode::new(LOOPBACK, 1);

        // Two clusters but only one server.
        let lopsided = NetworkStructure {
            clusters: vec![vec![stranger.clone()], vec![self.target.clone()]],
            servers: vec![stranger.clone()],
        };
        self.send(ModuleType::Networking, ConnectionType::Network, lopsided.encode()?)
            .await?;

        // Server that is not a member of its cluster.
        let foreign = NetworkStructure {
            clusters: vec![vec![self.target.clone()]],
            servers: vec![stranger.clone()],
        };
        self.send(ModuleType::Networking, ConnectionType::Network, foreign.encode()?)
            .await?;

        let far = ClusterNetworkRecord::new(stranger.clone(), 99).encode()?;
        self.send(ModuleType::Networking, ConnectionType::Remove, far.clone())
            .await?;
        self.send(ModuleType::Networking, ConnectionType::Add, far.slice(..far.len() - 3))
            .await?;
        self.send(ModuleType::Networking, ConnectionType::Hello, Bytes::from_static(&[40]))
            .await?;

        // Shorter than a header.
        self.send_frame(&[0xff, 0x01, 0x02]).await
    }
}

async fn survives_garbage(overlay: &Overlay, target: &Networking) {
    let before = target.structure().await;
    let mut inbox = Inbox::subscribe(target, ModuleType::Chat);
    let mut peer = RawPeer::connect(target).await.unwrap();

    peer.chat("before").await.unwrap();
    assert_eq!(inbox.recv().await.unwrap(), Bytes::from_static(b"before"));

    peer.send_garbage().await.unwrap();
    peer.chat("after").await.unwrap();

    assert_eq!(inbox.recv().await.unwrap(), Bytes::from_static(b"after"));
    assert!(!target.is_closed());
    assert_eq!(target.structure().await, before);
    assert!(overlay.converged().await);
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_client_survives_malformed_control_packets() {
    let overlay = Overlay::start(8).await.unwrap();
    // The eighth joiner is a plain member of cluster 0.
    let client = &overlay.nodes[7];
    survives_garbage(&overlay, client).await;

    // Still a working member: traffic from the overlay gets through too.
    let mut inbox = Inbox::subscribe(client, ModuleType::Canvas);
    overlay.nodes[0]
        .send_data(Bytes::from_static(b"relayed"), &[client.local().clone()], ModuleType::Canvas, 3)
        .await
        .unwrap();
    assert_eq!(inbox.recv().await.unwrap(), Bytes::from_static(b"relayed"));

    overlay.close().await;
}

#[tokio::test]
async fn test_cluster_server_survives_malformed_control_packets() {
    let overlay = Overlay::start(2).await.unwrap();
    survives_garbage(&overlay, &overlay.nodes[0]).await;
    overlay.close().await;
}

#[tokio::test]
async fn test_main_server_survives_malformed_control_packets() {
    let overlay = Overlay::start(1).await.unwrap();
    survives_garbage(&overlay, &overlay.main).await;
    overlay.close().await;
}
