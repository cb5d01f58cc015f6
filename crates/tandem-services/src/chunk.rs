//! Fragmentation and reassembly of oversized payloads.
//!
//! The sender slices a payload into fragments that each carry the full
//! header, stamped with a shared message id, their index and the total
//! count. The receiver buffers fragments per `(message_id, sender)` and
//! emits the merged packet once every index has arrived, in index order
//! regardless of arrival order.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::time::Instant;

use tandem_core::PacketInfo;

type ReassemblyKey = (u32, SocketAddr);

struct Reassembly {
    chunk_length: u32,
    fragments: BTreeMap<u32, PacketInfo>,
    started_at: Instant,
}

impl Reassembly {
    fn new(chunk_length: u32) -> Self {
        Self {
            chunk_length,
            fragments: BTreeMap::new(),
            started_at: Instant::now(),
        }
    }
}

pub struct ChunkManager {
    next_message_id: AtomicU32,
    buffers: DashMap<ReassemblyKey, Reassembly>,
    ttl: Duration,
}

impl ChunkManager {
    /// Message ids start at a random value so that two origins relayed over
    /// the same connection are unlikely to collide.
    pub fn new(ttl: Duration) -> Self {
        Self::starting_at(ttl, rand::random())
    }

    pub fn starting_at(ttl: Duration, first_message_id: u32) -> Self {
        Self {
            next_message_id: AtomicU32::new(first_message_id),
            buffers: DashMap::new(),
            ttl,
        }
    }

    /// Split `info` into encoded fragments of at most `max_payload` payload
    /// bytes each, in index order. An empty payload yields one fragment.
    pub fn chunk(&self, info: &PacketInfo, max_payload: usize) -> Vec<Bytes> {
        let max_payload = max_payload.max(1);
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);

        let pieces: Vec<Bytes> = if info.payload.is_empty() {
            vec![Bytes::new()]
        } else {
            (0..info.payload.len())
                .step_by(max_payload)
                .map(|start| {
                    let end = (start + max_payload).min(info.payload.len());
                    info.payload.slice(start..end)
                })
                .collect()
        };

        let chunk_length = pieces.len() as u32;
        pieces
            .into_iter()
            .enumerate()
            .map(|(index, payload)| {
                let fragment = PacketInfo {
                    message_id,
                    chunk_num: index as u32,
                    chunk_length,
                    payload,
                    ..info.clone()
                };
                fragment.encode()
            })
            .collect()
    }

    /// Buffer one fragment received from `sender`.
    ///
    /// Returns the merged packet (with `chunk_num = 0, chunk_length = 1`) when
    /// this fragment completes its message, otherwise `None`. Malformed
    /// fragments are logged and dropped without touching other buffers.
    pub fn add_chunk(&self, sender: SocketAddr, raw: &[u8]) -> Option<PacketInfo> {
        let info = match PacketInfo::decode(raw) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(
                    %sender,
                    error = %e,
                    prefix = hex::encode(&raw[..raw.len().min(8)]),
                    "malformed fragment, dropping"
                );
                return None;
            }
        };
        self.add_packet(sender, info)
    }

    /// Same as [`ChunkManager::add_chunk`] for an already decoded fragment.
    pub fn add_packet(&self, sender: SocketAddr, info: PacketInfo) -> Option<PacketInfo> {
        if info.chunk_length == 0 || info.chunk_num >= info.chunk_length {
            tracing::warn!(
                %sender,
                chunk_num = info.chunk_num,
                chunk_length = info.chunk_length,
                "fragment index out of range, dropping"
            );
            return None;
        }

        if !info.is_fragmented() {
            return Some(info);
        }

        self.evict_stale();

        let key = (info.message_id, sender);
        let chunk_length = info.chunk_length;
        let complete = {
            let mut entry = self
                .buffers
                .entry(key)
                .or_insert_with(|| Reassembly::new(chunk_length));
            if entry.chunk_length != chunk_length {
                tracing::warn!(
                    %sender,
                    message_id = info.message_id,
                    expected = entry.chunk_length,
                    got = chunk_length,
                    "fragment count changed mid-message, restarting reassembly"
                );
                *entry = Reassembly::new(chunk_length);
            }
            entry.fragments.insert(info.chunk_num, info);
            entry.fragments.len() == chunk_length as usize
        };

        if !complete {
            return None;
        }

        let (_, reassembly) = self.buffers.remove(&key)?;
        merge(reassembly)
    }

    /// Drop buffers whose first fragment is older than the TTL.
    pub fn evict_stale(&self) -> usize {
        let before = self.buffers.len();
        let ttl = self.ttl;
        self.buffers.retain(|_, r| r.started_at.elapsed() < ttl);
        let removed = before.saturating_sub(self.buffers.len());
        if removed > 0 {
            tracing::debug!(removed, "evicted incomplete reassembly buffers");
        }
        removed
    }

    /// Messages with at least one fragment buffered.
    pub fn in_flight(&self) -> usize {
        self.buffers.len()
    }
}

fn merge(reassembly: Reassembly) -> Option<PacketInfo> {
    // BTreeMap iteration is ordered by chunk_num.
    let mut fragments = reassembly.fragments.into_values();
    let first = fragments.next()?;
    let mut payload = BytesMut::from(&first.payload[..]);
    for fragment in fragments {
        payload.extend_from_slice(&fragment.payload);
    }
    Some(PacketInfo {
        chunk_num: 0,
        chunk_length: 1,
        payload: payload.freeze(),
        ..first
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use tandem_core::{ConnectionType, ModuleType, PacketType};

    const TTL: Duration = Duration::from_secs(30);

    fn sender(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn packet(payload: Vec<u8>) -> PacketInfo {
        PacketInfo::new(
            PacketType::Use,
            ModuleType::Chat,
            ConnectionType::Data,
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8001),
            Bytes::from(payload),
        )
        .with_priority(2)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn permutations(n: usize) -> Vec<Vec<usize>> {
        if n == 0 {
            return vec![vec![]];
        }
        let mut out = Vec::new();
        for perm in permutations(n - 1) {
            for pos in 0..=perm.len() {
                let mut p = perm.clone();
                p.insert(pos, n - 1);
                out.push(p);
            }
        }
        out
    }

    #[test]
    fn chunk_slices_into_ceil_pieces() {
        let manager = ChunkManager::starting_at(TTL, 7);
        let fragments = manager.chunk(&packet(payload(25)), 10);
        assert_eq!(fragments.len(), 3);

        for (i, raw) in fragments.iter().enumerate() {
            let info = PacketInfo::decode(raw).unwrap();
            assert_eq!(info.message_id, 7);
            assert_eq!(info.chunk_num, i as u32);
            assert_eq!(info.chunk_length, 3);
            assert_eq!(info.module, ModuleType::Chat);
            assert_eq!(info.priority, 2);
        }
        assert_eq!(PacketInfo::decode(&fragments[2]).unwrap().payload.len(), 5);
    }

    #[test]
    fn message_ids_increase_per_call() {
        let manager = ChunkManager::starting_at(TTL, u32::MAX);
        let a = PacketInfo::decode(&manager.chunk(&packet(payload(1)), 10)[0]).unwrap();
        let b = PacketInfo::decode(&manager.chunk(&packet(payload(1)), 10)[0]).unwrap();
        assert_eq!(a.message_id, u32::MAX);
        assert_eq!(b.message_id, 0, "message ids wrap around");
    }

    #[test]
    fn empty_payload_is_one_fragment() {
        let manager = ChunkManager::new(TTL);
        let fragments = manager.chunk(&packet(Vec::new()), 10);
        assert_eq!(fragments.len(), 1);
        let merged = manager.add_chunk(sender(1), &fragments[0]).unwrap();
        assert!(merged.payload.is_empty());
    }

    #[tokio::test]
    async fn single_fragment_completes_immediately() {
        let manager = ChunkManager::new(TTL);
        let original = packet(payload(10));
        let fragments = manager.chunk(&original, 100);
        assert_eq!(fragments.len(), 1);

        let merged = manager.add_chunk(sender(1), &fragments[0]).unwrap();
        assert_eq!(merged.payload, original.payload);
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn every_arrival_order_reassembles_exactly_once() {
        let original = packet(payload(40));
        for order in permutations(4) {
            let manager = ChunkManager::new(TTL);
            let fragments = manager.chunk(&original, 10);
            assert_eq!(fragments.len(), 4);

            let mut outputs = Vec::new();
            for (step, &index) in order.iter().enumerate() {
                let out = manager.add_chunk(sender(9), &fragments[index]);
                if step + 1 < order.len() {
                    assert!(out.is_none(), "no output before the last fragment");
                }
                outputs.extend(out);
            }

            assert_eq!(outputs.len(), 1);
            let merged = &outputs[0];
            assert_eq!(merged.payload, original.payload);
            assert_eq!(merged.chunk_num, 0);
            assert_eq!(merged.chunk_length, 1);
            assert_eq!(manager.in_flight(), 0);
        }
    }

    #[tokio::test]
    async fn shuffled_large_payload_reassembles() {
        let mut rng = StdRng::seed_from_u64(0x7A4D);
        for max_payload in [1usize, 7, 64, 999, 15_000] {
            let manager = ChunkManager::new(TTL);
            let original = packet(payload(5_000));
            let mut fragments = manager.chunk(&original, max_payload);
            fragments.shuffle(&mut rng);

            let merged: Vec<_> = fragments
                .iter()
                .filter_map(|f| manager.add_chunk(sender(2), f))
                .collect();
            assert_eq!(merged.len(), 1, "max_payload {max_payload}");
            assert_eq!(merged[0].payload, original.payload);
        }
    }

    #[tokio::test]
    async fn interleaved_messages_from_two_senders_stay_apart() {
        let manager = ChunkManager::starting_at(TTL, 1);
        let a = packet(vec![0xAA; 30]);
        let b = packet(vec![0xBB; 30]);
        let frags_a = manager.chunk(&a, 10);
        // Same message id from a different sender.
        let other = ChunkManager::starting_at(TTL, 1);
        let frags_b = other.chunk(&b, 10);

        let mut done = Vec::new();
        for i in 0..3 {
            done.extend(manager.add_chunk(sender(1), &frags_a[i]));
            done.extend(manager.add_chunk(sender(2), &frags_b[i]));
        }
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].payload, a.payload);
        assert_eq!(done[1].payload, b.payload);
    }

    #[tokio::test]
    async fn malformed_fragment_does_not_disturb_in_flight_messages() {
        let manager = ChunkManager::new(TTL);
        let original = packet(payload(20));
        let fragments = manager.chunk(&original, 10);

        assert!(manager.add_chunk(sender(1), &fragments[0]).is_none());
        assert!(manager.add_chunk(sender(1), &[1, 2, 3]).is_none());
        assert_eq!(manager.in_flight(), 1);

        let merged = manager.add_chunk(sender(1), &fragments[1]).unwrap();
        assert_eq!(merged.payload, original.payload);
    }

    #[tokio::test]
    async fn duplicate_fragment_does_not_complete_early() {
        let manager = ChunkManager::new(TTL);
        let fragments = manager.chunk(&packet(payload(30)), 10);
        assert!(manager.add_chunk(sender(1), &fragments[0]).is_none());
        assert!(manager.add_chunk(sender(1), &fragments[0]).is_none());
        assert!(manager.add_chunk(sender(1), &fragments[1]).is_none());
        assert!(manager.add_chunk(sender(1), &fragments[2]).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn incomplete_buffers_are_evicted_after_ttl() {
        let manager = ChunkManager::new(Duration::from_secs(5));
        let fragments = manager.chunk(&packet(payload(30)), 10);
        assert!(manager.add_chunk(sender(1), &fragments[0]).is_none());
        assert_eq!(manager.in_flight(), 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(manager.evict_stale(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(manager.evict_stale(), 1);
        assert_eq!(manager.in_flight(), 0);
    }

    #[test]
    fn out_of_range_index_is_dropped() {
        let manager = ChunkManager::new(TTL);
        let mut info = packet(payload(4));
        info.chunk_num = 3;
        info.chunk_length = 3;
        assert!(manager.add_chunk(sender(1), &info.encode()).is_none());
        assert_eq!(manager.in_flight(), 0);
    }
}
