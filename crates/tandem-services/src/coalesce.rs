//! Opportunistic batching of small payloads bound for the same node.
//!
//! A batch is a plain concatenation of records:
//!
//! ```text
//! size:u32 (big-endian, data length) | module:u8 | data[size]
//! ```
//!
//! A destination's batch is flushed as soon as its record bytes reach the
//! size threshold, or by [`CoalesceSend::check_timeout`] once its oldest
//! record has waited `max_latency`. Records keep their FIFO order inside a
//! batch.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use tokio::time::Instant;

use tandem_core::config::CoalesceConfig;
use tandem_core::{ClientNode, ModuleType};

use crate::dispatch::ModuleDispatcher;

/// Per-record overhead: 4-byte size plus 1-byte module id.
pub const RECORD_OVERHEAD: usize = 5;

/// A flushed batch ready to be wrapped in one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalescedPacket {
    pub destination: ClientNode,
    pub payload: Bytes,
}

struct Batch {
    buf: BytesMut,
    started_at: Instant,
}

// ── Send side ────────────────────────────────────────────────────────────────

pub struct CoalesceSend {
    batches: DashMap<ClientNode, Batch>,
    threshold: usize,
    max_latency: Duration,
}

impl CoalesceSend {
    pub fn new(config: &CoalesceConfig) -> Self {
        Self::with_limits(config.threshold_bytes, config.max_latency())
    }

    pub fn with_limits(threshold: usize, max_latency: Duration) -> Self {
        Self {
            batches: DashMap::new(),
            threshold,
            max_latency,
        }
    }

    /// Append one record to `destination`'s batch. Returns the whole batch
    /// if it has reached the size threshold.
    pub fn handle_packet(
        &self,
        data: &[u8],
        destination: &ClientNode,
        module: ModuleType,
    ) -> Option<CoalescedPacket> {
        let full = {
            let mut batch = self
                .batches
                .entry(destination.clone())
                .or_insert_with(|| Batch {
                    buf: BytesMut::new(),
                    started_at: Instant::now(),
                });
            batch.buf.put_u32(data.len() as u32);
            batch.buf.put_u8(module.into());
            batch.buf.put_slice(data);
            batch.buf.len() >= self.threshold
        };

        if !full {
            return None;
        }
        let flushed = self.take(destination);
        if let Some(ref p) = flushed {
            tracing::debug!(dest = %p.destination, bytes = p.payload.len(), "coalesced batch full, flushing");
        }
        flushed
    }

    /// Every batch whose oldest record is at least `max_latency` old.
    pub fn check_timeout(&self) -> Vec<CoalescedPacket> {
        let stale: Vec<ClientNode> = self
            .batches
            .iter()
            .filter(|b| b.started_at.elapsed() >= self.max_latency)
            .map(|b| b.key().clone())
            .collect();

        stale
            .iter()
            .filter_map(|dest| self.take(dest))
            .inspect(|p| {
                tracing::trace!(dest = %p.destination, bytes = p.payload.len(), "coalesced batch timed out, flushing")
            })
            .collect()
    }

    /// Drain every batch regardless of age. Used on shutdown.
    pub fn flush_all(&self) -> Vec<CoalescedPacket> {
        let keys: Vec<ClientNode> = self.batches.iter().map(|b| b.key().clone()).collect();
        keys.iter().filter_map(|dest| self.take(dest)).collect()
    }

    /// Destinations with a pending batch.
    pub fn pending(&self) -> usize {
        self.batches.len()
    }

    fn take(&self, destination: &ClientNode) -> Option<CoalescedPacket> {
        self.batches
            .remove(destination)
            .map(|(destination, batch)| CoalescedPacket {
                destination,
                payload: batch.buf.freeze(),
            })
    }
}

// ── Receive side ─────────────────────────────────────────────────────────────

/// Splits a received batch and hands each record to its module.
#[derive(Clone)]
pub struct CoalesceReceive {
    dispatcher: ModuleDispatcher,
}

impl CoalesceReceive {
    pub fn new(dispatcher: ModuleDispatcher) -> Self {
        Self { dispatcher }
    }

    /// Walk `buffer` and dispatch every complete record. Stops at the first
    /// truncated record. Returns the number of records dispatched.
    pub fn receive_coalesced_packet(&self, buffer: &Bytes) -> usize {
        let mut cursor = buffer.clone();
        let mut delivered = 0;

        while cursor.has_remaining() {
            if cursor.remaining() < RECORD_OVERHEAD {
                tracing::warn!(remaining = cursor.remaining(), "truncated coalesced record header");
                break;
            }
            let size = cursor.get_u32() as usize;
            let module_id = cursor.get_u8();
            if cursor.remaining() < size {
                tracing::warn!(size, remaining = cursor.remaining(), "truncated coalesced record");
                break;
            }
            let data = cursor.split_to(size);

            match ModuleType::try_from(module_id) {
                Ok(module) => {
                    if self.dispatcher.dispatch(module, data) {
                        delivered += 1;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "coalesced record for unknown module, skipping"),
            }
        }
        delivered
    }
}
