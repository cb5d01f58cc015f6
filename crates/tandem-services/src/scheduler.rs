//! Priority scheduler: budgeted bands that decide transmission order.
//!
//! Bands and per-epoch budgets (defaults):
//!   Highest: priority 0, 50 tokens
//!   High: priority 1, 30 tokens
//!   Low: priority 2..7, 20 tokens shared by a 3-level feedback queue
//!
//! Each dequeue costs one token from its band. Budgets reset every epoch
//! (100 ms). Every rotation interval (1 s) the low levels shift down by one
//! and the old level 0 becomes the last level, packets intact. New low
//! packets always enter level 0.
//!
//! This is strict priority inside an epoch: low traffic only moves once the
//! higher bands are empty or out of tokens. The budgets bound how long that
//! can last, they do not make the scheduler fair.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use tandem_core::config::SchedulerConfig;
use tandem_core::wire::peek_priority;
use tandem_core::{ClientNode, WireError};

const LOW_LEVELS: usize = 3;

/// Which band a priority value lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Highest,
    High,
    Low,
}

impl Band {
    pub fn for_priority(priority: u8) -> Self {
        match priority {
            0 => Band::Highest,
            1 => Band::High,
            _ => Band::Low,
        }
    }
}

/// An encoded packet and the node it must be written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledPacket {
    pub next_hop: ClientNode,
    pub packet: Bytes,
}

/// Queue depths per band, for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Backlog {
    pub highest: usize,
    pub high: usize,
    pub low: usize,
}

#[derive(Debug, Clone, Copy)]
struct Budgets {
    highest: u32,
    high: u32,
    low: u32,
}

impl Budgets {
    fn slot(&mut self, band: Band) -> &mut u32 {
        match band {
            Band::Highest => &mut self.highest,
            Band::High => &mut self.high,
            Band::Low => &mut self.low,
        }
    }
}

struct State {
    highest: VecDeque<ScheduledPacket>,
    high: VecDeque<ScheduledPacket>,
    levels: [VecDeque<ScheduledPacket>; LOW_LEVELS],
    tokens: Budgets,
    epoch_start: Instant,
    rotation_start: Instant,
}

impl State {
    fn len(&self) -> usize {
        self.highest.len() + self.high.len() + self.levels.iter().map(VecDeque::len).sum::<usize>()
    }

    fn pop(&mut self, band: Band) -> Option<ScheduledPacket> {
        match band {
            Band::Highest => self.highest.pop_front(),
            Band::High => self.high.pop_front(),
            Band::Low => self.levels.iter_mut().find_map(VecDeque::pop_front),
        }
    }

    fn has(&self, band: Band) -> bool {
        match band {
            Band::Highest => !self.highest.is_empty(),
            Band::High => !self.high.is_empty(),
            Band::Low => self.levels.iter().any(|l| !l.is_empty()),
        }
    }
}

pub struct PriorityScheduler {
    state: Mutex<State>,
    budgets: Budgets,
    epoch: Duration,
    rotation: Duration,
    ready: Notify,
}

impl PriorityScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        let budgets = Budgets {
            highest: config.highest_budget,
            high: config.high_budget,
            low: config.low_budget,
        };
        let now = Instant::now();
        Self {
            state: Mutex::new(State {
                highest: VecDeque::new(),
                high: VecDeque::new(),
                levels: Default::default(),
                tokens: budgets,
                epoch_start: now,
                rotation_start: now,
            }),
            budgets,
            epoch: config.epoch(),
            rotation: config.rotation(),
            ready: Notify::new(),
        }
    }

    /// Queue an encoded packet. Its band comes from the header's priority bits.
    pub async fn add_packet(&self, next_hop: ClientNode, packet: Bytes) -> Result<(), WireError> {
        let band = Band::for_priority(peek_priority(&packet)?);
        let item = ScheduledPacket { next_hop, packet };
        {
            let mut state = self.state.lock().await;
            self.advance(&mut state, Instant::now());
            match band {
                Band::Highest => state.highest.push_back(item),
                Band::High => state.high.push_back(item),
                Band::Low => state.levels[0].push_back(item),
            }
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Highest-priority packet whose band still has budget this epoch.
    pub async fn next_packet(&self) -> Option<ScheduledPacket> {
        let mut state = self.state.lock().await;
        self.advance(&mut state, Instant::now());

        for band in [Band::Highest, Band::High, Band::Low] {
            if *state.tokens.slot(band) == 0 || !state.has(band) {
                continue;
            }
            *state.tokens.slot(band) -= 1;
            return state.pop(band);
        }
        None
    }

    /// Wait for the next packet that may be sent.
    ///
    /// Sleeps on a notification while empty. While everything queued is out
    /// of tokens it sleeps until the next budget reset, unless a new packet
    /// lands in a band that can still send.
    pub async fn ready(&self) -> ScheduledPacket {
        loop {
            let notified = self.ready.notified();
            if let Some(item) = self.next_packet().await {
                return item;
            }
            if self.is_empty().await {
                notified.await;
            } else {
                let reset = self.until_next_epoch().await;
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(reset) => {}
                }
            }
        }
    }

    /// Time left until budgets reset.
    pub async fn until_next_epoch(&self) -> Duration {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        self.advance(&mut state, now);
        (state.epoch_start + self.epoch).saturating_duration_since(now)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn backlog(&self) -> Backlog {
        let state = self.state.lock().await;
        Backlog {
            highest: state.highest.len(),
            high: state.high.len(),
            low: state.levels.iter().map(VecDeque::len).sum(),
        }
    }

    /// Apply any epoch resets and level rotations that are due at `now`.
    fn advance(&self, state: &mut State, now: Instant) {
        let since_epoch = now.saturating_duration_since(state.epoch_start);
        if since_epoch >= self.epoch {
            state.tokens = self.budgets;
            state.epoch_start = now - remainder(since_epoch, self.epoch);
        }

        let since_rotation = now.saturating_duration_since(state.rotation_start);
        if since_rotation >= self.rotation {
            let turns = (since_rotation.as_nanos() / self.rotation.as_nanos()) as usize;
            state.levels.rotate_left(turns % LOW_LEVELS);
            state.rotation_start = now - remainder(since_rotation, self.rotation);
            tracing::trace!(turns, "rotated low-priority levels");
        }
    }
}

fn remainder(elapsed: Duration, period: Duration) -> Duration {
    Duration::from_nanos((elapsed.as_nanos() % period.as_nanos()) as u64)
}
