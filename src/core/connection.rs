//! Per-channel dispatch state.

use std::collections::VecDeque;
use std::sync::Arc;

use bitflags::bitflags;

use crate::core::channel::InputChannel;
use crate::core::input_state::InputState;
use crate::core::store::EventId;
use crate::util::time::{Nsecs, NANOS_PER_MILLI, NEVER};

bitflags! {
    /// How an event is to be delivered to one target.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TargetFlags: u32 {
        /// Hold back later events on this connection until this one
        /// finishes or is preempted.
        const SYNC = 0x01;
        /// Deliver a pointer down that landed elsewhere as an OUTSIDE
        /// action.
        const OUTSIDE = 0x02;
        /// Deliver as a cancellation.
        const CANCEL = 0x04;
        /// The target window is covered by another visible window.
        const WINDOW_IS_OBSCURED = 0x08;
    }
}

/// Progress of one event toward one connection.
#[derive(Debug)]
pub struct DispatchEntry {
    pub event: EventId,
    pub target_flags: TargetFlags,
    /// Added to motion coordinates at publish time (ignored for keys).
    pub x_offset: f32,
    pub y_offset: f32,
    /// Per-target delivery deadline, or < 0 to wait indefinitely.
    pub timeout: Nsecs,
    pub in_progress: bool,
    /// Sample index to resume publishing from; None means the start of the
    /// event's sample list.
    pub head_sample: Option<usize>,
    /// First sample that did not fit the buffer this cycle.  The next cycle
    /// restarts from here.
    pub tail_sample: Option<usize>,
}

impl DispatchEntry {
    pub fn new(
        event: EventId,
        target_flags: TargetFlags,
        x_offset: f32,
        y_offset: f32,
        timeout: Nsecs,
    ) -> Self {
        Self {
            event,
            target_flags,
            x_offset,
            y_offset,
            timeout,
            in_progress: false,
            head_sample: None,
            tail_sample: None,
        }
    }

    pub fn is_sync_target(&self) -> bool {
        self.target_flags.contains(TargetFlags::SYNC)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Everything is peachy.
    Normal,
    /// An unrecoverable communication error has occurred.
    Broken,
    /// The consumer is not responding to dispatched events.
    NotResponding,
    /// The channel has been unregistered; the connection is on its way out.
    Zombie,
}

impl ConnectionStatus {
    pub fn label(self) -> &'static str {
        match self {
            ConnectionStatus::Normal => "NORMAL",
            ConnectionStatus::Broken => "BROKEN",
            ConnectionStatus::NotResponding => "NOT_RESPONDING",
            ConnectionStatus::Zombie => "ZOMBIE",
        }
    }
}

/// Dispatch state for a single registered channel.
pub struct Connection {
    pub status: ConnectionStatus,
    pub channel: Arc<dyn InputChannel>,
    /// Monitoring connections receive a copy of every event.
    pub monitor: bool,
    pub input_state: InputState,
    pub outbound: VecDeque<DispatchEntry>,
    /// Deadline for the in-flight dispatch, `NEVER` when none.
    pub next_timeout: Nsecs,
    /// When the in-flight event was originally captured.
    pub last_event_time: Nsecs,
    /// When the in-flight event was published.
    pub last_dispatch_time: Nsecs,
    /// When the last ANR on this connection was recorded.
    pub last_anr_time: Nsecs,
}

impl Connection {
    pub fn new(channel: Arc<dyn InputChannel>, monitor: bool) -> Self {
        Self {
            status: ConnectionStatus::Normal,
            channel,
            monitor,
            input_state: InputState::new(),
            outbound: VecDeque::new(),
            next_timeout: NEVER,
            last_event_time: NEVER,
            last_dispatch_time: NEVER,
            last_anr_time: NEVER,
        }
    }

    pub fn name(&self) -> &str {
        self.channel.name()
    }

    /// A sync target can only ever be the tail: nothing is enqueued behind
    /// one until it finishes or is preempted.
    pub fn has_pending_sync_target(&self) -> bool {
        self.outbound.back().is_some_and(|entry| entry.is_sync_target())
    }

    pub fn find_outbound_entry_for(&self, event: EventId) -> Option<usize> {
        self.outbound.iter().rposition(|entry| entry.event == event)
    }

    pub fn set_next_timeout(&mut self, current_time: Nsecs, timeout: Nsecs) {
        self.next_timeout = if timeout >= 0 {
            current_time.saturating_add(timeout)
        } else {
            NEVER
        };
    }

    pub fn event_latency_millis(&self, current_time: Nsecs) -> f64 {
        (current_time - self.last_event_time) as f64 / NANOS_PER_MILLI as f64
    }

    pub fn dispatch_latency_millis(&self, current_time: Nsecs) -> f64 {
        (current_time - self.last_dispatch_time) as f64 / NANOS_PER_MILLI as f64
    }

    pub fn anr_latency_millis(&self, current_time: Nsecs) -> f64 {
        (current_time - self.last_anr_time) as f64 / NANOS_PER_MILLI as f64
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("channel", &self.channel.name())
            .field("status", &self.status)
            .field("monitor", &self.monitor)
            .field("outbound", &self.outbound.len())
            .field("next_timeout", &self.next_timeout)
            .finish()
    }
}
