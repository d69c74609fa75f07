//! Per-connection input state tracking.
//!
//! Records which keys and pointer streams a consumer currently believes are
//! down so that cancellation events can be synthesized when the dispatcher
//! stops delivering mid-stream (ANR give-up, abort).  A consumer whose view
//! has drifted is "out of sync" until the cancellations are queued.

use crate::core::event::{
    EventEntry, KeyAction, KeyEntry, KeyFlags, MotionAction, MotionEntry, MotionFlags,
    PointerCoords, PolicyFlags, MAX_POINTERS,
};
use crate::core::store::{EventId, EventStore};
use crate::util::time::Nsecs;

/// How well an event agrees with the state the consumer has seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Event fits the current state.
    Consistent,
    /// Inconsistent but harmless, e.g. a key down repeated while down.
    Tolerable,
    /// Inconsistent in a way consumers may not survive, e.g. an up without
    /// a prior down.
    Broken,
}

#[derive(Debug, Clone)]
struct KeyMemento {
    device_id: i32,
    source: u32,
    key_code: i32,
    scan_code: i32,
    down_time: Nsecs,
}

#[derive(Debug, Clone)]
struct MotionMemento {
    device_id: i32,
    source: u32,
    x_precision: f32,
    y_precision: f32,
    down_time: Nsecs,
    pointer_count: usize,
    pointer_ids: [i32; MAX_POINTERS],
    pointer_coords: [PointerCoords; MAX_POINTERS],
}

impl MotionMemento {
    fn set_pointers(&mut self, entry: &MotionEntry) {
        self.pointer_count = entry.pointer_count;
        self.pointer_ids = entry.pointer_ids;
        self.pointer_coords = entry.last_sample().pointer_coords;
    }
}

/// Tracked state for one connection.
#[derive(Debug, Default)]
pub struct InputState {
    out_of_sync: bool,
    key_mementos: Vec<KeyMemento>,
    motion_mementos: Vec<MotionMemento>,
}

impl InputState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when there is nothing that would need to be canceled.
    pub fn is_neutral(&self) -> bool {
        self.key_mementos.is_empty() && self.motion_mementos.is_empty()
    }

    pub fn is_out_of_sync(&self) -> bool {
        self.out_of_sync
    }

    /// Mark the state out of sync, unless it is neutral and there is nothing
    /// for the consumer to be confused about.
    pub fn set_out_of_sync(&mut self) {
        if !self.is_neutral() {
            self.out_of_sync = true;
        }
    }

    pub fn reset_out_of_sync(&mut self) {
        self.out_of_sync = false;
    }

    pub fn clear(&mut self) {
        self.out_of_sync = false;
        self.key_mementos.clear();
        self.motion_mementos.clear();
    }

    /// Record an event that has just been published.
    pub fn track_event(&mut self, entry: &EventEntry) -> Consistency {
        match entry {
            EventEntry::ConfigChanged(_) => Consistency::Consistent,
            EventEntry::Key(key) => self.track_key(key),
            EventEntry::Motion(motion) => self.track_motion(motion),
        }
    }

    pub fn track_key(&mut self, entry: &KeyEntry) -> Consistency {
        let index = self.key_mementos.iter().position(|m| {
            m.device_id == entry.device_id
                && m.source == entry.source
                && m.key_code == entry.key_code
                && m.scan_code == entry.scan_code
        });
        match entry.action {
            KeyAction::Down => {
                if index.is_some() {
                    // Already down; drivers repeat like this.
                    Consistency::Tolerable
                } else {
                    self.key_mementos.push(KeyMemento {
                        device_id: entry.device_id,
                        source: entry.source,
                        key_code: entry.key_code,
                        scan_code: entry.scan_code,
                        down_time: entry.down_time,
                    });
                    Consistency::Consistent
                }
            }
            KeyAction::Up => match index {
                Some(i) => {
                    self.key_mementos.remove(i);
                    Consistency::Consistent
                }
                None => Consistency::Broken,
            },
        }
    }

    pub fn track_motion(&mut self, entry: &MotionEntry) -> Consistency {
        let index = self
            .motion_mementos
            .iter()
            .position(|m| m.device_id == entry.device_id && m.source == entry.source);
        match entry.action {
            MotionAction::Down => {
                let consistency = if let Some(i) = index {
                    self.motion_mementos.remove(i);
                    Consistency::Tolerable
                } else {
                    Consistency::Consistent
                };
                let mut memento = MotionMemento {
                    device_id: entry.device_id,
                    source: entry.source,
                    x_precision: entry.x_precision,
                    y_precision: entry.y_precision,
                    down_time: entry.down_time,
                    pointer_count: 0,
                    pointer_ids: [0; MAX_POINTERS],
                    pointer_coords: [PointerCoords::default(); MAX_POINTERS],
                };
                memento.set_pointers(entry);
                self.motion_mementos.push(memento);
                consistency
            }
            MotionAction::Up | MotionAction::Cancel => match index {
                Some(i) => {
                    self.motion_mementos.remove(i);
                    Consistency::Consistent
                }
                None => Consistency::Broken,
            },
            MotionAction::Move => match index {
                Some(i) => {
                    self.motion_mementos[i].set_pointers(entry);
                    Consistency::Consistent
                }
                None => Consistency::Broken,
            },
            MotionAction::Outside => Consistency::Consistent,
        }
    }

    /// Build cancellation events for everything currently tracked, in
    /// memento order.  The state itself is not touched: the cancellations
    /// remove their mementos when they are published and tracked like any
    /// other event.
    pub fn synthesize_cancellation_events(
        &self,
        store: &mut EventStore,
        current_time: Nsecs,
    ) -> Vec<EventId> {
        let mut events = Vec::new();
        for memento in &self.key_mementos {
            events.push(store.obtain_key(
                current_time,
                memento.device_id,
                memento.source,
                PolicyFlags::empty(),
                KeyAction::Up,
                KeyFlags::CANCELED,
                memento.key_code,
                memento.scan_code,
                0,
                0,
                memento.down_time,
            ));
        }
        for memento in &self.motion_mementos {
            events.push(store.obtain_motion(
                current_time,
                memento.device_id,
                memento.source,
                PolicyFlags::empty(),
                MotionAction::Cancel,
                MotionFlags::empty(),
                0,
                0,
                memento.x_precision,
                memento.y_precision,
                memento.down_time,
                &memento.pointer_ids[..memento.pointer_count],
                &memento.pointer_coords[..memento.pointer_count],
            ));
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::source;

    fn key_entry(action: KeyAction, key_code: i32) -> KeyEntry {
        KeyEntry {
            common: crate::core::event::EventCommon::new(1),
            device_id: 1,
            source: source::KEYBOARD,
            policy_flags: PolicyFlags::empty(),
            action,
            flags: KeyFlags::empty(),
            key_code,
            scan_code: key_code + 100,
            meta_state: 0,
            repeat_count: 0,
            down_time: 1,
            synthetic_repeat: false,
            intercept_result: crate::core::event::InterceptKeyResult::Unknown,
        }
    }

    fn motion_entry(action: MotionAction) -> MotionEntry {
        let mut ids = [0; MAX_POINTERS];
        ids[0] = 7;
        MotionEntry {
            common: crate::core::event::EventCommon::new(1),
            device_id: 2,
            source: source::TOUCHSCREEN,
            policy_flags: PolicyFlags::empty(),
            action,
            flags: MotionFlags::empty(),
            meta_state: 0,
            edge_flags: 0,
            x_precision: 1.0,
            y_precision: 1.0,
            down_time: 1,
            pointer_count: 1,
            pointer_ids: ids,
            samples: vec![crate::core::event::MotionSample {
                event_time: 1,
                pointer_coords: [PointerCoords::default(); MAX_POINTERS],
            }],
        }
    }

    #[test]
    fn test_key_down_up_round_trip() {
        let mut state = InputState::new();
        assert_eq!(
            state.track_key(&key_entry(KeyAction::Down, 0x42)),
            Consistency::Consistent
        );
        assert!(!state.is_neutral());
        assert_eq!(
            state.track_key(&key_entry(KeyAction::Down, 0x42)),
            Consistency::Tolerable
        );
        assert_eq!(
            state.track_key(&key_entry(KeyAction::Up, 0x42)),
            Consistency::Consistent
        );
        assert!(state.is_neutral());
    }

    #[test]
    fn test_up_without_down_is_broken() {
        let mut state = InputState::new();
        assert_eq!(
            state.track_key(&key_entry(KeyAction::Up, 0x42)),
            Consistency::Broken
        );
        assert_eq!(
            state.track_motion(&motion_entry(MotionAction::Move)),
            Consistency::Broken
        );
    }

    #[test]
    fn test_out_of_sync_requires_state() {
        let mut state = InputState::new();
        state.set_out_of_sync();
        assert!(!state.is_out_of_sync());

        state.track_key(&key_entry(KeyAction::Down, 0x42));
        state.set_out_of_sync();
        assert!(state.is_out_of_sync());
        state.reset_out_of_sync();
        assert!(!state.is_out_of_sync());
    }

    #[test]
    fn test_cancellation_synthesis_is_idempotent_over_neutral() {
        let state = InputState::new();
        let mut store = EventStore::new();
        assert!(state
            .synthesize_cancellation_events(&mut store, 5)
            .is_empty());
        assert_eq!(store.live_count(), 0);
    }

    #[test]
    fn test_cancellation_synthesis_contents() {
        let mut state = InputState::new();
        let mut store = EventStore::new();
        state.track_key(&key_entry(KeyAction::Down, 0x42));
        state.track_motion(&motion_entry(MotionAction::Down));

        let events = state.synthesize_cancellation_events(&mut store, 99);
        assert_eq!(events.len(), 2);

        let key = store.get(events[0]).unwrap().as_key().unwrap();
        assert_eq!(key.action, KeyAction::Up);
        assert!(key.flags.contains(KeyFlags::CANCELED));
        assert_eq!(key.key_code, 0x42);

        let motion = store.get(events[1]).unwrap().as_motion().unwrap();
        assert_eq!(motion.action, MotionAction::Cancel);
        assert_eq!(motion.pointer_count, 1);
        assert_eq!(motion.pointer_ids[0], 7);

        // Synthesis itself does not consume the mementos.
        assert!(!state.is_neutral());
    }
}
