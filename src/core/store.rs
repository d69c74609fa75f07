//! Ref-counted storage for queued events.
//!
//! Events are shared between the inbound queue, per-connection dispatch
//! entries, the pending slot, the key-repeat source, and waiting injectors,
//! so they carry an explicit reference count.  The store keeps entries in a
//! slab of generational slots: freed indices are recycled through a free
//! pool and the generation counter invalidates stale handles.

use crate::core::event::{
    ConfigChangedEntry, EventCommon, EventEntry, InterceptKeyResult, KeyAction, KeyEntry,
    KeyFlags, MotionAction, MotionEntry, MotionFlags, MotionSample, PointerCoords, PolicyFlags,
    MAX_POINTERS,
};
use crate::util::time::Nsecs;

/// Generational handle to an event entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<EventEntry>,
}

/// Slab of event entries with index reuse.
#[derive(Debug, Default)]
pub struct EventStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, entry: EventEntry) -> EventId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            EventId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                entry: Some(entry),
            });
            EventId {
                index,
                generation: 0,
            }
        }
    }

    pub fn get(&self, id: EventId) -> Option<&EventEntry> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, id: EventId) -> Option<&mut EventEntry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Number of live entries; used by `dump` and leak assertions in tests.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    /// Take another reference to an entry.
    pub fn add_ref(&mut self, id: EventId) {
        match self.get_mut(id) {
            Some(entry) => entry.common_mut().ref_count += 1,
            None => tracing::warn!("add_ref on stale event handle {:?}", id),
        }
    }

    /// Drop one reference.  The last release returns the slot to the free
    /// pool (and the sample history with it).  Returns true when freed.
    pub fn release(&mut self, id: EventId) -> bool {
        let slot = match self.slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation => slot,
            _ => {
                tracing::warn!("release of stale event handle {:?}", id);
                return false;
            }
        };
        let common = match slot.entry.as_mut() {
            Some(entry) => entry.common_mut(),
            None => {
                tracing::warn!("release of already-freed event handle {:?}", id);
                return false;
            }
        };
        debug_assert!(common.ref_count > 0);
        common.ref_count -= 1;
        if common.ref_count > 0 {
            return false;
        }
        debug_assert_eq!(
            common.pending_sync_dispatches, 0,
            "event released with pending synchronous dispatches"
        );
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        true
    }

    pub fn obtain_configuration_changed(&mut self, event_time: Nsecs) -> EventId {
        self.insert(EventEntry::ConfigChanged(ConfigChangedEntry {
            common: EventCommon::new(event_time),
        }))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn obtain_key(
        &mut self,
        event_time: Nsecs,
        device_id: i32,
        source: u32,
        policy_flags: PolicyFlags,
        action: KeyAction,
        flags: KeyFlags,
        key_code: i32,
        scan_code: i32,
        meta_state: i32,
        repeat_count: i32,
        down_time: Nsecs,
    ) -> EventId {
        self.insert(EventEntry::Key(KeyEntry {
            common: EventCommon::new(event_time),
            device_id,
            source,
            policy_flags,
            action,
            flags,
            key_code,
            scan_code,
            meta_state,
            repeat_count,
            down_time,
            synthetic_repeat: false,
            intercept_result: InterceptKeyResult::Unknown,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn obtain_motion(
        &mut self,
        event_time: Nsecs,
        device_id: i32,
        source: u32,
        policy_flags: PolicyFlags,
        action: MotionAction,
        flags: MotionFlags,
        meta_state: i32,
        edge_flags: i32,
        x_precision: f32,
        y_precision: f32,
        down_time: Nsecs,
        pointer_ids: &[i32],
        pointer_coords: &[PointerCoords],
    ) -> EventId {
        let pointer_count = pointer_ids.len();
        debug_assert!(pointer_count > 0 && pointer_count <= MAX_POINTERS);
        debug_assert_eq!(pointer_coords.len(), pointer_count);

        let mut ids = [0i32; MAX_POINTERS];
        ids[..pointer_count].copy_from_slice(pointer_ids);
        let mut coords = [PointerCoords::default(); MAX_POINTERS];
        coords[..pointer_count].copy_from_slice(pointer_coords);

        self.insert(EventEntry::Motion(MotionEntry {
            common: EventCommon::new(event_time),
            device_id,
            source,
            policy_flags,
            action,
            flags,
            meta_state,
            edge_flags,
            x_precision,
            y_precision,
            down_time,
            pointer_count,
            pointer_ids: ids,
            samples: vec![MotionSample {
                event_time,
                pointer_coords: coords,
            }],
        }))
    }

    /// Append a sample to an already-queued motion entry.  The sole mutation
    /// permitted on an enqueued motion event.
    pub fn append_motion_sample(
        &mut self,
        id: EventId,
        event_time: Nsecs,
        pointer_coords: &[PointerCoords],
    ) {
        let Some(EventEntry::Motion(motion)) = self.get_mut(id) else {
            tracing::warn!("append_motion_sample on non-motion handle {:?}", id);
            return;
        };
        debug_assert_eq!(pointer_coords.len(), motion.pointer_count);
        let mut coords = [PointerCoords::default(); MAX_POINTERS];
        coords[..motion.pointer_count]
            .copy_from_slice(&pointer_coords[..motion.pointer_count]);
        motion.samples.push(MotionSample {
            event_time,
            pointer_coords: coords,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::source;

    fn key(store: &mut EventStore, t: Nsecs) -> EventId {
        store.obtain_key(
            t,
            1,
            source::KEYBOARD,
            PolicyFlags::empty(),
            KeyAction::Down,
            KeyFlags::empty(),
            0x42,
            7,
            0,
            0,
            t,
        )
    }

    #[test]
    fn test_obtain_release_recycles_slot() {
        let mut store = EventStore::new();
        let a = key(&mut store, 1);
        assert_eq!(store.live_count(), 1);
        assert!(store.release(a));
        assert_eq!(store.live_count(), 0);

        // Slot is reused with a new generation; the old handle is dead.
        let b = key(&mut store, 2);
        assert!(store.get(a).is_none());
        assert!(store.get(b).is_some());
        assert_ne!(a, b);
    }

    #[test]
    fn test_refcount_delays_free() {
        let mut store = EventStore::new();
        let id = key(&mut store, 1);
        store.add_ref(id);
        assert!(!store.release(id));
        assert!(store.get(id).is_some());
        assert!(store.release(id));
        assert!(store.get(id).is_none());
    }

    #[test]
    fn test_motion_sample_chain() {
        let mut store = EventStore::new();
        let coords = [PointerCoords {
            x: 1.0,
            y: 2.0,
            pressure: 1.0,
            size: 0.1,
        }];
        let id = store.obtain_motion(
            10,
            2,
            source::TOUCHSCREEN,
            PolicyFlags::empty(),
            MotionAction::Move,
            MotionFlags::empty(),
            0,
            0,
            1.0,
            1.0,
            10,
            &[0],
            &coords,
        );
        store.append_motion_sample(
            id,
            20,
            &[PointerCoords {
                x: 3.0,
                y: 4.0,
                pressure: 1.0,
                size: 0.1,
            }],
        );
        let motion = store.get(id).unwrap().as_motion().unwrap();
        assert_eq!(motion.samples.len(), 2);
        assert_eq!(motion.first_sample().event_time, 10);
        assert_eq!(motion.last_sample().event_time, 20);
        assert_eq!(motion.last_sample().pointer_coords[0].x, 3.0);
    }
}
