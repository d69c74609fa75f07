//! Synthetic event injection on behalf of external agents.

use std::time::Duration;

use crate::core::dispatcher::{DispatchState, InputDispatcher};
use crate::core::event::{
    InjectSyncMode, InjectionResult, KeyAction, KeyFlags, MotionAction, MotionFlags,
    PointerCoords, PolicyFlags, MAX_POINTERS,
};
use crate::core::store::EventId;
use crate::util::time::{millis_to_nanos, now, Nsecs};

/// One time-stamped coordinate set of an injected motion event.
#[derive(Debug, Clone)]
pub struct InjectedMotionSample {
    pub event_time: Nsecs,
    pub pointer_coords: Vec<PointerCoords>,
}

/// An event handed to `inject_input_event`.  Actions arrive as raw wire
/// integers so malformed requests can be rejected rather than crash.
#[derive(Debug, Clone)]
pub enum InjectedEvent {
    Key {
        event_time: Nsecs,
        device_id: i32,
        source: u32,
        action: i32,
        flags: KeyFlags,
        key_code: i32,
        scan_code: i32,
        meta_state: i32,
        repeat_count: i32,
        down_time: Nsecs,
    },
    Motion {
        device_id: i32,
        source: u32,
        action: i32,
        flags: MotionFlags,
        meta_state: i32,
        edge_flags: i32,
        x_precision: f32,
        y_precision: f32,
        down_time: Nsecs,
        pointer_ids: Vec<i32>,
        /// Sample history, oldest first; the first sample's time stamps the
        /// event.  Must be non-empty.
        samples: Vec<InjectedMotionSample>,
    },
}

impl InputDispatcher {
    /// Inject an event and optionally wait for its outcome.
    ///
    /// May be called from any thread.  A deadline hit returns `TimedOut` but
    /// does not cancel the event; it continues through dispatch.
    pub fn inject_input_event(
        &self,
        event: &InjectedEvent,
        injector_pid: i32,
        injector_uid: i32,
        sync_mode: InjectSyncMode,
        timeout_ms: i64,
    ) -> InjectionResult {
        tracing::debug!(
            "inject_input_event - injector_pid={}, injector_uid={}, sync_mode={:?}, timeout_ms={}",
            injector_pid,
            injector_uid,
            sync_mode,
            timeout_ms
        );
        let end_time = now() + millis_to_nanos(timeout_ms);

        let (entry, needs_wake) = {
            let mut state = self.state.lock().unwrap();
            let Some(entry) = state.create_injected_entry(event, injector_pid, injector_uid)
            else {
                tracing::debug!("rejecting malformed injected event");
                return InjectionResult::Failed;
            };
            if sync_mode == InjectSyncMode::None {
                if let Some(e) = state.store.get_mut(entry) {
                    e.common_mut().injection.is_async = true;
                }
            } else {
                // The caller keeps a reference across its wait.
                state.store.add_ref(entry);
            }
            let needs_wake = state.enqueue_inbound_event(entry);
            (entry, needs_wake)
        };
        if needs_wake {
            self.looper.wake();
        }

        if sync_mode == InjectSyncMode::None {
            return InjectionResult::Succeeded;
        }

        let mut state = self.state.lock().unwrap();
        let mut result;
        loop {
            result = state
                .store
                .get(entry)
                .map(|e| e.common().injection.result)
                .unwrap_or(InjectionResult::Failed);
            if result != InjectionResult::Pending {
                break;
            }
            let remaining = end_time - now();
            if remaining <= 0 {
                result = InjectionResult::TimedOut;
                break;
            }
            let (guard, _) = self
                .injection_result_available
                .wait_timeout(state, Duration::from_nanos(remaining as u64))
                .unwrap();
            state = guard;
        }

        if result == InjectionResult::Succeeded && sync_mode == InjectSyncMode::WaitForFinished {
            loop {
                let pending = state
                    .store
                    .get(entry)
                    .map(|e| e.common().pending_sync_dispatches)
                    .unwrap_or(0);
                if pending == 0 {
                    break;
                }
                let remaining = end_time - now();
                if remaining <= 0 {
                    result = InjectionResult::TimedOut;
                    break;
                }
                let (guard, _) = self
                    .injection_sync_finished
                    .wait_timeout(state, Duration::from_nanos(remaining as u64))
                    .unwrap();
                state = guard;
            }
        }

        state.store.release(entry);
        drop(state);

        tracing::debug!("injection finished with {:?}", result);
        result
    }
}

impl DispatchState {
    /// Validate and allocate an entry for an injected event.  Returns None
    /// for unknown actions or malformed pointer data.
    pub(crate) fn create_injected_entry(
        &mut self,
        event: &InjectedEvent,
        injector_pid: i32,
        injector_uid: i32,
    ) -> Option<EventId> {
        let entry = match event {
            InjectedEvent::Key {
                event_time,
                device_id,
                source,
                action,
                flags,
                key_code,
                scan_code,
                meta_state,
                repeat_count,
                down_time,
            } => {
                let action = KeyAction::from_raw(*action)?;
                self.store.obtain_key(
                    *event_time,
                    *device_id,
                    *source,
                    PolicyFlags::INJECTED,
                    action,
                    *flags,
                    *key_code,
                    *scan_code,
                    *meta_state,
                    *repeat_count,
                    *down_time,
                )
            }
            InjectedEvent::Motion {
                device_id,
                source,
                action,
                flags,
                meta_state,
                edge_flags,
                x_precision,
                y_precision,
                down_time,
                pointer_ids,
                samples,
            } => {
                let action = MotionAction::from_raw(*action)?;
                let pointer_count = pointer_ids.len();
                if pointer_count == 0 || pointer_count > MAX_POINTERS {
                    tracing::warn!(
                        "rejecting injected motion with pointer_count={}",
                        pointer_count
                    );
                    return None;
                }
                let first = samples.first()?;
                if samples.iter().any(|s| s.pointer_coords.len() != pointer_count) {
                    tracing::warn!("rejecting injected motion with mismatched sample widths");
                    return None;
                }
                let entry = self.store.obtain_motion(
                    first.event_time,
                    *device_id,
                    *source,
                    PolicyFlags::INJECTED,
                    action,
                    *flags,
                    *meta_state,
                    *edge_flags,
                    *x_precision,
                    *y_precision,
                    *down_time,
                    pointer_ids,
                    &first.pointer_coords,
                );
                for sample in &samples[1..] {
                    self.store
                        .append_motion_sample(entry, sample.event_time, &sample.pointer_coords);
                }
                entry
            }
        };

        if let Some(e) = self.store.get_mut(entry) {
            let injection = &mut e.common_mut().injection;
            injection.injector_pid = injector_pid;
            injection.injector_uid = injector_uid;
        }
        Some(entry)
    }
}
