//! The dispatch loop: one `dispatch_once` iteration at a time.

use crate::core::dispatcher::{CommandEntry, DispatchState, InputDispatcher};
use crate::core::event::{
    is_app_switch_key, EventEntry, InjectionResult, InterceptKeyResult, KeyAction, KeyFlags,
    MotionAction, PolicyFlags, LONG_TOUCH_THRESHOLD,
};
use crate::core::policy::UserActivityType;
use crate::core::store::EventId;
use crate::util::time::{now, Nsecs, NANOS_PER_MILLI, NEVER};

impl InputDispatcher {
    /// Run a single iteration of the dispatch loop: process one queued
    /// event, a timeout, or a consumer response, then park on the looper.
    ///
    /// Must only be called from the dispatcher thread.
    pub fn dispatch_once(&self) {
        // Cached policy values; both getters are non-reentrant by contract.
        let key_repeat_timeout = self.policy.get_key_repeat_timeout();
        let key_repeat_delay = self.policy.get_key_repeat_delay();

        let mut next_wakeup = NEVER;
        {
            let mut state = self.state.lock().unwrap();
            let current_time = now();
            state.dispatch_once_inner(
                current_time,
                key_repeat_timeout,
                key_repeat_delay,
                &mut next_wakeup,
            );
        }

        if self.run_commands() {
            next_wakeup = i64::MIN;
        }

        let timeout_ms: i32 = if next_wakeup == NEVER {
            -1
        } else {
            let delta = next_wakeup.saturating_sub(now());
            if delta <= 0 {
                0
            } else {
                ((delta + NANOS_PER_MILLI - 1) / NANOS_PER_MILLI).min(i32::MAX as i64) as i32
            }
        };
        for fd_event in self.looper.poll(timeout_ms) {
            self.handle_receive_event(fd_event);
        }
    }
}

impl DispatchState {
    pub(crate) fn dispatch_once_inner(
        &mut self,
        current_time: Nsecs,
        key_repeat_timeout: Nsecs,
        key_repeat_delay: Nsecs,
        next_wakeup: &mut Nsecs,
    ) {
        // Reset the key repeat timer whenever key events are disallowed so a
        // repeat does not survive the device going to sleep.
        if key_repeat_timeout < 0 {
            self.reset_key_repeat();
        }

        if !self.dispatch_enabled {
            if self.pending_event.is_some() || !self.inbound.is_empty() {
                tracing::debug!("dispatch disabled, dropping queued events");
                self.release_pending_event(true);
                self.drain_inbound_queue();
            }
            return;
        }
        if self.dispatch_frozen {
            // Frozen: no timeout processing, no delivery.
            return;
        }

        let app_switch_due = self.app_switch_due_time <= current_time;
        if self.app_switch_due_time < *next_wakeup {
            *next_wakeup = self.app_switch_due_time;
        }

        // Detect connection timeouts and pending synchronous dispatches.
        let mut have_pending_sync = false;
        let mut timed_out = Vec::new();
        for fd in self.active.clone() {
            let Some(connection) = self.connections.get(&fd) else {
                continue;
            };
            if connection.has_pending_sync_target() {
                if app_switch_due {
                    self.demote_sync_tail(fd);
                } else {
                    have_pending_sync = true;
                }
            }
            let Some(connection) = self.connections.get(&fd) else {
                continue;
            };
            if connection.next_timeout <= current_time {
                timed_out.push(fd);
            } else if connection.next_timeout < *next_wakeup {
                *next_wakeup = connection.next_timeout;
            }
        }
        if !timed_out.is_empty() {
            for fd in timed_out {
                self.timeout_dispatch_cycle(current_time, fd);
            }
            *next_wakeup = i64::MIN;
        }

        // While a synchronous dispatch is pending, no new event is routed.
        if have_pending_sync {
            return;
        }

        if self.pending_event.is_none() {
            if self.inbound.is_empty() {
                if self.key_repeat.last_key.is_some() {
                    if current_time >= self.key_repeat.next_repeat_time {
                        let repeat = self.synthesize_key_repeat(current_time, key_repeat_delay);
                        self.pending_event = Some(repeat);
                        self.current_targets_valid = false;
                    } else if self.key_repeat.next_repeat_time < *next_wakeup {
                        *next_wakeup = self.key_repeat.next_repeat_time;
                    }
                }
                if self.pending_event.is_none() {
                    return;
                }
            } else {
                // Motion throttling: hold back a lone move for a device that
                // is producing events faster than the policy's ceiling.
                if self.inbound.len() == 1 {
                    if let Some(EventEntry::Motion(motion)) = self.store.get(self.inbound[0]) {
                        if motion.action == MotionAction::Move
                            && motion.device_id == self.throttle.last_device_id
                            && motion.source == self.throttle.last_source
                        {
                            let release_time = self.throttle.last_event_time
                                + self.throttle.min_time_between_events;
                            if current_time < release_time {
                                if release_time < *next_wakeup {
                                    *next_wakeup = release_time;
                                }
                                tracing::trace!(
                                    "throttling move for device {} until {}",
                                    motion.device_id,
                                    release_time
                                );
                                return;
                            }
                        }
                    }
                }

                let entry = self.inbound.pop_front().expect("inbound queue is non-empty");
                if let Some(EventEntry::Motion(motion)) = self.store.get(entry) {
                    self.throttle.last_device_id = motion.device_id;
                    self.throttle.last_source = motion.source;
                    self.throttle.last_event_time = motion.common.event_time.min(current_time);
                }
                self.pending_event = Some(entry);
                // A fresh event must find its own targets; the previous
                // snapshot stays usable for streaming until then.
                self.current_targets_valid = false;
            }
        }

        let pending = match self.pending_event {
            Some(pending) => pending,
            None => return,
        };

        // Past the app-switch due time, shed everything except the app
        // switch key itself.
        let mut dropped = false;
        if app_switch_due {
            if self.is_app_switch_key_event(pending) {
                tracing::debug!("app switch key reached the head of the queue");
                self.app_switch_due_time = NEVER;
            } else if !matches!(self.store.get(pending), Some(EventEntry::ConfigChanged(_))) {
                dropped = true;
            }
        }

        let done = if dropped {
            tracing::debug!(
                "dropping {} event overdue for app switch",
                self.store.get(pending).map(|e| e.kind_label()).unwrap_or("?")
            );
            true
        } else {
            match self.store.get(pending) {
                Some(EventEntry::ConfigChanged(_)) => {
                    self.dispatch_configuration_changed(current_time, pending)
                }
                Some(EventEntry::Key(_)) => {
                    self.dispatch_key(current_time, pending, key_repeat_timeout, next_wakeup)
                }
                Some(EventEntry::Motion(_)) => {
                    self.dispatch_motion(current_time, pending, next_wakeup)
                }
                None => {
                    tracing::error!("pending event handle is stale");
                    true
                }
            }
        };

        if done {
            self.release_pending_event(dropped);
            *next_wakeup = i64::MIN;
        }
    }

    fn is_app_switch_key_event(&self, entry: EventId) -> bool {
        matches!(
            self.store.get(entry),
            Some(EventEntry::Key(key)) if is_app_switch_key(key.key_code)
        ) && self.is_event_from_reliable_source(entry)
    }

    fn dispatch_configuration_changed(&mut self, _current_time: Nsecs, entry: EventId) -> bool {
        let event_time = self.store.get(entry).map(|e| e.event_time()).unwrap_or(0);
        tracing::debug!("dispatch_configuration_changed - event_time={}", event_time);

        // A keyboard may have been added or removed; restart repeat state.
        self.reset_key_repeat();
        self.post_command(CommandEntry::NotifyConfigurationChanged { event_time });
        true
    }

    /// Returns true when the event is finished with (dispatched or dropped)
    /// and false when it must stay pending for another iteration.
    fn dispatch_key(
        &mut self,
        current_time: Nsecs,
        entry: EventId,
        key_repeat_timeout: Nsecs,
        next_wakeup: &mut Nsecs,
    ) -> bool {
        let Some(EventEntry::Key(key)) = self.store.get(entry) else {
            tracing::error!("dispatch_key on non-key handle");
            return true;
        };
        let first_touch = !key.common.dispatch_in_progress;
        let action = key.action;
        let repeat_count = key.repeat_count;
        let key_code = key.key_code;
        let event_time = key.common.event_time;
        let injected = key.common.injection.is_injected();
        let synthetic_repeat = key.synthetic_repeat;

        // Preprocessing, once per event.
        if first_touch {
            if action == KeyAction::Down && repeat_count == 0 && !injected {
                let previous_repeat = self
                    .key_repeat
                    .last_key
                    .and_then(|last| self.store.get(last))
                    .and_then(EventEntry::as_key)
                    .filter(|last| last.key_code == key_code)
                    .map(|last| last.repeat_count);
                if let Some(previous_repeat) = previous_repeat {
                    // Two identical downs in a row: the driver is generating
                    // repeats itself, so suppress our own synthesizer.
                    if let Some(EventEntry::Key(key)) = self.store.get_mut(entry) {
                        key.repeat_count = previous_repeat + 1;
                    }
                    self.reset_key_repeat();
                    self.key_repeat.next_repeat_time = NEVER;
                } else {
                    self.reset_key_repeat();
                    self.key_repeat.next_repeat_time = event_time + key_repeat_timeout;
                }
                self.key_repeat.last_key = Some(entry);
                self.store.add_ref(entry);
            } else if !synthetic_repeat {
                self.reset_key_repeat();
            }

            if let Some(event) = self.store.get_mut(entry) {
                event.common_mut().dispatch_in_progress = true;
            }
            self.log_outbound_key(entry);
        }

        // Identify targets.
        if !self.current_targets_valid {
            self.start_finding_targets();
            let (result, window) = self.find_focused_window(current_time, entry, next_wakeup);
            if result == InjectionResult::Pending {
                return false;
            }
            if result != InjectionResult::Succeeded {
                self.set_injection_result(entry, result);
                self.reset_target_wait();
                return true;
            }
            self.add_monitoring_targets();
            self.finish_finding_targets(window);
        }

        // Give the policy a chance to intercept the key.
        match self
            .store
            .get(entry)
            .and_then(EventEntry::as_key)
            .map(|key| key.intercept_result)
        {
            Some(InterceptKeyResult::Unknown) => {
                self.store.add_ref(entry);
                let channel = self.current_channel.clone();
                self.post_command(CommandEntry::InterceptKeyBeforeDispatching {
                    channel,
                    key: entry,
                });
                return false;
            }
            Some(InterceptKeyResult::Skip) => {
                tracing::debug!("policy consumed key {:#x} before dispatching", key_code);
                self.set_injection_result(entry, InjectionResult::Succeeded);
                return true;
            }
            Some(InterceptKeyResult::Continue) => {}
            None => return true,
        }

        self.set_injection_result(entry, InjectionResult::Succeeded);
        self.dispatch_event_to_current_targets(current_time, entry, false);
        self.poke_user_activity(event_time, UserActivityType::Button);
        true
    }

    fn dispatch_motion(
        &mut self,
        current_time: Nsecs,
        entry: EventId,
        next_wakeup: &mut Nsecs,
    ) -> bool {
        let Some(EventEntry::Motion(motion)) = self.store.get(entry) else {
            tracing::error!("dispatch_motion on non-motion handle");
            return true;
        };
        let first_touch = !motion.common.dispatch_in_progress;
        let action = motion.action;
        let event_time = motion.common.event_time;
        let down_time = motion.down_time;
        let is_pointer = motion.is_pointer_event();

        if first_touch {
            if let Some(event) = self.store.get_mut(entry) {
                event.common_mut().dispatch_in_progress = true;
            }
            self.log_outbound_motion(entry);
        }

        if !self.current_targets_valid {
            self.start_finding_targets();
            let (result, window) = if is_pointer {
                self.find_touched_window(current_time, entry, next_wakeup)
            } else {
                self.find_focused_window(current_time, entry, next_wakeup)
            };
            if result == InjectionResult::Pending {
                return false;
            }
            if result != InjectionResult::Succeeded {
                self.set_injection_result(entry, result);
                self.reset_target_wait();
                return true;
            }
            self.add_monitoring_targets();
            self.finish_finding_targets(window);
        }

        self.set_injection_result(entry, InjectionResult::Succeeded);
        self.dispatch_event_to_current_targets(current_time, entry, false);

        let activity = if is_pointer {
            match action {
                MotionAction::Down => UserActivityType::Touch,
                MotionAction::Up => UserActivityType::TouchUp,
                _ => {
                    if event_time - down_time >= LONG_TOUCH_THRESHOLD {
                        UserActivityType::Touch
                    } else {
                        UserActivityType::LongTouch
                    }
                }
            }
        } else {
            UserActivityType::Button
        };
        self.poke_user_activity(event_time, activity);
        true
    }

    /// Fan the event out to every target in the current snapshot.
    pub(crate) fn dispatch_event_to_current_targets(
        &mut self,
        current_time: Nsecs,
        entry: EventId,
        resume_with_appended_sample: bool,
    ) {
        debug_assert!(self
            .store
            .get(entry)
            .map(|e| e.common().dispatch_in_progress)
            .unwrap_or(false));

        for target in self.current_targets.clone() {
            let fd = target.channel.receive_fd();
            if self.connections.contains_key(&fd) {
                self.prepare_dispatch_cycle(
                    current_time,
                    fd,
                    entry,
                    &target,
                    resume_with_appended_sample,
                );
            } else {
                tracing::warn!(
                    "delivery requested for channel '{}' which is not registered",
                    target.channel.name()
                );
            }
        }
    }

    // ========================================================================
    // Inbound batching and streaming
    // ========================================================================

    /// Fold a new move sample into an existing motion entry when possible.
    /// Returns true when the sample was absorbed and no new entry is needed.
    pub(crate) fn try_batch_or_stream_motion(
        &mut self,
        event_time: Nsecs,
        device_id: i32,
        pointer_count: usize,
        pointer_coords: &[crate::core::event::PointerCoords],
    ) -> bool {
        // Batching: append to the most recent queued motion for this device.
        // A non-move or incompatible entry for the device blocks both
        // batching and streaming.
        for &queued in self.inbound.iter().rev() {
            let Some(EventEntry::Motion(motion)) = self.store.get(queued) else {
                continue;
            };
            if motion.device_id != device_id {
                continue;
            }
            if motion.action != MotionAction::Move
                || motion.pointer_count != pointer_count
                || motion.common.injection.is_injected()
            {
                return false;
            }
            self.store.append_motion_sample(queued, event_time, pointer_coords);
            tracing::debug!(
                "batched move sample onto queued motion event for device {}",
                device_id
            );
            return true;
        }

        // Streaming: append to the synchronously dispatched motion still in
        // flight and push the sample out to the current targets.  Relies on
        // the invariant that an outbound queue holds at most one sync entry
        // and it is the tail.
        if self.current_targets_valid {
            for fd in self.active.clone() {
                let Some(connection) = self.connections.get(&fd) else {
                    continue;
                };
                let Some(tail) = connection.outbound.back() else {
                    continue;
                };
                if !tail.is_sync_target() {
                    continue;
                }
                let event = tail.event;
                let Some(EventEntry::Motion(motion)) = self.store.get(event) else {
                    return false;
                };
                if motion.action != MotionAction::Move
                    || motion.device_id != device_id
                    || motion.pointer_count != pointer_count
                    || motion.common.injection.is_injected()
                {
                    return false;
                }
                self.store.append_motion_sample(event, event_time, pointer_coords);
                tracing::debug!(
                    "streaming move sample onto in-flight motion event for device {}",
                    device_id
                );
                let current_time = now();
                self.dispatch_event_to_current_targets(current_time, event, true);
                return true;
            }
        }
        false
    }

    // ========================================================================
    // Key repeat
    // ========================================================================

    pub(crate) fn reset_key_repeat(&mut self) {
        if let Some(last) = self.key_repeat.last_key.take() {
            self.store.release(last);
        }
        self.key_repeat.next_repeat_time = NEVER;
    }

    /// Produce one synthetic repeat of the last key down.  The stored entry
    /// is mutated in place when nothing else references it.
    fn synthesize_key_repeat(&mut self, current_time: Nsecs, key_repeat_delay: Nsecs) -> EventId {
        let last = self
            .key_repeat
            .last_key
            .expect("key repeat synthesizer armed without a source key");

        let (ref_count, policy_flags) = {
            let key = self
                .store
                .get(last)
                .and_then(EventEntry::as_key)
                .expect("key repeat source is not a key");
            (key.common.ref_count, key.policy_flags & PolicyFlags::RAW_MASK)
        };

        let repeat = if ref_count == 1 {
            // Only the repeat slot holds it; recycle in place.
            if let Some(EventEntry::Key(key)) = self.store.get_mut(last) {
                key.common.event_time = current_time;
                key.common.dispatch_in_progress = false;
                key.policy_flags = policy_flags;
                key.repeat_count += 1;
                key.intercept_result = InterceptKeyResult::Unknown;
            }
            self.store.add_ref(last);
            last
        } else {
            let (device_id, source, action, flags, key_code, scan_code, meta_state, repeat_count, down_time) = {
                let key = self
                    .store
                    .get(last)
                    .and_then(EventEntry::as_key)
                    .expect("key repeat source is not a key");
                (
                    key.device_id,
                    key.source,
                    key.action,
                    key.flags,
                    key.key_code,
                    key.scan_code,
                    key.meta_state,
                    key.repeat_count,
                    key.down_time,
                )
            };
            let fresh = self.store.obtain_key(
                current_time,
                device_id,
                source,
                policy_flags,
                action,
                flags,
                key_code,
                scan_code,
                meta_state,
                repeat_count + 1,
                down_time,
            );
            // Swap the repeat slot over to the fresh entry.
            self.key_repeat.last_key = Some(fresh);
            self.store.release(last);
            self.store.add_ref(fresh);
            fresh
        };

        if let Some(EventEntry::Key(key)) = self.store.get_mut(repeat) {
            key.synthetic_repeat = true;
            if key.repeat_count == 1 {
                key.flags |= KeyFlags::LONG_PRESS;
            }
        }
        self.key_repeat.next_repeat_time = current_time + key_repeat_delay;
        tracing::debug!("synthesized key repeat at {}", current_time);
        repeat
    }

    // ========================================================================
    // Logging and user activity
    // ========================================================================

    pub(crate) fn poke_user_activity(&mut self, event_time: Nsecs, activity: UserActivityType) {
        let window_type = self.current_window_type;
        self.post_command(CommandEntry::PokeUserActivity {
            event_time,
            window_type,
            activity,
        });
    }

    fn log_outbound_key(&self, entry: EventId) {
        if let Some(EventEntry::Key(key)) = self.store.get(entry) {
            tracing::debug!(
                "dispatch_key - event_time={}, device_id={}, source={:#x}, action={:?}, flags={:?}, key_code={:#x}, scan_code={}, repeat_count={}, down_time={}",
                key.common.event_time,
                key.device_id,
                key.source,
                key.action,
                key.flags,
                key.key_code,
                key.scan_code,
                key.repeat_count,
                key.down_time
            );
        }
    }

    fn log_outbound_motion(&self, entry: EventId) {
        if let Some(EventEntry::Motion(motion)) = self.store.get(entry) {
            tracing::debug!(
                "dispatch_motion - event_time={}, device_id={}, source={:#x}, action={:?}, pointers={}, samples={}, down_time={}",
                motion.common.event_time,
                motion.device_id,
                motion.source,
                motion.action,
                motion.pointer_count,
                motion.samples.len(),
                motion.down_time
            );
        }
    }
}
