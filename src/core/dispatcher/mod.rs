//! The input dispatcher.
//!
//! A single long-lived service: raw events arrive from the reader threads,
//! one dispatcher thread routes them to per-window consumer channels,
//! serializes delivery per consumer, enforces response deadlines, and
//! reports unresponsive consumers to the policy.
//!
//! Locking model: one mutex guards all dispatcher state.  The policy can
//! block or re-enter the dispatcher, so it is never called with that lock
//! held; policy interactions are deferred onto the command queue and run
//! after the lock is released (the non-reentrant getters documented in
//! [`crate::core::policy::DispatchPolicy`] are the only exception).

mod commands;
mod cycle;
mod dispatch;
mod inject;
mod targets;
#[cfg(test)]
mod tests;

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};

use anyhow::Context;

use crate::core::channel::InputChannel;
use crate::core::connection::{Connection, ConnectionStatus, TargetFlags};
use crate::core::errors::RegistrationError;
use crate::core::event::{
    is_app_switch_key, EventEntry, InjectionResult, KeyAction, KeyFlags, MotionAction,
    MotionFlags, PointerCoords, PolicyFlags, APP_SWITCH_TIMEOUT,
};
use crate::core::looper::Looper;
use crate::core::policy::{DispatchPolicy, InputApplication};
use crate::core::store::{EventId, EventStore};
use crate::core::window::{window_type, InputWindow};
use crate::util::time::{now, Nsecs, NANOS_PER_SECOND, NEVER};

pub use commands::CommandEntry;
pub use inject::{InjectedEvent, InjectedMotionSample};

/// One delivery request: which channel, how, and within what deadline.
#[derive(Clone)]
pub struct InputTarget {
    pub channel: Arc<dyn InputChannel>,
    pub flags: TargetFlags,
    /// Delivery deadline, or < 0 to wait indefinitely.
    pub timeout: Nsecs,
    /// Time already burned waiting for the application; shortens the
    /// first-cycle deadline of the primary target only.
    pub time_spent_waiting: Nsecs,
    pub x_offset: f32,
    pub y_offset: f32,
}

/// Why the dispatcher is holding the pending event back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetWaitCause {
    None,
    SystemNotReady,
    ApplicationNotReady,
}

/// Motion delivery rate limiting, per (device, source).
#[derive(Debug)]
pub(crate) struct ThrottleState {
    pub min_time_between_events: Nsecs,
    pub last_event_time: Nsecs,
    pub last_device_id: i32,
    pub last_source: u32,
}

/// Auto-repeat bookkeeping for the most recent key down.
#[derive(Debug, Default)]
pub(crate) struct KeyRepeatState {
    pub last_key: Option<EventId>,
    pub next_repeat_time: Nsecs,
}

/// Everything guarded by the dispatcher lock.
pub(crate) struct DispatchState {
    /// Only the non-reentrant policy getters may be called through this
    /// reference; everything else goes through the command queue.
    pub policy: Arc<dyn DispatchPolicy>,
    pub store: EventStore,
    pub pending_event: Option<EventId>,
    pub inbound: VecDeque<EventId>,
    pub commands: VecDeque<CommandEntry>,

    /// Registered connections keyed by receive fd.
    pub connections: HashMap<RawFd, Connection>,
    /// Receive fds of connections with a non-empty outbound queue.
    pub active: Vec<RawFd>,
    pub monitoring_channels: Vec<Arc<dyn InputChannel>>,

    pub dispatch_enabled: bool,
    pub dispatch_frozen: bool,

    /// Hit-test order: front-most window first.
    pub windows: Vec<InputWindow>,
    pub focused_window: Option<usize>,
    pub focused_application: Option<InputApplication>,

    // Touch session: binds non-down pointer events to the window that
    // received the down.
    pub touch_down: bool,
    pub touched_window: Option<usize>,
    pub touched_window_obscured: bool,
    pub touched_wallpaper_windows: Vec<usize>,

    // Target snapshot, valid only while one event is being routed.
    pub current_targets_valid: bool,
    pub current_targets: Vec<InputTarget>,
    pub current_window_type: i32,
    pub current_channel: Option<Arc<dyn InputChannel>>,

    pub target_wait_cause: TargetWaitCause,
    pub target_wait_start_time: Nsecs,
    pub target_wait_timeout_time: Nsecs,
    pub target_wait_expired: bool,

    pub throttle: ThrottleState,
    pub key_repeat: KeyRepeatState,
    pub app_switch_due_time: Nsecs,

    // Condition variables shared with the dispatcher facade so state
    // methods can wake injection waiters directly.
    pub injection_result_available: Arc<Condvar>,
    pub injection_sync_finished: Arc<Condvar>,
}

/// The dispatcher facade shared between the dispatcher thread and producer
/// threads (reader, window manager, injectors).
pub struct InputDispatcher {
    pub(crate) policy: Arc<dyn DispatchPolicy>,
    pub(crate) looper: Looper,
    pub(crate) state: Mutex<DispatchState>,
    pub(crate) injection_result_available: Arc<Condvar>,
    pub(crate) injection_sync_finished: Arc<Condvar>,
}

impl InputDispatcher {
    pub fn new(policy: Arc<dyn DispatchPolicy>) -> anyhow::Result<Self> {
        let looper = Looper::new().context("failed to create dispatcher looper")?;

        let max_events_per_second = policy.get_max_events_per_second().max(1);
        let throttle = ThrottleState {
            min_time_between_events: NANOS_PER_SECOND / max_events_per_second as i64,
            last_event_time: 0,
            last_device_id: -1,
            last_source: 0,
        };

        let injection_result_available = Arc::new(Condvar::new());
        let injection_sync_finished = Arc::new(Condvar::new());

        let state = DispatchState {
            policy: Arc::clone(&policy),
            store: EventStore::new(),
            pending_event: None,
            inbound: VecDeque::new(),
            commands: VecDeque::new(),
            connections: HashMap::new(),
            active: Vec::new(),
            monitoring_channels: Vec::new(),
            dispatch_enabled: true,
            dispatch_frozen: false,
            windows: Vec::new(),
            focused_window: None,
            focused_application: None,
            touch_down: false,
            touched_window: None,
            touched_window_obscured: false,
            touched_wallpaper_windows: Vec::new(),
            current_targets_valid: false,
            current_targets: Vec::new(),
            current_window_type: window_type::UNKNOWN,
            current_channel: None,
            target_wait_cause: TargetWaitCause::None,
            target_wait_start_time: 0,
            target_wait_timeout_time: NEVER,
            target_wait_expired: false,
            throttle,
            key_repeat: KeyRepeatState {
                last_key: None,
                next_repeat_time: NEVER,
            },
            app_switch_due_time: NEVER,
            injection_result_available: Arc::clone(&injection_result_available),
            injection_sync_finished: Arc::clone(&injection_sync_finished),
        };

        Ok(Self {
            policy,
            looper,
            state: Mutex::new(state),
            injection_result_available,
            injection_sync_finished,
        })
    }

    // ========================================================================
    // Reader ingress
    // ========================================================================

    pub fn notify_configuration_changed(&self, event_time: Nsecs) {
        tracing::debug!("notify_configuration_changed - event_time={}", event_time);
        let needs_wake = {
            let mut state = self.state.lock().unwrap();
            let entry = state.store.obtain_configuration_changed(event_time);
            state.enqueue_inbound_event(entry)
        };
        if needs_wake {
            self.looper.wake();
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn notify_key(
        &self,
        event_time: Nsecs,
        device_id: i32,
        source: u32,
        policy_flags: PolicyFlags,
        action: KeyAction,
        flags: KeyFlags,
        key_code: i32,
        scan_code: i32,
        meta_state: i32,
        down_time: Nsecs,
    ) {
        tracing::debug!(
            "notify_key - event_time={}, device_id={}, source={:#x}, action={:?}, key_code={:#x}, scan_code={}",
            event_time, device_id, source, action, key_code, scan_code
        );
        let needs_wake = {
            let mut state = self.state.lock().unwrap();
            let entry = state.store.obtain_key(
                event_time,
                device_id,
                source,
                policy_flags,
                action,
                flags,
                key_code,
                scan_code,
                meta_state,
                0,
                down_time,
            );
            state.enqueue_inbound_event(entry)
        };
        if needs_wake {
            self.looper.wake();
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn notify_motion(
        &self,
        event_time: Nsecs,
        device_id: i32,
        source: u32,
        policy_flags: PolicyFlags,
        action: MotionAction,
        flags: MotionFlags,
        meta_state: i32,
        edge_flags: i32,
        pointer_ids: &[i32],
        pointer_coords: &[PointerCoords],
        x_precision: f32,
        y_precision: f32,
        down_time: Nsecs,
    ) {
        tracing::debug!(
            "notify_motion - event_time={}, device_id={}, source={:#x}, action={:?}, pointers={}",
            event_time, device_id, source, action, pointer_ids.len()
        );
        let needs_wake = {
            let mut state = self.state.lock().unwrap();

            if action == MotionAction::Move
                && state.try_batch_or_stream_motion(
                    event_time,
                    device_id,
                    pointer_ids.len(),
                    pointer_coords,
                )
            {
                // Sample was folded into an existing entry; commands may
                // have been queued by the streaming path.
                drop(state);
                self.run_commands();
                return;
            }

            let entry = state.store.obtain_motion(
                event_time,
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
                pointer_ids,
                pointer_coords,
            );
            state.enqueue_inbound_event(entry)
        };
        if needs_wake {
            self.looper.wake();
        }
    }

    // ========================================================================
    // Window manager ingress
    // ========================================================================

    pub fn set_input_windows(&self, windows: Vec<InputWindow>) {
        tracing::debug!("set_input_windows - count={}", windows.len());
        {
            let mut state = self.state.lock().unwrap();

            let touched_fd = state
                .touched_window
                .and_then(|i| state.windows.get(i))
                .map(|w| w.receive_fd());
            let wallpaper_fds: Vec<RawFd> = state
                .touched_wallpaper_windows
                .iter()
                .filter_map(|&i| state.windows.get(i))
                .map(|w| w.receive_fd())
                .collect();

            state.windows = windows;
            state.focused_window = state.windows.iter().position(|w| w.has_focus);

            // Re-resolve the touch session against the new list; tear it
            // down if the touched window is gone or no longer visible.
            if let Some(fd) = touched_fd {
                let resolved = state
                    .windows
                    .iter()
                    .position(|w| w.receive_fd() == fd && w.visible);
                match resolved {
                    Some(index) => state.touched_window = Some(index),
                    None => {
                        tracing::debug!("touched window disappeared, releasing touch session");
                        state.release_touched_window();
                    }
                }
            }
            state.touched_wallpaper_windows = wallpaper_fds
                .iter()
                .filter_map(|&fd| state.windows.iter().position(|w| w.receive_fd() == fd))
                .collect();
        }
        self.looper.wake();
    }

    pub fn set_focused_application(&self, application: Option<InputApplication>) {
        tracing::debug!(
            "set_focused_application - {:?}",
            application.as_ref().map(|a| a.name.as_ref())
        );
        self.state.lock().unwrap().focused_application = application;
        self.looper.wake();
    }

    pub fn set_input_dispatch_mode(&self, enabled: bool, frozen: bool) {
        tracing::debug!("set_input_dispatch_mode - enabled={}, frozen={}", enabled, frozen);
        let changed = {
            let mut state = self.state.lock().unwrap();
            let changed = state.dispatch_enabled != enabled || state.dispatch_frozen != frozen;
            let thawed = state.dispatch_frozen && !frozen;
            state.dispatch_enabled = enabled;
            state.dispatch_frozen = frozen;
            if thawed {
                state.reset_anr_timeouts(now());
            }
            changed
        };
        if changed {
            self.looper.wake();
        }
    }

    /// Demote every pending synchronous dispatch to asynchronous so the next
    /// application can start receiving input without waiting for the old one.
    pub fn preempt_input_dispatch(&self) {
        tracing::debug!("preempt_input_dispatch");
        let preempted = {
            let mut state = self.state.lock().unwrap();
            let mut preempted = false;
            for fd in state.active.clone() {
                if state
                    .connections
                    .get(&fd)
                    .is_some_and(|c| c.has_pending_sync_target())
                {
                    state.demote_sync_tail(fd);
                    preempted = true;
                }
            }
            preempted
        };
        if preempted {
            self.looper.wake();
        }
    }

    pub fn register_input_channel(
        &self,
        channel: Arc<dyn InputChannel>,
        monitor: bool,
    ) -> Result<(), RegistrationError> {
        tracing::debug!("register_input_channel - '{}', monitor={}", channel.name(), monitor);
        let fd = channel.receive_fd();
        {
            let mut state = self.state.lock().unwrap();
            if state.connections.contains_key(&fd) {
                tracing::warn!(
                    "attempted to register already registered input channel '{}'",
                    channel.name()
                );
                return Err(RegistrationError::AlreadyRegistered(channel.name().to_string()));
            }
            state
                .connections
                .insert(fd, Connection::new(Arc::clone(&channel), monitor));
            if monitor {
                state.monitoring_channels.push(Arc::clone(&channel));
            }
        }
        self.looper.add_fd(fd);
        Ok(())
    }

    pub fn unregister_input_channel(
        &self,
        channel: &Arc<dyn InputChannel>,
    ) -> Result<(), RegistrationError> {
        tracing::debug!("unregister_input_channel - '{}'", channel.name());
        let fd = channel.receive_fd();
        {
            let mut state = self.state.lock().unwrap();
            if !state.connections.contains_key(&fd) {
                tracing::warn!(
                    "attempted to unregister unknown input channel '{}'",
                    channel.name()
                );
                return Err(RegistrationError::NotRegistered(channel.name().to_string()));
            }

            // Zombie first: the abort below must not post a broken-channel
            // notification for a deliberate unregistration.
            if let Some(connection) = state.connections.get_mut(&fd) {
                connection.status = ConnectionStatus::Zombie;
            }
            state.abort_dispatch_cycle(now(), fd, true);
            state.connections.remove(&fd);
            state.monitoring_channels.retain(|c| c.receive_fd() != fd);
        }
        self.looper.remove_fd(fd);
        // The channel may have held the only pending sync target.
        self.looper.wake();
        Ok(())
    }

    /// Wake the dispatcher thread out of its poll.
    pub fn wake(&self) {
        self.looper.wake();
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Multi-line report of the dispatcher state.
    pub fn dump(&self) -> String {
        let state = self.state.lock().unwrap();
        let mut out = String::new();
        let _ = writeln!(out, "Input Dispatcher State:");
        let _ = writeln!(
            out,
            "  dispatch_enabled={}, dispatch_frozen={}",
            state.dispatch_enabled, state.dispatch_frozen
        );
        let _ = writeln!(
            out,
            "  focused_application={:?}",
            state.focused_application.as_ref().map(|a| a.name.as_ref())
        );
        let _ = writeln!(
            out,
            "  focused_window={:?}",
            state
                .focused_window
                .and_then(|i| state.windows.get(i))
                .map(|w| w.channel.name().to_string())
        );
        let _ = writeln!(
            out,
            "  touch_down={}, touched_window={:?}, touched_window_obscured={}",
            state.touch_down,
            state
                .touched_window
                .and_then(|i| state.windows.get(i))
                .map(|w| w.channel.name().to_string()),
            state.touched_window_obscured
        );
        let _ = writeln!(out, "  windows: {}", state.windows.len());
        for window in &state.windows {
            let _ = writeln!(
                out,
                "    '{}' type={} flags={:?} frame={:?} visible={} focus={} paused={}",
                window.channel.name(),
                window.window_type,
                window.flags,
                window.frame,
                window.visible,
                window.has_focus,
                window.paused
            );
        }
        let _ = writeln!(out, "  monitoring_channels: {}", state.monitoring_channels.len());
        for channel in &state.monitoring_channels {
            let _ = writeln!(out, "    '{}'", channel.name());
        }
        let _ = writeln!(out, "  connections: {}", state.connections.len());
        for connection in state.connections.values() {
            let _ = writeln!(
                out,
                "    '{}' status={} monitor={} outbound={} next_timeout={}",
                connection.name(),
                connection.status.label(),
                connection.monitor,
                connection.outbound.len(),
                connection.next_timeout
            );
        }
        let _ = writeln!(
            out,
            "  inbound_queue={}, command_queue={}, live_events={}",
            state.inbound.len(),
            state.commands.len(),
            state.store.live_count()
        );
        let _ = writeln!(
            out,
            "  app_switch_due_time={}, key_repeat_armed={}",
            state.app_switch_due_time,
            state.key_repeat.last_key.is_some()
        );
        let _ = writeln!(
            out,
            "  target_wait: cause={:?} expired={}",
            state.target_wait_cause, state.target_wait_expired
        );
        out
    }
}

impl DispatchState {
    /// Append an event to the inbound queue, arming the app-switch shedding
    /// window for reliable app-switch key releases.  Returns true when the
    /// looper should be woken.
    pub(crate) fn enqueue_inbound_event(&mut self, entry: EventId) -> bool {
        let was_empty = self.inbound.is_empty();
        let mut armed = false;

        if let Some(EventEntry::Key(key)) = self.store.get(entry) {
            if key.action == KeyAction::Up
                && is_app_switch_key(key.key_code)
                && self.is_event_from_reliable_source(entry)
            {
                self.app_switch_due_time = key.common.event_time + APP_SWITCH_TIMEOUT;
                armed = true;
                tracing::debug!(
                    "app switch key {:#x} released, due at {}",
                    key.key_code,
                    self.app_switch_due_time
                );
            }
        }

        self.inbound.push_back(entry);
        was_empty || armed
    }

    /// Injected events are reliable only when they came from the system.
    pub(crate) fn is_event_from_reliable_source(&self, entry: EventId) -> bool {
        self.store
            .get(entry)
            .map(|e| {
                let injection = &e.common().injection;
                !injection.is_injected() || injection.injector_uid == 0
            })
            .unwrap_or(false)
    }

    pub(crate) fn activate_connection(&mut self, fd: RawFd) {
        if !self.active.contains(&fd) {
            self.active.push(fd);
        }
    }

    pub(crate) fn deactivate_connection(&mut self, fd: RawFd) {
        self.active.retain(|&active| active != fd);
    }

    /// Clear SYNC on the tail of a connection's outbound queue, releasing
    /// any injector waiting on the event's synchronous completion.
    pub(crate) fn demote_sync_tail(&mut self, fd: RawFd) {
        let mut demoted = None;
        if let Some(connection) = self.connections.get_mut(&fd) {
            if let Some(entry) = connection.outbound.back_mut() {
                if entry.is_sync_target() {
                    entry.target_flags.remove(TargetFlags::SYNC);
                    demoted = Some(entry.event);
                    tracing::debug!(
                        "channel '{}' ~ demoted pending synchronous dispatch to asynchronous",
                        connection.name()
                    );
                }
            }
        }
        if let Some(event) = demoted {
            self.decrement_pending_sync_dispatches(event);
        }
    }

    pub(crate) fn release_touched_window(&mut self) {
        self.touched_window = None;
        self.touched_window_obscured = false;
        self.touched_wallpaper_windows.clear();
    }

    pub(crate) fn set_injection_result(&mut self, entry: EventId, result: InjectionResult) {
        let Some(event) = self.store.get_mut(entry) else {
            return;
        };
        let common = event.common_mut();
        if common.injection.is_injected() {
            tracing::debug!(
                "setting injection result {:?} for injector pid={}, uid={}",
                result,
                common.injection.injector_pid,
                common.injection.injector_uid
            );
            common.injection.result = result;
            self.injection_result_available.notify_all();
        }
    }

    pub(crate) fn decrement_pending_sync_dispatches(&mut self, entry: EventId) {
        let Some(event) = self.store.get_mut(entry) else {
            return;
        };
        let common = event.common_mut();
        debug_assert!(common.pending_sync_dispatches > 0);
        common.pending_sync_dispatches = common.pending_sync_dispatches.saturating_sub(1);
        if common.pending_sync_dispatches == 0 && common.injection.is_injected() {
            self.injection_sync_finished.notify_all();
        }
    }

    /// Drop one reference from an event leaving a queue.  Dropped events
    /// fail their injection so waiters are not left hanging.
    pub(crate) fn release_inbound_event(&mut self, entry: EventId, dropped: bool) {
        if dropped {
            self.set_injection_result(entry, InjectionResult::Failed);
        }
        self.store.release(entry);
    }

    /// Release the pending slot.  The target snapshot deliberately survives:
    /// it is what motion streaming delivers through until the next event
    /// begins finding targets.
    pub(crate) fn release_pending_event(&mut self, dropped: bool) {
        if let Some(entry) = self.pending_event.take() {
            self.release_inbound_event(entry, dropped);
        }
        self.reset_target_wait();
    }

    pub(crate) fn drain_inbound_queue(&mut self) {
        while let Some(entry) = self.inbound.pop_front() {
            self.release_inbound_event(entry, true);
        }
    }
}
