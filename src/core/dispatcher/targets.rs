//! Target selection: who gets the event.
//!
//! Keys and trackball motions go to the focused window; pointer motions are
//! hit-tested against the window list and bound to a touch session.  When no
//! suitable target exists yet, the event stays pending and the dispatcher
//! waits, bounded by the application's dispatching timeout, after which the
//! policy is asked whether to keep waiting (ANR).

use std::sync::Arc;

use crate::core::connection::TargetFlags;
use crate::core::dispatcher::{
    CommandEntry, DispatchState, InputTarget, TargetWaitCause,
};
use crate::core::event::{
    EventEntry, InjectionResult, MotionAction, DEFAULT_DISPATCHING_TIMEOUT,
};
use crate::core::policy::InputApplication;
use crate::core::store::EventId;
use crate::core::window::{window_type, WindowFlags};
use crate::util::time::{Nsecs, NEVER};

/// Tri-state injection permission resolved while finding touch targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permission {
    Unknown,
    Granted,
    Denied,
}

impl DispatchState {
    /// Invalidate the target snapshot before recomputing it.
    pub(crate) fn start_finding_targets(&mut self) {
        self.current_targets_valid = false;
        self.current_targets.clear();
    }

    /// Commit the snapshot and remember the primary window's identity for
    /// interception and user-activity reporting.
    pub(crate) fn finish_finding_targets(&mut self, window: Option<usize>) {
        self.current_targets_valid = true;
        match window.and_then(|i| self.windows.get(i)) {
            Some(window) => {
                self.current_window_type = window.window_type;
                self.current_channel = Some(Arc::clone(&window.channel));
            }
            None => {
                self.current_window_type = window_type::UNKNOWN;
                self.current_channel = None;
            }
        }
        self.reset_target_wait();
    }

    pub(crate) fn reset_target_wait(&mut self) {
        self.target_wait_cause = TargetWaitCause::None;
        self.target_wait_timeout_time = NEVER;
        self.target_wait_expired = false;
    }

    /// Keep the pending event parked because its target is not ready.
    ///
    /// The first call of a wait seeds the start time; retries preserve it so
    /// the ANR clock keeps running across iterations.  Once the deadline
    /// passes, the policy is asked (via command) whether to keep waiting.
    pub(crate) fn handle_targets_not_ready(
        &mut self,
        current_time: Nsecs,
        application: Option<&InputApplication>,
        window: Option<usize>,
        next_wakeup: &mut Nsecs,
    ) -> InjectionResult {
        if application.is_none() && window.is_none() {
            if self.target_wait_cause != TargetWaitCause::SystemNotReady {
                tracing::debug!("waiting for system to become ready for input");
                self.target_wait_cause = TargetWaitCause::SystemNotReady;
                self.target_wait_start_time = current_time;
                self.target_wait_timeout_time = NEVER;
                self.target_wait_expired = false;
            }
        } else if self.target_wait_cause != TargetWaitCause::ApplicationNotReady {
            let timeout = window
                .and_then(|i| self.windows.get(i))
                .map(|w| w.dispatching_timeout)
                .or_else(|| application.map(|a| a.dispatching_timeout))
                .unwrap_or(DEFAULT_DISPATCHING_TIMEOUT);
            tracing::debug!(
                "waiting for application to become ready for input, timeout={}ns",
                timeout
            );
            self.target_wait_cause = TargetWaitCause::ApplicationNotReady;
            self.target_wait_start_time = current_time;
            self.target_wait_timeout_time = current_time.saturating_add(timeout);
            self.target_wait_expired = false;
        }

        if self.target_wait_expired {
            return InjectionResult::TimedOut;
        }

        if current_time >= self.target_wait_timeout_time {
            let channel = window
                .and_then(|i| self.windows.get(i))
                .map(|w| Arc::clone(&w.channel));
            self.post_command(CommandEntry::TargetsNotReadyTimeout {
                channel,
                application: application.cloned(),
            });
            *next_wakeup = i64::MIN;
        } else if self.target_wait_timeout_time < *next_wakeup {
            *next_wakeup = self.target_wait_timeout_time;
        }
        InjectionResult::Pending
    }

    /// Applied from the targets-not-ready timeout command once the policy
    /// has decided: extend the wait or mark it expired.
    pub(crate) fn resume_after_targets_not_ready_timeout(
        &mut self,
        current_time: Nsecs,
        new_timeout: Nsecs,
    ) {
        if self.target_wait_cause == TargetWaitCause::None {
            return;
        }
        if new_timeout > 0 {
            tracing::debug!("policy granted {}ns more to find targets", new_timeout);
            self.target_wait_timeout_time = current_time.saturating_add(new_timeout);
        } else {
            tracing::debug!("policy gave up waiting for targets");
            self.target_wait_expired = true;
        }
    }

    pub(crate) fn time_spent_waiting_for_application(&self, current_time: Nsecs) -> Nsecs {
        if self.target_wait_cause == TargetWaitCause::ApplicationNotReady {
            current_time - self.target_wait_start_time
        } else {
            0
        }
    }

    /// Leaving the frozen state forgets ANR history: the wait context is
    /// cleared and each connection's deadline recomputed from its in-flight
    /// entry.
    pub(crate) fn reset_anr_timeouts(&mut self, current_time: Nsecs) {
        self.reset_target_wait();
        for connection in self.connections.values_mut() {
            let timeout = connection
                .outbound
                .front()
                .filter(|entry| entry.in_progress)
                .map(|entry| entry.timeout);
            connection.next_timeout = match timeout {
                Some(timeout) if timeout >= 0 => current_time.saturating_add(timeout),
                _ => NEVER,
            };
        }
    }

    // ========================================================================
    // Focused-window selection (keys, trackball)
    // ========================================================================

    pub(crate) fn find_focused_window(
        &mut self,
        current_time: Nsecs,
        entry: EventId,
        next_wakeup: &mut Nsecs,
    ) -> (InjectionResult, Option<usize>) {
        let (injector_pid, injector_uid) = self.injector_of(entry);

        let Some(focused) = self.focused_window else {
            if self.focused_application.is_some() {
                let application = self.focused_application.clone();
                return (
                    self.handle_targets_not_ready(
                        current_time,
                        application.as_ref(),
                        None,
                        next_wakeup,
                    ),
                    None,
                );
            }
            tracing::warn!("dropping event, no focused window and no focused application");
            return (InjectionResult::Failed, None);
        };

        if !self.check_injection_permission(Some(focused), injector_pid, injector_uid) {
            return (InjectionResult::PermissionDenied, None);
        }

        if self.windows.get(focused).is_some_and(|w| w.paused) {
            tracing::debug!("waiting, focused window is paused");
            return (
                self.handle_targets_not_ready(current_time, None, Some(focused), next_wakeup),
                None,
            );
        }

        let time_spent = self.time_spent_waiting_for_application(current_time);
        self.add_window_target(focused, TargetFlags::SYNC, time_spent);
        (InjectionResult::Succeeded, Some(focused))
    }

    // ========================================================================
    // Touched-window selection (pointer)
    // ========================================================================

    pub(crate) fn find_touched_window(
        &mut self,
        current_time: Nsecs,
        entry: EventId,
        next_wakeup: &mut Nsecs,
    ) -> (InjectionResult, Option<usize>) {
        let Some(EventEntry::Motion(motion)) = self.store.get(entry) else {
            return (InjectionResult::Failed, None);
        };
        let action = motion.action;
        let first = motion.first_sample();
        let x = first.pointer_coords[0].x as i32;
        let y = first.pointer_coords[0].y as i32;
        let (injector_pid, injector_uid) = self.injector_of(entry);

        let mut permission = Permission::Unknown;
        let mut outside_targets: Vec<(usize, bool)> = Vec::new();
        let mut touched: Option<usize> = None;

        let result = 'find: {
            if action == MotionAction::Down {
                // Traverse front to back for the first touchable window that
                // is touch modal or contains the point, collecting
                // outside-watchers along the way.
                let mut top_error_window = None;
                let mut hit = None;
                for index in 0..self.windows.len() {
                    let flags = self.windows[index].flags;
                    if flags.contains(WindowFlags::SYSTEM_ERROR) && top_error_window.is_none() {
                        top_error_window = Some(index);
                    }
                    if !self.windows[index].visible {
                        continue;
                    }
                    if !flags.contains(WindowFlags::NOT_TOUCHABLE)
                        && (self.windows[index].is_touch_modal()
                            || self.windows[index].touchable_area_contains(x, y))
                    {
                        hit = Some(index);
                        break;
                    }
                    if flags.contains(WindowFlags::WATCH_OUTSIDE_TOUCH) {
                        outside_targets.push((index, self.is_window_obscured(index)));
                    }
                }

                if let Some(error_index) = top_error_window {
                    if hit != Some(error_index) {
                        // A system error window is up; hold touches until it
                        // is dismissed.
                        break 'find self.handle_targets_not_ready(
                            current_time,
                            None,
                            None,
                            next_wakeup,
                        );
                    }
                }

                let Some(hit_index) = hit else {
                    if self.focused_application.is_some() {
                        let application = self.focused_application.clone();
                        break 'find self.handle_targets_not_ready(
                            current_time,
                            application.as_ref(),
                            None,
                            next_wakeup,
                        );
                    }
                    tracing::warn!("dropping touch at ({}, {}), no touchable window", x, y);
                    break 'find InjectionResult::Failed;
                };

                if !self.check_injection_permission(Some(hit_index), injector_pid, injector_uid) {
                    permission = Permission::Denied;
                    break 'find InjectionResult::PermissionDenied;
                }
                permission = Permission::Granted;

                if self.windows[hit_index].paused {
                    tracing::debug!("waiting, touched window is paused");
                    break 'find self.handle_targets_not_ready(
                        current_time,
                        None,
                        Some(hit_index),
                        next_wakeup,
                    );
                }

                // Start a new touch session.
                self.touched_window = Some(hit_index);
                self.touched_window_obscured = self.is_window_obscured(hit_index);
                self.touched_wallpaper_windows =
                    if self.windows[hit_index].flags.contains(WindowFlags::HAS_WALLPAPER) {
                        (0..self.windows.len())
                            .filter(|&i| self.windows[i].window_type == window_type::WALLPAPER)
                            .collect()
                    } else {
                        Vec::new()
                    };
                touched = Some(hit_index);
                InjectionResult::Succeeded
            } else {
                // Non-down events bind to the existing touch session.
                if !self.touch_down {
                    tracing::warn!("dropping stray {:?} event, no touch in progress", action);
                    break 'find InjectionResult::Failed;
                }
                let Some(touched_index) = self.touched_window else {
                    tracing::warn!("dropping {:?} event, touched window is gone", action);
                    break 'find InjectionResult::Failed;
                };
                if !self.check_injection_permission(
                    Some(touched_index),
                    injector_pid,
                    injector_uid,
                ) {
                    permission = Permission::Denied;
                    break 'find InjectionResult::PermissionDenied;
                }
                permission = Permission::Granted;
                if self.windows[touched_index].paused {
                    tracing::debug!("waiting, touched window is paused");
                    break 'find self.handle_targets_not_ready(
                        current_time,
                        None,
                        Some(touched_index),
                        next_wakeup,
                    );
                }
                touched = Some(touched_index);
                InjectionResult::Succeeded
            }
        };

        if result == InjectionResult::Succeeded {
            let time_spent = self.time_spent_waiting_for_application(current_time);
            for index in self.touched_wallpaper_windows.clone() {
                self.add_window_target(index, TargetFlags::WINDOW_IS_OBSCURED, 0);
            }
            for (index, obscured) in &outside_targets {
                let mut flags = TargetFlags::OUTSIDE;
                if *obscured {
                    flags |= TargetFlags::WINDOW_IS_OBSCURED;
                }
                self.add_window_target(*index, flags, 0);
            }
            let primary = touched.expect("successful touch selection without a window");
            let mut flags = TargetFlags::SYNC;
            if self.touched_window_obscured {
                flags |= TargetFlags::WINDOW_IS_OBSCURED;
            }
            self.add_window_target(primary, flags, time_spent);
        }

        // Resolve permission once and for all, then settle the session.
        // Skipped while the event is parked waiting for its target.
        if result != InjectionResult::Pending {
            if permission == Permission::Unknown {
                let window = if action == MotionAction::Down {
                    None
                } else {
                    self.touched_window
                };
                permission = if self.check_injection_permission(window, injector_pid, injector_uid)
                {
                    Permission::Granted
                } else {
                    Permission::Denied
                };
            }
            if permission == Permission::Granted {
                match action {
                    MotionAction::Down => {
                        if self.touch_down {
                            tracing::warn!("pointer down received while already down");
                        } else {
                            self.touch_down = true;
                        }
                        if result != InjectionResult::Succeeded {
                            // No target for this down; an older session must
                            // not leak into the new gesture.
                            self.release_touched_window();
                        }
                    }
                    MotionAction::Up | MotionAction::Cancel => {
                        self.touch_down = false;
                        self.release_touched_window();
                    }
                    _ => {}
                }
            } else {
                tracing::warn!("not updating touch session, injection was denied");
            }
        }

        (result, touched)
    }

    // ========================================================================
    // Shared helpers
    // ========================================================================

    fn injector_of(&self, entry: EventId) -> (i32, i32) {
        self.store
            .get(entry)
            .map(|e| {
                let injection = &e.common().injection;
                (injection.injector_pid, injection.injector_uid)
            })
            .unwrap_or((-1, -1))
    }

    pub(crate) fn add_window_target(
        &mut self,
        index: usize,
        flags: TargetFlags,
        time_spent_waiting: Nsecs,
    ) {
        let Some(window) = self.windows.get(index) else {
            return;
        };
        self.current_targets.push(InputTarget {
            channel: Arc::clone(&window.channel),
            flags,
            timeout: window.dispatching_timeout,
            time_spent_waiting,
            x_offset: -(window.frame.left as f32),
            y_offset: -(window.frame.top as f32),
        });
    }

    pub(crate) fn add_monitoring_targets(&mut self) {
        for channel in &self.monitoring_channels {
            self.current_targets.push(InputTarget {
                channel: Arc::clone(channel),
                flags: TargetFlags::empty(),
                timeout: -1,
                time_spent_waiting: 0,
                x_offset: 0.0,
                y_offset: 0.0,
            });
        }
    }

    /// Whether `injector` may deliver into `window`.  Non-injected events
    /// and events injected into the injector's own windows always may; the
    /// rest is the policy's call.  Safe with the lock held per the policy's
    /// non-reentrancy contract.
    pub(crate) fn check_injection_permission(
        &self,
        window: Option<usize>,
        injector_pid: i32,
        injector_uid: i32,
    ) -> bool {
        if injector_pid < 0 {
            return true;
        }
        if let Some(window) = window.and_then(|i| self.windows.get(i)) {
            if window.owner_uid == injector_uid {
                return true;
            }
        }
        let granted = self
            .policy
            .check_inject_events_permission(injector_pid, injector_uid);
        if !granted {
            tracing::warn!(
                "permission denied: injection from pid={}, uid={}",
                injector_pid,
                injector_uid
            );
        }
        granted
    }

    /// True when any window above `index` is visible and its visible frame
    /// overlaps the window's visible frame.
    pub(crate) fn is_window_obscured(&self, index: usize) -> bool {
        let window = &self.windows[index];
        self.windows[..index]
            .iter()
            .any(|above| above.visible && above.visible_frame_intersects(window))
    }
}
