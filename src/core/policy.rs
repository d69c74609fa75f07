//! Dispatch policy interface.
//!
//! The policy is the window manager's voice inside the dispatcher: it
//! decides ANR grace periods, key interception, injection permission, and
//! repeat timing.  It may block or re-enter the dispatcher, so the
//! dispatcher only ever calls it from deferred commands with the state lock
//! released, except for the getters documented as non-reentrant below.

use std::sync::Arc;

use crate::core::channel::InputChannel;
use crate::core::event::{KeyEventSnapshot, PolicyFlags};
use crate::util::time::Nsecs;

/// User-activity classes reported to the power manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserActivityType {
    Button,
    Touch,
    TouchUp,
    LongTouch,
}

/// An application able to receive input, as described by the window manager.
#[derive(Debug, Clone)]
pub struct InputApplication {
    pub name: Arc<str>,
    pub dispatching_timeout: Nsecs,
    /// Opaque window-manager token, passed back through ANR callbacks.
    pub token: u64,
}

/// Callbacks from the dispatcher to the window manager and power manager.
pub trait DispatchPolicy: Send + Sync {
    /// A configuration change event reached the head of the queue.
    fn notify_configuration_changed(&self, when: Nsecs);

    /// The focused application did not provide a window in time.
    /// Returns a new timeout to keep waiting, or <= 0 to give up.
    fn notify_anr(&self, application: &InputApplication) -> Nsecs;

    /// A channel suffered an unrecoverable transport error.
    fn notify_input_channel_broken(&self, channel: &Arc<dyn InputChannel>);

    /// A consumer missed its dispatch deadline.
    /// Returns a new timeout to keep waiting, or <= 0 to give up.
    fn notify_input_channel_anr(&self, channel: &Arc<dyn InputChannel>) -> Nsecs;

    /// A previously unresponsive consumer finished its in-flight event.
    fn notify_input_channel_recovered(&self, channel: &Arc<dyn InputChannel>);

    /// Initial auto-repeat delay, or < 0 to disable key repeat entirely.
    fn get_key_repeat_timeout(&self) -> Nsecs;

    /// Delay between successive synthesized repeats.
    fn get_key_repeat_delay(&self) -> Nsecs;

    /// Suggested ceiling on motion deliveries per second, per device.
    fn get_max_events_per_second(&self) -> u32;

    /// Give the policy a chance to consume a key before it is published.
    /// Returns true when the key was consumed.
    fn intercept_key_before_dispatching(
        &self,
        channel: Option<&Arc<dyn InputChannel>>,
        key: &KeyEventSnapshot,
        policy_flags: PolicyFlags,
    ) -> bool;

    /// Report user activity for an event delivered to a window.
    fn poke_user_activity(&self, event_time: Nsecs, window_type: i32, activity: UserActivityType);

    /// Whether `injector_pid`/`injector_uid` may inject events into other
    /// applications.  Contract: non-reentrant and safe to call with the
    /// dispatcher lock held.
    fn check_inject_events_permission(&self, injector_pid: i32, injector_uid: i32) -> bool;
}
