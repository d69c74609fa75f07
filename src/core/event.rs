//! Event entries and the constants of the input wire format.
//!
//! Every event flowing through the dispatcher is one of three variants:
//! a configuration change, a key, or a motion.  Motion entries carry a
//! non-empty list of samples so that successive move reports can be batched
//! onto one entry while it waits in a queue.

use bitflags::bitflags;

use crate::util::time::{Nsecs, NANOS_PER_MILLI, NANOS_PER_SECOND};

/// Maximum number of simultaneous pointers tracked per motion event.
pub const MAX_POINTERS: usize = 10;

/// Per-window dispatching timeout applied when none is configured.
pub const DEFAULT_DISPATCHING_TIMEOUT: Nsecs = 5 * NANOS_PER_SECOND;

/// How long after an app-switch key release the dispatcher keeps shedding
/// stale work so the incoming application can take over input quickly.
pub const APP_SWITCH_TIMEOUT: Nsecs = 500 * NANOS_PER_MILLI;

/// Age boundary between plain-touch and long-touch user activity pokes.
pub const LONG_TOUCH_THRESHOLD: Nsecs = 300 * NANOS_PER_MILLI;

/// Key codes with dispatcher-level meaning.
pub mod keycodes {
    pub const HOME: i32 = 3;
    pub const ENDCALL: i32 = 6;
}

/// Input source bits.  The low byte classifies the device; full source ids
/// combine a class with a device discriminator.
pub mod source {
    pub const CLASS_MASK: u32 = 0x0000_00ff;
    pub const CLASS_BUTTON: u32 = 0x0000_0001;
    pub const CLASS_POINTER: u32 = 0x0000_0002;
    pub const CLASS_TRACKBALL: u32 = 0x0000_0004;
    pub const CLASS_POSITION: u32 = 0x0000_0008;

    pub const KEYBOARD: u32 = 0x0000_0101;
    pub const TOUCHSCREEN: u32 = 0x0000_1002;
    pub const MOUSE: u32 = 0x0000_2002;
    pub const TRACKBALL: u32 = 0x0001_0004;

    /// True if the source reports absolute pointer coordinates.
    pub fn is_pointer(source: u32) -> bool {
        source & CLASS_POINTER != 0
    }
}

/// Key event action, integer-compatible with the wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum KeyAction {
    Down = 0,
    Up = 1,
}

impl KeyAction {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Down),
            1 => Some(Self::Up),
            _ => None,
        }
    }

    pub fn to_raw(self) -> i32 {
        self as i32
    }
}

/// Motion event action, integer-compatible with the wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MotionAction {
    Down = 0,
    Up = 1,
    Move = 2,
    Cancel = 3,
    Outside = 4,
}

impl MotionAction {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Down),
            1 => Some(Self::Up),
            2 => Some(Self::Move),
            3 => Some(Self::Cancel),
            4 => Some(Self::Outside),
            _ => None,
        }
    }

    pub fn to_raw(self) -> i32 {
        self as i32
    }
}

bitflags! {
    /// Key event flags delivered to consumers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KeyFlags: u32 {
        const FROM_SYSTEM = 0x0008;
        const CANCELED = 0x0020;
        const VIRTUAL_HARD_KEY = 0x0040;
        const LONG_PRESS = 0x0080;
    }
}

bitflags! {
    /// Motion event flags delivered to consumers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MotionFlags: u32 {
        const WINDOW_IS_OBSCURED = 0x0001;
    }
}

bitflags! {
    /// Policy flags attached to events by the reader or the dispatcher.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PolicyFlags: u32 {
        const WAKE = 0x0000_0001;
        const WAKE_DROPPED = 0x0000_0002;
        const SHIFT = 0x0000_0004;
        const CAPS_LOCK = 0x0000_0008;
        const ALT = 0x0000_0010;
        const ALT_GR = 0x0000_0020;
        const MENU = 0x0000_0040;
        const LAUNCHER = 0x0000_0080;
        /// Bits that survive a synthesized key repeat.
        const RAW_MASK = 0x0000_ffff;
        /// Set on events that entered through `inject_input_event`.
        const INJECTED = 0x0100_0000;
    }
}

/// Result of an input event injection, integer-compatible with the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum InjectionResult {
    /// Outcome not yet known (internal use only).
    Pending = -1,
    Succeeded = 0,
    PermissionDenied = 1,
    Failed = 2,
    TimedOut = 3,
}

/// Synchronization mode for `inject_input_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum InjectSyncMode {
    /// Fire and forget; injection is assumed successful.
    None = 0,
    /// Wait until the dispatcher has determined the injection outcome.
    WaitForResult = 1,
    /// Wait until every synchronous dispatch of the event has finished.
    WaitForFinished = 2,
}

/// Outcome of the policy's pre-dispatch key interception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptKeyResult {
    /// Policy has not been consulted yet.
    Unknown,
    /// Policy consumed the key; drop it without publishing.
    Skip,
    /// Deliver the key normally.
    Continue,
}

/// Coordinates and contact data for one pointer in one sample.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PointerCoords {
    pub x: f32,
    pub y: f32,
    pub pressure: f32,
    pub size: f32,
}

/// One time-stamped set of coordinates for every pointer of a motion event.
#[derive(Debug, Clone, Copy)]
pub struct MotionSample {
    pub event_time: Nsecs,
    pub pointer_coords: [PointerCoords; MAX_POINTERS],
}

/// Injection bookkeeping shared by all event variants.
#[derive(Debug, Clone, Copy)]
pub struct InjectionState {
    pub result: InjectionResult,
    /// True when the injector did not wait for the result.
    pub is_async: bool,
    pub injector_pid: i32,
    pub injector_uid: i32,
}

impl InjectionState {
    pub fn is_injected(&self) -> bool {
        self.injector_pid >= 0
    }
}

/// Fields shared by every event entry.
#[derive(Debug, Clone, Copy)]
pub struct EventCommon {
    pub event_time: Nsecs,
    /// Number of live references: queues, dispatch entries, the pending
    /// slot, the repeat source slot, and any waiting injector.
    pub ref_count: u32,
    /// Set once the dispatcher has started routing this event; first-touch
    /// work (logging, repeat bookkeeping) must run exactly once.
    pub dispatch_in_progress: bool,
    pub injection: InjectionState,
    /// Synchronous dispatch entries still in flight for this event.
    pub pending_sync_dispatches: u32,
}

impl EventCommon {
    pub fn new(event_time: Nsecs) -> Self {
        Self {
            event_time,
            ref_count: 1,
            dispatch_in_progress: false,
            injection: InjectionState {
                result: InjectionResult::Pending,
                is_async: false,
                injector_pid: -1,
                injector_uid: -1,
            },
            pending_sync_dispatches: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigChangedEntry {
    pub common: EventCommon,
}

#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub common: EventCommon,
    pub device_id: i32,
    pub source: u32,
    pub policy_flags: PolicyFlags,
    pub action: KeyAction,
    pub flags: KeyFlags,
    pub key_code: i32,
    pub scan_code: i32,
    pub meta_state: i32,
    pub repeat_count: i32,
    pub down_time: Nsecs,
    /// True for repeats synthesized by the dispatcher's own timer.
    pub synthetic_repeat: bool,
    pub intercept_result: InterceptKeyResult,
}

#[derive(Debug, Clone)]
pub struct MotionEntry {
    pub common: EventCommon,
    pub device_id: i32,
    pub source: u32,
    pub policy_flags: PolicyFlags,
    pub action: MotionAction,
    pub flags: MotionFlags,
    pub meta_state: i32,
    pub edge_flags: i32,
    pub x_precision: f32,
    pub y_precision: f32,
    pub down_time: Nsecs,
    pub pointer_count: usize,
    pub pointer_ids: [i32; MAX_POINTERS],
    /// Sample history, oldest first.  Never empty; index 0 is the sample the
    /// event was created with.  Append-only for the life of the entry.
    pub samples: Vec<MotionSample>,
}

impl MotionEntry {
    pub fn first_sample(&self) -> &MotionSample {
        &self.samples[0]
    }

    pub fn last_sample(&self) -> &MotionSample {
        self.samples.last().expect("motion entry with no samples")
    }

    pub fn last_sample_index(&self) -> usize {
        self.samples.len() - 1
    }

    pub fn is_pointer_event(&self) -> bool {
        source::is_pointer(self.source)
    }
}

/// A queued input event.
#[derive(Debug, Clone)]
pub enum EventEntry {
    ConfigChanged(ConfigChangedEntry),
    Key(KeyEntry),
    Motion(MotionEntry),
}

impl EventEntry {
    pub fn common(&self) -> &EventCommon {
        match self {
            EventEntry::ConfigChanged(e) => &e.common,
            EventEntry::Key(e) => &e.common,
            EventEntry::Motion(e) => &e.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut EventCommon {
        match self {
            EventEntry::ConfigChanged(e) => &mut e.common,
            EventEntry::Key(e) => &mut e.common,
            EventEntry::Motion(e) => &mut e.common,
        }
    }

    pub fn event_time(&self) -> Nsecs {
        self.common().event_time
    }

    pub fn is_injected(&self) -> bool {
        self.common().injection.is_injected()
    }

    pub fn as_key(&self) -> Option<&KeyEntry> {
        match self {
            EventEntry::Key(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_key_mut(&mut self) -> Option<&mut KeyEntry> {
        match self {
            EventEntry::Key(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_motion(&self) -> Option<&MotionEntry> {
        match self {
            EventEntry::Motion(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_motion_mut(&mut self) -> Option<&mut MotionEntry> {
        match self {
            EventEntry::Motion(e) => Some(e),
            _ => None,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            EventEntry::ConfigChanged(_) => "config-changed",
            EventEntry::Key(_) => "key",
            EventEntry::Motion(_) => "motion",
        }
    }
}

/// Flat copy of a key entry handed to the policy for interception.
#[derive(Debug, Clone, Copy)]
pub struct KeyEventSnapshot {
    pub event_time: Nsecs,
    pub device_id: i32,
    pub source: u32,
    pub action: KeyAction,
    pub flags: KeyFlags,
    pub key_code: i32,
    pub scan_code: i32,
    pub meta_state: i32,
    pub repeat_count: i32,
    pub down_time: Nsecs,
}

impl KeyEventSnapshot {
    pub fn of(entry: &KeyEntry) -> Self {
        Self {
            event_time: entry.common.event_time,
            device_id: entry.device_id,
            source: entry.source,
            action: entry.action,
            flags: entry.flags,
            key_code: entry.key_code,
            scan_code: entry.scan_code,
            meta_state: entry.meta_state,
            repeat_count: entry.repeat_count,
            down_time: entry.down_time,
        }
    }
}

/// True for keys that begin an application switch.
pub fn is_app_switch_key(key_code: i32) -> bool {
    key_code == keycodes::HOME || key_code == keycodes::ENDCALL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_raw_round_trip() {
        assert_eq!(KeyAction::from_raw(0), Some(KeyAction::Down));
        assert_eq!(KeyAction::from_raw(1), Some(KeyAction::Up));
        assert_eq!(KeyAction::from_raw(7), None);
        assert_eq!(MotionAction::from_raw(4), Some(MotionAction::Outside));
        assert_eq!(MotionAction::from_raw(-1), None);
        assert_eq!(MotionAction::Cancel.to_raw(), 3);
    }

    #[test]
    fn test_source_classification() {
        assert!(source::is_pointer(source::TOUCHSCREEN));
        assert!(source::is_pointer(source::MOUSE));
        assert!(!source::is_pointer(source::KEYBOARD));
        assert!(!source::is_pointer(source::TRACKBALL));
    }

    #[test]
    fn test_common_initial_state() {
        let common = EventCommon::new(42);
        assert_eq!(common.event_time, 42);
        assert_eq!(common.ref_count, 1);
        assert_eq!(common.injection.result, InjectionResult::Pending);
        assert!(!common.injection.is_injected());
        assert_eq!(common.pending_sync_dispatches, 0);
    }

    #[test]
    fn test_app_switch_keys() {
        assert!(is_app_switch_key(keycodes::HOME));
        assert!(is_app_switch_key(keycodes::ENDCALL));
        assert!(!is_app_switch_key(0x42));
    }
}
