//! Input windows: the hit-testable regions supplied by the window manager.

use std::sync::Arc;

use bitflags::bitflags;

use crate::core::channel::InputChannel;
use crate::util::time::Nsecs;

bitflags! {
    /// Window layout flags relevant to input targeting.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WindowFlags: u32 {
        const NOT_FOCUSABLE = 0x0000_0008;
        const NOT_TOUCHABLE = 0x0000_0010;
        const NOT_TOUCH_MODAL = 0x0000_0020;
        const WATCH_OUTSIDE_TOUCH = 0x0004_0000;
        const HAS_WALLPAPER = 0x0010_0000;
        const SYSTEM_ERROR = 0x4000_0000;
    }
}

/// Window types relevant to the dispatcher.
pub mod window_type {
    pub const UNKNOWN: i32 = -1;
    pub const BASE_APPLICATION: i32 = 1;
    pub const APPLICATION: i32 = 2;
    pub const SYSTEM_ERROR: i32 = 2010;
    pub const WALLPAPER: i32 = 2013;
}

/// Integer rectangle, exclusive on the right and bottom edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.left < other.right
            && other.left < self.right
            && self.top < other.bottom
            && other.top < self.bottom
    }
}

/// The window manager's description of one input-receiving window.
///
/// Window lists are replaced wholesale by `set_input_windows`; hit-test
/// order is list order, front-most first.
#[derive(Clone)]
pub struct InputWindow {
    pub channel: Arc<dyn InputChannel>,
    pub flags: WindowFlags,
    pub window_type: i32,
    /// Per-window dispatch deadline, or < 0 for no deadline.
    pub dispatching_timeout: Nsecs,
    /// Full window frame in screen coordinates.
    pub frame: Rect,
    /// The part of the frame actually visible to the user.
    pub visible_frame: Rect,
    /// The region that accepts touches.
    pub touchable_area: Rect,
    pub visible: bool,
    pub has_focus: bool,
    pub paused: bool,
    pub owner_pid: i32,
    pub owner_uid: i32,
}

impl InputWindow {
    pub fn touchable_area_contains(&self, x: i32, y: i32) -> bool {
        self.touchable_area.contains(x, y)
    }

    pub fn visible_frame_intersects(&self, other: &InputWindow) -> bool {
        self.visible_frame.intersects(&other.visible_frame)
    }

    /// Touch-modal windows take every touch regardless of position.
    pub fn is_touch_modal(&self) -> bool {
        !self
            .flags
            .intersects(WindowFlags::NOT_FOCUSABLE | WindowFlags::NOT_TOUCH_MODAL)
    }

    pub fn receive_fd(&self) -> std::os::unix::io::RawFd {
        self.channel.receive_fd()
    }
}

impl std::fmt::Debug for InputWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputWindow")
            .field("channel", &self.channel.name())
            .field("flags", &self.flags)
            .field("window_type", &self.window_type)
            .field("frame", &self.frame)
            .field("visible", &self.visible)
            .field("has_focus", &self.has_focus)
            .field("paused", &self.paused)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_contains() {
        let r = Rect::new(10, 10, 20, 20);
        assert!(r.contains(10, 10));
        assert!(r.contains(19, 19));
        assert!(!r.contains(20, 10));
        assert!(!r.contains(9, 15));
    }

    #[test]
    fn test_rect_intersects() {
        let a = Rect::new(0, 0, 10, 10);
        assert!(a.intersects(&Rect::new(5, 5, 15, 15)));
        assert!(!a.intersects(&Rect::new(10, 0, 20, 10)));
        assert!(!a.intersects(&Rect::new(0, 10, 10, 20)));
    }
}
