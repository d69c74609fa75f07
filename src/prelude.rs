//! Common imports and types used throughout Tenaya.

pub use std::collections::HashMap;
pub use std::sync::{Arc, Mutex};

pub use crate::core::channel::InputChannel;
pub use crate::core::dispatcher::InputDispatcher;
pub use crate::core::event::{InjectSyncMode, InjectionResult, KeyAction, MotionAction};
pub use crate::core::policy::DispatchPolicy;
pub use crate::util::time::{now, Nsecs};
