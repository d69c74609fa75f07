// Tenaya Input Dispatcher
// Copyright (c) 2026
//
// Rust-first input-event dispatch core for the Tenaya compositor stack.
// The reader pushes raw key and pointer events in; the dispatcher selects
// the consumer window, serializes delivery per channel, enforces response
// deadlines, and reports unresponsive applications to the policy.

pub mod core;
pub mod prelude;
pub mod util;

pub use crate::core::channel::{InputChannel, LoopbackChannel, LoopbackConsumer};
pub use crate::core::dispatcher::{InjectedEvent, InjectedMotionSample, InputDispatcher};
pub use crate::core::policy::{DispatchPolicy, InputApplication, UserActivityType};
pub use crate::core::runtime::DispatcherThread;
pub use crate::core::window::InputWindow;
