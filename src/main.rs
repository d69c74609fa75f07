// Headless smoke runner: one loopback window consumer, a stub policy, and a
// few injected events pushed through the full dispatch path.

use std::sync::Arc;

use anyhow::Result;

use tenaya::core::channel::{InputChannel, LoopbackChannel};
use tenaya::core::event::{
    source, InjectSyncMode, KeyAction, KeyFlags, MotionFlags, PointerCoords, PolicyFlags,
    DEFAULT_DISPATCHING_TIMEOUT,
};
use tenaya::core::policy::{DispatchPolicy, InputApplication, UserActivityType};
use tenaya::core::window::{window_type, InputWindow, Rect, WindowFlags};
use tenaya::util::time::{millis_to_nanos, now, Nsecs};
use tenaya::{DispatcherThread, InjectedEvent, InjectedMotionSample, InputDispatcher};

/// Stand-in window manager policy with fixed timings.
struct StubPolicy;

impl DispatchPolicy for StubPolicy {
    fn notify_configuration_changed(&self, when: Nsecs) {
        tracing::info!("policy: configuration changed at {}", when);
    }

    fn notify_anr(&self, application: &InputApplication) -> Nsecs {
        tracing::warn!("policy: application '{}' is not responding", application.name);
        0
    }

    fn notify_input_channel_broken(&self, channel: &Arc<dyn InputChannel>) {
        tracing::warn!("policy: channel '{}' broken", channel.name());
    }

    fn notify_input_channel_anr(&self, channel: &Arc<dyn InputChannel>) -> Nsecs {
        tracing::warn!("policy: channel '{}' not responding", channel.name());
        0
    }

    fn notify_input_channel_recovered(&self, channel: &Arc<dyn InputChannel>) {
        tracing::info!("policy: channel '{}' recovered", channel.name());
    }

    fn get_key_repeat_timeout(&self) -> Nsecs {
        millis_to_nanos(500)
    }

    fn get_key_repeat_delay(&self) -> Nsecs {
        millis_to_nanos(50)
    }

    fn get_max_events_per_second(&self) -> u32 {
        60
    }

    fn intercept_key_before_dispatching(
        &self,
        _channel: Option<&Arc<dyn InputChannel>>,
        key: &tenaya::core::event::KeyEventSnapshot,
        _policy_flags: PolicyFlags,
    ) -> bool {
        tracing::debug!("policy: intercept key {:#x}? no", key.key_code);
        false
    }

    fn poke_user_activity(&self, event_time: Nsecs, window_type: i32, activity: UserActivityType) {
        tracing::debug!(
            "policy: user activity {:?} at {} (window_type={})",
            activity,
            event_time,
            window_type
        );
    }

    fn check_inject_events_permission(&self, _injector_pid: i32, _injector_uid: i32) -> bool {
        true
    }
}

fn main() -> Result<()> {
    tenaya::util::logging::init();

    let dispatcher = Arc::new(InputDispatcher::new(Arc::new(StubPolicy))?);

    let (channel, consumer) = LoopbackChannel::pair("smoke-window", 32)?;
    let channel: Arc<dyn InputChannel> = channel;
    dispatcher.register_input_channel(Arc::clone(&channel), false)?;

    dispatcher.set_input_windows(vec![InputWindow {
        channel: Arc::clone(&channel),
        flags: WindowFlags::empty(),
        window_type: window_type::APPLICATION,
        dispatching_timeout: DEFAULT_DISPATCHING_TIMEOUT,
        frame: Rect::new(0, 0, 800, 600),
        visible_frame: Rect::new(0, 0, 800, 600),
        touchable_area: Rect::new(0, 0, 800, 600),
        visible: true,
        has_focus: true,
        paused: false,
        owner_pid: 1,
        owner_uid: 1000,
    }]);

    // Consumer thread: acknowledge everything the dispatcher publishes.
    let consumer_handle = std::thread::spawn(move || {
        let mut seen = 0usize;
        while seen < 4 && consumer.wait_for_signal(2000) {
            if let Some(event) = consumer.consume() {
                tracing::info!("consumer received: {:?}", event);
                seen += 1;
            }
            if consumer.finish().is_err() {
                break;
            }
        }
        seen
    });

    let thread = DispatcherThread::start(Arc::clone(&dispatcher));

    let t = now();
    for (action, offset) in [(KeyAction::Down, 0), (KeyAction::Up, 5)] {
        let result = dispatcher.inject_input_event(
            &InjectedEvent::Key {
                event_time: t + millis_to_nanos(offset),
                device_id: 1,
                source: source::KEYBOARD,
                action: action.to_raw(),
                flags: KeyFlags::empty(),
                key_code: 0x42,
                scan_code: 30,
                meta_state: 0,
                repeat_count: 0,
                down_time: t,
            },
            std::process::id() as i32,
            0,
            InjectSyncMode::WaitForFinished,
            1000,
        );
        tracing::info!("key {:?} injection result: {:?}", action, result);
    }

    let touch = |action: tenaya::core::event::MotionAction, at: Nsecs| InjectedEvent::Motion {
        device_id: 2,
        source: source::TOUCHSCREEN,
        action: action.to_raw(),
        flags: MotionFlags::empty(),
        meta_state: 0,
        edge_flags: 0,
        x_precision: 1.0,
        y_precision: 1.0,
        down_time: at,
        pointer_ids: vec![0],
        samples: vec![InjectedMotionSample {
            event_time: at,
            pointer_coords: vec![PointerCoords {
                x: 120.0,
                y: 240.0,
                pressure: 1.0,
                size: 0.2,
            }],
        }],
    };
    for action in [
        tenaya::core::event::MotionAction::Down,
        tenaya::core::event::MotionAction::Up,
    ] {
        let result = dispatcher.inject_input_event(
            &touch(action, now()),
            std::process::id() as i32,
            0,
            InjectSyncMode::WaitForFinished,
            1000,
        );
        tracing::info!("touch {:?} injection result: {:?}", action, result);
    }

    let seen = consumer_handle.join().unwrap_or(0);
    tracing::info!("consumer saw {} events", seen);

    print!("{}", dispatcher.dump());
    thread.stop();
    Ok(())
}
