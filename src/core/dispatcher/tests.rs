//! End-to-end dispatcher tests against loopback channels and a scripted
//! stub policy.  Most tests drive the loop manually with `pump` for
//! deterministic interleaving; a wake is queued first so `dispatch_once`
//! never parks in its poll.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::core::channel::{
    AppendedSample, ConsumedEvent, InputChannel, KeyPublication, LoopbackChannel,
    LoopbackConsumer, MotionPublication,
};
use crate::core::connection::ConnectionStatus;
use crate::core::dispatcher::{InjectedEvent, InjectedMotionSample, InputDispatcher};
use crate::core::event::{
    keycodes, source, InjectSyncMode, InjectionResult, KeyAction, KeyEventSnapshot, KeyFlags,
    MotionAction, MotionFlags, PointerCoords, PolicyFlags, DEFAULT_DISPATCHING_TIMEOUT,
};
use crate::core::policy::{DispatchPolicy, InputApplication, UserActivityType};
use crate::core::runtime::DispatcherThread;
use crate::core::window::{window_type, InputWindow, Rect, WindowFlags};
use crate::util::time::{millis_to_nanos, now, Nsecs};

// ============================================================================
// Test policy
// ============================================================================

struct TestPolicyState {
    key_repeat_timeout: Nsecs,
    key_repeat_delay: Nsecs,
    max_events_per_second: u32,
    permission_granted: bool,
    consume_key_codes: Vec<i32>,
    channel_anr_responses: VecDeque<Nsecs>,
    application_anr_responses: VecDeque<Nsecs>,

    config_changes: Vec<Nsecs>,
    broken_channels: Vec<String>,
    recovered_channels: Vec<String>,
    channel_anrs: Vec<String>,
    application_anrs: Vec<String>,
    intercepted_keys: Vec<i32>,
    pokes: Vec<UserActivityType>,
}

struct TestPolicy(Mutex<TestPolicyState>);

impl TestPolicy {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(TestPolicyState {
            key_repeat_timeout: -1,
            key_repeat_delay: millis_to_nanos(50),
            max_events_per_second: 1_000_000,
            permission_granted: true,
            consume_key_codes: Vec::new(),
            channel_anr_responses: VecDeque::new(),
            application_anr_responses: VecDeque::new(),
            config_changes: Vec::new(),
            broken_channels: Vec::new(),
            recovered_channels: Vec::new(),
            channel_anrs: Vec::new(),
            application_anrs: Vec::new(),
            intercepted_keys: Vec::new(),
            pokes: Vec::new(),
        })))
    }

    fn with<R>(&self, f: impl FnOnce(&mut TestPolicyState) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }
}

impl DispatchPolicy for TestPolicy {
    fn notify_configuration_changed(&self, when: Nsecs) {
        self.with(|s| s.config_changes.push(when));
    }

    fn notify_anr(&self, application: &InputApplication) -> Nsecs {
        self.with(|s| {
            s.application_anrs.push(application.name.to_string());
            s.application_anr_responses.pop_front().unwrap_or(0)
        })
    }

    fn notify_input_channel_broken(&self, channel: &Arc<dyn InputChannel>) {
        self.with(|s| s.broken_channels.push(channel.name().to_string()));
    }

    fn notify_input_channel_anr(&self, channel: &Arc<dyn InputChannel>) -> Nsecs {
        self.with(|s| {
            s.channel_anrs.push(channel.name().to_string());
            s.channel_anr_responses.pop_front().unwrap_or(0)
        })
    }

    fn notify_input_channel_recovered(&self, channel: &Arc<dyn InputChannel>) {
        self.with(|s| s.recovered_channels.push(channel.name().to_string()));
    }

    fn get_key_repeat_timeout(&self) -> Nsecs {
        self.with(|s| s.key_repeat_timeout)
    }

    fn get_key_repeat_delay(&self) -> Nsecs {
        self.with(|s| s.key_repeat_delay)
    }

    fn get_max_events_per_second(&self) -> u32 {
        self.with(|s| s.max_events_per_second)
    }

    fn intercept_key_before_dispatching(
        &self,
        _channel: Option<&Arc<dyn InputChannel>>,
        key: &KeyEventSnapshot,
        _policy_flags: PolicyFlags,
    ) -> bool {
        self.with(|s| {
            s.intercepted_keys.push(key.key_code);
            s.consume_key_codes.contains(&key.key_code)
        })
    }

    fn poke_user_activity(&self, _event_time: Nsecs, _window_type: i32, activity: UserActivityType) {
        self.with(|s| s.pokes.push(activity));
    }

    fn check_inject_events_permission(&self, _injector_pid: i32, _injector_uid: i32) -> bool {
        self.with(|s| s.permission_granted)
    }
}

// ============================================================================
// Harness helpers
// ============================================================================

fn dispatcher_with(policy: &Arc<TestPolicy>) -> Arc<InputDispatcher> {
    Arc::new(InputDispatcher::new(Arc::clone(policy) as Arc<dyn DispatchPolicy>).unwrap())
}

/// One loop iteration that cannot park: a wake is queued first.
fn pump(dispatcher: &InputDispatcher) {
    dispatcher.wake();
    dispatcher.dispatch_once();
}

fn pump_n(dispatcher: &InputDispatcher, times: usize) {
    for _ in 0..times {
        pump(dispatcher);
    }
}

fn test_window(
    channel: &Arc<dyn InputChannel>,
    frame: Rect,
    flags: WindowFlags,
    has_focus: bool,
) -> InputWindow {
    InputWindow {
        channel: Arc::clone(channel),
        flags,
        window_type: window_type::APPLICATION,
        dispatching_timeout: DEFAULT_DISPATCHING_TIMEOUT,
        frame,
        visible_frame: frame,
        touchable_area: frame,
        visible: true,
        has_focus,
        paused: false,
        owner_pid: 100,
        owner_uid: 10001,
    }
}

fn key_event(action: KeyAction, key_code: i32, t: Nsecs) -> InjectedEvent {
    InjectedEvent::Key {
        event_time: t,
        device_id: 1,
        source: source::KEYBOARD,
        action: action.to_raw(),
        flags: KeyFlags::empty(),
        key_code,
        scan_code: key_code + 100,
        meta_state: 0,
        repeat_count: 0,
        down_time: t,
    }
}

fn touch_event(action: MotionAction, x: f32, y: f32, t: Nsecs) -> InjectedEvent {
    InjectedEvent::Motion {
        device_id: 2,
        source: source::TOUCHSCREEN,
        action: action.to_raw(),
        flags: MotionFlags::empty(),
        meta_state: 0,
        edge_flags: 0,
        x_precision: 1.0,
        y_precision: 1.0,
        down_time: t,
        pointer_ids: vec![0],
        samples: vec![InjectedMotionSample {
            event_time: t,
            pointer_coords: vec![PointerCoords {
                x,
                y,
                pressure: 1.0,
                size: 0.1,
            }],
        }],
    }
}

fn coords(x: f32, y: f32) -> PointerCoords {
    PointerCoords {
        x,
        y,
        pressure: 1.0,
        size: 0.1,
    }
}

fn expect_key(consumer: &LoopbackConsumer) -> KeyPublication {
    assert!(consumer.wait_for_signal(2000), "no dispatch signal arrived");
    match consumer.consume().expect("nothing was published") {
        ConsumedEvent::Key(key) => key,
        other => panic!("expected a key publication, got {:?}", other),
    }
}

fn expect_motion(consumer: &LoopbackConsumer) -> (MotionPublication, Vec<AppendedSample>) {
    assert!(consumer.wait_for_signal(2000), "no dispatch signal arrived");
    match consumer.consume().expect("nothing was published") {
        ConsumedEvent::Motion {
            publication,
            appended,
        } => (publication, appended),
        other => panic!("expected a motion publication, got {:?}", other),
    }
}

fn quiet(consumer: &LoopbackConsumer) -> bool {
    !consumer.wait_for_signal(50)
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

#[test]
fn test_basic_key_reaches_focused_window() {
    let policy = TestPolicy::new();
    let dispatcher = dispatcher_with(&policy);

    let (channel, consumer) = LoopbackChannel::pair("c1", 8).unwrap();
    let channel: Arc<dyn InputChannel> = channel;
    dispatcher.register_input_channel(Arc::clone(&channel), false).unwrap();
    dispatcher.set_input_windows(vec![test_window(
        &channel,
        Rect::new(0, 0, 100, 100),
        WindowFlags::empty(),
        true,
    )]);

    let thread = DispatcherThread::start(Arc::clone(&dispatcher));

    let injector = {
        let dispatcher = Arc::clone(&dispatcher);
        std::thread::spawn(move || {
            dispatcher.inject_input_event(
                &key_event(KeyAction::Down, 0x42, now()),
                1,
                1000,
                InjectSyncMode::WaitForFinished,
                2000,
            )
        })
    };

    let key = expect_key(&consumer);
    assert_eq!(key.action, KeyAction::Down);
    assert_eq!(key.key_code, 0x42);
    consumer.finish().unwrap();

    assert_eq!(injector.join().unwrap(), InjectionResult::Succeeded);
    assert_eq!(policy.with(|s| s.intercepted_keys.clone()), vec![0x42]);
    assert_eq!(policy.with(|s| s.pokes.clone()), vec![UserActivityType::Button]);
    thread.stop();
}

#[test]
fn test_touch_down_routes_outside_and_primary() {
    let policy = TestPolicy::new();
    let dispatcher = dispatcher_with(&policy);

    // w1 watches for touches landing elsewhere; w2 will take the down.
    let (w1_channel, w1_consumer) = LoopbackChannel::pair("w1", 8).unwrap();
    let (w2_channel, w2_consumer) = LoopbackChannel::pair("w2", 8).unwrap();
    let w1_channel: Arc<dyn InputChannel> = w1_channel;
    let w2_channel: Arc<dyn InputChannel> = w2_channel;
    dispatcher.register_input_channel(Arc::clone(&w1_channel), false).unwrap();
    dispatcher.register_input_channel(Arc::clone(&w2_channel), false).unwrap();
    dispatcher.set_input_windows(vec![
        test_window(
            &w1_channel,
            Rect::new(0, 0, 10, 10),
            WindowFlags::NOT_TOUCH_MODAL | WindowFlags::WATCH_OUTSIDE_TOUCH,
            false,
        ),
        test_window(
            &w2_channel,
            Rect::new(20, 20, 30, 30),
            WindowFlags::NOT_TOUCH_MODAL,
            false,
        ),
    ]);

    let result = dispatcher.inject_input_event(
        &touch_event(MotionAction::Down, 25.0, 25.0, now()),
        1,
        1000,
        InjectSyncMode::None,
        0,
    );
    assert_eq!(result, InjectionResult::Succeeded);
    pump(&dispatcher);

    // The watcher sees the down as an outside action with its own offset.
    let (outside, _) = expect_motion(&w1_consumer);
    assert_eq!(outside.action, MotionAction::Outside);
    assert_eq!(outside.x_offset, 0.0);
    w1_consumer.finish().unwrap();

    // The hit window receives the down, offset into window coordinates.
    let (down, _) = expect_motion(&w2_consumer);
    assert_eq!(down.action, MotionAction::Down);
    assert_eq!(down.x_offset, -20.0);
    assert_eq!(down.y_offset, -20.0);
    assert_eq!(down.pointer_coords[0], coords(25.0, 25.0));
    w2_consumer.finish().unwrap();

    {
        let state = dispatcher.state.lock().unwrap();
        assert!(state.touch_down);
        let touched = state.touched_window.expect("touch session missing");
        assert_eq!(state.windows[touched].channel.name(), "w2");
    }

    // Drain the finished signals, then release the touch.
    pump_n(&dispatcher, 2);
    dispatcher
        .inject_input_event(
            &touch_event(MotionAction::Up, 25.0, 25.0, now()),
            1,
            1000,
            InjectSyncMode::None,
            0,
        );
    pump(&dispatcher);
    let (up, _) = expect_motion(&w2_consumer);
    assert_eq!(up.action, MotionAction::Up);
    w2_consumer.finish().unwrap();
    pump_n(&dispatcher, 2);

    {
        let state = dispatcher.state.lock().unwrap();
        assert!(!state.touch_down);
        assert!(state.touched_window.is_none());
        assert_eq!(state.store.live_count(), 0);
    }
}

#[test]
fn test_motion_streaming_appends_to_in_flight_event() {
    let policy = TestPolicy::new();
    let dispatcher = dispatcher_with(&policy);

    let (channel, consumer) = LoopbackChannel::pair("w", 8).unwrap();
    let channel: Arc<dyn InputChannel> = channel;
    dispatcher.register_input_channel(Arc::clone(&channel), false).unwrap();
    dispatcher.set_input_windows(vec![test_window(
        &channel,
        Rect::new(0, 0, 100, 100),
        WindowFlags::NOT_TOUCH_MODAL,
        true,
    )]);

    let t = now();
    let ids = [0i32];

    // Establish the touch session.
    dispatcher.notify_motion(
        t, 2, source::TOUCHSCREEN, PolicyFlags::empty(), MotionAction::Down,
        MotionFlags::empty(), 0, 0, &ids, &[coords(5.0, 5.0)], 1.0, 1.0, t,
    );
    pump(&dispatcher);
    let (down, _) = expect_motion(&consumer);
    assert_eq!(down.action, MotionAction::Down);
    consumer.finish().unwrap();
    pump_n(&dispatcher, 2);

    // First move: published, left unacknowledged so the cycle stays open.
    dispatcher.notify_motion(
        t + 1, 2, source::TOUCHSCREEN, PolicyFlags::empty(), MotionAction::Move,
        MotionFlags::empty(), 0, 0, &ids, &[coords(6.0, 6.0)], 1.0, 1.0, t,
    );
    pump(&dispatcher);
    assert!(consumer.wait_for_signal(2000));

    // Second move: streamed into the open cycle, no new publication.
    dispatcher.notify_motion(
        t + 2, 2, source::TOUCHSCREEN, PolicyFlags::empty(), MotionAction::Move,
        MotionFlags::empty(), 0, 0, &ids, &[coords(7.0, 7.0)], 1.0, 1.0, t,
    );

    let (movement, appended) = expect_motion(&consumer);
    assert_eq!(movement.action, MotionAction::Move);
    assert_eq!(movement.pointer_coords[0], coords(6.0, 6.0));
    assert_eq!(appended.len(), 1);
    assert_eq!(appended[0].pointer_coords[0], coords(7.0, 7.0));
    consumer.finish().unwrap();
    pump_n(&dispatcher, 2);
    assert!(quiet(&consumer));
}

#[test]
fn test_motion_batching_onto_queued_move() {
    let policy = TestPolicy::new();
    let dispatcher = dispatcher_with(&policy);

    let (channel, consumer) = LoopbackChannel::pair("w", 8).unwrap();
    let channel: Arc<dyn InputChannel> = channel;
    dispatcher.register_input_channel(Arc::clone(&channel), false).unwrap();
    dispatcher.set_input_windows(vec![test_window(
        &channel,
        Rect::new(0, 0, 100, 100),
        WindowFlags::NOT_TOUCH_MODAL,
        true,
    )]);

    let t = now();
    let ids = [0i32];

    // Touch session, acknowledged.
    dispatcher.notify_motion(
        t, 2, source::TOUCHSCREEN, PolicyFlags::empty(), MotionAction::Down,
        MotionFlags::empty(), 0, 0, &ids, &[coords(5.0, 5.0)], 1.0, 1.0, t,
    );
    pump(&dispatcher);
    expect_motion(&consumer);
    consumer.finish().unwrap();
    pump_n(&dispatcher, 2);

    // A key dispatch holds the queue synchronously...
    dispatcher.notify_key(
        t + 1, 1, source::KEYBOARD, PolicyFlags::empty(), KeyAction::Down,
        KeyFlags::empty(), 0x42, 142, 0, t + 1,
    );
    pump_n(&dispatcher, 2);
    assert_eq!(expect_key(&consumer).key_code, 0x42);

    // ...so both moves fold into a single queued motion entry.
    for (i, x) in [(2i64, 6.0f32), (3, 7.0)] {
        dispatcher.notify_motion(
            t + i, 2, source::TOUCHSCREEN, PolicyFlags::empty(), MotionAction::Move,
            MotionFlags::empty(), 0, 0, &ids, &[coords(x, x)], 1.0, 1.0, t,
        );
        pump(&dispatcher);
    }
    {
        let state = dispatcher.state.lock().unwrap();
        assert_eq!(state.inbound.len(), 1);
        let motion = state
            .store
            .get(state.inbound[0])
            .unwrap()
            .as_motion()
            .unwrap();
        assert_eq!(motion.samples.len(), 2);
    }

    // Acknowledge the key; the batched move goes out with both samples.
    consumer.finish().unwrap();
    pump_n(&dispatcher, 2);
    let (movement, appended) = expect_motion(&consumer);
    assert_eq!(movement.pointer_coords[0], coords(6.0, 6.0));
    assert_eq!(appended.len(), 1);
    assert_eq!(appended[0].pointer_coords[0], coords(7.0, 7.0));
    consumer.finish().unwrap();
    pump_n(&dispatcher, 2);
}

#[test]
fn test_anr_extension_give_up_and_cancellation() {
    let policy = TestPolicy::new();
    policy.with(|s| {
        s.channel_anr_responses = VecDeque::from([millis_to_nanos(80), 0]);
    });
    let dispatcher = dispatcher_with(&policy);

    let (channel, consumer) = LoopbackChannel::pair("w3", 8).unwrap();
    let channel: Arc<dyn InputChannel> = channel;
    dispatcher.register_input_channel(Arc::clone(&channel), false).unwrap();
    let mut window = test_window(&channel, Rect::new(0, 0, 100, 100), WindowFlags::empty(), true);
    window.dispatching_timeout = millis_to_nanos(80);
    dispatcher.set_input_windows(vec![window]);

    dispatcher.inject_input_event(
        &key_event(KeyAction::Down, 0x41, now()),
        1,
        1000,
        InjectSyncMode::None,
        0,
    );
    pump_n(&dispatcher, 2);
    assert!(consumer.wait_for_signal(2000));

    // First deadline miss: the policy grants more time.
    std::thread::sleep(std::time::Duration::from_millis(100));
    pump(&dispatcher);
    assert_eq!(policy.with(|s| s.channel_anrs.len()), 1);
    {
        let state = dispatcher.state.lock().unwrap();
        let connection = state.connections.values().next().unwrap();
        assert_eq!(connection.status, ConnectionStatus::Normal);
    }

    // Second miss: the policy gives up; the backlog is shed and the
    // in-flight head stops blocking.
    std::thread::sleep(std::time::Duration::from_millis(100));
    pump(&dispatcher);
    assert_eq!(policy.with(|s| s.channel_anrs.len()), 2);
    {
        let state = dispatcher.state.lock().unwrap();
        let connection = state.connections.values().next().unwrap();
        assert_eq!(connection.status, ConnectionStatus::NotResponding);
        assert_eq!(connection.outbound.len(), 1);
        assert!(!connection.outbound[0].is_sync_target());
        assert!(connection.input_state.is_out_of_sync());
    }

    // The consumer finally wakes up and acknowledges.
    match consumer.consume().unwrap() {
        ConsumedEvent::Key(key) => assert_eq!(key.action, KeyAction::Down),
        other => panic!("unexpected event {:?}", other),
    }
    consumer.finish().unwrap();
    pump_n(&dispatcher, 2);
    assert_eq!(policy.with(|s| s.recovered_channels.clone()), vec!["w3"]);
    {
        let state = dispatcher.state.lock().unwrap();
        let connection = state.connections.values().next().unwrap();
        assert_eq!(connection.status, ConnectionStatus::Normal);
    }

    // The next key is preceded by a synthesized cancellation of the stuck
    // down so the consumer's view is consistent again.
    dispatcher.inject_input_event(
        &key_event(KeyAction::Up, 0x41, now()),
        1,
        1000,
        InjectSyncMode::None,
        0,
    );
    pump_n(&dispatcher, 2);

    let cancel = expect_key(&consumer);
    assert_eq!(cancel.action, KeyAction::Up);
    assert!(cancel.flags.contains(KeyFlags::CANCELED));
    assert_eq!(cancel.key_code, 0x41);
    consumer.finish().unwrap();
    pump_n(&dispatcher, 2);

    let up = expect_key(&consumer);
    assert_eq!(up.action, KeyAction::Up);
    assert!(!up.flags.contains(KeyFlags::CANCELED));
    consumer.finish().unwrap();
    pump_n(&dispatcher, 2);

    assert_eq!(dispatcher.state.lock().unwrap().store.live_count(), 0);
}

#[test]
fn test_app_switch_sheds_stale_work() {
    let policy = TestPolicy::new();
    policy.with(|s| s.consume_key_codes.push(keycodes::HOME));
    let dispatcher = dispatcher_with(&policy);

    let (slow_channel, slow_consumer) = LoopbackChannel::pair("w-slow", 8).unwrap();
    let (new_channel, new_consumer) = LoopbackChannel::pair("w-new", 8).unwrap();
    let slow_channel: Arc<dyn InputChannel> = slow_channel;
    let new_channel: Arc<dyn InputChannel> = new_channel;
    dispatcher.register_input_channel(Arc::clone(&slow_channel), false).unwrap();
    dispatcher.register_input_channel(Arc::clone(&new_channel), false).unwrap();
    dispatcher.set_input_windows(vec![test_window(
        &slow_channel,
        Rect::new(0, 0, 100, 100),
        WindowFlags::empty(),
        true,
    )]);

    // A key the slow window never acknowledges: its sync dispatch pends.
    dispatcher.inject_input_event(
        &key_event(KeyAction::Down, 0x41, now()),
        1,
        1000,
        InjectSyncMode::None,
        0,
    );
    pump_n(&dispatcher, 2);
    assert!(slow_consumer.wait_for_signal(2000));

    // A later key queues behind the pending sync dispatch.
    let blocked_injector = {
        let dispatcher = Arc::clone(&dispatcher);
        std::thread::spawn(move || {
            dispatcher.inject_input_event(
                &key_event(KeyAction::Down, 0x55, now()),
                1,
                1000,
                InjectSyncMode::WaitForResult,
                2000,
            )
        })
    };
    std::thread::sleep(std::time::Duration::from_millis(50));

    // HOME released 600ms ago: the shedding window is already overdue.
    let past = now() - millis_to_nanos(600);
    dispatcher.notify_key(
        past,
        1,
        source::KEYBOARD,
        PolicyFlags::empty(),
        KeyAction::Up,
        KeyFlags::empty(),
        keycodes::HOME,
        103,
        0,
        past - millis_to_nanos(10),
    );
    pump_n(&dispatcher, 4);

    // The stale key was dropped, the pending sync demoted, and HOME itself
    // was consumed by the policy.
    assert_eq!(blocked_injector.join().unwrap(), InjectionResult::Failed);
    {
        let state = dispatcher.state.lock().unwrap();
        let fd = slow_channel.receive_fd();
        let connection = &state.connections[&fd];
        assert_eq!(connection.outbound.len(), 1);
        assert!(!connection.outbound[0].is_sync_target());
        assert_eq!(state.app_switch_due_time, crate::util::time::NEVER);
    }
    assert!(policy.with(|s| s.intercepted_keys.contains(&keycodes::HOME)));

    // Focus moves on; the new window receives input although the old one
    // still has not acknowledged.
    dispatcher.set_input_windows(vec![test_window(
        &new_channel,
        Rect::new(0, 0, 100, 100),
        WindowFlags::empty(),
        true,
    )]);
    dispatcher.inject_input_event(
        &key_event(KeyAction::Down, 0x56, now()),
        1,
        1000,
        InjectSyncMode::None,
        0,
    );
    pump_n(&dispatcher, 2);
    assert_eq!(expect_key(&new_consumer).key_code, 0x56);
    new_consumer.finish().unwrap();
    pump(&dispatcher);
}

// ============================================================================
// Focused behaviors
// ============================================================================

#[test]
fn test_preempt_makes_pending_sync_async() {
    let policy = TestPolicy::new();
    let dispatcher = dispatcher_with(&policy);

    let (channel, consumer) = LoopbackChannel::pair("w", 8).unwrap();
    let channel: Arc<dyn InputChannel> = channel;
    dispatcher.register_input_channel(Arc::clone(&channel), false).unwrap();
    dispatcher.set_input_windows(vec![test_window(
        &channel,
        Rect::new(0, 0, 100, 100),
        WindowFlags::empty(),
        true,
    )]);

    dispatcher.inject_input_event(
        &key_event(KeyAction::Down, 0x41, now()),
        1,
        1000,
        InjectSyncMode::None,
        0,
    );
    pump_n(&dispatcher, 2);
    assert!(consumer.wait_for_signal(2000));

    dispatcher.preempt_input_dispatch();

    // With the sync target demoted, the next event flows immediately.
    dispatcher.inject_input_event(
        &key_event(KeyAction::Down, 0x42, now()),
        1,
        1000,
        InjectSyncMode::None,
        0,
    );
    pump_n(&dispatcher, 2);
    {
        let state = dispatcher.state.lock().unwrap();
        let connection = state.connections.values().next().unwrap();
        assert_eq!(connection.outbound.len(), 2);
        // The demoted entry no longer blocks; the new event forms its own
        // sync tail.
        assert!(!connection.outbound[0].is_sync_target());
        assert!(connection.outbound[1].is_sync_target());
    }
}

#[test]
fn test_key_repeat_synthesis_and_disable() {
    let policy = TestPolicy::new();
    policy.with(|s| {
        s.key_repeat_timeout = millis_to_nanos(50);
        s.key_repeat_delay = millis_to_nanos(30);
    });
    let dispatcher = dispatcher_with(&policy);

    let (channel, consumer) = LoopbackChannel::pair("w", 8).unwrap();
    let channel: Arc<dyn InputChannel> = channel;
    dispatcher.register_input_channel(Arc::clone(&channel), false).unwrap();
    dispatcher.set_input_windows(vec![test_window(
        &channel,
        Rect::new(0, 0, 100, 100),
        WindowFlags::empty(),
        true,
    )]);

    dispatcher.notify_key(
        now(), 1, source::KEYBOARD, PolicyFlags::empty(), KeyAction::Down,
        KeyFlags::empty(), 0x42, 142, 0, now(),
    );
    pump_n(&dispatcher, 2);
    let first = expect_key(&consumer);
    assert_eq!(first.repeat_count, 0);
    consumer.finish().unwrap();
    pump_n(&dispatcher, 2);

    // Past the repeat timeout, a synthetic repeat is delivered.
    std::thread::sleep(std::time::Duration::from_millis(70));
    pump_n(&dispatcher, 2);
    let repeat = expect_key(&consumer);
    assert_eq!(repeat.action, KeyAction::Down);
    assert_eq!(repeat.repeat_count, 1);
    assert!(repeat.flags.contains(KeyFlags::LONG_PRESS));
    consumer.finish().unwrap();
    pump_n(&dispatcher, 2);

    // Disabling repeat drops the synthesizer state.
    policy.with(|s| s.key_repeat_timeout = -1);
    std::thread::sleep(std::time::Duration::from_millis(70));
    pump_n(&dispatcher, 2);
    assert!(quiet(&consumer));
    assert!(dispatcher.state.lock().unwrap().key_repeat.last_key.is_none());
}

#[test]
fn test_motion_throttling_delays_lone_move() {
    let policy = TestPolicy::new();
    policy.with(|s| s.max_events_per_second = 10);
    let dispatcher = dispatcher_with(&policy);

    let (channel, consumer) = LoopbackChannel::pair("w", 8).unwrap();
    let channel: Arc<dyn InputChannel> = channel;
    dispatcher.register_input_channel(Arc::clone(&channel), false).unwrap();
    dispatcher.set_input_windows(vec![test_window(
        &channel,
        Rect::new(0, 0, 100, 100),
        WindowFlags::NOT_TOUCH_MODAL,
        true,
    )]);

    let t = now();
    let ids = [0i32];
    dispatcher.notify_motion(
        t, 2, source::TOUCHSCREEN, PolicyFlags::empty(), MotionAction::Down,
        MotionFlags::empty(), 0, 0, &ids, &[coords(5.0, 5.0)], 1.0, 1.0, t,
    );
    pump(&dispatcher);
    expect_motion(&consumer);
    consumer.finish().unwrap();
    pump_n(&dispatcher, 2);

    // Step clear of the down's own throttle window first.
    std::thread::sleep(std::time::Duration::from_millis(120));
    dispatcher.notify_motion(
        now(), 2, source::TOUCHSCREEN, PolicyFlags::empty(), MotionAction::Move,
        MotionFlags::empty(), 0, 0, &ids, &[coords(6.0, 6.0)], 1.0, 1.0, t,
    );
    pump(&dispatcher);
    expect_motion(&consumer);
    consumer.finish().unwrap();
    pump_n(&dispatcher, 2);

    // A second lone move within the 100ms window stays queued.
    dispatcher.notify_motion(
        now(), 2, source::TOUCHSCREEN, PolicyFlags::empty(), MotionAction::Move,
        MotionFlags::empty(), 0, 0, &ids, &[coords(7.0, 7.0)], 1.0, 1.0, t,
    );
    pump(&dispatcher);
    assert!(quiet(&consumer));
    assert_eq!(dispatcher.state.lock().unwrap().inbound.len(), 1);

    std::thread::sleep(std::time::Duration::from_millis(120));
    pump(&dispatcher);
    expect_motion(&consumer);
    consumer.finish().unwrap();
    pump_n(&dispatcher, 2);
}

#[test]
fn test_monitoring_channel_sees_all_events() {
    let policy = TestPolicy::new();
    let dispatcher = dispatcher_with(&policy);

    let (channel, consumer) = LoopbackChannel::pair("w", 8).unwrap();
    let (monitor_channel, monitor_consumer) = LoopbackChannel::pair("monitor", 8).unwrap();
    let channel: Arc<dyn InputChannel> = channel;
    let monitor_channel: Arc<dyn InputChannel> = monitor_channel;
    dispatcher.register_input_channel(Arc::clone(&channel), false).unwrap();
    dispatcher.register_input_channel(Arc::clone(&monitor_channel), true).unwrap();
    dispatcher.set_input_windows(vec![test_window(
        &channel,
        Rect::new(0, 0, 100, 100),
        WindowFlags::empty(),
        true,
    )]);

    dispatcher.inject_input_event(
        &key_event(KeyAction::Down, 0x42, now()),
        1,
        1000,
        InjectSyncMode::None,
        0,
    );
    pump_n(&dispatcher, 2);

    assert_eq!(expect_key(&consumer).key_code, 0x42);
    assert_eq!(expect_key(&monitor_consumer).key_code, 0x42);
    consumer.finish().unwrap();
    monitor_consumer.finish().unwrap();
    pump_n(&dispatcher, 2);
}

#[test]
fn test_dispatch_mode_disabled_and_frozen() {
    let policy = TestPolicy::new();
    let dispatcher = dispatcher_with(&policy);

    let (channel, consumer) = LoopbackChannel::pair("w", 8).unwrap();
    let channel: Arc<dyn InputChannel> = channel;
    dispatcher.register_input_channel(Arc::clone(&channel), false).unwrap();
    dispatcher.set_input_windows(vec![test_window(
        &channel,
        Rect::new(0, 0, 100, 100),
        WindowFlags::empty(),
        true,
    )]);

    // Disabled: events are dropped outright.
    dispatcher.set_input_dispatch_mode(false, false);
    dispatcher.notify_key(
        now(), 1, source::KEYBOARD, PolicyFlags::empty(), KeyAction::Down,
        KeyFlags::empty(), 0x42, 142, 0, now(),
    );
    pump(&dispatcher);
    assert!(quiet(&consumer));
    {
        let state = dispatcher.state.lock().unwrap();
        assert!(state.inbound.is_empty());
        assert_eq!(state.store.live_count(), 0);
    }

    // Frozen: events are held, then flow after the thaw.
    dispatcher.set_input_dispatch_mode(true, true);
    dispatcher.notify_key(
        now(), 1, source::KEYBOARD, PolicyFlags::empty(), KeyAction::Down,
        KeyFlags::empty(), 0x43, 143, 0, now(),
    );
    pump(&dispatcher);
    assert!(quiet(&consumer));
    assert_eq!(dispatcher.state.lock().unwrap().inbound.len(), 1);

    dispatcher.set_input_dispatch_mode(true, false);
    pump_n(&dispatcher, 2);
    assert_eq!(expect_key(&consumer).key_code, 0x43);
    consumer.finish().unwrap();
    pump(&dispatcher);
}

#[test]
fn test_unregister_returns_registry_to_initial_state() {
    let policy = TestPolicy::new();
    let dispatcher = dispatcher_with(&policy);

    let (channel, _consumer) = LoopbackChannel::pair("w", 8).unwrap();
    let channel: Arc<dyn InputChannel> = channel;

    dispatcher.register_input_channel(Arc::clone(&channel), true).unwrap();
    assert!(dispatcher
        .register_input_channel(Arc::clone(&channel), false)
        .is_err());

    dispatcher.unregister_input_channel(&channel).unwrap();
    assert!(dispatcher.unregister_input_channel(&channel).is_err());
    {
        let state = dispatcher.state.lock().unwrap();
        assert!(state.connections.is_empty());
        assert!(state.monitoring_channels.is_empty());
        assert!(state.active.is_empty());
    }
    // No broken-channel notification for a deliberate unregistration.
    assert!(policy.with(|s| s.broken_channels.is_empty()));
}

#[test]
fn test_set_input_windows_is_idempotent() {
    let policy = TestPolicy::new();
    let dispatcher = dispatcher_with(&policy);

    let (channel, consumer) = LoopbackChannel::pair("w", 8).unwrap();
    let channel: Arc<dyn InputChannel> = channel;
    dispatcher.register_input_channel(Arc::clone(&channel), false).unwrap();
    let windows = vec![test_window(
        &channel,
        Rect::new(0, 0, 100, 100),
        WindowFlags::NOT_TOUCH_MODAL,
        true,
    )];
    dispatcher.set_input_windows(windows.clone());

    dispatcher.inject_input_event(
        &touch_event(MotionAction::Down, 5.0, 5.0, now()),
        1,
        1000,
        InjectSyncMode::None,
        0,
    );
    pump(&dispatcher);
    expect_motion(&consumer);
    consumer.finish().unwrap();
    pump_n(&dispatcher, 2);

    dispatcher.set_input_windows(windows.clone());
    dispatcher.set_input_windows(windows);
    {
        let state = dispatcher.state.lock().unwrap();
        assert!(state.touch_down);
        assert!(state.touched_window.is_some());
        assert_eq!(state.focused_window, Some(0));
    }
}

#[test]
fn test_injection_rejects_malformed_events() {
    let policy = TestPolicy::new();
    let dispatcher = dispatcher_with(&policy);

    // Unknown key action.
    let mut bad_key = key_event(KeyAction::Down, 0x42, now());
    if let InjectedEvent::Key { action, .. } = &mut bad_key {
        *action = 99;
    }
    assert_eq!(
        dispatcher.inject_input_event(&bad_key, 1, 1000, InjectSyncMode::None, 0),
        InjectionResult::Failed
    );

    // Unknown motion action.
    let mut bad_motion = touch_event(MotionAction::Down, 1.0, 1.0, now());
    if let InjectedEvent::Motion { action, .. } = &mut bad_motion {
        *action = 77;
    }
    assert_eq!(
        dispatcher.inject_input_event(&bad_motion, 1, 1000, InjectSyncMode::None, 0),
        InjectionResult::Failed
    );

    // Pointer counts outside [1, MAX_POINTERS].
    let mut no_pointers = touch_event(MotionAction::Down, 1.0, 1.0, now());
    if let InjectedEvent::Motion {
        pointer_ids,
        samples,
        ..
    } = &mut no_pointers
    {
        pointer_ids.clear();
        samples[0].pointer_coords.clear();
    }
    assert_eq!(
        dispatcher.inject_input_event(&no_pointers, 1, 1000, InjectSyncMode::None, 0),
        InjectionResult::Failed
    );

    let mut too_many = touch_event(MotionAction::Down, 1.0, 1.0, now());
    if let InjectedEvent::Motion {
        pointer_ids,
        samples,
        ..
    } = &mut too_many
    {
        *pointer_ids = (0..11).collect();
        samples[0].pointer_coords = vec![coords(1.0, 1.0); 11];
    }
    assert_eq!(
        dispatcher.inject_input_event(&too_many, 1, 1000, InjectSyncMode::None, 0),
        InjectionResult::Failed
    );

    assert_eq!(dispatcher.state.lock().unwrap().store.live_count(), 0);
}

#[test]
fn test_injection_zero_timeout_returns_timed_out_without_blocking() {
    let policy = TestPolicy::new();
    let dispatcher = dispatcher_with(&policy);

    let start = std::time::Instant::now();
    let result = dispatcher.inject_input_event(
        &key_event(KeyAction::Down, 0x42, now()),
        1,
        1000,
        InjectSyncMode::WaitForResult,
        0,
    );
    assert_eq!(result, InjectionResult::TimedOut);
    assert!(start.elapsed().as_millis() < 100);
}

#[test]
fn test_injection_permission_denied() {
    let policy = TestPolicy::new();
    policy.with(|s| s.permission_granted = false);
    let dispatcher = dispatcher_with(&policy);

    let (channel, consumer) = LoopbackChannel::pair("w", 8).unwrap();
    let channel: Arc<dyn InputChannel> = channel;
    dispatcher.register_input_channel(Arc::clone(&channel), false).unwrap();
    let mut window = test_window(&channel, Rect::new(0, 0, 100, 100), WindowFlags::empty(), true);
    // The injector does not own this window.
    window.owner_uid = 42;
    dispatcher.set_input_windows(vec![window]);

    let injector = {
        let dispatcher = Arc::clone(&dispatcher);
        std::thread::spawn(move || {
            dispatcher.inject_input_event(
                &key_event(KeyAction::Down, 0x42, now()),
                1,
                1000,
                InjectSyncMode::WaitForResult,
                2000,
            )
        })
    };
    std::thread::sleep(std::time::Duration::from_millis(20));
    pump_n(&dispatcher, 2);

    assert_eq!(injector.join().unwrap(), InjectionResult::PermissionDenied);
    assert!(quiet(&consumer));
}

#[test]
fn test_configuration_change_notifies_policy() {
    let policy = TestPolicy::new();
    let dispatcher = dispatcher_with(&policy);

    dispatcher.notify_configuration_changed(1234);
    pump(&dispatcher);
    assert_eq!(policy.with(|s| s.config_changes.clone()), vec![1234]);
    assert_eq!(dispatcher.state.lock().unwrap().store.live_count(), 0);
}

#[test]
fn test_focused_application_anr_when_no_window() {
    let policy = TestPolicy::new();
    policy.with(|s| s.application_anr_responses = VecDeque::from([0]));
    let dispatcher = dispatcher_with(&policy);

    dispatcher.set_focused_application(Some(InputApplication {
        name: Arc::from("com.example.slow"),
        dispatching_timeout: millis_to_nanos(50),
        token: 7,
    }));

    let injector = {
        let dispatcher = Arc::clone(&dispatcher);
        std::thread::spawn(move || {
            dispatcher.inject_input_event(
                &key_event(KeyAction::Down, 0x42, now()),
                1,
                1000,
                InjectSyncMode::WaitForResult,
                2000,
            )
        })
    };
    std::thread::sleep(std::time::Duration::from_millis(20));
    pump(&dispatcher); // starts the application-not-ready wait
    std::thread::sleep(std::time::Duration::from_millis(80));
    pump(&dispatcher); // deadline passes; policy declines to extend
    pump(&dispatcher); // wait expires; the event fails as timed out

    assert_eq!(injector.join().unwrap(), InjectionResult::TimedOut);
    assert_eq!(policy.with(|s| s.application_anrs.clone()), vec!["com.example.slow"]);
}
