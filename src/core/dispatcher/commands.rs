//! Deferred policy interactions.
//!
//! The policy may block or call back into the dispatcher, so nothing calls
//! it while the state lock is held.  Work that needs the policy is captured
//! as a command entry and run by the dispatcher thread after the lock is
//! released; each command re-locks only for the state mutations it needs.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::core::channel::InputChannel;
use crate::core::dispatcher::{DispatchState, InputDispatcher};
use crate::core::event::{EventEntry, InterceptKeyResult, KeyEventSnapshot};
use crate::core::policy::{InputApplication, UserActivityType};
use crate::core::store::EventId;
use crate::util::time::{now, Nsecs};

/// One postponed policy interaction.
pub enum CommandEntry {
    NotifyConfigurationChanged {
        event_time: Nsecs,
    },
    NotifyChannelBroken {
        fd: RawFd,
        channel: Arc<dyn InputChannel>,
    },
    NotifyChannelRecovered {
        fd: RawFd,
        channel: Arc<dyn InputChannel>,
    },
    /// Ask the policy what to do about an unresponsive consumer, then extend
    /// its deadline or shed its backlog.
    ChannelAnrTimeout {
        fd: RawFd,
        channel: Arc<dyn InputChannel>,
    },
    /// Ask the policy whether to consume a key before it is published.
    /// Holds one reference on the key entry.
    InterceptKeyBeforeDispatching {
        channel: Option<Arc<dyn InputChannel>>,
        key: EventId,
    },
    /// The targets-not-ready wait hit its deadline; ask the policy whether
    /// to keep waiting for the window/application.
    TargetsNotReadyTimeout {
        channel: Option<Arc<dyn InputChannel>>,
        application: Option<InputApplication>,
    },
    PokeUserActivity {
        event_time: Nsecs,
        window_type: i32,
        activity: UserActivityType,
    },
}

impl DispatchState {
    pub(crate) fn post_command(&mut self, command: CommandEntry) {
        self.commands.push_back(command);
    }
}

impl InputDispatcher {
    /// Drain and run queued commands, lock released.  Returns true when at
    /// least one command ran, so the outer loop knows to wake immediately.
    pub(crate) fn run_commands(&self) -> bool {
        let mut ran = false;
        loop {
            let command = self.state.lock().unwrap().commands.pop_front();
            let Some(command) = command else {
                break;
            };
            ran = true;
            self.run_command(command);
        }
        ran
    }

    fn run_command(&self, command: CommandEntry) {
        match command {
            CommandEntry::NotifyConfigurationChanged { event_time } => {
                self.policy.notify_configuration_changed(event_time);
            }

            CommandEntry::NotifyChannelBroken { fd, channel } => {
                // An unregistered channel was retired deliberately; only
                // channels that are still known get the broken notification.
                if self.channel_is_registered(fd) {
                    self.policy.notify_input_channel_broken(&channel);
                }
            }

            CommandEntry::NotifyChannelRecovered { fd, channel } => {
                if self.channel_is_registered(fd) {
                    self.policy.notify_input_channel_recovered(&channel);
                }
            }

            CommandEntry::ChannelAnrTimeout { fd, channel } => {
                if !self.channel_is_registered(fd) {
                    return;
                }
                let new_timeout = self.policy.notify_input_channel_anr(&channel);
                let mut state = self.state.lock().unwrap();
                state.resume_after_timeout_dispatch_cycle(now(), fd, new_timeout);
            }

            CommandEntry::InterceptKeyBeforeDispatching { channel, key } => {
                let snapshot = {
                    let state = self.state.lock().unwrap();
                    state
                        .store
                        .get(key)
                        .and_then(EventEntry::as_key)
                        .map(|k| (KeyEventSnapshot::of(k), k.policy_flags))
                };
                if let Some((snapshot, policy_flags)) = snapshot {
                    let consumed = self.policy.intercept_key_before_dispatching(
                        channel.as_ref(),
                        &snapshot,
                        policy_flags,
                    );
                    let mut state = self.state.lock().unwrap();
                    if let Some(EventEntry::Key(k)) = state.store.get_mut(key) {
                        k.intercept_result = if consumed {
                            InterceptKeyResult::Skip
                        } else {
                            InterceptKeyResult::Continue
                        };
                    }
                    state.store.release(key);
                } else {
                    self.state.lock().unwrap().store.release(key);
                }
            }

            CommandEntry::TargetsNotReadyTimeout { channel, application } => {
                let new_timeout = if let Some(channel) = &channel {
                    self.policy.notify_input_channel_anr(channel)
                } else if let Some(application) = &application {
                    self.policy.notify_anr(application)
                } else {
                    0
                };
                let mut state = self.state.lock().unwrap();
                state.resume_after_targets_not_ready_timeout(now(), new_timeout);
            }

            CommandEntry::PokeUserActivity {
                event_time,
                window_type,
                activity,
            } => {
                self.policy.poke_user_activity(event_time, window_type, activity);
            }
        }
    }

    fn channel_is_registered(&self, fd: RawFd) -> bool {
        self.state.lock().unwrap().connections.contains_key(&fd)
    }
}
