//! The per-connection dispatch cycle.
//!
//! A cycle runs from publishing an event on a channel to the consumer's
//! finished signal.  Motion events may take several cycles when their sample
//! history outgrows the channel buffer; the unsent tail carries over.

use std::sync::Arc;

use crate::core::channel::{KeyPublication, MotionPublication};
use crate::core::connection::{ConnectionStatus, DispatchEntry, TargetFlags};
use crate::core::dispatcher::{CommandEntry, DispatchState, InputDispatcher, InputTarget};
use crate::core::event::{EventEntry, KeyFlags, MotionAction, MotionFlags};
use crate::core::input_state::Consistency;
use crate::core::looper::FdEvent;
use crate::core::store::EventId;
use crate::util::time::{now, Nsecs, NEVER};

use std::os::unix::io::RawFd;

/// When enabled, events classified as broken for a consumer's input state
/// are withheld instead of published.
const FILTER_INPUT_EVENTS: bool = false;

impl DispatchState {
    /// Enqueue `event` toward one connection, or fold a freshly appended
    /// motion sample into the dispatch already in flight.
    pub(crate) fn prepare_dispatch_cycle(
        &mut self,
        current_time: Nsecs,
        fd: RawFd,
        event: EventId,
        target: &InputTarget,
        resume_with_appended_sample: bool,
    ) {
        // Never queue outbound work for a channel that is broken or stuck.
        {
            let Some(connection) = self.connections.get(&fd) else {
                return;
            };
            if connection.status != ConnectionStatus::Normal {
                tracing::debug!(
                    "channel '{}' ~ dropping event, channel status is {}",
                    connection.name(),
                    connection.status.label()
                );
                if connection.status == ConnectionStatus::NotResponding {
                    // Remind the policy that events keep piling up.
                    let channel = Arc::clone(&connection.channel);
                    self.post_command(CommandEntry::ChannelAnrTimeout { fd, channel });
                }
                return;
            }
        }

        let was_empty = self.connections[&fd].outbound.is_empty();

        // A new sample was appended to a motion event this connection is
        // already dispatching: try to stream it into the open cycle.
        if resume_with_appended_sample && !was_empty {
            if let Some(index) = self.connections[&fd].find_outbound_entry_for(event) {
                let (in_progress, has_tail) = {
                    let entry = &self.connections[&fd].outbound[index];
                    (entry.in_progress, entry.tail_sample.is_some())
                };
                if !in_progress {
                    tracing::debug!(
                        "channel '{}' ~ not streaming, motion event not yet dispatched",
                        self.connections[&fd].name()
                    );
                    return;
                }
                if has_tail {
                    tracing::debug!(
                        "channel '{}' ~ not streaming, a sample tail already waits for the next cycle",
                        self.connections[&fd].name()
                    );
                    return;
                }
                let Some(EventEntry::Motion(motion)) = self.store.get(event) else {
                    return;
                };
                let last_index = motion.last_sample_index();
                let sample = motion.samples[last_index];
                let pointer_count = motion.pointer_count;
                let channel = Arc::clone(&self.connections[&fd].channel);
                match channel
                    .append_motion_sample(sample.event_time, &sample.pointer_coords[..pointer_count])
                {
                    Ok(()) => {
                        tracing::debug!(
                            "channel '{}' ~ streamed new motion sample",
                            channel.name()
                        );
                    }
                    Err(error) => {
                        tracing::debug!(
                            "channel '{}' ~ could not stream motion sample ({}), tailing for next cycle",
                            channel.name(),
                            error
                        );
                        if let Some(entry) = self
                            .connections
                            .get_mut(&fd)
                            .and_then(|c| c.outbound.get_mut(index))
                        {
                            entry.tail_sample = Some(last_index);
                        }
                    }
                }
                return;
            }
        }

        // The consumer's view has drifted; bring it back in line with
        // synthesized cancellations before the new event arrives.
        {
            let connection = self.connections.get_mut(&fd).expect("connection vanished");
            if connection.input_state.is_out_of_sync() {
                let cancellations = connection
                    .input_state
                    .synthesize_cancellation_events(&mut self.store, current_time);
                connection.input_state.reset_out_of_sync();
                if !cancellations.is_empty() {
                    tracing::info!(
                        "channel '{}' ~ queueing {} cancellation events to resynchronize the consumer",
                        connection.name(),
                        cancellations.len()
                    );
                    for cancellation in cancellations {
                        connection.outbound.push_back(DispatchEntry::new(
                            cancellation,
                            TargetFlags::empty(),
                            target.x_offset,
                            target.y_offset,
                            target.timeout,
                        ));
                    }
                }
            }
        }

        // Enqueue a dispatch entry for the event itself.
        self.store.add_ref(event);
        let mut entry = DispatchEntry::new(
            event,
            target.flags,
            target.x_offset,
            target.y_offset,
            target.timeout,
        );
        if entry.is_sync_target() {
            if let Some(e) = self.store.get_mut(event) {
                e.common_mut().pending_sync_dispatches += 1;
            }
        }
        if resume_with_appended_sample {
            // Streaming was impossible (entry gone or consumed); the new
            // cycle must begin at the freshly appended sample.
            if let Some(EventEntry::Motion(motion)) = self.store.get(event) {
                entry.head_sample = Some(motion.last_sample_index());
            }
        }
        self.connections
            .get_mut(&fd)
            .expect("connection vanished")
            .outbound
            .push_back(entry);

        if was_empty {
            self.activate_connection(fd);
            self.start_dispatch_cycle(current_time, fd, target.time_spent_waiting);
        }
    }

    /// Publish the head of the outbound queue and start its deadline.
    pub(crate) fn start_dispatch_cycle(
        &mut self,
        current_time: Nsecs,
        fd: RawFd,
        time_spent_waiting: Nsecs,
    ) {
        let (channel, event_id, target_flags, x_offset, y_offset, timeout, head_sample) = {
            let Some(connection) = self.connections.get_mut(&fd) else {
                return;
            };
            debug_assert_eq!(connection.status, ConnectionStatus::Normal);
            let Some(head) = connection.outbound.front_mut() else {
                debug_assert!(false, "dispatch cycle started with an empty outbound queue");
                return;
            };
            debug_assert!(!head.in_progress);
            head.in_progress = true;
            (
                Arc::clone(&connection.channel),
                head.event,
                head.target_flags,
                head.x_offset,
                head.y_offset,
                head.timeout,
                head.head_sample,
            )
        };

        let Some(event) = self.store.get(event_id).cloned() else {
            tracing::error!("channel '{}' ~ outbound entry holds a stale event", channel.name());
            return;
        };

        // Track what the consumer is about to see so drift can be undone.
        let consistency = {
            let connection = self.connections.get_mut(&fd).expect("connection vanished");
            connection.input_state.track_event(&event)
        };
        if consistency == Consistency::Broken {
            tracing::warn!(
                "channel '{}' ~ publishing {} event inconsistent with consumer input state",
                channel.name(),
                event.kind_label()
            );
            if FILTER_INPUT_EVENTS {
                let entry = self
                    .connections
                    .get_mut(&fd)
                    .and_then(|c| c.outbound.pop_front());
                if let Some(entry) = entry {
                    self.release_dispatch_entry(entry);
                }
                self.start_next_dispatch_cycle(current_time, fd);
                return;
            }
        }

        // Publish; for motion, also push as much of the sample history as
        // fits and tail the rest.
        let mut tail_sample = None;
        let publish_result = match &event {
            EventEntry::Key(key) => {
                let mut flags = key.flags;
                if target_flags.contains(TargetFlags::CANCEL) {
                    flags |= KeyFlags::CANCELED;
                }
                channel.publish_key(KeyPublication {
                    device_id: key.device_id,
                    source: key.source,
                    action: key.action,
                    flags,
                    key_code: key.key_code,
                    scan_code: key.scan_code,
                    meta_state: key.meta_state,
                    repeat_count: key.repeat_count,
                    down_time: key.down_time,
                    event_time: key.common.event_time,
                })
            }
            EventEntry::Motion(motion) => {
                let mut action = motion.action;
                if target_flags.contains(TargetFlags::OUTSIDE) {
                    action = MotionAction::Outside;
                }
                if target_flags.contains(TargetFlags::CANCEL) {
                    action = MotionAction::Cancel;
                }
                let mut flags = motion.flags;
                if target_flags.contains(TargetFlags::WINDOW_IS_OBSCURED) {
                    flags |= MotionFlags::WINDOW_IS_OBSCURED;
                }
                // Offsets only make sense for absolute pointer coordinates.
                let (x_offset, y_offset) = if motion.is_pointer_event() {
                    (x_offset, y_offset)
                } else {
                    (0.0, 0.0)
                };
                let first_index = head_sample.unwrap_or(0);
                let first = &motion.samples[first_index];
                let pointer_count = motion.pointer_count;
                channel
                    .publish_motion(MotionPublication {
                        device_id: motion.device_id,
                        source: motion.source,
                        action,
                        flags,
                        edge_flags: motion.edge_flags,
                        meta_state: motion.meta_state,
                        x_offset,
                        y_offset,
                        x_precision: motion.x_precision,
                        y_precision: motion.y_precision,
                        down_time: motion.down_time,
                        event_time: first.event_time,
                        pointer_ids: motion.pointer_ids[..pointer_count].to_vec(),
                        pointer_coords: first.pointer_coords[..pointer_count].to_vec(),
                    })
                    .and_then(|()| {
                        let mut next = first_index + 1;
                        while next < motion.samples.len() {
                            let sample = &motion.samples[next];
                            match channel.append_motion_sample(
                                sample.event_time,
                                &sample.pointer_coords[..pointer_count],
                            ) {
                                Ok(()) => next += 1,
                                Err(error) if error.is_recoverable_append() => {
                                    tracing::debug!(
                                        "channel '{}' ~ buffer full, {} samples go to the next cycle",
                                        channel.name(),
                                        motion.samples.len() - next
                                    );
                                    tail_sample = Some(next);
                                    break;
                                }
                                Err(error) => return Err(error),
                            }
                        }
                        Ok(())
                    })
            }
            EventEntry::ConfigChanged(_) => {
                debug_assert!(false, "configuration changes are never published");
                Ok(())
            }
        };

        if let Err(error) = publish_result {
            tracing::error!(
                "channel '{}' ~ could not publish event: {}",
                channel.name(),
                error
            );
            self.abort_dispatch_cycle(current_time, fd, true);
            return;
        }
        if let Err(error) = channel.send_dispatch_signal() {
            tracing::error!(
                "channel '{}' ~ could not send dispatch signal: {}",
                channel.name(),
                error
            );
            self.abort_dispatch_cycle(current_time, fd, true);
            return;
        }

        let connection = self.connections.get_mut(&fd).expect("connection vanished");
        if let Some(head) = connection.outbound.front_mut() {
            head.tail_sample = tail_sample;
        }
        connection.last_event_time = event.event_time();
        connection.last_dispatch_time = current_time;
        connection.next_timeout = if timeout >= 0 {
            current_time + timeout - time_spent_waiting
        } else {
            NEVER
        };
        tracing::debug!("channel '{}' ~ dispatch cycle started", connection.name());
    }

    /// The consumer reported it finished with the in-flight event.
    pub(crate) fn finish_dispatch_cycle(&mut self, current_time: Nsecs, fd: RawFd) {
        let (status, channel) = {
            let Some(connection) = self.connections.get(&fd) else {
                return;
            };
            (connection.status, Arc::clone(&connection.channel))
        };
        if status == ConnectionStatus::Broken || status == ConnectionStatus::Zombie {
            return;
        }

        {
            let connection = self.connections.get_mut(&fd).expect("connection vanished");
            connection.next_timeout = NEVER;
            if status == ConnectionStatus::NotResponding {
                connection.status = ConnectionStatus::Normal;
                tracing::info!(
                    "channel '{}' ~ recovered from ANR.  {:.1}ms since event, {:.1}ms since dispatch, {:.1}ms since ANR",
                    connection.name(),
                    connection.event_latency_millis(current_time),
                    connection.dispatch_latency_millis(current_time),
                    connection.anr_latency_millis(current_time)
                );
                self.post_command(CommandEntry::NotifyChannelRecovered {
                    fd,
                    channel: Arc::clone(&channel),
                });
            }
        }

        // Reclaim the channel buffer now so the publisher can release its
        // resources while waiting for the next cycle.
        if let Err(error) = channel.reset() {
            tracing::error!(
                "channel '{}' ~ could not reset publisher: {}",
                channel.name(),
                error
            );
            self.abort_dispatch_cycle(current_time, fd, true);
            return;
        }

        self.start_next_dispatch_cycle(current_time, fd);
    }

    /// Advance the outbound queue: resume a tailed motion, pop finished
    /// entries, restart an aborted head, and deactivate when empty.
    pub(crate) fn start_next_dispatch_cycle(&mut self, current_time: Nsecs, fd: RawFd) {
        enum Next {
            Deactivate,
            ResumeTail,
            Finished,
            Restart,
        }
        loop {
            let next = {
                let Some(connection) = self.connections.get(&fd) else {
                    return;
                };
                match connection.outbound.front() {
                    None => Next::Deactivate,
                    Some(head) if head.in_progress => {
                        if head.tail_sample.is_some() {
                            Next::ResumeTail
                        } else {
                            Next::Finished
                        }
                    }
                    // Head not in progress: the previous in-flight entry was
                    // drained by an abort; just start the next one.
                    Some(_) => Next::Restart,
                }
            };
            match next {
                Next::Deactivate => {
                    self.deactivate_connection(fd);
                    return;
                }
                Next::ResumeTail => {
                    // Undispatched samples remain; reuse the entry for
                    // another cycle starting at the tail.
                    if let Some(head) = self
                        .connections
                        .get_mut(&fd)
                        .and_then(|c| c.outbound.front_mut())
                    {
                        head.in_progress = false;
                        head.head_sample = head.tail_sample.take();
                    }
                    self.start_dispatch_cycle(current_time, fd, 0);
                    return;
                }
                Next::Finished => {
                    let entry = self
                        .connections
                        .get_mut(&fd)
                        .and_then(|c| c.outbound.pop_front());
                    if let Some(entry) = entry {
                        self.release_dispatch_entry(entry);
                    }
                }
                Next::Restart => {
                    self.start_dispatch_cycle(current_time, fd, 0);
                    return;
                }
            }
        }
    }

    /// Drop a dispatch entry's references, releasing any injector waiting on
    /// the last synchronous dispatch.
    pub(crate) fn release_dispatch_entry(&mut self, entry: DispatchEntry) {
        if entry.is_sync_target() {
            self.decrement_pending_sync_dispatches(entry.event);
        }
        self.store.release(entry.event);
    }

    /// The in-flight dispatch blew its deadline.
    pub(crate) fn timeout_dispatch_cycle(&mut self, current_time: Nsecs, fd: RawFd) {
        let channel = {
            let Some(connection) = self.connections.get_mut(&fd) else {
                return;
            };
            if connection.status != ConnectionStatus::Normal {
                return;
            }
            connection.status = ConnectionStatus::NotResponding;
            connection.last_anr_time = current_time;
            tracing::info!(
                "channel '{}' ~ not responding!  {:.1}ms since event, {:.1}ms since dispatch",
                connection.name(),
                connection.event_latency_millis(current_time),
                connection.dispatch_latency_millis(current_time)
            );
            Arc::clone(&connection.channel)
        };
        self.post_command(CommandEntry::ChannelAnrTimeout { fd, channel });
    }

    /// Applied from the channel-ANR command once the policy has decided:
    /// extend the deadline, or shed the backlog and stop blocking on the
    /// consumer.
    pub(crate) fn resume_after_timeout_dispatch_cycle(
        &mut self,
        current_time: Nsecs,
        fd: RawFd,
        new_timeout: Nsecs,
    ) {
        {
            let Some(connection) = self.connections.get_mut(&fd) else {
                return;
            };
            if connection.status != ConnectionStatus::NotResponding {
                return;
            }
            if new_timeout > 0 {
                tracing::debug!(
                    "channel '{}' ~ policy granted {}ns more",
                    connection.name(),
                    new_timeout
                );
                connection.status = ConnectionStatus::Normal;
                connection.set_next_timeout(current_time, new_timeout);
                return;
            }

            // Give up.  Shed everything behind the in-flight head so stale
            // events do not pile up, and stop blocking on its completion.
            tracing::info!(
                "channel '{}' ~ giving up on unresponsive consumer, draining outbound queue",
                connection.name()
            );
            connection.next_timeout = NEVER;
            connection.input_state.set_out_of_sync();
        }
        let mut drained = Vec::new();
        {
            let connection = self.connections.get_mut(&fd).expect("connection vanished");
            while connection.outbound.len() > 1 {
                drained.push(connection.outbound.pop_back().expect("queue has a tail"));
            }
        }
        for entry in drained {
            self.release_dispatch_entry(entry);
        }
        self.demote_sync_tail(fd);
    }

    /// Tear down all outbound work; `broken` additionally retires the
    /// channel and tells the policy, unless it is already broken or zombie.
    pub(crate) fn abort_dispatch_cycle(&mut self, current_time: Nsecs, fd: RawFd, broken: bool) {
        let _ = current_time;
        let mut drained = Vec::new();
        let mut notify_broken = None;
        {
            let Some(connection) = self.connections.get_mut(&fd) else {
                return;
            };
            connection.next_timeout = NEVER;
            connection.input_state.set_out_of_sync();
            while let Some(entry) = connection.outbound.pop_front() {
                drained.push(entry);
            }
            if broken
                && matches!(
                    connection.status,
                    ConnectionStatus::Normal | ConnectionStatus::NotResponding
                )
            {
                connection.status = ConnectionStatus::Broken;
                tracing::error!(
                    "channel '{}' ~ channel is unrecoverably broken and will be disposed",
                    connection.name()
                );
                notify_broken = Some(Arc::clone(&connection.channel));
            }
        }
        let had_entries = !drained.is_empty();
        for entry in drained {
            self.release_dispatch_entry(entry);
        }
        if had_entries {
            self.deactivate_connection(fd);
        }
        if let Some(channel) = notify_broken {
            self.post_command(CommandEntry::NotifyChannelBroken { fd, channel });
        }
    }
}

impl InputDispatcher {
    /// React to readiness on a connection's receive fd: consume the finished
    /// signal, or retire the channel on error/hangup.
    pub(crate) fn handle_receive_event(&self, fd_event: FdEvent) {
        let fd = fd_event.fd;
        {
            let mut state = self.state.lock().unwrap();
            let channel = match state.connections.get(&fd) {
                Some(connection) => Arc::clone(&connection.channel),
                None => {
                    drop(state);
                    tracing::warn!("spurious receive callback for unknown channel, fd={}", fd);
                    self.looper.remove_fd(fd);
                    return;
                }
            };
            let current_time = now();

            if fd_event.error {
                tracing::error!(
                    "channel '{}' ~ consumer closed the input channel or an error occurred",
                    channel.name()
                );
                state.abort_dispatch_cycle(current_time, fd, true);
                drop(state);
                self.looper.remove_fd(fd);
                self.run_commands();
                return;
            }
            if !fd_event.readable {
                tracing::warn!(
                    "channel '{}' ~ spurious callback for unhandled poll event",
                    channel.name()
                );
                return;
            }

            match channel.receive_finished_signal() {
                Ok(()) => state.finish_dispatch_cycle(current_time, fd),
                Err(error) => {
                    tracing::error!(
                        "channel '{}' ~ failed to receive finished signal: {}",
                        channel.name(),
                        error
                    );
                    state.abort_dispatch_cycle(current_time, fd, true);
                    drop(state);
                    self.looper.remove_fd(fd);
                    self.run_commands();
                    return;
                }
            }
        }
        self.run_commands();
    }
}
