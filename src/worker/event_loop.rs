use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, never, Receiver, Select};
use serde_json::json;

use crate::heartbeat::HeartbeatPublisher;
use crate::logging::{LogLevel, Logger};
use crate::message::{IncomingMessage, OutgoingMessage};
use crate::transport::{Delivery, InboundEvent, Transport, TransportError};
use crate::utils::timing::measure_execution;

use super::sender::SendWorker;
use super::CommandMap;

pub const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

const LOG_CONTEXT: &str = "worker::event_loop";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LoopControl {
    Continue,
    Stop,
}

#[derive(Debug)]
enum Wake {
    Timeout,
    Wakeup,
    WakeupClosed,
    Inbound(InboundEvent),
    InboundClosed,
}

pub(crate) struct LoopSetup {
    pub logger: Arc<Logger>,
    pub transport: Box<dyn Transport>,
    pub heartbeat: Option<HeartbeatPublisher>,
    pub sender: SendWorker,
    pub wakeup: Receiver<()>,
    pub commands: Arc<CommandMap>,
    pub stop_signal: Arc<AtomicBool>,
    pub log_requests: bool,
}

/// Single-threaded loop multiplexing inbound requests, queued sends and the
/// heartbeat timer. Only this thread touches the main endpoint.
///
/// While `reopen_at` is set the endpoint has failed and is waiting for its
/// next rebind attempt; outgoing messages are held until it succeeds.
pub(crate) struct EventLoop {
    logger: Arc<Logger>,
    transport: Box<dyn Transport>,
    heartbeat: Option<HeartbeatPublisher>,
    sender: SendWorker,
    wakeup: Receiver<()>,
    commands: Arc<CommandMap>,
    stop_signal: Arc<AtomicBool>,
    log_requests: bool,
    pending: VecDeque<OutgoingMessage>,
    reopen_at: Option<Instant>,
    reconnects: u64,
}

impl EventLoop {
    pub(crate) fn new(setup: LoopSetup) -> Self {
        Self {
            logger: setup.logger,
            transport: setup.transport,
            heartbeat: setup.heartbeat,
            sender: setup.sender,
            wakeup: setup.wakeup,
            commands: setup.commands,
            stop_signal: setup.stop_signal,
            log_requests: setup.log_requests,
            pending: VecDeque::new(),
            reopen_at: None,
            reconnects: 0,
        }
    }

    pub(crate) fn run(mut self) {
        self.logger.debug(Some(LOG_CONTEXT), "event loop entered");
        // Anything queued while the worker was stopped goes out first.
        self.flush_outgoing();
        while self.update() == LoopControl::Continue {}
        self.teardown();
    }

    /// One iteration: wait, service whatever woke us, then flush sends and
    /// check the heartbeat deadline.
    pub(crate) fn update(&mut self) -> LoopControl {
        if self.stop_requested() {
            return LoopControl::Stop;
        }

        match self.wait() {
            Wake::Timeout | Wake::Wakeup => {}
            Wake::WakeupClosed => return LoopControl::Stop,
            Wake::Inbound(InboundEvent::Request(request)) => self.dispatch(request),
            Wake::Inbound(InboundEvent::Fatal(error)) => {
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!("main endpoint failed: {error}; recreating"),
                );
                self.recreate_main_endpoint();
            }
            Wake::InboundClosed => {
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    "main endpoint inbound channel closed; recreating",
                );
                self.recreate_main_endpoint();
            }
        }

        if self.stop_requested() {
            return LoopControl::Stop;
        }

        if self.reopen_due(Instant::now()) {
            self.recreate_main_endpoint();
        }
        self.flush_outgoing();
        self.publish_heartbeat_if_due();

        LoopControl::Continue
    }

    fn stop_requested(&self) -> bool {
        self.stop_signal.load(Ordering::SeqCst)
    }

    fn reopen_due(&self, now: Instant) -> bool {
        self.reopen_at.is_some_and(|at| now >= at)
    }

    fn wait_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        let heartbeat = self.heartbeat.as_ref().map(|hb| hb.schedule().time_until_due(now));
        let reconnect = self.reopen_at.map(|at| at.saturating_duration_since(now));

        match (heartbeat, reconnect) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn wait(&self) -> Wake {
        let idle = never::<InboundEvent>();
        let inbound = if self.reopen_at.is_some() {
            &idle
        } else {
            self.transport.inbound()
        };

        let mut select = Select::new();
        let wakeup_index = select.recv(&self.wakeup);
        select.recv(inbound);

        let operation = match self.wait_timeout() {
            Some(timeout) => match select.select_timeout(timeout) {
                Ok(operation) => operation,
                Err(_) => return Wake::Timeout,
            },
            None => select.select(),
        };

        if operation.index() == wakeup_index {
            match operation.recv(&self.wakeup) {
                Ok(()) => Wake::Wakeup,
                Err(_) => Wake::WakeupClosed,
            }
        } else {
            match operation.recv(inbound) {
                Ok(event) => Wake::Inbound(event),
                Err(_) => Wake::InboundClosed,
            }
        }
    }

    fn dispatch(&self, request: IncomingMessage) {
        if self.log_requests {
            self.logger.log(
                LogLevel::Info,
                Some(LOG_CONTEXT),
                "request received",
                Some(json!({
                    "command": request.command,
                    "origin": request.origin.to_string(),
                    "id": request.id,
                    "payload_bytes": request.payload.len()
                })),
            );
        }

        let Some(handler) = self.commands.get(&request.command) else {
            self.logger.debug(
                Some(LOG_CONTEXT),
                &format!(
                    "dropping request {} for unknown command '{}'",
                    request.id, request.command
                ),
            );
            return;
        };

        let callback = self.sender.callback();
        let outcome = if self.log_requests {
            let task_name = format!("command '{}'", request.command);
            measure_execution(&task_name, Some(LOG_CONTEXT), &self.logger, || {
                catch_unwind(AssertUnwindSafe(|| handler(&request, callback)))
            })
        } else {
            catch_unwind(AssertUnwindSafe(|| handler(&request, callback)))
        };

        if let Err(panic) = outcome {
            self.logger.log(
                LogLevel::Error,
                Some(LOG_CONTEXT),
                "command handler panicked; no reply sent",
                Some(json!({
                    "command": request.command,
                    "id": request.id,
                    "panic": panic_message(panic.as_ref())
                })),
            );
        }
    }

    fn flush_outgoing(&mut self) {
        self.pending.extend(self.sender.drain());
        if self.pending.is_empty() || self.reopen_at.is_some() {
            return;
        }

        if let Some(error) = self.transmit_pending() {
            self.logger.warn(
                Some(LOG_CONTEXT),
                &format!("main endpoint send failed: {error}; recreating"),
            );
            self.recreate_main_endpoint();
            if self.reopen_at.is_some() {
                return;
            }
            if let Some(error) = self.transmit_pending() {
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!("recreated endpoint failed again: {error}"),
                );
                self.reopen_at = Some(Instant::now() + RECONNECT_BACKOFF);
            }
        }
    }

    /// Sends pending messages in order. Stops at the first fatal error and
    /// returns it, leaving the failed message at the front.
    fn transmit_pending(&mut self) -> Option<TransportError> {
        while let Some(message) = self.pending.pop_front() {
            match self.transport.send(&message) {
                Ok(Delivery::Sent) => {}
                Ok(Delivery::Unroutable) => self.logger.verbose(
                    Some(LOG_CONTEXT),
                    &format!(
                        "dropping message {} for unreachable peer {}",
                        message.id, message.destination
                    ),
                ),
                Err(error) if error.is_fatal() => {
                    self.pending.push_front(message);
                    return Some(error);
                }
                Err(error) => self.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!("failed to send message {}: {error}", message.id),
                ),
            }
        }

        None
    }

    /// Rebinds the main endpoint and swaps in a fresh wakeup channel while
    /// holding the wakeup lock. Queued and pending messages are kept, and so
    /// are the routes to already connected peers.
    fn recreate_main_endpoint(&mut self) {
        let sender = self.sender.clone();
        let mut wakeup = sender.lock_wakeup();

        match self.transport.reopen() {
            Ok(()) => {
                let (wakeup_tx, wakeup_rx) = bounded(1);
                *wakeup = Some(wakeup_tx);
                self.wakeup = wakeup_rx;
                self.reopen_at = None;
                self.reconnects += 1;
                self.logger.log(
                    LogLevel::Info,
                    Some(LOG_CONTEXT),
                    "main endpoint recreated",
                    Some(json!({
                        "address": self.transport.local_addr().map(|addr| addr.to_string()),
                        "reconnects": self.reconnects,
                        "pending": self.pending.len()
                    })),
                );
            }
            Err(error) => {
                self.reopen_at = Some(Instant::now() + RECONNECT_BACKOFF);
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!(
                        "failed to recreate main endpoint: {error}; retrying in {}ms",
                        RECONNECT_BACKOFF.as_millis()
                    ),
                );
            }
        }
    }

    fn publish_heartbeat_if_due(&mut self) {
        let Some(heartbeat) = self.heartbeat.as_mut() else {
            return;
        };

        match heartbeat.publish_if_due() {
            Ok(true) => self.logger.verbose(
                Some(LOG_CONTEXT),
                &format!("heartbeat {} published", heartbeat.sequence() - 1),
            ),
            Ok(false) => {}
            Err(error) => self
                .logger
                .warn(Some(LOG_CONTEXT), &format!("heartbeat skipped: {error}")),
        }
    }

    fn teardown(&mut self) {
        self.flush_outgoing();
        if !self.pending.is_empty() {
            self.logger.warn(
                Some(LOG_CONTEXT),
                &format!("{} queued messages were not delivered before stop", self.pending.len()),
            );
        }

        self.transport.shutdown();
        if let Some(heartbeat) = self.heartbeat.as_mut() {
            heartbeat.shutdown();
        }
        self.logger.debug(Some(LOG_CONTEXT), "event loop exited");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crossbeam_channel::bounded;

    use crate::logging::tests::memory_logger;
    use crate::logging::LogLevel;
    use crate::message::{Identity, IncomingMessage, OutgoingMessage};
    use crate::transport::memory::MemoryNetwork;
    use crate::transport::{EndpointSettings, TransportFactory};
    use crate::wire::codec::WireCodec;
    use crate::worker::sender::{QueueSendCallback, SendWorker};
    use crate::worker::{CommandHandler, CommandMap};

    use super::{EventLoop, LoopControl, LoopSetup};

    fn echo_commands() -> CommandMap {
        let echo: CommandHandler = Arc::new(|request: &IncomingMessage, send: QueueSendCallback| {
            send(OutgoingMessage::reply_to(request, request.payload.clone()));
        });
        let boom: CommandHandler =
            Arc::new(|_request: &IncomingMessage, _send: QueueSendCallback| panic!("handler exploded"));

        let mut commands = HashMap::new();
        commands.insert("echo".to_owned(), echo);
        commands.insert("boom".to_owned(), boom);
        commands
    }

    fn request(command: &str, id: u32, payload: &[u8]) -> IncomingMessage {
        IncomingMessage {
            origin: Identity::new(b"peer-a".to_vec()),
            command: command.to_owned(),
            id,
            payload: payload.to_vec(),
        }
    }

    fn push(id: u32) -> OutgoingMessage {
        OutgoingMessage::new(Identity::new(b"peer-a".to_vec()), "push", id, Vec::new())
    }

    struct Harness {
        network: MemoryNetwork,
        sender: SendWorker,
        event_loop: EventLoop,
        sink: Arc<crate::logging::tests::MemorySink>,
    }

    fn harness() -> Harness {
        let network = MemoryNetwork::new();
        let settings = EndpointSettings {
            address: "memory".to_owned(),
            codec: WireCodec::default(),
            auth: None,
        };
        let transport = network.bind_main(&settings).expect("memory endpoint should bind");
        let (logger, sink) = memory_logger(LogLevel::Verbose);
        let sender = SendWorker::new();
        let (wakeup_tx, wakeup_rx) = bounded(1);
        sender.install_wakeup(Some(wakeup_tx));

        let event_loop = EventLoop::new(LoopSetup {
            logger,
            transport,
            heartbeat: None,
            sender: sender.clone(),
            wakeup: wakeup_rx,
            commands: Arc::new(echo_commands()),
            stop_signal: Arc::new(AtomicBool::new(false)),
            log_requests: true,
        });

        Harness {
            network,
            sender,
            event_loop,
            sink,
        }
    }

    #[test]
    fn echo_request_yields_exactly_one_reply_to_origin() {
        let mut h = harness();
        assert!(h.network.inject(request("echo", 4, b"hi")));

        assert_eq!(h.event_loop.update(), LoopControl::Continue);

        let sent = h.network.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, Identity::new(b"peer-a".to_vec()));
        assert_eq!(sent[0].command, "echo");
        assert_eq!(sent[0].id, 4);
        assert_eq!(sent[0].payload, b"hi");
        assert!(h.sink.contains("request received"));
        assert!(h.sink.contains("task 'command 'echo'' finished in"));
    }

    #[test]
    fn unknown_command_is_dropped_without_reply() {
        let mut h = harness();
        h.network.inject(request("missing", 1, b""));

        assert_eq!(h.event_loop.update(), LoopControl::Continue);

        assert!(h.network.sent().is_empty());
        assert!(h.sink.contains("unknown command 'missing'"));
    }

    #[test]
    fn panicking_handler_does_not_stop_the_loop() {
        let mut h = harness();
        h.network.inject(request("boom", 1, b""));
        h.network.inject(request("echo", 2, b"after"));

        assert_eq!(h.event_loop.update(), LoopControl::Continue);
        assert_eq!(h.event_loop.update(), LoopControl::Continue);

        let sent = h.network.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, 2);
        assert!(h.sink.contains("handler exploded"));
    }

    #[test]
    fn one_wakeup_flushes_everything_queued_before_the_drain() {
        let mut h = harness();
        for id in 0..5 {
            h.sender.queue_send(push(id));
        }
        assert_eq!(h.event_loop.wakeup.len(), 1);

        assert_eq!(h.event_loop.update(), LoopControl::Continue);

        let ids = h.network.sent().iter().map(|m| m.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert!(h.event_loop.wakeup.is_empty());
    }

    #[test]
    fn fatal_send_error_recreates_endpoint_and_retries_queued_messages() {
        let mut h = harness();
        h.network.fail_next_sends(1);
        for id in 0..4 {
            h.sender.queue_send(push(id));
        }

        assert_eq!(h.event_loop.update(), LoopControl::Continue);

        let ids = h.network.sent().iter().map(|m| m.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(h.network.binds(), 2);

        assert!(h.network.inject(request("echo", 9, b"still here")));
        assert_eq!(h.event_loop.update(), LoopControl::Continue);
        assert_eq!(h.network.sent().last().map(|m| m.id), Some(9));
    }

    #[test]
    fn failed_rebind_keeps_messages_until_backoff_retry_succeeds() {
        let mut h = harness();
        h.network.fail_next_binds(1);
        assert!(h.network.inject_fatal());

        assert_eq!(h.event_loop.update(), LoopControl::Continue);
        assert!(h.event_loop.reopen_at.is_some());

        for id in 0..3 {
            h.sender.queue_send(push(id));
        }
        assert_eq!(h.event_loop.update(), LoopControl::Continue);
        assert!(h.network.sent().is_empty());
        assert_eq!(h.event_loop.pending.len(), 3);

        let started = Instant::now();
        assert_eq!(h.event_loop.update(), LoopControl::Continue);
        assert!(started.elapsed() < Duration::from_secs(2));

        let ids = h.network.sent().iter().map(|m| m.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(h.network.binds(), 2);
        assert!(h.sink.contains("failed to recreate main endpoint"));
    }

    #[test]
    fn unroutable_destination_is_dropped_quietly() {
        let mut h = harness();
        let ghost = Identity::new(b"ghost".to_vec());
        h.network.mark_unroutable(ghost.clone());
        h.sender
            .queue_send(OutgoingMessage::new(ghost, "push", 1, Vec::new()));
        h.sender.queue_send(push(2));

        assert_eq!(h.event_loop.update(), LoopControl::Continue);

        let ids = h.network.sent().iter().map(|m| m.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![2]);
        assert!(h.sink.contains("unreachable peer"));
    }

    #[test]
    fn stop_flag_ends_the_loop() {
        let mut h = harness();
        h.event_loop
            .stop_signal
            .store(true, std::sync::atomic::Ordering::SeqCst);

        assert_eq!(h.event_loop.update(), LoopControl::Stop);
    }
}
