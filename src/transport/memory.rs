//! In-process stand-in for the TCP endpoints. Like the TCP router, a
//! reopened main endpoint keeps its inbound channel and every route, so
//! reconnect tests exercise the same contract.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::message::{Identity, IncomingMessage, OutgoingMessage};
use crate::wire::codec::WireCodec;

use super::{
    Broadcaster, Delivery, EndpointSettings, InboundEvent, Transport, TransportError,
    TransportFactory,
};

#[derive(Default)]
struct NetworkState {
    inbound: Option<Sender<InboundEvent>>,
    sent: Vec<OutgoingMessage>,
    heartbeats: Vec<(Instant, Vec<u8>)>,
    binds: usize,
    failing_binds: usize,
    failing_sends: usize,
    unroutable: HashSet<Identity>,
}

#[derive(Clone, Default)]
pub(crate) struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().expect("memory network lock poisoned")
    }

    /// Delivers a request to the currently bound main endpoint.
    pub(crate) fn inject(&self, request: IncomingMessage) -> bool {
        let inbound = self.lock().inbound.clone();
        inbound.is_some_and(|sender| sender.send(InboundEvent::Request(request)).is_ok())
    }

    pub(crate) fn inject_fatal(&self) -> bool {
        let inbound = self.lock().inbound.clone();
        let error = TransportError::Accept {
            source: io::Error::new(io::ErrorKind::Other, "injected accept failure"),
        };
        inbound.is_some_and(|sender| sender.send(InboundEvent::Fatal(error)).is_ok())
    }

    pub(crate) fn fail_next_binds(&self, count: usize) {
        self.lock().failing_binds = count;
    }

    pub(crate) fn fail_next_sends(&self, count: usize) {
        self.lock().failing_sends = count;
    }

    pub(crate) fn mark_unroutable(&self, identity: Identity) {
        self.lock().unroutable.insert(identity);
    }

    pub(crate) fn sent(&self) -> Vec<OutgoingMessage> {
        self.lock().sent.clone()
    }

    pub(crate) fn binds(&self) -> usize {
        self.lock().binds
    }

    pub(crate) fn heartbeats(&self) -> Vec<Vec<u8>> {
        self.lock().heartbeats.iter().map(|(_, body)| body.clone()).collect()
    }

    pub(crate) fn heartbeat_times(&self) -> Vec<Instant> {
        self.lock().heartbeats.iter().map(|(at, _)| *at).collect()
    }

    pub(crate) fn wait_for_sent(&self, count: usize, timeout: Duration) -> Vec<OutgoingMessage> {
        self.wait_until(timeout, |state| state.sent.len() >= count);
        self.sent()
    }

    pub(crate) fn wait_for_heartbeats(&self, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
        self.wait_until(timeout, |state| state.heartbeats.len() >= count);
        self.heartbeats()
    }

    pub(crate) fn wait_for_binds(&self, count: usize, timeout: Duration) -> usize {
        self.wait_until(timeout, |state| state.binds >= count);
        self.binds()
    }

    /// Counts a bind of the main endpoint, honouring injected failures.
    fn try_bind(&self, address: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.failing_binds > 0 {
            state.failing_binds -= 1;
            return Err(TransportError::Bind {
                address: address.to_owned(),
                source: io::Error::new(io::ErrorKind::AddrInUse, "injected bind failure"),
            });
        }
        state.binds += 1;
        Ok(())
    }

    fn wait_until(&self, timeout: Duration, ready: impl Fn(&NetworkState) -> bool) {
        let deadline = Instant::now() + timeout;
        while !ready(&self.lock()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }
}

pub(crate) struct MemoryTransport {
    inbound: Receiver<InboundEvent>,
    network: MemoryNetwork,
}

impl Transport for MemoryTransport {
    fn inbound(&self) -> &Receiver<InboundEvent> {
        &self.inbound
    }

    fn send(&mut self, message: &OutgoingMessage) -> Result<Delivery, TransportError> {
        let mut state = self.network.lock();
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(TransportError::Closed);
        }
        if state.unroutable.contains(&message.destination) {
            return Ok(Delivery::Unroutable);
        }
        state.sent.push(message.clone());
        Ok(Delivery::Sent)
    }

    fn reopen(&mut self) -> Result<(), TransportError> {
        self.network.try_bind("memory")
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn shutdown(&mut self) {}
}

pub(crate) struct MemoryBroadcaster {
    network: MemoryNetwork,
}

impl Broadcaster for MemoryBroadcaster {
    fn publish(&mut self, body: &[u8]) -> Result<usize, TransportError> {
        self.network
            .lock()
            .heartbeats
            .push((Instant::now(), body.to_vec()));
        Ok(1)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn shutdown(&mut self) {}
}

impl TransportFactory for MemoryNetwork {
    fn bind_main(&self, settings: &EndpointSettings) -> Result<Box<dyn Transport>, TransportError> {
        self.try_bind(&settings.address)?;

        let (sender, receiver) = unbounded();
        self.lock().inbound = Some(sender);
        Ok(Box::new(MemoryTransport {
            inbound: receiver,
            network: self.clone(),
        }))
    }

    fn bind_heartbeat(
        &self,
        _address: &str,
        _codec: WireCodec,
    ) -> Result<Box<dyn Broadcaster>, TransportError> {
        Ok(Box::new(MemoryBroadcaster {
            network: self.clone(),
        }))
    }
}
