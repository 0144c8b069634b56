//! Scripted in-memory bus for tests

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use crate::error::BusError;

use super::{
    BusBuffer, BusEvent, BusSession, BusStreamState, BusTransport, ConnectFlags, EventId,
    NegotiatedFormat, Param, ProtocolVersion, StreamEvent, StreamId,
};

#[derive(Debug, Default)]
pub(crate) struct MockStream {
    pub name: String,
    pub target: Option<u32>,
    pub flags: Option<ConnectFlags>,
    pub params: Vec<Vec<Param>>,
    pub active: Option<bool>,
    pub destroyed: bool,
}

#[derive(Default)]
struct MockState {
    library_version: Option<ProtocolVersion>,
    server_version: Option<String>,
    fail_context: bool,
    fail_connect: Option<String>,
    reject_stream_connect: Option<String>,
    sessions_opened: usize,
    sessions_dropped: usize,
    log: Vec<&'static str>,
    pending: VecDeque<BusEvent>,
    wakers: Vec<UnixStream>,
    next_id: u32,
    streams: HashMap<StreamId, MockStream>,
    buffers: HashMap<StreamId, VecDeque<BusBuffer>>,
    returned: Vec<u32>,
    checked_out: usize,
    max_checked_out: usize,
    events: HashSet<EventId>,
}

impl MockState {
    fn wake(&mut self) {
        for waker in &mut self.wakers {
            let _ = waker.write(&[1]);
        }
    }
}

/// Handle to the shared mock state; doubles as the transport.
#[derive(Clone, Default)]
pub(crate) struct MockBus {
    state: Rc<RefCell<MockState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_library_version(&self, version: ProtocolVersion) {
        self.state.borrow_mut().library_version = Some(version);
    }

    pub fn set_server_version(&self, version: &str) {
        self.state.borrow_mut().server_version = Some(version.to_owned());
    }

    pub fn fail_context(&self) {
        self.state.borrow_mut().fail_context = true;
    }

    pub fn fail_connect(&self, message: &str) {
        self.state.borrow_mut().fail_connect = Some(message.to_owned());
    }

    pub fn reject_stream_connect(&self, message: &str) {
        self.state.borrow_mut().reject_stream_connect = Some(message.to_owned());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.borrow_mut();
        state.fail_context = false;
        state.fail_connect = None;
        state.reject_stream_connect = None;
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.borrow().sessions_opened
    }

    pub fn sessions_dropped(&self) -> usize {
        self.state.borrow().sessions_dropped
    }

    pub fn teardown_log(&self) -> Vec<&'static str> {
        self.state
            .borrow()
            .log
            .iter()
            .copied()
            .filter(|e| matches!(*e, "leave" | "disconnect" | "destroy"))
            .collect()
    }

    pub fn push(&self, event: BusEvent) {
        let mut state = self.state.borrow_mut();
        state.pending.push_back(event);
        state.wake();
    }

    pub fn push_stream(&self, id: StreamId, event: StreamEvent) {
        self.push(BusEvent::Stream { id, event });
    }

    pub fn push_state(&self, id: StreamId, old: BusStreamState, new: BusStreamState) {
        self.push_stream(id, StreamEvent::StateChanged { old, new, error: None });
    }

    pub fn push_format(&self, id: StreamId, format: NegotiatedFormat) {
        self.push_stream(id, StreamEvent::FormatChanged(Some(format)));
    }

    /// Queue `buffer` for dequeue and announce it with a process event.
    pub fn push_buffer(&self, id: StreamId, buffer: BusBuffer) {
        self.state
            .borrow_mut()
            .buffers
            .entry(id)
            .or_default()
            .push_back(buffer);
        self.push_stream(id, StreamEvent::Process);
    }

    pub fn core_error(&self, message: &str) {
        self.push(BusEvent::CoreError {
            id: 0,
            seq: 0,
            res: -32,
            message: message.to_owned(),
        });
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<_> = self.state.borrow().streams.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn with_stream<R>(&self, id: StreamId, f: impl FnOnce(&MockStream) -> R) -> R {
        f(&self.state.borrow().streams[&id])
    }

    /// Every param set sent for `id`: the connect params first, then each update.
    pub fn params(&self, id: StreamId) -> Vec<Vec<Param>> {
        self.with_stream(id, |s| s.params.clone())
    }

    pub fn returned_buffers(&self) -> Vec<u32> {
        self.state.borrow().returned.clone()
    }

    pub fn checked_out(&self) -> usize {
        self.state.borrow().checked_out
    }

    pub fn max_checked_out(&self) -> usize {
        self.state.borrow().max_checked_out
    }

    pub fn live_events(&self) -> usize {
        self.state.borrow().events.len()
    }
}

impl BusTransport for MockBus {
    fn library_version(&self) -> ProtocolVersion {
        self.state
            .borrow()
            .library_version
            .unwrap_or(ProtocolVersion::new(1, 0, 0))
    }

    fn create_loop(&self) -> Result<Box<dyn BusSession>, BusError> {
        let (reader, writer) =
            UnixStream::pair().map_err(|e| BusError::Loop(e.to_string()))?;
        reader
            .set_nonblocking(true)
            .map_err(|e| BusError::Loop(e.to_string()))?;
        writer
            .set_nonblocking(true)
            .map_err(|e| BusError::Loop(e.to_string()))?;

        let mut state = self.state.borrow_mut();
        state.sessions_opened += 1;
        state.wakers.push(writer);
        Ok(Box::new(MockSession {
            state: self.state.clone(),
            reader,
            socket: None,
        }))
    }
}

struct MockSession {
    state: Rc<RefCell<MockState>>,
    reader: UnixStream,
    socket: Option<OwnedFd>,
}

impl Drop for MockSession {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.sessions_dropped += 1;
        state.log.push("destroy");
    }
}

impl BusSession for MockSession {
    fn loop_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }

    fn enter(&mut self) {
        self.state.borrow_mut().log.push("enter");
    }

    fn leave(&mut self) {
        self.state.borrow_mut().log.push("leave");
    }

    fn create_context(&mut self) -> Result<(), BusError> {
        if self.state.borrow().fail_context {
            return Err(BusError::Context);
        }
        Ok(())
    }

    fn connect(&mut self, socket: Option<OwnedFd>) -> Result<(), BusError> {
        let mut state = self.state.borrow_mut();
        if let Some(message) = &state.fail_connect {
            return Err(BusError::Connect(message.clone()));
        }
        self.socket = socket;
        if let Some(version) = state.server_version.clone() {
            state.pending.push_back(BusEvent::CoreInfo { version });
            state.wake();
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.socket = None;
        self.state.borrow_mut().log.push("disconnect");
    }

    fn iterate(&mut self) -> Result<Vec<BusEvent>, BusError> {
        let mut scratch = [0u8; 64];
        loop {
            match self.reader.read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(BusError::Loop(e.to_string())),
            }
        }
        Ok(self.state.borrow_mut().pending.drain(..).collect())
    }

    fn create_stream(&mut self, name: &str) -> Result<StreamId, BusError> {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        let id = StreamId(state.next_id);
        state.streams.insert(
            id,
            MockStream {
                name: name.to_owned(),
                ..Default::default()
            },
        );
        Ok(id)
    }

    fn connect_stream(
        &mut self,
        id: StreamId,
        target: u32,
        flags: ConnectFlags,
        params: &[Param],
    ) -> Result<(), BusError> {
        let mut state = self.state.borrow_mut();
        if let Some(message) = &state.reject_stream_connect {
            return Err(BusError::Rejected(message.clone()));
        }
        let stream = state
            .streams
            .get_mut(&id)
            .ok_or(BusError::UnknownStream(id.0))?;
        stream.target = Some(target);
        stream.flags = Some(flags);
        stream.params.push(params.to_vec());
        Ok(())
    }

    fn update_params(&mut self, id: StreamId, params: &[Param]) -> Result<(), BusError> {
        let mut state = self.state.borrow_mut();
        let stream = state
            .streams
            .get_mut(&id)
            .ok_or(BusError::UnknownStream(id.0))?;
        stream.params.push(params.to_vec());
        Ok(())
    }

    fn set_active(&mut self, id: StreamId, active: bool) -> Result<(), BusError> {
        let mut state = self.state.borrow_mut();
        let stream = state
            .streams
            .get_mut(&id)
            .ok_or(BusError::UnknownStream(id.0))?;
        stream.active = Some(active);
        Ok(())
    }

    fn destroy_stream(&mut self, id: StreamId) {
        let mut state = self.state.borrow_mut();
        if let Some(stream) = state.streams.get_mut(&id) {
            stream.destroyed = true;
        }
        state.buffers.remove(&id);
    }

    fn dequeue_buffer(&mut self, id: StreamId) -> Option<BusBuffer> {
        let mut state = self.state.borrow_mut();
        let buffer = state.buffers.get_mut(&id)?.pop_front()?;
        state.checked_out += 1;
        state.max_checked_out = state.max_checked_out.max(state.checked_out);
        Some(buffer)
    }

    fn queue_buffer(&mut self, _id: StreamId, buffer: BusBuffer) {
        let mut state = self.state.borrow_mut();
        state.checked_out -= 1;
        state.returned.push(buffer.id);
    }

    fn add_event(&mut self) -> Result<EventId, BusError> {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        let event = EventId(state.next_id);
        state.events.insert(event);
        Ok(event)
    }

    fn signal_event(&mut self, event: EventId) {
        let mut state = self.state.borrow_mut();
        if state.events.contains(&event) {
            state.pending.push_back(BusEvent::Signalled(event));
            state.wake();
        }
    }

    fn destroy_event(&mut self, event: EventId) {
        let mut state = self.state.borrow_mut();
        state.events.remove(&event);
        state
            .pending
            .retain(|e| !matches!(e, BusEvent::Signalled(id) if *id == event));
    }
}
