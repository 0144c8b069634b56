//! Shared bus connection with a per-thread cache keyed by transport handle

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

use tracing::{debug, error, info, instrument, warn};

use crate::error::{BusError, Error, Result};
use crate::utils;

use super::{
    BusBuffer, BusEvent, BusSession, BusTransport, ConnectFlags, EventId, Param, ProtocolVersion,
    StreamEvent, StreamId, CORE_ID,
};

/// Key used for connections opened without an explicit socket.
const ANONYMOUS_HANDLE: RawFd = -1;

thread_local! {
    static CONNECTIONS: RefCell<HashMap<RawFd, Weak<BusConnection>>> = RefCell::new(HashMap::new());
}

/// Receiver of the events routed to one stream.
pub trait BusListener {
    fn on_stream_event(&self, event: StreamEvent);
    /// The stream's loop event source fired.
    fn on_signalled(&self);
    /// The core reported a fatal error; the connection is unusable.
    fn on_connection_failed(&self, message: &str);
}

/// One logical connection to the bus: loop, context and core.
///
/// Confined to the thread that created it; shared between streams through
/// [`ConnectionRef`].
pub struct BusConnection {
    handle: RawFd,
    session: RefCell<Box<dyn BusSession>>,
    client_version: ProtocolVersion,
    server_version: Cell<Option<ProtocolVersion>>,
    listeners: RefCell<HashMap<StreamId, Weak<dyn BusListener>>>,
    event_owners: RefCell<HashMap<EventId, StreamId>>,
    error: RefCell<Option<String>>,
    /// Woken when the last stream detaches and when the connection drops.
    #[cfg(feature = "tokio-driver")]
    idle: Rc<tokio::sync::Notify>,
}

/// Strong reference to a [`BusConnection`]; the connection tears down when
/// the last one drops.
#[derive(Clone)]
pub struct ConnectionRef(Rc<BusConnection>);

/// Non-owning handle; does not keep the connection open.
#[derive(Clone)]
pub struct WeakConnection(Weak<BusConnection>);

impl WeakConnection {
    pub fn upgrade(&self) -> Option<ConnectionRef> {
        self.0.upgrade().map(ConnectionRef)
    }
}

/// Return this thread's connection for `handle`, opening one if none is alive.
///
/// `None` connects to the default bus instead of a supplied socket.
#[instrument(
    skip(transport, handle),
    fields(handle = handle.map_or(ANONYMOUS_HANDLE, |fd| fd.as_raw_fd()))
)]
pub fn acquire(
    transport: &dyn BusTransport,
    handle: Option<BorrowedFd<'_>>,
) -> Result<ConnectionRef> {
    let key = handle.map_or(ANONYMOUS_HANDLE, |fd| fd.as_raw_fd());

    let cached = CONNECTIONS.with(|cache| cache.borrow().get(&key).and_then(Weak::upgrade));
    if let Some(conn) = cached {
        debug!("Reusing bus connection");
        return Ok(ConnectionRef(conn));
    }

    let socket = handle.map(utils::dup_handle).transpose()?;
    let conn = Rc::new(BusConnection::open(transport, key, socket)?);
    CONNECTIONS.with(|cache| cache.borrow_mut().insert(key, Rc::downgrade(&conn)));

    let conn = ConnectionRef(conn);
    // Drain the initial core info so the server version is known before
    // the first offers are built.
    conn.iterate()?;
    Ok(conn)
}

impl BusConnection {
    fn open(transport: &dyn BusTransport, handle: RawFd, socket: Option<OwnedFd>) -> Result<Self> {
        let mut session = transport.create_loop().map_err(Error::Connection)?;
        session.enter();

        if let Err(e) = session.create_context() {
            warn!("Failed to create bus context: {}", e);
            session.leave();
            return Err(Error::Connection(e));
        }

        if let Err(e) = session.connect(socket) {
            warn!("Failed to connect to bus: {}", e);
            session.leave();
            return Err(Error::Connection(e));
        }

        let client_version = transport.library_version();
        info!("Connected to bus (client {})", client_version);

        Ok(Self {
            handle,
            session: RefCell::new(session),
            client_version,
            server_version: Cell::new(None),
            listeners: RefCell::new(HashMap::new()),
            event_owners: RefCell::new(HashMap::new()),
            error: RefCell::new(None),
            #[cfg(feature = "tokio-driver")]
            idle: Rc::new(tokio::sync::Notify::new()),
        })
    }

    fn notify_idle(&self) {
        #[cfg(feature = "tokio-driver")]
        self.idle.notify_one();
    }
}

impl Drop for BusConnection {
    fn drop(&mut self) {
        info!("Tearing down bus connection {}", self.handle);
        self.notify_idle();
        let session = self.session.get_mut();
        session.leave();
        session.disconnect();
        // Context and loop go with the session itself.

        let handle = self.handle;
        let _ = CONNECTIONS.try_with(|cache| {
            if let Ok(mut cache) = cache.try_borrow_mut() {
                if cache.get(&handle).is_some_and(|w| w.strong_count() == 0) {
                    cache.remove(&handle);
                }
            }
        });
    }
}

impl ConnectionRef {
    pub fn handle(&self) -> RawFd {
        self.0.handle
    }

    pub fn client_version(&self) -> ProtocolVersion {
        self.0.client_version
    }

    /// `None` until the server has announced itself.
    pub fn server_version(&self) -> Option<ProtocolVersion> {
        self.0.server_version.get()
    }

    /// Fatal error reported by the core, if any.
    pub fn error(&self) -> Option<String> {
        self.0.error.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &ConnectionRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection(Rc::downgrade(&self.0))
    }

    #[cfg(feature = "tokio-driver")]
    pub(crate) fn idle_signal(&self) -> Rc<tokio::sync::Notify> {
        self.0.idle.clone()
    }

    pub fn has_listeners(&self) -> bool {
        self.0.listeners.borrow().values().any(|l| l.strong_count() > 0)
    }

    /// Run `f` with the loop descriptor; the session stays borrowed meanwhile.
    pub fn with_loop_fd<R>(&self, f: impl FnOnce(BorrowedFd<'_>) -> R) -> R {
        let session = self.0.session.borrow();
        f(session.loop_fd())
    }

    /// Advance the reactor by one step and route every event it produced.
    ///
    /// Returns the number of events dispatched.
    pub fn iterate(&self) -> Result<usize> {
        let events = self.0.session.borrow_mut().iterate().map_err(|e| {
            warn!("Bus loop iterate failed: {}", e);
            Error::Bus(e)
        })?;

        let count = events.len();
        for event in events {
            self.dispatch(event);
        }
        Ok(count)
    }

    fn dispatch(&self, event: BusEvent) {
        match event {
            BusEvent::CoreInfo { version } => match version.parse::<ProtocolVersion>() {
                Ok(v) => {
                    debug!("Bus server version {}", v);
                    self.0.server_version.set(Some(v));
                }
                Err(e) => warn!("Ignoring server version {:?}: {}", version, e),
            },
            BusEvent::CoreError {
                id,
                seq,
                res,
                message,
            } => {
                debug!("Bus remote error: id={} seq={} res={} {}", id, seq, res, message);
                if id == CORE_ID {
                    error!("Bus connection failed: {}", message);
                    *self.0.error.borrow_mut() = Some(message.clone());
                    for listener in self.live_listeners() {
                        listener.on_connection_failed(&message);
                    }
                }
            }
            BusEvent::Stream { id, event } => {
                if let Some(listener) = self.listener(id) {
                    listener.on_stream_event(event);
                }
            }
            BusEvent::Signalled(event) => {
                let owner = self.0.event_owners.borrow().get(&event).copied();
                if let Some(listener) = owner.and_then(|id| self.listener(id)) {
                    listener.on_signalled();
                }
            }
        }
    }

    fn listener(&self, id: StreamId) -> Option<Rc<dyn BusListener>> {
        self.0.listeners.borrow().get(&id).and_then(Weak::upgrade)
    }

    fn live_listeners(&self) -> Vec<Rc<dyn BusListener>> {
        let mut listeners: Vec<_> = self
            .0
            .listeners
            .borrow()
            .iter()
            .filter_map(|(id, l)| Some((*id, l.upgrade()?)))
            .collect();
        listeners.sort_by_key(|(id, _)| *id);
        listeners.into_iter().map(|(_, l)| l).collect()
    }

    pub fn create_stream(&self, name: &str, listener: Weak<dyn BusListener>) -> Result<StreamId> {
        let id = self.0.session.borrow_mut().create_stream(name)?;
        self.0.listeners.borrow_mut().insert(id, listener);
        Ok(id)
    }

    pub fn connect_stream(
        &self,
        id: StreamId,
        target: u32,
        flags: ConnectFlags,
        params: &[Param],
    ) -> std::result::Result<(), BusError> {
        self.0
            .session
            .borrow_mut()
            .connect_stream(id, target, flags, params)
    }

    pub fn update_params(&self, id: StreamId, params: &[Param]) -> Result<()> {
        Ok(self.0.session.borrow_mut().update_params(id, params)?)
    }

    pub fn set_active(&self, id: StreamId, active: bool) -> Result<()> {
        Ok(self.0.session.borrow_mut().set_active(id, active)?)
    }

    pub fn destroy_stream(&self, id: StreamId) {
        self.0.listeners.borrow_mut().remove(&id);
        self.0.event_owners.borrow_mut().retain(|_, owner| *owner != id);
        self.0.session.borrow_mut().destroy_stream(id);
        if !self.has_listeners() {
            self.0.notify_idle();
        }
    }

    pub fn dequeue_buffer(&self, id: StreamId) -> Option<BusBuffer> {
        self.0.session.borrow_mut().dequeue_buffer(id)
    }

    pub fn queue_buffer(&self, id: StreamId, buffer: BusBuffer) {
        self.0.session.borrow_mut().queue_buffer(id, buffer)
    }

    /// Create a loop event source whose signals are routed to stream `owner`.
    pub fn add_event(&self, owner: StreamId) -> Result<EventId> {
        let event = self.0.session.borrow_mut().add_event()?;
        self.0.event_owners.borrow_mut().insert(event, owner);
        Ok(event)
    }

    pub fn signal_event(&self, event: EventId) {
        self.0.session.borrow_mut().signal_event(event)
    }

    pub fn destroy_event(&self, event: EventId) {
        self.0.event_owners.borrow_mut().remove(&event);
        self.0.session.borrow_mut().destroy_event(event)
    }
}
