//! Consumer stream: connect, negotiate, receive, renegotiate, stop.

mod handler;
mod state;

pub use handler::{ImportFailed, StreamHandler};
pub use state::StreamState;

use std::cell::RefCell;
use std::os::fd::BorrowedFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::bus::{
    self, BusListener, BusStreamState, BusTransport, ConnectFlags, ConnectionRef, EventId,
    NegotiatedFormat, Param, Size, StreamEvent, StreamId,
};
use crate::capture::{BufferIngester, VideoFormat};
use crate::error::{BusError, Error, Result};
use crate::negotiation::{
    DmaBufCapabilities, ModifierCatalog, NegotiationFlags, RenegotiationController,
    StreamNegotiator,
};
use crate::{Config, CONFIG};

/// A video stream consumed from one bus node.
///
/// Confined to the thread that created it. Events are delivered to the
/// handler while the stream's connection is iterated (see
/// [`bus::driver`]); dropping the stream stops it.
pub struct Stream {
    inner: Rc<StreamInner>,
}

struct StreamInner {
    core: RefCell<StreamCore>,
    handler: RefCell<Box<dyn StreamHandler>>,
}

/// Bus-side objects owned by a started stream.
struct Attached {
    conn: ConnectionRef,
    id: StreamId,
    renegotiate: EventId,
}

impl Attached {
    fn detach(self) {
        // Pending renegotiation signals die with the event source.
        self.conn.destroy_event(self.renegotiate);
        self.conn.destroy_stream(self.id);
    }
}

struct StreamCore {
    config: Arc<Config>,
    state: StreamState,
    name: Option<String>,
    node_id: u32,
    with_damage: bool,
    attached: Option<Attached>,
    catalog: ModifierCatalog,
    negotiator: StreamNegotiator,
    ingester: BufferIngester,
    controller: RenegotiationController,
    allow_dmabuf: bool,
    video_format: Option<NegotiatedFormat>,
    presentation_timestamp: i64,
    error: Option<String>,
}

/// What to tell the handler once the core is released.
enum Notify {
    Ready,
    Start,
    Stop(Option<String>),
}

impl StreamCore {
    fn transition(&mut self, to: StreamState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!("Stream {} state {} -> {}", self.node_id, self.state, to);
        self.state = to;
        Ok(())
    }

    /// Enter a terminal state, keeping the first error reported.
    fn terminate(&mut self, to: StreamState, error: Option<String>) {
        if self.state.is_terminal() {
            return;
        }
        debug!("Stream {} state {} -> {}", self.node_id, self.state, to);
        if self.error.is_none() {
            self.error = error;
        }
        self.state = to;
    }

    fn fail(&mut self, error: Error) -> Error {
        self.terminate(StreamState::Error, Some(error.to_string()));
        error
    }

    fn handles(&self) -> Option<(ConnectionRef, StreamId)> {
        self.attached.as_ref().map(|a| (a.conn.clone(), a.id))
    }

    /// Format offers for the current catalog and peer versions.
    fn format_params(&mut self, conn: &ConnectionRef) -> Vec<Param> {
        self.controller.set_server_version(conn.server_version());
        let mut flags =
            NegotiationFlags::for_versions(conn.client_version(), conn.server_version());
        flags.allow_dmabuf &= self.config.stream.allow_dmabuf && self.controller.allows_dmabuf();
        self.allow_dmabuf = flags.allow_dmabuf;

        self.negotiator
            .build_offers(&self.catalog, flags)
            .into_iter()
            .map(Param::EnumFormat)
            .collect()
    }
}

impl Stream {
    /// New idle stream using the process-wide [`CONFIG`].
    pub fn new(handler: impl StreamHandler + 'static) -> Self {
        Self::with_config(CONFIG.load_full(), handler)
    }

    pub fn with_config(config: Arc<Config>, handler: impl StreamHandler + 'static) -> Self {
        let core = StreamCore {
            state: StreamState::Idle,
            name: None,
            node_id: 0,
            with_damage: config.stream.with_damage,
            attached: None,
            catalog: ModifierCatalog::default(),
            negotiator: StreamNegotiator::new(config.clone()),
            ingester: BufferIngester::new(config.clone()),
            controller: RenegotiationController::new(None),
            allow_dmabuf: false,
            video_format: None,
            presentation_timestamp: 0,
            error: None,
            config,
        };

        Self {
            inner: Rc::new(StreamInner {
                core: RefCell::new(core),
                handler: RefCell::new(Box::new(handler)),
            }),
        }
    }

    /// Name announced to the bus; defaults to `<prefix>-<node id>`.
    pub fn set_name(&self, name: impl Into<String>) {
        self.inner.core.borrow_mut().name = Some(name.into());
    }

    /// Request damage metadata. Takes effect at the next format fixation.
    pub fn set_damage_enabled(&self, enabled: bool) {
        self.inner.core.borrow_mut().with_damage = enabled;
    }

    /// Connect to `node_id`, over `handle` if given or the default bus
    /// otherwise.
    ///
    /// Queries `caps` once for importable modifiers, offers every supported
    /// format and leaves the stream negotiating. Failures are terminal: the
    /// stream ends in [`StreamState::Error`] and a new one must be created.
    #[instrument(skip(self, transport, caps, handle))]
    pub fn start(
        &self,
        transport: &dyn BusTransport,
        caps: &dyn DmaBufCapabilities,
        node_id: u32,
        handle: Option<BorrowedFd<'_>>,
    ) -> Result<()> {
        let mut core = self.inner.core.borrow_mut();
        core.transition(StreamState::Connecting)?;
        core.node_id = node_id;

        let conn = bus::acquire(transport, handle).map_err(|e| core.fail(e))?;
        if let Some(message) = conn.error() {
            warn!("Bus connection already failed: {}", message);
            return Err(core.fail(Error::Connection(BusError::Connect(message))));
        }

        let prefix = core.config.stream.name_prefix.clone();
        let name = core
            .name
            .get_or_insert_with(|| format!("{}-{}", prefix, node_id))
            .clone();

        let listener: Weak<dyn BusListener> = Rc::downgrade(&self.inner) as Weak<dyn BusListener>;
        let id = conn.create_stream(&name, listener).map_err(|e| core.fail(e))?;
        let renegotiate = match conn.add_event(id) {
            Ok(event) => event,
            Err(e) => {
                conn.destroy_stream(id);
                return Err(core.fail(e));
            }
        };

        core.catalog = ModifierCatalog::query(caps, &VideoFormat::SUPPORTED);
        core.controller = RenegotiationController::new(conn.server_version());
        let params = core.format_params(&conn);

        if let Err(source) = conn.connect_stream(id, node_id, ConnectFlags::CONSUMER, &params) {
            warn!("Could not connect to stream: {}", source);
            conn.destroy_event(renegotiate);
            conn.destroy_stream(id);
            return Err(core.fail(Error::StreamConnect { node_id, source }));
        }

        core.attached = Some(Attached {
            conn,
            id,
            renegotiate,
        });
        core.transition(StreamState::Negotiating)?;
        info!("Created stream {} for node {}", name, node_id);
        Ok(())
    }

    /// Stop and detach from the bus. No handler callback follows.
    pub fn stop(&self) {
        self.inner.teardown();
    }

    /// Pause or resume data flow without renegotiating.
    pub fn set_active(&self, active: bool) -> Result<()> {
        let (conn, id) = self.inner.core.borrow().handles().ok_or(Error::NotConnected)?;
        conn.set_active(id, active)
    }

    /// Report that a DMA-BUF with `modifier` could not be imported for
    /// `format`. Same effect as returning [`ImportFailed`] from the handler.
    pub fn renegotiate_modifier_failed(&self, format: VideoFormat, modifier: u64) {
        self.inner.import_failed(format, modifier);
    }

    pub fn state(&self) -> StreamState {
        self.inner.core.borrow().state
    }

    pub fn node_id(&self) -> u32 {
        self.inner.core.borrow().node_id
    }

    pub fn name(&self) -> Option<String> {
        self.inner.core.borrow().name.clone()
    }

    /// Last error reported for this stream or its connection.
    pub fn error(&self) -> Option<String> {
        self.inner.core.borrow().error.clone()
    }

    pub fn size(&self) -> Size {
        self.inner
            .core
            .borrow()
            .video_format
            .map(|f| f.size)
            .unwrap_or_default()
    }

    /// Maximum framerate of the fixed format, `0/1` when unknown.
    pub fn framerate(&self) -> (u32, u32) {
        self.inner
            .core
            .borrow()
            .video_format
            .map_or((0, 1), |f| f.max_framerate)
    }

    pub fn video_format(&self) -> Option<NegotiatedFormat> {
        self.inner.core.borrow().video_format
    }

    pub fn current_presentation_timestamp(&self) -> i64 {
        self.inner.core.borrow().presentation_timestamp
    }

    /// Whether the latest offers allowed DMA-BUF transport.
    pub fn allow_dmabuf(&self) -> bool {
        self.inner.core.borrow().allow_dmabuf
    }

    /// The connection carrying this stream, for driving its reactor.
    pub fn connection(&self) -> Option<ConnectionRef> {
        self.inner.core.borrow().handles().map(|(conn, _)| conn)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

impl StreamInner {
    fn teardown(&self) {
        let attached = match self.core.try_borrow_mut() {
            Ok(mut core) => {
                if !core.state.is_terminal() {
                    info!("Stopping stream {}", core.node_id);
                }
                core.terminate(StreamState::Stopped, None);
                core.attached.take()
            }
            Err(_) => {
                warn!("Cannot stop a stream from inside its own callback");
                None
            }
        };
        if let Some(attached) = attached {
            attached.detach();
        }
    }

    fn notify(&self, notify: Notify) {
        let mut handler = self.handler.borrow_mut();
        match notify {
            Notify::Ready => handler.stream_ready(),
            Notify::Start => handler.start_streaming(),
            Notify::Stop(reason) => handler.stop_streaming(reason.as_deref()),
        }
    }

    fn state_changed(&self, old: BusStreamState, new: BusStreamState, message: Option<String>) {
        debug!("Bus stream state {:?} -> {:?} ({:?})", old, new, message);

        let notify = {
            let mut core = self.core.borrow_mut();
            match new {
                BusStreamState::Error => {
                    let message = message.unwrap_or_else(|| "stream error".to_owned());
                    warn!("Stream error: {}", message);
                    core.terminate(StreamState::Error, Some(message.clone()));
                    Some(Notify::Stop(Some(message)))
                }
                BusStreamState::Paused if core.state != StreamState::Streaming => {
                    Some(Notify::Ready)
                }
                BusStreamState::Streaming if core.state == StreamState::ParamsFixed => {
                    core.transition(StreamState::Streaming).ok().map(|_| Notify::Start)
                }
                BusStreamState::Unconnected => {
                    info!("Stream {} disconnected by the bus", core.node_id);
                    core.terminate(StreamState::Stopped, None);
                    Some(Notify::Stop(None))
                }
                _ => None,
            }
        };

        if let Some(notify) = notify {
            self.notify(notify);
        }
    }

    fn format_changed(&self, format: NegotiatedFormat) {
        let (conn, id, params) = {
            let mut core = self.core.borrow_mut();
            let Some((conn, id)) = core.handles() else {
                return;
            };
            if matches!(core.state, StreamState::ParamsFixed | StreamState::Streaming) {
                let _ = core.transition(StreamState::Negotiating);
            }
            if let Err(e) = core.transition(StreamState::ParamsFixed) {
                warn!("Ignoring format change: {}", e);
                return;
            }

            let import = core
                .negotiator
                .import_allowed(core.allow_dmabuf, &core.catalog, &format);
            info!(
                "Negotiated {:?} {}x{} (modifier {:?}, dmabuf {})",
                format.format, format.size.width, format.size.height, format.modifier, import
            );
            let params = core
                .negotiator
                .build_buffer_and_meta_params(import, core.with_damage);
            core.video_format = Some(format);
            (conn, id, params)
        };

        if let Err(e) = conn.update_params(id, &params) {
            warn!("Failed to send buffer params: {}", e);
        }
        self.handler.borrow_mut().parameters_changed();
    }

    /// Dequeue one buffer, hand its frame to the consumer, requeue it.
    fn process(&self) {
        let (conn, id, ingester, video) = {
            let core = self.core.borrow();
            let Some((conn, id)) = core.handles() else {
                return;
            };
            (conn, id, core.ingester.clone(), core.video_format)
        };

        let Some(buffer) = conn.dequeue_buffer(id) else {
            debug!("Out of buffers");
            return;
        };

        let result = match video {
            Some(video) => {
                let frame = ingester.handle(&buffer, &video);
                self.core.borrow_mut().presentation_timestamp = frame.presentation_timestamp;
                self.handler.borrow_mut().frame_received(&frame)
            }
            None => {
                debug!("Buffer {} arrived before a format was fixed", buffer.id);
                Ok(())
            }
        };
        conn.queue_buffer(id, buffer);

        if let Err(failed) = result {
            debug!("{}", failed);
            self.import_failed(failed.format, failed.modifier);
        }
    }

    fn import_failed(&self, format: VideoFormat, modifier: u64) {
        let (conn, event) = {
            let mut core = self.core.borrow_mut();
            if core.state.is_terminal() {
                return;
            }
            let attached = core.attached.as_ref();
            let Some((conn, event)) = attached.map(|a| (a.conn.clone(), a.renegotiate)) else {
                return;
            };

            let core = &mut *core;
            core.controller.set_server_version(conn.server_version());
            core.controller
                .on_import_failure(&mut core.catalog, format, modifier);
            if core.state != StreamState::Negotiating {
                if let Err(e) = core.transition(StreamState::Negotiating) {
                    debug!("Renegotiating from unexpected state: {}", e);
                }
            }
            (conn, event)
        };
        conn.signal_event(event);
    }

    /// Re-send the format offers; runs from the renegotiation event source.
    fn renegotiate(&self) {
        let (conn, id, params) = {
            let mut core = self.core.borrow_mut();
            if core.state.is_terminal() {
                return;
            }
            let Some((conn, id)) = core.handles() else {
                return;
            };
            let params = core.format_params(&conn);
            (conn, id, params)
        };

        debug!("Re-sending {} format offers", params.len());
        if let Err(e) = conn.update_params(id, &params) {
            warn!("Failed to update format offers: {}", e);
        }
    }
}

impl BusListener for StreamInner {
    fn on_stream_event(&self, event: StreamEvent) {
        if self.core.borrow().state.is_terminal() {
            return;
        }
        match event {
            StreamEvent::StateChanged { old, new, error } => self.state_changed(old, new, error),
            StreamEvent::FormatChanged(Some(format)) => self.format_changed(format),
            StreamEvent::FormatChanged(None) => debug!("Format cleared"),
            StreamEvent::Process => self.process(),
        }
    }

    fn on_signalled(&self) {
        self.renegotiate();
    }

    fn on_connection_failed(&self, message: &str) {
        {
            let mut core = self.core.borrow_mut();
            if core.state.is_terminal() {
                return;
            }
            error!("Stream {} lost its bus connection: {}", core.node_id, message);
            core.terminate(StreamState::Stopped, Some(message.to_owned()));
        }

        let mut handler = self.handler.borrow_mut();
        handler.connection_failed(message);
        handler.stop_streaming(Some(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::fs::File;
    use std::os::fd::{AsFd, AsRawFd};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use crate::bus::mock::MockBus;
    use crate::bus::{
        BusBuffer, Chunk, DataKind, DataPlane, DataTypeMask, FormatOffer,
        ModifierProperty, ProtocolVersion,
    };
    use crate::capture::format::DRM_FORMAT_MOD_INVALID;
    use crate::capture::frame::{Payload, Rect};
    use crate::capture::Frame;
    use crate::negotiation::catalog::tests::{FakeGpu, TILED, Y_TILED};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        Ready,
        Start,
        Stop(Option<String>),
        Params,
        Failed(String),
        Frame { payload: &'static str, damage: usize },
    }

    #[derive(Clone, Default)]
    struct Recorder {
        seen: Rc<RefCell<Vec<Seen>>>,
        reject_dmabuf: Rc<Cell<bool>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<Seen> {
            self.seen.borrow().clone()
        }

        fn clear(&self) {
            self.seen.borrow_mut().clear();
        }
    }

    impl StreamHandler for Recorder {
        fn frame_received(&mut self, frame: &Frame<'_>) -> std::result::Result<(), ImportFailed> {
            let payload = match &frame.payload {
                Payload::None => "none",
                Payload::DmaBuf(_) => "dmabuf",
                Payload::Image(_) => "image",
                Payload::Local(_) => "local",
            };
            let damage = frame.damage.as_ref().map_or(0, |d| d.rects().len());
            self.seen.borrow_mut().push(Seen::Frame { payload, damage });

            if let Payload::DmaBuf(attribs) = &frame.payload {
                if self.reject_dmabuf.get() {
                    return Err(ImportFailed {
                        format: frame.format,
                        modifier: attribs.modifier,
                    });
                }
            }
            Ok(())
        }

        fn stream_ready(&mut self) {
            self.seen.borrow_mut().push(Seen::Ready);
        }

        fn start_streaming(&mut self) {
            self.seen.borrow_mut().push(Seen::Start);
        }

        fn stop_streaming(&mut self, reason: Option<&str>) {
            self.seen.borrow_mut().push(Seen::Stop(reason.map(str::to_owned)));
        }

        fn parameters_changed(&mut self) {
            self.seen.borrow_mut().push(Seen::Params);
        }

        fn connection_failed(&mut self, message: &str) {
            self.seen.borrow_mut().push(Seen::Failed(message.to_owned()));
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn start(bus: &MockBus, handle: Option<BorrowedFd<'_>>) -> (Stream, Recorder, StreamId) {
        init_tracing();
        let recorder = Recorder::default();
        let stream = Stream::with_config(Arc::new(Config::default()), recorder.clone());
        stream.start(bus, &FakeGpu::default(), 42, handle).unwrap();
        let id = *bus.stream_ids().last().unwrap();
        (stream, recorder, id)
    }

    fn step(stream: &Stream) {
        stream.connection().unwrap().iterate().unwrap();
    }

    fn offers(params: &[Param]) -> Vec<FormatOffer> {
        params
            .iter()
            .filter_map(|p| match p {
                Param::EnumFormat(offer) => Some(offer.clone()),
                _ => None,
            })
            .collect()
    }

    fn data_types(params: &[Param]) -> DataTypeMask {
        params
            .iter()
            .find_map(|p| match p {
                Param::Buffers(b) => Some(b.data_types),
                _ => None,
            })
            .unwrap()
    }

    fn modifier_choices(params: &[Param], format: VideoFormat) -> Vec<u64> {
        offers(params)
            .iter()
            .filter(|o| o.format == format)
            .flat_map(|o| o.modifier.modifiers())
            .collect()
    }

    fn bgrx(modifier: u64) -> NegotiatedFormat {
        NegotiatedFormat::new(VideoFormat::Bgrx, Size::new(64, 64)).with_modifier(modifier)
    }

    fn dmabuf_buffer(id: u32, file: &File) -> BusBuffer {
        let mut plane = DataPlane::new(
            DataKind::DmaBuf,
            64 * 64 * 4,
            Chunk {
                offset: 0,
                size: 64 * 64 * 4,
                stride: 256,
            },
        );
        // SAFETY: the file outlives every frame built from this buffer.
        unsafe { plane.set_fd(file.as_raw_fd()) };
        BusBuffer::new(id, vec![plane])
    }

    /// Drive a started stream to Streaming with a DMA-BUF capable format.
    fn stream_dmabuf(bus: &MockBus, stream: &Stream, id: StreamId, modifier: u64) {
        bus.push_format(id, bgrx(modifier));
        bus.push_state(id, BusStreamState::Connecting, BusStreamState::Paused);
        bus.push_state(id, BusStreamState::Paused, BusStreamState::Streaming);
        step(stream);
        assert_eq!(stream.state(), StreamState::Streaming);
    }

    #[test]
    fn start_connects_as_consumer_and_negotiates() {
        let bus = MockBus::new();
        bus.set_server_version("0.3.65");
        let (stream, recorder, id) = start(&bus, None);

        assert_eq!(stream.state(), StreamState::Negotiating);
        assert_eq!(stream.name().as_deref(), Some("pwsource-42"));
        assert!(stream.allow_dmabuf());
        bus.with_stream(id, |s| {
            assert_eq!(s.name, "pwsource-42");
            assert_eq!(s.target, Some(42));
            assert_eq!(s.flags, Some(ConnectFlags::CONSUMER));
        });

        let connect = &bus.params(id)[0];
        let offered = offers(connect);
        assert_eq!(offered.len(), connect.len());
        assert!(matches!(
            offered[0].modifier,
            ModifierProperty::Implicit(DRM_FORMAT_MOD_INVALID)
        ));
        assert!(offered[1].modifier.is_absent());
        assert_eq!(
            modifier_choices(connect, VideoFormat::Bgrx),
            vec![TILED, Y_TILED, DRM_FORMAT_MOD_INVALID]
        );
        assert!(recorder.seen().is_empty());
    }

    #[test]
    fn old_protocol_never_offers_late_fixation() {
        let (socket, _peer) = UnixStream::pair().unwrap();
        let bus = MockBus::new();
        bus.set_library_version(ProtocolVersion::new(0, 3, 20));
        bus.set_server_version("0.3.20");
        let (stream, _recorder, id) = start(&bus, Some(socket.as_fd()));

        assert_eq!(stream.node_id(), 42);
        assert!(!stream.allow_dmabuf());
        for offer in offers(&bus.params(id)[0]) {
            assert!(matches!(
                offer.modifier,
                ModifierProperty::Absent | ModifierProperty::Implicit(DRM_FORMAT_MOD_INVALID)
            ));
        }

        // Between the two minimums modifiers are enumerated but never late-fixated.
        let bus = MockBus::new();
        bus.set_server_version("0.3.30");
        let (_stream, _recorder, id) = start(&bus, None);
        let offered = offers(&bus.params(id)[0]);
        assert!(offered
            .iter()
            .any(|o| matches!(o.modifier, ModifierProperty::Enumerated { .. })));
        assert!(!offered.iter().any(|o| matches!(
            o.modifier,
            ModifierProperty::Enumerated {
                dont_fixate: true,
                ..
            }
        )));
    }

    #[test]
    fn streams_on_one_handle_share_a_connection() {
        let (socket, _peer) = UnixStream::pair().unwrap();
        let bus = MockBus::new();
        let (a, _, _) = start(&bus, Some(socket.as_fd()));
        let (b, _, _) = start(&bus, Some(socket.as_fd()));

        assert!(a.connection().unwrap().ptr_eq(&b.connection().unwrap()));
        assert_eq!(bus.sessions_opened(), 1);

        drop(a);
        assert_eq!(bus.sessions_dropped(), 0);
        drop(b);
        assert_eq!(bus.sessions_dropped(), 1);
    }

    #[test]
    fn fixed_format_sends_buffer_params_and_notifies() {
        let bus = MockBus::new();
        let (stream, recorder, id) = start(&bus, None);
        stream.set_damage_enabled(true);

        let mut format = bgrx(TILED);
        format.max_framerate = (60, 1);
        bus.push_format(id, format);
        step(&stream);
        assert_eq!(stream.state(), StreamState::ParamsFixed);
        assert_eq!(stream.size(), Size::new(64, 64));
        assert_eq!(stream.framerate(), (60, 1));

        let sent = bus.params(id);
        assert_eq!(sent.len(), 2);
        assert!(data_types(&sent[1]).contains(DataKind::DmaBuf));
        assert_eq!(sent[1].len(), 4, "buffers, header, cursor and damage");

        bus.push_state(id, BusStreamState::Connecting, BusStreamState::Paused);
        bus.push_state(id, BusStreamState::Paused, BusStreamState::Streaming);
        step(&stream);
        assert_eq!(stream.state(), StreamState::Streaming);
        assert_eq!(recorder.seen(), vec![Seen::Params, Seen::Ready, Seen::Start]);
    }

    #[test]
    fn format_without_modifier_excludes_dmabuf() {
        let bus = MockBus::new();
        let (stream, _recorder, id) = start(&bus, None);
        bus.push_format(id, NegotiatedFormat::new(VideoFormat::Rgba, Size::new(8, 8)));
        step(&stream);

        let sent = bus.params(id);
        let types = data_types(&sent[1]);
        assert!(!types.contains(DataKind::DmaBuf));
        assert!(types.contains(DataKind::MemFd));
        assert_eq!(sent[1].len(), 3);
        assert_eq!(stream.framerate(), (0, 1));
    }

    #[test]
    fn empty_buffer_keeps_metadata_and_is_requeued() {
        let bus = MockBus::new();
        let (stream, recorder, id) = start(&bus, None);
        bus.push_format(id, NegotiatedFormat::new(VideoFormat::Bgrx, Size::new(4, 4)));
        step(&stream);
        recorder.clear();

        let mut buffer = BusBuffer::new(
            5,
            vec![DataPlane::new(DataKind::MemFd, 64, Chunk::default())],
        );
        buffer.damage = Some(vec![Rect {
            x: 0,
            y: 0,
            width: 2,
            height: 2,
        }]);
        bus.push_buffer(id, buffer);
        step(&stream);

        assert_eq!(
            recorder.seen(),
            vec![Seen::Frame {
                payload: "none",
                damage: 1
            }]
        );
        assert_eq!(bus.returned_buffers(), vec![5]);
        assert_eq!(bus.checked_out(), 0);
        assert_eq!(bus.max_checked_out(), 1);
    }

    #[test]
    fn import_failure_drops_modifier_and_renegotiates() {
        let file = File::open("/dev/null").unwrap();
        let bus = MockBus::new();
        bus.set_server_version("0.3.48");
        let (stream, recorder, id) = start(&bus, None);
        stream_dmabuf(&bus, &stream, id, TILED);

        recorder.reject_dmabuf.set(true);
        bus.push_buffer(id, dmabuf_buffer(1, &file));
        step(&stream);
        assert_eq!(stream.state(), StreamState::Negotiating);
        assert_eq!(bus.returned_buffers(), vec![1]);

        // The renegotiation signal is delivered on the next step.
        let before = bus.params(id).len();
        step(&stream);
        let sent = bus.params(id);
        assert_eq!(sent.len(), before + 1);
        let choices = modifier_choices(sent.last().unwrap(), VideoFormat::Bgrx);
        assert!(!choices.contains(&TILED));
        assert!(choices.contains(&Y_TILED));
        assert!(stream.allow_dmabuf());

        // Exhaust the remaining candidates for the format.
        stream.renegotiate_modifier_failed(VideoFormat::Bgrx, Y_TILED);
        stream.renegotiate_modifier_failed(VideoFormat::Bgrx, DRM_FORMAT_MOD_INVALID);
        step(&stream);
        let last = bus.params(id).last().unwrap().clone();
        assert!(modifier_choices(&last, VideoFormat::Bgrx).is_empty());
        assert!(!modifier_choices(&last, VideoFormat::Bgra).is_empty());

        bus.push_format(id, bgrx(Y_TILED));
        step(&stream);
        assert_eq!(stream.state(), StreamState::ParamsFixed);
        assert!(!data_types(bus.params(id).last().unwrap()).contains(DataKind::DmaBuf));
    }

    #[test]
    fn old_server_disables_dmabuf_on_import_failure() {
        let file = File::open("/dev/null").unwrap();
        let bus = MockBus::new();
        bus.set_server_version("0.3.39");
        let (stream, recorder, id) = start(&bus, None);
        stream_dmabuf(&bus, &stream, id, TILED);

        recorder.reject_dmabuf.set(true);
        bus.push_buffer(id, dmabuf_buffer(1, &file));
        step(&stream);
        step(&stream);

        assert!(!stream.allow_dmabuf());
        let last = bus.params(id).last().unwrap().clone();
        assert!(offers(&last).iter().all(|o| o.modifier.is_absent()));

        bus.push_format(id, bgrx(Y_TILED));
        step(&stream);
        assert!(!data_types(bus.params(id).last().unwrap()).contains(DataKind::DmaBuf));
    }

    #[test]
    fn stop_cancels_pending_renegotiation_and_silences_handler() {
        let bus = MockBus::new();
        let (stream, recorder, id) = start(&bus, None);
        let conn = stream.connection().unwrap();
        stream_dmabuf(&bus, &stream, id, TILED);
        recorder.clear();

        stream.renegotiate_modifier_failed(VideoFormat::Bgrx, TILED);
        let sent = bus.params(id).len();
        stream.stop();

        assert_eq!(stream.state(), StreamState::Stopped);
        assert_eq!(bus.live_events(), 0);
        assert!(bus.with_stream(id, |s| s.destroyed));

        bus.push_state(id, BusStreamState::Streaming, BusStreamState::Unconnected);
        conn.iterate().unwrap();
        assert_eq!(bus.params(id).len(), sent);
        assert!(recorder.seen().is_empty());
        assert!(!conn.has_listeners());
    }

    #[test]
    fn remote_failure_stops_every_stream_on_the_connection() {
        let bus = MockBus::new();
        let (a, rec_a, _) = start(&bus, None);
        let (b, rec_b, _) = start(&bus, None);

        bus.core_error("connection reset");
        step(&a);

        for (stream, recorder) in [(&a, &rec_a), (&b, &rec_b)] {
            assert_eq!(stream.state(), StreamState::Stopped);
            assert_eq!(stream.error().as_deref(), Some("connection reset"));
            assert_eq!(
                recorder.seen(),
                vec![
                    Seen::Failed("connection reset".into()),
                    Seen::Stop(Some("connection reset".into()))
                ]
            );
        }

        // A fresh stream on the failed connection cannot start.
        let late = Stream::with_config(Arc::new(Config::default()), Recorder::default());
        let err = late.start(&bus, &FakeGpu::default(), 7, None).unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(late.state(), StreamState::Error);
    }

    #[test]
    fn bus_disconnect_and_error_are_terminal() {
        let bus = MockBus::new();
        let (stream, recorder, id) = start(&bus, None);
        bus.push_state(id, BusStreamState::Paused, BusStreamState::Unconnected);
        bus.push_format(id, bgrx(TILED));
        step(&stream);
        assert_eq!(stream.state(), StreamState::Stopped);
        assert_eq!(recorder.seen(), vec![Seen::Stop(None)]);

        let (stream, recorder, id) = start(&bus, None);
        bus.push_stream(
            id,
            StreamEvent::StateChanged {
                old: BusStreamState::Streaming,
                new: BusStreamState::Error,
                error: Some("node vanished".into()),
            },
        );
        step(&stream);
        assert_eq!(stream.state(), StreamState::Error);
        assert_eq!(stream.error().as_deref(), Some("node vanished"));
        assert_eq!(recorder.seen(), vec![Seen::Stop(Some("node vanished".into()))]);
    }

    #[test]
    fn rejected_connect_is_terminal_and_cleans_up() {
        let bus = MockBus::new();
        bus.reject_stream_connect("no such node");
        let stream = Stream::with_config(Arc::new(Config::default()), Recorder::default());

        let err = stream.start(&bus, &FakeGpu::default(), 99, None).unwrap_err();
        assert!(matches!(err, Error::StreamConnect { node_id: 99, .. }));
        assert_eq!(stream.state(), StreamState::Error);
        assert!(stream.error().unwrap().contains("no such node"));
        assert_eq!(bus.live_events(), 0);
        let id = bus.stream_ids()[0];
        assert!(bus.with_stream(id, |s| s.destroyed));

        bus.clear_failures();
        let again = stream.start(&bus, &FakeGpu::default(), 99, None).unwrap_err();
        assert!(matches!(again, Error::InvalidTransition { .. }));
    }

    #[test]
    fn connection_failure_is_reported_synchronously() {
        let bus = MockBus::new();
        bus.fail_connect("daemon not running");
        let stream = Stream::with_config(Arc::new(Config::default()), Recorder::default());

        let err = stream.start(&bus, &FakeGpu::default(), 1, None).unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(stream.state(), StreamState::Error);
        assert!(stream.connection().is_none());
    }

    #[test]
    fn set_active_requires_a_connection() {
        let bus = MockBus::new();
        let idle = Stream::with_config(Arc::new(Config::default()), Recorder::default());
        assert!(matches!(idle.set_active(true), Err(Error::NotConnected)));

        let (stream, _recorder, id) = start(&bus, None);
        stream.set_active(false).unwrap();
        assert_eq!(bus.with_stream(id, |s| s.active), Some(false));
    }

    #[cfg(feature = "tokio-driver")]
    #[tokio::test(flavor = "current_thread")]
    async fn async_driver_runs_until_last_stream_stops() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let bus = MockBus::new();
                let (stream, recorder, id) = start(&bus, None);
                let conn = stream.connection().unwrap();
                let driver = tokio::task::spawn_local(bus::driver::drive(conn));

                bus.push_state(id, BusStreamState::Connecting, BusStreamState::Paused);
                for _ in 0..100 {
                    if !recorder.seen().is_empty() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                assert_eq!(recorder.seen(), vec![Seen::Ready]);

                stream.stop();
                tokio::time::timeout(Duration::from_secs(2), driver)
                    .await
                    .unwrap()
                    .unwrap()
                    .unwrap();
                assert_eq!(bus.sessions_dropped(), 1);
            })
            .await;
    }

    #[cfg(feature = "tokio-driver")]
    #[tokio::test(flavor = "current_thread")]
    async fn dropping_last_stream_releases_driven_connection() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let bus = MockBus::new();
                let (a, _ra, _) = start(&bus, None);
                let (b, _rb, _) = start(&bus, None);
                let driver = tokio::task::spawn_local(bus::driver::drive(a.connection().unwrap()));
                tokio::task::yield_now().await;

                drop(a);
                tokio::task::yield_now().await;
                assert!(!driver.is_finished());
                assert_eq!(bus.sessions_dropped(), 0);

                drop(b);
                tokio::time::timeout(Duration::from_millis(500), driver)
                    .await
                    .unwrap()
                    .unwrap()
                    .unwrap();
                assert_eq!(bus.sessions_dropped(), 1);
            })
            .await;
    }
}
