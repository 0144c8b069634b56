//! [`BusTransport`] backed by the PipeWire client library.
//!
//! One [`PipeWireSession`] owns a main loop, its context and the core
//! connection. Listener callbacks only record [`BusEvent`]s; they are handed
//! to the engine from [`BusSession::iterate`], never dispatched re-entrantly.
//!
//! The descriptor returned by [`BusSession::loop_fd`] is an epoll set holding
//! the PipeWire loop descriptor and an internal wake socket, so events raised
//! outside a loop iteration (synchronous state changes, loop-local signals)
//! still make the loop look ready.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::CStr;
use std::io::{Cursor, ErrorKind, Read, Write};
use std::mem::size_of;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use ::pipewire as pw;
use pw::spa;
use spa::param::format::{FormatProperties, MediaSubtype, MediaType};
use spa::param::ParamType;
use spa::pod::deserialize::PodDeserializer;
use spa::pod::serialize::PodSerializer;
use spa::pod::{ChoiceValue, Object, Pod, Property, PropertyFlags, Value};
use spa::utils::{Choice, ChoiceEnum, ChoiceFlags, Fraction, Id, Rectangle, SpaTypes};
use tracing::{debug, info, trace, warn};

use crate::capture::format::VideoFormat;
use crate::capture::frame::{Point, Rect};
use crate::error::BusError;

use super::{
    BufferParams, BusBuffer, BusEvent, BusSession, BusStreamState, BusTransport, Chunk,
    ConnectFlags, DataKind, DataPlane, EventId, FormatOffer, IntRange, MetaBitmap, MetaCursor,
    MetaHeader, MetaKind, MetaParam, ModifierProperty, NegotiatedFormat, Param, ProtocolVersion,
    Size, StreamEvent, StreamId,
};

const LOOP_TOKEN: u64 = 0;
const WAKE_TOKEN: u64 = 1;

/// Entry point for PipeWire. Cheap to construct; each session gets its own loop.
#[derive(Debug, Default)]
pub struct PipeWireBus;

impl PipeWireBus {
    pub fn new() -> Self {
        pw::init();
        Self
    }
}

impl BusTransport for PipeWireBus {
    fn library_version(&self) -> ProtocolVersion {
        // SAFETY: returns a pointer to a static NUL-terminated string.
        let raw = unsafe { CStr::from_ptr(pw::sys::pw_get_library_version()) };
        match raw.to_str().map(str::parse) {
            Ok(Ok(version)) => version,
            _ => {
                warn!("Unparseable PipeWire library version {:?}", raw);
                ProtocolVersion::new(0, 0, 0)
            }
        }
    }

    fn create_loop(&self) -> Result<Box<dyn BusSession>, BusError> {
        let main_loop = pw::main_loop::MainLoop::new(None).map_err(loop_error)?;
        let (wake_rx, wake_tx) = UnixStream::pair().map_err(loop_error)?;
        wake_rx.set_nonblocking(true).map_err(loop_error)?;
        wake_tx.set_nonblocking(true).map_err(loop_error)?;

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(loop_error)?;
        epoll
            .add(main_loop.loop_().fd(), EpollEvent::new(EpollFlags::EPOLLIN, LOOP_TOKEN))
            .map_err(loop_error)?;
        epoll
            .add(&wake_rx, EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN))
            .map_err(loop_error)?;

        Ok(Box::new(PipeWireSession {
            streams: HashMap::new(),
            checked_out: HashMap::new(),
            core_listener: None,
            core: None,
            context: None,
            main_loop,
            epoll,
            wake_rx,
            outbox: Outbox {
                events: Rc::new(RefCell::new(VecDeque::new())),
                waker: Rc::new(wake_tx),
            },
            events: HashSet::new(),
            next_stream: 0,
            next_event: 0,
            next_buffer: 0,
        }))
    }
}

fn loop_error(e: impl std::fmt::Display) -> BusError {
    BusError::Loop(e.to_string())
}

/// Events raised by listener callbacks, waiting for the next iterate step.
#[derive(Clone)]
struct Outbox {
    events: Rc<RefCell<VecDeque<BusEvent>>>,
    waker: Rc<UnixStream>,
}

impl Outbox {
    fn push(&self, event: BusEvent) {
        self.events.borrow_mut().push_back(event);
        // A full socket already signals readiness.
        let _ = (&*self.waker).write(&[1]);
    }
}

struct StreamSlot {
    _listener: pw::stream::StreamListener<()>,
    stream: pw::stream::Stream,
}

/// Field order is teardown order: streams, core, context, then the loop.
pub struct PipeWireSession {
    streams: HashMap<StreamId, StreamSlot>,
    checked_out: HashMap<u32, (StreamId, *mut pw::sys::pw_buffer)>,
    core_listener: Option<pw::core::Listener>,
    core: Option<pw::core::Core>,
    context: Option<pw::context::Context>,
    main_loop: pw::main_loop::MainLoop,
    epoll: Epoll,
    wake_rx: UnixStream,
    outbox: Outbox,
    events: HashSet<EventId>,
    next_stream: u32,
    next_event: u32,
    next_buffer: u32,
}

impl PipeWireSession {
    fn drain_wake(&mut self) -> Result<(), BusError> {
        let mut scratch = [0u8; 64];
        loop {
            match self.wake_rx.read(&mut scratch) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(loop_error(e)),
            }
        }
    }

    fn stream(&self, id: StreamId) -> Result<&pw::stream::Stream, BusError> {
        self.streams
            .get(&id)
            .map(|slot| &slot.stream)
            .ok_or(BusError::UnknownStream(id.0))
    }

    fn listen(
        &self,
        id: StreamId,
        stream: &pw::stream::Stream,
    ) -> Result<pw::stream::StreamListener<()>, BusError> {
        let on_state = self.outbox.clone();
        let on_param = self.outbox.clone();
        let on_process = self.outbox.clone();

        stream
            .add_local_listener_with_user_data(())
            .state_changed(move |_, _, old, new| {
                let (old, _) = bus_state(old);
                let (new, error) = bus_state(new);
                let event = StreamEvent::StateChanged { old, new, error };
                on_state.push(BusEvent::Stream { id, event });
            })
            .param_changed(move |_, _, param_id, param| {
                if param_id != ParamType::Format.as_raw() {
                    return;
                }
                let format = match param {
                    None => None,
                    Some(pod) => match negotiated_format(pod) {
                        Some(format) => Some(format),
                        None => {
                            warn!("Ignoring unparseable format for stream {}", id.0);
                            return;
                        }
                    },
                };
                let event = StreamEvent::FormatChanged(format);
                on_param.push(BusEvent::Stream { id, event });
            })
            .process(move |_, _| {
                on_process.push(BusEvent::Stream {
                    id,
                    event: StreamEvent::Process,
                });
            })
            .register()
            .map_err(|e| BusError::Rejected(e.to_string()))
    }
}

impl BusSession for PipeWireSession {
    fn loop_fd(&self) -> BorrowedFd<'_> {
        self.epoll.0.as_fd()
    }

    fn enter(&mut self) {
        // SAFETY: paired with `leave` by the owning connection.
        unsafe { self.main_loop.loop_().enter() };
    }

    fn leave(&mut self) {
        // SAFETY: only called after `enter`.
        unsafe { self.main_loop.loop_().leave() };
    }

    fn create_context(&mut self) -> Result<(), BusError> {
        let context = pw::context::Context::new(&self.main_loop).map_err(|e| {
            debug!("pw_context_new failed: {}", e);
            BusError::Context
        })?;
        self.context = Some(context);
        Ok(())
    }

    fn connect(&mut self, socket: Option<OwnedFd>) -> Result<(), BusError> {
        let context = self.context.as_ref().ok_or(BusError::Context)?;
        let core = match socket {
            Some(fd) => context.connect_fd(fd, None),
            None => context.connect(None),
        }
        .map_err(|e| BusError::Connect(e.to_string()))?;

        let on_info = self.outbox.clone();
        let on_error = self.outbox.clone();
        let listener = core
            .add_listener_local()
            .info(move |info| {
                on_info.push(BusEvent::CoreInfo {
                    version: info.version().to_owned(),
                });
            })
            .error(move |id, seq, res, message| {
                on_error.push(BusEvent::CoreError {
                    id,
                    seq,
                    res,
                    message: message.to_owned(),
                });
            })
            .register();

        self.core_listener = Some(listener);
        self.core = Some(core);
        info!("PipeWire core connected");
        Ok(())
    }

    fn disconnect(&mut self) {
        self.streams.clear();
        self.core_listener = None;
        self.core = None;
    }

    fn iterate(&mut self) -> Result<Vec<BusEvent>, BusError> {
        self.drain_wake()?;
        let res = self.main_loop.loop_().iterate(Duration::ZERO);
        if res < 0 {
            return Err(BusError::Loop(format!("loop iterate returned {}", res)));
        }
        let events: Vec<_> = self.outbox.events.borrow_mut().drain(..).collect();
        trace!("PipeWire loop produced {} events", events.len());
        Ok(events)
    }

    fn create_stream(&mut self, name: &str) -> Result<StreamId, BusError> {
        let core = self
            .core
            .as_ref()
            .ok_or_else(|| BusError::Connect("core is not connected".into()))?;
        let props = pw::properties::properties! {
            *pw::keys::MEDIA_TYPE => "Video",
            *pw::keys::MEDIA_CATEGORY => "Capture",
            *pw::keys::MEDIA_ROLE => "Screen",
        };
        let stream = pw::stream::Stream::new(core, name, props)
            .map_err(|e| BusError::Rejected(e.to_string()))?;

        self.next_stream += 1;
        let id = StreamId(self.next_stream);
        let listener = self.listen(id, &stream)?;
        self.streams.insert(
            id,
            StreamSlot {
                _listener: listener,
                stream,
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
        let mut stream_flags = pw::stream::StreamFlags::empty();
        if flags.autoconnect {
            stream_flags |= pw::stream::StreamFlags::AUTOCONNECT;
        }
        if flags.dont_reconnect {
            stream_flags |= pw::stream::StreamFlags::DONT_RECONNECT;
        }

        let encoded = encode_params(params)?;
        let mut pods = pod_refs(&encoded)?;
        self.stream(id)?
            .connect(spa::utils::Direction::Input, Some(target), stream_flags, &mut pods)
            .map_err(|e| BusError::Rejected(e.to_string()))
    }

    fn update_params(&mut self, id: StreamId, params: &[Param]) -> Result<(), BusError> {
        let encoded = encode_params(params)?;
        let mut pods = pod_refs(&encoded)?;
        self.stream(id)?
            .update_params(&mut pods)
            .map_err(|e| BusError::Rejected(e.to_string()))
    }

    fn set_active(&mut self, id: StreamId, active: bool) -> Result<(), BusError> {
        self.stream(id)?
            .set_active(active)
            .map_err(|e| BusError::Rejected(e.to_string()))
    }

    fn destroy_stream(&mut self, id: StreamId) {
        let stale: Vec<u32> = self
            .checked_out
            .iter()
            .filter(|(_, (owner, _))| *owner == id)
            .map(|(buffer, _)| *buffer)
            .collect();
        for buffer in stale {
            self.checked_out.remove(&buffer);
        }
        if self.streams.remove(&id).is_some() {
            debug!("Destroyed PipeWire stream {}", id.0);
        }
        self.outbox
            .events
            .borrow_mut()
            .retain(|e| !matches!(e, BusEvent::Stream { id: owner, .. } if *owner == id));
    }

    fn dequeue_buffer(&mut self, id: StreamId) -> Option<BusBuffer> {
        let stream = self.stream(id).ok()?;
        // SAFETY: the stream is alive; the buffer is returned through
        // `queue_buffer` or reclaimed when the stream is destroyed.
        let raw = unsafe { stream.dequeue_raw_buffer() };
        if raw.is_null() {
            return None;
        }

        self.next_buffer = self.next_buffer.wrapping_add(1);
        let buffer_id = self.next_buffer;
        self.checked_out.insert(buffer_id, (id, raw));
        // SAFETY: `raw` was just dequeued and stays valid until requeued.
        Some(unsafe { read_buffer(buffer_id, (*raw).buffer) })
    }

    fn queue_buffer(&mut self, id: StreamId, buffer: BusBuffer) {
        let Some((owner, raw)) = self.checked_out.remove(&buffer.id) else {
            warn!("Queueing unknown buffer {}", buffer.id);
            return;
        };
        if owner != id {
            warn!("Buffer {} belongs to stream {}, not {}", buffer.id, owner.0, id.0);
        }
        drop(buffer);
        if let Some(slot) = self.streams.get(&owner) {
            // SAFETY: `raw` came from this stream's dequeue and was not queued yet.
            unsafe { slot.stream.queue_raw_buffer(raw) };
        }
    }

    fn add_event(&mut self) -> Result<EventId, BusError> {
        self.next_event += 1;
        let event = EventId(self.next_event);
        self.events.insert(event);
        Ok(event)
    }

    fn signal_event(&mut self, event: EventId) {
        if self.events.contains(&event) {
            self.outbox.push(BusEvent::Signalled(event));
        }
    }

    fn destroy_event(&mut self, event: EventId) {
        self.events.remove(&event);
        self.outbox
            .events
            .borrow_mut()
            .retain(|e| !matches!(e, BusEvent::Signalled(id) if *id == event));
    }
}

fn bus_state(state: pw::stream::StreamState) -> (BusStreamState, Option<String>) {
    match state {
        pw::stream::StreamState::Error(message) => (BusStreamState::Error, Some(message)),
        pw::stream::StreamState::Unconnected => (BusStreamState::Unconnected, None),
        pw::stream::StreamState::Connecting => (BusStreamState::Connecting, None),
        pw::stream::StreamState::Paused => (BusStreamState::Paused, None),
        pw::stream::StreamState::Streaming => (BusStreamState::Streaming, None),
    }
}

// Param encoding

fn property(key: u32, value: Value) -> Property {
    Property {
        key,
        flags: PropertyFlags::empty(),
        value,
    }
}

fn int(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn int_value(range: IntRange) -> Value {
    if range.min == range.max {
        return Value::Int(int(range.default));
    }
    Value::Choice(ChoiceValue::Int(Choice(
        ChoiceFlags::empty(),
        ChoiceEnum::Range {
            default: int(range.default),
            min: int(range.min),
            max: int(range.max),
        },
    )))
}

fn rectangle(size: Size) -> Rectangle {
    Rectangle {
        width: size.width,
        height: size.height,
    }
}

fn format_object(offer: &FormatOffer) -> Object {
    let mut properties = vec![
        property(
            FormatProperties::MediaType.as_raw(),
            Value::Id(Id(MediaType::Video.as_raw())),
        ),
        property(
            FormatProperties::MediaSubtype.as_raw(),
            Value::Id(Id(MediaSubtype::Raw.as_raw())),
        ),
        property(
            FormatProperties::VideoFormat.as_raw(),
            Value::Id(Id(offer.format.id())),
        ),
        property(
            FormatProperties::VideoSize.as_raw(),
            Value::Choice(ChoiceValue::Rectangle(Choice(
                ChoiceFlags::empty(),
                ChoiceEnum::Range {
                    default: rectangle(offer.min_size),
                    min: rectangle(offer.min_size),
                    max: rectangle(offer.max_size),
                },
            ))),
        ),
    ];

    let modifier_key = FormatProperties::VideoModifier.as_raw();
    match &offer.modifier {
        ModifierProperty::Absent => {}
        ModifierProperty::Implicit(modifier) => properties.push(Property {
            key: modifier_key,
            flags: PropertyFlags::MANDATORY,
            value: Value::Long(*modifier as i64),
        }),
        ModifierProperty::Enumerated {
            choices,
            dont_fixate,
        } => {
            if let Some(preferred) = choices.first() {
                let mut flags = PropertyFlags::MANDATORY;
                if *dont_fixate {
                    flags |= PropertyFlags::DONT_FIXATE;
                }
                properties.push(Property {
                    key: modifier_key,
                    flags,
                    value: Value::Choice(ChoiceValue::Long(Choice(
                        ChoiceFlags::empty(),
                        ChoiceEnum::Enum {
                            default: *preferred as i64,
                            alternatives: choices.iter().map(|m| *m as i64).collect(),
                        },
                    ))),
                });
            }
        }
    }

    Object {
        type_: SpaTypes::ObjectParamFormat.as_raw(),
        id: ParamType::EnumFormat.as_raw(),
        properties,
    }
}

fn buffers_object(params: &BufferParams) -> Object {
    Object {
        type_: SpaTypes::ObjectParamBuffers.as_raw(),
        id: ParamType::Buffers.as_raw(),
        properties: vec![
            property(spa::sys::SPA_PARAM_BUFFERS_buffers, int_value(params.buffers)),
            property(spa::sys::SPA_PARAM_BUFFERS_align, Value::Int(int(params.align))),
            property(
                spa::sys::SPA_PARAM_BUFFERS_dataType,
                Value::Choice(ChoiceValue::Int(Choice(
                    ChoiceFlags::empty(),
                    ChoiceEnum::Flags {
                        default: int(params.data_types.0),
                        flags: Vec::new(),
                    },
                ))),
            ),
        ],
    }
}

fn meta_type(kind: MetaKind) -> u32 {
    match kind {
        MetaKind::Header => spa::sys::SPA_META_Header,
        MetaKind::Cursor => spa::sys::SPA_META_Cursor,
        MetaKind::VideoDamage => spa::sys::SPA_META_VideoDamage,
    }
}

fn meta_object(meta: &MetaParam) -> Object {
    Object {
        type_: SpaTypes::ObjectParamMeta.as_raw(),
        id: ParamType::Meta.as_raw(),
        properties: vec![
            property(spa::sys::SPA_PARAM_META_type, Value::Id(Id(meta_type(meta.kind)))),
            property(spa::sys::SPA_PARAM_META_size, int_value(meta.size)),
        ],
    }
}

fn param_object(param: &Param) -> Object {
    match param {
        Param::EnumFormat(offer) => format_object(offer),
        Param::Buffers(buffers) => buffers_object(buffers),
        Param::Meta(meta) => meta_object(meta),
    }
}

/// Serialize every param into its own pod.
fn encode_params(params: &[Param]) -> Result<Vec<Vec<u8>>, BusError> {
    params
        .iter()
        .map(|param| {
            let value = Value::Object(param_object(param));
            PodSerializer::serialize(Cursor::new(Vec::new()), &value)
                .map(|(cursor, _)| cursor.into_inner())
                .map_err(|e| BusError::Rejected(format!("failed to encode {param:?}: {e:?}")))
        })
        .collect()
}

fn pod_refs(encoded: &[Vec<u8>]) -> Result<Vec<&Pod>, BusError> {
    encoded
        .iter()
        .map(|bytes| {
            Pod::from_bytes(bytes).ok_or_else(|| BusError::Rejected("malformed pod".into()))
        })
        .collect()
}

// Format decoding

/// Fixed value of a property, or the default of a choice.
macro_rules! fixed_value {
    ($value:expr, $plain:ident, $choice:ident) => {
        match $value {
            Value::$plain(v) => Some(*v),
            Value::Choice(ChoiceValue::$choice(Choice(_, choice))) => Some(match choice {
                ChoiceEnum::None(v) => *v,
                ChoiceEnum::Range { default, .. }
                | ChoiceEnum::Step { default, .. }
                | ChoiceEnum::Enum { default, .. }
                | ChoiceEnum::Flags { default, .. } => *default,
            }),
            _ => None,
        }
    };
}

fn fraction(value: &Value) -> Option<(u32, u32)> {
    fixed_value!(value, Fraction, Fraction).map(|f: Fraction| (f.num, f.denom))
}

/// Parse the format the bus settled on. `None` for anything but raw video.
fn negotiated_format(pod: &Pod) -> Option<NegotiatedFormat> {
    let (_, value) = PodDeserializer::deserialize_any_from(pod.as_bytes()).ok()?;
    let Value::Object(object) = value else {
        return None;
    };

    let mut format = None;
    let mut size = None;
    let mut modifier = None;
    let mut framerate = None;
    let mut max_framerate = None;
    for prop in &object.properties {
        let value = &prop.value;
        match prop.key {
            k if k == FormatProperties::MediaType.as_raw() => {
                let id: Id = fixed_value!(value, Id, Id)?;
                if id.0 != MediaType::Video.as_raw() {
                    return None;
                }
            }
            k if k == FormatProperties::MediaSubtype.as_raw() => {
                let id: Id = fixed_value!(value, Id, Id)?;
                if id.0 != MediaSubtype::Raw.as_raw() {
                    return None;
                }
            }
            k if k == FormatProperties::VideoFormat.as_raw() => {
                format = fixed_value!(value, Id, Id).map(|id: Id| VideoFormat::from_id(id.0));
            }
            k if k == FormatProperties::VideoSize.as_raw() => {
                size = fixed_value!(value, Rectangle, Rectangle)
                    .map(|r: Rectangle| Size::new(r.width, r.height));
            }
            k if k == FormatProperties::VideoModifier.as_raw() => {
                modifier = fixed_value!(value, Long, Long).map(|m: i64| m as u64);
            }
            k if k == FormatProperties::VideoFramerate.as_raw() => framerate = fraction(value),
            k if k == FormatProperties::VideoMaxFramerate.as_raw() => {
                max_framerate = fraction(value)
            }
            _ => {}
        }
    }

    let mut negotiated = NegotiatedFormat::new(format?, size?);
    negotiated.modifier = modifier;
    if let Some(rate) = framerate {
        negotiated.framerate = rate;
    }
    if let Some(rate) = max_framerate {
        negotiated.max_framerate = rate;
    }
    Some(negotiated)
}

// Buffer decoding

fn data_kind(raw: u32) -> DataKind {
    match raw {
        spa::sys::SPA_DATA_MemPtr => DataKind::MemPtr,
        spa::sys::SPA_DATA_MemFd => DataKind::MemFd,
        spa::sys::SPA_DATA_DmaBuf => DataKind::DmaBuf,
        spa::sys::SPA_DATA_Invalid => DataKind::Invalid,
        other => DataKind::Other(other),
    }
}

/// # Safety
///
/// `ptr` must be null or point to `len` valid, initialized elements.
unsafe fn raw_slice<'a, T>(ptr: *const T, len: u32) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, len as usize)
    }
}

/// # Safety
///
/// `data` must belong to a buffer that stays checked out while the returned
/// plane is in use.
unsafe fn read_plane(data: &spa::sys::spa_data) -> DataPlane {
    let chunk = data
        .chunk
        .as_ref()
        .map(|c| Chunk {
            offset: c.offset,
            size: c.size,
            stride: c.stride,
        })
        .unwrap_or_default();

    let mut plane = DataPlane::new(data_kind(data.type_), data.maxsize, chunk);
    plane.map_offset = data.mapoffset;
    if let Ok(fd) = RawFd::try_from(data.fd) {
        plane.set_fd(fd);
    }
    if !data.data.is_null() {
        plane.set_data(data.data.cast::<u8>(), data.maxsize as usize);
    }
    plane
}

/// # Safety
///
/// `meta` must describe a valid meta area of a checked-out buffer.
unsafe fn read_damage(meta: &spa::sys::spa_meta) -> Vec<Rect> {
    let count = meta.size as usize / size_of::<spa::sys::spa_meta_region>();
    let regions = raw_slice(
        meta.data.cast::<spa::sys::spa_meta_region>().cast_const(),
        u32::try_from(count).unwrap_or(0),
    );
    regions
        .iter()
        .map(|r| Rect {
            x: r.region.position.x,
            y: r.region.position.y,
            width: r.region.size.width,
            height: r.region.size.height,
        })
        .take_while(|rect| !rect.is_empty())
        .collect()
}

/// # Safety
///
/// `meta` must describe a valid meta area of a checked-out buffer.
unsafe fn read_cursor(meta: &spa::sys::spa_meta) -> Option<MetaCursor> {
    let area = meta.size as usize;
    if meta.data.is_null() || area < size_of::<spa::sys::spa_meta_cursor>() {
        return None;
    }
    let base = meta.data.cast::<u8>().cast_const();
    let cursor = &*base.cast::<spa::sys::spa_meta_cursor>();

    let offset = cursor.bitmap_offset as usize;
    let bitmap = if offset >= size_of::<spa::sys::spa_meta_cursor>()
        && offset + size_of::<spa::sys::spa_meta_bitmap>() <= area
    {
        let bitmap = &*base.add(offset).cast::<spa::sys::spa_meta_bitmap>();
        let start = offset + bitmap.offset as usize;
        let len = usize::try_from(bitmap.stride)
            .ok()
            .and_then(|stride| stride.checked_mul(bitmap.size.height as usize));
        let fits = |len: usize| start.checked_add(len).is_some_and(|end| end <= area);
        match len {
            Some(len) if bitmap.offset > 0 && fits(len) => {
                let pixels = std::slice::from_raw_parts(base.add(start), len);
                Some(MetaBitmap {
                    format: VideoFormat::from_id(bitmap.format),
                    width: bitmap.size.width,
                    height: bitmap.size.height,
                    stride: bitmap.stride,
                    data: Bytes::copy_from_slice(pixels),
                })
            }
            _ => None,
        }
    } else {
        None
    };

    Some(MetaCursor {
        id: cursor.id,
        position: Point {
            x: cursor.position.x,
            y: cursor.position.y,
        },
        hotspot: Point {
            x: cursor.hotspot.x,
            y: cursor.hotspot.y,
        },
        bitmap,
    })
}

/// Snapshot a dequeued SPA buffer. Planes borrow its memory.
///
/// # Safety
///
/// `raw` must point to a buffer that stays checked out until the returned
/// [`BusBuffer`] is queued back.
unsafe fn read_buffer(id: u32, raw: *const spa::sys::spa_buffer) -> BusBuffer {
    let Some(spa_buffer) = raw.as_ref() else {
        return BusBuffer::new(id, Vec::new());
    };

    let datas = raw_slice(spa_buffer.datas.cast_const(), spa_buffer.n_datas);
    let mut buffer = BusBuffer::new(id, datas.iter().map(|d| read_plane(d)).collect());

    for meta in raw_slice(spa_buffer.metas.cast_const(), spa_buffer.n_metas) {
        if meta.data.is_null() {
            continue;
        }
        match meta.type_ {
            spa::sys::SPA_META_Header
                if meta.size as usize >= size_of::<spa::sys::spa_meta_header>() =>
            {
                let header = &*meta.data.cast::<spa::sys::spa_meta_header>();
                buffer.header = Some(MetaHeader {
                    flags: header.flags,
                    pts: header.pts,
                    dts_offset: header.dts_offset,
                    seq: header.seq,
                });
            }
            spa::sys::SPA_META_VideoDamage => buffer.damage = Some(read_damage(meta)),
            spa::sys::SPA_META_Cursor => buffer.cursor = read_cursor(meta),
            _ => {}
        }
    }
    buffer
}
