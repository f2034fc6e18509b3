// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Pipeline wiring against a stub engine.
//!
//! The stub implements the full `mg_*` vtable surface in-process: graphs are
//! owned by the test and smuggled to the engine through the config blob, so
//! each test can fire the engine-side callbacks (packet delivery, frame
//! release) itself and assert on what crosses the boundary.

use std::collections::VecDeque;
use std::ffi::c_void;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use framebridge::ffi::{
    FenceOps, FrameReleaseCallback, GpuContextOps, GraphOps, MG_STATUS_OK, MgGpuContextRef,
    MgGraphRef, MgPacketRef, MgPollerRef, MgSyncTokenRef, PacketCallback, PacketOps, PollerOps,
};
use framebridge::{
    BridgeError, Engine, FramePool, Pipeline, PixelFormat, PoolConfig, Timestamp,
};

// ---------------------------------------------------------------------------
// Stub packets
// ---------------------------------------------------------------------------

struct StubPacket {
    timestamp_us: i64,
    payload: Vec<u8>,
    empty: bool,
    releases: AtomicUsize,
}

impl StubPacket {
    fn new(timestamp_us: i64, payload: &[u8]) -> Self {
        Self {
            timestamp_us,
            payload: payload.to_vec(),
            empty: false,
            releases: AtomicUsize::new(0),
        }
    }

    fn as_raw(&self) -> MgPacketRef {
        self as *const StubPacket as *mut c_void
    }
}

unsafe extern "C" fn packet_timestamp(packet: MgPacketRef) -> i64 {
    unsafe { &*(packet as *const StubPacket) }.timestamp_us
}

unsafe extern "C" fn packet_is_empty(packet: MgPacketRef) -> bool {
    unsafe { &*(packet as *const StubPacket) }.empty
}

unsafe extern "C" fn packet_payload(
    packet: MgPacketRef,
    data: *mut *const u8,
    len: *mut usize,
) -> i32 {
    let stub = unsafe { &*(packet as *const StubPacket) };
    unsafe {
        *data = stub.payload.as_ptr();
        *len = stub.payload.len();
    }
    MG_STATUS_OK
}

unsafe extern "C" fn packet_release(packet: *mut c_void) {
    unsafe { &*(packet as *const StubPacket) }
        .releases
        .fetch_add(1, Ordering::SeqCst);
}

const PACKET_OPS: PacketOps = PacketOps {
    timestamp_us: packet_timestamp,
    is_empty: packet_is_empty,
    payload: packet_payload,
    release: packet_release,
};

// ---------------------------------------------------------------------------
// Stub sync tokens
// ---------------------------------------------------------------------------

struct StubToken {
    waits: AtomicUsize,
    releases: AtomicUsize,
}

impl StubToken {
    fn new() -> Self {
        Self {
            waits: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    fn as_raw(&self) -> MgSyncTokenRef {
        self as *const StubToken as *mut c_void
    }
}

unsafe extern "C" fn token_wait(token: MgSyncTokenRef) -> i32 {
    unsafe { &*(token as *const StubToken) }
        .waits
        .fetch_add(1, Ordering::SeqCst);
    MG_STATUS_OK
}

unsafe extern "C" fn token_wait_on_gpu(_token: MgSyncTokenRef) -> i32 {
    MG_STATUS_OK
}

unsafe extern "C" fn token_is_ready(_token: MgSyncTokenRef) -> bool {
    true
}

unsafe extern "C" fn token_release(token: *mut c_void) {
    unsafe { &*(token as *const StubToken) }
        .releases
        .fetch_add(1, Ordering::SeqCst);
}

const FENCE_OPS: FenceOps = FenceOps {
    wait: token_wait,
    wait_on_gpu: token_wait_on_gpu,
    is_ready: token_is_ready,
    release: token_release,
};

// ---------------------------------------------------------------------------
// Stub graph
// ---------------------------------------------------------------------------

struct ObserverReg {
    stream_id: u64,
    callback: PacketCallback,
    user_data: *mut c_void,
}

struct FrameReg {
    name: u32,
    timestamp_us: i64,
    on_release: FrameReleaseCallback,
    user_data: *mut c_void,
}

#[derive(Default)]
struct StubGraph {
    started: AtomicBool,
    closed: AtomicBool,
    deleted: AtomicBool,
    observers: Mutex<Vec<ObserverReg>>,
    frames: Mutex<Vec<FrameReg>>,
    /// Packets a poller will hand out, oldest first.
    poller_queue: Mutex<VecDeque<MgPacketRef>>,
}

impl StubGraph {
    /// The graph handle travels to the stub engine through the config blob.
    fn config(&self) -> [u8; size_of::<usize>()] {
        (self as *const StubGraph as usize).to_ne_bytes()
    }

    /// Fire the engine-side packet callback for the first observer.
    fn deliver(&self, packet: &StubPacket) -> i32 {
        let observers = self.observers.lock().unwrap();
        let reg = observers.first().expect("no observer registered");
        unsafe { (reg.callback)(reg.stream_id, packet.as_raw(), reg.user_data) }
    }

    /// Fire the engine-side release callback for the most recent frame.
    fn release_last_frame(&self, token: MgSyncTokenRef) {
        let reg = self.frames.lock().unwrap().pop().expect("no frame submitted");
        unsafe { (reg.on_release)(reg.name, token, reg.user_data) };
    }
}

unsafe fn graph(ptr: MgGraphRef) -> &'static StubGraph {
    unsafe { &*(ptr as *const StubGraph) }
}

unsafe extern "C" fn graph_create(config: *const u8, len: usize, out: *mut MgGraphRef) -> i32 {
    assert_eq!(len, size_of::<usize>());
    let mut bytes = [0u8; size_of::<usize>()];
    unsafe {
        bytes.copy_from_slice(std::slice::from_raw_parts(config, len));
        *out = usize::from_ne_bytes(bytes) as *mut c_void;
    }
    MG_STATUS_OK
}

unsafe extern "C" fn graph_start(g: MgGraphRef) -> i32 {
    unsafe { graph(g) }.started.store(true, Ordering::SeqCst);
    MG_STATUS_OK
}

unsafe extern "C" fn graph_close(g: MgGraphRef) -> i32 {
    unsafe { graph(g) }.closed.store(true, Ordering::SeqCst);
    MG_STATUS_OK
}

unsafe extern "C" fn graph_add_gpu_frame(
    g: MgGraphRef,
    _stream: *const std::ffi::c_char,
    name: u32,
    _width: u32,
    _height: u32,
    _format: i32,
    timestamp_us: i64,
    on_release: FrameReleaseCallback,
    user_data: *mut c_void,
) -> i32 {
    unsafe { graph(g) }.frames.lock().unwrap().push(FrameReg {
        name,
        timestamp_us,
        on_release,
        user_data,
    });
    MG_STATUS_OK
}

unsafe extern "C" fn graph_add_cpu_frame(
    g: MgGraphRef,
    _stream: *const std::ffi::c_char,
    data: *const u8,
    len: usize,
    name: u32,
    width: u32,
    height: u32,
    _format: i32,
    timestamp_us: i64,
    on_release: FrameReleaseCallback,
    user_data: *mut c_void,
) -> i32 {
    assert!(!data.is_null());
    assert_eq!(len, width as usize * height as usize * 4);
    unsafe { graph(g) }.frames.lock().unwrap().push(FrameReg {
        name,
        timestamp_us,
        on_release,
        user_data,
    });
    MG_STATUS_OK
}

unsafe extern "C" fn graph_add_poller(
    g: MgGraphRef,
    _stream: *const std::ffi::c_char,
    out: *mut MgPollerRef,
) -> i32 {
    // The graph doubles as its own poller handle.
    unsafe { *out = g };
    MG_STATUS_OK
}

unsafe extern "C" fn graph_observe(
    g: MgGraphRef,
    _stream: *const std::ffi::c_char,
    stream_id: u64,
    callback: PacketCallback,
    user_data: *mut c_void,
) -> i32 {
    unsafe { graph(g) }.observers.lock().unwrap().push(ObserverReg {
        stream_id,
        callback,
        user_data,
    });
    MG_STATUS_OK
}

unsafe extern "C" fn graph_gpu_context(_g: MgGraphRef) -> MgGpuContextRef {
    std::ptr::null_mut()
}

unsafe extern "C" fn graph_delete(g: *mut c_void) {
    unsafe { graph(g) }.deleted.store(true, Ordering::SeqCst);
}

unsafe extern "C" fn poller_next(poller: MgPollerRef, packet_out: *mut MgPacketRef) -> bool {
    let next = unsafe { graph(poller) }.poller_queue.lock().unwrap().pop_front();
    match next {
        Some(packet) => {
            unsafe { *packet_out = packet };
            true
        }
        None => false,
    }
}

unsafe extern "C" fn poller_delete(_poller: *mut c_void) {}

unsafe extern "C" fn context_get(ctx: *mut c_void) -> *mut c_void {
    ctx
}

unsafe extern "C" fn context_delete(_ctx: *mut c_void) {}

const GRAPH_OPS: GraphOps = GraphOps {
    create: graph_create,
    start: graph_start,
    close: graph_close,
    add_gpu_frame: graph_add_gpu_frame,
    add_cpu_frame: graph_add_cpu_frame,
    add_poller: graph_add_poller,
    observe: graph_observe,
    gpu_context: graph_gpu_context,
    release: graph_delete,
};

const POLLER_OPS: PollerOps = PollerOps {
    next: poller_next,
    release: poller_delete,
};

const CONTEXT_OPS: GpuContextOps = GpuContextOps {
    get: context_get,
    release: context_delete,
};

fn stub_engine() -> std::sync::Arc<Engine> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Engine::from_vtables(GRAPH_OPS, PACKET_OPS, POLLER_OPS, FENCE_OPS, CONTEXT_OPS)
}

fn cpu_pool(capacity: usize) -> FramePool {
    FramePool::new(PoolConfig {
        capacity,
        width: 4,
        height: 4,
        format: PixelFormat::Rgba8,
    })
    .unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_observe_end_to_end() {
    let stub = StubGraph::default();
    let mut pipeline = Pipeline::new(stub_engine(), &stub.config()).unwrap();

    let observer = pipeline.observe_output::<Vec<u8>>("landmarks").unwrap();
    pipeline.start().unwrap();
    assert!(stub.started.load(Ordering::SeqCst));

    let packet = StubPacket::new(10, b"first");
    assert_eq!(stub.deliver(&packet), MG_STATUS_OK);
    // The trampoline copied the value out; the packet itself was only
    // borrowed for the callback.
    assert_eq!(packet.releases.load(Ordering::SeqCst), 0);

    let value = observer
        .wait_next(Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, b"first");

    // Out-of-order delivery from the engine thread is dropped.
    let stale = StubPacket::new(5, b"stale");
    stub.deliver(&stale);
    assert_eq!(
        observer.wait_next(Duration::from_millis(20)).await.unwrap(),
        None
    );

    pipeline.close().unwrap();
    assert!(stub.closed.load(Ordering::SeqCst));
    assert!(matches!(
        observer.wait_next(Duration::from_millis(20)).await,
        Err(BridgeError::StreamClosed)
    ));
}

#[tokio::test]
async fn test_mixing_modes_on_one_stream_is_rejected() {
    let stub = StubGraph::default();
    let pipeline = Pipeline::new(stub_engine(), &stub.config()).unwrap();

    let _observer = pipeline.observe_output::<Vec<u8>>("out").unwrap();
    assert!(matches!(
        pipeline.poll_output::<Vec<u8>>("out"),
        Err(BridgeError::InvalidConfiguration(_))
    ));

    // And the other way around on a fresh stream.
    let _poller = pipeline.poll_output::<Vec<u8>>("other").unwrap();
    assert!(matches!(
        pipeline.observe_output::<Vec<u8>>("other"),
        Err(BridgeError::InvalidConfiguration(_))
    ));
}

#[tokio::test]
async fn test_registration_after_start_is_rejected() {
    let stub = StubGraph::default();
    let pipeline = Pipeline::new(stub_engine(), &stub.config()).unwrap();
    pipeline.start().unwrap();

    assert!(pipeline.observe_output::<Vec<u8>>("late").is_err());
    assert!(pipeline.poll_output::<Vec<u8>>("late").is_err());
}

#[test]
fn test_polling_pulls_until_stream_closes() {
    let stub = StubGraph::default();
    let pipeline = Pipeline::new(stub_engine(), &stub.config()).unwrap();

    let first = Box::leak(Box::new(StubPacket::new(1, b"a")));
    let second = Box::leak(Box::new(StubPacket::new(2, b"b")));
    stub.poller_queue
        .lock()
        .unwrap()
        .extend([first.as_raw(), second.as_raw()]);

    let mut poller = pipeline.poll_output::<Vec<u8>>("out").unwrap();
    pipeline.start().unwrap();

    assert_eq!(poller.next().unwrap().unwrap(), b"a");
    assert_eq!(poller.next().unwrap().unwrap(), b"b");
    // Queue exhausted: the stream closed without further data.
    assert_eq!(poller.next().unwrap(), None);

    // The poller owned each packet it pulled and released it exactly once.
    assert_eq!(first.releases.load(Ordering::SeqCst), 1);
    assert_eq!(second.releases.load(Ordering::SeqCst), 1);
}

#[test]
fn test_send_frame_release_roundtrip() {
    let stub = StubGraph::default();
    let pipeline = Pipeline::new(stub_engine(), &stub.config()).unwrap();
    let pool = cpu_pool(2);
    pipeline.start().unwrap();

    let frame = pool.request_frame().unwrap();
    let name = frame.native_name().unwrap();
    pipeline
        .send_frame("input", frame, Timestamp(1000))
        .unwrap();

    {
        let frames = stub.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].name, name);
        assert_eq!(frames[0].timestamp_us, 1000);
    }
    assert_eq!(pool.stats().in_use, 1);

    // Engine finishes with the frame, no fence attached.
    stub.release_last_frame(std::ptr::null_mut());
    let stats = pool.stats();
    assert_eq!((stats.available, stats.in_use), (1, 0));
}

#[test]
fn test_release_fence_is_inherited_by_next_acquirer() {
    let stub = StubGraph::default();
    let pipeline = Pipeline::new(stub_engine(), &stub.config()).unwrap();
    let pool = cpu_pool(1);
    pipeline.start().unwrap();

    let frame = pool.request_frame().unwrap();
    let id = frame.id();
    pipeline.send_frame("input", frame, Timestamp(1)).unwrap();

    let token = StubToken::new();
    stub.release_last_frame(token.as_raw());
    // The release path stored the fence without waiting on it.
    assert_eq!(token.waits.load(Ordering::SeqCst), 0);

    let reused = pool.request_frame().unwrap();
    assert_eq!(reused.id(), id);
    assert_eq!(token.waits.load(Ordering::SeqCst), 1);
    assert_eq!(token.releases.load(Ordering::SeqCst), 1);
}

#[test]
fn test_gpu_context_absent_on_cpu_graph() {
    let stub = StubGraph::default();
    let pipeline = Pipeline::new(stub_engine(), &stub.config()).unwrap();
    assert!(pipeline.gpu_context().unwrap().is_none());
}

#[test]
fn test_drop_without_close_tears_down_graph() {
    let stub = StubGraph::default();
    {
        let pipeline = Pipeline::new(stub_engine(), &stub.config()).unwrap();
        pipeline.start().unwrap();
    }
    assert!(stub.closed.load(Ordering::SeqCst));
    assert!(stub.deleted.load(Ordering::SeqCst));
}
