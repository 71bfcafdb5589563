use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use hostpipe_pipe::{
    HwPipe, PipeContext, SendOutcome, SendResult, Service, ServicePipe, transfer,
};
use hostpipe_types::stream::{SnapshotReader, SnapshotWriter};
use hostpipe_types::{
    CloseReason, OpenFlags, PIPE_ERROR_INVAL, PIPE_ERROR_IO, PipeId, PollFlags, TransferResult,
    WakeFlags,
};
use hostpipe_vm_lock::{HostVmLock, VmLock};
use parking_lot::Mutex;

use crate::PipeManager;

#[derive(Default)]
struct RecordingHw {
    id: Mutex<Option<PipeId>>,
    wakes: Mutex<Vec<WakeFlags>>,
    closed: AtomicUsize,
    rebinds: AtomicUsize,
}

impl HwPipe for RecordingHw {
    fn close_from_host(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn signal_wake(&self, flags: WakeFlags) {
        self.wakes.lock().push(flags);
    }

    fn id(&self) -> PipeId {
        (*self.id.lock()).unwrap_or(PipeId::new(0))
    }

    fn rebind_notify(&self) {
        self.rebinds.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    manager: Arc<PipeManager>,
    lock: Arc<HostVmLock>,
}

impl Fixture {
    /// Builds a manager whose device thread is the test thread: the VM lock
    /// is taken once here and held for the whole test.
    fn new() -> Self {
        let manager = PipeManager::new();
        let lock = Arc::new(HostVmLock::new());
        lock.lock();
        manager
            .init_threading(Arc::clone(&lock) as Arc<dyn VmLock>)
            .unwrap();
        Fixture { manager, lock }
    }

    fn open(&self) -> (PipeId, Arc<RecordingHw>) {
        self.open_with_flags(OpenFlags::empty())
    }

    fn open_with_flags(&self, flags: OpenFlags) -> (PipeId, Arc<RecordingHw>) {
        let hw = Arc::new(RecordingHw::default());
        let hw_dyn: Arc<dyn HwPipe> = hw.clone();
        let weak: Weak<dyn HwPipe> = Arc::downgrade(&hw_dyn);
        let id = self.manager.guest_open_with_flags(weak, flags).unwrap();
        *hw.id.lock() = Some(id);
        (id, hw)
    }

    fn connect(&self, name: &str) -> (PipeId, Arc<RecordingHw>) {
        let (id, hw) = self.open();
        let request = format!("pipe:{}\0", name).into_bytes();
        let sent = self.manager.guest_send(id, &[&request]);
        assert_eq!(sent as usize, request.len());
        (id, hw)
    }

    fn read(&self, id: PipeId, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let n = self.manager.guest_recv(id, &mut [&mut buf]);
        assert!(n >= 0, "recv failed: {}", n);
        buf.truncate(n as usize);
        buf
    }
}

struct EchoService;

struct EchoPipe {
    ctx: PipeContext,
    buf: Vec<u8>,
    wanted: WakeFlags,
}

impl Service for EchoService {
    fn name(&self) -> &str {
        "echo"
    }

    fn create(
        &self,
        ctx: PipeContext,
        _flags: OpenFlags,
        _args: Option<&str>,
    ) -> Option<Box<dyn ServicePipe>> {
        Some(Box::new(EchoPipe {
            ctx,
            buf: Vec::new(),
            wanted: WakeFlags::empty(),
        }))
    }

    fn can_load(&self) -> bool {
        true
    }

    fn load(
        &self,
        ctx: PipeContext,
        _args: Option<&str>,
        reader: &mut SnapshotReader<'_>,
    ) -> Option<Box<dyn ServicePipe>> {
        let buf = reader.get_sized().ok()?;
        Some(Box::new(EchoPipe {
            ctx,
            buf,
            wanted: WakeFlags::empty(),
        }))
    }
}

impl ServicePipe for EchoPipe {
    fn on_guest_close(&mut self, _reason: CloseReason) {
        self.buf.clear();
    }

    fn on_guest_poll(&self) -> PollFlags {
        let mut flags = PollFlags::OUT;
        if !self.buf.is_empty() {
            flags |= PollFlags::IN;
        }
        flags
    }

    fn on_guest_recv(&mut self, bufs: &mut [&mut [u8]]) -> TransferResult {
        if self.buf.is_empty() {
            return Err(hostpipe_types::TransferError::Again);
        }
        let n = transfer::scatter(&self.buf, bufs);
        self.buf.drain(..n);
        Ok(n)
    }

    fn on_guest_send(&mut self, bufs: &[&[u8]]) -> SendResult {
        let incoming = transfer::gather(bufs);
        self.buf.extend_from_slice(&incoming);
        if self.wanted.contains(WakeFlags::READ) && !self.buf.is_empty() {
            self.wanted.remove(WakeFlags::READ);
            self.ctx.signal_wake(WakeFlags::READ);
        }
        Ok(SendOutcome::Transferred(incoming.len()))
    }

    fn on_guest_want_wake_on(&mut self, flags: WakeFlags) {
        self.wanted |= flags;
        if self.wanted.contains(WakeFlags::READ) && !self.buf.is_empty() {
            self.wanted.remove(WakeFlags::READ);
            self.ctx.signal_wake(WakeFlags::READ);
        }
    }

    fn on_save(&self, writer: &mut SnapshotWriter<'_>) -> io::Result<()> {
        writer.put_sized(&self.buf)
    }
}

struct RefusingService;

impl Service for RefusingService {
    fn name(&self) -> &str {
        "refuse"
    }

    fn create(
        &self,
        _ctx: PipeContext,
        _flags: OpenFlags,
        _args: Option<&str>,
    ) -> Option<Box<dyn ServicePipe>> {
        None
    }
}

fn echo_fixture() -> Fixture {
    let fixture = Fixture::new();
    fixture
        .manager
        .register_service(Arc::new(EchoService))
        .unwrap();
    fixture
}

#[test]
fn open_requires_init_threading() {
    let manager = PipeManager::new();
    let hw = Arc::new(RecordingHw::default());
    let hw_dyn: Arc<dyn HwPipe> = hw.clone();
    let weak: Weak<dyn HwPipe> = Arc::downgrade(&hw_dyn);
    assert!(manager.guest_open(weak).is_err());
}

#[test]
fn init_threading_is_once() {
    let fixture = Fixture::new();
    let second = Arc::new(HostVmLock::new());
    assert!(
        fixture
            .manager
            .init_threading(second as Arc<dyn VmLock>)
            .is_err()
    );
}

#[test]
fn registry_freezes_on_first_open() {
    let fixture = echo_fixture();
    let _ = fixture.open();
    assert!(
        fixture
            .manager
            .register_service(Arc::new(RefusingService))
            .is_err()
    );
}

#[test]
fn connect_and_echo_round_trip() {
    let fixture = echo_fixture();
    let (id, _hw) = fixture.connect("echo");
    assert_eq!(fixture.manager.guest_poll(id), PollFlags::OUT);

    assert_eq!(fixture.manager.guest_send(id, &[b"Hello"]), 5);
    assert_eq!(
        fixture.manager.guest_poll(id),
        PollFlags::IN | PollFlags::OUT
    );
    assert_eq!(fixture.read(id, 16), b"Hello");
    assert_eq!(fixture.manager.guest_poll(id), PollFlags::OUT);
}

#[test]
fn scatter_gather_vectors_round_trip() {
    let fixture = echo_fixture();
    let (id, _hw) = fixture.connect("echo");
    let sent = fixture.manager.guest_send(id, &[b"ab", b"", b"cde"]);
    assert_eq!(sent, 5);

    let mut a = [0u8; 2];
    let mut b = [0u8; 3];
    let n = fixture.manager.guest_recv(id, &mut [&mut a, &mut b]);
    assert_eq!(n, 5);
    assert_eq!(&a, b"ab");
    assert_eq!(&b, b"cde");
}

#[test]
fn trailing_bytes_are_delivered_with_the_transition() {
    let fixture = echo_fixture();
    let (id, _hw) = fixture.open();
    let sent = fixture.manager.guest_send(id, &[b"pipe:echo\0Hi"]);
    assert_eq!(sent, 12);
    assert_eq!(fixture.read(id, 8), b"Hi");
}

#[test]
fn unknown_service_hangs_up_after_first_write() {
    let fixture = echo_fixture();
    let (id, hw) = fixture.open();
    let sent = fixture.manager.guest_send(id, &[b"pipe:nope\0"]);
    assert_eq!(sent, 10);
    assert_eq!(hw.closed.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.manager.guest_poll(id), PollFlags::HUP);
    let mut buf = [0u8; 4];
    assert_eq!(fixture.manager.guest_recv(id, &mut [&mut buf]), 0);
    assert_eq!(fixture.manager.guest_send(id, &[b"x"]), PIPE_ERROR_IO);
}

#[test]
fn refusing_service_hangs_up() {
    let fixture = echo_fixture();
    fixture
        .manager
        .register_service(Arc::new(RefusingService))
        .unwrap();
    let (id, hw) = fixture.open();
    let sent = fixture.manager.guest_send(id, &[b"pipe:refuse\0"]);
    assert_eq!(sent, 12);
    assert_eq!(hw.closed.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.manager.guest_poll(id), PollFlags::HUP);
}

#[test]
fn malformed_request_returns_invalid() {
    let fixture = echo_fixture();
    let (id, hw) = fixture.open();
    assert_eq!(
        fixture.manager.guest_send(id, &[b"nopipe:echo\0"]),
        PIPE_ERROR_INVAL
    );
    assert_eq!(hw.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn empty_buffer_vectors_return_zero() {
    let fixture = echo_fixture();
    let (id, _hw) = fixture.connect("echo");
    assert_eq!(fixture.manager.guest_send(id, &[]), 0);
    assert_eq!(fixture.manager.guest_recv(id, &mut []), 0);
    let mut empty: [u8; 0] = [];
    assert_eq!(fixture.manager.guest_recv(id, &mut [&mut empty]), 0);
}

#[test]
fn wake_on_read_fires_when_data_arrives() {
    let fixture = echo_fixture();
    let (id, hw) = fixture.connect("echo");
    fixture.manager.guest_wake_on(id, WakeFlags::READ);
    assert!(hw.wakes.lock().is_empty());
    fixture.manager.guest_send(id, &[b"x"]);
    assert_eq!(hw.wakes.lock().as_slice(), &[WakeFlags::READ]);
}

#[test]
fn deferred_wake_from_worker_thread() {
    let fixture = echo_fixture();
    let (id, hw) = fixture.connect("echo");

    // A worker without the VM lock must queue, not execute.
    let manager = Arc::clone(&fixture.manager);
    thread::spawn(move || {
        use hostpipe_pipe::PipeWaker;
        manager.signal_wake(id, WakeFlags::READ);
    })
    .join()
    .unwrap();
    assert!(hw.wakes.lock().is_empty());

    let ready = fixture.manager.deferred_ready_receiver();
    assert!(ready.try_recv().is_ok());
    assert_eq!(fixture.manager.process_deferred_operations(), 1);
    assert_eq!(hw.wakes.lock().as_slice(), &[WakeFlags::READ]);
}

#[test]
fn guest_close_aborts_queued_operations() {
    let fixture = echo_fixture();
    let (id, hw) = fixture.connect("echo");

    let manager = Arc::clone(&fixture.manager);
    thread::spawn(move || {
        use hostpipe_pipe::PipeWaker;
        manager.signal_wake(id, WakeFlags::READ);
    })
    .join()
    .unwrap();

    fixture.manager.guest_close(id, CloseReason::Graceful);
    assert_eq!(fixture.manager.process_deferred_operations(), 0);
    assert!(hw.wakes.lock().is_empty());
    assert_eq!(fixture.manager.live_pipe_count(), 0);
}

#[test]
fn close_from_host_transitions_to_closed() {
    use hostpipe_pipe::PipeWaker;

    let fixture = echo_fixture();
    let (id, hw) = fixture.connect("echo");
    fixture.manager.close_from_host(id, CloseReason::Error);
    assert_eq!(hw.closed.load(Ordering::SeqCst), 1);

    assert_eq!(fixture.manager.guest_poll(id), PollFlags::HUP);
    let mut buf = [0u8; 4];
    assert_eq!(fixture.manager.guest_recv(id, &mut [&mut buf]), 0);
    assert_eq!(fixture.manager.guest_send(id, &[b"x"]), PIPE_ERROR_IO);
}

#[test]
fn virtio_transports_get_a_rebind_notification() {
    let fixture = echo_fixture();
    let (id, hw) = fixture.open_with_flags(OpenFlags::VIRTIO);
    fixture.manager.guest_send(id, &[b"pipe:echo\0"]);
    assert_eq!(hw.rebinds.load(Ordering::SeqCst), 1);

    let (_, plain_hw) = fixture.connect("echo");
    assert_eq!(plain_hw.rebinds.load(Ordering::SeqCst), 0);
}

#[test]
fn snapshot_round_trip_restores_pending_data() {
    let fixture = echo_fixture();
    let (id, _hw) = fixture.connect("echo");
    fixture.manager.guest_send(id, &[b"abc"]);

    let mut snapshot = Vec::new();
    {
        let mut writer = SnapshotWriter::new(&mut snapshot);
        fixture.manager.guest_pre_save(&mut writer).unwrap();
        fixture.manager.guest_save(&mut writer).unwrap();
        fixture.manager.guest_post_save(&mut writer).unwrap();
    }
    drop(fixture);

    let restored = echo_fixture();
    let mut hw_pipes: Vec<Arc<RecordingHw>> = Vec::new();
    let mut cursor: &[u8] = &snapshot;
    let mut reader = SnapshotReader::new(&mut cursor);
    restored.manager.guest_pre_load(&mut reader).unwrap();
    let loaded = restored
        .manager
        .guest_load(&mut reader, &mut |id| {
            let hw = Arc::new(RecordingHw::default());
            *hw.id.lock() = Some(id);
            let hw_dyn: Arc<dyn HwPipe> = hw.clone();
            let weak: Weak<dyn HwPipe> = Arc::downgrade(&hw_dyn);
            hw_pipes.push(hw);
            weak
        })
        .unwrap();
    restored.manager.guest_post_load(&mut reader).unwrap();

    assert_eq!(loaded, vec![id]);
    assert_eq!(
        restored.manager.guest_poll(id),
        PollFlags::IN | PollFlags::OUT
    );
    assert_eq!(restored.read(id, 8), b"abc");
    // New pipes never collide with restored identifiers.
    let (new_id, _) = restored.open();
    assert!(new_id > id);
}

#[test]
fn snapshot_force_closes_unloadable_services() {
    let fixture = echo_fixture();
    fixture
        .manager
        .register_service(Arc::new(RefusingService))
        .unwrap();
    // A connector-state pipe has no service and is saved as force-close.
    let (id, _hw) = fixture.open();

    let mut snapshot = Vec::new();
    {
        let mut writer = SnapshotWriter::new(&mut snapshot);
        fixture.manager.guest_save(&mut writer).unwrap();
    }
    drop(fixture);

    let restored = echo_fixture();
    let hw = Arc::new(RecordingHw::default());
    let mut cursor: &[u8] = &snapshot;
    let mut reader = SnapshotReader::new(&mut cursor);
    let hw_for_load = Arc::clone(&hw);
    restored
        .manager
        .guest_load(&mut reader, &mut |_| {
            let hw_dyn: Arc<dyn HwPipe> = hw_for_load.clone();
            let weak: Weak<dyn HwPipe> = Arc::downgrade(&hw_dyn);
            weak
        })
        .unwrap();

    assert_eq!(restored.manager.guest_poll(id), PollFlags::HUP);
    assert!(restored.manager.process_deferred_operations() >= 1);
    assert_eq!(hw.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn corrupt_pipe_record_does_not_poison_neighbors() {
    let fixture = echo_fixture();
    let (first, _hw1) = fixture.connect("echo");
    let (second, _hw2) = fixture.connect("echo");
    fixture.manager.guest_send(second, &[b"kept"]);

    let mut snapshot = Vec::new();
    {
        let mut writer = SnapshotWriter::new(&mut snapshot);
        fixture.manager.guest_save(&mut writer).unwrap();
    }
    drop(fixture);

    // Corrupt the first record's blob: the service name length points at
    // garbage, but the record envelope still frames it.
    // Layout: count(4) + id(8) + marker(1) + blob_len(4) + blob...
    snapshot[17] ^= 0xFF;

    let restored = echo_fixture();
    let mut hw_pipes: Vec<Arc<RecordingHw>> = Vec::new();
    let mut cursor: &[u8] = &snapshot;
    let mut reader = SnapshotReader::new(&mut cursor);
    let loaded = restored
        .manager
        .guest_load(&mut reader, &mut |_| {
            let hw = Arc::new(RecordingHw::default());
            let hw_dyn: Arc<dyn HwPipe> = hw.clone();
            let weak: Weak<dyn HwPipe> = Arc::downgrade(&hw_dyn);
            hw_pipes.push(hw);
            weak
        })
        .unwrap();

    assert_eq!(loaded, vec![first, second]);
    assert_eq!(restored.manager.guest_poll(first), PollFlags::HUP);
    assert_eq!(restored.read(second, 8), b"kept");
}

struct OneShotService;

struct OneShotPipe;

impl Service for OneShotService {
    fn name(&self) -> &str {
        "oneshot"
    }

    fn create(
        &self,
        ctx: PipeContext,
        _flags: OpenFlags,
        _args: Option<&str>,
    ) -> Option<Box<dyn ServicePipe>> {
        let _ = ctx;
        Some(Box::new(OneShotPipe))
    }
}

impl ServicePipe for OneShotPipe {
    fn on_guest_close(&mut self, _reason: CloseReason) {}

    fn on_guest_poll(&self) -> PollFlags {
        PollFlags::OUT
    }

    fn on_guest_recv(&mut self, _bufs: &mut [&mut [u8]]) -> TransferResult {
        Err(hostpipe_types::TransferError::Again)
    }

    fn on_guest_send(&mut self, bufs: &[&[u8]]) -> SendResult {
        // Handles exactly one request, then hands the connection to an echo
        // pipe seeded with the consumed bytes.
        let incoming = transfer::gather(bufs);
        let n = incoming.len();
        Ok(SendOutcome::Rebound {
            transferred: n,
            replacement: Box::new(SeededPipe { buf: incoming }),
        })
    }

    fn on_guest_want_wake_on(&mut self, _flags: WakeFlags) {}
}

struct SeededPipe {
    buf: Vec<u8>,
}

impl ServicePipe for SeededPipe {
    fn on_guest_close(&mut self, _reason: CloseReason) {}

    fn on_guest_poll(&self) -> PollFlags {
        PollFlags::IN
    }

    fn on_guest_recv(&mut self, bufs: &mut [&mut [u8]]) -> TransferResult {
        let n = transfer::scatter(&self.buf, bufs);
        self.buf.drain(..n);
        Ok(n)
    }

    fn on_guest_send(&mut self, _bufs: &[&[u8]]) -> SendResult {
        Err(hostpipe_types::TransferError::Io)
    }

    fn on_guest_want_wake_on(&mut self, _flags: WakeFlags) {}
}

#[test]
fn send_result_can_rebind_the_host_endpoint() {
    let fixture = Fixture::new();
    fixture
        .manager
        .register_service(Arc::new(OneShotService))
        .unwrap();
    let (id, _hw) = fixture.connect("oneshot");

    assert_eq!(fixture.manager.guest_send(id, &[b"token"]), 5);
    // The replacement pipe now serves reads.
    assert_eq!(fixture.manager.guest_poll(id), PollFlags::IN);
    assert_eq!(fixture.read(id, 8), b"token");
}

#[test]
fn reset_all_clears_pipes_and_services() {
    let fixture = echo_fixture();
    let _ = fixture.connect("echo");
    fixture.manager.reset_all();
    assert_eq!(fixture.manager.live_pipe_count(), 0);
    assert!(fixture.manager.registry().is_empty());
    // The registry unfreezes for the next test-case setup.
    fixture
        .manager
        .register_service(Arc::new(EchoService))
        .unwrap();
    let _ = fixture.lock;
}
