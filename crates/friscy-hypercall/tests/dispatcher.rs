use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use friscy_checkpoint::{EmulatedKernelState, EpollInterest, EpollOp};
use friscy_hypercall::{
    Call, Completion, ComputeHost, Dispatch, DispatchError, Dispatcher, DispatcherConfig, Errno,
    Guest, HandlerKind, HostBridge, HostCall, HostError, HostFuture, HostResult, HypercallId,
    NativeCompute, NetHost, Outcome, StorageHost,
};
use proptest::prelude::*;

const MEM: usize = 64 * 1024;

struct TestGuest {
    args: [u64; 6],
    a0: Option<i64>,
    mem: Vec<u8>,
    kernel: EmulatedKernelState,
}

impl TestGuest {
    fn new() -> Self {
        Self {
            args: [0; 6],
            a0: None,
            mem: vec![0; MEM],
            kernel: EmulatedKernelState::default(),
        }
    }

    fn with_args(mut self, args: &[u64]) -> Self {
        self.set_args(args);
        self
    }

    fn set_args(&mut self, args: &[u64]) {
        self.args = [0; 6];
        self.args[..args.len()].copy_from_slice(args);
        self.a0 = None;
    }
}

impl Guest for TestGuest {
    fn sysarg(&self, index: usize) -> u64 {
        self.args.get(index).copied().unwrap_or(0)
    }
    fn set_result(&mut self, value: i64) {
        self.a0 = Some(value);
    }
    fn memory(&self) -> &[u8] {
        &self.mem
    }
    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.mem
    }
    fn kernel_mut(&mut self) -> &mut EmulatedKernelState {
        &mut self.kernel
    }
}

/// Returns `Pending` exactly once so suspended calls really suspend.
#[derive(Default)]
struct YieldOnce(bool);

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0 {
            return Poll::Ready(());
        }
        self.0 = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[derive(Default)]
struct StorageLog {
    host_calls: usize,
    closed: Vec<i32>,
}

struct FakeStorage {
    files: HashMap<i32, Vec<u8>>,
    log: Rc<RefCell<StorageLog>>,
}

impl FakeStorage {
    fn new(log: Rc<RefCell<StorageLog>>) -> Self {
        let files = HashMap::from([(7, b"hello from the host".to_vec())]);
        Self { files, log }
    }

    fn slice(&self, fd: i32, offset: usize, len: usize) -> HostResult<Vec<u8>> {
        let data = self.files.get(&fd).ok_or(HostError::Errno(Errno::EBADF))?;
        let start = offset.min(data.len());
        let end = (start + len).min(data.len());
        Ok(data[start..end].to_vec())
    }
}

impl StorageHost for FakeStorage {
    fn open(&mut self, path: String) -> HostCall<i32> {
        self.log.borrow_mut().host_calls += 1;
        if path == "/data/hello.txt" {
            HostCall::ready(7)
        } else {
            HostCall::fail(Errno::ENOENT)
        }
    }

    fn write(&mut self, _fd: i32, data: Vec<u8>) -> HostCall<usize> {
        self.log.borrow_mut().host_calls += 1;
        HostCall::pending(async move {
            YieldOnce::default().await;
            Ok(data.len())
        })
    }

    fn read(&mut self, fd: i32, len: usize) -> HostCall<Vec<u8>> {
        self.log.borrow_mut().host_calls += 1;
        let res = self.slice(fd, 0, len);
        HostCall::pending(async move {
            YieldOnce::default().await;
            res
        })
    }

    fn pread(&mut self, fd: i32, len: usize, offset: u64) -> HostCall<Vec<u8>> {
        self.log.borrow_mut().host_calls += 1;
        HostCall::Ready(self.slice(fd, offset as usize, len))
    }

    fn close(&mut self, fd: i32) -> HostResult<()> {
        self.log.borrow_mut().host_calls += 1;
        self.log.borrow_mut().closed.push(fd);
        if self.files.remove(&fd).is_some() {
            Ok(())
        } else {
            Err(Errno::EBADF.into())
        }
    }
}

/// Fixed clock; `None` simulates a host primitive that blows up.
struct TestCompute {
    now_ms: Option<i64>,
}

impl ComputeHost for TestCompute {
    fn magic(&mut self, kind: i64, buf: &mut [u8]) -> HostResult<i64> {
        if kind != 1 {
            return Err(HostError::Unsupported("magic"));
        }
        buf.reverse();
        Ok(buf.len() as i64)
    }

    fn now_ms(&mut self) -> HostResult<i64> {
        match self.now_ms {
            Some(ms) => Ok(ms),
            None => panic!("clock backend crashed"),
        }
    }

    fn fill_random(&mut self, buf: &mut [u8]) -> HostResult<()> {
        NativeCompute.fill_random(buf)
    }

    fn convert_encoding(&mut self, input: &[u8], output: &mut [u8]) -> HostResult<usize> {
        NativeCompute.convert_encoding(input, output)
    }

    fn validate_structured(&mut self, data: &[u8]) -> HostResult<()> {
        NativeCompute.validate_structured(data)
    }
}

struct FakeNet;

impl NetHost for FakeNet {
    fn connect(&mut self, _fd: i32, addr: SocketAddrV4) -> HostFuture<i32> {
        Box::pin(async move {
            YieldOnce::default().await;
            if addr.port() == 80 {
                Ok(512)
            } else {
                Err(Errno::ECONNREFUSED.into())
            }
        })
    }

    fn resolve(&mut self, node: String) -> HostFuture<Ipv4Addr> {
        Box::pin(async move {
            YieldOnce::default().await;
            match node.as_str() {
                "example.com" => Ok(Ipv4Addr::new(93, 184, 216, 34)),
                _ => Err(Errno::EHOSTUNREACH.into()),
            }
        })
    }

    fn write(&mut self, _fd: i32, data: Vec<u8>) -> HostFuture<usize> {
        Box::pin(async move { Ok(data.len()) })
    }

    fn read(&mut self, fd: i32, len: usize) -> HostFuture<Vec<u8>> {
        Box::pin(async move {
            YieldOnce::default().await;
            if fd == 599 {
                panic!("socket backend crashed");
            }
            Ok(b"pong".iter().copied().take(len).collect())
        })
    }
}

fn dispatcher(log: Rc<RefCell<StorageLog>>, now_ms: Option<i64>) -> Dispatcher {
    let host = HostBridge::new(FakeStorage::new(log), TestCompute { now_ms }, FakeNet);
    Dispatcher::with_default_handlers(host, DispatcherConfig::default())
}

fn default_dispatcher() -> Dispatcher {
    dispatcher(Rc::default(), Some(0))
}

fn run(d: &mut Dispatcher, g: &mut TestGuest, id: HypercallId, args: &[u64]) -> i64 {
    g.set_args(args);
    match d.dispatch(id.0, g).unwrap() {
        Dispatch::Completed(result) => {
            assert_eq!(g.a0, Some(result));
            result
        }
        Dispatch::Suspended => {
            assert_eq!(g.a0, None, "result must not be visible while suspended");
            let result = pollster::block_on(d.resume(g)).unwrap();
            assert_eq!(g.a0, Some(result));
            result
        }
        Dispatch::NotHypercall => panic!("{id} not routed"),
    }
}

#[test]
fn ids_outside_bands_are_left_to_native_emulation() {
    let mut d = default_dispatcher();
    let mut g = TestGuest::new();
    // 64 = write(2) on riscv64.
    assert_eq!(d.dispatch(64, &mut g).unwrap(), Dispatch::NotHypercall);
    assert_eq!(g.a0, None);
}

#[test]
fn unknown_ids_inside_a_band_return_enosys() {
    let mut d = default_dispatcher();
    let mut g = TestGuest::new();
    for id in [650, 701, 799, 850] {
        assert_eq!(
            d.dispatch(id, &mut g).unwrap(),
            Dispatch::Completed(Errno::ENOSYS.result())
        );
        assert_eq!(g.a0, Some(-38));
    }
}

#[test]
fn memmove_returns_dst_and_handles_overlap() {
    let mut d = default_dispatcher();
    let mut g = TestGuest::new();
    let src: Vec<u8> = (0..=255).cycle().take(4096).collect();
    g.write_bytes(0x1000, &src).unwrap();

    let result = run(&mut d, &mut g, HypercallId::MEMMOVE, &[0x1100, 0x1000, 4096]);
    assert_eq!(result, 0x1100);
    assert_eq!(g.view(0x1100, 4096).unwrap(), &src[..]);

    let result = run(&mut d, &mut g, HypercallId::MEMMOVE, &[0x1100, MEM as u64 - 8, 16]);
    assert_eq!(result, Errno::EFAULT.result());
}

#[test]
fn gettimeofday_writes_two_little_endian_fields() {
    let mut d = dispatcher(Rc::default(), Some(1_700_000_123_456));
    let mut g = TestGuest::new();

    assert_eq!(run(&mut d, &mut g, HypercallId::GETTIMEOFDAY, &[0x2000]), 0);
    assert_eq!(&g.mem[0x2000..0x2008], &1_700_000_123i64.to_le_bytes());
    assert_eq!(&g.mem[0x2008..0x2010], &456_000i64.to_le_bytes());

    assert_eq!(run(&mut d, &mut g, HypercallId::GETTIMEOFDAY, &[0]), 0);
    assert_eq!(
        run(&mut d, &mut g, HypercallId::GETTIMEOFDAY, &[MEM as u64 - 8]),
        Errno::EFAULT.result()
    );
}

#[test]
fn panicking_host_primitive_becomes_a_single_negative_result() {
    let mut d = dispatcher(Rc::default(), None);
    let mut g = TestGuest::new().with_args(&[0x2000]);

    let outcome = d.dispatch(HypercallId::GETTIMEOFDAY.0, &mut g).unwrap();
    assert_eq!(outcome, Dispatch::Completed(Errno::EIO.result()));
    assert_eq!(g.a0, Some(-5));
    assert!(g.mem[0x2000..0x2010].iter().all(|&b| b == 0));

    // The dispatcher is still usable afterwards.
    assert_eq!(run(&mut d, &mut g, HypercallId::MEMMOVE, &[0x3000, 0x2000, 8]), 0x3000);
}

#[test]
fn panicking_suspended_primitive_resumes_with_eio() {
    let mut d = default_dispatcher();
    let mut g = TestGuest::new();
    assert_eq!(
        run(&mut d, &mut g, HypercallId::NET_READ, &[599, 0x1000, 16]),
        Errno::EIO.result()
    );
    assert!(!d.is_suspended());
}

#[test]
fn storage_open_read_close() {
    let log = Rc::new(RefCell::new(StorageLog::default()));
    let mut d = dispatcher(log.clone(), Some(0));
    let mut g = TestGuest::new();
    g.write_bytes(0x100, b"/data/hello.txt\0").unwrap();
    g.write_bytes(0x200, b"/data/missing\0").unwrap();

    let fd = run(&mut d, &mut g, HypercallId::OPEN, &[0x100]);
    assert_eq!(fd, 7);
    assert_eq!(
        run(&mut d, &mut g, HypercallId::OPEN, &[0x200]),
        Errno::ENOENT.result()
    );

    assert_eq!(run(&mut d, &mut g, HypercallId::READ, &[7, 0x4000, 5]), 5);
    assert_eq!(&g.mem[0x4000..0x4005], b"hello");
    assert_eq!(run(&mut d, &mut g, HypercallId::PREAD, &[7, 0x5000, 4, 15]), 4);
    assert_eq!(&g.mem[0x5000..0x5004], b"host");

    assert_eq!(run(&mut d, &mut g, HypercallId::WRITE, &[7, 0x4000, 5]), 5);
    assert_eq!(run(&mut d, &mut g, HypercallId::CLOSE, &[7]), 0);
    assert_eq!(
        run(&mut d, &mut g, HypercallId::CLOSE, &[7]),
        Errno::EBADF.result()
    );
    assert_eq!(log.borrow().closed, vec![7, 7]);
}

#[test]
fn suspended_call_blocks_the_context_until_resumed() {
    let mut d = default_dispatcher();
    let mut g = TestGuest::new().with_args(&[7, 0x4000, 19]);

    assert_eq!(
        d.dispatch(HypercallId::READ.0, &mut g).unwrap(),
        Dispatch::Suspended
    );
    assert_eq!(d.suspended(), Some(HypercallId::READ));
    assert_eq!(g.a0, None);
    assert!(g.mem[0x4000..0x4013].iter().all(|&b| b == 0));

    let err = d.dispatch(HypercallId::MEMMOVE.0, &mut g).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Busy {
            pending: HypercallId::READ,
            requested: HypercallId::MEMMOVE
        }
    ));

    let waker = futures_util::task::noop_waker();
    let mut cx = Context::from_waker(&waker);
    assert!(d.poll_resume(&mut cx, &mut g).is_pending());
    assert_eq!(g.a0, None);
    match d.poll_resume(&mut cx, &mut g) {
        Poll::Ready(Ok(19)) => {}
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(g.a0, Some(19));
    assert_eq!(&g.mem[0x4000..0x4013], b"hello from the host");

    assert!(matches!(
        pollster::block_on(d.resume(&mut g)),
        Err(DispatchError::NothingPending)
    ));
}

#[test]
fn close_drops_descriptor_from_kernel_tables() {
    let mut d = default_dispatcher();
    let mut g = TestGuest::new();
    let ep = g.kernel.epoll_create().unwrap();
    g.kernel
        .epoll_ctl(ep, EpollOp::Add, 7, EpollInterest { events: 1, data: 7 })
        .unwrap();
    g.kernel.eventfd_create(7, 0).unwrap();

    assert_eq!(run(&mut d, &mut g, HypercallId::CLOSE, &[7]), 0);
    assert!(!g.kernel.is_descriptor_in_use(7));
    assert!(g.kernel.epoll_instances[&ep].interests.is_empty());
}

#[test]
fn bad_arguments_never_reach_the_host() {
    let log = Rc::new(RefCell::new(StorageLog::default()));
    let mut d = dispatcher(log.clone(), Some(0));
    let mut g = TestGuest::new();

    assert_eq!(
        run(&mut d, &mut g, HypercallId::WRITE, &[1, 0x100, 4]),
        Errno::EBADF.result()
    );
    assert_eq!(
        run(&mut d, &mut g, HypercallId::READ, &[7, MEM as u64 - 2, 4]),
        Errno::EFAULT.result()
    );
    assert_eq!(
        run(&mut d, &mut g, HypercallId::PREAD, &[7, 0x100, 4, u64::MAX]),
        Errno::EINVAL.result()
    );
    assert_eq!(
        run(&mut d, &mut g, HypercallId::OPEN, &[0]),
        Errno::EFAULT.result()
    );
    assert_eq!(log.borrow().host_calls, 0);

    assert_eq!(
        run(&mut d, &mut g, HypercallId::NET_WRITE, &[7, 0x100, 4]),
        Errno::EBADF.result()
    );
}

#[test]
fn network_round_trip() {
    let mut d = default_dispatcher();
    let mut g = TestGuest::new();

    let mut sockaddr = [0u8; 16];
    sockaddr[..2].copy_from_slice(&2u16.to_le_bytes());
    sockaddr[2..4].copy_from_slice(&80u16.to_be_bytes());
    sockaddr[4..8].copy_from_slice(&[93, 184, 216, 34]);
    g.write_bytes(0x100, &sockaddr).unwrap();
    let sock = run(&mut d, &mut g, HypercallId::NET_CONNECT, &[3, 0x100, 16]);
    assert_eq!(sock, 512);

    g.mem[0x103] = 81;
    assert_eq!(
        run(&mut d, &mut g, HypercallId::NET_CONNECT, &[3, 0x100, 16]),
        Errno::ECONNREFUSED.result()
    );

    g.write_bytes(0x200, b"ping").unwrap();
    assert_eq!(run(&mut d, &mut g, HypercallId::NET_WRITE, &[512, 0x200, 4]), 4);
    assert_eq!(run(&mut d, &mut g, HypercallId::NET_READ, &[512, 0x300, 64]), 4);
    assert_eq!(&g.mem[0x300..0x304], b"pong");
}

#[test]
fn resolve_writes_nul_terminated_dotted_quad() {
    let mut d = default_dispatcher();
    let mut g = TestGuest::new();
    g.write_bytes(0x100, b"example.com\0").unwrap();
    g.write_bytes(0x180, b"nowhere.invalid\0").unwrap();

    assert_eq!(
        run(&mut d, &mut g, HypercallId::NET_RESOLVE, &[0x100, 0, 0, 0x1000]),
        0
    );
    assert_eq!(&g.mem[0x1000..0x100e], b"93.184.216.34\0");

    assert_eq!(
        run(&mut d, &mut g, HypercallId::NET_RESOLVE, &[0x180, 0, 0, 0x2000]),
        Errno::EHOSTUNREACH.result()
    );
    // Result buffer must hold `resolve_result_len` bytes.
    assert_eq!(
        run(&mut d, &mut g, HypercallId::NET_RESOLVE, &[0x100, 0, 0, MEM as u64 - 64]),
        Errno::EFAULT.result()
    );
}

#[test]
fn resolve_without_result_buffer_still_reports_lookup() {
    let mut d = default_dispatcher();
    let mut g = TestGuest::new();
    g.write_bytes(0x100, b"example.com\0").unwrap();
    g.write_bytes(0x180, b"nowhere.invalid\0").unwrap();
    let untouched = g.mem.clone();

    assert_eq!(run(&mut d, &mut g, HypercallId::NET_RESOLVE, &[0x100, 0, 0, 0]), 0);
    assert_eq!(
        run(&mut d, &mut g, HypercallId::NET_RESOLVE, &[0x180, 0, 0, 0]),
        Errno::EHOSTUNREACH.result()
    );
    assert_eq!(g.mem, untouched);
}

#[test]
fn compute_band_utilities() {
    let mut d = default_dispatcher();
    let mut g = TestGuest::new();

    assert_eq!(run(&mut d, &mut g, HypercallId::GETRANDOM, &[0x100, 32]), 32);
    assert!(g.mem[0x100..0x120].iter().any(|&b| b != 0));

    g.write_bytes(0x200, br#"{"ok":true}"#).unwrap();
    assert_eq!(run(&mut d, &mut g, HypercallId::VALIDATE_JSON, &[0x200, 11]), 0);
    assert_eq!(
        run(&mut d, &mut g, HypercallId::VALIDATE_JSON, &[0x200, 5]),
        Errno::EINVAL.result()
    );

    g.write_bytes(0x300, "grüße".as_bytes()).unwrap();
    assert_eq!(
        run(&mut d, &mut g, HypercallId::CONVERT_ENCODING, &[0x300, 7, 0x400, 16]),
        7
    );
    assert_eq!(&g.mem[0x400..0x407], "grüße".as_bytes());

    g.write_bytes(0x500, b"abc").unwrap();
    assert_eq!(run(&mut d, &mut g, HypercallId::MAGIC, &[1, 0x500, 3]), 3);
    assert_eq!(&g.mem[0x500..0x503], b"cba");
    assert_eq!(
        run(&mut d, &mut g, HypercallId::MAGIC, &[9, 0x500, 3]),
        Errno::ENOSYS.result()
    );
}

#[test]
fn unsupported_hosts_answer_enosys() {
    let mut d = Dispatcher::with_default_handlers(HostBridge::default(), DispatcherConfig::default());
    let mut g = TestGuest::new();
    g.write_bytes(0x100, b"/data/hello.txt\0").unwrap();
    assert_eq!(
        run(&mut d, &mut g, HypercallId::OPEN, &[0x100]),
        Errno::ENOSYS.result()
    );
    assert_eq!(
        run(&mut d, &mut g, HypercallId::NET_WRITE, &[512, 0x100, 4]),
        Errno::ENOSYS.result()
    );
}

fn echo_len(call: &mut Call<'_>) -> Result<Outcome, Errno> {
    let len = call.arg_len(1)?;
    call.guest.view(call.arg(0), len)?;
    Ok(Outcome::Done(Completion::count(len)))
}

#[test]
fn install_enforces_band_contracts() {
    let mut d = Dispatcher::new(HostBridge::default(), DispatcherConfig::default());
    let mut g = TestGuest::new();

    assert!(matches!(
        d.install(HypercallId::MEMMOVE, HandlerKind::Async, echo_len),
        Err(DispatchError::KindMismatch { .. })
    ));
    assert!(matches!(
        d.install(HypercallId::NET_READ, HandlerKind::Sync, echo_len),
        Err(DispatchError::KindMismatch { .. })
    ));
    assert!(matches!(
        d.install(HypercallId(42), HandlerKind::Sync, echo_len),
        Err(DispatchError::OutsideBands { .. })
    ));

    assert!(!d.install(HypercallId(650), HandlerKind::Sync, echo_len).unwrap());
    assert_eq!(d.handler_kind(HypercallId(650)), Some(HandlerKind::Sync));
    assert_eq!(run(&mut d, &mut g, HypercallId(650), &[0x100, 12]), 12);
    assert!(d.install(HypercallId(650), HandlerKind::Async, echo_len).unwrap());
}

proptest! {
    #[test]
    fn arbitrary_arguments_never_escape_as_panics(
        id in prop::sample::select(vec![600u64, 601, 602, 603, 604, 700, 703, 704, 705, 706, 708, 800, 801, 802, 803]),
        args in prop::array::uniform6(prop_oneof![
            Just(0u64),
            0u64..(MEM as u64 + 64),
            any::<u64>(),
        ]),
    ) {
        let mut d = default_dispatcher();
        let mut g = TestGuest::new();
        g.mem[0x10..0x20].copy_from_slice(b"example.com\0\0\0\0\0");
        let result = run(&mut d, &mut g, HypercallId(id), &args);
        prop_assert!(result >= 0 || (-4095..0).contains(&result), "result {result}");
        prop_assert!(!d.is_suspended());
    }
}
