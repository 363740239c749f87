//! The console: one owner for the merged keyboard/COM1 input stream.
//!
//! All console state lives in [`ConsState`] and is only ever touched by its
//! single owner, the console daemon (tests drive the state machine
//! directly). The daemon's event sources are the two IRQ wakeups; read
//! requests and poll subscriptions arrive through [`Console`] and park their
//! wakers in the state until the buffer has data for them.

use crate::diagnostics;
use crate::globals;
use crate::irq::{self, INT_COM1, INT_KBD, IRQ_COM1, IRQ_KBD};
use crate::poll::{PollMsg, Pollers, Ready};
use crate::proc::{Fd, FdPerms, FileOps};
use crate::task::{Executor, Task};
use crate::userio::UserIo;

use crate::err::{KErr, KResult};

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use amd64::io::{self, PortNumber};

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use futures_util::future::{self, Either};

use spin::Mutex;

/// Input queued beyond this many bytes is dropped.
pub const CONS_BUF_CAP: usize = 1024;

/// PS/2 controller ports.
const PS2_DATA: PortNumber = PortNumber(0x60);
const PS2_STATUS: PortNumber = PortNumber(0x64);

/// Scan-code set 1 to ASCII, unshifted. Index is the scan code; zero marks
/// codes without a printable mapping (modifiers, function keys).
const KBD_MAP: [u8; 0x58] = [
    0, 0x1B, b'1', b'2', b'3', b'4', b'5', b'6', // 0x00
    b'7', b'8', b'9', b'0', b'-', b'=', 0x08, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', // 0x10
    b'o', b'p', b'[', b']', b'\n', 0, b'a', b's',
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', // 0x20
    b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', 0, b'*', // 0x30
    0, b' ', 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, b'7', // 0x40
    b'8', b'9', b'-', b'4', b'5', b'6', b'+', b'1',
    b'2', b'3', b'0', b'.', 0, 0, 0, 0, // 0x50
];

/// ASCII for a make code, if it has one.
pub fn scancode_to_ascii(sc: u8) -> Option<u8> {
    match KBD_MAP.get(sc as usize) {
        Some(&c) if c != 0 => Some(c),
        _ => None,
    }
}

/// COM1 byte stream fix-ups: carriage return becomes newline, DEL becomes
/// backspace.
pub fn com_translate(b: u8) -> u8 {
    match b {
        b'\r' => b'\n',
        0x7F => 0x08,
        other => other,
    }
}

/// The console state machine. Inputs: bytes from either interrupt stream,
/// read requests, poll subscriptions. Outputs: read replies and poller
/// wakeups, delivered through the parked wakers.
pub struct ConsState {
    data: VecDeque<u8>,
    pollers: Pollers,
    read_wakers: Vec<Waker>,
    dropped: usize,
}

impl ConsState {
    pub fn new() -> ConsState {
        ConsState {
            data: VecDeque::new(),
            pollers: Pollers::new(),
            read_wakers: Vec::new(),
            dropped: 0,
        }
    }

    /// Append one byte, waking readers and pollers now that data exists.
    /// Overflow drops the byte with a complaint.
    pub fn push(&mut self, c: u8) {
        if self.data.len() >= CONS_BUF_CAP {
            if self.dropped == 0 {
                log::warn!("console buffer full, dropping input");
            }
            self.dropped += 1;
            return;
        }
        self.data.push_back(c);
        for waker in self.read_wakers.drain(..) {
            waker.wake();
        }
        self.pollers.wake_ready(Ready::READ);
    }

    pub fn on_scancode(&mut self, sc: u8) {
        if let Some(c) = scancode_to_ascii(sc) {
            self.push(c);
        }
    }

    pub fn on_com_byte(&mut self, b: u8) {
        self.push(com_translate(b));
    }

    /// Serve a read request: at most `max` bytes, in arrival order.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.data.len());
        self.data.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Handle a poll subscription.
    pub fn poll(&mut self, pm: PollMsg) -> Ready {
        if !pm.events.contains(Ready::READ) {
            return Ready::empty();
        }
        if !self.data.is_empty() {
            Ready::READ
        } else {
            if pm.dowait {
                self.pollers.add(&pm);
            }
            Ready::empty()
        }
    }

    fn park_reader(&mut self, waker: &Waker) {
        if !self.read_wakers.iter().any(|w| w.will_wake(waker)) {
            self.read_wakers.push(waker.clone());
        }
    }
}

impl Default for ConsState {
    fn default() -> Self {
        Self::new()
    }
}

/// The console singleton handed to readers, pollers, and the daemon.
pub struct Console {
    state: Mutex<ConsState>,
}

impl Console {
    pub fn new() -> Console {
        Console {
            state: Mutex::new(ConsState::new()),
        }
    }

    pub fn push_scancode(&self, sc: u8) {
        self.state.lock().on_scancode(sc);
    }

    pub fn push_com_byte(&self, b: u8) {
        self.state.lock().on_com_byte(b);
    }

    pub fn push_byte(&self, c: u8) {
        self.state.lock().push(c);
    }

    /// Data immediately available, without blocking. `None` when empty.
    pub fn try_read(&self, max: usize) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        if state.is_empty() {
            None
        } else {
            Some(state.read(max))
        }
    }

    /// Block until at least one byte is buffered, then take at most `max`.
    pub fn read(&self, max: usize) -> ConsoleRead<'_> {
        ConsoleRead { cons: self, max }
    }

    pub fn poll(&self, pm: PollMsg) -> Ready {
        self.state.lock().poll(pm)
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

/// A pending console read; resolves with the reply slice, exactly once.
pub struct ConsoleRead<'a> {
    cons: &'a Console,
    max: usize,
}

impl Future for ConsoleRead<'_> {
    type Output = Vec<u8>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Vec<u8>> {
        let mut state = self.cons.state.lock();
        if !state.is_empty() {
            return Poll::Ready(state.read(self.max));
        }
        state.park_reader(cx.waker());
        Poll::Pending
    }
}

fn ps2_ready() -> bool {
    unsafe { io::inb(PS2_STATUS) & 0x01 != 0 }
}

/// Echo a console byte to the output devices.
fn echo(c: u8) {
    globals::COM1.lock().write_byte(c);
    if let Some(mut vga) = crate::vga::writer() {
        use core::fmt::Write;
        let _ = vga.write_str(core::str::from_utf8(&[c]).unwrap_or(""));
    }
}

/// Feed one translated input byte: echo it, run the debug keys, queue it.
fn input_byte(cons: &Console, c: u8) {
    echo(c);
    cons.push_byte(c);
    match c {
        b'\\' => diagnostics::stack_trace(),
        b'@' | b'%' => {
            // reserved debug hooks
        }
        _ => {}
    }
}

fn drain_keyboard(cons: &Console) {
    while ps2_ready() {
        let sc = unsafe { io::inb(PS2_DATA) };
        if let Some(c) = scancode_to_ascii(sc) {
            input_byte(cons, c);
        }
    }
}

fn drain_com1(cons: &Console) {
    loop {
        let mut com = globals::COM1.lock();
        if !com.data_ready() {
            break;
        }
        let b = com.read_byte();
        drop(com);
        input_byte(cons, com_translate(b));
    }
}

/// The long-running owner of the console: waits on either interrupt line,
/// drains the device, and reopens the IOAPIC line it consumed.
pub async fn console_daemon() {
    let cons = globals::cons();
    loop {
        let kbd = irq::irq_wait(INT_KBD);
        let com = irq::irq_wait(INT_COM1);
        match future::select(kbd, com).await {
            Either::Left(((), _)) => {
                drain_keyboard(cons);
                irq::irq_eoi(IRQ_KBD);
            }
            Either::Right(((), _)) => {
                drain_com1(cons);
                irq::irq_eoi(IRQ_COM1);
            }
        }
    }
}

/// Bring the console up: create the singleton, spawn the daemon, discard
/// stale device bytes, and open the interrupt lines.
pub fn console_init(ex: &mut Executor) -> &'static Console {
    let cons = globals::init_cons(Console::new());
    ex.spawn(Task::new(console_daemon()));

    // clear whatever the devices latched before we listened
    while ps2_ready() {
        unsafe { io::inb(PS2_DATA) };
    }
    {
        let mut com = globals::COM1.lock();
        while com.data_ready() {
            com.read_byte();
        }
    }

    irq::irq_unmask(IRQ_KBD);
    irq::irq_unmask(IRQ_COM1);
    cons
}

/// The console device description behind stdin/stdout/stderr.
pub struct ConsoleFops {
    cons: &'static Console,
}

impl ConsoleFops {
    pub fn new(cons: &'static Console) -> ConsoleFops {
        ConsoleFops { cons }
    }
}

impl FileOps for ConsoleFops {
    fn read(&self, dst: &mut dyn UserIo) -> KResult<usize> {
        let mut chunk = [0u8; 128];
        let want = dst.remain().min(chunk.len());
        match self.cons.try_read(want) {
            Some(bytes) => {
                chunk[..bytes.len()].copy_from_slice(&bytes);
                dst.write(&chunk[..bytes.len()])
            }
            None => Err(KErr::Eagain),
        }
    }

    fn write(&self, src: &mut dyn UserIo) -> KResult<usize> {
        let mut chunk = [0u8; 128];
        let mut done = 0;
        loop {
            let n = src.read(&mut chunk)?;
            if n == 0 {
                return Ok(done);
            }
            for &c in &chunk[..n] {
                echo(c);
            }
            done += n;
        }
    }

    /// The console is a singleton device; duplicating a handle to it always
    /// succeeds.
    fn reopen(&self) -> KResult<()> {
        Ok(())
    }

    fn poll(&self, pm: PollMsg) -> KResult<Ready> {
        Ok(self.cons.poll(pm))
    }
}

/// stdin, stdout, stderr for the first process.
pub fn std_fds(cons: &'static Console) -> [Option<Fd>; 3] {
    let fops: Arc<dyn FileOps> = Arc::new(ConsoleFops::new(cons));
    [
        Some(Fd::new(fops.clone(), FdPerms::READ)),
        Some(Fd::new(fops.clone(), FdPerms::WRITE)),
        Some(Fd::new(fops, FdPerms::WRITE)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use futures_util::task::ArcWake;

    struct CountingWaker(AtomicUsize);

    impl ArcWake for CountingWaker {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_waker() -> (Arc<CountingWaker>, Waker) {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = futures_util::task::waker(counter.clone());
        (counter, waker)
    }

    #[test]
    fn scan_codes_resolve_like_a_pc_keyboard() {
        assert_eq!(scancode_to_ascii(0x23), Some(b'h'));
        assert_eq!(scancode_to_ascii(0x17), Some(b'i'));
        assert_eq!(scancode_to_ascii(0x1C), Some(b'\n'));
        // a modifier (left shift) has no printable mapping
        assert_eq!(scancode_to_ascii(0x2A), None);
        // break codes are out of table range
        assert_eq!(scancode_to_ascii(0x9E), None);
    }

    #[test]
    fn com_stream_fixups() {
        assert_eq!(com_translate(b'\r'), b'\n');
        assert_eq!(com_translate(0x7F), 0x08);
        assert_eq!(com_translate(b'x'), b'x');
    }

    #[test]
    fn reader_sees_hi_newline() {
        let mut st = ConsState::new();
        st.on_scancode(0x23);
        st.on_scancode(0x17);
        st.on_scancode(0x1C);
        assert_eq!(st.read(10), b"hi\n");
        assert!(st.is_empty());
    }

    #[test]
    fn bytes_come_back_in_arrival_order() {
        let mut st = ConsState::new();
        for c in b"abcdef" {
            st.push(*c);
        }
        st.on_com_byte(b'\r');
        assert_eq!(st.read(3), b"abc");
        assert_eq!(st.read(100), b"def\n");
    }

    #[test]
    fn overflow_drops_not_reorders() {
        let mut st = ConsState::new();
        for i in 0..(CONS_BUF_CAP + 7) {
            st.push((i % 251) as u8);
        }
        assert_eq!(st.len(), CONS_BUF_CAP);
        assert_eq!(st.dropped(), 7);
        // the survivors are the oldest bytes, still in order
        let first = st.read(4);
        assert_eq!(first, alloc::vec![0u8, 1, 2, 3]);
    }

    #[test]
    fn pollers_subscribed_while_empty_all_wake_on_arrival() {
        let mut st = ConsState::new();
        let (c1, w1) = counting_waker();
        let (c2, w2) = counting_waker();

        for waker in [w1, w2] {
            let got = st.poll(PollMsg {
                events: Ready::READ,
                dowait: true,
                waker: Some(waker),
            });
            assert_eq!(got, Ready::empty());
        }

        st.push(b'x');
        assert_eq!(c1.0.load(Ordering::SeqCst), 1);
        assert_eq!(c2.0.load(Ordering::SeqCst), 1);

        // with data queued, polling reports readiness instead of parking
        let (c3, w3) = counting_waker();
        let got = st.poll(PollMsg {
            events: Ready::READ,
            dowait: true,
            waker: Some(w3),
        });
        assert_eq!(got, Ready::READ);
        assert_eq!(c3.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn poll_for_write_only_reports_nothing() {
        let mut st = ConsState::new();
        st.push(b'x');
        let got = st.poll(PollMsg {
            events: Ready::WRITE,
            dowait: true,
            waker: None,
        });
        assert_eq!(got, Ready::empty());
    }

    #[test]
    fn async_read_delivers_exactly_once() {
        let cons: &'static Console = alloc::boxed::Box::leak(alloc::boxed::Box::new(Console::new()));
        static GOT: Mutex<Vec<u8>> = Mutex::new(Vec::new());
        GOT.lock().clear();

        let mut ex = Executor::new();
        ex.spawn(Task::new(async move {
            let bytes = cons.read(10).await;
            GOT.lock().extend_from_slice(&bytes);
        }));

        // nothing buffered yet: the reader parks
        ex.run_until_idle();
        assert!(GOT.lock().is_empty());
        assert_eq!(ex.live_tasks(), 1);

        cons.push_scancode(0x23);
        cons.push_scancode(0x17);
        cons.push_scancode(0x1C);
        ex.run_until_idle();
        assert_eq!(GOT.lock().as_slice(), b"hi\n");
        assert_eq!(ex.live_tasks(), 0);
        // the reply consumed the bytes
        assert!(cons.try_read(10).is_none());
    }
}
