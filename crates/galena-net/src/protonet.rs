//! The poll-based reactor driving sockets, timers and protocol stacks.
//!
//! One `Protonet` owns a set of protocol stacks and a set of sockets and
//! runs a single-threaded cooperative event loop: it sleeps in the OS
//! multiplexer until the next socket event or timer deadline, dispatches
//! socket events upward into every stack, and fires one-shot timers
//! (deferred closes, stack timers).
//!
//! Cross-thread interaction is limited to [`InterruptHandle::interrupt`]
//! (wakes the multiplexer and makes the current `event_loop` call return)
//! and the [`Protonet::enter`] reentrant critical section, which upper
//! layers hold while manipulating stack state from outside the reactor.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::{Events, Poll, Token, Waker};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use galena_types::SegmentId;

use crate::datagram::{ChecksumKind, Datagram};
use crate::protostack::{ProtoUpMeta, Protostack, SocketId};
use crate::socket::{SocketState, SocketStats, TcpAcceptor, TcpSocket, MTU};
use crate::{NetError, NetResult};

const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Error code surfaced upward for orderly end-of-stream.
const CODE_EOF: i32 = 0;
/// Error code surfaced upward for protocol-level frame rejection.
const CODE_PROTO: i32 = 71; // EPROTO
/// Fallback for I/O errors without an OS code.
const CODE_IO: i32 = 5; // EIO

fn error_code(err: &NetError) -> i32 {
    match err {
        NetError::Io(e) => e.raw_os_error().unwrap_or(CODE_IO),
        _ => CODE_PROTO,
    }
}

/// Wakes the reactor from another thread and interrupts `event_loop`.
#[derive(Clone)]
pub struct InterruptHandle {
    waker: Arc<Waker>,
    interrupted: Arc<AtomicBool>,
}

impl InterruptHandle {
    /// Causes the current (or next) `event_loop` call to return at its next
    /// iteration.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

/// The protocol-stack dispatcher and I/O reactor.
pub struct Protonet {
    poll: Poll,
    waker: Arc<Waker>,
    interrupted: Arc<AtomicBool>,
    critical: ReentrantMutex<()>,
    sockets: HashMap<Token, TcpSocket>,
    acceptors: HashMap<Token, TcpAcceptor>,
    stacks: Vec<Protostack>,
    /// One-shot deferred-close timers.
    timers: BinaryHeap<Reverse<(Instant, Token)>>,
    accepted: Vec<Token>,
    next_token: usize,
    checksum: ChecksumKind,
}

impl Protonet {
    pub fn new(checksum: ChecksumKind) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            waker,
            interrupted: Arc::new(AtomicBool::new(false)),
            critical: ReentrantMutex::new(()),
            sockets: HashMap::new(),
            acceptors: HashMap::new(),
            stacks: Vec::new(),
            timers: BinaryHeap::new(),
            accepted: Vec::new(),
            next_token: 0,
            checksum,
        })
    }

    /// Largest datagram upper layers may hand to [`Protonet::send`].
    pub fn mtu(&self) -> usize {
        MTU
    }

    /// A handle for breaking the event loop from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            waker: Arc::clone(&self.waker),
            interrupted: Arc::clone(&self.interrupted),
        }
    }

    /// Enters the reactor critical section; reentrant from the same thread.
    /// Dropping the guard leaves it.
    pub fn enter(&self) -> ReentrantMutexGuard<'_, ()> {
        self.critical.lock()
    }

    /// Adds a protocol stack; all socket events are dispatched to every
    /// stack.
    pub fn push_stack(&mut self, stack: Protostack) -> usize {
        self.stacks.push(stack);
        self.stacks.len() - 1
    }

    pub fn pop_stack(&mut self) -> Option<Protostack> {
        self.stacks.pop()
    }

    pub fn stack_mut(&mut self, index: usize) -> Option<&mut Protostack> {
        self.stacks.get_mut(index)
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Starts a non-blocking connect; the socket reaches `Connected` (or
    /// `Failed`) inside the event loop.
    pub fn connect(&mut self, addr: SocketAddr) -> NetResult<Token> {
        let token = self.alloc_token();
        let mut socket = TcpSocket::connect(addr, token, self.checksum)?;
        socket.register(self.poll.registry())?;
        self.sockets.insert(token, socket);
        Ok(token)
    }

    /// Binds a listening socket.
    pub fn listen(&mut self, addr: SocketAddr) -> NetResult<Token> {
        let token = self.alloc_token();
        let mut acceptor = TcpAcceptor::bind(addr, token)?;
        acceptor.register(self.poll.registry())?;
        self.acceptors.insert(token, acceptor);
        Ok(token)
    }

    pub fn listen_addr(&self, token: Token) -> Option<SocketAddr> {
        self.acceptors.get(&token).and_then(|a| a.local_addr().ok())
    }

    pub fn socket_state(&self, token: Token) -> Option<SocketState> {
        self.sockets.get(&token).map(TcpSocket::state)
    }

    pub fn socket_stats(&self, token: Token) -> Option<SocketStats> {
        self.sockets.get(&token).map(TcpSocket::stats)
    }

    /// Tokens of connections accepted since the last call.
    pub fn take_accepted(&mut self) -> Vec<Token> {
        std::mem::take(&mut self.accepted)
    }

    /// Sends a datagram on a socket, queued fairly under `segment`.
    pub fn send(&mut self, token: Token, segment: SegmentId, dg: Datagram) -> NetResult<()> {
        let socket = self.sockets.get_mut(&token).ok_or(NetError::NotConnected)?;
        let result = socket.send(segment, dg);
        socket.reregister(self.poll.registry())?;
        result
    }

    /// Closes a socket. With queued outbound data the close is deferred
    /// behind a timer while the queue drains.
    pub fn close(&mut self, token: Token) -> NetResult<()> {
        if let Some(socket) = self.sockets.get_mut(&token) {
            match socket.close() {
                Some(timeout) => {
                    socket.reregister(self.poll.registry())?;
                    self.timers.push(Reverse((Instant::now() + timeout, token)));
                }
                None => {
                    self.sockets.remove(&token);
                }
            }
        }
        Ok(())
    }

    /// Fires due timers and returns the earliest pending deadline.
    pub fn handle_timers(&mut self, now: Instant) -> Option<Instant> {
        while let Some(Reverse((deadline, token))) = self.timers.peek().copied() {
            if deadline > now {
                break;
            }
            self.timers.pop();
            if let Some(socket) = self.sockets.get_mut(&token) {
                if socket.state() == SocketState::Closing {
                    socket.on_deferred_close();
                }
                if matches!(socket.state(), SocketState::Closed | SocketState::Failed) {
                    self.sockets.remove(&token);
                }
            }
        }

        let stack_next = self
            .stacks
            .iter_mut()
            .filter_map(|s| s.handle_timers(now))
            .min();
        let timer_next = self.timers.peek().map(|Reverse((deadline, _))| *deadline);

        match (stack_next, timer_next) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Dispatches events until `period` has passed or the loop is
    /// interrupted.
    pub fn event_loop(&mut self, period: Duration) -> NetResult<()> {
        let until = Instant::now() + period;
        self.interrupted.store(false, Ordering::SeqCst);
        let mut events = Events::with_capacity(256);

        loop {
            let now = Instant::now();
            if now >= until || self.interrupted.load(Ordering::SeqCst) {
                return Ok(());
            }

            let next_deadline = self.handle_timers(now);
            let mut timeout = until.saturating_duration_since(now);
            if let Some(deadline) = next_deadline {
                timeout = timeout.min(deadline.saturating_duration_since(now));
            }

            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            let fired: Vec<(Token, bool, bool)> = events
                .iter()
                .map(|event| (event.token(), event.is_readable(), event.is_writable()))
                .collect();

            for (token, readable, writable) in fired {
                if token == WAKER_TOKEN {
                    continue;
                }
                if self.acceptors.contains_key(&token) {
                    self.handle_accept(token)?;
                } else {
                    self.handle_socket_event(token, readable, writable)?;
                }
            }
        }
    }

    fn handle_accept(&mut self, token: Token) -> NetResult<()> {
        loop {
            let accepted = {
                let acceptor = self.acceptors.get_mut(&token).expect("acceptor exists");
                acceptor.accept()?
            };
            let Some((stream, addr)) = accepted else {
                return Ok(());
            };

            let sock_token = self.alloc_token();
            let mut socket = TcpSocket::from_accepted(stream, sock_token, self.checksum);
            socket.register(self.poll.registry())?;
            self.sockets.insert(sock_token, socket);
            self.accepted.push(sock_token);
            tracing::debug!(?addr, token = ?sock_token, "accepted connection");
        }
    }

    fn handle_socket_event(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
    ) -> NetResult<()> {
        let Some(socket) = self.sockets.get_mut(&token) else {
            return Ok(());
        };

        let mut frames = Vec::new();
        let mut eof = false;
        let mut failure = None;

        if readable {
            match socket.on_readable() {
                Ok(outcome) => {
                    frames = outcome.frames;
                    eof = outcome.eof;
                }
                Err(err) => {
                    tracing::warn!(?token, "receive failed: {err}");
                    failure = Some(error_code(&err));
                }
            }
        }

        if writable && failure.is_none() {
            if let Err(err) = socket.on_writable() {
                tracing::warn!(?token, "write path failed: {err}");
                failure = Some(error_code(&err));
            }
        }

        let gone = matches!(
            socket.state(),
            SocketState::Closed | SocketState::Failed
        );

        let id: SocketId = token.0;
        for dg in frames {
            self.dispatch(id, dg, &ProtoUpMeta::Data);
        }

        if let Some(code) = failure {
            self.dispatch(id, Datagram::new(Bytes::new()), &ProtoUpMeta::Error { code });
            if let Some(mut socket) = self.sockets.remove(&token) {
                socket.force_close();
            }
        } else if eof {
            self.dispatch(
                id,
                Datagram::new(Bytes::new()),
                &ProtoUpMeta::Error { code: CODE_EOF },
            );
            if let Some(mut socket) = self.sockets.remove(&token) {
                socket.force_close();
            }
        } else if gone {
            self.sockets.remove(&token);
        } else if let Some(socket) = self.sockets.get_mut(&token) {
            socket.reregister(self.poll.registry())?;
        }

        Ok(())
    }

    /// Dispatches an upward event into every stack.
    fn dispatch(&mut self, id: SocketId, dg: Datagram, meta: &ProtoUpMeta) {
        for stack in &mut self.stacks {
            stack.dispatch(id, dg.clone(), meta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protostack::{ProtoDownMeta, Protolay};
    use parking_lot::Mutex;

    type Captured = Arc<Mutex<Vec<(SocketId, ProtoUpMeta, Vec<u8>)>>>;

    struct CaptureLayer {
        captured: Captured,
    }

    impl Protolay for CaptureLayer {
        fn handle_up(&mut self, id: SocketId, dg: Datagram, meta: &ProtoUpMeta) -> Option<Datagram> {
            self.captured
                .lock()
                .push((id, *meta, dg.payload().to_vec()));
            Some(dg)
        }

        fn handle_down(
            &mut self,
            dg: Datagram,
            _meta: &ProtoDownMeta,
        ) -> NetResult<Option<Datagram>> {
            Ok(Some(dg))
        }
    }

    fn net_with_capture() -> (Protonet, Captured) {
        let mut net = Protonet::new(ChecksumKind::Crc32c).unwrap();
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let mut stack = Protostack::new();
        stack.push_proto(Box::new(CaptureLayer {
            captured: Arc::clone(&captured),
        }));
        net.push_stack(stack);
        (net, captured)
    }

    fn run_until(net: &mut Protonet, mut done: impl FnMut(&mut Protonet) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            net.event_loop(Duration::from_millis(20)).unwrap();
            if done(net) {
                return;
            }
        }
        panic!("condition not reached within deadline");
    }

    #[test]
    fn test_frame_roundtrip_through_reactor() {
        let (mut net, captured) = net_with_capture();

        let listener = net.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = net.listen_addr(listener).unwrap();
        let client = net.connect(addr).unwrap();

        run_until(&mut net, |net| {
            net.socket_state(client) == Some(SocketState::Connected)
        });

        let mut dg = Datagram::new(Bytes::from_static(b"replicate me"));
        dg.push_header(b"HDR!");
        net.send(client, 0, dg).unwrap();

        run_until(&mut net, |_| !captured.lock().is_empty());

        let captured = captured.lock();
        let (_, meta, payload) = &captured[0];
        assert_eq!(*meta, ProtoUpMeta::Data);
        // the frame body is header bytes followed by payload
        assert_eq!(payload.as_slice(), b"HDR!replicate me");
    }

    #[test]
    fn test_peer_close_surfaces_error_meta() {
        let (mut net, captured) = net_with_capture();

        let listener = net.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = net.listen_addr(listener).unwrap();
        let client = net.connect(addr).unwrap();

        let mut got_accept = false;
        run_until(&mut net, |net| {
            got_accept |= !net.take_accepted().is_empty();
            got_accept && net.socket_state(client) == Some(SocketState::Connected)
        });

        net.close(client).unwrap();
        assert_eq!(net.socket_state(client), None);

        // the accepted side observes EOF as an error up-call
        run_until(&mut net, |_| {
            captured
                .lock()
                .iter()
                .any(|(_, meta, _)| *meta == ProtoUpMeta::Error { code: CODE_EOF })
        });
    }

    #[test]
    fn test_interrupt_breaks_event_loop() {
        let (mut net, _captured) = net_with_capture();
        let handle = net.interrupt_handle();

        let interruptor = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.interrupt();
        });

        let start = Instant::now();
        net.event_loop(Duration::from_secs(30)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
        interruptor.join().unwrap();
    }

    #[test]
    fn test_enter_is_reentrant() {
        let (net, _captured) = net_with_capture();
        let _outer = net.enter();
        let _inner = net.enter();
    }

    #[test]
    fn test_corrupt_frame_drops_connection() {
        use std::io::Write;

        let (mut net, captured) = net_with_capture();
        let listener = net.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = net.listen_addr(listener).unwrap();

        // raw peer bypassing the transport's checksumming
        let mut peer = std::net::TcpStream::connect(addr).unwrap();
        let body = b"not checksummed";
        let mut hdr = crate::NetHeader::new(body.len()).unwrap();
        hdr.set_crc32(0xdead_beef, ChecksumKind::Crc32c); // wrong on purpose
        peer.write_all(&hdr.serialize()).unwrap();
        peer.write_all(body).unwrap();
        peer.flush().unwrap();

        run_until(&mut net, |_| {
            captured
                .lock()
                .iter()
                .any(|(_, meta, _)| *meta == ProtoUpMeta::Error { code: CODE_PROTO })
        });

        // no data frame must have been surfaced
        assert!(captured
            .lock()
            .iter()
            .all(|(_, meta, _)| *meta != ProtoUpMeta::Data));
    }
}
