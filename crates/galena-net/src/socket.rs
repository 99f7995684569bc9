//! Non-blocking TCP socket with framing, fair send queueing and deferred
//! close.
//!
//! State machine:
//!
//! ```text
//! closed → connecting → connected → (closing →) closed
//!               ↘          ↘
//!                 failed (terminal)
//! ```
//!
//! Sends are framed with a [`NetHeader`], checksummed per the configured
//! kind, and queued in a [`FairSendQueue`]; the queue is flushed with
//! vectored writes whenever the socket is writable. Closing a socket with
//! queued data defers the actual close behind a short timer so the tail of
//! the send queue still reaches the peer before FIN.

use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};

use galena_types::SegmentId;

use crate::datagram::{checksum_failed, datagram_checksum, ChecksumKind, Datagram, NetHeader};
use crate::fair_queue::FairSendQueue;
use crate::{NetError, NetResult, NET_HEADER_SIZE};

/// Cap on queued outbound bytes per socket. Retransmission is the upper
/// layers' job; the queue only has to absorb short writability gaps.
pub const MAX_SEND_Q_BYTES: usize = 1 << 25; // 32 MiB

/// How long a closing socket may keep draining its send queue.
pub const DEFERRED_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest datagram the transport will accept from upper layers.
pub const MTU: usize = 1 << 15;

/// Socket lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Closed,
    Connecting,
    Connected,
    Closing,
    Failed,
}

/// Userspace send-queue statistics for a socket.
#[derive(Debug, Clone, Default)]
pub struct SocketStats {
    pub send_queue_length: usize,
    pub send_queue_bytes: usize,
    pub send_queue_segments: Vec<(SegmentId, usize)>,
}

/// What a readability event produced.
#[derive(Debug, Default)]
pub struct RecvOutcome {
    /// Complete, checksum-verified frames.
    pub frames: Vec<Datagram>,
    /// The peer closed its end.
    pub eof: bool,
}

/// A framed, fair-queued TCP socket.
pub struct TcpSocket {
    stream: Option<TcpStream>,
    token: Token,
    state: SocketState,
    checksum: ChecksumKind,
    send_q: FairSendQueue,
    /// Bytes of the front datagram already written.
    front_written: usize,
    recv_buf: BytesMut,
}

impl TcpSocket {
    /// Starts a non-blocking connect.
    pub fn connect(addr: SocketAddr, token: Token, checksum: ChecksumKind) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        tracing::debug!(?addr, ?token, "connecting");
        Ok(Self {
            stream: Some(stream),
            token,
            state: SocketState::Connecting,
            checksum,
            send_q: FairSendQueue::new(),
            front_written: 0,
            recv_buf: BytesMut::with_capacity(MTU),
        })
    }

    /// Wraps a stream handed out by an acceptor.
    pub fn from_accepted(stream: TcpStream, token: Token, checksum: ChecksumKind) -> Self {
        Self {
            stream: Some(stream),
            token,
            state: SocketState::Connected,
            checksum,
            send_q: FairSendQueue::new(),
            front_written: 0,
            recv_buf: BytesMut::with_capacity(MTU),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    pub fn stats(&self) -> SocketStats {
        SocketStats {
            send_queue_length: self.send_q.len(),
            send_queue_bytes: self.send_q.queued_bytes(),
            send_queue_segments: self.send_q.segments(),
        }
    }

    /// The interest set matching the current state and queue.
    pub fn interest(&self) -> Interest {
        match self.state {
            SocketState::Connecting => Interest::WRITABLE,
            _ if !self.send_q.is_empty() => Interest::READABLE | Interest::WRITABLE,
            _ => Interest::READABLE,
        }
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        let interest = self.interest();
        match self.stream.as_mut() {
            Some(stream) => registry.register(stream, self.token, interest),
            None => Ok(()),
        }
    }

    pub fn reregister(&mut self, registry: &Registry) -> io::Result<()> {
        let interest = self.interest();
        match self.stream.as_mut() {
            Some(stream) => registry.reregister(stream, self.token, interest),
            None => Ok(()),
        }
    }

    /// Frames, checksums and queues a datagram from `segment`, then flushes
    /// opportunistically.
    ///
    /// Fails with [`NetError::WouldBlock`] when the queue is over its byte
    /// cap; the caller retries after the next writable event.
    pub fn send(&mut self, segment: SegmentId, mut dg: Datagram) -> NetResult<()> {
        if self.state != SocketState::Connected {
            return Err(NetError::NotConnected);
        }
        if self.send_q.queued_bytes() > MAX_SEND_Q_BYTES {
            return Err(NetError::WouldBlock);
        }

        let mut hdr = NetHeader::new(dg.len())?;
        if self.checksum != ChecksumKind::None {
            let crc = datagram_checksum(self.checksum, &dg, 0);
            hdr.set_crc32(crc, self.checksum);
        }
        dg.push_header(&hdr.serialize());

        self.send_q.push_back(segment, dg);
        self.flush()
    }

    /// Writes queued datagrams until the queue drains or the kernel pushes
    /// back.
    fn flush(&mut self) -> NetResult<()> {
        loop {
            let front_len = match self.send_q.front() {
                Some(front) => front.len(),
                None => return Ok(()),
            };

            let result = {
                let front = self.send_q.front().expect("front exists");
                let stream = self.stream.as_mut().ok_or(NetError::NotConnected)?;
                let header = front.header();
                let payload = front.payload();
                let skip = self.front_written;

                if skip < header.len() {
                    let slices = [IoSlice::new(&header[skip..]), IoSlice::new(payload)];
                    stream.write_vectored(&slices)
                } else {
                    stream.write(&payload[skip - header.len()..])
                }
            };

            match result {
                Ok(0) => {
                    self.state = SocketState::Failed;
                    return Err(NetError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    )));
                }
                Ok(n) => {
                    self.front_written += n;
                    debug_assert!(self.front_written <= front_len);
                    if self.front_written == front_len {
                        self.send_q.pop_front();
                        self.front_written = 0;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!(token = ?self.token, "write failed: {e}");
                    self.state = SocketState::Failed;
                    return Err(e.into());
                }
            }
        }
    }

    /// Handles a writable event: completes an in-flight connect, flushes the
    /// queue and finishes a deferred close once drained.
    pub fn on_writable(&mut self) -> NetResult<()> {
        if self.state == SocketState::Connecting {
            let stream = self.stream.as_ref().ok_or(NetError::NotConnected)?;
            match stream.take_error()? {
                Some(err) => {
                    tracing::warn!(token = ?self.token, "connect failed: {err}");
                    self.state = SocketState::Failed;
                    return Err(err.into());
                }
                None => {
                    // writability without a pending error means established
                    if stream.peer_addr().is_ok() {
                        tracing::debug!(token = ?self.token, "connected");
                        self.state = SocketState::Connected;
                    } else {
                        return Ok(());
                    }
                }
            }
        }

        self.flush()?;

        if self.state == SocketState::Closing && self.send_q.is_empty() {
            tracing::debug!(token = ?self.token, "send queue drained, closing");
            self.force_close();
        }
        Ok(())
    }

    /// Handles a readable event: drains the kernel buffer and extracts
    /// complete frames.
    ///
    /// Frame-level failures (bad version, bad flags, checksum mismatch) are
    /// errors; the caller drops the connection.
    pub fn on_readable(&mut self) -> NetResult<RecvOutcome> {
        let mut outcome = RecvOutcome::default();
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => {
                outcome.eof = true;
                return Ok(outcome);
            }
        };

        let mut temp = [0u8; 4096];
        loop {
            match stream.read(&mut temp) {
                Ok(0) => {
                    outcome.eof = true;
                    break;
                }
                Ok(n) => self.recv_buf.extend_from_slice(&temp[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.state = SocketState::Failed;
                    return Err(e.into());
                }
            }
        }

        // frame completion: an 8-byte header first, then its body
        while self.recv_buf.len() >= NET_HEADER_SIZE {
            let hdr = NetHeader::parse(&self.recv_buf[..NET_HEADER_SIZE])?;
            let total = NET_HEADER_SIZE + hdr.len();
            if self.recv_buf.len() < total {
                break;
            }

            let mut frame = self.recv_buf.split_to(total);
            let body = frame.split_off(NET_HEADER_SIZE).freeze();
            let dg = Datagram::new(body);

            if checksum_failed(&hdr, &dg) {
                tracing::warn!(token = ?self.token, "frame checksum mismatch, dropping frame");
                return Err(NetError::ChecksumMismatch);
            }
            outcome.frames.push(dg);
        }

        Ok(outcome)
    }

    /// Initiates close. With queued data the socket enters `Closing` and the
    /// returned duration must be scheduled as a timer; otherwise the socket
    /// closes immediately.
    pub fn close(&mut self) -> Option<Duration> {
        match self.state {
            SocketState::Closed | SocketState::Failed => {
                self.stream = None;
                None
            }
            _ if self.send_q.is_empty() => {
                self.force_close();
                None
            }
            _ => {
                tracing::debug!(
                    token = ?self.token,
                    queued = self.send_q.queued_bytes(),
                    "deferring close until send queue drains"
                );
                self.state = SocketState::Closing;
                Some(DEFERRED_CLOSE_TIMEOUT)
            }
        }
    }

    /// Deferred-close timer expiry: give up on the remaining queue.
    pub fn on_deferred_close(&mut self) {
        if self.state == SocketState::Closing {
            if !self.send_q.is_empty() {
                tracing::warn!(
                    token = ?self.token,
                    queued = self.send_q.queued_bytes(),
                    "deferred close expired with data still queued"
                );
            }
            self.force_close();
        }
    }

    /// Drops the stream (closing the descriptor) and all pending state.
    pub fn force_close(&mut self) {
        self.state = SocketState::Closed;
        self.stream = None;
        while self.send_q.pop_front().is_some() {}
        self.front_written = 0;
    }
}

/// Listening socket handing out [`TcpSocket`]s.
pub struct TcpAcceptor {
    listener: TcpListener,
    token: Token,
}

impl TcpAcceptor {
    pub fn bind(addr: SocketAddr, token: Token) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        tracing::info!(?addr, "listening");
        Ok(Self { listener, token })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.listener, self.token, Interest::READABLE)
    }

    /// Accepts one pending connection; `None` when the backlog is empty.
    pub fn accept(&mut self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        match self.listener.accept() {
            Ok((stream, addr)) => Ok(Some((stream, addr))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Instant;

    /// Connected non-blocking loopback pair: (mio socket, std peer).
    fn socket_pair(checksum: ChecksumKind) -> (TcpSocket, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let (peer, _) = listener.accept().unwrap();

        let stream = TcpStream::from_std(client);
        let sock = TcpSocket::from_accepted(stream, Token(7), checksum);
        (sock, peer)
    }

    fn read_exact_retry(peer: &mut std::net::TcpStream, len: usize) -> Vec<u8> {
        peer.set_nonblocking(false).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = vec![0u8; len];
        peer.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_send_frames_and_checksums() {
        let (mut sock, mut peer) = socket_pair(ChecksumKind::Crc32c);

        let mut dg = Datagram::new(Bytes::from_static(b"hello cluster"));
        dg.push_header(b"EVS");
        let body_len = dg.len();
        sock.send(0, dg).unwrap();

        let frame = read_exact_retry(&mut peer, NET_HEADER_SIZE + body_len);
        let hdr = NetHeader::parse(&frame[..NET_HEADER_SIZE]).unwrap();
        assert_eq!(hdr.len(), body_len);
        assert!(hdr.has_crc32c());

        let body = Datagram::new(Bytes::copy_from_slice(&frame[NET_HEADER_SIZE..]));
        assert!(!checksum_failed(&hdr, &body));
        assert_eq!(&frame[NET_HEADER_SIZE..NET_HEADER_SIZE + 3], b"EVS");
    }

    #[test]
    fn test_receive_reassembles_frames() {
        let (mut sock, mut peer) = socket_pair(ChecksumKind::Crc32);

        // peer sends two frames back to back, the second in two chunks
        let mut frame = Vec::new();
        for payload in [&b"first"[..], &b"second message"[..]] {
            let dg = Datagram::new(Bytes::copy_from_slice(payload));
            let mut hdr = NetHeader::new(dg.len()).unwrap();
            hdr.set_crc32(datagram_checksum(ChecksumKind::Crc32, &dg, 0), ChecksumKind::Crc32);
            frame.extend_from_slice(&hdr.serialize());
            frame.extend_from_slice(payload);
        }

        peer.set_nonblocking(false).unwrap();
        let split = frame.len() - 5;
        peer.write_all(&frame[..split]).unwrap();
        peer.flush().unwrap();

        // first frame completes, the partial second one waits
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut frames = Vec::new();
        while frames.len() < 1 && Instant::now() < deadline {
            frames.extend(sock.on_readable().unwrap().frames);
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload().as_ref(), b"first");

        peer.write_all(&frame[split..]).unwrap();
        peer.flush().unwrap();

        while frames.len() < 2 && Instant::now() < deadline {
            frames.extend(sock.on_readable().unwrap().frames);
        }
        assert_eq!(frames[1].payload().as_ref(), b"second message");
    }

    #[test]
    fn test_corrupt_frame_rejected() {
        let (mut sock, mut peer) = socket_pair(ChecksumKind::Crc32c);

        let payload = b"integrity matters";
        let dg = Datagram::new(Bytes::copy_from_slice(payload));
        let mut hdr = NetHeader::new(dg.len()).unwrap();
        hdr.set_crc32(
            datagram_checksum(ChecksumKind::Crc32c, &dg, 0),
            ChecksumKind::Crc32c,
        );

        let mut frame = hdr.serialize().to_vec();
        frame.extend_from_slice(payload);
        let last = frame.len() - 1;
        frame[last] ^= 0x01;

        peer.set_nonblocking(false).unwrap();
        peer.write_all(&frame).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match sock.on_readable() {
                Ok(outcome) => {
                    assert!(outcome.frames.is_empty());
                    assert!(Instant::now() < deadline, "corruption never detected");
                }
                Err(NetError::ChecksumMismatch) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    #[test]
    fn test_bad_version_rejected() {
        let (mut sock, mut peer) = socket_pair(ChecksumKind::None);

        let mut frame = NetHeader::new(4).unwrap().serialize().to_vec();
        frame[3] |= 0x20; // version 2
        frame.extend_from_slice(b"abcd");

        peer.set_nonblocking(false).unwrap();
        peer.write_all(&frame).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match sock.on_readable() {
                Ok(_) => assert!(Instant::now() < deadline, "bad version never detected"),
                Err(NetError::ProtocolVersion { version: 2 }) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    #[test]
    fn test_peer_close_is_eof() {
        let (mut sock, peer) = socket_pair(ChecksumKind::None);
        drop(peer);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let outcome = sock.on_readable().unwrap();
            if outcome.eof {
                break;
            }
            assert!(Instant::now() < deadline, "eof never observed");
        }
    }

    #[test]
    fn test_immediate_close_with_empty_queue() {
        let (mut sock, _peer) = socket_pair(ChecksumKind::None);
        assert_eq!(sock.close(), None);
        assert_eq!(sock.state(), SocketState::Closed);
    }

    #[test]
    fn test_deferred_close_drains_queue() {
        let (mut sock, mut peer) = socket_pair(ChecksumKind::None);

        // stuff the kernel buffer until data backs up in the send queue
        let chunk = Bytes::from(vec![0x5a; 1 << 20]);
        for _ in 0..40 {
            sock.send(0, Datagram::new(chunk.clone())).unwrap();
            if sock.stats().send_queue_bytes > 0 {
                break;
            }
        }
        assert!(sock.stats().send_queue_bytes > 0, "queue never backed up");

        // close defers while the queue drains
        let timeout = sock.close().expect("close must be deferred");
        assert_eq!(timeout, DEFERRED_CLOSE_TIMEOUT);
        assert_eq!(sock.state(), SocketState::Closing);

        // sends are refused while closing
        assert!(matches!(
            sock.send(0, Datagram::new(Bytes::from_static(b"x"))),
            Err(NetError::NotConnected)
        ));

        // peer drains; writable events complete the close
        peer.set_nonblocking(false).unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let mut sink = vec![0u8; 1 << 16];
        let deadline = Instant::now() + Duration::from_secs(10);
        while sock.state() == SocketState::Closing {
            let _ = peer.read(&mut sink);
            sock.on_writable().unwrap();
            assert!(Instant::now() < deadline, "close never completed");
        }
        assert_eq!(sock.state(), SocketState::Closed);
    }

    #[test]
    fn test_deferred_close_expiry_forces_close() {
        let (mut sock, _peer) = socket_pair(ChecksumKind::None);

        let chunk = Bytes::from(vec![0x5a; 1 << 20]);
        for _ in 0..40 {
            sock.send(0, Datagram::new(chunk.clone())).unwrap();
            if sock.stats().send_queue_bytes > 0 {
                break;
            }
        }
        sock.close().expect("deferred");
        sock.on_deferred_close();
        assert_eq!(sock.state(), SocketState::Closed);
        assert_eq!(sock.stats().send_queue_bytes, 0);
    }

    #[test]
    fn test_send_queue_byte_cap() {
        let (mut sock, _peer) = socket_pair(ChecksumKind::None);

        let chunk = Bytes::from(vec![0u8; MTU]);
        let mut hit_cap = false;
        for _ in 0..(MAX_SEND_Q_BYTES / MTU + 64) {
            match sock.send(0, Datagram::new(chunk.clone())) {
                Ok(()) => {}
                Err(NetError::WouldBlock) => {
                    hit_cap = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(hit_cap, "byte cap never enforced");
    }

    #[test]
    fn test_acceptor_hands_out_connected_sockets() {
        let mut acceptor =
            TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), Token(0)).unwrap();
        let addr = acceptor.local_addr().unwrap();

        assert!(acceptor.accept().unwrap().is_none());

        let _client = std::net::TcpStream::connect(addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let accepted = loop {
            if let Some(pair) = acceptor.accept().unwrap() {
                break pair;
            }
            assert!(Instant::now() < deadline, "accept never completed");
        };

        let sock = TcpSocket::from_accepted(accepted.0, Token(1), ChecksumKind::Crc32c);
        assert_eq!(sock.state(), SocketState::Connected);
    }
}
