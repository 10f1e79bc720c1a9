//! Framed, flow-controlled messaging over a stream socket.
//!
//! Messages are four bytes of big-endian length followed by `length` bytes
//! of payload whose last byte must be NUL. Output is queued and flushed
//! non-blockingly; while the output queue is non-empty the connection's
//! readable registration is dropped, so input is only accepted when a reply
//! can be sent. That suspension is the back-pressure primitive everything
//! above (session, directory scanner) leans on.

use std::collections::VecDeque;
use std::io;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;

use log::debug;
use log::error;

use crate::scheduler::Scheduler;
use crate::scheduler::Token;

/// Maximum payload: a path plus a small envelope.
pub const MAX_MSG_SIZE: usize = libc::PATH_MAX as usize + 40;

const HDR: usize = 4;
// Bound on buffered input; poll is level-triggered, so anything left in the
// socket re-fires the readable handler.
const INBUF_CAP: usize = 4 * (HDR + MAX_MSG_SIZE);

/// Result of draining the socket's read side.
#[derive(Debug, Eq, PartialEq)]
pub enum Fill {
    /// More input may be buffered; frames can be taken.
    Data,
    /// The peer closed the connection (or it reset).
    Closed,
}

/// A framed connection. Owned by a client session or a remote-host proxy.
#[derive(Debug)]
pub struct NetFrame {
    fd: Option<OwnedFd>,
    token: Token,
    inbuf: Vec<u8>,
    outq: VecDeque<Vec<u8>>,
    // Bytes of the front output frame already written.
    sent: usize,
    iready: bool,
    oready: bool,
}

impl NetFrame {
    /// Take ownership of a connected socket, switch it to non-blocking
    /// mode and register for input.
    pub fn new(fd: OwnedFd, token: Token, sched: &mut Scheduler) -> io::Result<NetFrame> {
        set_nonblocking(&fd)?;
        let prev = sched.install_read(fd.as_raw_fd(), token);
        debug_assert!(prev.is_none());
        Ok(NetFrame {
            fd: Some(fd),
            token,
            inbuf: Vec::new(),
            outq: VecDeque::new(),
            sent: 0,
            iready: true,
            oready: true,
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1)
    }

    pub fn is_closed(&self) -> bool {
        self.fd.is_none()
    }

    /// Whether the output queue is empty: the session's "ready for
    /// events" predicate.
    pub fn ready_for_output(&self) -> bool {
        self.oready
    }

    /// Whether buffered frames may be delivered right now.
    pub fn deliverable(&self) -> bool {
        self.fd.is_some() && self.iready && self.oready
    }

    /// Enqueue a framed message and try to flush it. The payload must
    /// already carry its trailing NUL.
    pub fn send(&mut self, sched: &mut Scheduler, payload: &[u8]) {
        if self.fd.is_none() {
            return;
        }
        if payload.is_empty() || payload.len() > MAX_MSG_SIZE {
            error!("tried to send a message of {} bytes", payload.len());
            debug_assert!(false, "oversized or empty outbound message");
            return;
        }
        debug_assert_eq!(payload.last(), Some(&0));
        let mut msg = Vec::with_capacity(HDR + payload.len());
        msg.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        msg.extend_from_slice(payload);
        self.outq.push_back(msg);
        self.flush(sched);
    }

    /// Write as much queued output as the socket accepts. Returns true on
    /// the blocked→unblocked edge.
    pub fn flush(&mut self, sched: &mut Scheduler) -> bool {
        let Some(fd) = self.fd.as_ref() else {
            return false;
        };
        while let Some(front) = self.outq.front() {
            match nix::unistd::write(fd.as_fd(), &front[self.sent..]) {
                Ok(n) => {
                    self.sent += n;
                    if self.sent == front.len() {
                        self.outq.pop_front();
                        self.sent = 0;
                    }
                }
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::EPIPE) => {
                    // Normal race: the client closed before draining its
                    // cancel acknowledgements.
                    debug!("fd {} write error: EPIPE", fd.as_raw_fd());
                    self.outq.pop_front();
                    self.sent = 0;
                }
                Err(errno) => {
                    error!("fd {} write error: {}", fd.as_raw_fd(), errno);
                    self.outq.pop_front();
                    self.sent = 0;
                }
            }
        }
        let oready = self.outq.is_empty();
        self.update_handlers(sched, self.iready, oready)
    }

    /// Enable or disable input delivery (the session's scan queue uses
    /// this to pause clients with outstanding work).
    pub fn ready_for_input(&mut self, sched: &mut Scheduler, enabled: bool) {
        let oready = self.oready;
        self.update_handlers(sched, enabled, oready);
    }

    /// Read whatever the socket has. Frames are then taken one at a time
    /// with [`NetFrame::next_frame`].
    pub fn fill(&mut self) -> Fill {
        let Some(fd) = self.fd.as_ref() else {
            return Fill::Closed;
        };
        let mut chunk = [0u8; 4096];
        while self.inbuf.len() < INBUF_CAP {
            match nix::unistd::read(fd.as_fd(), &mut chunk) {
                Ok(0) => return Fill::Closed,
                Ok(n) => self.inbuf.extend_from_slice(&chunk[..n]),
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::ECONNRESET) => return Fill::Closed,
                Err(errno) => {
                    error!("fd {} read error: {}", fd.as_raw_fd(), errno);
                    return Fill::Closed;
                }
            }
        }
        Fill::Data
    }

    /// Parse one complete frame out of the input buffer.
    ///
    /// A declared length over the maximum, a zero length, or a payload not
    /// ending in NUL is a protocol violation; the caller must close the
    /// connection.
    pub fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.inbuf.len() < HDR {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.inbuf[0], self.inbuf[1], self.inbuf[2], self.inbuf[3]])
            as usize;
        if len == 0 || len > MAX_MSG_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message length {} exceeds max of {}", len, MAX_MSG_SIZE),
            ));
        }
        if self.inbuf.len() < HDR + len {
            return Ok(None);
        }
        let payload: Vec<u8> = self.inbuf[HDR..HDR + len].to_vec();
        self.inbuf.drain(..HDR + len);
        if payload.last() != Some(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message not NUL-terminated",
            ));
        }
        Ok(Some(payload))
    }

    /// Drop the scheduler registrations and close the socket.
    pub fn close(&mut self, sched: &mut Scheduler) {
        let Some(fd) = self.fd.take() else {
            return;
        };
        let raw = fd.as_raw_fd();
        if self.iready && self.oready {
            sched.remove_read(raw);
        }
        if !self.oready {
            sched.remove_write(raw);
        }
        self.outq.clear();
        self.sent = 0;
        self.oready = true;
        // fd drops here, closing the socket.
    }

    fn update_handlers(&mut self, sched: &mut Scheduler, iready: bool, oready: bool) -> bool {
        let Some(fd) = self.fd.as_ref() else {
            return false;
        };
        let raw = fd.as_raw_fd();
        let mut unblocked = false;
        if self.oready != oready {
            if oready {
                let prev = sched.remove_write(raw);
                debug_assert_eq!(prev, Some(self.token));
                unblocked = true;
            } else {
                let prev = sched.install_write(raw, self.token);
                debug_assert!(prev.is_none());
            }
        }
        // Read registration exists iff input is wanted and output is idle.
        let read_was = self.iready && self.oready;
        let read_now = iready && oready;
        if read_was != read_now {
            if read_now {
                sched.install_read(raw, self.token);
            } else {
                sched.remove_read(raw);
            }
        }
        self.iready = iready;
        self.oready = oready;
        unblocked
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    use nix::fcntl::FcntlArg;
    use nix::fcntl::OFlag;
    use nix::fcntl::fcntl;
    let flags = fcntl(fd.as_fd(), FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Read;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    fn pair(sched: &mut Scheduler) -> (NetFrame, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let frame = NetFrame::new(ours.into(), Token::Rendezvous, sched).unwrap();
        theirs.set_nonblocking(true).unwrap();
        (frame, theirs)
    }

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut msg = (payload.len() as u32).to_be_bytes().to_vec();
        msg.extend_from_slice(payload);
        msg
    }

    #[test]
    fn send_prepends_length_header() {
        let mut sched = Scheduler::new();
        let (mut frame, mut peer) = pair(&mut sched);
        frame.send(&mut sched, b"G7 /tmp/x\n\0");
        let mut got = [0u8; 64];
        let n = peer.read(&mut got).unwrap();
        assert_eq!(&got[..n], framed(b"G7 /tmp/x\n\0").as_slice());
        assert!(frame.ready_for_output());
    }

    #[test]
    fn frames_parse_back_to_payloads() {
        let mut sched = Scheduler::new();
        let (mut frame, mut peer) = pair(&mut sched);
        let mut bytes = framed(b"one\0");
        bytes.extend_from_slice(&framed(b"two\0"));
        peer.write_all(&bytes).unwrap();
        assert_eq!(frame.fill(), Fill::Data);
        assert_eq!(frame.next_frame().unwrap().unwrap(), b"one\0");
        assert_eq!(frame.next_frame().unwrap().unwrap(), b"two\0");
        assert_eq!(frame.next_frame().unwrap(), None);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut sched = Scheduler::new();
        let (mut frame, mut peer) = pair(&mut sched);
        let bytes = framed(b"payload\0");
        peer.write_all(&bytes[..5]).unwrap();
        frame.fill();
        assert_eq!(frame.next_frame().unwrap(), None);
        peer.write_all(&bytes[5..]).unwrap();
        frame.fill();
        assert_eq!(frame.next_frame().unwrap().unwrap(), b"payload\0");
    }

    #[test]
    fn oversized_frame_is_a_protocol_error() {
        let mut sched = Scheduler::new();
        let (mut frame, mut peer) = pair(&mut sched);
        let huge = (MAX_MSG_SIZE as u32 + 1).to_be_bytes();
        peer.write_all(&huge).unwrap();
        frame.fill();
        assert!(frame.next_frame().is_err());
    }

    #[test]
    fn missing_nul_is_a_protocol_error() {
        let mut sched = Scheduler::new();
        let (mut frame, mut peer) = pair(&mut sched);
        peer.write_all(&framed(b"no terminator")).unwrap();
        frame.fill();
        assert!(frame.next_frame().is_err());
    }

    #[test]
    fn blocked_output_suspends_input_and_unblocks_on_drain() {
        let mut sched = Scheduler::new();
        let (mut frame, mut peer) = pair(&mut sched);
        let payload = vec![0u8; MAX_MSG_SIZE];
        // Stuff the socket until the kernel buffer pushes back.
        while frame.ready_for_output() {
            frame.send(&mut sched, &payload);
        }
        assert!(!frame.deliverable());

        // Drain the peer side, then flush: output unblocks.
        let mut sink = vec![0u8; 1 << 20];
        let mut unblocked = false;
        for _ in 0..1000 {
            while let Ok(n) = peer.read(&mut sink) {
                if n == 0 {
                    break;
                }
            }
            if frame.flush(&mut sched) {
                unblocked = true;
                break;
            }
        }
        assert!(unblocked);
        assert!(frame.ready_for_output());
        assert!(frame.deliverable());
    }

    #[test]
    fn close_is_idempotent() {
        let mut sched = Scheduler::new();
        let (mut frame, _peer) = pair(&mut sched);
        frame.close(&mut sched);
        assert!(frame.is_closed());
        frame.close(&mut sched);
        frame.send(&mut sched, b"ignored\0");
    }
}
