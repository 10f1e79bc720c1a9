//! Non-blocking connect probe to a peer daemon.
//!
//! Connecting to a peer is a two-socket dance: connect to the remote
//! portmapper from a reserved local port, ask which port our program
//! number is registered on, then open the data connection to that port.
//! Every step is asynchronous, and every failure schedules a retry with
//! exponential backoff: once a second at first, slowing to once every
//! 1024 seconds while the peer stays unreachable.

use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::info;
use nix::sys::socket::AddressFamily;
use nix::sys::socket::SockFlag;
use nix::sys::socket::SockType;
use nix::sys::socket::SockaddrIn;
use nix::sys::socket::sockopt;

use crate::daemon::HostId;
use crate::rpc;
use crate::scheduler::Scheduler;
use crate::scheduler::TimerKey;
use crate::scheduler::Token;

const INITIAL_RETRY: Duration = Duration::from_secs(1);
const MAX_RETRY: Duration = Duration::from_secs(1024);

/// What a readiness event produced.
#[derive(Debug)]
pub enum Progress {
    /// Still working (or waiting out a retry pause).
    Pending,
    /// The data connection is up; the caller owns the socket now.
    Connected(OwnedFd),
}

#[derive(Debug)]
enum State {
    Idle,
    /// Talking to the remote portmapper.
    Pmapping(Exchange),
    /// Connecting to the mapped data port.
    Connecting,
    /// Waiting out a backoff pause.
    Pausing,
}

#[derive(Debug)]
struct Exchange {
    xid: u32,
    call: Vec<u8>,
    sent: usize,
    reply: Vec<u8>,
    record: Vec<u8>,
}

/// The per-host connect state machine.
#[derive(Debug)]
pub struct Connector {
    host: HostId,
    program: u32,
    version: u32,
    addr: Option<Ipv4Addr>,
    port: u16,
    state: State,
    sock: Option<OwnedFd>,
    reading: bool,
    retry: Duration,
}

impl Connector {
    pub fn new(host: HostId, program: u32, version: u32, addr: Option<Ipv4Addr>) -> Connector {
        Connector {
            host,
            program,
            version,
            addr,
            port: rpc::PMAP_PORT,
            state: State::Idle,
            sock: None,
            reading: false,
            retry: INITIAL_RETRY,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Start (or restart) the probe.
    pub fn activate(&mut self, sched: &mut Scheduler) {
        debug_assert!(self.is_idle());
        self.port = rpc::PMAP_PORT;
        self.retry = INITIAL_RETRY;
        self.state = State::Pmapping(Exchange::new(self.program, self.version));
        self.try_to_connect(sched);
    }

    /// Abandon the probe entirely.
    pub fn deactivate(&mut self, sched: &mut Scheduler) {
        self.drop_socket(sched);
        if matches!(self.state, State::Pausing) {
            sched.remove_oneshot(TimerKey::HostRetry(self.host));
        }
        self.state = State::Idle;
    }

    fn try_to_connect(&mut self, sched: &mut Scheduler) {
        debug_assert!(self.sock.is_none());
        let Some(addr) = self.addr else {
            // Name resolution failed when the host record was created;
            // keep the retry schedule in case it comes back.
            self.try_again(sched);
            return;
        };
        let sock = match open_probe_socket() {
            Ok(sock) => sock,
            Err(err) => {
                info!("can't create probe socket: {}", err);
                self.try_again(sched);
                return;
            }
        };
        let octets = addr.octets();
        let target = SockaddrIn::new(octets[0], octets[1], octets[2], octets[3], self.port);
        match nix::sys::socket::connect(sock.as_raw_fd(), &target) {
            Ok(()) | Err(nix::errno::Errno::EINPROGRESS) => {
                let prev = sched.install_write(sock.as_raw_fd(), Token::Connector(self.host));
                debug_assert!(prev.is_none());
                self.sock = Some(sock);
            }
            Err(errno) => {
                info!("connect to {}:{} failed: {}", addr, self.port, errno);
                self.try_again(sched);
            }
        }
    }

    /// The probe socket became writable: the connect finished, one way or
    /// the other.
    pub fn handle_writable(&mut self, sched: &mut Scheduler) -> Progress {
        let Some(err) = self
            .sock
            .as_ref()
            .map(|sock| nix::sys::socket::getsockopt(sock, sockopt::SocketError).unwrap_or(libc::EIO))
        else {
            return Progress::Pending;
        };
        if err != 0 {
            debug!(
                "connect to port {} failed: {}",
                self.port,
                io::Error::from_raw_os_error(err)
            );
            self.drop_socket(sched);
            self.try_again(sched);
            return Progress::Pending;
        }
        match mem::replace(&mut self.state, State::Idle) {
            State::Pmapping(mut exchange) => {
                // Push the GETPORT call out; tiny, but WouldBlock is
                // still possible on a freshly connected socket.
                while exchange.sent < exchange.call.len() {
                    let sock = match self.sock.as_ref() {
                        Some(sock) => sock,
                        None => return Progress::Pending,
                    };
                    match nix::unistd::write(sock.as_fd(), &exchange.call[exchange.sent..]) {
                        Ok(n) => exchange.sent += n,
                        Err(nix::errno::Errno::EAGAIN) => {
                            self.state = State::Pmapping(exchange);
                            return Progress::Pending;
                        }
                        Err(nix::errno::Errno::EINTR) => continue,
                        Err(errno) => {
                            info!("portmapper write failed: {}", errno);
                            self.drop_socket(sched);
                            self.try_again(sched);
                            return Progress::Pending;
                        }
                    }
                }
                if let Some(sock) = self.sock.as_ref() {
                    let raw = sock.as_raw_fd();
                    sched.remove_write(raw);
                    sched.install_read(raw, Token::Connector(self.host));
                    self.reading = true;
                }
                self.state = State::Pmapping(exchange);
                Progress::Pending
            }
            State::Connecting => match self.sock.take() {
                Some(sock) => {
                    sched.remove_write(sock.as_raw_fd());
                    debug!("data connection up, fd {}", sock.as_raw_fd());
                    Progress::Connected(sock)
                }
                None => Progress::Pending,
            },
            other => {
                self.state = other;
                Progress::Pending
            }
        }
    }

    /// The portmapper answered (or hung up).
    pub fn handle_readable(&mut self, sched: &mut Scheduler) -> Progress {
        let State::Pmapping(mut exchange) = mem::replace(&mut self.state, State::Idle) else {
            return Progress::Pending;
        };
        let mut chunk = [0u8; 512];
        let mut hangup = false;
        loop {
            let sock = match self.sock.as_ref() {
                Some(sock) => sock,
                None => return Progress::Pending,
            };
            match nix::unistd::read(sock.as_fd(), &mut chunk) {
                Ok(0) => {
                    hangup = true;
                    break;
                }
                Ok(n) => exchange.reply.extend_from_slice(&chunk[..n]),
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => {
                    info!("portmapper read failed: {}", errno);
                    self.drop_socket(sched);
                    self.try_again(sched);
                    return Progress::Pending;
                }
            }
        }
        loop {
            match rpc::take_fragment(&exchange.reply) {
                Ok(Some((consumed, frag, last))) => {
                    exchange.record.extend_from_slice(frag);
                    exchange.reply.drain(..consumed);
                    if last {
                        let port = rpc::decode_reply(exchange.xid, &exchange.record)
                            .and_then(rpc::result_u32)
                            .unwrap_or(0);
                        self.drop_socket(sched);
                        if port != 0 && port <= u32::from(u16::MAX) {
                            debug!("peer daemon registered on port {}", port);
                            self.port = port as u16;
                            self.state = State::Connecting;
                            self.try_to_connect(sched);
                        } else {
                            info!("peer portmapper has no mapping for {}", self.program);
                            self.try_again(sched);
                        }
                        return Progress::Pending;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    info!("bad portmapper reply: {}", err);
                    self.drop_socket(sched);
                    self.try_again(sched);
                    return Progress::Pending;
                }
            }
        }
        if hangup {
            self.drop_socket(sched);
            self.try_again(sched);
        } else {
            self.state = State::Pmapping(exchange);
        }
        Progress::Pending
    }

    /// The backoff pause elapsed; probe again.
    pub fn handle_retry(&mut self, sched: &mut Scheduler) {
        self.port = rpc::PMAP_PORT;
        self.state = State::Pmapping(Exchange::new(self.program, self.version));
        self.try_to_connect(sched);
    }

    fn try_again(&mut self, sched: &mut Scheduler) {
        self.state = State::Pausing;
        sched.install_oneshot(Instant::now() + self.retry, TimerKey::HostRetry(self.host));
        if self.retry < MAX_RETRY {
            self.retry *= 2;
        }
    }

    fn drop_socket(&mut self, sched: &mut Scheduler) {
        if let Some(sock) = self.sock.take() {
            let raw = sock.as_raw_fd();
            sched.remove_write(raw);
            if self.reading {
                sched.remove_read(raw);
            }
        }
        self.reading = false;
    }

    #[cfg(test)]
    fn retry_interval(&self) -> Duration {
        self.retry
    }
}

impl Exchange {
    fn new(program: u32, version: u32) -> Exchange {
        let xid = rpc::fresh_xid();
        let args = rpc::mapping_args(program, version, rpc::IPPROTO_TCP, 0);
        Exchange {
            xid,
            call: rpc::encode_call(
                xid,
                rpc::PMAP_PROGRAM,
                rpc::PMAP_VERSION,
                rpc::PMAPPROC_GETPORT,
                &args,
            ),
            sent: 0,
            reply: Vec::new(),
            record: Vec::new(),
        }
    }
}

// A probe socket, non-blocking, bound to a reserved local port when we
// have the privilege for one. Peers only trust monitor requests arriving
// from reserved ports, so an unbound probe still connects but is served
// as untrusted.
fn open_probe_socket() -> io::Result<OwnedFd> {
    let sock = nix::sys::socket::socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    for port in (512..1024u16).rev() {
        let local = SockaddrIn::new(0, 0, 0, 0, port);
        match nix::sys::socket::bind(sock.as_raw_fd(), &local) {
            Ok(()) => return Ok(sock),
            Err(nix::errno::Errno::EADDRINUSE) => continue,
            Err(nix::errno::Errno::EACCES) | Err(nix::errno::Errno::EPERM) => break,
            Err(errno) => return Err(errno.into()),
        }
    }
    debug!("no reserved port available; probing from an ephemeral port");
    Ok(sock)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unresolvable_host_backs_off_exponentially() {
        let mut sched = Scheduler::new();
        let mut conn = Connector::new(HostId(3), 391_002, 2, None);
        conn.activate(&mut sched);
        assert!(matches!(conn.state, State::Pausing));
        assert_eq!(conn.retry_interval(), Duration::from_secs(2));

        for expect in [4u64, 8, 16, 32, 64, 128, 256, 512, 1024, 1024, 1024] {
            assert!(sched.remove_oneshot(TimerKey::HostRetry(HostId(3))));
            conn.handle_retry(&mut sched);
            assert_eq!(conn.retry_interval(), Duration::from_secs(expect));
        }
    }

    #[test]
    fn deactivate_clears_pending_retry() {
        let mut sched = Scheduler::new();
        let mut conn = Connector::new(HostId(5), 391_002, 2, None);
        conn.activate(&mut sched);
        conn.deactivate(&mut sched);
        assert!(conn.is_idle());
        assert!(!sched.remove_oneshot(TimerKey::HostRetry(HostId(5))));
    }
}
