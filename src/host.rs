//! Peer daemons on NFS servers.
//!
//! A `RemoteHost` stands for the daemon we hope is running on an NFS
//! server. While a connection is up, monitors are forwarded and the peer
//! does the watching; while it is down, the host sits on the polling
//! wheel and its interests are scanned locally. Hosts are interned by
//! name and reference-counted by the NFS filesystems naming them.
//!
//! The kernel's NFS attribute cache works against us: a notification from
//! the peer often precedes the moment a local stat can see the change.
//! Every interesting peer event therefore triggers an immediate scan plus
//! a deferred rescan once the cache bound has passed, retried on a fixed
//! interval while the rescan keeps seeing nothing and budget remains.

use std::collections::BTreeMap;
use std::io::Write;
use std::net::Ipv4Addr;
use std::net::ToSocketAddrs;
use std::os::fd::OwnedFd;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::error;
use log::info;
use memchr::memchr;

use crate::connector::Connector;
use crate::connector::Progress;
use crate::cred::Cred;
use crate::daemon::Daemon;
use crate::daemon::HostId;
use crate::daemon::InterestId;
use crate::event::Event;
use crate::frame::Fill;
use crate::frame::NetFrame;
use crate::scheduler::TimerKey;
use crate::scheduler::Token;

/// How long an unproductive deferred rescan waits before trying again.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct DeferredScan {
    pub when: Instant,
    pub retries: u32,
    pub request: u64,
    /// Entry name for directory-entry events; None rescans the root.
    pub path: Option<Vec<u8>>,
}

/// Keep the queue sorted by deadline; ties stay in arrival order.
pub fn defer_insert(deferred: &mut Vec<DeferredScan>, scan: DeferredScan) {
    let at = deferred
        .iter()
        .position(|d| d.when > scan.when)
        .unwrap_or(deferred.len());
    deferred.insert(at, scan);
}

#[derive(Debug)]
pub struct RemoteHost {
    /// First label of the server's name, for logs.
    pub name: String,
    /// NFS filesystems referencing this host.
    pub refs: usize,
    pub connector: Connector,
    pub conn: Option<NetFrame>,
    next_request: u64,
    pub requests: BTreeMap<u64, InterestId>,
    deferred: Vec<DeferredScan>,
    min_time: Option<Instant>,
}

impl RemoteHost {
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Something on this host needs monitoring.
    pub fn active(&self) -> bool {
        !self.requests.is_empty()
    }
}

/// A peer event: `<code><reqid> [<flags> ]<path>\n`.
pub fn parse_peer_event(payload: &[u8]) -> Option<(u8, u64, Vec<u8>)> {
    let end = memchr(0, payload).unwrap_or(payload.len());
    let msg = &payload[..end];
    let (&opcode, rest) = msg.split_first()?;
    let mut at = 0;
    while rest.get(at).is_some_and(|b| b.is_ascii_digit()) {
        at += 1;
    }
    if at == 0 {
        return None;
    }
    let request: u64 = std::str::from_utf8(&rest[..at]).ok()?.parse().ok()?;
    let mut rest = &rest[at..];
    if opcode == b'c' {
        // Skip the what-changed flag token.
        rest = rest.strip_prefix(b" ").unwrap_or(rest);
        let skip = rest
            .iter()
            .position(|b| b.is_ascii_whitespace())
            .unwrap_or(rest.len());
        rest = &rest[skip..];
    }
    let rest = rest.strip_prefix(b" ").unwrap_or(rest);
    let mut path = rest.to_vec();
    if path.last() == Some(&b'\n') {
        path.pop();
    }
    Some((opcode, request, path))
}

fn format_peer_monitor(is_dir: bool, request: u64, cred: &Cred, remote_path: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(remote_path.len() + 32);
    msg.push(if is_dir { b'M' } else { b'W' });
    let _ = write!(msg, "{} {} {} ", request, cred.uid(), cred.gid());
    msg.extend_from_slice(remote_path);
    msg.push(b'\n');
    msg.push(0);
    if let Some(tail) = cred.groups_tail() {
        msg.extend_from_slice(tail.as_bytes());
        msg.push(0);
    }
    msg
}

fn format_peer_simple(opcode: u8, request: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(24);
    msg.push(opcode);
    let _ = write!(msg, "{} 0 0\n", request);
    msg.push(0);
    msg
}

impl Daemon {
    /// Look up or create the shared host record for a server name.
    pub fn host_intern(&mut self, name: &str) -> HostId {
        if let Some(&host) = self.hosts_by_name.get(name) {
            if let Some(h) = self.hosts.get_mut(&host) {
                h.refs += 1;
            }
            return host;
        }
        let addr = resolve_v4(name);
        if addr.is_none() {
            info!("can't resolve NFS server \"{}\"; will keep trying", name);
        }
        let host = self.alloc_host_id();
        let short = name.split('.').next().unwrap_or(name).to_owned();
        self.hosts.insert(
            host,
            RemoteHost {
                name: short,
                refs: 1,
                connector: Connector::new(host, self.config.program, self.config.version, addr),
                conn: None,
                next_request: 1,
                requests: BTreeMap::new(),
                deferred: Vec::new(),
                min_time: None,
            },
        );
        self.hosts_by_name.insert(name.to_owned(), host);
        host
    }

    /// An NFS filesystem naming this host went away.
    pub fn host_release(&mut self, host: HostId) {
        let gone = match self.hosts.get_mut(&host) {
            Some(h) => {
                h.refs = h.refs.saturating_sub(1);
                h.refs == 0
            }
            None => false,
        };
        if !gone {
            return;
        }
        self.hosts_by_name.retain(|_, &mut other| other != host);
        self.sched.remove_oneshot(TimerKey::HostDeferred(host));
        self.sched.remove_oneshot(TimerKey::HostIdle(host));
        let Daemon {
            hosts,
            sched,
            pollster,
            ..
        } = self;
        if let Some(mut h) = hosts.remove(&host) {
            debug_assert!(!h.active());
            if let Some(mut conn) = h.conn.take() {
                conn.close(sched);
            }
            h.connector.deactivate(sched);
            pollster.forget_host(host, sched);
        }
    }

    /// Forward a monitor to the peer (when connected) and allocate the
    /// remote-side request id.
    pub fn host_send_monitor(
        &mut self,
        host: HostId,
        id: InterestId,
        is_dir: bool,
        remote_path: &[u8],
        cred: &Cred,
    ) -> u64 {
        if !self.hosts.get(&host).map(|h| h.active()).unwrap_or(false) {
            self.host_activate(host);
        }
        let Some(h) = self.hosts.get_mut(&host) else {
            return 0;
        };
        let request = h.next_request;
        h.next_request += 1;
        debug_assert!(!h.requests.contains_key(&request));
        if h.conn.is_some() {
            let msg = format_peer_monitor(is_dir, request, cred, remote_path);
            let Daemon { hosts, sched, .. } = self;
            if let Some(h) = hosts.get_mut(&host) {
                if let Some(conn) = h.conn.as_mut() {
                    conn.send(sched, &msg);
                }
                debug!(
                    "told peer {}: request {} monitor {:?}",
                    h.name,
                    request,
                    String::from_utf8_lossy(remote_path)
                );
            }
        }
        if let Some(h) = self.hosts.get_mut(&host) {
            h.requests.insert(request, id);
        }
        request
    }

    pub fn host_send_cancel(&mut self, host: HostId, request: u64) {
        let Daemon { hosts, sched, .. } = self;
        let Some(h) = hosts.get_mut(&host) else {
            return;
        };
        if let Some(conn) = h.conn.as_mut() {
            conn.send(sched, &format_peer_simple(b'C', request));
            debug!("told peer {}: cancel request {}", h.name, request);
        }
        h.requests.remove(&request);
        if !h.active() {
            self.host_deactivate(host);
        }
    }

    pub fn host_send_suspend(&mut self, host: HostId, request: u64) {
        let Daemon { hosts, sched, .. } = self;
        if let Some(conn) = hosts.get_mut(&host).and_then(|h| h.conn.as_mut()) {
            conn.send(sched, &format_peer_simple(b'S', request));
        }
    }

    pub fn host_send_resume(&mut self, host: HostId, request: u64) {
        let Daemon { hosts, sched, .. } = self;
        if let Some(conn) = hosts.get_mut(&host).and_then(|h| h.conn.as_mut()) {
            conn.send(sched, &format_peer_simple(b'U', request));
        }
    }

    fn host_activate(&mut self, host: HostId) {
        let connected = self.hosts.get(&host).map(|h| h.is_connected()).unwrap_or(false);
        if connected {
            // Back from the brink of the idle timeout.
            self.sched.remove_oneshot(TimerKey::HostIdle(host));
        } else {
            let Daemon {
                hosts,
                sched,
                pollster,
                ..
            } = self;
            if let Some(h) = hosts.get_mut(&host) {
                if h.connector.is_idle() {
                    h.connector.activate(sched);
                }
                pollster.watch_host(host, sched);
            }
        }
    }

    fn host_deactivate(&mut self, host: HostId) {
        let connected = self.hosts.get(&host).map(|h| h.is_connected()).unwrap_or(false);
        if connected {
            let when = Instant::now() + self.pollster.interval();
            self.sched.install_oneshot(when, TimerKey::HostIdle(host));
        } else {
            let Daemon {
                hosts,
                sched,
                pollster,
                ..
            } = self;
            if let Some(h) = hosts.get_mut(&host) {
                h.connector.deactivate(sched);
            }
            pollster.forget_host(host, sched);
        }
    }

    /// The idle timeout expired with no new requests: hang up.
    pub fn host_idle_timeout(&mut self, host: HostId) {
        let Daemon { hosts, sched, .. } = self;
        let Some(h) = hosts.get_mut(&host) else {
            return;
        };
        debug!(
            "disconnecting from peer {} after inactivity",
            h.name
        );
        if let Some(mut conn) = h.conn.take() {
            conn.close(sched);
        }
    }

    /// The connector finished: adopt the data connection, identify
    /// ourselves, and replay the outstanding requests so the peer's view
    /// matches ours.
    pub fn host_connected(&mut self, host: HostId, fd: OwnedFd) {
        let frame = match NetFrame::new(fd, Token::Peer(host), &mut self.sched) {
            Ok(frame) => frame,
            Err(err) => {
                error!("can't adopt peer connection: {}", err);
                return;
            }
        };
        {
            let Daemon {
                hosts,
                pollster,
                sched,
                ..
            } = self;
            let Some(h) = hosts.get_mut(&host) else {
                return;
            };
            h.conn = Some(frame);
            pollster.forget_host(host, sched);
            debug!("connected to peer {}", h.name);
        }

        // Who we are.
        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_owned());
        let mut hello = Vec::new();
        let _ = write!(hello, "N0 0 0 client falterd@{}\n", hostname);
        hello.push(0);
        {
            let Daemon { hosts, sched, .. } = self;
            if let Some(conn) = hosts.get_mut(&host).and_then(|h| h.conn.as_mut()) {
                conn.send(sched, &hello);
            }
        }

        // Replay: monitors first, suspends for the suspended.
        let requests: Vec<(u64, InterestId)> = self
            .hosts
            .get(&host)
            .map(|h| h.requests.iter().map(|(&r, &id)| (r, id)).collect())
            .unwrap_or_default();
        for (request, id) in requests {
            let Some(fs) = self.interest_fs(id) else { continue };
            let Some(cred) = self.interest_cred(id) else { continue };
            let Some(path) = self.interests.get(&id).map(|ip| ip.name.clone()) else {
                continue;
            };
            let is_dir = matches!(
                self.interests.get(&id).map(|ip| &ip.kind),
                Some(crate::interest::Kind::Dir(..))
            );
            let remote_path = self.fs_map_path(fs, &path, &cred);
            let msg = format_peer_monitor(is_dir, request, &cred, &remote_path);
            {
                let Daemon { hosts, sched, .. } = self;
                if let Some(conn) = hosts.get_mut(&host).and_then(|h| h.conn.as_mut()) {
                    conn.send(sched, &msg);
                }
            }
            if !self.interest_active(id) {
                self.host_send_suspend(host, request);
            }
        }
    }

    /// The peer hung up. If anything is still monitored here, fall back
    /// to polling and start reconnecting; otherwise just let go.
    pub fn host_disconnected(&mut self, host: HostId) {
        let active = {
            let Daemon { hosts, sched, .. } = self;
            let Some(h) = hosts.get_mut(&host) else {
                return;
            };
            debug!("lost connection to peer {}", h.name);
            if let Some(mut conn) = h.conn.take() {
                conn.close(sched);
            }
            h.active()
        };
        if active {
            let Daemon {
                hosts,
                pollster,
                sched,
                ..
            } = self;
            pollster.watch_host(host, sched);
            if let Some(h) = hosts.get_mut(&host) {
                if h.connector.is_idle() {
                    h.connector.activate(sched);
                }
            }
        } else {
            self.sched.remove_oneshot(TimerKey::HostIdle(host));
        }
    }

    pub fn host_readable(&mut self, host: HostId) {
        let status = match self.hosts.get_mut(&host).and_then(|h| h.conn.as_mut()) {
            Some(conn) => conn.fill(),
            None => return,
        };
        loop {
            let frame = match self.hosts.get_mut(&host).and_then(|h| h.conn.as_mut()) {
                Some(conn) => conn.next_frame(),
                None => return,
            };
            match frame {
                Ok(Some(payload)) => self.host_event(host, &payload),
                Ok(None) => break,
                Err(err) => {
                    error!("bad message from peer: {}", err);
                    self.host_disconnected(host);
                    return;
                }
            }
        }
        if status == Fill::Closed {
            self.host_disconnected(host);
        }
    }

    pub fn host_writable(&mut self, host: HostId) {
        let Daemon { hosts, sched, .. } = self;
        if let Some(conn) = hosts.get_mut(&host).and_then(|h| h.conn.as_mut()) {
            conn.flush(sched);
        }
    }

    /// One event from the peer. The interesting ones trigger an immediate
    /// local scan plus a deferred rescan to defeat the attribute cache.
    pub fn host_event(&mut self, host: HostId, payload: &[u8]) {
        let Some((opcode, request, path)) = parse_peer_event(payload) else {
            debug!("protocol error from peer");
            return;
        };
        let Ok(event) = Event::try_from(opcode) else {
            error!("unrecognized event opcode '{}'", opcode as char);
            return;
        };
        if let Some(h) = self.hosts.get(&host) {
            debug!(
                "peer {} said request {} {:?} {}",
                h.name,
                request,
                String::from_utf8_lossy(&path),
                event.name()
            );
        }
        if !matches!(
            event,
            Event::Changed | Event::Deleted | Event::Created | Event::Exists
        ) {
            return;
        }
        let Some(&cip) = self.hosts.get(&host).and_then(|h| h.requests.get(&request)) else {
            return;
        };
        let (ip, entry_path) = if matches!(event, Event::Changed | Event::Deleted) {
            match self.find_name(cip, &path) {
                Some(ip) => (ip, Some(path)),
                None => return,
            }
        } else {
            (cip, None)
        };
        self.interest_scan(ip);

        let wait = self
            .interest_fs(cip)
            .and_then(|fs| self.filesystems.get(&fs))
            .map(|fs| fs.attr_cache_timeout())
            .unwrap_or(Duration::ZERO);
        if !wait.is_zero() {
            let delay = wait.min(RETRY_INTERVAL);
            let budget = (wait.as_secs().saturating_sub(1) / RETRY_INTERVAL.as_secs()) as u32;
            self.host_defer_scan(host, delay, budget, request, entry_path);
        }
    }

    /// Queue a rescan `delay` from now; only the nearest deadline holds a
    /// scheduler slot.
    pub fn host_defer_scan(
        &mut self,
        host: HostId,
        delay: Duration,
        retries: u32,
        request: u64,
        path: Option<Vec<u8>>,
    ) {
        let when = Instant::now() + delay + Duration::from_secs(1);
        let Some(h) = self.hosts.get_mut(&host) else {
            return;
        };
        defer_insert(
            &mut h.deferred,
            DeferredScan {
                when,
                retries,
                request,
                path,
            },
        );
        let needs_rearm = match h.min_time {
            None => true,
            Some(min) => when < min,
        };
        if needs_rearm {
            if h.min_time.is_some() {
                self.sched.remove_oneshot(TimerKey::HostDeferred(host));
            }
            if let Some(h) = self.hosts.get_mut(&host) {
                h.min_time = Some(when);
            }
            self.sched.install_oneshot(when, TimerKey::HostDeferred(host));
        }
    }

    /// Run the due deferred rescans; an unchanged result with budget left
    /// goes back on the queue one retry interval out.
    pub fn host_deferred_task(&mut self, host: HostId) {
        let now = Instant::now();
        loop {
            let due = match self.hosts.get_mut(&host) {
                Some(h) if h.deferred.first().is_some_and(|d| d.when <= now) => {
                    h.deferred.remove(0)
                }
                _ => break,
            };
            let Some(&cip) = self
                .hosts
                .get(&host)
                .and_then(|h| h.requests.get(&due.request))
            else {
                continue;
            };
            let ip = match &due.path {
                Some(path) => match self.find_name(cip, path) {
                    Some(ip) => ip,
                    None => continue,
                },
                None => cip,
            };
            debug!("running a deferred scan (request {})", due.request);
            let changed = self.interest_scan(ip);
            if !changed && due.retries > 0 {
                self.host_defer_scan(host, RETRY_INTERVAL, due.retries - 1, due.request, due.path);
            }
        }
        // Re-arm for whatever remains.
        let next = self.hosts.get(&host).and_then(|h| h.deferred.first().map(|d| d.when));
        if let Some(h) = self.hosts.get_mut(&host) {
            h.min_time = next;
        }
        if let Some(when) = next {
            self.sched.install_oneshot(when, TimerKey::HostDeferred(host));
        }
    }

    /// While the peer is unreachable, its requests are scanned locally.
    pub fn host_poll(&mut self, host: HostId) {
        let requests: Vec<InterestId> = self
            .hosts
            .get(&host)
            .map(|h| h.requests.values().copied().collect())
            .unwrap_or_default();
        for id in requests {
            self.interest_scan(id);
        }
    }

    /// Connector plumbing: readiness events on the probe socket.
    pub fn host_connector_writable(&mut self, host: HostId) {
        let progress = {
            let Daemon { hosts, sched, .. } = self;
            match hosts.get_mut(&host) {
                Some(h) => h.connector.handle_writable(sched),
                None => return,
            }
        };
        if let Progress::Connected(fd) = progress {
            self.host_connected(host, fd);
        }
    }

    pub fn host_connector_readable(&mut self, host: HostId) {
        let progress = {
            let Daemon { hosts, sched, .. } = self;
            match hosts.get_mut(&host) {
                Some(h) => h.connector.handle_readable(sched),
                None => return,
            }
        };
        if let Progress::Connected(fd) = progress {
            self.host_connected(host, fd);
        }
    }

    pub fn host_connector_retry(&mut self, host: HostId) {
        let Daemon { hosts, sched, .. } = self;
        if let Some(h) = hosts.get_mut(&host) {
            h.connector.handle_retry(sched);
        }
    }
}

fn resolve_v4(name: &str) -> Option<Ipv4Addr> {
    let addrs = (name, 0u16).to_socket_addrs().ok()?;
    for addr in addrs {
        if let std::net::SocketAddr::V4(v4) = addr {
            return Some(*v4.ip());
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn peer_events_parse() {
        let (op, req, path) = parse_peer_event(b"c12 c /export/foo\n\0").unwrap();
        assert_eq!(op, b'c');
        assert_eq!(req, 12);
        assert_eq!(path, b"/export/foo");

        let (op, req, path) = parse_peer_event(b"A3 name\n\0").unwrap();
        assert_eq!(op, b'A');
        assert_eq!(req, 3);
        assert_eq!(path, b"name");

        assert!(parse_peer_event(b"c\0").is_none());
        assert!(parse_peer_event(b"\0").is_none());
    }

    #[test]
    fn peer_monitor_formats() {
        let mut table = crate::cred::CredTable::new();
        let cred = table.intern(100, 20, &[]);
        assert_eq!(
            format_peer_monitor(false, 5, &cred, b"/export/x"),
            b"W5 100 20 /export/x\n\0"
        );
        let cred = table.intern(100, 20, &[7, 8]);
        assert_eq!(
            format_peer_monitor(true, 6, &cred, b"/d"),
            b"M6 100 20 /d\n\x002 7 8\0"
        );
    }

    #[test]
    fn peer_simple_formats() {
        assert_eq!(format_peer_simple(b'C', 9), b"C9 0 0\n\0");
        assert_eq!(format_peer_simple(b'S', 1), b"S1 0 0\n\0");
    }

    #[test]
    fn deferred_queue_stays_sorted() {
        let now = Instant::now();
        let mut queue = Vec::new();
        for (at, request) in [(30u64, 1u64), (10, 2), (20, 3), (10, 4)] {
            defer_insert(
                &mut queue,
                DeferredScan {
                    when: now + Duration::from_secs(at),
                    retries: 0,
                    request,
                    path: None,
                },
            );
        }
        let order: Vec<u64> = queue.iter().map(|d| d.request).collect();
        assert_eq!(order, vec![2, 4, 3, 1]);
    }

    #[test]
    fn retry_budget_matches_cache_timeout() {
        // A 30 s cache bound: first rescan at min(30, RETRY) = 10 s, then
        // ceil-ish budget (30-1)/10 = 2 more attempts.
        let wait = Duration::from_secs(30);
        let delay = wait.min(RETRY_INTERVAL);
        let budget = wait.as_secs().saturating_sub(1) / RETRY_INTERVAL.as_secs();
        assert_eq!(delay, Duration::from_secs(10));
        assert_eq!(budget, 2);

        let wait = Duration::from_secs(3);
        assert_eq!(wait.min(RETRY_INTERVAL), Duration::from_secs(3));
        assert_eq!(wait.as_secs().saturating_sub(1) / RETRY_INTERVAL.as_secs(), 0);
    }
}
