//! Client sessions: protocol parsing, the request table, flow control.
//!
//! Requests are textual: `<opcode><reqid> <uid> <gid> <path>\n`, with an
//! optional second NUL-separated message in the same frame carrying the
//! client's supplementary groups. A session is "ready for events" exactly
//! when its framed connection has nothing queued; interests that go dirty
//! while it is not ready accumulate on an ordered scan queue, drained
//! (after the at-most-one suspended directory scanner) on the output
//! unblock edge.

use std::collections::HashMap;
use std::io;
use std::io::Write;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::path::PathBuf;

use indexmap::IndexSet;
use log::debug;
use log::error;
use log::info;
use memchr::memchr;

use crate::cred::Cred;
use crate::daemon::Daemon;
use crate::daemon::InterestId;
use crate::daemon::SessionId;
use crate::event::Event;
use crate::frame::Fill;
use crate::frame::NetFrame;
use crate::scanner::DirScanner;
use crate::scanner::Step;
use crate::scheduler::Token;

/// How request credentials are resolved, fixed at session construction.
#[derive(Clone, Debug)]
pub enum CredMode {
    /// Believe the uid/gid in every request (peer daemons, and local
    /// clients under insecure compatibility).
    TrustPayload,
    /// Serve every request as this authenticated credential.
    Fixed(Cred),
}

/// Per-client state.
#[derive(Debug)]
pub struct Session {
    pub frame: NetFrame,
    pub name: String,
    pub mode: CredMode,
    pub requests: HashMap<u32, InterestId>,
    /// Interests marked dirty while output was blocked, in order.
    pub scan_queue: IndexSet<InterestId>,
    /// At most one suspended directory enumeration.
    pub scanner: Option<DirScanner>,
    pub insecure_suggested: bool,
    /// Private-socket path to unlink when the session ends.
    pub unix_path: Option<PathBuf>,
    /// Internal watchers never hold the daemon alive; clients do.
    pub counts_activity: bool,
}

/// A parsed client request.
#[derive(Debug, Eq, PartialEq)]
pub struct ClientRequest {
    pub opcode: u8,
    pub request: u32,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub path: Vec<u8>,
    /// Supplementary groups from the second message.
    pub groups: Vec<libc::gid_t>,
    /// `N` with a groups tail doubles as "give me a private socket".
    pub wants_private_socket: bool,
}

/// Parse one request frame. Errors close the connection.
pub fn parse_request(payload: &[u8]) -> Result<ClientRequest, String> {
    let first_end = memchr(0, payload).unwrap_or(payload.len());
    let first = &payload[..first_end];
    let (&opcode, rest) = first.split_first().ok_or("empty message")?;

    let (request, rest) = parse_long(rest).ok_or("bad message (no request id)")?;
    let (uid, rest) = parse_long(rest).ok_or("bad message (no uid)")?;
    let (gid, rest) = parse_long(rest).ok_or("bad message (no gid)")?;

    // One space, then the path up to the end of the first message.
    let rest = rest.strip_prefix(b" ").unwrap_or(rest);
    if rest.len() > libc::PATH_MAX as usize {
        return Err(format!("path name too long ({} chars)", rest.len()));
    }
    let mut path = rest.to_vec();
    if path.last() == Some(&b'\n') {
        path.pop();
    }

    // Second message, if any: "ngroups g1 g2 ...".
    let mut groups = Vec::new();
    let second = payload
        .get(first_end + 1..payload.len().saturating_sub(1))
        .unwrap_or(&[]);
    let has_tail = !second.is_empty();
    if has_tail {
        if let Some((count, mut rest)) = parse_long(second) {
            let max = nix::unistd::sysconf(nix::unistd::SysconfVar::NGROUPS_MAX)
                .ok()
                .flatten()
                .unwrap_or(65536);
            let mut count = count;
            if count > max {
                info!(
                    "message contained {} groups, truncated to {} by NGROUPS_MAX",
                    count, max
                );
                count = max;
            }
            for _ in 0..count {
                match parse_long(rest) {
                    Some((gid, tail)) => {
                        groups.push(gid as libc::gid_t);
                        rest = tail;
                    }
                    None => {
                        error!("bad message (group list shorter than its count)");
                        break;
                    }
                }
            }
        }
    }

    Ok(ClientRequest {
        opcode,
        request: request as u32,
        uid: uid as libc::uid_t,
        gid: gid as libc::gid_t,
        path,
        groups,
        wants_private_socket: opcode == b'N' && has_tail,
    })
}

// strtol, near enough: leading whitespace, optional sign, decimal digits.
fn parse_long(input: &[u8]) -> Option<(i64, &[u8])> {
    let mut at = 0;
    while input.get(at).is_some_and(|b| b.is_ascii_whitespace()) {
        at += 1;
    }
    let negative = input.get(at) == Some(&b'-');
    if negative {
        at += 1;
    }
    let start = at;
    let mut value: i64 = 0;
    while let Some(&digit) = input.get(at).filter(|b| b.is_ascii_digit()) {
        value = value.wrapping_mul(10).wrapping_add(i64::from(digit - b'0'));
        at += 1;
    }
    if at == start {
        return None;
    }
    Some((if negative { -value } else { value }, &input[at..]))
}

/// Compose an outbound event message. Changed carries the historical
/// flag byte (a lone `c`) that old client libraries still expect.
pub fn format_event(event: Event, request: u32, path: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(path.len() + 16);
    msg.push(event.code());
    let _ = write!(msg, "{}", request);
    if event == Event::Changed {
        msg.extend_from_slice(b" c");
    }
    msg.push(b' ');
    msg.extend_from_slice(path);
    msg.push(b'\n');
    msg.push(0);
    msg
}

impl Daemon {
    /// Wrap a connected client socket in a session.
    pub fn new_session(
        &mut self,
        fd: OwnedFd,
        mode: CredMode,
        unix_path: Option<PathBuf>,
    ) -> io::Result<SessionId> {
        let sid = self.alloc_session_id();
        let frame = NetFrame::new(fd, Token::Session(sid), &mut self.sched)?;
        let name = format!("client {}", frame.raw_fd());
        debug!("new connection from {}", name);
        self.sessions.insert(
            sid,
            Session {
                frame,
                name,
                mode,
                requests: HashMap::new(),
                scan_queue: IndexSet::new(),
                scanner: None,
                insecure_suggested: false,
                unix_path,
                counts_activity: true,
            },
        );
        self.activity_begin();
        Ok(sid)
    }

    /// The session's socket is readable: pull input, deliver frames.
    pub fn session_readable(&mut self, sid: SessionId) {
        let Some(sess) = self.sessions.get_mut(&sid) else {
            return;
        };
        let status = sess.frame.fill();
        self.session_deliver(sid);
        if status == Fill::Closed && self.sessions.contains_key(&sid) {
            let name = self
                .sessions
                .get(&sid)
                .map(|s| s.name.clone())
                .unwrap_or_default();
            debug!("lost connection from {}", name);
            self.destroy_session(sid);
        }
    }

    /// Deliver buffered frames while input is enabled and output is idle.
    pub fn session_deliver(&mut self, sid: SessionId) {
        loop {
            let Some(sess) = self.sessions.get_mut(&sid) else {
                return;
            };
            if !sess.frame.deliverable() {
                return;
            }
            let name = sess.name.clone();
            match sess.frame.next_frame() {
                Ok(Some(payload)) => self.session_input(sid, &payload),
                Ok(None) => return,
                Err(err) => {
                    error!("closing {}: {}", name, err);
                    self.destroy_session(sid);
                    return;
                }
            }
        }
    }

    /// The session's socket drained; if that was the blocked→unblocked
    /// edge, resume the scanner, then the queued scans, then input.
    pub fn session_writable(&mut self, sid: SessionId) {
        let Daemon {
            sessions, sched, ..
        } = self;
        let unblocked = sessions.get_mut(&sid).map(|s| s.frame.flush(sched));
        if unblocked == Some(true) {
            self.session_unblock(sid);
        }
    }

    /// The output-unblock edge.
    pub fn session_unblock(&mut self, sid: SessionId) {
        // Continue the suspended scanner, if any.
        if let Some(mut scanner) = self.sessions.get_mut(&sid).and_then(|s| s.scanner.take()) {
            if self.scanner_step(&mut scanner) == Step::WouldBlock {
                if let Some(sess) = self.sessions.get_mut(&sid) {
                    sess.scanner = Some(scanner);
                }
                return;
            }
        }

        // Then the interests that went dirty while blocked.
        loop {
            let Some(sess) = self.sessions.get(&sid) else {
                return;
            };
            if !sess.frame.ready_for_output() {
                return;
            }
            let Some(&ip) = sess.scan_queue.first() else {
                break;
            };
            if let Some(sess) = self.sessions.get_mut(&sid) {
                sess.scan_queue.shift_remove(&ip);
            }
            self.interest_scan(ip);
        }

        // All enqueued work done: accept input again.
        {
            let Daemon {
                sessions, sched, ..
            } = self;
            if let Some(sess) = sessions.get_mut(&sid) {
                if sess.frame.ready_for_output() {
                    sess.frame.ready_for_input(sched, true);
                }
            }
        }
        self.session_deliver(sid);
    }

    pub fn enqueue_for_scan(&mut self, sid: SessionId, id: InterestId) {
        let Daemon {
            sessions, sched, ..
        } = self;
        let Some(sess) = sessions.get_mut(&sid) else {
            return;
        };
        if sess.scan_queue.is_empty() {
            sess.frame.ready_for_input(sched, false);
        }
        sess.scan_queue.insert(id);
    }

    pub fn dequeue_from_scan(&mut self, sid: SessionId, id: InterestId) {
        let Daemon {
            sessions, sched, ..
        } = self;
        let Some(sess) = sessions.get_mut(&sid) else {
            return;
        };
        sess.scan_queue.shift_remove(&id);
        if sess.scan_queue.is_empty() {
            sess.frame.ready_for_input(sched, true);
        }
    }

    /// Park the (single) directory scanner on its session.
    pub fn enqueue_scanner(&mut self, sid: SessionId, scanner: DirScanner) {
        let Daemon {
            sessions, sched, ..
        } = self;
        let Some(sess) = sessions.get_mut(&sid) else {
            return;
        };
        debug_assert!(sess.scanner.is_none());
        sess.scanner = Some(scanner);
        sess.frame.ready_for_input(sched, false);
    }

    /// Drop a parked scanner that refers to a dying directory.
    pub fn drop_scanner_for(&mut self, dir: InterestId) {
        let sid = self
            .sessions
            .iter()
            .find(|(_, sess)| sess.scanner.as_ref().map(|sc| sc.dir) == Some(dir))
            .map(|(&sid, _)| sid);
        if let Some(sid) = sid {
            let Daemon {
                sessions, sched, ..
            } = self;
            if let Some(sess) = sessions.get_mut(&sid) {
                sess.scanner = None;
                if sess.scan_queue.is_empty() {
                    sess.frame.ready_for_input(sched, true);
                }
            }
        }
    }

    /// Send one event on a session's connection.
    pub fn session_send_event(&mut self, sid: SessionId, event: Event, request: u32, path: &[u8]) {
        let Daemon {
            sessions, sched, ..
        } = self;
        let Some(sess) = sessions.get_mut(&sid) else {
            return;
        };
        let msg = format_event(event, request, path);
        sess.frame.send(sched, &msg);
        debug!(
            "sent event to {}: request {} {:?} {}",
            sess.name,
            request,
            String::from_utf8_lossy(path),
            event.name()
        );
    }

    /// Send a raw, already NUL-terminated payload (the private-socket
    /// path reply is not an event).
    pub fn session_send_raw(&mut self, sid: SessionId, payload: &[u8]) {
        let Daemon {
            sessions, sched, ..
        } = self;
        if let Some(sess) = sessions.get_mut(&sid) {
            sess.frame.send(sched, payload);
        }
    }

    /// Process one request frame.
    pub fn session_input(&mut self, sid: SessionId, payload: &[u8]) {
        let req = match parse_request(payload) {
            Ok(req) => req,
            Err(err) => {
                error!("{}", err);
                self.destroy_session(sid);
                return;
            }
        };
        let Some(sess) = self.sessions.get(&sid) else {
            return;
        };
        let name = sess.name.clone();
        let cred = match &sess.mode {
            CredMode::Fixed(cred) => cred.clone(),
            CredMode::TrustPayload => self.creds.intern(req.uid, req.gid, &req.groups),
        };

        match req.opcode {
            b'W' => {
                debug!(
                    "{} said: request {} monitor file {:?}",
                    name,
                    req.request,
                    String::from_utf8_lossy(&req.path)
                );
                self.monitor_request(sid, req.request, &req.path, cred, false);
            }
            b'M' => {
                debug!(
                    "{} said: request {} monitor dir {:?}",
                    name,
                    req.request,
                    String::from_utf8_lossy(&req.path)
                );
                self.monitor_request(sid, req.request, &req.path, cred, true);
            }
            b'C' => {
                debug!("{} said: cancel request {}", name, req.request);
                self.cancel_request(sid, req.request);
            }
            b'S' => {
                debug!("{} said: suspend request {}", name, req.request);
                if let Some(id) = self.session_interest(sid, req.request) {
                    self.interest_suspend(id);
                }
            }
            b'U' => {
                debug!("{} said: resume request {}", name, req.request);
                if let Some(id) = self.session_interest(sid, req.request) {
                    self.interest_resume(id);
                }
            }
            b'N' => {
                let new_name = String::from_utf8_lossy(&req.path).into_owned();
                debug!("{} said: my name is \"{}\"", name, new_name);
                if !new_name.is_empty() && new_name != "test" {
                    if let Some(sess) = self.sessions.get_mut(&sid) {
                        sess.name = new_name;
                    }
                }
                if req.wants_private_socket {
                    self.create_private_socket(sid, req.uid);
                }
            }
            // Obsolete requests, accepted and ignored.
            b'D' | b'V' | b'E' => {}
            other => {
                error!("{} said unknown request '{}'", name, other as char);
                self.destroy_session(sid);
            }
        }
    }

    fn session_interest(&self, sid: SessionId, request: u32) -> Option<InterestId> {
        let sess = self.sessions.get(&sid)?;
        let found = sess.requests.get(&request).copied();
        if found.is_none() {
            error!("{} invalid request number {}", sess.name, request);
        }
        found
    }

    /// W and M: create the interest, unless the request is malformed.
    pub fn monitor_request(
        &mut self,
        sid: SessionId,
        request: u32,
        path: &[u8],
        cred: Cred,
        is_dir: bool,
    ) {
        if path.first() != Some(&b'/') {
            info!("relative path {:?} rejected", String::from_utf8_lossy(path));
            self.session_send_event(sid, Event::Acknowledge, request, path);
            return;
        }
        if self
            .sessions
            .get(&sid)
            .map(|s| s.requests.contains_key(&request))
            .unwrap_or(true)
        {
            let name = self
                .sessions
                .get(&sid)
                .map(|s| s.name.clone())
                .unwrap_or_default();
            error!("{} nonunique request number {} rejected", name, request);
            return;
        }
        let id = self.new_client_interest(sid, request, path, cred, is_dir);
        if let Some(sess) = self.sessions.get_mut(&sid) {
            sess.requests.insert(request, id);
        }
    }

    /// C: acknowledge synchronously and destroy the interest. Any
    /// in-flight scanner sees the removal at its next step.
    pub fn cancel_request(&mut self, sid: SessionId, request: u32) {
        let Some(id) = self.session_interest(sid, request) else {
            return;
        };
        if let Some(sess) = self.sessions.get_mut(&sid) {
            sess.requests.remove(&request);
        }
        self.interest_cancel(id);
        self.destroy_interest(id);
    }

    /// One hint per session: requests served as the untrusted user were
    /// denied, and insecure compatibility would change that.
    pub fn suggest_insecure_compat(&mut self, sid: SessionId, path: &Path) {
        let untrusted_uid = self.untrusted.as_ref().map(|c| c.uid());
        let insecure = self.config.insecure_compat;
        let Some(sess) = self.sessions.get_mut(&sid) else {
            return;
        };
        if sess.insecure_suggested || insecure {
            return;
        }
        if let CredMode::Fixed(cred) = &sess.mode {
            if Some(cred.uid()) == untrusted_uid {
                info!(
                    "client \"{}\", whose requests are served as uid {}, was denied \
                     access on {:?}; if it failed authentication, consider \
                     insecure_compatibility",
                    sess.name,
                    cred.uid(),
                    path
                );
                sess.insecure_suggested = true;
            }
        }
    }

    /// Tear the session down, interests first.
    pub fn destroy_session(&mut self, sid: SessionId) {
        let Some(mut sess) = self.sessions.remove(&sid) else {
            return;
        };
        sess.frame.close(&mut self.sched);
        for (_, id) in sess.requests.drain() {
            self.destroy_interest(id);
        }
        if let Some(path) = sess.unix_path.take() {
            let _ = std::fs::remove_file(&path);
        }
        if sess.counts_activity {
            self.activity_end();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn monitor_request_parses() {
        let req = parse_request(b"W12 100 20 /tmp/watched\n\0").unwrap();
        assert_eq!(req.opcode, b'W');
        assert_eq!(req.request, 12);
        assert_eq!(req.uid, 100);
        assert_eq!(req.gid, 20);
        assert_eq!(req.path, b"/tmp/watched");
        assert!(req.groups.is_empty());
        assert!(!req.wants_private_socket);
    }

    #[test]
    fn group_tail_parses() {
        let req = parse_request(b"M3 0 0 /d\n\x003 7 8 9\0").unwrap();
        assert_eq!(req.opcode, b'M');
        assert_eq!(req.groups, vec![7, 8, 9]);
    }

    #[test]
    fn short_group_tail_truncates() {
        let req = parse_request(b"M3 0 0 /d\n\x003 7\0").unwrap();
        assert_eq!(req.groups, vec![7]);
    }

    #[test]
    fn n_with_groups_requests_private_socket() {
        let with = parse_request(b"N0 55 55 myapp\n\x001 55\0").unwrap();
        assert!(with.wants_private_socket);
        let without = parse_request(b"N0 55 55 myapp\n\0").unwrap();
        assert!(!without.wants_private_socket);
    }

    #[test]
    fn malformed_requests_rejected() {
        assert!(parse_request(b"\0").is_err());
        assert!(parse_request(b"W\0").is_err());
        assert!(parse_request(b"W1 \0").is_err());
        assert!(parse_request(b"W1 0 x /p\n\0").is_err());
    }

    #[test]
    fn cancel_without_path_parses() {
        let req = parse_request(b"C7 100 20\n\0").unwrap();
        assert_eq!(req.opcode, b'C');
        assert_eq!(req.request, 7);
        assert!(req.path.is_empty());
    }

    #[test]
    fn event_formats() {
        assert_eq!(format_event(Event::Exists, 1, b"/tmp/x"), b"e1 /tmp/x\n\0");
        assert_eq!(
            format_event(Event::Changed, 12, b"/tmp/x"),
            b"c12 c /tmp/x\n\0"
        );
        assert_eq!(format_event(Event::EndExist, 2, b"/d"), b"P2 /d\n\0");
        assert_eq!(format_event(Event::Acknowledge, 9, b"name"), b"G9 name\n\0");
    }
}
