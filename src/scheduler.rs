//! Event and timer scheduling.
//!
//! A single-threaded poll(2) reactor. Handlers are not closures: each
//! registered fd carries a [`Token`] naming the component that owns it, and
//! [`Scheduler::wait`] returns the batch of wakeups for the daemon to
//! dispatch. This keeps every piece of mutable daemon state reachable from
//! one `&mut` during dispatch, with no interior mutability.
//!
//! Priorities are fixed: writable descriptors first (flow-control draining
//! unblocks everything else), then readable descriptors, then due one-shot
//! tasks in deadline order, then the single recurring task.

use std::collections::HashMap;
use std::io;
use std::os::fd::BorrowedFd;
use std::os::fd::RawFd;
use std::time::Duration;
use std::time::Instant;

use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use nix::poll::poll;

use crate::daemon::HostId;
use crate::daemon::SessionId;

/// Who owns a registered descriptor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Token {
    /// The inode monitor device.
    Imon,
    /// The rendezvous (listening) socket.
    Rendezvous,
    /// A per-client private listening socket, keyed by its own fd.
    PrivateListener(RawFd),
    /// A client session's connection.
    Session(SessionId),
    /// A peer daemon's data connection.
    Peer(HostId),
    /// A host's in-flight connect probe.
    Connector(HostId),
}

/// Identifies a one-shot task for removal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerKey {
    /// Terminate the reactor after the inactivity grace period.
    IdleExit,
    /// Retry a host's connect probe after backoff.
    HostRetry(HostId),
    /// Close an idle host connection.
    HostIdle(HostId),
    /// Run a host's nearest deferred rescan.
    HostDeferred(HostId),
    /// Tear down an unclaimed private-socket negotiation.
    Negotiation(RawFd),
}

/// One unit of work for the dispatch loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Wakeup {
    Writable(Token),
    Readable(Token),
    Timer(TimerKey),
    /// The recurring task's deadline passed.
    Tick,
}

#[derive(Debug)]
struct Recurring {
    interval: Duration,
    next: Instant,
}

/// The reactor's registries. The wait loop itself lives in the daemon.
#[derive(Debug, Default)]
pub struct Scheduler {
    readers: HashMap<RawFd, Token>,
    writers: HashMap<RawFd, Token>,
    // Sorted by deadline; ties keep insertion order.
    oneshots: Vec<(Instant, TimerKey)>,
    recurring: Option<Recurring>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler::default()
    }

    /// Register a readable handler, returning the one it replaced.
    /// Installing over a live registration is a caller bug.
    pub fn install_read(&mut self, fd: RawFd, token: Token) -> Option<Token> {
        self.readers.insert(fd, token)
    }

    pub fn remove_read(&mut self, fd: RawFd) -> Option<Token> {
        self.readers.remove(&fd)
    }

    pub fn install_write(&mut self, fd: RawFd, token: Token) -> Option<Token> {
        self.writers.insert(fd, token)
    }

    pub fn remove_write(&mut self, fd: RawFd) -> Option<Token> {
        self.writers.remove(&fd)
    }

    /// Schedule a one-shot task at an absolute time.
    pub fn install_oneshot(&mut self, when: Instant, key: TimerKey) {
        let at = self
            .oneshots
            .iter()
            .position(|(t, _)| *t > when)
            .unwrap_or(self.oneshots.len());
        self.oneshots.insert(at, (when, key));
    }

    /// Remove the first one-shot task matching `key`, if any.
    pub fn remove_oneshot(&mut self, key: TimerKey) -> bool {
        if let Some(at) = self.oneshots.iter().position(|(_, k)| *k == key) {
            self.oneshots.remove(at);
            true
        } else {
            false
        }
    }

    /// Install the single recurring task. Only one may exist.
    pub fn install_recurring(&mut self, interval: Duration) {
        debug_assert!(self.recurring.is_none());
        debug_assert!(!interval.is_zero());
        self.recurring = Some(Recurring {
            interval,
            next: Instant::now() + interval,
        });
    }

    pub fn remove_recurring(&mut self) {
        self.recurring = None;
    }

    pub fn has_recurring(&self) -> bool {
        self.recurring.is_some()
    }

    /// Block until I/O readiness or the next timer, and return the wakeups
    /// in dispatch order. An interrupted wait is retried; any other wait
    /// failure is fatal to the caller.
    pub fn wait(&mut self) -> io::Result<Vec<Wakeup>> {
        let mut fds: Vec<RawFd> = Vec::with_capacity(self.readers.len() + self.writers.len());
        let mut flags: Vec<PollFlags> = Vec::new();
        for (&fd, _) in &self.readers {
            fds.push(fd);
            flags.push(PollFlags::POLLIN);
        }
        for (&fd, _) in &self.writers {
            if let Some(at) = fds.iter().position(|&f| f == fd) {
                flags[at] |= PollFlags::POLLOUT;
            } else {
                fds.push(fd);
                flags.push(PollFlags::POLLOUT);
            }
        }

        let mut pollfds: Vec<PollFd<'_>> = fds
            .iter()
            .zip(&flags)
            .map(|(&fd, &fl)| PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, fl))
            .collect();

        loop {
            match poll(&mut pollfds, self.timeout()) {
                Ok(_) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }

        let mut wakeups = Vec::new();

        // Writables drain first, then readables. Error conditions wake
        // whoever is registered so the owner can observe the failure.
        let trouble = PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL;
        for (pfd, &fd) in pollfds.iter().zip(&fds) {
            let revents = pfd.revents().unwrap_or(PollFlags::empty());
            if revents.intersects(PollFlags::POLLOUT | trouble) {
                if let Some(&token) = self.writers.get(&fd) {
                    wakeups.push(Wakeup::Writable(token));
                }
            }
        }
        for (pfd, &fd) in pollfds.iter().zip(&fds) {
            let revents = pfd.revents().unwrap_or(PollFlags::empty());
            if revents.intersects(PollFlags::POLLIN | trouble) {
                if let Some(&token) = self.readers.get(&fd) {
                    wakeups.push(Wakeup::Readable(token));
                }
            }
        }

        let now = Instant::now();
        while let Some(&(when, key)) = self.oneshots.first() {
            if when > now {
                break;
            }
            self.oneshots.remove(0);
            wakeups.push(Wakeup::Timer(key));
        }

        if let Some(rec) = &mut self.recurring {
            if rec.next <= now {
                wakeups.push(Wakeup::Tick);
                rec.next += rec.interval;
                // Clock jumped forward, or we fell far behind.
                if rec.next < now {
                    rec.next = now + rec.interval;
                }
            } else if rec.next - now > rec.interval {
                // Clock ran backward; re-anchor.
                rec.next = now + rec.interval;
            }
        }

        Ok(wakeups)
    }

    fn timeout(&self) -> PollTimeout {
        let mut deadline: Option<Instant> = self.oneshots.first().map(|(t, _)| *t);
        if let Some(rec) = &self.recurring {
            deadline = Some(match deadline {
                Some(d) => d.min(rec.next),
                None => rec.next,
            });
        }
        match deadline {
            None => PollTimeout::NONE,
            Some(d) => {
                let left = d.saturating_duration_since(Instant::now());
                // Round up so we never wake a fraction of a millisecond
                // before a deadline; a capped wait just re-polls, since
                // deadlines are recomputed every iteration.
                let mut ms = left.as_millis();
                if left.subsec_nanos() % 1_000_000 != 0 {
                    ms += 1;
                }
                PollTimeout::from(ms.min(u128::from(u16::MAX)) as u16)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::time::Duration;

    #[test]
    fn install_returns_prior_handler() {
        let mut sched = Scheduler::new();
        assert_eq!(sched.install_read(5, Token::Imon), None);
        assert_eq!(sched.install_read(5, Token::Rendezvous), Some(Token::Imon));
        assert_eq!(sched.remove_read(5), Some(Token::Rendezvous));
        assert_eq!(sched.remove_read(5), None);
    }

    #[test]
    fn oneshots_fire_in_deadline_order() {
        let mut sched = Scheduler::new();
        let now = Instant::now();
        sched.install_oneshot(now + Duration::from_millis(20), TimerKey::IdleExit);
        sched.install_oneshot(now + Duration::from_millis(5), TimerKey::HostRetry(HostId(1)));
        let mut fired = Vec::new();
        while fired.len() < 2 {
            for wk in sched.wait().unwrap() {
                if let Wakeup::Timer(key) = wk {
                    fired.push(key);
                }
            }
        }
        assert_eq!(
            fired,
            vec![TimerKey::HostRetry(HostId(1)), TimerKey::IdleExit]
        );
    }

    #[test]
    fn removed_oneshot_does_not_fire() {
        let mut sched = Scheduler::new();
        let now = Instant::now();
        sched.install_oneshot(now + Duration::from_millis(5), TimerKey::IdleExit);
        assert!(sched.remove_oneshot(TimerKey::IdleExit));
        assert!(!sched.remove_oneshot(TimerKey::IdleExit));
        std::thread::sleep(Duration::from_millis(10));
        // No timers, but a readable pipe keeps wait from blocking forever.
        let (r, w) = nix::unistd::pipe().unwrap();
        nix::unistd::write(&w, b"x").unwrap();
        sched.install_read(r.as_raw_fd(), Token::Imon);
        let wakeups = sched.wait().unwrap();
        assert!(wakeups.iter().all(|wk| !matches!(wk, Wakeup::Timer(_))));
    }

    #[test]
    fn recurring_task_ticks() {
        let mut sched = Scheduler::new();
        sched.install_recurring(Duration::from_millis(10));
        let wakeups = sched.wait().unwrap();
        assert_eq!(wakeups, vec![Wakeup::Tick]);
        assert!(sched.has_recurring());
        sched.remove_recurring();
        assert!(!sched.has_recurring());
    }

    #[test]
    fn writables_precede_readables() {
        let mut sched = Scheduler::new();
        let (r, w) = nix::unistd::pipe().unwrap();
        nix::unistd::write(&w, b"x").unwrap();
        sched.install_read(r.as_raw_fd(), Token::Imon);
        sched.install_write(w.as_raw_fd(), Token::Rendezvous);
        let wakeups = sched.wait().unwrap();
        assert_eq!(
            wakeups,
            vec![
                Wakeup::Writable(Token::Rendezvous),
                Wakeup::Readable(Token::Imon)
            ]
        );
    }
}
