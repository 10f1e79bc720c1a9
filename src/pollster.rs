//! The polling wheel.
//!
//! Interests the kernel monitor cannot cover, and remote hosts whose peer
//! daemon is unreachable, are visited by a recurring timer instead. The
//! timer only exists while there is something to poll, so an idle daemon
//! sleeps until an external event wakes it.

use std::time::Duration;

use indexmap::IndexSet;
use log::debug;

use crate::daemon::HostId;
use crate::daemon::InterestId;
use crate::scheduler::Scheduler;

#[derive(Debug)]
pub struct Pollster {
    interests: IndexSet<InterestId>,
    hosts: IndexSet<HostId>,
    interval: Duration,
    remote_enabled: bool,
}

impl Pollster {
    pub fn new(interval: Duration, remote_enabled: bool) -> Pollster {
        Pollster {
            interests: IndexSet::new(),
            hosts: IndexSet::new(),
            interval,
            remote_enabled,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn remote_enabled(&self) -> bool {
        self.remote_enabled
    }

    pub fn watch_interest(&mut self, id: InterestId, sched: &mut Scheduler) {
        self.interests.insert(id);
        self.ensure_polling(sched);
    }

    pub fn forget_interest(&mut self, id: InterestId, sched: &mut Scheduler) {
        self.interests.shift_remove(&id);
        self.maybe_stop(sched);
    }

    pub fn watch_host(&mut self, id: HostId, sched: &mut Scheduler) {
        if !self.remote_enabled {
            return;
        }
        self.hosts.insert(id);
        self.ensure_polling(sched);
    }

    pub fn forget_host(&mut self, id: HostId, sched: &mut Scheduler) {
        self.hosts.shift_remove(&id);
        self.maybe_stop(sched);
    }

    /// The current poll sets, cloned; the daemon's tick mutates freely
    /// while iterating.
    pub fn snapshot(&self) -> (Vec<InterestId>, Vec<HostId>) {
        let hosts = if self.remote_enabled {
            self.hosts.iter().copied().collect()
        } else {
            Vec::new()
        };
        (self.interests.iter().copied().collect(), hosts)
    }

    fn ensure_polling(&mut self, sched: &mut Scheduler) {
        if !sched.has_recurring() && !(self.interests.is_empty() && self.hosts.is_empty()) {
            debug!("polling every {:?}", self.interval);
            sched.install_recurring(self.interval);
        }
    }

    fn maybe_stop(&mut self, sched: &mut Scheduler) {
        if sched.has_recurring() && self.interests.is_empty() && self.hosts.is_empty() {
            debug!("will stop polling");
            sched.remove_recurring();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recurring_task_tracks_set_occupancy() {
        let mut sched = Scheduler::new();
        let mut pollster = Pollster::new(Duration::from_secs(6), true);
        assert!(!sched.has_recurring());

        pollster.watch_interest(InterestId(1), &mut sched);
        assert!(sched.has_recurring());
        pollster.watch_host(HostId(1), &mut sched);

        pollster.forget_interest(InterestId(1), &mut sched);
        assert!(sched.has_recurring(), "host still polled");
        pollster.forget_host(HostId(1), &mut sched);
        assert!(!sched.has_recurring());
    }

    #[test]
    fn disabled_remote_polling_never_admits_hosts() {
        let mut sched = Scheduler::new();
        let mut pollster = Pollster::new(Duration::from_secs(6), false);
        pollster.watch_host(HostId(9), &mut sched);
        assert!(!sched.has_recurring());
        assert!(pollster.snapshot().1.is_empty());
    }

    #[test]
    fn forgetting_a_stranger_is_harmless() {
        let mut sched = Scheduler::new();
        let mut pollster = Pollster::new(Duration::from_secs(6), true);
        pollster.forget_interest(InterestId(7), &mut sched);
        pollster.watch_interest(InterestId(1), &mut sched);
        pollster.forget_interest(InterestId(7), &mut sched);
        assert!(sched.has_recurring());
    }
}
