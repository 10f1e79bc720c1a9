//! The daemon context and reactor loop.
//!
//! Every table the core mutates (sessions, interests, hosts,
//! filesystems, the identity index) lives here, owned by the single
//! thread. The scheduler returns wakeups; `dispatch` routes each to the
//! component it names. Nothing in the core blocks and nothing needs a
//! lock.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::time::Instant;

use log::debug;
use log::info;

use crate::config::Config;
use crate::cred::Cred;
use crate::cred::CredTable;
use crate::cred::resolve_user;
use crate::event::Event;
use crate::filesystem::FileSystem;
use crate::fstable::FsTable;
use crate::host::RemoteHost;
use crate::imon::Imon;
use crate::imon::ImonEventKind;
use crate::interest::ClientBits;
use crate::interest::DirState;
use crate::interest::Hook;
use crate::interest::Interest;
use crate::interest::Kind;
use crate::interest::Owner;
use crate::interest::StatSnap;
use crate::listener::Listener;
use crate::listener::Negotiation;
use crate::pollster::Pollster;
use crate::scheduler::Scheduler;
use crate::scheduler::TimerKey;
use crate::scheduler::Token;
use crate::scheduler::Wakeup;
use crate::session::Session;

macro_rules! table_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

table_id!(
    /// A client connection.
    SessionId
);
table_id!(
    /// A monitored entity.
    InterestId
);
table_id!(
    /// A peer daemon host.
    HostId
);
table_id!(
    /// A mounted filesystem.
    FsId
);

/// All daemon state, plus the reactor.
#[derive(Debug)]
pub struct Daemon {
    pub config: Config,
    pub sched: Scheduler,
    pub imon: Imon,
    pub pollster: Pollster,
    pub creds: CredTable,

    pub sessions: HashMap<SessionId, Session>,
    pub interests: HashMap<InterestId, Interest>,
    pub hosts: HashMap<HostId, RemoteHost>,
    pub hosts_by_name: HashMap<String, HostId>,
    pub filesystems: HashMap<FsId, FileSystem>,
    pub fstab: FsTable,
    /// Maps a `(device, inode)` identity to every interest sharing it.
    pub identity: HashMap<(u64, u64), Vec<InterestId>>,

    pub listener: Option<Listener>,
    pub negotiations: HashMap<RawFd, Negotiation>,
    /// Fallback credential for unauthenticated clients.
    pub untrusted: Option<Cred>,

    /// The directory the process is chdir'd into, if any.
    pub current_dir: Option<InterestId>,
    /// Client sessions holding the daemon alive.
    active_sessions: usize,
    running: bool,
    mtab_rebuild_pending: bool,

    next_session: u32,
    next_interest: u32,
    next_host: u32,
    next_fs: u32,
    next_private: u32,
}

impl Daemon {
    /// Build the daemon: credential table, mount table and its watcher.
    /// The listener is wired separately (it needs privilege and a
    /// portmapper, which tests do not have).
    pub fn new(config: Config) -> Daemon {
        let mut creds = CredTable::new();
        let untrusted = config
            .untrusted_user
            .as_ref()
            .and_then(|name| resolve_user(&mut creds, name));
        let pollster = Pollster::new(config.poll_interval, config.remote_polling);
        let mut daemon = Daemon {
            config,
            sched: Scheduler::new(),
            imon: Imon::new(),
            pollster,
            creds,
            sessions: HashMap::new(),
            interests: HashMap::new(),
            hosts: HashMap::new(),
            hosts_by_name: HashMap::new(),
            filesystems: HashMap::new(),
            fstab: FsTable::default(),
            identity: HashMap::new(),
            listener: None,
            negotiations: HashMap::new(),
            untrusted,
            current_dir: None,
            active_sessions: 0,
            running: false,
            mtab_rebuild_pending: false,
            next_session: 1,
            next_interest: 1,
            next_host: 1,
            next_fs: 1,
            next_private: 1,
        };
        daemon.fstable_init();
        daemon
    }

    pub(crate) fn alloc_session_id(&mut self) -> SessionId {
        let id = SessionId(self.next_session);
        self.next_session += 1;
        id
    }

    pub(crate) fn alloc_interest_id(&mut self) -> InterestId {
        let id = InterestId(self.next_interest);
        self.next_interest += 1;
        id
    }

    pub(crate) fn alloc_host_id(&mut self) -> HostId {
        let id = HostId(self.next_host);
        self.next_host += 1;
        id
    }

    pub(crate) fn alloc_fs_id(&mut self) -> FsId {
        let id = FsId(self.next_fs);
        self.next_fs += 1;
        id
    }

    pub(crate) fn next_private_serial(&mut self) -> u32 {
        let serial = self.next_private;
        self.next_private += 1;
        serial
    }

    /// Create the interest behind a W or M request: resolve its
    /// filesystem, express it to the kernel (or fall back to lstat),
    /// chain its identity, announce its existence, and hand it to the
    /// filesystem's monitoring backend.
    pub fn new_client_interest(
        &mut self,
        sid: SessionId,
        request: u32,
        path: &[u8],
        cred: Cred,
        is_dir: bool,
    ) -> InterestId {
        let name = PathBuf::from(std::ffi::OsStr::from_bytes(path));
        let owner = Owner::Session {
            session: sid,
            request,
        };
        self.make_interest(name, owner, cred, is_dir)
    }

    /// The daemon watching one of its own files.
    pub fn new_internal_interest(
        &mut self,
        name: PathBuf,
        hook: Hook,
        cred: Cred,
    ) -> Option<InterestId> {
        debug!("watching {:?} internally", name);
        Some(self.make_interest(name, Owner::Internal(hook), cred, false))
    }

    /// Export-table verification of remote requests. The walk over the
    /// export list is a collaborator concern; this is the decision point
    /// a real policy would plug into. Disabled or not, we admit.
    fn verify_exported(&self, name: &std::path::Path) -> bool {
        if self.config.xtab_verification {
            debug!("export verification admits {:?}", name);
        }
        true
    }

    fn make_interest(
        &mut self,
        name: PathBuf,
        owner: Owner,
        cred: Cred,
        is_dir: bool,
    ) -> InterestId {
        let fs = self.fstable_find(&name, &cred);
        let id = self.alloc_interest_id();
        self.creds.become_user(&cred);

        if !self.verify_exported(&name) {
            // Denied requests look like a nonexistent file: one Deleted,
            // no monitoring.
            let bits = ClientBits {
                owner,
                cred,
                fs,
                fs_request: 0,
                active: true,
            };
            let kind = if is_dir {
                Kind::Dir(bits, DirState::default())
            } else {
                Kind::File(bits)
            };
            self.interests.insert(
                id,
                Interest {
                    name,
                    dev: 0,
                    ino: 0,
                    stat: StatSnap::default(),
                    dirty: false,
                    executing: false,
                    reported_executing: false,
                    kind,
                },
            );
            self.post_event(id, Event::Deleted);
            return id;
        }

        let (snap, kernel_ok, stat_errno) = {
            let Daemon { imon, sched, .. } = self;
            match imon.express(&name, sched) {
                Ok(st) => (StatSnap::from_stat(&st), true, None),
                Err(_) => match nix::sys::stat::lstat(&name) {
                    Ok(st) => (StatSnap::from_stat(&st), false, None),
                    Err(errno) => {
                        info!("can't lstat {:?}", name);
                        (StatSnap::default(), false, Some(errno))
                    }
                },
            }
        };

        let bits = ClientBits {
            owner,
            cred,
            fs,
            fs_request: 0,
            active: true,
        };
        let kind = if is_dir {
            Kind::Dir(bits, DirState::default())
        } else {
            Kind::File(bits)
        };
        self.interests.insert(
            id,
            Interest {
                name,
                dev: snap.dev,
                ino: snap.ino,
                stat: snap,
                dirty: false,
                executing: false,
                reported_executing: false,
                kind,
            },
        );
        if snap.dev != 0 || snap.ino != 0 {
            self.identity.entry((snap.dev, snap.ino)).or_default().push(id);
        }
        self.fs_ll_monitor(fs, id, kernel_ok);

        // A nonexistent path that failed with EACCES usually means the
        // client exists but we are serving it as the untrusted user.
        if !snap.exists() && stat_errno == Some(nix::errno::Errno::EACCES) {
            if let Owner::Session { session, .. } = owner {
                let path = self.interests.get(&id).map(|ip| ip.name.clone());
                if let Some(path) = path {
                    self.suggest_insecure_compat(session, &path);
                }
            }
        }

        self.post_event(
            id,
            if snap.exists() {
                Event::Exists
            } else {
                Event::Deleted
            },
        );

        let fs_request = self.fs_monitor(fs, id, is_dir);
        if let Some(bits) = self
            .interests
            .get_mut(&id)
            .and_then(|ip| ip.client_bits_mut())
        {
            bits.fs_request = fs_request;
        }

        if is_dir {
            self.dir_initial_scan(id);
        }
        id
    }

    /// Events for the daemon's own watchers.
    pub fn internal_event(&mut self, hook: Hook, event: Event) {
        match hook {
            Hook::MountTable => {
                if event == Event::Changed {
                    debug!("mount table changed, scheduling a rebuild");
                    self.mtab_rebuild_pending = true;
                }
            }
        }
    }

    /// A client session came up; the death timer stands down.
    pub fn activity_begin(&mut self) {
        if self.active_sessions == 0 && !self.config.idle_timeout.is_zero() {
            self.sched.remove_oneshot(TimerKey::IdleExit);
        }
        self.active_sessions += 1;
    }

    /// A client session ended; the last one arms the death timer.
    pub fn activity_end(&mut self) {
        self.active_sessions = self.active_sessions.saturating_sub(1);
        if self.active_sessions == 0 && !self.config.idle_timeout.is_zero() {
            self.sched.install_oneshot(
                Instant::now() + self.config.idle_timeout,
                TimerKey::IdleExit,
            );
        }
    }

    /// Ask the reactor loop to stop.
    pub fn exit(&mut self) {
        self.running = false;
    }

    /// The reactor loop: wait, dispatch, repeat until told to exit.
    pub fn run(&mut self) -> std::io::Result<()> {
        self.running = true;
        while self.running {
            self.run_once()?;
        }
        self.listener_shutdown();
        Ok(())
    }

    /// One wait-and-dispatch pass. Tests drive the reactor with this.
    pub fn run_once(&mut self) -> std::io::Result<()> {
        let wakeups = self.sched.wait()?;
        for wakeup in wakeups {
            self.dispatch(wakeup);
            if self.mtab_rebuild_pending {
                self.mtab_rebuild_pending = false;
                self.fstable_rebuild();
            }
            if !self.running {
                break;
            }
        }
        Ok(())
    }

    /// Whether the reactor has been asked to stop.
    pub fn exiting(&self) -> bool {
        !self.running
    }

    /// Route one wakeup. Stale tokens (a session destroyed earlier in
    /// the same batch, say) fall through the table lookups harmlessly.
    pub fn dispatch(&mut self, wakeup: Wakeup) {
        match wakeup {
            Wakeup::Writable(Token::Session(sid)) => self.session_writable(sid),
            Wakeup::Writable(Token::Peer(host)) => self.host_writable(host),
            Wakeup::Writable(Token::Connector(host)) => self.host_connector_writable(host),
            Wakeup::Writable(_) => {}

            Wakeup::Readable(Token::Imon) => self.imon_readable(),
            Wakeup::Readable(Token::Rendezvous) => self.listener_accept(),
            Wakeup::Readable(Token::PrivateListener(fd)) => self.accept_private(fd),
            Wakeup::Readable(Token::Session(sid)) => self.session_readable(sid),
            Wakeup::Readable(Token::Peer(host)) => self.host_readable(host),
            Wakeup::Readable(Token::Connector(host)) => self.host_connector_readable(host),

            Wakeup::Timer(TimerKey::IdleExit) => {
                info!(
                    "exiting after {:?} of inactivity",
                    self.config.idle_timeout
                );
                self.exit();
            }
            Wakeup::Timer(TimerKey::HostRetry(host)) => self.host_connector_retry(host),
            Wakeup::Timer(TimerKey::HostIdle(host)) => self.host_idle_timeout(host),
            Wakeup::Timer(TimerKey::HostDeferred(host)) => self.host_deferred_task(host),
            Wakeup::Timer(TimerKey::Negotiation(fd)) => self.negotiation_cleanup(fd),

            Wakeup::Tick => self.tick(),
        }
    }

    /// The recurring polling pass.
    fn tick(&mut self) {
        let started = Instant::now();
        let (interests, hosts) = self.pollster.snapshot();
        let (ni, nh) = (interests.len(), hosts.len());
        for id in interests {
            self.interest_scan(id);
        }
        for host in hosts {
            self.host_poll(host);
        }
        if ni + nh > 0 {
            debug!(
                "polled {} interest(s) and {} host(s) in {:?}",
                ni,
                nh,
                started.elapsed()
            );
        }
    }

    /// Drain the kernel monitor and fan events out over the identity
    /// chains. An overflow marks everything dirty.
    fn imon_readable(&mut self) {
        let batch = self.imon.drain();
        if batch.overflowed {
            let ids: Vec<InterestId> = self.interests.keys().copied().collect();
            for &id in &ids {
                if let Some(ip) = self.interests.get_mut(&id) {
                    ip.dirty = true;
                }
            }
            for id in ids {
                self.interest_scan(id);
            }
        }
        for event in batch.events {
            let chain = self
                .identity
                .get(&(event.dev, event.ino))
                .cloned()
                .unwrap_or_default();
            for id in chain {
                match event.kind {
                    ImonEventKind::Exec => {
                        if let Some(ip) = self.interests.get_mut(&id) {
                            ip.executing = true;
                        }
                        self.report_exec_state(id);
                    }
                    ImonEventKind::Exit => {
                        if let Some(ip) = self.interests.get_mut(&id) {
                            ip.executing = false;
                        }
                        self.report_exec_state(id);
                    }
                    ImonEventKind::Change => {
                        self.interest_scan(id);
                    }
                }
            }
        }
    }
}
