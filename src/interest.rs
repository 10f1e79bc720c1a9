//! The interest graph.
//!
//! An `Interest` is one monitored filesystem entity. Client requests
//! create File and Directory interests; a Directory owns an ordered list
//! of DirEntry interests mirroring readdir order; the daemon itself holds
//! an internal interest on the mount table. Everything is identified by a
//! table id and every operation is a method on [`Daemon`], so the whole
//! graph lives behind one `&mut` with no interior mutability.
//!
//! All interests with a known `(device, inode)` identity are chained in a
//! process-wide identity index. Hard links make the chain a set: a single
//! kernel event fans out to every interest sharing the inode.

use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use log::debug;
use log::info;

use crate::cred::Cred;
use crate::daemon::Daemon;
use crate::daemon::FsId;
use crate::daemon::InterestId;
use crate::daemon::SessionId;
use crate::event::Event;

/// Snapshot of the fields whose movement means "changed".
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatSnap {
    pub mode: u32,
    pub size: i64,
    pub uid: u32,
    pub gid: u32,
    pub ctime: (i64, i64),
    pub mtime: (i64, i64),
    pub ino: u64,
    pub dev: u64,
}

impl StatSnap {
    pub fn from_stat(st: &libc::stat) -> StatSnap {
        StatSnap {
            mode: st.st_mode,
            size: st.st_size,
            uid: st.st_uid,
            gid: st.st_gid,
            ctime: (st.st_ctime, st.st_ctime_nsec),
            mtime: (st.st_mtime, st.st_mtime_nsec),
            ino: st.st_ino,
            dev: st.st_dev,
        }
    }

    /// A zeroed mode is how "does not exist" is remembered.
    pub fn exists(&self) -> bool {
        self.mode != 0
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    fn differs_from(&self, old: &StatSnap) -> bool {
        old.ctime != self.ctime
            || old.mtime != self.mtime
            || old.mode != self.mode
            || old.uid != self.uid
            || old.gid != self.gid
            || old.size != self.size
            || old.ino != self.ino
    }
}

/// Who receives an interest's events.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Owner {
    /// A client request.
    Session { session: SessionId, request: u32 },
    /// The daemon watching one of its own files.
    Internal(Hook),
}

/// Internal watchers are enumerable; no closures needed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Hook {
    /// The mount table changed; rebuild the filesystem table.
    MountTable,
}

/// State shared by the client-facing kinds (File, Directory, Internal).
#[derive(Clone, Debug)]
pub struct ClientBits {
    pub owner: Owner,
    pub cred: Cred,
    pub fs: FsId,
    /// Request id on the remote peer; zero when none.
    pub fs_request: u64,
    pub active: bool,
}

/// Directory-only state.
#[derive(Debug, Default)]
pub struct DirState {
    /// Children, in the order readdir returned them.
    pub entries: Vec<InterestId>,
    /// A DirectoryScanner currently references this directory.
    pub scanning: bool,
}

#[derive(Debug)]
pub enum Kind {
    File(ClientBits),
    Dir(ClientBits, DirState),
    /// An entry in a monitored directory; nearly everything forwards to
    /// the parent.
    Entry { parent: InterestId },
}

/// One monitored filesystem entity.
#[derive(Debug)]
pub struct Interest {
    /// Absolute path, except DirEntries hold the bare entry name and are
    /// only stat'd relative to their chdir'd parent.
    pub name: PathBuf,
    pub dev: u64,
    pub ino: u64,
    pub stat: StatSnap,
    pub dirty: bool,
    pub executing: bool,
    pub reported_executing: bool,
    pub kind: Kind,
}

impl Interest {
    pub fn exists(&self) -> bool {
        self.stat.exists()
    }

    pub fn is_dir(&self) -> bool {
        self.stat.is_dir()
    }

    pub fn client_bits(&self) -> Option<&ClientBits> {
        match &self.kind {
            Kind::File(bits) | Kind::Dir(bits, _) => Some(bits),
            Kind::Entry { .. } => None,
        }
    }

    pub fn client_bits_mut(&mut self) -> Option<&mut ClientBits> {
        match &mut self.kind {
            Kind::File(bits) | Kind::Dir(bits, _) => Some(bits),
            Kind::Entry { .. } => None,
        }
    }

    fn entry_parent(&self) -> Option<InterestId> {
        match &self.kind {
            Kind::Entry { parent } => Some(*parent),
            _ => None,
        }
    }
}

impl Daemon {
    /// The interest holding this one's client state: itself, or a
    /// DirEntry's parent directory.
    pub fn client_root(&self, id: InterestId) -> InterestId {
        self.interests
            .get(&id)
            .and_then(|ip| ip.entry_parent())
            .unwrap_or(id)
    }

    pub fn interest_owner(&self, id: InterestId) -> Option<Owner> {
        let root = self.client_root(id);
        Some(self.interests.get(&root)?.client_bits()?.owner)
    }

    pub fn interest_cred(&self, id: InterestId) -> Option<Cred> {
        let root = self.client_root(id);
        Some(self.interests.get(&root)?.client_bits()?.cred.clone())
    }

    /// A DirEntry's filesystem is its parent's, by construction.
    pub fn interest_fs(&self, id: InterestId) -> Option<FsId> {
        let root = self.client_root(id);
        Some(self.interests.get(&root)?.client_bits()?.fs)
    }

    pub fn interest_active(&self, id: InterestId) -> bool {
        let root = self.client_root(id);
        self.interests
            .get(&root)
            .and_then(|ip| ip.client_bits())
            .map(|bits| bits.active)
            .unwrap_or(false)
    }

    /// Whether the interest's owner can absorb events right now.
    pub fn owner_ready(&self, id: InterestId) -> bool {
        match self.interest_owner(id) {
            Some(Owner::Internal(_)) => true,
            Some(Owner::Session { session, .. }) => self
                .sessions
                .get(&session)
                .map(|s| s.frame.ready_for_output())
                .unwrap_or(false),
            None => false,
        }
    }

    /// Deliver an event for this interest. DirEntries report under their
    /// parent's request with the bare entry name.
    pub fn post_event(&mut self, id: InterestId, event: Event) {
        let Some(ip) = self.interests.get(&id) else {
            return;
        };
        let root = ip.entry_parent().unwrap_or(id);
        let path = ip.name.as_os_str().as_bytes().to_vec();
        let Some(owner) = self
            .interests
            .get(&root)
            .and_then(|root_ip| root_ip.client_bits())
            .map(|bits| bits.owner)
        else {
            return;
        };
        match owner {
            Owner::Session { session, request } => {
                self.session_send_event(session, event, request, &path);
            }
            Owner::Internal(hook) => self.internal_event(hook, event),
        }
    }

    /// Mark dirty and scan now if the owner is ready, else queue the scan
    /// for the output-unblock edge.
    pub fn interest_scan(&mut self, id: InterestId) -> bool {
        let Some(ip) = self.interests.get_mut(&id) else {
            return false;
        };
        ip.dirty = true;
        if self.owner_ready(id) {
            self.interest_do_scan(id)
        } else {
            if let Some(Owner::Session { session, .. }) = self.interest_owner(id) {
                self.enqueue_for_scan(session, id);
            }
            false
        }
    }

    /// Forget a pending queued scan.
    pub fn interest_unscan(&mut self, id: InterestId) {
        let dirty = self.interests.get(&id).map(|ip| ip.dirty).unwrap_or(false);
        if dirty {
            if let Some(Owner::Session { session, .. }) = self.interest_owner(id) {
                self.dequeue_from_scan(session, id);
            }
        }
    }

    /// Run a scan appropriate to the interest's kind.
    pub fn interest_do_scan(&mut self, id: InterestId) -> bool {
        enum Shape {
            File,
            Dir,
            Entry,
        }
        let shape = match self.interests.get(&id).map(|ip| &ip.kind) {
            Some(Kind::File(_)) => Shape::File,
            Some(Kind::Dir(..)) => Shape::Dir,
            Some(Kind::Entry { .. }) => Shape::Entry,
            None => return false,
        };
        match shape {
            Shape::File => {
                let dirty = self.interests.get(&id).map(|ip| ip.dirty).unwrap_or(false);
                if !dirty || !self.interest_active(id) {
                    return false;
                }
                if let Some(cred) = self.interest_cred(id) {
                    self.creds.become_user(&cred);
                }
                self.interest_base_scan(id)
            }
            Shape::Dir => self.dir_do_scan(id),
            Shape::Entry => self.entry_do_scan(id, true),
        }
    }

    /// DirEntry scan: stat relative to the chdir'd parent.
    pub fn entry_do_scan(&mut self, id: InterestId, chdir: bool) -> bool {
        let Some(parent) = self.interests.get(&id).and_then(|ip| ip.entry_parent()) else {
            return false;
        };
        let dirty = self.interests.get(&id).map(|ip| ip.dirty).unwrap_or(false);
        if !dirty || !self.interest_active(id) {
            return false;
        }
        if chdir {
            if let Some(cred) = self.interest_cred(id) {
                self.creds.become_user(&cred);
            }
            if !self.chdir_to(parent) {
                return false;
            }
        }
        let changed = self.interest_base_scan(id);
        if chdir {
            self.chdir_root();
        }
        changed
    }

    /// The kind-independent part of a scan: diff the stat, post the
    /// resulting events, report exec transitions.
    pub fn interest_base_scan(&mut self, id: InterestId) -> bool {
        let dirty = self.interests.get(&id).map(|ip| ip.dirty).unwrap_or(false);
        if !dirty || !self.interest_active(id) {
            return false;
        }
        let did_exist = match self.interests.get_mut(&id) {
            Some(ip) => {
                ip.dirty = false;
                ip.exists()
            }
            None => return false,
        };
        let stat_changed = self.interest_do_stat(id);
        let exists_now = self
            .interests
            .get(&id)
            .map(|ip| ip.exists())
            .unwrap_or(false);
        if stat_changed && did_exist && exists_now {
            self.post_event(id, Event::Changed);
        }
        self.report_exec_state(id);
        stat_changed
    }

    /// Re-stat and compare. Posts Created/Deleted on existence edges and
    /// moves the interest between kernel and polling coverage; returns
    /// whether the watched fields moved.
    pub fn interest_do_stat(&mut self, id: InterestId) -> bool {
        let Some(name) = self.interests.get(&id).map(|ip| ip.name.clone()) else {
            return false;
        };
        let status = match nix::sys::stat::lstat(&name) {
            Ok(st) => StatSnap::from_stat(&st),
            Err(nix::errno::Errno::ETIMEDOUT) => {
                // NFS server unreachable; pretend nothing happened and
                // let polling retry.
                return false;
            }
            Err(_) => StatSnap::default(),
        };

        let (old, old_dev, old_ino) = match self.interests.get_mut(&id) {
            Some(ip) => {
                let old = ip.stat;
                ip.stat = status;
                (old, ip.dev, ip.ino)
            }
            None => return false,
        };
        let did_exist = old.exists();
        let exists = status.exists();
        let stat_changed = status.differs_from(&old);

        let mut keep_polling = false;
        if status.dev != old_dev || status.ino != old_ino {
            keep_polling = self.interest_rechain(id, status.dev, status.ino);
        }

        if exists && !did_exist {
            self.post_event(id, Event::Created);
            if !keep_polling {
                self.ll_notify_created(id);
            }
        } else if did_exist && !exists {
            self.post_event(id, Event::Deleted);
            self.ll_notify_deleted(id);
        }
        stat_changed
    }

    /// Move the interest to a new identity chain, expressing the fresh
    /// identity to the kernel. Returns true when the express failed and
    /// the interest must stay on the polling wheel.
    pub fn interest_rechain(&mut self, id: InterestId, dev: u64, ino: u64) -> bool {
        self.interest_revoke(id);
        let name = match self.interests.get_mut(&id) {
            Some(ip) => {
                ip.dev = dev;
                ip.ino = ino;
                ip.name.clone()
            }
            None => return false,
        };
        if dev == 0 && ino == 0 {
            return false;
        }
        self.identity.entry((dev, ino)).or_default().push(id);
        let Daemon { imon, sched, .. } = self;
        imon.express(&name, sched).is_err()
    }

    /// Unchain from the identity index, revoking the kernel subscription
    /// only when no sibling still shares the identity.
    pub fn interest_revoke(&mut self, id: InterestId) {
        let Some(ip) = self.interests.get(&id) else {
            return;
        };
        let (dev, ino) = (ip.dev, ip.ino);
        if dev == 0 && ino == 0 {
            return;
        }
        let name = ip.name.clone();
        let sibling_remains = match self.identity.get_mut(&(dev, ino)) {
            Some(chain) => {
                chain.retain(|&other| other != id);
                if chain.is_empty() {
                    self.identity.remove(&(dev, ino));
                    false
                } else {
                    true
                }
            }
            None => false,
        };
        if !sibling_remains {
            self.imon.revoke(&name, dev, ino);
        }
    }

    /// Post Executing/Exited when the exec state moved since last report.
    pub fn report_exec_state(&mut self, id: InterestId) {
        let Some(ip) = self.interests.get(&id) else {
            return;
        };
        if ip.executing == ip.reported_executing || !self.interest_active(id) {
            return;
        }
        let executing = ip.executing;
        self.post_event(
            id,
            if executing {
                Event::Executing
            } else {
                Event::Exited
            },
        );
        if let Some(ip) = self.interests.get_mut(&id) {
            ip.reported_executing = executing;
        }
    }

    /// Find a directory monitor's entry by name. An absolute path names
    /// the monitored directory itself.
    pub fn find_name(&self, root: InterestId, name: &[u8]) -> Option<InterestId> {
        if name.starts_with(b"/") {
            return Some(root);
        }
        let Some(Kind::Dir(_, dir)) = self.interests.get(&root).map(|ip| &ip.kind) else {
            return None;
        };
        dir.entries.iter().copied().find(|&entry| {
            self.interests
                .get(&entry)
                .map(|ep| ep.name.as_os_str().as_bytes() == name)
                .unwrap_or(false)
        })
    }

    /// Local filesystems move a freshly-materialised interest off the
    /// polling wheel (the kernel covers it now); remote ones leave it to
    /// the peer.
    pub fn ll_notify_created(&mut self, id: InterestId) {
        if self.interest_fs_is_local(id) {
            let Daemon {
                pollster, sched, ..
            } = self;
            pollster.forget_interest(id, sched);
        }
    }

    /// A vanished interest needs polling until it reappears.
    pub fn ll_notify_deleted(&mut self, id: InterestId) {
        if self.interest_fs_is_local(id) {
            let Daemon {
                pollster, sched, ..
            } = self;
            pollster.watch_interest(id, sched);
        }
    }

    fn interest_fs_is_local(&self, id: InterestId) -> bool {
        self.interest_fs(id)
            .and_then(|fs| self.filesystems.get(&fs))
            .map(|fs| fs.backend.is_local())
            .unwrap_or(true)
    }

    /// Suspend monitoring; no events flow until resume.
    pub fn interest_suspend(&mut self, id: InterestId) {
        if !self.interest_active(id) {
            return;
        }
        let (fs, fs_request) = {
            let Some(bits) = self
                .interests
                .get_mut(&id)
                .and_then(|ip| ip.client_bits_mut())
            else {
                return;
            };
            bits.active = false;
            (bits.fs, bits.fs_request)
        };
        self.fs_hl_suspend(fs, fs_request);
    }

    /// Resume monitoring. The active flag is set before any events are
    /// generated; modifications while suspended coalesce into at most one
    /// Changed.
    pub fn interest_resume(&mut self, id: InterestId) {
        let (was_active, fs, fs_request) = {
            let Some(bits) = self
                .interests
                .get_mut(&id)
                .and_then(|ip| ip.client_bits_mut())
            else {
                return;
            };
            let was = bits.active;
            bits.active = true;
            (was, bits.fs, bits.fs_request)
        };
        self.interest_do_scan(id);
        if !was_active {
            self.fs_hl_resume(fs, fs_request);
        }
        // Entries marked dirty while suspended get their scans back.
        let entries: Vec<InterestId> = match self.interests.get(&id).map(|ip| &ip.kind) {
            Some(Kind::Dir(_, dir)) => dir.entries.clone(),
            _ => Vec::new(),
        };
        for entry in entries {
            if self
                .interests
                .get(&entry)
                .map(|e| e.dirty)
                .unwrap_or(false)
            {
                self.interest_scan(entry);
            }
        }
    }

    /// Acknowledge a cancelled request. The interest is destroyed by the
    /// caller immediately afterwards.
    pub fn interest_cancel(&mut self, id: InterestId) {
        if let Some(bits) = self
            .interests
            .get_mut(&id)
            .and_then(|ip| ip.client_bits_mut())
        {
            // Force active so the acknowledgement is deliverable.
            bits.active = true;
        }
        self.post_event(id, Event::Acknowledge);
        self.interest_unscan(id);
    }

    /// Tear an interest down: children first, then the polling wheel, the
    /// identity index, the filesystem's resident set and the remote peer.
    pub fn destroy_interest(&mut self, id: InterestId) {
        // Recursively destroy directory entries.
        let (entries, scanning) = match self.interests.get_mut(&id).map(|ip| &mut ip.kind) {
            Some(Kind::Dir(_, dir)) => (std::mem::take(&mut dir.entries), dir.scanning),
            _ => (Vec::new(), false),
        };
        if scanning {
            self.drop_scanner_for(id);
        }
        for entry in entries {
            self.destroy_interest(entry);
        }

        self.interest_unscan(id);
        {
            let Daemon {
                pollster, sched, ..
            } = self;
            pollster.forget_interest(id, sched);
        }
        self.interest_revoke(id);

        let Some(ip) = self.interests.remove(&id) else {
            return;
        };
        if let Some(bits) = ip.client_bits() {
            let (fs, fs_request) = (bits.fs, bits.fs_request);
            self.fs_cancel(fs, id, fs_request);
        }
        debug!("destroyed interest in {:?}", ip.name);
    }

    /// A mount-table change may have moved this interest to a different
    /// filesystem; re-run the lookup and re-home it if so.
    pub fn interest_refind_filesystem(&mut self, id: InterestId) {
        let (name, cred, old_fs, fs_request) = {
            let Some(ip) = self.interests.get(&id) else {
                return;
            };
            let Some(bits) = ip.client_bits() else {
                return;
            };
            (ip.name.clone(), bits.cred.clone(), bits.fs, bits.fs_request)
        };
        let new_fs = self.fstable_find(&name, &cred);
        if new_fs == old_fs {
            return;
        }
        info!("relocating {:?} to a different filesystem", name);
        self.fs_cancel(old_fs, id, fs_request);
        let is_dir = matches!(
            self.interests.get(&id).map(|ip| &ip.kind),
            Some(Kind::Dir(..))
        );
        let new_request = self.fs_monitor(new_fs, id, is_dir);
        if let Some(bits) = self
            .interests
            .get_mut(&id)
            .and_then(|ip| ip.client_bits_mut())
        {
            bits.fs = new_fs;
            bits.fs_request = new_request;
        }
        self.interest_scan(id);
    }
}
