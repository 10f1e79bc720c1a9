//! Directory enumeration and reconciliation.
//!
//! A scan reconciles a directory's on-disk contents with its known entry
//! list. The scanner is an object because a scan can be interrupted
//! whenever the client's output blocks: its cursor, list position and
//! scratch state survive across suspensions, and the session steps it
//! again on the output-unblock edge.
//!
//! Relative-path discipline: the scanner chdirs into the directory,
//! operates on bare names, and chdirs back to "/" before returning. The
//! working directory is process-wide, so a global current-directory
//! pointer elides redundant chdir calls.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;

use log::debug;
use log::info;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use crate::daemon::Daemon;
use crate::daemon::InterestId;
use crate::event::Event;
use crate::interest::Interest;
use crate::interest::Kind;
use crate::interest::Owner;
use crate::interest::StatSnap;

/// What one step of the scanner accomplished.
#[derive(Debug, Eq, PartialEq)]
pub enum Step {
    Done,
    /// Output blocked; resume on the unblock edge.
    WouldBlock,
}

/// Distinguishes the initial enumeration from rescans.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanKind {
    /// Existing entries announce themselves; EndExist closes the pass.
    Initial,
    Rescan,
}

/// A resumable directory scan.
pub struct DirScanner {
    pub dir: InterestId,
    new_event: Event,
    scan_entries: bool,
    kind: ScanKind,
    cursor: Option<nix::dir::OwningIter>,
    open_attempted: bool,
    /// Position in the directory's entry list; everything before it has
    /// been matched this pass.
    head: usize,
    /// Entries spliced out of the main list awaiting reclassification.
    discard: Vec<InterestId>,
}

impl std::fmt::Debug for DirScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirScanner")
            .field("dir", &self.dir)
            .field("new_event", &self.new_event)
            .field("kind", &self.kind)
            .field("head", &self.head)
            .field("discard", &self.discard)
            .finish_non_exhaustive()
    }
}

impl DirScanner {
    pub fn new(dir: InterestId, new_event: Event, scan_entries: bool, kind: ScanKind) -> DirScanner {
        DirScanner {
            dir,
            new_event,
            scan_entries,
            kind,
            cursor: None,
            open_attempted: false,
            head: 0,
            discard: Vec::new(),
        }
    }
}

impl Daemon {
    /// Scan a monitored directory. The stat diff runs first (a directory
    /// that stopped being one reports Changed after any Deleted, as it
    /// always has); then a scanner reconciles the entries.
    pub fn dir_do_scan(&mut self, id: InterestId) -> bool {
        let Some(ip) = self.interests.get(&id) else {
            return false;
        };
        let Kind::Dir(bits, dir) = &ip.kind else {
            return false;
        };
        if !bits.active || !ip.dirty || dir.scanning {
            return false;
        }
        if let Some(cred) = self.interest_cred(id) {
            self.creds.become_user(&cred);
        }
        let stat_changed = self.interest_do_stat(id);
        let still_dir = self.interests.get(&id).map(|ip| ip.is_dir()).unwrap_or(false);
        if stat_changed && !still_dir {
            self.post_event(id, Event::Changed);
        }
        let scan_entries = self
            .interest_fs(id)
            .map(|fs| self.fs_dir_entries_scanned(fs))
            .unwrap_or(true);
        self.start_scan(id, Event::Created, scan_entries, ScanKind::Rescan);
        stat_changed
    }

    /// The initial enumeration of a fresh directory monitor.
    pub fn dir_initial_scan(&mut self, id: InterestId) {
        self.start_scan(id, Event::Exists, false, ScanKind::Initial);
    }

    fn start_scan(&mut self, id: InterestId, new_event: Event, scan_entries: bool, kind: ScanKind) {
        if let Some(Kind::Dir(_, dir)) = self.interests.get_mut(&id).map(|ip| &mut ip.kind) {
            debug_assert!(!dir.scanning);
            dir.scanning = true;
        } else {
            return;
        }
        let mut scanner = DirScanner::new(id, new_event, scan_entries, kind);
        match self.interest_owner(id) {
            Some(Owner::Session { session, .. }) => {
                if self.scanner_step(&mut scanner) == Step::WouldBlock {
                    self.enqueue_scanner(session, scanner);
                }
            }
            _ => {
                // Internal owners are always ready; drive to completion.
                while self.scanner_step(&mut scanner) == Step::WouldBlock {}
            }
        }
    }

    /// Run the scanner until it finishes or output blocks.
    pub fn scanner_step(&mut self, scanner: &mut DirScanner) -> Step {
        let dir_id = scanner.dir;
        if !self.interests.contains_key(&dir_id) {
            return Step::Done;
        }
        if !self.owner_ready(dir_id) {
            return Step::WouldBlock;
        }
        if let Some(cred) = self.interest_cred(dir_id) {
            self.creds.become_user(&cred);
        }

        if !self.chdir_to(dir_id) {
            // Unreadable directory: it has no contents until it becomes
            // readable again.
            return match self.scanner_flush_departed(scanner, 0) {
                Step::Done => {
                    self.scanner_complete(scanner);
                    Step::Done
                }
                Step::WouldBlock => Step::WouldBlock,
            };
        }

        if !scanner.open_attempted {
            scanner.open_attempted = true;
            match nix::dir::Dir::open(".", OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty()) {
                Ok(handle) => scanner.cursor = Some(handle.into_iter()),
                Err(errno) => {
                    info!("can't read directory of interest: {}", errno);
                    scanner.cursor = None;
                }
            }
        }

        while scanner.cursor.is_some() {
            let name = match scanner.cursor.as_mut().and_then(|it| it.next()) {
                None => {
                    scanner.cursor = None;
                    break;
                }
                Some(Err(errno)) => {
                    debug!("readdir failed: {}", errno);
                    scanner.cursor = None;
                    break;
                }
                Some(Ok(entry)) => entry.file_name().to_bytes().to_vec(),
            };
            if name == b"." || name == b".." {
                continue;
            }
            if self.scanner_take_name(scanner, &name) == Step::WouldBlock {
                self.chdir_root();
                return Step::WouldBlock;
            }
        }

        self.chdir_root();

        match self.scanner_flush_departed(scanner, scanner.head) {
            Step::Done => {
                self.scanner_complete(scanner);
                Step::Done
            }
            Step::WouldBlock => Step::WouldBlock,
        }
    }

    // One readdir name against the entry list. Four cases: in place,
    // on the discard list, further down the list, or genuinely new.
    fn scanner_take_name(&mut self, scanner: &mut DirScanner, name: &[u8]) -> Step {
        enum NameMatch {
            InPlace,
            FromDiscard(usize),
            Further(usize),
            New,
        }

        let dir_id = scanner.dir;
        let decision = {
            let Some(Kind::Dir(_, dir)) = self.interests.get(&dir_id).map(|ip| &ip.kind) else {
                return Step::Done;
            };
            let entries = &dir.entries;
            if entries
                .get(scanner.head)
                .is_some_and(|&ep| self.entry_named(ep, name))
            {
                NameMatch::InPlace
            } else if let Some(at) = scanner
                .discard
                .iter()
                .position(|&ep| self.entry_named(ep, name))
            {
                NameMatch::FromDiscard(at)
            } else if let Some(off) = entries
                .iter()
                .skip(scanner.head + 1)
                .position(|&ep| self.entry_named(ep, name))
            {
                NameMatch::Further(scanner.head + 1 + off)
            } else {
                NameMatch::New
            }
        };

        let matched: Option<InterestId> = match decision {
            NameMatch::InPlace => {
                // In-place match; the list is already right.
                Some(self.dir_entries_mut(dir_id)[scanner.head])
            }
            NameMatch::FromDiscard(at) => {
                let ep = scanner.discard.remove(at);
                self.dir_entries_mut(dir_id).insert(scanner.head, ep);
                Some(ep)
            }
            NameMatch::Further(at) => {
                // Splice the intervening segment onto discard, leaving
                // the match at head.
                let seg: Vec<InterestId> = self
                    .dir_entries_mut(dir_id)
                    .drain(scanner.head..at)
                    .collect();
                scanner.discard.extend(seg);
                Some(self.dir_entries_mut(dir_id)[scanner.head])
            }
            NameMatch::New => None,
        };

        match matched {
            Some(ep) => {
                if scanner.scan_entries {
                    self.entry_scan_no_chdir(ep);
                    if !self.owner_ready(dir_id) {
                        scanner.head += 1;
                        return Step::WouldBlock;
                    }
                }
                scanner.head += 1;
                Step::Done
            }
            None => {
                // New entry. Do not scan it in the same pass it appeared.
                let ep = self.new_dir_entry(dir_id, name);
                self.dir_entries_mut(dir_id).insert(scanner.head, ep);
                scanner.head += 1;
                self.post_event(ep, scanner.new_event);
                if !self.owner_ready(dir_id) {
                    return Step::WouldBlock;
                }
                Step::Done
            }
        }
    }

    // Names remaining past the cursor, and everything still on discard,
    // have left the directory: report and destroy them.
    fn scanner_flush_departed(&mut self, scanner: &mut DirScanner, from: usize) -> Step {
        loop {
            let next: Option<InterestId> = {
                let Some(Kind::Dir(_, dir)) = self.interests.get(&scanner.dir).map(|ip| &ip.kind)
                else {
                    return Step::Done;
                };
                dir.entries.get(from).copied()
            };
            let Some(ep) = next else { break };
            if !self.owner_ready(scanner.dir) {
                return Step::WouldBlock;
            }
            self.dir_entries_mut(scanner.dir).remove(from);
            self.post_event(ep, Event::Deleted);
            self.destroy_interest(ep);
        }
        while let Some(&ep) = scanner.discard.first() {
            if !self.owner_ready(scanner.dir) {
                return Step::WouldBlock;
            }
            scanner.discard.remove(0);
            self.post_event(ep, Event::Deleted);
            self.destroy_interest(ep);
        }
        if self.owner_ready(scanner.dir) {
            Step::Done
        } else {
            Step::WouldBlock
        }
    }

    // The scanning bit is cleared only here, and the initial enumeration
    // announces its end.
    fn scanner_complete(&mut self, scanner: &DirScanner) {
        if let Some(Kind::Dir(_, dir)) = self.interests.get_mut(&scanner.dir).map(|ip| &mut ip.kind)
        {
            dir.scanning = false;
        }
        if scanner.kind == ScanKind::Initial {
            self.post_event(scanner.dir, Event::EndExist);
        }
    }

    fn entry_named(&self, ep: InterestId, name: &[u8]) -> bool {
        self.interests
            .get(&ep)
            .map(|ip| ip.name.as_os_str().as_bytes() == name)
            .unwrap_or(false)
    }

    fn dir_entries_mut(&mut self, dir_id: InterestId) -> &mut Vec<InterestId> {
        match self.interests.get_mut(&dir_id).map(|ip| &mut ip.kind) {
            Some(Kind::Dir(_, dir)) => &mut dir.entries,
            _ => unreachable!("scanner runs on directories"),
        }
    }

    // Scan a surviving entry while already chdir'd into the parent.
    fn entry_scan_no_chdir(&mut self, ep: InterestId) {
        let Some(ip) = self.interests.get_mut(&ep) else {
            return;
        };
        ip.dirty = true;
        if self.owner_ready(ep) {
            self.entry_do_scan(ep, false);
        } else if let Some(Owner::Session { session, .. }) = self.interest_owner(ep) {
            self.enqueue_for_scan(session, ep);
        }
    }

    /// Create the interest for a directory entry discovered by a scan.
    /// The working directory is the parent, so the bare name resolves.
    pub fn new_dir_entry(&mut self, parent: InterestId, name: &[u8]) -> InterestId {
        let id = self.alloc_interest_id();
        let path = PathBuf::from(OsStr::from_bytes(name));
        let (snap, kernel_ok) = {
            let Daemon { imon, sched, .. } = self;
            match imon.express(&path, sched) {
                Ok(st) => (StatSnap::from_stat(&st), true),
                Err(_) => {
                    let snap = nix::sys::stat::lstat(&path)
                        .map(|st| StatSnap::from_stat(&st))
                        .unwrap_or_default();
                    (snap, false)
                }
            }
        };
        self.interests.insert(
            id,
            Interest {
                name: path,
                dev: snap.dev,
                ino: snap.ino,
                stat: snap,
                dirty: false,
                executing: false,
                reported_executing: false,
                kind: Kind::Entry { parent },
            },
        );
        if snap.dev != 0 || snap.ino != 0 {
            self.identity.entry((snap.dev, snap.ino)).or_default().push(id);
        }
        if let Some(fs) = self.interest_fs(id) {
            self.fs_ll_monitor(fs, id, kernel_ok);
        }
        id
    }

    /// Change the working directory to a monitored directory's path.
    pub fn chdir_to(&mut self, dir_id: InterestId) -> bool {
        if self.current_dir == Some(dir_id) {
            return true;
        }
        let Some(path) = self.interests.get(&dir_id).map(|ip| ip.name.clone()) else {
            return false;
        };
        match nix::unistd::chdir(&path) {
            Ok(()) => {
                debug!("+chdir to {:?}", path);
                self.current_dir = Some(dir_id);
                true
            }
            Err(errno) => {
                info!("can't chdir({:?}): {}", path, errno);
                if errno == nix::errno::Errno::EACCES {
                    if let Some(Owner::Session { session, .. }) = self.interest_owner(dir_id) {
                        self.suggest_insecure_compat(session, &path);
                    }
                }
                false
            }
        }
    }

    /// Return to the root directory if anyone chdir'd away.
    pub fn chdir_root(&mut self) {
        if self.current_dir.take().is_some() {
            let _ = nix::unistd::chdir(Path::new("/"));
            debug!("-chdir to \"/\"");
        }
    }
}
