//! Request credentials.
//!
//! A credential is the uid/gid/supplementary-groups triple a request is
//! served under. Credentials are interned (shared by content) because
//! every interest holds one and most clients use a single identity.
//!
//! The effective identity of the process is a global resource: before any
//! filesystem access on behalf of a request the core assumes that
//! request's credential. Switching is elided when the requested identity
//! is already in effect; there is no promise to restore root in between.

use std::collections::HashMap;
use std::rc::Rc;

use log::debug;
use log::warn;
use nix::unistd::Gid;
use nix::unistd::Uid;
use smallvec::SmallVec;

type Groups = SmallVec<[libc::gid_t; 8]>;

#[derive(Debug, Eq, Hash, PartialEq)]
struct CredData {
    uid: libc::uid_t,
    gid: libc::gid_t,
    // Supplementary groups, beyond the primary gid.
    groups: Groups,
}

/// A shared credential record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Cred(Rc<CredData>);

impl Cred {
    pub fn uid(&self) -> libc::uid_t {
        self.0.uid
    }

    pub fn gid(&self) -> libc::gid_t {
        self.0.gid
    }

    pub fn is_superuser(&self) -> bool {
        self.0.uid == 0
    }

    /// The `ngroups g1 g2 …` tail carried on forwarded monitor requests,
    /// or None when there are no supplementary groups.
    pub fn groups_tail(&self) -> Option<String> {
        if self.0.groups.is_empty() {
            return None;
        }
        let mut tail = self.0.groups.len().to_string();
        for gid in &self.0.groups {
            tail.push(' ');
            tail.push_str(&gid.to_string());
        }
        Some(tail)
    }
}

/// The intern table plus the process's current effective identity.
#[derive(Debug)]
pub struct CredTable {
    interned: HashMap<(libc::uid_t, libc::gid_t, Groups), Cred>,
    superuser: Cred,
    current: Cred,
    // Only a privileged process can switch identities; everyone else
    // keeps its own (which makes unprivileged test runs workable).
    can_switch: bool,
}

impl CredTable {
    pub fn new() -> CredTable {
        let superuser = Cred(Rc::new(CredData {
            uid: 0,
            gid: 0,
            groups: Groups::new(),
        }));
        CredTable {
            interned: HashMap::new(),
            superuser: superuser.clone(),
            current: superuser,
            can_switch: Uid::effective().is_root(),
        }
    }

    pub fn superuser(&self) -> Cred {
        self.superuser.clone()
    }

    /// Look up or create the shared record for an identity.
    pub fn intern(&mut self, uid: libc::uid_t, gid: libc::gid_t, groups: &[libc::gid_t]) -> Cred {
        if uid == 0 && gid == 0 && groups.is_empty() {
            return self.superuser.clone();
        }
        let key = (uid, gid, Groups::from_slice(groups));
        self.interned
            .entry(key)
            .or_insert_with(|| {
                Cred(Rc::new(CredData {
                    uid,
                    gid,
                    groups: Groups::from_slice(groups),
                }))
            })
            .clone()
    }

    /// Make `cred` the process's effective identity. Redundant switches
    /// are elided; failures are logged and ignored (the subsequent
    /// filesystem access fails with the real error).
    pub fn become_user(&mut self, cred: &Cred) {
        if !self.can_switch || Rc::ptr_eq(&self.current.0, &cred.0) {
            return;
        }
        // Regain privilege first; changing gid and groups requires it.
        if let Err(errno) = nix::unistd::seteuid(Uid::from_raw(0)) {
            warn!("can't restore superuser identity: {}", errno);
            return;
        }
        let mut groups: Vec<Gid> = Vec::with_capacity(1 + cred.0.groups.len());
        groups.push(Gid::from_raw(cred.gid()));
        groups.extend(cred.0.groups.iter().map(|&g| Gid::from_raw(g)));
        if let Err(errno) = nix::unistd::setgroups(&groups) {
            warn!("setgroups for uid {} failed: {}", cred.uid(), errno);
        }
        if let Err(errno) = nix::unistd::setegid(Gid::from_raw(cred.gid())) {
            warn!("setegid {} failed: {}", cred.gid(), errno);
        }
        if !cred.is_superuser() {
            if let Err(errno) = nix::unistd::seteuid(Uid::from_raw(cred.uid())) {
                warn!("seteuid {} failed: {}", cred.uid(), errno);
            }
        }
        debug!("now acting as uid {} gid {}", cred.uid(), cred.gid());
        self.current = cred.clone();
    }
}

/// Resolve a configured user name (or numeric id) to a credential.
pub fn resolve_user(table: &mut CredTable, name: &str) -> Option<Cred> {
    if let Ok(uid) = name.parse::<libc::uid_t>() {
        return Some(table.intern(uid, uid, &[]));
    }
    match nix::unistd::User::from_name(name) {
        Ok(Some(user)) => Some(table.intern(user.uid.as_raw(), user.gid.as_raw(), &[])),
        Ok(None) => None,
        Err(errno) => {
            warn!("can't look up user \"{}\": {}", name, errno);
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interning_shares_records() {
        let mut table = CredTable::new();
        let a = table.intern(100, 100, &[7, 8]);
        let b = table.intern(100, 100, &[7, 8]);
        assert!(Rc::ptr_eq(&a.0, &b.0));
        let c = table.intern(100, 100, &[7]);
        assert!(!Rc::ptr_eq(&a.0, &c.0));
    }

    #[test]
    fn superuser_is_canonical() {
        let mut table = CredTable::new();
        let root = table.intern(0, 0, &[]);
        assert_eq!(root, table.superuser());
        assert!(root.is_superuser());
    }

    #[test]
    fn groups_tail_format() {
        let mut table = CredTable::new();
        assert_eq!(table.intern(1, 1, &[]).groups_tail(), None);
        assert_eq!(
            table.intern(1, 1, &[20, 31]).groups_tail().as_deref(),
            Some("2 20 31")
        );
    }

    #[test]
    fn numeric_user_resolves_without_passwd() {
        let mut table = CredTable::new();
        let cred = resolve_user(&mut table, "12345").unwrap();
        assert_eq!(cred.uid(), 12345);
    }
}
