//! Per-filesystem behavior.
//!
//! Every mount-table entry is modelled by a `FileSystem` holding the set
//! of interests residing on it. The backend decides how monitoring is
//! done: local filesystems use the kernel monitor with polling fallback,
//! NFS filesystems forward everything to the peer daemon on the server
//! and only fall back to scanning directory entries themselves while the
//! peer is unreachable.

use std::os::unix::ffi::OsStrExt;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexSet;
use log::debug;
use log::error;

use crate::cred::Cred;
use crate::daemon::Daemon;
use crate::daemon::FsId;
use crate::daemon::HostId;
use crate::daemon::InterestId;

// Kernel defaults for the NFS attribute cache, seconds.
const ACREGMAX: u64 = 60;
const ACREGMIN: u64 = 3;

#[derive(Debug)]
pub enum Backend {
    Local,
    Nfs {
        host: HostId,
        /// Server-side export directory; "/" collapses to "" so it
        /// prepends cleanly to absolute paths.
        remote_dir: String,
        attr_cache_timeout: Duration,
    },
}

impl Backend {
    pub fn is_local(&self) -> bool {
        matches!(self, Backend::Local)
    }
}

#[derive(Debug)]
pub struct FileSystem {
    /// Mount point.
    pub dir: PathBuf,
    /// Device name ("/dev/sda1", "server:/export").
    pub fsname: String,
    pub interests: IndexSet<InterestId>,
    pub backend: Backend,
}

impl FileSystem {
    pub fn matches(&self, dir: &Path, fsname: &str) -> bool {
        self.dir == dir && self.fsname == fsname
    }

    pub fn attr_cache_timeout(&self) -> Duration {
        match &self.backend {
            Backend::Local => Duration::ZERO,
            Backend::Nfs {
                attr_cache_timeout, ..
            } => *attr_cache_timeout,
        }
    }
}

/// Split "server:/export" into host and remote directory.
pub fn split_nfs_fsname(fsname: &str) -> Option<(&str, &str)> {
    let (host, dir) = fsname.split_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host, if dir == "/" { "" } else { dir }))
}

/// Derive the attribute-cache staleness bound from mount options.
///
/// `noac` turns the cache off entirely; `actimeo` pins every bound at
/// once; otherwise the regular-file maximum (with its default floor)
/// governs. Conflicting combinations are reported and fall back to the
/// kernel default.
pub fn attr_cache_timeout_from(opts: &str) -> Duration {
    let mut noac = false;
    let mut actimeo = None;
    let mut acregmin = None;
    let mut acregmax = None;
    for opt in opts.split(',') {
        let (key, value) = match opt.split_once('=') {
            Some((key, value)) => (key, Some(value)),
            None => (opt, None),
        };
        match key {
            "noac" => noac = true,
            "actimeo" => actimeo = value.and_then(|v| v.parse::<u64>().ok()),
            "acregmin" => acregmin = value.and_then(|v| v.parse::<u64>().ok()),
            "acregmax" => acregmax = value.and_then(|v| v.parse::<u64>().ok()),
            _ => {}
        }
    }

    let secs = if noac {
        if actimeo.is_none() && acregmin.is_none() && acregmax.is_none() {
            0
        } else {
            error!("both noac and (actimeo, acregmin, or acregmax) were set");
            ACREGMAX
        }
    } else if let Some(actimeo) = actimeo {
        if acregmin.is_none() && acregmax.is_none() {
            actimeo
        } else {
            error!("both actimeo and (acregmin or acregmax) were set");
            ACREGMAX
        }
    } else if let Some(max) = acregmax {
        match acregmin {
            Some(min) if min > max => {
                error!("acregmin was greater than acregmax");
                ACREGMAX
            }
            Some(_) => max,
            None if ACREGMIN <= max => max,
            None => {
                error!("acregmax was less than the default for acregmin");
                ACREGMAX
            }
        }
    } else if let Some(min) = acregmin {
        min.max(ACREGMAX)
    } else {
        ACREGMAX
    };
    Duration::from_secs(secs)
}

// Glue a canonicalised local path (plus any components that could not be
// canonicalised) onto the remote prefix.
fn join_remote(remote_dir: &str, local_dir: &Path, real: &Path, tail: Option<&Path>) -> Vec<u8> {
    let mut mapped: Vec<u8> = remote_dir.as_bytes().to_vec();
    let rest = real.strip_prefix(local_dir).unwrap_or(real);
    if !rest.as_os_str().is_empty() {
        mapped.push(b'/');
        mapped.extend_from_slice(rest.as_os_str().as_bytes());
    }
    if let Some(tail) = tail {
        for comp in tail.components() {
            if let Component::Normal(name) = comp {
                mapped.push(b'/');
                mapped.extend_from_slice(name.as_bytes());
            }
        }
    }
    if mapped.is_empty() {
        mapped.push(b'/');
    }
    mapped
}

impl Daemon {
    /// Start monitoring `id` on this filesystem. Returns the remote-side
    /// request id (zero for local backends).
    pub fn fs_monitor(&mut self, fs: FsId, id: InterestId, is_dir: bool) -> u64 {
        let Some(filesystem) = self.filesystems.get_mut(&fs) else {
            return 0;
        };
        filesystem.interests.insert(id);
        let Backend::Nfs { host, .. } = &filesystem.backend else {
            return 0;
        };
        let host = *host;
        let Some(cred) = self.interest_cred(id) else {
            return 0;
        };
        let Some(path) = self.interests.get(&id).map(|ip| ip.name.clone()) else {
            return 0;
        };
        let remote_path = self.fs_map_path(fs, &path, &cred);
        self.host_send_monitor(host, id, is_dir, &remote_path, &cred)
    }

    /// Stop monitoring `id` here, telling the peer when one is involved.
    pub fn fs_cancel(&mut self, fs: FsId, id: InterestId, fs_request: u64) {
        let host = match self.filesystems.get_mut(&fs) {
            Some(filesystem) => {
                let host = match filesystem.backend {
                    Backend::Nfs { host, .. } => Some(host),
                    Backend::Local => None,
                };
                filesystem.interests.shift_remove(&id);
                host
            }
            None => None,
        };
        if let Some(host) = host {
            if fs_request != 0 {
                self.host_send_cancel(host, fs_request);
            }
        }
    }

    pub fn fs_hl_suspend(&mut self, fs: FsId, fs_request: u64) {
        if let Some(Backend::Nfs { host, .. }) = self.filesystems.get(&fs).map(|f| &f.backend) {
            let host = *host;
            if fs_request != 0 {
                self.host_send_suspend(host, fs_request);
            }
        }
    }

    pub fn fs_hl_resume(&mut self, fs: FsId, fs_request: u64) {
        if let Some(Backend::Nfs { host, .. }) = self.filesystems.get(&fs).map(|f| &f.backend) {
            let host = *host;
            if fs_request != 0 {
                self.host_send_resume(host, fs_request);
            }
        }
    }

    /// Local monitoring at interest creation: if the kernel took the
    /// subscription the interest is covered, otherwise poll. Remote
    /// backends do neither; that is the peer's job.
    pub fn fs_ll_monitor(&mut self, fs: FsId, id: InterestId, kernel_ok: bool) {
        let local = self
            .filesystems
            .get(&fs)
            .map(|f| f.backend.is_local())
            .unwrap_or(true);
        if local && !kernel_ok {
            if let Some(ip) = self.interests.get(&id) {
                debug!("will poll {:?}", ip.name);
            }
            let Daemon {
                pollster, sched, ..
            } = self;
            pollster.watch_interest(id, sched);
        }
    }

    /// Whether a directory monitor on this filesystem should scan its own
    /// entries. True locally; true remotely only while the peer daemon is
    /// unreachable (it enumerates on the server otherwise).
    pub fn fs_dir_entries_scanned(&self, fs: FsId) -> bool {
        match self.filesystems.get(&fs).map(|f| &f.backend) {
            Some(Backend::Nfs { host, .. }) => self
                .hosts
                .get(host)
                .map(|h| !h.is_connected())
                .unwrap_or(true),
            _ => true,
        }
    }

    /// Map a local path to the peer's view of it. Canonicalisation runs
    /// under the request credential; when an intermediate component does
    /// not exist, trailing components are peeled off until the rest
    /// canonicalises and are re-appended verbatim.
    pub fn fs_map_path(&mut self, fs: FsId, path: &Path, cred: &Cred) -> Vec<u8> {
        let (local_dir, remote_dir) = match self.filesystems.get(&fs) {
            Some(filesystem) => match &filesystem.backend {
                Backend::Nfs { remote_dir, .. } => {
                    (filesystem.dir.clone(), remote_dir.clone())
                }
                Backend::Local => return path.as_os_str().as_bytes().to_vec(),
            },
            None => return path.as_os_str().as_bytes().to_vec(),
        };
        self.creds.become_user(cred);
        match std::fs::canonicalize(path) {
            Ok(real) => join_remote(&remote_dir, &local_dir, &real, None),
            Err(_) => {
                let mut prefix = path.to_path_buf();
                let mut peeled = PathBuf::new();
                loop {
                    let Some(name) = prefix.file_name().map(|n| n.to_owned()) else {
                        break join_remote(&remote_dir, &local_dir, &prefix, Some(&peeled));
                    };
                    peeled = match peeled.as_os_str().is_empty() {
                        true => PathBuf::from(&name),
                        false => PathBuf::from(&name).join(&peeled),
                    };
                    prefix.pop();
                    if let Ok(real) = std::fs::canonicalize(&prefix) {
                        break join_remote(&remote_dir, &local_dir, &real, Some(&peeled));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nfs_fsname_splits() {
        assert_eq!(
            split_nfs_fsname("server:/export/a"),
            Some(("server", "/export/a"))
        );
        assert_eq!(split_nfs_fsname("server:/"), Some(("server", "")));
        assert_eq!(split_nfs_fsname("/dev/sda1"), None);
    }

    #[test]
    fn attr_cache_defaults() {
        assert_eq!(attr_cache_timeout_from("rw,hard"), Duration::from_secs(60));
    }

    #[test]
    fn attr_cache_noac_disables() {
        assert_eq!(attr_cache_timeout_from("rw,noac"), Duration::ZERO);
        // Conflicting options keep the default.
        assert_eq!(
            attr_cache_timeout_from("noac,actimeo=9"),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn attr_cache_actimeo_wins_alone() {
        assert_eq!(
            attr_cache_timeout_from("rw,actimeo=11"),
            Duration::from_secs(11)
        );
        assert_eq!(
            attr_cache_timeout_from("actimeo=11,acregmax=30"),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn attr_cache_acreg_bounds() {
        assert_eq!(
            attr_cache_timeout_from("acregmin=5,acregmax=20"),
            Duration::from_secs(20)
        );
        assert_eq!(
            attr_cache_timeout_from("acregmin=30,acregmax=20"),
            Duration::from_secs(60)
        );
        assert_eq!(
            attr_cache_timeout_from("acregmax=1"),
            Duration::from_secs(60)
        );
        assert_eq!(
            attr_cache_timeout_from("acregmin=90"),
            Duration::from_secs(90)
        );
        assert_eq!(
            attr_cache_timeout_from("acregmin=10"),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn remote_paths_join() {
        let local = Path::new("/mnt/nfs");
        assert_eq!(
            join_remote("/export", local, Path::new("/mnt/nfs/a/b"), None),
            b"/export/a/b".to_vec()
        );
        // Root export: "" prefix.
        assert_eq!(
            join_remote("", local, Path::new("/mnt/nfs/a"), None),
            b"/a".to_vec()
        );
        // Monitoring the mount point of a root export itself.
        assert_eq!(join_remote("", local, Path::new("/mnt/nfs"), None), b"/".to_vec());
        // Peeled suffix is re-appended.
        assert_eq!(
            join_remote("/export", local, Path::new("/mnt/nfs/a"), Some(Path::new("x/y"))),
            b"/export/a/x/y".to_vec()
        );
    }
}
