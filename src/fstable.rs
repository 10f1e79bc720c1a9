//! The mount-table model.
//!
//! Two maps name the filesystems: by mount point, rebuilt whenever the
//! mount table changes, and by statvfs filesystem id, filled lazily so we
//! only statvfs when a lookup actually needs it (statvfs can hang when an
//! NFS server is down) and flushed wholesale on every rebuild.
//!
//! The daemon watches the mount table file through an internal interest;
//! a rebuild keeps filesystems whose mount point and device both still
//! match, creates backends for new entries, and relocates interests in
//! two passes, parents of new mounts first and dismounted filesystems
//! second, so a mount layered over a monitored subtree claims its interests
//! before the dying parent scatters them.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use std::path::PathBuf;

use log::debug;
use log::error;

use crate::cred::Cred;
use crate::daemon::Daemon;
use crate::daemon::FsId;
use crate::daemon::InterestId;
use crate::filesystem::Backend;
use crate::filesystem::FileSystem;
use crate::filesystem::attr_cache_timeout_from;
use crate::filesystem::split_nfs_fsname;
use crate::interest::Hook;

/// The mount table file we watch.
pub const MTAB_PATH: &str = "/etc/mtab";

const NFS_TYPES: &[&str] = &["nfs", "nfs2", "nfs3", "nfs4", "cachefs"];

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountEntry {
    pub fsname: String,
    pub dir: PathBuf,
    pub fstype: String,
    pub opts: String,
}

impl MountEntry {
    pub fn is_nfs(&self) -> bool {
        NFS_TYPES.contains(&self.fstype.as_str()) && self.fsname.contains(':')
    }
}

/// Parse mount-table lines: `fsname dir type opts freq passno`, with the
/// usual octal escapes in the name fields.
pub fn parse_mounts<R: BufRead>(reader: R) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    for line in reader.lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_ascii_whitespace();
        let (Some(fsname), Some(dir), Some(fstype)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let opts = fields.next().unwrap_or("").to_owned();
        entries.push(MountEntry {
            fsname: unescape_octal(fsname),
            dir: PathBuf::from(unescape_octal(dir)),
            fstype: fstype.to_owned(),
            opts,
        });
    }
    entries
}

// /etc/mtab is a symlink into /proc on anything modern, but be ready to
// read the real thing when the symlink is missing.
fn open_mount_table() -> std::io::Result<std::fs::File> {
    match std::fs::File::open(MTAB_PATH) {
        Ok(file) => Ok(file),
        Err(_) => std::fs::File::open("/proc/mounts"),
    }
}

// "\040" and friends, as written by the kernel for embedded whitespace.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if value < 256 {
                    out.push(value as u8);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// The two lookup maps plus the mount-table watcher.
#[derive(Debug, Default)]
pub struct FsTable {
    pub by_name: HashMap<PathBuf, FsId>,
    pub by_fsid: HashMap<u64, FsId>,
    pub root: Option<FsId>,
    pub watcher: Option<InterestId>,
}

impl Daemon {
    /// First build of the table, plus the internal interest that keeps it
    /// current.
    pub fn fstable_init(&mut self) {
        self.fstable_rebuild();
        let cred = self.creds.superuser();
        let watcher =
            self.new_internal_interest(PathBuf::from(MTAB_PATH), Hook::MountTable, cred);
        self.fstab.watcher = watcher;
    }

    /// Rebuild from the current mount table, keeping matching
    /// filesystems and relocating interests off everything else.
    pub fn fstable_rebuild(&mut self) {
        let superuser = self.creds.superuser();
        self.creds.become_user(&superuser);
        let mut entries = match open_mount_table() {
            Ok(file) => parse_mounts(std::io::BufReader::new(file)),
            Err(err) => {
                error!("couldn't read a mount table: {}", err);
                Vec::new()
            }
        };
        if !entries.iter().any(|e| e.dir == Path::new("/")) {
            // A daemon with no notion of the root filesystem can't
            // place interests at all; treat everything as one local
            // filesystem rather than giving up.
            error!("couldn't find / in {}; assuming a bare root", MTAB_PATH);
            entries.push(MountEntry {
                fsname: "rootfs".to_owned(),
                dir: PathBuf::from("/"),
                fstype: "rootfs".to_owned(),
                opts: String::new(),
            });
        }

        self.fstab.by_fsid.clear();

        let had_old_table = !self.fstab.by_name.is_empty();
        let mut new_by_name: HashMap<PathBuf, FsId> = HashMap::new();
        let mut dismounted: HashMap<PathBuf, FsId> = self.fstab.by_name.clone();
        let mut mount_parents: Vec<FsId> = Vec::new();
        let mut root = None;

        for entry in entries {
            let existing = self.fstab.by_name.get(&entry.dir).copied().filter(|fs| {
                self.filesystems
                    .get(fs)
                    .map(|f| f.matches(&entry.dir, &entry.fsname))
                    .unwrap_or(false)
            });
            let fs = match existing {
                Some(fs) => {
                    debug!("mtab: match \"{}\" on {:?}", entry.fsname, entry.dir);
                    dismounted.remove(&entry.dir);
                    fs
                }
                None => {
                    let fs = self.new_filesystem(&entry);
                    if had_old_table {
                        // Resolved against the old table, still installed.
                        let parent = self.fstable_longest_prefix(&entry.dir);
                        if !mount_parents.contains(&parent) {
                            mount_parents.push(parent);
                        }
                    }
                    fs
                }
            };
            if entry.dir == Path::new("/") {
                root = Some(fs);
            }
            new_by_name.insert(entry.dir, fs);
        }

        let Some(root) = root else { return };

        self.fstab.by_name = new_by_name;
        self.fstab.root = Some(root);

        // A new mount over a monitored subtree claims its interests
        // before the dismounted pass can relocate them elsewhere.
        for fs in mount_parents {
            if self.filesystems.contains_key(&fs) {
                debug!("mtab: relocating interests in parent filesystem");
                self.relocate_interests(fs);
            }
        }
        for (_, fs) in dismounted {
            if let Some(filesystem) = self.filesystems.get(&fs) {
                debug!(
                    "mtab: dismount \"{}\" on {:?}",
                    filesystem.fsname, filesystem.dir
                );
            }
            self.relocate_interests(fs);
            self.destroy_filesystem(fs);
        }
        debug!("mtab done");
    }

    fn new_filesystem(&mut self, entry: &MountEntry) -> FsId {
        let backend = if entry.is_nfs() {
            let (host_name, remote_dir) = split_nfs_fsname(&entry.fsname)
                .expect("is_nfs guarantees a host part");
            debug!(
                "mtab: new NFS \"{}\" on {:?} using <{}>",
                entry.fsname, entry.dir, entry.fstype
            );
            let host = self.host_intern(host_name);
            Backend::Nfs {
                host,
                remote_dir: remote_dir.to_owned(),
                attr_cache_timeout: attr_cache_timeout_from(&entry.opts),
            }
        } else {
            debug!("mtab: new local \"{}\" on {:?}", entry.fsname, entry.dir);
            Backend::Local
        };
        let fs = self.alloc_fs_id();
        self.filesystems.insert(
            fs,
            FileSystem {
                dir: entry.dir.clone(),
                fsname: entry.fsname.clone(),
                interests: Default::default(),
                backend,
            },
        );
        fs
    }

    fn relocate_interests(&mut self, fs: FsId) {
        let residents: Vec<InterestId> = match self.filesystems.get(&fs) {
            Some(filesystem) => filesystem.interests.iter().copied().collect(),
            None => return,
        };
        for id in residents {
            self.interest_refind_filesystem(id);
        }
    }

    fn destroy_filesystem(&mut self, fs: FsId) {
        let Some(filesystem) = self.filesystems.remove(&fs) else {
            return;
        };
        debug_assert!(filesystem.interests.is_empty());
        if let Backend::Nfs { host, .. } = filesystem.backend {
            self.host_release(host);
        }
    }

    /// Which filesystem does `path` live on?
    pub fn fstable_find(&mut self, path: &Path, cred: &Cred) -> FsId {
        self.creds.become_user(cred);

        // statvfs the closest existing ancestor.
        let mut probe = path.to_path_buf();
        let fsid = loop {
            match nix::sys::statvfs::statvfs(&probe) {
                Ok(vfs) => break Some(vfs.filesystem_id()),
                Err(_) => {
                    if !probe.pop() {
                        break None;
                    }
                }
            }
        };
        let Some(fsid) = fsid else {
            return self.fstab.root.expect("filesystem table initialised");
        };
        let fsid = fsid as u64;
        if let Some(&fs) = self.fstab.by_fsid.get(&fsid) {
            return fs;
        }

        let real = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let fs = self.fstable_longest_prefix(&real);
        self.fstab.by_fsid.insert(fsid, fs);
        fs
    }

    /// The filesystem whose mount point is the longest prefix of `path`
    /// on a component boundary; the root filesystem is the fallback.
    pub fn fstable_longest_prefix(&self, path: &Path) -> FsId {
        let root = self.fstab.root.expect("filesystem table initialised");
        longest_prefix_in(&self.fstab.by_name, root, path)
    }
}

fn longest_prefix_in(by_name: &HashMap<PathBuf, FsId>, root: FsId, path: &Path) -> FsId {
    use std::os::unix::ffi::OsStrExt;
    let path = path.as_os_str().as_bytes();
    let mut best = root;
    let mut best_len = 0;
    for (dir, &fs) in by_name {
        let key = dir.as_os_str().as_bytes();
        if key.len() > best_len
            && path.starts_with(key)
            && (path.len() == key.len() || path[key.len()] == b'/')
        {
            best_len = key.len();
            best = fs;
        }
    }
    best
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn mount_lines_parse() {
        let text = "/dev/sda1 / ext4 rw,relatime 0 0\n\
                    server:/export /mnt/nfs nfs rw,acregmax=30 0 0\n\
                    # comment\n\
                    short line\n";
        let entries = parse_mounts(Cursor::new(text));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].dir, PathBuf::from("/"));
        assert!(!entries[0].is_nfs());
        assert!(entries[1].is_nfs());
        assert_eq!(entries[1].opts, "rw,acregmax=30");
    }

    #[test]
    fn octal_escapes_unescape() {
        assert_eq!(unescape_octal("/mnt/with\\040space"), "/mnt/with space");
        assert_eq!(unescape_octal("/plain"), "/plain");
        assert_eq!(unescape_octal("trailing\\04"), "trailing\\04");
    }

    #[test]
    fn nfs_requires_colon_in_fsname() {
        let entries = parse_mounts(Cursor::new("nfsroot /mnt nfs rw 0 0\n"));
        assert!(!entries[0].is_nfs());
    }

    #[test]
    fn longest_prefix_respects_component_boundaries() {
        let mut by_name = HashMap::new();
        let root = FsId(1);
        by_name.insert(PathBuf::from("/"), root);
        by_name.insert(PathBuf::from("/usr"), FsId(2));
        by_name.insert(PathBuf::from("/usr/local"), FsId(3));

        assert_eq!(longest_prefix_in(&by_name, root, Path::new("/etc/x")), root);
        assert_eq!(
            longest_prefix_in(&by_name, root, Path::new("/usr/bin/ls")),
            FsId(2)
        );
        assert_eq!(
            longest_prefix_in(&by_name, root, Path::new("/usr/local/bin")),
            FsId(3)
        );
        assert_eq!(longest_prefix_in(&by_name, root, Path::new("/usr")), FsId(2));
        // "/usr" must not claim "/usrbooboo".
        assert_eq!(
            longest_prefix_in(&by_name, root, Path::new("/usrbooboo")),
            root
        );
    }
}
