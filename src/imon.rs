//! Inode monitor communication.
//!
//! Wraps the kernel inode-monitor device. The device is opened lazily on
//! the first express; if it cannot be opened the source is permanently
//! inactive and every interest falls back to the polling wheel.
//!
//! Expressing interest is racy: between the kernel resolving the path and
//! us statting it, the inode may be replaced. After a successful express
//! we stat the path ourselves and compare identities; on mismatch the
//! subscription is revoked immediately, so we never deliver notifications
//! for a recycled inode nobody asked about.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::io::ErrorKind;
use std::mem;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use log::debug;
use log::error;
use log::info;
use log::warn;
use zerocopy::FromBytes;

use crate::scheduler::Scheduler;
use crate::scheduler::Token;
use crate::sys;
use crate::sys::ImonMask;
use crate::sys::ImonRecord;

/// What a device record means for the interest chain it lands on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImonEventKind {
    /// A process started executing the inode.
    Exec,
    /// The last executing process exited.
    Exit,
    /// Content, attributes, deletion or rename: rescan.
    Change,
}

/// A decoded device event.
#[derive(Clone, Copy, Debug)]
pub struct ImonEvent {
    pub dev: u64,
    pub ino: u64,
    pub kind: ImonEventKind,
}

/// One drain of the device's event queue.
#[derive(Debug, Default)]
pub struct ImonBatch {
    pub events: Vec<ImonEvent>,
    /// The kernel queue overflowed; every interest must be rescanned.
    pub overflowed: bool,
}

#[derive(Debug)]
enum Device {
    Untried,
    Unavailable,
    Open(OwnedFd),
}

/// The kernel change source. There is exactly one, owned by the daemon.
#[derive(Debug)]
pub struct Imon {
    device: Device,
}

impl Imon {
    pub fn new() -> Self {
        Imon {
            device: Device::Untried,
        }
    }

    /// Whether kernel monitoring is available, opening the device on the
    /// first call. A successful open registers the device with the
    /// scheduler; a failed open is permanent.
    pub fn is_active(&mut self, sched: &mut Scheduler) -> bool {
        if let Device::Untried = self.device {
            self.device = match open_device() {
                Ok(fd) => {
                    debug!("opened {}", sys::IMON_DEVICE);
                    let prev = sched.install_read(fd.as_raw_fd(), Token::Imon);
                    debug_assert!(prev.is_none());
                    Device::Open(fd)
                }
                Err(err) => {
                    info!(
                        "can't open {}; falling back to polling: {}",
                        sys::IMON_DEVICE,
                        err
                    );
                    Device::Unavailable
                }
            };
        }
        matches!(self.device, Device::Open(_))
    }

    /// Ask the kernel to watch the inode `path` currently resolves to.
    ///
    /// On success returns the stat taken *after* the express, verified to
    /// name the same identity the kernel subscribed.
    pub fn express(&mut self, path: &Path, sched: &mut Scheduler) -> io::Result<libc::stat> {
        if !self.is_active(sched) {
            return Err(io::Error::from(ErrorKind::Unsupported));
        }
        let Device::Open(ref fd) = self.device else {
            unreachable!()
        };
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(ErrorKind::InvalidInput))?;

        let mut kstat: libc::stat = unsafe { mem::zeroed() };
        let arg = sys::ImonInterest {
            path: cpath.as_ptr(),
            stat: &mut kstat,
            mask: sys::INTEREST_MASK.bits(),
        };
        if let Err(errno) = unsafe { sys::imon_ioc_express(fd.as_raw_fd(), &arg) } {
            info!("express on {:?} failed: {}", path, errno);
            return Err(errno.into());
        }

        // Re-stat and compare with what the kernel resolved.
        let status = match nix::sys::stat::stat(path) {
            Ok(st) => st,
            Err(errno) => {
                warn!("stat on {:?} failed after express: {}", path, errno);
                self.revoke(path, kstat.st_dev, kstat.st_ino);
                return Err(errno.into());
            }
        };
        if status.st_dev != kstat.st_dev || status.st_ino != kstat.st_ino {
            error!("{:?} changed between express and stat", path);
            self.revoke(path, kstat.st_dev, kstat.st_ino);
            return Err(io::Error::other("inode changed between express and stat"));
        }

        debug!(
            "monitoring {:?} = dev {}, ino {}",
            path, status.st_dev, status.st_ino
        );
        Ok(status)
    }

    /// Withdraw interest in an identity. Revoking an identity the kernel
    /// no longer holds is a no-op.
    pub fn revoke(&mut self, path: &Path, dev: u64, ino: u64) {
        let Device::Open(ref fd) = self.device else {
            return;
        };
        let arg = sys::ImonRevoke {
            dev,
            ino,
            mask: sys::INTEREST_MASK.bits(),
        };
        match unsafe { sys::imon_ioc_revoke(fd.as_raw_fd(), &arg) } {
            Ok(_) => debug!("forgot {:?}", path),
            Err(errno) => debug!("revoke on {:?} failed: {}", path, errno),
        }
    }

    /// Drain the device's event queue. Called when the device fd is
    /// readable; never blocks.
    pub fn drain(&mut self) -> ImonBatch {
        let mut batch = ImonBatch::default();
        let Device::Open(ref fd) = self.device else {
            return batch;
        };
        let rec_size = mem::size_of::<ImonRecord>();
        let mut buf = vec![0u8; page_size::get() / rec_size * rec_size];
        loop {
            let n = match nix::unistd::read(fd.as_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => {
                    error!("{} read error: {}", sys::IMON_DEVICE, errno);
                    break;
                }
            };
            for chunk in buf[..n].chunks_exact(rec_size) {
                let Ok(rec) = ImonRecord::read_from_bytes(chunk) else {
                    continue;
                };
                decode(&mut batch, &rec);
            }
            if n < buf.len() {
                break;
            }
        }
        batch
    }
}

fn decode(batch: &mut ImonBatch, rec: &ImonRecord) {
    let mask = ImonMask::from_bits_truncate(rec.mask);
    if mask.contains(ImonMask::OVERFLOW) {
        error!("inode monitor event queue overflow");
        batch.overflowed = true;
        return;
    }
    debug!(
        "imon said dev {}, ino {} changed {:?}",
        rec.dev, rec.ino, mask
    );
    if mask.contains(ImonMask::EXEC) {
        batch.events.push(ImonEvent {
            dev: rec.dev,
            ino: rec.ino,
            kind: ImonEventKind::Exec,
        });
    }
    if mask.contains(ImonMask::EXIT) {
        batch.events.push(ImonEvent {
            dev: rec.dev,
            ino: rec.ino,
            kind: ImonEventKind::Exit,
        });
    }
    if mask
        .intersects(ImonMask::CONTENT | ImonMask::ATTRIBUTE | ImonMask::DELETE | ImonMask::RENAME)
    {
        batch.events.push(ImonEvent {
            dev: rec.dev,
            ino: rec.ino,
            kind: ImonEventKind::Change,
        });
    }
}

fn open_device() -> io::Result<OwnedFd> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(sys::IMON_DEVICE)?;
    Ok(file.into())
}

#[cfg(test)]
mod test {
    use super::*;
    use zerocopy::IntoBytes;

    fn record(mask: ImonMask) -> ImonRecord {
        ImonRecord {
            dev: 8,
            ino: 4242,
            mask: mask.bits(),
            _pad: 0,
        }
    }

    #[test]
    fn decode_change_classes_collapse() {
        let mut batch = ImonBatch::default();
        decode(&mut batch, &record(ImonMask::CONTENT | ImonMask::ATTRIBUTE));
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].kind, ImonEventKind::Change);
        assert!(!batch.overflowed);
    }

    #[test]
    fn decode_exec_and_change_fan_out() {
        let mut batch = ImonBatch::default();
        decode(&mut batch, &record(ImonMask::EXEC | ImonMask::DELETE));
        let kinds: Vec<_> = batch.events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ImonEventKind::Exec, ImonEventKind::Change]);
    }

    #[test]
    fn decode_overflow_sets_flag_only() {
        let mut batch = ImonBatch::default();
        decode(&mut batch, &record(ImonMask::OVERFLOW));
        assert!(batch.overflowed);
        assert!(batch.events.is_empty());
    }

    #[test]
    fn records_survive_byte_round_trip() {
        let rec = record(ImonMask::EXIT);
        let parsed = ImonRecord::read_from_bytes(rec.as_bytes()).unwrap();
        assert_eq!(parsed.ino, 4242);
        assert_eq!(
            ImonMask::from_bits_truncate(parsed.mask),
            ImonMask::EXIT
        );
    }
}
