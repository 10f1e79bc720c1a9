//! Kernel ABI for the inode monitor device.
//!
//! The imon device accepts two ioctls, express interest in the inode a
//! path resolves to and revoke interest in an identity, and delivers a
//! stream of fixed-size event records on read(2). Layouts here must match
//! the kernel module exactly; everything is `repr(C)`.

#![allow(missing_docs)]

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Path of the monitor device.
pub const IMON_DEVICE: &str = "/dev/imon";

bitflags::bitflags! {
    /// Event classes an interest subscribes to, and the classes reported
    /// back in [`ImonRecord::mask`].
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ImonMask: u32 {
        /// File contents changed.
        const CONTENT   = 0x0000_0001;
        /// Inode attributes changed.
        const ATTRIBUTE = 0x0000_0002;
        /// Link count dropped to zero.
        const DELETE    = 0x0000_0004;
        /// A process mapped the file as a running image.
        const EXEC      = 0x0000_0008;
        /// The last executing process exited.
        const EXIT      = 0x0000_0010;
        /// The inode was renamed over.
        const RENAME    = 0x0000_0020;
        /// The kernel event queue overflowed; events were lost.
        const OVERFLOW  = 0x0000_0080;
    }
}

/// Everything we subscribe to when expressing interest.
pub const INTEREST_MASK: ImonMask = ImonMask::CONTENT
    .union(ImonMask::ATTRIBUTE)
    .union(ImonMask::DELETE)
    .union(ImonMask::EXEC)
    .union(ImonMask::EXIT);

/// Argument of the express ioctl. The kernel resolves `path`, subscribes
/// the resulting inode, and writes that inode's stat through `stat`.
#[repr(C)]
pub struct ImonInterest {
    pub path: *const libc::c_char,
    pub stat: *mut libc::stat,
    pub mask: u32,
}

/// Argument of the revoke ioctl.
#[repr(C)]
pub struct ImonRevoke {
    pub dev: libc::dev_t,
    pub ino: libc::ino_t,
    pub mask: u32,
}

/// One event record as read from the device.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ImonRecord {
    pub dev: u64,
    pub ino: u64,
    pub mask: u32,
    pub _pad: u32,
}

nix::ioctl_write_ptr!(imon_ioc_express, b'i', 1, ImonInterest);
nix::ioctl_write_ptr!(imon_ioc_revoke, b'i', 2, ImonRevoke);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_layout() {
        assert_eq!(std::mem::size_of::<ImonRecord>(), 24);
        let rec = ImonRecord {
            dev: 42,
            ino: 7,
            mask: (ImonMask::CONTENT | ImonMask::DELETE).bits(),
            _pad: 0,
        };
        let raw = rec.as_bytes().to_vec();
        let back = ImonRecord::read_from_bytes(&raw).unwrap();
        assert_eq!(back.dev, 42);
        assert_eq!(back.ino, 7);
        let mask = ImonMask::from_bits_truncate(back.mask);
        assert!(mask.contains(ImonMask::CONTENT));
        assert!(mask.contains(ImonMask::DELETE));
        assert!(!mask.contains(ImonMask::EXEC));
    }

    #[test]
    fn interest_mask_excludes_overflow() {
        assert!(!INTEREST_MASK.contains(ImonMask::OVERFLOW));
        assert!(INTEREST_MASK.contains(ImonMask::CONTENT));
        assert!(INTEREST_MASK.contains(ImonMask::EXIT));
    }
}
