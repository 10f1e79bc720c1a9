//! The event alphabet.
//!
//! Events are pure tags; they carry no payload beyond their identity. The
//! single-byte wire codes are fixed by the protocol and shared with peer
//! daemons, so the enum discriminants *are* the codes.

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;

/// A change notification delivered to a client.
///
/// `Changed` is sent with a historical flag byte (a single `c`, meaning
/// "ctime changed") that old client libraries expect; see
/// [`crate::session`] for the framing.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Event {
    /// The entity's contents or attributes changed.
    Changed = b'c',
    /// The entity was removed (or became unreachable).
    Deleted = b'A',
    /// Some process started executing the file.
    Executing = b'X',
    /// The last process executing the file exited.
    Exited = b'Q',
    /// The entity appeared after the monitor was established.
    Created = b'F',
    /// A cancel (or rejected request) was processed.
    Acknowledge = b'G',
    /// The entity existed when the monitor was established.
    Exists = b'e',
    /// The initial enumeration of a directory monitor is complete.
    EndExist = b'P',
}

impl Event {
    /// The wire code for this event.
    pub fn code(self) -> u8 {
        self.into()
    }

    /// Human-readable name, for logging.
    pub fn name(self) -> &'static str {
        match self {
            Event::Changed => "Changed",
            Event::Deleted => "Deleted",
            Event::Executing => "Executing",
            Event::Exited => "Exited",
            Event::Created => "Created",
            Event::Acknowledge => "Acknowledge",
            Event::Exists => "Exists",
            Event::EndExist => "EndExist",
        }
    }
}

#[cfg(test)]
mod test {
    use super::Event;

    #[test]
    fn codes_round_trip() {
        for ev in [
            Event::Changed,
            Event::Deleted,
            Event::Executing,
            Event::Exited,
            Event::Created,
            Event::Acknowledge,
            Event::Exists,
            Event::EndExist,
        ] {
            assert_eq!(Event::try_from(ev.code()), Ok(ev));
        }
    }

    #[test]
    fn unknown_codes_rejected() {
        assert!(Event::try_from(b'M').is_err());
        assert!(Event::try_from(b'?').is_err());
        assert!(Event::try_from(0).is_err());
    }

    #[test]
    fn codes_match_protocol() {
        assert_eq!(Event::Changed.code(), b'c');
        assert_eq!(Event::Deleted.code(), b'A');
        assert_eq!(Event::Exists.code(), b'e');
        assert_eq!(Event::EndExist.code(), b'P');
    }
}
