//! Protocol message flag bitset.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Bitset carried in `ProtocolMessage::flags`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(pub u32);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const HAS_PRESENCE: Flags = Flags(1 << 0);
    pub const HAS_BACKLOG: Flags = Flags(1 << 1);
    pub const RESUMED: Flags = Flags(1 << 2);
    pub const HAS_LOCAL_PRESENCE: Flags = Flags(1 << 3);
    pub const TRANSIENT: Flags = Flags(1 << 4);
    pub const PRESENCE: Flags = Flags(1 << 16);
    pub const PUBLISH: Flags = Flags(1 << 17);
    pub const SUBSCRIBE: Flags = Flags(1 << 18);
    pub const PRESENCE_SUBSCRIBE: Flags = Flags(1 << 19);

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`.
    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 9] = [
            (Flags::HAS_PRESENCE, "HAS_PRESENCE"),
            (Flags::HAS_BACKLOG, "HAS_BACKLOG"),
            (Flags::RESUMED, "RESUMED"),
            (Flags::HAS_LOCAL_PRESENCE, "HAS_LOCAL_PRESENCE"),
            (Flags::TRANSIENT, "TRANSIENT"),
            (Flags::PRESENCE, "PRESENCE"),
            (Flags::PUBLISH, "PUBLISH"),
            (Flags::SUBSCRIBE, "SUBSCRIBE"),
            (Flags::PRESENCE_SUBSCRIBE, "PRESENCE_SUBSCRIBE"),
        ];

        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Flags({})", set.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_positions() {
        assert_eq!(Flags::HAS_PRESENCE.bits(), 1);
        assert_eq!(Flags::HAS_BACKLOG.bits(), 2);
        assert_eq!(Flags::RESUMED.bits(), 4);
        assert_eq!(Flags::HAS_LOCAL_PRESENCE.bits(), 8);
        assert_eq!(Flags::TRANSIENT.bits(), 16);
        assert_eq!(Flags::PRESENCE.bits(), 65_536);
        assert_eq!(Flags::PRESENCE_SUBSCRIBE.bits(), 1 << 19);
    }

    #[test]
    fn test_contains_and_insert() {
        let mut flags = Flags::RESUMED | Flags::HAS_PRESENCE;
        assert!(flags.contains(Flags::RESUMED));
        assert!(!flags.contains(Flags::HAS_BACKLOG));

        flags.insert(Flags::HAS_BACKLOG);
        flags.remove(Flags::RESUMED);
        assert!(flags.contains(Flags::HAS_BACKLOG));
        assert!(!flags.contains(Flags::RESUMED));
        assert_eq!(format!("{:?}", flags), "Flags(HAS_PRESENCE | HAS_BACKLOG)");
    }
}
