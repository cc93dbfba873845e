//! The system-independent event taxonomy.
//!
//! Every backend speaks its own dialect of "something changed" (inotify's
//! `IN_*` bits, kqueue's `NOTE_*` fflags). This module is the bidirectional
//! map between that dialect, a fixed generic vocabulary of four bits, and
//! the symbolic names used in configuration files and handler environments.

use std::fmt;

/// One of the four backend-independent event classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GenericEvent {
    Create = 0x01,
    Write = 0x02,
    Attrib = 0x04,
    Delete = 0x08,
}

impl GenericEvent {
    pub const ALL: [GenericEvent; 4] = [
        GenericEvent::Create,
        GenericEvent::Write,
        GenericEvent::Attrib,
        GenericEvent::Delete,
    ];

    pub fn name(self) -> &'static str {
        match self {
            GenericEvent::Create => "create",
            GenericEvent::Write => "write",
            GenericEvent::Attrib => "attrib",
            GenericEvent::Delete => "delete",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        GenericEvent::ALL.into_iter().find(|e| e.name() == name)
    }
}

/// A set of [`GenericEvent`] bits, stored packed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GenericMask(u8);

impl GenericMask {
    pub const EMPTY: GenericMask = GenericMask(0);
    pub const ALL: GenericMask = GenericMask(0x0F);

    pub fn contains(self, e: GenericEvent) -> bool {
        self.0 & (e as u8) != 0
    }

    pub fn insert(&mut self, e: GenericEvent) {
        self.0 |= e as u8;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn intersects(self, other: GenericMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn union(self, other: GenericMask) -> GenericMask {
        GenericMask(self.0 | other.0)
    }

    /// Whitespace-joined generic names, in canonical order. Used for
    /// `DIREVENT_GENEV_NAME`.
    pub fn names_joined(self) -> String {
        GenericEvent::ALL
            .into_iter()
            .filter(|e| self.contains(*e))
            .map(GenericEvent::name)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn as_decimal(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for GenericMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names_joined())
    }
}

/// A `(generic_bits, backend_bits)` pair. `backend_bits` is opaque here; its
/// meaning is supplied by whichever [`crate::backend::Backend`] is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventMask {
    pub generic: GenericMask,
    pub backend: u32,
}

impl EventMask {
    pub fn is_empty(&self) -> bool {
        self.generic.is_empty() && self.backend == 0
    }

    /// Fill an empty mask to "all generic events". A handler rule that
    /// names no events at all is understood to want every one of them,
    /// resolved once at finalisation time rather than checked per-event.
    pub fn fill_if_empty(&mut self) {
        if self.is_empty() {
            self.generic = GenericMask::ALL;
        }
    }
}

/// Translates between symbolic names, generic codes, and a particular
/// backend's native flag bits.
///
/// Built once at startup from the active backend's translation vector: one
/// `(GenericEvent, native_bits)` pair per generic code.
pub struct EventTaxonomy {
    /// generic -> native bits for that backend
    native_of: [(GenericEvent, u32); 4],
    /// native name -> native bit, for parsing backend-specific names in config
    native_names: Vec<(&'static str, u32)>,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown event name: {0}")]
pub struct UnknownEventName(pub String);

impl EventTaxonomy {
    pub fn new(seed: [(GenericEvent, u32); 4], native_names: Vec<(&'static str, u32)>) -> Self {
        EventTaxonomy {
            native_of: seed,
            native_names,
        }
    }

    fn native_bits_for(&self, e: GenericEvent) -> u32 {
        self.native_of
            .iter()
            .find(|(g, _)| *g == e)
            .map(|(_, bits)| *bits)
            .unwrap_or(0)
    }

    /// The union of every native bit this backend knows about, suitable for
    /// arming a watch that should report everything the dispatcher might
    /// care about and let handler masks do the actual filtering.
    pub fn native_mask_for_all(&self) -> u32 {
        self.native_of.iter().fold(0, |acc, (_, bits)| acc | bits)
    }

    /// The native bits backing `create` and `delete`, used by backends that
    /// must synthesise those two events from a directory-listing diff.
    pub fn create_delete_native_bits(&self) -> (u32, u32) {
        (
            self.native_bits_for(GenericEvent::Create),
            self.native_bits_for(GenericEvent::Delete),
        )
    }

    /// `name -> mask`. Accepts either a generic name (`create`) or a
    /// backend-native name (`IN_MOVED_TO`, `NOTE_EXTEND`). The generic
    /// component is left zero; it's inferred later from what the backend
    /// actually reports.
    pub fn name_to_mask(&self, name: &str) -> Result<EventMask, UnknownEventName> {
        if let Some(g) = GenericEvent::from_name(name) {
            return Ok(EventMask {
                generic: GenericMask::EMPTY,
                backend: self.native_bits_for(g),
            });
        }
        if let Some((_, bits)) = self.native_names.iter().find(|(n, _)| *n == name) {
            return Ok(EventMask {
                generic: GenericMask::EMPTY,
                backend: *bits,
            });
        }
        Err(UnknownEventName(name.to_string()))
    }

    /// The reverse map: observed backend flags -> generic bits, by unioning
    /// every generic code whose native mask intersects the observed bits.
    pub fn observed_to_generic(&self, observed: u32) -> GenericMask {
        let mut mask = GenericMask::EMPTY;
        for (generic, native) in &self.native_of {
            if native & observed != 0 {
                mask.insert(*generic);
            }
        }
        mask
    }

    /// Whitespace-joined native names of the set bits in `flags`, for
    /// `DIREVENT_SYSEV_NAME`.
    pub fn native_names_joined(&self, flags: u32) -> String {
        self.native_names
            .iter()
            .filter(|(_, bits)| flags & bits != 0)
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_taxonomy() -> EventTaxonomy {
        // A toy seed resembling inotify's bits, for round-trip testing.
        EventTaxonomy::new(
            [
                (GenericEvent::Create, 0x100),
                (GenericEvent::Write, 0x002),
                (GenericEvent::Attrib, 0x004),
                (GenericEvent::Delete, 0x200),
            ],
            vec![
                ("IN_CREATE", 0x100),
                ("IN_MODIFY", 0x002),
                ("IN_ATTRIB", 0x004),
                ("IN_DELETE", 0x200),
            ],
        )
    }

    #[test]
    fn name_to_mask_unknown_is_error() {
        let tax = sample_taxonomy();
        assert!(tax.name_to_mask("bogus").is_err());
    }

    #[test]
    fn single_bit_round_trips() {
        let tax = sample_taxonomy();
        for e in GenericEvent::ALL {
            let mask = tax.name_to_mask(e.name()).unwrap();
            let generic = tax.observed_to_generic(mask.backend);
            assert!(generic.contains(e));
            assert_eq!(generic.names_joined(), e.name());
        }
    }

    #[test]
    fn composite_mask_round_trips_as_set_equality() {
        let tax = sample_taxonomy();
        let write = tax.name_to_mask("write").unwrap().backend;
        let attrib = tax.name_to_mask("attrib").unwrap().backend;
        let generic = tax.observed_to_generic(write | attrib);
        assert!(generic.contains(GenericEvent::Write));
        assert!(generic.contains(GenericEvent::Attrib));
        assert!(!generic.contains(GenericEvent::Create));
    }

    #[test]
    fn empty_mask_fills_to_all_generic() {
        let mut mask = EventMask::default();
        assert!(mask.is_empty());
        mask.fill_if_empty();
        assert_eq!(mask.generic, GenericMask::ALL);
    }

    #[test]
    fn native_names_joined_lists_set_bits() {
        let tax = sample_taxonomy();
        let joined = tax.native_names_joined(0x100 | 0x200);
        assert!(joined.contains("IN_CREATE"));
        assert!(joined.contains("IN_DELETE"));
        assert!(!joined.contains("IN_MODIFY"));
    }
}
