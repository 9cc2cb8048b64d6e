//! Protocols: named selector sets used for conformance queries.
//!
//! Protocols carry no implementations and are never consulted during
//! dispatch. A protocol may inherit other protocols; conforming to a
//! protocol implies conforming to everything it inherits.

use crate::runtime::selector::Selector;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr;

/// Arena record for a protocol.
pub struct ProtocolRecord {
    name: &'static str,
    required: Vec<Selector>,
    optional: Vec<Selector>,
    inherits: Vec<Protocol>,
}

impl ProtocolRecord {
    pub(crate) fn new(
        name: &'static str,
        required: Vec<Selector>,
        optional: Vec<Selector>,
        inherits: Vec<Protocol>,
    ) -> Self {
        ProtocolRecord {
            name,
            required,
            optional,
            inherits,
        }
    }
}

/// Handle to a protocol record.
#[derive(Clone, Copy)]
pub struct Protocol(&'static ProtocolRecord);

impl Protocol {
    pub(crate) fn from_record(record: &'static ProtocolRecord) -> Self {
        Protocol(record)
    }

    /// The protocol name.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.0.name
    }

    /// Selectors a conforming class must implement, not counting inherited
    /// protocols.
    #[must_use]
    pub fn required(self) -> &'static [Selector] {
        &self.0.required
    }

    /// Selectors a conforming class may implement.
    #[must_use]
    pub fn optional(self) -> &'static [Selector] {
        &self.0.optional
    }

    /// Directly inherited protocols.
    #[must_use]
    pub fn inherits(self) -> &'static [Protocol] {
        &self.0.inherits
    }

    /// Returns true if this protocol is `other` or inherits it, directly or
    /// transitively.
    #[must_use]
    pub fn conforms_to(self, other: Protocol) -> bool {
        let mut stack = vec![self];
        while let Some(protocol) = stack.pop() {
            if protocol == other {
                return true;
            }
            stack.extend_from_slice(protocol.inherits());
        }
        false
    }

    /// Required selectors of this protocol and everything it inherits,
    /// without duplicates.
    #[must_use]
    pub fn all_required(self) -> Vec<Selector> {
        let mut selectors = Vec::new();
        let mut stack = vec![self];
        let mut visited = Vec::new();

        while let Some(protocol) = stack.pop() {
            if visited.contains(&protocol) {
                continue;
            }
            visited.push(protocol);
            for &selector in protocol.required() {
                if !selectors.contains(&selector) {
                    selectors.push(selector);
                }
            }
            stack.extend_from_slice(protocol.inherits());
        }
        selectors
    }
}

impl PartialEq for Protocol {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.0, other.0)
    }
}

impl Eq for Protocol {}

impl Hash for Protocol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        ptr::hash(self.0, state);
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Protocol({})", self.name())
    }
}
