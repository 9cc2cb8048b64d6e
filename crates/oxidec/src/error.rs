//! Error types for the `OxideC` runtime.
//!
//! Failing to find a method is never an error here: dispatch turns it into a
//! forwarding entry point or `None`. These errors cover the class graph
//! itself: loading images, realizing classes, mutating method lists and
//! registering tagged classes.

use thiserror::Error;

/// Errors that can occur in the `OxideC` runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No usable class with this name is registered.
    #[error("class `{name}` not found")]
    ClassNotFound {
        /// The requested class name.
        name: String,
    },

    /// A class names a superclass that has not been loaded.
    #[error("class `{class}` names missing superclass `{superclass}`")]
    MissingSuperclass {
        /// The class being realized.
        class: String,
        /// The superclass name that could not be resolved.
        superclass: String,
    },

    /// Following superclass links from this class leads back to it.
    #[error("inheritance cycle detected at class `{class}`")]
    InheritanceCycle {
        /// A class on the cycle.
        class: String,
    },

    /// The class was unloaded, registered as a duplicate, or failed to realize
    /// twice.
    #[error("class `{class}` is unusable")]
    ClassUnusable {
        /// The unusable class.
        class: String,
    },

    /// The class belongs to a different runtime.
    #[error("class `{class}` belongs to another runtime")]
    ForeignClass {
        /// The rejected class.
        class: String,
    },

    /// Tagged class slots are numbered `0..8`.
    #[error("tagged class slot {slot} is out of range")]
    InvalidTagSlot {
        /// The rejected slot index.
        slot: usize,
    },

    /// The tagged slot already maps to a different class.
    #[error("tagged class slot {slot} is already registered")]
    TagSlotOccupied {
        /// The occupied slot index.
        slot: usize,
    },

    /// The payload does not fit in the bits left after the tag and slot.
    #[error("tagged payload {payload:#x} does not fit in a tagged pointer")]
    PayloadTooLarge {
        /// The rejected payload.
        payload: usize,
    },

    /// No loaded image has this id.
    #[error("image {image} is not loaded")]
    ImageNotFound {
        /// The image id.
        image: u32,
    },

    /// The class's own method list already defines the selector.
    #[error("class `{class}` already defines `{selector}`")]
    MethodExists {
        /// The class being mutated.
        class: String,
        /// The selector name.
        selector: String,
    },

    /// The class's own method list does not define the selector.
    #[error("class `{class}` does not define `{selector}`")]
    MethodNotFound {
        /// The class being mutated.
        class: String,
        /// The selector name.
        selector: String,
    },

    /// No protocol with this name is registered.
    #[error("protocol `{name}` not found")]
    ProtocolNotFound {
        /// The protocol name.
        name: String,
    },
}

/// Result type for `OxideC` runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::MissingSuperclass {
            class: "Child".to_string(),
            superclass: "Root".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "class `Child` names missing superclass `Root`"
        );

        assert_eq!(
            Error::PayloadTooLarge { payload: 0xff }.to_string(),
            "tagged payload 0xff does not fit in a tagged pointer"
        );
        assert_eq!(
            Error::ImageNotFound { image: 7 }.to_string(),
            "image 7 is not loaded"
        );
        assert_eq!(
            Error::ForeignClass {
                class: "Widget".to_string()
            }
            .to_string(),
            "class `Widget` belongs to another runtime"
        );
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(
            Error::InvalidTagSlot { slot: 9 },
            Error::InvalidTagSlot { slot: 9 }
        );
        assert_ne!(
            Error::InvalidTagSlot { slot: 9 },
            Error::TagSlotOccupied { slot: 9 }
        );
    }

    #[test]
    fn test_error_is_std_error() {
        fn assert_error<E: std::error::Error + Send + Sync + 'static>() {}
        assert_error::<Error>();
    }
}
