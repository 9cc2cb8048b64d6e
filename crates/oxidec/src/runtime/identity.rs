//! Identity layer: receivers, tagged pointers and class decoding.
//!
//! A receiver handle is either a pointer to an object header or a *tagged*
//! word that carries its class and payload in its own bits and is never
//! dereferenced. The packed layout is:
//!
//! ```text
//!  63                                  4 3     1 0
//! +-------------------------------------+-------+-+
//! |               payload               | slot  |1|
//! +-------------------------------------+-------+-+
//! ```
//!
//! Bit 0 set marks a tagged word; bits 1..=3 index the eight-entry
//! [`TaggedClassTable`]. Object pointers are at least word aligned, so their
//! bit 0 is always clear.
//!
//! At the API boundary the packed word is replaced by [`Receiver`], a plain
//! enum; the raw encoding stays in [`RawHandle`].

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::runtime::class::{Class, ClassRecord};
use crate::runtime::object::Object;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Tag bit marking a word as a tagged pointer.
const TAG_MASK: usize = 1;

/// Shift of the slot field.
const TAG_SLOT_SHIFT: u32 = 1;

/// Mask of the slot field after shifting.
const TAG_SLOT_MASK: usize = 0x7;

/// Shift of the payload field.
const TAG_PAYLOAD_SHIFT: u32 = 4;

/// Number of tagged class slots.
pub const TAG_SLOT_COUNT: usize = TAG_SLOT_MASK + 1;

/// Largest payload a tagged pointer can carry.
pub const MAX_TAGGED_PAYLOAD: usize = usize::MAX >> TAG_PAYLOAD_SHIFT;

/// A small object encoded entirely in a word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaggedPointer(usize);

impl TaggedPointer {
    /// Packs `slot` and `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTagSlot`] if `slot >= 8` and
    /// [`Error::PayloadTooLarge`] if `payload > MAX_TAGGED_PAYLOAD`.
    pub fn new(slot: usize, payload: usize) -> Result<Self> {
        if slot >= TAG_SLOT_COUNT {
            return Err(Error::InvalidTagSlot { slot });
        }
        if payload > MAX_TAGGED_PAYLOAD {
            return Err(Error::PayloadTooLarge { payload });
        }

        Ok(TaggedPointer(
            (payload << TAG_PAYLOAD_SHIFT) | (slot << TAG_SLOT_SHIFT) | TAG_MASK,
        ))
    }

    /// The slot index, `0..8`.
    #[must_use]
    pub const fn slot(self) -> usize {
        (self.0 >> TAG_SLOT_SHIFT) & TAG_SLOT_MASK
    }

    /// The inline payload.
    #[must_use]
    pub const fn payload(self) -> usize {
        self.0 >> TAG_PAYLOAD_SHIFT
    }

    pub(crate) const fn bits(self) -> usize {
        self.0
    }

    /// Reinterprets a word whose tag bit is set. Any such word is a valid
    /// tagged pointer: every slot pattern indexes the table in bounds.
    pub(crate) const fn from_bits(bits: usize) -> Option<Self> {
        if bits & TAG_MASK == 0 {
            None
        } else {
            Some(TaggedPointer(bits))
        }
    }
}

impl fmt::Debug for TaggedPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedPointer")
            .field("slot", &self.slot())
            .field("payload", &self.payload())
            .finish()
    }
}

/// A message receiver.
#[derive(Clone, Copy)]
pub enum Receiver<'a> {
    /// A heap object or class record header.
    Object(&'a Object),
    /// A class object. Messages go to its metaclass.
    Class(Class),
    /// A tagged small object.
    Tagged(TaggedPointer),
    /// The nil receiver.
    Nil,
}

impl Receiver<'_> {
    /// Packs the receiver into a word. Classes pack as their record header.
    #[must_use]
    pub fn to_raw(self) -> usize {
        RawHandle::from_receiver(self).0
    }

    /// Rebuilds a receiver from a word produced by [`to_raw`](Self::to_raw).
    ///
    /// # Safety
    ///
    /// If `bits` is non-zero and its tag bit is clear, it must point at a live
    /// [`Object`] header that outlives `'a`. Zero and tagged words are always
    /// safe.
    #[must_use]
    pub unsafe fn from_raw<'a>(bits: usize) -> Receiver<'a> {
        if bits == 0 {
            return Receiver::Nil;
        }
        match TaggedPointer::from_bits(bits) {
            Some(tagged) => Receiver::Tagged(tagged),
            // SAFETY: guaranteed by the caller.
            None => Receiver::Object(unsafe { &*ptr::with_exposed_provenance::<Object>(bits) }),
        }
    }

    /// Returns true for [`Receiver::Nil`].
    #[must_use]
    pub const fn is_nil(&self) -> bool {
        matches!(self, Receiver::Nil)
    }
}

impl fmt::Debug for Receiver<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Receiver::Object(object) => write!(f, "<{} instance>", object.isa().name()),
            Receiver::Class(class) => write!(f, "<class {}>", class.name()),
            Receiver::Tagged(tagged) => write!(f, "{tagged:?}"),
            Receiver::Nil => f.write_str("nil"),
        }
    }
}

impl<'a> From<&'a Object> for Receiver<'a> {
    fn from(object: &'a Object) -> Self {
        Receiver::Object(object)
    }
}

impl From<Class> for Receiver<'_> {
    fn from(class: Class) -> Self {
        Receiver::Class(class)
    }
}

impl From<TaggedPointer> for Receiver<'_> {
    fn from(tagged: TaggedPointer) -> Self {
        Receiver::Tagged(tagged)
    }
}

/// Crate-internal packed receiver word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawHandle(usize);

impl RawHandle {
    pub(crate) fn from_receiver(receiver: Receiver<'_>) -> Self {
        match receiver {
            Receiver::Object(object) => {
                RawHandle(ptr::from_ref(object).expose_provenance())
            }
            Receiver::Class(class) => {
                RawHandle(ptr::from_ref(class.as_object()).expose_provenance())
            }
            Receiver::Tagged(tagged) => RawHandle(tagged.bits()),
            Receiver::Nil => RawHandle(0),
        }
    }

    /// Decodes the word's class. Tagged words are resolved from `table`
    /// alone; the word itself is never dereferenced.
    ///
    /// # Safety
    ///
    /// A non-zero untagged word must point at a live object header.
    pub(crate) unsafe fn decode(self, table: &TaggedClassTable) -> Option<Class> {
        if self.0 == 0 {
            return None;
        }
        match TaggedPointer::from_bits(self.0) {
            Some(tagged) => table.get(tagged.slot()),
            // SAFETY: guaranteed by the caller.
            None => Some(unsafe { &*ptr::with_exposed_provenance::<Object>(self.0) }.isa()),
        }
    }
}

/// Slot to class table for tagged pointers.
///
/// Slots are written once at startup and read lock-free on every dispatch
/// to a tagged receiver.
pub struct TaggedClassTable {
    slots: [AtomicPtr<ClassRecord>; TAG_SLOT_COUNT],
}

impl TaggedClassTable {
    pub(crate) fn new() -> Self {
        TaggedClassTable {
            slots: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Returns the class registered for `slot`, if any.
    #[inline]
    #[must_use]
    pub fn get(&self, slot: usize) -> Option<Class> {
        let ptr = self.slots[slot & TAG_SLOT_MASK].load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: only class record pointers are stored in the table.
            Some(unsafe { Class::from_ptr(ptr) })
        }
    }

    fn register(&self, slot: usize, class: Class) -> Result<()> {
        if slot >= TAG_SLOT_COUNT {
            return Err(Error::InvalidTagSlot { slot });
        }

        match self.slots[slot].compare_exchange(
            ptr::null_mut(),
            class.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(existing) if existing == class.as_ptr() => Ok(()),
            Err(_) => Err(Error::TagSlotOccupied { slot }),
        }
    }
}

impl fmt::Debug for TaggedClassTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries((0..TAG_SLOT_COUNT).map(|slot| self.get(slot).map(Class::name)))
            .finish()
    }
}

impl Runtime {
    /// Maps tagged pointers with `slot` to `class`.
    ///
    /// Call once per slot at startup, before any tagged receiver is
    /// dispatched. Registering the same class again is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTagSlot`] for `slot >= 8`, [`Error::TagSlotOccupied`]
    /// if the slot maps to a different class, [`Error::ForeignClass`] for a
    /// class of another runtime.
    pub fn register_tagged_class(&self, slot: usize, class: Class) -> Result<()> {
        self.check_owned(class)?;
        self.tagged.register(slot, class)
    }

    /// Returns the class that messages to `receiver` are looked up in.
    ///
    /// This is the tolerant accessor: `None` for nil and for tagged pointers
    /// whose slot has no class. Class receivers resolve to their metaclass.
    #[inline]
    #[must_use]
    pub fn class_of(&self, receiver: Receiver<'_>) -> Option<Class> {
        match receiver {
            Receiver::Object(object) => Some(object.isa()),
            Receiver::Class(class) => Some(class.as_object().isa()),
            Receiver::Tagged(tagged) => self.tagged.get(tagged.slot()),
            Receiver::Nil => None,
        }
    }

    /// [`class_of`](Self::class_of) for a packed receiver word.
    ///
    /// # Safety
    ///
    /// A non-zero word with the tag bit clear must point at a live object
    /// header. Tagged words are resolved from the table and never read.
    #[must_use]
    pub unsafe fn class_of_raw(&self, bits: usize) -> Option<Class> {
        // SAFETY: forwarded to the caller.
        unsafe { RawHandle(bits).decode(&self.tagged) }
    }

    /// Returns the tagged class table.
    #[must_use]
    pub fn tagged_classes(&self) -> &TaggedClassTable {
        &self.tagged
    }
}
