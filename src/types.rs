//! Small shared primitive types used across every storage component.

/// A file offset, or an index into the writable address space above the
/// mmap baseline. `0` means "absent" (spec §6).
///
/// The low bit of a ref stored inside a `has_refs` array distinguishes a
/// tagged inline integer (`value << 1 | 1`) from a genuine child ref (see
/// [`crate::array`]); a bare [`Ref`] value here is always an untagged file
/// offset.
pub type Ref = u64;

/// The absent-ref sentinel.
pub const NULL_REF: Ref = 0;

/// Stable identifier for a table inside a [`crate::group::Group`].
pub type TableKey = u32;

/// Decode a tagged array slot into either an inline integer or a child ref.
#[inline]
pub fn untag(raw: i64) -> TaggedValue {
    if raw & 1 == 1 {
        TaggedValue::Inline(raw >> 1)
    } else {
        TaggedValue::Ref(raw as Ref)
    }
}

/// Encode an inline integer using the `value << 1 | 1` tagging convention.
#[inline]
pub fn tag_inline(value: i64) -> i64 {
    (value << 1) | 1
}

/// The result of decoding one slot of a `has_refs` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaggedValue {
    /// A small integer stored inline rather than as a ref.
    Inline(i64),
    /// A genuine child ref.
    Ref(Ref),
}
