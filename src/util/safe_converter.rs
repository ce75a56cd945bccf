//! Numeric conversions that `From` does not cover because they depend on the target platform's
//!  pointer width, or because the value range is guaranteed by protocol logic rather than types.

/// Widening casts that cannot lose information on any supported platform
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

#[cfg(any(target_pointer_width = "32", target_pointer_width = "64"))]
impl SafeCast<u64> for usize {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}

/// For narrowing casts where protocol logic or config validation ensures that the value is in
///  the narrower type's range.
/// NB: The implementations panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: value range should have been checked before")
    }
}
