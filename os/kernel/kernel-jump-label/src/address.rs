use core::fmt;
use core::ops::{Add, Range};

/// Address of an instruction, a table record or a key cell in the loaded image.
///
/// A thin wrapper around `u64` so that image addresses are not confused with
/// byte offsets into a buffer. Arithmetic with signed displacements wraps, the
/// same way the assembler's `x - .` expressions do.
///
/// ### Examples
/// ```rust
/// # use kernel_jump_label::CodeAddress;
/// let site = CodeAddress::new(0xFFFF_FFFF_8100_0000);
/// let label = site.offset_by(0x40);
/// assert_eq!(label.displacement_from(site), 0x40);
/// assert_eq!(site.offset_by(-0x10).as_u64(), 0xFFFF_FFFF_80FF_FFF0);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CodeAddress(u64);

impl CodeAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Applies a signed displacement.
    #[inline]
    #[must_use]
    pub const fn offset_by(self, disp: i64) -> Self {
        Self(self.0.wrapping_add_signed(disp))
    }

    /// Signed distance `self - origin`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn displacement_from(self, origin: Self) -> i64 {
        self.0.wrapping_sub(origin.0) as i64
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Rounds up to the next multiple of `align`, a power of two.
    #[inline]
    #[must_use]
    pub const fn align_up(self, align: u64) -> Self {
        Self((self.0 + (align - 1)) & !(align - 1))
    }

    /// Whether `[self, self + len)` lies within `range`.
    #[inline]
    #[must_use]
    pub fn span_within(self, len: u64, range: &Range<Self>) -> bool {
        self >= range.start
            && self
                .0
                .checked_add(len)
                .is_some_and(|end| end <= range.end.0)
    }
}

impl fmt::Debug for CodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CA(0x{:016X})", self.0)
    }
}

impl fmt::Display for CodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for CodeAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for CodeAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}
