use static_assertions::const_assert_eq;
use std::fmt;
use std::ops::BitOr;

/// Set of logical cores a thread may run on, one bit per core.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct AffinityMask(u64);

const_assert_eq!(AffinityMask::WIDTH, 64);

impl AffinityMask {
    /// Number of logical cores a mask can address.
    pub const WIDTH: usize = std::mem::size_of::<u64>() * 8;

    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Every logical core of a machine with `core_count` cores.
    #[inline]
    pub fn full(core_count: usize) -> Self {
        Self::contiguous(0, core_count)
    }

    /// `count` consecutive cores starting at `first`, truncated to the mask width.
    pub fn contiguous(first: usize, count: usize) -> Self {
        if first >= Self::WIDTH || count == 0 {
            return Self(0);
        }

        let count = count.min(Self::WIDTH - first);
        let bits = if count == Self::WIDTH {
            u64::MAX
        } else {
            (1u64 << count) - 1
        };
        Self(bits << first)
    }

    #[inline]
    pub fn core_count(self) -> usize {
        self.0.count_ones() as usize
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_disjoint(self, other: Self) -> bool {
        self.0 & other.0 == 0
    }
}

impl BitOr for AffinityMask {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl fmt::UpperHex for AffinityMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

impl fmt::Display for AffinityMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#X}", self.0)
    }
}

/// Logical cores visible to this process, `None` where the platform can't tell.
#[inline]
pub fn logical_core_count() -> Option<usize> {
    // Only supported on Linux, Windows and MacOs
    core_affinity::get_core_ids()
        .map(|cores| cores.len())
        .filter(|count| *count > 0)
}
