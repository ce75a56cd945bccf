use std::fmt::{Display, Formatter};

/// Number of distinct sequence numbers per channel. Sequence numbers wrap around to 0 after
///  `NUM_SERIALS - 1`, so they must only ever be compared via [SequenceNumber::distance].
pub const NUM_SERIALS: u16 = 1024;

const HALF_SERIALS: i32 = NUM_SERIALS as i32 / 2;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SequenceNumber(u16);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    /// Values outside the sequence space are folded into it
    pub fn from_raw(value: u16) -> Self {
        Self(value % NUM_SERIALS)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        self.plus(1)
    }

    pub fn plus(&self, n: u16) -> SequenceNumber {
        let sum = (self.0 as u32 + n as u32) % NUM_SERIALS as u32;
        SequenceNumber(sum as u16)
    }

    /// Signed modular distance `self - other`, normalized into `[-NUM_SERIALS/2, NUM_SERIALS/2)`.
    ///
    /// Positive means `self` is 'after' `other`. NB: Two numbers exactly half the sequence space
    ///  apart have a distance of `-NUM_SERIALS/2` in both directions.
    pub fn distance(&self, other: SequenceNumber) -> i32 {
        let n = NUM_SERIALS as i32;
        let raw = (self.0 as i32 - other.0 as i32 + n) % n;
        if raw >= HALF_SERIALS {
            raw - n
        }
        else {
            raw
        }
    }
}
