//! Nice values and their scheduling weights.

use core::fmt;

/// Lowest (most favorable) nice value.
pub const MIN_NICE: i32 = 0;

/// Highest (least favorable) nice value.
pub const MAX_NICE: i32 = 39;

/// Nice value of a newly created first process.
pub const DEFAULT_NICE: i32 = 20;

/// Weight of each nice value, from nice 0 to nice 39. Each step is roughly a 1.25x
/// change in CPU share; nice 20 is the neutral weight 1024.
const WEIGHTS: [u32; 40] = [
    /*  0 */ 88761, 71755, 56483, 46273, 36291,
    /*  5 */ 29154, 23254, 18705, 14949, 11916,
    /* 10 */ 9548, 7620, 6100, 4904, 3906,
    /* 15 */ 3121, 2501, 1991, 1586, 1277,
    /* 20 */ 1024, 820, 655, 526, 423,
    /* 25 */ 335, 272, 215, 172, 137,
    /* 30 */ 110, 87, 70, 56, 45,
    /* 35 */ 36, 29, 23, 18, 15,
];

/// Weight of the default nice value; virtual runtime advances at wall-clock rate for a
/// process with this weight.
pub const NEUTRAL_WEIGHT: u32 = WEIGHTS[DEFAULT_NICE as usize];

/// A validated nice value in `MIN_NICE..=MAX_NICE`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Nice(u8);

impl Nice {
    /// The default nice value.
    pub const DEFAULT: Nice = Nice(DEFAULT_NICE as u8);

    /// Returns the nice value `value`, or `None` if it is out of range.
    pub const fn new(value: i32) -> Option<Self> {
        if value >= MIN_NICE && value <= MAX_NICE {
            Some(Self(value as u8))
        } else {
            None
        }
    }

    /// Returns the nice value as an integer.
    pub const fn get(self) -> i32 {
        self.0 as i32
    }

    /// Returns the scheduling weight of this nice value.
    pub const fn weight(self) -> u32 {
        WEIGHTS[self.0 as usize]
    }
}

impl Default for Nice {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Debug for Nice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nice({})", self.0)
    }
}

impl fmt::Display for Nice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
