#![allow(missing_docs)]
//! Types for representing units used throughout the fabric harness.

macro_rules! unit {
    ($name: ident) => {
        #[derive(
            Debug,
            Default,
            Copy,
            Clone,
            PartialOrd,
            PartialEq,
            derive_more::Add,
            derive_more::Sub,
            derive_more::AddAssign,
            derive_more::SubAssign,
            derive_more::Sum,
            serde::Serialize,
            serde::Deserialize,
        )]
        pub struct $name(f64);

        impl $name {
            pub const ZERO: $name = Self::new(0.0);

            pub const fn new(value: f64) -> Self {
                Self(value)
            }

            pub const fn into_f64(self) -> f64 {
                self.0
            }

            pub fn scale_by(self, val: f64) -> Self {
                Self(self.0 * val)
            }
        }

        impl From<$name> for f64 {
            fn from(val: $name) -> Self {
                val.into_f64()
            }
        }

        impl From<f64> for $name {
            fn from(val: f64) -> Self {
                Self::new(val)
            }
        }

        impl Eq for $name {}

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.0.partial_cmp(&other.0).expect("NaN in ordered unit")
            }
        }
    };
}

unit!(Secs);

impl std::fmt::Display for Secs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}s", self.0)
    }
}

/// An integer byte count, as opposed to [`Secs`] which carries fractional precision.
#[derive(
    Debug,
    Default,
    Copy,
    Clone,
    PartialOrd,
    Ord,
    PartialEq,
    Eq,
    Hash,
    derive_more::Add,
    derive_more::Sub,
    derive_more::Sum,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Bytes(u64);

impl Bytes {
    pub const ZERO: Bytes = Self::new(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn into_u64(self) -> u64 {
        self.0
    }

    pub const fn into_f64(self) -> f64 {
        self.0 as f64
    }
}

impl std::fmt::Display for Bytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}B", self.0)
    }
}

impl From<Bytes> for f64 {
    fn from(val: Bytes) -> Self {
        val.into_f64()
    }
}

/// A GPU capacity cost, in units of whole GPUs.
#[derive(
    Debug,
    Default,
    Copy,
    Clone,
    PartialOrd,
    Ord,
    PartialEq,
    Eq,
    Hash,
    derive_more::Add,
    derive_more::Sub,
    derive_more::AddAssign,
    derive_more::SubAssign,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct GpuCost(u32);

impl GpuCost {
    pub const ZERO: GpuCost = Self::new(0);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn into_u32(self) -> u32 {
        self.0
    }
}
