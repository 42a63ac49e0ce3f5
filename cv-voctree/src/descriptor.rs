use core::fmt;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

/// The number of components in a [`Descriptor`].
pub const DESCRIPTOR_LEN: usize = 128;

/// A SIFT-like floating point local feature descriptor.
#[derive(Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor(#[serde(with = "BigArray")] pub [f32; DESCRIPTOR_LEN]);

impl Descriptor {
    pub fn zeros() -> Self {
        Self([0.0; DESCRIPTOR_LEN])
    }

    /// Squared Euclidean distance.
    pub fn distance_squared(&self, other: &Self) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }

    pub fn distance(&self, other: &Self) -> f32 {
        self.distance_squared(other).sqrt()
    }
}

impl Default for Descriptor {
    fn default() -> Self {
        Self::zeros()
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Descriptor").field(&&self.0[..]).finish()
    }
}

impl From<[f32; DESCRIPTOR_LEN]> for Descriptor {
    fn from(components: [f32; DESCRIPTOR_LEN]) -> Self {
        Self(components)
    }
}
