//! Type definitions shared across the runtime abstraction.
//!
//! This module provides the device identifier newtype, the scalar trait for
//! transferable elements, and the kernel launch shape.

use num_traits::{NumAssign, NumCast};
use std::fmt::{self, Debug, Display};

/// Identifier of one accelerator, addressed by its integer ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId(pub usize);

impl DeviceId {
    /// Raw device ordinal.
    pub fn ordinal(self) -> usize {
        self.0
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {}", self.0)
    }
}

impl From<usize> for DeviceId {
    fn from(ordinal: usize) -> Self {
        Self(ordinal)
    }
}

/// Trait for element types that can live in device buffers.
///
/// Combines the numeric traits the two built-in kernels need (element-wise
/// addition and increment-by-one) with the marker bounds required to move
/// values between host and device memory.
pub trait Element:
    NumAssign + NumCast + PartialOrd + Display + Debug + Default + Copy + Send + Sync + 'static
{
    /// Suffix selecting the device kernel specialization for this type,
    /// e.g. `vector_add_f64`.
    const KERNEL_SUFFIX: &'static str;

    /// Convert to f64 for reporting.
    fn to_f64(self) -> f64 {
        num_traits::cast(self).expect("element does not fit in f64")
    }
}

impl Element for f32 {
    const KERNEL_SUFFIX: &'static str = "f32";
}

impl Element for f64 {
    const KERNEL_SUFFIX: &'static str = "f64";
}

impl Element for i32 {
    const KERNEL_SUFFIX: &'static str = "i32";
}

/// Default number of threads per group for kernel launches.
pub const DEFAULT_THREADS_PER_GROUP: u32 = 128;

/// Kernel launch shape: a fixed group size and the derived group count.
///
/// The group count for a launch over `len` elements is `ceil(len / threads)`;
/// kernels bounds-check against `len` so the trailing partial group never
/// touches memory past the slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LaunchShape {
    threads_per_group: u32,
}

impl LaunchShape {
    /// Create a shape with an explicit group size.
    ///
    /// # Panics
    ///
    /// Panics if `threads_per_group` is zero.
    pub fn with_threads_per_group(threads_per_group: u32) -> Self {
        assert!(threads_per_group > 0, "group size must be positive");
        Self { threads_per_group }
    }

    /// Number of threads in one group.
    pub fn threads_per_group(&self) -> u32 {
        self.threads_per_group
    }

    /// Number of groups needed to cover `len` elements.
    pub fn groups_for(&self, len: usize) -> u32 {
        len.div_ceil(self.threads_per_group as usize) as u32
    }
}

impl Default for LaunchShape {
    fn default() -> Self {
        Self {
            threads_per_group: DEFAULT_THREADS_PER_GROUP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_display() {
        assert_eq!(DeviceId(0).to_string(), "device 0");
        assert_eq!(DeviceId::from(3).ordinal(), 3);
    }

    #[test]
    fn test_launch_shape_groups() {
        let shape = LaunchShape::default();
        assert_eq!(shape.threads_per_group(), 128);
        assert_eq!(shape.groups_for(0), 0);
        assert_eq!(shape.groups_for(1), 1);
        assert_eq!(shape.groups_for(128), 1);
        assert_eq!(shape.groups_for(129), 2);
        assert_eq!(shape.groups_for(100), 1);
    }

    #[test]
    fn test_launch_shape_custom_group_size() {
        let shape = LaunchShape::with_threads_per_group(256);
        assert_eq!(shape.groups_for(1_000_000), 3907);
    }

    #[test]
    #[should_panic(expected = "group size must be positive")]
    fn test_launch_shape_rejects_zero() {
        let _ = LaunchShape::with_threads_per_group(0);
    }

    #[test]
    fn test_element_conversion() {
        assert_eq!(3.0_f32.to_f64(), 3.0);
        assert_eq!(<i32 as Element>::KERNEL_SUFFIX, "i32");
    }
}
