//! Memory Formats
//!
//! Physical element ordering of 4-D activation and weight tensors.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use core::fmt;

use serde::{Deserialize, Serialize};

/// Physical memory ordering of a tensor's elements.
///
/// Only 4-D tensors have a distinct channels-last ordering; every other rank
/// is always stored contiguously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MemoryFormat {
    /// Row-major NCHW order.
    #[default]
    Contiguous,
    /// NHWC order, preferred by tensor-core convolution kernels.
    ChannelsLast,
}

impl MemoryFormat {
    /// Returns the format a tensor of the given rank actually uses.
    #[must_use]
    pub const fn effective(self, ndim: usize) -> Self {
        if ndim == 4 {
            self
        } else {
            Self::Contiguous
        }
    }

    /// Maps a logical NCHW linear index to its physical position.
    ///
    /// `shape` must be 4-D when `self` is `ChannelsLast`.
    #[must_use]
    pub fn physical_index(self, shape: &[usize], logical: usize) -> usize {
        match self.effective(shape.len()) {
            Self::Contiguous => logical,
            Self::ChannelsLast => {
                let (c, h, w) = (shape[1], shape[2], shape[3]);
                let n_i = logical / (c * h * w);
                let rem = logical % (c * h * w);
                let c_i = rem / (h * w);
                let rem = rem % (h * w);
                let h_i = rem / w;
                let w_i = rem % w;
                ((n_i * h + h_i) * w + w_i) * c + c_i
            }
        }
    }
}

impl fmt::Display for MemoryFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contiguous => write!(f, "contiguous"),
            Self::ChannelsLast => write!(f, "channels_last"),
        }
    }
}
