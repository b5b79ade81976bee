//! Time-aware resolution scaling for rotary embeddings.
//!
//! When sampling above the trained resolution, the rotary embedding needs a
//! compensation factor `sqrt(width * height / default_size^2)`. Which knob
//! receives it depends on where the current time sits relative to the
//! `scaling_watershed`: early steps (large `t`, coarse structure) and late
//! steps (small `t`, fine detail) use different regimes, and the handover is
//! a sharp branch, not a blend.
//!
//! The scale factor itself only depends on static run configuration, so it
//! is computed once per run here; only the branch selection is evaluated per
//! step.

use crate::error::{Error, Result};

/// The `(linear, ntk)` factor pair for one vector-field evaluation.
///
/// Exactly one of the two equals the resolution scale factor; the other is
/// 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeFactors {
    pub linear: f64,
    pub ntk: f64,
}

/// Per-run resolution scaling state.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionScaling {
    scale_factor: f64,
    watershed: f64,
}

impl ResolutionScaling {
    /// Compute the scale factor for a run at `width` x `height` pixels
    /// against the model's trained `default_image_size`.
    pub fn new(
        width: usize,
        height: usize,
        default_image_size: usize,
        scaling_watershed: f64,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::config(
                "resolution",
                format!("must be positive, got {width}x{height}"),
            ));
        }
        if default_image_size == 0 {
            return Err(Error::config("default_image_size", "must be positive"));
        }
        if !(0.0..=1.0).contains(&scaling_watershed) {
            return Err(Error::config(
                "scaling_watershed",
                format!("must be in [0, 1], got {scaling_watershed}"),
            ));
        }
        let scale_factor = ((width * height) as f64
            / (default_image_size * default_image_size) as f64)
            .sqrt();
        Ok(Self {
            scale_factor,
            watershed: scaling_watershed,
        })
    }

    /// The resolution scale factor, `sqrt(width * height / default^2)`.
    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    /// Select the active factor for time `t`.
    ///
    /// `t < watershed` puts the scale on `linear`; at the watershed and above
    /// it sits on `ntk`. The comparison is strict `<` and the boundary is
    /// exact.
    pub fn factors_at(&self, t: f64) -> RopeFactors {
        if t < self.watershed {
            RopeFactors {
                linear: self.scale_factor,
                ntk: 1.0,
            }
        } else {
            RopeFactors {
                linear: 1.0,
                ntk: self.scale_factor,
            }
        }
    }
}
