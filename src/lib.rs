//! Flow-matching sampler for Lumina-Next-SFT in Candle.
//!
//! Lumina-Next poses image generation as integrating an ODE along a learned
//! velocity field from noise (`t = 1`) to data (`t = 0`). This crate
//! implements the sampling core around that idea:
//!
//! - **Fixed-step ODE integration** over a shift-warped timestep schedule,
//!   with Euler, midpoint and classical RK4 schemes.
//! - **2D rotary position embeddings** with NTK-aware and linear resolution
//!   extrapolation, regenerated every step because the active scaling factor
//!   is time-dependent.
//! - **Time-aware scaling** that flips between the two extrapolation regimes
//!   at a configurable watershed in the schedule.
//!
//! # Architecture
//!
//! ```text
//! seed ─→ MT19937 noise ─→ ┌─────────────────────────────┐
//!                          │       Ode::sample           │
//! prompt embeds ─────────→ │  per evaluation:            │ ─→ final latents
//!                          │   t ─→ scaling regime       │    (→ VAE decode,
//! VelocityModel (NextDiT) →│     ─→ 2D rotary embedding  │     out of scope)
//!                          │     ─→ model forward (+CFG) │
//!                          └─────────────────────────────┘
//! ```
//!
//! The transformer itself, text encoding, weight I/O and VAE decoding are
//! external collaborators: the model is injected behind the
//! [`VelocityModel`] trait, and conditioning arrives as prepared tensors.
//! The integrator receives the vector field as an explicit callback rather
//! than patching any shared pipeline object, so concurrent runs cannot
//! interfere.
//!
//! # Modules
//!
//! - [`config`] — model facts the sampler consumes (latent geometry, head
//!   layout), deserializable from the transformer's `config.json`
//! - [`ode`] — solvers and the shifted timestep schedule
//! - [`rope`] — rotary embedding generation and application
//! - [`scaling`] — resolution scale factor and watershed branch
//! - [`rng`] — `torch.randn`-compatible seeded noise
//! - [`pipeline`] — composition, guidance, and the output latent record

pub mod config;
pub mod ode;
pub mod pipeline;
pub mod rng;
pub mod rope;
pub mod scaling;

mod error;

pub use config::{Config, DIMENSION_STRIDE, VAE_SCALE_FACTOR};
pub use error::{Error, Result};
pub use ode::{Ode, Solver};
pub use pipeline::{
    apply_classifier_free_guidance, validate_dimensions, GenerationParams, LatentSamples,
    LuminaNextPipeline, ModelInputs, PipelineOutput, VelocityModel,
};
pub use rng::BoxMullerRng;
pub use rope::{apply_rotary_emb, get_1d_rotary_pos_embed, get_2d_rotary_pos_embed};
pub use scaling::{ResolutionScaling, RopeFactors};
