//! Sampling pipeline for Lumina-Next-SFT.
//!
//! The pipeline wires the three moving parts together by explicit
//! composition: the [`Ode`] integrator owns the loop, and the vector-field
//! closure built here recomputes the time-dependent rotary embedding and
//! invokes the transformer at every evaluation. The model is injected behind
//! the [`VelocityModel`] trait and is never mutated during sampling, so
//! concurrent runs over the same model cannot clobber each other.
//!
//! Text encoding, weight loading and VAE decoding live outside this crate;
//! callers hand in prompt-conditioning tensors and get final latents back.

use candle::{DType, Tensor};

use crate::config::{Config, DIMENSION_STRIDE, VAE_SCALE_FACTOR};
use crate::error::{Error, Result};
use crate::ode::Ode;
use crate::rng::BoxMullerRng;
use crate::rope::get_2d_rotary_pos_embed;
use crate::scaling::ResolutionScaling;

/// Auxiliary inputs for one vector-field evaluation.
#[derive(Debug)]
pub struct ModelInputs<'a> {
    /// Prompt-conditioning embeddings, `[batch, seq, dim]`.
    pub encoder_hidden_states: &'a Tensor,
    /// Rotary embedding for the latent token grid, `[tokens, head_dim/2, 2]`.
    ///
    /// Regenerated for every evaluation; its scale factors depend on the
    /// current time.
    pub image_rotary_emb: &'a Tensor,
    /// Reference sequence length for proportional attention, if enabled.
    pub base_sequence_length: Option<usize>,
}

/// The learned vector field: predicts velocity for a latent state at a time.
///
/// Implementations must be shape-preserving and must not mutate themselves
/// during a sampling run.
pub trait VelocityModel {
    fn forward(&self, latents: &Tensor, timestep: f64, inputs: &ModelInputs<'_>) -> Result<Tensor>;
}

/// Per-run generation parameters.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    /// Output height in pixels, a multiple of [`DIMENSION_STRIDE`].
    pub height: usize,
    /// Output width in pixels, a multiple of [`DIMENSION_STRIDE`].
    pub width: usize,
    /// Classifier-free guidance scale, applied when a negative prompt is
    /// supplied.
    pub guidance_scale: f64,
    /// Batch size: images generated per prompt in one latent batch.
    pub num_images_per_prompt: usize,
    /// Seed for the initial-noise generator.
    pub seed: u64,
    /// Time threshold where the rotary scaling regime switches.
    pub scaling_watershed: f64,
    /// Pass the trained token count to the model for attention rescaling.
    pub proportional_attn: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            height: 1024,
            width: 1024,
            guidance_scale: 4.0,
            num_images_per_prompt: 1,
            seed: 0,
            scaling_watershed: 1.0,
            proportional_attn: true,
        }
    }
}

/// Final latents of a sampling run, `[batch, channels, height/8, width/8]`.
#[derive(Debug)]
pub struct PipelineOutput {
    pub latents: Tensor,
}

impl PipelineOutput {
    /// Convert into the generic latent record node-graph hosts consume.
    pub fn into_samples(self) -> Result<LatentSamples> {
        Ok(LatentSamples {
            samples: self.latents.to_dtype(DType::F32)?,
        })
    }
}

/// Generic `samples` latent record.
#[derive(Debug)]
pub struct LatentSamples {
    pub samples: Tensor,
}

/// Text-to-image sampling pipeline around an injected vector-field model.
#[derive(Debug)]
pub struct LuminaNextPipeline<M> {
    model: M,
    config: Config,
}

impl<M: VelocityModel> LuminaNextPipeline<M> {
    pub fn new(model: M, config: Config) -> Self {
        Self { model, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the sampling trajectory and return the final latents.
    ///
    /// `prompt_embeds` (and `negative_prompt_embeds`, when guidance is
    /// wanted) are `[1, seq, dim]` or `[batch, seq, dim]` conditioning
    /// tensors. All parameters are validated before the first model
    /// evaluation; any error after that aborts the run with its step
    /// context.
    pub fn generate(
        &self,
        ode: &Ode,
        prompt_embeds: &Tensor,
        negative_prompt_embeds: Option<&Tensor>,
        params: &GenerationParams,
    ) -> Result<PipelineOutput> {
        validate_dimensions(params.height, params.width)?;
        if params.num_images_per_prompt == 0 {
            return Err(Error::config("num_images_per_prompt", "must be positive"));
        }
        if params.guidance_scale <= 0.0 || !params.guidance_scale.is_finite() {
            return Err(Error::config(
                "guidance_scale",
                format!("must be a positive finite value, got {}", params.guidance_scale),
            ));
        }
        let head_dim = self.config.head_dim();
        if head_dim * self.config.num_attention_heads != self.config.hidden_size
            || !head_dim.is_multiple_of(4)
        {
            return Err(Error::config(
                "hidden_size",
                format!(
                    "hidden_size {} and num_attention_heads {} give head_dim {}, \
                     which cannot carry a 2D rotary embedding",
                    self.config.hidden_size, self.config.num_attention_heads, head_dim
                ),
            ));
        }

        let device = prompt_embeds.device().clone();
        let latent_height = params.height / VAE_SCALE_FACTOR;
        let latent_width = params.width / VAE_SCALE_FACTOR;
        let batch = params.num_images_per_prompt;

        let scaling = ResolutionScaling::new(
            params.width,
            params.height,
            self.config.default_image_size(),
            params.scaling_watershed,
        )?;
        let base_sequence_length = params.proportional_attn.then(|| {
            let side = self.config.default_image_size() / 16;
            side * side
        });

        let prompt_embeds = repeat_for_batch(prompt_embeds, batch)?;
        let negative_prompt_embeds = negative_prompt_embeds
            .map(|t| repeat_for_batch(t, batch))
            .transpose()?;

        // Latents stay F32 across the whole trajectory; the model casts
        // internally if its weights are half precision.
        let mut rng = BoxMullerRng::new(params.seed);
        let latents = rng.randn(
            &[batch, self.config.in_channels, latent_height, latent_width],
            &device,
            DType::F32,
        )?;

        tracing::debug!(
            seed = params.seed,
            width = params.width,
            height = params.height,
            batch,
            steps = ode.num_steps(),
            solver = %ode.solver(),
            scale_factor = scaling.scale_factor(),
            "starting sampling run"
        );

        let model = &self.model;
        let guidance_scale = params.guidance_scale;
        let latents = ode.sample(latents, |x, t| {
            // The active factor flips at the watershed, so the embedding is
            // rebuilt for every evaluation rather than cached per run.
            let factors = scaling.factors_at(t);
            let image_rotary_emb = get_2d_rotary_pos_embed(
                head_dim,
                latent_height,
                latent_width,
                factors.linear,
                factors.ntk,
                &device,
            )?;

            let inputs = ModelInputs {
                encoder_hidden_states: &prompt_embeds,
                image_rotary_emb: &image_rotary_emb,
                base_sequence_length,
            };
            let cond = model.forward(x, t, &inputs)?;

            match &negative_prompt_embeds {
                Some(neg) => {
                    let neg_inputs = ModelInputs {
                        encoder_hidden_states: neg,
                        image_rotary_emb: &image_rotary_emb,
                        base_sequence_length,
                    };
                    let uncond = model.forward(x, t, &neg_inputs)?;
                    apply_classifier_free_guidance(&cond, &uncond, guidance_scale)
                }
                None => Ok(cond),
            }
        })?;

        Ok(PipelineOutput { latents })
    }
}

/// Check that a pixel resolution fits the latent and patch grid.
pub fn validate_dimensions(height: usize, width: usize) -> Result<()> {
    if height == 0 || !height.is_multiple_of(DIMENSION_STRIDE) {
        return Err(Error::config(
            "height",
            format!("must be a positive multiple of {DIMENSION_STRIDE}, got {height}"),
        ));
    }
    if width == 0 || !width.is_multiple_of(DIMENSION_STRIDE) {
        return Err(Error::config(
            "width",
            format!("must be a positive multiple of {DIMENSION_STRIDE}, got {width}"),
        ));
    }
    Ok(())
}

/// Classifier-free guidance: `uncond + scale * (cond - uncond)`.
pub fn apply_classifier_free_guidance(
    cond: &Tensor,
    uncond: &Tensor,
    guidance_scale: f64,
) -> Result<Tensor> {
    Ok((uncond + ((cond - uncond)? * guidance_scale)?)?)
}

/// Tile `[1, seq, dim]` conditioning up to the latent batch size.
fn repeat_for_batch(embeds: &Tensor, batch: usize) -> Result<Tensor> {
    let (embed_batch, _seq, _dim) = embeds.dims3()?;
    if embed_batch == batch {
        Ok(embeds.clone())
    } else if embed_batch == 1 {
        Ok(embeds.repeat((batch, 1, 1))?)
    } else {
        Err(Error::config(
            "prompt_embeds",
            format!("batch dimension {embed_batch} does not match num_images_per_prompt {batch}"),
        ))
    }
}
