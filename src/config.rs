//! Configuration for the Lumina-Next-SFT sampler.
//!
//! Only the facts the sampler actually consumes are kept here: the latent
//! geometry and the attention head layout that determines the rotary
//! embedding dimension. The struct deserializes directly from the
//! transformer's `config.json` in the model repository, ignoring the fields
//! the sampler has no use for.

use serde::Deserialize;

/// Spatial compression of the VAE: one latent cell per 8x8 pixel block.
pub const VAE_SCALE_FACTOR: usize = 8;

/// Image width and height must be multiples of this stride.
pub const DIMENSION_STRIDE: usize = 64;

/// Transformer-derived configuration for the Next-DiT vector-field model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Latent grid size the model was trained at (default: 128).
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Patch size for patchifying latents (default: 2).
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,

    /// Number of latent channels (default: 4).
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,

    /// Transformer hidden dimension (default: 2304).
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Number of attention heads (default: 32).
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,
}

fn default_sample_size() -> usize {
    128
}
fn default_patch_size() -> usize {
    2
}
fn default_in_channels() -> usize {
    4
}
fn default_hidden_size() -> usize {
    2304
}
fn default_num_attention_heads() -> usize {
    32
}

impl Default for Config {
    fn default() -> Self {
        Self::lumina_next_sft()
    }
}

impl Config {
    /// Configuration for the Lumina-Next-SFT 2B model.
    pub fn lumina_next_sft() -> Self {
        Self {
            sample_size: 128,
            patch_size: 2,
            in_channels: 4,
            hidden_size: 2304,
            num_attention_heads: 32,
        }
    }

    /// Dimension per attention head = hidden_size / num_attention_heads = 72.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Pixel resolution the model was trained at: sample_size x 8 = 1024.
    ///
    /// Resolutions above this engage the rotary-embedding extrapolation
    /// factors; at exactly this size both factors stay 1.0.
    pub fn default_image_size(&self) -> usize {
        self.sample_size * VAE_SCALE_FACTOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::lumina_next_sft();
        assert_eq!(config.head_dim(), 72); // 2304 / 32
        assert_eq!(config.default_image_size(), 1024); // 128 * 8
    }

    #[test]
    fn test_config_from_json() {
        // Subset of Alpha-VLLM/Lumina-Next-SFT-diffusers transformer/config.json;
        // unknown fields are ignored.
        let json = r#"{
            "sample_size": 128,
            "patch_size": 2,
            "in_channels": 4,
            "hidden_size": 2304,
            "num_attention_heads": 32,
            "num_layers": 24,
            "num_kv_heads": 8
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config, Config::lumina_next_sft());
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::lumina_next_sft());
    }
}
