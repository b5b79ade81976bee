//! Seeded normal sampling compatible with `torch.randn`.
//!
//! Initial latents are drawn from MT19937 + Box-Muller, the exact algorithm
//! behind `torch.Generator().manual_seed(seed)` followed by `torch.randn`.
//! Matching the bit patterns keeps runs reproducible against the reference
//! pipeline, not just internally.
//!
//! PyTorch switches algorithms on tensor size: below 16 elements it draws
//! 53-bit double-precision uniforms with a cached second Box-Muller sample;
//! from 16 elements up it fills lanes of 16 from 24-bit float uniforms. Both
//! paths are reproduced here.

use candle::{DType, Device, Tensor};
use rand_mt::Mt;

use crate::error::Result;

/// MT19937 + Box-Muller generator.
#[derive(Debug, Clone)]
pub struct BoxMullerRng {
    rng: Mt,
    /// Box-Muller yields pairs; the scalar path returns one and caches one.
    cached: Option<f32>,
}

impl BoxMullerRng {
    /// Seed the generator. Torch keeps only the low 32 bits of the seed, so
    /// the same truncation is applied here.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mt::new(seed as u32),
            cached: None,
        }
    }

    /// 53-bit uniform in [0, 1) from two 32-bit draws.
    #[inline]
    fn uniform_f64(&mut self) -> f64 {
        let lo = self.rng.next_u32() as u64;
        let hi = self.rng.next_u32() as u64;
        const MASK_53BIT: u64 = 0x001F_FFFF_FFFF_FFFF;
        (((lo << 32) | hi) & MASK_53BIT) as f64 / 9_007_199_254_740_992.0 // 2^53
    }

    /// 24-bit uniform in [0, 1) from one 32-bit draw.
    #[inline]
    fn uniform_f32(&mut self) -> f32 {
        (self.rng.next_u32() & 0x00FF_FFFF) as f32 / 16_777_216.0 // 2^24
    }

    /// One N(0, 1) sample via the scalar path.
    pub fn sample_scalar(&mut self) -> f32 {
        if let Some(cached) = self.cached.take() {
            return cached;
        }
        let u1 = self.uniform_f64();
        let u2 = self.uniform_f64();
        // log(1 - u2) rather than log(u2): u2 can be exactly 0.
        let r = (-2.0 * (1.0 - u2).ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u1;
        self.cached = Some((r * theta.sin()) as f32);
        (r * theta.cos()) as f32
    }

    /// Fill `count` N(0, 1) samples via the vectorized path.
    ///
    /// Lanes of 16: uniforms 0..8 become radii (with a `1 - u` transform),
    /// uniforms 8..16 become angles; the cos outputs land in the first eight
    /// slots and the sin outputs in the last eight. A trailing remainder
    /// falls back to the scalar path.
    fn fill_vectorized(&mut self, count: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count / 16 {
            let uniforms: [f32; 16] = std::array::from_fn(|_| self.uniform_f32());
            let mut sins = [0f32; 8];
            for i in 0..8 {
                let r = (-2.0 * (1.0 - uniforms[i]).ln()).sqrt();
                let theta = 2.0 * std::f32::consts::PI * uniforms[8 + i];
                out.push(r * theta.cos());
                sins[i] = r * theta.sin();
            }
            out.extend_from_slice(&sins);
        }
        for _ in 0..count % 16 {
            out.push(self.sample_scalar());
        }
        out
    }

    /// Draw a tensor of N(0, 1) samples.
    pub fn randn(&mut self, shape: &[usize], device: &Device, dtype: DType) -> Result<Tensor> {
        let elem_count: usize = shape.iter().product();
        let data = if elem_count >= 16 {
            self.fill_vectorized(elem_count)
        } else {
            (0..elem_count).map(|_| self.sample_scalar()).collect()
        };
        let cpu = Tensor::from_vec(data, shape, &Device::Cpu)?;
        let tensor = if matches!(device, Device::Cpu) {
            cpu
        } else {
            cpu.to_device(device)?
        };
        Ok(tensor.to_dtype(dtype)?)
    }
}
