use candle::Error as CandleError;

/// Errors surfaced by the sampler core.
///
/// Configuration problems are reported before any model evaluation runs.
/// Everything that happens mid-run carries the step index and the time value
/// at which it occurred, so a failed run can be traced to the exact point in
/// the schedule.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An input parameter failed validation.
    #[error("invalid {param}: {message}")]
    Config { param: &'static str, message: String },

    /// The velocity-field callback failed during integration.
    #[error("velocity evaluation failed at step {step} (t = {time:.4}): {source}")]
    Evaluation {
        step: usize,
        time: f64,
        #[source]
        source: Box<Error>,
    },

    /// NaN or Inf appeared in the latent state after an integration step.
    ///
    /// This indicates integration instability (for example a too-aggressive
    /// `t_shift` or an embedding scale incompatible with the resolution) and
    /// is never clamped or recovered from.
    #[error("non-finite latents after step {step} (t = {time:.4})")]
    NonFinite { step: usize, time: f64 },

    #[error(transparent)]
    Candle(#[from] CandleError),
}

impl Error {
    pub(crate) fn config(param: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            param,
            message: message.into(),
        }
    }

    pub(crate) fn evaluation(step: usize, time: f64, source: Error) -> Self {
        Self::Evaluation {
            step,
            time,
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
