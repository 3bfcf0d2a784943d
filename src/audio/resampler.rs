//! Sample-rate conversion from synthesized speech to the output device

use crate::{ColloquyError, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

/// Frames fed to the sinc resampler per call
const FRAMES_PER_CALL: usize = 1024;

/// Mono resampler kept alive across the chunks of one playback session
///
/// Reusing it between chunks keeps the filter state, so chunk boundaries do
/// not click.
pub struct OutputResampler {
    resampler: SincFixedIn<f32>,
    from: u32,
    to: u32,
}

impl OutputResampler {
    pub fn new(from: u32, to: u32) -> Result<Self> {
        if from == 0 || to == 0 {
            return Err(ColloquyError::ConfigError(format!(
                "Cannot resample {} Hz -> {} Hz",
                from, to
            )));
        }

        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler =
            SincFixedIn::<f32>::new(to as f64 / from as f64, 1.0, params, FRAMES_PER_CALL, 1)
                .map_err(|e| {
                    ColloquyError::PlaybackError(format!("Failed to create resampler: {}", e))
                })?;

        debug!("Output resampler {} Hz -> {} Hz", from, to);
        Ok(Self { resampler, from, to })
    }

    /// Whether this resampler converts between the given rates
    pub fn converts(&self, from: u32, to: u32) -> bool {
        self.from == from && self.to == to
    }

    /// Convert one chunk of mono samples
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let ratio = self.to as f64 / self.from as f64;
        let mut output = Vec::with_capacity((samples.len() as f64 * ratio) as usize + 1);

        for block in samples.chunks(FRAMES_PER_CALL) {
            let mut input = block.to_vec();
            input.resize(FRAMES_PER_CALL, 0.0);

            let produced = self
                .resampler
                .process(&[input], None)
                .map_err(|e| ColloquyError::PlaybackError(format!("Resampling failed: {}", e)))?;

            // A zero-padded tail only contributes its real share of output
            let keep = if block.len() == FRAMES_PER_CALL {
                produced[0].len()
            } else {
                (block.len() as f64 * ratio).ceil() as usize
            };
            output.extend(produced[0].iter().take(keep));
        }

        Ok(output)
    }
}
