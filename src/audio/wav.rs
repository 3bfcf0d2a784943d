use crate::{ColloquyError, Result};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::path::Path;
use tracing::info;

/// Write mono audio samples to a 16-bit WAV file
///
/// # Arguments
/// * `path` - Path to the output WAV file
/// * `samples` - Audio samples (f32, range -1.0 to 1.0)
/// * `sample_rate` - Sample rate in Hz
pub fn write_wav<P: AsRef<Path>>(path: P, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path.as_ref(), spec)
        .map_err(|e| ColloquyError::IOError(format!("Failed to create WAV writer: {}", e)))?;

    for &sample in samples {
        let sample_i16 = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer
            .write_sample(sample_i16)
            .map_err(|e| ColloquyError::IOError(format!("Failed to write sample: {}", e)))?;
    }

    writer
        .finalize()
        .map_err(|e| ColloquyError::IOError(format!("Failed to finalize WAV file: {}", e)))?;

    info!("Wrote {} samples to WAV file: {:?}", samples.len(), path.as_ref());
    Ok(())
}
