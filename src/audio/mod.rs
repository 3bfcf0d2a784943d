//! Playback devices and WAV export

#[cfg(feature = "audio-io")]
pub mod output;
pub mod playback;
#[cfg(feature = "audio-io")]
pub mod resampler;
pub mod wav;

#[cfg(feature = "audio-io")]
pub use output::CpalPlayback;
#[cfg(feature = "audio-io")]
pub use resampler::OutputResampler;
pub use playback::{AudioSource, PlaybackDevice, SimulatedPlayback};
pub use wav::write_wav;
