// Audio module - tone rendering, offline verification and WAV export

pub mod spectrum;
pub mod tone;
pub mod wav;

// Re-export commonly used types for convenience
pub use spectrum::{analyze, ToneAnalysis};
pub use tone::{
    amplitude_for_level, clamped_amplitude, render_tone, split_channels, Pan, PlaybackRequest,
    StereoFrame, ToneEnvelope, ToneVoice,
};
pub use wav::{read_wav, write_wav};
