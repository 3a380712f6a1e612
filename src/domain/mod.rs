pub mod comment;
pub mod hash;
pub mod track;
pub mod waveform;
