//! Merges a capture session's chunks into one mono 16-bit PCM buffer and
//! wraps it in the WAV envelope the transcription API consumes.

use crate::audio::{self, AudioChunk, StopReason, MIN_THRESHOLD};
use anyhow::{Context, Result};
use std::io::Cursor;

const PCM_FULL_SCALE: f32 = 32_767.0;

/// Outcome of merging a session: either a usable buffer or a recognized
/// nothing-to-transcribe case (zero samples or silence-only content).
#[derive(Debug, PartialEq, Eq)]
pub enum Assembled {
    Empty,
    Pcm(MonoPcm),
}

impl Assembled {
    pub fn is_empty(&self) -> bool {
        matches!(self, Assembled::Empty)
    }
}

/// Mono 16-bit samples at the session's sample rate.
#[derive(Debug, PartialEq, Eq)]
pub struct MonoPcm {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl MonoPcm {
    /// Encode as a 16-bit mono WAV byte stream for the multipart upload.
    pub fn wav_bytes(&self) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)
                .context("failed to start WAV writer")?;
            for sample in &self.samples {
                writer
                    .write_sample(*sample)
                    .context("failed to write WAV sample")?;
            }
            writer.finalize().context("failed to finalize WAV data")?;
        }
        Ok(cursor.into_inner())
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

/// Merge chunks in capture order into mono 16-bit PCM.
///
/// When the session stopped on silence, the trailing `silence_limit` chunks
/// are the confirmed-silent tail and are dropped first, so the transcript
/// reflects speech rather than the silence that confirmed the stop. The trim
/// is skipped when the session has no more chunks than the limit. Multi-channel
/// chunks are down-mixed by per-frame averaging; the result is rescaled only
/// downward so near-silent noise is never amplified, then quantized with
/// clipping.
pub fn assemble(
    chunks: &[AudioChunk],
    stop_reason: StopReason,
    silence_limit: usize,
    sample_rate: u32,
) -> Assembled {
    let keep = if stop_reason == StopReason::SilenceDetected && chunks.len() > silence_limit {
        &chunks[..chunks.len() - silence_limit]
    } else {
        chunks
    };

    let mut merged: Vec<f32> = Vec::with_capacity(keep.iter().map(AudioChunk::frames).sum());
    for chunk in keep {
        downmix_into(&mut merged, chunk);
    }

    if merged.is_empty() {
        return Assembled::Empty;
    }

    // Silence-only rejection uses the shared magnitude convention against the
    // calibration floor: content this quiet cannot be speech.
    if audio::magnitude(&merged) < MIN_THRESHOLD {
        return Assembled::Empty;
    }

    // Only scale down: quiet recordings keep their level, hot ones are tamed
    // so quantization cannot wrap.
    let peak = merged.iter().map(|s| s.abs()).fold(0.0_f32, f32::max);
    let scale = if peak > 1.0 { 1.0 / peak } else { 1.0 };
    let samples = merged
        .iter()
        .map(|s| {
            let value = (s * scale * PCM_FULL_SCALE).round();
            value.clamp(-PCM_FULL_SCALE, PCM_FULL_SCALE) as i16
        })
        .collect();

    Assembled::Pcm(MonoPcm {
        samples,
        sample_rate,
    })
}

fn downmix_into(out: &mut Vec<f32>, chunk: &AudioChunk) {
    let channels = usize::from(chunk.channels.max(1));
    if channels == 1 {
        out.extend_from_slice(&chunk.samples);
        return;
    }
    for frame in chunk.samples.chunks(channels) {
        let sum: f32 = frame.iter().sum();
        out.push(sum / frame.len() as f32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono(samples: &[f32]) -> AudioChunk {
        AudioChunk::mono(samples.to_vec())
    }

    #[test]
    fn empty_input_yields_empty() {
        assert!(assemble(&[], StopReason::UserRequested, 5, 16_000).is_empty());
    }

    #[test]
    fn silence_only_input_yields_empty() {
        let chunks = vec![mono(&[0.0; 64])];
        assert!(assemble(&chunks, StopReason::UserRequested, 5, 16_000).is_empty());
    }

    #[test]
    fn preserves_temporal_order() {
        let chunks = vec![mono(&[0.25, 0.25]), mono(&[0.5, 0.5])];
        match assemble(&chunks, StopReason::UserRequested, 5, 16_000) {
            Assembled::Pcm(pcm) => {
                assert_eq!(pcm.samples.len(), 4);
                assert!(pcm.samples[0] < pcm.samples[2]);
            }
            Assembled::Empty => panic!("expected PCM output"),
        }
    }

    #[test]
    fn silence_stop_trims_exactly_the_confirmed_tail() {
        let mut chunks = vec![mono(&[0.5; 8]); 3];
        chunks.extend(std::iter::repeat(mono(&[0.000001; 8])).take(5));
        match assemble(&chunks, StopReason::SilenceDetected, 5, 16_000) {
            Assembled::Pcm(pcm) => assert_eq!(pcm.samples.len(), 24),
            Assembled::Empty => panic!("speech chunks should survive the trim"),
        }
    }

    #[test]
    fn no_trim_for_non_silence_stops() {
        let chunks = vec![mono(&[0.5; 8]); 10];
        match assemble(&chunks, StopReason::UserRequested, 5, 16_000) {
            Assembled::Pcm(pcm) => assert_eq!(pcm.samples.len(), 80),
            Assembled::Empty => panic!("expected PCM output"),
        }
    }

    #[test]
    fn trim_never_underflows_short_sessions() {
        // 5 chunks with limit 5: trim skipped, everything merges.
        let chunks = vec![mono(&[0.5; 8]); 5];
        match assemble(&chunks, StopReason::SilenceDetected, 5, 16_000) {
            Assembled::Pcm(pcm) => assert_eq!(pcm.samples.len(), 40),
            Assembled::Empty => panic!("expected PCM output"),
        }
        // 3 chunks with limit 5 likewise.
        let chunks = vec![mono(&[0.5; 8]); 3];
        assert!(!assemble(&chunks, StopReason::SilenceDetected, 5, 16_000).is_empty());
    }

    #[test]
    fn silence_stop_trim_can_leave_only_trivial_content() {
        // Six quiet chunks at magnitude 0.00001 under the norm/len
        // convention: the trim removes five, and the surviving chunk sits
        // below the trivial-speech floor, so the merge reports Empty.
        let amplitude = 0.00001_f32 * (16_000.0_f32).sqrt();
        let chunks = vec![mono(&vec![amplitude; 16_000]); 6];
        assert!(assemble(&chunks, StopReason::SilenceDetected, 5, 16_000).is_empty());
    }

    #[test]
    fn downmixes_stereo_by_averaging_frames() {
        let chunk = AudioChunk {
            samples: vec![1.0, -1.0, 0.5, 0.5],
            channels: 2,
        };
        match assemble(&[chunk], StopReason::UserRequested, 5, 16_000) {
            Assembled::Pcm(pcm) => {
                assert_eq!(pcm.samples.len(), 2);
                assert_eq!(pcm.samples[0], 0);
                assert_eq!(pcm.samples[1], 16_384);
            }
            Assembled::Empty => panic!("expected PCM output"),
        }
    }

    #[test]
    fn hot_input_is_scaled_down_not_wrapped() {
        let chunks = vec![mono(&[2.0, -2.0, 1.0])];
        match assemble(&chunks, StopReason::UserRequested, 5, 16_000) {
            Assembled::Pcm(pcm) => {
                assert_eq!(pcm.samples[0], 32_767);
                assert_eq!(pcm.samples[1], -32_767);
                assert_eq!(pcm.samples[2], 16_384);
            }
            Assembled::Empty => panic!("expected PCM output"),
        }
    }

    #[test]
    fn quiet_input_is_never_amplified() {
        let chunks = vec![mono(&[0.01, -0.01])];
        match assemble(&chunks, StopReason::UserRequested, 5, 16_000) {
            Assembled::Pcm(pcm) => {
                assert_eq!(pcm.samples[0], 328);
                assert_eq!(pcm.samples[1], -328);
            }
            Assembled::Empty => panic!("expected PCM output"),
        }
    }

    #[test]
    fn wav_bytes_carry_a_riff_header() {
        let pcm = MonoPcm {
            samples: vec![0, 100, -100, 2_000],
            sample_rate: 16_000,
        };
        let bytes = pcm.wav_bytes().unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        // 44-byte canonical header plus two bytes per sample.
        assert_eq!(bytes.len(), 44 + 8);
    }

    #[test]
    fn duration_reflects_sample_count() {
        let pcm = MonoPcm {
            samples: vec![0; 16_000],
            sample_rate: 16_000,
        };
        assert!((pcm.duration_secs() - 1.0).abs() < 1e-9);
    }
}
