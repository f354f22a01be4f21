//! Speech to text.
//!
//! The transcription engine accepts 16 kHz mono PCM. Container decoding
//! beyond WAV and resampling are out of scope; callers must deliver audio in
//! the expected format. The mel projection uses the precomputed filterbank
//! shipped with the model archive over Hann-windowed FFT frames; the
//! encoder and decoder run as device applications like the text models.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use half::bf16;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use flm_npu::{Buffer, DeviceManager, DmaDirection, NpuApp, Tile};

use crate::error::EngineError;
use crate::meta::ChatMeta;
use crate::model::PREFILL_CHUNK;
use crate::{version, Result};

pub const SAMPLE_RATE: u32 = 16_000;
const N_FFT: usize = 400;
const HOP_LENGTH: usize = 160;
/// 30 seconds of audio at the hop length.
const MAX_FRAMES: usize = 3000;

fn default_n_mels() -> usize {
    128
}
fn default_encoder_bin() -> String {
    "encoder.xclbin".into()
}
fn default_decoder_bin() -> String {
    "decoder.xclbin".into()
}
fn default_max_text() -> usize {
    448
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhisperConfig {
    pub model_type: String,
    pub vocab_size: u32,
    pub hidden_size: u32,
    #[serde(default = "default_n_mels")]
    pub num_mel_bins: usize,
    #[serde(default = "default_max_text")]
    pub max_target_positions: usize,
    #[serde(default)]
    pub decoder_start_token_id: u32,
    #[serde(default)]
    pub eos_token_id: u32,
    #[serde(default = "default_flm_version")]
    pub flm_version: String,
    #[serde(default = "default_encoder_bin")]
    pub encoder_xclbin_name: String,
    #[serde(default = "default_decoder_bin")]
    pub decoder_xclbin_name: String,
}

fn default_flm_version() -> String {
    "0.0.0".into()
}

/// Extract f32 PCM from a WAV container; anything that is not 16 kHz mono is
/// refused (resampling is the out-of-scope decoder's job).
pub fn decode_wav(bytes: &[u8]) -> Result<Vec<f32>> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| EngineError::InvalidRequest(format!("unreadable WAV: {e}")))?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.sample_rate != SAMPLE_RATE {
        return Err(EngineError::InvalidRequest(format!(
            "expected {SAMPLE_RATE} Hz mono audio, got {} Hz x {} channels",
            spec.sample_rate, spec.channels
        )));
    }
    match spec.sample_format {
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| {
                    s.map(|v| v as f32 / scale)
                        .map_err(|e| EngineError::InvalidRequest(format!("bad sample: {e}")))
                })
                .collect()
        }
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .map(|s| s.map_err(|e| EngineError::InvalidRequest(format!("bad sample: {e}"))))
            .collect(),
    }
}

/// The precomputed mel filterbank: `n_mels x (N_FFT/2 + 1)` f32 values.
pub struct MelFilterbank {
    n_mels: usize,
    weights: Vec<f32>,
}

impl MelFilterbank {
    pub fn load(path: &Path, n_mels: usize) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let bins = N_FFT / 2 + 1;
        let expected = n_mels * bins * 4;
        if raw.len() != expected {
            return Err(EngineError::InvalidRequest(format!(
                "mel filterbank holds {} bytes, expected {expected}",
                raw.len()
            )));
        }
        let weights = raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { n_mels, weights })
    }

    /// Log-mel spectrogram, frame-major (`frames x n_mels`).
    pub fn log_mel(&self, pcm: &[f32]) -> Vec<f32> {
        let bins = N_FFT / 2 + 1;
        let window: Vec<f32> = (0..N_FFT)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / N_FFT as f32;
                0.5 * (1.0 - phase.cos())
            })
            .collect();
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(N_FFT);

        let frames = (pcm.len() / HOP_LENGTH).min(MAX_FRAMES).max(1);
        let mut out = vec![0f32; frames * self.n_mels];
        let mut buf = vec![Complex::new(0f32, 0f32); N_FFT];
        for frame in 0..frames {
            let start = frame * HOP_LENGTH;
            for i in 0..N_FFT {
                let sample = pcm.get(start + i).copied().unwrap_or(0.0);
                buf[i] = Complex::new(sample * window[i], 0.0);
            }
            fft.process(&mut buf);
            for mel in 0..self.n_mels {
                let mut acc = 0f32;
                for bin in 0..bins {
                    acc += self.weights[mel * bins + bin] * buf[bin].norm_sqr();
                }
                out[frame * self.n_mels + mel] = acc.max(1e-10).log10();
            }
        }
        // Whisper dynamic-range compression.
        let max = out.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        for v in out.iter_mut() {
            *v = (v.max(max - 8.0) + 4.0) / 4.0;
        }
        out
    }
}

/// Encoder/decoder transcription engine.
pub struct Whisper {
    config: WhisperConfig,
    tokenizer: Tokenizer,
    mel: MelFilterbank,
    encoder_app: NpuApp,
    decoder_app: NpuApp,
    mel_buf: Buffer<bf16>,
    features_buf: Buffer<bf16>,
    tokens_buf: Buffer<u32>,
    logits_buf: Buffer<bf16>,
}

impl Whisper {
    pub fn load(dir: &Path, device: Arc<DeviceManager>) -> Result<Self> {
        let raw = std::fs::read_to_string(dir.join("config.json"))?;
        let config: WhisperConfig = serde_json::from_str(&raw)?;
        version::check_model_compatible(&config.flm_version)?;
        let tokenizer = Tokenizer::from_file(dir.join("tokenizer.json"))
            .map_err(|e| EngineError::Tokenizer(e.to_string()))?;
        let mel = MelFilterbank::load(&dir.join("mel_filters.bin"), config.num_mel_bins)?;

        let encoder_ctx = device.register_binary(&dir.join(&config.encoder_xclbin_name))?;
        let decoder_ctx = device.register_binary(&dir.join(&config.decoder_xclbin_name))?;
        let encoder_app = device.create_app(&encoder_ctx);
        let decoder_app = device.create_app(&decoder_ctx);

        let hidden = config.hidden_size as usize;
        let mel_buf = device.alloc_buffer(MAX_FRAMES * config.num_mel_bins)?;
        let features_buf = device.alloc_buffer(MAX_FRAMES / 2 * hidden)?;
        let tokens_buf = device.alloc_buffer(config.max_target_positions.max(PREFILL_CHUNK))?;
        let logits_buf = device.alloc_buffer(config.vocab_size as usize)?;

        info!(target: "flm::engine", model_type = %config.model_type, "transcription model loaded");
        Ok(Self {
            config,
            tokenizer,
            mel,
            encoder_app,
            decoder_app,
            mel_buf,
            features_buf,
            tokens_buf,
            logits_buf,
        })
    }

    fn run_encoder(&mut self, frames: usize) -> Result<()> {
        let n_mels = self.config.num_mel_bins;
        let hidden = self.config.hidden_size as usize;
        let seq = self.encoder_app.seq_mut();
        seq.clear_cmds();
        seq.dma_memcpy_nd(
            2,
            0,
            DmaDirection::MM2S,
            Tile::shim(0),
            1,
            0,
            [0, 0, 0, 0],
            [1, 1, 1, (frames * n_mels) as u32],
            [1, 1, 1, 1],
            None,
            false,
        )?;
        seq.dma_memcpy_nd(
            2,
            1,
            DmaDirection::S2MM,
            Tile::shim(1),
            2,
            0,
            [0, 0, 0, 0],
            [1, 1, 1, (frames / 2 * hidden) as u32],
            [1, 1, 1, 1],
            None,
            true,
        )?;
        seq.dma_wait(Tile::shim(1), DmaDirection::S2MM, 0);
        let args = [self.mel_buf.bo()?, self.features_buf.bo()?];
        let state = self.encoder_app.launch(&args)?;
        if state != flm_npu::CmdState::Completed {
            return Err(EngineError::Npu(flm_npu::NpuError::DeviceLaunchFailure(state)));
        }
        Ok(())
    }

    fn run_decoder(&mut self, n_tokens: usize, frames: usize) -> Result<Vec<f32>> {
        let hidden = self.config.hidden_size as usize;
        let vocab = self.config.vocab_size as usize;
        let seq = self.decoder_app.seq_mut();
        seq.clear_cmds();
        seq.rtp_write(Tile::core(0, 0), 0x0400, n_tokens as u32);
        seq.dma_memcpy_nd(
            4,
            0,
            DmaDirection::MM2S,
            Tile::shim(0),
            1,
            0,
            [0, 0, 0, 0],
            [1, 1, 1, n_tokens as u32],
            [1, 1, 1, 1],
            None,
            false,
        )?;
        seq.dma_memcpy_nd(
            2,
            1,
            DmaDirection::MM2S,
            Tile::shim(1),
            2,
            0,
            [0, 0, 0, 0],
            [1, 1, 1, (frames / 2 * hidden) as u32],
            [1, 1, 1, 1],
            None,
            false,
        )?;
        seq.dma_memcpy_nd(
            2,
            2,
            DmaDirection::S2MM,
            Tile::shim(2),
            3,
            0,
            [0, 0, 0, 0],
            [1, 1, 1, vocab as u32],
            [1, 1, 1, 1],
            None,
            true,
        )?;
        seq.dma_wait(Tile::shim(2), DmaDirection::S2MM, 0);
        let args = [
            self.tokens_buf.bo()?,
            self.features_buf.bo()?,
            self.logits_buf.bo()?,
        ];
        let state = self.decoder_app.launch(&args)?;
        if state != flm_npu::CmdState::Completed {
            return Err(EngineError::Npu(flm_npu::NpuError::DeviceLaunchFailure(state)));
        }
        self.logits_buf.sync_from_device()?;
        Ok(self.logits_buf.as_slice().iter().map(|v| v.to_f32()).collect())
    }

    /// Transcribe 16 kHz mono PCM. Greedy decode.
    pub fn transcribe(&mut self, pcm: &[f32], meta: &mut ChatMeta) -> Result<String> {
        if pcm.is_empty() {
            return Err(EngineError::InvalidRequest("empty audio".into()));
        }
        let start = Instant::now();
        let mel = self.mel.log_mel(pcm);
        let n_mels = self.config.num_mel_bins;
        let frames = mel.len() / n_mels;

        for (i, &v) in mel.iter().enumerate() {
            self.mel_buf.as_mut_slice()[i] = bf16::from_f32(v);
        }
        self.mel_buf.sync_to_device()?;
        self.run_encoder(frames)?;
        meta.prefill_duration = start.elapsed().as_nanos() as u64;
        meta.prompt_tokens = frames as u32;

        let decode_start = Instant::now();
        let mut tokens = vec![self.config.decoder_start_token_id];
        while tokens.len() < self.config.max_target_positions {
            let n = tokens.len();
            self.tokens_buf.copy_from_slice(&tokens)?;
            self.tokens_buf.sync_to_device()?;
            let logits = self.run_decoder(n, frames)?;
            let next = logits
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(i, _)| i as u32)
                .unwrap_or(self.config.eos_token_id);
            if next == self.config.eos_token_id {
                break;
            }
            tokens.push(next);
        }
        meta.generated_tokens = tokens.len().saturating_sub(1) as u32;
        meta.decoding_duration = decode_start.elapsed().as_nanos() as u64;

        let text = self
            .tokenizer
            .decode(&tokens[1..], true)
            .map_err(|e| EngineError::Tokenizer(e.to_string()))?;
        debug!(target: "flm::engine", frames, tokens = tokens.len(), "transcription done");
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_filterbank(n_mels: usize) -> MelFilterbank {
        let bins = N_FFT / 2 + 1;
        MelFilterbank {
            n_mels,
            weights: vec![1.0 / bins as f32; n_mels * bins],
        }
    }

    #[test]
    fn test_log_mel_shape() {
        let mel = flat_filterbank(8);
        let pcm = vec![0.1f32; SAMPLE_RATE as usize]; // one second
        let out = mel.log_mel(&pcm);
        let frames = pcm.len() / HOP_LENGTH;
        assert_eq!(out.len(), frames * 8);
        // Compression keeps values in a narrow band around 1.
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_wav_decode_validates_format() {
        let mut bytes = Vec::new();
        {
            let spec = hound::WavSpec {
                channels: 1,
                sample_rate: SAMPLE_RATE,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let mut writer =
                hound::WavWriter::new(Cursor::new(&mut bytes), spec).unwrap();
            for i in 0..1600i32 {
                writer.write_sample((i % 128) as i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        let pcm = decode_wav(&bytes).unwrap();
        assert_eq!(pcm.len(), 1600);
        assert!(pcm.iter().all(|v| v.abs() <= 1.0));

        // Stereo is refused.
        let mut stereo = Vec::new();
        {
            let spec = hound::WavSpec {
                channels: 2,
                sample_rate: SAMPLE_RATE,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let mut writer =
                hound::WavWriter::new(Cursor::new(&mut stereo), spec).unwrap();
            writer.write_sample(0i16).unwrap();
            writer.write_sample(0i16).unwrap();
            writer.finalize().unwrap();
        }
        assert!(matches!(
            decode_wav(&stereo),
            Err(EngineError::InvalidRequest(_))
        ));
    }
}
