//! IR file loading and kernel building.
//!
//! Runs on the worker thread only: file IO, sample decode, resampling and
//! FFT preparation are all unbounded-time operations the audio thread never
//! touches.

use anyhow::{bail, Context, Result};
use hound::WavReader;
use irload_core::ConvolutionKernel;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::path::Path;

use crate::logger::InstanceLogger;

/// Anything longer buys no audible tail and burns partitions.
pub const MAX_IR_SECONDS: u32 = 10;

/// Load a mono impulse response: decode, pick channel 0, resample to the
/// engine rate, cap the length.
pub fn load_impulse(path: &Path, target_sr: u32, logger: &InstanceLogger) -> Result<Vec<f32>> {
    let mut reader =
        WavReader::open(path).with_context(|| format!("Failed to open IR file {:?}", path))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    if channels == 0 {
        bail!("IR file {:?} reports zero channels", path);
    }

    let norm_factor = match spec.bits_per_sample {
        16 => 32768.0,
        24 => 8388608.0,
        32 if spec.sample_format == hound::SampleFormat::Int => 2147483648.0,
        _ => 1.0,
    };

    let mut interleaved: Vec<f32> = Vec::with_capacity(reader.duration() as usize * channels);
    match spec.sample_format {
        hound::SampleFormat::Float => {
            for s in reader.samples::<f32>() {
                interleaved.push(s.unwrap_or(0.0));
            }
        }
        hound::SampleFormat::Int => {
            if spec.bits_per_sample == 16 {
                for s in reader.samples::<i16>() {
                    interleaved.push(s.unwrap_or(0) as f32 / norm_factor);
                }
            } else {
                for s in reader.samples::<i32>() {
                    interleaved.push(s.unwrap_or(0) as f32 / norm_factor);
                }
            }
        }
    }

    let mut mono: Vec<f32> = interleaved.iter().step_by(channels).copied().collect();
    if mono.is_empty() {
        bail!("IR file {:?} holds no audio", path);
    }
    if channels > 1 {
        logger.detailed_info(
            "Loader",
            &format!("IR has {} channels, using channel 0.", channels),
        );
    }

    if spec.sample_rate != target_sr {
        logger.info(
            "Loader",
            &format!(
                "Resampling IR {}Hz -> {}Hz ({} frames).",
                spec.sample_rate,
                target_sr,
                mono.len()
            ),
        );
        mono = resample_mono(mono, spec.sample_rate, target_sr);
    }

    let max_len = (target_sr * MAX_IR_SECONDS) as usize;
    if mono.len() > max_len {
        logger.warn(
            "Loader",
            &format!(
                "IR is {} frames, truncating to {} ({}s cap).",
                mono.len(),
                max_len,
                MAX_IR_SECONDS
            ),
        );
        mono.truncate(max_len);
    }

    Ok(mono)
}

/// Build a ready convolution kernel from an IR file.
pub fn build_kernel(
    path: &Path,
    normalise: bool,
    target_sr: u32,
    max_block: usize,
    logger: &InstanceLogger,
) -> Result<ConvolutionKernel> {
    let mut ir = load_impulse(path, target_sr, logger)?;
    if normalise {
        energy_normalise(&mut ir);
    }
    ConvolutionKernel::configure(&ir, max_block)
        .with_context(|| format!("Failed to prepare kernel for {:?}", path))
}

/// Scale the response to unit energy so switching IRs keeps loudness stable.
pub(crate) fn energy_normalise(ir: &mut [f32]) {
    let energy: f64 = ir.iter().map(|s| (*s as f64) * (*s as f64)).sum();
    if energy > 0.0 {
        let scale = (1.0 / energy.sqrt()) as f32;
        for s in ir.iter_mut() {
            *s *= scale;
        }
    }
}

fn resample_mono(input: Vec<f32>, source_sr: u32, target_sr: u32) -> Vec<f32> {
    if source_sr == 0 || target_sr == 0 || input.is_empty() {
        return input;
    }

    let frames = input.len();
    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = match SincFixedIn::<f32>::new(
        target_sr as f64 / source_sr as f64,
        2.0,
        params,
        frames,
        1,
    ) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("IRLoad: Resampler init failed: {}", e);
            return input;
        }
    };

    let channels = vec![input];
    let mut result = match resampler.process(&channels, None) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("IRLoad: Resampling failed: {}", e);
            return channels.into_iter().next().unwrap_or_default();
        }
    };

    // Flush the filter tail so the end of the response is not truncated.
    if let Ok(tail) = resampler.process_partial::<Vec<f32>>(None, None) {
        if let (Some(out), Some(t)) = (result.first_mut(), tail.first()) {
            out.extend_from_slice(t);
        }
    }

    let mut mono = result.swap_remove(0);

    // Compensate the sinc group delay so the IR onset stays aligned.
    let delay = resampler.output_delay();
    if delay > 0 {
        let len = mono.len();
        if len > delay {
            mono.copy_within(delay..len, 0);
            mono.truncate(len - delay);
            mono.resize(len, 0.0);
        } else {
            mono.fill(0.0);
        }
    }

    // Preserve the IR integral across the rate change.
    let gain_comp = source_sr as f32 / target_sr as f32;
    if (gain_comp - 1.0).abs() > f32::EPSILON {
        for v in &mut mono {
            *v *= gain_comp;
        }
    }

    mono
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{generate_instance_id, InstanceLogger};
    use hound::{SampleFormat, WavSpec, WavWriter};
    use std::sync::Arc;

    fn test_logger() -> Arc<InstanceLogger> {
        InstanceLogger::new(&generate_instance_id())
    }

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, samples: &[i16]) {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for s in samples {
            writer.write_sample(*s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn decodes_16_bit_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ir.wav");
        write_wav(&path, 48_000, 1, &[16384, -16384, 0]);

        let ir = load_impulse(&path, 48_000, &test_logger()).unwrap();
        assert_eq!(ir.len(), 3);
        assert!((ir[0] - 0.5).abs() < 1e-4);
        assert!((ir[1] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn picks_channel_zero_of_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        // Interleaved L/R: channel 0 carries the ramp.
        write_wav(&path, 48_000, 2, &[100, -1, 200, -2, 300, -3]);

        let ir = load_impulse(&path, 48_000, &test_logger()).unwrap();
        assert_eq!(ir.len(), 3);
        assert!(ir[0] > 0.0 && ir[1] > ir[0] && ir[2] > ir[1]);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = load_impulse(Path::new("/nonexistent/x.wav"), 48_000, &test_logger());
        assert!(err.is_err());
    }

    #[test]
    fn empty_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.wav");
        write_wav(&path, 48_000, 1, &[]);
        assert!(load_impulse(&path, 48_000, &test_logger()).is_err());
    }

    #[test]
    fn normalise_scales_to_unit_energy() {
        let mut ir = vec![3.0, 4.0];
        energy_normalise(&mut ir);
        let energy: f32 = ir.iter().map(|s| s * s).sum();
        assert!((energy - 1.0).abs() < 1e-5);
    }

    #[test]
    fn normalise_leaves_silence_alone() {
        let mut ir = vec![0.0; 8];
        energy_normalise(&mut ir);
        assert!(ir.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn build_kernel_yields_ready_kernel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ir.wav");
        write_wav(&path, 48_000, 1, &[32767, 0, 0, 0]);

        let kernel = build_kernel(&path, true, 48_000, 128, &test_logger()).unwrap();
        assert!(kernel.is_ready());
    }
}
