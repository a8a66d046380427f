//! Uniformly partitioned FFT convolution.
//!
//! The impulse response is split into equal partitions, each transformed once
//! at configure time. At run time every hop of `partition_len` input samples
//! is transformed, pushed into a frequency-domain delay line and multiplied
//! against the partition spectra (overlap-save, FFT size = 2 partitions).
//! All storage is allocated in `configure`; `compute` is allocation-free and
//! accepts any block length through an internal staging buffer, at the cost
//! of one partition of latency.

use realfft::num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use std::sync::Arc;

use crate::partition_for_block;

#[derive(Debug)]
pub enum KernelError {
    EmptyResponse,
}

impl std::fmt::Display for KernelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelError::EmptyResponse => write!(f, "impulse response is empty"),
        }
    }
}

impl std::error::Error for KernelError {}

pub struct ConvolutionKernel {
    partition_len: usize,
    fft_len: usize,
    running: bool,

    r2c: Arc<dyn RealToComplex<f32>>,
    c2r: Arc<dyn ComplexToReal<f32>>,
    fwd_scratch: Vec<Complex<f32>>,
    inv_scratch: Vec<Complex<f32>>,

    // One spectrum per IR partition, fixed after configure.
    ir_spectra: Vec<Vec<Complex<f32>>>,
    // Input spectra, newest at fdl_pos.
    fdl: Vec<Vec<Complex<f32>>>,
    fdl_pos: usize,

    acc: Vec<Complex<f32>>,
    time_in: Vec<f32>,
    time_out: Vec<f32>,
    // Previous hop of input, the overlap half of the FFT window.
    history: Vec<f32>,

    staging: Vec<f32>,
    staged: usize,
    out_ring: Vec<f32>,
    ring_head: usize,
    ring_len: usize,
}

impl ConvolutionKernel {
    /// Build a kernel from a mono impulse response, prepared for blocks of up
    /// to `max_block` frames. Slow (allocates and transforms every
    /// partition); runs on the worker thread, never the audio thread.
    pub fn configure(ir: &[f32], max_block: usize) -> Result<Self, KernelError> {
        if ir.is_empty() {
            return Err(KernelError::EmptyResponse);
        }

        let partition_len = partition_for_block(max_block);
        let fft_len = partition_len * 2;
        let bins = fft_len / 2 + 1;
        let partitions = ir.len().div_ceil(partition_len);

        let mut planner = RealFftPlanner::<f32>::new();
        let r2c = planner.plan_fft_forward(fft_len);
        let c2r = planner.plan_fft_inverse(fft_len);
        let mut fwd_scratch = vec![Complex::default(); r2c.get_scratch_len()];
        let inv_scratch = vec![Complex::default(); c2r.get_scratch_len()];

        let mut ir_spectra = Vec::with_capacity(partitions);
        let mut padded = vec![0.0f32; fft_len];
        for chunk in ir.chunks(partition_len) {
            padded[..chunk.len()].copy_from_slice(chunk);
            padded[chunk.len()..].fill(0.0);
            let mut spectrum = vec![Complex::default(); bins];
            r2c.process_with_scratch(&mut padded, &mut spectrum, &mut fwd_scratch)
                .expect("forward FFT length mismatch");
            ir_spectra.push(spectrum);
        }

        log::info!(
            "IRLoad: Kernel configured: {} taps, {} partitions of {}.",
            ir.len(),
            partitions,
            partition_len
        );

        Ok(Self {
            partition_len,
            fft_len,
            running: true,
            r2c,
            c2r,
            fwd_scratch,
            inv_scratch,
            ir_spectra,
            fdl: vec![vec![Complex::default(); bins]; partitions],
            fdl_pos: 0,
            acc: vec![Complex::default(); bins],
            time_in: vec![0.0; fft_len],
            time_out: vec![0.0; fft_len],
            history: vec![0.0; partition_len],
            staging: vec![0.0; partition_len],
            staged: 0,
            out_ring: vec![0.0; fft_len],
            ring_head: 0,
            ring_len: 0,
        })
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.running
    }

    /// One partition of delay between input and convolved output.
    #[inline]
    pub fn latency_samples(&self) -> usize {
        self.partition_len
    }

    /// Convolve `block` in place. Any block length; bounded work per sample.
    pub fn compute(&mut self, block: &mut [f32]) {
        if !self.running {
            return;
        }
        for sample in block.iter_mut() {
            let out = self.ring_pop();
            self.staging[self.staged] = *sample;
            self.staged += 1;
            if self.staged == self.partition_len {
                self.staged = 0;
                self.process_hop();
            }
            *sample = out;
        }
    }

    /// Drop all streaming history, keeping the prepared partition spectra.
    pub fn reset_state(&mut self) {
        for spectrum in &mut self.fdl {
            spectrum.fill(Complex::default());
        }
        self.fdl_pos = 0;
        self.history.fill(0.0);
        self.staged = 0;
        self.ring_head = 0;
        self.ring_len = 0;
    }

    /// Take the kernel out of the signal path; `compute` becomes a no-op.
    pub fn stop(&mut self) {
        self.running = false;
    }

    fn process_hop(&mut self) {
        let b = self.partition_len;
        let partitions = self.fdl.len();

        self.time_in[..b].copy_from_slice(&self.history);
        self.time_in[b..].copy_from_slice(&self.staging);
        self.history.copy_from_slice(&self.staging);

        self.fdl_pos = (self.fdl_pos + 1) % partitions;
        self.r2c
            .process_with_scratch(
                &mut self.time_in,
                &mut self.fdl[self.fdl_pos],
                &mut self.fwd_scratch,
            )
            .expect("forward FFT length mismatch");

        self.acc.fill(Complex::default());
        for p in 0..partitions {
            let slot = (self.fdl_pos + partitions - p) % partitions;
            let input = &self.fdl[slot];
            let ir = &self.ir_spectra[p];
            for ((a, x), h) in self.acc.iter_mut().zip(input).zip(ir) {
                *a += x * h;
            }
        }

        // DC and Nyquist bins must be purely real for the inverse transform.
        self.acc[0].im = 0.0;
        let last = self.acc.len() - 1;
        self.acc[last].im = 0.0;
        self.c2r
            .process_with_scratch(&mut self.acc, &mut self.time_out, &mut self.inv_scratch)
            .expect("inverse FFT length mismatch");

        // Overlap-save: the first half is circularly aliased, the second half
        // is the valid linear convolution of this hop.
        let scale = 1.0 / self.fft_len as f32;
        for i in 0..b {
            let v = self.time_out[b + i] * scale;
            self.ring_push(v);
        }
    }

    #[inline]
    fn ring_pop(&mut self) -> f32 {
        if self.ring_len == 0 {
            return 0.0;
        }
        let v = self.out_ring[self.ring_head];
        self.ring_head = (self.ring_head + 1) % self.out_ring.len();
        self.ring_len -= 1;
        v
    }

    #[inline]
    fn ring_push(&mut self, v: f32) {
        let tail = (self.ring_head + self.ring_len) % self.out_ring.len();
        self.out_ring[tail] = v;
        if self.ring_len < self.out_ring.len() {
            self.ring_len += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct_convolve(signal: &[f32], ir: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0; signal.len()];
        for (n, o) in out.iter_mut().enumerate() {
            for (k, h) in ir.iter().enumerate() {
                if n >= k {
                    *o += signal[n - k] * h;
                }
            }
        }
        out
    }

    #[test]
    fn rejects_empty_response() {
        assert!(ConvolutionKernel::configure(&[], 128).is_err());
    }

    #[test]
    fn delta_ir_is_delayed_identity() {
        let mut kernel = ConvolutionKernel::configure(&[1.0], 64).unwrap();
        let latency = kernel.latency_samples();
        let signal: Vec<f32> = (0..256).map(|i| (i as f32 * 0.13).sin()).collect();
        let mut block = signal.clone();
        block.resize(signal.len() + latency, 0.0);
        kernel.compute(&mut block);
        for i in 0..signal.len() {
            assert!(
                (block[i + latency] - signal[i]).abs() < 1e-4,
                "sample {} differs: {} vs {}",
                i,
                block[i + latency],
                signal[i]
            );
        }
    }

    #[test]
    fn multi_partition_matches_direct_convolution() {
        // IR longer than one partition so the delay line actually rotates.
        let ir: Vec<f32> = (0..200).map(|i| ((i * 7) % 13) as f32 * 0.05 - 0.3).collect();
        let mut kernel = ConvolutionKernel::configure(&ir, 64).unwrap();
        let latency = kernel.latency_samples();
        let signal: Vec<f32> = (0..512).map(|i| ((i * 3) % 17) as f32 * 0.1 - 0.8).collect();

        let mut block = signal.clone();
        block.resize(signal.len() + latency, 0.0);
        kernel.compute(&mut block);

        let expected = direct_convolve(&signal, &ir);
        for i in 0..signal.len() {
            assert!(
                (block[i + latency] - expected[i]).abs() < 1e-3,
                "sample {} differs: {} vs {}",
                i,
                block[i + latency],
                expected[i]
            );
        }
    }

    #[test]
    fn chunked_blocks_match_single_pass() {
        let ir: Vec<f32> = (0..150).map(|i| (i as f32 * 0.21).cos() * 0.1).collect();
        let signal: Vec<f32> = (0..400).map(|i| (i as f32 * 0.37).sin()).collect();

        let mut whole = signal.clone();
        let mut kernel = ConvolutionKernel::configure(&ir, 64).unwrap();
        kernel.compute(&mut whole);

        // Same stream pushed through in ragged chunks must be identical.
        let mut chunked = signal.clone();
        let mut kernel = ConvolutionKernel::configure(&ir, 64).unwrap();
        let mut pos = 0usize;
        for size in [7usize, 64, 33, 1, 100].iter().cycle() {
            if pos >= chunked.len() {
                break;
            }
            let take = (*size).min(chunked.len() - pos);
            kernel.compute(&mut chunked[pos..pos + take]);
            pos += take;
        }

        for (i, (a, b)) in whole.iter().zip(&chunked).enumerate() {
            assert!((a - b).abs() < 1e-5, "sample {} differs: {} vs {}", i, a, b);
        }
    }

    #[test]
    fn reset_clears_tail() {
        let ir = vec![0.5; 300];
        let mut kernel = ConvolutionKernel::configure(&ir, 64).unwrap();
        let mut block = vec![1.0; 256];
        kernel.compute(&mut block);
        kernel.reset_state();

        let mut silence = vec![0.0; 256];
        kernel.compute(&mut silence);
        assert!(silence.iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn stopped_kernel_passes_through() {
        let mut kernel = ConvolutionKernel::configure(&[1.0, 0.5], 64).unwrap();
        kernel.stop();
        assert!(!kernel.is_ready());
        let mut block = vec![0.25; 32];
        kernel.compute(&mut block);
        assert!(block.iter().all(|s| (*s - 0.25).abs() < 1e-9));
    }
}
