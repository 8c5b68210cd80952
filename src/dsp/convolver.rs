//! Uniformly partitioned FFT convolution (overlap-save).
//!
//! The impulse response is split into blocks of `block` samples, each
//! transformed once up front. Input is gathered one block at a time; its
//! spectrum enters a frequency-domain delay line and is multiplied against
//! every partition. Output lags input by one block.

use std::fmt;
use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

/// Partition length used by the reverb.
pub const CONVOLUTION_BLOCK: usize = 256;

pub struct Convolver {
    block: usize,
    partitions: Vec<Vec<Complex<f32>>>,
    fdl: Vec<Vec<Complex<f32>>>,
    fdl_head: usize,
    r2c: Arc<dyn RealToComplex<f32>>,
    c2r: Arc<dyn ComplexToReal<f32>>,
    /// Previous block followed by the block being filled.
    window: Vec<f32>,
    time: Vec<f32>,
    accum: Vec<Complex<f32>>,
    fwd_scratch: Vec<Complex<f32>>,
    inv_scratch: Vec<Complex<f32>>,
    output: Vec<f32>,
    fill: usize,
}

impl Convolver {
    pub fn new(impulse: &[f32], block: usize) -> Self {
        let block = block.max(1);
        let fft_size = block * 2;
        let mut planner = RealFftPlanner::<f32>::new();
        let r2c = planner.plan_fft_forward(fft_size);
        let c2r = planner.plan_fft_inverse(fft_size);
        let mut fwd_scratch = r2c.make_scratch_vec();

        let impulse: &[f32] = if impulse.is_empty() { &[0.0] } else { impulse };
        let partitions: Vec<Vec<Complex<f32>>> = impulse
            .chunks(block)
            .map(|part| {
                let mut padded = vec![0.0; fft_size];
                padded[..part.len()].copy_from_slice(part);
                let mut spectrum = r2c.make_output_vec();
                if r2c
                    .process_with_scratch(&mut padded, &mut spectrum, &mut fwd_scratch)
                    .is_err()
                {
                    spectrum.fill(Complex::default());
                }
                spectrum
            })
            .collect();

        let bins = block + 1;
        Self {
            block,
            fdl: vec![vec![Complex::default(); bins]; partitions.len()],
            partitions,
            fdl_head: 0,
            inv_scratch: c2r.make_scratch_vec(),
            r2c,
            c2r,
            window: vec![0.0; fft_size],
            time: vec![0.0; fft_size],
            accum: vec![Complex::default(); bins],
            fwd_scratch,
            output: vec![0.0; block],
            fill: 0,
        }
    }

    /// Latency in samples.
    pub fn latency(&self) -> usize {
        self.block
    }

    #[inline]
    pub fn process_sample(&mut self, input: f32) -> f32 {
        self.window[self.block + self.fill] = input;
        let out = self.output[self.fill];
        self.fill += 1;
        if self.fill == self.block {
            self.process_block();
            self.fill = 0;
        }
        out
    }

    fn process_block(&mut self) {
        let count = self.partitions.len();
        self.time.copy_from_slice(&self.window);
        let head = self.fdl_head;
        if self
            .r2c
            .process_with_scratch(&mut self.time, &mut self.fdl[head], &mut self.fwd_scratch)
            .is_err()
        {
            self.fdl[head].fill(Complex::default());
        }

        self.accum.fill(Complex::default());
        for (p, partition) in self.partitions.iter().enumerate() {
            let spectrum = &self.fdl[(head + count - p) % count];
            for ((acc, x), h) in self.accum.iter_mut().zip(spectrum).zip(partition) {
                *acc += x * h;
            }
        }
        // DC and Nyquist bins of a real signal carry no imaginary part
        let last = self.accum.len() - 1;
        self.accum[0].im = 0.0;
        self.accum[last].im = 0.0;

        if self
            .c2r
            .process_with_scratch(&mut self.accum, &mut self.time, &mut self.inv_scratch)
            .is_ok()
        {
            let scale = 1.0 / (self.block * 2) as f32;
            for (out, &t) in self.output.iter_mut().zip(&self.time[self.block..]) {
                *out = t * scale;
            }
        } else {
            self.output.fill(0.0);
        }

        self.window.copy_within(self.block.., 0);
        self.fdl_head = (head + 1) % count;
    }
}

impl fmt::Debug for Convolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Convolver")
            .field("block", &self.block)
            .field("partitions", &self.partitions.len())
            .finish()
    }
}
