//! PFB/FFT compute context for the low-bandwidth pipeline.
//!
//! Owns every buffer the transform needs: the 8-tap Hamming-windowed sinc
//! prefilter, FFT scratch, and one Stokes accumulator. The context is built
//! once per scan, reused across scans when the geometry matches, and torn
//! down synchronously when the stage exits.
//!
//! Input samples are dual-polarization complex int8, one `[i8; 4]` per
//! subband lane per time step, lanes interleaved. The FFT runs batched over
//! `2 * nsubband` lanes (two polarizations per subband) exactly like the
//! batched transform in the original device code.

use crate::error::{DaqError, Result};
use crate::obs::NUM_STOKES;

pub const NUM_TAPS: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Complex {
    pub re: f32,
    pub im: f32,
}

impl Complex {
    fn add(self, other: Complex) -> Complex {
        Complex {
            re: self.re + other.re,
            im: self.im + other.im,
        }
    }

    fn sub(self, other: Complex) -> Complex {
        Complex {
            re: self.re - other.re,
            im: self.im - other.im,
        }
    }

    fn mul(self, other: Complex) -> Complex {
        Complex {
            re: self.re * other.re - self.im * other.im,
            im: self.re * other.im + self.im * other.re,
        }
    }

    pub fn power(self) -> f32 {
        self.re * self.re + self.im * self.im
    }
}

/// In-place iterative radix-2 FFT. Channel counts are powers of two by
/// construction of the modes (256 .. 32768).
pub fn fft(buf: &mut [Complex]) {
    let n = buf.len();
    debug_assert!(n.is_power_of_two());

    let mut j = 0;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            buf.swap(i, j);
        }
    }

    let mut len = 2;
    while len <= n {
        let ang = -2.0 * std::f32::consts::PI / len as f32;
        let (sin, cos) = ang.sin_cos();
        let wlen = Complex { re: cos, im: sin };
        for start in (0..n).step_by(len) {
            let mut w = Complex { re: 1.0, im: 0.0 };
            for k in 0..len / 2 {
                let u = buf[start + k];
                let v = buf[start + k + len / 2].mul(w);
                buf[start + k] = u.add(v);
                buf[start + k + len / 2] = u.sub(v);
                w = w.mul(wlen);
            }
        }
        len <<= 1;
    }
}

/// 8-tap polyphase prefilter coefficients: a Hamming window over a sinc with
/// one zero crossing per channel spacing.
pub fn pfb_coefficients(nchan: usize) -> Vec<f32> {
    let n = NUM_TAPS * nchan;
    (0..n)
        .map(|i| {
            let x = i as f32 / nchan as f32 - (NUM_TAPS / 2) as f32;
            let window =
                0.54 - 0.46 * (2.0 * std::f32::consts::PI * i as f32 / (n - 1) as f32).cos();
            let sinc = if x == 0.0 {
                1.0
            } else {
                let px = std::f32::consts::PI * x;
                px.sin() / px
            };
            window * sinc
        })
        .collect()
}

pub struct DspContext {
    nchan: usize,
    nsubband: usize,
    in_block_size: usize,
    out_block_size: usize,
    coeff: Vec<f32>,
    fft_x: Vec<Complex>,
    fft_y: Vec<Complex>,
    /// `[nchan][nsubband]` Stokes products (XX, YY, Re XY*, Im XY*).
    accum: Vec<[f32; NUM_STOKES]>,
    acc_count: u32,
}

impl DspContext {
    pub fn new(
        nchan: usize,
        nsubband: usize,
        in_block_size: usize,
        out_block_size: usize,
    ) -> Result<DspContext> {
        if !nchan.is_power_of_two() || nchan < 2 {
            return Err(DaqError::Param(format!("nchan {nchan} not a power of two")));
        }
        if nsubband == 0 || nsubband > crate::obs::MAX_SUBBANDS {
            return Err(DaqError::Param(format!("nsubband {nsubband} out of range")));
        }
        Ok(DspContext {
            nchan,
            nsubband,
            in_block_size,
            out_block_size,
            coeff: pfb_coefficients(nchan),
            fft_x: vec![Complex::default(); nchan],
            fft_y: vec![Complex::default(); nchan],
            accum: vec![[0.0; NUM_STOKES]; nchan * nsubband],
            acc_count: 0,
        })
    }

    /// Whether this context can be reused for the given scan geometry.
    pub fn verify_setup(
        &self,
        nchan: usize,
        nsubband: usize,
        in_block_size: usize,
        out_block_size: usize,
    ) -> bool {
        self.nchan == nchan
            && self.nsubband == nsubband
            && self.in_block_size == in_block_size
            && self.out_block_size == out_block_size
    }

    pub fn nchan(&self) -> usize {
        self.nchan
    }

    pub fn nsubband(&self) -> usize {
        self.nsubband
    }

    /// Time steps consumed before the first spectrum can be produced.
    pub fn window_len(&self) -> usize {
        NUM_TAPS * self.nchan
    }

    pub fn fft_batch(&self) -> usize {
        2 * self.nsubband
    }

    pub fn accumulation_count(&self) -> u32 {
        self.acc_count
    }

    pub fn zero_accumulator(&mut self) {
        self.accum.fill([0.0; NUM_STOKES]);
        self.acc_count = 0;
    }

    /// Run the prefilter + FFT over one window of `NUM_TAPS * nchan` time
    /// steps and, unless the window is blanked, add the Stokes products into
    /// the accumulator. `samples[t * nsubband + s]` is the dual-pol complex
    /// sample of subband `s` at time `t`.
    pub fn process_window(&mut self, samples: &[[i8; 4]], accumulate: bool) {
        debug_assert_eq!(samples.len(), self.window_len() * self.nsubband);
        for lane in 0..self.nsubband {
            for t in 0..self.nchan {
                let mut x = Complex::default();
                let mut y = Complex::default();
                for tap in 0..NUM_TAPS {
                    let k = tap * self.nchan + t;
                    let s = samples[k * self.nsubband + lane];
                    let c = self.coeff[k];
                    x.re += c * s[0] as f32;
                    x.im += c * s[1] as f32;
                    y.re += c * s[2] as f32;
                    y.im += c * s[3] as f32;
                }
                self.fft_x[t] = x;
                self.fft_y[t] = y;
            }
            fft(&mut self.fft_x);
            fft(&mut self.fft_y);
            if accumulate {
                for t in 0..self.nchan {
                    let x = self.fft_x[t];
                    let y = self.fft_y[t];
                    let acc = &mut self.accum[t * self.nsubband + lane];
                    acc[0] += x.power();
                    acc[1] += y.power();
                    acc[2] += x.re * y.re + x.im * y.im;
                    acc[3] += x.im * y.re - x.re * y.im;
                }
            }
        }
        if accumulate {
            self.acc_count += 1;
        }
    }

    /// Pull the accumulated Stokes spectrum off the context into `out` as
    /// host-order f32 `[nchan][nsubband][4]`, normalized by nothing (the
    /// accumulator stage divides by time downstream).
    pub fn accumulated_spectrum(&self, out: &mut [u8]) {
        let needed = self.accum.len() * NUM_STOKES * 4;
        assert!(out.len() >= needed);
        for (i, stokes) in self.accum.iter().enumerate() {
            for (j, &v) in stokes.iter().enumerate() {
                let offs = (i * NUM_STOKES + j) * 4;
                out[offs..offs + 4].copy_from_slice(&v.to_ne_bytes());
            }
        }
    }

    /// Bytes one accumulated spectrum occupies in an output heap.
    pub fn spectrum_size(&self) -> usize {
        self.nchan * self.nsubband * NUM_STOKES * 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fft_of_impulse_is_flat() {
        let mut buf = vec![Complex::default(); 8];
        buf[0] = Complex { re: 1.0, im: 0.0 };
        fft(&mut buf);
        for c in &buf {
            assert!((c.re - 1.0).abs() < 1e-5 && c.im.abs() < 1e-5);
        }
    }

    #[test]
    fn fft_of_tone_is_a_single_bin() {
        let n = 16;
        let k = 3;
        let mut buf: Vec<Complex> = (0..n)
            .map(|t| {
                let ang = 2.0 * std::f32::consts::PI * (k * t) as f32 / n as f32;
                Complex {
                    re: ang.cos(),
                    im: ang.sin(),
                }
            })
            .collect();
        fft(&mut buf);
        for (i, c) in buf.iter().enumerate() {
            if i == k {
                assert!((c.power() - (n * n) as f32).abs() < 0.1);
            } else {
                assert!(c.power() < 1e-3, "bin {i} has power {}", c.power());
            }
        }
    }

    #[test]
    fn coefficients_have_expected_shape() {
        let coeff = pfb_coefficients(64);
        assert_eq!(coeff.len(), NUM_TAPS * 64);
        // Peak near the center of the window, decaying toward the edges.
        let center = NUM_TAPS * 64 / 2;
        assert!(coeff[center].abs() > coeff[10].abs());
        assert!(coeff[center].abs() > coeff[NUM_TAPS * 64 - 10].abs());
    }

    fn tone_samples(ctx: &DspContext, bin: usize, amplitude: f32) -> Vec<[i8; 4]> {
        let nchan = ctx.nchan();
        (0..ctx.window_len())
            .flat_map(|t| {
                let ang = 2.0 * std::f32::consts::PI * (bin * t) as f32 / nchan as f32;
                let re = (amplitude * ang.cos()).round() as i8;
                let im = (amplitude * ang.sin()).round() as i8;
                std::iter::repeat([re, im, re, im]).take(ctx.nsubband())
            })
            .collect()
    }

    #[test]
    fn tone_concentrates_in_its_channel() {
        let mut ctx = DspContext::new(64, 1, 0, 0).unwrap();
        let bin = 5;
        ctx.process_window(&tone_samples(&ctx, bin, 100.0), true);
        assert_eq!(ctx.accumulation_count(), 1);

        let spectrum = &ctx.accum;
        let tone_power = spectrum[bin][0];
        for (i, stokes) in spectrum.iter().enumerate() {
            if i != bin && i != 0 {
                assert!(
                    stokes[0] < tone_power / 10.0,
                    "channel {i} holds {} vs tone {}",
                    stokes[0],
                    tone_power
                );
            }
        }
        // Identical polarizations: XX == YY, cross power real and positive.
        assert!((spectrum[bin][0] - spectrum[bin][1]).abs() < 1.0);
        assert!(spectrum[bin][2] > 0.0);
    }

    #[test]
    fn blanked_windows_do_not_accumulate() {
        let mut ctx = DspContext::new(32, 2, 0, 0).unwrap();
        let samples = vec![[10i8, 0, 10, 0]; ctx.window_len() * 2];
        ctx.process_window(&samples, false);
        assert_eq!(ctx.accumulation_count(), 0);
        assert!(ctx.accum.iter().all(|s| s[0] == 0.0));
        ctx.process_window(&samples, true);
        assert_eq!(ctx.accumulation_count(), 1);
        ctx.zero_accumulator();
        assert_eq!(ctx.accumulation_count(), 0);
    }

    #[test]
    fn setup_verification() {
        let ctx = DspContext::new(256, 8, 1 << 20, 1 << 20).unwrap();
        assert!(ctx.verify_setup(256, 8, 1 << 20, 1 << 20));
        assert!(!ctx.verify_setup(512, 8, 1 << 20, 1 << 20));
        assert_eq!(ctx.fft_batch(), 16);
        assert!(DspContext::new(100, 1, 0, 0).is_err());
    }
}
