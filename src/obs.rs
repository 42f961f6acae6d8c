//! Observation parameters read from status cards.
//!
//! The manager writes the scan configuration into the status area; the
//! capture stage copies those cards into every block header, so downstream
//! stages read their configuration from whichever card buffer is at hand.

use log::warn;

use crate::error::{DaqError, Result};
use crate::status;
use crate::switching::MAX_PHASES;

pub const NUM_STOKES: usize = 4;
pub const NUM_SW_STATES: usize = 8;
pub const MAX_SUBBANDS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BandwidthMode {
    High,
    Low,
}

impl BandwidthMode {
    pub fn from_cards(buf: &[u8]) -> Result<BandwidthMode> {
        match status::get_str(buf, "BW_MODE").as_deref() {
            Some(s) if s.starts_with("high") => Ok(BandwidthMode::High),
            Some(s) if s.starts_with("low") => Ok(BandwidthMode::Low),
            Some(_) => Err(DaqError::Param("unsupported BW_MODE".into())),
            None => Err(DaqError::Key("BW_MODE")),
        }
    }
}

/// Everything the accumulator needs to size its planes and fill row metadata.
#[derive(Clone, Debug)]
pub struct ObsParams {
    pub nchan: usize,
    pub nsubband: usize,
    pub object: String,
    pub azimuth: f64,
    pub elevation: f64,
    pub ra: f64,
    pub dec: f64,
    pub bmaj: f64,
    pub bmin: f64,
    pub bpa: f64,
    /// Requested exposure per integration, seconds.
    pub exposure: f64,
    /// Hardware exposure per spectrum, seconds.
    pub hwexposr: f64,
    /// Effective sampler frequency, Hz.
    pub efsampfr: f64,
    pub sub_freq: [f64; MAX_SUBBANDS],
}

impl ObsParams {
    pub fn from_cards(buf: &[u8]) -> Result<ObsParams> {
        let nchan = status::get_int(buf, "NCHAN").ok_or(DaqError::Key("NCHAN"))? as usize;
        let nsubband = status::get_int(buf, "NSUBBAND").ok_or(DaqError::Key("NSUBBAND"))? as usize;
        if nchan == 0 || nsubband == 0 || nsubband > MAX_SUBBANDS {
            return Err(DaqError::Param(format!(
                "bad pipeline sizing: nchan={nchan} nsubband={nsubband}"
            )));
        }
        let mut sub_freq = [0.0; MAX_SUBBANDS];
        for (i, freq) in sub_freq.iter_mut().enumerate() {
            *freq = status::get_f64(buf, &format!("SUB{i}FREQ")).unwrap_or(0.0);
        }
        Ok(ObsParams {
            nchan,
            nsubband,
            object: status::get_str(buf, "OBJECT").unwrap_or_default(),
            azimuth: status::get_f64(buf, "AZ").unwrap_or(0.0),
            elevation: status::get_f64(buf, "EL").unwrap_or(0.0),
            ra: status::get_f64(buf, "RA").unwrap_or(0.0),
            dec: status::get_f64(buf, "DEC").unwrap_or(0.0),
            bmaj: status::get_f64(buf, "BMAJ").unwrap_or(0.0),
            bmin: status::get_f64(buf, "BMIN").unwrap_or(0.0),
            bpa: status::get_f64(buf, "BPA").unwrap_or(0.0),
            exposure: status::get_f64(buf, "EXPOSURE").unwrap_or(1.0),
            hwexposr: status::get_f64(buf, "HWEXPOSR").unwrap_or(0.0),
            efsampfr: status::get_f64(buf, "EFSAMPFR").unwrap_or(0.0),
            sub_freq,
        })
    }

    /// Post-filter-bank spectrum rate in spectra per second.
    pub fn pfb_rate(&self) -> f64 {
        self.efsampfr.abs() / (2.0 * self.nchan as f64)
    }

    /// Channel width in Hz.
    pub fn chan_bw(&self) -> f64 {
        self.efsampfr / (2.0 * self.nchan as f64)
    }

    /// Floats per switching-state accumulator plane.
    pub fn accum_len(&self) -> usize {
        self.nchan * self.nsubband * NUM_STOKES
    }
}

/// Scan-length configuration: absent or zero `SCANLEN` means the scan only
/// ends on an external STOP.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScanLength {
    pub seconds: f64,
    pub fpga_freq: f64,
}

impl ScanLength {
    pub fn from_cards(buf: &[u8]) -> Option<ScanLength> {
        let seconds = status::get_f64(buf, "SCANLEN").unwrap_or(0.0);
        let fpga_freq = status::get_f64(buf, "FPGACLK").unwrap_or(0.0);
        if seconds > 0.0 && fpga_freq > 0.0 {
            Some(ScanLength { seconds, fpga_freq })
        } else {
            None
        }
    }

    pub fn reached(&self, extended_clock: u64) -> bool {
        extended_clock as f64 / self.fpga_freq > self.seconds
    }
}

/// Phase table built from `_SNPH` / `_SSRF_nn` / `_SCAL_nn` / `SWPERINT`.
#[derive(Clone, Debug)]
pub struct PhaseTable {
    pub sig_ref: Vec<i32>,
    pub cal: Vec<i32>,
    pub periods_per_exposure: i32,
}

impl PhaseTable {
    /// Missing or incomplete keys degrade to a single phase with a warning;
    /// the accumulator then runs count-based exposures.
    pub fn from_cards(buf: &[u8]) -> PhaseTable {
        let fallback = PhaseTable {
            sig_ref: vec![0],
            cal: vec![0],
            periods_per_exposure: 1,
        };
        let Some(nphases) = status::get_int(buf, "_SNPH") else {
            warn!("_SNPH not found; falling back to count-based exposures");
            return fallback;
        };
        let nphases = nphases.clamp(1, MAX_PHASES as i64) as usize;
        let mut sig_ref = Vec::with_capacity(nphases);
        let mut cal = Vec::with_capacity(nphases);
        for i in 1..=nphases {
            let Some(sr) = status::get_int(buf, &format!("_SSRF_{i:02}")) else {
                warn!("_SSRF_{i:02} not found; phase table incomplete");
                return fallback;
            };
            let Some(cl) = status::get_int(buf, &format!("_SCAL_{i:02}")) else {
                warn!("_SCAL_{i:02} not found; phase table incomplete");
                return fallback;
            };
            sig_ref.push(sr as i32);
            cal.push(cl as i32);
        }
        let periods = status::get_int(buf, "SWPERINT").unwrap_or_else(|| {
            warn!("SWPERINT not found, using 1");
            1
        });
        PhaseTable {
            sig_ref,
            cal,
            periods_per_exposure: periods.max(1) as i32,
        }
    }

    pub fn nphases(&self) -> usize {
        self.sig_ref.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{clear_cards, put_f64, put_int, put_str};

    fn cards() -> Vec<u8> {
        let mut buf = vec![0u8; 80 * 64];
        clear_cards(&mut buf);
        buf
    }

    #[test]
    fn obs_params_and_rates() {
        let mut buf = cards();
        put_str(&mut buf, "BW_MODE", "high");
        put_int(&mut buf, "NCHAN", 1024);
        put_int(&mut buf, "NSUBBAND", 2);
        put_str(&mut buf, "OBJECT", "CasA");
        put_f64(&mut buf, "EFSAMPFR", 3.0e9);
        put_f64(&mut buf, "EXPOSURE", 1.0);
        put_f64(&mut buf, "HWEXPOSR", 0.0005);

        assert_eq!(BandwidthMode::from_cards(&buf).unwrap(), BandwidthMode::High);
        let p = ObsParams::from_cards(&buf).unwrap();
        assert_eq!(p.nchan, 1024);
        assert_eq!(p.object, "CasA");
        assert!((p.pfb_rate() - 3.0e9 / 2048.0).abs() < 1e-6);
        assert_eq!(p.accum_len(), 1024 * 2 * 4);
    }

    #[test]
    fn missing_sizing_keys_are_errors() {
        let buf = cards();
        assert!(ObsParams::from_cards(&buf).is_err());
        assert!(BandwidthMode::from_cards(&buf).is_err());
    }

    #[test]
    fn phase_table_roundtrip() {
        let mut buf = cards();
        put_int(&mut buf, "_SNPH", 4);
        for (i, (sr, cal)) in [(1, 0), (1, 1), (0, 0), (0, 1)].iter().enumerate() {
            put_int(&mut buf, &format!("_SSRF_{:02}", i + 1), *sr);
            put_int(&mut buf, &format!("_SCAL_{:02}", i + 1), *cal);
        }
        put_int(&mut buf, "SWPERINT", 2);
        let table = PhaseTable::from_cards(&buf);
        assert_eq!(table.nphases(), 4);
        assert_eq!(table.sig_ref, vec![1, 1, 0, 0]);
        assert_eq!(table.cal, vec![0, 1, 0, 1]);
        assert_eq!(table.periods_per_exposure, 2);
    }

    #[test]
    fn incomplete_phase_table_falls_back() {
        let mut buf = cards();
        put_int(&mut buf, "_SNPH", 4);
        put_int(&mut buf, "_SSRF_01", 1);
        // _SCAL_01 missing.
        let table = PhaseTable::from_cards(&buf);
        assert_eq!(table.nphases(), 1);
        assert_eq!(table.periods_per_exposure, 1);
    }

    #[test]
    fn scan_length_requires_both_keys() {
        let mut buf = cards();
        assert!(ScanLength::from_cards(&buf).is_none());
        put_f64(&mut buf, "SCANLEN", 0.5);
        assert!(ScanLength::from_cards(&buf).is_none());
        put_f64(&mut buf, "FPGACLK", 1.0e9);
        let sl = ScanLength::from_cards(&buf).unwrap();
        assert!(!sl.reached(4_0000_0000));
        assert!(sl.reached(6_0000_0000));
    }
}
