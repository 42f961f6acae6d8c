//! Integration rows: the unit handed to the external FITS writer.
//!
//! One row per non-empty switching state per integration, packed into the
//! disk ring as `IntegrationRow` followed by the float data array. The writer
//! finds both through the block's row index (`struct_offset`/`array_offset`).

use std::mem::size_of;

use crate::obs::{ObsParams, MAX_SUBBANDS};
use crate::switching::accumid_to_sigref_cal;

pub const OBJECT_LEN: usize = 16;

/// Row metadata, fixed layout so external writers can overlay it.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct IntegrationRow {
    /// Arrival MJD of the first heap contributing to this row.
    pub time: f64,
    /// Extended FPGA counter at the first contribution.
    pub time_counter: u64,
    pub azimuth: f64,
    pub elevation: f64,
    pub ra: f64,
    pub dec: f64,
    pub bmaj: f64,
    pub bmin: f64,
    pub bpa: f64,
    pub centre_freq: [f64; MAX_SUBBANDS],
    /// -1 flags the out-of-band end-of-scan sentinel row.
    pub integ_num: i32,
    pub accumid: i32,
    pub sig_ref_state: i32,
    pub cal_state: i32,
    pub sttspec: u32,
    pub stpspec: u32,
    /// Accumulated exposure, seconds.
    pub exposure: f32,
    pub centre_freq_idx: i32,
    pub object: [u8; OBJECT_LEN],
}

pub const ROW_SIZE: usize = size_of::<IntegrationRow>();

impl Default for IntegrationRow {
    fn default() -> Self {
        IntegrationRow {
            time: 0.0,
            time_counter: 0,
            azimuth: 0.0,
            elevation: 0.0,
            ra: 0.0,
            dec: 0.0,
            bmaj: 0.0,
            bmin: 0.0,
            bpa: 0.0,
            centre_freq: [0.0; MAX_SUBBANDS],
            integ_num: 0,
            accumid: 0,
            sig_ref_state: 0,
            cal_state: 0,
            sttspec: 0,
            stpspec: 0,
            exposure: 0.0,
            centre_freq_idx: 0,
            object: [0; OBJECT_LEN],
        }
    }
}

impl IntegrationRow {
    /// Seed the scan-constant fields from the observation parameters.
    pub fn from_obs(obs: &ObsParams, accumid: i32, integ_num: i32) -> IntegrationRow {
        let (sig_ref, cal) = accumid_to_sigref_cal(accumid);
        let mut object = [0u8; OBJECT_LEN];
        let src = obs.object.as_bytes();
        let n = src.len().min(OBJECT_LEN - 1);
        object[..n].copy_from_slice(&src[..n]);
        IntegrationRow {
            azimuth: obs.azimuth,
            elevation: obs.elevation,
            ra: obs.ra,
            dec: obs.dec,
            bmaj: obs.bmaj,
            bmin: obs.bmin,
            bpa: obs.bpa,
            centre_freq: obs.sub_freq,
            integ_num,
            accumid,
            sig_ref_state: sig_ref,
            cal_state: cal,
            object,
            ..IntegrationRow::default()
        }
    }

    /// End-of-scan sentinel: a single empty row with `integ_num = -1`.
    pub fn sentinel() -> IntegrationRow {
        IntegrationRow {
            integ_num: -1,
            ..IntegrationRow::default()
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self as *const IntegrationRow as *const u8, ROW_SIZE) }
    }

    pub fn from_bytes(bytes: &[u8]) -> IntegrationRow {
        assert!(bytes.len() >= ROW_SIZE);
        unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const IntegrationRow) }
    }
}
