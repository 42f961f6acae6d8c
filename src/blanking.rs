//! Blanking state machine for the PFB stage.
//!
//! Tracks commanded dead-time (switching transients) across FFT windows. The
//! machine starts out blanking so that nothing is accumulated until one clean
//! input has been seen after a scan start.

use crate::spead::{CAL_BIT, SIG_REF_BIT};

pub const INPUT_BLANKED: u32 = 0x1;
pub const INPUT_BLANKED_AT_START: u32 = 0x2;
pub const INPUT_SW_CHANGED: u32 = 0x4;

/// Sentinel meaning "no switching status observed yet".
const SW_STATUS_NONE: u32 = 0x8000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlankingState {
    NotBlanking,
    Blanking,
}

#[derive(Debug)]
pub struct BlankingMachine {
    cur_state: BlankingState,
    prev_state: BlankingState,
    prev_sw_status: u32,
}

impl BlankingMachine {
    pub fn new() -> BlankingMachine {
        BlankingMachine {
            cur_state: BlankingState::Blanking,
            prev_state: BlankingState::Blanking,
            prev_sw_status: SW_STATUS_NONE,
        }
    }

    pub fn state(&self) -> BlankingState {
        self.cur_state
    }

    /// Whether the FFT now being produced must be discarded.
    pub fn blank_current_fft(&self) -> bool {
        self.cur_state == BlankingState::Blanking
    }

    /// Whether the on-device accumulator must be flushed before this input is
    /// processed. True exactly on the NotBlanking -> Blanking edge.
    pub fn needs_flush(&self) -> bool {
        self.prev_state == BlankingState::NotBlanking && self.cur_state == BlankingState::Blanking
    }

    /// Track the cal/sig-ref field of incoming heaps. Returns true when it
    /// differs from the previous heap's; the first observation never counts
    /// as a change.
    pub fn sw_status_changed(&mut self, status_bits: u32) -> bool {
        let masked = status_bits & (SIG_REF_BIT | CAL_BIT);
        let changed = self.prev_sw_status != SW_STATUS_NONE && masked != self.prev_sw_status;
        self.prev_sw_status = masked;
        changed
    }

    /// Feed a 3-bit input summary:
    /// bit 0 - blanked anywhere in the window,
    /// bit 1 - blanked at the start of the window,
    /// bit 2 - switching state changed.
    pub fn new_input(&mut self, summary: u32) {
        let is_blanked = summary & INPUT_BLANKED != 0;
        let sw_changed = summary & INPUT_SW_CHANGED != 0;

        self.prev_state = self.cur_state;
        self.cur_state = match self.cur_state {
            BlankingState::NotBlanking if is_blanked || sw_changed => BlankingState::Blanking,
            BlankingState::Blanking if !is_blanked && !sw_changed => BlankingState::NotBlanking,
            state => state,
        };
    }

    pub fn reset(&mut self) {
        self.cur_state = BlankingState::Blanking;
        self.prev_state = BlankingState::Blanking;
        self.prev_sw_status = SW_STATUS_NONE;
    }
}

impl Default for BlankingMachine {
    fn default() -> Self {
        BlankingMachine::new()
    }
}
