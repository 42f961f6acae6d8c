//! PFB/FFT stage (low-bandwidth modes only): time-domain heaps in, blanked
//! and accumulated frequency spectra out.

use log::{debug, error, info, warn};

use crate::blanking::{BlankingMachine, INPUT_BLANKED, INPUT_BLANKED_AT_START, INPUT_SW_CHANGED};
use crate::dsp::DspContext;
use crate::error::{DaqError, Result};
use crate::obs::ObsParams;
use crate::ring::{Ring, MAX_HEAPS_PER_BLOCK};
use crate::shm::current_mjd;
use crate::spead::{self, HeapHeader, BLANKING_BIT, HEAP_HEADER_SIZE};
use crate::status::{self, StatusArea};
use crate::threads::StageCtx;

/// Input blocks compacted into one for the packed eight-subband mode.
pub const MERGE_BLOCKS: usize = 8;

/// Bytes of one packed dual-pol complex sample for all 8 subbands.
const L8_SAMPLE_SIZE: usize = 32;

#[derive(Clone, Debug)]
pub struct PfbConfig {
    pub nchan: usize,
    pub nsubband: usize,
    pub acc_len: u32,
    pub packing: bool,
}

impl PfbConfig {
    pub fn from_cards(buf: &[u8]) -> Result<PfbConfig> {
        let nchan = status::get_int(buf, "NCHAN").ok_or(DaqError::Key("NCHAN"))? as usize;
        let nsubband = status::get_int(buf, "NSUBBAND").ok_or(DaqError::Key("NSUBBAND"))? as usize;
        let acc_len = match status::get_int(buf, "ACC_LEN") {
            Some(v) => v as u32,
            None => {
                warn!("ACC_LEN not in status memory; using a computed value");
                0
            }
        };
        let modename = status::get_str(buf, status::KEY_MODENAME).unwrap_or_default();
        Ok(PfbConfig {
            nchan,
            nsubband,
            acc_len,
            packing: modename.eq_ignore_ascii_case("l8/lbw1"),
        })
    }

    /// Zero `ACC_LEN` falls back to the hardware exposure expressed in
    /// channel widths.
    pub fn resolve_acc_len(&mut self, obs: &ObsParams) {
        if self.acc_len == 0 {
            self.acc_len = (obs.chan_bw().abs() * obs.hwexposr).round() as u32;
            info!("computed ACC_LEN {}", self.acc_len);
        }
    }
}

/// One accumulated spectrum ready for the output ring.
#[derive(Clone, Debug)]
pub struct OutHeap {
    pub header: HeapHeader,
    pub payload: Vec<u8>,
}

/// The transform core: blanking machine, sample window assembly, and the
/// compute context. Ring-free so the whole path is testable with synthetic
/// heaps.
pub struct PfbEngine {
    dsp: DspContext,
    blanker: BlankingMachine,
    acc_len: u32,
    pending: Vec<[i8; 4]>,
    pos: usize,
    prev_blanked: bool,
    /// Descriptor of the first heap contributing to the open accumulation.
    first: HeapHeader,
    out_spectrum: u32,
}

impl PfbEngine {
    pub fn new(dsp: DspContext, acc_len: u32) -> PfbEngine {
        PfbEngine {
            dsp,
            blanker: BlankingMachine::new(),
            acc_len: acc_len.max(1),
            pending: Vec::new(),
            pos: 0,
            prev_blanked: false,
            first: HeapHeader::default(),
            out_spectrum: 0,
        }
    }

    pub fn spectrum_size(&self) -> usize {
        self.dsp.spectrum_size()
    }

    fn emit(&mut self) -> OutHeap {
        let mut payload = vec![0u8; self.dsp.spectrum_size()];
        self.dsp.accumulated_spectrum(&mut payload);
        let header = HeapHeader {
            spectrum_counter: self.out_spectrum,
            integ_size: self.dsp.accumulation_count(),
            payload_offset: 0,
            ..self.first
        };
        self.out_spectrum += 1;
        self.dsp.zero_accumulator();
        OutHeap { header, payload }
    }

    /// Feed one input heap; returns any spectra that completed.
    pub fn feed_heap(&mut self, hdr: &HeapHeader, valid: bool, payload: &[u8]) -> Vec<OutHeap> {
        let mut out = Vec::new();

        if !valid {
            // A hole in the sample stream: the PFB history is garbage, and
            // the window restarts after it. Treated like blanking.
            self.pending.clear();
            self.pos = 0;
            self.blanker.new_input(INPUT_BLANKED);
            self.prev_blanked = true;
            if self.blanker.needs_flush() && self.dsp.accumulation_count() > 0 {
                out.push(self.emit());
            }
            return out;
        }

        let mut summary = 0;
        if hdr.status_bits & BLANKING_BIT != 0 {
            summary |= INPUT_BLANKED;
        }
        if self.prev_blanked {
            summary |= INPUT_BLANKED_AT_START;
        }
        if self.blanker.sw_status_changed(hdr.status_bits & 0x3) {
            summary |= INPUT_SW_CHANGED;
        }
        self.blanker.new_input(summary);
        self.prev_blanked = summary & INPUT_BLANKED != 0;

        if self.blanker.needs_flush() && self.dsp.accumulation_count() > 0 {
            out.push(self.emit());
        }

        self.pending.extend(
            payload
                .chunks_exact(4)
                .map(|c| [c[0] as i8, c[1] as i8, c[2] as i8, c[3] as i8]),
        );

        let nsub = self.dsp.nsubband();
        let window = self.dsp.window_len() * nsub;
        let hop = self.dsp.nchan() * nsub;
        while self.pending.len() - self.pos >= window {
            let blank = self.blanker.blank_current_fft();
            if !blank && self.dsp.accumulation_count() == 0 {
                self.first = *hdr;
            }
            self.dsp
                .process_window(&self.pending[self.pos..self.pos + window], !blank);
            self.pos += hop;
            if self.dsp.accumulation_count() >= self.acc_len {
                out.push(self.emit());
            }
        }
        if self.pos > self.pending.len() / 2 {
            self.pending.drain(..self.pos);
            self.pos = 0;
        }
        out
    }
}

/// Compact `MERGE_BLOCKS` eight-subband input blocks into the first block as
/// single-subband heaps by extracting the subband-0 sample of every packed
/// sample group. Returns the merged heap count.
///
/// Output heap N keeps the descriptor of the last input heap that fed it
/// (heap 0 keeps its own, already in place); the compaction is in-place for
/// the first block, which is always written at or behind the read point.
pub fn merge_l8_blocks(ring: &mut Ring, blocks: &[usize]) -> usize {
    let heap_payload = {
        let index = ring.heap_index(blocks[0]);
        (index.heap_size as usize).saturating_sub(HEAP_HEADER_SIZE)
    };
    if heap_payload == 0 {
        return 0;
    }
    let samples_per_in_heap = heap_payload / L8_SAMPLE_SIZE;
    let samples_per_out_heap = heap_payload / 4;
    let payload_base = MAX_HEAPS_PER_BLOCK * HEAP_HEADER_SIZE;

    let mut out_heap = 0usize;
    let mut out_sample = 0usize;
    for (bi, &block) in blocks.iter().enumerate() {
        let num_heaps = ring.heap_index(block).num_heaps as usize;
        for heap in 0..num_heaps {
            if bi == 0 && block == blocks[0] {
                let data = ring.data_mut(blocks[0]);
                for s in 0..samples_per_in_heap {
                    let src = payload_base + heap * heap_payload + s * L8_SAMPLE_SIZE;
                    let dst = payload_base
                        + out_heap * heap_payload
                        + (out_sample + s) * 4;
                    data.copy_within(src..src + 4, dst);
                }
            } else {
                let (dst_data, src_data) = ring.data_pair_mut(blocks[0], block);
                for s in 0..samples_per_in_heap {
                    let src = payload_base + heap * heap_payload + s * L8_SAMPLE_SIZE;
                    let dst = payload_base
                        + out_heap * heap_payload
                        + (out_sample + s) * 4;
                    dst_data[dst..dst + 4].copy_from_slice(&src_data[src..src + 4]);
                }
            }
            out_sample += samples_per_in_heap;

            if out_sample == samples_per_out_heap {
                if out_heap != 0 {
                    let src_hdr_off = heap * HEAP_HEADER_SIZE;
                    let dst_hdr_off = out_heap * HEAP_HEADER_SIZE;
                    if bi == 0 && block == blocks[0] {
                        let data = ring.data_mut(blocks[0]);
                        data.copy_within(src_hdr_off..src_hdr_off + HEAP_HEADER_SIZE, dst_hdr_off);
                    } else {
                        let (dst_data, src_data) = ring.data_pair_mut(blocks[0], block);
                        dst_data[dst_hdr_off..dst_hdr_off + HEAP_HEADER_SIZE]
                            .copy_from_slice(&src_data[src_hdr_off..src_hdr_off + HEAP_HEADER_SIZE]);
                    }
                }
                out_heap += 1;
                out_sample = 0;
            }
        }
    }

    let index = ring.heap_index_mut(blocks[0]);
    index.num_heaps = out_heap as u32;
    out_heap
}

/// Lays accumulated spectra into the output ring as frequency heaps.
pub struct SpectrumSink {
    spectrum_size: usize,
    heaps_per_block: usize,
    cur_block: Option<usize>,
    next_block: usize,
    slot: usize,
}

impl SpectrumSink {
    pub fn new(ring: &Ring, spectrum_size: usize) -> Result<SpectrumSink> {
        let heaps_per_block = ring.heaps_per_block(spectrum_size);
        if heaps_per_block == 0 {
            return Err(DaqError::Param(format!(
                "output block size {} cannot hold a {spectrum_size}-byte spectrum",
                ring.block_size()
            )));
        }
        Ok(SpectrumSink {
            spectrum_size,
            heaps_per_block,
            cur_block: None,
            next_block: 0,
            slot: 0,
        })
    }

    pub fn push(
        &mut self,
        ring: &mut Ring,
        input_header: &[u8],
        heap: &OutHeap,
        wait_free: &mut dyn FnMut(&Ring, usize) -> Result<()>,
    ) -> Result<()> {
        let block = match self.cur_block {
            Some(b) => b,
            None => {
                let block = self.next_block;
                wait_free(ring, block)?;
                ring.copy_header(input_header, block);
                let index = ring.heap_index_mut(block);
                index.num_heaps = 0;
                index.heap_size = (HEAP_HEADER_SIZE + self.spectrum_size) as u32;
                self.cur_block = Some(block);
                self.slot = 0;
                block
            }
        };

        let data = ring.data_mut(block);
        spead::heap_headers_mut(data, self.heaps_per_block)[self.slot] = heap.header;
        let base = MAX_HEAPS_PER_BLOCK * HEAP_HEADER_SIZE + self.slot * self.spectrum_size;
        data[base..base + self.spectrum_size].copy_from_slice(&heap.payload);

        let index = ring.heap_index_mut(block);
        index.slots[self.slot].heap_cntr = heap.header.spectrum_counter;
        index.slots[self.slot].heap_valid = 1;
        index.slots[self.slot].heap_rcvd_mjd = current_mjd();
        index.num_heaps = self.slot as u32 + 1;

        self.slot += 1;
        if self.slot == self.heaps_per_block {
            ring.set_filled(block)?;
            self.cur_block = None;
            self.next_block = (block + 1) % ring.n_block();
        }
        Ok(())
    }

    /// Hand a partially filled block downstream (stage shutdown).
    pub fn flush_partial(&mut self, ring: &mut Ring) -> Result<()> {
        if let Some(block) = self.cur_block.take() {
            if ring.heap_index(block).num_heaps > 0 {
                ring.set_filled(block)?;
                self.next_block = (block + 1) % ring.n_block();
            }
        }
        Ok(())
    }
}

/// The PFB stage thread body.
pub fn run(ctx: &StageCtx) -> Result<()> {
    let st = StatusArea::attach(ctx.instance)?;
    let mut ring_in = Ring::attach(ctx.input_ring.expect("pfb needs an input ring"))?;
    let mut ring_out = Ring::attach(ctx.output_ring.expect("pfb needs an output ring"))?;

    let mut config = {
        let mut guard = st.lock()?;
        guard.put_str("PFBSTAT", "init");
        PfbConfig::from_cards(guard.buf())?
    };
    if config.acc_len == 0 {
        let obs = ObsParams::from_cards(st.lock()?.buf())?;
        config.resolve_acc_len(&obs);
    }
    info!(
        "pfb: {} channels x {} subbands, acc_len {}, packing {}",
        config.nchan, config.nsubband, config.acc_len, config.packing
    );

    let dsp = DspContext::new(
        config.nchan,
        config.nsubband,
        ring_in.block_size(),
        ring_out.block_size(),
    )?;
    let mut engine = PfbEngine::new(dsp, config.acc_len);
    let mut sink = SpectrumSink::new(&ring_out, engine.spectrum_size())?;
    let blocks_needed = if config.packing { MERGE_BLOCKS } else { 1 };
    if ring_in.n_block() < blocks_needed {
        return Err(DaqError::Param(format!(
            "packed mode needs {blocks_needed} input blocks, ring has {}",
            ring_in.n_block()
        )));
    }

    let mut next_in = 0usize;
    let mut saw_data = false;
    'outer: while ctx.running() {
        {
            let mut guard = st.lock()?;
            guard.put_str("PFBSTAT", "waiting");
        }

        // Gather the filled input blocks this pass needs (8 when packing).
        let mut gathered: Vec<usize> = Vec::with_capacity(blocks_needed);
        let mut candidate = next_in;
        while gathered.len() < blocks_needed {
            if !ctx.running() {
                break 'outer;
            }
            match ring_in.wait_filled(candidate) {
                Ok(()) => {
                    gathered.push(candidate);
                    candidate = (candidate + 1) % ring_in.n_block();
                }
                Err(DaqError::Timeout) => {
                    let scanstat = st.lock()?.get_str(status::KEY_SCANSTAT);
                    if saw_data && scanstat.as_deref() != Some("running") {
                        info!("scan stopped; pfb stage draining out");
                        break 'outer;
                    }
                }
                Err(err) => {
                    error!("pfb wait failed: {err}");
                    return Err(err);
                }
            }
        }
        saw_data = true;

        {
            let mut guard = st.lock()?;
            guard.put_str("PFBSTAT", "processing");
            guard.put_int("PFBBLKIN", gathered[0] as i64);
        }

        let num_heaps = if config.packing {
            merge_l8_blocks(&mut ring_in, &gathered)
        } else {
            ring_in.heap_index(gathered[0]).num_heaps as usize
        };

        let run_flag = &ctx.run;
        let mut wait_free = |ring: &Ring, block: usize| loop {
            match ring.wait_free(block) {
                Ok(()) => return Ok(()),
                Err(DaqError::Timeout) => {
                    if !run_flag.load(std::sync::atomic::Ordering::SeqCst) {
                        return Err(DaqError::Timeout);
                    }
                }
                Err(err) => return Err(err),
            }
        };

        let header_in = ring_in.header(gathered[0]).to_vec();
        {
            let block = gathered[0];
            let index = ring_in.heap_index(block);
            let heap_payload = (index.heap_size as usize).saturating_sub(HEAP_HEADER_SIZE);
            let valids: Vec<bool> = (0..num_heaps)
                .map(|slot| index.slots[slot].heap_valid != 0)
                .collect();
            let data = ring_in.data(block);
            let headers = spead::heap_headers(data, num_heaps);
            for slot in 0..num_heaps {
                let base = MAX_HEAPS_PER_BLOCK * HEAP_HEADER_SIZE + slot * heap_payload;
                let payload = &data[base..base + heap_payload];
                let spectra = engine.feed_heap(&headers[slot], valids[slot], payload);
                if spectra.is_empty() {
                    continue;
                }
                debug!("pfb emitted {} spectra from slot {slot}", spectra.len());
                for heap in &spectra {
                    sink.push(&mut ring_out, &header_in, heap, &mut wait_free)?;
                }
            }
        }

        for &block in &gathered {
            ring_in.set_free(block)?;
        }
        next_in = candidate;
    }

    sink.flush_partial(&mut ring_out)?;
    let mut guard = st.lock()?;
    guard.put_str("PFBSTAT", "exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::DspContext;
    use crate::ring::Ring;

    fn test_ring(n_block: usize, heaps: usize, payload: usize) -> Ring {
        use std::sync::atomic::{AtomicU32, Ordering};
        static NEXT: AtomicU32 = AtomicU32::new(0);
        let id =
            9_400_000 + (std::process::id() % 10_000) * 64 + NEXT.fetch_add(1, Ordering::SeqCst);
        Ring::unlink(id);
        let block_size = MAX_HEAPS_PER_BLOCK * HEAP_HEADER_SIZE + heaps * payload;
        Ring::create(id, n_block, block_size).unwrap()
    }

    fn heap_hdr(time: u64, status: u32) -> HeapHeader {
        HeapHeader {
            time_counter: time,
            status_bits: status,
            mode: 2,
            ..HeapHeader::default()
        }
    }

    #[test]
    fn engine_accumulates_and_flushes_on_acc_len() {
        let dsp = DspContext::new(16, 1, 0, 0).unwrap();
        let mut engine = PfbEngine::new(dsp, 4);
        // 512 samples of a constant tone, enough for 25 windows at hop 16.
        let payload: Vec<u8> = (0..512).flat_map(|_| [20u8, 0, 20, 0]).collect();

        let out = engine.feed_heap(&heap_hdr(1000, 0), true, &payload);
        assert_eq!(out.len(), 6, "25 windows at acc_len 4 complete 6 spectra");
        for (i, heap) in out.iter().enumerate() {
            assert_eq!(heap.header.spectrum_counter, i as u32);
            assert_eq!(heap.header.integ_size, 4);
            assert_eq!(heap.header.time_counter, 1000);
            assert_eq!(heap.payload.len(), engine.spectrum_size());
        }
        // Power must have landed somewhere.
        let floats: Vec<f32> = out[0]
            .payload
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert!(floats.iter().any(|&v| v > 0.0));
    }

    #[test]
    fn engine_flushes_partial_accumulation_on_blanking_edge() {
        let dsp = DspContext::new(16, 1, 0, 0).unwrap();
        let mut engine = PfbEngine::new(dsp, 4);
        let clean: Vec<u8> = (0..512).flat_map(|_| [10u8, 0, 10, 0]).collect();
        let out = engine.feed_heap(&heap_hdr(0, 0), true, &clean);
        assert_eq!(out.len(), 6);

        // A blanked heap raises the flush edge; the partial accumulation
        // (one window) is emitted, nothing else accumulates.
        let out = engine.feed_heap(&heap_hdr(512, BLANKING_BIT), true, &clean);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].header.integ_size, 1);

        // Still blanked from the machine's point of view until a clean heap.
        let out = engine.feed_heap(&heap_hdr(1024, BLANKING_BIT), true, &clean);
        assert!(out.is_empty());
    }

    #[test]
    fn engine_drops_history_on_invalid_heap() {
        let dsp = DspContext::new(16, 1, 0, 0).unwrap();
        let mut engine = PfbEngine::new(dsp, 100);
        let clean: Vec<u8> = (0..512).flat_map(|_| [10u8, 0, 10, 0]).collect();
        engine.feed_heap(&heap_hdr(0, 0), true, &clean);
        let before = engine.dsp.accumulation_count();
        assert!(before > 0);

        // The hole flushes what was accumulated and clears the window.
        let out = engine.feed_heap(&heap_hdr(512, 0), false, &[]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].header.integ_size, before);
        assert!(engine.pending.is_empty());
    }

    #[test]
    fn sw_state_change_flushes() {
        let dsp = DspContext::new(16, 1, 0, 0).unwrap();
        let mut engine = PfbEngine::new(dsp, 1000);
        let clean: Vec<u8> = (0..256).flat_map(|_| [10u8, 0, 10, 0]).collect();
        engine.feed_heap(&heap_hdr(0, 0x1), true, &clean);
        assert!(engine.dsp.accumulation_count() > 0);
        // Different cal/sig-ref bits: flush, then blank through the change.
        let out = engine.feed_heap(&heap_hdr(256, 0x2), true, &clean);
        assert_eq!(out.len(), 1);
        assert_eq!(engine.dsp.accumulation_count(), 0);
    }

    #[test]
    fn merge_compacts_eight_blocks_into_one() {
        // 2 heaps per block, 256-byte payloads: 8 packed samples per heap,
        // 64 single-subband samples per output heap.
        let mut ring = test_ring(MERGE_BLOCKS, 2, 256);
        for block in 0..MERGE_BLOCKS {
            let index = ring.heap_index_mut(block);
            index.num_heaps = 2;
            index.heap_size = (HEAP_HEADER_SIZE + 256) as u32;
            for slot in 0..2 {
                index.slots[slot].heap_valid = 1;
            }
            let data = ring.data_mut(block);
            for heap in 0..2usize {
                let hdr = heap_hdr((block * 2 + heap) as u64, 0);
                spead::heap_headers_mut(data, 2)[heap] = hdr;
                for s in 0..8usize {
                    let base =
                        MAX_HEAPS_PER_BLOCK * HEAP_HEADER_SIZE + heap * 256 + s * L8_SAMPLE_SIZE;
                    // Subband 0 sample tagged with its origin; the rest 0xee.
                    data[base] = (block * 2 + heap) as u8;
                    data[base + 1] = s as u8;
                    for b in 2..L8_SAMPLE_SIZE {
                        data[base + b] = 0xee;
                    }
                }
            }
        }

        let blocks: Vec<usize> = (0..MERGE_BLOCKS).collect();
        let merged = merge_l8_blocks(&mut ring, &blocks);
        assert_eq!(merged, 2);
        assert_eq!(ring.heap_index(0).num_heaps, 2);

        let data = ring.data(0);
        // 16 input heaps x 8 samples = 128 output samples, 64 per out heap.
        for out_heap in 0..2usize {
            for s in 0..64usize {
                let global = out_heap * 64 + s;
                let in_heap = global / 8;
                let in_sample = global % 8;
                let base = MAX_HEAPS_PER_BLOCK * HEAP_HEADER_SIZE + out_heap * 256 + s * 4;
                assert_eq!(data[base] as usize, in_heap, "sample {global}");
                assert_eq!(data[base + 1] as usize, in_sample);
            }
        }
        // Heap 0 keeps its own descriptor; heap 1 carries the last
        // contributing input heap's descriptor (block 7, heap 1).
        let headers = spead::heap_headers(data, 2);
        assert_eq!(headers[0].time_counter, 0);
        assert_eq!(headers[1].time_counter, 15);
        Ring::unlink(ring.ring_id());
    }

    #[test]
    fn sink_fills_blocks_and_marks_them() {
        let spectrum = 128usize;
        let mut ring = test_ring(3, 2, spectrum);
        let mut header = vec![0u8; crate::ring::BLOCK_HEADER_SIZE];
        status::clear_cards(&mut header);
        status::put_int(&mut header, "NPKT", 3);

        let mut sink = SpectrumSink::new(&ring, spectrum).unwrap();
        let mut wait = |ring: &Ring, block: usize| ring.wait_free(block);
        for i in 0..3u32 {
            let heap = OutHeap {
                header: HeapHeader {
                    spectrum_counter: i,
                    integ_size: 7,
                    ..HeapHeader::default()
                },
                payload: vec![i as u8; spectrum],
            };
            sink.push(&mut ring, &header, &heap, &mut wait).unwrap();
        }

        assert_eq!(ring.block_status(0).unwrap(), 1);
        assert_eq!(ring.block_status(1).unwrap(), 0);
        let index = ring.heap_index(0);
        assert_eq!(index.num_heaps, 2);
        assert_eq!(index.heap_size as usize, HEAP_HEADER_SIZE + spectrum);
        assert_eq!(index.slots[1].heap_valid, 1);
        assert_eq!(status::get_int(ring.header(0), "NPKT"), Some(3));

        // The third spectrum opened block 1; a partial flush hands it on.
        assert_eq!(ring.heap_index(1).num_heaps, 1);
        sink.flush_partial(&mut ring).unwrap();
        assert_eq!(ring.block_status(1).unwrap(), 1);
        Ring::unlink(ring.ring_id());
    }
}
