//! Accumulator stage: sort frequency heaps into per-switching-state vector
//! accumulators and flush completed integrations as rows into the disk ring.
//!
//! Exposure cadence comes from the switching state machine, driven by the
//! spectrum counter in high-bandwidth mode. Low-bandwidth spectra lose their
//! numbering to blanking and drops upstream, so there the cadence runs on
//! FPGA clocks via the 40-bit-extended hardware counter.

use log::{debug, error, info, warn};

use crate::error::{DaqError, Result};
use crate::obs::{BandwidthMode, ObsParams, PhaseTable, ScanLength, NUM_SW_STATES};
use crate::ring::{Ring, MAX_HEAPS_PER_BLOCK};
use crate::row::{IntegrationRow, ROW_SIZE};
use crate::spead::{
    self, HeapHeader, ADV_SIG_REF_BIT, BLANKING_BIT, CAL_SR_MASK, HEAP_HEADER_SIZE,
    SCAN_NOT_STARTED,
};
use crate::status::{self, StatusArea};
use crate::switching::SwitchingMachine;
use crate::threads::StageCtx;

/// 64-bit time coordinate recovered from the 40-bit hardware counter.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtendedClock {
    last: u64,
    upper: u64,
    multiplier: u64,
    full: u64,
}

impl ExtendedClock {
    pub fn new(multiplier: u64) -> ExtendedClock {
        ExtendedClock {
            multiplier: multiplier.max(1),
            ..ExtendedClock::default()
        }
    }

    pub fn update(&mut self, raw: u64) {
        if self.last > raw {
            self.upper += 1 << 40;
        }
        self.last = raw;
        self.full = (self.upper + raw) * self.multiplier;
    }

    pub fn full(&self) -> u64 {
        self.full
    }

    pub fn rollovers(&self) -> u64 {
        self.upper >> 40
    }
}

/// One flushed row: metadata plus its data array.
#[derive(Clone, Debug)]
pub struct Row {
    pub meta: IntegrationRow,
    pub data: Vec<f32>,
}

#[derive(Debug, Default)]
pub struct FeedResult {
    /// Rows of a completed integration, in accumid order. Empty when no
    /// exposure boundary was crossed (or nothing had accumulated).
    pub rows: Vec<Row>,
    pub end_of_scan: bool,
}

/// The pure accumulation core, independent of rings and sockets.
pub struct Integrator {
    hbw: bool,
    obs: ObsParams,
    pfb_rate: f64,
    ssm: SwitchingMachine,
    clock: ExtendedClock,
    scanlen: Option<ScanLength>,
    xor_mask: u32,
    accum_len: usize,
    planes: Vec<f32>,
    dirty: [bool; NUM_SW_STATES],
    rows: [IntegrationRow; NUM_SW_STATES],
    integ_num: i32,
    end_of_scan: bool,
}

impl Integrator {
    pub fn new(
        bw_mode: BandwidthMode,
        obs: ObsParams,
        phases: &PhaseTable,
        scanlen: Option<ScanLength>,
        xor_mask: u32,
        clocks_per_exposure: Option<u64>,
        clock_multiplier: u64,
    ) -> Result<Integrator> {
        let hbw = bw_mode == BandwidthMode::High;
        let spectra_per_exposure = (obs.exposure / obs.hwexposr + 1e-3) as i64;
        let counts_per_exposure = if hbw {
            if spectra_per_exposure < 1 {
                return Err(DaqError::Param(
                    "exposure/hwexposr yields no spectra per integration".into(),
                ));
            }
            spectra_per_exposure
        } else {
            let clocks = clocks_per_exposure.ok_or(DaqError::Key("EXPOCLKS"))? as i64;
            if clocks < 1000 {
                return Err(DaqError::Param(format!(
                    "EXPOCLKS {clocks} is implausibly small"
                )));
            }
            clocks
        };

        let ssm = if phases.nphases() < 2 {
            SwitchingMachine::by_counts(counts_per_exposure)
        } else {
            SwitchingMachine::new(
                &phases.sig_ref,
                &phases.cal,
                phases.periods_per_exposure,
                counts_per_exposure,
            )
        };

        let accum_len = obs.accum_len();
        let pfb_rate = obs.pfb_rate();
        Ok(Integrator {
            hbw,
            obs,
            pfb_rate,
            ssm,
            clock: ExtendedClock::new(clock_multiplier),
            scanlen,
            xor_mask,
            accum_len,
            planes: vec![0.0; NUM_SW_STATES * accum_len],
            dirty: [false; NUM_SW_STATES],
            rows: [IntegrationRow::default(); NUM_SW_STATES],
            integ_num: 0,
            end_of_scan: false,
        })
    }

    pub fn array_size(&self) -> usize {
        self.accum_len * 4
    }

    pub fn clock(&self) -> &ExtendedClock {
        &self.clock
    }

    pub fn integ_num(&self) -> i32 {
        self.integ_num
    }

    /// Sky position drifts during a scan; the capture stage snapshots it into
    /// each block header and we pick it up at block boundaries.
    pub fn refresh_pointing(&mut self, header: &[u8]) {
        if let Some(az) = status::get_f64(header, "AZ") {
            self.obs.azimuth = az;
        }
        if let Some(el) = status::get_f64(header, "EL") {
            self.obs.elevation = el;
        }
        if let Some(ra) = status::get_f64(header, "RA") {
            self.obs.ra = ra;
        }
        if let Some(dec) = status::get_f64(header, "DEC") {
            self.obs.dec = dec;
        }
    }

    /// Feed one valid heap. Flushes happen before the heap is accumulated,
    /// so a heap that crosses an exposure boundary opens the next
    /// integration; the heap that ends the scan is not accumulated at all.
    pub fn feed(&mut self, hdr: &HeapHeader, rcvd_mjd: f64, payload: &[u8]) -> FeedResult {
        if hdr.status_bits & SCAN_NOT_STARTED != 0 {
            debug!(
                "heap before scan start: counter {:#x} status {:#x}",
                hdr.time_counter, hdr.status_bits
            );
            return FeedResult::default();
        }

        // Polarity inversion, then reduce to the bits the pipeline sorts on.
        let bits = (hdr.status_bits ^ self.xor_mask) & (CAL_SR_MASK | BLANKING_BIT);
        let accumid = ((bits & 0x3) ^ 0x3) | (bits & ADV_SIG_REF_BIT);

        self.clock.update(hdr.time_counter);
        if let Some(scanlen) = self.scanlen {
            if scanlen.reached(self.clock.full()) && !self.end_of_scan {
                info!(
                    "scan length reached at clock {} ({} integrations)",
                    self.clock.full(),
                    self.integ_num
                );
                self.end_of_scan = true;
            }
        }

        let counter = if self.hbw {
            hdr.spectrum_counter as i64
        } else {
            self.clock.full() as i64
        };
        let exposure_complete = self.ssm.new_input(accumid as i32, counter);

        let mut result = FeedResult::default();
        if exposure_complete || self.end_of_scan {
            result.rows = self.drain_rows();
            self.integ_num += 1;
        }
        if self.end_of_scan {
            result.end_of_scan = true;
            return result;
        }

        if bits & BLANKING_BIT == 0 {
            self.accumulate(accumid as usize, hdr, rcvd_mjd, payload);
        }
        self.rows[accumid as usize].stpspec = hdr.spectrum_counter;
        result
    }

    fn accumulate(&mut self, accumid: usize, hdr: &HeapHeader, rcvd_mjd: f64, payload: &[u8]) {
        if !self.dirty[accumid] {
            let mut row = IntegrationRow::from_obs(&self.obs, accumid as i32, self.integ_num);
            row.time = rcvd_mjd;
            row.time_counter = self.clock.full();
            row.sttspec = hdr.spectrum_counter;
            self.rows[accumid] = row;
            self.dirty[accumid] = true;
        }

        self.rows[accumid].exposure += (hdr.integ_size as f64 / self.pfb_rate) as f32;

        let n = self.accum_len.min(payload.len() / 4);
        if n < self.accum_len {
            warn!(
                "heap payload holds {n} values, accumulator expects {}",
                self.accum_len
            );
        }
        let plane = &mut self.planes[accumid * self.accum_len..(accumid + 1) * self.accum_len];
        if self.hbw {
            for (i, chunk) in payload.chunks_exact(4).take(n).enumerate() {
                plane[i] += i32::from_ne_bytes(chunk.try_into().unwrap()) as f32;
            }
        } else {
            for (i, chunk) in payload.chunks_exact(4).take(n).enumerate() {
                plane[i] += f32::from_ne_bytes(chunk.try_into().unwrap());
            }
        }
    }

    fn drain_rows(&mut self) -> Vec<Row> {
        let mut rows = Vec::new();
        for accumid in 0..NUM_SW_STATES {
            if !self.dirty[accumid] {
                continue;
            }
            let plane = &mut self.planes[accumid * self.accum_len..(accumid + 1) * self.accum_len];
            rows.push(Row {
                meta: self.rows[accumid],
                data: plane.to_vec(),
            });
            plane.fill(0.0);
            self.rows[accumid] = IntegrationRow::default();
            self.dirty[accumid] = false;
        }
        rows
    }
}

fn f32s_as_bytes(data: &[f32]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, data.len() * 4) }
}

/// Packs rows into disk-ring blocks, rolling packet counters into each
/// block's header as it is closed out.
pub struct RowWriter {
    array_size: usize,
    cur_block: Option<usize>,
    next_block: usize,
    nblock_int: u32,
    npacket: u32,
    n_pkt_drop: u32,
    n_heap_drop: u32,
}

impl RowWriter {
    pub fn new(array_size: usize) -> RowWriter {
        RowWriter {
            array_size,
            cur_block: None,
            next_block: 0,
            nblock_int: 0,
            npacket: 0,
            n_pkt_drop: 0,
            n_heap_drop: 0,
        }
    }

    /// Roll the capture counters from a consumed input block's header.
    pub fn add_input_block_stats(&mut self, header: &[u8]) {
        self.nblock_int += 1;
        self.npacket += status::get_int(header, "NPKT").unwrap_or(0) as u32;
        self.n_pkt_drop += status::get_int(header, "NPKTDROP").unwrap_or(0) as u32;
        self.n_heap_drop += status::get_int(header, "NHPDROP").unwrap_or(0) as u32;
    }

    pub fn count_heap_drop(&mut self) {
        self.n_heap_drop += 1;
    }

    fn open_block(
        &mut self,
        ring: &mut Ring,
        input_header: &[u8],
        wait_free: &mut dyn FnMut(&Ring, usize) -> Result<()>,
    ) -> Result<usize> {
        let block = self.next_block;
        wait_free(ring, block)?;
        ring.copy_header(input_header, block);
        let index = ring.row_index_mut(block);
        index.num_datasets = 0;
        index.array_size = self.array_size as u32;
        self.cur_block = Some(block);
        self.next_block = (block + 1) % ring.n_block();
        Ok(block)
    }

    fn close_block(&mut self, ring: &mut Ring, block: usize) -> Result<()> {
        let nblock_int = self.nblock_int;
        let npacket = self.npacket;
        let n_pkt_drop = self.n_pkt_drop;
        let n_heap_drop = self.n_heap_drop;
        let header = ring.header_mut(block);
        status::put_int(header, "NBLOCK", nblock_int as i64);
        status::put_int(header, "NPKT", npacket as i64);
        status::put_int(header, "NPKTDROP", n_pkt_drop as i64);
        status::put_int(header, "NHPDROP", n_heap_drop as i64);
        self.nblock_int = 0;
        self.npacket = 0;
        self.n_pkt_drop = 0;
        self.n_heap_drop = 0;
        self.cur_block = None;
        ring.set_filled(block)
    }

    /// Append the rows of one completed integration, closing blocks as they
    /// fill.
    pub fn write_rows(
        &mut self,
        ring: &mut Ring,
        input_header: &[u8],
        rows: &[Row],
        wait_free: &mut dyn FnMut(&Ring, usize) -> Result<()>,
    ) -> Result<()> {
        for row in rows {
            let mut block = match self.cur_block {
                Some(b) => b,
                None => self.open_block(ring, input_header, wait_free)?,
            };

            let row_bytes = ROW_SIZE + self.array_size;
            let mut struct_offset = {
                let index = ring.row_index(block);
                match index.num_datasets as usize {
                    0 => 0,
                    n => index.slots[n - 1].array_offset as usize + self.array_size,
                }
            };
            if struct_offset + row_bytes > ring.block_size() {
                self.close_block(ring, block)?;
                block = self.open_block(ring, input_header, wait_free)?;
                struct_offset = 0;
            }
            let array_offset = struct_offset + ROW_SIZE;

            let data = ring.data_mut(block);
            data[struct_offset..array_offset].copy_from_slice(row.meta.as_bytes());
            data[array_offset..array_offset + self.array_size]
                .copy_from_slice(f32s_as_bytes(&row.data));

            let index = ring.row_index_mut(block);
            let n = index.num_datasets as usize;
            index.slots[n].struct_offset = struct_offset as u32;
            index.slots[n].array_offset = array_offset as u32;
            index.num_datasets = n as u32 + 1;
        }
        Ok(())
    }

    /// Close whatever is pending and emit the out-of-band end-of-scan marker:
    /// a block holding a single row with `integ_num = -1`.
    pub fn write_sentinel(
        &mut self,
        ring: &mut Ring,
        input_header: &[u8],
        wait_free: &mut dyn FnMut(&Ring, usize) -> Result<()>,
    ) -> Result<()> {
        if let Some(block) = self.cur_block {
            self.close_block(ring, block)?;
        }
        let block = self.open_block(ring, input_header, wait_free)?;
        let sentinel = IntegrationRow::sentinel();
        ring.data_mut(block)[..ROW_SIZE].copy_from_slice(sentinel.as_bytes());
        let index = ring.row_index_mut(block);
        index.num_datasets = 1;
        index.slots[0].struct_offset = 0;
        index.slots[0].array_offset = 0;
        self.cur_block = Some(block);
        self.close_block(ring, block)
    }

    /// Hand the partial block downstream on an external stop.
    pub fn flush_partial(&mut self, ring: &mut Ring) -> Result<()> {
        if let Some(block) = self.cur_block {
            if ring.row_index(block).num_datasets > 0 {
                return self.close_block(ring, block);
            }
            self.cur_block = None;
        }
        Ok(())
    }
}

fn build_integrator(st: &StatusArea) -> Result<Integrator> {
    let guard = st.lock()?;
    let buf = guard.buf();
    let bw_mode = BandwidthMode::from_cards(buf)?;
    let obs = ObsParams::from_cards(buf)?;
    let phases = PhaseTable::from_cards(buf);
    let scanlen = ScanLength::from_cards(buf);
    let xor_mask = status::get_int(buf, "_SWSGPLY").unwrap_or(0) as u32;
    let modename = status::get_str(buf, status::KEY_MODENAME).unwrap_or_default();
    let clock_multiplier = if modename.to_ascii_lowercase().starts_with("l8/lbw1") {
        8
    } else {
        1
    };
    let clocks_per_exposure = if bw_mode == BandwidthMode::Low {
        Some(status::get_u64(buf, "EXPOCLKS").ok_or(DaqError::Key("EXPOCLKS"))?)
    } else {
        None
    };
    if scanlen.is_none() {
        info!("no usable SCANLEN; scan ends only on external stop");
    }
    Integrator::new(
        bw_mode,
        obs,
        &phases,
        scanlen,
        xor_mask,
        clocks_per_exposure,
        clock_multiplier,
    )
}

/// The accumulator stage thread body.
pub fn run(ctx: &StageCtx) -> Result<()> {
    let st = StatusArea::attach(ctx.instance)?;
    let ring_in = Ring::attach(ctx.input_ring.expect("accumulator needs an input ring"))?;
    let mut ring_out = Ring::attach(ctx.output_ring.expect("accumulator needs an output ring"))?;

    {
        let mut guard = st.lock()?;
        guard.put_str("ACCSTAT", "init");
    }
    let mut integrator = build_integrator(&st)?;
    let mut writer = RowWriter::new(integrator.array_size());

    let mut block_in = 0;
    while ctx.running() {
        {
            let mut guard = st.lock()?;
            guard.put_str("ACCSTAT", "waiting");
        }
        match ring_in.wait_filled(block_in) {
            Ok(()) => {}
            Err(DaqError::Timeout) => continue,
            Err(err) => {
                error!("accumulator wait failed: {err}");
                return Err(err);
            }
        }
        {
            let mut guard = st.lock()?;
            guard.put_str("ACCSTAT", "accumulating");
            guard.put_int("ACCBLKIN", block_in as i64);
        }

        let run_flag = &ctx.run;
        let mut wait_free = |ring: &Ring, block: usize| loop {
            match ring.wait_free(block) {
                Ok(()) => return Ok(()),
                Err(DaqError::Timeout) => {
                    if !run_flag.load(std::sync::atomic::Ordering::SeqCst) {
                        return Err(DaqError::Timeout);
                    }
                    warn!("timeout waiting for a free disk block");
                }
                Err(err) => return Err(err),
            }
        };

        let header_in = ring_in.header(block_in).to_vec();
        integrator.refresh_pointing(&header_in);
        writer.add_input_block_stats(&header_in);

        let index = ring_in.heap_index(block_in);
        let num_heaps = (index.num_heaps as usize).min(MAX_HEAPS_PER_BLOCK);
        let heap_payload = (index.heap_size as usize).saturating_sub(HEAP_HEADER_SIZE);
        let data = ring_in.data(block_in);
        let headers = spead::heap_headers(data, num_heaps);

        let mut finished = false;
        for slot in 0..num_heaps {
            if index.slots[slot].heap_valid == 0 {
                writer.count_heap_drop();
                continue;
            }
            if ctx.debug_heaps {
                debug!(
                    "heap {slot}: counter {:#x} spectrum {} status {:#x}",
                    headers[slot].time_counter,
                    headers[slot].spectrum_counter,
                    headers[slot].status_bits
                );
            }
            let payload_base = MAX_HEAPS_PER_BLOCK * HEAP_HEADER_SIZE + slot * heap_payload;
            let payload = &data[payload_base..payload_base + heap_payload];
            let result = integrator.feed(
                &headers[slot],
                index.slots[slot].heap_rcvd_mjd,
                payload,
            );
            if !result.rows.is_empty() {
                {
                    let mut guard = st.lock()?;
                    guard.put_int("ACCBLKOU", writer.next_block as i64);
                }
                writer.write_rows(&mut ring_out, &header_in, &result.rows, &mut wait_free)?;
            }
            if result.end_of_scan {
                info!("accumulator detected end of scan");
                writer.write_sentinel(&mut ring_out, &header_in, &mut wait_free)?;
                finished = true;
                break;
            }
        }

        ring_in.set_free(block_in)?;
        block_in = (block_in + 1) % ring_in.n_block();
        if finished {
            break;
        }
    }

    writer.flush_partial(&mut ring_out)?;
    let mut guard = st.lock()?;
    guard.put_str("ACCSTAT", "exiting");
    Ok(())
}
