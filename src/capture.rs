//! UDP capture stage: pull packets at wire rate, normalize both wire
//! dialects, and lay heaps into the net ring under their recovered sequence
//! numbers.

use std::net::UdpSocket;
use std::os::unix::io::AsRawFd;

use log::{debug, error, info, warn};

use crate::error::{DaqError, Result};
use crate::obs::BandwidthMode;
use crate::ring::{Ring, MAX_HEAPS_PER_BLOCK};
use crate::shm::current_mjd;
use crate::spead::{self, Packet, HEAP_HEADER_SIZE};
use crate::status::{self, StatusArea};
use crate::threads::StageCtx;

const RECV_BUF_BYTES: libc::c_int = 128 * 1024 * 1024;
const MAX_PACKET_SIZE: usize = 16384;

/// Socket-poll timeouts tolerated after the scan stops before the stage
/// declares end of scan and drains out.
const END_OF_SCAN_IDLE_POLLS: u32 = 25;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketFormat {
    /// Native descriptor-table packets.
    Spead,
    /// Legacy 16-byte-header packets, normalized on receipt.
    Legacy,
}

#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub port: u16,
    pub sender: String,
    pub format: PacketFormat,
    pub bw_mode: BandwidthMode,
    pub expected_packet_size: usize,
}

impl CaptureConfig {
    pub fn from_cards(buf: &[u8]) -> Result<CaptureConfig> {
        let format = match status::get_str(buf, "PKTFMT").as_deref() {
            None | Some("SPEAD") => PacketFormat::Spead,
            Some(_) => PacketFormat::Legacy,
        };
        Ok(CaptureConfig {
            port: status::get_int(buf, "PORT").unwrap_or(60000) as u16,
            sender: status::get_str(buf, "SNDHOST").ok_or(DaqError::Key("SNDHOST"))?,
            format,
            bw_mode: BandwidthMode::from_cards(buf)?,
            expected_packet_size: status::get_int(buf, "PKTSIZE").unwrap_or(0) as usize,
        })
    }
}

/// Packet-placement core, separated from the socket so it can be exercised
/// with synthetic packets.
pub struct BlockAssembler {
    hbw: bool,
    /// Learned from the first accepted packet.
    geometry: Option<Geometry>,
    cur_block_seq: Option<u64>,
    npkt: u32,
    npkt_drop: u32,
    nheap_drop: u32,
    nblock: u32,
}

#[derive(Clone, Copy, Debug)]
struct Geometry {
    payload_size: usize,
    heap_payload_size: usize,
    packets_per_heap: u64,
    heaps_per_block: usize,
}

impl BlockAssembler {
    pub fn new(bw_mode: BandwidthMode) -> BlockAssembler {
        BlockAssembler {
            hbw: bw_mode == BandwidthMode::High,
            geometry: None,
            cur_block_seq: None,
            npkt: 0,
            npkt_drop: 0,
            nheap_drop: 0,
            nblock: 0,
        }
    }

    pub fn packets_seen(&self) -> u32 {
        self.npkt
    }

    pub fn packets_dropped(&self) -> u32 {
        self.npkt_drop
    }

    pub fn count_drop(&mut self) {
        self.npkt_drop += 1;
    }

    fn geometry(&mut self, ring: &Ring, pkt: &Packet) -> Result<Geometry> {
        if let Some(g) = self.geometry {
            return Ok(g);
        }
        let payload_size = pkt.payload.len();
        if payload_size == 0 {
            return Err(DaqError::Packet("empty payload"));
        }
        let heap_payload_size = (pkt.heap_size() as usize)
            .saturating_sub(HEAP_HEADER_SIZE)
            .max(payload_size);
        let packets_per_heap = (heap_payload_size / payload_size).max(1) as u64;
        let heaps_per_block = ring.heaps_per_block(heap_payload_size);
        if heaps_per_block == 0 {
            return Err(DaqError::Param(format!(
                "block size {} cannot hold a single {heap_payload_size}-byte heap",
                ring.block_size()
            )));
        }
        let g = Geometry {
            payload_size,
            heap_payload_size,
            packets_per_heap,
            heaps_per_block,
        };
        info!(
            "capture geometry: {payload_size} B payloads, {packets_per_heap} packets/heap, \
             {heaps_per_block} heaps/block"
        );
        self.geometry = Some(g);
        Ok(g)
    }

    /// Start a fresh block: free its semaphore state is the caller's concern;
    /// here the header is seeded from the status snapshot and the index
    /// cleared.
    fn open_block(&mut self, ring: &mut Ring, block: usize, status_copy: &[u8], g: Geometry) {
        ring.header_mut(block).copy_from_slice(status_copy);
        let index = ring.heap_index_mut(block);
        index.num_heaps = 0;
        index.heap_size = (HEAP_HEADER_SIZE + g.heap_payload_size) as u32;
        for slot in index.slots[..g.heaps_per_block].iter_mut() {
            *slot = Default::default();
        }
    }

    /// Close out `block`: roll the counters into its text header and mark it
    /// filled for the consumer.
    pub fn finalize(&mut self, ring: &mut Ring, block_seq: u64) -> Result<()> {
        let block = (block_seq % ring.n_block() as u64) as usize;
        self.nblock += 1;
        let npkt = self.npkt;
        let npkt_drop = self.npkt_drop;
        let nheap_drop = self.nheap_drop;
        let nblock = self.nblock;
        let header = ring.header_mut(block);
        status::put_int(header, "NBLOCK", nblock as i64);
        status::put_int(header, "NPKT", npkt as i64);
        status::put_int(header, "NPKTDROP", npkt_drop as i64);
        status::put_int(header, "NHPDROP", nheap_drop as i64);
        self.npkt = 0;
        self.npkt_drop = 0;
        self.nheap_drop = 0;
        ring.set_filled(block)
    }

    pub fn finalize_current(&mut self, ring: &mut Ring) -> Result<()> {
        if let Some(cur) = self.cur_block_seq.take() {
            self.finalize(ring, cur)?;
        }
        Ok(())
    }

    /// Place one normalized packet. `wait_free` blocks (via the caller's
    /// retry closure) when the consumer is behind.
    pub fn place(
        &mut self,
        ring: &mut Ring,
        status_copy: &[u8],
        pkt: &Packet,
        wait_free: &mut dyn FnMut(&Ring, usize) -> Result<()>,
    ) -> Result<()> {
        let g = self.geometry(ring, pkt)?;
        let seq = pkt.seq(g.packets_per_heap)?;
        let heap_seq = seq / g.packets_per_heap;
        let block_seq = heap_seq / g.heaps_per_block as u64;
        let slot = (heap_seq % g.heaps_per_block as u64) as usize;

        match self.cur_block_seq {
            Some(cur) if block_seq == cur => {}
            Some(cur) if block_seq < cur => {
                // A straggler from a block already handed downstream.
                self.npkt_drop += 1;
                return Ok(());
            }
            Some(cur) => {
                self.finalize(ring, cur)?;
                if block_seq > cur + 1 {
                    let skipped = (block_seq - cur - 1) * g.heaps_per_block as u64;
                    warn!("sequence jumped {skipped} heaps; counting them dropped");
                    self.nheap_drop += skipped as u32;
                }
                let block = (block_seq % ring.n_block() as u64) as usize;
                wait_free(ring, block)?;
                self.open_block(ring, block, status_copy, g);
                self.cur_block_seq = Some(block_seq);
            }
            None => {
                let block = (block_seq % ring.n_block() as u64) as usize;
                wait_free(ring, block)?;
                self.open_block(ring, block, status_copy, g);
                self.cur_block_seq = Some(block_seq);
            }
        }

        let block = (block_seq % ring.n_block() as u64) as usize;
        let heap_offset = pkt.heap_offset() as usize;
        if heap_offset + pkt.payload.len() > g.heap_payload_size {
            self.npkt_drop += 1;
            return Ok(());
        }

        let header = pkt.heap_header(self.hbw);
        let payload_base =
            MAX_HEAPS_PER_BLOCK * HEAP_HEADER_SIZE + slot * g.heap_payload_size + heap_offset;
        {
            let data = ring.data_mut(block);
            spead::heap_headers_mut(data, g.heaps_per_block)[slot] = header;
            let dst = &mut data[payload_base..payload_base + pkt.payload.len()];
            if self.hbw {
                // Wire int32 products are big-endian; swap on copy.
                for (out, chunk) in dst.chunks_exact_mut(4).zip(pkt.payload.chunks_exact(4)) {
                    out.copy_from_slice(&[chunk[3], chunk[2], chunk[1], chunk[0]]);
                }
            } else {
                dst.copy_from_slice(pkt.payload);
            }
        }

        let index = ring.heap_index_mut(block);
        index.slots[slot].heap_cntr = heap_seq as u32;
        index.slots[slot].heap_valid = 1;
        index.slots[slot].heap_rcvd_mjd = current_mjd();
        index.num_heaps = index.num_heaps.max(slot as u32 + 1);
        self.npkt += 1;
        Ok(())
    }
}

fn open_socket(config: &CaptureConfig) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(("0.0.0.0", config.port))
        .map_err(|e| DaqError::Sys("bind", e))?;
    socket
        .connect((config.sender.as_str(), config.port))
        .map_err(|e| DaqError::Sys("connect", e))?;
    socket.set_nonblocking(true)?;
    let rv = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &RECV_BUF_BYTES as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rv < 0 {
        warn!(
            "could not grow receive buffer: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(socket)
}

/// Poll the socket for up to a second. `Timeout` is a normal outcome.
fn wait_readable(socket: &UdpSocket) -> Result<()> {
    let mut pfd = libc::pollfd {
        fd: socket.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let rv = unsafe { libc::poll(&mut pfd, 1, 1000) };
    match rv {
        1 => Ok(()),
        0 => Err(DaqError::Timeout),
        _ => {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                debug!("poll interrupted, continuing");
                Err(DaqError::Timeout)
            } else {
                Err(DaqError::Sys("poll", err))
            }
        }
    }
}

/// The capture stage thread body.
pub fn run(ctx: &StageCtx) -> Result<()> {
    let st = StatusArea::attach(ctx.instance)?;
    let mut ring = Ring::attach(ctx.output_ring.expect("capture needs an output ring"))?;

    let (config, status_copy) = {
        let mut guard = st.lock()?;
        guard.put_str("NETSTAT", "init");
        (
            CaptureConfig::from_cards(guard.buf())?,
            guard.buf().to_vec(),
        )
    };
    info!(
        "capture: port {}, sender {}, {:?} packets",
        config.port, config.sender, config.format
    );

    let socket = open_socket(&config)?;
    let mut assembler = BlockAssembler::new(config.bw_mode);
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let mut idle_polls = 0u32;
    let mut saw_running = false;

    {
        let mut guard = st.lock()?;
        guard.put_str("NETSTAT", "waiting");
    }

    while ctx.running() {
        match wait_readable(&socket) {
            Ok(()) => {}
            Err(DaqError::Timeout) => {
                let scanstat = st.lock()?.get_str(status::KEY_SCANSTAT);
                match scanstat.as_deref() {
                    Some("running") => {
                        saw_running = true;
                        idle_polls = 0;
                    }
                    _ if saw_running && assembler.packets_seen() > 0 => {
                        idle_polls += 1;
                        if idle_polls >= END_OF_SCAN_IDLE_POLLS {
                            info!("scan stopped and the stream went quiet; draining out");
                            break;
                        }
                    }
                    _ => {}
                }
                continue;
            }
            Err(err) => {
                error!("capture poll failed: {err}");
                return Err(err);
            }
        }
        idle_polls = 0;

        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
            Err(e) => {
                error!("recv failed: {e}");
                return Err(DaqError::Sys("recv", e));
            }
        };

        if config.expected_packet_size != 0
            && config.format == PacketFormat::Legacy
            && n != config.expected_packet_size
        {
            assembler.count_drop();
            continue;
        }

        let parsed = match config.format {
            PacketFormat::Spead => Packet::parse(&buf[..n]),
            PacketFormat::Legacy => spead::parse_legacy(&buf[..n]),
        };
        let pkt = match parsed {
            Ok(pkt) => pkt,
            Err(err) => {
                debug!("dropping packet: {err}");
                assembler.count_drop();
                continue;
            }
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
        if let Err(err) = assembler.place(&mut ring, &status_copy, &pkt, &mut wait_free) {
            match err {
                DaqError::Timeout => break,
                DaqError::Packet(_) => assembler.count_drop(),
                err => return Err(err),
            }
        }
        if assembler.packets_seen() == 1 {
            let mut guard = st.lock()?;
            guard.put_str("NETSTAT", "receiving");
        }
    }

    assembler.finalize_current(&mut ring)?;
    let mut guard = st.lock()?;
    guard.put_str("NETSTAT", "exiting");
    Ok(())
}

/// Monitor-mode consumer: drain the net ring and immediately free each block.
pub fn run_null_consumer(ctx: &StageCtx) -> Result<()> {
    let st = StatusArea::attach(ctx.instance)?;
    let ring = Ring::attach(ctx.input_ring.expect("null consumer needs an input ring"))?;
    {
        let mut guard = st.lock()?;
        guard.put_str("NULSTAT", "running");
    }
    let mut block = 0;
    let mut drained = 0u64;
    while ctx.running() {
        match ring.wait_filled(block) {
            Ok(()) => {
                ring.set_free(block)?;
                block = (block + 1) % ring.n_block();
                drained += 1;
            }
            Err(DaqError::Timeout) => continue,
            Err(err) => return Err(err),
        }
    }
    info!("null consumer drained {drained} blocks");
    let mut guard = st.lock()?;
    guard.put_str("NULSTAT", "exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spead::{Item, ID_HEAP_COUNTER, ID_HEAP_OFFSET, ID_HEAP_SIZE, ID_PAYLOAD_SIZE};
    use crate::spead::{ID_SPECTRUM_COUNTER, ID_STATUS_BITS, ID_TIME_COUNTER};

    fn test_ring(n_block: usize, heaps: usize, payload: usize) -> Ring {
        use std::sync::atomic::{AtomicU32, Ordering};
        static NEXT: AtomicU32 = AtomicU32::new(0);
        let id = 9_600_000 + (std::process::id() % 10_000) * 64 + NEXT.fetch_add(1, Ordering::SeqCst);
        Ring::unlink(id);
        let block_size = MAX_HEAPS_PER_BLOCK * HEAP_HEADER_SIZE + heaps * payload;
        Ring::create(id, n_block, block_size).unwrap()
    }

    fn packet(seq: u64, payload: Vec<u8>, status: u64) -> (Vec<Item>, Vec<u8>) {
        let items = vec![
            Item::immediate(ID_HEAP_COUNTER, seq),
            Item::immediate(ID_HEAP_SIZE, (HEAP_HEADER_SIZE + payload.len()) as u64),
            Item::immediate(ID_HEAP_OFFSET, 0),
            Item::immediate(ID_PAYLOAD_SIZE, payload.len() as u64),
            Item::immediate(ID_TIME_COUNTER, seq * 0x800),
            Item::immediate(ID_SPECTRUM_COUNTER, seq),
            Item::immediate(ID_STATUS_BITS, status),
        ];
        (items, payload)
    }

    fn place(
        assembler: &mut BlockAssembler,
        ring: &mut Ring,
        status_copy: &[u8],
        items: Vec<Item>,
        payload: &[u8],
    ) -> Result<()> {
        let pkt = Packet { items, payload };
        assembler.place(ring, status_copy, &pkt, &mut |ring, block| {
            ring.wait_free(block)
        })
    }

    fn status_copy() -> Vec<u8> {
        let mut buf = vec![0u8; crate::ring::BLOCK_HEADER_SIZE];
        crate::status::clear_cards(&mut buf);
        crate::status::put_str(&mut buf, "BW_MODE", "low");
        buf
    }

    #[test]
    fn packets_fill_blocks_in_order() {
        let mut ring = test_ring(3, 4, 64);
        let snapshot = status_copy();
        let mut asm = BlockAssembler::new(BandwidthMode::Low);

        for seq in 0..8u64 {
            let (items, payload) = packet(seq, vec![seq as u8; 64], 0);
            place(&mut asm, &mut ring, &snapshot, items, &payload).unwrap();
        }
        // Heaps 0..3 went to block 0, which is now filled; 4..7 are block 1.
        assert_eq!(ring.block_status(0).unwrap(), 1);
        assert_eq!(ring.block_status(1).unwrap(), 0);

        let index = ring.heap_index(0);
        assert_eq!(index.num_heaps, 4);
        assert_eq!(index.heap_size as usize, HEAP_HEADER_SIZE + 64);
        for slot in 0..4 {
            assert_eq!(index.slots[slot].heap_valid, 1);
            assert_eq!(index.slots[slot].heap_cntr, slot as u32);
            assert!(index.slots[slot].heap_rcvd_mjd > 59000.0);
        }
        let headers = spead::heap_headers(ring.data(0), 4);
        assert_eq!(headers[2].time_counter, 2 * 0x800);
        let payload_base = MAX_HEAPS_PER_BLOCK * HEAP_HEADER_SIZE + 2 * 64;
        assert!(ring.data(0)[payload_base..payload_base + 64]
            .iter()
            .all(|&b| b == 2));

        // Counters rolled into the finalized block's header.
        assert_eq!(status::get_int(ring.header(0), "NPKT"), Some(4));
        assert_eq!(status::get_int(ring.header(0), "NBLOCK"), Some(1));
        assert_eq!(status::get_str(ring.header(0), "BW_MODE").as_deref(), Some("low"));
        Ring::unlink(ring.ring_id());
    }

    #[test]
    fn hbw_payloads_are_byte_swapped() {
        let mut ring = test_ring(2, 2, 8);
        let snapshot = status_copy();
        let mut asm = BlockAssembler::new(BandwidthMode::High);
        let (items, payload) = packet(0, vec![0x01, 0x02, 0x03, 0x04, 0x0a, 0x0b, 0x0c, 0x0d], 0);
        place(&mut asm, &mut ring, &snapshot, items, &payload).unwrap();
        asm.finalize_current(&mut ring).unwrap();
        let base = MAX_HEAPS_PER_BLOCK * HEAP_HEADER_SIZE;
        assert_eq!(
            &ring.data(0)[base..base + 8],
            &[0x04, 0x03, 0x02, 0x01, 0x0d, 0x0c, 0x0b, 0x0a]
        );
        Ring::unlink(ring.ring_id());
    }

    #[test]
    fn stragglers_count_as_drops() {
        let mut ring = test_ring(3, 2, 16);
        let snapshot = status_copy();
        let mut asm = BlockAssembler::new(BandwidthMode::Low);
        for seq in 0..3u64 {
            let (items, payload) = packet(seq, vec![0; 16], 0);
            place(&mut asm, &mut ring, &snapshot, items, &payload).unwrap();
        }
        // Heap 0 lives in block 0, which was finalized when heap 2 arrived.
        let (items, payload) = packet(0, vec![0; 16], 0);
        place(&mut asm, &mut ring, &snapshot, items, &payload).unwrap();
        assert_eq!(asm.packets_dropped(), 1);
        Ring::unlink(ring.ring_id());
    }

    #[test]
    fn sequence_jump_counts_dropped_heaps() {
        let mut ring = test_ring(4, 2, 16);
        let snapshot = status_copy();
        let mut asm = BlockAssembler::new(BandwidthMode::Low);
        let (items, payload) = packet(0, vec![0; 16], 0);
        place(&mut asm, &mut ring, &snapshot, items, &payload).unwrap();
        // Jump straight to block 3 (heap 6): blocks 1 and 2 never existed.
        let (items, payload) = packet(6, vec![0; 16], 0);
        place(&mut asm, &mut ring, &snapshot, items, &payload).unwrap();
        asm.finalize_current(&mut ring).unwrap();
        assert_eq!(status::get_int(ring.header(3), "NHPDROP"), Some(4));
        Ring::unlink(ring.ring_id());
    }
}
