//! Descriptor-table ("SPEAD") wire format.
//!
//! Packets arrive in two dialects: the native form, an 8-byte header plus a
//! table of big-endian 64-bit item pointers, and a legacy form with a bare
//! 16-byte header in front of 8 KiB of samples. Both are normalized here into
//! host-order item tables and a fixed [`HeapHeader`] that the rest of the
//! pipeline works with; nothing downstream of the capture stage ever sees
//! wire byte order.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{DaqError, Result};

pub const MAGIC: [u8; 4] = [0x53, 0x04, 0x03, 0x05];
pub const HEADER_SIZE: usize = 8;
pub const ITEM_SIZE: usize = 8;
/// Anything claiming more items than this is garbage, not a heap.
pub const MAX_ITEMS: usize = 10;

pub const VALUE_MASK: u64 = (1 << 40) - 1;

// Item identifiers.
pub const ID_HEAP_COUNTER: u32 = 0x01;
pub const ID_HEAP_SIZE: u32 = 0x02;
pub const ID_HEAP_OFFSET: u32 = 0x03;
pub const ID_PAYLOAD_SIZE: u32 = 0x04;
pub const ID_TIME_COUNTER: u32 = 0x20;
pub const ID_SPECTRUM_COUNTER: u32 = 0x21;
pub const ID_INTEG_SIZE: u32 = 0x22;
pub const ID_MODE: u32 = 0x23;
pub const ID_STATUS_BITS: u32 = 0x24;
pub const ID_PAYLOAD_DATA_OFFSET: u32 = 0x25;

// Switching-signal status bits.
pub const SIG_REF_BIT: u32 = 0x1;
pub const CAL_BIT: u32 = 0x2;
pub const ADV_SIG_REF_BIT: u32 = 0x4;
pub const BLANKING_BIT: u32 = 0x8;
pub const SCAN_NOT_STARTED: u32 = 0x10;
pub const CAL_SR_MASK: u32 = SIG_REF_BIT | CAL_BIT | ADV_SIG_REF_BIT;

/// Legacy packets: 8-byte header, 8-byte duplicate header, 8192-byte payload.
pub const LEGACY_PACKET_SIZE: usize = 8208;
pub const LEGACY_PAYLOAD_SIZE: usize = 8192;
const LEGACY_COUNTER_MASK: u64 = (1 << 48) - 1;

/// One descriptor-table entry in host order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Item {
    /// Immediate (1) vs relative (0) addressing.
    pub immediate: bool,
    /// 23-bit identifier.
    pub id: u32,
    /// 40-bit value.
    pub value: u64,
}

impl Item {
    pub fn immediate(id: u32, value: u64) -> Item {
        Item {
            immediate: true,
            id,
            value: value & VALUE_MASK,
        }
    }

    pub fn from_wire(word: u64) -> Item {
        Item {
            immediate: word >> 63 != 0,
            id: ((word >> 40) & 0x7f_ffff) as u32,
            value: word & VALUE_MASK,
        }
    }

    pub fn to_wire(self) -> u64 {
        ((self.immediate as u64) << 63) | ((self.id as u64) << 40) | (self.value & VALUE_MASK)
    }
}

/// A parsed packet: host-order item table plus a borrowed payload.
#[derive(Debug)]
pub struct Packet<'a> {
    pub items: Vec<Item>,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Parse and validate a native-dialect datagram.
    pub fn parse(data: &'a [u8]) -> Result<Packet<'a>> {
        if data.len() < HEADER_SIZE + 3 * ITEM_SIZE {
            return Err(DaqError::Packet("short packet"));
        }
        if data[..4] != MAGIC {
            return Err(DaqError::Packet("missing magic"));
        }
        let num_items = BigEndian::read_u16(&data[6..8]) as usize;
        if num_items > MAX_ITEMS {
            return Err(DaqError::Packet("implausible item count"));
        }
        let table_end = HEADER_SIZE + num_items * ITEM_SIZE;
        if data.len() < table_end {
            return Err(DaqError::Packet("truncated item table"));
        }
        let items = (0..num_items)
            .map(|i| {
                let offs = HEADER_SIZE + i * ITEM_SIZE;
                Item::from_wire(BigEndian::read_u64(&data[offs..offs + ITEM_SIZE]))
            })
            .collect::<Vec<_>>();
        let packet = Packet {
            items,
            payload: &data[table_end..],
        };
        // The declared payload size must match what actually arrived.
        if let Some(declared) = packet.item(ID_PAYLOAD_SIZE) {
            if declared as usize != packet.payload.len() {
                return Err(DaqError::Packet("payload size mismatch"));
            }
        }
        Ok(packet)
    }

    pub fn item(&self, id: u32) -> Option<u64> {
        self.items.iter().find(|it| it.id == id).map(|it| it.value)
    }

    pub fn heap_cntr(&self) -> Result<u64> {
        self.item(ID_HEAP_COUNTER)
            .ok_or(DaqError::Packet("no heap counter"))
    }

    pub fn heap_size(&self) -> u64 {
        self.item(ID_HEAP_SIZE).unwrap_or(0)
    }

    pub fn heap_offset(&self) -> u64 {
        self.item(ID_HEAP_OFFSET).unwrap_or(0)
    }

    /// Packet sequence number across the whole stream.
    pub fn seq(&self, packets_per_heap: u64) -> Result<u64> {
        let payload = self.payload.len() as u64;
        if payload == 0 {
            return Err(DaqError::Packet("empty payload"));
        }
        Ok(self.heap_cntr()? * packets_per_heap + self.heap_offset() / payload)
    }

    /// Extract the heap descriptor fields by identifier.
    ///
    /// In high-bandwidth mode the hardware reports one fewer accumulation
    /// than it performed; the on-copy `+1` from the original wire handling is
    /// preserved here.
    pub fn heap_header(&self, hbw: bool) -> HeapHeader {
        let mut integ = self.item(ID_INTEG_SIZE).unwrap_or(0) as u32;
        if hbw && self.item(ID_INTEG_SIZE).is_some() {
            integ += 1;
        }
        HeapHeader {
            time_counter: self.item(ID_TIME_COUNTER).unwrap_or(0),
            spectrum_counter: self.item(ID_SPECTRUM_COUNTER).unwrap_or(0) as u32,
            integ_size: integ,
            mode: self.item(ID_MODE).unwrap_or(0) as u32,
            status_bits: self.item(ID_STATUS_BITS).unwrap_or(0) as u32,
            payload_offset: self
                .item(ID_PAYLOAD_DATA_OFFSET)
                .or_else(|| self.item(ID_PAYLOAD_SIZE))
                .unwrap_or(0) as u32,
        }
    }
}

/// Synthesize a native item table from a legacy packet.
///
/// The wire header is one big-endian 64-bit word: the FPGA counter in the low
/// 48 bits and the switching status in the 4 bits above it. The counter
/// advances by 0x800 per packet, so the packet number is the counter shifted
/// down 11 bits; only the low 40 bits fit in an item value, so counters past
/// 49 bits alias (a known property of the upstream firmware).
pub fn parse_legacy(data: &[u8]) -> Result<Packet<'_>> {
    if data.len() != LEGACY_PACKET_SIZE {
        return Err(DaqError::Packet("bad legacy packet size"));
    }
    let word = BigEndian::read_u64(&data[..8]);
    let counter = word & LEGACY_COUNTER_MASK;
    let status = ((word >> 48) & 0xf) as u64;
    let heap_cntr = (counter >> 11) & VALUE_MASK;

    let items = vec![
        Item::immediate(ID_HEAP_COUNTER, heap_cntr),
        Item::immediate(
            ID_HEAP_SIZE,
            (HEAP_HEADER_SIZE + LEGACY_PAYLOAD_SIZE) as u64,
        ),
        Item::immediate(ID_HEAP_OFFSET, 0),
        Item::immediate(ID_PAYLOAD_SIZE, LEGACY_PAYLOAD_SIZE as u64),
        Item::immediate(ID_TIME_COUNTER, counter & VALUE_MASK),
        Item::immediate(ID_SPECTRUM_COUNTER, 0),
        Item::immediate(ID_INTEG_SIZE, 0),
        Item::immediate(ID_MODE, 0),
        Item::immediate(ID_STATUS_BITS, status),
    ];
    Ok(Packet {
        items,
        payload: &data[16..],
    })
}

/// Fixed in-block heap descriptor, host order. 32 bytes (tail-padded), one
/// per heap slot at the base of every upstream ring block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct HeapHeader {
    /// 40-bit hardware counter as received; rollover extension happens in the
    /// accumulator, which owns the 64-bit clock.
    pub time_counter: u64,
    pub spectrum_counter: u32,
    pub integ_size: u32,
    pub mode: u32,
    pub status_bits: u32,
    pub payload_offset: u32,
}

pub const HEAP_HEADER_SIZE: usize = std::mem::size_of::<HeapHeader>();
const _: () = assert!(HEAP_HEADER_SIZE == 32);

/// View the header table at the base of a block's data region.
pub fn heap_headers(data: &[u8], count: usize) -> &[HeapHeader] {
    assert!(count * HEAP_HEADER_SIZE <= data.len());
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const HeapHeader, count) }
}

pub fn heap_headers_mut(data: &mut [u8], count: usize) -> &mut [HeapHeader] {
    assert!(count * HEAP_HEADER_SIZE <= data.len());
    unsafe { std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut HeapHeader, count) }
}
