//! Process-wide status area: a flat buffer of 80-byte FITS-style cards in
//! shared memory, guarded by a named semaphore. The status area doubles as a
//! configuration channel (the manager writes scan parameters into it) and a
//! liveness channel (stages publish `NETSTAT`/`PFBSTAT`/`ACCSTAT` etc.).

use log::warn;

use crate::error::{DaqError, Result};
use crate::shm::{NamedSem, ShmSegment};

pub const STATUS_SIZE: usize = 184320;
pub const CARD: usize = 80;

// Keys shared between the manager, the stages and the writer.
pub const KEY_BW_MODE: &str = "BW_MODE";
pub const KEY_MODENAME: &str = "MODENAME";
pub const KEY_SCANSTAT: &str = "SCANSTAT";
pub const KEY_DAQPULSE: &str = "DAQPULSE";
pub const KEY_DAQSTATE: &str = "DAQSTATE";

fn shm_name(instance: u32) -> String {
    format!("/spectrad-status-{instance}")
}

fn sem_name(instance: u32) -> String {
    format!("/spectrad-status-lock-{instance}")
}

/// Handle to the status shared memory. Cheap to attach per stage.
pub struct StatusArea {
    seg: ShmSegment,
    lock: NamedSem,
}

/// RAII view of the locked card buffer. The lock is held for exactly the
/// guard's lifetime and released on every exit path, including panics.
pub struct StatusLock<'a> {
    area: &'a StatusArea,
}

impl StatusArea {
    /// Attach to (creating if necessary) the status area for `instance`.
    pub fn attach(instance: u32) -> Result<StatusArea> {
        let seg = ShmSegment::create(&shm_name(instance), STATUS_SIZE)?;
        let lock = NamedSem::open(&sem_name(instance))?;
        let area = StatusArea { seg, lock };

        // Stale-lock recovery: a writer that died mid-edit leaves the
        // semaphore at zero. One post makes the area usable again.
        if area.lock.value()? == 0 {
            warn!("status semaphore found locked on attach; releasing");
            area.lock.post()?;
        }

        {
            let mut st = area.lock()?;
            if find_card(st.buf(), "END").is_none() {
                st.buf_mut().fill(0);
                st.buf_mut()[..CARD].fill(b' ');
                st.buf_mut()[..3].copy_from_slice(b"END");
            }
        }
        Ok(area)
    }

    pub fn unlink(instance: u32) {
        ShmSegment::unlink(&shm_name(instance));
    }

    pub fn lock(&self) -> Result<StatusLock<'_>> {
        self.lock.wait()?;
        Ok(StatusLock { area: self })
    }

    /// Zero the buffer and reseed the `END` card.
    pub fn clear(&self) -> Result<()> {
        if self.lock.value()? == 0 {
            warn!("status semaphore found locked in clear; releasing");
            self.lock.post()?;
        }
        let mut st = self.lock()?;
        st.buf_mut().fill(0);
        st.buf_mut()[..CARD].fill(b' ');
        st.buf_mut()[..3].copy_from_slice(b"END");
        Ok(())
    }
}

impl<'a> StatusLock<'a> {
    pub fn buf(&self) -> &[u8] {
        unsafe { self.area.seg.slice(0, STATUS_SIZE) }
    }

    pub fn buf_mut(&mut self) -> &mut [u8] {
        unsafe { self.area.seg.slice_mut(0, STATUS_SIZE) }
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        get_str(self.buf(), key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        get_int(self.buf(), key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        get_f64(self.buf(), key)
    }

    pub fn put_str(&mut self, key: &str, value: &str) {
        put_str(self.buf_mut(), key, value);
    }

    pub fn put_int(&mut self, key: &str, value: i64) {
        put_int(self.buf_mut(), key, value);
    }

    pub fn put_f64(&mut self, key: &str, value: f64) {
        put_f64(self.buf_mut(), key, value);
    }
}

impl Drop for StatusLock<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.area.lock.post() {
            warn!("failed to release status lock: {err}");
        }
    }
}

// ---------------------------------------------------------------------------
// Card codec. Free functions over byte buffers so ring-block text headers use
// the same code as the status area.
// ---------------------------------------------------------------------------

fn card_key(card: &[u8]) -> &[u8] {
    let key = &card[..8.min(card.len())];
    let end = key
        .iter()
        .position(|&b| b == b' ' || b == b'=' || b == 0)
        .unwrap_or(key.len());
    &key[..end]
}

/// Byte offset of the card carrying `key`, scanning 80-byte cards until the
/// `END` card or the end of the buffer.
pub fn find_card(buf: &[u8], key: &str) -> Option<usize> {
    let mut offs = 0;
    while offs + CARD <= buf.len() {
        let card = &buf[offs..offs + CARD];
        if card_key(card) == key.as_bytes() {
            return Some(offs);
        }
        if card_key(card) == b"END" {
            return None;
        }
        offs += CARD;
    }
    None
}

fn card_value(card: &[u8]) -> Option<&str> {
    if card.len() < 10 || card[8] != b'=' {
        return None;
    }
    std::str::from_utf8(&card[10..]).ok().map(str::trim)
}

pub fn get_str(buf: &[u8], key: &str) -> Option<String> {
    let offs = find_card(buf, key)?;
    let raw = card_value(&buf[offs..offs + CARD])?;
    let val = raw.trim();
    let val = val.strip_prefix('\'').unwrap_or(val);
    let val = val.strip_suffix('\'').unwrap_or(val);
    Some(val.trim_end().to_string())
}

pub fn get_int(buf: &[u8], key: &str) -> Option<i64> {
    get_str(buf, key)?.parse().ok()
}

pub fn get_u64(buf: &[u8], key: &str) -> Option<u64> {
    get_str(buf, key)?.parse().ok()
}

pub fn get_f64(buf: &[u8], key: &str) -> Option<f64> {
    get_str(buf, key)?.parse().ok()
}

fn write_card(buf: &mut [u8], offs: usize, text: &str) {
    let card = &mut buf[offs..offs + CARD];
    card.fill(b' ');
    let n = text.len().min(CARD);
    card[..n].copy_from_slice(&text.as_bytes()[..n]);
}

/// Write `key = value` in place if the key exists, otherwise insert it just
/// before `END` (sliding `END` down one card). Silently drops the write if
/// the buffer has no room left, matching the original `hput` behavior.
fn put_card(buf: &mut [u8], key: &str, formatted: &str) {
    if let Some(offs) = find_card(buf, key) {
        write_card(buf, offs, formatted);
        return;
    }
    let Some(end) = find_card(buf, "END") else {
        return;
    };
    if end + 2 * CARD > buf.len() {
        return;
    }
    write_card(buf, end, formatted);
    write_card(buf, end + CARD, "END");
}

pub fn put_str(buf: &mut [u8], key: &str, value: &str) {
    put_card(buf, key, &format!("{key:<8}= '{value}'"));
}

pub fn put_int(buf: &mut [u8], key: &str, value: i64) {
    put_card(buf, key, &format!("{key:<8}= {value:>20}"));
}

pub fn put_u64(buf: &mut [u8], key: &str, value: u64) {
    put_card(buf, key, &format!("{key:<8}= {value:>20}"));
}

pub fn put_f64(buf: &mut [u8], key: &str, value: f64) {
    put_card(buf, key, &format!("{key:<8}= {value:>20}"));
}

/// Reset a card buffer to a single `END` card (used for ring block headers).
pub fn clear_cards(buf: &mut [u8]) {
    if let Some(end) = find_card(buf, "END") {
        for offs in (0..=end).step_by(CARD) {
            buf[offs..offs + CARD].fill(b' ');
        }
    }
    buf[..CARD].fill(b' ');
    buf[..3].copy_from_slice(b"END");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_buf() -> Vec<u8> {
        let mut buf = vec![0u8; 80 * 16];
        clear_cards(&mut buf);
        buf
    }

    #[test]
    fn put_get_roundtrip() {
        let mut buf = fresh_buf();
        put_str(&mut buf, "BW_MODE", "high");
        put_int(&mut buf, "NCHAN", 1024);
        put_f64(&mut buf, "SCANLEN", 30.5);
        put_u64(&mut buf, "EXPOCLKS", 1 << 40);

        assert_eq!(get_str(&buf, "BW_MODE").as_deref(), Some("high"));
        assert_eq!(get_int(&buf, "NCHAN"), Some(1024));
        assert_eq!(get_f64(&buf, "SCANLEN"), Some(30.5));
        assert_eq!(get_u64(&buf, "EXPOCLKS"), Some(1 << 40));
        assert_eq!(get_str(&buf, "MISSING"), None);
    }

    #[test]
    fn put_updates_in_place_and_end_stays_last() {
        let mut buf = fresh_buf();
        put_int(&mut buf, "NCHAN", 256);
        put_int(&mut buf, "NSUBBAND", 8);
        let end_before = find_card(&buf, "END").unwrap();
        put_int(&mut buf, "NCHAN", 512);
        assert_eq!(get_int(&buf, "NCHAN"), Some(512));
        assert_eq!(find_card(&buf, "END").unwrap(), end_before);
        assert!(find_card(&buf, "NCHAN").unwrap() < end_before);
    }

    #[test]
    fn full_buffer_drops_new_keys() {
        let mut buf = vec![0u8; 80 * 3];
        clear_cards(&mut buf);
        put_int(&mut buf, "A", 1);
        put_int(&mut buf, "B", 2);
        // No room for C plus END.
        put_int(&mut buf, "C", 3);
        assert_eq!(get_int(&buf, "C"), None);
        assert_eq!(get_int(&buf, "B"), Some(2));
    }

    #[test]
    fn clear_reseeds_end() {
        let mut buf = fresh_buf();
        put_str(&mut buf, "SCANSTAT", "running");
        clear_cards(&mut buf);
        assert_eq!(get_str(&buf, "SCANSTAT"), None);
        assert_eq!(find_card(&buf, "END"), Some(0));
    }

    #[test]
    fn attach_seeds_end_and_releases_stale_lock() {
        let instance = 9000 + std::process::id() % 1000;
        StatusArea::unlink(instance);
        let area = StatusArea::attach(instance).unwrap();
        {
            let mut st = area.lock().unwrap();
            assert!(find_card(st.buf(), "END").is_some());
            st.put_str("SCANSTAT", "running");
        }
        // Simulate a crashed writer: take the lock and drop the handle.
        area.lock.wait().unwrap();
        let again = StatusArea::attach(instance).unwrap();
        let st = again.lock().unwrap();
        assert_eq!(st.get_str("SCANSTAT").as_deref(), Some("running"));
        drop(st);
        StatusArea::unlink(instance);
    }
}
