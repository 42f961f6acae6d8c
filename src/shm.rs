//! Raw shared-memory and semaphore plumbing.
//!
//! Rings and the status area live in POSIX shared memory so that external
//! tooling (and a crashed-and-restarted daemon) can attach to a live pipeline.
//! Block hand-off uses a System V semaphore set because `semtimedop` can apply
//! a multi-op array atomically, which the filled-wait primitive requires.
//! The status lock is a POSIX named semaphore.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::io::FromRawFd;
use std::time::{SystemTime, UNIX_EPOCH};

use memmap2::MmapRaw;

use crate::error::{DaqError, Result};

/// Ring/status wait granularity. Stages loop on `Timeout`.
pub const WAIT_TIMEOUT_NS: i64 = 250_000_000;

fn cstring(name: &str) -> CString {
    CString::new(name).expect("shm name contains NUL")
}

/// A POSIX shared-memory segment mapped read/write.
///
/// Dropping a `ShmSegment` unmaps and closes but never unlinks; segments
/// outlive any single attach, like the original System V buffers did.
pub struct ShmSegment {
    map: MmapRaw,
    len: usize,
}

impl ShmSegment {
    /// Create the segment if needed and map it. Existing segments of the
    /// right size are reused, so create is an idempotent attach.
    pub fn create(name: &str, len: usize) -> Result<ShmSegment> {
        let cname = cstring(name);
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_RDWR | libc::O_CREAT,
                0o666 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(DaqError::last_sys("shm_open"));
        }
        let file = unsafe { File::from_raw_fd(fd) };
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            return Err(DaqError::last_sys("ftruncate"));
        }
        let map = MmapRaw::map_raw(&file)?;
        Ok(ShmSegment { map, len })
    }

    /// Attach to an existing segment; error if it does not exist.
    pub fn attach(name: &str) -> Result<ShmSegment> {
        let cname = cstring(name);
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Err(DaqError::NoSegment(name.to_string()));
            }
            return Err(DaqError::Sys("shm_open", err));
        }
        let file = unsafe { File::from_raw_fd(fd) };
        let len = file.metadata()?.len() as usize;
        let map = MmapRaw::map_raw(&file)?;
        Ok(ShmSegment { map, len })
    }

    pub fn unlink(name: &str) {
        let cname = cstring(name);
        unsafe {
            libc::shm_unlink(cname.as_ptr());
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// # Safety
    /// `offset + len` must lie within the segment and the caller must uphold
    /// the ring's SPSC discipline for the bytes in question.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len);
        std::slice::from_raw_parts(self.as_ptr().add(offset), len)
    }

    /// # Safety
    /// Same contract as [`ShmSegment::slice`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.len);
        std::slice::from_raw_parts_mut(self.as_ptr().add(offset), len)
    }
}

// The maps are only touched under semaphore-mediated hand-off.
unsafe impl Send for ShmSegment {}

fn wait_timespec() -> libc::timespec {
    libc::timespec {
        tv_sec: 0,
        tv_nsec: WAIT_TIMEOUT_NS as _,
    }
}

/// A System V semaphore set, one semaphore per ring block.
///
/// Value 0 means *free*, 1 means *filled*.
pub struct SemSet {
    id: libc::c_int,
    nsems: usize,
}

impl SemSet {
    pub fn create(key: i32, nsems: usize) -> Result<SemSet> {
        let id = unsafe { libc::semget(key, nsems as libc::c_int, libc::IPC_CREAT | 0o666) };
        if id < 0 {
            return Err(DaqError::last_sys("semget"));
        }
        Ok(SemSet { id, nsems })
    }

    pub fn attach(key: i32, nsems: usize) -> Result<SemSet> {
        let id = unsafe { libc::semget(key, 0, 0o666) };
        if id < 0 {
            return Err(DaqError::last_sys("semget"));
        }
        Ok(SemSet { id, nsems })
    }

    fn timedop(&self, ops: &mut [libc::sembuf]) -> Result<()> {
        let timeout = wait_timespec();
        let rv = unsafe {
            libc::syscall(
                libc::SYS_semtimedop,
                self.id,
                ops.as_mut_ptr(),
                ops.len(),
                &timeout,
            )
        };
        if rv == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // EINTR is not an error worth reporting; the caller loops anyway.
            Some(libc::EAGAIN) | Some(libc::EINTR) => Err(DaqError::Timeout),
            _ => Err(DaqError::Sys("semtimedop", err)),
        }
    }

    /// Block until semaphore `i` reaches zero (the *free* state).
    pub fn wait_zero(&self, i: usize) -> Result<()> {
        let mut ops = [libc::sembuf {
            sem_num: i as libc::c_ushort,
            sem_op: 0,
            sem_flg: 0,
        }];
        self.timedop(&mut ops)
    }

    /// Block until semaphore `i` is positive, leaving the value unchanged.
    ///
    /// The decrement and increment are submitted as one `semtimedop` array so
    /// the pair is atomic; a test-then-set here would race the producer.
    pub fn wait_positive(&self, i: usize) -> Result<()> {
        let mut ops = [
            libc::sembuf {
                sem_num: i as libc::c_ushort,
                sem_op: -1,
                sem_flg: 0,
            },
            libc::sembuf {
                sem_num: i as libc::c_ushort,
                sem_op: 1,
                sem_flg: 0,
            },
        ];
        self.timedop(&mut ops)
    }

    /// Unconditional write of semaphore `i`, so an abnormally exiting stage
    /// can never leave a block half-transitioned.
    pub fn set(&self, i: usize, value: i32) -> Result<()> {
        let rv = unsafe { libc::semctl(self.id, i as libc::c_int, libc::SETVAL, value) };
        if rv < 0 {
            return Err(DaqError::last_sys("semctl SETVAL"));
        }
        Ok(())
    }

    pub fn value(&self, i: usize) -> Result<i32> {
        let rv = unsafe { libc::semctl(self.id, i as libc::c_int, libc::GETVAL) };
        if rv < 0 {
            return Err(DaqError::last_sys("semctl GETVAL"));
        }
        Ok(rv)
    }

    pub fn values(&self) -> Result<Vec<u16>> {
        let mut vals = vec![0u16; self.nsems];
        let rv = unsafe { libc::semctl(self.id, 0, libc::GETALL, vals.as_mut_ptr()) };
        if rv < 0 {
            return Err(DaqError::last_sys("semctl GETALL"));
        }
        Ok(vals)
    }

    pub fn remove(key: i32) {
        unsafe {
            let id = libc::semget(key, 0, 0o666);
            if id >= 0 {
                libc::semctl(id, 0, libc::IPC_RMID);
            }
        }
    }
}

unsafe impl Send for SemSet {}

/// A POSIX named semaphore used as the status-area lock.
pub struct NamedSem {
    sem: *mut libc::sem_t,
}

impl NamedSem {
    /// Open (creating unlocked if needed) under a zeroed umask so every
    /// cooperating process can take the lock regardless of who created it.
    pub fn open(name: &str) -> Result<NamedSem> {
        let cname = cstring(name);
        let old_umask = unsafe { libc::umask(0) };
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT,
                0o666 as libc::mode_t,
                1 as libc::c_uint,
            )
        };
        unsafe {
            libc::umask(old_umask);
        }
        if sem == libc::SEM_FAILED {
            return Err(DaqError::last_sys("sem_open"));
        }
        Ok(NamedSem { sem })
    }

    pub fn wait(&self) -> Result<()> {
        loop {
            let rv = unsafe { libc::sem_wait(self.sem) };
            if rv == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(DaqError::Sys("sem_wait", err));
            }
        }
    }

    pub fn post(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(DaqError::last_sys("sem_post"));
        }
        Ok(())
    }

    pub fn value(&self) -> Result<i32> {
        let mut v: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.sem, &mut v) } != 0 {
            return Err(DaqError::last_sys("sem_getvalue"));
        }
        Ok(v)
    }
}

impl Drop for NamedSem {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

unsafe impl Send for NamedSem {}

/// Current time as a Modified Julian Date, the timestamp unit the telescope
/// world runs on. 40587 is the MJD of the Unix epoch.
pub fn current_mjd() -> f64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs_f64() / 86400.0 + 40587.0
}
