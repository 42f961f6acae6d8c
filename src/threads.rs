//! Per-stage thread plumbing: run flags, exit notification, CPU affinity and
//! real-time priority, and the thread-placement configuration file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use log::warn;

use crate::error::Result;

/// Everything a stage thread needs to run and to report back.
pub struct StageCtx {
    pub name: &'static str,
    pub instance: u32,
    pub input_ring: Option<u32>,
    pub output_ring: Option<u32>,
    pub run: Arc<AtomicBool>,
    pub done: Sender<StageExit>,
    pub cpu_mask: u32,
    pub priority: i32,
    pub debug_heaps: bool,
}

impl StageCtx {
    pub fn running(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }
}

/// Sent to the supervisor when a stage's loop returns.
pub struct StageExit {
    pub name: &'static str,
    pub result: Result<()>,
}

/// Pin the calling thread and raise its priority. Both are best-effort; the
/// pipeline runs unpinned on machines without the needed privileges.
pub fn apply_affinity_and_priority(name: &str, cpu_mask: u32, priority: i32) {
    if cpu_mask != 0 {
        unsafe {
            let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut cpuset);
            for core in 0..31usize {
                if cpu_mask & (1 << core) != 0 {
                    libc::CPU_SET(core, &mut cpuset);
                }
            }
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset) != 0 {
                warn!(
                    "{name}: could not set cpu affinity {cpu_mask:#x}: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
    if priority != 0 {
        unsafe {
            let param = libc::sched_param {
                sched_priority: priority,
            };
            if libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) != 0 {
                warn!(
                    "{name}: could not set priority {priority}: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

/// Thread placement keys understood by the configuration file.
pub const CONFIG_KEYS: &[&str] = &[
    "net_thread_mask",
    "pfb_thread_mask",
    "accum_thread_mask",
    "null_thread_mask",
    "net_thread_priority",
    "pfb_thread_priority",
    "accum_thread_priority",
    "null_thread_priority",
];

#[derive(Clone, Debug, Default)]
pub struct ThreadConfig {
    values: HashMap<String, u32>,
}

impl ThreadConfig {
    /// Load `spectrad_threads.conf` from `$SPECTRAD_DIR`, falling back to
    /// `$YGOR_TELESCOPE/etc/config`. No file means no pinning, with a
    /// warning, never an error.
    pub fn load() -> ThreadConfig {
        let Some(path) = Self::config_path() else {
            warn!("neither SPECTRAD_DIR nor YGOR_TELESCOPE is set; thread pinning disabled");
            return ThreadConfig::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text),
            Err(_) => {
                warn!("thread configuration file {} not found", path.display());
                ThreadConfig::default()
            }
        }
    }

    fn config_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var("SPECTRAD_DIR") {
            return Some(PathBuf::from(dir).join("spectrad_threads.conf"));
        }
        if let Ok(root) = std::env::var("YGOR_TELESCOPE") {
            return Some(
                PathBuf::from(root)
                    .join("etc/config")
                    .join("spectrad_threads.conf"),
            );
        }
        None
    }

    /// `key=value` lines; `#` starts a comment; values take `0x` prefixes.
    pub fn parse(text: &str) -> ThreadConfig {
        let mut values = HashMap::new();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            if !CONFIG_KEYS.contains(&key.as_str()) {
                warn!("unknown thread configuration keyword {key}");
                continue;
            }
            let value = value.trim();
            let parsed = if let Some(hex) = value.strip_prefix("0x") {
                u32::from_str_radix(hex, 16)
            } else {
                value.parse()
            };
            match parsed {
                Ok(v) => {
                    values.insert(key, v);
                }
                Err(_) => warn!("unreadable numeric value on line: {line}"),
            }
        }
        ThreadConfig { values }
    }

    pub fn mask(&self, stage: &str) -> u32 {
        self.values
            .get(&format!("{stage}_thread_mask"))
            .copied()
            .unwrap_or(0)
    }

    pub fn priority(&self, stage: &str) -> i32 {
        self.values
            .get(&format!("{stage}_thread_priority"))
            .copied()
            .unwrap_or(0) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_masks_and_priorities() {
        let cfg = ThreadConfig::parse(
            "# placement for the production machine\n\
             net_thread_mask=0x3\n\
             accum_thread_mask = 12   # cores 2,3\n\
             net_thread_priority=20\n\
             bogus line without equals\n\
             unknown_key=7\n",
        );
        assert_eq!(cfg.mask("net"), 3);
        assert_eq!(cfg.mask("accum"), 12);
        assert_eq!(cfg.mask("pfb"), 0);
        assert_eq!(cfg.priority("net"), 20);
        assert_eq!(cfg.priority("accum"), 0);
    }

    #[test]
    fn garbage_values_are_skipped() {
        let cfg = ThreadConfig::parse("net_thread_mask=zz\npfb_thread_mask=0x10\n");
        assert_eq!(cfg.mask("net"), 0);
        assert_eq!(cfg.mask("pfb"), 16);
    }

    #[test]
    fn load_reads_the_configured_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("spectrad_threads.conf"),
            "net_thread_mask=0x5\naccum_thread_priority=15\n",
        )
        .unwrap();

        std::env::set_var("SPECTRAD_DIR", dir.path());
        let cfg = ThreadConfig::load();
        assert_eq!(cfg.mask("net"), 5);
        assert_eq!(cfg.priority("accum"), 15);

        // A missing file degrades to no pinning rather than an error.
        std::env::set_var("SPECTRAD_DIR", dir.path().join("nowhere"));
        let cfg = ThreadConfig::load();
        assert_eq!(cfg.mask("net"), 0);
        std::env::remove_var("SPECTRAD_DIR");
    }
}
