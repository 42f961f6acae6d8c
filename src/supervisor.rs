//! Control supervisor: owns the status area and rings, reads commands from
//! an external FIFO, and spawns/stops the per-mode stage threads.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::SystemTime;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, info, warn};

use crate::accum;
use crate::capture;
use crate::dsp::DspContext;
use crate::error::{DaqError, Result};
use crate::pfb;
use crate::ring::Ring;
use crate::status::{self, StatusArea};
use crate::threads::{apply_affinity_and_priority, StageCtx, StageExit, ThreadConfig};

/// Ring ids; the writer always reads integration rows from ring 3.
pub const NET_RING: u32 = 1;
pub const PFB_RING: u32 = 2;
pub const DISK_RING: u32 = 3;

const NET_RING_BLOCKS: usize = 8;
const PFB_RING_BLOCKS: usize = 8;
const DISK_RING_BLOCKS: usize = 8;
const DEFAULT_BLOCK_SIZE: usize = 32 * 1024 * 1024;

const SOFTWARE_VERSION: &str = "1.4";

#[derive(Clone, Debug)]
pub struct ServeOpts {
    pub control_fifo: PathBuf,
    pub instance: u32,
    pub init_gpu: bool,
    pub accumulator_debug: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScanMode {
    Hbw,
    Lbw,
    Monitor,
}

struct StageHandle {
    name: &'static str,
    thread: JoinHandle<()>,
}

/// A running scan: stage threads in producer-to-consumer order plus their
/// shared run flag.
struct StageSet {
    run: Arc<AtomicBool>,
    /// Producer first; joined in reverse (consumers first, producers last).
    stages: Vec<StageHandle>,
}

impl StageSet {
    fn stop(mut self) {
        self.run.store(false, Ordering::SeqCst);
        while let Some(stage) = self.stages.pop() {
            if stage.thread.join().is_err() {
                error!("{} thread panicked", stage.name);
            }
        }
    }
}

fn spawn_stage(
    name: &'static str,
    ctx: StageCtx,
    body: fn(&StageCtx) -> Result<()>,
) -> Result<StageHandle> {
    let thread = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            apply_affinity_and_priority(ctx.name, ctx.cpu_mask, ctx.priority);
            let result = body(&ctx);
            if let Err(err) = &result {
                error!("{} stage failed: {err}", ctx.name);
            }
            let _ = ctx.done.send(StageExit {
                name: ctx.name,
                result,
            });
        })
        .map_err(|e| DaqError::Sys("spawn", e))?;
    Ok(StageHandle { name, thread })
}

/// One planned stage: its ring plumbing, its thread-placement config key,
/// and the loop body to run.
struct StagePlan {
    name: &'static str,
    config_key: &'static str,
    input_ring: Option<u32>,
    output_ring: Option<u32>,
    body: fn(&StageCtx) -> Result<()>,
}

/// The per-mode thread sets, producers first.
fn mode_stages(mode: ScanMode) -> Vec<StagePlan> {
    let capture = StagePlan {
        name: "capture",
        config_key: "net",
        input_ring: None,
        output_ring: Some(NET_RING),
        body: capture::run,
    };
    match mode {
        ScanMode::Hbw => vec![
            capture,
            StagePlan {
                name: "accum",
                config_key: "accum",
                input_ring: Some(NET_RING),
                output_ring: Some(DISK_RING),
                body: accum::run,
            },
        ],
        ScanMode::Lbw => vec![
            capture,
            StagePlan {
                name: "pfb",
                config_key: "pfb",
                input_ring: Some(NET_RING),
                output_ring: Some(PFB_RING),
                body: pfb::run,
            },
            StagePlan {
                name: "accum",
                config_key: "accum",
                input_ring: Some(PFB_RING),
                output_ring: Some(DISK_RING),
                body: accum::run,
            },
        ],
        ScanMode::Monitor => vec![
            capture,
            StagePlan {
                name: "null",
                config_key: "null",
                input_ring: Some(NET_RING),
                output_ring: None,
                body: capture::run_null_consumer,
            },
        ],
    }
}

/// `START` runs whichever pipeline the `BW_MODE` card selects.
fn scan_mode_from_bw(bw_mode: Option<&str>) -> Option<ScanMode> {
    match bw_mode {
        Some(s) if s.starts_with("high") => Some(ScanMode::Hbw),
        Some(s) if s.starts_with("low") => Some(ScanMode::Lbw),
        _ => None,
    }
}

fn start_scan(
    mode: ScanMode,
    opts: &ServeOpts,
    config: &ThreadConfig,
    done: &Sender<StageExit>,
) -> Result<StageSet> {
    let run = Arc::new(AtomicBool::new(true));
    let mut stages = Vec::new();
    for plan in mode_stages(mode) {
        let ctx = StageCtx {
            name: plan.name,
            instance: opts.instance,
            input_ring: plan.input_ring,
            output_ring: plan.output_ring,
            run: run.clone(),
            done: done.clone(),
            cpu_mask: config.mask(plan.config_key),
            priority: config.priority(plan.config_key),
            debug_heaps: opts.accumulator_debug,
        };
        stages.push(spawn_stage(plan.name, ctx, plan.body)?);
    }
    Ok(StageSet { run, stages })
}

fn init_compute_context(st: &StatusArea) {
    let guard = match st.lock() {
        Ok(g) => g,
        Err(err) => {
            warn!("could not lock status area: {err}");
            return;
        }
    };
    let nchan = guard.get_int("NCHAN").unwrap_or(1024) as usize;
    let nsubband = guard.get_int("NSUBBAND").unwrap_or(1) as usize;
    drop(guard);
    match DspContext::new(nchan, nsubband, DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_SIZE) {
        Ok(_) => {
            if let Ok(mut guard) = st.lock() {
                guard.put_str("GPUCTXIN", "TRUE");
            }
            info!("compute context initialized ({nchan} channels, {nsubband} subbands)");
        }
        Err(err) => warn!("compute context initialization failed: {err}"),
    }
}

struct ControlFifo {
    fd: libc::c_int,
    path: PathBuf,
}

impl ControlFifo {
    fn create(path: &Path) -> Result<ControlFifo> {
        let cpath = CString::new(path.to_str().ok_or(DaqError::Param("bad fifo path".into()))?)
            .map_err(|_| DaqError::Param("fifo path contains NUL".into()))?;
        let rv = unsafe { libc::mkfifo(cpath.as_ptr(), 0o666) };
        if rv != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(DaqError::Sys("mkfifo", err));
            }
        }
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK) };
        if fd < 0 {
            return Err(DaqError::last_sys("open control fifo"));
        }
        Ok(ControlFifo {
            fd,
            path: path.to_path_buf(),
        })
    }

    /// The writing side closed; reopen to clear the POLLHUP condition.
    fn reopen(&mut self) -> Result<()> {
        unsafe {
            libc::close(self.fd);
        }
        let cpath = CString::new(self.path.to_str().unwrap()).unwrap();
        self.fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK) };
        if self.fd < 0 {
            return Err(DaqError::last_sys("reopen control fifo"));
        }
        Ok(())
    }
}

impl Drop for ControlFifo {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Wait up to a second for a command on the FIFO or stdin. Returns the first
/// line, uppercased and trimmed.
fn poll_command(fifo: &mut ControlFifo) -> Result<Option<String>> {
    let mut pfds = [
        libc::pollfd {
            fd: fifo.fd,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: libc::STDIN_FILENO,
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    let rv = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as _, 1000) };
    if rv == 0 {
        return Ok(None);
    }
    if rv < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return Ok(None);
        }
        return Err(DaqError::Sys("poll", err));
    }

    if pfds[0].revents & libc::POLLHUP != 0 && pfds[0].revents & libc::POLLIN == 0 {
        fifo.reopen()?;
        return Ok(None);
    }

    let mut buf = [0u8; 1024];
    for pfd in &pfds {
        if pfd.revents & libc::POLLIN == 0 {
            continue;
        }
        let n = unsafe { libc::read(pfd.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len() - 1) };
        if n <= 0 {
            continue;
        }
        let text = String::from_utf8_lossy(&buf[..n as usize]);
        let line = text.lines().next().unwrap_or("").trim();
        if !line.is_empty() {
            return Ok(Some(line.to_ascii_uppercase()));
        }
    }
    Ok(None)
}

fn put_scan_state(st: &StatusArea, running: bool) {
    if let Ok(mut guard) = st.lock() {
        guard.put_str(status::KEY_SCANSTAT, if running { "running" } else { "stopped" });
    }
}

/// Supervisor main loop. Returns the process exit code.
pub fn run(opts: &ServeOpts) -> Result<i32> {
    let st = StatusArea::attach(opts.instance)?;
    let ring_net = Ring::create(NET_RING, NET_RING_BLOCKS, DEFAULT_BLOCK_SIZE)?;
    let ring_pfb = Ring::create(PFB_RING, PFB_RING_BLOCKS, DEFAULT_BLOCK_SIZE)?;
    let ring_disk = Ring::create(DISK_RING, DISK_RING_BLOCKS, DEFAULT_BLOCK_SIZE)?;
    let mut fifo = ControlFifo::create(&opts.control_fifo)?;

    let srv_run = Arc::new(AtomicBool::new(true));
    {
        let srv_run = srv_run.clone();
        ctrlc::set_handler(move || {
            srv_run.store(false, Ordering::SeqCst);
        })
        .map_err(|e| DaqError::Param(format!("cannot register signal handler: {e}")))?;
    }

    let thread_config = ThreadConfig::load();
    let (done_tx, done_rx): (Sender<StageExit>, Receiver<StageExit>) = bounded(8);
    let mut scan: Option<StageSet> = None;

    eprintln!(
        "spectrad supervisor started; control fifo {}",
        opts.control_fifo.display()
    );
    if opts.init_gpu {
        init_compute_context(&st);
    }

    while srv_run.load(Ordering::SeqCst) {
        // A stage exiting on its own (end of scan, fatal error) stops the set.
        if let Ok(exit) = done_rx.try_recv() {
            match &exit.result {
                Ok(()) => info!("{} stage finished", exit.name),
                Err(err) => error!("{} stage exited with error: {err}", exit.name),
            }
            if let Some(set) = scan.take() {
                set.stop();
            }
            put_scan_state(&st, false);
        }

        // Heartbeat.
        if let Ok(mut guard) = st.lock() {
            let now = humantime::format_rfc3339_seconds(SystemTime::now());
            guard.put_str(status::KEY_DAQPULSE, &now.to_string());
            guard.put_str(
                status::KEY_DAQSTATE,
                if scan.is_some() { "running" } else { "stopped" },
            );
        }

        let command = match poll_command(&mut fifo) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(err) => {
                warn!("command poll failed: {err}");
                continue;
            }
        };

        match command.as_str() {
            "QUIT" => {
                info!("stop observations and exit");
                if let Some(set) = scan.take() {
                    set.stop();
                }
                put_scan_state(&st, false);
                break;
            }
            "STOP" => {
                info!("stop observations");
                if let Some(set) = scan.take() {
                    set.stop();
                }
                put_scan_state(&st, false);
            }
            "START" | "MONITOR" => {
                if scan.is_some() {
                    warn!("observations already running");
                    continue;
                }
                let mode = if command == "MONITOR" {
                    ScanMode::Monitor
                } else {
                    let bw_mode = st.lock()?.get_str(status::KEY_BW_MODE);
                    match scan_mode_from_bw(bw_mode.as_deref()) {
                        Some(mode) => mode,
                        None => {
                            warn!("unrecognized BW_MODE {bw_mode:?}; not starting");
                            continue;
                        }
                    }
                };
                info!("start observations ({mode:?})");

                ring_net.clear()?;
                ring_pfb.clear()?;
                ring_disk.clear()?;

                {
                    let mut guard = st.lock()?;
                    match mode {
                        ScanMode::Hbw => guard.put_str(status::KEY_BW_MODE, "high"),
                        ScanMode::Lbw => guard.put_str(status::KEY_BW_MODE, "low"),
                        ScanMode::Monitor => {}
                    }
                    guard.put_str("SWVER", SOFTWARE_VERSION);
                    guard.put_str(
                        status::KEY_SCANSTAT,
                        // Monitor runs leave the scan state alone so the
                        // capture stage never arms its end-of-scan drain.
                        if mode == ScanMode::Monitor { "stopped" } else { "running" },
                    );
                }

                match start_scan(mode, opts, &thread_config, &done_tx) {
                    Ok(set) => scan = Some(set),
                    Err(err) => {
                        error!("failed to start scan: {err}");
                        put_scan_state(&st, false);
                    }
                }
            }
            "INIT_GPU" => init_compute_context(&st),
            other => warn!("unrecognized command '{other}'"),
        }
    }

    if let Some(set) = scan.take() {
        set.stop();
    }
    if let Ok(mut guard) = st.lock() {
        guard.put_str(status::KEY_DAQSTATE, "exiting");
        guard.put_str(status::KEY_SCANSTAT, "stopped");
    }
    drop(ring_net);
    drop(ring_pfb);
    drop(ring_disk);
    eprintln!("spectrad supervisor exiting cleanly");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn bw_mode_selects_the_pipeline() {
        assert_eq!(scan_mode_from_bw(Some("high")), Some(ScanMode::Hbw));
        assert_eq!(scan_mode_from_bw(Some("low")), Some(ScanMode::Lbw));
        assert_eq!(scan_mode_from_bw(Some("medium")), None);
        assert_eq!(scan_mode_from_bw(None), None);
    }

    fn names(plans: &[StagePlan]) -> Vec<&'static str> {
        plans.iter().map(|p| p.name).collect()
    }

    #[test]
    fn mode_sets_wire_the_pipeline() {
        let hbw = mode_stages(ScanMode::Hbw);
        assert_eq!(names(&hbw), ["capture", "accum"]);
        assert_eq!(hbw[0].input_ring, None);
        assert_eq!(hbw[0].output_ring, Some(NET_RING));
        assert_eq!(hbw[1].input_ring, hbw[0].output_ring);
        assert_eq!(hbw[1].output_ring, Some(DISK_RING));

        // Low bandwidth routes through the PFB stage; each consumer reads
        // the ring its producer fills.
        let lbw = mode_stages(ScanMode::Lbw);
        assert_eq!(names(&lbw), ["capture", "pfb", "accum"]);
        assert_eq!(lbw[1].input_ring, lbw[0].output_ring);
        assert_eq!(lbw[1].output_ring, Some(PFB_RING));
        assert_eq!(lbw[2].input_ring, lbw[1].output_ring);
        assert_eq!(lbw[2].output_ring, Some(DISK_RING));

        let monitor = mode_stages(ScanMode::Monitor);
        assert_eq!(names(&monitor), ["capture", "null"]);
        assert_eq!(monitor[1].input_ring, Some(NET_RING));
        assert_eq!(monitor[1].output_ring, None);
    }

    #[test]
    fn stop_clears_run_flag_and_joins_consumers_first() {
        let run = Arc::new(AtomicBool::new(true));
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let (token_tx, token_rx) = bounded::<()>(1);

        // The producer cannot finish until the consumer has drained and
        // handed back its token, mirroring a stage blocked on a full ring;
        // teardown must release the consumer side first.
        let producer = {
            let run = run.clone();
            let log = log.clone();
            std::thread::Builder::new()
                .name("producer".to_string())
                .spawn(move || {
                    while run.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(2));
                    }
                    token_rx.recv().unwrap();
                    log.lock().unwrap().push("producer");
                })
                .unwrap()
        };
        let consumer = {
            let run = run.clone();
            let log = log.clone();
            std::thread::Builder::new()
                .name("consumer".to_string())
                .spawn(move || {
                    while run.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(2));
                    }
                    log.lock().unwrap().push("consumer");
                    token_tx.send(()).unwrap();
                })
                .unwrap()
        };

        let set = StageSet {
            run: run.clone(),
            stages: vec![
                StageHandle {
                    name: "producer",
                    thread: producer,
                },
                StageHandle {
                    name: "consumer",
                    thread: consumer,
                },
            ],
        };
        set.stop();
        assert!(!run.load(Ordering::SeqCst));
        assert_eq!(*log.lock().unwrap(), ["consumer", "producer"]);
    }

    #[test]
    fn control_fifo_parses_and_survives_writer_loss() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control");
        let mut fifo = ControlFifo::create(&path).unwrap();
        // A second create tolerates the existing FIFO.
        drop(ControlFifo::create(&path).unwrap());

        let mut writer = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        writer.write_all(b"monitor\n").unwrap();
        assert_eq!(poll_command(&mut fifo).unwrap().as_deref(), Some("MONITOR"));

        // Lowercase and surrounding noise normalize to one command; only the
        // first line of a burst is consumed.
        writer.write_all(b"  start  \nignored\n").unwrap();
        assert_eq!(poll_command(&mut fifo).unwrap().as_deref(), Some("START"));

        // Blank input is not a command.
        writer.write_all(b"   \n").unwrap();
        assert_eq!(poll_command(&mut fifo).unwrap(), None);

        // The writing side going away raises POLLHUP; the FIFO is reopened
        // and a fresh writer is heard.
        drop(writer);
        assert_eq!(poll_command(&mut fifo).unwrap(), None);
        let mut writer = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        writer.write_all(b"quit\n").unwrap();
        assert_eq!(poll_command(&mut fifo).unwrap().as_deref(), Some("QUIT"));
    }
}
