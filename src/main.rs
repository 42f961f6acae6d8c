mod accum;
mod blanking;
mod capture;
mod cli;
mod dsp;
mod error;
mod obs;
mod pfb;
mod ring;
mod row;
mod shm;
mod spead;
mod status;
mod supervisor;
mod switching;
mod threads;

use cli::{RingArgs, StatusArgs};
use ring::Ring;
use status::{StatusArea, CARD, STATUS_SIZE};
use supervisor::ServeOpts;

fn main() {
    env_logger::init();

    use clap::Parser;
    let opt = cli::Opt::parse();
    match opt.action {
        cli::Action::Serve(args) => {
            let opts = ServeOpts {
                control_fifo: args.control_fifo,
                instance: args.instance,
                init_gpu: args.init_gpu,
                accumulator_debug: args.accumulator_debug,
            };
            match supervisor::run(&opts) {
                Ok(code) => std::process::exit(code),
                Err(err) => {
                    eprintln!("spectrad: startup failed: {err}");
                    std::process::exit(1);
                }
            }
        }
        cli::Action::Status(args) => do_status_action(args),
        cli::Action::Ring(args) => do_ring_action(args),
    }
}

fn do_status_action(args: StatusArgs) {
    let st = match StatusArea::attach(args.instance) {
        Ok(st) => st,
        Err(err) => {
            eprintln!("Could not attach to the status area: {err}");
            std::process::exit(1);
        }
    };
    if args.clear {
        if let Err(err) = st.clear() {
            eprintln!("Could not clear the status area: {err}");
            std::process::exit(1);
        }
        return;
    }
    let guard = match st.lock() {
        Ok(g) => g,
        Err(err) => {
            eprintln!("Could not lock the status area: {err}");
            std::process::exit(1);
        }
    };
    if let Some(key) = args.key {
        match guard.get_str(&key) {
            Some(value) => println!("{value}"),
            None => {
                eprintln!("{key} not present");
                std::process::exit(1);
            }
        }
        return;
    }
    let buf = guard.buf();
    for offs in (0..STATUS_SIZE).step_by(CARD) {
        let card = &buf[offs..offs + CARD];
        let text = String::from_utf8_lossy(card);
        let text = text.trim_end_matches(['\0', ' ']);
        if text.is_empty() {
            continue;
        }
        println!("{text}");
        if text.starts_with("END") {
            break;
        }
    }
}

fn do_ring_action(args: RingArgs) {
    if args.unlink {
        Ring::unlink(args.id);
        println!("ring {} removed", args.id);
        return;
    }
    if args.create {
        match Ring::create(args.id, args.nblock, args.block_size) {
            Ok(_) => println!(
                "ring {} created: {} blocks of {} bytes",
                args.id, args.nblock, args.block_size
            ),
            Err(err) => {
                eprintln!("Could not create ring {}: {err}", args.id);
                std::process::exit(1);
            }
        }
        return;
    }
    let ring = match Ring::attach(args.id) {
        Ok(ring) => ring,
        Err(err) => {
            eprintln!("Could not attach to ring {}: {err}", args.id);
            std::process::exit(1);
        }
    };
    println!(
        "ring {}: {} blocks x {} bytes",
        ring.ring_id(),
        ring.n_block(),
        ring.block_size()
    );
    let total = ring.total_status().unwrap_or(0);
    for block in 0..ring.n_block() {
        let state = match ring.block_status(block) {
            Ok(0) => "free",
            Ok(_) => "filled",
            Err(_) => "?",
        };
        let index = ring.heap_index(block);
        println!(
            "  block {block:3}: {state:6}  heaps={} heap_size={}",
            index.num_heaps, index.heap_size
        );
    }
    println!("{total} blocks filled");
}
