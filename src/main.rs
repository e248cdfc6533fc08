//! Executor node.
//!
//! Starts a single VM executor from command-line arguments: binds the UDP
//! transport, optionally loads one program object into the run-set, and
//! drives the scheduler. Peers migrate or clone images into this node by
//! sending byte images to the listen address.
//!
//! # Usage
//! ```text
//! pktvm <listen_addr> [OPTIONS]
//! ```

use pktvm::executor::Executor;
use pktvm::loader::load_object;
use pktvm::transport::{UdpConfig, UdpTransport};
use pktvm::vm::asm::{alu64_imm, assemble, call_ext, exit, mov64_imm};
use pktvm::vm::image::VmImage;
use pktvm::vm::isa::AluOp;
use pktvm::{error, info};
use std::net::SocketAddrV4;
use std::process;

const USAGE: &str = "\
pktvm - process-migratable eBPF VM executor

USAGE:
    pktvm <listen_addr> [OPTIONS]

ARGS:
    <listen_addr>       Local UDP address to bind (e.g., 127.0.0.1:18515)

OPTIONS:
    --program <file>    ELF program object to load and admit
    --data-u64 <n>      Append a 64-bit value to the program's data region
                        (repeatable, in order)
    --oneshot           Exit once the run-set drains instead of serving
    -h, --help          Print this help message

With no --program, a built-in demo program that prints 42 is admitted.
";

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        eprintln!("{}", USAGE);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let listen: SocketAddrV4 = match args[1].parse() {
        Ok(addr) => addr,
        Err(_) => {
            eprintln!("Invalid listen address: {}", args[1]);
            process::exit(1);
        }
    };

    let mut program_path: Option<&str> = None;
    let mut data_values: Vec<u64> = Vec::new();
    let mut oneshot = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--program" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("--program requires an argument");
                    process::exit(1);
                }
                program_path = Some(&args[i]);
                i += 1;
            }
            "--data-u64" => {
                i += 1;
                let value = args.get(i).and_then(|raw| raw.parse().ok());
                match value {
                    Some(v) => data_values.push(v),
                    None => {
                        eprintln!("--data-u64 requires a numeric argument");
                        process::exit(1);
                    }
                }
                i += 1;
            }
            "--oneshot" => {
                oneshot = true;
                i += 1;
            }
            other => {
                eprintln!("Unexpected argument: {}\n\n{}", other, USAGE);
                process::exit(1);
            }
        }
    }

    let transport = match UdpTransport::new(UdpConfig::new(listen)) {
        Ok(tr) => tr,
        Err(e) => {
            eprintln!("Failed to bind transport on {}: {}", listen, e);
            process::exit(1);
        }
    };
    let mut executor = Executor::new(Box::new(transport));

    let mut image = match program_path {
        Some(path) => {
            let bytes = match std::fs::read(path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    eprintln!("Failed to read {}: {}", path, e);
                    process::exit(1);
                }
            };
            match load_object(&bytes) {
                Ok(image) => image,
                Err(e) => {
                    eprintln!("Failed to load {}: {}", path, e);
                    process::exit(1);
                }
            }
        }
        None => demo_image(),
    };

    for value in &data_values {
        let copied = image.load_data(&value.to_le_bytes());
        if copied != 8 {
            error!("data region full, dropping value {}", value);
        }
    }

    let id = executor.add_vm(image);
    info!("node listening on {}, admitted vm {}", listen, id);

    if oneshot {
        executor.run_until_idle();
    } else {
        executor.run();
    }
}

/// Built-in fallback program: debug_print(10 + 32), then exit.
fn demo_image() -> VmImage {
    let program = assemble(&[
        mov64_imm(1, 10),
        alu64_imm(AluOp::Add, 1, 32),
        call_ext(1),
        exit(),
    ]);
    VmImage::new(&program)
}
