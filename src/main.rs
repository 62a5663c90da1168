use std::process::ExitCode;

use carat::{diagnostics, Carat, Config, RegionBackend};
use clap::{Parser, Subcommand};
use rand::{rngs::StdRng, SeedableRng};

#[derive(Parser, Debug)]
#[command(name = "carat", version, about = "CARAT relocation runtime self-checks")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Region tracker backend: list, tree or splay
    #[arg(long, global = true)]
    backend: Option<RegionBackend>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Track a few allocations and escapes, then print the allocation map
    Dump,
    /// Perform randomized relocations of live allocations and verify them
    Stress {
        #[arg(short = 'n', long, default_value_t = 1000)]
        iterations: usize,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Run the region protection scenario against a fresh address space
    ProtectSanity,
    /// Time the address and stack guards and print the protection counters
    ProtectionProfile {
        #[arg(short = 'n', long, default_value_t = 10000)]
        iterations: usize,
    },
}

fn dump(carat: &Carat) -> bool {
    let mut storage = vec![0usize; 32];
    let base = storage.as_mut_ptr() as usize;
    let runtime = carat.runtime();
    runtime.on_allocate(base, 64);
    runtime.on_allocate(base + 64, 128);
    storage[16] = base + 8;
    runtime.on_escaping_store(base + 128, base + 8);
    runtime.drain_escape_window();
    print!("{}", diagnostics::dump_allocation_map(runtime));
    print!("{}", runtime.statistics());
    runtime.on_deallocate(base);
    runtime.on_deallocate(base + 64);
    true
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = Config::from_env();
    config.verbose |= cli.verbose;
    if let Some(backend) = cli.backend {
        config.region_backend = backend;
    }
    let level = if config.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let carat = Carat::boot(config);
    let passed = match cli.command {
        Command::Dump => dump(&carat),
        Command::Stress { iterations, seed } => {
            let seed = seed.unwrap_or_else(rand::random);
            log::info!("carat: stress with seed {}", seed);
            let mut rng = StdRng::seed_from_u64(seed);
            let report = diagnostics::stress(carat.engine(), iterations, &mut rng);
            for failure in &report.failures {
                eprintln!("FAIL {}", failure);
            }
            println!(
                "stress: {} iterations, {} moves, {} escapes patched: {}",
                report.iterations,
                report.moves,
                report.escapes_patched,
                if report.passed() { "PASS" } else { "FAIL" }
            );
            report.passed()
        }
        Command::ProtectSanity => match diagnostics::protection_sanity(&carat) {
            Ok(()) => {
                println!("carat-protect-sanity: PASS");
                true
            }
            Err(e) => {
                eprintln!("carat-protect-sanity: FAIL {}", e);
                false
            }
        },
        Command::ProtectionProfile { iterations } => {
            match diagnostics::protection_profile(&carat, iterations) {
                Ok(stats) => {
                    println!("guard_address_calls: {}", stats.guard_address_calls);
                    println!("guard_stack_calls: {}", stats.guard_stack_calls);
                    if let Some(avg) = stats.average_request_permission_nanos() {
                        println!("average request_permission_time: {}ns", avg);
                    }
                    true
                }
                Err(e) => {
                    eprintln!("protection-profile: FAIL {}", e);
                    false
                }
            }
        }
    };
    carat.shutdown();

    if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
