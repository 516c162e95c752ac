//! `isolite-host`: the isolated host process started by a supervisor.

use std::time::Duration;

use clap::Parser;

use isolite::host::{self, BuiltinEntry, HostArgs, HostEnvironment, alloc::CountingAllocator};

#[global_allocator]
static ALLOC: CountingAllocator = CountingAllocator::new();

/// Exit code of the `crash` step.
const CRASH_EXIT_CODE: i32 = 666;

/// Demonstration workload. Steps run in order:
/// `crash` exits the process, `throw` fails, `sleepN` sleeps N ms and
/// `returnN` sets the result. Returns the last result.
fn sample_run(args: &[String]) -> i32 {
    let mut result = 0;
    for arg in args {
        if arg == "crash" {
            std::process::exit(CRASH_EXIT_CODE);
        } else if arg == "throw" {
            panic!("sample.run was asked to throw");
        } else if let Some(ms) = arg.strip_prefix("sleep") {
            if let Ok(ms) = ms.parse::<u64>() {
                std::thread::sleep(Duration::from_millis(ms));
            }
        } else if let Some(value) = arg.strip_prefix("return") {
            if let Ok(value) = value.parse::<i32>() {
                result = value;
            }
        }
    }
    result
}

inventory::submit!(BuiltinEntry::new("sample", "run", sample_run));

fn main() -> anyhow::Result<()> {
    let args = HostArgs::parse();
    host::run(args, HostEnvironment::from_env())
}
