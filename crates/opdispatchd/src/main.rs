//! `opworker`: one supervised worker process.

use std::env;
use std::process::ExitCode;

use opdispatchd::{WorkerExit, run_worker};

fn main() -> ExitCode {
    match run_worker(env::args_os()) {
        Ok(WorkerExit::MemoryGrowth | WorkerExit::Disconnected | WorkerExit::Stopped) => {
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("opworker: {error}");
            ExitCode::FAILURE
        }
    }
}
