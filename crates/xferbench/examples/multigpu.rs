//! Overlapped vector addition across two devices.
//!
//! Splits `C = A + B` between devices 0 and 1, issuing copies and kernels
//! asynchronously on one queue per device so the two halves execute
//! concurrently. Prints the error sum over the result and the elapsed time
//! measured on device 0's timeline.

use std::process::ExitCode;
use xferbench::{
    run_pipeline, AcceleratorRuntime, HostBuffers, PipelineConfig, Result, RuntimeError,
};

const N: usize = 100;

#[cfg(feature = "cuda")]
fn runtime() -> Result<xferbench::CudaRuntime> {
    xferbench::CudaRuntime::new()
}

#[cfg(not(feature = "cuda"))]
fn runtime() -> Result<xferbench::HostRuntime> {
    Ok(xferbench::HostRuntime::new(2))
}

fn run() -> Result<()> {
    let runtime = runtime()?;
    let available = AcceleratorRuntime::<f64>::device_count(&runtime);
    if available < 2 {
        return Err(RuntimeError::not_enough_devices(2, available));
    }
    println!("Found {available} devices, using devices 0 and 1!");

    let config = PipelineConfig::new(N);
    let mut host = HostBuffers::filled(N, 1.0_f64, 2.0);
    let report = run_pipeline(&runtime, &config, &mut host)?;

    let errorsum: f64 = host.c.iter().map(|&v| v - 3.0).sum();
    println!("Error sum = {errorsum}");
    println!("Time elapsed: {:.6}", report.elapsed.as_secs_f64());
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("multigpu: {err}");
            ExitCode::FAILURE
        }
    }
}
