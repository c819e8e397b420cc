//! Two-rank ping-pong over the in-process transport.
//!
//! Takes the vector length as its single argument, then times three round
//! trips: host-to-host, device-to-device with the transport carrying the
//! device buffer directly, and device-to-device staged through host memory
//! by each rank. Each variant re-seeds the data with ones and checks that
//! every element came back incremented exactly once.

use std::process::ExitCode;
use xferbench::{
    run_ping_pong, AcceleratorRuntime, PingPongConfig, Result, RuntimeError, TransportPath,
};

#[cfg(feature = "cuda")]
fn runtime() -> Result<xferbench::CudaRuntime> {
    xferbench::CudaRuntime::new()
}

#[cfg(not(feature = "cuda"))]
fn runtime() -> Result<xferbench::HostRuntime> {
    Ok(xferbench::HostRuntime::new(2))
}

fn run() -> Result<()> {
    let n: usize = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .ok_or_else(|| {
            RuntimeError::invalid_config("N", "pass the vector length as the only argument")
        })?;

    let runtime = runtime()?;
    let available = AcceleratorRuntime::<f64>::device_count(&runtime);
    if available < 2 {
        return Err(RuntimeError::not_enough_devices(2, available));
    }

    let config = PingPongConfig::new(n);
    for (label, path) in [
        ("CPU-CPU", TransportPath::Host),
        ("GPU-GPU direct", TransportPath::Direct),
        ("GPU-GPU staged", TransportPath::Staged),
    ] {
        let report = run_ping_pong::<f64, _>(&runtime, &config, path)?;
        println!(
            "{label} time {:.6}, errorsum {}",
            report.elapsed.as_secs_f64(),
            report.errorsum(2.0)
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("pingpong: {err}");
            ExitCode::FAILURE
        }
    }
}
