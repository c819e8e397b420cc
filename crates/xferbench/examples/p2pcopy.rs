//! Device-to-device copy bandwidth with and without the peer fast path.
//!
//! Copies one buffer from device 1 to device 0 repeatedly, first over the
//! direct peer route (when both directions are accessible), then staged
//! through host memory, and prints the achieved bandwidth of each.

use std::process::ExitCode;
use xferbench::{
    run_peer_copy, AcceleratorRuntime, DeviceId, PeerCopyConfig, PeerCopyReport, PeerPath, Result,
    RuntimeError,
};

// 2^28 bytes of i32.
const LEN: usize = 1 << 26;

#[cfg(feature = "cuda")]
fn runtime() -> Result<xferbench::CudaRuntime> {
    xferbench::CudaRuntime::new()
}

#[cfg(not(feature = "cuda"))]
fn runtime() -> Result<xferbench::HostRuntime> {
    Ok(xferbench::HostRuntime::new(2))
}

fn print_report(label: &str, report: &PeerCopyReport) {
    println!(
        "{label} - Bandwidth: {:.3} (GB/s), Time: {:.3} s",
        report.bandwidth_gbps(),
        report.elapsed.as_secs_f64()
    );
}

fn run() -> Result<()> {
    let runtime = runtime()?;
    let available = AcceleratorRuntime::<i32>::device_count(&runtime);
    if available < 2 {
        return Err(RuntimeError::not_enough_devices(2, available));
    }

    let (gpu0, gpu1) = (DeviceId(0), DeviceId(1));
    let access01 = AcceleratorRuntime::<i32>::can_access_peer(&runtime, gpu0, gpu1)?;
    let access10 = AcceleratorRuntime::<i32>::can_access_peer(&runtime, gpu1, gpu0)?;
    println!("peer access {gpu1} -> {gpu0}: {access01}");
    println!("peer access {gpu0} -> {gpu1}: {access10}");

    let config = PeerCopyConfig::new(LEN);
    if access01 && access10 {
        let report = run_peer_copy::<i32, _>(&runtime, &config, gpu1, gpu0, PeerPath::Direct)?;
        print_report("P2P enabled", &report);
    }
    let report = run_peer_copy::<i32, _>(&runtime, &config, gpu1, gpu0, PeerPath::Staged)?;
    print_report("P2P disabled", &report);
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("p2pcopy: {err}");
            ExitCode::FAILURE
        }
    }
}
