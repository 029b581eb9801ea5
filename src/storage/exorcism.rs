//! The "exorcism" sequence: before a zvol backing a destroyed VM is
//! reclaimed, release anything the kernel still thinks is attached to its
//! block device (a stray LVM PV, a mounted filesystem, a lingering
//! partition table) so `zfs destroy` never hangs on "dataset is busy".
//! Every step is best-effort: a failure is logged and the sequence
//! continues, because by this point the VM is already gone and the goal
//! is to reclaim the disk, not to prove a negative about its contents.

use log::warn;
use std::path::Path;
use std::process::Command;

fn run_best_effort(program: &str, args: &[&str]) {
    match Command::new(program).args(args).output() {
        Ok(output) if !output.status.success() => {
            warn!(
                "exorcism step `{} {}` exited non-zero: {}",
                program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Err(e) => {
            warn!("exorcism step `{} {}` could not run: {}", program, args.join(" "), e);
        }
        Ok(_) => {}
    }
}

/// Runs the full device-release sequence against `device_path` prior to
/// `zfs destroy`. Idempotent and safe to call on a device that was never
/// touched by LVM/partitioning in the first place.
pub fn exorcise(device_path: &Path) {
    let device = device_path.to_string_lossy().into_owned();

    run_best_effort("fuser", &["-k", &device]);
    run_best_effort("vgchange", &["-an"]);
    run_best_effort("pvs", &[]);
    run_best_effort("wipefs", &["-a", &device]);
    run_best_effort(
        "dd",
        &[
            "if=/dev/zero",
            &format!("of={}", device),
            "bs=1M",
            "count=10",
        ],
    );
    run_best_effort("kpartx", &["-d", &device]);
    run_best_effort("partx", &["-d", &device]);
    run_best_effort("partprobe", &[&device]);
    run_best_effort("udevadm", &["settle"]);
}
