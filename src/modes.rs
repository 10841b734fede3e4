// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use std::io;
use std::process;
use std::str::FromStr;
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

use log::{error, info, warn};
use vfio_client::{PciAddress, VfioDevice, VfioGroup};

use crate::barrier::Rendezvous;
use crate::timeline::{Phase, Record, Timeline};
use crate::{wait_for_enter, Error};

#[derive(Debug, thiserror::Error)]
#[error("unknown mode {0:?}, expected exit, close, thread-close or process-close")]
pub struct ModeParseError(String);

/// Release strategy exercised after the setup phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Leave every descriptor to process teardown.
    Exit,
    /// Close devices one at a time, in acquisition order.
    Close,
    /// Close devices concurrently from one thread per handle.
    ThreadClose,
    /// Close devices concurrently from one forked child per device.
    ProcessClose,
}

impl FromStr for Mode {
    type Err = ModeParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "exit" => Ok(Mode::Exit),
            "close" => Ok(Mode::Close),
            "thread-close" => Ok(Mode::ThreadClose),
            "process-close" => Ok(Mode::ProcessClose),
            _ => Err(ModeParseError(s.to_owned())),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Mode::Exit => write!(f, "exit"),
            Mode::Close => write!(f, "close"),
            Mode::ThreadClose => write!(f, "thread-close"),
            Mode::ProcessClose => write!(f, "process-close"),
        }
    }
}

/// One benched device: its address and the (possibly shared) group it is
/// sourced from.
pub struct Target {
    pub address: PciAddress,
    pub group: Arc<VfioGroup>,
}

/// Releases every handle in acquisition order. Total latency is the sum of
/// the individual latencies.
pub fn sequential_close(devices: Vec<(PciAddress, VfioDevice)>, timeline: &mut Timeline) {
    info!("closing devices in a sequential loop");
    for (address, mut device) in devices {
        let participant = address.to_string();
        timeline.stamp(&participant, Phase::ReleaseRequested);
        let result = device.release();
        timeline.stamp(&participant, Phase::ReleaseCompleted);
        if let Err(e) = result {
            warn!("{participant}: release failed: {e}");
        }
    }
}

/// Releases every handle from its own thread. A start barrier keeps the
/// cohort's release calls inside a bounded skew window, and the driver waits
/// for the whole cohort rather than joining as releases complete.
pub fn thread_close(devices: Vec<(PciAddress, VfioDevice)>, timeline: &mut Timeline) {
    info!("closing {} devices concurrently from threads", devices.len());
    let origin = timeline.origin();
    let start = Arc::new(Barrier::new(devices.len()));
    let (sender, receiver) = mpsc::channel();

    timeline.stamp("parent", Phase::CohortStarted);

    let mut workers = Vec::with_capacity(devices.len());
    for (address, mut device) in devices {
        let start = Arc::clone(&start);
        let sender = sender.clone();
        workers.push(thread::spawn(move || {
            let participant = address.to_string();
            start.wait();
            let requested = Record::taken(origin, &participant, Phase::ReleaseRequested);
            let result = device.release();
            let completed = Record::taken(origin, &participant, Phase::ReleaseCompleted);
            if let Err(e) = result {
                warn!("{participant}: release failed: {e}");
            }
            // The receiver only disappears if the driver already bailed out.
            let _ = sender.send(requested);
            let _ = sender.send(completed);
        }));
    }
    drop(sender);

    for worker in workers {
        if worker.join().is_err() {
            error!("a release worker panicked");
        }
    }
    for record in receiver {
        timeline.push(record);
    }

    timeline.stamp("parent", Phase::CohortDrained);
}

/// Releases every device from its own forked child.
///
/// Children are forked before any device is acquired; each child requests
/// its own descriptor from the inherited group, so no descriptor ownership
/// crosses an address-space boundary. A two-phase ready/go rendezvous per
/// child gates the timed close, and a second round gates child exit so the
/// parent can take the cohort timestamps in between.
///
/// Children print their own per-release records; the parent's timeline (and
/// hence the JSON report) carries the cohort-level records only.
pub fn process_close(
    targets: &[Target],
    timeline: &mut Timeline,
    pause: bool,
) -> std::result::Result<(), Error> {
    info!("closing {} devices concurrently from forked children", targets.len());
    let mut cohort = Vec::with_capacity(targets.len());
    for _ in targets {
        cohort.push(Rendezvous::new().map_err(Error::Rendezvous)?);
    }

    let mut children = Vec::with_capacity(targets.len());
    for (target, rendezvous) in targets.iter().zip(cohort.iter()) {
        // SAFETY: the driver is single threaded at this point and the child
        // only touches inherited descriptors and its own memory.
        match unsafe { libc::fork() } {
            -1 => return Err(Error::Fork(io::Error::last_os_error())),
            0 => child_close(target, rendezvous, timeline.origin()),
            pid => children.push((pid, target.address)),
        }
    }

    for rendezvous in &cohort {
        rendezvous.wait_ready().map_err(Error::Rendezvous)?;
    }
    info!("all children hold their device descriptors");
    if pause {
        wait_for_enter("press enter to start the concurrent release");
    }

    timeline.stamp("parent", Phase::CohortStarted);
    for rendezvous in &cohort {
        rendezvous.release().map_err(Error::Rendezvous)?;
    }
    for rendezvous in &cohort {
        rendezvous.wait_ready().map_err(Error::Rendezvous)?;
    }
    timeline.stamp("parent", Phase::CohortDrained);

    if pause {
        wait_for_enter("press enter to let the children exit");
    }
    for rendezvous in &cohort {
        rendezvous.release().map_err(Error::Rendezvous)?;
    }

    for (pid, address) in children {
        let mut status = 0;
        // SAFETY: pid came from fork and has not been reaped yet.
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret < 0 {
            warn!(
                "waitpid for the child releasing {address} failed: {}",
                io::Error::last_os_error()
            );
        } else if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) != 0 {
            warn!(
                "child releasing {address} exited with status {}",
                libc::WEXITSTATUS(status)
            );
        }
    }

    Ok(())
}

fn child_close(target: &Target, rendezvous: &Rendezvous, origin: Instant) -> ! {
    let participant = target.address.to_string();
    let mut code = 0;

    match target.group.get_device(&target.address.device_name()) {
        Ok(mut device) => {
            if let Ok(info) = device.info() {
                info!(
                    "{participant}: device has {} regions, {} irqs",
                    info.num_regions, info.num_irqs
                );
            }
            if rendezvous
                .arrive()
                .and_then(|_| rendezvous.wait_go())
                .is_err()
            {
                process::exit(1);
            }

            Record::taken(origin, &participant, Phase::ReleaseRequested);
            let result = device.release();
            Record::taken(origin, &participant, Phase::ReleaseCompleted);
            if let Err(e) = result {
                warn!("{participant}: release failed: {e}");
                code = 1;
            }

            let _ = rendezvous.arrive();
            let _ = rendezvous.wait_go();
        }
        Err(e) => {
            error!("{participant}: failed to acquire device: {e}");
            code = 1;
            // Keep both handshake rounds alive so the parent never blocks on
            // a dead child.
            let _ = rendezvous.arrive();
            let _ = rendezvous.wait_go();
            let _ = rendezvous.arrive();
            let _ = rendezvous.wait_go();
        }
    }

    process::exit(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("exit".parse::<Mode>().unwrap(), Mode::Exit);
        assert_eq!("close".parse::<Mode>().unwrap(), Mode::Close);
        assert_eq!("thread-close".parse::<Mode>().unwrap(), Mode::ThreadClose);
        assert_eq!("process-close".parse::<Mode>().unwrap(), Mode::ProcessClose);
        assert!("open".parse::<Mode>().is_err());
        assert!("".parse::<Mode>().is_err());
    }

    #[test]
    fn test_mode_display_round_trip() {
        for mode in [Mode::Exit, Mode::Close, Mode::ThreadClose, Mode::ProcessClose] {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
        }
    }
}
