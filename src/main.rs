// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Measure how long VFIO device-descriptor teardown takes under different
//! concurrency shapes: sequential close, one thread per handle, or one
//! forked child per device synchronized by a ready/go rendezvous.

mod barrier;
mod modes;
mod timeline;

use std::io;
use std::process;
use std::sync::Arc;

use clap::{crate_version, Arg, ArgAction, ArgMatches, Command};
use log::{debug, error, info, warn};
use serde::Serialize;
use thiserror::Error;
use vfio_client::{
    IommuType, PciAddress, PciAddressParseError, VfioContainer, VfioDevice, VfioError, VfioGroup,
};

use crate::modes::{Mode, ModeParseError, Target};
use crate::timeline::{Record, Summary, Timeline};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to parse mode: {0}")]
    ParseMode(#[from] ModeParseError),
    #[error("failed to parse device address: {0}")]
    ParseAddress(#[from] PciAddressParseError),
    #[error(transparent)]
    Vfio(#[from] VfioError),
    #[error("failed to set up the release rendezvous: {0}")]
    Rendezvous(#[source] io::Error),
    #[error("failed to fork a release child: {0}")]
    Fork(#[source] io::Error),
    #[error("failed to serialize the timing report: {0}")]
    SerializeReport(#[source] serde_json::Error),
    #[error("failed to write the timing report to {0}: {1}")]
    ReportFile(String, #[source] io::Error),
}

struct Setup {
    container: Arc<VfioContainer>,
    // Groups in attach order, deduplicated; several targets may share one.
    groups: Vec<(u32, Arc<VfioGroup>)>,
    targets: Vec<Target>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = Command::new("vfio-release-bench")
        .version(crate_version!())
        .about("Measure VFIO device descriptor release latency under different concurrency shapes")
        .arg(
            Arg::new("mode")
                .help("Release strategy: exit, close, thread-close or process-close")
                .value_name("MODE")
                .value_parser(["exit", "close", "thread-close", "process-close"])
                .required(true),
        )
        .arg(
            Arg::new("device")
                .help("PCI device address, \"[ssss:]bb[:dd[.f]]\"")
                .value_name("DEVICE")
                .num_args(1..)
                .required(true),
        )
        .arg(
            Arg::new("no-pause")
                .long("no-pause")
                .help("Do not wait for a key press between phases")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("report-file")
                .long("report-file")
                .help("Write a JSON timing report to this path")
                .value_name("PATH"),
        )
        .get_matches();

    if let Err(e) = run(&matches) {
        error!("{e}");
        process::exit(1);
    }
}

fn run(matches: &ArgMatches) -> Result<(), Error> {
    let mode: Mode = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or_default()
        .parse()?;
    let addresses = matches
        .get_many::<String>("device")
        .unwrap_or_default()
        .map(|s| s.parse::<PciAddress>())
        .collect::<Result<Vec<_>, _>>()?;
    let pause = !matches.get_flag("no-pause");

    let setup = setup(&addresses)?;
    let mut timeline = Timeline::new();

    match mode {
        Mode::Exit => {
            let devices = acquire(&setup.targets)?;
            info!("all devices attached");
            if pause {
                wait_for_enter("press enter to exit");
            }
            info!(
                "exiting with {} descriptors open, teardown rides on process exit",
                devices.len()
            );
            // Skipping the drop glue hands every descriptor straight to
            // process teardown.
            process::exit(0);
        }
        Mode::Close => {
            let devices = acquire(&setup.targets)?;
            info!("all devices attached");
            if pause {
                wait_for_enter("press enter to start the release phase");
            }
            modes::sequential_close(devices, &mut timeline);
        }
        Mode::ThreadClose => {
            let devices = acquire(&setup.targets)?;
            info!("all devices attached");
            if pause {
                wait_for_enter("press enter to start the release phase");
            }
            modes::thread_close(devices, &mut timeline);
        }
        Mode::ProcessClose => {
            modes::process_close(&setup.targets, &mut timeline, pause)?;
        }
    }

    let summary = timeline.summary();
    info!(
        "{} timed releases, total wall {} ns, slowest individual release {} ns",
        summary.release_latencies.len(),
        summary.total_wall_ns,
        summary.max_individual_ns
    );

    if let Some(path) = matches.get_one::<String>("report-file") {
        write_report(path, mode, &timeline)?;
    }

    teardown(setup);
    Ok(())
}

/// Walks the attachment protocol: container, then one attach per distinct
/// group, then the IOMMU backend selection once a group is in place.
fn setup(addresses: &[PciAddress]) -> Result<Setup, Error> {
    let container = Arc::new(VfioContainer::new()?);
    info!(
        "container opened, VFIO API version {}",
        container.api_version()
    );

    let mut groups: Vec<(u32, Arc<VfioGroup>)> = Vec::new();
    let mut targets = Vec::new();
    for address in addresses {
        let group_id = VfioGroup::resolve(address)?;
        info!("device {address} resolved to group {group_id}");

        let group = match groups.iter().find(|(id, _)| *id == group_id) {
            Some((_, group)) => Arc::clone(group),
            None => {
                let group = Arc::new(VfioGroup::open(group_id)?);
                let status = group.status()?;
                info!(
                    "group {group_id}: viable {}, container set {}",
                    status.viable, status.container_set
                );
                group.attach(&container)?;
                info!("attached group {group_id} to the container");
                groups.push((group_id, Arc::clone(&group)));
                group
            }
        };
        targets.push(Target {
            address: *address,
            group,
        });
    }

    let supported = container.check_extension(IommuType::Type1);
    info!(
        "{} extension {}present",
        IommuType::Type1,
        if supported { "" } else { "not " }
    );
    container.set_iommu(IommuType::Type1)?;
    info!("selected the {} IOMMU backend", IommuType::Type1);

    Ok(Setup {
        container,
        groups,
        targets,
    })
}

/// Acquires one descriptor per target and prints its metadata, mirroring
/// the in-process half of the protocol.
fn acquire(targets: &[Target]) -> Result<Vec<(PciAddress, VfioDevice)>, Error> {
    let mut devices = Vec::with_capacity(targets.len());
    for target in targets {
        let device = target.group.get_device(&target.address.device_name())?;
        let info = device.info()?;
        info!(
            "device {}: {} regions, {} irqs{}",
            target.address,
            info.num_regions,
            info.num_irqs,
            if info.reset_capable {
                ", reset capable"
            } else {
                ""
            }
        );

        for index in 0..info.num_regions {
            match device.region_info(index) {
                Ok(region) => debug!(
                    "region #{index}: flags 0x{:x}, size 0x{:x}, offset 0x{:x}, {} sparse areas",
                    region.flags,
                    region.size,
                    region.offset,
                    region.sparse_areas.len()
                ),
                Err(e) => warn!("could not get info for region #{index}: {e}"),
            }
        }
        for index in 0..info.num_irqs {
            match device.irq_info(index) {
                Ok(irq) => debug!("irq #{index}: flags 0x{:x}, count {}", irq.flags, irq.count),
                Err(e) => warn!("could not get info for irq #{index}: {e}"),
            }
        }

        devices.push((target.address, device));
    }
    Ok(devices)
}

/// Runs the teardown ladder backwards: detach every group, then close the
/// container. Teardown errors are logged, never fatal, so one failure does
/// not hide the remaining measurements.
fn teardown(setup: Setup) {
    let Setup {
        container,
        groups,
        targets,
    } = setup;
    drop(targets);

    for (group_id, group) in groups {
        if let Err(e) = group.detach() {
            warn!("failed to detach group {group_id}: {e}");
        }
    }

    match Arc::try_unwrap(container) {
        Ok(container) => {
            if let Err(e) = container.close() {
                warn!("container teardown: {e}");
            }
        }
        Err(_) => warn!("container still referenced at teardown, the drop closes it"),
    }
}

pub(crate) fn wait_for_enter(prompt: &str) {
    println!("{prompt}");
    let mut line = String::new();
    let _ = io::stdin().read_line(&mut line);
}

#[derive(Serialize)]
struct Report<'a> {
    mode: String,
    records: &'a [Record],
    summary: Summary,
}

fn write_report(path: &str, mode: Mode, timeline: &Timeline) -> Result<(), Error> {
    let report = Report {
        mode: mode.to_string(),
        records: timeline.records(),
        summary: timeline.summary(),
    };
    let json = serde_json::to_string_pretty(&report).map_err(Error::SerializeReport)?;
    std::fs::write(path, json).map_err(|e| Error::ReportFile(path.to_owned(), e))?;
    info!("wrote timing report to {path}");
    Ok(())
}
