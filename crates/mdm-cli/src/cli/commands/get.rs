//! `mdm get <uri>...` – run downloads to completion and print a results table.

use anyhow::{bail, Context, Result};
use mdm_core::config::MdmConfig;
use mdm_core::engine::{HaltLatch, HaltStage, Scheduler};
use mdm_core::group::{DownloadRequest, DownloadResult};
use mdm_core::registry::GroupRegistry;
use mdm_core::transfer::CurlPoll;

use crate::cli::GetArgs;

pub fn run_get(mut cfg: MdmConfig, args: GetArgs) -> Result<i32> {
    apply_overrides(&mut cfg, &args);
    let requests = build_requests(&args)?;

    let mut registry = GroupRegistry::new(cfg.max_concurrent_downloads);
    for req in requests {
        let gid = registry.create_group(req, &cfg);
        tracing::debug!(gid = %gid, "queued from command line");
    }

    let latch = HaltLatch::new();
    let handler_latch = latch.clone();
    ctrlc::set_handler(move || match handler_latch.signal() {
        HaltStage::Graceful => eprintln!("\nstopping, saving progress (Ctrl-C again to force)"),
        _ => eprintln!("\nforce stopping"),
    })
    .context("install Ctrl-C handler")?;

    let mut scheduler = Scheduler::new(registry, CurlPoll::new(), cfg).with_halt_latch(latch);
    scheduler.run();

    let registry = scheduler.into_registry();
    print_results(registry.finished_results());
    let stat = registry.download_stat();
    if stat.waiting > 0 {
        println!("{} download(s) not started", stat.waiting);
    }
    Ok(stat.exit_code())
}

fn apply_overrides(cfg: &mut MdmConfig, args: &GetArgs) {
    if let Some(n) = args.split {
        cfg.split = n as usize;
    }
    if let Some(n) = args.max_concurrent_downloads {
        cfg.max_concurrent_downloads = n as usize;
    }
    if let Some(fa) = args.file_allocation {
        cfg.file_allocation = fa;
    }
    if args.allow_overwrite {
        cfg.allow_overwrite = true;
    }
    if let Some(limit) = args.max_overall_download_limit {
        cfg.max_overall_download_limit = limit;
    }
}

fn build_requests(args: &GetArgs) -> Result<Vec<DownloadRequest>> {
    let dir = match &args.dir {
        Some(d) => d.clone(),
        None => std::env::current_dir().context("current directory")?,
    };
    let one = |uris: Vec<String>| DownloadRequest {
        uris,
        dir: dir.clone(),
        out: args.out.clone(),
        sha256: args.checksum.clone(),
        split: None,
    };
    if !args.force_sequential {
        return Ok(vec![one(args.uris.clone())]);
    }
    if args.uris.len() > 1 && (args.out.is_some() || args.checksum.is_some()) {
        bail!("--out and --checksum apply to a single download; drop them or -Z");
    }
    Ok(args.uris.iter().map(|u| one(vec![u.clone()])).collect())
}

fn print_results(results: &[DownloadResult]) {
    if results.is_empty() {
        return;
    }
    println!();
    println!("Download Results:");
    println!("{:<16}|{:<8}|{:>11}|path/URI", "gid", "stat", "avg speed");
    for r in results {
        let target = match &r.path {
            Some(p) => p.display().to_string(),
            None => r.uris.first().cloned().unwrap_or_default(),
        };
        println!(
            "{:<16}|{:<8}|{:>11}|{}",
            r.gid,
            r.code.as_str(),
            format_speed(r.avg_speed),
            target
        );
        if !r.message.is_empty() {
            println!("{:<16} {}", "", r.message);
        }
    }
}

/// Bytes per second, scaled to the largest binary unit below 1024.
pub(crate) fn format_speed(bytes_per_sec: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes_per_sec as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes_per_sec}B/s")
    } else {
        format!("{value:.1}{}/s", UNITS[unit])
    }
}
