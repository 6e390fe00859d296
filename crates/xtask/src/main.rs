use anyhow::{bail, Context as _, Result};
use outproc_core::instance::NoInstances;
use outproc_core::logging::{default_directive, init_tracing};
use outproc_core::settings::{load_settings, CommunicatorSettings, HOST_BIN_ENV};
use outproc_core::{Communicator, Object};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessStatus, System};

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_help();
        return Ok(());
    };

    match cmd.as_str() {
        "smoke" => cmd_smoke(args.collect()),
        "gate" => cmd_gate(args.collect()),
        "help" | "-h" | "--help" => {
            print_help();
            Ok(())
        }
        other => {
            print_help();
            bail!("unknown xtask command: {other}");
        }
    }
}

fn print_help() {
    eprintln!(
        r#"xtask (outproc)

Commands:
  smoke   Launch hosts through a communicator, destroy them, check for leaks
  gate    Run tests and checks for every crate in the workspace

Examples:
  cargo build -p outproc-host
  cargo run -p xtask -- smoke --processes 8 --class Echo
  cargo run -p xtask -- smoke --host target/debug/outproc-host --config ./config
  cargo run -p xtask -- gate
"#
    );
}

struct SmokeArgs {
    processes: usize,
    class_name: String,
    interface_id: u32,
    host: Option<String>,
    config_dir: Option<PathBuf>,
    wait_ms: u64,
}

fn cmd_smoke(args: Vec<String>) -> Result<()> {
    let args = parse_smoke_args(args)?;
    init_tracing(&default_directive());

    let mut settings = match &args.config_dir {
        Some(dir) => load_settings(dir)?,
        None => CommunicatorSettings::default(),
    };
    if let Some(host) = args.host.clone() {
        settings.host_application = host;
    } else if std::env::var(HOST_BIN_ENV).is_err() {
        settings.host_application = default_host_path()?.to_string_lossy().to_string();
    }
    eprintln!("host: {}", settings.host_application);

    let communicator =
        Communicator::new(settings, Arc::new(NoInstances)).context("create communicator")?;
    let addr = communicator.open().context("open channel server")?;
    eprintln!("listening: {addr}");

    let object = Object::new("builtin", args.class_name.clone()).with_interface(args.interface_id);
    let wait = Duration::from_millis(args.wait_ms);
    let mut launched = Vec::with_capacity(args.processes);
    let mut announce_ms = Vec::with_capacity(args.processes);

    for ix in 0..args.processes {
        let started = Instant::now();
        let (pid, implementation) = communicator
            .instantiate(&object, wait)
            .with_context(|| format!("instantiate #{ix}"))?;
        announce_ms.push(started.elapsed().as_millis());
        if implementation.is_none() {
            bail!("process {pid} announced without an implementation");
        }
        let process = communicator
            .process(pid)
            .with_context(|| format!("process {pid} missing after announce"))?;
        launched.push(process);
    }

    eprintln!(
        "announce_ms: p50={} p95={} max={}",
        percentile_ms(&announce_ms, 50.0),
        percentile_ms(&announce_ms, 95.0),
        announce_ms.iter().copied().max().unwrap_or(0)
    );

    let started = Instant::now();
    for process in &launched {
        communicator.destroy(process.id())?;
    }

    let deadline = Instant::now() + wait;
    while launched.iter().any(|process| process.is_active()) {
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    eprintln!("exit_ms: {}", started.elapsed().as_millis());

    let pids = launched.iter().map(|process| process.id()).collect::<Vec<_>>();
    let leaked = leaked_pids(&pids);
    communicator.shutdown()?;

    if !leaked.is_empty() {
        bail!("host processes still running: {leaked:?}");
    }
    eprintln!("smoke: OK ({} processes)", pids.len());
    Ok(())
}

fn parse_smoke_args(args: Vec<String>) -> Result<SmokeArgs> {
    let mut processes: usize = 4;
    let mut class_name = "Echo".to_string();
    let mut interface_id: u32 = 0x51;
    let mut host: Option<String> = None;
    let mut config_dir: Option<PathBuf> = None;
    let mut wait_ms: u64 = 5000;
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--processes" | "-n" => {
                let raw = it.next().context("--processes requires a value")?;
                processes = raw
                    .parse::<usize>()
                    .with_context(|| format!("invalid --processes: {raw}"))?;
            }
            "--class" => class_name = it.next().context("--class requires a value")?,
            "--interface" => {
                let raw = it.next().context("--interface requires a value")?;
                interface_id = raw
                    .parse::<u32>()
                    .with_context(|| format!("invalid --interface: {raw}"))?;
            }
            "--host" => host = Some(it.next().context("--host requires a value")?),
            "--config" => {
                config_dir = Some(PathBuf::from(it.next().context("--config requires a value")?))
            }
            "--wait-ms" => {
                let raw = it.next().context("--wait-ms requires a value")?;
                wait_ms = raw
                    .parse::<u64>()
                    .with_context(|| format!("invalid --wait-ms: {raw}"))?;
            }
            other => bail!("unknown smoke arg: {other}"),
        }
    }

    Ok(SmokeArgs {
        processes: processes.max(1),
        class_name,
        interface_id,
        host,
        config_dir,
        wait_ms: wait_ms.max(100),
    })
}

fn cmd_gate(args: Vec<String>) -> Result<()> {
    if let Some(other) = args.first() {
        bail!("unknown gate arg: {other}");
    }
    let workspace_root = workspace_root()?;

    run_command_step(
        "core-tests",
        &workspace_root,
        "cargo",
        &["test", "-p", "outproc-core"],
    )?;
    run_command_step(
        "host-tests",
        &workspace_root,
        "cargo",
        &["test", "-p", "outproc-host"],
    )?;
    run_command_step(
        "xtask-check",
        &workspace_root,
        "cargo",
        &["check", "-p", "xtask"],
    )?;
    run_command_step(
        "host-build",
        &workspace_root,
        "cargo",
        &["build", "-p", "outproc-host"],
    )?;
    run_command_step(
        "smoke",
        &workspace_root,
        "cargo",
        &["run", "-p", "xtask", "--", "smoke", "--processes", "4"],
    )?;

    eprintln!("gate: OK");
    Ok(())
}

fn workspace_root() -> Result<PathBuf> {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .canonicalize()
        .context("resolve workspace root")
}

fn default_host_path() -> Result<PathBuf> {
    #[cfg(target_os = "windows")]
    let name = "outproc-host.exe";
    #[cfg(not(target_os = "windows"))]
    let name = "outproc-host";

    let path = workspace_root()?.join("target").join("debug").join(name);
    if !path.exists() {
        bail!(
            "host binary not found at {} (run `cargo build -p outproc-host` or pass --host)",
            path.display()
        );
    }
    Ok(path)
}

fn run_command_step(name: &str, cwd: &std::path::Path, program: &str, args: &[&str]) -> Result<()> {
    eprintln!("\n==> [{name}] {program} {}", args.join(" "));
    let status = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .status()
        .with_context(|| format!("spawn step failed: {name}"))?;
    if !status.success() {
        bail!("step failed: {name}");
    }
    Ok(())
}

fn leaked_pids(pids: &[u32]) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes();
    pids.iter()
        .copied()
        .filter(|pid| {
            system
                .process(Pid::from_u32(*pid))
                .map(|process| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
                .unwrap_or(false)
        })
        .collect()
}

fn percentile_ms(samples: &[u128], percentile: f64) -> u128 {
    if samples.is_empty() {
        return 0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();

    let rank = ((percentile / 100.0) * ((sorted.len() - 1) as f64)).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}
