use anyhow::{Context as _, Result};
use clap::Parser;
use outproc_core::instance::InstanceResolver;
use outproc_core::logging::{default_directive, init_tracing, TraceCategories};
use outproc_core::{CommunicatorClient, VERSION_ANY};
use outproc_host::catalog;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const ANNOUNCE_DELAY_ENV: &str = "OUTPROC_HOST_ANNOUNCE_DELAY_MS";
const LINGER_ENV: &str = "OUTPROC_HOST_LINGER_MS";
const ANNOUNCE_TIMEOUT_ENV: &str = "OUTPROC_HOST_ANNOUNCE_TIMEOUT_MS";

/// Serves one object to the communicator that launched it.
#[derive(Debug, Parser)]
#[command(name = "outproc-host", disable_version_flag = true)]
struct HostArgs {
    #[arg(short = 'l', long)]
    locator: String,
    #[arg(short = 'c', long)]
    class_name: String,
    #[arg(short = 'r', long)]
    connector: String,
    #[arg(short = 'i', long)]
    interface: u32,
    #[arg(short = 'v', long)]
    version: Option<u32>,
    #[arg(short = 'u', long)]
    user: Option<String>,
    #[arg(short = 'g', long)]
    group: Option<String>,
    #[arg(short = 'p', long)]
    persistent_path: Option<String>,
    #[arg(short = 's', long)]
    system_path: Option<String>,
    #[arg(short = 'd', long)]
    data_path: Option<String>,
    #[arg(short = 'a', long)]
    application_path: Option<String>,
    #[arg(short = 'm', long)]
    proxy_stub_path: Option<String>,
}

fn main() -> Result<()> {
    let args = HostArgs::parse();
    let trace = init_tracing(&default_directive());

    switch_identity(args.user.as_deref(), args.group.as_deref())?;
    if let Some(delay) = env_millis(ANNOUNCE_DELAY_ENV) {
        thread::sleep(delay);
    }

    debug!(
        persistent = ?args.persistent_path,
        system = ?args.system_path,
        data = ?args.data_path,
        application = ?args.application_path,
        proxy_stubs = ?args.proxy_stub_path,
        "host paths"
    );

    let registry = Arc::new(catalog::catalog_for(&args.locator)?);
    let version = args.version.unwrap_or(VERSION_ANY);
    let implementation = registry
        .instance(&args.class_name, args.interface, version)
        .with_context(|| {
            format!(
                "no implementation of {} (interface {:#x}) in {}",
                args.class_name, args.interface, args.locator
            )
        })?;

    let timeout = env_millis(ANNOUNCE_TIMEOUT_ENV).unwrap_or(Duration::from_secs(3));
    let client = CommunicatorClient::new(args.connector.clone(), registry);
    let reply = client
        .open_offer(timeout, args.interface, implementation)
        .with_context(|| format!("announce to {}", args.connector))?;
    info!(
        pid = client.exchange_id(),
        class = %args.class_name,
        %implementation,
        "announced"
    );

    match TraceCategories::parse(&reply.trace_categories).and_then(|categories| trace.apply(&categories)) {
        Ok(applied) => debug!(applied, "trace categories"),
        Err(err) => warn!("trace categories ignored: {err:#}"),
    }

    client.wait_for_termination(None);
    info!(pid = client.exchange_id(), "termination requested");

    if let Some(linger) = env_millis(LINGER_ENV) {
        thread::sleep(linger);
    }
    client.close();
    Ok(())
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(unix)]
fn switch_identity(user: Option<&str>, group: Option<&str>) -> Result<()> {
    use nix::unistd::{setgid, setuid, Group, User};

    // group first, setgid is no longer allowed once the uid changed
    if let Some(name) = group.filter(|name| !name.is_empty()) {
        let group = Group::from_name(name)
            .with_context(|| format!("look up group: {name}"))?
            .with_context(|| format!("unknown group: {name}"))?;
        setgid(group.gid).with_context(|| format!("switch to group: {name}"))?;
    }
    if let Some(name) = user.filter(|name| !name.is_empty()) {
        let user = User::from_name(name)
            .with_context(|| format!("look up user: {name}"))?
            .with_context(|| format!("unknown user: {name}"))?;
        setuid(user.uid).with_context(|| format!("switch to user: {name}"))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn switch_identity(user: Option<&str>, group: Option<&str>) -> Result<()> {
    if user.is_some() || group.is_some() {
        warn!("user and group switching is not supported on this platform");
    }
    Ok(())
}
