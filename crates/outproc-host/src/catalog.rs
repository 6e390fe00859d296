use anyhow::{bail, Result};
use outproc_core::instance::{InstanceRegistry, Interface};
use std::time::Instant;

pub const BUILTIN_LOCATOR: &str = "builtin";

pub struct EchoInterface;

impl Interface for EchoInterface {
    const ID: u32 = 0x0000_0051;
    const NAME: &'static str = "IEcho";
}

pub struct ClockInterface;

impl Interface for ClockInterface {
    const ID: u32 = 0x0000_0052;
    const NAME: &'static str = "IClock";
}

#[derive(Debug)]
pub struct Echo {
    prefix: &'static str,
}

impl Echo {
    pub fn echo(&self, text: &str) -> String {
        format!("{}{text}", self.prefix)
    }
}

#[derive(Debug)]
pub struct Clock {
    started: Instant,
}

impl Clock {
    pub fn uptime_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}

/// Objects this host can serve for `locator`.
pub fn catalog_for(locator: &str) -> Result<InstanceRegistry> {
    match locator {
        BUILTIN_LOCATOR => Ok(builtin()),
        other => bail!("unknown locator: {other}"),
    }
}

fn builtin() -> InstanceRegistry {
    let registry = InstanceRegistry::new();
    registry.register::<EchoInterface, _, _>("Echo", 1, || Echo { prefix: "" });
    registry.register::<EchoInterface, _, _>("Echo", 2, || Echo { prefix: "echo: " });
    registry.register::<ClockInterface, _, _>("Clock", 1, || Clock {
        started: Instant::now(),
    });
    registry
}
