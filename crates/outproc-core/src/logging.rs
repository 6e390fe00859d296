use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Tracing filter directives exchanged during the announce, serialized as a
/// JSON array such as `["info","outproc_core=debug"]`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceCategories(pub Vec<String>);

impl TraceCategories {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw).with_context(|| format!("parse trace categories: {raw}"))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|category| category.trim().is_empty())
    }

    pub fn directive(&self) -> Option<String> {
        let parts = self
            .0
            .iter()
            .map(|category| category.trim())
            .filter(|category| !category.is_empty())
            .collect::<Vec<_>>();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(","))
        }
    }
}

/// Lets a running process swap its filter once it learns the categories it
/// should trace.
pub struct TraceControl {
    handle: Option<reload::Handle<EnvFilter, Registry>>,
}

impl TraceControl {
    pub fn is_installed(&self) -> bool {
        self.handle.is_some()
    }

    pub fn apply(&self, categories: &TraceCategories) -> Result<bool> {
        let Some(handle) = &self.handle else {
            return Ok(false);
        };
        let Some(directive) = categories.directive() else {
            return Ok(false);
        };

        let filter = EnvFilter::try_new(&directive)
            .with_context(|| format!("invalid trace directive: {directive}"))?;
        handle.reload(filter).context("reload tracing filter")?;
        tracing::debug!(%directive, "trace categories applied");
        Ok(true)
    }
}

pub fn default_directive() -> String {
    std::env::var("RUST_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

pub fn init_tracing(directive: &str) -> TraceControl {
    let env_filter = EnvFilter::try_new(directive)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(env_filter);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();

    // try_init so a second call (tests, embedding hosts) is harmless
    match installed {
        Ok(()) => TraceControl {
            handle: Some(handle),
        },
        Err(_) => {
            tracing::debug!("global tracing subscriber already initialized, skipping");
            TraceControl { handle: None }
        }
    }
}
