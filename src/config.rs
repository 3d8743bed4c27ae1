use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::transport::SocketOption;

/// Options applied to a socket when it is created.
///
/// Constructed once at startup and handed to the constructors that need it;
/// there is no global default registry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SocketConfig {
    pub timeouts: Timeouts,
    pub backlog: i32,
    pub reuse_addr: bool,
    pub keep_alive: bool,
    pub no_delay: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            timeouts: Timeouts::default(),
            backlog: 32,
            reuse_addr: true,
            keep_alive: false,
            no_delay: false,
        }
    }
}

/// Limits in fractional seconds, absent or negative means unbounded.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    pub block: Option<f64>,
    pub total: Option<f64>,
}

impl SocketConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read file {}", path.display()))?;
        Self::from_yaml(&s)
    }

    pub fn from_yaml(s: &str) -> Result<Self> {
        serde_yaml_ng::from_str(s).context("parse yaml")
    }

    pub fn options(&self) -> Vec<SocketOption> {
        let mut options = vec![SocketOption::ReuseAddr(self.reuse_addr)];
        if self.keep_alive {
            options.push(SocketOption::KeepAlive(true));
        }
        if self.no_delay {
            options.push(SocketOption::NoDelay(true));
        }
        options
    }
}
