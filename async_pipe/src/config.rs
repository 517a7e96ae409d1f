//! Runtime configuration.

use std::net::SocketAddr;

use crate::error::{Error, Result};

const EVENT_CAPACITY_VAR: &str = "ASYNC_PIPE_EVENT_CAPACITY";
const TICK_BUDGET_VAR: &str = "ASYNC_PIPE_TICK_BUDGET";
const METRICS_ADDR_VAR: &str = "ASYNC_PIPE_METRICS_ADDR";

/// Tunables of a [`Runtime`](crate::runtime::Runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Capacity of the reactor's event buffer per poll.
    pub event_capacity: usize,
    /// Maximum number of task polls between two reactor turns.
    pub tick_budget: usize,
    /// When set, a Prometheus exporter listens on this address.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            tick_budget: 128,
            metrics_addr: None,
        }
    }
}

impl RuntimeConfig {
    /// Reads overrides from `ASYNC_PIPE_EVENT_CAPACITY`, `ASYNC_PIPE_TICK_BUDGET` and
    /// `ASYNC_PIPE_METRICS_ADDR`, falling back to the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = lookup(EVENT_CAPACITY_VAR) {
            config.event_capacity = parse_positive(EVENT_CAPACITY_VAR, &value)?;
        }
        if let Some(value) = lookup(TICK_BUDGET_VAR) {
            config.tick_budget = parse_positive(TICK_BUDGET_VAR, &value)?;
        }
        if let Some(value) = lookup(METRICS_ADDR_VAR) {
            let addr = value
                .trim()
                .parse::<SocketAddr>()
                .map_err(|e| Error::Config(format!("{METRICS_ADDR_VAR}={value}: {e}")))?;
            config.metrics_addr = Some(addr);
        }
        Ok(config)
    }

    pub fn with_event_capacity(mut self, event_capacity: usize) -> Self {
        self.event_capacity = event_capacity;
        self
    }

    pub fn with_tick_budget(mut self, tick_budget: usize) -> Self {
        self.tick_budget = tick_budget;
        self
    }

    pub fn with_metrics_addr(mut self, addr: SocketAddr) -> Self {
        self.metrics_addr = Some(addr);
        self
    }
}

fn parse_positive(name: &str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(0) => Err(Error::Config(format!("{name} must be positive"))),
        Ok(n) => Ok(n),
        Err(e) => Err(Error::Config(format!("{name}={value}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_without_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn reads_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (EVENT_CAPACITY_VAR, "64"),
            (TICK_BUDGET_VAR, " 8 "),
            (METRICS_ADDR_VAR, "127.0.0.1:9000"),
        ]))
        .unwrap();
        assert_eq!(config.event_capacity, 64);
        assert_eq!(config.tick_budget, 8);
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9000".parse().unwrap()));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            RuntimeConfig::from_lookup(lookup(&[(TICK_BUDGET_VAR, "0")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_lookup(lookup(&[(METRICS_ADDR_VAR, "nowhere")])),
            Err(Error::Config(_))
        ));
    }
}
