// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Environment-driven configuration: named `ENV_*` keys, small typed
//! accessors, sane defaults so the runtime works unconfigured.

use std::env;
use std::time::Duration;

const ENV_SCHEDULER_TICK_MICROS: &str = "_PT_SCHEDULER_TICK_MICROS";
const DEFAULT_SCHEDULER_TICK: Duration = Duration::from_micros(500);

const ENV_KOUTPUT_QUEUE_LIMIT: &str = "_PT_KOUTPUT_QUEUE_LIMIT";
const DEFAULT_KOUTPUT_QUEUE_LIMIT: usize = 16;

const ENV_CATENATION_QUEUE_LIMIT: &str = "_PT_CATENATION_QUEUE_LIMIT";
const DEFAULT_CATENATION_QUEUE_LIMIT: usize = 8;

const ENV_TRANSPORTS_RECURSION_CAP: &str = "_PT_TRANSPORTS_RECURSION_CAP";
const DEFAULT_TRANSPORTS_RECURSION_CAP: usize = 64;

const ENV_WORKER_IDLE_LINGER_SECS: &str = "_PT_WORKER_IDLE_LINGER_SECS";
const DEFAULT_WORKER_IDLE_LINGER: Duration = Duration::from_secs(60);

/// Process-wide tunables, read once and cheap to clone thereafter: a flat
/// struct of already-parsed values rather than a lazily-queried map, so
/// later reads never re-touch the environment.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub scheduler_tick: Duration,
    pub koutput_queue_limit: usize,
    pub catenation_queue_limit: usize,
    pub transports_recursion_cap: usize,
    pub worker_idle_linger: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            scheduler_tick: DEFAULT_SCHEDULER_TICK,
            koutput_queue_limit: DEFAULT_KOUTPUT_QUEUE_LIMIT,
            catenation_queue_limit: DEFAULT_CATENATION_QUEUE_LIMIT,
            transports_recursion_cap: DEFAULT_TRANSPORTS_RECURSION_CAP,
            worker_idle_linger: DEFAULT_WORKER_IDLE_LINGER,
        }
    }
}

impl Config {
    /// Build a `Config` from the process environment, falling back to the
    /// documented defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        Config {
            scheduler_tick: env_micros(ENV_SCHEDULER_TICK_MICROS, DEFAULT_SCHEDULER_TICK),
            koutput_queue_limit: env_usize(ENV_KOUTPUT_QUEUE_LIMIT, DEFAULT_KOUTPUT_QUEUE_LIMIT),
            catenation_queue_limit: env_usize(
                ENV_CATENATION_QUEUE_LIMIT,
                DEFAULT_CATENATION_QUEUE_LIMIT,
            ),
            transports_recursion_cap: env_usize(
                ENV_TRANSPORTS_RECURSION_CAP,
                DEFAULT_TRANSPORTS_RECURSION_CAP,
            ),
            worker_idle_linger: env_secs(ENV_WORKER_IDLE_LINGER_SECS, DEFAULT_WORKER_IDLE_LINGER),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_micros(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_micros)
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_spec() {
        let c = Config::default();
        assert_eq!(c.koutput_queue_limit, 16);
        assert_eq!(c.catenation_queue_limit, 8);
        assert_eq!(c.transports_recursion_cap, 64);
    }
}
