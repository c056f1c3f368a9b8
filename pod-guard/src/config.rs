use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::builder::FalseyValueParser;
use clap::{ArgAction, Parser, Subcommand};

pub const DEFAULT_POD_SELECTOR: &str = "monitor=external";

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    Agent(AgentArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct AgentArgs {
    /// Label selector for pods to monitor, as comma separated key=value pairs
    #[arg(long, env = "POD_SELECTOR", default_value = DEFAULT_POD_SELECTOR)]
    pub pod_selector: PodSelector,

    /// Block traffic from monitored pods instead of only reporting it
    #[arg(
        long,
        env = "BLOCK_EXTERNAL",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new()
    )]
    pub block_external: bool,

    /// Name of the node the agent is running on, defaults to the hostname
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Seconds between two policy synchronizations
    #[arg(
        long,
        env = "SYNC_INTERVAL_SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub sync_interval_secs: u64,

    /// Remove table entries of pods that left the selection
    #[arg(
        long,
        env = "PRUNE_STALE",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new()
    )]
    pub prune_stale: bool,

    /// Compiled enforcement engine object
    #[arg(
        long,
        env = "EBPF_OBJECT",
        default_value = "/opt/pod-guard/pod-guard-ebpf.o"
    )]
    pub ebpf_object: PathBuf,

    /// Path to the sysfs network class directory
    #[arg(long, env = "SYSFS_NET", default_value = "/sys/class/net")]
    pub sysfs_net: PathBuf,

    /// Metrics listener for agent
    #[arg(long, env = "METRICS_ADDRESS", default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,
}

impl AgentArgs {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }
}

/// Equality based label selector.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PodSelector(BTreeMap<String, String>);

impl PodSelector {
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for PodSelector {
    type Err = Infallible;

    // Malformed pairs are dropped rather than rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let labels = s
            .split(',')
            .filter_map(|pair| {
                let (key, value) = pair.trim().split_once('=')?;
                let key = key.trim();
                if key.is_empty() {
                    return None;
                }
                Some((key.to_string(), value.trim().to_string()))
            })
            .collect();
        Ok(Self(labels))
    }
}

impl fmt::Display for PodSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PodSelector {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Mutex, PoisonError};

    use super::*;

    // serializes tests that read or write the process environment
    static ENV: Mutex<()> = Mutex::new(());

    fn agent_args_with_env(vars: &[(&str, &str)]) -> AgentArgs {
        let _guard = ENV.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in vars {
            unsafe { std::env::set_var(key, value) };
        }
        let cli = Cli::try_parse_from(["pod-guard", "agent"]);
        for (key, _) in vars {
            unsafe { std::env::remove_var(key) };
        }
        let Commands::Agent(args) = cli.unwrap().command;
        args
    }

    fn selector(s: &str) -> PodSelector {
        match s.parse() {
            Ok(selector) => selector,
            Err(e) => match e {},
        }
    }

    #[test]
    fn test_selector_parsing() {
        let parsed = selector(" tier=edge , app = web ");
        assert_eq!(
            parsed.labels(),
            &BTreeMap::from([
                ("app".to_string(), "web".to_string()),
                ("tier".to_string(), "edge".to_string()),
            ])
        );
        assert_eq!(parsed.to_string(), "app=web,tier=edge");
    }

    #[test]
    fn test_selector_skips_malformed_pairs() {
        let parsed = selector("monitor=external,novalue,=orphan,,");
        assert_eq!(parsed, PodSelector::from_iter([("monitor", "external")]));

        assert!(selector("").is_empty());
        assert_eq!(selector("").to_string(), "");
    }

    #[test]
    fn test_agent_defaults() {
        let args = agent_args_with_env(&[]);
        assert_eq!(args.pod_selector, selector(DEFAULT_POD_SELECTOR));
        assert!(!args.block_external);
        assert!(!args.prune_stale);
        assert_eq!(args.sync_interval(), Duration::from_secs(10));
        assert_eq!(args.metrics_address.port(), 9090);
        assert_eq!(args.sysfs_net, PathBuf::from("/sys/class/net"));
    }

    #[test]
    fn test_agent_flags() {
        let cli = Cli::try_parse_from([
            "pod-guard",
            "agent",
            "--pod-selector",
            "tier=edge",
            "--block-external",
            "--node-name",
            "worker-1",
            "--sync-interval-secs",
            "3",
        ])
        .unwrap();
        let Commands::Agent(args) = cli.command;
        assert_eq!(args.pod_selector.to_string(), "tier=edge");
        assert!(args.block_external);
        assert_eq!(args.node_name.as_deref(), Some("worker-1"));
        assert_eq!(args.sync_interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_flags_from_env_accept_any_value() {
        for value in ["1", "yes", "TRUE", "on", "true"] {
            let args = agent_args_with_env(&[("BLOCK_EXTERNAL", value), ("PRUNE_STALE", value)]);
            assert!(args.block_external, "BLOCK_EXTERNAL={value}");
            assert!(args.prune_stale, "PRUNE_STALE={value}");
        }
        for value in ["0", "false", "no", "off", ""] {
            let args = agent_args_with_env(&[("BLOCK_EXTERNAL", value)]);
            assert!(!args.block_external, "BLOCK_EXTERNAL={value}");
        }
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        assert!(Cli::try_parse_from(["pod-guard", "agent", "--sync-interval-secs", "0"]).is_err());
    }
}
