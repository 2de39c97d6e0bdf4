//! Queuing discipline and nftables rule management

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::command::{CommandRunner, args};
use crate::{Error, Result};

/// Table holding the rule that premarks traffic as ECT(1).
pub const NFT_TABLE_PREMARK: &str = "premarkect1";
/// Table holding the transient ECT(0) rule that marks the start of playback.
pub const NFT_TABLE_SIGNAL: &str = "signalect0";
/// Table holding the per-UE queue assignment marks.
pub const NFT_TABLE_UEMARK: &str = "uemark";

pub const CHAIN_FORWARD: &str = "forward";
pub const CHAIN_OUTPUT: &str = "output";
pub const CHAIN_UEMARK_FORWARD: &str = "uemarkforward";
pub const CHAIN_UEMARK_OUTPUT: &str = "uemarkoutput";

/// Lowest rate the qdisc accepts at creation.
pub const MIN_RATE_KBITS: u32 = 100;
pub const MAX_EXTRA_LATENCY_MS: u32 = 10_000;
pub const MAX_MARK_MS: u32 = 0xffff;
pub const MAX_QOS_MODE: u8 = 2;
pub const MAX_UE_COUNT: u8 = 16;

/// Qdisc parameters besides the rate. Zero means "qdisc default".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapingParams {
    /// Queue limit in packets
    pub queue_size: u32,
    pub extra_latency_ms: u32,
    pub markfree_ms: u32,
    pub markfull_ms: u32,
    pub qos_mode: u8,
    /// Number of UE queues; zero selects the single-queue qdisc
    pub ue_count: u8,
    /// nft match expressions assigning flows to UE queues 1..=n
    pub netflows: Vec<String>,
}

impl ShapingParams {
    /// Check the parameters against what the qdisc accepts.
    pub fn validate(&self, rate_kbits: u32) -> Result<()> {
        if rate_kbits < MIN_RATE_KBITS {
            return Err(Error::config(format!(
                "initial rate {rate_kbits} kbit/s is below {MIN_RATE_KBITS}"
            )));
        }
        if self.extra_latency_ms >= MAX_EXTRA_LATENCY_MS {
            return Err(Error::config(format!(
                "extra latency must stay below {MAX_EXTRA_LATENCY_MS} ms"
            )));
        }
        if self.markfree_ms > self.markfull_ms {
            return Err(Error::config("markfree must not be greater than markfull"));
        }
        if self.markfree_ms > MAX_MARK_MS || self.markfull_ms > MAX_MARK_MS {
            return Err(Error::config("markfree/markfull out of range"));
        }
        if self.qos_mode > MAX_QOS_MODE {
            return Err(Error::config("valid values for qos mode are 0, 1, 2"));
        }
        if self.ue_count > MAX_UE_COUNT {
            return Err(Error::config(format!("ue count must be in 0..={MAX_UE_COUNT}")));
        }
        Ok(())
    }

    pub fn qdisc(&self) -> QdiscKind {
        if self.ue_count == 0 { QdiscKind::Janz } else { QdiscKind::MultiJens { queues: self.ue_count } }
    }

    /// Qdisc options for `tc qdisc add`, starting with the rate.
    pub fn as_args(&self, rate_kbits: u32) -> Vec<String> {
        let mut args = vec!["rate".to_string(), format!("{rate_kbits}kbit")];
        if self.queue_size > 0 {
            args.extend(["limit".to_string(), self.queue_size.to_string()]);
        }
        if self.extra_latency_ms > 0 {
            args.extend(["extralatency".to_string(), format!("{}ms", self.extra_latency_ms)]);
        }
        if self.markfree_ms > 0 {
            args.extend(["markfree".to_string(), format!("{}ms", self.markfree_ms)]);
        }
        if self.markfull_ms > 0 {
            args.extend(["markfull".to_string(), format!("{}ms", self.markfull_ms)]);
        }
        if self.qos_mode > 0 {
            args.extend(["qosmode".to_string(), self.qos_mode.to_string()]);
        }
        args
    }
}

/// Which qdisc shapes the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QdiscKind {
    /// Single queue
    Janz,
    /// One queue per UE, each controlled with its own rate slot
    MultiJens { queues: u8 },
}

impl QdiscKind {
    /// Number of rate slots written per control file update.
    pub fn rate_slots(&self) -> usize {
        match self {
            QdiscKind::Janz => 1,
            QdiscKind::MultiJens { queues } => usize::from(*queues).max(1),
        }
    }
}

/// `tc` and `nft` operations on one network device.
#[derive(Clone)]
pub struct NetworkConfig {
    dev: String,
    runner: Arc<dyn CommandRunner>,
}

impl NetworkConfig {
    pub fn new(dev: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { dev: dev.into(), runner }
    }

    pub fn dev(&self) -> &str {
        &self.dev
    }

    async fn tc(&self, args: Vec<String>) -> Result<()> {
        self.runner.run("tc", &args).await.map(|_| ())
    }

    async fn nft(&self, args: Vec<String>) -> Result<()> {
        self.runner.run("nft", &args).await.map(|_| ())
    }

    /// Remove whatever root qdisc the device has.
    pub async fn delete_root_qdisc(&self) -> Result<()> {
        self.tc(args(["qdisc", "delete", "dev", self.dev.as_str(), "root"])).await
    }

    /// Install the shaping qdisc as root with the given initial rate.
    pub async fn add_root_qdisc(&self, params: &ShapingParams, rate_kbits: u32) -> Result<()> {
        let mut cmd = args(["qdisc", "add", "dev", self.dev.as_str(), "root", "handle", "1:"]);
        match params.qdisc() {
            QdiscKind::Janz => cmd.push("janz".to_string()),
            QdiscKind::MultiJens { queues } => {
                cmd.extend(args(["multijens", "uenum"]));
                cmd.push(queues.to_string());
            }
        }
        cmd.extend(params.as_args(rate_kbits));
        debug!(?cmd, "Starting tc");
        self.tc(cmd).await
    }

    /// Delete an nft table; failures are only logged.
    pub async fn reset_table(&self, table: &str) {
        if let Err(e) = self.nft(args(["delete", "table", "inet", table])).await {
            warn!(table, error = %e, "Could not delete nft table");
        }
    }

    /// Table with forward and output chains that rewrite the ECN field of
    /// everything leaving the device.
    pub async fn add_ect_rule(&self, table: &str, ect: &str, priority: u32) -> Result<()> {
        let priority = priority.to_string();
        self.nft(args(["add", "table", "inet", table])).await?;
        for (chain, hook) in [(CHAIN_FORWARD, "forward"), (CHAIN_OUTPUT, "output")] {
            self.nft(chain_args(table, chain, hook, &priority)).await?;
        }
        for chain in [CHAIN_FORWARD, CHAIN_OUTPUT] {
            self.nft(args([
                "add", "rule", "inet", table, chain, "ip", "ecn", "set", ect, "oifname",
                self.dev.as_str(),
            ]))
            .await?;
        }
        debug!(table, ect, "Enabled nft rules");
        Ok(())
    }

    /// Mark rules sending netflow `i` to UE queue `i + 1`.
    pub async fn add_ue_mark_rules(&self, netflows: &[String]) -> Result<()> {
        self.nft(args(["add", "table", "inet", NFT_TABLE_UEMARK])).await?;
        for (chain, hook) in [(CHAIN_UEMARK_FORWARD, "forward"), (CHAIN_UEMARK_OUTPUT, "output")] {
            self.nft(chain_args(NFT_TABLE_UEMARK, chain, hook, "0")).await?;
        }
        for (i, netflow) in netflows.iter().enumerate() {
            let mark = (i + 1).to_string();
            for chain in [CHAIN_UEMARK_FORWARD, CHAIN_UEMARK_OUTPUT] {
                let mut rule = args(["add", "rule", "inet", NFT_TABLE_UEMARK, chain]);
                rule.extend(netflow.split_whitespace().map(String::from));
                rule.extend(args(["meta", "mark", "set", mark.as_str(), "counter"]));
                self.nft(rule).await?;
            }
        }
        debug!(table = NFT_TABLE_UEMARK, flows = netflows.len(), "Enabled nft rules");
        Ok(())
    }
}

impl std::fmt::Debug for NetworkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkConfig").field("dev", &self.dev).finish_non_exhaustive()
    }
}

fn chain_args(table: &str, chain: &str, hook: &str, priority: &str) -> Vec<String> {
    args([
        "add", "chain", "inet", table, chain, "{", "type", "filter", "hook", hook, "priority",
        priority, ";}",
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingRunner;

    fn params() -> ShapingParams {
        ShapingParams {
            queue_size: 1000,
            extra_latency_ms: 20,
            markfree_ms: 4,
            markfull_ms: 14,
            qos_mode: 1,
            ..ShapingParams::default()
        }
    }

    #[test]
    fn args_skip_defaults() {
        assert_eq!(ShapingParams::default().as_args(5000), ["rate", "5000kbit"]);
        assert_eq!(
            params().as_args(5000),
            [
                "rate", "5000kbit", "limit", "1000", "extralatency", "20ms", "markfree", "4ms",
                "markfull", "14ms", "qosmode", "1"
            ]
        );
    }

    #[test]
    fn validation_rules() {
        assert!(params().validate(100).is_ok());
        assert!(params().validate(99).is_err());
        assert!(ShapingParams { extra_latency_ms: 10_000, ..params() }.validate(1000).is_err());
        assert!(ShapingParams { markfree_ms: 20, ..params() }.validate(1000).is_err());
        assert!(
            ShapingParams { markfree_ms: 0x1_0000, markfull_ms: 0x1_0000, ..params() }
                .validate(1000)
                .is_err()
        );
        assert!(ShapingParams { qos_mode: 3, ..params() }.validate(1000).is_err());
        assert!(ShapingParams { ue_count: 17, ..params() }.validate(1000).is_err());
        assert!(ShapingParams { ue_count: 16, ..params() }.validate(1000).is_ok());
    }

    #[test]
    fn qdisc_kind_follows_ue_count() {
        assert_eq!(params().qdisc(), QdiscKind::Janz);
        assert_eq!(QdiscKind::Janz.rate_slots(), 1);
        let multi = ShapingParams { ue_count: 3, ..params() };
        assert_eq!(multi.qdisc(), QdiscKind::MultiJens { queues: 3 });
        assert_eq!(multi.qdisc().rate_slots(), 3);
    }

    #[tokio::test]
    async fn qdisc_commands() {
        let runner = Arc::new(RecordingRunner::default());
        let net = NetworkConfig::new("eth1", runner.clone());

        net.delete_root_qdisc().await.unwrap();
        net.add_root_qdisc(&ShapingParams { ue_count: 2, ..ShapingParams::default() }, 2000)
            .await
            .unwrap();

        assert_eq!(
            runner.commands(),
            [
                "tc qdisc delete dev eth1 root",
                "tc qdisc add dev eth1 root handle 1: multijens uenum 2 rate 2000kbit",
            ]
        );
    }

    #[tokio::test]
    async fn ect_rule_commands() {
        let runner = Arc::new(RecordingRunner::default());
        let net = NetworkConfig::new("eth1", runner.clone());
        net.add_ect_rule(NFT_TABLE_PREMARK, "ect1", 0).await.unwrap();

        assert_eq!(
            runner.commands(),
            [
                "nft add table inet premarkect1",
                "nft add chain inet premarkect1 forward { type filter hook forward priority 0 ;}",
                "nft add chain inet premarkect1 output { type filter hook output priority 0 ;}",
                "nft add rule inet premarkect1 forward ip ecn set ect1 oifname eth1",
                "nft add rule inet premarkect1 output ip ecn set ect1 oifname eth1",
            ]
        );
    }

    #[tokio::test]
    async fn ue_mark_rules_number_queues_from_one() {
        let runner = Arc::new(RecordingRunner::default());
        let net = NetworkConfig::new("eth1", runner.clone());
        net.add_ue_mark_rules(&["ip saddr 10.0.0.1 tcp sport 443".to_string()]).await.unwrap();

        let commands = runner.commands();
        assert_eq!(commands.len(), 5);
        assert_eq!(
            commands[3],
            "nft add rule inet uemark uemarkforward ip saddr 10.0.0.1 tcp sport 443 meta mark set 1 counter"
        );
    }

    #[tokio::test]
    async fn reset_table_swallows_failures() {
        let runner = Arc::new(RecordingRunner::failing_on("nft delete"));
        let net = NetworkConfig::new("eth1", runner.clone());
        net.reset_table(NFT_TABLE_SIGNAL).await;
        assert_eq!(runner.commands(), ["nft delete table inet signalect0"]);
    }
}
