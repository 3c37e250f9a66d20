//! Conntrack invalidation through the host `conntrack(8)` tool.
//!
//! Per-rule deletion translates the rule predicate into `-D` filter
//! arguments; masked port matches cannot be expressed by the tool, so a
//! rule with a non-exact port mask falls back to the widest filter its
//! remaining fields allow. Exit status 1 with no output means "nothing
//! matched" and is not an error.

use std::process::Command;

use tracing::debug;

use domain::common::entity::Protocol;
use domain::rule::entity::PolicyRule;
use ports::secondary::conntrack_port::{ConntrackError, ConntrackPort};

pub struct ConntrackCli {
    program: String,
}

impl Default for ConntrackCli {
    fn default() -> Self {
        Self::new()
    }
}

impl ConntrackCli {
    pub fn new() -> Self {
        Self {
            program: "conntrack".to_string(),
        }
    }

    fn run(&self, args: &[String]) -> Result<u64, ConntrackError> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| ConntrackError::Failed(format!("spawn {}: {e}", self.program)))?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        let deleted = parse_deleted_count(&stderr);
        // The tool exits 1 when nothing matched but still reports the
        // "flow entries have been deleted" line.
        let ok = output.status.success() || stderr.contains("flow entries have been deleted");
        if !ok {
            return Err(ConntrackError::Failed(format!(
                "{} {:?}: {stderr}",
                self.program, args
            )));
        }
        debug!(?args, deleted, "conntrack command completed");
        Ok(deleted)
    }
}

impl ConntrackPort for ConntrackCli {
    fn flush_all(&self) -> Result<(), ConntrackError> {
        let args = vec!["-F".to_string()];
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|e| ConntrackError::Failed(format!("spawn {}: {e}", self.program)))?;
        if !output.status.success() {
            return Err(ConntrackError::Failed(format!(
                "conntrack -F: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    fn delete_matching(&self, rules: &[PolicyRule]) -> Result<u64, ConntrackError> {
        let mut total = 0;
        for rule in rules {
            total += self.run(&delete_args(rule))?;
        }
        Ok(total)
    }
}

/// `-D` filter arguments for one rule predicate.
fn delete_args(rule: &PolicyRule) -> Vec<String> {
    let mut args = vec!["-D".to_string(), "-f".to_string(), "ipv4".to_string()];
    if let Some(src) = rule.src_ip {
        args.push("-s".to_string());
        args.push(src.to_string());
    }
    if let Some(dst) = rule.dst_ip {
        args.push("-d".to_string());
        args.push(dst.to_string());
    }
    match rule.protocol {
        Protocol::Any => {}
        proto => {
            args.push("-p".to_string());
            args.push(proto.to_u8().to_string());
        }
    }
    if rule.protocol.has_ports() {
        if rule.src_port != 0 && rule.src_port_mask == u16::MAX {
            args.push("--sport".to_string());
            args.push(rule.src_port.to_string());
        }
        if rule.dst_port != 0 && rule.dst_port_mask == u16::MAX {
            args.push("--dport".to_string());
            args.push(rule.dst_port.to_string());
        }
    }
    args
}

/// The tool reports `… N flow entries have been deleted.` on stderr.
fn parse_deleted_count(stderr: &str) -> u64 {
    stderr
        .lines()
        .filter_map(|line| {
            let rest = line.split(':').next_back()?.trim();
            let count = rest.split_whitespace().next()?;
            if rest.contains("flow entries have been deleted") {
                count.parse::<u64>().ok()
            } else {
                None
            }
        })
        .sum()
}
