//! The policy→flow compiler: one abstract rule becomes one flow on the
//! policy bridge.
//!
//! Placement: the tier rank picks the table, the rule priority lands at
//! `MID_MATCH_FLOW_PRIORITY + FLOW_MATCH_OFFSET + priority` inside it.
//! Direction is encoded as the patch port the traffic entered from:
//! egress traffic arrives from the local bridge, ingress from cls.

use crate::bridge::{
    FlowAction, FlowMatch, FlowSpec, PatchPortMap, PortMatch, ETH_TYPE_IPV4,
    FLOW_MATCH_OFFSET, MID_MATCH_FLOW_PRIORITY, POLICY_FORWARD_TABLE, POLICY_TO_CLS_SUFFIX,
    POLICY_TO_LOCAL_SUFFIX,
};
use crate::common::entity::{Direction, EnforcementMode, PolicyTier, Protocol, RuleAction};
use crate::common::error::DatapathError;

use super::entity::PolicyRule;

/// Compile one rule into the flow to install on a policy bridge.
///
/// Validates the rule first; no flow is produced for an invalid rule.
pub fn compile_rule(
    rule: &PolicyRule,
    direction: Direction,
    tier: PolicyTier,
    mode: EnforcementMode,
    ports: &PatchPortMap,
) -> Result<FlowSpec, DatapathError> {
    rule.validate()?;

    let in_port = match direction {
        Direction::Egress => ports.get(POLICY_TO_LOCAL_SUFFIX),
        Direction::Ingress => ports.get(POLICY_TO_CLS_SUFFIX),
    };

    let matches = FlowMatch {
        in_port,
        eth_type: Some(ETH_TYPE_IPV4),
        ip_proto: match rule.protocol {
            Protocol::Any => None,
            p => Some(p.to_u8()),
        },
        ipv4_src: rule.src_ip,
        ipv4_dst: rule.dst_ip,
        l4_src: port_match(rule.src_port, rule.src_port_mask),
        l4_dst: port_match(rule.dst_port, rule.dst_port_mask),
        ..FlowMatch::default()
    };

    // In monitor mode the flow logs and allows regardless of the declared
    // action; the declared action is reported, not enforced.
    let actions = match (mode, rule.action) {
        (EnforcementMode::Monitor, _) => vec![
            FlowAction::Controller,
            FlowAction::GotoTable(POLICY_FORWARD_TABLE),
        ],
        (EnforcementMode::Work, RuleAction::Allow) => {
            vec![FlowAction::GotoTable(POLICY_FORWARD_TABLE)]
        }
        (EnforcementMode::Work, RuleAction::Deny) => Vec::new(),
    };

    Ok(FlowSpec {
        table: tier.rank(),
        priority: flow_priority(rule.priority),
        idle_timeout: 0,
        hard_timeout: 0,
        matches,
        actions,
    })
}

/// Priority of a rule's flow within its tier table.
pub fn flow_priority(rule_priority: i32) -> u16 {
    MID_MATCH_FLOW_PRIORITY + FLOW_MATCH_OFFSET + rule_priority as u16
}

fn port_match(port: u16, mask: u16) -> Option<PortMatch> {
    if port == 0 && mask == 0 {
        None
    } else {
        Some(PortMatch { port, mask })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::entity::RuleId;

    fn ports() -> PatchPortMap {
        let mut p = PatchPortMap::new();
        p.insert(POLICY_TO_LOCAL_SUFFIX, 1);
        p.insert(POLICY_TO_CLS_SUFFIX, 2);
        p
    }

    fn https_rule() -> PolicyRule {
        PolicyRule {
            id: RuleId::from("r1"),
            priority: 10,
            src_ip: None,
            dst_ip: None,
            protocol: Protocol::Tcp,
            src_port: 0,
            src_port_mask: 0,
            dst_port: 443,
            dst_port_mask: 0xffff,
            action: RuleAction::Allow,
        }
    }

    #[test]
    fn tier2_priority_is_213() {
        let flow = compile_rule(
            &https_rule(),
            Direction::Ingress,
            PolicyTier::Tier2,
            EnforcementMode::Work,
            &ports(),
        )
        .unwrap();
        assert_eq!(flow.table, 100);
        assert_eq!(flow.priority, 213);
    }

    #[test]
    fn direction_selects_in_port() {
        let ingress = compile_rule(
            &https_rule(),
            Direction::Ingress,
            PolicyTier::Tier2,
            EnforcementMode::Work,
            &ports(),
        )
        .unwrap();
        assert_eq!(ingress.matches.in_port, Some(2));

        let egress = compile_rule(
            &https_rule(),
            Direction::Egress,
            PolicyTier::Tier2,
            EnforcementMode::Work,
            &ports(),
        )
        .unwrap();
        assert_eq!(egress.matches.in_port, Some(1));
    }

    #[test]
    fn tier_selects_table() {
        for (tier, table) in [
            (PolicyTier::Tier0, 50),
            (PolicyTier::Tier1, 50),
            (PolicyTier::Tier2, 100),
            (PolicyTier::TierEcp, 130),
            (PolicyTier::Tier3, 150),
        ] {
            let flow = compile_rule(
                &https_rule(),
                Direction::Ingress,
                tier,
                EnforcementMode::Work,
                &ports(),
            )
            .unwrap();
            assert_eq!(flow.table, table);
        }
    }

    #[test]
    fn allow_goes_to_forward_table() {
        let flow = compile_rule(
            &https_rule(),
            Direction::Ingress,
            PolicyTier::Tier2,
            EnforcementMode::Work,
            &ports(),
        )
        .unwrap();
        assert_eq!(
            flow.actions,
            vec![FlowAction::GotoTable(POLICY_FORWARD_TABLE)]
        );
    }

    #[test]
    fn deny_compiles_to_drop() {
        let mut rule = https_rule();
        rule.action = RuleAction::Deny;
        let flow = compile_rule(
            &rule,
            Direction::Ingress,
            PolicyTier::Tier2,
            EnforcementMode::Work,
            &ports(),
        )
        .unwrap();
        assert!(flow.actions.is_empty());
    }

    #[test]
    fn monitor_mode_logs_and_allows_deny_rules() {
        let mut rule = https_rule();
        rule.action = RuleAction::Deny;
        let flow = compile_rule(
            &rule,
            Direction::Ingress,
            PolicyTier::Tier2,
            EnforcementMode::Monitor,
            &ports(),
        )
        .unwrap();
        assert_eq!(
            flow.actions,
            vec![
                FlowAction::Controller,
                FlowAction::GotoTable(POLICY_FORWARD_TABLE)
            ]
        );
    }

    #[test]
    fn match_carries_cidrs_and_ports() {
        let mut rule = https_rule();
        rule.src_ip = Some("10.0.0.0/8".parse().unwrap());
        rule.dst_ip = Some("192.168.1.0/24".parse().unwrap());
        let flow = compile_rule(
            &rule,
            Direction::Ingress,
            PolicyTier::Tier2,
            EnforcementMode::Work,
            &ports(),
        )
        .unwrap();
        assert_eq!(flow.matches.eth_type, Some(ETH_TYPE_IPV4));
        assert_eq!(flow.matches.ip_proto, Some(6));
        assert_eq!(flow.matches.ipv4_src.unwrap().prefix(), 8);
        assert_eq!(flow.matches.ipv4_dst.unwrap().prefix(), 24);
        assert_eq!(flow.matches.l4_dst, Some(PortMatch::exact(443)));
        assert_eq!(flow.matches.l4_src, None);
    }

    #[test]
    fn any_protocol_is_wildcard() {
        let mut rule = https_rule();
        rule.protocol = Protocol::Any;
        rule.dst_port = 0;
        rule.dst_port_mask = 0;
        let flow = compile_rule(
            &rule,
            Direction::Ingress,
            PolicyTier::Tier2,
            EnforcementMode::Work,
            &ports(),
        )
        .unwrap();
        assert_eq!(flow.matches.ip_proto, None);
    }

    #[test]
    fn invalid_rule_is_rejected() {
        let mut rule = https_rule();
        rule.priority = 0;
        assert!(matches!(
            compile_rule(
                &rule,
                Direction::Ingress,
                PolicyTier::Tier2,
                EnforcementMode::Work,
                &ports(),
            ),
            Err(DatapathError::InvalidRule(_))
        ));
    }

    #[test]
    fn missing_patch_ports_compile_without_in_port() {
        let flow = compile_rule(
            &https_rule(),
            Direction::Ingress,
            PolicyTier::Tier2,
            EnforcementMode::Work,
            &PatchPortMap::new(),
        )
        .unwrap();
        assert_eq!(flow.matches.in_port, None);
    }

    #[test]
    fn port_mask_carried_through() {
        let mut rule = https_rule();
        rule.dst_port = 0x0100;
        rule.dst_port_mask = 0xff00;
        let flow = compile_rule(
            &rule,
            Direction::Ingress,
            PolicyTier::Tier2,
            EnforcementMode::Work,
            &ports(),
        )
        .unwrap();
        assert_eq!(
            flow.matches.l4_dst,
            Some(PortMatch {
                port: 0x0100,
                mask: 0xff00
            })
        );
    }
}
