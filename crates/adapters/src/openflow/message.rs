//! OpenFlow 1.3 wire encoding for the handful of messages the datapath
//! sends, and header parsing for the few it receives.
//!
//! Only the subset the agent needs is implemented: HELLO / ECHO for the
//! session handshake and keepalive, FLOW_MOD with an OXM match for
//! installs and cookie-scoped deletes, and PACKET_OUT for ARP probes.

use bytes::{BufMut, BytesMut};

use domain::bridge::{FlowAction, FlowMatch, FlowSpec};

pub const OFP_VERSION_13: u8 = 0x04;
pub const OFP_HEADER_LEN: usize = 8;

pub const OFPT_HELLO: u8 = 0;
pub const OFPT_ERROR: u8 = 1;
pub const OFPT_ECHO_REQUEST: u8 = 2;
pub const OFPT_ECHO_REPLY: u8 = 3;
pub const OFPT_FEATURES_REQUEST: u8 = 5;
pub const OFPT_FEATURES_REPLY: u8 = 6;
pub const OFPT_PACKET_IN: u8 = 10;
pub const OFPT_PACKET_OUT: u8 = 13;
pub const OFPT_FLOW_MOD: u8 = 14;
pub const OFPT_MULTIPART_REPLY: u8 = 19;

const OFPFC_ADD: u8 = 0;
const OFPFC_DELETE: u8 = 3;

const OFPTT_ALL: u8 = 0xff;
const OFPP_ANY: u32 = 0xffff_ffff;
const OFPG_ANY: u32 = 0xffff_ffff;
const OFPP_CONTROLLER: u32 = 0xffff_fffd;
const OFPP_NORMAL: u32 = 0xffff_fffa;
const OFP_NO_BUFFER: u32 = 0xffff_ffff;
const OFPCML_NO_BUFFER: u16 = 0xffff;

// OXM match field numbers (class OFPXMC_OPENFLOW_BASIC).
const OXM_CLASS_BASIC: u16 = 0x8000;
const OXM_IN_PORT: u8 = 0;
const OXM_ETH_DST: u8 = 3;
const OXM_ETH_SRC: u8 = 4;
const OXM_ETH_TYPE: u8 = 5;
const OXM_VLAN_VID: u8 = 6;
const OXM_IP_PROTO: u8 = 10;
const OXM_IPV4_SRC: u8 = 11;
const OXM_IPV4_DST: u8 = 12;
const OXM_TCP_SRC: u8 = 13;
const OXM_TCP_DST: u8 = 14;
const OXM_UDP_SRC: u8 = 15;
const OXM_UDP_DST: u8 = 16;

const OFPVID_PRESENT: u16 = 0x1000;

const OFPIT_GOTO_TABLE: u16 = 1;
const OFPIT_APPLY_ACTIONS: u16 = 4;
const OFPAT_OUTPUT: u16 = 0;

const IPPROTO_TCP: u8 = 6;

/// Parsed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfpHeader {
    pub version: u8,
    pub msg_type: u8,
    pub length: u16,
    pub xid: u32,
}

impl OfpHeader {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < OFP_HEADER_LEN {
            return None;
        }
        Some(Self {
            version: buf[0],
            msg_type: buf[1],
            length: u16::from_be_bytes([buf[2], buf[3]]),
            xid: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

fn put_header(buf: &mut BytesMut, msg_type: u8, length: u16, xid: u32) {
    buf.put_u8(OFP_VERSION_13);
    buf.put_u8(msg_type);
    buf.put_u16(length);
    buf.put_u32(xid);
}

pub fn encode_hello(xid: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(OFP_HEADER_LEN);
    put_header(&mut buf, OFPT_HELLO, OFP_HEADER_LEN as u16, xid);
    buf.to_vec()
}

pub fn encode_echo_reply(xid: u32, payload: &[u8]) -> Vec<u8> {
    let len = (OFP_HEADER_LEN + payload.len()) as u16;
    let mut buf = BytesMut::with_capacity(len as usize);
    put_header(&mut buf, OFPT_ECHO_REPLY, len, xid);
    buf.put_slice(payload);
    buf.to_vec()
}

pub fn encode_features_request(xid: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(OFP_HEADER_LEN);
    put_header(&mut buf, OFPT_FEATURES_REQUEST, OFP_HEADER_LEN as u16, xid);
    buf.to_vec()
}

/// FLOW_MOD installing `spec` under `cookie`.
pub fn encode_flow_add(xid: u32, cookie: u64, spec: &FlowSpec) -> Vec<u8> {
    let match_bytes = encode_match(&spec.matches);
    let instr_bytes = encode_instructions(&spec.actions);
    let length = OFP_HEADER_LEN + 40 + match_bytes.len() + instr_bytes.len();

    let mut buf = BytesMut::with_capacity(length);
    put_header(&mut buf, OFPT_FLOW_MOD, length as u16, xid);
    buf.put_u64(cookie);
    buf.put_u64(0); // cookie_mask, ignored on add
    buf.put_u8(spec.table);
    buf.put_u8(OFPFC_ADD);
    buf.put_u16(spec.idle_timeout);
    buf.put_u16(spec.hard_timeout);
    buf.put_u16(spec.priority);
    buf.put_u32(OFP_NO_BUFFER);
    buf.put_u32(OFPP_ANY);
    buf.put_u32(OFPG_ANY);
    buf.put_u16(0); // flags
    buf.put_u16(0); // pad
    buf.put_slice(&match_bytes);
    buf.put_slice(&instr_bytes);
    buf.to_vec()
}

/// FLOW_MOD deleting the single flow carrying `cookie` in `table`.
pub fn encode_flow_delete(xid: u32, table: u8, cookie: u64) -> Vec<u8> {
    encode_delete(xid, table, cookie, u64::MAX)
}

/// FLOW_MOD deleting every flow whose cookie matches `cookie` under
/// `cookie_mask`, in all tables.
pub fn encode_flow_delete_by_cookie(xid: u32, cookie: u64, cookie_mask: u64) -> Vec<u8> {
    encode_delete(xid, OFPTT_ALL, cookie, cookie_mask)
}

fn encode_delete(xid: u32, table: u8, cookie: u64, cookie_mask: u64) -> Vec<u8> {
    let match_bytes = encode_match(&FlowMatch::default());
    let length = OFP_HEADER_LEN + 40 + match_bytes.len();

    let mut buf = BytesMut::with_capacity(length);
    put_header(&mut buf, OFPT_FLOW_MOD, length as u16, xid);
    buf.put_u64(cookie);
    buf.put_u64(cookie_mask);
    buf.put_u8(table);
    buf.put_u8(OFPFC_DELETE);
    buf.put_u16(0); // idle
    buf.put_u16(0); // hard
    buf.put_u16(0); // priority, ignored for non-strict delete
    buf.put_u32(OFP_NO_BUFFER);
    buf.put_u32(OFPP_ANY);
    buf.put_u32(OFPG_ANY);
    buf.put_u16(0); // flags
    buf.put_u16(0); // pad
    buf.put_slice(&match_bytes);
    buf.to_vec()
}

/// PACKET_OUT emitting `payload` on `port`.
pub fn encode_packet_out(xid: u32, port: u32, payload: &[u8]) -> Vec<u8> {
    let action_len = 16usize;
    let length = OFP_HEADER_LEN + 16 + action_len + payload.len();

    let mut buf = BytesMut::with_capacity(length);
    put_header(&mut buf, OFPT_PACKET_OUT, length as u16, xid);
    buf.put_u32(OFP_NO_BUFFER);
    buf.put_u32(OFPP_CONTROLLER); // in_port
    buf.put_u16(action_len as u16);
    buf.put_slice(&[0u8; 6]); // pad
    put_output_action(&mut buf, port, 0);
    buf.put_slice(payload);
    buf.to_vec()
}

// ── OXM match ───────────────────────────────────────────────────────

fn put_oxm_header(buf: &mut BytesMut, field: u8, has_mask: bool, len: u8) {
    buf.put_u16(OXM_CLASS_BASIC);
    buf.put_u8((field << 1) | u8::from(has_mask));
    buf.put_u8(len);
}

fn encode_match(m: &FlowMatch) -> Vec<u8> {
    let mut fields = BytesMut::new();

    if let Some(port) = m.in_port {
        put_oxm_header(&mut fields, OXM_IN_PORT, false, 4);
        fields.put_u32(port);
    }
    if let Some(mac) = m.eth_src {
        put_oxm_header(&mut fields, OXM_ETH_SRC, false, 6);
        fields.put_slice(&mac.octets());
    }
    if let Some(mac) = m.eth_dst {
        put_oxm_header(&mut fields, OXM_ETH_DST, false, 6);
        fields.put_slice(&mac.octets());
    }
    if let Some(eth_type) = m.eth_type {
        put_oxm_header(&mut fields, OXM_ETH_TYPE, false, 2);
        fields.put_u16(eth_type);
    }
    if let Some(vid) = m.vlan_id {
        put_oxm_header(&mut fields, OXM_VLAN_VID, false, 2);
        fields.put_u16(vid | OFPVID_PRESENT);
    }
    if let Some(proto) = m.ip_proto {
        put_oxm_header(&mut fields, OXM_IP_PROTO, false, 1);
        fields.put_u8(proto);
    }
    if let Some(net) = m.ipv4_src {
        put_ipv4_field(&mut fields, OXM_IPV4_SRC, net);
    }
    if let Some(net) = m.ipv4_dst {
        put_ipv4_field(&mut fields, OXM_IPV4_DST, net);
    }
    // L4 port fields depend on the protocol; without one the port match
    // is inexpressible and the compiler never produces it.
    if let Some(proto) = m.ip_proto {
        let (src_field, dst_field) = if proto == IPPROTO_TCP {
            (OXM_TCP_SRC, OXM_TCP_DST)
        } else {
            (OXM_UDP_SRC, OXM_UDP_DST)
        };
        if let Some(pm) = m.l4_src {
            put_port_field(&mut fields, src_field, pm.port, pm.mask);
        }
        if let Some(pm) = m.l4_dst {
            put_port_field(&mut fields, dst_field, pm.port, pm.mask);
        }
    }

    // ofp_match: type OXM (1), length covers type+length+fields, then the
    // whole structure pads to a multiple of 8.
    let body_len = 4 + fields.len();
    let padded = (body_len + 7) / 8 * 8;
    let mut out = BytesMut::with_capacity(padded);
    out.put_u16(1); // OFPMT_OXM
    out.put_u16(body_len as u16);
    out.put_slice(&fields);
    out.resize(padded, 0);
    out.to_vec()
}

fn put_ipv4_field(buf: &mut BytesMut, field: u8, net: ipnetwork::Ipv4Network) {
    if net.prefix() == 32 {
        put_oxm_header(buf, field, false, 4);
        buf.put_slice(&net.ip().octets());
    } else {
        put_oxm_header(buf, field, true, 8);
        buf.put_slice(&net.network().octets());
        buf.put_slice(&net.mask().octets());
    }
}

fn put_port_field(buf: &mut BytesMut, field: u8, port: u16, mask: u16) {
    if mask == u16::MAX {
        put_oxm_header(buf, field, false, 2);
        buf.put_u16(port);
    } else {
        put_oxm_header(buf, field, true, 4);
        buf.put_u16(port);
        buf.put_u16(mask);
    }
}

// ── Instructions ────────────────────────────────────────────────────

fn encode_instructions(actions: &[FlowAction]) -> Vec<u8> {
    let mut apply = BytesMut::new();
    let mut goto: Option<u8> = None;

    for action in actions {
        match action {
            FlowAction::Output(port) => put_output_action(&mut apply, *port, 0),
            FlowAction::Controller => {
                put_output_action(&mut apply, OFPP_CONTROLLER, OFPCML_NO_BUFFER)
            }
            FlowAction::Normal => put_output_action(&mut apply, OFPP_NORMAL, 0),
            FlowAction::GotoTable(table) => goto = Some(*table),
        }
    }

    let mut out = BytesMut::new();
    if !apply.is_empty() {
        out.put_u16(OFPIT_APPLY_ACTIONS);
        out.put_u16(8 + apply.len() as u16);
        out.put_u32(0); // pad
        out.put_slice(&apply);
    }
    if let Some(table) = goto {
        out.put_u16(OFPIT_GOTO_TABLE);
        out.put_u16(8);
        out.put_u8(table);
        out.put_slice(&[0u8; 3]);
    }
    out.to_vec()
}

fn put_output_action(buf: &mut BytesMut, port: u32, max_len: u16) {
    buf.put_u16(OFPAT_OUTPUT);
    buf.put_u16(16);
    buf.put_u32(port);
    buf.put_u16(max_len);
    buf.put_slice(&[0u8; 6]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::bridge::PortMatch;

    #[test]
    fn header_roundtrip() {
        let hello = encode_hello(7);
        let header = OfpHeader::parse(&hello).unwrap();
        assert_eq!(header.version, OFP_VERSION_13);
        assert_eq!(header.msg_type, OFPT_HELLO);
        assert_eq!(header.length as usize, hello.len());
        assert_eq!(header.xid, 7);
    }

    #[test]
    fn header_parse_short_buffer() {
        assert!(OfpHeader::parse(&[4, 0, 0]).is_none());
    }

    #[test]
    fn echo_reply_carries_payload() {
        let reply = encode_echo_reply(3, &[0xaa, 0xbb]);
        assert_eq!(reply.len(), 10);
        assert_eq!(reply[1], OFPT_ECHO_REPLY);
        assert_eq!(&reply[8..], &[0xaa, 0xbb]);
    }

    #[test]
    fn flow_add_layout() {
        let spec = FlowSpec::new(100, 213).matching(FlowMatch {
            eth_type: Some(0x0800),
            ..FlowMatch::default()
        });
        let msg = encode_flow_add(1, 0x1000_0001, &spec);
        let header = OfpHeader::parse(&msg).unwrap();
        assert_eq!(header.msg_type, OFPT_FLOW_MOD);
        assert_eq!(header.length as usize, msg.len());
        // Cookie sits right after the header.
        assert_eq!(&msg[8..16], &0x1000_0001u64.to_be_bytes());
        // table, command
        assert_eq!(msg[24], 100);
        assert_eq!(msg[25], OFPFC_ADD);
        // priority
        assert_eq!(&msg[30..32], &213u16.to_be_bytes());
        // Message length is 8-aligned.
        assert_eq!(msg.len() % 8, 0);
    }

    #[test]
    fn flow_delete_by_cookie_covers_all_tables() {
        let msg = encode_flow_delete_by_cookie(1, 0x2000_0000, 0xf000_0000);
        assert_eq!(msg[24], OFPTT_ALL);
        assert_eq!(msg[25], OFPFC_DELETE);
        assert_eq!(&msg[8..16], &0x2000_0000u64.to_be_bytes());
        assert_eq!(&msg[16..24], &0xf000_0000u64.to_be_bytes());
    }

    #[test]
    fn flow_delete_single_uses_full_mask() {
        let msg = encode_flow_delete(1, 100, 0x1000_0001);
        assert_eq!(msg[24], 100);
        assert_eq!(&msg[16..24], &u64::MAX.to_be_bytes());
    }

    #[test]
    fn empty_match_is_four_bytes_padded() {
        let bytes = encode_match(&FlowMatch::default());
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[0..2], &1u16.to_be_bytes());
        assert_eq!(&bytes[2..4], &4u16.to_be_bytes());
    }

    #[test]
    fn eth_type_oxm_encoding() {
        let bytes = encode_match(&FlowMatch {
            eth_type: Some(0x0800),
            ..FlowMatch::default()
        });
        // class 0x8000, field 5 << 1, len 2, value 0x0800
        assert_eq!(&bytes[4..10], &[0x80, 0x00, 0x0a, 0x02, 0x08, 0x00]);
    }

    #[test]
    fn masked_cidr_uses_hasmask() {
        let bytes = encode_match(&FlowMatch {
            ipv4_src: Some("10.0.0.0/8".parse().unwrap()),
            ..FlowMatch::default()
        });
        // field 11, hasmask bit set, len 8
        assert_eq!(bytes[6], (OXM_IPV4_SRC << 1) | 1);
        assert_eq!(bytes[7], 8);
        assert_eq!(&bytes[8..12], &[10, 0, 0, 0]);
        assert_eq!(&bytes[12..16], &[255, 0, 0, 0]);
    }

    #[test]
    fn host_cidr_is_exact_match() {
        let bytes = encode_match(&FlowMatch {
            ipv4_dst: Some("10.0.0.1/32".parse().unwrap()),
            ..FlowMatch::default()
        });
        assert_eq!(bytes[6], OXM_IPV4_DST << 1);
        assert_eq!(bytes[7], 4);
    }

    #[test]
    fn tcp_ports_follow_protocol() {
        let bytes = encode_match(&FlowMatch {
            ip_proto: Some(6),
            l4_dst: Some(PortMatch::exact(443)),
            ..FlowMatch::default()
        });
        // ip_proto field then tcp_dst field.
        assert_eq!(bytes[6], OXM_IP_PROTO << 1);
        assert_eq!(bytes[9 + 2], OXM_TCP_DST << 1);
    }

    #[test]
    fn udp_ports_follow_protocol() {
        let bytes = encode_match(&FlowMatch {
            ip_proto: Some(17),
            l4_dst: Some(PortMatch::exact(53)),
            ..FlowMatch::default()
        });
        assert_eq!(bytes[9 + 2], OXM_UDP_DST << 1);
    }

    #[test]
    fn ports_without_protocol_are_skipped() {
        let bytes = encode_match(&FlowMatch {
            l4_dst: Some(PortMatch::exact(443)),
            ..FlowMatch::default()
        });
        assert_eq!(bytes.len(), 8); // empty match
    }

    #[test]
    fn goto_table_instruction() {
        let bytes = encode_instructions(&[FlowAction::GotoTable(200)]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[0..2], &OFPIT_GOTO_TABLE.to_be_bytes());
        assert_eq!(bytes[4], 200);
    }

    #[test]
    fn drop_is_no_instructions() {
        assert!(encode_instructions(&[]).is_empty());
    }

    #[test]
    fn output_then_goto_combines() {
        let bytes =
            encode_instructions(&[FlowAction::Output(7), FlowAction::GotoTable(200)]);
        // apply-actions (8 + 16) + goto (8)
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[0..2], &OFPIT_APPLY_ACTIONS.to_be_bytes());
        assert_eq!(&bytes[24..26], &OFPIT_GOTO_TABLE.to_be_bytes());
    }

    #[test]
    fn controller_action_requests_full_packet() {
        let bytes = encode_instructions(&[FlowAction::Controller]);
        // output action port = CONTROLLER, max_len = NO_BUFFER
        assert_eq!(&bytes[12..16], &OFPP_CONTROLLER.to_be_bytes());
        assert_eq!(&bytes[16..18], &OFPCML_NO_BUFFER.to_be_bytes());
    }

    #[test]
    fn packet_out_layout() {
        let payload = [1u8, 2, 3, 4];
        let msg = encode_packet_out(9, 12, &payload);
        let header = OfpHeader::parse(&msg).unwrap();
        assert_eq!(header.msg_type, OFPT_PACKET_OUT);
        assert_eq!(header.length as usize, msg.len());
        // buffer_id NO_BUFFER, in_port CONTROLLER
        assert_eq!(&msg[8..12], &OFP_NO_BUFFER.to_be_bytes());
        assert_eq!(&msg[12..16], &OFPP_CONTROLLER.to_be_bytes());
        // payload at the tail
        assert_eq!(&msg[msg.len() - 4..], &payload);
    }
}
