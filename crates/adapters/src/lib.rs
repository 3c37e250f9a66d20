#![deny(unsafe_code)]

pub mod addrwatch;
pub mod conntrack;
pub mod openflow;
pub mod ovsdb;
