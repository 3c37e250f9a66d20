pub mod poll_adapter;

pub use poll_adapter::RtnetlinkAddrWatch;
