pub mod proc_adapter;

pub use proc_adapter::ConntrackCli;
