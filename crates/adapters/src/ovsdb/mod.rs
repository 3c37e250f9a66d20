pub mod client;

pub use client::OvsdbClient;
