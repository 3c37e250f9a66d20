pub mod message;
pub mod session;
pub mod switch_adapter;

pub use switch_adapter::OvsSwitchAdapter;
