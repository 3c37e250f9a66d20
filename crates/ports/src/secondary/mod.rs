pub mod addr_watch_port;
pub mod conntrack_port;
pub mod external_ids_port;
pub mod metrics_port;
pub mod switch_port;
