pub mod app_config;
pub mod delay;
pub mod proxy;

pub use app_config::{APP_CONFIG, FilterConfig};
pub use delay::{HistoryItem, ProxiesSnapshot, ProxyState, average_delay, is_builtin_name};
pub use proxy::{ProtocolOptions, ProxyNode, RealityOptions, TlsOptions, Transport};
