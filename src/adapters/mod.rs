use std::sync::Arc;

use tracing::info;

use crate::config::AppConfig;
use crate::core::remote::RemoteAdapter;

mod simulated;
mod smb;

pub use simulated::{SimulatedAdapter, Simulator};
pub use smb::SmbAdapter;

pub fn get_adapter(config: &AppConfig) -> Arc<dyn RemoteAdapter> {
    if config.simulation {
        info!("Using simulated share adapter");
        return Arc::new(SimulatedAdapter::demo());
    }

    Arc::new(SmbAdapter::new(&config.share_tool))
}
