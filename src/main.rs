// Probe the robot's hardware and report what was found.

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use avatar_tank_lib::{init_tracing, AvatarCore, CoreConfig};

fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = CoreConfig::load(config_path.as_deref()).context("failed to load configuration")?;

    let core = AvatarCore::new(config).context("failed to start core")?;

    let selection = core
        .get_selected_devices()
        .map_err(|e| anyhow!("{}: {}", e.code, e.message))?;
    println!("{}", selection.summary());

    match core.reconnect_motor() {
        Ok(status) => tracing::info!("Motor controller: {:?}", status),
        Err(e) => tracing::warn!("Motor controller unavailable: {}", e.message),
    }

    core.shutdown();
    Ok(())
}
