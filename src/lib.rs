//! Avatar Tank - hardware arbitration and streaming core.
//!
//! Discovers the robot's camera, microphone, speaker and motor controller,
//! then shares them between the live dashboard, recordings and device tests.
//! [`AvatarCore`] is the entry point the web layer drives.

pub mod audio;
pub mod capture;
pub mod commands;
pub mod config;
pub mod devices;
pub mod recorder;
pub mod serial;
pub mod utils;

#[cfg(test)]
mod testing;

pub use commands::{AvatarCore, CommandResult, CorePorts};
pub use config::CoreConfig;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the default filter. Calling this twice is
/// harmless; the second call leaves the first subscriber in place.
pub fn init_tracing() {
    let result = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "avatar_tank=debug,avatar_tank_lib=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if result.is_ok() {
        tracing::info!("Starting Avatar Tank v{}", env!("CARGO_PKG_VERSION"));
    }
}
