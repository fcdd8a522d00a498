pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod mapping;
pub mod remote;
pub mod state;

use crate::config::BridgeConfig;
use crate::controller::{ControllerHandle, GilrsDriver};
use crate::dispatcher::SessionDispatcher;
use crate::remote::RemoteLinkHandle;
use color_eyre::{eyre::eyre, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Status lines waiting for the dispatcher; overflow is dropped by the link
const STATUS_BUFFER: usize = 16;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = BridgeConfig::load().await?;
    info!("Starting bridge with {:?}", config);

    // Capacity 1 keeps the controller thread in step with the dispatcher
    let (press_sender, press_receiver) = mpsc::channel(1);
    let (status_sender, status_receiver) = mpsc::channel(STATUS_BUFFER);

    let driver = Box::new(GilrsDriver::new(config.controller.device_name.clone()));
    let mut controller = ControllerHandle::spawn(driver, Some(config.controller), press_sender)
        .map_err(|e| eyre!("Failed to spawn controller session: {}", e))?;

    let link = RemoteLinkHandle::spawn(Some(config.remote), status_sender);
    let mut link_state = link.subscribe();

    let dispatcher = SessionDispatcher::new(
        config.dispatcher,
        press_receiver,
        status_receiver,
        link.command_sender(),
        controller.signal_sender(),
        controller.subscribe(),
    );
    let mut dispatcher_task = tokio::spawn(dispatcher.run());

    // Only the controller can end the process on its own
    let mut link_state_open = true;
    loop {
        tokio::select! {
            reason = controller.wait_for_exit() => {
                break Err(eyre!("Controller session failed: {}", reason));
            }
            joined = &mut dispatcher_task => {
                break match joined {
                    Ok(()) => {
                        warn!("Dispatcher stopped");
                        Ok(())
                    }
                    Err(e) => Err(eyre!("Dispatcher task failed: {}", e)),
                };
            }
            changed = link_state.changed(), if link_state_open => {
                if changed.is_err() {
                    debug!("Remote link state channel closed");
                    link_state_open = false;
                    continue;
                }
                debug!("Remote link is now {}", *link_state.borrow_and_update());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break Ok(());
            }
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
