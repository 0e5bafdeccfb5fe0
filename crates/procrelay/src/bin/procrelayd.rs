//! Stdio carrier: newline-delimited JSON requests on stdin, replies on
//! stdout, logs on stderr. End of input or `exit-carrier` shuts it down.

use anyhow::Result;
use procrelay::carrier::{Carrier, ClientAddress, ControlAction, ControlMessage, Inbound};
use procrelay::logging::{LogFormat, init_tracing};
use procrelay::relay::{lines, write_line};
use procrelay::{CarrierConfig, MemoryStore, PlatformProcessManagerFactory, ProcessManagerFactory};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(LogFormat::from_env());

    let config = CarrierConfig::from_env()?;
    let manager = Arc::new(PlatformProcessManagerFactory::create_process_manager(
        &config.runner,
    ));
    info!(
        "Starting procrelayd ({} process manager)",
        PlatformProcessManagerFactory::platform_name()
    );

    let carrier = Carrier::new(config, manager, Arc::new(MemoryStore::new())).spawn();

    let (address, mut replies) = ClientAddress::channel();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(reply) = replies.recv().await {
            let json = match serde_json::to_string(&reply) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode reply: {}", e);
                    continue;
                }
            };
            if let Err(e) = write_line(&mut stdout, &json).await {
                warn!("Stdout closed: {}", e);
                break;
            }
        }
    });

    let mut input = lines(tokio::io::stdin());
    while let Some(line) = input.next().await {
        if line.trim().is_empty() {
            continue;
        }

        match Inbound::parse(&line) {
            Ok(Inbound::Request(request)) => carrier.request(request, Some(address.clone()))?,
            Ok(Inbound::Control(ControlMessage {
                control: ControlAction::ExitCarrier,
            })) => break,
            Ok(Inbound::Control(ControlMessage { control })) => carrier.control(control)?,
            Err(e) => warn!("Ignoring malformed message: {}", e),
        }
    }

    carrier.shutdown().await;
    drop(address);
    writer.await?;

    info!("procrelayd stopped");
    Ok(())
}
