//! Runs a line of in-process mesh nodes and reports what each one logged

mod config;
mod logging;

use anyhow::Result;
use config::{LogFormat, SimConfig};
use resq_mesh::{LoopbackHub, MeshController, MeshEvent, TransportEventHandler};
use serde_json::json;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

fn endpoint_id(index: usize) -> String {
    format!("ep-{}", index)
}

/// Log every event a node publishes until it is dropped
fn spawn_event_logger(controller: &MeshController) {
    let mut rx = controller.subscribe();
    let node = controller.nickname().to_string();

    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(MeshEvent::Notice { text }) => info!(node = %node, "{}", text),
                Ok(MeshEvent::EmergencyRaised { message }) => {
                    warn!(node = %node, sender = %message.sender, hops = message.hops, "EMERGENCY: {}", message.content)
                }
                Ok(event) => debug!(node = %node, event = ?event, "Mesh event"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(node = %node, skipped, "Event logger lagged")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = SimConfig::from_env()?;
    match config.log_format {
        LogFormat::Json => logging::init_logging(),
        LogFormat::Pretty => logging::init_logging_pretty(),
    }
    info!(nodes = config.nodes, service_id = %config.mesh.service_id, "Starting mesh simulation");

    let hub = LoopbackHub::new();
    let mut nodes = Vec::with_capacity(config.nodes);
    for index in 0..config.nodes {
        let transport = hub.transport(endpoint_id(index));
        let node_config = config
            .mesh
            .clone()
            .with_nickname(format!("Node{:02}", index + 1));
        let controller = Arc::new(MeshController::new(&node_config, transport)?);

        let handler: Weak<dyn TransportEventHandler> = Arc::downgrade(&controller) as Weak<dyn TransportEventHandler>;
        hub.attach(&endpoint_id(index), handler)?;
        spawn_event_logger(&controller);
        nodes.push(controller);
    }

    // Line topology: each node only hears its immediate neighbours
    for a in 0..config.nodes {
        for b in (a + 2)..config.nodes {
            hub.set_out_of_range(&endpoint_id(a), &endpoint_id(b));
        }
    }

    for node in &nodes {
        node.start().await?;
    }
    hub.settle().await;

    let first = &nodes[0];
    let second = &nodes[1];
    let last = &nodes[config.nodes - 1];

    first
        .send_broadcast("Hello from the front of the line", false)
        .await?;
    second
        .send_direct("Meet at the medical tent", first.nickname())
        .await?;
    last.send_direct("Can you hear me?", first.nickname()).await?;
    last.send_sos().await?;
    hub.settle().await;

    if let Some(alert) = first.current_emergency().await {
        warn!(node = %first.nickname(), sender = %alert.sender, "Dismissing emergency alert");
        first.dismiss_emergency().await;
    }

    // Let the event loggers drain before reporting
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut report = Vec::with_capacity(nodes.len());
    for node in &nodes {
        report.push(json!({
            "nickname": node.nickname(),
            "peers": node.connected_peers().await,
            "known_keys": node.known_keys().await,
            "messages": node.messages().await,
        }));
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    for node in &nodes {
        node.stop().await;
    }
    info!("Mesh simulation finished");

    Ok(())
}
