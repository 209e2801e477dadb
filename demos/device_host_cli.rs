//! Hosts the bundled demo BinaryLight device (`demos/switch_power_device/`) so the crate can be
//! exercised end-to-end against a real control point.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use upnp_device_host::action::{ActionError, ActionHandler};
use upnp_device_host::config::HostConfig;
use upnp_device_host::host::DeviceHost;
use upnp_device_host::service_variables::Value;
use upnp_device_host::tree::{DeviceFactory, ParsedDeviceHandlers};

#[derive(Parser, Debug)]
struct Args {
    /// Device description to host; defaults to the bundled demo BinaryLight.
    #[clap(long)]
    description: Option<PathBuf>,
}

fn switch_power_handlers() -> HashMap<String, ActionHandler> {
    // Shared across invocations of the same action, but each action handler only ever touches
    // its own service's state-variable cells through `ServiceNode::set_variable` — this cell is
    // just where `SetTarget` stashes the pending value `GetTarget` reads back.
    let target = Arc::new(AtomicBool::new(false));

    let mut actions: HashMap<String, ActionHandler> = HashMap::new();

    {
        let target = target.clone();
        actions.insert(
            "SetTarget".to_string(),
            Arc::new(move |service, mut scanner| {
                let target = target.clone();
                Box::pin(async move {
                    let new_target: bool = scanner.next()?;
                    target.store(new_target, Ordering::SeqCst);
                    service
                        .set_variable("Status", Value::Boolean(new_target))
                        .await
                        .map_err(ActionError::from)?;
                    Ok(vec![])
                })
            }),
        );
    }

    {
        let target = target.clone();
        actions.insert(
            "GetTarget".to_string(),
            Arc::new(move |_service, _scanner| {
                let target = target.clone();
                Box::pin(async move { Ok(vec![Value::Boolean(target.load(Ordering::SeqCst))]) })
            }),
        );
    }

    actions.insert(
        "GetStatus".to_string(),
        Arc::new(|service, _scanner| {
            Box::pin(async move {
                let status = service
                    .variable("Status")
                    .expect("Status declared in SwitchPower.xml")
                    .get()
                    .await;
                Ok(vec![status])
            })
        }),
    );

    actions
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let description = args.description.unwrap_or_else(|| {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("demos/switch_power_device/description.xml")
    });

    let factory: DeviceFactory = Arc::new(|_info| {
        let mut handlers = ParsedDeviceHandlers::new();
        handlers.insert("SwitchPower".to_string(), switch_power_handlers());
        Ok(handlers)
    });

    let host = DeviceHost::new(HostConfig::new(description.to_string_lossy(), factory));
    host.init().await?;
    tracing::info!(endpoints = ?host.http_endpoints().await, "device host running, ctrl-c to quit");

    tokio::signal::ctrl_c().await?;
    host.quit().await?;
    Ok(())
}
