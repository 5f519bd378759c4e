/**
 * Device Event Stream Example
 *
 * Connects to one device, prints every translated event and toggles the
 * switch once the session is up.
 *
 * Usage: TUYA_ID=.. TUYA_KEY=.. TUYA_ADDR=.. TUYA_VERSION=3.4 cargo run --example device_stream
 */
use std::time::Duration;
use tokio_stream::StreamExt;
use tuya_local::{DeviceBuilder, DeviceEvent, DpSchema, DpType, SchemaDp, SessionConfig, Version};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();

    let device_id = std::env::var("TUYA_ID")?;
    let local_key = std::env::var("TUYA_KEY")?;
    let address = std::env::var("TUYA_ADDR")?;
    let version: Version = std::env::var("TUYA_VERSION")
        .unwrap_or_else(|_| "3.3".to_string())
        .parse()?;

    // Minimal schema for a plug: dp 1 is the relay
    let schema = DpSchema::new(vec![SchemaDp::new(1, "switch_1", DpType::Boolean)]);

    let device = DeviceBuilder::new(device_id.as_str(), local_key)
        .address(address)
        .version(version)
        .schema(schema)
        .config(SessionConfig {
            heartbeat_interval_secs: 7,
            ..Default::default()
        })
        .start()?;

    println!("--- tuya-local event stream ---");
    println!("Listening for events from: {device_id}");

    let stream = device.events();
    tokio::pin!(stream);

    let mut toggled = false;
    loop {
        tokio::select! {
            event = stream.next() => {
                let Some(event) = event else { break };
                match event {
                    DeviceEvent::Connected => {
                        println!("Connected ({})", device.version());
                        if !toggled {
                            toggled = true;
                            let status = device.request_status().await?;
                            let on = status.get("switch_1").and_then(|v| v.as_bool()).unwrap_or(false);
                            device.send_command("switch_1", !on).await?;
                        }
                    }
                    DeviceEvent::StateChanged(state) => {
                        for (code, value) in &state {
                            println!("  {code:<16} = {value}");
                        }
                    }
                    DeviceEvent::Disconnected { code, reason } => {
                        eprintln!("Disconnected [{code}]: {reason}");
                    }
                    DeviceEvent::Reconnecting { attempt, delay } => {
                        println!("Reconnecting (attempt {attempt}) in {delay:?}");
                    }
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(60)) => {
                println!("No events for 60s, stopping");
                break;
            }
        }
    }

    device.stop().await;
    Ok(())
}
