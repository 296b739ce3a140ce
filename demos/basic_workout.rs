use std::time::Duration;
use tokio::{sync::broadcast::error::RecvError, time::sleep};
use tracing::{error, info, warn};
use voltra::{normalize, Result, TelemetryEvent, VoltraDevice};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🏋️ Voltra Basic Workout Example");
    info!("Searching for Voltra devices...");

    let device = match VoltraDevice::connect_first().await {
        Ok(device) => device,
        Err(e) => {
            error!("❌ Failed to connect: {}", e.user_message());
            return Err(e);
        }
    };
    info!("✅ Connected");

    // Print each frame as it arrives
    let mut telemetry = device.session().subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match telemetry.recv().await {
                Ok(TelemetryEvent::Frame(frame)) => {
                    let sample = normalize(&frame);
                    info!(
                        "#{:<6} {:<10} pos {:.2}  vel {:+.2} m/s  force {:.0}",
                        sample.sequence, sample.phase, sample.position, sample.velocity, sample.force
                    );
                }
                Ok(TelemetryEvent::RepBoundary) => info!("── rep ──"),
                Ok(TelemetryEvent::SequenceGap { expected, received }) => {
                    warn!("Dropped frames: expected {}, got {}", expected, received);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Printer lagged by {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let recording = device.recording();

    info!("⚖️ Setting 40 lb with 10 lb of chains...");
    recording.set_weight(40).await?;
    recording.set_chains(10).await?;

    info!("🔧 Entering workout mode...");
    recording.prepare().await?;

    for set in 1..=2 {
        info!("▶️ Set {} - engaging motor", set);
        recording.engage().await?;
        sleep(Duration::from_secs(20)).await;

        let duration = recording.end_set().await?;
        info!("⏸️ Set {} done after {:.1}s", set, duration);
        sleep(Duration::from_secs(5)).await;
    }

    let snapshot = device.session().snapshot().await;
    info!("📊 Frames buffered: {}", snapshot.recent_frames.len());
    info!("📊 Sequence gaps: {}", snapshot.gap_count);

    recording.stop().await?;
    device.disconnect().await;
    printer.abort();

    info!("👋 Workout complete");
    Ok(())
}
