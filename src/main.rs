// Demo runner: feeds synthetic camera frames through the parallel pipeline
// and logs what comes out of the event channel. A real deployment replaces
// the frame loop with the camera capture callback.

use reliefscan::{
    MemoryStore, ParallelPipeline, PixelFormat, RawFrame, ScanEvent, ScannerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;

/// A flat frame with a bright highlight band, crudely imitating a raking
/// light pass over a polished surface.
fn synthetic_frame(step: u32) -> Vec<u8> {
    let mut data = vec![0u8; (WIDTH * HEIGHT * 4) as usize];
    let band = (step * 8) % WIDTH;
    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            let i = ((y * WIDTH + x) * 4) as usize;
            let level = if x.abs_diff(band) < 24 { 250 } else { 90 };
            data[i] = level;
            data[i + 1] = level;
            data[i + 2] = level;
            data[i + 3] = 255;
        }
    }
    data
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = ScannerConfig {
        processing_interval: Duration::from_millis(50),
        ..ScannerConfig::default()
    };
    let (pipeline, mut events) = ParallelPipeline::new(config, Arc::new(MemoryStore::default()));
    pipeline.start_calibration();

    let consumer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ScanEvent::Metrics { metrics, stats } => info!(
                    surface = metrics.surface_type.label(),
                    specular = format!("{:.3}", metrics.specular_score),
                    diffuse = format!("{:.3}", metrics.diffuse_score),
                    drop_rate = format!("{:.2}", stats.drop_rate()),
                    "frame analyzed"
                ),
                ScanEvent::Drift(signal) => {
                    info!(magnitude = signal.magnitude, "drift detected")
                }
                ScanEvent::CalibrationCompleted(profile) => info!(
                    specular_adjustment = profile.specular_adjustment,
                    diffuse_adjustment = profile.diffuse_adjustment,
                    "calibration complete"
                ),
                ScanEvent::FrameError { reason } => {
                    info!(reason = reason.as_str(), "frame failed")
                }
            }
        }
    });

    for step in 0..60 {
        let data = synthetic_frame(step);
        let frame = RawFrame {
            pixel_data: &data,
            width: WIDTH,
            height: HEIGHT,
            format: PixelFormat::Rgba8,
            timestamp: Duration::from_millis(step as u64 * 33),
        };
        pipeline.submit_frame(frame).await;
        tokio::time::sleep(Duration::from_millis(33)).await;
    }

    pipeline.shutdown().await;
    let _ = consumer.await;
}
