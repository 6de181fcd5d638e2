// uvcam/examples/camera_demo.rs
//
// cargo run --example camera_demo            # 系统摄像头
// cargo run --example camera_demo -- --sim   # 仿真摄像头

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use uvcam::prelude::*;
use uvcam_simulation::{SimCamera, SimDriver};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    // 1. 选择后端
    let driver: Arc<dyn Driver> = if std::env::args().any(|a| a == "--sim") {
        let sim = SimDriver::new();
        sim.plug(SimCamera::webcam("/dev/video-sim0"));
        Arc::new(sim)
    } else {
        create_driver()?
    };
    println!("Backend: {}", driver.name());

    // 2. 枚举设备
    let enumerator = DeviceEnumerator::new(driver.clone(), DeviceFilter::uvc());
    let devices = enumerator.list(&DeviceFilter::uvc())?;
    for d in &devices {
        println!("  {} [{:04x}:{:04x}] {}", d.path, d.vendor_id, d.product_id, d.name);
    }
    let Some(device) = devices.first() else {
        bail!("no UVC camera found");
    };

    // 3. 申请授权 (演示程序直接同意)
    let gate = PermissionGate::new(Arc::new(AutoGrant));
    let Some(grant) = gate.request_access(device)?.wait().into_grant() else {
        bail!("access to {} was not granted", device.path);
    };

    // 4. 打开会话
    let session = UvcSession::new(
        driver,
        SessionConfig::new()
            .resolution(1280, 720)
            .mode(PreviewMode::Mjpeg)
            .encoder(EncoderKind::Passthrough),
    )?;
    session.subscribe(Arc::new(|event: &SessionEvent| match event {
        SessionEvent::StateChanged { from, to } => println!("state: {:?} -> {:?}", from, to),
        SessionEvent::RecordingFinished(s) => {
            println!("recorded {} frames ({} bytes) to {}", s.frames, s.bytes, s.path.display())
        }
        other => println!("event: {:?}", other),
    }));
    session.open(grant).context("open failed")?;

    for (id, range, value) in session.controls() {
        println!("  {:<28} {:>6} in [{}, {}]", id.name(), value, range.min, range.max);
    }

    // 5. 预览
    let (sink, frames) = ChannelSink::new(4, Duration::from_millis(20));
    session.start_preview(sink)?;

    let out_dir = std::env::temp_dir();
    let started = Instant::now();
    let mut recording = false;
    let mut count = 0u64;

    while started.elapsed() < Duration::from_secs(6) {
        let Ok(frame) = frames.recv_timeout(Duration::from_secs(1)) else {
            println!("no frame...");
            continue;
        };
        count += 1;

        if count == 30 {
            let still = session.capture_still(out_dir.join("uvcam-still.jpg"))?;
            println!("still saved: {}", still.wait_timeout(Duration::from_secs(2))?.display());
        }
        if count == 60 && !recording {
            session.start_recording(out_dir.join("uvcam-clip.mjpeg"))?;
            recording = true;
        }
        if count % 30 == 0 {
            let stats = session.stats();
            println!(
                "#{} {}x{} fps {:.1}, dropped {}",
                frame.sequence, frame.width, frame.height, stats.fps, stats.frames_dropped
            );
        }
    }

    // 6. 清理 (Drop 也会收尾，显式调用更清晰)
    session.stop_recording()?;
    session.stop_preview()?;
    session.close()?;
    Ok(())
}
