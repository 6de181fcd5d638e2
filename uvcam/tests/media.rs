mod common;

use std::sync::Arc;
use std::time::Duration;

use uvcam::prelude::*;
use uvcam_simulation::SimCamera;

use common::{bus_with, config, open_session, wait_until, EventLog};

#[test]
fn recording_writes_frames_until_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.mjpeg");

    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video30"));
    camera.set_fps(60);
    let session = open_session(driver, &camera, config().encoder(EncoderKind::Passthrough));
    let log = EventLog::attach(&session);

    assert!(matches!(session.start_recording(&path), Err(CameraError::NotPreviewing)));
    session.start_preview(Arc::new(|_f: Frame| {})).unwrap();
    assert_eq!(session.start_recording(&path).unwrap(), SessionState::Recording);
    assert!(matches!(session.start_recording(&path), Err(CameraError::AlreadyRecording)));

    assert!(wait_until(Duration::from_secs(3), || {
        session.recording_status().map(|s| s.frames >= 5).unwrap_or(false)
    }));
    assert_eq!(session.stop_recording().unwrap(), SessionState::Previewing);
    assert!(session.recording_status().is_none());

    let summaries = log.recordings();
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert_eq!(summary.path, path);
    assert!(summary.frames >= 5);
    assert!(summary.error.is_none());
    assert_eq!(std::fs::metadata(&path).unwrap().len(), summary.bytes);

    // MJPEG 直通：文件以 SOI 开头
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
}

#[test]
fn stop_recording_without_recording_is_a_no_op() {
    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video31"));
    let session = open_session(driver, &camera, config());
    let log = EventLog::attach(&session);

    assert_eq!(session.stop_recording().unwrap(), SessionState::Opened);
    session.start_preview(Arc::new(|_f: Frame| {})).unwrap();
    assert_eq!(session.stop_recording().unwrap(), SessionState::Previewing);
    assert!(log.recordings().is_empty());
}

#[test]
fn stop_preview_finalizes_the_recording() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("yuyv.mjpeg");

    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video32"));
    let session = open_session(
        driver,
        &camera,
        config()
            .resolution(640, 480)
            .mode(PreviewMode::Yuyv)
            .encoder(EncoderKind::Transcode),
    );
    let log = EventLog::attach(&session);

    session.start_preview(Arc::new(|_f: Frame| {})).unwrap();
    session.start_recording(&path).unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        session.recording_status().map(|s| s.frames >= 2).unwrap_or(false)
    }));

    assert_eq!(session.stop_preview().unwrap(), SessionState::Opened);
    let summaries = log.recordings();
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].frames >= 2);
    assert!(path.exists());
}

#[test]
fn still_is_taken_from_the_next_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("still.jpg");

    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video33"));
    let session = open_session(driver, &camera, config().resolution(640, 480).mode(PreviewMode::Yuyv));

    assert!(matches!(session.capture_still(&path), Err(CameraError::NotPreviewing)));
    session.start_preview(Arc::new(|_f: Frame| {})).unwrap();

    let request = session.capture_still(&path).unwrap();
    assert_eq!(request.path(), path.as_path());
    let saved = request.wait_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(saved, path);

    let img = image::open(&path).unwrap();
    assert_eq!((img.width(), img.height()), (640, 480));
    // 抓拍不打断预览
    assert_eq!(session.state(), SessionState::Previewing);
}

#[test]
fn pending_still_fails_when_preview_stops() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video34"));
    camera.set_fps(1);
    let session = open_session(driver, &camera, config().frame_timeout(Duration::from_secs(2)));
    session.start_preview(Arc::new(|_f: Frame| {})).unwrap();

    let request = session.capture_still(dir.path().join("never.jpg")).unwrap();
    session.stop_preview().unwrap();
    assert!(matches!(
        request.wait_timeout(Duration::from_secs(1)),
        Err(CameraError::NotPreviewing)
    ));
}
