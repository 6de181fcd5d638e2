mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use uvcam::prelude::*;
use uvcam_simulation::SimCamera;

use common::{bus_with, config, grant, open_session, wait_until, EventLog};

#[test]
fn preview_walks_the_state_machine() {
    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video10"));
    let session = UvcSession::new(driver, config()).unwrap();
    let log = EventLog::attach(&session);
    assert_eq!(session.state(), SessionState::Closed);

    session.open(grant(&camera)).unwrap();
    assert!(camera.is_claimed());
    let format = session.current_format().unwrap();
    assert_eq!((format.width, format.height), (1920, 1080));
    assert_eq!(format.format, FourCC::MJPEG);

    let (sink, frames) = ChannelSink::new(8, Duration::from_millis(10));
    assert_eq!(session.start_preview(sink).unwrap(), SessionState::Previewing);
    let frame = frames.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!((frame.width, frame.height), (1920, 1080));
    assert!(camera.is_streaming());

    assert_eq!(session.stop_preview().unwrap(), SessionState::Opened);
    assert!(!camera.is_streaming());
    assert_eq!(session.close().unwrap(), SessionState::Closed);

    assert_eq!(
        log.states(),
        vec![
            SessionState::Opening,
            SessionState::Opened,
            SessionState::Previewing,
            SessionState::Opened,
            SessionState::Closing,
            SessionState::Closed,
        ]
    );
}

#[test]
fn close_releases_everything() {
    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video11"));
    let session = open_session(driver, &camera, config());
    session
        .start_preview(Arc::new(|_f: Frame| {}))
        .unwrap();

    assert_eq!(session.close().unwrap(), SessionState::Closed);
    assert!(!camera.is_claimed());
    assert!(!camera.is_streaming());
    assert!(session.device().is_none());
    assert!(session.controls().is_empty());

    // 幂等
    assert_eq!(session.close().unwrap(), SessionState::Closed);
    assert!(matches!(session.get_control(ControlId::Brightness), Err(CameraError::NotOpen)));
}

#[test]
fn preview_requires_an_open_device() {
    let (driver, _camera) = bus_with(SimCamera::webcam("/dev/video12"));
    let session = UvcSession::new(driver, config()).unwrap();
    assert!(matches!(
        session.start_preview(Arc::new(|_f: Frame| {})),
        Err(CameraError::NotOpen)
    ));
    assert_eq!(session.stop_preview().unwrap(), SessionState::Closed);
}

#[test]
fn unadvertised_format_is_refused() {
    let camera = SimCamera::builder("/dev/video13")
        .format(FormatDescriptor::new(1280, 720, FourCC::YUYV))
        .build();
    let (driver, camera) = bus_with(camera);
    let session = UvcSession::new(driver, config().resolution(1920, 1080)).unwrap();

    assert!(matches!(
        session.open(grant(&camera)),
        Err(CameraError::UnsupportedFormat { width: 1920, height: 1080, .. })
    ));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!camera.is_claimed());
}

#[test]
fn yuyv_mode_negotiates_uncompressed() {
    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video14"));
    let session = open_session(
        driver,
        &camera,
        config().resolution(640, 480).mode(PreviewMode::from_code(0)),
    );
    let format = session.current_format().unwrap();
    assert_eq!(format.format, FourCC::YUYV);
    assert_eq!(format.frame_rates, vec![30]);
}

#[test]
fn second_session_on_same_device_is_busy() {
    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video15"));
    let first = open_session(driver.clone(), &camera, config());
    let second = UvcSession::new(driver, config()).unwrap();

    assert!(matches!(second.open(grant(&camera)), Err(CameraError::DeviceBusy)));
    assert_eq!(second.state(), SessionState::Closed);

    // 同一设备在同一会话上重复 open 不报错
    assert_eq!(first.open(grant(&camera)).unwrap(), SessionState::Opened);

    first.close().unwrap();
    assert_eq!(second.open(grant(&camera)).unwrap(), SessionState::Opened);
}

#[test]
fn slow_open_times_out_into_error() {
    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video16"));
    camera.set_configure_delay(Duration::from_millis(500));
    let session = UvcSession::new(driver, config().open_timeout(Duration::from_millis(100))).unwrap();

    let err = session.open(grant(&camera)).unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(session.state(), SessionState::Error);
    assert!(!camera.is_claimed());

    // Error 状态下只接受 close
    assert!(matches!(
        session.start_preview(Arc::new(|_f: Frame| {})),
        Err(CameraError::Faulted(_))
    ));
    assert_eq!(session.close().unwrap(), SessionState::Closed);
    assert!(session.fault().is_none());
}

#[test]
fn set_control_rejects_out_of_range() {
    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video17"));
    let session = open_session(driver, &camera, config());

    let range = session.control_range(ControlId::Brightness).unwrap();
    assert_eq!((range.min, range.max, range.default), (-64, 64, 0));
    assert_eq!(session.set_control(ControlId::Brightness, 20).unwrap(), 20);

    match session.set_control(ControlId::Brightness, 65) {
        Err(CameraError::OutOfRange { value: 65, max: 64, .. }) => {}
        other => panic!("unexpected {:?}", other),
    }
    // 越界写入不改变缓存也不触达硬件
    assert_eq!(session.get_control(ControlId::Brightness).unwrap(), 20);
    assert_eq!(camera.control_value(ControlId::Brightness), Some(20));
    assert_eq!(camera.control_writes(), vec![(ControlId::Brightness, 20)]);

    assert_eq!(session.reset_control(ControlId::Brightness).unwrap(), 0);
    assert_eq!(camera.control_value(ControlId::Brightness), Some(0));
}

#[test]
fn unsupported_controls_are_reported() {
    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video18"));
    let session = UvcSession::new(driver, config()).unwrap();
    assert!(!session.check_support(ControlId::Brightness));

    session.open(grant(&camera)).unwrap();
    assert!(session.check_support(ControlId::Brightness));
    assert!(!session.check_support(ControlId::Zoom));
    assert!(matches!(
        session.set_control(ControlId::Zoom, 1),
        Err(CameraError::ControlNotSupported(ControlId::Zoom))
    ));
    assert_eq!(session.controls().len(), 4);
    assert_eq!(session.supported_formats().unwrap().len(), 4);
}

#[test]
fn hardware_calls_never_overlap() {
    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video19"));
    camera.set_control_latency(Duration::from_millis(2));
    let session = Arc::new(open_session(driver, &camera, config()));
    session.start_preview(Arc::new(|_f: Frame| {})).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let session = session.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    let value = (t * 10 + i) % 60;
                    session.set_control(ControlId::Brightness, value).unwrap();
                    session.get_control(ControlId::Contrast).unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    assert!(camera.probe().calls() > 80);
    assert_eq!(camera.probe().violations(), 0);
    assert_eq!(camera.probe().max_concurrency(), 1);
    assert_eq!(session.state(), SessionState::Previewing);
}

#[test]
fn commands_complete_in_submission_order() {
    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video20"));
    let session = open_session(driver, &camera, config());

    let pending: Vec<_> = (1..=5)
        .map(|v| session.submit_set_control(ControlId::Gain, v * 10))
        .collect();
    for (i, p) in pending.into_iter().enumerate() {
        assert_eq!(p.operation(), "set_control");
        assert_eq!(p.wait().unwrap(), (i as i32 + 1) * 10);
    }
    let writes: Vec<i32> = camera.control_writes().into_iter().map(|(_, v)| v).collect();
    assert_eq!(writes, vec![10, 20, 30, 40, 50]);
}

#[test]
fn slow_sink_drops_oldest_frames() {
    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video21"));
    camera.set_fps(200);
    let session = open_session(driver, &camera, config().frame_queue_depth(2));

    let seen = Arc::new(AtomicU64::new(0));
    let counter = seen.clone();
    session
        .start_preview(Arc::new(move |_f: Frame| {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
        }))
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || session.stats().frames_dropped > 5));
    session.stop_preview().unwrap();

    let stats = session.stats();
    assert!(stats.frames_delivered <= seen.load(Ordering::SeqCst) + 1);
    assert!(camera.frames_produced() > stats.frames_delivered);
    assert_eq!(session.state(), SessionState::Opened);
}

#[test]
fn rebinding_a_sink_keeps_transfers_running() {
    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video22"));
    let session = open_session(driver, &camera, config());

    let (first, first_rx) = ChannelSink::new(64, Duration::from_millis(1));
    let (second, second_rx) = ChannelSink::new(64, Duration::from_millis(1));
    session.start_preview(first.clone()).unwrap();
    first_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    assert_eq!(session.start_preview(first).unwrap(), SessionState::Previewing);
    assert_eq!(session.start_preview(second).unwrap(), SessionState::Previewing);
    let next = second_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(next.sequence > 0);
    assert!(camera.is_streaming());
}

#[test]
fn transfer_failure_faults_the_session() {
    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video23"));
    camera.set_fps(100);
    let session = open_session(driver, &camera, config());
    let log = EventLog::attach(&session);

    session.start_preview(Arc::new(|_f: Frame| {})).unwrap();
    camera.fail_stream_after(3);

    assert!(wait_until(Duration::from_secs(3), || session.state() == SessionState::Error));
    assert!(session.fault().unwrap().contains("isochronous"));
    assert_eq!(log.transfer_faults(), 1);
    assert!(session.stats().transfer_errors >= 1);
    assert!(matches!(
        session.get_control(ControlId::Brightness),
        Err(CameraError::Faulted(_))
    ));

    assert_eq!(session.close().unwrap(), SessionState::Closed);
    assert!(!camera.is_claimed());
}

#[test]
fn driver_frame_timeout_keeps_previewing() {
    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video25"));
    let session = open_session(driver, &camera, config());
    let log = EventLog::attach(&session);

    // 第一次取帧在驱动里超时 (DQBUF 返回 TimedOut)，之后正常出帧
    camera.time_out_next_frames(1);
    let (sink, frames) = ChannelSink::new(8, Duration::from_millis(10));
    session.start_preview(sink).unwrap();
    frames.recv_timeout(Duration::from_secs(2)).unwrap();

    assert_eq!(session.state(), SessionState::Previewing);
    assert!(session.fault().is_none());
    let stats = session.stats();
    assert!(stats.transfer_timeouts >= 1);
    assert_eq!(stats.transfer_errors, 0);
    assert_eq!(log.transfer_faults(), 0);
    assert!(!log.states().contains(&SessionState::Error));
}

#[test]
fn close_while_recording_finalizes_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("closing.mjpeg");

    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video26"));
    camera.set_fps(60);
    let session = open_session(driver, &camera, config().encoder(EncoderKind::Passthrough));
    let log = EventLog::attach(&session);

    session.start_preview(Arc::new(|_f: Frame| {})).unwrap();
    assert_eq!(session.start_recording(&path).unwrap(), SessionState::Recording);
    assert!(wait_until(Duration::from_secs(3), || {
        session.recording_status().map(|s| s.frames >= 2).unwrap_or(false)
    }));

    assert_eq!(session.close().unwrap(), SessionState::Closed);
    assert!(!camera.is_claimed());
    assert!(!camera.is_streaming());
    assert!(session.recording_status().is_none());

    let summaries = log.recordings();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].path, path);
    assert!(summaries[0].frames >= 2);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), summaries[0].bytes);
}

#[test]
fn dropping_the_session_closes_the_device() {
    let (driver, camera) = bus_with(SimCamera::webcam("/dev/video24"));
    let session = open_session(driver, &camera, config());
    session.start_preview(Arc::new(|_f: Frame| {})).unwrap();

    drop(session);
    assert!(!camera.is_claimed());
    assert!(!camera.is_streaming());
}
