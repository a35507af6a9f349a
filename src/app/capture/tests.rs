use super::*;

use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::app::adb::client::Adb;
use crate::app::config::AppConfig;
use crate::app::dispatcher::TaskDispatcher;
use crate::app::error::{ERR_USAGE, ERR_VALIDATION};
use crate::app::models::{CaptureDetail, CaptureOutcome, CaptureState};
use crate::app::test_support::FakeShellRunner;

const PROGRESS: &str = "Main display is 1080x2400 @60.00fps (orientation=ROTATION_0)\n\
Configuring recorder for 1080x2400 video/avc at 20.00Mbps\n\
Encoder stopping; recorded 42 frames in 2 seconds\n";

struct Harness {
    runner: Arc<FakeShellRunner>,
    dispatcher: Rc<TaskDispatcher>,
    controller: DeviceCaptureController,
    dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = AppConfig::default();
    config.output_path = dir.path().to_string_lossy().to_string();
    config.screen_record.stop_timeout_ms = 50;
    config.screen_record.finalize_delay_ms = 0;
    config.dispatcher.poll_interval_ms = 2;

    let runner = Arc::new(FakeShellRunner::new());
    let adb = Adb::new("adb", runner.clone(), Duration::from_secs(1));
    let dispatcher = Rc::new(TaskDispatcher::new(&config.dispatcher));
    dispatcher.start().expect("start dispatcher");
    let controller = DeviceCaptureController::new(Rc::clone(&dispatcher), adb, &config);
    Harness {
        runner,
        dispatcher,
        controller,
        dir,
    }
}

type OutcomeSlot = Rc<RefCell<Option<CaptureOutcome>>>;

fn outcome_slot() -> (OutcomeSlot, impl FnOnce(CaptureOutcome) + 'static) {
    let slot: OutcomeSlot = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&slot);
    (slot, move |outcome| *sink.borrow_mut() = Some(outcome))
}

fn wait_for_outcome(harness: &Harness, slot: &OutcomeSlot) -> CaptureOutcome {
    harness
        .dispatcher
        .wait_until("capture outcome", Duration::from_secs(5), || {
            slot.borrow().is_some()
        })
        .expect("outcome delivered");
    slot.borrow_mut().take().expect("outcome")
}

fn wait_for_state(harness: &Harness, serial: &str, state: CaptureState) {
    harness
        .dispatcher
        .wait_until("capture state", Duration::from_secs(5), || {
            harness.controller.state(serial) == state
        })
        .expect("state reached");
}

#[test]
fn builds_screenrecord_command() {
    let options = RecordOptions {
        duration: Some(Duration::from_millis(2_500)),
        size: Some("1280x720".to_string()),
        bit_rate: Some(" 4M ".to_string()),
    };
    assert_eq!(
        controller::screenrecord_command(&options, "/sdcard/a.mp4"),
        vec![
            "shell", "screenrecord", "--verbose", "--time-limit", "3", "--size", "1280x720",
            "--bit-rate", "4M", "/sdcard/a.mp4"
        ]
    );
    assert_eq!(
        controller::screenrecord_command(&RecordOptions::default(), "/sdcard/b.mp4"),
        vec!["shell", "screenrecord", "--verbose", "/sdcard/b.mp4"]
    );
}

#[test]
fn second_start_is_usage_error_and_keeps_first_session() {
    let harness = harness();
    harness.runner.stream("screenrecord --verbose", "", false);
    let (_slot, on_complete) = outcome_slot();

    harness
        .controller
        .start_recording("A", RecordOptions::default(), on_complete)
        .expect("first start");
    assert_eq!(harness.controller.state("A"), CaptureState::Starting);

    let err = harness
        .controller
        .start_recording("A", RecordOptions::default(), |_| {})
        .expect_err("second start");
    assert_eq!(err.code, ERR_USAGE);
    assert_eq!(harness.controller.state("A"), CaptureState::Starting);

    wait_for_state(&harness, "A", CaptureState::Recording);
    let err = harness
        .controller
        .start_recording("A", RecordOptions::default(), |_| {})
        .expect_err("still recording");
    assert_eq!(err.code, ERR_USAGE);
    assert_eq!(harness.controller.state("A"), CaptureState::Recording);
    assert_eq!(harness.runner.calls_matching("screenrecord --verbose").len(), 1);
}

#[test]
fn other_devices_record_independently() {
    let harness = harness();
    harness.runner.stream("screenrecord --verbose", "", false);
    harness
        .controller
        .start_recording("A", RecordOptions::default(), |_| {})
        .expect("A");
    harness
        .controller
        .start_recording("B", RecordOptions::default(), |_| {})
        .expect("B");
    assert!(harness.controller.is_recording("A"));
    assert!(harness.controller.is_recording("B"));
}

#[test]
fn stop_without_session_returns_false() {
    let harness = harness();
    assert!(!harness.controller.stop_recording("A"));
    assert_eq!(harness.controller.state("A"), CaptureState::Idle);
}

#[test]
fn record_and_stop_pulls_artifact() {
    let harness = harness();
    harness.runner.stream("screenrecord --verbose", PROGRESS, true);
    harness.runner.pull_writes("pull", b"fake mp4 payload");
    let (slot, on_complete) = outcome_slot();

    harness
        .controller
        .start_recording("emulator-5554", RecordOptions::default(), on_complete)
        .expect("start");
    wait_for_state(&harness, "emulator-5554", CaptureState::Recording);

    assert!(harness.controller.stop_recording("emulator-5554"));
    assert_eq!(harness.controller.state("emulator-5554"), CaptureState::Stopping);
    let outcome = wait_for_outcome(&harness, &slot);

    assert!(outcome.is_success(), "{outcome:?}");
    let CaptureDetail::Video {
        path,
        size_bytes,
        frames,
    } = outcome.detail
    else {
        panic!("expected video detail");
    };
    assert_eq!(size_bytes, 16);
    assert_eq!(frames, Some(42));
    assert!(path.starts_with(harness.dir.path()));
    assert_eq!(std::fs::read(&path).expect("artifact"), b"fake mp4 payload");
    assert_eq!(harness.controller.state("emulator-5554"), CaptureState::Completed);
    assert!(!harness.controller.stop_recording("emulator-5554"));

    assert_eq!(
        harness
            .runner
            .calls_matching("pkill -SIGINT screenrecord")
            .len(),
        1
    );
    assert_eq!(harness.runner.calls_matching("rm -f /sdcard/screenrecord_").len(), 1);
    assert!(harness.controller.errors("emulator-5554").is_empty());
    assert!(matches!(
        harness.controller.progress("emulator-5554").first(),
        Some(RecordProgress::Display {
            width: 1080,
            height: 2400
        })
    ));
}

#[test]
fn zero_byte_artifact_fails_and_accumulates_errors() {
    let harness = harness();
    harness.runner.stream("screenrecord --verbose", "", true);
    harness.runner.pull_writes("pull", b"");

    for _ in 0..2 {
        let (slot, on_complete) = outcome_slot();
        harness
            .controller
            .start_recording("A", RecordOptions::default(), on_complete)
            .expect("start");
        wait_for_state(&harness, "A", CaptureState::Recording);
        assert!(harness.controller.stop_recording("A"));
        let outcome = wait_for_outcome(&harness, &slot);
        assert!(!outcome.is_success());
        assert!(outcome.error.expect("error text").contains("empty"));
        assert_eq!(harness.controller.state("A"), CaptureState::Failed);
    }

    let errors = harness.controller.errors("A");
    assert_eq!(errors.len(), 2);
    harness.controller.clear_errors("A");
    assert!(harness.controller.errors("A").is_empty());
}

#[test]
fn recorder_that_never_exits_times_out_and_is_killed() {
    let harness = harness();
    harness.runner.stream("screenrecord --verbose", "", false);
    let (slot, on_complete) = outcome_slot();

    harness
        .controller
        .start_recording("A", RecordOptions::default(), on_complete)
        .expect("start");
    wait_for_state(&harness, "A", CaptureState::Recording);
    assert!(harness.controller.stop_recording("A"));

    let outcome = wait_for_outcome(&harness, &slot);
    assert!(!outcome.is_success());
    assert!(outcome.error.expect("error").contains("screenrecord to exit"));
    assert!(harness.runner.spawned_kill_flags()[0].load(Ordering::SeqCst));
    assert!(harness.runner.calls_matching("pull").is_empty());
}

#[test]
fn stop_while_starting_is_deferred() {
    let harness = harness();
    harness.runner.stream("screenrecord --verbose", "", true);
    harness.runner.pull_writes("pull", b"data");
    let (slot, on_complete) = outcome_slot();

    harness
        .controller
        .start_recording("A", RecordOptions::default(), on_complete)
        .expect("start");
    assert!(harness.controller.stop_recording("A"));
    assert_eq!(harness.controller.state("A"), CaptureState::Starting);

    let outcome = wait_for_outcome(&harness, &slot);
    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(harness.controller.state("A"), CaptureState::Completed);
}

#[test]
fn duration_schedules_auto_stop() {
    let harness = harness();
    harness.runner.stream("screenrecord --verbose", "", true);
    harness.runner.pull_writes("pull", b"data");
    let (slot, on_complete) = outcome_slot();

    harness
        .controller
        .start_recording(
            "A",
            RecordOptions {
                duration: Some(Duration::from_millis(30)),
                ..RecordOptions::default()
            },
            on_complete,
        )
        .expect("start");

    let outcome = wait_for_outcome(&harness, &slot);
    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(
        harness.runner.calls_matching("--time-limit 1").len(),
        1,
        "{:?}",
        harness.runner.calls()
    );
}

#[test]
fn stop_after_dispatcher_shutdown_fails_the_session() {
    let harness = harness();
    harness.runner.stream("screenrecord --verbose", "", false);
    let (slot, on_complete) = outcome_slot();
    harness
        .controller
        .start_recording("A", RecordOptions::default(), on_complete)
        .expect("start");
    wait_for_state(&harness, "A", CaptureState::Recording);

    harness.dispatcher.shutdown().expect("shutdown");
    assert!(!harness.controller.stop_recording("A"));

    assert_eq!(harness.controller.state("A"), CaptureState::Failed);
    let outcome = slot.borrow_mut().take().expect("outcome delivered");
    assert!(!outcome.is_success());
    assert!(harness.runner.spawned_kill_flags()[0].load(Ordering::SeqCst));
    assert!(harness.runner.calls_matching("pull").is_empty());
    assert_eq!(harness.controller.errors("A").len(), 1);
    assert!(!harness.controller.stop_recording("A"));
}

#[test]
fn failed_launch_reports_failure() {
    let harness = harness();
    let (slot, on_complete) = outcome_slot();
    harness
        .controller
        .start_recording("A", RecordOptions::default(), on_complete)
        .expect("start is accepted");

    let outcome = wait_for_outcome(&harness, &slot);
    assert!(!outcome.is_success());
    assert_eq!(harness.controller.state("A"), CaptureState::Failed);
    assert_eq!(harness.controller.errors("A").len(), 1);
}

#[test]
fn rejects_blank_serial_and_stopped_dispatcher() {
    let harness = harness();
    let err = harness
        .controller
        .start_recording(" ", RecordOptions::default(), |_| {})
        .expect_err("blank serial");
    assert_eq!(err.code, ERR_VALIDATION);

    harness.dispatcher.shutdown().expect("shutdown");
    let err = harness
        .controller
        .queue_screen_capture("A", |_| {})
        .expect_err("dispatcher stopped");
    assert_eq!(err.code, ERR_USAGE);
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = image::DynamicImage::ImageRgb8(image::RgbImage::new(width, height));
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .expect("encode png");
    bytes
}

#[test]
fn screenshot_is_decoded_held_and_saved() {
    let harness = harness();
    harness.runner.pull_writes("pull", &png_bytes(4, 3));
    let (slot, on_complete) = outcome_slot();

    harness
        .controller
        .queue_screen_capture("A", on_complete)
        .expect("queue");
    let outcome = wait_for_outcome(&harness, &slot);

    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(
        outcome.detail,
        CaptureDetail::Screenshot {
            width: 4,
            height: 3
        }
    );
    assert_eq!(
        harness.controller.screenshot_info(),
        Some(("A".to_string(), 4, 3))
    );
    assert_eq!(harness.runner.calls_matching("screencap -p /sdcard/screencap_A_").len(), 1);
    assert_eq!(harness.runner.calls_matching("rm -f /sdcard/screencap_A_").len(), 1);

    let target = harness.dir.path().join("shots").join("latest.png");
    harness.controller.save_screenshot(&target).expect("save");
    let reloaded = image::open(&target).expect("reload");
    assert_eq!((reloaded.width(), reloaded.height()), (4, 3));
}

#[test]
fn failed_screenshot_keeps_previous_state() {
    let harness = harness();
    harness.runner.respond("screencap", "", "screencap: permission denied", 1);
    let (slot, on_complete) = outcome_slot();

    harness
        .controller
        .queue_screen_capture("A", on_complete)
        .expect("queue");
    let outcome = wait_for_outcome(&harness, &slot);

    assert!(!outcome.is_success());
    assert!(harness.controller.screenshot_info().is_none());
    assert!(harness.controller.errors("A")[0].contains("permission denied"));
    assert_eq!(
        harness
            .controller
            .save_screenshot(&harness.dir.path().join("x.png"))
            .expect_err("nothing held")
            .code,
        ERR_VALIDATION
    );
}
