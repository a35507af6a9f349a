use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use lazy_greentea_lib::app::capture::RecordOptions;
use lazy_greentea_lib::app::config::load_config;
use lazy_greentea_lib::app::error::{new_trace_id, AppError};
use lazy_greentea_lib::app::logging::init_logging;
use lazy_greentea_lib::app::models::{CaptureDetail, CaptureOutcome};
use lazy_greentea_lib::app::state::AppContext;
use serde::Serialize;

#[derive(Debug, Clone)]
struct Args {
    serial: Option<String>,
    out_dir: Option<PathBuf>,
    logcat_sec: u64,
    record_sec: u64,
    with_packages: bool,
}

#[derive(Serialize)]
struct SmokeSummary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    serial: Option<String>,
    adb_program: Option<String>,
    out_dir: String,
    artifacts: HashMap<String, String>,
    checks: Vec<SmokeCheck>,
}

#[derive(Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: &'static str, // pass|fail|skip
    duration_ms: u128,
    artifacts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

const USAGE: &str = "Usage: cargo run --bin smoke -- [--serial SERIAL] [--out DIR] [--logcat-sec N] [--record-sec N] [--with-packages]\n";

fn parse_args() -> Result<Args, String> {
    let mut serial = std::env::var("ANDROID_SERIAL")
        .ok()
        .filter(|s| !s.trim().is_empty());
    let mut out_dir: Option<PathBuf> = None;
    let mut logcat_sec = 2u64;
    let mut record_sec = 0u64;
    let mut with_packages = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--serial" => {
                serial = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if serial.is_none() {
                    return Err("--serial requires a value".to_string());
                }
            }
            "--out" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--out requires a value".to_string())?;
                out_dir = Some(PathBuf::from(value));
            }
            "--logcat-sec" => {
                logcat_sec = parse_seconds(it.next(), "--logcat-sec")?;
            }
            "--record-sec" => {
                record_sec = parse_seconds(it.next(), "--record-sec")?;
            }
            "--with-packages" => {
                with_packages = true;
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            other => return Err(format!("Unknown arg: {other}")),
        }
    }

    Ok(Args {
        serial,
        out_dir,
        logcat_sec,
        record_sec,
        with_packages,
    })
}

fn parse_seconds(value: Option<String>, flag: &str) -> Result<u64, String> {
    value
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| format!("{flag} requires a number of seconds"))
}

fn ensure_dir(path: &Path) -> Result<(), String> {
    fs::create_dir_all(path)
        .map_err(|err| format!("Failed to create dir {}: {err}", path.display()))
}

fn run_check<F>(checks: &mut Vec<SmokeCheck>, name: &'static str, f: F) -> bool
where
    F: FnOnce() -> Result<Vec<String>, AppError>,
{
    let start = Instant::now();
    match f() {
        Ok(artifacts) => {
            checks.push(SmokeCheck {
                name,
                status: "pass",
                duration_ms: start.elapsed().as_millis(),
                artifacts,
                error_code: None,
                error: None,
            });
            true
        }
        Err(err) => {
            checks.push(SmokeCheck {
                name,
                status: "fail",
                duration_ms: start.elapsed().as_millis(),
                artifacts: vec![],
                error_code: Some(err.code.clone()),
                error: Some(err.error),
            });
            false
        }
    }
}

fn skip(checks: &mut Vec<SmokeCheck>, name: &'static str, reason: &str) {
    checks.push(SmokeCheck {
        name,
        status: "skip",
        duration_ms: 0,
        artifacts: vec![],
        error_code: None,
        error: Some(reason.to_string()),
    });
}

fn wait_for_outcome(
    ctx: &AppContext,
    what: &str,
    slot: &Rc<RefCell<Option<CaptureOutcome>>>,
    timeout: Duration,
) -> Result<CaptureOutcome, AppError> {
    ctx.dispatcher()
        .wait_until(what, timeout, || slot.borrow().is_some())?;
    let outcome = slot.borrow_mut().take();
    outcome.ok_or_else(|| AppError::system(format!("{what} produced no outcome"), new_trace_id()))
}

fn outcome_error(outcome: &CaptureOutcome) -> AppError {
    AppError::dependency(
        outcome
            .error
            .clone()
            .unwrap_or_else(|| "capture failed".to_string()),
        new_trace_id(),
    )
}

fn finish(summary: SmokeSummary) -> ! {
    let failed = summary.status == "fail";
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).unwrap_or_default()
    );
    std::process::exit(if failed { 1 } else { 0 });
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let trace_id = new_trace_id();
    let out_dir = args.out_dir.clone().unwrap_or_else(|| {
        let mut p = std::env::temp_dir();
        p.push(format!("lazy_greentea_smoke_{trace_id}"));
        p
    });
    if let Err(err) = ensure_dir(&out_dir) {
        eprintln!("{err}");
        std::process::exit(1);
    }

    let mut artifacts: HashMap<String, String> = HashMap::new();
    let mut checks: Vec<SmokeCheck> = Vec::new();
    let mut summary = SmokeSummary {
        tool: "lazy_greentea_smoke",
        status: "fail",
        trace_id,
        serial: args.serial.clone(),
        adb_program: None,
        out_dir: out_dir.to_string_lossy().to_string(),
        artifacts: HashMap::new(),
        checks: Vec::new(),
    };

    let mut config = match load_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            run_check(&mut checks, "load_config", || Err(err));
            summary.checks = checks;
            finish(summary);
        }
    };
    config.output_path = out_dir.to_string_lossy().to_string();
    init_logging(&config.logging);

    let ctx = match AppContext::new(config) {
        Ok(ctx) => ctx,
        Err(err) => {
            run_check(&mut checks, "resolve_adb", || Err(err));
            summary.checks = checks;
            finish(summary);
        }
    };
    summary.adb_program = Some(ctx.adb().program().to_string());
    if let Err(err) = ctx.start() {
        run_check(&mut checks, "start_dispatcher", || Err(err));
        summary.checks = checks;
        finish(summary);
    }

    let mut ok = true;
    let devices = ctx.devices().clone();
    ok &= run_check(&mut checks, "list_devices", || {
        devices.update_connected_devices_list(true);
        ctx.dispatcher()
            .wait_until("device list", Duration::from_secs(15), || !devices.is_refreshing())?;
        if let Some(err) = devices.last_error() {
            return Err(err);
        }
        let path = out_dir.join("devices.json");
        let body = serde_json::to_string_pretty(&devices.devices())
            .map_err(|err| AppError::system(format!("Failed to serialize devices: {err}"), ""))?;
        fs::write(&path, body)
            .map_err(|err| AppError::system(format!("Failed to write devices: {err}"), ""))?;
        artifacts.insert("devices".to_string(), path.to_string_lossy().to_string());
        Ok(vec![path.to_string_lossy().to_string()])
    });

    let serial = args.serial.clone().or_else(|| {
        let connected = devices.connected_devices();
        (connected.len() == 1).then(|| connected[0].id.clone())
    });
    summary.serial = serial.clone();
    let Some(serial) = serial else {
        for name in ["logcat", "screenshot", "screenrecord", "packages"] {
            skip(&mut checks, name, "No single online device; pass --serial");
        }
        summary.status = "fail";
        summary.artifacts = artifacts;
        summary.checks = checks;
        finish(summary);
    };

    ok &= run_check(&mut checks, "logcat", || {
        let mut session = ctx.start_logcat(&ctx.logcat_request(&serial))?;
        let deadline = Instant::now() + Duration::from_secs(args.logcat_sec);
        while Instant::now() < deadline && session.is_streaming() {
            session.drain();
            std::thread::sleep(Duration::from_millis(50));
        }
        session.drain();
        session.stop();
        let path = out_dir.join("logcat.txt");
        let body = session
            .entries()
            .map(|entry| entry.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        fs::write(&path, body)
            .map_err(|err| AppError::system(format!("Failed to write logcat: {err}"), ""))?;
        artifacts.insert("logcat".to_string(), path.to_string_lossy().to_string());
        Ok(vec![path.to_string_lossy().to_string()])
    });

    let capture = ctx.capture().clone();
    ok &= run_check(&mut checks, "screenshot", || {
        let slot = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&slot);
        capture.queue_screen_capture(&serial, move |outcome| *sink.borrow_mut() = Some(outcome))?;
        let outcome = wait_for_outcome(&ctx, "screenshot", &slot, Duration::from_secs(30))?;
        if !outcome.is_success() {
            return Err(outcome_error(&outcome));
        }
        let path = out_dir.join("screenshot.png");
        capture.save_screenshot(&path)?;
        artifacts.insert("screenshot".to_string(), path.to_string_lossy().to_string());
        Ok(vec![path.to_string_lossy().to_string()])
    });

    if args.record_sec > 0 {
        ok &= run_check(&mut checks, "screenrecord", || {
            let slot = Rc::new(RefCell::new(None));
            let sink = Rc::clone(&slot);
            let options = RecordOptions {
                duration: Some(Duration::from_secs(args.record_sec)),
                ..RecordOptions::from_settings(&ctx.config().screen_record)
            };
            capture.start_recording(&serial, options, move |outcome| {
                *sink.borrow_mut() = Some(outcome)
            })?;
            let timeout = Duration::from_secs(args.record_sec + 30);
            let outcome = wait_for_outcome(&ctx, "screenrecord", &slot, timeout)?;
            match outcome.detail {
                CaptureDetail::Video { ref path, .. } if outcome.is_success() => {
                    let path = path.to_string_lossy().to_string();
                    artifacts.insert("screenrecord".to_string(), path.clone());
                    Ok(vec![path])
                }
                _ => Err(outcome_error(&outcome)),
            }
        });
    } else {
        skip(&mut checks, "screenrecord", "Pass --record-sec N to record");
    }

    if args.with_packages {
        let packages = ctx.packages().clone();
        ok &= run_check(&mut checks, "packages", || {
            let done = Rc::new(RefCell::new(None));
            let sink = Rc::clone(&done);
            packages.refresh(&serial, move |result| {
                *sink.borrow_mut() = Some(result.map(|entries| entries.len()));
            })?;
            ctx.dispatcher()
                .wait_until("package list", Duration::from_secs(30), || done.borrow().is_some())?;
            let result = done.borrow_mut().take();
            result
                .ok_or_else(|| AppError::system("package list produced no result", ""))??;
            let path = out_dir.join("packages.json");
            let body = serde_json::to_string_pretty(&packages.entries())
                .map_err(|err| AppError::system(format!("Failed to serialize packages: {err}"), ""))?;
            fs::write(&path, body)
                .map_err(|err| AppError::system(format!("Failed to write packages: {err}"), ""))?;
            artifacts.insert("packages".to_string(), path.to_string_lossy().to_string());
            Ok(vec![path.to_string_lossy().to_string()])
        });
    } else {
        skip(&mut checks, "packages", "Pass --with-packages to list packages");
    }

    if let Err(err) = ctx.shutdown() {
        ok = false;
        run_check(&mut checks, "shutdown", || Err(err));
    }

    summary.status = if ok { "pass" } else { "fail" };
    summary.artifacts = artifacts;
    summary.checks = checks;
    finish(summary);
}
