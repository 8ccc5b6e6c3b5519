use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use handoff_core::{DataEnvelope, EventLoop, TaskConfig, TaskHandle, TaskOwner, live_threads};
use tokio::time::{Duration, interval, sleep};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Stand-in for a USB device that answers slowly.
struct SimulatedDevice {
    serial: &'static str,
    remaining_failures: AtomicU32,
}

impl SimulatedDevice {
    fn new(serial: &'static str, failures: u32) -> Self {
        Self {
            serial,
            remaining_failures: AtomicU32::new(failures),
        }
    }

    fn read_status(&self) -> DataEnvelope {
        std::thread::sleep(std::time::Duration::from_millis(150));
        DataEnvelope::new()
            .with("serial", self.serial)
            .with("firmware", "1.4.2")
            .with("connected", true)
    }

    fn read_pin_retries(&self) -> DataEnvelope {
        std::thread::sleep(std::time::Duration::from_millis(60));
        DataEnvelope::new().with("user_pin", 3).with("admin_pin", 3)
    }

    fn read_otp_slots(&self) -> Result<DataEnvelope, String> {
        std::thread::sleep(std::time::Duration::from_millis(90));
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(format!("device busy (left={left})"));
        }
        Ok(DataEnvelope::new().with("hotp_slots", 3).with("totp_slots", 15))
    }
}

fn print_result(label: &str, data: &DataEnvelope) {
    match data.to_json() {
        Ok(json) => println!("[{label}] {json}"),
        Err(e) => warn!(label, error = %e, "could not render result"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    // (A) 設定: 引数に JSON ファイルがあれば読む
    let base = match std::env::args().nth(1) {
        Some(path) => TaskConfig::from_json_str(&std::fs::read_to_string(&path)?)?,
        None => TaskConfig::default(),
    };
    info!(?base, "task config");

    // (B) 呼び出し側のイベントループと、タスクをまとめて所有する window
    let mut event_loop = EventLoop::new();
    let mut window = TaskOwner::new("main-window");
    let device = Arc::new(SimulatedDevice::new("NK-0042", 1));

    // (C) タスク投入
    let d = Arc::clone(&device);
    TaskHandle::builder(move || d.read_status(), |data| print_result("status", &data))
        .config(base.clone())
        .label("status")
        .spawn_owned(&event_loop.handle(), &mut window)?;

    let d = Arc::clone(&device);
    TaskHandle::builder(move || d.read_pin_retries(), |data| print_result("pin", &data))
        .config(base.clone())
        .label("pin")
        .spawn_owned(&event_loop.handle(), &mut window)?;

    let d = Arc::clone(&device);
    TaskHandle::builder(move || d.read_otp_slots(), |data| print_result("otp", &data))
        .config(base.clone())
        .label("otp")
        .on_error(|err| eprintln!("[otp] {err}"))
        .spawn_owned(&event_loop.handle(), &mut window)?;

    info!(tasks = window.total_tasks(), threads = live_threads(), "spawned");

    // (D) 「描画ループ」を回しながら結果を待つ。consumer はこのスレッドで動く
    let mut frames = interval(Duration::from_millis(50));
    let mut frame_count = 0_u32;
    while event_loop.pending() > 0 {
        tokio::select! {
            _ = frames.tick() => {
                frame_count += 1;
            }
            dispatch = event_loop.dispatch_next() => {
                if let Some(dispatch) = dispatch {
                    info!(task = %dispatch.label, ok = dispatch.is_ok(), "delivered");
                }
            }
        }
    }
    info!(frames = frame_count, "all results delivered");

    // (E) window を閉じる: drop が全スレッドの join を待つ
    sleep(Duration::from_millis(10)).await;
    event_loop.pump();
    window.reap_finished();
    drop(window);
    info!(threads = live_threads(), "window closed");

    Ok(())
}
