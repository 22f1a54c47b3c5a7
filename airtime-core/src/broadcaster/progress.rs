use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::pipeline::OverlayWindow;

const TICK: Duration = Duration::from_secs(1);

/// Renders seconds as `XmYs`, rounding to whole seconds first.
pub fn format_clock(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.round() as u64
    } else {
        0
    };
    format!("{}m{}s", total / 60, total % 60)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Tick { elapsed: u64, remaining: f64 },
    EnteringWindow { index: usize, window: OverlayWindow },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);

    /// Called once after the tracker has stopped.
    fn finish(&self) {}
}

/// Rewrites a single countdown line on stdout.
#[derive(Debug, Default)]
pub struct ConsoleProgress;

impl ProgressReporter for ConsoleProgress {
    fn report(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Tick { remaining, .. } => {
                let mut stdout = std::io::stdout().lock();
                let _ = write!(stdout, "\r\u{23f3} remaining {:<10}", format_clock(*remaining));
                let _ = stdout.flush();
            }
            ProgressEvent::EnteringWindow { index, window } => info!(
                target: "airtime::progress",
                window = index + 1,
                start = window.start,
                end = window.end,
                "overlay window opening"
            ),
        }
    }

    fn finish(&self) {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout);
        let _ = stdout.flush();
    }
}

pub struct ProgressTracker;

impl ProgressTracker {
    /// Reports once per second while time remains; keeps ticking silently until `stop` fires.
    ///
    /// Resolves to the number of ticks reported.
    pub fn spawn(
        total_duration: f64,
        windows: Vec<OverlayWindow>,
        reporter: Arc<dyn ProgressReporter>,
        stop: CancellationToken,
    ) -> JoinHandle<u64> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + TICK, TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut announced = vec![false; windows.len()];
            let mut elapsed: u64 = 0;
            let mut reported: u64 = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                elapsed += 1;
                let remaining = total_duration - elapsed as f64;
                if remaining < 0.0 {
                    continue;
                }
                reported += 1;
                reporter.report(&ProgressEvent::Tick { elapsed, remaining });
                for (index, window) in windows.iter().enumerate() {
                    if !announced[index] && window.contains(elapsed as f64) {
                        announced[index] = true;
                        reporter.report(&ProgressEvent::EnteringWindow {
                            index,
                            window: *window,
                        });
                    }
                }
            }
            reported
        })
    }
}
