//! Cross-thread telemetry handoff and the drain thread.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::config::TelemetryConfig;
use crate::util;

use super::records::{ActionRecord, RequestRecord};

enum Event {
    Action(ActionRecord),
    Request(RequestRecord),
}

/// Cheap, cloneable handle the scheduler uses to emit records. Sends never
/// block; records are dropped silently once the drain thread is gone.
#[derive(Clone)]
pub struct TelemetrySink {
    tx: Sender<Event>,
}

impl TelemetrySink {
    /// A sink with no drain thread; every record is discarded. Used by
    /// tests and embedded setups.
    pub fn disabled() -> Self {
        let (tx, _rx) = unbounded();
        Self { tx }
    }

    pub fn action(&self, record: ActionRecord) {
        let _ = self.tx.send(Event::Action(record));
    }

    pub fn request(&self, record: RequestRecord) {
        let _ = self.tx.send(Event::Request(record));
    }
}

/// Join handle for the drain thread; dropping the sink ends the thread.
pub struct TelemetryHandle {
    thread: Option<std::thread::JoinHandle<()>>,
}

impl TelemetryHandle {
    pub fn join(mut self) {
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

/// Running aggregate of request outcomes over one print interval.
#[derive(Default)]
struct ThroughputWindow {
    count: u64,
    violations: u64,
    latency_sum: u64,
    latency_min: u64,
    latency_max: u64,
}

impl ThroughputWindow {
    fn observe(&mut self, record: &RequestRecord) {
        if record.goodput {
            self.count += 1;
            self.latency_sum += record.latency_ns;
            self.latency_min = if self.count == 1 {
                record.latency_ns
            } else {
                self.latency_min.min(record.latency_ns)
            };
            self.latency_max = self.latency_max.max(record.latency_ns);
        } else {
            self.violations += 1;
        }
    }

    fn print(&mut self, interval_ns: u64) {
        if self.count == 0 && self.violations == 0 {
            tracing::info!(throughput = 0.0, "client throughput");
        } else {
            let throughput = self.count as f64 * 1e9 / interval_ns as f64;
            let total = self.count + self.violations;
            let success_rate = self.count as f64 / total as f64;
            let mean_ms = if self.count > 0 {
                self.latency_sum as f64 / self.count as f64 / 1e6
            } else {
                0.0
            };
            tracing::info!(
                throughput,
                success_pct = success_rate * 100.0,
                violations = self.violations,
                min_ms = self.latency_min as f64 / 1e6,
                max_ms = self.latency_max as f64 / 1e6,
                mean_ms,
                "client throughput"
            );
        }
        *self = Self::default();
    }
}

struct TsvWriter {
    out: BufWriter<File>,
}

impl TsvWriter {
    fn create(path: &Path, header: &str) -> std::io::Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "# started {}", chrono::Utc::now().to_rfc3339())?;
        writeln!(out, "{header}")?;
        Ok(Self { out })
    }

    fn row(&mut self, row: String) {
        if writeln!(self.out, "{row}").is_err() {
            tracing::warn!("telemetry write failed");
        }
    }

    fn flush(&mut self) {
        let _ = self.out.flush();
    }
}

/// Spawn the telemetry drain thread. It owns the TSV files and wakes at a
/// millisecond cadence to drain the queue; the throughput summary prints
/// every `print_interval_ns`.
pub fn spawn_telemetry_thread(
    config: &TelemetryConfig,
    print_interval_ns: u64,
) -> std::io::Result<(TelemetrySink, TelemetryHandle)> {
    let mut actions = TsvWriter::create(&config.action_log, ActionRecord::HEADER)?;
    let mut requests = TsvWriter::create(&config.request_log, RequestRecord::HEADER)?;
    let (tx, rx): (Sender<Event>, Receiver<Event>) = unbounded();

    let thread = std::thread::Builder::new()
        .name("cadence-telemetry".into())
        .spawn(move || {
            let mut window = ThroughputWindow::default();
            let mut last_print = util::now();
            loop {
                match rx.recv_timeout(Duration::from_millis(1)) {
                    Ok(Event::Action(record)) => actions.row(record.tsv_row()),
                    Ok(Event::Request(record)) => {
                        window.observe(&record);
                        requests.row(record.tsv_row());
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                let now = util::now();
                if now.saturating_sub(last_print) >= print_interval_ns {
                    window.print(now - last_print);
                    actions.flush();
                    requests.flush();
                    last_print = now;
                }
            }
            window.print(util::now().saturating_sub(last_print).max(1));
            actions.flush();
            requests.flush();
        })
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    Ok((TelemetrySink { tx }, TelemetryHandle { thread: Some(thread) }))
}
