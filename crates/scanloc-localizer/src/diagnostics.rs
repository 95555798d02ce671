//! [`DiagnosticsReporter`] – fixed-rate localizer status.
//!
//! Every tick copies the current [`HealthSnapshot`], grades it, and publishes
//! a [`DiagnosticReport`] on [`Topic::Diagnostics`].  The reporter never
//! touches the scan path; it only reads the [`HealthBoard`] through a
//! [`HealthReader`].
//!
//! | Condition | Level | Message |
//! |---|---|---|
//! | no map loaded | WARNING | `No map loaded.` |
//! | state is Initializing | WARNING | `Initializing State.` |
//! | consecutive rejections > 1 | WARNING | `skipping_publish_num > 1.` |
//! | consecutive rejections ≥ limit | ERROR | `skipping_publish_num exceed limit.` |
//!
//! [`Topic::Diagnostics`]: scanloc_middleware::Topic::Diagnostics
//! [`HealthBoard`]: crate::health::HealthBoard

use std::time::Duration;

use chrono::Utc;
use scanloc_middleware::EventBus;
use scanloc_types::{DiagnosticLevel, DiagnosticReport, Event, EventPayload, HealthSnapshot, LocalizerState};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::health::HealthReader;

pub const EVENT_SOURCE: &str = "scanloc::diagnostics";

const DEFAULT_RATE_HZ: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// `name` of every published report.
    pub name: String,
    pub hardware_id: String,
    /// Reports per second.
    pub rate_hz: f64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            name: "ndt_scan_matcher".to_string(),
            hardware_id: String::new(),
            rate_hz: DEFAULT_RATE_HZ,
        }
    }
}

impl DiagnosticsConfig {
    /// Tick period; non-positive or non-finite rates use the default rate.
    pub fn period(&self) -> Duration {
        let rate = if self.rate_hz.is_finite() && self.rate_hz > 0.0 {
            self.rate_hz
        } else {
            DEFAULT_RATE_HZ
        };
        Duration::from_secs_f64(1.0 / rate)
    }
}

/// Grade a snapshot.  `rejection_limit` is the consecutive-rejection count
/// that escalates to ERROR.
pub fn evaluate(snapshot: &HealthSnapshot, rejection_limit: u32) -> (DiagnosticLevel, String) {
    let mut level = DiagnosticLevel::Ok;
    let mut messages = Vec::new();

    match snapshot.state {
        LocalizerState::Idle => {
            level = DiagnosticLevel::Warning;
            messages.push("No map loaded.");
        }
        LocalizerState::Initializing => {
            level = DiagnosticLevel::Warning;
            messages.push("Initializing State.");
        }
        LocalizerState::Tracking | LocalizerState::Degraded => {}
    }
    if snapshot.consecutive_rejections > 1 {
        level = level.max(DiagnosticLevel::Warning);
        messages.push("skipping_publish_num > 1.");
    }
    if snapshot.consecutive_rejections >= rejection_limit {
        level = DiagnosticLevel::Error;
        messages.push("skipping_publish_num exceed limit.");
    }

    (level, messages.join(" "))
}

/// Periodic publisher of [`DiagnosticReport`]s.
pub struct DiagnosticsReporter {
    config: DiagnosticsConfig,
    health: HealthReader,
    bus: EventBus,
    rejection_limit: u32,
    last_level: Option<DiagnosticLevel>,
}

impl DiagnosticsReporter {
    pub fn new(config: DiagnosticsConfig, health: HealthReader, bus: EventBus, rejection_limit: u32) -> Self {
        Self {
            config,
            health,
            bus,
            rejection_limit,
            last_level: None,
        }
    }

    /// Build a report from the current snapshot without publishing it.
    pub fn report(&self) -> DiagnosticReport {
        let snapshot = self.health.snapshot();
        let (level, message) = evaluate(&snapshot, self.rejection_limit);
        DiagnosticReport {
            stamp: Utc::now(),
            name: self.config.name.clone(),
            hardware_id: self.config.hardware_id.clone(),
            level,
            message,
            values: snapshot.key_values(),
        }
    }

    /// Build, log (on level change) and publish one report.
    pub fn tick(&mut self) -> DiagnosticReport {
        let report = self.report();
        if self.last_level != Some(report.level) {
            match report.level {
                DiagnosticLevel::Ok => info!(name = %report.name, "localizer status OK"),
                DiagnosticLevel::Warning => warn!(name = %report.name, status = %report.message, "localizer status WARNING"),
                DiagnosticLevel::Error => error!(name = %report.name, status = %report.message, "localizer status ERROR"),
            }
            self.last_level = Some(report.level);
        }
        self.bus
            .emit(Event::new(EVENT_SOURCE, EventPayload::Diagnostics(report.clone())));
        report
    }

    /// Publish at the configured rate until `shutdown` turns `true` or its
    /// sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.period();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_ms = period.as_secs_f64() * 1000.0, "diagnostics reporter started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("diagnostics reporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthBoard;
    use scanloc_middleware::Topic;

    fn snapshot(state: LocalizerState, consecutive_rejections: u32) -> HealthSnapshot {
        HealthSnapshot {
            state,
            consecutive_rejections,
            ..HealthSnapshot::default()
        }
    }

    #[test]
    fn tracking_without_rejections_is_ok() {
        let (level, message) = evaluate(&snapshot(LocalizerState::Tracking, 1), 5);
        assert_eq!(level, DiagnosticLevel::Ok);
        assert!(message.is_empty());
    }

    #[test]
    fn initializing_warns() {
        let (level, message) = evaluate(&snapshot(LocalizerState::Initializing, 0), 5);
        assert_eq!(level, DiagnosticLevel::Warning);
        assert_eq!(message, "Initializing State.");
    }

    #[test]
    fn idle_warns_about_missing_map() {
        let (level, message) = evaluate(&snapshot(LocalizerState::Idle, 0), 5);
        assert_eq!(level, DiagnosticLevel::Warning);
        assert_eq!(message, "No map loaded.");
    }

    #[test]
    fn two_rejections_warn() {
        let (level, message) = evaluate(&snapshot(LocalizerState::Tracking, 2), 5);
        assert_eq!(level, DiagnosticLevel::Warning);
        assert_eq!(message, "skipping_publish_num > 1.");
    }

    #[test]
    fn rejection_limit_is_error() {
        let (level, message) = evaluate(&snapshot(LocalizerState::Degraded, 5), 5);
        assert_eq!(level, DiagnosticLevel::Error);
        assert_eq!(message, "skipping_publish_num > 1. skipping_publish_num exceed limit.");

        let (level, _) = evaluate(&snapshot(LocalizerState::Degraded, 4), 5);
        assert_eq!(level, DiagnosticLevel::Warning);
    }

    #[test]
    fn messages_accumulate() {
        let (level, message) = evaluate(&snapshot(LocalizerState::Initializing, 6), 5);
        assert_eq!(level, DiagnosticLevel::Error);
        assert!(message.starts_with("Initializing State."));
        assert!(message.ends_with("exceed limit."));
    }

    #[test]
    fn period_follows_rate() {
        let config = DiagnosticsConfig::default();
        assert!((config.period().as_secs_f64() - 0.01).abs() < 1e-9);

        let broken = DiagnosticsConfig {
            rate_hz: 0.0,
            ..DiagnosticsConfig::default()
        };
        assert!((broken.period().as_secs_f64() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn report_carries_snapshot_values() {
        let board = HealthBoard::new();
        board.publish(HealthSnapshot {
            state: LocalizerState::Tracking,
            seq: 12,
            last_fit_score: Some(4.25),
            last_iterations: Some(9),
            ..HealthSnapshot::default()
        });
        let reporter = DiagnosticsReporter::new(DiagnosticsConfig::default(), board.subscribe(), EventBus::default(), 5);

        let report = reporter.report();
        assert_eq!(report.name, "ndt_scan_matcher");
        assert_eq!(report.level, DiagnosticLevel::Ok);
        assert_eq!(report.value("state"), Some("Tracking"));
        assert_eq!(report.value("seq"), Some("12"));
        assert_eq!(report.value("transform_probability"), Some("4.250000"));
        assert_eq!(report.value("iteration_num"), Some("9"));
        assert_eq!(report.value("skipping_publish_num"), Some("0"));
    }

    #[test]
    fn tick_publishes_on_diagnostics_topic() -> Result<(), Box<dyn std::error::Error>> {
        let board = HealthBoard::new();
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Diagnostics);
        let mut reporter = DiagnosticsReporter::new(DiagnosticsConfig::default(), board.subscribe(), bus, 5);

        reporter.tick();
        board.modify(|s| s.state = LocalizerState::Tracking);
        reporter.tick();

        let first = rx.try_recv()?;
        let second = rx.try_recv()?;
        match (first.payload, second.payload) {
            (EventPayload::Diagnostics(a), EventPayload::Diagnostics(b)) => {
                assert_eq!(a.level, DiagnosticLevel::Warning);
                assert_eq!(b.level, DiagnosticLevel::Ok);
            }
            other => panic!("unexpected payloads {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() -> Result<(), Box<dyn std::error::Error>> {
        let board = HealthBoard::new();
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Diagnostics);
        let reporter = DiagnosticsReporter::new(DiagnosticsConfig::default(), board.subscribe(), bus, 5);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(reporter.run(shutdown_rx));

        // The first interval tick fires immediately.
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await??;
        assert!(matches!(event.payload, EventPayload::Diagnostics(_)));

        shutdown_tx.send(true)?;
        tokio::time::timeout(Duration::from_secs(1), task).await??;
        Ok(())
    }

    #[tokio::test]
    async fn run_stops_when_shutdown_sender_dropped() -> Result<(), Box<dyn std::error::Error>> {
        let board = HealthBoard::new();
        let reporter = DiagnosticsReporter::new(DiagnosticsConfig::default(), board.subscribe(), EventBus::default(), 5);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(reporter.run(shutdown_rx));
        drop(shutdown_tx);

        tokio::time::timeout(Duration::from_secs(1), task).await??;
        Ok(())
    }
}
