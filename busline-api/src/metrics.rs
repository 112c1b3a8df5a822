use axum::{extract::State, http::header, response::IntoResponse};
use busline_booking::{DispatchReport, SweepReport};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::AppError;
use crate::state::AppState;

/// Counters for the background workers, exported in Prometheus text format.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    sweeper: IntCounterVec,
    sweep_runs: IntCounter,
    reminders: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("busline".to_string()), None)?;

        let sweeper = IntCounterVec::new(
            Opts::new("sweeper_items_total", "Items handled by the expiration sweeper"),
            &["result"],
        )?;
        let sweep_runs = IntCounter::new("sweeper_runs_total", "Completed sweeper passes")?;
        let reminders = IntCounterVec::new(
            Opts::new("reminder_jobs_total", "Trip reminder jobs by outcome"),
            &["outcome"],
        )?;

        registry.register(Box::new(sweeper.clone()))?;
        registry.register(Box::new(sweep_runs.clone()))?;
        registry.register(Box::new(reminders.clone()))?;

        Ok(Self {
            registry,
            sweeper,
            sweep_runs,
            reminders,
        })
    }

    pub fn record_sweep(&self, report: &SweepReport) {
        self.sweep_runs.inc();
        let counts = [
            ("locks_removed", report.locks_removed),
            ("bookings_expired", report.bookings_expired),
            ("bookings_failed", report.bookings_failed),
            ("errors", report.errors),
        ];
        for (result, count) in counts {
            self.sweeper.with_label_values(&[result]).inc_by(count as u64);
        }
    }

    pub fn record_dispatch(&self, report: &DispatchReport) {
        let counts = [
            ("sent", report.sent),
            ("degraded", report.degraded),
            ("skipped", report.skipped),
            ("failed", report.failed),
            ("dropped", report.dropped),
        ];
        for (outcome, count) in counts {
            self.reminders.with_label_values(&[outcome]).inc_by(count as u64);
        }
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// GET /metrics
pub async fn export(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let body = state
        .metrics
        .render()
        .map_err(|e| AppError::Internal(format!("metrics encoding failed: {}", e)))?;
    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body))
}
