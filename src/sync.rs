use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::mpsc::{channel, Sender};
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bookings::BookingService;
use crate::config;
use crate::enrollment::{EnrollmentCorrection, EnrollmentTracker};
use crate::ledger::SessionLedger;

/// Reconciles local optimistic state against the authoritative store:
/// a periodic sweep plus a LISTEN/NOTIFY-driven refresh worker, so drift
/// from missed notifications is corrected without waiting for the next
/// tick.

#[derive(Debug)]
pub enum RefreshJob {
    Member { member_id: Uuid },
    Class { class_id: Uuid },
    Booking { booking_id: Uuid },
}

#[derive(Clone)]
pub struct SyncHandle {
    sender: Sender<RefreshJob>,
}

impl SyncHandle {
    pub async fn dispatch(&self, job: RefreshJob) -> Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|err| anyhow!("failed to enqueue consistency refresh job: {err}"))
    }
}

#[derive(Debug, Serialize)]
pub struct SyncReport {
    pub enrollment_corrections: Vec<EnrollmentCorrection>,
    pub auto_completed: u64,
}

/// Periodic sweep: reconcile every class's enrollment counter against its
/// active bookings and auto-complete confirmed bookings whose class has
/// already started.
pub fn spawn(pool: PgPool) {
    let interval = TokioDuration::from_secs(*config::SYNC_SCAN_INTERVAL_SECS);
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            match process_tick(&pool, now).await {
                Ok(report) => {
                    if !report.enrollment_corrections.is_empty() || report.auto_completed > 0 {
                        info!(
                            corrected = report.enrollment_corrections.len(),
                            auto_completed = report.auto_completed,
                            "consistency sweep applied corrections"
                        );
                    }
                }
                Err(err) => warn!(?err, "consistency sweep failed"),
            }
        }
    });
}

pub async fn process_tick(pool: &PgPool, now: DateTime<Utc>) -> Result<SyncReport> {
    let tracker = EnrollmentTracker::new(pool.clone());
    let corrections = tracker.reconcile_all().await?;
    for correction in &corrections {
        warn!(
            class_id = %correction.class_id,
            enrolled = correction.enrolled,
            active_bookings = correction.active_bookings,
            "enrollment counter drifted from active bookings"
        );
    }

    let bookings = BookingService::new(pool.clone());
    let auto_completed = bookings.auto_complete_past(now).await?;
    if auto_completed > 0 {
        debug!(auto_completed, "past confirmed bookings marked attended by default");
    }

    Ok(SyncReport {
        enrollment_corrections: corrections,
        auto_completed,
    })
}

/// Worker draining targeted refresh jobs produced by change notifications.
pub fn start_refresh_worker(pool: PgPool) -> SyncHandle {
    let (tx, mut rx) = channel(64);
    tokio::spawn(async move {
        let tracker = EnrollmentTracker::new(pool.clone());
        let ledger = SessionLedger::new(pool.clone());
        while let Some(job) = rx.recv().await {
            match job {
                RefreshJob::Class { class_id } => match tracker.reconcile(class_id).await {
                    Ok(Some(correction)) => warn!(
                        %class_id,
                        enrolled = correction.enrolled,
                        active_bookings = correction.active_bookings,
                        "corrected enrollment drift after change notification"
                    ),
                    Ok(None) => debug!(%class_id, "enrollment counter already consistent"),
                    Err(err) => error!(?err, %class_id, "failed to reconcile enrollment"),
                },
                RefreshJob::Member { member_id } => match ledger.read_balance(member_id).await {
                    Ok(balance) => debug!(
                        %member_id,
                        remaining = balance.remaining_sessions,
                        total = balance.total_sessions,
                        "refreshed member balance"
                    ),
                    Err(err) => error!(?err, %member_id, "failed to refresh member balance"),
                },
                RefreshJob::Booking { booking_id } => {
                    let class_id: Result<Option<Uuid>, sqlx::Error> =
                        sqlx::query_scalar("SELECT class_id FROM bookings WHERE id = $1")
                            .bind(booking_id)
                            .fetch_optional(&pool)
                            .await;
                    match class_id {
                        Ok(Some(class_id)) => {
                            if let Err(err) = tracker.reconcile(class_id).await {
                                error!(?err, %class_id, "failed to reconcile enrollment");
                            }
                        }
                        Ok(None) => debug!(%booking_id, "booking vanished before refresh"),
                        Err(err) => error!(?err, %booking_id, "failed to look up booking"),
                    }
                }
            }
        }
    });

    SyncHandle { sender: tx }
}

/// Subscribes to the store's change channel and feeds the refresh worker.
/// Payloads are JSON objects with `table` and `id`, published by row-level
/// triggers.
pub fn start_change_listener(pool: PgPool, handle: SyncHandle) {
    tokio::spawn(async move {
        loop {
            match listen_loop(&pool, &handle).await {
                Ok(()) => warn!("change notification stream ended; reconnecting"),
                Err(err) => warn!(?err, "change notification listener failed; reconnecting"),
            }
            time::sleep(TokioDuration::from_secs(5)).await;
        }
    });
}

async fn listen_loop(pool: &PgPool, handle: &SyncHandle) -> Result<()> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen("gymcore_changes").await?;
    info!("subscribed to store change notifications");
    loop {
        let notification = listener.recv().await?;
        match parse_change(notification.payload()) {
            Some(job) => handle.dispatch(job).await?,
            None => debug!(payload = notification.payload(), "ignoring change payload"),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct ChangePayload {
    table: String,
    id: Uuid,
}

fn parse_change(payload: &str) -> Option<RefreshJob> {
    let change: ChangePayload = serde_json::from_str(payload).ok()?;
    match change.table.as_str() {
        "members" => Some(RefreshJob::Member {
            member_id: change.id,
        }),
        "classes" => Some(RefreshJob::Class {
            class_id: change.id,
        }),
        "bookings" => Some(RefreshJob::Booking {
            booking_id: change.id,
        }),
        _ => None,
    }
}
