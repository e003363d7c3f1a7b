//! Wall-clock tracking and temporal awareness.
//!
//! A `TimeSync` owns the process-wide clock snapshot.  A background task
//! re-reads the OS clock on an interval (no network) and persists the state
//! document so a later session can tell how stale its last run is.  Readers
//! take the latest snapshot under a mutex; every operation is infallible —
//! persistence failures degrade to a logged warning.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tracing::{info, warn};

use meridian_store::DocumentStore;

const SYSTEM_STATE_FILE: &str = "memory/system_state.json";

/// Age beyond which a past timestamp is considered stale (one hour).
const STALE_AFTER_SECS: f64 = 3600.0;

/// A point-in-time view of the clock.  Cheap to copy around; holders never
/// observe later refreshes.
#[derive(Debug, Clone)]
pub struct ClockSnapshot {
    pub now: DateTime<Local>,
    pub tz: String,
    pub knowledge_cutoff: NaiveDate,
    pub last_sync: DateTime<Local>,
}

impl ClockSnapshot {
    pub fn current_date(&self) -> NaiveDate {
        self.now.date_naive()
    }

    pub fn is_post_cutoff(&self) -> bool {
        self.current_date() > self.knowledge_cutoff
    }
}

/// Persisted shape of `memory/system_state.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct SystemStateDoc {
    current_datetime: String,
    last_sync: String,
    timezone: String,
    knowledge_cutoff: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemporalMetadata {
    pub current_datetime: String,
    pub current_date: String,
    pub tz: String,
    pub last_sync: String,
    pub knowledge_cutoff: String,
    pub is_post_cutoff: bool,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct TimeDiff {
    pub seconds: f64,
    pub minutes: f64,
    pub hours: f64,
    pub days: i64,
    pub is_stale: bool,
}

pub struct TimeSync {
    state: Arc<Mutex<ClockSnapshot>>,
    store: Option<Arc<DocumentStore>>,
    sync_interval: Duration,
    refresher: Mutex<Option<AbortHandle>>,
}

impl TimeSync {
    /// `cutoff` is the ISO date of the local model's training cutoff.  An
    /// unparseable value falls back to the far past so every date reads as
    /// post-cutoff, which errs toward consulting live sources.
    pub fn new(cutoff: &str, sync_interval: Duration, store: Option<Arc<DocumentStore>>) -> Self {
        let knowledge_cutoff = NaiveDate::parse_from_str(cutoff, "%Y-%m-%d").unwrap_or_else(|_| {
            warn!(cutoff, "unparseable knowledge cutoff, assuming everything is post-cutoff");
            NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid epoch date")
        });

        let now = Local::now();
        let snapshot = ClockSnapshot {
            now,
            tz: now.offset().to_string(),
            knowledge_cutoff,
            last_sync: now,
        };

        let sync = Self {
            state: Arc::new(Mutex::new(snapshot)),
            store,
            sync_interval,
            refresher: Mutex::new(None),
        };
        sync.persist_state();
        sync
    }

    /// Latest cached snapshot.  Cheap; does not touch the OS clock.
    pub fn now(&self) -> ClockSnapshot {
        self.state.lock().expect("clock state poisoned").clone()
    }

    /// Re-read the OS clock into the shared snapshot.
    pub fn refresh(&self) {
        let now = Local::now();
        let mut state = self.state.lock().expect("clock state poisoned");
        state.now = now;
        state.tz = now.offset().to_string();
        state.last_sync = now;
    }

    /// Start the background refresher.  Idempotent; a second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.refresher.lock().expect("refresher slot poisoned");
        if slot.is_some() {
            return;
        }

        let sync = Arc::clone(self);
        let interval = self.sync_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                sync.refresh();
                sync.persist_state();
            }
        });
        *slot = Some(handle.abort_handle());
        info!(interval_secs = interval.as_secs(), "clock sync started");
    }

    /// Stop the background refresher, if running.
    pub fn stop(&self) {
        if let Some(handle) = self.refresher.lock().expect("refresher slot poisoned").take() {
            handle.abort();
        }
    }

    fn persist_state(&self) {
        let Some(store) = &self.store else { return };
        let state = self.now();
        let doc = SystemStateDoc {
            current_datetime: state.now.format("%Y-%m-%d %H:%M:%S").to_string(),
            last_sync: state.last_sync.to_rfc3339(),
            timezone: state.tz.clone(),
            knowledge_cutoff: state.knowledge_cutoff.to_string(),
        };
        if let Err(err) = store.save(SYSTEM_STATE_FILE, &doc) {
            warn!(%err, "could not persist clock state, continuing in memory");
        }
    }

    /// True when `date` (or the current date, if `None`) falls after the
    /// knowledge cutoff.
    pub fn is_after_cutoff(&self, date: Option<NaiveDate>) -> bool {
        let state = self.now();
        date.unwrap_or_else(|| state.current_date()) > state.knowledge_cutoff
    }

    pub fn metadata(&self) -> TemporalMetadata {
        let state = self.now();
        TemporalMetadata {
            current_datetime: state.now.format("%Y-%m-%d %H:%M:%S").to_string(),
            current_date: state.current_date().to_string(),
            tz: state.tz.clone(),
            last_sync: state.last_sync.to_rfc3339(),
            knowledge_cutoff: state.knowledge_cutoff.to_string(),
            is_post_cutoff: state.is_post_cutoff(),
        }
    }

    /// Header line prepended to the reasoning trace for time-sensitive prompts.
    pub fn context_header(&self) -> String {
        let state = self.now();
        format!(
            "Current system date/time: {}",
            state.now.format("%Y-%m-%d %H:%M:%S")
        )
    }

    /// Elapsed time from an ISO timestamp to now.  Unparseable input yields a
    /// zeroed diff flagged stale.
    pub fn time_diff(&self, past_iso: &str) -> TimeDiff {
        let past = parse_flexible(past_iso);
        let Some(past) = past else {
            warn!(past_iso, "unparseable timestamp in time_diff");
            return TimeDiff { is_stale: true, ..TimeDiff::default() };
        };

        let elapsed = Local::now().signed_duration_since(past);
        let seconds = elapsed.num_milliseconds() as f64 / 1000.0;
        TimeDiff {
            seconds,
            minutes: seconds / 60.0,
            hours: seconds / 3600.0,
            days: elapsed.num_days(),
            is_stale: seconds > STALE_AFTER_SECS,
        }
    }
}

impl Drop for TimeSync {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accept RFC 3339 (with or without `Z`) and the bare `%Y-%m-%dT%H:%M:%S`
/// form older state files used.
fn parse_flexible(raw: &str) -> Option<DateTime<Local>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Local));
    }
    let normalized = raw.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(normalized, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .and_then(|naive| naive.and_local_timezone(Local).single())
}

// ── Tests ────────────────────────────────────────────────────────────────────
