//! Label controls.
//!
//! Labels group tasks across pools. A label can be paused, given a
//! deadline after which its undispatched tasks are canceled, or limited to
//! a number of dispatches per second. The scheduler asks the book for
//! admission before it picks a worker.

use gantry_core::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;

/// Slowest accepted rate, in dispatches per second
pub const MIN_RATE: f64 = 1e-9;

/// Label errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LabelError {
    /// Blank label name
    #[error("Label name is empty")]
    EmptyName,

    /// Rate not a positive number of dispatches per second
    #[error("Rate must be a finite number of dispatches per second, at least 1e-9; got {0}")]
    InvalidRate(f64),
}

/// Settings and rate state of one label
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelMeta {
    /// Tasks carrying the label are held
    pub paused: bool,
    /// Undispatched tasks are canceled once this passes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<Timestamp>,
    /// Dispatches per second
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    /// Earliest next dispatch under the rate limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_after: Option<Timestamp>,
}

/// `Label.update` settings; absent fields keep their value
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelUpdate {
    /// Pause or resume
    #[serde(default)]
    pub paused: Option<bool>,
    /// New deadline
    #[serde(default)]
    pub deadline: Option<Timestamp>,
    /// New rate
    #[serde(default)]
    pub rate: Option<f64>,
}

/// Whether a task may be dispatched now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// No label objects
    Admit,
    /// The named label is paused or rate limited; try again later
    Hold(String),
    /// The named label's deadline has passed
    Expire(String),
}

fn check_name(label: &str) -> Result<(), LabelError> {
    if label.trim().is_empty() {
        return Err(LabelError::EmptyName);
    }
    Ok(())
}

/// Label settings held in process memory
#[derive(Debug, Default)]
pub struct LabelBook {
    labels: RwLock<HashMap<String, LabelMeta>>,
}

impl LabelBook {
    /// Create an empty book
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current settings; a label never configured has the defaults
    pub async fn get(&self, label: &str) -> LabelMeta {
        self.labels.read().await.get(label).cloned().unwrap_or_default()
    }

    /// Merge `update` into a label's settings
    ///
    /// # Errors
    ///
    /// `EmptyName` for a blank label, `InvalidRate` for a rate below
    /// [`MIN_RATE`] or not finite
    pub async fn update(&self, label: &str, update: LabelUpdate) -> Result<LabelMeta, LabelError> {
        check_name(label)?;
        if let Some(rate) = update.rate {
            if !rate.is_finite() || rate < MIN_RATE {
                return Err(LabelError::InvalidRate(rate));
            }
        }
        let mut labels = self.labels.write().await;
        let meta = labels.entry(label.to_string()).or_default();
        if let Some(paused) = update.paused {
            meta.paused = paused;
        }
        if let Some(deadline) = update.deadline {
            meta.deadline = Some(deadline);
        }
        if let Some(rate) = update.rate {
            meta.rate = Some(rate);
        }
        tracing::info!(label = %label, paused = meta.paused, deadline = ?meta.deadline, rate = ?meta.rate, "Label updated");
        Ok(meta.clone())
    }

    /// Pause or resume a label
    ///
    /// # Errors
    ///
    /// `EmptyName` for a blank label
    pub async fn set_paused(&self, label: &str, paused: bool) -> Result<LabelMeta, LabelError> {
        self.update(
            label,
            LabelUpdate {
                paused: Some(paused),
                ..LabelUpdate::default()
            },
        )
        .await
    }

    /// Decide whether a task with `labels` may be dispatched at `now`
    ///
    /// Labels are checked in order; the first one that objects decides.
    pub async fn admit(&self, labels: &BTreeSet<String>, now: Timestamp) -> Admission {
        if labels.is_empty() {
            return Admission::Admit;
        }
        let book = self.labels.read().await;
        for label in labels {
            let Some(meta) = book.get(label) else {
                continue;
            };
            if meta.paused {
                return Admission::Hold(label.clone());
            }
            if meta.deadline.is_some_and(|deadline| now > deadline) {
                return Admission::Expire(label.clone());
            }
            if meta.rate.is_some() && meta.allowed_after.is_some_and(|after| now < after) {
                return Admission::Hold(label.clone());
            }
        }
        Admission::Admit
    }

    /// Push back the next allowed dispatch of every rate-limited label
    pub async fn record_dispatch(&self, labels: &BTreeSet<String>, now: Timestamp) {
        if labels.is_empty() {
            return;
        }
        let mut book = self.labels.write().await;
        for label in labels {
            let Some(meta) = book.get_mut(label) else {
                continue;
            };
            if let Some(rate) = meta.rate {
                if let Ok(interval) = Duration::try_from_secs_f64(rate.recip()) {
                    meta.allowed_after = Some(now.add(interval));
                }
            }
        }
    }
}
