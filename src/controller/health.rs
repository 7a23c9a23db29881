//! Node health reporting.
//!
//! Each node tracks three health signals: the last Evaluate, the Run
//! lifecycle, and whatever the managed component reports about itself. The
//! node's overall health is the least healthy of the three.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Health classification, ordered from best to worst.
///
/// `Exited` ranks below `Unhealthy`: a component that stopped running is in
/// a worse state than one that is running but degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
    Exited,
}

impl HealthStatus {
    /// Severity rank used when combining signals; higher is worse.
    fn severity(self) -> u8 {
        match self {
            HealthStatus::Unknown => 0,
            HealthStatus::Healthy => 1,
            HealthStatus::Unhealthy => 2,
            HealthStatus::Exited => 3,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "unknown"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Exited => write!(f, "exited"),
        }
    }
}

/// A point-in-time health record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub status: HealthStatus,
    pub message: String,
    pub updated: DateTime<Utc>,
}

impl Health {
    pub fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            updated: Utc::now(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unknown, message)
    }

    pub fn healthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Healthy, message)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unhealthy, message)
    }

    pub fn exited(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Exited, message)
    }

    /// Combine health records, returning the least healthy one.
    pub fn least_healthy<I: IntoIterator<Item = Health>>(records: I) -> Health {
        records
            .into_iter()
            .max_by_key(|h| h.status.severity())
            .unwrap_or_else(|| Health::unknown("no health reported"))
    }
}
