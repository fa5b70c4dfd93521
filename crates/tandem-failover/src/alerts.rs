//! One-shot alerts raised by background HA work.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tandem_journal::AlertSink;
use tandem_types::AlertKind;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Active alerts, at most one per kind.
#[derive(Debug, Default)]
pub struct AlertRegistry {
    active: Mutex<BTreeMap<AlertKind, Alert>>,
}

impl AlertRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Vec<Alert> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn is_active(&self, kind: AlertKind) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }
}

impl AlertSink for AlertRegistry {
    fn raise(&self, kind: AlertKind, message: String) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.contains_key(&kind) {
            warn!(alert = %kind, %message, "alert raised");
        }
        active.insert(
            kind,
            Alert {
                kind,
                message,
                raised_at: Utc::now(),
            },
        );
    }

    fn clear(&self, kind: AlertKind) {
        let removed = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind);
        if removed.is_some() {
            info!(alert = %kind, "alert cleared");
        }
    }
}
