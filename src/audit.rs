// =============================================================================
// Audit Trail - durable record of every breach, enforcement, and drop
// =============================================================================
//
// Every rule breach, enforcement outcome, gated trade, and malformed event
// lands here. Breach rows carry a JSON snapshot of the state the rule saw
// (positions, quote, daily P&L) so an enforcement decision can be
// reconstructed after the fact. Audit writes must never take the engine
// down: a failed insert is logged and swallowed.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::store::Store;
use crate::types::RuleId;

/// Audit row kinds.
pub const KIND_BREACH: &str = "breach";
pub const KIND_ENFORCEMENT: &str = "enforcement";
pub const KIND_ENFORCEMENT_FAILED: &str = "enforcement_failed";
pub const KIND_GATED: &str = "gated";
pub const KIND_RELEASED: &str = "released";
pub const KIND_MALFORMED: &str = "malformed_event";
pub const KIND_DUPLICATE: &str = "duplicate_event";

/// One persisted audit row, as stored and as served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: String,
    pub at: String,
    pub account_id: String,
    pub rule_id: Option<String>,
    pub symbol: Option<String>,
    pub kind: String,
    pub detail: String,
    /// JSON capture of the inputs behind the row (breach and gate rows).
    pub snapshot: Option<String>,
    pub outcome: Option<String>,
}

/// Store-backed audit writer shared across workers.
pub struct Audit {
    store: Arc<Store>,
}

impl Audit {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Write one audit row. Failures are logged, never propagated.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        account: &str,
        rule_id: Option<RuleId>,
        symbol: Option<&str>,
        kind: &str,
        detail: &str,
        snapshot: Option<&str>,
        outcome: Option<&str>,
    ) {
        let id = Uuid::new_v4().to_string();
        if let Err(e) = self.store.insert_audit(
            &id,
            Utc::now(),
            account,
            rule_id,
            symbol,
            kind,
            detail,
            snapshot,
            outcome,
        ) {
            warn!(account, kind, error = %e, "audit write failed");
        }
    }

    /// Most recent rows, newest first (admin inspection).
    pub fn recent(&self, limit: u32) -> Result<Vec<AuditRecord>> {
        self.store.recent_audit(limit)
    }
}
