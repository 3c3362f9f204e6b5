//! Out-of-band token health check.
//!
//! Asks the validation oracle about every token the wallet holds. Runs
//! outside the approval path; nothing here blocks or alters approvals.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use super::{TokenInventory, ValidationOracle};
use crate::types::Result;

/// Oracle calls in flight at once
const MAX_CONCURRENT_CHECKS: usize = 8;

/// Summary of one health-check pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenHealthReport {
    pub checked: usize,
    pub valid: usize,
    pub spent: usize,
    pub invalid: usize,
    /// Token ids the oracle could not answer for
    pub errored: Vec<String>,
}

impl TokenHealthReport {
    /// Whether every token is valid and unspent
    pub fn is_healthy(&self) -> bool {
        self.checked == self.valid && self.errored.is_empty()
    }
}

/// Validate every token in `inventory` against `oracle`
pub async fn check_tokens(
    inventory: &dyn TokenInventory,
    oracle: &dyn ValidationOracle,
) -> Result<TokenHealthReport> {
    let tokens = inventory.tokens().await?;
    let mut report = TokenHealthReport::default();

    let checks: Vec<_> = tokens
        .iter()
        .map(|token| async move { (token, oracle.validate(token).await) })
        .collect();
    let verdicts: Vec<_> = stream::iter(checks)
        .buffered(MAX_CONCURRENT_CHECKS)
        .collect()
        .await;

    for (token, verdict) in verdicts {
        report.checked += 1;
        match verdict {
            Ok(verdict) if verdict.spent => report.spent += 1,
            Ok(verdict) if verdict.valid => report.valid += 1,
            Ok(_) => report.invalid += 1,
            Err(e) => {
                warn!(token = %token.token_id, error = %e, "Token validation failed");
                report.errored.push(token.token_id.clone());
            }
        }
    }

    info!(
        checked = report.checked,
        valid = report.valid,
        spent = report.spent,
        invalid = report.invalid,
        errored = report.errored.len(),
        "Token health check complete"
    );
    Ok(report)
}
