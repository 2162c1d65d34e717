// crates/trimatrix-p2p/src/sync.rs
//
// Ledger sync protocol: SYNC_LEDGER requests forward a batch of entries to
// the external ledger collaborator, gated on its availability predicate.
// Failures are reported back to the requester as ERROR envelopes, never as
// transport faults, and the request is not retried automatically.

use std::sync::Arc;

use serde_json::Value;

use trimatrix_core::{LedgerWriter, MatrixError};

use crate::envelope::{ErrorPayload, Message, SyncStatusPayload};

/// Handle a SYNC_LEDGER request, producing the reply envelope.
pub async fn handle_sync_ledger(
    ledger: Option<&Arc<dyn LedgerWriter>>,
    entries: Vec<Value>,
) -> Message {
    let Some(ledger) = ledger else {
        return error_reply(MatrixError::WriterUnavailable.to_string());
    };

    if !ledger.is_open_for_new_writers() {
        return error_reply(MatrixError::WriterUnavailable.to_string());
    }

    match ledger.update_ledger(entries).await {
        Ok(()) => Message::SyncLedgerConfirmation(SyncStatusPayload {
            status: "success".to_string(),
        }),
        Err(e) => {
            tracing::warn!("Ledger sync failed: {}", e);
            error_reply(e.to_string())
        }
    }
}

fn error_reply(message: String) -> Message {
    Message::Error(ErrorPayload { message })
}
