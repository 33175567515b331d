//! Glue between the HTTP layer and the engine: dispatches domain events and runs
//! credential issuance.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::credential::{CodecError, CredentialCodec, DisplayCodeAllocator, SignedCredential};
use crate::live::{TotalsBroadcaster, TotalsSnapshot};
use crate::models::Attendance;
use crate::scan::{
    BatchReport, BatchRequest, DomainEvent, ScanContext, ScanEngine, ScanError, ScanOutcome,
    ScanRequest,
};
use crate::store::{StoreError, Stores};
use crate::utils::error::AppError;

pub struct CheckInService {
    engine: ScanEngine,
    totals: TotalsBroadcaster,
    codec: CredentialCodec,
    allocator: DisplayCodeAllocator,
    stores: Stores,
}

impl CheckInService {
    pub fn new(engine: ScanEngine, codec: CredentialCodec, stores: Stores) -> Self {
        let totals =
            TotalsBroadcaster::new(stores.attendances.clone(), engine.settings().store_timeout);
        Self {
            engine,
            totals,
            codec,
            allocator: DisplayCodeAllocator::new(stores.codes.clone()),
            stores,
        }
    }

    pub fn engine(&self) -> &ScanEngine {
        &self.engine
    }

    pub fn totals(&self) -> &TotalsBroadcaster {
        &self.totals
    }

    pub async fn scan(
        &self,
        request: ScanRequest,
        context: &ScanContext,
    ) -> Result<ScanOutcome, ScanError> {
        let outcome = self.engine.scan(request, context).await?;
        self.dispatch(&outcome.effects).await;
        Ok(outcome)
    }

    pub async fn reconcile(
        &self,
        batch: BatchRequest,
        context: &ScanContext,
    ) -> Result<BatchReport, ScanError> {
        let report = self.engine.reconcile(batch, context).await?;
        for outcome in report.items.iter().filter_map(|item| item.outcome.as_ref()) {
            self.dispatch(&outcome.effects).await;
        }
        Ok(report)
    }

    async fn dispatch(&self, effects: &[DomainEvent]) {
        for effect in effects {
            match effect {
                DomainEvent::AttendanceRecorded(attendance) => {
                    debug!(attendance_id = %attendance.id, result = %attendance.result, "Attendance recorded");
                    self.totals.record_or_warn(attendance).await;
                }
                DomainEvent::TicketConsumed {
                    ticket_id,
                    event_id,
                } => {
                    info!(%ticket_id, %event_id, "Ticket consumed");
                }
                DomainEvent::DashboardInvalidated { event_id } => {
                    debug!(%event_id, "Dashboard invalidated");
                }
            }
        }
    }

    pub async fn attendances_since(
        &self,
        event_id: Uuid,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<Attendance>, StoreError> {
        self.stores
            .attendances
            .list_since(event_id, after_seq, limit)
            .await
    }

    pub async fn totals_snapshot(&self, event_id: Uuid) -> Result<Arc<TotalsSnapshot>, StoreError> {
        self.totals.snapshot(event_id).await
    }

    /// Signs a fresh credential for the ticket and retires its previous display code.
    pub async fn issue_credential(&self, ticket_id: Uuid) -> Result<SignedCredential, AppError> {
        let ticket = self
            .stores
            .tickets
            .find_ticket(ticket_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Ticket '{}' was not found", ticket_id)))?;

        let signed = self.codec.generate(&ticket, &self.allocator).await?;

        if let Some(previous) = ticket.display_code.as_deref() {
            self.stores
                .codes
                .retire(previous)
                .await
                .map_err(CodecError::from)?;
        }
        self.stores
            .tickets
            .set_display_code(ticket_id, &signed.display_code)
            .await?;

        info!(%ticket_id, display_code = %signed.display_code, "Credential issued");
        Ok(signed)
    }
}
