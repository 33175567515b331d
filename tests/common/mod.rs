#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use ticket_gate::build_app;
use ticket_gate::config::{ScanSettings, SigningSecret};
use ticket_gate::credential::CredentialCodec;
use ticket_gate::models::{CheckInPolicy, Event, Ticket, TicketCredential, TicketStatus};
use ticket_gate::scan::{ScanContext, ScanRequest};
use ticket_gate::services::CheckInService;
use ticket_gate::store::{MemoryStore, Stores};

pub const SECRET: &str = "integration-test-secret";

pub fn settings() -> ScanSettings {
    ScanSettings {
        device_rate_limit: 10_000,
        store_timeout: Duration::from_millis(200),
        ..ScanSettings::default()
    }
}

pub fn codec() -> CredentialCodec {
    CredentialCodec::new(&SigningSecret::new(SECRET).unwrap()).unwrap()
}

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub service: Arc<CheckInService>,
    pub router: Router,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_settings(settings())
    }

    pub fn with_settings(settings: ScanSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let secret = SigningSecret::new(SECRET).unwrap();
        let (router, service) =
            build_app(Stores::from_backend(store.clone()), &secret, settings).unwrap();
        Self {
            store,
            service,
            router,
        }
    }

    pub fn event(&self, policy: CheckInPolicy) -> Event {
        let event = Event {
            id: Uuid::new_v4(),
            tenant_id: None,
            checkin_policy: policy,
        };
        self.store.put_event(event.clone());
        event
    }

    pub fn ticket(&self, event: &Event, status: TicketStatus) -> Ticket {
        let ticket = Ticket {
            id: Uuid::new_v4(),
            event_id: event.id,
            tenant_id: event.tenant_id,
            guest_id: Some(Uuid::new_v4()),
            status,
            issued_at: Some(Utc::now()),
            expires_at: None,
            display_code: None,
        };
        self.store.put_ticket(ticket.clone());
        ticket
    }

    /// Issues a credential through the service and returns its payload.
    pub async fn issue(&self, ticket: &Ticket) -> String {
        self.service.issue_credential(ticket.id).await.unwrap().payload
    }

    pub async fn issued_ticket(&self, event: &Event) -> (Ticket, String) {
        let ticket = self.ticket(event, TicketStatus::Issued);
        let payload = self.issue(&ticket).await;
        (ticket, payload)
    }
}

/// Signs a credential for a ticket whose display code is already set.
pub fn sign_for(ticket: &Ticket) -> String {
    codec()
        .sign(&TicketCredential {
            version: 1,
            ticket_id: ticket.id,
            event_id: ticket.event_id,
            tenant_id: ticket.tenant_id,
            display_code: ticket.display_code.clone().unwrap_or_default(),
            issued_at: ticket.issued_at,
            expires_at: ticket.expires_at,
            nonce: Uuid::new_v4().simple().to_string(),
        })
        .unwrap()
}

pub fn request(payload: &str) -> ScanRequest {
    ScanRequest::new(payload)
}

pub fn at(payload: &str, scanned_at: DateTime<Utc>, checkpoint_id: Option<Uuid>) -> ScanRequest {
    ScanRequest {
        scanned_at: Some(scanned_at),
        checkpoint_id,
        device_id: Some("gate-device".to_string()),
        ..ScanRequest::new(payload)
    }
}

pub fn context() -> ScanContext {
    ScanContext::default()
}
