//! Server onboarding from a form plus an optional pasted access URI.

use serde::Serialize;
use tracing::{info, instrument};

use vpnfleet_core::connstr::{ConnectionParams, parse_access_uri};

use crate::error::FleetError;
use crate::storage::{FleetDatabase, NewServer, Server, ServerStatus};
use crate::sync::{SyncJob, SyncJobManager};

/// Result of onboarding: the stored server and, for active servers, the
/// sync job pushing existing subscribers to it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Onboarded {
    pub server: Server,
    pub assigned: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncJob>,
}

/// Register a server. Fields recovered from `access_uri` override the form;
/// fields the URI does not carry keep their form values.
#[instrument(skip(db, sync, form, access_uri), fields(name = %form.name))]
pub async fn onboard_server(
    db: &FleetDatabase,
    sync: &SyncJobManager,
    mut form: NewServer,
    access_uri: Option<&str>,
) -> Result<Onboarded, FleetError> {
    if let Some(uri) = access_uri.map(str::trim).filter(|u| !u.is_empty()) {
        let params = parse_access_uri(uri)
            .ok_or_else(|| FleetError::Validation("access URI could not be parsed".into()))?;
        merge_connection_params(&mut form, params);
    }
    validate_server(&form)?;

    let server = db.create_server(&form).await?;
    let assigned = db.assign_active_subscriptions_to_server(server.id).await?;
    let sync = if server.status == ServerStatus::Active {
        Some(sync.start(server.id).await?)
    } else {
        None
    };

    info!(server_id = server.id, assigned, "Server onboarded");
    Ok(Onboarded {
        server,
        assigned,
        sync,
    })
}

/// Overwrite form fields with whatever the URI carried.
pub fn merge_connection_params(form: &mut NewServer, params: ConnectionParams) {
    form.public_host = params.public_host;
    form.public_port = i64::from(params.public_port);
    if let Some(security) = params.security {
        form.security = security;
    }
    let optional = [
        (&mut form.pbk, params.pbk),
        (&mut form.fp, params.fp),
        (&mut form.sni, params.sni),
        (&mut form.sid, params.sid),
        (&mut form.spx, params.spx),
        (&mut form.flow, params.flow),
    ];
    for (slot, value) in optional {
        if value.is_some() {
            *slot = value;
        }
    }
}

fn validate_server(form: &NewServer) -> Result<(), FleetError> {
    if form.name.trim().is_empty() {
        return Err(FleetError::Validation("name is required".into()));
    }
    if form.api_url.trim().is_empty() {
        return Err(FleetError::Validation("apiUrl is required".into()));
    }
    if form.public_host.trim().is_empty() {
        return Err(FleetError::Validation("publicHost is required".into()));
    }
    if !(1..=65535).contains(&form.public_port) {
        return Err(FleetError::Validation(format!(
            "publicPort {} is out of range",
            form.public_port
        )));
    }
    if form.inbound_id < 1 {
        return Err(FleetError::Validation("inboundId must be positive".into()));
    }
    Ok(())
}
