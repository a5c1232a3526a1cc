//! Subscriber-facing links: the subscription URL and one access URI per
//! server the credential is provisioned on.

use serde::Serialize;
use tracing::warn;

use vpnfleet_core::connstr::{AccessEndpoint, build_access_uri};

use crate::error::FleetError;
use crate::storage::{FleetDatabase, Server};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionLinks {
    pub subscription_url: String,
    pub access_uris: Vec<String>,
}

pub async fn subscription_links(
    db: &FleetDatabase,
    public_base_url: &str,
    subscription_id: &str,
) -> Result<SubscriptionLinks, FleetError> {
    let sub = db.get_subscription(subscription_id).await?;
    let server_ids = db.provisioned_server_ids(subscription_id).await?;
    let servers = db.get_servers(&server_ids).await?;

    let access_uris = servers
        .iter()
        .filter_map(|server| access_uri(&sub.client_id, server))
        .collect();

    Ok(SubscriptionLinks {
        subscription_url: format!(
            "{}/sub/{}",
            public_base_url.trim_end_matches('/'),
            sub.client_id
        ),
        access_uris,
    })
}

fn access_uri(client_id: &str, server: &Server) -> Option<String> {
    let Ok(port) = u16::try_from(server.public_port) else {
        warn!(server_id = server.id, port = server.public_port, "Skipping server with invalid public port");
        return None;
    };
    let endpoint = AccessEndpoint {
        host: &server.public_host,
        port,
        security: &server.security,
        pbk: server.pbk.as_deref(),
        fp: server.fp.as_deref(),
        sni: server.sni.as_deref(),
        sid: server.sid.as_deref(),
        spx: server.spx.as_deref(),
        flow: server.flow.as_deref(),
    };
    Some(build_access_uri(client_id, &endpoint, &server.name))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_helpers::{stored_server, stored_subscription, test_db};
    use vpnfleet_core::connstr::parse_access_uri;

    #[tokio::test]
    async fn links_cover_provisioned_servers_only() {
        let db = test_db().await;
        let a = stored_server(&db, "a").await;
        let b = stored_server(&db, "b").await;
        let sub = stored_subscription(&db, "s1", 30).await;
        db.assign_servers(&sub.id, &[a.id, b.id]).await.unwrap();
        db.set_provisioned(&sub.id, b.id, true).await.unwrap();

        let links = subscription_links(&db, "https://vpn.example/", &sub.id).await.unwrap();
        assert_eq!(links.subscription_url, format!("https://vpn.example/sub/{}", sub.client_id));
        assert_eq!(links.access_uris.len(), 1);

        let uri = &links.access_uris[0];
        assert!(uri.starts_with(&format!("vless://{}@b.example:443?", sub.client_id)));
        assert!(uri.ends_with("#b"));
        let parsed = parse_access_uri(uri).unwrap();
        assert_eq!(parsed.public_host, "b.example");
        assert_eq!(parsed.pbk.as_deref(), Some("PBK"));
    }

    #[tokio::test]
    async fn unknown_subscription_is_not_found() {
        let db = test_db().await;
        assert!(matches!(
            subscription_links(&db, "http://x", "nope").await,
            Err(FleetError::NotFound(_))
        ));
    }
}
