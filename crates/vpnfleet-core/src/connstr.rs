//! Access URI (connection string) parsing and building.
//!
//! Servers are onboarded by pasting the access URI a panel hands out:
//!
//! ```text
//! vless://<uuid>@<host>:<port>?<key=value&...>#<label>
//! ```
//!
//! [`parse_access_uri`] runs against untrusted, frequently malformed text and
//! therefore never fails loudly: anything it cannot make sense of yields
//! `None`. [`build_access_uri`] produces the same format for a subscriber's
//! credential on one server.

use serde::{Deserialize, Serialize};
use url::form_urlencoded;

/// Literal scheme prefix of an access URI.
pub const SCHEME: &str = "vless://";

/// Fields recovered from an access URI.
///
/// Host and port are always present on a successful parse; transport-security
/// fields are only set when the query carried them, so callers merge present
/// fields over their own record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParams {
    pub public_host: String,
    pub public_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pbk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
}

/// Parse an access URI into its endpoint and transport-security fields.
///
/// Returns `None` when the scheme is missing, the host is empty, or the port
/// is not an integer in `1..=65535`. Unknown query keys are ignored.
pub fn parse_access_uri(input: &str) -> Option<ConnectionParams> {
    let rest = input.trim().strip_prefix(SCHEME)?;

    // The fragment is a display label only.
    let main = rest.split_once('#').map_or(rest, |(main, _)| main);
    let (authority, query) = main.split_once('?').unwrap_or((main, ""));

    // Nothing before the final '@' is interpreted.
    let host_part = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host)| host);

    let (host, port) = host_part.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.trim_end_matches('/').parse().ok()?;
    if port == 0 {
        return None;
    }

    let mut params = ConnectionParams {
        public_host: host.to_string(),
        public_port: port,
        ..ConnectionParams::default()
    };

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        let slot = match key.as_ref() {
            "security" => &mut params.security,
            "pbk" => &mut params.pbk,
            "fp" => &mut params.fp,
            "sni" => &mut params.sni,
            "sid" => &mut params.sid,
            "spx" => &mut params.spx,
            "flow" => &mut params.flow,
            _ => continue,
        };
        // First occurrence wins for repeated keys.
        if slot.is_none() {
            *slot = Some(value.into_owned());
        }
    }

    Some(params)
}

/// Public endpoint and transport-security settings of one server.
#[derive(Debug, Clone, Copy)]
pub struct AccessEndpoint<'a> {
    pub host: &'a str,
    pub port: u16,
    pub security: &'a str,
    pub pbk: Option<&'a str>,
    pub fp: Option<&'a str>,
    pub sni: Option<&'a str>,
    pub sid: Option<&'a str>,
    pub spx: Option<&'a str>,
    pub flow: Option<&'a str>,
}

/// Build the access URI a subscriber imports into their client.
pub fn build_access_uri(client_id: &str, endpoint: &AccessEndpoint<'_>, label: &str) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    query.append_pair("type", "tcp");
    query.append_pair("encryption", "none");
    query.append_pair("security", endpoint.security);

    let optional = [
        ("pbk", endpoint.pbk),
        ("fp", endpoint.fp),
        ("sni", endpoint.sni),
        ("sid", endpoint.sid),
        ("spx", endpoint.spx),
        ("flow", endpoint.flow),
    ];
    for (key, value) in optional {
        if let Some(v) = value.filter(|v| !v.is_empty()) {
            query.append_pair(key, v);
        }
    }

    let label: String = form_urlencoded::byte_serialize(label.as_bytes()).collect();
    format!(
        "{SCHEME}{client_id}@{}:{}?{}#{label}",
        endpoint.host,
        endpoint.port,
        query.finish()
    )
}
