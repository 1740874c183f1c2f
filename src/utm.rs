//! UTM log ingester: a UDP JSON syslog listener that normalises FortiGate
//! UTM records and Stream-Loads them into the analytical store, grounded in
//! `original_source/core/mhe_log.py`'s `SyslogUDP`/normalisation rules and
//! `original_source/app/routers/routes_radius.py`'s `insert_radius_streamload`
//! for the Stream-Load wire shape.

use std::sync::Arc;

use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use slog::Logger;
use tokio::net::UdpSocket;

use crate::error::UtmError;

pub const EXTENDED_COLUMNS: [&str; 20] = [
    "action",
    "date",
    "dstcountry",
    "dstip",
    "dstport",
    "eventtype",
    "ipaddr",
    "msg",
    "srccountry",
    "srcip",
    "utmtype",
    "time",
    "user",
    "category",
    "hostname",
    "service",
    "url",
    "httpagent",
    "level",
    "threat",
];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UtmLogRecord {
    pub action: Option<String>,
    pub date: Option<String>,
    pub dstcountry: Option<String>,
    pub dstip: Option<String>,
    pub dstport: Option<String>,
    pub eventtype: Option<String>,
    pub ipaddr: Option<String>,
    pub msg: Option<String>,
    pub srccountry: Option<String>,
    pub srcip: Option<String>,
    pub utmtype: Option<String>,
    pub time: Option<String>,
    pub user: Option<String>,
    pub category: Option<String>,
    pub hostname: Option<String>,
    pub service: Option<String>,
    pub url: Option<String>,
    pub httpagent: Option<String>,
    pub level: Option<String>,
    pub threat: Option<String>,
}

impl UtmLogRecord {
    pub fn as_columns(&self) -> [Option<&str>; 20] {
        [
            self.action.as_deref(),
            self.date.as_deref(),
            self.dstcountry.as_deref(),
            self.dstip.as_deref(),
            self.dstport.as_deref(),
            self.eventtype.as_deref(),
            self.ipaddr.as_deref(),
            self.msg.as_deref(),
            self.srccountry.as_deref(),
            self.srcip.as_deref(),
            self.utmtype.as_deref(),
            self.time.as_deref(),
            self.user.as_deref(),
            self.category.as_deref(),
            self.hostname.as_deref(),
            self.service.as_deref(),
            self.url.as_deref(),
            self.httpagent.as_deref(),
            self.level.as_deref(),
            self.threat.as_deref(),
        ]
    }

    pub fn to_csv_row(&self) -> String {
        let mut writer = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::Always)
            .has_headers(false)
            .from_writer(Vec::new());
        writer
            .write_record(self.as_columns().iter().map(|c| c.unwrap_or("")))
            .expect("writing to an in-memory buffer never fails");
        let bytes = writer.into_inner().expect("buffer flush never fails");
        String::from_utf8(bytes)
            .expect("UTM fields are already UTF-8")
            .trim_end_matches(['\r', '\n'])
            .to_owned()
    }
}

/// Decodes a raw syslog datagram into a normalised `UtmLogRecord`. Returns
/// `Err(MalformedPayload)` if the datagram isn't a JSON object, and
/// `Ok(None)` if it parses fine but its `type` field (case insensitive) is
/// not "utm" — that's a different log kind on the same port, not malformed.
pub fn normalize(datagram: &[u8]) -> Result<Option<UtmLogRecord>, UtmError> {
    let text = String::from_utf8_lossy(datagram);
    let value: Value = serde_json::from_str(text.trim()).map_err(|_| UtmError::MalformedPayload)?;
    let obj = value.as_object().ok_or(UtmError::MalformedPayload)?;

    let type_field = match obj.get("type").and_then(|v| v.as_str()) {
        Some(t) => t,
        None => return Ok(None),
    };
    if !type_field.eq_ignore_ascii_case("utm") {
        return Ok(None);
    }

    let get = |key: &str| -> Option<String> {
        obj.get(key).and_then(|v| v.as_str()).map(|s| s.to_owned())
    };

    Ok(Some(UtmLogRecord {
        action: get("action"),
        date: get("date"),
        dstcountry: get("dstcountry"),
        dstip: get("dstip"),
        dstport: get("dstport"),
        eventtype: get("eventtype"),
        ipaddr: get("ipaddr"),
        msg: get("msg"),
        srccountry: get("srccountry"),
        srcip: get("srcip"),
        utmtype: get("subtype"),
        time: get("time"),
        user: get("user"),
        category: get("catdesc"),
        hostname: get("hostname").or_else(|| get("qname")),
        service: get("service"),
        url: get("url"),
        httpagent: get("agent"),
        level: get("crlevel"),
        threat: get("virus").or_else(|| get("attack")).or_else(|| get("threat")),
    }))
}

pub struct StreamLoadTarget {
    pub host: String,
    pub port: u16,
    pub db: String,
    pub table: String,
    pub user: String,
    pub password: String,
}

/// Stream-Loads one CSV row with a unique `label` header, never retrying on
/// failure — the UTM pipeline is observational and loss is tolerable.
pub async fn stream_load(
    client: &Client,
    target: &StreamLoadTarget,
    record: &UtmLogRecord,
    label: &str,
) -> Result<(), UtmError> {
    let url = format!(
        "http://{}:{}/api/{}/{}/_stream_load",
        target.host, target.port, target.db, target.table
    );
    let body = format!("{}\n", record.to_csv_row());

    client
        .put(&url)
        .basic_auth(&target.user, Some(&target.password))
        .header("label", label)
        .header("column_separator", ",")
        .header("format", "csv")
        .header("Expect", "100-continue")
        .body(body)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

pub fn unique_label(unix_epoch_fractional: f64) -> String {
    format!("utm_{}", unix_epoch_fractional)
}

/// Binds the UTM ingester's UDP socket. Split out from `run` so `main` can
/// treat a bind failure as fatal before spawning the receive loop, matching
/// the admin HTTP listener's bind-then-serve treatment.
pub async fn bind(bind_port: u16) -> std::io::Result<UdpSocket> {
    UdpSocket::bind(("0.0.0.0", bind_port)).await
}

pub async fn run(
    socket: UdpSocket,
    target: Arc<StreamLoadTarget>,
    client: Client,
    epoch_now: impl Fn() -> f64 + Send + Sync + 'static,
    log: Logger,
) {
    slog::info!(log, "UTM ingester listening"; "port" => socket.local_addr().map(|a| a.port()).unwrap_or(0));

    let mut buf = vec![0u8; 8192];
    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                slog::error!(log, "Failed to receive syslog datagram"; "error" => e.to_string());
                continue;
            }
        };

        let record = match normalize(&buf[..n]) {
            Ok(Some(r)) => r,
            Ok(None) => continue,
            Err(e) => {
                slog::debug!(log, "Dropping malformed UTM datagram"; "peer" => src.to_string(), "error" => e.to_string());
                continue;
            }
        };

        let label = unique_label(epoch_now());
        match stream_load(&client, &target, &record, &label).await {
            Ok(()) => slog::debug!(log, "Stream-loaded UTM record"; "label" => label.as_str(), "peer" => src.to_string()),
            Err(e) => slog::warn!(log, "Stream-Load failed"; "label" => label.as_str(), "error" => e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_json_payloads_as_malformed() {
        assert!(matches!(normalize(b"not json"), Err(UtmError::MalformedPayload)));
    }

    #[test]
    fn drops_non_utm_type_case_insensitively() {
        assert!(normalize(br#"{"type":"traffic"}"#).unwrap().is_none());
        assert!(normalize(br#"{"type":"UTM"}"#).unwrap().is_some());
    }

    #[test]
    fn renames_fields_per_normalisation_rules() {
        let payload = br#"{
            "type": "utm",
            "qname": "example.com",
            "virus": "eicar",
            "subtype": "virus",
            "catdesc": "malware",
            "agent": "curl/8.0",
            "crlevel": "critical"
        }"#;
        let record = normalize(payload).unwrap().unwrap();
        assert_eq!(record.hostname.as_deref(), Some("example.com"));
        assert_eq!(record.threat.as_deref(), Some("eicar"));
        assert_eq!(record.utmtype.as_deref(), Some("virus"));
        assert_eq!(record.category.as_deref(), Some("malware"));
        assert_eq!(record.httpagent.as_deref(), Some("curl/8.0"));
        assert_eq!(record.level.as_deref(), Some("critical"));
    }

    #[test]
    fn hostname_prefers_explicit_field_over_qname() {
        let payload = br#"{"type":"utm","hostname":"real.example.com","qname":"dns.example.com"}"#;
        let record = normalize(payload).unwrap().unwrap();
        assert_eq!(record.hostname.as_deref(), Some("real.example.com"));
    }

    #[test]
    fn csv_row_has_twenty_quoted_fields() {
        let record = UtmLogRecord {
            user: Some("u1".to_owned()),
            msg: Some("contains \"quotes\"".to_owned()),
            ..Default::default()
        };
        let row = record.to_csv_row();
        assert_eq!(row.matches(',').count(), EXTENDED_COLUMNS.len() - 1);
        assert!(row.contains("\"\"quotes\"\""));
    }
}
