use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::NaiveTime;

/// Raw, string-typed settings as lifted directly from the process environment.
/// Kept separate from `Config` so that parsing/validation happens in one
/// place, the way `haulage`'s `config::V1` is kept separate from
/// `config::Internal`.
#[derive(Debug, Clone)]
struct RawConfig {
    vars: HashMap<String, String>,
}

impl RawConfig {
    fn from_env() -> RawConfig {
        RawConfig {
            vars: std::env::vars().collect(),
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }

    fn require(&self, key: &str) -> String {
        self.get(key)
            .unwrap_or_else(|| panic!("Missing required environment variable {}", key))
    }

    fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_owned())
    }

    fn get_u16_or(&self, key: &str, default: u16) -> u16 {
        self.get(key)
            .map(|v| {
                v.parse()
                    .unwrap_or_else(|_| panic!("{} must be a u16, got '{}'", key, v))
            })
            .unwrap_or(default)
    }
}

/// The immutable, validated configuration handed to every component as
/// `Arc<Config>`, built once in `main` exactly as `haulage` builds
/// `config::Internal` once and clones the `Arc`.
#[derive(Debug)]
pub struct Config {
    pub api_token: String,
    pub email_token: String,

    pub starrocks: DbConfig,
    pub postgres: DbConfig,

    /// NAS-IP -> ordered failover list of FortiGate base URLs.
    pub forti_gate: HashMap<Ipv4Addr, Vec<String>>,

    pub radius_shared_secret: Vec<u8>,
    pub radius_port: u16,
    pub syslog_port: u16,

    pub admin_host: String,
    pub admin_port: u16,

    /// Host/port of the captive-portal/client app that owns the subscriber's
    /// session — keepalive-prodded to re-send Accounting-Start while we wait
    /// for a `RADIUS_Sessions` row to appear.
    pub app_host: String,
    pub app_port: u16,

    pub smtp: SmtpConfig,
    pub ldap: LdapConfig,

    pub report_send_time: NaiveTime,
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub use_ssl: bool,
    pub use_tls: bool,
    pub timeout: std::time::Duration,
    pub sender: String,
}

#[derive(Debug, Clone)]
pub struct LdapConfig {
    pub host: String,
    pub port: u16,
}

impl Config {
    /// Resolves configuration from environment variables. A malformed
    /// deployment fails fast at startup rather than running
    /// half-configured; callers are expected to let panics here terminate
    /// the process.
    pub fn from_env() -> Config {
        let raw = RawConfig::from_env();

        let starrocks = DbConfig {
            host: raw.get_or("STARROCKS_HOST", "localhost"),
            port: raw.get_u16_or("STARROCKS_PORT", 9030),
            user: raw.get_or("STARROCKS_USER", "root"),
            password: raw.get_or("STARROCKS_PASSWORD", ""),
            database: raw.require("STARROCKS_DB"),
        };

        let postgres = DbConfig {
            host: raw.get_or("MYSQL_HOST", "localhost"),
            port: raw.get_u16_or("MYSQL_PORT", 5432),
            user: raw.require("MYSQL_USER"),
            password: raw.require("MYSQL_PASSWORD"),
            database: raw.require("MYSQL_DB"),
        };

        let smtp = SmtpConfig {
            host: raw.require("SMTP_HOST"),
            port: raw.get_u16_or("SMTP_PORT", 25),
            user: raw.get("SMTP_USER"),
            password: raw.get("SMTP_PASSWORD"),
            use_ssl: raw.get_or("SMTP_USE_SSL", "false") == "true",
            use_tls: raw.get_or("SMTP_USE_TLS", "false") == "true",
            timeout: std::time::Duration::from_secs(raw.get_u16_or("SMTP_TIMEOUT", 10) as u64),
            sender: raw.get_or("SMTP_SENDER", "noreply@example.com"),
        };

        let ldap = LdapConfig {
            host: raw.require("LDAP_HOST"),
            port: raw.get_u16_or("LDAP_PORT", 8080),
        };

        let report_send_time = raw
            .get("REPORT_SEND_TIME")
            .map(|v| {
                NaiveTime::parse_from_str(&v, "%H:%M")
                    .unwrap_or_else(|_| panic!("REPORT_SEND_TIME must be HH:MM, got '{}'", v))
            })
            .unwrap_or_else(|| NaiveTime::from_hms_opt(8, 0, 0).unwrap());

        Config {
            api_token: raw.require("API_TOKEN"),
            email_token: raw.require("EMAIL_TOKEN"),
            starrocks,
            postgres,
            forti_gate: parse_forti_gate(&raw),
            radius_shared_secret: raw.require("RADIUS_SHARED_SECRET").into_bytes(),
            radius_port: raw.get_u16_or("RADIUS_PORT", 1813),
            syslog_port: raw.get_u16_or("SYSLOG_PORT", 514),
            admin_host: raw.get_or("MHE_ADMIN_HOST", "0.0.0.0"),
            admin_port: raw.get_u16_or("MHE_ADMIN_PORT", 8000),
            app_host: raw.require("MHE_APP_HOST"),
            app_port: raw.get_u16_or("MHE_APP_PORT", 8001),
            smtp,
            ldap,
            report_send_time,
        }
    }
}

/// Parses `FORTI_GATE_<i>_NAS` / `FORTI_GATE_<i>_FGS` indexed groups, falling
/// back to the legacy single-line `FORTI_GATE="nas1=fg1;fg2|nas2=fg3"` syntax
/// when no indexed form is present, matching
/// `original_source`'s `_parse_forti_gate`.
fn parse_forti_gate(raw: &RawConfig) -> HashMap<Ipv4Addr, Vec<String>> {
    let mut map = HashMap::new();

    let mut index = 0;
    loop {
        let nas_key = format!("FORTI_GATE_{}_NAS", index);
        let fgs_key = format!("FORTI_GATE_{}_FGS", index);
        let (nas_val, fgs_val) = match (raw.get(&nas_key), raw.get(&fgs_key)) {
            (Some(n), Some(f)) => (n, f),
            _ => break,
        };

        let fg_list: Vec<String> = fgs_val
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();

        for nas in nas_val.split(',') {
            let nas = nas.trim();
            if nas.is_empty() {
                continue;
            }
            if let Ok(addr) = Ipv4Addr::from_str(nas) {
                map.insert(addr, fg_list.clone());
            }
        }
        index += 1;
    }

    if !map.is_empty() {
        return map;
    }

    if let Some(legacy) = raw.get("FORTI_GATE") {
        for group in legacy.split('|') {
            let group = group.trim();
            if group.is_empty() {
                continue;
            }
            if let Some((nas, fgs)) = group.split_once('=') {
                if let Ok(addr) = Ipv4Addr::from_str(nas.trim()) {
                    let fg_list: Vec<String> = fgs
                        .split(';')
                        .map(|s| s.trim().to_owned())
                        .filter(|s| !s.is_empty())
                        .collect();
                    map.insert(addr, fg_list);
                }
            }
        }
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_from(pairs: &[(&str, &str)]) -> RawConfig {
        RawConfig {
            vars: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn indexed_form_takes_priority_over_legacy() {
        let raw = raw_from(&[
            ("FORTI_GATE_0_NAS", "1.1.1.1"),
            ("FORTI_GATE_0_FGS", "fg-a,fg-b"),
            ("FORTI_GATE", "9.9.9.9=fg-z"),
        ]);
        let map = parse_forti_gate(&raw);
        assert_eq!(map.len(), 1);
        assert_eq!(
            map.get(&Ipv4Addr::from_str("1.1.1.1").unwrap()),
            Some(&vec!["fg-a".to_owned(), "fg-b".to_owned()])
        );
    }

    #[test]
    fn legacy_form_parses_multiple_groups() {
        let raw = raw_from(&[("FORTI_GATE", "1.1.1.1=fg-a;fg-b|2.2.2.2=fg-c")]);
        let map = parse_forti_gate(&raw);
        assert_eq!(
            map.get(&Ipv4Addr::from_str("1.1.1.1").unwrap()),
            Some(&vec!["fg-a".to_owned(), "fg-b".to_owned()])
        );
        assert_eq!(
            map.get(&Ipv4Addr::from_str("2.2.2.2").unwrap()),
            Some(&vec!["fg-c".to_owned()])
        );
    }

    #[test]
    fn missing_key_yields_empty_map() {
        let raw = raw_from(&[]);
        assert!(parse_forti_gate(&raw).is_empty());
    }
}
