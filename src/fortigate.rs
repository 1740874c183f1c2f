//! Typed request builders and an HTTP client for the FortiGate REST API.
//!
//! Every call is best-effort: transport failure or a non-2xx status is
//! logged and turned into `None`/`Err(())`-shaped output, never propagated to
//! the reconciler. This mirrors `_post`/`_get`/`_put` in the source system's
//! gateway collaborator, which never raises to its caller either.

use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use slog::Logger;

const TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct FortiGateClient {
    http: Client,
    api_token: String,
    log: Logger,
}

impl FortiGateClient {
    pub fn new(api_token: String, log: Logger) -> FortiGateClient {
        let http = Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(TIMEOUT)
            .build()
            .expect("Failed to build the FortiGate HTTP client");
        FortiGateClient {
            http,
            api_token,
            log,
        }
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.api_token)
    }

    async fn post(&self, fg_addr: &str, path: &str, body: Value) -> Option<Value> {
        let url = format!("https://{}/api/v2/cmdb/{}", fg_addr, path);
        let resp = self.auth(self.http.post(&url).json(&body)).send().await;
        self.handle(fg_addr, "POST", &url, resp).await
    }

    async fn put(&self, fg_addr: &str, path: &str, body: Value) -> Option<Value> {
        let url = format!("https://{}/api/v2/cmdb/{}", fg_addr, path);
        let resp = self.auth(self.http.put(&url).json(&body)).send().await;
        self.handle(fg_addr, "PUT", &url, resp).await
    }

    async fn get(&self, fg_addr: &str, path: &str) -> Option<Value> {
        let url = format!("https://{}/api/v2/cmdb/{}", fg_addr, path);
        let resp = self.auth(self.http.get(&url)).send().await;
        self.handle(fg_addr, "GET", &url, resp).await
    }

    async fn delete(&self, fg_addr: &str, path: &str) -> Option<Value> {
        let url = format!("https://{}/api/v2/cmdb/{}", fg_addr, path);
        let resp = self.auth(self.http.delete(&url)).send().await;
        self.handle(fg_addr, "DELETE", &url, resp).await
    }

    async fn handle(
        &self,
        fg_addr: &str,
        method: &str,
        url: &str,
        resp: Result<reqwest::Response, reqwest::Error>,
    ) -> Option<Value> {
        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                slog::warn!(self.log, "FortiGate request failed"; "fg" => fg_addr, "method" => method, "url" => url, "error" => e.to_string());
                return None;
            }
        };
        if !resp.status().is_success() {
            slog::warn!(self.log, "FortiGate returned non-2xx"; "fg" => fg_addr, "method" => method, "status" => resp.status().as_u16());
            return None;
        }
        resp.json::<Value>().await.ok()
    }

    pub async fn create_ip(&self, fg_addr: &str, name: &str, ipv4: &str) -> Option<()> {
        let body = json!({"name": name, "subnet": format!("{} 255.255.255.255", ipv4)});
        self.post(fg_addr, "firewall/address", body).await.map(|_| ())
    }

    pub async fn create_ipv6(&self, fg_addr: &str, name: &str, ipv6: &str) -> Option<()> {
        let body = json!({"name": format!("{}v6", name), "ip6": ipv6});
        self.post(fg_addr, "firewall/address6", body).await.map(|_| ())
    }

    pub async fn create_service(
        &self,
        fg_addr: &str,
        name: &str,
        tcp: &str,
        udp: &str,
    ) -> Option<()> {
        let body = json!({"name": name, "tcp-portrange": tcp, "udp-portrange": udp});
        self.post(fg_addr, "firewall.service/custom", body)
            .await
            .map(|_| ())
    }

    /// Creates the fixed deny-template policy with `srcaddr = [username]` and
    /// the service named `name`. Returns the new `mkey`.
    pub async fn create_policy(&self, fg_addr: &str, name: &str, username: &str) -> Option<i64> {
        let body = json!({
            "name": name,
            "srcintf": [{"name": "PPPoE_vlan"}],
            "dstintf": [{"name": "Core_vlan"}],
            "srcaddr": [{"name": username}],
            "srcaddr6": [{"name": format!("{}v6", username)}],
            "dstaddr": [{"name": "ns3"}, {"name": "ns4"}],
            "dstaddr-negate": "enable",
            "dstaddr6-negate": "enable",
            "service": [{"name": name}],
            "groups": [{"name": "class2"}],
            "logtraffic": "disable",
            "schedule": "always",
            "action": "deny",
        });
        let path = "firewall/policy?datasource=true&with_meta=true&vdom=transparent";
        let resp = self.post(fg_addr, path, body).await?;
        extract_mkey(&resp)
    }

    pub async fn move_policy_to_top(&self, fg_addr: &str, policy_id: i64) -> Option<()> {
        let path = format!("firewall/policy/{}?action=move&before=1", policy_id);
        self.put(fg_addr, &path, json!({})).await.map(|_| ())
    }

    pub async fn get_policy(&self, fg_addr: &str, policy_id: i64) -> Option<Value> {
        let path = format!("firewall/policy/{}", policy_id);
        self.get(fg_addr, &path).await
    }

    /// Read-modify-write: fetches the current policy, mutates its `srcaddr`
    /// (and `srcaddr6`) membership for `add`/`remove`, or its `name` for
    /// `rename`, then re-POSTs (add/rename) or PUTs (remove) the result.
    pub async fn edit_policy(
        &self,
        fg_addr: &str,
        policy_id: i64,
        action: EditAction<'_>,
    ) -> Option<()> {
        let current = self.get_policy(fg_addr, policy_id).await?;
        let mut policy = first_result(&current)?.clone();

        match action {
            EditAction::Add { member } => {
                add_member(&mut policy, "srcaddr", member);
                add_member(&mut policy, "srcaddr6", &format!("{}v6", member));
                let path = format!("firewall/policy/{}", policy_id);
                self.post(fg_addr, &path, policy).await.map(|_| ())
            }
            EditAction::Remove { member } => {
                remove_member(&mut policy, "srcaddr", member);
                remove_member(&mut policy, "srcaddr6", &format!("{}v6", member));
                let path = format!("firewall/policy/{}", policy_id);
                self.put(fg_addr, &path, policy).await.map(|_| ())
            }
            EditAction::Rename { new_name } => {
                policy["name"] = json!(new_name);
                let path = format!("firewall/policy/{}", policy_id);
                self.post(fg_addr, &path, policy).await.map(|_| ())
            }
        }
    }

    pub async fn delete_ip(&self, fg_addr: &str, name: &str) -> Option<()> {
        let path = format!("firewall/address/{}", name);
        self.delete(fg_addr, &path).await.map(|_| ())
    }

    pub async fn delete_ipv6(&self, fg_addr: &str, name: &str) -> Option<()> {
        let path = format!("firewall/address6/{}v6", name);
        self.delete(fg_addr, &path).await.map(|_| ())
    }

    pub async fn delete_service(&self, fg_addr: &str, name: &str) -> Option<()> {
        let path = format!("firewall.service/custom/{}", name);
        self.delete(fg_addr, &path).await.map(|_| ())
    }

    pub async fn delete_policy(&self, fg_addr: &str, policy_id: i64) -> Option<()> {
        let path = format!("firewall/policy/{}", policy_id);
        self.delete(fg_addr, &path).await.map(|_| ())
    }
}

pub enum EditAction<'a> {
    Add { member: &'a str },
    Remove { member: &'a str },
    Rename { new_name: &'a str },
}

fn extract_mkey(resp: &Value) -> Option<i64> {
    resp.get("mkey").and_then(|v| v.as_i64().or_else(|| v.as_str()?.parse().ok()))
}

fn first_result(resp: &Value) -> Option<&Value> {
    resp.get("results").and_then(|r| r.as_array()).and_then(|a| a.first())
}

fn add_member(policy: &mut Value, field: &str, member: &str) {
    let arr = policy
        .as_object_mut()
        .unwrap()
        .entry(field)
        .or_insert_with(|| json!([]));
    let arr = arr.as_array_mut().unwrap();
    let already_present = arr
        .iter()
        .any(|m| m.get("name").and_then(|n| n.as_str()) == Some(member));
    if !already_present {
        arr.push(json!({"name": member}));
    }
}

fn remove_member(policy: &mut Value, field: &str, member: &str) {
    if let Some(arr) = policy.get_mut(field).and_then(|v| v.as_array_mut()) {
        arr.retain(|m| m.get("name").and_then(|n| n.as_str()) != Some(member));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_member_is_idempotent() {
        let mut policy = json!({"srcaddr": [{"name": "u1"}]});
        add_member(&mut policy, "srcaddr", "u1");
        assert_eq!(policy["srcaddr"].as_array().unwrap().len(), 1);
        add_member(&mut policy, "srcaddr", "u2");
        assert_eq!(policy["srcaddr"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn remove_member_drops_only_matching_entry() {
        let mut policy = json!({"srcaddr": [{"name": "u1"}, {"name": "u2"}]});
        remove_member(&mut policy, "srcaddr", "u1");
        let remaining: Vec<_> = policy["srcaddr"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["name"].as_str().unwrap())
            .collect();
        assert_eq!(remaining, vec!["u2"]);
    }

    #[test]
    fn extract_mkey_handles_numeric_and_string() {
        assert_eq!(extract_mkey(&json!({"mkey": 7})), Some(7));
        assert_eq!(extract_mkey(&json!({"mkey": "7"})), Some(7));
        assert_eq!(extract_mkey(&json!({})), None);
    }
}
