//! The policy reconciler: a state machine over (signal, profile, session,
//! existing-policy facts) that drives one FortiGate into the desired state
//! per signal, with full-sequence failover across the NAS-IP's configured
//! device list.
//!
//! Implemented as an actor task: a public handle wrapping a
//! `mpsc::Sender<Signal>`, and a background task that receives signals one
//! at a time and dispatches them sequentially. Ordering across signals for
//! the same login is the admission router's job (see `admission`); the
//! channel itself serializes dispatch without blocking senders longer than
//! a send.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use slog::Logger;
use sqlx::PgPool;
use tokio::sync::{mpsc, oneshot};

use crate::error::ReconcileError;
use crate::fortigate::{EditAction, FortiGateClient};
use crate::ports::PortMatrix;
use crate::state;

#[derive(Debug, Clone)]
pub struct SignalData {
    pub login: String,
    pub hash: String,
    pub old_hash: Option<String>,
    pub framed_ip_address: Option<String>,
    pub delegated_ipv6_prefix: Option<String>,
    pub tcp_rules: String,
    pub udp_rules: String,
    pub nas_ip_address: Ipv4Addr,
    pub policy_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum Signal {
    Create(SignalData),
    Edit(SignalData),
    Delete(SignalData),
}

struct DispatchMessage {
    signal: Signal,
    out_channel: oneshot::Sender<Result<(), ReconcileError>>,
}

#[derive(Clone)]
pub struct Handle {
    dispatch_channel: mpsc::Sender<DispatchMessage>,
}

impl Handle {
    pub async fn dispatch(&self, signal: Signal) -> Result<(), ReconcileError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch_channel
            .send(DispatchMessage {
                signal,
                out_channel: tx,
            })
            .await
            .or(Err(ReconcileError::CommunicationError))?;
        rx.await.unwrap_or(Err(ReconcileError::CommunicationError))
    }
}

pub fn spawn(
    pool: Arc<PgPool>,
    fg: FortiGateClient,
    forti_gate: Arc<HashMap<Ipv4Addr, Vec<String>>>,
    ports: Arc<PortMatrix>,
    log: Logger,
) -> Handle {
    let (tx, rx) = mpsc::channel(256);
    tokio::task::spawn(run(rx, pool, fg, forti_gate, ports, log));
    Handle { dispatch_channel: tx }
}

async fn run(
    mut chan: mpsc::Receiver<DispatchMessage>,
    pool: Arc<PgPool>,
    fg: FortiGateClient,
    forti_gate: Arc<HashMap<Ipv4Addr, Vec<String>>>,
    ports: Arc<PortMatrix>,
    log: Logger,
) {
    while let Some(msg) = chan.recv().await {
        let result = reconcile(&pool, &fg, &forti_gate, &ports, &msg.signal, &log).await;
        let _ = msg.out_channel.send(result);
    }
    slog::warn!(log, "Reconciler dispatch channel closed, exiting");
}

async fn reconcile(
    pool: &PgPool,
    fg: &FortiGateClient,
    forti_gate: &HashMap<Ipv4Addr, Vec<String>>,
    ports: &PortMatrix,
    signal: &Signal,
    log: &Logger,
) -> Result<(), ReconcileError> {
    let data = match signal {
        Signal::Create(d) | Signal::Edit(d) | Signal::Delete(d) => d,
    };

    let fg_list = match forti_gate.get(&data.nas_ip_address) {
        Some(list) if !list.is_empty() => list,
        _ => {
            slog::warn!(log, "No FortiGate configured for NAS-IP"; "nas_ip" => data.nas_ip_address.to_string());
            return Err(ReconcileError::NoFortiGateForNas(data.nas_ip_address.to_string()));
        }
    };

    for fg_addr in fg_list {
        // A database error aborts the whole signal rather than falling
        // through to the next device: it isn't a per-FortiGate failure, and
        // retrying it against each device in turn just repeats the same
        // failing query.
        let applied = match signal {
            Signal::Create(d) => try_create(pool, fg, fg_addr, ports, d, log).await?,
            Signal::Edit(d) => try_edit(pool, fg, fg_addr, ports, d, log).await?,
            Signal::Delete(d) => try_delete(pool, fg, fg_addr, ports, d, log).await?,
        };
        if applied {
            return Ok(());
        }
        slog::warn!(log, "FortiGate sequence failed, trying next device"; "fg" => fg_addr.as_str(), "login" => data.login.as_str());
    }

    slog::error!(log, "Exhausted FortiGate failover list"; "login" => data.login.as_str(), "nas_ip" => data.nas_ip_address.to_string());
    Ok(())
}

async fn try_create(
    pool: &PgPool,
    fg: &FortiGateClient,
    fg_addr: &str,
    ports: &PortMatrix,
    d: &SignalData,
    log: &Logger,
) -> Result<bool, ReconcileError> {
    let policy_id_by_hash = state::get_policy_id_by_hash(pool, &d.hash).await?;

    let ip4 = d.framed_ip_address.as_deref();
    let ip6 = d.delegated_ipv6_prefix.as_deref();

    if let Some(policy_id) = policy_id_by_hash {
        let ok = async {
            if let Some(ip) = ip4 {
                fg.create_ip(fg_addr, &d.login, ip).await?;
            }
            if let Some(ip) = ip6 {
                fg.create_ipv6(fg_addr, &d.login, ip).await?;
            }
            fg.edit_policy(fg_addr, policy_id, EditAction::Add { member: &d.login })
                .await
        }
        .await
        .is_some();
        log_result(pool, d, Some(policy_id), ok, fg_addr).await;
        return Ok(ok);
    }

    let (inv_tcp, inv_udp) = ports.invert(&d.tcp_rules, &d.udp_rules);
    let mkey = async {
        if let Some(ip) = ip4 {
            fg.create_ip(fg_addr, &d.login, ip).await?;
        }
        if let Some(ip) = ip6 {
            fg.create_ipv6(fg_addr, &d.login, ip).await?;
        }
        fg.create_service(fg_addr, &d.hash, &inv_tcp, &inv_udp).await?;
        let mkey = fg.create_policy(fg_addr, &d.hash, &d.login).await?;
        fg.move_policy_to_top(fg_addr, mkey).await?;
        Some(mkey)
    }
    .await;

    match mkey {
        Some(mkey) => {
            if let Err(e) = state::update_policy_id(pool, &d.login, &d.hash, mkey).await {
                slog::error!(log, "Failed to persist new policy_id"; "error" => e.to_string());
            }
            log_result(pool, d, Some(mkey), true, fg_addr).await;
            Ok(true)
        }
        None => {
            log_result(pool, d, None, false, fg_addr).await;
            Ok(false)
        }
    }
}

/// The four ways an edit can land, keyed on whether the subscriber's current
/// `policy_id` still exists and whether some other policy already carries
/// the new hash. Kept as a pure classification so the case split is
/// testable without a FortiGate to talk to.
#[derive(Debug, PartialEq, Eq)]
enum EditCase {
    RenameInPlace,
    JoinShared(i64),
    PromoteToOwn,
    MigrateShared(i64),
}

fn classify_edit(policy_id_exists: bool, policy_id_by_hash: Option<i64>) -> EditCase {
    match (policy_id_exists, policy_id_by_hash) {
        (false, None) => EditCase::RenameInPlace,
        (false, Some(shared)) => EditCase::JoinShared(shared),
        (true, None) => EditCase::PromoteToOwn,
        (true, Some(shared)) => EditCase::MigrateShared(shared),
    }
}

async fn try_edit(
    pool: &PgPool,
    fg: &FortiGateClient,
    fg_addr: &str,
    ports: &PortMatrix,
    d: &SignalData,
    log: &Logger,
) -> Result<bool, ReconcileError> {
    let policy_id_exists = match d.policy_id {
        Some(id) => state::policy_id_exists(pool, id).await?,
        None => false,
    };
    let policy_id_by_hash = state::get_policy_id_by_hash(pool, &d.hash).await?;

    let old_hash = d.old_hash.as_deref().unwrap_or(&d.hash);
    let ip4 = d.framed_ip_address.as_deref();
    let ip6 = d.delegated_ipv6_prefix.as_deref();
    let (inv_tcp, inv_udp) = ports.invert(&d.tcp_rules, &d.udp_rules);

    let ok = match classify_edit(policy_id_exists, policy_id_by_hash) {
        EditCase::RenameInPlace => {
            // Rename existing policy/service from old_hash to hash; drop the
            // old service and create a fresh one with the inverted ports.
            async {
                let policy_id = d.policy_id?;
                fg.edit_policy(fg_addr, policy_id, EditAction::Rename { new_name: &d.hash })
                    .await?;
                fg.delete_service(fg_addr, old_hash).await?;
                fg.create_service(fg_addr, &d.hash, &inv_tcp, &inv_udp).await?;
                Some(())
            }
            .await
        }
        EditCase::JoinShared(shared_policy) => {
            // Current policy is orphaned by this change; drop it and join
            // the shared policy for the new hash.
            async {
                let policy_id = d.policy_id?;
                fg.delete_policy(fg_addr, policy_id).await?;
                fg.delete_service(fg_addr, old_hash).await?;
                fg.edit_policy(fg_addr, shared_policy, EditAction::Add { member: &d.login })
                    .await
            }
            .await
        }
        EditCase::PromoteToOwn => {
            // Evict from the shared policy and stand up a dedicated one.
            let mkey = async {
                let policy_id = d.policy_id?;
                fg.edit_policy(fg_addr, policy_id, EditAction::Remove { member: &d.login })
                    .await?;
                if let Some(ip) = ip4 {
                    fg.create_ip(fg_addr, &d.login, ip).await?;
                }
                if let Some(ip) = ip6 {
                    fg.create_ipv6(fg_addr, &d.login, ip).await?;
                }
                fg.create_service(fg_addr, &d.hash, &inv_tcp, &inv_udp).await?;
                fg.create_policy(fg_addr, &d.hash, &d.login).await
            }
            .await;
            if let Some(mkey) = mkey {
                if let Err(e) = state::update_policy_id(pool, &d.login, &d.hash, mkey).await {
                    slog::error!(log, "Failed to persist new policy_id"; "error" => e.to_string());
                }
            }
            mkey.map(|_| ())
        }
        EditCase::MigrateShared(shared_policy) => {
            // Migrate between two live shared policies.
            async {
                let policy_id = d.policy_id?;
                fg.edit_policy(fg_addr, policy_id, EditAction::Remove { member: &d.login })
                    .await?;
                fg.edit_policy(fg_addr, shared_policy, EditAction::Add { member: &d.login })
                    .await
            }
            .await
        }
    }
    .is_some();

    log_result(pool, d, d.policy_id, ok, fg_addr).await;
    Ok(ok)
}

async fn try_delete(
    pool: &PgPool,
    fg: &FortiGateClient,
    fg_addr: &str,
    ports: &PortMatrix,
    d: &SignalData,
    _log: &Logger,
) -> Result<bool, ReconcileError> {
    let _ = ports;

    // `found` means "this policy_id still has other users" — true unless we
    // were the last subscriber referencing it. With no policy_id to check,
    // there is nothing shared to clean up beyond this subscriber's own
    // objects, so treat it as found (skip the delete_policy step).
    let found = match d.policy_id {
        Some(policy_id) => state::policy_id_exists(pool, policy_id).await?,
        None => true,
    };

    let ok = async {
        if let Some(policy_id) = d.policy_id {
            fg.edit_policy(fg_addr, policy_id, EditAction::Remove { member: &d.login })
                .await?;
        }
        if !found {
            if let Some(policy_id) = d.policy_id {
                fg.delete_policy(fg_addr, policy_id).await?;
            }
        }
        fg.delete_service(fg_addr, &d.hash).await?;
        fg.delete_ip(fg_addr, &d.login).await?;
        fg.delete_ipv6(fg_addr, &d.login).await
    }
    .await
    .is_some();

    log_result(pool, d, d.policy_id, ok, fg_addr).await;
    Ok(ok)
}

async fn log_result(pool: &PgPool, d: &SignalData, policy_id: Option<i64>, ok: bool, fg_addr: &str) {
    let result = if ok { "success" } else { "failure" };
    let _ = state::append_policy_log(pool, &d.login, policy_id, result, None, fg_addr).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neither_policy_survives_renames_in_place() {
        assert_eq!(classify_edit(false, None), EditCase::RenameInPlace);
    }

    #[test]
    fn only_hash_match_survives_joins_it() {
        assert_eq!(classify_edit(false, Some(42)), EditCase::JoinShared(42));
    }

    #[test]
    fn only_own_policy_survives_promotes_to_dedicated() {
        assert_eq!(classify_edit(true, None), EditCase::PromoteToOwn);
    }

    #[test]
    fn both_survive_migrates_between_shared_policies() {
        assert_eq!(classify_edit(true, Some(7)), EditCase::MigrateShared(7));
    }
}
