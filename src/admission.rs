//! Admission / signal router: joins RADIUS accounting events with
//! `FW_Profiles` by login and dispatches create/delete signals to the
//! reconciler. Replaces the source system's `/radius/event` HTTP hop with a
//! direct async call (see the Design Notes on cross-service REST as
//! internal plumbing).

use std::sync::Arc;

use slog::Logger;
use sqlx::PgPool;

use crate::radius::{ExtractedAttrs, ACCT_STATUS_TYPE_START, ACCT_STATUS_TYPE_STOP};
use crate::reconciler::{self, Signal, SignalData};
use crate::state;

#[derive(Clone)]
pub struct Handle {
    pool: Arc<PgPool>,
    reconciler: reconciler::Handle,
}

impl Handle {
    pub fn new(pool: Arc<PgPool>, reconciler: reconciler::Handle) -> Handle {
        Handle { pool, reconciler }
    }
}

fn is_subscriber_class(class: &Option<String>) -> bool {
    matches!(class.as_deref(), Some("2") | Some("00000002"))
}

/// Entry point the RADIUS observer calls for every Accounting-Request. Class
/// filtering happens here once, then dispatches on `Acct-Status-Type`; any
/// other status is a no-op.
pub async fn handle_event(handle: &Handle, attrs: ExtractedAttrs, log: &Logger) {
    if !is_subscriber_class(&attrs.class) {
        slog::debug!(log, "Ignoring RADIUS event with non-subscriber Class"; "class" => format!("{:?}", attrs.class));
        return;
    }

    match attrs.acct_status_type {
        Some(ACCT_STATUS_TYPE_START) => admit_start(handle, attrs, log).await,
        Some(ACCT_STATUS_TYPE_STOP) => admit_stop(handle, attrs, log).await,
        _ => slog::debug!(log, "Ignoring RADIUS event with unhandled Acct-Status-Type"; "status" => format!("{:?}", attrs.acct_status_type)),
    }
}

pub async fn admit_start(handle: &Handle, attrs: ExtractedAttrs, log: &Logger) {
    if !is_subscriber_class(&attrs.class) {
        return;
    }
    let Some(login) = attrs.user_name.clone() else {
        return;
    };

    if let Err(e) = state::insert_session(
        &handle.pool,
        &login,
        "start",
        attrs.framed_ip_address.as_deref(),
        attrs.delegated_ipv6_prefix.as_deref(),
        attrs.nas_ip_address.map(|a| a.to_string()).as_deref(),
    )
    .await
    {
        slog::error!(log, "Failed to insert RADIUS session row"; "login" => login.as_str(), "error" => e.to_string());
        return;
    }

    let profile = match state::get_profile_by_login(&handle.pool, &login).await {
        Ok(p) => p,
        Err(e) => {
            slog::error!(log, "Failed to look up profile"; "login" => login.as_str(), "error" => e.to_string());
            return;
        }
    };

    let Some(profile) = profile else {
        slog::debug!(log, "No profile yet for subscriber, deferring policy install"; "login" => login.as_str());
        return;
    };

    let Some(nas_ip) = attrs.nas_ip_address else {
        slog::warn!(log, "Accounting-Start missing NAS-IP-Address, cannot reconcile"; "login" => login.as_str());
        return;
    };

    let signal = Signal::Create(SignalData {
        login: login.clone(),
        hash: profile.hash,
        old_hash: None,
        framed_ip_address: attrs.framed_ip_address,
        delegated_ipv6_prefix: attrs.delegated_ipv6_prefix,
        tcp_rules: profile.tcp_rules,
        udp_rules: profile.udp_rules,
        nas_ip_address: nas_ip,
        policy_id: profile.policy_id,
    });

    if let Err(e) = handle.reconciler.dispatch(signal).await {
        slog::error!(log, "Failed to dispatch create signal"; "login" => login.as_str(), "error" => e.to_string());
    }
}

pub async fn admit_stop(handle: &Handle, attrs: ExtractedAttrs, log: &Logger) {
    if !is_subscriber_class(&attrs.class) {
        return;
    }
    let Some(login) = attrs.user_name.clone() else {
        return;
    };

    if let Err(e) = state::delete_session_by_user(&handle.pool, &login).await {
        slog::error!(log, "Failed to delete RADIUS session row"; "login" => login.as_str(), "error" => e.to_string());
    }

    let profile = match state::get_profile_by_login(&handle.pool, &login).await {
        Ok(Some(p)) => p,
        Ok(None) => return,
        Err(e) => {
            slog::error!(log, "Failed to look up profile"; "login" => login.as_str(), "error" => e.to_string());
            return;
        }
    };

    let Some(nas_ip) = attrs.nas_ip_address else {
        return;
    };

    let signal = Signal::Delete(SignalData {
        login: login.clone(),
        hash: profile.hash,
        old_hash: None,
        framed_ip_address: attrs.framed_ip_address,
        delegated_ipv6_prefix: attrs.delegated_ipv6_prefix,
        tcp_rules: profile.tcp_rules,
        udp_rules: profile.udp_rules,
        nas_ip_address: nas_ip,
        policy_id: profile.policy_id,
    });

    if let Err(e) = handle.reconciler.dispatch(signal).await {
        slog::error!(log, "Failed to dispatch delete signal"; "login" => login.as_str(), "error" => e.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_filter_accepts_both_encodings_and_rejects_others() {
        assert!(is_subscriber_class(&Some("2".to_owned())));
        assert!(is_subscriber_class(&Some("00000002".to_owned())));
        assert!(!is_subscriber_class(&Some("3".to_owned())));
        assert!(!is_subscriber_class(&None));
    }
}
