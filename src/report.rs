//! Daily report scheduler: at a fixed local wall-clock time, fans out
//! per-subscriber analytical-store queries and signed-link emails in
//! parallel, grounded in `original_source/app/core/mhe_email.py`.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use chrono::{Duration as ChronoDuration, Local, NaiveDate, NaiveTime, TimeZone};
use futures::stream::{self, StreamExt};
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::Client;
use serde::Deserialize;
use slog::Logger;
use sqlx::MySqlPool;

use crate::config::SmtpConfig;
use crate::error::ReportError;
use crate::signing::{self, ReportToken};
use crate::utm::{UtmLogRecord, EXTENDED_COLUMNS};

const MAX_CONCURRENT_REPORTS: usize = 16;

#[derive(Debug, Deserialize)]
struct LdapUser {
    login: String,
    emails: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LdapListResponse {
    users: Vec<LdapUser>,
}

async fn list_subscribers(client: &Client, ldap_url: &str) -> Result<Vec<LdapUser>, ReportError> {
    let resp = client.get(ldap_url).send().await?.json::<LdapListResponse>().await?;
    Ok(resp.users)
}

async fn query_utm_logs_for_day(
    pool: &MySqlPool,
    login: &str,
    reporting_date: NaiveDate,
) -> Result<Vec<UtmLogRecord>, ReportError> {
    let cols = EXTENDED_COLUMNS.join(", ");
    let sql = format!(
        "SELECT {} FROM UTMLogs WHERE user = ? AND reporting_date = ? ORDER BY event_time ASC",
        cols
    );
    let rows: Vec<UtmLogRecordRow> = sqlx::query_as(&sql)
        .bind(login)
        .bind(reporting_date)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

#[derive(sqlx::FromRow)]
struct UtmLogRecordRow {
    action: Option<String>,
    date: Option<String>,
    dstcountry: Option<String>,
    dstip: Option<String>,
    dstport: Option<String>,
    eventtype: Option<String>,
    ipaddr: Option<String>,
    msg: Option<String>,
    srccountry: Option<String>,
    srcip: Option<String>,
    utmtype: Option<String>,
    time: Option<String>,
    user: Option<String>,
    category: Option<String>,
    hostname: Option<String>,
    service: Option<String>,
    url: Option<String>,
    httpagent: Option<String>,
    level: Option<String>,
    threat: Option<String>,
}

impl From<UtmLogRecordRow> for UtmLogRecord {
    fn from(r: UtmLogRecordRow) -> Self {
        UtmLogRecord {
            action: r.action,
            date: r.date,
            dstcountry: r.dstcountry,
            dstip: r.dstip,
            dstport: r.dstport,
            eventtype: r.eventtype,
            ipaddr: r.ipaddr,
            msg: r.msg,
            srccountry: r.srccountry,
            srcip: r.srcip,
            utmtype: r.utmtype,
            time: r.time,
            user: r.user,
            category: r.category,
            hostname: r.hostname,
            service: r.service,
            url: r.url,
            httpagent: r.httpagent,
            level: r.level,
            threat: r.threat,
        }
    }
}

/// Unconditionally yesterday, regardless of what time `now` is — matching
/// `send_daily_reports`'s `reporting_date = today - timedelta(days=1)`,
/// which applies the same way to the immediate startup call as to every
/// later scheduled run.
pub fn reporting_date_for(now: chrono::DateTime<Local>) -> NaiveDate {
    (now - ChronoDuration::days(1)).date_naive()
}

/// Computes the next local instant at `boundary`, tolerant of clock jumps by
/// being recomputed fresh on every call rather than cached across a sleep.
pub fn next_run_time(now: chrono::DateTime<Local>, boundary: NaiveTime) -> chrono::DateTime<Local> {
    let today_boundary = now.date_naive().and_time(boundary);
    let today_boundary = Local
        .from_local_datetime(&today_boundary)
        .single()
        .unwrap_or(now);
    if today_boundary > now {
        today_boundary
    } else {
        today_boundary + ChronoDuration::days(1)
    }
}

#[derive(Clone)]
pub struct ReportConfig {
    pub email_secret: Arc<Vec<u8>>,
    pub ldap_url: String,
    pub smtp: SmtpConfig,
    pub report_base_url: String,
    pub boundary: NaiveTime,
}

/// Startup-and-then-daily scheduler loop. Never exits on error: a failure in
/// the round itself is logged and the loop backs off 60s before retrying.
pub async fn scheduler_loop(
    pool: Arc<MySqlPool>,
    ldap_client: Client,
    smtp: AsyncSmtpTransport<Tokio1Executor>,
    cfg: ReportConfig,
    log: Logger,
) -> ! {
    loop {
        match run_report_round(&pool, &ldap_client, &smtp, &cfg, &log).await {
            Ok(count) => slog::info!(log, "Daily report round complete"; "processed" => count),
            Err(e) => {
                slog::error!(log, "Daily report round failed"; "error" => e.to_string());
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                continue;
            }
        }

        let now = Local::now();
        let next = next_run_time(now, cfg.boundary);
        let sleep_for = (next - now).to_std().unwrap_or(std::time::Duration::from_secs(60));
        tokio::time::sleep(sleep_for).await;
    }
}

async fn run_report_round(
    pool: &MySqlPool,
    ldap_client: &Client,
    smtp: &AsyncSmtpTransport<Tokio1Executor>,
    cfg: &ReportConfig,
    log: &Logger,
) -> Result<usize, ReportError> {
    let users = list_subscribers(ldap_client, &cfg.ldap_url).await?;
    let reporting_date = reporting_date_for(Local::now());
    let count = users.len();

    stream::iter(users)
        .for_each_concurrent(MAX_CONCURRENT_REPORTS, |user| {
            let pool = pool;
            let smtp = smtp;
            let cfg = cfg;
            let log = log.clone();
            async move {
                if let Err(e) = process_single_user(pool, smtp, cfg, &user, reporting_date, &log).await
                {
                    slog::warn!(log, "Failed to process report for subscriber"; "login" => user.login.as_str(), "error" => e.to_string());
                }
            }
        })
        .await;

    Ok(count)
}

async fn process_single_user(
    pool: &MySqlPool,
    smtp: &AsyncSmtpTransport<Tokio1Executor>,
    cfg: &ReportConfig,
    user: &LdapUser,
    reporting_date: NaiveDate,
    log: &Logger,
) -> Result<(), ReportError> {
    let rows = query_utm_logs_for_day(pool, &user.login, reporting_date).await?;

    if rows.is_empty() {
        send_no_events_email(smtp, cfg, user, log).await?;
        return Ok(());
    }

    let token = signing::sign(
        &ReportToken {
            login: user.login.clone(),
            date: reporting_date,
        },
        &cfg.email_secret,
    );
    let link = format!("{}/report?token={}", cfg.report_base_url, token);
    send_report_email(smtp, cfg, user, &link, log).await
}

async fn send_no_events_email(
    smtp: &AsyncSmtpTransport<Tokio1Executor>,
    cfg: &ReportConfig,
    user: &LdapUser,
    log: &Logger,
) -> Result<(), ReportError> {
    let body = format!("No security events were recorded for {} in the last 24 hours.", user.login);
    send_email(smtp, cfg, user, "Daily security report", &body, log).await
}

async fn send_report_email(
    smtp: &AsyncSmtpTransport<Tokio1Executor>,
    cfg: &ReportConfig,
    user: &LdapUser,
    link: &str,
    log: &Logger,
) -> Result<(), ReportError> {
    let body = format!(
        "Your daily security report is ready. View it here: {}",
        link
    );
    send_email(smtp, cfg, user, "Daily security report", &body, log).await
}

async fn send_email(
    smtp: &AsyncSmtpTransport<Tokio1Executor>,
    cfg: &ReportConfig,
    user: &LdapUser,
    subject: &str,
    body: &str,
    log: &Logger,
) -> Result<(), ReportError> {
    for to in &user.emails {
        let message = Message::builder()
            .from(cfg.smtp.sender.parse().map_err(|e| ReportError::SmtpError(format!("{}", e)))?)
            .to(to.parse().map_err(|e| ReportError::SmtpError(format!("{}", e)))?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_owned())
            .map_err(|e| ReportError::SmtpError(e.to_string()))?;

        if let Err(e) = smtp.send(message).await {
            slog::warn!(log, "Failed to send email"; "to" => to.as_str(), "error" => e.to_string());
        }
    }
    Ok(())
}

pub fn build_smtp_transport(cfg: &SmtpConfig) -> AsyncSmtpTransport<Tokio1Executor> {
    let mut builder = if cfg.use_ssl {
        AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)
            .expect("Invalid SMTP host for implicit TLS relay")
    } else if cfg.use_tls {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)
            .expect("Invalid SMTP host for STARTTLS relay")
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&cfg.host)
    };

    builder = builder.port(cfg.port).timeout(Some(cfg.timeout));

    if let (Some(user), Some(password)) = (&cfg.user, &cfg.password) {
        builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
    }

    builder.build()
}

// --- Token-gated HTTP endpoints -------------------------------------------------

#[derive(Clone)]
pub struct ReportHttpState {
    pub pool: Arc<MySqlPool>,
    pub email_secret: Arc<Vec<u8>>,
}

pub fn router(state: ReportHttpState) -> Router {
    Router::new()
        .route("/report", get(report_html))
        .route("/download/csv", get(report_csv))
        .route("/download/excel", get(report_excel))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: String,
}

async fn verify_and_fetch(
    state: &ReportHttpState,
    token: &str,
) -> Result<(ReportToken, Vec<UtmLogRecord>), StatusCode> {
    let payload = signing::unsign(token, &state.email_secret).ok_or(StatusCode::BAD_REQUEST)?;
    let rows = query_utm_logs_for_day(&state.pool, &payload.login, payload.date)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok((payload, rows))
}

fn render_html_table(rows: &[UtmLogRecord]) -> String {
    if rows.is_empty() {
        return "<p>No records</p>".to_owned();
    }
    let thead: String = EXTENDED_COLUMNS.iter().map(|h| format!("<th>{}</th>", h)).collect();
    let body: String = rows
        .iter()
        .map(|row| {
            let cells: String = row
                .as_columns()
                .iter()
                .map(|c| format!("<td>{}</td>", c.unwrap_or("")))
                .collect();
            format!("<tr>{}</tr>", cells)
        })
        .collect();
    format!(
        "<table border='1' cellpadding='4' cellspacing='0'><thead><tr>{}</tr></thead><tbody>{}</tbody></table>",
        thead, body
    )
}

async fn report_html(
    State(state): State<ReportHttpState>,
    Query(q): Query<TokenQuery>,
) -> impl IntoResponse {
    match verify_and_fetch(&state, &q.token).await {
        Ok((payload, rows)) => {
            let table = render_html_table(&rows);
            let page = format!(
                "<!DOCTYPE html><html><head><meta charset=\"UTF-8\"/><title>Report for {login}</title></head>\
                 <body><h2>Security events for {login} ({date})</h2>\
                 <div><a href=\"/download/csv?token={token}\">Download CSV</a> \
                 <a href=\"/download/excel?token={token}\">Download Excel</a></div>{table}</body></html>",
                login = payload.login,
                date = payload.date,
                token = q.token,
                table = table,
            );
            Html(page).into_response()
        }
        Err(status) => status.into_response(),
    }
}

async fn report_csv(
    State(state): State<ReportHttpState>,
    Query(q): Query<TokenQuery>,
) -> impl IntoResponse {
    match verify_and_fetch(&state, &q.token).await {
        Ok((_, rows)) => {
            let mut writer = csv::WriterBuilder::new()
                .quote_style(csv::QuoteStyle::Always)
                .from_writer(Vec::new());
            writer
                .write_record(EXTENDED_COLUMNS)
                .expect("writing to an in-memory buffer never fails");
            for row in &rows {
                writer
                    .write_record(row.as_columns().iter().map(|c| c.unwrap_or("")))
                    .expect("writing to an in-memory buffer never fails");
            }
            let body = writer.into_inner().expect("buffer flush never fails");
            (
                [(header::CONTENT_TYPE, "text/csv")],
                body,
            )
                .into_response()
        }
        Err(status) => status.into_response(),
    }
}

async fn report_excel(
    State(state): State<ReportHttpState>,
    Query(q): Query<TokenQuery>,
) -> impl IntoResponse {
    match verify_and_fetch(&state, &q.token).await {
        Ok((_, rows)) => {
            let table = render_html_table(&rows);
            let html = format!(
                "<html><head><meta charset='UTF-8'></head><body>{}</body></html>",
                table
            );
            (
                [(header::CONTENT_TYPE, "application/vnd.ms-excel")],
                html,
            )
                .into_response()
        }
        Err(status) => status.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_run_time_rolls_to_tomorrow_after_boundary() {
        let boundary = NaiveTime::from_hms_opt(8, 0, 0).unwrap();
        let now = Local.with_ymd_and_hms(2026, 7, 30, 9, 0, 0).unwrap();
        let next = next_run_time(now, boundary);
        assert_eq!(next.date_naive(), NaiveDate::from_ymd_opt(2026, 7, 31).unwrap());
    }

    #[test]
    fn next_run_time_stays_today_before_boundary() {
        let boundary = NaiveTime::from_hms_opt(8, 0, 0).unwrap();
        let now = Local.with_ymd_and_hms(2026, 7, 30, 6, 0, 0).unwrap();
        let next = next_run_time(now, boundary);
        assert_eq!(next.date_naive(), NaiveDate::from_ymd_opt(2026, 7, 30).unwrap());
    }

    #[test]
    fn reporting_date_is_always_yesterday_regardless_of_time_of_day() {
        let before = Local.with_ymd_and_hms(2026, 7, 30, 3, 0, 0).unwrap();
        assert_eq!(reporting_date_for(before), NaiveDate::from_ymd_opt(2026, 7, 29).unwrap());
        let after = Local.with_ymd_and_hms(2026, 7, 30, 9, 0, 0).unwrap();
        assert_eq!(reporting_date_for(after), NaiveDate::from_ymd_opt(2026, 7, 29).unwrap());
    }

    #[test]
    fn html_table_handles_empty_rows() {
        assert_eq!(render_html_table(&[]), "<p>No records</p>");
    }
}
