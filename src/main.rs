use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use reqwest::Client;
use slog::o;
use structopt::StructOpt;

mod admin_api;
mod admission;
mod config;
mod error;
mod fortigate;
mod logging;
mod ports;
mod radius;
mod reconciler;
mod report;
mod signing;
mod state;
mod utm;

#[derive(Debug, StructOpt)]
#[structopt(name = "mhe-ctrl", about = "Per-subscriber RADIUS/FortiGate firewall-policy controller.")]
struct Opt {
    /// The path of the port-universe catalogue file.
    #[structopt(long = "port-catalogue", default_value = "config/ports.json")]
    port_catalogue: PathBuf,

    /// Show debug log information.
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    let root_log = logging::root_logger(opt.verbose);
    slog::info!(root_log, "Starting mhe-ctrl"; "build" => logging::GIT_VERSION, "arguments" => format!("{:?}", opt));

    let config = config::Config::from_env();
    let config = Arc::new(config);

    let port_matrix = ports::PortMatrix::load(&opt.port_catalogue)
        .unwrap_or_else(|e| panic!("Failed to load port catalogue from {:?}: {}", opt.port_catalogue, e));
    let port_matrix = Arc::new(port_matrix);

    let postgres_url = format!(
        "postgres://{}:{}@{}:{}/{}",
        config.postgres.user, config.postgres.password, config.postgres.host, config.postgres.port, config.postgres.database
    );
    let postgres_pool = sqlx::postgres::PgPoolOptions::new()
        .connect(&postgres_url)
        .await
        .expect("Failed to connect to the Postgres control-plane database");
    let postgres_pool = Arc::new(postgres_pool);
    slog::info!(root_log, "Connected to Postgres"; "db" => config.postgres.database.as_str());

    let starrocks_url = format!(
        "mysql://{}:{}@{}:{}/{}",
        config.starrocks.user, config.starrocks.password, config.starrocks.host, config.starrocks.port, config.starrocks.database
    );
    let starrocks_pool = sqlx::mysql::MySqlPoolOptions::new()
        .connect(&starrocks_url)
        .await
        .expect("Failed to connect to the StarRocks analytical store");
    let starrocks_pool = Arc::new(starrocks_pool);
    slog::info!(root_log, "Connected to StarRocks"; "db" => config.starrocks.database.as_str());

    let fg_client = fortigate::FortiGateClient::new(config.api_token.clone(), root_log.new(o!("subsystem" => "fortigate")));
    let forti_gate: Arc<HashMap<Ipv4Addr, Vec<String>>> = Arc::new(config.forti_gate.clone());

    let reconciler = reconciler::spawn(
        Arc::clone(&postgres_pool),
        fg_client,
        Arc::clone(&forti_gate),
        Arc::clone(&port_matrix),
        root_log.new(o!("subsystem" => "reconciler")),
    );

    let admission_handle = admission::Handle::new(Arc::clone(&postgres_pool), reconciler.clone());

    let radius_log = root_log.new(o!("subsystem" => "radius"));
    let radius_secret = Arc::new(config.radius_shared_secret.clone());
    let radius_socket = radius::bind(config.radius_port)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind RADIUS listener on port {}: {}", config.radius_port, e));
    tokio::task::spawn(radius::run(
        radius_socket,
        radius_secret,
        Arc::clone(&forti_gate),
        admission_handle,
        radius_log,
    ));

    let utm_client = Client::new();
    let utm_target = Arc::new(utm::StreamLoadTarget {
        host: config.starrocks.host.clone(),
        port: config.starrocks.port,
        db: config.starrocks.database.clone(),
        table: "UTMLogs".to_owned(),
        user: config.starrocks.user.clone(),
        password: config.starrocks.password.clone(),
    });
    let utm_log = root_log.new(o!("subsystem" => "utm"));
    let utm_socket = utm::bind(config.syslog_port)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind UTM syslog listener on port {}: {}", config.syslog_port, e));
    tokio::task::spawn(utm::run(
        utm_socket,
        utm_target,
        utm_client,
        || {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0)
        },
        utm_log,
    ));

    let report_cfg = report::ReportConfig {
        email_secret: Arc::new(config.email_token.clone().into_bytes()),
        ldap_url: format!("http://{}:{}/list", config.ldap.host, config.ldap.port),
        smtp: config.smtp.clone(),
        report_base_url: format!("http://{}:{}", config.admin_host, config.admin_port),
        boundary: config.report_send_time,
    };
    let smtp_transport = report::build_smtp_transport(&config.smtp);
    let ldap_client = Client::new();
    let report_log = root_log.new(o!("subsystem" => "report"));
    tokio::task::spawn(report::scheduler_loop(
        Arc::clone(&starrocks_pool),
        ldap_client,
        smtp_transport,
        report_cfg,
        report_log,
    ));

    let admin_state = admin_api::ApiState {
        pool: Arc::clone(&postgres_pool),
        reconciler: reconciler.clone(),
        app_client: Client::new(),
        app_keepalive_url: format!("http://{}:{}/keepalive", config.app_host, config.app_port),
        log: root_log.new(o!("subsystem" => "admin_api")),
    };
    let report_http_state = report::ReportHttpState {
        pool: Arc::clone(&starrocks_pool),
        email_secret: Arc::new(config.email_token.clone().into_bytes()),
    };

    let app = admin_api::router(admin_state).merge(report::router(report_http_state));

    let addr = format!("{}:{}", config.admin_host, config.admin_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind admin HTTP listener on {}: {}", addr, e));
    slog::info!(root_log, "Serving admin/report HTTP API"; "addr" => addr.as_str());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Admin HTTP server exited with an error");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
