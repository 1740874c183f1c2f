use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Database operation failed: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("Profile not found for login '{0}'")]
    ProfileNotFound(String),
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Database operation failed: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("Lost communication with the policy reconciler")]
    CommunicationError,
    #[error("No FortiGate is configured for NAS-IP {0}")]
    NoFortiGateForNas(String),
}

#[derive(Error, Debug)]
pub enum UtmError {
    #[error("Payload was not valid UTF-8 JSON")]
    MalformedPayload,
    #[error("Stream-Load request failed: {0}")]
    StreamLoadError(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Database operation failed: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("LDAP list request failed: {0}")]
    LdapError(#[from] reqwest::Error),
    #[error("Failed to send email: {0}")]
    SmtpError(String),
}

#[derive(Error, Debug)]
pub enum AdminApiError {
    #[error("Database operation failed: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("RADIUS Accounting-Start not found after 3 attempts")]
    SessionNotFound,
    #[error("Profile {0} not found")]
    ProfileNotFound(i64),
}
