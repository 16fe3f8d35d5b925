//! Telemetry logic.
//! Support tracing, metrics and logging.

use metrics::Unit;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const ACCOUNTS_CREATED: &str = "accounts_created_total";
const LOGINS: &str = "logins_total";
const ACCOUNTS_LOCKED: &str = "accounts_locked_total";

/// Outcome label of a login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    Success,
    UnknownEmail,
    Unverified,
    Locked,
    WrongPassword,
}

impl LoginOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            LoginOutcome::Success => "success",
            LoginOutcome::UnknownEmail => "unknown_email",
            LoginOutcome::Unverified => "unverified",
            LoginOutcome::Locked => "locked",
            LoginOutcome::WrongPassword => "wrong_password",
        }
    }
}

/// Install the global tracing subscriber and describe service metrics.
///
/// Filter defaults to `info` and can be overridden with `RUST_LOG`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // A second call keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();

    metrics::describe_counter!(
        ACCOUNTS_CREATED,
        Unit::Count,
        "Accounts successfully created."
    );
    metrics::describe_counter!(
        LOGINS,
        Unit::Count,
        "Login attempts partitioned by outcome."
    );
    metrics::describe_counter!(
        ACCOUNTS_LOCKED,
        Unit::Count,
        "Accounts locked after too many failed logins."
    );
}

pub(crate) fn record_account_created(user_id: &uuid::Uuid) {
    tracing::info!(%user_id, "account created");
    metrics::counter!(ACCOUNTS_CREATED).increment(1);
}

pub(crate) fn record_login(outcome: LoginOutcome) {
    tracing::debug!(outcome = outcome.as_str(), "login attempt");
    metrics::counter!(LOGINS, "outcome" => outcome.as_str()).increment(1);
}

pub(crate) fn record_lockout(user_id: &uuid::Uuid, attempts: i32) {
    tracing::warn!(%user_id, attempts, "account locked");
    metrics::counter!(ACCOUNTS_LOCKED).increment(1);
}
