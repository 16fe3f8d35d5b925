use std::path::PathBuf;
use std::process::ExitCode;

use account_service::config::Configuration;
use account_service::user::{NewUser, User};
use account_service::{database, initialize_state, telemetry};
use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the `config.yaml` file.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Apply pending database migrations.
    Migrate,
    /// Create an account. The very first one becomes administrator.
    Create {
        email: String,
        password: String,
        /// Generated when missing.
        #[arg(long, short)]
        nickname: Option<String>,
    },
    /// List accounts in creation order.
    List {
        #[arg(long, default_value_t = 0)]
        skip: u64,
        #[arg(long, default_value_t = 100)]
        limit: u64,
    },
    /// Count accounts.
    Count,
    /// Unlock an account locked after failed logins.
    Unlock { id: Uuid },
    /// Replace the password of an account and unlock it.
    ResetPassword { id: Uuid, password: String },
    /// Verify an email with its token.
    Verify { id: Uuid, token: String },
    /// Delete an account.
    Delete { id: Uuid },
}

fn print_user(user: &User) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string(user)?);
    Ok(())
}

/// Report a boolean outcome.
fn outcome(done: bool, success: &str, failure: &str) -> ExitCode {
    if done {
        println!("{success}");
        ExitCode::SUCCESS
    } else {
        eprintln!("{failure}");
        ExitCode::FAILURE
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    telemetry::init();

    let args = Args::parse();
    let config = Configuration::default()
        .path(args.config.unwrap_or_default())
        .read()?;

    let state = initialize_state(config).await?;
    let users = &state.users;

    let code = match args.cmd {
        Commands::Migrate => {
            database::migrate(&state.db).await?;
            println!("Database is up to date.");
            ExitCode::SUCCESS
        },
        Commands::Create {
            email,
            password,
            nickname,
        } => {
            let new = NewUser {
                email: Some(email),
                password: Some(password),
                nickname,
                ..Default::default()
            };
            match users.create(new).await? {
                Some(user) => {
                    print_user(&user)?;
                    ExitCode::SUCCESS
                },
                None => {
                    eprintln!("Account could not be stored, see logs.");
                    ExitCode::FAILURE
                },
            }
        },
        Commands::List { skip, limit } => {
            for user in users.list_users(skip, limit).await {
                print_user(&user)?;
            }
            ExitCode::SUCCESS
        },
        Commands::Count => match users.count().await {
            Some(count) => {
                println!("{count}");
                ExitCode::SUCCESS
            },
            None => {
                eprintln!("Accounts could not be counted, see logs.");
                ExitCode::FAILURE
            },
        },
        Commands::Unlock { id } => outcome(
            users.unlock_user_account(id).await,
            "Account unlocked.",
            "No locked account with this id.",
        ),
        Commands::ResetPassword { id, password } => outcome(
            users.reset_password(id, &password).await?,
            "Password replaced.",
            "No account with this id.",
        ),
        Commands::Verify { id, token } => outcome(
            users.verify_email_with_token(id, &token).await,
            "Email verified.",
            "Invalid id or token.",
        ),
        Commands::Delete { id } => outcome(
            users.delete(id).await,
            "Account deleted.",
            "No account with this id.",
        ),
    };

    Ok(code)
}
