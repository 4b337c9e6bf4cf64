//! Account administration for chatpix-bot: allow-list and balances.

use anyhow::{bail, Context, Result};
use chatpix_bot::config::DatabaseSettings;
use chatpix_bot::storage::{
    AccountStore, AccountSummary, AllowListChange, BalanceChange, PgStore,
};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use rust_decimal::Decimal;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chatpix-admin")]
#[command(about = "Manage chatpix-bot users and balances", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List allowed users with their balances
    List,
    /// Add a user to the allow-list
    Allow {
        /// Telegram user ID
        user_id: i64,
    },
    /// Remove a user from the allow-list
    Disable {
        /// Telegram user ID
        user_id: i64,
    },
    /// Set the balance of an allowed user
    SetBalance {
        /// Telegram user ID
        user_id: i64,
        /// New balance, e.g. 12.50
        amount: Decimal,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let settings = DatabaseSettings::new().context("loading database configuration")?;
    let store = PgStore::new(&settings).context("creating PostgreSQL pool")?;
    store
        .ensure_schema()
        .await
        .context("preparing account schema")?;

    run(&store, cli.command).await
}

async fn run(store: &dyn AccountStore, command: Commands) -> Result<()> {
    match command {
        Commands::List => {
            let accounts = store.list_accounts().await?;
            if accounts.is_empty() {
                println!("No allowed users.");
            }
            for account in &accounts {
                println!("{}", describe(account));
            }
        }
        Commands::Allow { user_id } => match store.allow_user(user_id).await? {
            AllowListChange::Changed => println!("User {user_id} is now allowed."),
            AllowListChange::Unchanged => println!("User {user_id} is already allowed."),
        },
        Commands::Disable { user_id } => match store.disable_user(user_id).await? {
            AllowListChange::Changed => println!("User {user_id} has been disabled."),
            AllowListChange::Unchanged => println!("User {user_id} was not in the allow-list."),
        },
        Commands::SetBalance { user_id, amount } => {
            if amount.is_sign_negative() {
                bail!("balance must not be negative");
            }
            let change = store.set_balance(user_id, amount).await?;
            println!("{}", balance_message(user_id, amount, change));
        }
    }
    Ok(())
}

fn balance_message(user_id: i64, amount: Decimal, change: BalanceChange) -> String {
    match change {
        BalanceChange::Updated => format!("Balance of user {user_id} set to {amount}."),
        BalanceChange::NotAllowed => {
            format!("User {user_id} is not allowed, balance left unchanged.")
        }
    }
}

fn describe(account: &AccountSummary) -> String {
    match (account.balance, account.images_generated) {
        (Some(balance), Some(images)) => format!(
            "{}\tbalance: {balance}\timages: {images}",
            account.user_id
        ),
        _ => format!("{}\tbalance: none", account.user_id),
    }
}
