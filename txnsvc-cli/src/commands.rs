//! Command execution.

use crate::Commands;
use colored::Colorize;
use txnsvc_client::Client;
use txnsvc_protocol::message::{DeleteTransactionResult, GetTransactionResult, TransactionResult};

/// Balance used when no subcommand is given.
const DEMO_BALANCE: i32 = 500;

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Demo => {
            let result = client.create_transaction(DEMO_BALANCE).await?;
            tracing::info!("Transaction created with ID: {}", result.transaction_id);
            Ok(format_written(&result))
        }

        Commands::Ping => {
            client.ping().await?;
            Ok("PONG".green().to_string())
        }

        Commands::Create { balance } => {
            let result = client.create_transaction(balance).await?;
            Ok(format_written(&result))
        }

        Commands::Get { id } => {
            let result = client.get_transaction(&id).await?;
            Ok(format_fetched(&result))
        }

        Commands::Update { id, balance } => {
            let result = client.update_transaction(&id, balance).await?;
            Ok(format_written(&result))
        }

        Commands::Delete { id } => {
            let result = client.delete_transaction(&id).await?;
            Ok(format_deleted(&id, &result))
        }
    }
}

fn format_written(result: &TransactionResult) -> String {
    format!(
        "{} {} (balance: {})",
        result.message.green(),
        result.transaction_id.cyan(),
        result.balance
    )
}

fn format_fetched(result: &GetTransactionResult) -> String {
    format!(
        "{} {}\n  balance: {}",
        "Transaction".bold(),
        result.transaction_id.cyan(),
        result.balance.to_string().yellow()
    )
}

fn format_deleted(id: &str, result: &DeleteTransactionResult) -> String {
    if result.success {
        format!("{} {}", result.message.green(), id.cyan())
    } else {
        format!("{} {}", result.message.yellow(), id.cyan())
    }
}
