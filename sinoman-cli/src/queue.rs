//! `sinoman queue ...`

use clap::Subcommand;
use eyre::bail;
use sinoman_core::{Amount, PaymentIntent, QueuedTransaction};

use crate::context::Context;

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    /// Queue a payment without touching the network.
    Enqueue {
        /// Merchant id from the QR code.
        #[arg(long)]
        merchant: String,
        /// Amount in rupiah, e.g. `12500` or `12500.50`.
        #[arg(long)]
        amount: Amount,
        /// Merchant display name.
        #[arg(long)]
        merchant_name: Option<String>,
        /// Note attached to the payment.
        #[arg(long)]
        description: Option<String>,
    },
    /// List queued payments, oldest first.
    List,
    /// Print the number of queued payments.
    Count,
    /// Submit queued payments to the backend.
    Sync,
    /// Drop one queued payment.
    Remove {
        /// Queue entry id.
        id: String,
    },
    /// Drop every queued payment.
    Clear,
}

pub async fn run(context: &Context, command: QueueCommand) -> eyre::Result<()> {
    let queue = context.queue()?;

    match command {
        QueueCommand::Enqueue {
            merchant,
            amount,
            merchant_name,
            description,
        } => {
            let mut intent = PaymentIntent::new(merchant, amount);
            intent.merchant_name = merchant_name;
            intent.description = description;
            intent.validate()?;

            let queued = queue.enqueue(intent)?;
            if context.json {
                println!("{}", serde_json::to_string_pretty(&queued)?);
            } else {
                println!("queued {} ({})", queued.id, queued.payload.amount.to_rupiah());
            }
        }
        QueueCommand::List => {
            let items = queue.queued_transactions();
            if context.json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if items.is_empty() {
                println!("offline queue is empty");
            } else {
                for item in &items {
                    println!("{}", describe(item));
                }
            }
        }
        QueueCommand::Count => println!("{}", queue.queued_transactions_count()),
        QueueCommand::Sync => {
            let report = queue.sync_offline_queue().await?;
            if report.already_running {
                println!("a sync is already running");
            } else {
                println!(
                    "submitted {}, {} remaining",
                    report.submitted, report.remaining
                );
            }
        }
        QueueCommand::Remove { id } => match queue.remove(&id)? {
            Some(removed) => println!("removed {}", removed.id),
            None => bail!("no queued payment with id {id}"),
        },
        QueueCommand::Clear => println!("removed {} queued payment(s)", queue.clear()?),
    }
    Ok(())
}

fn describe(item: &QueuedTransaction) -> String {
    let merchant = item
        .payload
        .merchant_name
        .as_deref()
        .unwrap_or(&item.payload.merchant_id);
    let mut line = format!(
        "{}  {}  {}  queued_at={}",
        item.id,
        merchant,
        item.payload.amount.to_rupiah(),
        item.created_at
    );
    if item.attempts > 0 {
        line.push_str(&format!("  attempts={}", item.attempts));
    }
    if let Some(error) = &item.last_error {
        line.push_str(&format!("  last_error=\"{error}\""));
    }
    line
}
