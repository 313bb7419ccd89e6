//! vidforge operations CLI.
//!
//! Exit codes for `reconcile check`: 0 = clean, 1 = drift detected,
//! 2 = error. Every other command: 0 on success, 2 on error.

use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "vf")]
#[command(about = "vidforge operations CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Ledger drift audit and repair
    Reconcile {
        #[command(subcommand)]
        cmd: ReconcileCmd,
    },

    /// Billing admin
    Billing {
        #[command(subcommand)]
        cmd: BillingCmd,
    },

    /// Outbox maintenance
    Outbox {
        #[command(subcommand)]
        cmd: OutboxCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum ReconcileCmd {
    /// Compare every user's cached balance against the ledger sum.
    Check,
    /// Dump one user's ledger in insertion order with a running balance.
    Explain {
        user_id: Uuid,
    },
    /// Insert a compensating ledger entry covering the drift.
    Repair {
        user_id: Uuid,
    },
}

#[derive(Subcommand)]
enum BillingCmd {
    /// Credit a user (idempotent via --request-id).
    AddCredits {
        user_id: Uuid,

        #[arg(long)]
        amount: i64,

        /// Idempotency key; replays with the same id are no-ops.
        #[arg(long = "request-id")]
        request_id: String,

        #[arg(long, default_value = "manual credit grant")]
        description: String,
    },
}

#[derive(Subcommand)]
enum OutboxCmd {
    /// Delete published events older than the retention window.
    Prune {
        #[arg(long, default_value_t = 14)]
        older_than_days: i64,
    },
    /// Count events still awaiting publication.
    Pending,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();

    std::process::exit(match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            2
        }
    });
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = vf_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = vf_db::status(&pool).await?;
                    println!("db_ok={} has_schema={}", s.ok, s.has_schema);
                }
                DbCmd::Migrate => {
                    vf_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
            Ok(0)
        }

        Commands::Reconcile { cmd } => {
            let pool = vf_db::connect_from_env().await?;
            match cmd {
                ReconcileCmd::Check => {
                    let report = vf_db::drift_report(&pool).await?;
                    let mut drifted = 0usize;
                    for row in &report {
                        if row.drift() != 0 {
                            drifted += 1;
                            println!(
                                "user={} email={} balance={} ledger_sum={} drift={}",
                                row.user_id,
                                row.email,
                                row.balance,
                                row.ledger_sum,
                                row.drift()
                            );
                        }
                    }
                    println!("users={} drifted={}", report.len(), drifted);
                    Ok(if drifted == 0 { 0 } else { 1 })
                }

                ReconcileCmd::Explain { user_id } => {
                    let entries = vf_db::explain_user(&pool, user_id).await?;
                    for e in &entries {
                        println!(
                            "txn_id={} type={} amount={:+} running={} op={} at={} {}",
                            e.txn_id,
                            e.txn_type.as_str(),
                            e.amount,
                            e.running_balance,
                            e.operation_id.as_deref().unwrap_or("-"),
                            e.created_at.to_rfc3339(),
                            e.description,
                        );
                    }
                    let balance = vf_db::get_balance(&pool, user_id).await?;
                    let ledger_sum = entries.last().map(|e| e.running_balance).unwrap_or(0);
                    println!(
                        "balance={} ledger_sum={} drift={}",
                        balance,
                        ledger_sum,
                        balance - ledger_sum
                    );
                    Ok(0)
                }

                ReconcileCmd::Repair { user_id } => {
                    match vf_db::repair_user(&pool, user_id).await? {
                        vf_db::RepairOutcome::Clean => {
                            println!("repair=none drift=0");
                        }
                        vf_db::RepairOutcome::Repaired {
                            request_id,
                            amount,
                            txn_type,
                        } => {
                            println!(
                                "repair=applied type={} amount={:+} request_id={}",
                                txn_type.as_str(),
                                amount,
                                request_id
                            );
                        }
                    }
                    Ok(0)
                }
            }
        }

        Commands::Billing { cmd } => {
            let pool = vf_db::connect_from_env().await?;
            match cmd {
                BillingCmd::AddCredits {
                    user_id,
                    amount,
                    request_id,
                    description,
                } => {
                    let balance = vf_db::add_credits(
                        &pool,
                        user_id,
                        amount,
                        &description,
                        Some(&request_id),
                    )
                    .await
                    .map_err(anyhow::Error::new)?;
                    println!("user={user_id} balance={balance}");
                    Ok(0)
                }
            }
        }

        Commands::Outbox { cmd } => {
            let pool = vf_db::connect_from_env().await?;
            match cmd {
                OutboxCmd::Prune { older_than_days } => {
                    let removed = vf_db::outbox_prune_published(&pool, older_than_days).await?;
                    println!("pruned={removed}");
                    Ok(0)
                }
                OutboxCmd::Pending => {
                    let n = vf_db::outbox_pending_count(&pool).await?;
                    println!("pending={n}");
                    Ok(0)
                }
            }
        }
    }
}
