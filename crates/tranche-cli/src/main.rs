//! `tranche` administrative CLI.
//!
//! Every command prints `key=value` lines on stdout; logs go to stderr.
//! Engine refusals exit non-zero with the outcome code in the message.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tranche_money::{parse_amount, Amount};
use tranche_reconcile::IssueId;

#[derive(Parser)]
#[command(name = "tranche")]
#[command(about = "Installment allocation and reconciliation CLI", long_about = None)]
struct Cli {
    /// Config layers in merge order (base -> env -> site). Defaults apply when omitted.
    #[arg(long = "config", global = true)]
    config_paths: Vec<String>,

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

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Order administration
    Order {
        #[command(subcommand)]
        cmd: OrderCmd,
    },

    /// Remaining amount on an order, optionally with a candidate applied
    Remaining {
        #[arg(long)]
        order_id: i64,

        /// Decimal major units, e.g. 13000.00
        #[arg(long, value_parser = parse_amount, default_value = "0")]
        amount: Amount,

        /// Leave this entry out of the allocated sum (re-checking an edit)
        #[arg(long)]
        exclude_installment_id: Option<i64>,
    },

    /// List an order's ledger entries
    List {
        #[arg(long)]
        order_id: i64,
    },

    /// Submit a draft installment
    Submit {
        #[arg(long)]
        order_id: i64,

        /// Decimal major units, e.g. 13000.00
        #[arg(long, value_parser = parse_amount)]
        amount: Amount,

        #[arg(long)]
        actor: String,

        #[arg(long)]
        session: String,

        #[arg(long)]
        memo: Option<String>,

        /// Path to a JSON array of delivery lines ({sku, quantity_delta, unit_price})
        #[arg(long = "lines-file")]
        lines_file: Option<String>,
    },

    /// Confirm a draft installment
    Confirm {
        #[arg(long)]
        installment_id: i64,
    },

    /// Cancel an installment and reverse its stock movements
    Cancel {
        #[arg(long)]
        installment_id: i64,

        #[arg(long)]
        actor: String,
    },

    /// Session lifecycle
    Session {
        #[command(subcommand)]
        cmd: SessionCmd,
    },

    /// Duplicate-detection registry maintenance
    Dedupe {
        #[command(subcommand)]
        cmd: DedupeCmd,
    },

    /// Drift scan and repair
    Repair {
        #[command(subcommand)]
        cmd: RepairCmd,
    },

    /// Repair journal utilities
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum OrderCmd {
    /// Create an order with a fixed total
    Create {
        #[arg(long, value_parser = parse_amount)]
        total: Amount,
    },
}

#[derive(Subcommand)]
enum SessionCmd {
    /// Invalidate every fingerprint recorded under a session
    End {
        #[arg(long)]
        session: String,
    },
}

#[derive(Subcommand)]
enum DedupeCmd {
    /// Delete invalid and expired fingerprint records
    Purge,
}

#[derive(Subcommand)]
enum RepairCmd {
    /// Classify orders; read-only
    Scan {
        /// First order id (inclusive)
        #[arg(long, requires = "to")]
        from: Option<i64>,

        /// Last order id (inclusive)
        #[arg(long, requires = "from")]
        to: Option<i64>,

        /// Print the report as JSON instead of key=value lines
        #[arg(long)]
        json: bool,
    },

    /// Apply one repair, or every auto-correctable one in scope
    Apply {
        /// Issue handle as printed by `repair scan`, e.g. 42:sequence_gap
        #[arg(long, conflicts_with = "auto_all", required_unless_present = "auto_all")]
        issue: Option<IssueId>,

        /// auto | scale_order_total | proportional_reduce | adopt_allocated_total | clear_installments | renumber
        #[arg(long, default_value = "auto", value_parser = commands::parse_method)]
        method: tranche_reconcile::RepairMethod,

        /// Scan, then apply every auto-correctable issue with the default method
        #[arg(long = "auto-all")]
        auto_all: bool,

        #[arg(long, requires = "to")]
        from: Option<i64>,

        #[arg(long, requires = "from")]
        to: Option<i64>,
    },
}

#[derive(Subcommand)]
enum AuditCmd {
    /// Verify the repair journal hash chain
    Verify {
        /// Journal path; defaults to audit.journal_path from config
        #[arg(long)]
        path: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env.local if present. Production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cli = Cli::parse();
    let config_paths = cli.config_paths;

    match cli.cmd {
        Commands::Db { cmd } => {
            let ctx = commands::CliContext::load(&config_paths)?;
            let pool = ctx.connect().await?;
            match cmd {
                DbCmd::Status => {
                    let s = tranche_db::status(&pool).await?;
                    println!(
                        "db_ok={} has_orders_table={} has_dedupe_table={}",
                        s.ok, s.has_orders_table, s.has_dedupe_table
                    );
                }
                DbCmd::Migrate => {
                    tranche_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = tranche_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Order { cmd } => match cmd {
            OrderCmd::Create { total } => commands::ledger::order_create(&config_paths, total).await?,
        },

        Commands::Remaining {
            order_id,
            amount,
            exclude_installment_id,
        } => {
            commands::ledger::remaining(&config_paths, order_id, amount, exclude_installment_id)
                .await?
        }

        Commands::List { order_id } => commands::ledger::list(&config_paths, order_id).await?,

        Commands::Submit {
            order_id,
            amount,
            actor,
            session,
            memo,
            lines_file,
        } => {
            commands::ledger::submit(
                &config_paths,
                commands::ledger::SubmitArgs {
                    order_id,
                    amount,
                    actor,
                    session,
                    memo,
                    lines_file,
                },
            )
            .await?
        }

        Commands::Confirm { installment_id } => {
            commands::ledger::confirm(&config_paths, installment_id).await?
        }

        Commands::Cancel {
            installment_id,
            actor,
        } => commands::ledger::cancel(&config_paths, installment_id, &actor).await?,

        Commands::Session { cmd } => match cmd {
            SessionCmd::End { session } => {
                commands::ledger::session_end(&config_paths, &session).await?
            }
        },

        Commands::Dedupe { cmd } => match cmd {
            DedupeCmd::Purge => commands::ledger::dedupe_purge(&config_paths).await?,
        },

        Commands::Repair { cmd } => match cmd {
            RepairCmd::Scan { from, to, json } => {
                commands::repair::scan(&config_paths, commands::scope(from, to), json).await?
            }
            RepairCmd::Apply {
                issue,
                method,
                auto_all,
                from,
                to,
            } => {
                if auto_all {
                    commands::repair::apply_all(&config_paths, commands::scope(from, to)).await?
                } else if let Some(issue) = issue {
                    commands::repair::apply_one(&config_paths, issue, method).await?
                }
            }
        },

        Commands::Audit { cmd } => match cmd {
            AuditCmd::Verify { path } => commands::audit_verify(&config_paths, path)?,
        },
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
