//! Operator CLI for the Tally ledger.
//!
//! Closes and reopens months, manages quota and inspects or administers
//! documents for one tenant. Connection settings come from `config/` and
//! `TALLY__*` environment variables.
//!
//! Usage:
//!   ledgerctl --tenant <UUID> period close 2025-01
//!   ledgerctl --tenant <UUID> quota status

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tally_core::DocumentLedgerService;
use tally_core::fiscal::YearMonth;
use tally_core::ledger::{CounterpartyLedger, DocumentTypeSettings, MovementKind};
use tally_db::PgLedgerStore;
use tally_shared::types::{DocumentId, DocumentTypeId, TenantId, UserId};
use tally_shared::{AppConfig, AppError, AppResult, init_tracing};
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "ledgerctl",
    version,
    about = "Administer Tally periods, quota and documents"
)]
struct Cli {
    /// Tenant to operate on
    #[arg(long, env = "TALLY_TENANT")]
    tenant: TenantId,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fiscal month commands
    #[command(subcommand)]
    Period(PeriodCommands),

    /// Quota commands
    #[command(subcommand)]
    Quota(QuotaCommands),

    /// Document type commands
    #[command(subcommand)]
    DocType(DocTypeCommands),

    /// Document commands
    #[command(subcommand, alias = "doc")]
    Document(DocumentCommands),
}

#[derive(Subcommand)]
enum PeriodCommands {
    /// Close a month and roll its unused plan into an overflow pool
    Close {
        /// Month to close (e.g. "2025-01")
        #[arg(value_parser = parse_period)]
        period: YearMonth,
        /// User recorded as closing the month
        #[arg(long)]
        actor: Option<UserId>,
    },
    /// Reopen the most recently closed month
    Reopen {
        /// Month to reopen (e.g. "2025-01")
        #[arg(value_parser = parse_period)]
        period: YearMonth,
        /// User recorded as reopening the month
        #[arg(long)]
        actor: Option<UserId>,
    },
}

#[derive(Subcommand)]
enum QuotaCommands {
    /// Show spendable quota right now
    Status,
    /// Check whether a number of units could be consumed right now
    Check {
        /// Units to check
        units: i64,
    },
    /// Provision or resize a month's plan
    Plan {
        /// Month of the plan (e.g. "2025-01")
        #[arg(value_parser = parse_period)]
        period: YearMonth,
        /// Units allocated
        units: i64,
    },
    /// Record a purchased top-up
    TopUp {
        /// Month the top-up belongs to (e.g. "2025-01")
        #[arg(value_parser = parse_period)]
        period: YearMonth,
        /// Units purchased
        units: i64,
    },
}

#[derive(Subcommand)]
enum DocTypeCommands {
    /// Set numbering mode and collaborator flags of a document type
    Configure {
        /// Document type ID
        doc_type: DocumentTypeId,
        /// Callers supply document numbers
        #[arg(long)]
        manual: bool,
        /// Stock movement posted for product lines
        #[arg(long, value_enum)]
        inventory: Option<InventoryArg>,
        /// Counterparty ledger whose balances this type affects
        #[arg(long, value_enum)]
        counterparty: Option<LedgerArg>,
    },
}

#[derive(Subcommand)]
enum DocumentCommands {
    /// Print a document and its lines
    Show {
        /// Document ID
        id: DocumentId,
    },
    /// Void a document
    Void {
        /// Document ID
        id: DocumentId,
        /// Reason recorded in the audit log
        #[arg(short, long)]
        reason: String,
        /// User performing the operation
        #[arg(long)]
        actor: UserId,
    },
    /// Restore a voided document
    Reactivate {
        /// Document ID
        id: DocumentId,
        /// User performing the operation
        #[arg(long)]
        actor: UserId,
    },
    /// Move a document to the trash
    Delete {
        /// Document ID
        id: DocumentId,
        /// Reason recorded in the audit log
        #[arg(short, long)]
        reason: String,
        /// User performing the operation
        #[arg(long)]
        actor: UserId,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum InventoryArg {
    In,
    Out,
}

impl From<InventoryArg> for MovementKind {
    fn from(arg: InventoryArg) -> Self {
        match arg {
            InventoryArg::In => Self::In,
            InventoryArg::Out => Self::Out,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LedgerArg {
    Receivable,
    Payable,
}

impl From<LedgerArg> for CounterpartyLedger {
    fn from(arg: LedgerArg) -> Self {
        match arg {
            LedgerArg::Receivable => Self::Receivable,
            LedgerArg::Payable => Self::Payable,
        }
    }
}

/// Parses `YYYY-MM`.
fn parse_period(raw: &str) -> Result<YearMonth, String> {
    let (year, month) = raw
        .split_once('-')
        .ok_or_else(|| format!("expected YYYY-MM, got {raw:?}"))?;
    let year: i32 = year.parse().map_err(|_| format!("invalid year in {raw:?}"))?;
    let month: u32 = month.parse().map_err(|_| format!("invalid month in {raw:?}"))?;
    YearMonth::new(year, month).ok_or_else(|| format!("month must be 1-12, got {month}"))
}

fn print_json(value: &impl Serialize) -> AppResult<()> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|e| AppError::Internal(e.to_string()))?;
    println!("{rendered}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load().context("Failed to load configuration")?;
    init_tracing(&config.logging);

    let db = tally_db::connect_with(&config.database)
        .await
        .context("Failed to connect to database")?;
    info!("Connected to database");

    let service = DocumentLedgerService::new(PgLedgerStore::new(db), config.ledger.clone());
    if let Err(err) = run(&service, cli.tenant, cli.command).await {
        error!(code = err.error_code(), "{err}");
        return Err(err.into());
    }
    Ok(())
}

async fn run(
    service: &DocumentLedgerService<PgLedgerStore>,
    tenant: TenantId,
    command: Commands,
) -> AppResult<()> {
    match command {
        Commands::Period(PeriodCommands::Close { period, actor }) => {
            let outcome = service
                .close_period(tenant, period.year, period.month, actor)
                .await?;
            if outcome.already_closed {
                info!(%period, "month was already closed");
            }
            print_json(&outcome)
        }
        Commands::Period(PeriodCommands::Reopen { period, actor }) => {
            let outcome = service
                .reopen_period(tenant, period.year, period.month, actor)
                .await?;
            print_json(&outcome)
        }
        Commands::Quota(QuotaCommands::Status) => print_json(&service.quota_status(tenant).await?),
        Commands::Quota(QuotaCommands::Check { units }) => {
            let available = service.check_available(tenant, units).await?;
            println!("{}", if available { "available" } else { "insufficient" });
            if !available {
                return Err(AppError::BusinessRule(format!(
                    "{units} units are not available"
                )));
            }
            Ok(())
        }
        Commands::Quota(QuotaCommands::Plan { period, units }) => {
            let plan = service
                .provision_plan(tenant, period.year, period.month, units)
                .await?;
            print_json(&plan)
        }
        Commands::Quota(QuotaCommands::TopUp { period, units }) => {
            let top_up = service
                .purchase_top_up(tenant, period.year, period.month, units)
                .await?;
            print_json(&top_up)
        }
        Commands::DocType(DocTypeCommands::Configure {
            doc_type,
            manual,
            inventory,
            counterparty,
        }) => {
            let settings = DocumentTypeSettings {
                manual_numbering: manual,
                inventory_effect: inventory.map(Into::into),
                counterparty_ledger: counterparty.map(Into::into),
            };
            let sequence = service
                .configure_document_type(tenant, doc_type, settings)
                .await?;
            print_json(&sequence)
        }
        Commands::Document(DocumentCommands::Show { id }) => {
            print_json(&service.get_document(tenant, id).await?)
        }
        Commands::Document(DocumentCommands::Void { id, reason, actor }) => {
            print_json(&service.void_document(tenant, id, reason, actor).await?)
        }
        Commands::Document(DocumentCommands::Reactivate { id, actor }) => {
            print_json(&service.reactivate_document(tenant, id, actor).await?)
        }
        Commands::Document(DocumentCommands::Delete { id, reason, actor }) => {
            print_json(&service.delete_document(tenant, id, reason, actor).await?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_period() {
        assert_eq!(parse_period("2025-01").unwrap(), YearMonth::new(2025, 1).unwrap());
        assert_eq!(parse_period("1999-12").unwrap(), YearMonth::new(1999, 12).unwrap());
        assert!(parse_period("2025-13").is_err());
        assert!(parse_period("2025").is_err());
        assert!(parse_period("abcd-01").is_err());
    }

    #[test]
    fn test_cli_parses_close() {
        let tenant = TenantId::new();
        let cli = Cli::try_parse_from([
            "ledgerctl",
            "--tenant",
            &tenant.to_string(),
            "period",
            "close",
            "2025-03",
        ])
        .unwrap();

        assert_eq!(cli.tenant, tenant);
        match cli.command {
            Commands::Period(PeriodCommands::Close { period, actor }) => {
                assert_eq!(period, YearMonth::new(2025, 3).unwrap());
                assert!(actor.is_none());
            }
            _ => panic!("expected period close"),
        }
    }

    #[test]
    fn test_cli_parses_doc_type_flags() {
        let tenant = TenantId::new();
        let doc_type = DocumentTypeId::new();
        let cli = Cli::try_parse_from([
            "ledgerctl",
            "--tenant",
            &tenant.to_string(),
            "doc-type",
            "configure",
            &doc_type.to_string(),
            "--manual",
            "--inventory",
            "out",
            "--counterparty",
            "receivable",
        ])
        .unwrap();

        match cli.command {
            Commands::DocType(DocTypeCommands::Configure {
                doc_type: parsed,
                manual,
                inventory,
                counterparty,
            }) => {
                assert_eq!(parsed, doc_type);
                assert!(manual);
                assert_eq!(inventory.map(MovementKind::from), Some(MovementKind::Out));
                assert_eq!(
                    counterparty.map(CounterpartyLedger::from),
                    Some(CounterpartyLedger::Receivable)
                );
            }
            _ => panic!("expected doc-type configure"),
        }
    }

    #[test]
    fn test_cli_rejects_bad_tenant() {
        let result = Cli::try_parse_from(["ledgerctl", "--tenant", "nope", "quota", "status"]);
        assert!(result.is_err());
    }
}
