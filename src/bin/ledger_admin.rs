//! ledger_admin - inspect and maintain the enforcement ledger

use anyhow::Result;
use clap::{Parser, Subcommand};

use rider_enforcement::notify::templates::{format_amount, format_timestamp};
use rider_enforcement::{JobArchive, Ledger, OwnerRegistry, SqliteLedger, VehicleOwner};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the enforcement database.
    #[arg(long, env = "ENFORCER_DB_PATH", default_value = "enforcement.db")]
    db_path: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register or replace the owner of a vehicle.
    AddOwner {
        #[arg(long)]
        plate: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        address: Option<String>,
    },
    /// Show the owner registered for a plate.
    Owner {
        plate: String,
    },
    /// List violations whose notice has not been delivered.
    Pending,
    /// List the most recent dead-lettered notices.
    DeadLetters {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Mark a violation processed by hand.
    MarkProcessed {
        id: i64,
    },
    /// Clear a dead-lettered notice so the next enforcerd start sends it again.
    Reopen {
        id: i64,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let mut ledger = SqliteLedger::open(&args.db_path)?;

    match args.command {
        Command::AddOwner {
            plate,
            name,
            email,
            phone,
            address,
        } => {
            rider_enforcement::notify::validate_recipient(&email)?;
            ledger.register_owner(&VehicleOwner {
                license_plate: plate.clone(),
                owner_name: name,
                email,
                phone,
                address,
            })?;
            println!("registered owner for {}", plate);
        }
        Command::Owner { plate } => match ledger.owner_for_plate(&plate)? {
            Some(owner) => println!("{}", serde_json::to_string_pretty(&owner)?),
            None => println!("no owner registered for {}", plate),
        },
        Command::Pending => {
            let pending = ledger.pending_violations()?;
            for stored in &pending {
                let v = &stored.violation;
                println!(
                    "{:>6}  {}  {:<16}  {:<12}  {:.2}  {}",
                    stored.id.0,
                    format_timestamp(v.created_at()),
                    v.kind(),
                    v.license_plate().unwrap_or("-"),
                    v.confidence(),
                    format_amount(v.kind().fine_amount_cents())
                );
            }
            println!("{} pending violation(s)", pending.len());
        }
        Command::DeadLetters { limit } => {
            for letter in ledger.dead_letters(limit)? {
                println!(
                    "{:>6}  {}  {:<16}  {:<28}  attempts={}  {}",
                    letter.id,
                    format_timestamp(letter.recorded_at),
                    letter.kind.as_str(),
                    letter.payload.recipient,
                    letter.attempt_count,
                    letter.error
                );
            }
        }
        Command::MarkProcessed { id } => {
            ledger.mark_processed(rider_enforcement::ViolationId(id))?;
            println!("violation {} marked processed", id);
        }
        Command::Reopen { id } => {
            ledger.reopen_violation(rider_enforcement::ViolationId(id))?;
            println!("violation {} reopened; notice goes out on next start", id);
        }
    }
    Ok(())
}
