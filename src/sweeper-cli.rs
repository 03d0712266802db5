//! Run one maintenance sweep against an e-Pilketos database and report
//! what it cleaned up. The same sweep runs periodically inside the server.

use chrono::Utc;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use mongodb::Client;
use rocket::serde::json::serde_json;

use pilketos_backend::{
    config::DATABASE_NAME,
    model::db::sweeper::{sweep, SweepReport},
};

const PROGRAM_NAME: &str = "pilketos-sweeper";

const ABOUT_TEXT: &str = "Sweep expired and orphaned sessions, and redact spent tokens.

EXIT CODES:
     0: Sweep completed.
     1: Error.";

const DB_URI: &str = "DB_URI";
const DATABASE: &str = "database";
const BATCH_SIZE: &str = "batch-size";
const JSON: &str = "json";

/// Construct the CLI configuration.
fn cli() -> Command {
    // Make the build dirty when the toml changes.
    include_str!("../Cargo.toml");

    clap::command!(PROGRAM_NAME)
        .about(ABOUT_TEXT)
        .arg(
            Arg::new(DB_URI)
                .help("MongoDB connection string. Must point at a replica set")
                .action(ArgAction::Set)
                .required(true),
        )
        .arg(
            Arg::new(DATABASE)
                .long(DATABASE)
                .help("Database to sweep")
                .action(ArgAction::Set)
                .default_value(DATABASE_NAME),
        )
        .arg(
            Arg::new(BATCH_SIZE)
                .long(BATCH_SIZE)
                .help("Most tokens to redact in this run")
                .action(ArgAction::Set)
                .value_parser(value_parser!(u32).range(1..))
                .default_value("500"),
        )
        .arg(
            Arg::new(JSON)
                .long(JSON)
                .help("Print the report as JSON")
                .action(ArgAction::SetTrue),
        )
}

async fn run_sweep(uri: &str, database: &str, batch_size: u32) -> Result<SweepReport, String> {
    let client = Client::with_uri_str(uri)
        .await
        .map_err(|e| format!("Could not connect to {uri}: {e}"))?;
    sweep(&client.database(database), Utc::now(), batch_size)
        .await
        .map_err(|e| format!("Sweep failed: {e}"))
}

/// Run the sweep, report the result, and return the exit code.
fn run(args: &ArgMatches) -> u8 {
    // Required or defaulted arguments are guaranteed to be present.
    let uri: &String = args.get_one(DB_URI).unwrap();
    let database: &String = args.get_one(DATABASE).unwrap();
    let batch_size: u32 = *args.get_one(BATCH_SIZE).unwrap();

    let runtime = match rocket::tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            println!("Could not start the async runtime: {e}");
            return 1;
        }
    };

    match runtime.block_on(run_sweep(uri, database, batch_size)) {
        Ok(report) if args.get_flag(JSON) => match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                println!("{json}");
                0
            }
            Err(e) => {
                println!("Could not serialise the report: {e}");
                1
            }
        },
        Ok(report) => {
            println!("Sweep completed.");
            println!("{report}");
            0
        }
        Err(msg) => {
            println!("{msg}");
            1
        }
    }
}

fn main() {
    let args = cli().get_matches();
    let exit_code = run(&args);
    std::process::exit(exit_code.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn defaults_apply() {
        let args = cli().get_matches_from([PROGRAM_NAME, "mongodb://localhost:27017"]);
        assert_eq!(args.get_one::<String>(DATABASE).unwrap(), DATABASE_NAME);
        assert_eq!(*args.get_one::<u32>(BATCH_SIZE).unwrap(), 500);
        assert!(!args.get_flag(JSON));

        let args = cli().try_get_matches_from([PROGRAM_NAME, "mongodb://x", "--batch-size", "0"]);
        assert!(args.is_err());
    }
}
