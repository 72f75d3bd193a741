//! Ledger ICP Signer CLI Example
//!
//! This example demonstrates how to use the Ledger signer library with a
//! native USB HID transport, or against a Speculos emulator.
//!
//! # Prerequisites
//!
//! - A Ledger device (Nano S Plus, Nano X, Flex, or Stax) with the
//!   Internet Computer app installed and open
//! - No other wallet software holding the device (close Ledger Live)
//! - For emulator runs: `export ICP_LEDGER_TCP=127.0.0.1:9999`
//!
//! # Quick Start
//!
//! ```bash
//! cargo run --example ledger-cli -p icp-ledger-signer-core -- info
//! cargo run --example ledger-cli -p icp-ledger-signer-core -- version
//! cargo run --example ledger-cli -p icp-ledger-signer-core -- sign 0xdeadbeef
//! ```
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `info [index]` | Show the principal and public key for an account |
//! | `address [index]` | Same, but confirmed on the device screen |
//! | `version` | Show the installed app version |
//! | `tokens` | List the tokens the app knows how to display |
//! | `sign <hex> [index]` | Sign raw bytes with the account key |
//!
//! `index` selects the account under `m/44'/223'/0'/0/<index>` and
//! defaults to 0.
//!
//! # Security Notes
//!
//! - Private keys never leave the Ledger
//! - The device screen is the source of truth for what gets signed

use std::env;
use std::process::ExitCode;

use icp_ledger_signer_core::identity::Identity;
use icp_ledger_signer_core::{Error, LedgerIdentity};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        return ExitCode::FAILURE;
    }

    let result = match args[1].as_str() {
        "info" => cmd_info(&args[2..], false).await,
        "address" => cmd_info(&args[2..], true).await,
        "version" => cmd_version(&args[2..]).await,
        "tokens" => cmd_tokens(&args[2..]).await,
        "sign" => cmd_sign(&args[2..]).await,
        other => {
            eprintln!("Unknown command: {other}");
            print_usage(&args[0]);
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn print_usage(program: &str) {
    eprintln!("Usage: {program} <command> [args]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  info [index]       Show the principal and public key");
    eprintln!("  address [index]    Show them with on-device confirmation");
    eprintln!("  version            Show the installed app version");
    eprintln!("  tokens             List supported tokens");
    eprintln!("  sign <hex> [index] Sign raw bytes");
}

fn parse_index(arg: Option<&String>) -> Result<u32, Error> {
    match arg {
        None => Ok(0),
        Some(raw) => raw.parse().map_err(|_| Error::IdentityCreation {
            reason: format!("'{raw}' is not a valid account index"),
        }),
    }
}

async fn cmd_info(args: &[String], confirm: bool) -> Result<(), Error> {
    let index = parse_index(args.first())?;
    let identity = LedgerIdentity::create(index).await?;

    if confirm {
        println!("Confirm the address on the device screen...");
        identity.show_address_and_public_key_on_device().await?;
    }

    println!("Derivation path: {}", identity.derivation_path());
    println!("Principal:       {}", identity.sender());
    if let Some(der) = identity.public_key() {
        println!("Public key:      0x{}", hex::encode(der));
    }
    Ok(())
}

async fn cmd_version(args: &[String]) -> Result<(), Error> {
    let index = parse_index(args.first())?;
    let identity = LedgerIdentity::create(index).await?;
    println!("Internet Computer app v{}", identity.get_version().await?);
    Ok(())
}

async fn cmd_tokens(args: &[String]) -> Result<(), Error> {
    let index = parse_index(args.first())?;
    let identity = LedgerIdentity::create(index).await?;

    let tokens = identity.get_supported_tokens().await?;
    if tokens.is_empty() {
        println!("The app reports no supported tokens.");
        return Ok(());
    }
    for token in tokens {
        println!(
            "{:<8} ledger={} decimals={}",
            token.symbol, token.ledger_canister_id, token.decimals
        );
    }
    Ok(())
}

async fn cmd_sign(args: &[String]) -> Result<(), Error> {
    let Some(raw) = args.first() else {
        eprintln!("Usage: sign <hex> [index]");
        return Err(Error::Decode("missing payload".to_string()));
    };
    let payload = hex::decode(raw.strip_prefix("0x").unwrap_or(raw))?;
    let index = parse_index(args.get(1))?;

    let identity = LedgerIdentity::create(index).await?;
    println!("Review the payload on the device...");
    let signature = identity.sign_payload(&payload).await?;
    println!("Signature: 0x{}", hex::encode(signature));
    Ok(())
}
