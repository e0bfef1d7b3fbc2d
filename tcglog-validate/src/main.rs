// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Validate a TCG measurement event log file.
//!
//! Replays the log, re-derives what each event should have measured,
//! and reports the firmware quirks and digest mismatches it finds.
//! Quirks are reported, not treated as failures: the exit code is
//! non-zero only when the log cannot be read at all.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tcg_eventlog::{
    event_type_name, validate_log, EventData, HashAlgorithm, Log, LogOptions, ValidateOptions,
    ValidationResult,
};

/// Validate a TCG measurement event log
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Validate log entries made by GRUB into PCRs 8 and 9
    #[arg(long)]
    with_grub: bool,

    /// Don't validate log entries for PCRs 0 - 7
    #[arg(long)]
    no_default_pcrs: bool,

    /// Validate log entries for the specified PCR. Can be specified
    /// multiple times
    #[arg(long = "pcr", value_name = "INDEX")]
    pcrs: Vec<u32>,

    /// Validate log entries for the specified algorithm
    /// (sha1|sha256|sha384|sha512). Can be specified multiple times
    #[arg(long = "alg", value_name = "ALGORITHM")]
    algorithms: Vec<HashAlgorithm>,

    /// Path to the binary event log
    log_path: PathBuf,
}

fn format_event_type(event_type: u32) -> String {
    match event_type_name(event_type) {
        Some(name) => name.to_string(),
        None => format!("{event_type:#010x}"),
    }
}

fn print_report(result: &ValidationResult) {
    println!("*** QUIRKS ***");

    if result.efi_variable_boot_quirk {
        println!(
            "EV_EFI_VARIABLE_BOOT events measure entire UEFI_VARIABLE_DATA structure rather \
             than just the variable contents"
        );
    }

    let mut seen_excess_measured_bytes = false;
    for validated in &result.validated_events {
        if validated.excess_measured_bytes.is_empty() {
            continue;
        }
        if !seen_excess_measured_bytes {
            seen_excess_measured_bytes = true;
            println!(
                "The following events have padding at the end of their event data that was \
                 hashed and measured:"
            );
        }
        println!(
            "- Event {} in PCR {} (type: {}): {} ({} bytes)",
            validated.event.index,
            validated.event.pcr_index,
            format_event_type(validated.event.event_type),
            hex::encode(&validated.excess_measured_bytes),
            validated.excess_measured_bytes.len()
        );
    }

    let mut seen_unmeasured_byte = false;
    for validated in &result.validated_events {
        if !validated.efi_variable_authority_has_unmeasured_byte {
            continue;
        }
        if !seen_unmeasured_byte {
            seen_unmeasured_byte = true;
            println!(
                "The following events have one extra byte at the end of their event data that \
                 was not hashed and measured:"
            );
        }
        let EventData::EfiVariable(variable) = &validated.event.data else {
            continue;
        };
        println!(
            "- Event {} in PCR {} [ VariableName: {}, UnicodeName: \"{}\" ] (byte: {:#04x})",
            validated.event.index,
            validated.event.pcr_index,
            variable.variable_name,
            variable.unicode_name,
            variable.variable_data[variable.variable_data.len() - 1],
        );
    }

    println!("*** END QUIRKS ***");
    println!();

    println!("*** UNEXPECTED EVENT DIGESTS ***");
    for validated in &result.validated_events {
        for unexpected in &validated.unexpected_digest_values {
            println!(
                "Event {} in PCR {} (type: {}, alg: {}) - expected: {}, got: {}",
                validated.event.index,
                validated.event.pcr_index,
                format_event_type(validated.event.event_type),
                unexpected.algorithm,
                hex::encode(&unexpected.expected),
                hex::encode(&unexpected.actual),
            );
        }
    }
    println!("*** END UNEXPECTED EVENT DIGESTS ***");
    println!();

    println!("*** LOG CONSISTENCY ERRORS ***");
    for error in &result.log_consistency_errors {
        println!(
            "PCR {}, bank {} - actual PCR value: {}, expected PCR value from event log: {}",
            error.pcr_index,
            error.algorithm,
            hex::encode(&error.pcr_digest),
            hex::encode(&error.expected_pcr_digest),
        );
    }
    println!("*** END LOG CONSISTENCY ERRORS ***");
}

fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        fmt().with_env_filter(filter).init();
    }
    let cli = Cli::parse();

    let mut pcrs: BTreeSet<u32> = cli.pcrs.into_iter().collect();
    if !cli.no_default_pcrs {
        pcrs.extend(0..=7);
        if cli.with_grub {
            pcrs.extend([8, 9]);
        }
    }

    let mut log = Log::from_file(
        &cli.log_path,
        LogOptions {
            enable_grub: cli.with_grub,
        },
    )
    .with_context(|| format!("failed to open log file {}", cli.log_path.display()))?;

    let result = validate_log(
        &mut log,
        ValidateOptions {
            pcrs,
            algorithms: cli.algorithms,
            expected_pcr_values: Default::default(),
        },
    )
    .context("failed to validate log file")?;

    print_report(&result);
    Ok(())
}
