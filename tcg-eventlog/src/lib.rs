// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Parser and validator for TCG measurement event logs.
//!
//! Platform firmware records every measurement it extends into a TPM
//! PCR in an event log, either in the legacy PC Client format (one
//! SHA-1 digest per event) or the crypto-agile format (one digest per
//! advertised algorithm). This crate decodes both formats from a
//! seekable byte source, decodes the structured event payloads defined
//! by the TCG specifications, and replays the log per (PCR, algorithm)
//! bank to reconcile it against the TPM's actual PCR values.
//!
//! ```no_run
//! use tcg_eventlog::{validate_log, Log, LogOptions, ValidateOptions};
//!
//! let mut log = Log::from_file(
//!     "/sys/kernel/security/tpm0/binary_bios_measurements",
//!     LogOptions::default(),
//! )?;
//! let result = validate_log(&mut log, ValidateOptions::default())?;
//! for event in &result.validated_events {
//!     println!("{:?}", event.event);
//! }
//! # Ok::<(), tcg_eventlog::LogError>(())
//! ```

pub use efi::{
    EfiGptEventData, EfiGptPartitionEntry, EfiGptPartitionTableHeader, EfiImageLoadEventData,
    EfiVariableEventData, Guid,
};
pub use events::{
    AsciiStringEventData, BimReferenceManifestEventData, BrokenEventData,
    EfiSpecIdEventAlgorithmSize, Event, EventData, EventDataError, GrubEventData, GrubEventKind,
    OpaqueEventData, SeparatorEventData, Spec, SpecIdEventData, StartupLocalityEventData,
};
pub use log::{Log, LogError, LogOptions, Result};
pub use tcg::{event_type_name, DigestMap, HashAlgorithm};
pub use validate::{
    validate_log, LogConsistencyError, PcrValues, UnexpectedDigestValue, ValidateOptions,
    ValidatedEvent, ValidationResult,
};

mod codec;
mod efi;
mod events;
mod log;
pub mod tcg;
mod validate;
