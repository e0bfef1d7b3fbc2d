// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Replay-and-verify engine.
//!
//! For every event the validator re-derives the bytes the firmware
//! should have hashed, checks them against the recorded digests, and
//! extends a shadow PCR bank per algorithm. Deviations are recorded as
//! data on the result, never as errors: the tool exists to characterize
//! firmware quirks, not to reject logs that exhibit them.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Seek};

use tracing::{debug, warn};

use crate::events::{Event, EventData};
use crate::log::{Log, LogError, Result};
use crate::tcg::{
    HashAlgorithm, EV_ACTION, EV_EFI_ACTION, EV_EFI_GPT_EVENT, EV_EFI_VARIABLE_AUTHORITY,
    EV_EFI_VARIABLE_BOOT, EV_EFI_VARIABLE_DRIVER_CONFIG, EV_IPL, EV_NO_ACTION, EV_SEPARATOR,
    SEPARATOR_EVENT_ERROR_VALUE,
};

/// Expected final PCR values, keyed by (PCR index, algorithm).
pub type PcrValues = BTreeMap<(u32, HashAlgorithm), Vec<u8>>;

/// Controls which parts of the log the validator inspects.
#[derive(Clone, Debug)]
pub struct ValidateOptions {
    /// PCRs to replay and report on. Events for other PCRs are still
    /// decoded so the stream stays aligned, but contribute nothing.
    pub pcrs: BTreeSet<u32>,
    /// Algorithm banks to inspect; must be a subset of the log's
    /// advertised set. Empty selects the full advertised set.
    pub algorithms: Vec<HashAlgorithm>,
    /// The platform TPM's current PCR values to reconcile against.
    pub expected_pcr_values: PcrValues,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            pcrs: (0..=7).collect(),
            algorithms: Vec::new(),
            expected_pcr_values: PcrValues::new(),
        }
    }
}

/// A recorded digest that does not match the re-derived measured bytes.
#[derive(Clone, Debug)]
pub struct UnexpectedDigestValue {
    pub algorithm: HashAlgorithm,
    pub expected: Vec<u8>,
    pub actual: Vec<u8>,
}

/// An event together with the anomalies discovered while checking it.
#[derive(Clone, Debug)]
pub struct ValidatedEvent {
    pub event: Event,
    pub unexpected_digest_values: Vec<UnexpectedDigestValue>,
    /// Payload tail bytes that were hashed into the recorded digest
    /// even though the structured layout does not cover them.
    pub excess_measured_bytes: Vec<u8>,
    /// This EV_EFI_VARIABLE_BOOT event measured the whole
    /// UEFI_VARIABLE_DATA structure rather than the variable contents.
    pub efi_variable_boot_quirk: bool,
    /// This EV_EFI_VARIABLE_AUTHORITY event left the final byte of its
    /// variable data out of the measurement.
    pub efi_variable_authority_has_unmeasured_byte: bool,
}

impl ValidatedEvent {
    fn new(event: Event) -> Self {
        Self {
            event,
            unexpected_digest_values: Vec::new(),
            excess_measured_bytes: Vec::new(),
            efi_variable_boot_quirk: false,
            efi_variable_authority_has_unmeasured_byte: false,
        }
    }
}

/// A (PCR, algorithm) bank whose replayed value disagrees with the
/// value supplied by the caller.
#[derive(Clone, Debug)]
pub struct LogConsistencyError {
    pub pcr_index: u32,
    pub algorithm: HashAlgorithm,
    /// The value the caller read from the TPM.
    pub pcr_digest: Vec<u8>,
    /// The value replayed from the log.
    pub expected_pcr_digest: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct ValidationResult {
    pub validated_events: Vec<ValidatedEvent>,
    pub log_consistency_errors: Vec<LogConsistencyError>,
    /// The platform measures whole UEFI_VARIABLE_DATA structures for
    /// EV_EFI_VARIABLE_BOOT events.
    pub efi_variable_boot_quirk: bool,
}

/// How this platform's firmware measures EV_EFI_VARIABLE_BOOT events.
/// Fixed by the first such event that matches either way.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EfiBootVariableBehaviour {
    VariableData,
    FullStructure,
}

struct LogValidator {
    pcrs: BTreeSet<u32>,
    algorithms: Vec<HashAlgorithm>,
    banks: BTreeMap<(u32, HashAlgorithm), Vec<u8>>,
    boot_variable_behaviour: Option<EfiBootVariableBehaviour>,
    result: ValidationResult,
}

/// Replay the whole log and reconcile it against the caller's PCR values.
pub fn validate_log<R: Read + Seek>(
    log: &mut Log<R>,
    options: ValidateOptions,
) -> Result<ValidationResult> {
    let algorithms = if options.algorithms.is_empty() {
        log.algorithms().to_vec()
    } else {
        for alg in &options.algorithms {
            if !log.algorithms().contains(alg) {
                return Err(LogError::AlgorithmNotPresentInLog(*alg));
            }
        }
        options.algorithms
    };

    let mut banks = BTreeMap::new();
    for pcr in &options.pcrs {
        for alg in &algorithms {
            banks.insert((*pcr, *alg), alg.zero_digest());
        }
    }

    let mut validator = LogValidator {
        pcrs: options.pcrs,
        algorithms,
        banks,
        boot_variable_behaviour: None,
        result: ValidationResult::default(),
    };

    while let Some((event, trailing)) = log.next_event_internal()? {
        validator.process_event(event, trailing);
    }

    validator.finish(&options.expected_pcr_values)
}

impl LogValidator {
    fn process_event(&mut self, event: Event, trailing: usize) {
        if !self.pcrs.contains(&event.pcr_index) {
            return;
        }

        let mut validated = ValidatedEvent::new(event);

        // NO_ACTION events carry informational data with all-zero
        // digests; the TPM never extends them.
        if validated.event.event_type != EV_NO_ACTION {
            self.check_event_digests(&mut validated, trailing);
            self.extend_banks(&validated.event);
        }

        self.result.validated_events.push(validated);
    }

    fn extend_banks(&mut self, event: &Event) {
        for alg in &self.algorithms {
            let Some(digest) = event.digests.get(alg) else {
                continue;
            };
            let Some(bank) = self.banks.get_mut(&(event.pcr_index, *alg)) else {
                continue;
            };
            let mut buf = Vec::with_capacity(bank.len() + digest.len());
            buf.extend_from_slice(bank);
            buf.extend_from_slice(digest);
            *bank = alg.hash(&buf);
        }
    }

    /// Bytes the firmware should have hashed for this event, or `None`
    /// for event types whose measured content cannot be re-derived from
    /// the log (image loads measure Authenticode content of the image
    /// itself; opaque types have no defined layout). Payload tail bytes
    /// the decoder did not consume are excluded from the baseline; the
    /// excess-measured-bytes check adds them back.
    fn measured_bytes(&self, event: &Event, trailing: usize) -> Option<Vec<u8>> {
        match event.event_type {
            EV_SEPARATOR => match &event.data {
                EventData::Separator(s) if s.is_error => {
                    Some(SEPARATOR_EVENT_ERROR_VALUE.to_le_bytes().to_vec())
                }
                EventData::Separator(s) => Some(s.raw[..4].to_vec()),
                _ => None,
            },
            EV_ACTION | EV_EFI_ACTION => match &event.data {
                EventData::AsciiString(a) => Some(a.raw.clone()),
                _ => None,
            },
            EV_EFI_VARIABLE_DRIVER_CONFIG | EV_EFI_VARIABLE_AUTHORITY => match &event.data {
                EventData::EfiVariable(v) => Some(v.variable_data.clone()),
                _ => None,
            },
            EV_EFI_VARIABLE_BOOT => match &event.data {
                EventData::EfiVariable(v) => {
                    if self.boot_variable_behaviour == Some(EfiBootVariableBehaviour::FullStructure)
                    {
                        Some(v.raw.clone())
                    } else {
                        Some(v.variable_data.clone())
                    }
                }
                _ => None,
            },
            EV_EFI_GPT_EVENT => match &event.data {
                EventData::EfiGpt(g) => Some(g.raw[..g.raw.len() - trailing].to_vec()),
                _ => None,
            },
            EV_IPL => match &event.data {
                EventData::Grub(g) => Some(g.raw.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    fn check_event_digests(&mut self, validated: &mut ValidatedEvent, trailing: usize) {
        let Some(mut measured) = self.measured_bytes(&validated.event, trailing) else {
            return;
        };

        let event = &validated.event;
        for alg in &self.algorithms {
            let Some(digest) = event.digests.get(alg) else {
                continue;
            };
            let expected = alg.hash(&measured);
            if expected == *digest {
                if event.event_type == EV_EFI_VARIABLE_BOOT {
                    match self.boot_variable_behaviour {
                        None => {
                            self.boot_variable_behaviour =
                                Some(EfiBootVariableBehaviour::VariableData);
                        }
                        Some(EfiBootVariableBehaviour::FullStructure) => {
                            validated.efi_variable_boot_quirk = true;
                        }
                        Some(EfiBootVariableBehaviour::VariableData) => {}
                    }
                }
                continue;
            }

            // EV_EFI_VARIABLE_BOOT events on some platforms measure the
            // entire UEFI_VARIABLE_DATA structure. The first matching
            // event fixes the behaviour for the rest of the log.
            if event.event_type == EV_EFI_VARIABLE_BOOT
                && self.boot_variable_behaviour.is_none()
                && alg.hash(event.data.raw()) == *digest
            {
                debug!(
                    pcr = event.pcr_index,
                    index = event.index,
                    "EV_EFI_VARIABLE_BOOT measures the whole UEFI_VARIABLE_DATA structure"
                );
                self.boot_variable_behaviour = Some(EfiBootVariableBehaviour::FullStructure);
                validated.efi_variable_boot_quirk = true;
                self.result.efi_variable_boot_quirk = true;
                measured = event.data.raw().to_vec();
                continue;
            }

            // Some firmware measures the authority variable data with
            // its final byte removed.
            if event.event_type == EV_EFI_VARIABLE_AUTHORITY
                && !measured.is_empty()
                && alg.hash(&measured[..measured.len() - 1]) == *digest
            {
                debug!(
                    pcr = event.pcr_index,
                    index = event.index,
                    "EV_EFI_VARIABLE_AUTHORITY leaves its final byte unmeasured"
                );
                validated.efi_variable_authority_has_unmeasured_byte = true;
                continue;
            }

            // Undecoded payload tail bytes that were nonetheless hashed.
            if trailing > 0 {
                let raw = event.data.raw();
                let excess = &raw[raw.len() - trailing..];
                let mut with_excess = measured.clone();
                with_excess.extend_from_slice(excess);
                if alg.hash(&with_excess) == *digest {
                    validated.excess_measured_bytes = excess.to_vec();
                    continue;
                }
            }

            warn!(
                pcr = event.pcr_index,
                index = event.index,
                algorithm = %alg,
                "recorded digest does not match the measured bytes"
            );
            validated.unexpected_digest_values.push(UnexpectedDigestValue {
                algorithm: *alg,
                expected,
                actual: digest.clone(),
            });
        }
    }

    fn finish(mut self, expected_pcr_values: &PcrValues) -> Result<ValidationResult> {
        for ((pcr_index, algorithm), pcr_digest) in expected_pcr_values {
            if !self.pcrs.contains(pcr_index) || !self.algorithms.contains(algorithm) {
                continue;
            }
            let Some(replayed) = self.banks.get(&(*pcr_index, *algorithm)) else {
                continue;
            };
            if replayed != pcr_digest {
                warn!(
                    pcr = pcr_index,
                    algorithm = %algorithm,
                    "replayed PCR value disagrees with the TPM"
                );
                self.result.log_consistency_errors.push(LogConsistencyError {
                    pcr_index: *pcr_index,
                    algorithm: *algorithm,
                    pcr_digest: pcr_digest.clone(),
                    expected_pcr_digest: replayed.clone(),
                });
            }
        }
        Ok(self.result)
    }
}
