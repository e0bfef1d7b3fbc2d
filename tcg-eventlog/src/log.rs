// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Streaming readers for the two TCG log formats and the log driver.
//!
//! The legacy "PC Client" format carries a single SHA-1 digest per
//! record. The crypto-agile ("EFI 2") format carries one digest per
//! algorithm advertised by the Spec ID event, which is itself framed as
//! a legacy record at the head of the log.
//!
//! See TCG PC Client Platform Firmware Profile spec sections 9.2.1
//! (TCG_PCClientPCREvent) and 9.2.2 (TCG_PCR_EVENT2).

use std::collections::BTreeMap;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::codec;
use crate::events::{
    decode_event_data, EfiSpecIdEventAlgorithmSize, Event, EventData, EventDataError, Spec,
};
use crate::tcg::{
    DigestMap, HashAlgorithm, EV_SEPARATOR, MAX_PCR_INDEX, SEPARATOR_EVENT_ERROR_VALUE,
};

/// Controls how a [`Log`] decodes event payloads.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogOptions {
    /// Decode PCR 8/9 string events recorded by GRUB.
    pub enable_grub: bool,
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("error when reading from log stream: {0}")]
    Io(io::Error),
    #[error("unexpected end of stream inside a log entry")]
    TruncatedLog,
    #[error("log entry has an out-of-range PCR index ({0})")]
    PcrIndexOutOfRange(u32),
    #[error("crypto-agile log entry contains a digest for an unrecognized algorithm (0x{0:04x})")]
    UnrecognizedAlgorithm(u16),
    #[error("crypto-agile log entry contains more than one digest value for algorithm 0x{0:04x}")]
    DuplicateDigest(u16),
    #[error(
        "crypto-agile log entry is missing a digest value for algorithm 0x{0:04x} \
         that was present in the Spec ID Event"
    )]
    MissingDigest(u16),
    #[error("invalid Spec ID Event: {0}")]
    InvalidSpecIdEvent(#[source] EventDataError),
    #[error("validation requested for algorithm {0} which is not present in the log")]
    AlgorithmNotPresentInLog(HashAlgorithm),
    #[error("cannot read next event: log state is inconsistent due to a previous error")]
    Inconsistent,
}

pub type Result<T> = std::result::Result<T, LogError>;

/// End-of-stream inside a record is truncation, anything else is I/O.
fn read_err(e: io::Error) -> LogError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        LogError::TruncatedLog
    } else {
        LogError::Io(e)
    }
}

/// Read one TCG_PCClientPCREvent record. `Ok(None)` at a clean
/// end-of-stream.
fn read_event_pcclient<R: Read>(
    r: &mut R,
    enable_grub: bool,
) -> Result<Option<(Event, usize)>> {
    let mut head = [0u8; 4];
    if !codec::try_read_exact(r, &mut head).map_err(read_err)? {
        return Ok(None);
    }
    let pcr_index = u32::from_le_bytes(head);
    if pcr_index > MAX_PCR_INDEX {
        return Err(LogError::PcrIndexOutOfRange(pcr_index));
    }
    let event_type = codec::read_u32(r).map_err(read_err)?;
    let digest = codec::read_vec(r, HashAlgorithm::Sha1.digest_size()).map_err(read_err)?;
    let event_size = codec::read_u32(r).map_err(read_err)?;
    let raw_data = codec::read_vec(r, event_size as usize).map_err(read_err)?;

    let mut digests = DigestMap::new();
    digests.insert(HashAlgorithm::Sha1, digest);
    let (data, trailing) = decode_event_data(pcr_index, event_type, raw_data, enable_grub);
    Ok(Some((
        Event {
            index: 0,
            pcr_index,
            event_type,
            digests,
            data,
        },
        trailing,
    )))
}

/// Read one TCG_PCR_EVENT2 record. The digest list is checked against
/// the algorithms advertised by the Spec ID event; digests for
/// algorithms outside the supported set are consumed but dropped.
fn read_event2<R: Read>(
    r: &mut R,
    alg_sizes: &[EfiSpecIdEventAlgorithmSize],
    enable_grub: bool,
) -> Result<Option<(Event, usize)>> {
    let mut head = [0u8; 4];
    if !codec::try_read_exact(r, &mut head).map_err(read_err)? {
        return Ok(None);
    }
    let pcr_index = u32::from_le_bytes(head);
    if pcr_index > MAX_PCR_INDEX {
        return Err(LogError::PcrIndexOutOfRange(pcr_index));
    }
    let event_type = codec::read_u32(r).map_err(read_err)?;
    let digest_count = codec::read_u32(r).map_err(read_err)?;

    let mut digests = DigestMap::new();
    let mut seen: Vec<u16> = Vec::new();
    for _ in 0..digest_count {
        let algorithm_id = codec::read_u16(r).map_err(read_err)?;
        let Some(alg_size) = alg_sizes.iter().find(|a| a.algorithm_id == algorithm_id) else {
            return Err(LogError::UnrecognizedAlgorithm(algorithm_id));
        };
        let digest = codec::read_vec(r, usize::from(alg_size.digest_size)).map_err(read_err)?;
        if seen.contains(&algorithm_id) {
            return Err(LogError::DuplicateDigest(algorithm_id));
        }
        seen.push(algorithm_id);
        if let Some(alg) = HashAlgorithm::from_alg_id(algorithm_id) {
            digests.insert(alg, digest);
        }
    }
    for alg_size in alg_sizes {
        if !seen.contains(&alg_size.algorithm_id) {
            return Err(LogError::MissingDigest(alg_size.algorithm_id));
        }
    }

    let event_size = codec::read_u32(r).map_err(read_err)?;
    let raw_data = codec::read_vec(r, event_size as usize).map_err(read_err)?;

    let (data, trailing) = decode_event_data(pcr_index, event_type, raw_data, enable_grub);
    Ok(Some((
        Event {
            index: 0,
            pcr_index,
            event_type,
            digests,
            data,
        },
        trailing,
    )))
}

#[derive(Debug)]
enum LogStream {
    PcClient,
    CryptoAgile {
        alg_sizes: Vec<EfiSpecIdEventAlgorithmSize>,
        /// The first record predates the crypto-agile format and is
        /// read with the legacy reader.
        read_first_event: bool,
    },
}

/// An event log parser instance. Events are read strictly in file
/// order; any mid-record decode error leaves the stream position
/// ambiguous, so further reads are refused afterwards.
#[derive(Debug)]
pub struct Log<R> {
    source: R,
    stream: LogStream,
    options: LogOptions,
    spec: Spec,
    algorithms: Vec<HashAlgorithm>,
    failed: bool,
    index_tracker: BTreeMap<u32, u32>,
}

impl<R: Read + Seek> Log<R> {
    /// Detect the log format from the first event and bind a reader.
    ///
    /// The first record is read with the legacy reader and the source
    /// is rewound, so the record is surfaced again by `next_event`.
    pub fn open(mut source: R, options: LogOptions) -> Result<Self> {
        let start = source.stream_position().map_err(LogError::Io)?;

        let (first_event, _) = read_event_pcclient(&mut source, options.enable_grub)?
            .ok_or(LogError::TruncatedLog)?;

        let mut spec = Spec::Unknown;
        let mut alg_sizes = Vec::new();
        match &first_event.data {
            EventData::SpecId(d) => {
                spec = d.spec;
                alg_sizes = d.digest_sizes.clone();
            }
            EventData::Broken(b) => {
                if matches!(b.error, EventDataError::InvalidSpecIdEvent(_)) {
                    return Err(LogError::InvalidSpecIdEvent(b.error.clone()));
                }
            }
            _ => {}
        }

        let (stream, algorithms) = if spec == Spec::Efi2 {
            let algorithms: Vec<HashAlgorithm> = alg_sizes
                .iter()
                .filter_map(|a| HashAlgorithm::from_alg_id(a.algorithm_id))
                .collect();
            debug!(?spec, ?algorithms, "crypto-agile log detected");
            (
                LogStream::CryptoAgile {
                    alg_sizes,
                    read_first_event: false,
                },
                algorithms,
            )
        } else {
            debug!(?spec, "legacy log, single SHA-1 bank");
            (LogStream::PcClient, vec![HashAlgorithm::Sha1])
        };

        source.seek(SeekFrom::Start(start)).map_err(LogError::Io)?;

        Ok(Log {
            source,
            stream,
            options,
            spec,
            algorithms,
            failed: false,
            index_tracker: BTreeMap::new(),
        })
    }

    /// The specification the log conforms to.
    pub fn spec(&self) -> Spec {
        self.spec
    }

    /// The digest algorithms carried by the log, filtered to the
    /// supported set.
    pub fn algorithms(&self) -> &[HashAlgorithm] {
        &self.algorithms
    }

    /// The next event in the log, or `None` after the last one.
    pub fn next_event(&mut self) -> Result<Option<Event>> {
        Ok(self.next_event_internal()?.map(|(event, _)| event))
    }

    /// As `next_event`, but also exposing the count of undecoded tail
    /// bytes in the payload, which the validator needs for quirk
    /// detection.
    pub(crate) fn next_event_internal(&mut self) -> Result<Option<(Event, usize)>> {
        if self.failed {
            return Err(LogError::Inconsistent);
        }

        let next = match &mut self.stream {
            LogStream::PcClient => {
                read_event_pcclient(&mut self.source, self.options.enable_grub)
            }
            LogStream::CryptoAgile {
                alg_sizes,
                read_first_event,
            } => {
                if !*read_first_event {
                    *read_first_event = true;
                    read_event_pcclient(&mut self.source, self.options.enable_grub)
                } else {
                    read_event2(&mut self.source, alg_sizes, self.options.enable_grub)
                }
            }
        };

        let (mut event, trailing) = match next {
            Ok(Some(v)) => v,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.failed = true;
                return Err(e);
            }
        };

        let counter = self.index_tracker.entry(event.pcr_index).or_insert(0);
        event.index = *counter;
        *counter += 1;

        if event.event_type == EV_SEPARATOR {
            classify_separator(&mut event);
        }
        if matches!(&event.data, EventData::SpecId(_)) {
            self.fixup_spec_id_event(&mut event);
        }

        Ok(Some((event, trailing)))
    }

    /// The first event conventionally carries only a SHA-1 digest even
    /// in a crypto-agile log; give it a zero digest for every other
    /// advertised algorithm so its digest map matches the rest.
    fn fixup_spec_id_event(&self, event: &mut Event) {
        let EventData::SpecId(d) = &event.data else {
            return;
        };
        if d.spec != Spec::Efi2 {
            return;
        }
        for alg in &self.algorithms {
            event
                .digests
                .entry(*alg)
                .or_insert_with(|| alg.zero_digest());
        }
    }
}

impl Log<BufReader<fs_err::File>> {
    /// Open a log file, e.g.
    /// `/sys/kernel/security/tpm0/binary_bios_measurements`.
    pub fn from_file(path: impl AsRef<Path>, options: LogOptions) -> Result<Self> {
        let file = fs_err::File::open(path.as_ref()).map_err(LogError::Io)?;
        Self::open(BufReader::new(file), options)
    }
}

/// An error separator does not measure its event data: it measures the
/// 4-byte error marker, and the event data is informational.
fn classify_separator(event: &mut Event) {
    let marker = SEPARATOR_EVENT_ERROR_VALUE.to_le_bytes();
    let is_error = event
        .digests
        .iter()
        .any(|(alg, digest)| alg.hash(&marker) == *digest);
    if let EventData::Separator(s) = &mut event.data {
        s.is_error = is_error;
    }
}
