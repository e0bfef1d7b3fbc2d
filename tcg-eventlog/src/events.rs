// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Event records and the structured decoders for their payloads.
//!
//! Payload decoding never fails the stream: a malformed payload is
//! wrapped in [`EventData::Broken`] together with the error, and the
//! reader keeps its framing from the record header.

use std::fmt;

use thiserror::Error;

use crate::codec::EventBuffer;
use crate::efi::{self, EfiGptEventData, EfiImageLoadEventData, EfiVariableEventData, Guid};
use crate::tcg::{
    DigestMap, HashAlgorithm, EV_ACTION, EV_EFI_ACTION, EV_EFI_BOOT_SERVICES_APPLICATION,
    EV_EFI_BOOT_SERVICES_DRIVER, EV_EFI_GPT_EVENT, EV_EFI_RUNTIME_SERVICES_DRIVER,
    EV_EFI_VARIABLE_AUTHORITY, EV_EFI_VARIABLE_BOOT, EV_EFI_VARIABLE_DRIVER_CONFIG, EV_IPL,
    EV_NO_ACTION, EV_SEPARATOR,
};

/// The log format announced by the first event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Spec {
    Unknown,
    PcClient,
    Efi12,
    Efi2,
}

/// Why a payload could not be decoded into its structured form.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EventDataError {
    #[error("not enough data")]
    NotEnoughData,
    #[error("invalid SpecIdEvent ({0})")]
    InvalidSpecIdEvent(String),
    #[error("event data is not valid UTF-16")]
    InvalidUtf16,
}

/// One digest algorithm advertised by a Spec ID event.
///
/// The id is kept raw: the advertised list may name algorithms this
/// crate cannot compute, and their sizes are still needed to skip the
/// digests of subsequent events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EfiSpecIdEventAlgorithmSize {
    pub algorithm_id: u16,
    pub digest_size: u16,
}

/// TCG_PCClientSpecIdEventStruct / TCG_EfiSpecIdEventStruct.
#[derive(Clone)]
pub struct SpecIdEventData {
    pub raw: Vec<u8>,
    pub spec: Spec,
    pub platform_class: u32,
    pub spec_version_minor: u8,
    pub spec_version_major: u8,
    pub spec_errata: u8,
    pub uintn_size: u8,
    /// Digest algorithms present in the rest of the log. Only populated
    /// for the EFI 2 ("crypto-agile") spec.
    pub digest_sizes: Vec<EfiSpecIdEventAlgorithmSize>,
    pub vendor_info: Vec<u8>,
}

impl fmt::Debug for SpecIdEventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpecIdEventData")
            .field("spec", &self.spec)
            .field("platform_class", &self.platform_class)
            .field("spec_version_major", &self.spec_version_major)
            .field("spec_version_minor", &self.spec_version_minor)
            .field("spec_errata", &self.spec_errata)
            .field("digest_sizes", &self.digest_sizes)
            .field("vendor_info", &hex::encode(&self.vendor_info))
            .finish()
    }
}

/// The TCG_EfiStartupLocalityEvent payload.
#[derive(Clone, Debug)]
pub struct StartupLocalityEventData {
    pub raw: Vec<u8>,
    pub locality: u8,
}

/// The SP800-155 BIOS integrity reference-manifest pointer event.
#[derive(Clone, Debug)]
pub struct BimReferenceManifestEventData {
    pub raw: Vec<u8>,
    pub vendor_id: u32,
    pub guid: Guid,
}

/// EV_ACTION / EV_EFI_ACTION payload: the measured ASCII string.
#[derive(Clone)]
pub struct AsciiStringEventData {
    pub raw: Vec<u8>,
}

impl AsciiStringEventData {
    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }
}

impl fmt::Debug for AsciiStringEventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AsciiStringEventData")
            .field(&self.as_string())
            .finish()
    }
}

/// EV_SEPARATOR payload.
///
/// `is_error` is filled in by the log driver: it requires hashing the
/// error marker in every algorithm present on the event.
#[derive(Clone)]
pub struct SeparatorEventData {
    pub raw: Vec<u8>,
    pub is_error: bool,
}

impl fmt::Debug for SeparatorEventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeparatorEventData")
            .field("data", &hex::encode(&self.raw))
            .field("is_error", &self.is_error)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrubEventKind {
    GrubCmd,
    KernelCmdline,
}

/// A measurement recorded by GRUB into PCR 8 or 9.
#[derive(Clone, Debug)]
pub struct GrubEventData {
    pub raw: Vec<u8>,
    pub kind: GrubEventKind,
    pub message: String,
}

/// A payload kept as raw bytes: either an event type with no structured
/// layout, or an unrecognized NO_ACTION signature.
#[derive(Clone)]
pub struct OpaqueEventData {
    pub raw: Vec<u8>,
}

impl fmt::Debug for OpaqueEventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OpaqueEventData")
            .field(&hex::encode(&self.raw))
            .finish()
    }
}

/// A payload whose structured decode failed. The raw bytes and the
/// error are preserved so that stream replay can continue.
#[derive(Clone)]
pub struct BrokenEventData {
    pub raw: Vec<u8>,
    pub error: EventDataError,
}

impl fmt::Debug for BrokenEventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokenEventData")
            .field("data", &hex::encode(&self.raw))
            .field("error", &self.error)
            .finish()
    }
}

/// Decoded event payload, one variant per recognized layout.
#[derive(Clone, Debug)]
pub enum EventData {
    SpecId(SpecIdEventData),
    StartupLocality(StartupLocalityEventData),
    BimReferenceManifest(BimReferenceManifestEventData),
    UnknownNoAction(OpaqueEventData),
    AsciiString(AsciiStringEventData),
    Separator(SeparatorEventData),
    EfiVariable(EfiVariableEventData),
    EfiImageLoad(EfiImageLoadEventData),
    EfiGpt(EfiGptEventData),
    Grub(GrubEventData),
    Opaque(OpaqueEventData),
    Broken(BrokenEventData),
}

impl EventData {
    /// The original payload bytes, exactly as framed in the log.
    pub fn raw(&self) -> &[u8] {
        match self {
            EventData::SpecId(d) => &d.raw,
            EventData::StartupLocality(d) => &d.raw,
            EventData::BimReferenceManifest(d) => &d.raw,
            EventData::UnknownNoAction(d) => &d.raw,
            EventData::AsciiString(d) => &d.raw,
            EventData::Separator(d) => &d.raw,
            EventData::EfiVariable(d) => &d.raw,
            EventData::EfiImageLoad(d) => &d.raw,
            EventData::EfiGpt(d) => &d.raw,
            EventData::Grub(d) => &d.raw,
            EventData::Opaque(d) => &d.raw,
            EventData::Broken(d) => &d.raw,
        }
    }
}

/// One measurement from the log.
#[derive(Clone)]
pub struct Event {
    /// Zero-based position among the events of the same PCR, in file order.
    pub index: u32,
    pub pcr_index: u32,
    pub event_type: u32,
    pub digests: DigestMap,
    pub data: EventData,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("index", &self.index)
            .field("pcr_index", &self.pcr_index)
            .field("event_type", &self.event_type)
            .field(
                "digests",
                &self
                    .digests
                    .iter()
                    .map(|(alg, digest)| format!("{alg}:{}", hex::encode(digest)))
                    .collect::<Vec<_>>(),
            )
            .field("data", &self.data)
            .finish()
    }
}

fn parse_spec_id(
    spec: Spec,
    data: &[u8],
) -> Result<(SpecIdEventData, usize), EventDataError> {
    let mut buf = EventBuffer::new(&data[16..]);
    let platform_class = buf.get_u32()?;
    let spec_version_minor = buf.get_u8()?;
    let spec_version_major = buf.get_u8()?;
    let spec_errata = buf.get_u8()?;
    let uintn_size = buf.get_u8()?;
    let mut digest_sizes = Vec::new();
    if spec == Spec::Efi2 {
        let number_of_algorithms = buf.get_u32()?;
        if number_of_algorithms == 0 {
            return Err(EventDataError::InvalidSpecIdEvent(
                "no digest algorithms".into(),
            ));
        }
        for _ in 0..number_of_algorithms {
            let entry = EfiSpecIdEventAlgorithmSize {
                algorithm_id: buf.get_u16()?,
                digest_size: buf.get_u16()?,
            };
            if let Some(alg) = HashAlgorithm::from_alg_id(entry.algorithm_id) {
                if usize::from(entry.digest_size) != alg.digest_size() {
                    return Err(EventDataError::InvalidSpecIdEvent(format!(
                        "wrong digest size {} for algorithm {alg}",
                        entry.digest_size
                    )));
                }
            }
            digest_sizes.push(entry);
        }
    }
    let vendor_info_size = buf.get_u8()?;
    let vendor_info = buf.get_bytes(usize::from(vendor_info_size))?.to_vec();
    let trailing = buf.remaining();
    Ok((
        SpecIdEventData {
            raw: data.to_vec(),
            spec,
            platform_class,
            spec_version_minor,
            spec_version_major,
            spec_errata,
            uintn_size,
            digest_sizes,
            vendor_info,
        },
        trailing,
    ))
}

fn decode_spec_id(spec: Spec, data: Vec<u8>) -> (EventData, usize) {
    match parse_spec_id(spec, &data) {
        Ok((parsed, trailing)) => (EventData::SpecId(parsed), trailing),
        Err(error) => {
            // A truncated header inside a recognized Spec ID signature
            // means the log itself is malformed, not merely this payload.
            let error = match error {
                EventDataError::InvalidSpecIdEvent(_) => error,
                other => EventDataError::InvalidSpecIdEvent(other.to_string()),
            };
            (EventData::Broken(BrokenEventData { raw: data, error }), 0)
        }
    }
}

fn decode_startup_locality(data: Vec<u8>) -> (EventData, usize) {
    let mut buf = EventBuffer::new(&data[16..]);
    match buf.get_u8() {
        Ok(locality) => {
            let trailing = buf.remaining();
            (
                EventData::StartupLocality(StartupLocalityEventData {
                    raw: data,
                    locality,
                }),
                trailing,
            )
        }
        Err(error) => (EventData::Broken(BrokenEventData { raw: data, error }), 0),
    }
}

fn decode_bim_reference_manifest(data: Vec<u8>) -> (EventData, usize) {
    let mut buf = EventBuffer::new(&data[16..]);
    let parsed = (|| {
        let vendor_id = buf.get_u32()?;
        let mut guid = [0u8; 16];
        guid.copy_from_slice(buf.get_bytes(16)?);
        Ok((vendor_id, Guid::from_bytes(guid)))
    })();
    match parsed {
        Ok((vendor_id, guid)) => {
            let trailing = buf.remaining();
            (
                EventData::BimReferenceManifest(BimReferenceManifestEventData {
                    raw: data,
                    vendor_id,
                    guid,
                }),
                trailing,
            )
        }
        Err(error) => (EventData::Broken(BrokenEventData { raw: data, error }), 0),
    }
}

const SIG_SPEC_ID_00: &[u8; 16] = b"Spec ID Event00\0";
const SIG_SPEC_ID_02: &[u8; 16] = b"Spec ID Event02\0";
const SIG_SPEC_ID_03: &[u8; 16] = b"Spec ID Event03\0";
const SIG_SP800_155: &[u8; 16] = b"SP800-155 Event\0";
const SIG_STARTUP_LOCALITY: &[u8; 16] = b"StartupLocality\0";

fn decode_no_action_event(data: Vec<u8>) -> (EventData, usize) {
    let Some(signature) = data.get(..16) else {
        return (
            EventData::UnknownNoAction(OpaqueEventData { raw: data }),
            0,
        );
    };
    match signature {
        sig if sig == SIG_SPEC_ID_00 => decode_spec_id(Spec::PcClient, data),
        sig if sig == SIG_SPEC_ID_02 => decode_spec_id(Spec::Efi12, data),
        sig if sig == SIG_SPEC_ID_03 => decode_spec_id(Spec::Efi2, data),
        sig if sig == SIG_SP800_155 => decode_bim_reference_manifest(data),
        sig if sig == SIG_STARTUP_LOCALITY => decode_startup_locality(data),
        _ => (
            EventData::UnknownNoAction(OpaqueEventData { raw: data }),
            0,
        ),
    }
}

fn decode_separator(data: Vec<u8>) -> (EventData, usize) {
    if data.len() < 4 {
        return (
            EventData::Broken(BrokenEventData {
                raw: data,
                error: EventDataError::NotEnoughData,
            }),
            0,
        );
    }
    let trailing = data.len() - 4;
    (
        EventData::Separator(SeparatorEventData {
            raw: data,
            is_error: false,
        }),
        trailing,
    )
}

const GRUB_CMD_PREFIX: &str = "grub_cmd: ";
const KERNEL_CMDLINE_PREFIX: &str = "kernel_cmdline: ";

fn decode_grub(data: Vec<u8>) -> (EventData, usize) {
    let Ok(text) = std::str::from_utf8(&data) else {
        return (EventData::Opaque(OpaqueEventData { raw: data }), 0);
    };
    let text = text.trim_end_matches('\0');
    let (kind, message) = if let Some(rest) = text.strip_prefix(GRUB_CMD_PREFIX) {
        (GrubEventKind::GrubCmd, rest)
    } else if let Some(rest) = text.strip_prefix(KERNEL_CMDLINE_PREFIX) {
        (GrubEventKind::KernelCmdline, rest)
    } else {
        return (EventData::Opaque(OpaqueEventData { raw: data }), 0);
    };
    let message = message.to_string();
    (
        EventData::Grub(GrubEventData {
            raw: data,
            kind,
            message,
        }),
        0,
    )
}

/// Decode an event payload into its structured form.
///
/// Returns the decoded data and the count of tail bytes the layout did
/// not consume.
pub(crate) fn decode_event_data(
    pcr_index: u32,
    event_type: u32,
    data: Vec<u8>,
    enable_grub: bool,
) -> (EventData, usize) {
    match event_type {
        EV_NO_ACTION => decode_no_action_event(data),
        EV_SEPARATOR => decode_separator(data),
        EV_ACTION | EV_EFI_ACTION => (EventData::AsciiString(AsciiStringEventData { raw: data }), 0),
        EV_EFI_VARIABLE_DRIVER_CONFIG | EV_EFI_VARIABLE_BOOT | EV_EFI_VARIABLE_AUTHORITY => {
            efi::decode_efi_variable(data)
        }
        EV_EFI_BOOT_SERVICES_APPLICATION
        | EV_EFI_BOOT_SERVICES_DRIVER
        | EV_EFI_RUNTIME_SERVICES_DRIVER => efi::decode_efi_image_load(data),
        EV_EFI_GPT_EVENT => efi::decode_efi_gpt(data),
        EV_IPL if enable_grub && (pcr_index == 8 || pcr_index == 9) => decode_grub(data),
        _ => (EventData::Opaque(OpaqueEventData { raw: data }), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_id_payload(signature: &[u8; 16], tail: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(signature);
        out.extend_from_slice(&0u32.to_le_bytes()); // platform class
        out.push(0); // minor
        out.push(2); // major
        out.push(0); // errata
        out.push(2); // uintn size
        out.extend_from_slice(tail);
        out
    }

    #[test]
    fn no_action_dispatch_spec_id_00() {
        let payload = spec_id_payload(SIG_SPEC_ID_00, &[0]);
        let (data, trailing) = decode_no_action_event(payload);
        assert_eq!(trailing, 0);
        let EventData::SpecId(d) = data else {
            panic!("expected SpecId, got {data:?}");
        };
        assert_eq!(d.spec, Spec::PcClient);
        assert_eq!(d.spec_version_major, 2);
        assert!(d.digest_sizes.is_empty());
    }

    #[test]
    fn no_action_dispatch_spec_id_02() {
        let payload = spec_id_payload(SIG_SPEC_ID_02, &[2, 0xab, 0xcd]);
        let (data, _) = decode_no_action_event(payload);
        let EventData::SpecId(d) = data else {
            panic!("expected SpecId, got {data:?}");
        };
        assert_eq!(d.spec, Spec::Efi12);
        assert_eq!(d.vendor_info, vec![0xab, 0xcd]);
    }

    #[test]
    fn no_action_dispatch_spec_id_03() {
        let mut tail = Vec::new();
        tail.extend_from_slice(&2u32.to_le_bytes());
        tail.extend_from_slice(&0x0004u16.to_le_bytes());
        tail.extend_from_slice(&20u16.to_le_bytes());
        tail.extend_from_slice(&0x000bu16.to_le_bytes());
        tail.extend_from_slice(&32u16.to_le_bytes());
        tail.push(0); // vendor info size
        let payload = spec_id_payload(SIG_SPEC_ID_03, &tail);
        let (data, trailing) = decode_no_action_event(payload);
        assert_eq!(trailing, 0);
        let EventData::SpecId(d) = data else {
            panic!("expected SpecId, got {data:?}");
        };
        assert_eq!(d.spec, Spec::Efi2);
        assert_eq!(
            d.digest_sizes,
            vec![
                EfiSpecIdEventAlgorithmSize {
                    algorithm_id: 0x0004,
                    digest_size: 20
                },
                EfiSpecIdEventAlgorithmSize {
                    algorithm_id: 0x000b,
                    digest_size: 32
                },
            ]
        );
    }

    #[test]
    fn spec_id_03_rejects_zero_algorithms() {
        let mut tail = Vec::new();
        tail.extend_from_slice(&0u32.to_le_bytes());
        tail.push(0);
        let payload = spec_id_payload(SIG_SPEC_ID_03, &tail);
        let (data, _) = decode_no_action_event(payload);
        let EventData::Broken(b) = data else {
            panic!("expected Broken, got {data:?}");
        };
        assert!(matches!(b.error, EventDataError::InvalidSpecIdEvent(_)));
    }

    #[test]
    fn spec_id_truncated_header_is_invalid() {
        let payload = SIG_SPEC_ID_00.to_vec();
        let (data, _) = decode_no_action_event(payload);
        let EventData::Broken(b) = data else {
            panic!("expected Broken, got {data:?}");
        };
        assert!(matches!(b.error, EventDataError::InvalidSpecIdEvent(_)));
    }

    #[test]
    fn no_action_dispatch_sp800_155() {
        let mut payload = SIG_SP800_155.to_vec();
        payload.extend_from_slice(&0x1234u32.to_le_bytes());
        payload.extend_from_slice(&[0x42; 16]);
        let (data, trailing) = decode_no_action_event(payload);
        assert_eq!(trailing, 0);
        let EventData::BimReferenceManifest(d) = data else {
            panic!("expected BimReferenceManifest, got {data:?}");
        };
        assert_eq!(d.vendor_id, 0x1234);
    }

    #[test]
    fn no_action_dispatch_startup_locality() {
        let mut payload = SIG_STARTUP_LOCALITY.to_vec();
        payload.push(3);
        let (data, trailing) = decode_no_action_event(payload);
        assert_eq!(trailing, 0);
        let EventData::StartupLocality(d) = data else {
            panic!("expected StartupLocality, got {data:?}");
        };
        assert_eq!(d.locality, 3);
    }

    #[test]
    fn no_action_dispatch_unknown_signature() {
        let payload = b"NotASignature!!\0with more bytes".to_vec();
        let (data, trailing) = decode_no_action_event(payload.clone());
        assert_eq!(trailing, 0);
        let EventData::UnknownNoAction(d) = data else {
            panic!("expected UnknownNoAction, got {data:?}");
        };
        assert_eq!(d.raw, payload);
    }

    #[test]
    fn no_action_short_payload_is_unknown() {
        let (data, _) = decode_no_action_event(vec![0x01, 0x02]);
        assert!(matches!(data, EventData::UnknownNoAction(_)));
    }

    #[test]
    fn separator_trailing_bytes() {
        let (data, trailing) = decode_separator(vec![0, 0, 0, 0]);
        assert!(matches!(data, EventData::Separator(_)));
        assert_eq!(trailing, 0);

        let (_, trailing) = decode_separator(vec![0xff, 0xff, 0xff, 0xff, 0xaa, 0xbb]);
        assert_eq!(trailing, 2);

        let (data, _) = decode_separator(vec![0x01]);
        assert!(matches!(data, EventData::Broken(_)));
    }

    #[test]
    fn grub_event_decoding() {
        let (data, _) = decode_grub(b"grub_cmd: linux /vmlinuz root=/dev/sda1\0".to_vec());
        let EventData::Grub(g) = data else {
            panic!("expected Grub, got {data:?}");
        };
        assert_eq!(g.kind, GrubEventKind::GrubCmd);
        assert_eq!(g.message, "linux /vmlinuz root=/dev/sda1");

        let (data, _) = decode_grub(b"kernel_cmdline: ro quiet".to_vec());
        let EventData::Grub(g) = data else {
            panic!("expected Grub, got {data:?}");
        };
        assert_eq!(g.kind, GrubEventKind::KernelCmdline);

        let (data, _) = decode_grub(b"something else".to_vec());
        assert!(matches!(data, EventData::Opaque(_)));
    }

    #[test]
    fn grub_only_on_pcr_8_and_9_with_option() {
        let payload = b"grub_cmd: ls".to_vec();
        let (data, _) = decode_event_data(8, EV_IPL, payload.clone(), true);
        assert!(matches!(data, EventData::Grub(_)));

        let (data, _) = decode_event_data(4, EV_IPL, payload.clone(), true);
        assert!(matches!(data, EventData::Opaque(_)));

        let (data, _) = decode_event_data(8, EV_IPL, payload, false);
        assert!(matches!(data, EventData::Opaque(_)));
    }
}
