// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! EFI event payload structures measured by platform firmware.
//!
//! Layouts follow the TCG EFI Platform and PC Client Platform Firmware
//! Profile specifications. Every decoder reports how many tail bytes the
//! structured layout did not consume, so the validator can spot firmware
//! that hashed padding.

use std::fmt;

use crate::codec::EventBuffer;
use crate::events::{BrokenEventData, EventData, EventDataError};

/// A globally unique identifier in the UEFI mixed-endian encoding: the
/// first three fields are little-endian, the rest is a byte array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Guid {
    a: u32,
    b: u16,
    c: u16,
    d: [u8; 8],
}

impl Guid {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Guid {
            a: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            b: u16::from_le_bytes([bytes[4], bytes[5]]),
            c: u16::from_le_bytes([bytes[6], bytes[7]]),
            d: [
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ],
        }
    }

    fn read(buf: &mut EventBuffer) -> Result<Self, EventDataError> {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(buf.get_bytes(16)?);
        Ok(Self::from_bytes(bytes))
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.a,
            self.b,
            self.c,
            self.d[0],
            self.d[1],
            self.d[2],
            self.d[3],
            self.d[4],
            self.d[5],
            self.d[6],
            self.d[7],
        )
    }
}

/// UEFI_VARIABLE_DATA: the payload of the EV_EFI_VARIABLE_* event types.
#[derive(Clone)]
pub struct EfiVariableEventData {
    pub raw: Vec<u8>,
    pub variable_name: Guid,
    pub unicode_name: String,
    pub variable_data: Vec<u8>,
}

impl fmt::Debug for EfiVariableEventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EfiVariableEventData")
            .field("variable_name", &self.variable_name.to_string())
            .field("unicode_name", &self.unicode_name)
            .field("variable_data", &hex::encode(&self.variable_data))
            .finish()
    }
}

pub(crate) fn decode_efi_variable(data: Vec<u8>) -> (EventData, usize) {
    let mut buf = EventBuffer::new(&data);
    let parsed = (|| {
        let variable_name = Guid::read(&mut buf)?;
        let name_len = buf.get_len()?;
        let data_len = buf.get_len()?;
        let unicode_name = buf.get_utf16(name_len)?;
        let variable_data = buf.get_bytes(data_len)?.to_vec();
        Ok((variable_name, unicode_name, variable_data))
    })();
    match parsed {
        Ok((variable_name, unicode_name, variable_data)) => {
            let trailing = buf.remaining();
            (
                EventData::EfiVariable(EfiVariableEventData {
                    raw: data,
                    variable_name,
                    unicode_name,
                    variable_data,
                }),
                trailing,
            )
        }
        Err(error) => (EventData::Broken(BrokenEventData { raw: data, error }), 0),
    }
}

/// UEFI_IMAGE_LOAD_EVENT: the payload of the boot/runtime services
/// image events. The digest covers the Authenticode content of the
/// image itself, which is not part of the log.
#[derive(Clone)]
pub struct EfiImageLoadEventData {
    pub raw: Vec<u8>,
    pub location_in_memory: u64,
    pub length_in_memory: u64,
    pub link_time_address: u64,
    pub device_path: Vec<u8>,
}

impl fmt::Debug for EfiImageLoadEventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EfiImageLoadEventData")
            .field("location_in_memory", &self.location_in_memory)
            .field("length_in_memory", &self.length_in_memory)
            .field("link_time_address", &self.link_time_address)
            .field("device_path", &hex::encode(&self.device_path))
            .finish()
    }
}

pub(crate) fn decode_efi_image_load(data: Vec<u8>) -> (EventData, usize) {
    let mut buf = EventBuffer::new(&data);
    let parsed = (|| {
        let location_in_memory = buf.get_u64()?;
        let length_in_memory = buf.get_u64()?;
        let link_time_address = buf.get_u64()?;
        let device_path_len = buf.get_len()?;
        let device_path = buf.get_bytes(device_path_len)?.to_vec();
        Ok((
            location_in_memory,
            length_in_memory,
            link_time_address,
            device_path,
        ))
    })();
    match parsed {
        Ok((location_in_memory, length_in_memory, link_time_address, device_path)) => {
            let trailing = buf.remaining();
            (
                EventData::EfiImageLoad(EfiImageLoadEventData {
                    raw: data,
                    location_in_memory,
                    length_in_memory,
                    link_time_address,
                    device_path,
                }),
                trailing,
            )
        }
        Err(error) => (EventData::Broken(BrokenEventData { raw: data, error }), 0),
    }
}

/// UEFI_PARTITION_TABLE_HEADER, as embedded in UEFI_GPT_DATA.
#[derive(Clone, Debug)]
pub struct EfiGptPartitionTableHeader {
    pub signature: u64,
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub my_lba: u64,
    pub alternate_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Guid,
    pub partition_entry_lba: u64,
    pub number_of_partition_entries: u32,
    pub size_of_partition_entry: u32,
    pub partition_entry_array_crc32: u32,
}

/// UEFI_PARTITION_ENTRY.
#[derive(Clone, Debug)]
pub struct EfiGptPartitionEntry {
    pub partition_type_guid: Guid,
    pub unique_partition_guid: Guid,
    pub starting_lba: u64,
    pub ending_lba: u64,
    pub attributes: u64,
    pub partition_name: String,
}

/// UEFI_GPT_DATA: the payload of EV_EFI_GPT_EVENT.
#[derive(Clone)]
pub struct EfiGptEventData {
    pub raw: Vec<u8>,
    pub header: EfiGptPartitionTableHeader,
    pub partitions: Vec<EfiGptPartitionEntry>,
}

impl fmt::Debug for EfiGptEventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EfiGptEventData")
            .field("header", &self.header)
            .field("partitions", &self.partitions)
            .finish()
    }
}

fn read_gpt_header(buf: &mut EventBuffer) -> Result<EfiGptPartitionTableHeader, EventDataError> {
    let signature = buf.get_u64()?;
    let revision = buf.get_u32()?;
    let header_size = buf.get_u32()?;
    let header_crc32 = buf.get_u32()?;
    let _reserved = buf.get_u32()?;
    let my_lba = buf.get_u64()?;
    let alternate_lba = buf.get_u64()?;
    let first_usable_lba = buf.get_u64()?;
    let last_usable_lba = buf.get_u64()?;
    let disk_guid = Guid::read(buf)?;
    let partition_entry_lba = buf.get_u64()?;
    let number_of_partition_entries = buf.get_u32()?;
    let size_of_partition_entry = buf.get_u32()?;
    let partition_entry_array_crc32 = buf.get_u32()?;
    Ok(EfiGptPartitionTableHeader {
        signature,
        revision,
        header_size,
        header_crc32,
        my_lba,
        alternate_lba,
        first_usable_lba,
        last_usable_lba,
        disk_guid,
        partition_entry_lba,
        number_of_partition_entries,
        size_of_partition_entry,
        partition_entry_array_crc32,
    })
}

fn read_gpt_partition_entry(buf: &mut EventBuffer) -> Result<EfiGptPartitionEntry, EventDataError> {
    let partition_type_guid = Guid::read(buf)?;
    let unique_partition_guid = Guid::read(buf)?;
    let starting_lba = buf.get_u64()?;
    let ending_lba = buf.get_u64()?;
    let attributes = buf.get_u64()?;
    // PartitionName is a fixed 36-unit field, NUL-padded.
    let partition_name = buf.get_utf16(36)?.trim_end_matches('\0').to_string();
    Ok(EfiGptPartitionEntry {
        partition_type_guid,
        unique_partition_guid,
        starting_lba,
        ending_lba,
        attributes,
        partition_name,
    })
}

pub(crate) fn decode_efi_gpt(data: Vec<u8>) -> (EventData, usize) {
    let mut buf = EventBuffer::new(&data);
    let parsed = (|| {
        let header = read_gpt_header(&mut buf)?;
        let number_of_partitions = buf.get_len()?;
        let mut partitions = Vec::new();
        for _ in 0..number_of_partitions {
            partitions.push(read_gpt_partition_entry(&mut buf)?);
        }
        Ok((header, partitions))
    })();
    match parsed {
        Ok((header, partitions)) => {
            let trailing = buf.remaining();
            (
                EventData::EfiGpt(EfiGptEventData {
                    raw: data,
                    header,
                    partitions,
                }),
                trailing,
            )
        }
        Err(error) => (EventData::Broken(BrokenEventData { raw: data, error }), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_efi_variable(guid: [u8; 16], name: &str, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&guid);
        out.extend_from_slice(&(name.chars().count() as u64).to_le_bytes());
        out.extend_from_slice(&(data.len() as u64).to_le_bytes());
        for unit in name.encode_utf16() {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn guid_display_matches_uefi_format() {
        // The EFI global variable GUID, 8be4df61-93ca-11d2-aa0d-00e098032b8c.
        let guid = Guid::from_bytes([
            0x61, 0xdf, 0xe4, 0x8b, 0xca, 0x93, 0xd2, 0x11, 0xaa, 0x0d, 0x00, 0xe0, 0x98, 0x03,
            0x2b, 0x8c,
        ]);
        assert_eq!(guid.to_string(), "8be4df61-93ca-11d2-aa0d-00e098032b8c");
    }

    #[test]
    fn decode_variable_event() {
        let payload = build_efi_variable([0u8; 16], "BootOrder", &[0x01, 0x00]);
        let (data, trailing) = decode_efi_variable(payload.clone());
        assert_eq!(trailing, 0);
        let EventData::EfiVariable(v) = data else {
            panic!("expected EfiVariable, got {data:?}");
        };
        assert_eq!(v.unicode_name, "BootOrder");
        assert_eq!(v.variable_data, vec![0x01, 0x00]);
        assert_eq!(v.raw, payload);
    }

    #[test]
    fn decode_variable_event_with_padding() {
        let mut payload = build_efi_variable([0u8; 16], "PK", &[0xaa]);
        payload.extend_from_slice(&[0x00, 0x00]);
        let (_, trailing) = decode_efi_variable(payload);
        assert_eq!(trailing, 2);
    }

    #[test]
    fn decode_variable_event_truncated() {
        let payload = build_efi_variable([0u8; 16], "KEK", &[0x01, 0x02, 0x03]);
        let (data, trailing) = decode_efi_variable(payload[..payload.len() - 1].to_vec());
        assert_eq!(trailing, 0);
        let EventData::Broken(b) = data else {
            panic!("expected Broken, got {data:?}");
        };
        assert_eq!(b.error, EventDataError::NotEnoughData);
    }

    #[test]
    fn decode_image_load_event() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x7654_3210u64.to_le_bytes());
        payload.extend_from_slice(&0x1000u64.to_le_bytes());
        payload.extend_from_slice(&0u64.to_le_bytes());
        payload.extend_from_slice(&4u64.to_le_bytes());
        payload.extend_from_slice(&[0x04, 0x04, 0x00, 0x7f]);
        let (data, trailing) = decode_efi_image_load(payload);
        assert_eq!(trailing, 0);
        let EventData::EfiImageLoad(i) = data else {
            panic!("expected EfiImageLoad, got {data:?}");
        };
        assert_eq!(i.location_in_memory, 0x7654_3210);
        assert_eq!(i.length_in_memory, 0x1000);
        assert_eq!(i.device_path, vec![0x04, 0x04, 0x00, 0x7f]);
    }

    fn build_gpt_payload(partition_names: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0x5452_4150_2049_4645u64.to_le_bytes()); // "EFI PART"
        out.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        out.extend_from_slice(&92u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // crc
        out.extend_from_slice(&0u32.to_le_bytes()); // reserved
        out.extend_from_slice(&1u64.to_le_bytes());
        out.extend_from_slice(&0xffffu64.to_le_bytes());
        out.extend_from_slice(&34u64.to_le_bytes());
        out.extend_from_slice(&0xffdeu64.to_le_bytes());
        out.extend_from_slice(&[0x11; 16]); // disk guid
        out.extend_from_slice(&2u64.to_le_bytes());
        out.extend_from_slice(&(partition_names.len() as u32).to_le_bytes());
        out.extend_from_slice(&128u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(partition_names.len() as u64).to_le_bytes());
        for name in partition_names {
            out.extend_from_slice(&[0x22; 16]);
            out.extend_from_slice(&[0x33; 16]);
            out.extend_from_slice(&2048u64.to_le_bytes());
            out.extend_from_slice(&4095u64.to_le_bytes());
            out.extend_from_slice(&0u64.to_le_bytes());
            let mut units: Vec<u16> = name.encode_utf16().collect();
            units.resize(36, 0);
            for unit in units {
                out.extend_from_slice(&unit.to_le_bytes());
            }
        }
        out
    }

    #[test]
    fn decode_gpt_event() {
        let payload = build_gpt_payload(&["EFI System Partition", "rootfs"]);
        let (data, trailing) = decode_efi_gpt(payload);
        assert_eq!(trailing, 0);
        let EventData::EfiGpt(g) = data else {
            panic!("expected EfiGpt, got {data:?}");
        };
        assert_eq!(g.header.signature, 0x5452_4150_2049_4645);
        assert_eq!(g.header.number_of_partition_entries, 2);
        assert_eq!(g.partitions.len(), 2);
        assert_eq!(g.partitions[0].partition_name, "EFI System Partition");
        assert_eq!(g.partitions[1].partition_name, "rootfs");
        assert_eq!(g.partitions[1].starting_lba, 2048);
    }

    #[test]
    fn decode_gpt_event_truncated_entry() {
        let payload = build_gpt_payload(&["only"]);
        let (data, _) = decode_efi_gpt(payload[..payload.len() - 10].to_vec());
        assert!(matches!(data, EventData::Broken(_)));
    }
}
