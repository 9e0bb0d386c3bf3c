//! Parser for the vendor PMM calibration block.
//!
//! The PMM block is a 1536-byte binary image holding per-ADC-channel
//! correction parameters. It is split into 3 groups of 512 bytes, each group
//! into 32 elements of 16 bytes; byte 16 of the image is a bitmask of active
//! groups. Two one-byte markers select between two record layouts; only the
//! group-1 layout is understood here.
//!
//! Parsing starts from a literal table of default entries, overlays whatever
//! matching records the image carries, and then range-checks the result.
//! The returned table is all-or-nothing: any failure yields an error and no
//! table, so a caller can never observe a half-updated calibration.

use crate::hw::ChannelId;

/// Exact size of a PMM block image.
pub const PMM_BLOCK_SIZE: usize = 0x600;

const PMM_GROUP_SIZE: usize = 0x200;
const PMM_ELEM_SIZE: usize = 0x10;
const PMM_MAGIC: &[u8] = b"BME-PMM-BLOCK01";

/// Offset of the active-group bitmask within the image.
const ACTIVE_GROUP_MASK_OFFSET: usize = 16;

/// Serialized size of a group-1 record.
const GROUP1_RECORD_LEN: usize = 12;

/// Number of channels a valid image must populate: battery voltage, charger
/// voltage, BSI, battery current, battery temperature, backup voltage and
/// the chip-internal reference.
const REQUIRED_CHANNELS: u8 = 7;

/// Calibration parameters for one ADC channel.
///
/// `flags` doubles as a format/version tag: `0xFF` marks a slot that holds
/// no calibration at all, and a record in the image is only accepted when
/// its flags byte matches the slot's preset value. `field1`/`field2` are
/// signed for some channels and are stored raw; consumers cast as needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CalibrationEntry {
    /// Raw channel id, 0 while the slot was never assigned.
    pub id: u8,
    pub flags: u8,
    pub group_nr: u8,
    pub field1: u32,
    pub field2: u32,
    pub field3: u16,
    pub field4: u16,
}

impl CalibrationEntry {
    const EMPTY: Self = Self {
        id: 0,
        flags: 0xFF,
        group_nr: 0,
        field1: 0,
        field2: 0,
        field3: 0,
        field4: 0,
    };

    const fn preset(id: ChannelId, flags: u8, group_nr: u8, field1: u32, field2: u32) -> Self {
        Self {
            id: id as u8,
            flags,
            group_nr,
            field1,
            field2,
            field3: 0,
            field4: 0,
        }
    }

    /// Whether this slot carries usable calibration data.
    pub fn is_populated(&self) -> bool {
        self.flags != 0xFF
    }
}

/// Factory defaults, overlaid by the image contents during parsing.
///
/// Kept as plain data so the parser itself stays free of magic numbers
/// beyond the channel-id range checks.
const DEFAULTS: &[CalibrationEntry] = &[
    // ADC group 0: uncalibrated digital-ish inputs
    CalibrationEntry::preset(ChannelId::Headset, 0x00, 0, 0, 0),
    CalibrationEntry::preset(ChannelId::HookDet, 0x00, 0, 0, 0),
    CalibrationEntry::preset(ChannelId::RfGp, 0x00, 0, 0, 0),
    CalibrationEntry::preset(ChannelId::LightSens, 0x00, 0, 0, 0),
    CalibrationEntry::preset(ChannelId::WbTx, 0x00, 0, 0, 0),
    CalibrationEntry::preset(ChannelId::ChipTemp, 0x00, 0, 0, 0),
    CalibrationEntry::preset(ChannelId::Gnd2, 0x00, 0, 0, 0),
    // ADC group 1: voltage/current class
    CalibrationEntry::preset(ChannelId::Internal, 0x05, 1, (-2i32) as u32, 13189),
    CalibrationEntry::preset(ChannelId::BatVolt, 0x01, 1, 2527, 21373),
    CalibrationEntry::preset(ChannelId::ChgVolt, 0x01, 1, 0, 129848),
    CalibrationEntry::preset(ChannelId::BkupVolt, 0x01, 1, 0, 20000),
    CalibrationEntry::preset(ChannelId::BatCurr, 0x06, 1, 0, 9660),
    // ADC group 2
    CalibrationEntry::preset(ChannelId::Bsi, 0x02, 2, 1169, 0),
    // ADC group 3
    CalibrationEntry::preset(ChannelId::BatTemp, 0x03, 3, 265_423_000, 298),
    // ADC group 4
    CalibrationEntry {
        field3: 4700,
        field4: 2500,
        ..CalibrationEntry::preset(ChannelId::LightTemp, 0x04, 4, 19_533_778, 308_019_670)
    },
];

/// Per-channel calibration table, indexed by channel id.
///
/// Owned exclusively by the controller and rebuilt as a whole on every
/// (re)parse; never handed out by reference across the lock.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    entries: [CalibrationEntry; 25],
}

impl CalibrationTable {
    /// A table holding only the factory defaults.
    pub fn with_defaults() -> Self {
        let mut table = Self {
            entries: [CalibrationEntry::EMPTY; 25],
        };
        for preset in DEFAULTS {
            let slot = table
                .slot_mut(preset.id)
                .expect("default table entry maps to a valid slot");
            *slot = *preset;
        }
        table
    }

    /// Slot index for a raw channel id. The chip-internal id `0xFE` lives in
    /// slot 0, everything else at `id + 1`.
    fn slot_index(raw_id: u8) -> Option<usize> {
        let index = if raw_id == ChannelId::Internal as u8 {
            0
        } else {
            raw_id as usize + 1
        };
        (index < 25).then_some(index)
    }

    fn slot_mut(&mut self, raw_id: u8) -> Option<&mut CalibrationEntry> {
        let slot = &mut self.entries[Self::slot_index(raw_id)?];
        debug_assert!(slot.id == 0 || slot.id == raw_id);
        Some(slot)
    }

    /// Calibration entry for `channel`. Check
    /// [`is_populated`](CalibrationEntry::is_populated) before trusting the
    /// fields.
    pub fn get(&self, channel: ChannelId) -> &CalibrationEntry {
        &self.entries[Self::slot_index(channel as u8).expect("channel ids always map to a slot")]
    }

    /// All slots, populated or not.
    pub fn entries(&self) -> impl Iterator<Item = &CalibrationEntry> {
        self.entries.iter()
    }
}

impl Default for CalibrationTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Why a PMM block was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// Wrong image size or magic.
    BadHeader,
    /// A record was requested from a group the image marks inactive.
    GroupInactive,
    /// Record coordinates out of bounds, or a record names a channel id
    /// outside the table.
    OutOfRange,
    /// The image uses the group-2 record layout, which is not implemented.
    UnsupportedFormat,
    /// A calibration value fails its physical-range check.
    CalibrationOutOfRange { id: u8 },
    /// The image populated fewer channels than a complete calibration needs.
    IncompleteCalibration { count: u8 },
}

/// One group-1 record: a 12-byte little-endian structure.
struct Group1Record {
    id: u8,
    flags: u8,
    #[allow(dead_code)]
    group_nr: u8,
    field1: u32,
    field2: u32,
}

impl Group1Record {
    fn from_bytes(b: &[u8]) -> Self {
        debug_assert_eq!(b.len(), GROUP1_RECORD_LEN);
        Self {
            id: b[0],
            flags: b[1],
            group_nr: b[2],
            // b[3] is padding
            field1: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            field2: u32::from_le_bytes([b[8], b[9], b[10], b[11]]),
        }
    }
}

/// Bounds-checked access to `length` bytes at (`group`, `element`,
/// `offset`) within the image.
fn record_get(
    block: &[u8],
    group: usize,
    element: usize,
    offset: usize,
    length: usize,
) -> Result<&[u8], ParseError> {
    debug_assert_eq!(block.len(), PMM_BLOCK_SIZE);
    if group >= PMM_BLOCK_SIZE / PMM_GROUP_SIZE {
        return Err(ParseError::OutOfRange);
    }
    if element >= PMM_GROUP_SIZE / PMM_ELEM_SIZE {
        return Err(ParseError::OutOfRange);
    }
    if offset >= PMM_ELEM_SIZE || length > PMM_ELEM_SIZE || offset + length > PMM_ELEM_SIZE {
        return Err(ParseError::OutOfRange);
    }

    let active_group_mask = block[ACTIVE_GROUP_MASK_OFFSET];
    if active_group_mask & (1 << group) == 0 {
        debug!("record_get: requested group {} is not active", group);
        return Err(ParseError::GroupInactive);
    }

    let start = group * PMM_GROUP_SIZE + element * PMM_ELEM_SIZE + offset;
    Ok(&block[start..start + length])
}

/// Copies group-1 records for the listed channels into the table.
///
/// The record for channel `id` sits at element `id + 3` of group 1. A record
/// that cannot be fetched is skipped; a fetched record is applied only when
/// its flags byte matches the slot's preset flags, with `field1`/`field2`
/// masked per channel class.
fn extract_group1_records(
    table: &mut CalibrationTable,
    block: &[u8],
    ids: &[ChannelId],
    field1_mask: u32,
    field2_mask: u32,
) -> Result<(), ParseError> {
    for &id in ids {
        let element_nr = id as usize + 3;
        let Ok(bytes) = record_get(block, 1, element_nr, 0, GROUP1_RECORD_LEN) else {
            continue;
        };
        let record = Group1Record::from_bytes(bytes);

        let Some(slot) = table.slot_mut(record.id) else {
            error!(
                "calibration record names unknown channel id {}",
                record.id
            );
            return Err(ParseError::OutOfRange);
        };

        if slot.flags == record.flags {
            slot.field1 = record.field1 & field1_mask;
            slot.field2 = record.field2 & field2_mask;
        } else {
            debug!(
                "skipping record for channel {}: flags {} do not match preset {}",
                record.id, record.flags, slot.flags
            );
        }
    }
    Ok(())
}

fn parse_group1(table: &mut CalibrationTable, block: &[u8]) -> Result<(), ParseError> {
    // The fixed record at group 1 / element 2 seeds the chip-internal
    // reference channel directly, without the flags-match guard.
    let bytes = record_get(block, 1, 2, 0, GROUP1_RECORD_LEN).map_err(|err| {
        error!("failed to get group 1 / element 2");
        err
    })?;
    let record = Group1Record::from_bytes(bytes);
    if record.id == ChannelId::Internal as u8 && record.flags == 0x05 {
        let slot = table
            .slot_mut(record.id)
            .ok_or(ParseError::OutOfRange)?;
        slot.id = record.id;
        slot.flags = record.flags;
        slot.field1 = record.field1;
        slot.field2 = record.field2;
    }

    // Voltage/current class channels keep both fields whole.
    extract_group1_records(
        table,
        block,
        &[
            ChannelId::BatVolt,
            ChannelId::ChgVolt,
            ChannelId::BkupVolt,
            ChannelId::BatCurr,
        ],
        0xFFFF_FFFF,
        0xFFFF_FFFF,
    )?;
    // The BSI channel only uses field1.
    extract_group1_records(table, block, &[ChannelId::Bsi], 0xFFFF_FFFF, 0)?;
    // The temperature channel's field2 is 16 bits wide.
    extract_group1_records(table, block, &[ChannelId::BatTemp], 0xFFFF_FFFF, 0x0000_FFFF)?;

    Ok(())
}

fn parse_group2(_table: &mut CalibrationTable, _block: &[u8]) -> Result<(), ParseError> {
    // TODO: implement the group-2 record layout once an image using it shows up.
    error!("calibration block uses the unimplemented group-2 layout");
    Err(ParseError::UnsupportedFormat)
}

/// Range-checks every populated slot and counts the required channels.
fn sanity_check(table: &CalibrationTable) -> Result<(), ParseError> {
    let mut count: u8 = 0;

    for entry in table.entries() {
        if !entry.is_populated() {
            continue;
        }
        let ok = match ChannelId::from_raw(entry.id) {
            Some(ChannelId::BatVolt) => {
                count += 1;
                (2400..=2700).contains(&entry.field1) && (20000..=23000).contains(&entry.field2)
            }
            Some(ChannelId::Bsi) => {
                count += 1;
                (1100..=1300).contains(&entry.field1)
            }
            Some(ChannelId::BatCurr) => {
                count += 1;
                (7000..=12000).contains(&entry.field2)
            }
            Some(ChannelId::Internal) => {
                count += 1;
                (-14..=14).contains(&(entry.field1 as i32))
                    && (13000..=13350).contains(&entry.field2)
            }
            Some(ChannelId::ChgVolt) | Some(ChannelId::BatTemp) | Some(ChannelId::BkupVolt) => {
                count += 1;
                true
            }
            _ => true,
        };
        if !ok {
            error!(
                "calibration sanity check failed for channel {}",
                entry.id
            );
            return Err(ParseError::CalibrationOutOfRange { id: entry.id });
        }
        debug!(
            "channel {} calibration: flags {} group {} fields {} {} {} {}",
            entry.id, entry.flags, entry.group_nr, entry.field1, entry.field2, entry.field3,
            entry.field4
        );
    }

    if count != REQUIRED_CHANNELS {
        error!("calibration incomplete: found {} of 7 required channels", count);
        return Err(ParseError::IncompleteCalibration { count });
    }
    Ok(())
}

/// Decodes and validates a PMM block image.
///
/// Succeeds with a complete table or fails without one; the factory defaults
/// participate, so an image only needs records for the channels it wants to
/// override.
pub fn parse(block: &[u8]) -> Result<CalibrationTable, ParseError> {
    if block.len() != PMM_BLOCK_SIZE || &block[..PMM_MAGIC.len()] != PMM_MAGIC {
        return Err(ParseError::BadHeader);
    }

    let mut table = CalibrationTable::with_defaults();

    let marker = |element| matches!(record_get(block, 1, element, 0, 1), Ok(&[0x01]));
    if marker(0) && marker(1) {
        parse_group1(&mut table, block)?;
    } else {
        parse_group2(&mut table, block)?;
    }

    sanity_check(&table)?;
    Ok(table)
}


#[cfg(test)]
mod tests {
    use super::testblob::*;
    use super::*;

    #[test]
    fn rejects_short_block() {
        assert_eq!(parse(&[0u8; 16]), Err(ParseError::BadHeader));
        assert_eq!(
            parse(&valid_block()[..PMM_BLOCK_SIZE - 1]),
            Err(ParseError::BadHeader)
        );
    }

    #[test]
    fn rejects_bad_magic() {
        let mut block = valid_block();
        block[0] ^= 0xFF;
        assert_eq!(parse(&block), Err(ParseError::BadHeader));
    }

    #[test]
    fn rejects_group2_layout() {
        let mut block = valid_block();
        // Break one of the two layout markers.
        block[PMM_GROUP_SIZE] = 0x02;
        assert_eq!(parse(&block), Err(ParseError::UnsupportedFormat));
    }

    #[test]
    fn parses_valid_block() {
        let table = parse(&valid_block()).unwrap();

        let populated: Vec<u8> = table
            .entries()
            .filter(|e| e.is_populated())
            .map(|e| e.id)
            .collect();
        // Defaults populate more slots than the 7 required ones; the required
        // set must all be there with the image's values applied.
        assert!(populated.contains(&(ChannelId::BatVolt as u8)));

        let batvolt = table.get(ChannelId::BatVolt);
        assert_eq!(batvolt.field1, 2500);
        assert_eq!(batvolt.field2, 21000);

        let internal = table.get(ChannelId::Internal);
        assert_eq!(internal.field1 as i32, -2);
        assert_eq!(internal.field2, 13200);
    }

    #[test]
    fn masks_fields_per_channel_class() {
        let table = parse(&valid_block()).unwrap();

        // BSI keeps only field1.
        let bsi = table.get(ChannelId::Bsi);
        assert_eq!(bsi.field1, 1200);
        assert_eq!(bsi.field2, 0);

        // The temperature channel's field2 is truncated to 16 bits.
        let temp = table.get(ChannelId::BatTemp);
        assert_eq!(temp.field2, 0x0123);
    }

    #[test]
    fn flags_mismatch_keeps_defaults() {
        let mut block = valid_block();
        // Rewrite the battery-voltage record with an unknown flags byte and
        // wild values; the slot must keep its preset instead.
        put_record(&mut block, 0x01 + 3, 0x01, 0x7E, 1, 1, 1);
        let table = parse(&block).unwrap();

        let batvolt = table.get(ChannelId::BatVolt);
        assert_eq!(batvolt.field1, 2527);
        assert_eq!(batvolt.field2, 21373);
    }

    #[test]
    fn rejects_out_of_range_battery_voltage() {
        for field1 in [2399u32, 2701] {
            let mut block = valid_block();
            put_record(&mut block, 0x01 + 3, 0x01, 0x01, 1, field1, 21000);
            assert_eq!(
                parse(&block),
                Err(ParseError::CalibrationOutOfRange { id: 0x01 })
            );
        }
    }

    #[test]
    fn rejects_out_of_range_bsi_and_current() {
        let mut block = valid_block();
        put_record(&mut block, 0x04 + 3, 0x04, 0x02, 2, 1099, 0);
        assert_eq!(
            parse(&block),
            Err(ParseError::CalibrationOutOfRange { id: 0x04 })
        );

        let mut block = valid_block();
        put_record(&mut block, 0x0E + 3, 0x0E, 0x06, 1, 0, 12001);
        assert_eq!(
            parse(&block),
            Err(ParseError::CalibrationOutOfRange { id: 0x0E })
        );
    }

    #[test]
    fn rejects_out_of_range_internal_reference() {
        let mut block = valid_block();
        put_record(&mut block, 2, 0xFE, 0x05, 1, (-15i32) as u32, 13200);
        assert_eq!(
            parse(&block),
            Err(ParseError::CalibrationOutOfRange { id: 0xFE })
        );
    }

    #[test]
    fn defaults_alone_satisfy_required_channels() {
        // An image whose records all fail the flags-match guard still parses:
        // the factory defaults cover every required channel.
        let block = empty_block();
        assert!(parse(&block).is_ok());
    }

    #[test]
    fn record_get_bounds() {
        let block = valid_block();
        assert!(matches!(
            record_get(&block, 3, 0, 0, 1),
            Err(ParseError::OutOfRange)
        ));
        assert!(matches!(
            record_get(&block, 1, 32, 0, 1),
            Err(ParseError::OutOfRange)
        ));
        assert!(matches!(
            record_get(&block, 1, 0, 10, 7),
            Err(ParseError::OutOfRange)
        ));
        assert!(record_get(&block, 1, 0, 10, 6).is_ok());
    }

    #[test]
    fn record_get_inactive_group() {
        let block = valid_block();
        // Groups 0 and 2 are not marked active in the test image.
        assert!(matches!(
            record_get(&block, 2, 0, 0, 1),
            Err(ParseError::GroupInactive)
        ));
    }

    #[test]
    fn default_table_layout() {
        let table = CalibrationTable::with_defaults();
        assert_eq!(
            table.entries().filter(|e| e.is_populated()).count(),
            DEFAULTS.len()
        );
        assert_eq!(table.get(ChannelId::Internal).flags, 0x05);
        assert_eq!(table.get(ChannelId::BatCurr).field2, 9660);
        assert_eq!(table.get(ChannelId::LightTemp).field3, 4700);
        assert!(table.get(ChannelId::BatVolt).is_populated());
    }
}
