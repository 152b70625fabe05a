//! The FIT record reader: chunk envelope validation, CRC-16, message
//! definitions and data record decoding.
use std::collections::HashMap;

use thiserror::Error;

use super::types::{
    base_type_size, FitByte, FitChar, FitEnum, FitFloat32, FitFloat64, FitSint16, FitSint32,
    FitSint8, FitUint16, FitUint16z, FitUint32, FitUint32z, FitUint8, FitUint8z, Value,
};
use super::{FileCreator, FileId, FitVisitor, Flow, FIT_EPOCH_OFFSET};

const GLOBAL_FILE_ID: u16 = 0;
const GLOBAL_FILE_CREATOR: u16 = 49;

/// Field 253 carries the record timestamp in every message that has one.
const FIELD_TIMESTAMP: u8 = 253;

/// Errors decoding a FIT file. These fail the file being decoded and
/// nothing else.
#[derive(Debug, Error, PartialEq)]
pub enum FitError {
    #[error("bad header length {0}")]
    BadHeaderLength(u8),
    #[error("short header")]
    ShortHeader,
    #[error("bad header checksum")]
    BadHeaderCrc,
    #[error("bad signature")]
    BadSignature,
    #[error("short payload")]
    ShortPayload,
    #[error("bad payload checksum")]
    BadCrc,
    #[error("bad FIT base type id {0:#04x}")]
    BadTypeId(u8),
    #[error("unknown local message id {0}")]
    BadLocalMessageId(u8),
    #[error("field size {size} is not a multiple of the base type width {width}")]
    BadFieldSize { size: u8, width: usize },
    #[error("record truncated")]
    Truncated,
}

/// CRC-16 as used by FIT headers and chunk trailers. Validation relies on
/// the closure property: running the CRC over data plus its stored CRC
/// bytes yields zero.
pub fn crc16(init: u16, data: &[u8]) -> u16 {
    const CRC_TABLE: [u16; 16] = [
        0x0000, 0xCC01, 0xD801, 0x1400, 0xF001, 0x3C00, 0x2800, 0xE401, 0xA001, 0x6C00, 0x7800,
        0xB401, 0x5000, 0x9C01, 0x8801, 0x4400,
    ];

    data.iter().fold(init, |mut crc, &byte| {
        // low nibble, then high nibble
        let tmp = CRC_TABLE[(crc & 0xF) as usize];
        crc = (crc >> 4) & 0x0FFF;
        crc = crc ^ tmp ^ CRC_TABLE[(byte & 0xF) as usize];

        let tmp = CRC_TABLE[(crc & 0xF) as usize];
        crc = (crc >> 4) & 0x0FFF;
        crc ^ tmp ^ CRC_TABLE[((byte >> 4) & 0xF) as usize]
    })
}

/// Decode every chunk of `data`, dispatching decoded messages to the
/// visitor. A visitor returning [`Flow::Stop`] ends decoding early without
/// error.
pub fn read_messages(data: &[u8], visitor: &mut dyn FitVisitor) -> Result<(), FitError> {
    let mut rest = data;
    loop {
        let (payload, remaining) = next_chunk(rest)?;
        let mut reader = Reader::new();
        if reader.read_all(payload, visitor)? == Flow::Stop {
            return Ok(());
        }
        match remaining {
            Some(r) => rest = r,
            None => return Ok(()),
        }
    }
}

/// Validate one chunk envelope; returns the record payload and the bytes
/// following the chunk, if any.
fn next_chunk(data: &[u8]) -> Result<(&[u8], Option<&[u8]>), FitError> {
    if data.is_empty() {
        return Err(FitError::ShortHeader);
    }
    let hlen = data[0] as usize;
    if hlen != 12 && hlen != 14 {
        return Err(FitError::BadHeaderLength(data[0]));
    }
    if data.len() < hlen {
        return Err(FitError::ShortHeader);
    }
    if hlen == 14 && (data[12] != 0 || data[13] != 0) && crc16(0, &data[..14]) != 0 {
        return Err(FitError::BadHeaderCrc);
    }
    if &data[8..12] != b".FIT" {
        return Err(FitError::BadSignature);
    }
    let payload = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let total = hlen + payload + 2;
    if data.len() < total {
        return Err(FitError::ShortPayload);
    }
    if (data[total - 2] != 0 || data[total - 1] != 0) && crc16(0, &data[..total]) != 0 {
        return Err(FitError::BadCrc);
    }
    let rest = if data.len() == total {
        None
    } else {
        Some(&data[total..])
    };
    Ok((&data[hlen..hlen + payload], rest))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_u8(&mut self) -> Result<u8, FitError> {
        let b = *self.data.get(self.pos).ok_or(FitError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FitError> {
        if self.pos + n > self.data.len() {
            return Err(FitError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

#[derive(Clone, Debug)]
struct FieldDef {
    number: u8,
    size: u8,
    base_type: u8,
    count: u8,
}

impl FieldDef {
    fn new(number: u8, size: u8, base_type: u8) -> Result<FieldDef, FitError> {
        let width = base_type_size(base_type)?;
        if size as usize % width != 0 {
            return Err(FitError::BadFieldSize { size, width });
        }
        Ok(FieldDef {
            number,
            size,
            base_type,
            count: (size as usize / width) as u8,
        })
    }
}

#[derive(Clone, Debug)]
struct MessageDef {
    global: u16,
    big_endian: bool,
    fields: Vec<FieldDef>,
    /// Developer field bytes trailing the regular fields in each data
    /// record; read past, never decoded.
    dev_size: usize,
}

/// Per-chunk record reader: holds the local-id definition table and the
/// running timestamp.
struct Reader {
    definitions: HashMap<u8, MessageDef>,
    timestamp: Option<u32>,
}

impl Reader {
    fn new() -> Self {
        Reader {
            definitions: HashMap::new(),
            timestamp: None,
        }
    }

    fn read_all(
        &mut self,
        payload: &[u8],
        visitor: &mut dyn FitVisitor,
    ) -> Result<Flow, FitError> {
        let mut cur = Cursor::new(payload);
        while !cur.is_eof() {
            let header = cur.read_u8()?;
            let flow = if header & 0x40 != 0 {
                self.read_definition(header, &mut cur)?;
                Flow::Continue
            } else if header & 0x80 != 0 {
                // Compressed timestamp header: two-bit local id, five-bit
                // offset from the last full timestamp.
                let local = (header >> 5) & 0x03;
                let offset = (header & 0x1F) as u32;
                let def = self
                    .definitions
                    .get(&local)
                    .ok_or(FitError::BadLocalMessageId(local))?;
                let forced = Some(self.timestamp.unwrap_or(0).wrapping_add(offset));
                decode_record(def, &mut cur, visitor, &mut self.timestamp, forced)?
            } else {
                let local = header & 0x0F;
                let def = self
                    .definitions
                    .get(&local)
                    .ok_or(FitError::BadLocalMessageId(local))?;
                decode_record(def, &mut cur, visitor, &mut self.timestamp, None)?
            };
            if flow == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    fn read_definition(&mut self, header: u8, cur: &mut Cursor) -> Result<(), FitError> {
        let local = header & 0x0F;
        cur.read_u8()?; // reserved
        let big_endian = cur.read_u8()? != 0;
        let raw = cur.take(2)?;
        let global = if big_endian {
            u16::from_be_bytes([raw[0], raw[1]])
        } else {
            u16::from_le_bytes([raw[0], raw[1]])
        };
        let nfields = cur.read_u8()?;
        let mut fields = Vec::with_capacity(nfields as usize);
        for _ in 0..nfields {
            let number = cur.read_u8()?;
            let size = cur.read_u8()?;
            let base_type = cur.read_u8()?;
            fields.push(FieldDef::new(number, size, base_type)?);
        }
        let mut dev_size = 0usize;
        if header & 0x20 != 0 {
            let nfields = cur.read_u8()?;
            for _ in 0..nfields {
                cur.read_u8()?; // field number
                let size = cur.read_u8()?;
                cur.read_u8()?; // developer data index
                dev_size += size as usize;
            }
        }
        self.definitions.insert(
            local,
            MessageDef {
                global,
                big_endian,
                fields,
                dev_size,
            },
        );
        Ok(())
    }
}

fn read_value(cur: &mut Cursor, base_type: u8, big_endian: bool) -> Result<Value, FitError> {
    macro_rules! wide {
        ($prim:ty, $wrap:ident, $variant:ident) => {{
            let raw = cur.take(std::mem::size_of::<$prim>())?;
            let mut bytes = [0u8; std::mem::size_of::<$prim>()];
            bytes.copy_from_slice(raw);
            let v = if big_endian {
                <$prim>::from_be_bytes(bytes)
            } else {
                <$prim>::from_le_bytes(bytes)
            };
            Value::$variant($wrap(v))
        }};
    }

    Ok(match base_type {
        0x00 => Value::Enum(FitEnum(cur.read_u8()?)),
        0x01 => Value::Sint8(FitSint8(cur.read_u8()? as i8)),
        0x02 => Value::Uint8(FitUint8(cur.read_u8()?)),
        0x83 => wide!(i16, FitSint16, Sint16),
        0x84 => wide!(u16, FitUint16, Uint16),
        0x85 => wide!(i32, FitSint32, Sint32),
        0x86 => wide!(u32, FitUint32, Uint32),
        0x07 => Value::Char(FitChar(cur.read_u8()?)),
        0x88 => wide!(f32, FitFloat32, Float32),
        0x89 => wide!(f64, FitFloat64, Float64),
        0x0A => Value::Uint8z(FitUint8z(cur.read_u8()?)),
        0x8B => wide!(u16, FitUint16z, Uint16z),
        0x8C => wide!(u32, FitUint32z, Uint32z),
        0x0D => Value::Byte(FitByte(cur.read_u8()?)),
        other => return Err(FitError::BadTypeId(other)),
    })
}

/// Decode one data record against its definition. `forced_timestamp` is
/// set for compressed-timestamp records; a field 253 read along the way
/// updates the running timestamp either way.
fn decode_record(
    def: &MessageDef,
    cur: &mut Cursor,
    visitor: &mut dyn FitVisitor,
    last_timestamp: &mut Option<u32>,
    forced_timestamp: Option<u32>,
) -> Result<Flow, FitError> {
    let mut file_id = FileId::default();
    let mut file_creator = FileCreator::default();
    let decoded = matches!(def.global, GLOBAL_FILE_ID | GLOBAL_FILE_CREATOR);

    for field in &def.fields {
        if !decoded && field.number != FIELD_TIMESTAMP {
            cur.take(field.size as usize)?;
            continue;
        }
        if field.count > 1 {
            // Array field: none of the decoded messages carry arrays we
            // keep, so read the elements and move on.
            for _ in 0..field.count {
                read_value(cur, field.base_type, def.big_endian)?;
            }
            continue;
        }
        let value = read_value(cur, field.base_type, def.big_endian)?;
        if field.number == FIELD_TIMESTAMP {
            if let Some(t) = value.as_u64() {
                *last_timestamp = Some(t as u32);
            }
        }
        match def.global {
            GLOBAL_FILE_ID => match field.number {
                0 => file_id.file_type = value.to_enum(),
                1 => file_id.manufacturer = value.to_enum(),
                2 => file_id.product = value.to_uint16(),
                3 => file_id.serial_number = value.to_uint32z(),
                4 => {
                    let raw = value.to_uint32();
                    file_id.time_created = if raw.is_na() {
                        raw
                    } else {
                        FitUint32(raw.0.wrapping_add(FIT_EPOCH_OFFSET))
                    };
                }
                // silently ignore all other fields
                _ => {}
            },
            GLOBAL_FILE_CREATOR => match field.number {
                0 => file_creator.software_version = value.to_uint16(),
                1 => file_creator.hardware_version = value.to_uint8(),
                _ => {}
            },
            _ => {}
        }
    }
    cur.take(def.dev_size)?;

    let flow = match def.global {
        GLOBAL_FILE_ID => visitor.on_file_id(&file_id),
        GLOBAL_FILE_CREATOR => visitor.on_file_creator(&file_creator),
        _ => Flow::Continue,
    };
    if flow == Flow::Stop {
        return Ok(Flow::Stop);
    }
    Ok(visitor.on_record(def.global, forced_timestamp.or(*last_timestamp)))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a single valid chunk (14-byte header with CRC, trailing CRC)
    /// around the given record payload.
    fn chunk(records: &[u8]) -> Vec<u8> {
        let mut header = vec![14, 0x10];
        header.extend_from_slice(&100u16.to_le_bytes()); // profile version
        header.extend_from_slice(&(records.len() as u32).to_le_bytes());
        header.extend_from_slice(b".FIT");
        let hcrc = crc16(0, &header);
        header.extend_from_slice(&hcrc.to_le_bytes());

        let mut data = header;
        data.extend_from_slice(records);
        let crc = crc16(0, &data);
        data.extend_from_slice(&crc.to_le_bytes());
        data
    }

    /// Definition + data record for a FILE_ID message.
    fn file_id_records() -> Vec<u8> {
        let mut r = vec![
            0x40, // definition, local id 0
            0x00, // reserved
            0x00, // little endian
        ];
        r.extend_from_slice(&GLOBAL_FILE_ID.to_le_bytes());
        r.push(5); // field count
        r.extend_from_slice(&[0, 1, 0x00]); // type: enum
        r.extend_from_slice(&[1, 1, 0x00]); // manufacturer: enum
        r.extend_from_slice(&[2, 2, 0x84]); // product: uint16
        r.extend_from_slice(&[3, 4, 0x8C]); // serial: uint32z
        r.extend_from_slice(&[4, 4, 0x86]); // time_created: uint32

        r.push(0x00); // data record, local id 0
        r.push(4); // type
        r.push(1); // manufacturer
        r.extend_from_slice(&0x010Au16.to_le_bytes());
        r.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        r.extend_from_slice(&0x3B9AC9FFu32.to_le_bytes());
        r
    }

    #[derive(Default)]
    struct Collector {
        file_ids: Vec<FileId>,
        records: Vec<(u16, Option<u32>)>,
        stop_on_file_id: bool,
    }

    impl FitVisitor for Collector {
        fn on_file_id(&mut self, message: &FileId) -> Flow {
            self.file_ids.push(message.clone());
            if self.stop_on_file_id {
                Flow::Stop
            } else {
                Flow::Continue
            }
        }

        fn on_record(&mut self, global: u16, timestamp: Option<u32>) -> Flow {
            self.records.push((global, timestamp));
            Flow::Continue
        }
    }

    #[test]
    fn crc_closes_to_zero() {
        let data = b".FIT";
        let crc = crc16(0, data);
        let mut with_crc = data.to_vec();
        with_crc.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(crc16(0, &with_crc), 0);
    }

    #[test]
    fn decodes_file_id_with_epoch_offset() {
        let data = chunk(&file_id_records());
        let mut out = Collector::default();
        read_messages(&data, &mut out).unwrap();
        assert_eq!(out.file_ids.len(), 1);
        let id = &out.file_ids[0];
        assert_eq!(id.file_type, FitEnum(4));
        assert_eq!(id.manufacturer, FitEnum(1));
        assert_eq!(id.product, FitUint16(0x010A));
        assert_eq!(id.serial_number, FitUint32z(0xDEADBEEF));
        assert_eq!(id.time_created, FitUint32(0x3B9AC9FF + 631_065_600));
    }

    #[test]
    fn big_endian_definitions_decode_explicitly() {
        let mut r = vec![0x40, 0x00, 0x01];
        r.extend_from_slice(&GLOBAL_FILE_ID.to_be_bytes());
        r.push(1);
        r.extend_from_slice(&[2, 2, 0x84]); // product: uint16
        r.push(0x00);
        r.extend_from_slice(&0x010Au16.to_be_bytes());
        let data = chunk(&r);
        let mut out = Collector::default();
        read_messages(&data, &mut out).unwrap();
        assert_eq!(out.file_ids[0].product, FitUint16(0x010A));
    }

    #[test]
    fn compressed_timestamp_expands_from_last_full() {
        // Local 0: a message with a full timestamp; then a compressed
        // record referencing it with offset 5.
        let mut r = vec![0x40, 0x00, 0x00];
        r.extend_from_slice(&20u16.to_le_bytes()); // an undecoded global
        r.push(1);
        r.extend_from_slice(&[FIELD_TIMESTAMP, 4, 0x86]);

        r.push(0x00);
        r.extend_from_slice(&1000u32.to_le_bytes());

        // Compressed header: bit 7, local 0, offset 5. The record still
        // carries its defined fields.
        r.push(0x85);
        r.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // timestamp NA

        let data = chunk(&r);
        let mut out = Collector::default();
        read_messages(&data, &mut out).unwrap();
        assert_eq!(out.records, vec![(20, Some(1000)), (20, Some(1005))]);
    }

    #[test]
    fn multi_chunk_files_restart_definitions() {
        let mut data = chunk(&file_id_records());
        data.extend_from_slice(&chunk(&file_id_records()));
        let mut out = Collector::default();
        read_messages(&data, &mut out).unwrap();
        assert_eq!(out.file_ids.len(), 2);
    }

    #[test]
    fn visitor_stop_ends_decoding() {
        let mut data = chunk(&file_id_records());
        data.extend_from_slice(&chunk(&file_id_records()));
        let mut out = Collector {
            stop_on_file_id: true,
            ..Default::default()
        };
        read_messages(&data, &mut out).unwrap();
        assert_eq!(out.file_ids.len(), 1);
        assert!(out.records.is_empty());
    }

    #[test]
    fn zeroed_crcs_are_skipped() {
        let records = file_id_records();
        let mut data = vec![12, 0x10];
        data.extend_from_slice(&100u16.to_le_bytes());
        data.extend_from_slice(&(records.len() as u32).to_le_bytes());
        data.extend_from_slice(b".FIT");
        data.extend_from_slice(&records);
        data.extend_from_slice(&[0, 0]);
        let mut out = Collector::default();
        read_messages(&data, &mut out).unwrap();
        assert_eq!(out.file_ids.len(), 1);
    }

    #[test]
    fn envelope_errors() {
        assert_eq!(
            read_messages(&[13; 20], &mut Collector::default()),
            Err(FitError::BadHeaderLength(13))
        );

        let mut bad_sig = chunk(&[]);
        bad_sig[8] = b'!';
        // Signature is checked after the header CRC, which the edit also
        // breaks; rebuild the header CRC to isolate the signature error.
        let hcrc = crc16(0, &bad_sig[..12]);
        bad_sig[12..14].copy_from_slice(&hcrc.to_le_bytes());
        let err = read_messages(&bad_sig, &mut Collector::default());
        assert_eq!(err, Err(FitError::BadSignature));

        let mut bad_crc = chunk(&file_id_records());
        // Corrupt a record byte, leaving the stored (non-zero) CRC intact.
        assert!(bad_crc[bad_crc.len() - 2] != 0 || bad_crc[bad_crc.len() - 1] != 0);
        bad_crc[20] ^= 0x01;
        assert_eq!(
            read_messages(&bad_crc, &mut Collector::default()),
            Err(FitError::BadCrc)
        );

        let short = chunk(&file_id_records());
        assert_eq!(
            read_messages(&short[..short.len() - 4], &mut Collector::default()),
            Err(FitError::ShortPayload)
        );
    }

    #[test]
    fn undefined_local_id_fails() {
        let data = chunk(&[0x03]); // data record for local 3, never defined
        assert_eq!(
            read_messages(&data, &mut Collector::default()),
            Err(FitError::BadLocalMessageId(3))
        );
    }
}
