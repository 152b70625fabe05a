//! The ANT-FS directory is file index 0 on every device: a 16-byte
//! preamble followed by fixed 16-byte entries describing each on-board
//! file.
use std::fmt;

use chrono::{DateTime, Local, TimeZone};

use crate::fit::FIT_EPOCH_OFFSET;
use crate::message::{bytes_to_u16, bytes_to_u32};

pub const ENTRY_SIZE: usize = 16;

/// File type for FIT files; the only type we download.
pub const FILE_TYPE_FIT: u8 = 0x80;

// FIT file sub-types.
pub const SUB_TYPE_DEVICE: u8 = 1;
pub const SUB_TYPE_SETTING: u8 = 2;
pub const SUB_TYPE_SPORT: u8 = 3;
pub const SUB_TYPE_ACTIVITY: u8 = 4;
pub const SUB_TYPE_WORKOUT: u8 = 5;
pub const SUB_TYPE_COURSE: u8 = 6;
pub const SUB_TYPE_SCHEDULES: u8 = 7;
pub const SUB_TYPE_WEIGHT: u8 = 9;
pub const SUB_TYPE_TOTALS: u8 = 10;
pub const SUB_TYPE_GOALS: u8 = 11;
pub const SUB_TYPE_BLOOD_PRESSURE: u8 = 14;
pub const SUB_TYPE_MONITORING_A: u8 = 15;
pub const SUB_TYPE_ACTIVITY_SUMMARY: u8 = 20;
pub const SUB_TYPE_MONITORING_DAILY: u8 = 28;
pub const SUB_TYPE_MONITORING_B: u8 = 32;
pub const SUB_TYPE_MULTISPORT: u8 = 33;

pub const FLAG_READ: u8 = 0x80;
pub const FLAG_WRITE: u8 = 0x40;
pub const FLAG_ERASE: u8 = 0x20;
pub const FLAG_ARCHIVED: u8 = 0x10;
pub const FLAG_APPEND_ONLY: u8 = 0x08;

#[derive(Clone, Debug, PartialEq)]
pub struct DirectoryEntry {
    pub index: u16,
    pub file_type: u8,
    pub sub_type: u8,
    pub number: u16,
    pub data_flags: u8,
    pub flags: u8,
    pub size: u32,
    /// Unix seconds; the on-wire value counts from the FIT epoch.
    pub timestamp: i64,
}

impl DirectoryEntry {
    pub fn parse(data: &[u8]) -> DirectoryEntry {
        DirectoryEntry {
            index: bytes_to_u16(&data[0..2]),
            file_type: data[2],
            sub_type: data[3],
            number: bytes_to_u16(&data[4..6]),
            data_flags: data[6],
            flags: data[7],
            size: bytes_to_u32(&data[8..12]),
            timestamp: bytes_to_u32(&data[12..16]) as i64 + FIT_EPOCH_OFFSET as i64,
        }
    }

    pub fn is_readable(&self) -> bool {
        self.flags & FLAG_READ != 0
    }

    pub fn is_archived(&self) -> bool {
        self.flags & FLAG_ARCHIVED != 0
    }

    /// Canonical local file name. The same `(timestamp, sub-type, number)`
    /// triple always produces the same name, so a directory entry can be
    /// matched against files downloaded on earlier runs.
    pub fn file_name(&self) -> String {
        self.file_name_in(&Local)
    }

    pub(crate) fn file_name_in<Tz: TimeZone>(&self, tz: &Tz) -> String
    where
        Tz::Offset: fmt::Display,
    {
        let when = DateTime::from_timestamp(self.timestamp, 0)
            .unwrap_or_default()
            .with_timezone(tz);
        format!(
            "{}_{}_{}.FIT",
            when.format("%Y-%m-%d_%H-%M-%S"),
            self.sub_type,
            self.number
        )
    }
}

/// One row of the file_list.txt dump.
impl fmt::Display for DirectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let when = DateTime::from_timestamp(self.timestamp, 0)
            .unwrap_or_default()
            .with_timezone(&Local);
        write!(
            f,
            "{}\t{}\t{}\t{}\t{:x}\t{:x}\t{}\t{}",
            self.index,
            self.file_type,
            self.sub_type,
            self.number,
            self.data_flags,
            self.flags,
            self.size,
            when.format("%c")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry_bytes() -> [u8; 16] {
        let mut data = [0u8; 16];
        data[0..2].copy_from_slice(&3u16.to_le_bytes()); // index
        data[2] = FILE_TYPE_FIT;
        data[3] = SUB_TYPE_ACTIVITY;
        data[4..6].copy_from_slice(&7u16.to_le_bytes()); // number
        data[6] = 0x00;
        data[7] = FLAG_READ | FLAG_ERASE;
        data[8..12].copy_from_slice(&1024u32.to_le_bytes());
        // 2020-01-01 00:00:00 UTC = unix 1_577_836_800
        let fit_ts = 1_577_836_800u32 - FIT_EPOCH_OFFSET;
        data[12..16].copy_from_slice(&fit_ts.to_le_bytes());
        data
    }

    #[test]
    fn parse_entry() {
        let entry = DirectoryEntry::parse(&entry_bytes());
        assert_eq!(entry.index, 3);
        assert_eq!(entry.file_type, FILE_TYPE_FIT);
        assert_eq!(entry.sub_type, SUB_TYPE_ACTIVITY);
        assert_eq!(entry.number, 7);
        assert_eq!(entry.size, 1024);
        assert_eq!(entry.timestamp, 1_577_836_800);
        assert!(entry.is_readable());
        assert!(!entry.is_archived());
    }

    #[test]
    fn canonical_file_name() {
        let entry = DirectoryEntry::parse(&entry_bytes());
        assert_eq!(entry.file_name_in(&Utc), "2020-01-01_00-00-00_4_7.FIT");
    }
}
