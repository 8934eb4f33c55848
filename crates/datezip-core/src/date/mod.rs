pub mod exif;

use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Calendar date a photo was taken (or last modified, see [`DateField`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CaptureDate {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl CaptureDate {
    /// Returns `None` for impossible calendar dates.
    pub fn new(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self::from)
    }

    /// Archive directory keys: 4-digit year, un-padded month and day.
    pub fn keys(&self) -> [String; 3] {
        [
            format!("{:04}", self.year),
            self.month.to_string(),
            self.day.to_string(),
        ]
    }

    pub fn naive_date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
    }
}

impl From<NaiveDate> for CaptureDate {
    fn from(d: NaiveDate) -> Self {
        Self {
            year: d.year(),
            month: d.month(),
            day: d.day(),
        }
    }
}

impl From<NaiveDateTime> for CaptureDate {
    fn from(dt: NaiveDateTime) -> Self {
        dt.date().into()
    }
}

impl fmt::Display for CaptureDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

/// Which EXIF timestamp is authoritative for bucketing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateField {
    /// `DateTime` (0x0132), a.k.a. ModifyDate
    #[default]
    Modify,
    /// `DateTimeOriginal`, then `DateTimeDigitized`
    Create,
}

/// Source of capture dates. Must never fail: absent metadata is `None`.
pub trait DateExtractor: Send + Sync {
    fn extract_capture_date(&self, raw: &[u8]) -> Option<CaptureDate>;
}

/// Reads the configured EXIF field with `kamadak-exif`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExifDateExtractor {
    pub field: DateField,
}

impl ExifDateExtractor {
    pub fn new(field: DateField) -> Self {
        Self { field }
    }
}

impl DateExtractor for ExifDateExtractor {
    fn extract_capture_date(&self, raw: &[u8]) -> Option<CaptureDate> {
        exif::extract_exif_date(raw, self.field).map(CaptureDate::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_unpadded_below_year() {
        let d = CaptureDate::new(2023, 5, 10).unwrap();
        assert_eq!(d.keys(), ["2023".to_string(), "5".to_string(), "10".to_string()]);
        assert_eq!(d.to_string(), "2023-05-10");
    }

    #[test]
    fn test_rejects_impossible_dates() {
        assert!(CaptureDate::new(2023, 2, 30).is_none());
        assert!(CaptureDate::new(2023, 13, 1).is_none());
    }

    #[test]
    fn test_date_field_serde() {
        let f: DateField = serde_json::from_str("\"create\"").unwrap();
        assert_eq!(f, DateField::Create);
        assert_eq!(DateField::default(), DateField::Modify);
    }
}
