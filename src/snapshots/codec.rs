//! CSV encoding of member rosters, shared by the upstream download and the
//! on-disk snapshot files. Both use the upstream column names.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::types::MemberRecord;

pub const HEADER: [&str; 6] = ["CUSTID", "DRIVER", "LOCATION", "IRATING", "STARTS", "WINS"];

/// Rejected rows kept for the fetch summary log.
const MAX_REJECTION_SAMPLES: usize = 5;

#[derive(Debug, Deserialize, Serialize)]
struct CsvRow {
    #[serde(rename = "CUSTID")]
    cust_id: i64,
    #[serde(rename = "DRIVER")]
    driver: String,
    #[serde(rename = "LOCATION")]
    location: String,
    #[serde(rename = "IRATING")]
    irating: i64,
    #[serde(rename = "STARTS", default, deserialize_with = "csv::invalid_option")]
    starts: Option<i64>,
    #[serde(rename = "WINS", default, deserialize_with = "csv::invalid_option")]
    wins: Option<i64>,
}

impl From<CsvRow> for MemberRecord {
    fn from(row: CsvRow) -> Self {
        MemberRecord {
            member_id: row.cust_id,
            display_name: row.driver,
            location: row.location,
            value: row.irating,
            starts: row.starts,
            wins: row.wins,
        }
    }
}

impl From<&MemberRecord> for CsvRow {
    fn from(record: &MemberRecord) -> Self {
        CsvRow {
            cust_id: record.member_id,
            driver: record.display_name.clone(),
            location: record.location.clone(),
            irating: record.value,
            starts: record.starts,
            wins: record.wins,
        }
    }
}

#[derive(Debug, Default)]
pub struct DecodeStats {
    pub rows: usize,
    pub skipped: usize,
    /// (line, reason) for the first few rejected rows.
    pub rejection_samples: Vec<(u64, String)>,
}

/// Decodes a roster, skipping rows that do not fit `MemberRecord`. Unknown
/// columns are ignored. Only an unreadable header is an error here; callers
/// decide what an empty result means.
pub fn decode(input: &[u8]) -> Result<(Vec<MemberRecord>, DecodeStats)> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .from_reader(input);
    reader
        .headers()
        .map_err(|e| AppError::Parse(format!("unreadable header: {e}")))?;

    let mut records = Vec::new();
    let mut stats = DecodeStats::default();
    for row in reader.deserialize::<CsvRow>() {
        stats.rows += 1;
        match row {
            Ok(row) => records.push(row.into()),
            Err(e) => {
                stats.skipped += 1;
                if stats.rejection_samples.len() < MAX_REJECTION_SAMPLES {
                    let line = e.position().map_or(0, |p| p.line());
                    stats.rejection_samples.push((line, e.to_string()));
                }
            }
        }
    }
    Ok((records, stats))
}

/// Encodes records with the upstream header; an empty roster still gets one.
pub fn encode(records: &[MemberRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::with_capacity(records.len() * 48));
    writer.write_record(HEADER)?;
    for record in records {
        writer.serialize(CsvRow::from(record))?;
    }
    writer
        .into_inner()
        .map_err(|e| AppError::Io(std::io::Error::new(e.error().kind(), e.error().to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{record, ROSTER_CSV};

    #[test]
    fn decodes_upstream_roster_ignoring_extra_columns() {
        let (records, stats) = decode(ROSTER_CSV.as_bytes()).unwrap();
        assert_eq!(stats.rows, 3);
        assert_eq!(stats.skipped, 0);
        assert_eq!(records[0].member_id, 100);
        assert_eq!(records[0].display_name, "Driver One");
        assert_eq!(records[0].location, "US");
        assert_eq!(records[0].value, 1620);
        assert_eq!(records[0].starts, Some(40));
        assert_eq!(records[2].wins, Some(14));
    }

    #[test]
    fn malformed_rows_are_skipped_not_fatal() {
        let input = "CUSTID,DRIVER,LOCATION,IRATING,STARTS,WINS\n\
                     1,Good,US,1500,1,0\n\
                     abc,Bad Id,US,1500,1,0\n\
                     2,Bad Rating,US,n/a,1,0\n\
                     3,Short Row\n\
                     4,Also Good,FR,1300,,x\n";
        let (records, stats) = decode(input.as_bytes()).unwrap();
        assert_eq!(stats.rows, 5);
        assert_eq!(stats.skipped, 3);
        assert_eq!(stats.rejection_samples.len(), 3);
        assert_eq!(records.iter().map(|r| r.member_id).collect::<Vec<_>>(), vec![1, 4]);
        // unparsable counters become absent instead of dropping the row
        assert_eq!(records[1].starts, None);
        assert_eq!(records[1].wins, None);
    }

    #[test]
    fn text_fields_are_kept_verbatim() {
        let input = "CUSTID, DRIVER ,LOCATION,IRATING,STARTS,WINS\n1,  Spaced Out ,US ,1500,1,0\n";
        let (records, _) = decode(input.as_bytes()).unwrap();
        assert_eq!(records[0].display_name, "  Spaced Out ");
        assert_eq!(records[0].location, "US ");
    }

    #[test]
    fn missing_required_column_rejects_every_row() {
        let input = "CUSTID,DRIVER,IRATING\n1,No Location,1500\n2,Nor Here,1400\n";
        let (records, stats) = decode(input.as_bytes()).unwrap();
        assert!(records.is_empty());
        assert_eq!(stats.skipped, 2);
    }

    #[test]
    fn encode_writes_upstream_header_and_reads_back() {
        let mut second = record(2, -1);
        second.display_name = "Smith, John".to_string();
        second.starts = None;
        let records = vec![record(1, 1500), second];

        let bytes = encode(&records).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with("CUSTID,DRIVER,LOCATION,IRATING,STARTS,WINS\n"));

        let (decoded, stats) = decode(&bytes).unwrap();
        assert_eq!(stats.skipped, 0);
        assert_eq!(decoded, records);
    }

    #[test]
    fn empty_roster_still_has_header() {
        let bytes = encode(&[]).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "CUSTID,DRIVER,LOCATION,IRATING,STARTS,WINS\n");
    }
}
