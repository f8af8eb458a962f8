//! Fixed-width Big5 settlement file codec
//!
//! Layout per line, one record per line:
//! - Header: `H` + file id (8) + version (3) + creation date (8, YYYYMMDD)
//! - Detail: `D` + date (8) + tx-ref (12) + STAN (6) + RRN (12) +
//!   tx-type (4) + acquirer (7) + issuer (7) + PAN (16) + amount (12,
//!   last two digits cents) + currency (3) + fee (12) + terminal (8) +
//!   merchant (15) + auth (6) + response (2) + reversal flag (1) +
//!   original ref (12) + channel (6)
//! - Trailer: `T` + record count (8) + total (16) + debit (16) +
//!   credit (16) + debit count (8) + credit count (8) + checksum (40)
//!
//! The checksum is SHA-256 over the raw Big5 bytes of every detail line,
//! hex, truncated to the 40-character field. A blank checksum field skips
//! verification.

use chrono::NaiveDate;
use encoding_rs::BIG5;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{ClearingError, ClearingResult};
use crate::records::{MatchStatus, SettlementHeader, SettlementRecord, SettlementTrailer};

const DETAIL_LINE_LEN: usize = 150;
const TRAILER_LINE_LEN: usize = 113;
const CHECKSUM_LEN: usize = 40;

/// A fully parsed settlement file
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementFile {
    pub header: SettlementHeader,
    pub records: Vec<SettlementRecord>,
    pub trailer: SettlementTrailer,
}

/// Cursor over one fixed-width line
struct Fields<'a> {
    line: &'a str,
    line_no: usize,
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(line: &'a str, line_no: usize) -> Self {
        Self {
            line,
            line_no,
            pos: 0,
        }
    }

    fn take(&mut self, width: usize, field: &str) -> ClearingResult<&'a str> {
        let end = self.pos + width;
        if end > self.line.len() {
            return Err(ClearingError::BadField {
                line: self.line_no,
                field: field.to_string(),
                reason: format!("line ends at {} of {}", self.line.len(), end),
            });
        }
        let out = &self.line[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn take_trimmed(&mut self, width: usize, field: &str) -> ClearingResult<String> {
        Ok(self.take(width, field)?.trim().to_string())
    }

    fn take_date(&mut self, field: &str) -> ClearingResult<NaiveDate> {
        let raw = self.take(8, field)?;
        NaiveDate::parse_from_str(raw, "%Y%m%d").map_err(|e| ClearingError::BadField {
            line: self.line_no,
            field: field.to_string(),
            reason: e.to_string(),
        })
    }

    fn take_u64(&mut self, width: usize, field: &str) -> ClearingResult<u64> {
        let raw = self.take(width, field)?;
        raw.trim().parse().map_err(|_| ClearingError::BadField {
            line: self.line_no,
            field: field.to_string(),
            reason: format!("not a number: {:?}", raw),
        })
    }

    /// Fixed-point amount: all digits, last two are cents
    fn take_amount(&mut self, width: usize, field: &str) -> ClearingResult<Decimal> {
        let raw = self.take(width, field)?;
        let digits = raw.trim();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ClearingError::BadField {
                line: self.line_no,
                field: field.to_string(),
                reason: format!("not an amount: {:?}", raw),
            });
        }
        let cents: i64 = digits.parse().map_err(|_| ClearingError::BadField {
            line: self.line_no,
            field: field.to_string(),
            reason: "amount overflow".to_string(),
        })?;
        Ok(Decimal::new(cents, 2))
    }
}

fn parse_header(line: &str, line_no: usize) -> ClearingResult<SettlementHeader> {
    let mut fields = Fields::new(line, line_no);
    fields.take(1, "record_type")?;
    Ok(SettlementHeader {
        file_id: fields.take_trimmed(8, "file_id")?,
        version: fields.take_trimmed(3, "version")?,
        creation_date: fields.take_date("creation_date")?,
    })
}

fn parse_detail(line: &str, line_no: usize) -> ClearingResult<SettlementRecord> {
    if line.len() < DETAIL_LINE_LEN {
        return Err(ClearingError::MalformedLine {
            line: line_no,
            reason: format!("detail is {} chars, expected {}", line.len(), DETAIL_LINE_LEN),
        });
    }
    let mut fields = Fields::new(line, line_no);
    fields.take(1, "record_type")?;
    Ok(SettlementRecord {
        settlement_date: fields.take_date("settlement_date")?,
        transaction_ref: fields.take_trimmed(12, "transaction_ref")?,
        stan: fields.take_trimmed(6, "stan")?,
        rrn: fields.take_trimmed(12, "rrn")?,
        transaction_type: fields.take_trimmed(4, "transaction_type")?,
        acquiring_bank: fields.take_trimmed(7, "acquiring_bank")?,
        issuing_bank: fields.take_trimmed(7, "issuing_bank")?,
        pan: fields.take_trimmed(16, "pan")?,
        amount: fields.take_amount(12, "amount")?,
        currency: fields.take_trimmed(3, "currency")?,
        fee: fields.take_amount(12, "fee")?,
        terminal_id: fields.take_trimmed(8, "terminal_id")?,
        merchant_id: fields.take_trimmed(15, "merchant_id")?,
        auth_code: fields.take_trimmed(6, "auth_code")?,
        response_code: fields.take_trimmed(2, "response_code")?,
        is_reversal: fields.take(1, "reversal_flag")? == "Y",
        original_ref: fields.take_trimmed(12, "original_ref")?,
        channel: fields.take_trimmed(6, "channel")?,
        match_status: MatchStatus::Pending,
    })
}

fn parse_trailer(line: &str, line_no: usize) -> ClearingResult<SettlementTrailer> {
    if line.len() < TRAILER_LINE_LEN {
        return Err(ClearingError::MalformedLine {
            line: line_no,
            reason: format!(
                "trailer is {} chars, expected {}",
                line.len(),
                TRAILER_LINE_LEN
            ),
        });
    }
    let mut fields = Fields::new(line, line_no);
    fields.take(1, "record_type")?;
    Ok(SettlementTrailer {
        record_count: fields.take_u64(8, "record_count")?,
        total_amount: fields.take_amount(16, "total_amount")?,
        debit_amount: fields.take_amount(16, "debit_amount")?,
        credit_amount: fields.take_amount(16, "credit_amount")?,
        debit_count: fields.take_u64(8, "debit_count")?,
        credit_count: fields.take_u64(8, "credit_count")?,
        checksum: fields.take_trimmed(CHECKSUM_LEN, "checksum")?,
    })
}

fn detail_checksum(detail_bytes: &[Vec<u8>]) -> String {
    let mut hasher = Sha256::new();
    for line in detail_bytes {
        hasher.update(line);
    }
    hex::encode(hasher.finalize())[..CHECKSUM_LEN].to_string()
}

/// Parse a Big5 settlement file. The trailer's record count, debit/credit
/// totals and checksum are all verified; `our_bank` decides which side
/// each detail line lands on.
pub fn parse_settlement_file(bytes: &[u8], our_bank: &str) -> ClearingResult<SettlementFile> {
    let (text, _, had_errors) = BIG5.decode(bytes);
    if had_errors {
        return Err(ClearingError::Structure {
            reason: "undecodable Big5 input".to_string(),
        });
    }

    let mut header = None;
    let mut records = Vec::new();
    let mut detail_bytes: Vec<Vec<u8>> = Vec::new();
    let mut trailer = None;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if line.is_empty() {
            continue;
        }
        if trailer.is_some() {
            return Err(ClearingError::Structure {
                reason: format!("data after trailer at line {}", line_no),
            });
        }
        match line.as_bytes()[0] {
            b'H' => {
                if header.is_some() {
                    return Err(ClearingError::Structure {
                        reason: "second header".to_string(),
                    });
                }
                header = Some(parse_header(line, line_no)?);
            }
            b'D' => {
                if header.is_none() {
                    return Err(ClearingError::Structure {
                        reason: "detail before header".to_string(),
                    });
                }
                records.push(parse_detail(line, line_no)?);
                let (encoded, _, _) = BIG5.encode(line);
                detail_bytes.push(encoded.into_owned());
            }
            b'T' => trailer = Some(parse_trailer(line, line_no)?),
            other => {
                return Err(ClearingError::MalformedLine {
                    line: line_no,
                    reason: format!("unknown record type {:?}", other as char),
                })
            }
        }
    }

    let header = header.ok_or_else(|| ClearingError::Structure {
        reason: "missing header".to_string(),
    })?;
    let trailer = trailer.ok_or_else(|| ClearingError::Structure {
        reason: "missing trailer".to_string(),
    })?;

    if trailer.record_count != records.len() as u64 {
        return Err(ClearingError::TrailerMismatch {
            field: "record_count".to_string(),
            declared: trailer.record_count.to_string(),
            computed: records.len().to_string(),
        });
    }

    let total: Decimal = records.iter().map(|r| r.amount).sum();
    if trailer.total_amount != total {
        return Err(ClearingError::TrailerMismatch {
            field: "total_amount".to_string(),
            declared: trailer.total_amount.to_string(),
            computed: total.to_string(),
        });
    }

    let (debit, debit_count): (Decimal, u64) = records
        .iter()
        .filter(|r| r.issuing_bank == our_bank)
        .fold((Decimal::ZERO, 0), |(sum, n), r| (sum + r.amount, n + 1));
    let (credit, credit_count): (Decimal, u64) = records
        .iter()
        .filter(|r| r.acquiring_bank == our_bank)
        .fold((Decimal::ZERO, 0), |(sum, n), r| (sum + r.amount, n + 1));
    if trailer.debit_amount != debit || trailer.debit_count != debit_count {
        return Err(ClearingError::TrailerMismatch {
            field: "debit".to_string(),
            declared: format!("{}/{}", trailer.debit_amount, trailer.debit_count),
            computed: format!("{}/{}", debit, debit_count),
        });
    }
    if trailer.credit_amount != credit || trailer.credit_count != credit_count {
        return Err(ClearingError::TrailerMismatch {
            field: "credit".to_string(),
            declared: format!("{}/{}", trailer.credit_amount, trailer.credit_count),
            computed: format!("{}/{}", credit, credit_count),
        });
    }

    if !trailer.checksum.is_empty() && trailer.checksum != detail_checksum(&detail_bytes) {
        return Err(ClearingError::ChecksumMismatch);
    }

    info!(
        file_id = %header.file_id,
        records = records.len(),
        total = %trailer.total_amount,
        "settlement file parsed"
    );
    Ok(SettlementFile {
        header,
        records,
        trailer,
    })
}

fn amount_digits(amount: Decimal, width: usize) -> String {
    let cents = (amount * Decimal::new(100, 0)).round();
    format!("{:0>width$}", cents.normalize(), width = width)
}

fn detail_line(record: &SettlementRecord) -> String {
    format!(
        "D{}{:<12}{:<6}{:<12}{:<4}{:<7}{:<7}{:<16}{}{:<3}{}{:<8}{:<15}{:<6}{:<2}{}{:<12}{:<6}",
        record.settlement_date.format("%Y%m%d"),
        record.transaction_ref,
        record.stan,
        record.rrn,
        record.transaction_type,
        record.acquiring_bank,
        record.issuing_bank,
        record.pan,
        amount_digits(record.amount, 12),
        record.currency,
        amount_digits(record.fee, 12),
        record.terminal_id,
        record.merchant_id,
        record.auth_code,
        record.response_code,
        if record.is_reversal { "Y" } else { "N" },
        record.original_ref,
        record.channel,
    )
}

/// Write a settlement file in the wire layout, Big5-encoded, with a
/// computed trailer. Used by tests and the reconciliation tooling.
pub fn write_settlement_file(
    header: &SettlementHeader,
    records: &[SettlementRecord],
    our_bank: &str,
) -> Vec<u8> {
    let mut lines = Vec::with_capacity(records.len() + 2);
    lines.push(format!(
        "H{:<8}{:<3}{}",
        header.file_id,
        header.version,
        header.creation_date.format("%Y%m%d"),
    ));

    let mut detail_bytes = Vec::with_capacity(records.len());
    for record in records {
        let line = detail_line(record);
        let (encoded, _, _) = BIG5.encode(&line);
        detail_bytes.push(encoded.into_owned());
        lines.push(line);
    }

    let total: Decimal = records.iter().map(|r| r.amount).sum();
    let (debit, debit_count): (Decimal, u64) = records
        .iter()
        .filter(|r| r.issuing_bank == our_bank)
        .fold((Decimal::ZERO, 0), |(sum, n), r| (sum + r.amount, n + 1));
    let (credit, credit_count): (Decimal, u64) = records
        .iter()
        .filter(|r| r.acquiring_bank == our_bank)
        .fold((Decimal::ZERO, 0), |(sum, n), r| (sum + r.amount, n + 1));

    lines.push(format!(
        "T{:0>8}{}{}{}{:0>8}{:0>8}{:<40}",
        records.len(),
        amount_digits(total, 16),
        amount_digits(debit, 16),
        amount_digits(credit, 16),
        debit_count,
        credit_count,
        detail_checksum(&detail_bytes),
    ));

    let text = lines.join("\n");
    let (encoded, _, _) = BIG5.encode(&text);
    encoded.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const OUR_BANK: &str = "8220000";

    fn header() -> SettlementHeader {
        SettlementHeader {
            file_id: "20260801".to_string(),
            version: "1.0".to_string(),
            creation_date: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
        }
    }

    fn record(stan: &str, acquirer: &str, issuer: &str, amount: Decimal) -> SettlementRecord {
        SettlementRecord {
            settlement_date: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
            transaction_ref: format!("TX{}", stan),
            stan: stan.to_string(),
            rrn: format!("{:0>12}", stan),
            transaction_type: "0100".to_string(),
            acquiring_bank: acquirer.to_string(),
            issuing_bank: issuer.to_string(),
            pan: "411111******1111".to_string(),
            amount,
            fee: dec!(5.00),
            currency: "901".to_string(),
            terminal_id: "ATM00001".to_string(),
            merchant_id: "MERCHANT0000001".to_string(),
            auth_code: "A00001".to_string(),
            response_code: "00".to_string(),
            is_reversal: false,
            original_ref: String::new(),
            channel: "ATM".to_string(),
            match_status: MatchStatus::Pending,
        }
    }

    fn sample_records() -> Vec<SettlementRecord> {
        vec![
            record("000001", "0040000", OUR_BANK, dec!(1000.00)),
            record("000002", "0040000", OUR_BANK, dec!(2000.00)),
            record("000003", OUR_BANK, "0040000", dec!(500.00)),
        ]
    }

    #[test]
    fn round_trip_preserves_records() {
        let bytes = write_settlement_file(&header(), &sample_records(), OUR_BANK);
        let parsed = parse_settlement_file(&bytes, OUR_BANK).unwrap();
        assert_eq!(parsed.header.file_id, "20260801");
        assert_eq!(parsed.records.len(), 3);
        assert_eq!(parsed.records[0].amount, dec!(1000.00));
        assert_eq!(parsed.records[0].stan, "000001");
        assert_eq!(parsed.records[2].acquiring_bank, OUR_BANK);
        assert_eq!(parsed.trailer.record_count, 3);
        assert_eq!(parsed.trailer.total_amount, dec!(3500.00));
        assert_eq!(parsed.trailer.debit_amount, dec!(3000.00));
        assert_eq!(parsed.trailer.credit_amount, dec!(500.00));
        assert_eq!(parsed.trailer.debit_count, 2);
        assert_eq!(parsed.trailer.credit_count, 1);
    }

    #[test]
    fn tampered_detail_fails_checksum() {
        let bytes = write_settlement_file(&header(), &sample_records(), OUR_BANK);
        let mut text = String::from_utf8(bytes).unwrap();
        // Corrupt one PAN character inside a detail line without touching
        // the amounts the trailer re-verifies
        let pos = text.find("411111").unwrap();
        text.replace_range(pos..pos + 1, "5");
        let err = parse_settlement_file(text.as_bytes(), OUR_BANK).unwrap_err();
        assert!(matches!(err, ClearingError::ChecksumMismatch));
    }

    #[test]
    fn wrong_record_count_rejected() {
        let bytes = write_settlement_file(&header(), &sample_records(), OUR_BANK);
        let text = String::from_utf8(bytes).unwrap();
        // Drop one detail line entirely
        let without: Vec<&str> = text.lines().filter(|l| !l.contains("000002")).collect();
        let err =
            parse_settlement_file(without.join("\n").as_bytes(), OUR_BANK).unwrap_err();
        assert!(matches!(
            err,
            ClearingError::TrailerMismatch { ref field, .. } if field == "record_count"
        ));
    }

    #[test]
    fn missing_trailer_rejected() {
        let bytes = write_settlement_file(&header(), &sample_records(), OUR_BANK);
        let text = String::from_utf8(bytes).unwrap();
        let without: Vec<&str> = text.lines().filter(|l| !l.starts_with('T')).collect();
        let err =
            parse_settlement_file(without.join("\n").as_bytes(), OUR_BANK).unwrap_err();
        assert!(matches!(err, ClearingError::Structure { .. }));
    }

    #[test]
    fn short_detail_line_rejected() {
        let text = "H202608011.020260801\nD20260801TOOSHORT\n";
        let err = parse_settlement_file(text.as_bytes(), OUR_BANK).unwrap_err();
        assert!(matches!(err, ClearingError::MalformedLine { .. }));
    }

    #[test]
    fn reversal_flag_parses() {
        let mut records = sample_records();
        records[0].is_reversal = true;
        records[0].original_ref = "TX000000".to_string();
        let bytes = write_settlement_file(&header(), &records, OUR_BANK);
        let parsed = parse_settlement_file(&bytes, OUR_BANK).unwrap();
        assert!(parsed.records[0].is_reversal);
        assert_eq!(parsed.records[0].original_ref, "TX000000");
        assert!(!parsed.records[1].is_reversal);
    }
}
