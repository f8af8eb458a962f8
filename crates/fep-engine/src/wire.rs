//! Boundary conversions between wire messages and the business types
//!
//! Ingress frames decode into [`TransactionRequest`]s here; the pipeline's
//! response encodes back into the reply message, MTI advanced by 10 and
//! identifiers echoed.

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use fep_codec::Message;
use fep_types::{
    Channel, FepError, ProcessingCode, Result, TransactionRequest, TransactionResponse,
    TransactionType,
};

fn currency_alpha(numeric: &str) -> &'static str {
    match numeric {
        "840" => "USD",
        "392" => "JPY",
        _ => "TWD",
    }
}

fn require_text(message: &Message, number: u16, name: &str) -> Result<String> {
    message
        .get_text(number)
        .map(str::to_string)
        .ok_or_else(|| FepError::Field {
            field: name.to_string(),
            cause: "missing on ingress".to_string(),
        })
}

/// Transaction type from the MTI and processing-code prefix
fn transaction_type_of(mti: &str, processing: &ProcessingCode) -> Result<TransactionType> {
    if mti.starts_with("04") {
        return Ok(TransactionType::Reversal);
    }
    if mti.starts_with("08") {
        return Ok(TransactionType::NetworkManagement);
    }
    let prefix = &processing.as_string()[..2];
    match prefix {
        "01" => Ok(TransactionType::Withdrawal),
        "21" => Ok(TransactionType::Deposit),
        "31" => Ok(TransactionType::BalanceInquiry),
        "40" => Ok(TransactionType::Transfer),
        "50" => Ok(TransactionType::BillPayment),
        "00" => Ok(TransactionType::Purchase),
        other => Err(FepError::validation(
            "processing_code",
            format!("unknown transaction prefix {}", other),
        )),
    }
}

/// Build the business request from a decoded ingress message
pub fn decode_request(message: &Message, channel: Channel) -> Result<TransactionRequest> {
    let processing = ProcessingCode::parse(&require_text(message, 3, "processing_code")?)?;
    let transaction_type = transaction_type_of(message.mti(), &processing)?;

    let amount = match message.get_text(4) {
        Some(digits) if digits.bytes().all(|b| b.is_ascii_digit()) => {
            let cents: i64 = digits.parse().map_err(|_| FepError::Field {
                field: "amount".to_string(),
                cause: "overflow".to_string(),
            })?;
            Decimal::new(cents, 2)
        }
        Some(_) => {
            return Err(FepError::Field {
                field: "amount".to_string(),
                cause: "non-numeric".to_string(),
            })
        }
        None => Decimal::ZERO,
    };

    Ok(TransactionRequest {
        id: Uuid::new_v4(),
        transaction_type,
        processing_code: processing,
        pan: require_text(message, 2, "pan")?,
        amount,
        currency: currency_alpha(message.get_text(49).unwrap_or("901")).to_string(),
        source_account: message.get_text(103).map(str::to_string),
        dest_account: message.get_text(102).map(str::to_string),
        dest_bank_code: None,
        terminal_id: require_text(message, 41, "terminal_id")?,
        merchant_id: message.get_text(42).map(str::to_string),
        acquiring_bank: require_text(message, 32, "acquiring_institution")?,
        stan: require_text(message, 11, "stan")?,
        rrn: require_text(message, 37, "rrn")?,
        channel,
        pin_block: message.get_bytes(52).map(|b| b.to_vec()),
        mac: message.get_bytes(64).map(|b| b.to_vec()),
        expiry: message.get_text(14).map(str::to_string),
        received_at: Utc::now(),
        original_id: None,
    })
}

/// Response MTI: request class advanced by 10 (0200 → 0210)
fn response_mti(request_mti: &str) -> String {
    let mut digits: Vec<u8> = request_mti.bytes().map(|b| b - b'0').collect();
    digits[3] = 0;
    digits[2] += 1;
    digits.iter().map(|d| (b'0' + d) as char).collect()
}

/// Build the reply message for an ingress request
pub fn encode_response(
    request_message: &Message,
    response: &TransactionResponse,
) -> Result<Message> {
    let mut reply = Message::new(response_mti(request_message.mti()))?;
    for field in [2u16, 3, 4, 7, 11, 32, 37, 41, 49] {
        if let Some(value) = request_message.get_text(field) {
            reply.set(field, value.to_string())?;
        }
    }
    reply.set(12, Utc::now().format("%H%M%S").to_string())?;
    reply.set(13, Utc::now().format("%m%d").to_string())?;
    // Two-character codes only on the wire; the synthesized ND stays local
    let code: &str = if response.response_code.len() == 2 {
        &response.response_code
    } else {
        "91"
    };
    reply.set(39, code)?;
    if let Some(auth) = &response.auth_code {
        if !auth.is_empty() {
            reply.set(38, auth.clone())?;
        }
    }
    if let Some(balance) = response.balance {
        let cents = (balance * Decimal::new(100, 0)).round();
        reply.set(54, format!("{:0>12}", cents.normalize()))?;
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ingress_0200() -> Message {
        let mut message = Message::new("0200").unwrap();
        message.set(2, "4111111111111111").unwrap();
        message.set(3, "012000").unwrap();
        message.set(4, "000000100000").unwrap();
        message.set(11, "000001").unwrap();
        message.set(32, "8220000").unwrap();
        message.set(37, "000000000001").unwrap();
        message.set(41, "ATM00001").unwrap();
        message.set(49, "901").unwrap();
        message
    }

    #[test]
    fn decode_builds_withdrawal() {
        let request = decode_request(&ingress_0200(), Channel::Atm).unwrap();
        assert_eq!(request.transaction_type, TransactionType::Withdrawal);
        assert_eq!(request.amount, dec!(1000.00));
        assert_eq!(request.currency, "TWD");
        assert_eq!(request.stan, "000001");
        assert_eq!(request.terminal_id, "ATM00001");
    }

    #[test]
    fn decode_0400_is_reversal() {
        let message = ingress_0200();
        let mut reversal = Message::new("0400").unwrap();
        for field in [2u16, 3, 4, 11, 32, 37, 41, 49] {
            if let Some(v) = message.get_text(field) {
                reversal.set(field, v.to_string()).unwrap();
            }
        }
        let request = decode_request(&reversal, Channel::Atm).unwrap();
        assert_eq!(request.transaction_type, TransactionType::Reversal);
    }

    #[test]
    fn missing_stan_is_field_error() {
        let mut message = ingress_0200();
        message.remove(11).unwrap();
        let err = decode_request(&message, Channel::Atm).unwrap_err();
        assert!(matches!(err, FepError::Field { ref field, .. } if field == "stan"));
    }

    #[test]
    fn response_round_trip_echoes_identifiers() {
        let ingress = ingress_0200();
        let request = decode_request(&ingress, Channel::Atm).unwrap();
        let mut response = TransactionResponse::approved(&request, "A00001");
        response.balance = Some(dec!(543.21));
        let reply = encode_response(&ingress, &response).unwrap();
        assert_eq!(reply.mti(), "0210");
        assert_eq!(reply.get_text(39), Some("00"));
        assert_eq!(reply.get_text(38), Some("A00001"));
        assert_eq!(reply.get_text(11), Some("000001"));
        assert_eq!(reply.get_text(54), Some("000000054321"));
    }

    #[test]
    fn nd_never_reaches_the_wire() {
        let ingress = ingress_0200();
        let request = decode_request(&ingress, Channel::Atm).unwrap();
        let response = TransactionResponse::declined(&request, "ND");
        let reply = encode_response(&ingress, &response).unwrap();
        assert_eq!(reply.get_text(39), Some("91"));
    }

    #[test]
    fn reversal_mti_advances() {
        assert_eq!(response_mti("0400"), "0410");
        assert_eq!(response_mti("0800"), "0810");
        assert_eq!(response_mti("0100"), "0110");
    }
}
