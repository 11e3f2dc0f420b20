//! Pure validation predicates.
//!
//! Everything in this module is a function of its arguments alone: the
//! clock-dependent checks take `now_ms` explicitly and nothing here performs
//! I/O. The reconciler and form manager compose these into their pipelines.

use crate::entities::Currency;
use crate::explorer::types::{ParsedTransfer, TransactionDetails};
use crate::utils::round4;
use std::time::Duration;

/// The only TRC-20 contract accepted for USDT transfers.
pub const OFFICIAL_USDT_CONTRACT: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";

const ZERO_ADDRESS: &str = "T000000000000000000000000000000000";

const DANGEROUS_CHARS: [char; 10] = [
    '<', '>', '"', '\'', '&', '\n', '\r', '\t', '\0', '\u{1a}',
];

const SQL_KEYWORDS: [&str; 17] = [
    "SELECT", "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "EXEC", "UNION", "SCRIPT",
    "JAVASCRIPT", "EXECUTE", "TRUNCATE", "GRANT", "REVOKE", "COMMIT", "ROLLBACK",
];

const DANGEROUS_FRAGMENTS: [&str; 5] = [
    "javascript:",
    "data:text/html",
    "vbscript:",
    "<script",
    "</script>",
];

const EVENT_HANDLERS: [&str; 4] = ["onload", "onerror", "onclick", "onmouseover"];

/// Per-currency amount bounds.
#[derive(Debug, Clone, Copy)]
pub struct AmountLimits {
    pub min: f64,
    pub max: f64,
}

/// TRON base58 address shape: 34 characters, `T` followed by 33
/// alphanumerics, and not the all-zero address.
pub fn is_valid_tron_address(address: &str) -> bool {
    let bytes = address.as_bytes();
    bytes.len() == 34
        && bytes[0] == b'T'
        && bytes[1..].iter().all(u8::is_ascii_alphanumeric)
        && address != ZERO_ADDRESS
}

/// A 64-character lowercase-or-uppercase hex transaction hash.
pub fn is_valid_tx_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Canonical form identifier: the 36-character hyphenated hex form of a UUID.
pub fn is_canonical_form_id(form_id: &str) -> bool {
    let bytes = form_id.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    bytes.iter().enumerate().all(|(i, b)| match i {
        8 | 13 | 18 | 23 => *b == b'-',
        _ => b.is_ascii_hexdigit(),
    })
}

/// A user identifier: a decimal string fitting a positive `i64`.
pub fn is_valid_user_id(user_id: &str) -> bool {
    !user_id.is_empty()
        && user_id.bytes().all(|b| b.is_ascii_digit())
        && user_id.parse::<i64>().is_ok_and(|id| id > 0)
}

/// Amount sanity: finite, positive, at most 4 decimal places, inside the
/// global ceiling and the per-currency bounds.
pub fn is_valid_amount(amount: f64, limits: &AmountLimits, max_amount_limit: f64) -> bool {
    if !amount.is_finite() || amount <= 0.0 {
        return false;
    }
    if amount > max_amount_limit {
        return false;
    }
    if amount != round4(amount) {
        return false;
    }
    amount >= limits.min && amount <= limits.max
}

/// Description hygiene. Empty is fine; anything that smells like markup, SQL
/// or control bytes is not.
pub fn is_valid_description(description: &str, max_length: usize) -> bool {
    if description.chars().count() > max_length {
        return false;
    }
    if description.trim().is_empty() {
        return true;
    }
    if description.chars().any(|c| DANGEROUS_CHARS.contains(&c)) {
        return false;
    }
    let upper = description.to_uppercase();
    if SQL_KEYWORDS.iter().any(|keyword| upper.contains(keyword)) {
        return false;
    }
    if description
        .chars()
        .any(|c| (c as u32) < 32 && c != ' ' && c != '\t')
    {
        return false;
    }
    let lower = description.to_lowercase();
    if DANGEROUS_FRAGMENTS
        .iter()
        .any(|fragment| lower.contains(fragment))
    {
        return false;
    }
    !EVENT_HANDLERS
        .iter()
        .any(|handler| contains_handler_assignment(&lower, handler))
}

/// Matches `name` followed by optional whitespace and `=`.
fn contains_handler_assignment(haystack: &str, name: &str) -> bool {
    let mut rest = haystack;
    while let Some(position) = rest.find(name) {
        let after = &rest[position + name.len()..];
        if after.trim_start().starts_with('=') {
            return true;
        }
        rest = after;
    }
    false
}

/// Sender acceptability: a well-formed address that is neither blacklisted
/// nor the merchant wallet itself.
pub fn is_valid_sender(from_address: &str, merchant_wallet: &str, blacklist: &[String]) -> bool {
    if !is_valid_tron_address(from_address) {
        return false;
    }
    let from_lower = from_address.to_lowercase();
    if blacklist
        .iter()
        .any(|entry| entry.trim().to_lowercase() == from_lower)
    {
        return false;
    }
    from_lower != merchant_wallet.to_lowercase()
}

/// Transfer freshness: not older than `max_age`, not further in the future
/// than `future_tolerance`. All arguments are milliseconds.
pub fn is_fresh(timestamp_ms: i64, now_ms: i64, max_age: Duration, future_tolerance: Duration) -> bool {
    let max_age_ms = max_age.as_millis() as i64;
    let tolerance_ms = future_tolerance.as_millis() as i64;
    now_ms - timestamp_ms <= max_age_ms && timestamp_ms <= now_ms + tolerance_ms
}

/// Confirmation depth over an already-fetched detail record.
pub fn has_enough_confirmations(details: &TransactionDetails, required: i64) -> bool {
    details.confirmations >= required
}

/// USDT contract identity over a parsed transfer. Non-USDT transfers pass;
/// a USDT transfer that carries a contract address must carry the official
/// one. A record carrying none is judged by the detail-level check instead.
pub fn is_official_usdt(transfer: &ParsedTransfer) -> bool {
    if transfer.currency != Currency::Usdt {
        return true;
    }
    match transfer.token_contract.as_deref() {
        Some(contract) if !contract.is_empty() => contract == OFFICIAL_USDT_CONTRACT,
        _ => true,
    }
}

/// USDT contract identity over fetched transaction details: every TRC-20
/// transfer naming a contract must name the official one.
pub fn details_carry_official_usdt(details: &TransactionDetails) -> bool {
    details.trc20_transfer_info.iter().all(|transfer| {
        match transfer.token_info.as_ref() {
            Some(info) if !info.token_id.is_empty() => info.token_id == OFFICIAL_USDT_CONTRACT,
            _ => true,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explorer::types::{DetailTokenInfo, DetailTransfer};

    const WALLET: &str = "TN9RRaXkCFtTXRso2GdTZxSxxwufzxLQPP";
    const SENDER: &str = "TLyqzVGLV1srkB7dToTAEqgDSfPtXRJZYH";

    fn usdt_limits() -> AmountLimits {
        AmountLimits {
            min: 0.1,
            max: 10_000.0,
        }
    }

    #[test]
    fn address_shape() {
        assert!(is_valid_tron_address(WALLET));
        assert!(is_valid_tron_address(OFFICIAL_USDT_CONTRACT));
        assert!(!is_valid_tron_address("T000000000000000000000000000000000"));
        assert!(!is_valid_tron_address("AN9RRaXkCFtTXRso2GdTZxSxxwufzxLQPP"));
        assert!(!is_valid_tron_address("TN9RRaXk"));
        assert!(!is_valid_tron_address(""));
        assert!(!is_valid_tron_address("TN9RRaXkCFtTXRso2GdTZxSxxwufzxLQP!"));
    }

    #[test]
    fn tx_hash_shape() {
        assert!(is_valid_tx_hash(&"a".repeat(64)));
        assert!(is_valid_tx_hash(&"0123456789abcdeF".repeat(4)));
        assert!(!is_valid_tx_hash(&"a".repeat(63)));
        assert!(!is_valid_tx_hash(&"g".repeat(64)));
    }

    #[test]
    fn form_id_shape() {
        assert!(is_canonical_form_id("550e8400-e29b-41d4-a716-446655440000"));
        assert!(!is_canonical_form_id("550e8400e29b41d4a716446655440000"));
        assert!(!is_canonical_form_id("550e8400-e29b-41d4-a716-44665544000g"));
        assert!(!is_canonical_form_id(""));
    }

    #[test]
    fn user_id_shape() {
        assert!(is_valid_user_id("123456789"));
        assert!(!is_valid_user_id("0"));
        assert!(!is_valid_user_id("-5"));
        assert!(!is_valid_user_id("12ab"));
        assert!(!is_valid_user_id(""));
        // overflows i64
        assert!(!is_valid_user_id("99999999999999999999"));
    }

    #[test]
    fn amount_bounds_and_precision() {
        let limits = usdt_limits();
        assert!(is_valid_amount(5.1234, &limits, 1e15));
        assert!(is_valid_amount(0.1, &limits, 1e15));
        assert!(is_valid_amount(10_000.0, &limits, 1e15));
        assert!(!is_valid_amount(5.12345, &limits, 1e15));
        assert!(!is_valid_amount(0.0, &limits, 1e15));
        assert!(!is_valid_amount(-1.0, &limits, 1e15));
        assert!(!is_valid_amount(f64::NAN, &limits, 1e15));
        assert!(!is_valid_amount(f64::INFINITY, &limits, 1e15));
        assert!(!is_valid_amount(0.05, &limits, 1e15));
        assert!(!is_valid_amount(10_000.5, &limits, 1e15));
        assert!(!is_valid_amount(2e15, &limits, 1e15));
    }

    #[test]
    fn description_accepts_plain_text() {
        assert!(is_valid_description("", 500));
        assert!(is_valid_description("   ", 500));
        assert!(is_valid_description("Order 42, two coffees", 500));
    }

    #[test]
    fn description_rejects_markup_and_sql() {
        assert!(!is_valid_description("<b>hi</b>", 500));
        assert!(!is_valid_description("a\"quote", 500));
        assert!(!is_valid_description("drop table users", 500));
        assert!(!is_valid_description("1; SELECT * FROM x", 500));
        assert!(!is_valid_description("javascript:alert(1)", 500));
        assert!(!is_valid_description("onerror = boom", 500));
        assert!(!is_valid_description("line\nbreak", 500));
        assert!(!is_valid_description("nul\0byte", 500));
        assert!(!is_valid_description(&"x".repeat(501), 500));
        assert!(is_valid_description(&"x".repeat(500), 500));
    }

    #[test]
    fn sender_rules() {
        assert!(is_valid_sender(SENDER, WALLET, &[]));
        // self-transfer
        assert!(!is_valid_sender(WALLET, WALLET, &[]));
        // blacklist, case-insensitive
        assert!(!is_valid_sender(
            SENDER,
            WALLET,
            &[SENDER.to_lowercase()]
        ));
        assert!(!is_valid_sender("garbage", WALLET, &[]));
    }

    #[test]
    fn freshness_window() {
        let now = 1_700_000_000_000i64;
        let two_hours = Duration::from_secs(7200);
        let five_minutes = Duration::from_secs(300);
        assert!(is_fresh(now - 60_000, now, two_hours, five_minutes));
        assert!(is_fresh(now - 7_200_000, now, two_hours, five_minutes));
        assert!(!is_fresh(now - 7_200_001, now, two_hours, five_minutes));
        assert!(is_fresh(now + 299_000, now, two_hours, five_minutes));
        assert!(!is_fresh(now + 301_000, now, two_hours, five_minutes));
    }

    #[test]
    fn usdt_contract_identity() {
        let mut transfer = ParsedTransfer {
            transaction_id: "a".repeat(64),
            from_address: SENDER.to_string(),
            to_address: WALLET.to_string(),
            amount: 5.1234,
            currency: Currency::Usdt,
            timestamp: 0,
            confirmed: true,
            token_contract: Some(OFFICIAL_USDT_CONTRACT.to_string()),
        };
        assert!(is_official_usdt(&transfer));

        transfer.token_contract = Some("TFakeContractXXXXXXXXXXXXXXXXXXXXX".to_string());
        assert!(!is_official_usdt(&transfer));

        transfer.token_contract = None;
        assert!(is_official_usdt(&transfer));

        transfer.currency = Currency::Trx;
        transfer.token_contract = Some("TFakeContractXXXXXXXXXXXXXXXXXXXXX".to_string());
        assert!(is_official_usdt(&transfer));
    }

    #[test]
    fn details_contract_identity() {
        let details = TransactionDetails {
            confirmed: true,
            confirmations: 20,
            contract_data: None,
            trc20_transfer_info: vec![DetailTransfer {
                from_address: SENDER.to_string(),
                to_address: WALLET.to_string(),
                amount_str: "5123400".to_string(),
                token_info: Some(DetailTokenInfo {
                    symbol: "USDT".to_string(),
                    decimals: 6,
                    token_id: OFFICIAL_USDT_CONTRACT.to_string(),
                }),
            }],
        };
        assert!(details_carry_official_usdt(&details));
        assert!(has_enough_confirmations(&details, 19));
        assert!(!has_enough_confirmations(&details, 21));

        let mut fake = details;
        if let Some(info) = fake.trc20_transfer_info[0].token_info.as_mut() {
            info.token_id = "TFakeContractXXXXXXXXXXXXXXXXXXXXX".to_string();
        }
        assert!(!details_carry_official_usdt(&fake));
    }
}
