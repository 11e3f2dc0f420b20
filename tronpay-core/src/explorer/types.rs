//! Wire types and parsing for the block-explorer API.
//!
//! Everything that crosses the explorer boundary is narrowed into one of the
//! closed records here; raw JSON never leaves this module's functions. Two
//! parse paths exist: [`parse_fast`] resolves an envelope from list data
//! alone, and [`parse_from_details`] resolves one from a fetched
//! `/transaction-info` body.

use crate::entities::Currency;
use crate::validation::is_valid_tx_hash;
use serde::Deserialize;
use serde_json::Value;

const RESERVED_KEYS: [&str; 5] = ["__proto__", "constructor", "prototype", "eval", "function"];

const MAX_RECORD_AGE_MS: i64 = 365 * 24 * 60 * 60 * 1000;
const MAX_RECORD_FUTURE_MS: i64 = 24 * 60 * 60 * 1000;

fn default_token_decimal() -> i32 {
    6
}

/// Token descriptor embedded in a TRC-20 list record.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenInfo {
    #[serde(rename = "tokenAbbr", default)]
    pub token_abbr: String,
    #[serde(rename = "tokenDecimal", default = "default_token_decimal")]
    pub token_decimal: i32,
    #[serde(rename = "tokenId", default)]
    pub token_id: String,
}

/// A TRC-20 transfer as returned by `token_trc20/transfers`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Trc20Transfer {
    #[serde(default)]
    pub transaction_id: String,
    #[serde(default)]
    pub block_ts: i64,
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub to_address: String,
    #[serde(default)]
    pub quant: String,
    #[serde(default)]
    pub contract_address: Option<String>,
    #[serde(rename = "tokenInfo", default)]
    pub token_info: Option<TokenInfo>,
}

/// Native-transfer body carried by `/transaction` list records and by
/// transaction details. Amounts are in sun (10⁻⁶ TRX).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContractData {
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub owner_address: String,
    #[serde(default)]
    pub to_address: String,
}

/// A validated list record, normalized across both list endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferEnvelope {
    /// 64-hex transaction hash.
    pub hash: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub confirmed: bool,
    /// Embedded payload when the record came from the TRC-20 endpoint.
    pub trc20: Option<Trc20Transfer>,
    /// Embedded payload when the record came from the native endpoint.
    pub contract_data: Option<ContractData>,
}

/// A canonical transfer, ready for matching.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTransfer {
    pub transaction_id: String,
    pub from_address: String,
    pub to_address: String,
    pub amount: f64,
    pub currency: Currency,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub confirmed: bool,
    /// The TRC-20 contract the transfer names, when it names one.
    pub token_contract: Option<String>,
}

/// `/transaction-info` response body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransactionDetails {
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub confirmations: i64,
    #[serde(rename = "contractData", default)]
    pub contract_data: Option<ContractData>,
    #[serde(rename = "trc20TransferInfo", default)]
    pub trc20_transfer_info: Vec<DetailTransfer>,
}

/// A TRC-20 transfer inside transaction details.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DetailTransfer {
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub to_address: String,
    #[serde(default)]
    pub amount_str: String,
    #[serde(rename = "tokenInfo", default)]
    pub token_info: Option<DetailTokenInfo>,
}

/// Token descriptor inside transaction details.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DetailTokenInfo {
    #[serde(default)]
    pub symbol: String,
    #[serde(default = "default_token_decimal")]
    pub decimals: i32,
    #[serde(rename = "tokenId", default)]
    pub token_id: String,
}

/// Reserved-key scan over a whole JSON tree. Responses carrying any of these
/// keys are dropped before deserialization.
pub fn contains_reserved_keys(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.keys().any(|key| RESERVED_KEYS.contains(&key.as_str()))
                || map.values().any(contains_reserved_keys)
        }
        Value::Array(items) => items.iter().any(contains_reserved_keys),
        _ => false,
    }
}

/// Second-based stamps from the wire are promoted to milliseconds.
pub fn normalize_timestamp_ms(timestamp: i64) -> i64 {
    if timestamp < 1_000_000_000_000 {
        timestamp * 1000
    } else {
        timestamp
    }
}

/// A record timestamp must fall within [now − 365 d, now + 1 d].
pub fn is_plausible_timestamp(timestamp_ms: i64, now_ms: i64) -> bool {
    timestamp_ms >= now_ms - MAX_RECORD_AGE_MS && timestamp_ms <= now_ms + MAX_RECORD_FUTURE_MS
}

impl TransferEnvelope {
    /// Accept a `/transaction` list record.
    pub fn from_native_record(record: &Value, now_ms: i64) -> Option<Self> {
        let object = record.as_object()?;
        let hash = object.get("hash")?.as_str()?;
        if !is_valid_tx_hash(hash) {
            return None;
        }
        let timestamp = normalize_timestamp_ms(object.get("timestamp")?.as_i64()?);
        if !is_plausible_timestamp(timestamp, now_ms) {
            return None;
        }
        let confirmed = object
            .get("confirmed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let contract_data = object
            .get("contractData")
            .and_then(|data| serde_json::from_value(data.clone()).ok());
        Some(Self {
            hash: hash.to_string(),
            timestamp,
            confirmed,
            trc20: None,
            contract_data,
        })
    }

    /// Accept a `token_trc20/transfers` record, synthesizing the common
    /// envelope around the embedded payload.
    pub fn from_trc20_record(record: &Value, now_ms: i64) -> Option<Self> {
        let transfer: Trc20Transfer = serde_json::from_value(record.clone()).ok()?;
        if !is_valid_tx_hash(&transfer.transaction_id) {
            return None;
        }
        let timestamp = normalize_timestamp_ms(transfer.block_ts);
        if !is_plausible_timestamp(timestamp, now_ms) {
            return None;
        }
        Some(Self {
            hash: transfer.transaction_id.clone(),
            timestamp,
            confirmed: true,
            trc20: Some(transfer),
            contract_data: None,
        })
    }
}

/// Resolve an envelope from list data alone. Returns `None` when the record
/// needs a detail lookup or names a token the engine does not settle.
pub fn parse_fast(envelope: &TransferEnvelope) -> Option<ParsedTransfer> {
    if let Some(transfer) = &envelope.trc20 {
        let info = transfer.token_info.as_ref();
        let currency = Currency::from_symbol(info.map(|i| i.token_abbr.as_str()).unwrap_or(""))?;
        let decimals = info.map(|i| i.token_decimal).unwrap_or(6);
        let raw: f64 = transfer.quant.parse().ok()?;
        let amount = scale_down(raw, decimals);
        let token_contract = transfer
            .contract_address
            .clone()
            .filter(|contract| !contract.is_empty())
            .or_else(|| {
                info.map(|i| i.token_id.clone())
                    .filter(|contract| !contract.is_empty())
            });
        return Some(ParsedTransfer {
            transaction_id: envelope.hash.clone(),
            from_address: transfer.from_address.clone(),
            to_address: transfer.to_address.clone(),
            amount,
            currency,
            timestamp: envelope.timestamp,
            confirmed: envelope.confirmed,
            token_contract,
        });
    }

    if let Some(contract) = &envelope.contract_data {
        let amount = contract.amount? as f64 / 1_000_000.0;
        return Some(ParsedTransfer {
            transaction_id: envelope.hash.clone(),
            from_address: contract.owner_address.clone(),
            to_address: contract.to_address.clone(),
            amount,
            currency: Currency::Trx,
            timestamp: envelope.timestamp,
            confirmed: envelope.confirmed,
            token_contract: None,
        });
    }

    None
}

/// Resolve a transfer from a fetched `/transaction-info` body.
pub fn parse_from_details(
    hash: &str,
    timestamp: i64,
    details: &TransactionDetails,
) -> Option<ParsedTransfer> {
    if let Some(transfer) = details.trc20_transfer_info.first() {
        let info = transfer.token_info.as_ref();
        let currency = Currency::from_symbol(info.map(|i| i.symbol.as_str()).unwrap_or(""))?;
        let decimals = info.map(|i| i.decimals).unwrap_or(6);
        let raw: f64 = transfer.amount_str.parse().ok()?;
        return Some(ParsedTransfer {
            transaction_id: hash.to_string(),
            from_address: transfer.from_address.clone(),
            to_address: transfer.to_address.clone(),
            amount: scale_down(raw, decimals),
            currency,
            timestamp,
            confirmed: details.confirmed,
            token_contract: info
                .map(|i| i.token_id.clone())
                .filter(|contract| !contract.is_empty()),
        });
    }

    let contract = details.contract_data.as_ref()?;
    let amount = contract.amount? as f64 / 1_000_000.0;
    Some(ParsedTransfer {
        transaction_id: hash.to_string(),
        from_address: contract.owner_address.clone(),
        to_address: contract.to_address.clone(),
        amount,
        currency: Currency::Trx,
        timestamp,
        confirmed: details.confirmed,
        token_contract: None,
    })
}

fn scale_down(raw: f64, decimals: i32) -> f64 {
    if decimals > 0 {
        raw / 10f64.powi(decimals)
    } else {
        raw
    }
}
