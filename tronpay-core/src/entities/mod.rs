pub mod payment_form;
pub mod transaction;

/// Currencies the engine settles.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Trx,
    Usdt,
}

impl Currency {
    pub fn as_str(self) -> &'static str {
        match self {
            Currency::Trx => "TRX",
            Currency::Usdt => "USDT",
        }
    }

    /// Resolve a wire token symbol. Anything that is not TRX or USDT is
    /// unknown to the engine and can never match a form.
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol.to_ascii_uppercase().as_str() {
            "TRX" => Some(Currency::Trx),
            "USDT" => Some(Currency::Usdt),
            _ => None,
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a payment form. Transitions are pending -> paid through the
/// atomic settlement, or pending -> expired through the bulk expiry sweep.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FormStatus {
    Pending,
    Paid,
    Expired,
}

/// Lifecycle of a stored transaction. A `Confirmed` row is immutable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_symbols_round_trip() {
        assert_eq!(Currency::from_symbol("TRX"), Some(Currency::Trx));
        assert_eq!(Currency::from_symbol("usdt"), Some(Currency::Usdt));
        assert_eq!(Currency::from_symbol("USDC"), None);
        assert_eq!(Currency::from_symbol(""), None);
        assert_eq!(Currency::Usdt.as_str(), "USDT");
    }
}
