use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::error::DomainError;

/// Currencies the engine settles in. Fiat rails carry two decimal places;
/// crypto assets carry their native scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Cny,
    Usd,
    Eur,
    Usdt,
    Btc,
    Eth,
}

impl Currency {
    pub fn code(self) -> &'static str {
        match self {
            Currency::Cny => "CNY",
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Usdt => "USDT",
            Currency::Btc => "BTC",
            Currency::Eth => "ETH",
        }
    }

    /// Maximum number of decimal places an amount in this currency may carry.
    pub fn scale(self) -> u32 {
        match self {
            Currency::Cny | Currency::Usd | Currency::Eur => 2,
            Currency::Usdt => 6,
            Currency::Btc => 8,
            Currency::Eth => 18,
        }
    }
}

impl FromStr for Currency {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CNY" => Ok(Currency::Cny),
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            "USDT" => Ok(Currency::Usdt),
            "BTC" => Ok(Currency::Btc),
            "ETH" => Ok(Currency::Eth),
            other => Err(DomainError::validation(format!(
                "unknown currency {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A non-negative amount in a single currency. Arithmetic is checked and
/// same-currency only; construction rejects amounts finer than the
/// currency's scale so `12.345 CNY` can never enter the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    amount: Decimal,
    currency: Currency,
}

impl Money {
    pub fn new(amount: Decimal, currency: Currency) -> Result<Self, DomainError> {
        if amount.is_sign_negative() {
            return Err(DomainError::NonPositiveAmount(amount));
        }
        if amount.normalize().scale() > currency.scale() {
            return Err(DomainError::ExcessPrecision {
                amount,
                currency: currency.code().to_string(),
                scale: currency.scale(),
            });
        }
        Ok(Money { amount, currency })
    }

    /// Positive amount, for order and refund totals where zero is invalid.
    pub fn positive(amount: Decimal, currency: Currency) -> Result<Self, DomainError> {
        if amount <= Decimal::ZERO {
            return Err(DomainError::NonPositiveAmount(amount));
        }
        Money::new(amount, currency)
    }

    pub fn zero(currency: Currency) -> Self {
        Money {
            amount: Decimal::ZERO,
            currency,
        }
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    fn require_same_currency(&self, other: &Money) -> Result<(), DomainError> {
        if self.currency != other.currency {
            return Err(DomainError::CurrencyMismatch {
                left: self.currency.code().to_string(),
                right: other.currency.code().to_string(),
            });
        }
        Ok(())
    }

    pub fn checked_add(&self, other: &Money) -> Result<Money, DomainError> {
        self.require_same_currency(other)?;
        let amount = self
            .amount
            .checked_add(other.amount)
            .ok_or(DomainError::AmountOverflow)?;
        Ok(Money {
            amount,
            currency: self.currency,
        })
    }

    /// Subtraction that refuses to go negative, which in practice means the
    /// books are inconsistent rather than the caller being sloppy.
    pub fn checked_sub(&self, other: &Money) -> Result<Money, DomainError> {
        self.require_same_currency(other)?;
        let amount = self
            .amount
            .checked_sub(other.amount)
            .ok_or(DomainError::AmountOverflow)?;
        if amount.is_sign_negative() {
            return Err(DomainError::AmountOverflow);
        }
        Ok(Money {
            amount,
            currency: self.currency,
        })
    }

    /// True when `other` fits inside `self` (same currency).
    pub fn covers(&self, other: &Money) -> Result<bool, DomainError> {
        self.require_same_currency(other)?;
        Ok(self.amount >= other.amount)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency.code())
    }
}
