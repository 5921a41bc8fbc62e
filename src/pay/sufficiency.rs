//! Payment sufficiency (spec §4.5.4).
//!
//! Every intermediate amount is a checked `Amount` operation — the Design
//! Note (spec §9) singles this algorithm out as the one place the source
//! silently dropped an arithmetic result, so nothing here is allowed to.

use crate::error::ApiError;
use crate::types::Amount;

/// One coin contributing to the sufficiency computation — either a freshly
/// accepted deposit or a pre-existing `PaidCoinRecord`.
#[derive(Debug, Clone)]
pub struct SufficiencyCoin {
    pub amount_with_fee: Amount,
    pub deposit_fee: Amount,
    pub exchange_url: String,
}

pub struct SufficiencyInput<'a> {
    pub coins: &'a [SufficiencyCoin],
    /// wire_fee per distinct exchange used, already resolved by the liaison.
    pub wire_fees: &'a [(String, Amount)],
    pub total_refunded: Amount,
    pub contract_amount: Amount,
    pub max_fee: Amount,
    pub max_wire_fee: Amount,
    pub wire_fee_amortization: u32,
}

#[derive(Debug)]
pub struct SufficiencyResult {
    pub customer_wire_contribution: Amount,
    pub effective_paid: Amount,
}

/// Run the 7 ordered checks of spec §4.5.4. The first failing check
/// determines the returned error code.
pub fn check_sufficiency(input: &SufficiencyInput) -> Result<SufficiencyResult, ApiError> {
    let currency = input.contract_amount.currency().to_string();

    // 1. |coins| > 0
    if input.coins.is_empty() {
        return Err(ApiError::PaymentInsufficient);
    }

    // 2. per-coin deposit_fee <= amount_with_fee
    for coin in input.coins {
        if coin.deposit_fee.partial_cmp(&coin.amount_with_fee) == Some(std::cmp::Ordering::Greater)
        {
            return Err(ApiError::FeesExceedPayment);
        }
    }

    // 3. all wire fees share one currency
    for (_, fee) in input.wire_fees {
        if fee.currency() != currency {
            return Err(ApiError::WireFeeCurrencyMismatch);
        }
    }

    // acc_amount, acc_fee over all coins; total_wire_fee over distinct exchanges.
    let mut acc_amount = Amount::zero(&currency).map_err(|_| ApiError::CryptoError)?;
    let mut acc_fee = Amount::zero(&currency).map_err(|_| ApiError::CryptoError)?;
    for coin in input.coins {
        acc_amount = acc_amount
            .checked_add(&coin.amount_with_fee)
            .map_err(|_| ApiError::CryptoError)?;
        acc_fee = acc_fee
            .checked_add(&coin.deposit_fee)
            .map_err(|_| ApiError::CryptoError)?;
    }
    let mut total_wire_fee = Amount::zero(&currency).map_err(|_| ApiError::CryptoError)?;
    for (_, fee) in input.wire_fees {
        total_wire_fee = total_wire_fee
            .checked_add(fee)
            .map_err(|_| ApiError::CryptoError)?;
    }

    // 4. wire_fee_excess = max(0, total_wire_fee - max_wire_fee); amortized by integer division.
    let wire_fee_excess = total_wire_fee
        .saturating_sub(&input.max_wire_fee)
        .map_err(|_| ApiError::CryptoError)?;
    let customer_wire_contribution = wire_fee_excess
        .checked_div(input.wire_fee_amortization.max(1))
        .map_err(|_| ApiError::CryptoError)?;

    // 5. effective_paid = acc_amount - total_refunded
    let effective_paid = acc_amount
        .checked_sub(&input.total_refunded)
        .map_err(|_| ApiError::PaymentInsufficient)?;

    // 6/7. fee handling
    if acc_fee
        .partial_cmp(&input.max_fee)
        .map(|o| o == std::cmp::Ordering::Greater)
        .unwrap_or(false)
    {
        // 6. customer must cover excess_fee on top of contract_amount + wire contribution.
        let excess_fee = acc_fee
            .checked_sub(&input.max_fee)
            .map_err(|_| ApiError::CryptoError)?;
        let required = input
            .contract_amount
            .checked_add(&excess_fee)
            .and_then(|v| v.checked_add(&customer_wire_contribution))
            .map_err(|_| ApiError::CryptoError)?;
        if effective_paid
            .partial_cmp(&required)
            .map(|o| o != std::cmp::Ordering::Less)
            .unwrap_or(false)
        {
            Ok(SufficiencyResult {
                customer_wire_contribution,
                effective_paid,
            })
        } else {
            Err(ApiError::PaymentInsufficientDueToFees)
        }
    } else {
        // 7. merchant absorbs max_fee - acc_fee, offsetting the wire contribution first.
        let savings = input
            .max_fee
            .checked_sub(&acc_fee)
            .map_err(|_| ApiError::CryptoError)?;
        let remaining_contribution = customer_wire_contribution
            .saturating_sub(&savings)
            .map_err(|_| ApiError::CryptoError)?;
        let effective_after_contribution = effective_paid
            .saturating_sub(&remaining_contribution)
            .map_err(|_| ApiError::CryptoError)?;
        if effective_after_contribution
            .partial_cmp(&input.contract_amount)
            .map(|o| o != std::cmp::Ordering::Less)
            .unwrap_or(false)
        {
            Ok(SufficiencyResult {
                customer_wire_contribution,
                effective_paid,
            })
        } else {
            Err(ApiError::PaymentInsufficient)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(v: &str) -> Amount {
        v.parse().unwrap()
    }

    fn coin(amount: &str, fee: &str, exchange: &str) -> SufficiencyCoin {
        SufficiencyCoin {
            amount_with_fee: amt(amount),
            deposit_fee: amt(fee),
            exchange_url: exchange.to_string(),
        }
    }

    #[test]
    fn scenario_1_happy_path_single_exchange() {
        let coins = vec![
            coin("CUR:3.00000000", "CUR:0.01000000", "https://exchange-a"),
            coin("CUR:2.00000000", "CUR:0.01000000", "https://exchange-a"),
        ];
        let wire_fees = vec![("https://exchange-a".to_string(), amt("CUR:0.03000000"))];
        let input = SufficiencyInput {
            coins: &coins,
            wire_fees: &wire_fees,
            total_refunded: amt("CUR:0.00000000"),
            contract_amount: amt("CUR:5.00000000"),
            max_fee: amt("CUR:0.10000000"),
            max_wire_fee: amt("CUR:0.05000000"),
            wire_fee_amortization: 1,
        };
        assert!(check_sufficiency(&input).is_ok());
    }

    #[test]
    fn scenario_2_amortized_wire_fee_boundary() {
        let coins = vec![
            coin("CUR:5.06500000", "CUR:0.00000000", "https://exchange-a"),
        ];
        let wire_fees = vec![
            ("https://exchange-a".to_string(), amt("CUR:0.10000000")),
            ("https://exchange-b".to_string(), amt("CUR:0.08000000")),
        ];
        // max_fee equals the coins' deposit fees exactly, so the merchant has
        // no fee savings to absorb and the full wire contribution applies.
        let base = SufficiencyInput {
            coins: &coins,
            wire_fees: &wire_fees,
            total_refunded: amt("CUR:0.00000000"),
            contract_amount: amt("CUR:5.00000000"),
            max_fee: amt("CUR:0.00000000"),
            max_wire_fee: amt("CUR:0.05000000"),
            wire_fee_amortization: 2,
        };
        // amount + 0.065 accepts
        let result = check_sufficiency(&base).unwrap();
        assert_eq!(result.customer_wire_contribution, amt("CUR:0.06500000"));

        // amount + 0.064 falls short of the required wire contribution.
        let short_coins = vec![coin("CUR:5.06400000", "CUR:0.00000000", "https://exchange-a")];
        let short_input = SufficiencyInput {
            coins: &short_coins,
            wire_fees: &wire_fees,
            total_refunded: amt("CUR:0.00000000"),
            contract_amount: amt("CUR:5.00000000"),
            max_fee: amt("CUR:0.00000000"),
            max_wire_fee: amt("CUR:0.05000000"),
            wire_fee_amortization: 2,
        };
        assert!(check_sufficiency(&short_input).is_err());
    }

    #[test]
    fn zero_coins_is_payment_insufficient() {
        let wire_fees = vec![];
        let input = SufficiencyInput {
            coins: &[],
            wire_fees: &wire_fees,
            total_refunded: amt("CUR:0.00000000"),
            contract_amount: amt("CUR:1.00000000"),
            max_fee: amt("CUR:0.10000000"),
            max_wire_fee: amt("CUR:0.05000000"),
            wire_fee_amortization: 1,
        };
        let err = check_sufficiency(&input).unwrap_err();
        assert!(matches!(err, ApiError::PaymentInsufficient));
    }

    #[test]
    fn fee_exceeding_contribution_is_fees_exceed_payment() {
        let coins = vec![coin("CUR:1.00000000", "CUR:2.00000000", "https://exchange-a")];
        let wire_fees = vec![];
        let input = SufficiencyInput {
            coins: &coins,
            wire_fees: &wire_fees,
            total_refunded: amt("CUR:0.00000000"),
            contract_amount: amt("CUR:1.00000000"),
            max_fee: amt("CUR:1.00000000"),
            max_wire_fee: amt("CUR:0.00000000"),
            wire_fee_amortization: 1,
        };
        let err = check_sufficiency(&input).unwrap_err();
        assert!(matches!(err, ApiError::FeesExceedPayment));
    }

    #[test]
    fn mismatched_wire_fee_currency_is_rejected() {
        let coins = vec![coin("CUR:1.00000000", "CUR:0.00000000", "https://exchange-a")];
        let wire_fees = vec![("https://exchange-a".to_string(), amt("OTHER:0.01000000"))];
        let input = SufficiencyInput {
            coins: &coins,
            wire_fees: &wire_fees,
            total_refunded: amt("CUR:0.00000000"),
            contract_amount: amt("CUR:1.00000000"),
            max_fee: amt("CUR:0.10000000"),
            max_wire_fee: amt("CUR:0.05000000"),
            wire_fee_amortization: 1,
        };
        let err = check_sufficiency(&input).unwrap_err();
        assert!(matches!(err, ApiError::WireFeeCurrencyMismatch));
    }
}
