use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::{CoreError, CoreResult};

/// One price band of the escrow fee schedule.
///
/// A band covers `(previous upper, upper]`; the first band starts at zero
/// inclusive and the last band has no upper bound.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeeBracket {
    pub upper: Option<Decimal>,
    /// Percentage of the price, e.g. `2.6` for 2.6%.
    pub percent: Decimal,
    /// Minimum escrow fee charged in this band.
    pub floor: Decimal,
    pub process_fee: Decimal,
}

/// Fees attached to a product price.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeQuote {
    pub escrow_fee: Decimal,
    pub process_fee: Decimal,
    pub escrow_percent: Decimal,
}

impl FeeQuote {
    pub fn total_fees(&self) -> Decimal {
        self.escrow_fee + self.process_fee
    }
}

/// Tiered escrow fee schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeSchedule {
    brackets: Vec<FeeBracket>,
}

impl FeeSchedule {
    /// Builds a schedule after checking that the bands partition `[0, ∞)`:
    /// strictly increasing upper bounds and exactly one open-ended final band.
    pub fn new(brackets: Vec<FeeBracket>) -> CoreResult<Self> {
        if brackets.is_empty() {
            return Err(CoreError::ValidationError("fee schedule has no brackets".into()));
        }

        let last = brackets.len() - 1;
        let mut previous = Decimal::ZERO;
        for (idx, bracket) in brackets.iter().enumerate() {
            match (idx == last, bracket.upper) {
                (true, None) => {}
                (true, Some(_)) => {
                    return Err(CoreError::ValidationError(
                        "last fee bracket must be open-ended".into(),
                    ))
                }
                (false, None) => {
                    return Err(CoreError::ValidationError(format!(
                        "fee bracket {} is open-ended but is not the last one",
                        idx
                    )))
                }
                (false, Some(upper)) => {
                    if upper <= previous {
                        return Err(CoreError::ValidationError(format!(
                            "fee bracket {} upper bound {} does not exceed {}",
                            idx, upper, previous
                        )));
                    }
                    previous = upper;
                }
            }
        }

        Ok(Self { brackets })
    }

    /// The marketplace's standard six-band schedule.
    pub fn standard() -> Self {
        let band = |upper: Option<i64>, percent: i64, floor: i64, process_fee: i64| FeeBracket {
            upper: upper.map(Decimal::from),
            percent: Decimal::new(percent, 1),
            floor: Decimal::from(floor),
            process_fee: Decimal::from(process_fee),
        };

        Self {
            brackets: vec![
                band(Some(100_000), 26, 2_000, 1_000),
                band(Some(500_000), 17, 3_000, 1_000),
                band(Some(1_000_000), 12, 9_000, 2_500),
                band(Some(5_000_000), 10, 13_000, 2_500),
                band(Some(10_000_000), 8, 50_000, 5_000),
                band(None, 6, 80_000, 5_000),
            ],
        }
    }

    pub fn brackets(&self) -> &[FeeBracket] {
        &self.brackets
    }

    /// Band a price falls into. Boundary prices belong to the lower band.
    pub fn bracket_for(&self, price: Decimal) -> CoreResult<&FeeBracket> {
        if price.is_sign_negative() && !price.is_zero() {
            return Err(CoreError::ValidationError(format!("price {} is negative", price)));
        }

        self.brackets
            .iter()
            .find(|b| b.upper.map_or(true, |upper| price <= upper))
            .ok_or_else(|| CoreError::ValidationError(format!("no fee bracket for {}", price)))
    }

    /// `escrow_fee = ceil2(max(percent * price, floor))`.
    pub fn fees(&self, price: Decimal) -> CoreResult<FeeQuote> {
        let bracket = self.bracket_for(price)?;
        let proportional = bracket.percent * price / Decimal::ONE_HUNDRED;
        let escrow_fee = ceil2(proportional.max(bracket.floor));

        Ok(FeeQuote {
            escrow_fee,
            process_fee: ceil2(bracket.process_fee),
            escrow_percent: bracket.percent,
        })
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self::standard()
    }
}

/// Rounds up to two decimal places.
pub fn ceil2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::ToPositiveInfinity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_documented_quotes() {
        let schedule = FeeSchedule::standard();

        let q = schedule.fees(dec!(50000)).unwrap();
        assert_eq!((q.escrow_fee, q.process_fee, q.escrow_percent), (dec!(2000.00), dec!(1000.00), dec!(2.6)));

        let q = schedule.fees(dec!(750000)).unwrap();
        assert_eq!((q.escrow_fee, q.process_fee, q.escrow_percent), (dec!(9000.00), dec!(2500.00), dec!(1.2)));

        let q = schedule.fees(dec!(80000)).unwrap();
        assert_eq!(q.escrow_fee, dec!(2080.00));
        assert_eq!(q.total_fees() + dec!(80000), dec!(83080));
    }

    #[test]
    fn test_floor_and_ceiling() {
        let schedule = FeeSchedule::standard();
        let samples = [
            dec!(0), dec!(1), dec!(76923.07), dec!(99999.99), dec!(100000),
            dec!(100000.01), dec!(333333.33), dec!(500000), dec!(999999.99),
            dec!(1000000.01), dec!(4444444.44), dec!(10000000), dec!(10000000.01),
            dec!(123456789.12),
        ];

        for price in samples {
            let bracket = schedule.bracket_for(price).unwrap();
            let quote = schedule.fees(price).unwrap();
            assert!(quote.escrow_fee >= bracket.floor, "floor violated at {}", price);

            let proportional = bracket.percent * price / dec!(100);
            if proportional > bracket.floor {
                assert_eq!(quote.escrow_fee, ceil2(proportional));
                assert!(quote.escrow_fee >= proportional);
                assert!(quote.escrow_fee - proportional < dec!(0.01));
            } else {
                assert_eq!(quote.escrow_fee, bracket.floor);
            }
        }
    }

    #[test]
    fn test_boundaries_resolve_to_one_bracket() {
        let schedule = FeeSchedule::standard();

        assert_eq!(schedule.bracket_for(dec!(100000)).unwrap().percent, dec!(2.6));
        assert_eq!(schedule.bracket_for(dec!(100000.001)).unwrap().percent, dec!(1.7));
        assert_eq!(schedule.bracket_for(dec!(10000000)).unwrap().percent, dec!(0.8));
        assert_eq!(schedule.bracket_for(dec!(10000000.01)).unwrap().percent, dec!(0.6));

        // every price matches exactly one band
        for price in [dec!(0), dec!(100000), dec!(100000.005), dec!(5000000), dec!(99999999)] {
            let matching = schedule
                .brackets()
                .iter()
                .enumerate()
                .filter(|(idx, b)| {
                    let lower = if *idx == 0 { None } else { schedule.brackets()[idx - 1].upper };
                    lower.map_or(true, |l| price > l) && b.upper.map_or(true, |u| price <= u)
                })
                .count();
            assert_eq!(matching, 1, "price {} matched {} brackets", price, matching);
        }
    }

    #[test]
    fn test_negative_price_rejected() {
        let err = FeeSchedule::standard().fees(dec!(-1)).unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)));
    }

    #[test]
    fn test_schedule_rejects_gaps_and_overlaps() {
        let mut brackets = FeeSchedule::standard().brackets().to_vec();
        brackets.swap(1, 2);
        assert!(FeeSchedule::new(brackets).is_err());

        let mut brackets = FeeSchedule::standard().brackets().to_vec();
        brackets.pop();
        assert!(FeeSchedule::new(brackets).is_err());

        assert!(FeeSchedule::new(FeeSchedule::standard().brackets().to_vec()).is_ok());
    }
}
