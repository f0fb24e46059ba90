use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::models::delivery::{ConfirmSource, Settlement};

const MONEY_SCALE: u32 = 2;

pub fn settle(
    fare: Decimal,
    commission_rate: Decimal,
    source: ConfirmSource,
    settled_at: DateTime<Utc>,
) -> Settlement {
    let commission = (fare * commission_rate)
        .round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);
    let driver_payout = fare - commission;

    Settlement {
        fare,
        commission_rate,
        commission,
        driver_payout,
        source,
        settled_at,
    }
}
