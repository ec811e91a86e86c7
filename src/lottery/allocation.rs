//! Two-average split of a pool into randomly sized shares.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::ValidationError;

/// Split `total_amount` minor units into `share_count` positive shares.
///
/// Share `i` is drawn from `[1, 2 * remaining / remaining_shares]` and clamped so
/// every share still to come can get at least one unit; the last share takes the
/// remainder. The result is shuffled so position carries no information about
/// generation order.
pub fn allocate<R: Rng + ?Sized>(
    total_amount: u64,
    share_count: u32,
    rng: &mut R,
) -> Result<Vec<u64>, ValidationError> {
    if share_count == 0 {
        return Err(ValidationError::NoShares);
    }
    if total_amount < share_count as u64 {
        return Err(ValidationError::InsufficientAmount {
            total: total_amount,
            shares: share_count,
        });
    }

    let count = share_count as u64;
    let mut shares = Vec::with_capacity(share_count as usize);
    let mut remaining = total_amount;

    for i in 0..count.saturating_sub(1) {
        let remaining_shares = count - i;
        let still_unassigned = remaining_shares - 1;
        let upper = (remaining.saturating_mul(2) / remaining_shares).max(1);
        let ceiling = remaining - still_unassigned;
        let draw = rng.gen_range(1..=upper).min(ceiling);
        shares.push(draw);
        remaining -= draw;
    }
    shares.push(remaining);

    shares.shuffle(rng);
    Ok(shares)
}
