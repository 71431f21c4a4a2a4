use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::error::{AppError, AppResult};
use crate::fees::models::{FeeDirection, FeeEvent, FeeId};

/// Net settlement obligation for a set of fee events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetObligation {
    /// Debits minus credits, signed
    pub debt: i128,
    /// Amount to transfer; zero unless `proceed`
    pub amount: u64,
    pub proceed: bool,
}

/// Nets a wallet's fee events into a single obligation.
///
/// The result depends only on the set of events: ordering is irrelevant and
/// an exact repeat of an event is counted once, so recomputing after a crash
/// always yields the same amount. Two events sharing an id but differing in
/// amount or direction are rejected with [`AppError::ConflictingFee`].
pub struct NettingEngine;

impl NettingEngine {
    pub fn net(events: &[FeeEvent]) -> AppResult<NetObligation> {
        let mut seen: HashMap<FeeId, (FeeDirection, u64)> = HashMap::with_capacity(events.len());
        let mut debt: i128 = 0;

        for event in events {
            match seen.entry(event.id) {
                Entry::Vacant(slot) => {
                    slot.insert((event.direction, event.amount));
                    debt += Self::signed_amount(event);
                }
                Entry::Occupied(slot) => {
                    if *slot.get() != (event.direction, event.amount) {
                        return Err(AppError::ConflictingFee(event.id));
                    }
                }
            }
        }

        if debt <= 0 {
            // Credits carry forward: nothing to pay, no refund transaction.
            return Ok(NetObligation {
                debt,
                amount: 0,
                proceed: false,
            });
        }

        Ok(NetObligation {
            debt,
            // Saturates only for sums beyond u64; the max-fee guard rejects those.
            amount: u64::try_from(debt).unwrap_or(u64::MAX),
            proceed: true,
        })
    }

    pub fn signed_amount(event: &FeeEvent) -> i128 {
        match event.direction {
            FeeDirection::Debit => event.amount as i128,
            FeeDirection::Credit => -(event.amount as i128),
        }
    }
}
