//! Broadcast lifecycle state machine.
//!
//! Pure transition rules; the admin service drives them through atomic store
//! operations.  The legal edges:
//!
//! ```text
//!   (create immediate, read-fanout)   -> ACTIVE
//!   (create immediate, write-fanout)  -> PREPARING
//!   (create scheduled)                -> SCHEDULED
//!   PREPARING  -> READY      (precompute done)
//!   READY      -> ACTIVE     (activation tick)
//!   SCHEDULED  -> ACTIVE     (due, read-fanout)
//!   SCHEDULED  -> PREPARING  (due, write-fanout)
//!   ACTIVE     -> EXPIRED
//!   non-terminal -> CANCELLED
//!   PREPARING | READY -> FAILED  (precompute failure)
//! ```

use beacon_protocol::{BroadcastStatus, TargetSpec};
use chrono::{DateTime, Utc};

/// Whether `from -> to` is a legal lifecycle edge.
pub fn can_transition(from: BroadcastStatus, to: BroadcastStatus) -> bool {
    use BroadcastStatus::*;
    match (from, to) {
        (Preparing, Ready) => true,
        (Ready, Active) => true,
        (Scheduled, Active) => true,
        (Scheduled, Preparing) => true,
        (Active, Expired) => true,
        (Preparing | Ready, Failed) => true,
        (from, Cancelled) => !from.is_terminal(),
        _ => false,
    }
}

/// Status a freshly created broadcast enters, from its target and schedule.
pub fn creation_status(target: &TargetSpec, scheduled_at: Option<DateTime<Utc>>) -> BroadcastStatus {
    match (scheduled_at, target.fan_out_on_write()) {
        (Some(_), _) => BroadcastStatus::Scheduled,
        (None, true) => BroadcastStatus::Preparing,
        (None, false) => BroadcastStatus::Active,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BroadcastStatus::*;

    const ALL: [BroadcastStatus; 7] =
        [Preparing, Ready, Scheduled, Active, Expired, Cancelled, Failed];

    #[test]
    fn exhaustive_transition_table() {
        let legal = [
            (Preparing, Ready),
            (Preparing, Failed),
            (Preparing, Cancelled),
            (Ready, Active),
            (Ready, Failed),
            (Ready, Cancelled),
            (Scheduled, Active),
            (Scheduled, Preparing),
            (Scheduled, Cancelled),
            (Active, Expired),
            (Active, Cancelled),
        ];
        for from in ALL {
            for to in ALL {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    can_transition(from, to),
                    expected,
                    "transition {from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_admit_nothing() {
        for from in [Expired, Cancelled, Failed] {
            for to in ALL {
                assert!(!can_transition(from, to), "{from:?} -> {to:?} must be illegal");
            }
        }
    }

    #[test]
    fn creation_statuses() {
        let product = TargetSpec::Product {
            product: "p1".to_owned(),
        };
        assert_eq!(creation_status(&TargetSpec::All, None), Active);
        assert_eq!(creation_status(&product, None), Preparing);
        assert_eq!(
            creation_status(&TargetSpec::All, Some(chrono::Utc::now())),
            Scheduled
        );
        assert_eq!(creation_status(&product, Some(chrono::Utc::now())), Scheduled);
    }
}
