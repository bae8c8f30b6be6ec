//! Activity tracker: pure derivations over `Metadata` and per-kind policy.
//! No I/O, no clock side effects beyond taking `today` as a parameter so
//! callers (and tests) control it explicitly.

use chrono::{Days, NaiveDate};

use crate::config::InactivityPolicy;
use crate::model::Metadata;

/// `shutdown_date = marked_active_at + shutdown_after_days(kind)`.
pub fn shutdown_date(metadata: &Metadata, policy: InactivityPolicy) -> NaiveDate {
    add_days(metadata.inactivity.marked_active_at, policy.shutdown_after_days)
}

/// `deletion_date = marked_active_at + deletion_after_days(kind)`.
///
/// This is a *derived date only*. No automatic deletion is triggered by the
/// engine; a caller decides what to do once the date has passed.
pub fn deletion_date(metadata: &Metadata, policy: InactivityPolicy) -> NaiveDate {
    add_days(metadata.inactivity.marked_active_at, policy.deletion_after_days)
}

/// `active = permanent ∨ (¬suspended ∧ (today − marked_active_at) < K_shutdown)`.
pub fn is_active(metadata: &Metadata, policy: InactivityPolicy, today: NaiveDate) -> bool {
    if metadata.permanent {
        return true;
    }
    if metadata.tos.suspended {
        return false;
    }
    let days_since = (today - metadata.inactivity.marked_active_at).num_days();
    days_since < policy.shutdown_after_days
}

/// `MarkActive`: set `inactivity.marked_active_at = today`. Idempotent
/// within a day.
pub fn mark_active(metadata: &mut Metadata, today: NaiveDate) {
    metadata.inactivity.marked_active_at = today;
}

fn add_days(date: NaiveDate, days: i64) -> NaiveDate {
    if days >= 0 {
        date.checked_add_days(Days::new(days as u64)).expect("date overflow")
    } else {
        date.checked_sub_days(Days::new((-days) as u64)).expect("date underflow")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn policy() -> InactivityPolicy {
        InactivityPolicy { shutdown_after_days: 90, deletion_after_days: 150 }
    }

    fn metadata_marked(date: NaiveDate) -> Metadata {
        Metadata {
            owner: "ocanty".into(),
            groups: BTreeSet::new(),
            request_detail: String::new(),
            inactivity: Inactivity { marked_active_at: date },
            network: NetworkMetadata {
                nic_allocation: NicAllocation {
                    addresses: vec![IpAllocation { ip: "10.69.0.3".parse().unwrap(), prefix: 16 }],
                    gateway4: "10.69.0.1".parse().unwrap(),
                    mac: "02:00:00:aa:bb:cc".into(),
                    vlan: 69,
                },
                vhosts: BTreeMap::new(),
                ports: BTreeMap::new(),
            },
            root_user: RootUser { password_hash: String::new(), ssh_public_key: String::new() },
            wake_on_request: false,
            permanent: false,
            tos: Tos::default(),
        }
    }

    #[test]
    fn dates_derive_from_marked_active_at() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let m = metadata_marked(today);
        assert_eq!(shutdown_date(&m, policy()), today + Days::new(90));
        assert_eq!(deletion_date(&m, policy()), today + Days::new(150));
    }

    #[test]
    fn active_before_shutdown_threshold() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let m = metadata_marked(today);
        let check_date = today + Days::new(10);
        assert!(is_active(&m, policy(), check_date));
    }

    #[test]
    fn inactive_after_shutdown_threshold() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let m = metadata_marked(today);
        let check_date = today + Days::new(91);
        assert!(!is_active(&m, policy(), check_date));
    }

    #[test]
    fn permanent_overrides_inactivity() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let mut m = metadata_marked(today);
        m.permanent = true;
        let check_date = today + Days::new(9999);
        assert!(is_active(&m, policy(), check_date));
    }

    #[test]
    fn suspended_overrides_active() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let mut m = metadata_marked(today);
        m.tos.suspended = true;
        assert!(!is_active(&m, policy(), today));
    }

    #[test]
    fn mark_active_is_idempotent() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let mut m = metadata_marked(today - Days::new(30));
        mark_active(&mut m, today);
        let after_first = m.inactivity.marked_active_at;
        mark_active(&mut m, today);
        assert_eq!(m.inactivity.marked_active_at, after_first);
    }
}
