use std::collections::BTreeMap;

use groombook_lib::snapshot::{has_changed, DaySnapshot, YearMonth};
use proptest::prelude::*;

fn snapshot_strategy() -> impl Strategy<Value = DaySnapshot> {
    (
        2020_i32..2030,
        1_u32..=12,
        prop::collection::btree_map(1_u32..=31, 1_u32..20, 0..8),
    )
        .prop_map(|(year, month, counts)| {
            DaySnapshot::new(YearMonth::new(year, month).unwrap(), counts)
        })
}

proptest! {
    #[test]
    fn has_changed_is_inequality(a in snapshot_strategy(), b in snapshot_strategy()) {
        prop_assert_eq!(has_changed(&a, &b), a != b);
        prop_assert!(!has_changed(&a, &a.clone()));
    }

    #[test]
    fn one_more_booking_is_always_a_change(a in snapshot_strategy(), day in 1_u32..=31) {
        let mut counts: BTreeMap<u32, u32> = a.counts().clone();
        *counts.entry(day).or_insert(0) += 1;
        let b = DaySnapshot::new(a.month(), counts);
        prop_assert!(has_changed(&a, &b));
    }

    #[test]
    fn next_month_stays_in_range(year in 1900_i32..2200, month in 1_u32..=12) {
        let next = YearMonth::new(year, month).unwrap().next();
        prop_assert!((1..=12).contains(&next.month()));
        prop_assert!(next > YearMonth::new(year, month).unwrap());
    }
}
