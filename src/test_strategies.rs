#[cfg(test)]
pub mod strategies {
    use proptest::prelude::*;
    use std::time::Duration;

    /// Arbitrary non-negative log offset
    pub fn arb_offset() -> impl Strategy<Value = i64> {
        0..i64::MAX / 2
    }

    /// (high_water_mark, committed) pair. Committed can be above the
    /// high-water mark (commit observed before the matching produce)
    pub fn arb_high_water_mark_and_committed() -> impl Strategy<Value = (i64, i64)> {
        arb_offset().prop_flat_map(|hwm| (Just(hwm), 0..=hwm + 100))
    }

    /// (min, max) fetch intervals in milliseconds with min < max
    pub fn arb_fetch_bounds() -> impl Strategy<Value = (Duration, Duration)> {
        (1u64..60_000).prop_flat_map(|min| {
            (min + 1..=min * 4).prop_map(move |max| {
                (Duration::from_millis(min), Duration::from_millis(max))
            })
        })
    }

    /// Arbitrary consumer group id
    pub fn arb_group_id() -> impl Strategy<Value = String> {
        "[a-zA-Z][a-zA-Z0-9._-]{0,48}"
    }
}
