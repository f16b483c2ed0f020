use eip_core::aggregation::AggregationStrategy;
use eip_core::exchange::Exchange;
use eip_macros::aggregation_strategy;

fn two_is_enough(old: Option<&Exchange>, _new: &Exchange) -> bool {
    old.is_some_and(|ex| ex.body().as_array().is_some_and(|a| a.len() >= 2))
}

#[aggregation_strategy]
fn keep_first(old: Option<Exchange>, new: Exchange) -> anyhow::Result<Exchange> {
    Ok(old.unwrap_or(new))
}

#[aggregation_strategy(name = Pairs, pre_complete = two_is_enough)]
fn collect_pairs(old: Option<Exchange>, new: Exchange) -> anyhow::Result<Exchange> {
    Ok(old.unwrap_or(new))
}

fn main() {
    let _shared = KeepFirst::shared();
    assert!(!KeepFirst.can_pre_complete());
    assert!(Pairs.can_pre_complete());
}
