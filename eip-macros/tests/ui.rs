#[test]
fn ui() {
    let t = trybuild::TestCases::new();
    t.pass("tests/ui/processor_basic.rs");
    t.pass("tests/ui/aggregation_strategy_basic.rs");
}
