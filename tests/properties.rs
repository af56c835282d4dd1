//! Property-based tests for the matcher.
//!
//! These check that verdicts do not depend on how input is split into
//! chunks, that sessions always release their derivation tree, and that
//! the regular stock grammars accept exactly what the equivalent regex
//! accepts.

use backtrack_stream::grammars::{A_PLUS_B, AB_CD, NUMBER, NUMBER_TREE, NUMBERS, SPACES};
use backtrack_stream::{Grammar, MatcherMemory};
use proptest::prelude::*;

/// Feed `input` in pieces split at `cuts`, then stop.
fn run_split(memory: &mut MatcherMemory, grammar: &Grammar, input: &[u8], cuts: &[usize]) -> bool {
    let mut m = memory.matcher(grammar);
    let mut from = 0;
    for &cut in cuts {
        let cut = cut.clamp(from, input.len());
        m.chunk(&input[from..cut]);
        from = cut;
    }
    m.chunk(&input[from..]);
    m.finish()
}

fn run_bytewise(memory: &mut MatcherMemory, grammar: &Grammar, input: &[u8]) -> bool {
    let mut m = memory.matcher(grammar);
    for &b in input {
        m.feed(b);
    }
    m.finish()
}

fn stock() -> impl Strategy<Value = &'static Grammar> {
    prop_oneof![
        Just(&*A_PLUS_B),
        Just(&*AB_CD),
        Just(&*NUMBER),
        Just(&*SPACES),
        Just(&*NUMBERS),
        Just(&*NUMBER_TREE),
    ]
}

/// Short inputs over the alphabet the stock grammars care about, plus one
/// byte none of them accepts.
fn bytes() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(b"ab0123 \t{,}x".to_vec()), 0..10)
}

fn assert_matches_regex(grammar: &Grammar, pattern: &str, input: &[u8]) {
    let re = regex::bytes::Regex::new(pattern).expect("regex crate should parse pattern");
    let expected = re.is_match(input);
    let mut memory = MatcherMemory::default();
    let actual = run_bytewise(&mut memory, grammar, input);
    assert_eq!(
        actual,
        expected,
        "mismatch for `{}` on {:?}: ours={}, regex crate={}",
        pattern,
        input.escape_ascii().to_string(),
        actual,
        expected
    );
}

proptest! {
    #[test]
    fn streaming_equivalence(
        grammar in stock(),
        input in bytes(),
        cuts in prop::collection::vec(0usize..10, 0..4),
    ) {
        let mut memory = MatcherMemory::default();
        let whole = {
            let mut m = memory.matcher(grammar);
            m.chunk(&input);
            m.finish()
        };
        let mut sorted = cuts.clone();
        sorted.sort_unstable();
        prop_assert_eq!(run_bytewise(&mut memory, grammar, &input), whole);
        prop_assert_eq!(run_split(&mut memory, grammar, &input, &sorted), whole);
    }

    #[test]
    fn determinism(grammar in stock(), input in bytes()) {
        let mut memory = MatcherMemory::default();
        let first = run_bytewise(&mut memory, grammar, &input);
        for _ in 0..3 {
            prop_assert_eq!(run_bytewise(&mut memory, grammar, &input), first);
        }
    }

    #[test]
    fn states_released_after_any_prefix(
        grammar in stock(),
        input in bytes(),
        keep in 0usize..10,
        finish in any::<bool>(),
    ) {
        let mut memory = MatcherMemory::default();
        {
            let mut m = memory.matcher(grammar);
            m.chunk(&input[..keep.min(input.len())]);
            if finish {
                m.stop();
            }
        }
        prop_assert_eq!(memory.live_states(), 0);
    }

    #[test]
    fn failure_reported_iff_failed(grammar in stock(), input in bytes()) {
        let mut memory = MatcherMemory::default();
        let mut m = memory.matcher(grammar);
        m.chunk(&input);
        m.stop();
        prop_assert!(m.done());
        prop_assert_eq!(m.failure().is_none(), m.succeeded());
        if let Some(failure) = m.failure() {
            prop_assert!(failure.offset <= input.len());
        }
    }

    #[test]
    fn number_accepts_digit_strings(digits in "[0-9]{1,12}") {
        prop_assert!(NUMBER.is_match(digits.as_bytes()));
    }

    #[test]
    fn number_rejects_other_bytes(
        prefix in "[0-9]{0,4}",
        bad in "[^0-9]",
        suffix in "[0-9]{0,4}",
    ) {
        let input = format!("{prefix}{bad}{suffix}");
        prop_assert!(!NUMBER.is_match(input.as_bytes()));
    }

    #[test]
    fn a_plus_b_agrees_with_regex(input in prop::collection::vec(prop::sample::select(b"ab".to_vec()), 0..8)) {
        assert_matches_regex(&A_PLUS_B, r"^a+b$", &input);
    }

    #[test]
    fn spaces_agrees_with_regex(input in bytes()) {
        assert_matches_regex(&SPACES, r"^[ \t]+$", &input);
    }

    #[test]
    fn numbers_agrees_with_regex(input in bytes()) {
        assert_matches_regex(&NUMBERS, r"^[0-9]+([ \t]+[0-9]+)*$", &input);
    }

    #[test]
    fn numbers_accepts_generated_lists(
        items in prop::collection::vec(("[0-9]{1,3}", "[ \t]{1,2}"), 1..4),
    ) {
        let mut input = String::new();
        for (i, (number, sep)) in items.iter().enumerate() {
            if i > 0 {
                input.push_str(sep);
            }
            input.push_str(number);
        }
        prop_assert!(NUMBERS.is_match(input.as_bytes()), "rejected {:?}", input);
    }
}
