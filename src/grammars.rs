//! Stock grammars.
//!
//! Each grammar comes as a builder function, which adds its rules to any
//! [`GrammarBuilder`] and returns the root so grammars can be composed, and
//! as a lazily built process-wide [`Grammar`] that any number of matchers
//! may share.

use once_cell::sync::Lazy;

use crate::{Grammar, GrammarBuilder, Result, RuleIdx};

/// `a_plus_b = "ab" | "a" a_plus_b`: one or more `a` followed by `b`.
pub fn a_plus_b(b: &mut GrammarBuilder) -> Result<RuleIdx> {
    let root = b.declare();
    let a = b.literal("a")?;
    let ab = b.literal("ab")?;
    let more = b.sequence([a, root])?;
    b.define_alternation(root, [ab, more])?;
    Ok(root)
}

/// `("a" | "ab") ("bd" | "c")`: only matches when the sequence revisits
/// the choice made in its first part.
pub fn ab_cd(b: &mut GrammarBuilder) -> Result<RuleIdx> {
    let a = b.literal("a")?;
    let ab = b.literal("ab")?;
    let bd = b.literal("bd")?;
    let c = b.literal("c")?;
    let first = b.alternation([a, ab])?;
    let second = b.alternation([bd, c])?;
    b.sequence([first, second])
}

/// A single decimal digit.
pub fn digit(b: &mut GrammarBuilder) -> Result<RuleIdx> {
    let digits = b"1234567890"
        .iter()
        .map(|&d| b.literal([d]))
        .collect::<Result<Vec<_>>>()?;
    b.alternation(digits)
}

/// `number = digit number | digit`: one or more decimal digits.
pub fn number(b: &mut GrammarBuilder) -> Result<RuleIdx> {
    let number = b.declare();
    let digit = digit(b)?;
    let more = b.sequence([digit, number])?;
    b.define_alternation(number, [more, digit])?;
    Ok(number)
}

/// One or more spaces or tabs.
pub fn spaces(b: &mut GrammarBuilder) -> Result<RuleIdx> {
    let spaces = b.declare();
    let space = b.literal(" ")?;
    let tab = b.literal("\t")?;
    let ws = b.alternation([space, tab])?;
    let more = b.sequence([ws, spaces])?;
    b.define_alternation(spaces, [more, ws])?;
    Ok(spaces)
}

/// Numbers separated by whitespace runs.
pub fn numbers(b: &mut GrammarBuilder) -> Result<RuleIdx> {
    let number = number(b)?;
    let spaces = spaces(b)?;
    b.separated_by(number, spaces)
}

/// Binary trees of numbers: `{1,{22,333}}`.
pub fn number_tree(b: &mut GrammarBuilder) -> Result<RuleIdx> {
    let number = number(b)?;
    b.tree_of(number)
}

fn build(rules: fn(&mut GrammarBuilder) -> Result<RuleIdx>) -> Grammar {
    let mut b = GrammarBuilder::new();
    rules(&mut b)
        .and_then(|root| b.build(root))
        .expect("stock grammar is well-formed")
}

pub static A_PLUS_B: Lazy<Grammar> = Lazy::new(|| build(a_plus_b));
pub static AB_CD: Lazy<Grammar> = Lazy::new(|| build(ab_cd));
pub static NUMBER: Lazy<Grammar> = Lazy::new(|| build(number));
pub static SPACES: Lazy<Grammar> = Lazy::new(|| build(spaces));
pub static NUMBERS: Lazy<Grammar> = Lazy::new(|| build(numbers));
pub static NUMBER_TREE: Lazy<Grammar> = Lazy::new(|| build(number_tree));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MatcherMemory;

    fn check(grammar: &Grammar, accept: &[&str], reject: &[&str]) {
        let mut memory = MatcherMemory::default();
        for input in accept {
            let mut m = memory.matcher(grammar);
            m.chunk(input.as_bytes());
            assert!(m.finish(), "expected match for {:?}", input);
            assert_eq!(memory.live_states(), 0);
        }
        for input in reject {
            let mut m = memory.matcher(grammar);
            m.chunk(input.as_bytes());
            assert!(!m.finish(), "expected no match for {:?}", input);
            assert_eq!(memory.live_states(), 0);
        }
    }

    #[test]
    fn test_a_plus_b() {
        check(&A_PLUS_B, &["ab", "aaab"], &["b", "aaa", "", "aab!"]);
    }

    #[test]
    fn test_ab_cd() {
        check(&AB_CD, &["abd", "ac", "abbd", "abc"], &["abcd", "ab", "c"]);
    }

    #[test]
    fn test_number() {
        check(
            &NUMBER,
            &["0", "907", "1234567890", "00"],
            &["", "12a", "a12", "-1", "1 2"],
        );
    }

    #[test]
    fn test_spaces() {
        check(&SPACES, &[" ", "\t", " \t  \t"], &["", "x", " x", "  \n"]);
    }

    #[test]
    fn test_numbers() {
        check(
            &NUMBERS,
            &["1", "12 345", "1\t2  3", "10 \t 20 30"],
            &["", " 1", "1 ", "1  ", "1,2", "1 a"],
        );
    }

    #[test]
    fn test_number_tree() {
        check(
            &NUMBER_TREE,
            &["7", "{1,2}", "{12,{3,45}}", "{{1,2},{3,{4,5}}}"],
            &["", "{", "{1}", "{1,2", "{1,2,3}", "{,}", "{1,2}}", "{1,2}3"],
        );
    }

    #[test]
    fn test_stock_grammars_are_shared() {
        let grammar: &'static Grammar = &NUMBER;
        let handles: Vec<_> = (0..4)
            .map(|i| {
                std::thread::spawn(move || {
                    let input = "9".repeat(i + 1);
                    grammar.is_match(input.as_bytes())
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }

    #[test]
    fn test_composed_grammars_build() {
        let mut b = GrammarBuilder::new();
        let number = number(&mut b).unwrap();
        let spaces = spaces(&mut b).unwrap();
        let list = b.separated_by(number, spaces).unwrap();
        let tree = b.tree_of(list).unwrap();
        let grammar = b.build(tree).unwrap();
        assert!(grammar.is_match(b"{1 2,3}"));
        assert!(!grammar.is_match(b"{1 2,3"));
    }
}
