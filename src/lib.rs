//! Incremental backtracking matcher for literal / alternation / sequence
//! grammars.
//!
//! A grammar is built from three primitives:
//!
//! - [`Rule::Literal`]: a non-empty byte string,
//! - [`Rule::Alternation`]: ordered choice, the first alternative that leads
//!   to a full match wins,
//! - [`Rule::Sequence`]: concatenation, every part must match in order.
//!
//! Rules reference each other through [`RuleIdx`] handles into the
//! [`Grammar`] arena, so grammars may be recursive (but not left-recursive,
//! see [`Error::LeftRecursive`]).
//!
//! # Architecture
//!
//! Matching does not use the call stack.  Each rule instance being tried is
//! a `State` node in an explicit derivation tree:
//!
//! ```text
//!   Sequence(progress=1) ──┬── Alternation(progress=0) ── Literal "a"  (done)
//!                          └── Alternation(progress=1) ── Literal "c"  <- active
//! ```
//!
//! Exactly one `Literal` node is active at a time.  Every fed byte is
//! compared against the active literal's next expected byte:
//!
//! - on a match the literal's `progress` and the input cursor both move
//!   forward, and once the literal is complete the matcher *advances* to
//!   the next part of the nearest unfinished sequence;
//! - on a mismatch the matcher *backtracks*: it walks towards the root until
//!   it finds an alternation with an untried alternative, rewinds the cursor
//!   to where that alternation started and *descends* into the next
//!   alternative.  A sequence that is not on its first part re-enters the
//!   previous part, so choice points nested in earlier parts are revisited
//!   too.
//!
//! Because the tree is explicit, matching can stop after any byte and resume
//! when the next one arrives ([`Matcher::feed`]).  Bytes are buffered for the
//! lifetime of a session since backtracking may reread any of them.
//!
//! Once the driver has no more input it calls [`Matcher::stop`], which keeps
//! backtracking until some derivation consumes exactly the buffered input or
//! every alternative is exhausted.
//!
//! There is no memoization: pathological grammars can force exponential
//! re-exploration of the same `(rule, offset)` pairs.

use std::fmt;
use std::io::{self, Write};
use std::ops::{Index, IndexMut};

use indexmap::IndexSet;
use thiserror::Error;
use tracing::{debug, trace};

pub mod grammars;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// An error returned while constructing a [`Grammar`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("literal must contain at least one byte")]
    EmptyLiteral,
    #[error("{0} must have at least one child")]
    NoChildren(RuleKind),
    #[error("literal of {len} bytes exceeds the limit of {max}")]
    LiteralTooLong { len: usize, max: usize },
    #[error("{kind} with {count} children exceeds the limit of {max}")]
    TooManyChildren {
        kind: RuleKind,
        count: usize,
        max: usize,
    },
    #[error("rule {0} does not exist in this grammar")]
    UnknownRule(RuleIdx),
    #[error("rule {0} was declared but never defined")]
    Undefined(RuleIdx),
    #[error("rule {0} is already defined")]
    Redefined(RuleIdx),
    /// A rule can reach itself without consuming any input.  Descending
    /// into such a rule would never reach a literal.
    #[error("rule {0} is left-recursive")]
    LeftRecursive(RuleIdx),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Grammar model
// ---------------------------------------------------------------------------

/// Default bound on literal length and on the number of children of an
/// alternation or sequence.
pub const DEFAULT_CAPACITY: usize = 128;

/// Handle of a rule inside a [`Grammar`] (or a [`GrammarBuilder`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleIdx(u32);

impl RuleIdx {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RuleIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three rule shapes, used in error messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Literal,
    Alternation,
    Sequence,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Literal => "literal",
            Self::Alternation => "alternation",
            Self::Sequence => "sequence",
        })
    }
}

/// A single grammar rule.  Immutable once the grammar is built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rule {
    /// Match these bytes exactly.
    Literal(Box<[u8]>),
    /// Try each alternative in order.
    Alternation(Box<[RuleIdx]>),
    /// Match every part, one after the other.
    Sequence(Box<[RuleIdx]>),
}

impl Rule {
    pub fn kind(&self) -> RuleKind {
        match self {
            Self::Literal(_) => RuleKind::Literal,
            Self::Alternation(_) => RuleKind::Alternation,
            Self::Sequence(_) => RuleKind::Sequence,
        }
    }

    /// Child rules; empty for a literal.
    pub fn children(&self) -> &[RuleIdx] {
        match self {
            Self::Literal(_) => &[],
            Self::Alternation(rules) | Self::Sequence(rules) => rules,
        }
    }

    /// Children that can start at the same offset as this rule.  Every
    /// alternative does, but only the first part of a sequence (literals
    /// are never empty).
    fn leftmost(&self) -> &[RuleIdx] {
        match self {
            Self::Literal(_) => &[],
            Self::Alternation(alts) => alts,
            Self::Sequence(parts) => &parts[..1],
        }
    }
}

/// Capacity bounds enforced by [`GrammarBuilder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Longest accepted [`Rule::Literal`], in bytes.
    pub max_literal_len: usize,
    /// Most children accepted in one alternation or sequence.
    pub max_children: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_literal_len: DEFAULT_CAPACITY,
            max_children: DEFAULT_CAPACITY,
        }
    }
}

/// Builds a [`Grammar`] rule by rule.
///
/// Rules are appended to an arena and referred to by [`RuleIdx`].  A
/// recursive rule is first reserved with [`declare`](Self::declare), used as
/// a child of other rules, then patched with one of the `define_*` methods:
///
/// ```
/// use backtrack_stream::GrammarBuilder;
///
/// // list = "x" "," list | "x"
/// let mut b = GrammarBuilder::new();
/// let list = b.declare();
/// let x = b.literal("x")?;
/// let comma = b.literal(",")?;
/// let more = b.sequence([x, comma, list])?;
/// b.define_alternation(list, [more, x])?;
/// let grammar = b.build(list)?;
/// assert!(grammar.is_match(b"x,x,x"));
/// # Ok::<(), backtrack_stream::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct GrammarBuilder {
    limits: Limits,
    /// `None` marks a declared slot that is not defined yet.
    rules: Vec<Option<Rule>>,
}

impl GrammarBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            limits,
            rules: Vec::new(),
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Reserve a rule slot to be defined later.
    pub fn declare(&mut self) -> RuleIdx {
        let idx = RuleIdx(self.rules.len() as u32);
        self.rules.push(None);
        idx
    }

    pub fn literal(&mut self, bytes: impl AsRef<[u8]>) -> Result<RuleIdx> {
        let rule = self.check_literal(bytes.as_ref())?;
        Ok(self.push(rule))
    }

    pub fn alternation(&mut self, alternatives: impl AsRef<[RuleIdx]>) -> Result<RuleIdx> {
        let rules = self.check_children(RuleKind::Alternation, alternatives.as_ref())?;
        Ok(self.push(Rule::Alternation(rules)))
    }

    pub fn sequence(&mut self, parts: impl AsRef<[RuleIdx]>) -> Result<RuleIdx> {
        let rules = self.check_children(RuleKind::Sequence, parts.as_ref())?;
        Ok(self.push(Rule::Sequence(rules)))
    }

    pub fn define_literal(&mut self, slot: RuleIdx, bytes: impl AsRef<[u8]>) -> Result<()> {
        let rule = self.check_literal(bytes.as_ref())?;
        self.define(slot, rule)
    }

    pub fn define_alternation(
        &mut self,
        slot: RuleIdx,
        alternatives: impl AsRef<[RuleIdx]>,
    ) -> Result<()> {
        let rules = self.check_children(RuleKind::Alternation, alternatives.as_ref())?;
        self.define(slot, Rule::Alternation(rules))
    }

    pub fn define_sequence(&mut self, slot: RuleIdx, parts: impl AsRef<[RuleIdx]>) -> Result<()> {
        let rules = self.check_children(RuleKind::Sequence, parts.as_ref())?;
        self.define(slot, Rule::Sequence(rules))
    }

    /// `list = item sep list | item`: one or more `item`s separated by
    /// `sep`.
    pub fn separated_by(&mut self, item: RuleIdx, sep: RuleIdx) -> Result<RuleIdx> {
        let list = self.declare();
        let more = self.sequence([item, sep, list])?;
        self.define_alternation(list, [more, item])?;
        Ok(list)
    }

    /// `tree = item | "{" tree "," tree "}"`: binary trees with `item`
    /// leaves.
    pub fn tree_of(&mut self, item: RuleIdx) -> Result<RuleIdx> {
        let tree = self.declare();
        let open = self.literal("{")?;
        let comma = self.literal(",")?;
        let close = self.literal("}")?;
        let node = self.sequence([open, tree, comma, tree, close])?;
        self.define_alternation(tree, [item, node])?;
        Ok(tree)
    }

    /// Freeze the rules into a [`Grammar`] rooted at `root`.
    ///
    /// Fails if a declared slot was never defined or if any rule is
    /// left-recursive.
    pub fn build(self, root: RuleIdx) -> Result<Grammar> {
        if root.idx() >= self.rules.len() {
            return Err(Error::UnknownRule(root));
        }
        let rules = self
            .rules
            .into_iter()
            .enumerate()
            .map(|(i, rule)| rule.ok_or(Error::Undefined(RuleIdx(i as u32))))
            .collect::<Result<Box<[Rule]>>>()?;
        check_left_recursion(&rules)?;
        debug!(rules = rules.len(), %root, "grammar built");
        Ok(Grammar { rules, root })
    }

    fn push(&mut self, rule: Rule) -> RuleIdx {
        let idx = RuleIdx(self.rules.len() as u32);
        self.rules.push(Some(rule));
        idx
    }

    fn define(&mut self, slot: RuleIdx, rule: Rule) -> Result<()> {
        match self.rules.get_mut(slot.idx()) {
            None => Err(Error::UnknownRule(slot)),
            Some(Some(_)) => Err(Error::Redefined(slot)),
            Some(entry) => {
                *entry = Some(rule);
                Ok(())
            }
        }
    }

    fn check_literal(&self, bytes: &[u8]) -> Result<Rule> {
        if bytes.is_empty() {
            return Err(Error::EmptyLiteral);
        }
        if bytes.len() > self.limits.max_literal_len {
            return Err(Error::LiteralTooLong {
                len: bytes.len(),
                max: self.limits.max_literal_len,
            });
        }
        Ok(Rule::Literal(bytes.into()))
    }

    fn check_children(&self, kind: RuleKind, rules: &[RuleIdx]) -> Result<Box<[RuleIdx]>> {
        if rules.is_empty() {
            return Err(Error::NoChildren(kind));
        }
        if rules.len() > self.limits.max_children {
            return Err(Error::TooManyChildren {
                kind,
                count: rules.len(),
                max: self.limits.max_children,
            });
        }
        if let Some(&unknown) = rules.iter().find(|r| r.idx() >= self.rules.len()) {
            return Err(Error::UnknownRule(unknown));
        }
        Ok(rules.into())
    }
}

/// Reject grammars where a rule reaches itself through leftmost children
/// only.  Iterative depth-first search; a child found on the current path
/// closes a cycle.
fn check_left_recursion(rules: &[Rule]) -> Result<()> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Unvisited,
        OnPath,
        Finished,
    }

    let mut marks = vec![Mark::Unvisited; rules.len()];
    let mut stack: Vec<(RuleIdx, usize)> = Vec::new();
    for first in 0..rules.len() {
        if marks[first] != Mark::Unvisited {
            continue;
        }
        marks[first] = Mark::OnPath;
        stack.push((RuleIdx(first as u32), 0));
        while let Some(&(rule, next)) = stack.last() {
            match rules[rule.idx()].leftmost().get(next) {
                Some(&child) => {
                    let top = stack.len() - 1;
                    stack[top].1 += 1;
                    match marks[child.idx()] {
                        Mark::OnPath => return Err(Error::LeftRecursive(child)),
                        Mark::Unvisited => {
                            marks[child.idx()] = Mark::OnPath;
                            stack.push((child, 0));
                        }
                        Mark::Finished => {}
                    }
                }
                None => {
                    marks[rule.idx()] = Mark::Finished;
                    stack.pop();
                }
            }
        }
    }
    Ok(())
}

/// A validated, immutable grammar.
///
/// A `Grammar` is never mutated after [`GrammarBuilder::build`], so it can
/// be shared by reference between any number of [`Matcher`]s, including
/// across threads.
#[derive(Debug)]
pub struct Grammar {
    rules: Box<[Rule]>,
    root: RuleIdx,
}

impl Grammar {
    pub fn root(&self) -> RuleIdx {
        self.root
    }

    /// Number of rules, including ones unreachable from the root.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Run a one-shot session over `input`.
    pub fn is_match(&self, input: &[u8]) -> bool {
        let mut memory = MatcherMemory::default();
        let mut matcher = memory.matcher(self);
        matcher.chunk(input);
        matcher.finish()
    }

    /// Emit a Graphviz DOT representation of the rule graph.
    ///
    /// Alternations are drawn as `|` nodes, sequences as `+` nodes, each
    /// edge labelled with the child's position.  The root has a double
    /// border.
    pub fn to_dot(&self, mut out: impl Write) -> io::Result<()> {
        writeln!(out, "digraph grammar {{")?;
        writeln!(out, "\trankdir=LR;")?;
        writeln!(out, "\t{} [peripheries=2];", self.root)?;
        for (i, rule) in self.rules.iter().enumerate() {
            match rule {
                Rule::Literal(bytes) => {
                    writeln!(out, "\t{} [shape=box, label=\"{}\"];", i, bytes.escape_ascii())?;
                }
                Rule::Alternation(_) | Rule::Sequence(_) => {
                    let label = if rule.kind() == RuleKind::Alternation { "|" } else { "+" };
                    writeln!(out, "\t{} [label=\"{}\"];", i, label)?;
                    for (n, child) in rule.children().iter().enumerate() {
                        writeln!(out, "\t{} -> {} [label=\"{}\"];", i, child, n)?;
                    }
                }
            }
        }
        writeln!(out, "}}")
    }
}

/// `grammar[rule_idx]`: typed access to the rule arena.
impl Index<RuleIdx> for Grammar {
    type Output = Rule;

    #[inline]
    fn index(&self, idx: RuleIdx) -> &Rule {
        &self.rules[idx.idx()]
    }
}

// ---------------------------------------------------------------------------
// Derivation tree
// ---------------------------------------------------------------------------

/// Index into the [`StatePool`] arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct StateIdx(u32);

impl StateIdx {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StateIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One rule instance under consideration.
#[derive(Clone, Debug)]
struct State {
    rule: RuleIdx,
    /// Literal: bytes matched so far.  Sequence: index of the active part.
    /// Alternation: index of the alternative being tried.
    progress: usize,
    /// Input offset where this instance started matching.
    start: usize,
    /// Owned children, indexed by part / alternative.  Grown lazily, only
    /// for branches actually attempted.
    children: Vec<Option<StateIdx>>,
    /// Non-owning back reference.  While the state sits on the free list
    /// this links to the next free state instead.
    parent: Option<StateIdx>,
}

/// Arena of [`State`]s for one session.
///
/// Freed states are threaded into an intrusive free list through their
/// `parent` field and recycled by later allocations, keeping the capacity
/// of their `children` vectors.
#[derive(Debug, Default)]
struct StatePool {
    states: Vec<State>,
    free_head: Option<StateIdx>,
    /// States allocated and not yet freed.
    live: usize,
    /// Work list for [`free_tree`](Self::free_tree), kept to reuse its
    /// allocation.
    scratch: Vec<StateIdx>,
}

impl StatePool {
    /// Allocate a state, reusing a freed slot if available.
    fn alloc(&mut self, rule: RuleIdx, start: usize, parent: Option<StateIdx>) -> StateIdx {
        self.live += 1;
        match self.free_head {
            Some(idx) => {
                let state = &mut self.states[idx.idx()];
                self.free_head = state.parent;
                debug_assert!(state.children.is_empty());
                state.rule = rule;
                state.progress = 0;
                state.start = start;
                state.parent = parent;
                idx
            }
            None => {
                let idx = StateIdx(self.states.len() as u32);
                self.states.push(State {
                    rule,
                    progress: 0,
                    start,
                    children: Vec::new(),
                    parent,
                });
                idx
            }
        }
    }

    /// Return `idx` and all of its live descendants to the free list.
    fn free_tree(&mut self, idx: StateIdx) {
        let mut stack = std::mem::take(&mut self.scratch);
        stack.push(idx);
        while let Some(s) = stack.pop() {
            let state = &mut self.states[s.idx()];
            stack.extend(state.children.drain(..).flatten());
            state.parent = self.free_head;
            self.free_head = Some(s);
            self.live -= 1;
        }
        self.scratch = stack;
    }

    fn set_child(&mut self, parent: StateIdx, slot: usize, child: StateIdx) {
        let children = &mut self.states[parent.idx()].children;
        if children.len() <= slot {
            children.resize(slot + 1, None);
        }
        children[slot] = Some(child);
    }

    fn child(&self, parent: StateIdx, slot: usize) -> Option<StateIdx> {
        self.states[parent.idx()].children.get(slot).copied().flatten()
    }

    /// Empty a child slot without freeing what it pointed to.
    fn clear_child(&mut self, parent: StateIdx, slot: usize) {
        if let Some(entry) = self.states[parent.idx()].children.get_mut(slot) {
            *entry = None;
        }
    }

    fn root_of(&self, mut idx: StateIdx) -> StateIdx {
        while let Some(parent) = self[idx].parent {
            idx = parent;
        }
        idx
    }

    /// Drop every state, keeping the arena's capacity.
    fn reset(&mut self) {
        self.states.clear();
        self.free_head = None;
        self.live = 0;
    }
}

/// `pool[state_idx]`: typed access to the state arena.
impl Index<StateIdx> for StatePool {
    type Output = State;

    #[inline]
    fn index(&self, idx: StateIdx) -> &State {
        &self.states[idx.idx()]
    }
}

impl IndexMut<StateIdx> for StatePool {
    #[inline]
    fn index_mut(&mut self, idx: StateIdx) -> &mut State {
        &mut self.states[idx.idx()]
    }
}

// ---------------------------------------------------------------------------
// Input buffer
// ---------------------------------------------------------------------------

/// Every byte received in a session, plus the offset of the next byte to
/// match.  Nothing is ever discarded: backtracking may rewind the cursor to
/// any earlier offset.
#[derive(Debug, Default)]
struct InputBuffer {
    bytes: Vec<u8>,
    cursor: usize,
}

impl InputBuffer {
    fn append(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    fn total(&self) -> usize {
        self.bytes.len()
    }

    /// The byte under the cursor, if it has been received.
    fn pending(&self) -> Option<u8> {
        self.bytes.get(self.cursor).copied()
    }

    fn consume(&mut self) {
        debug_assert!(self.cursor < self.bytes.len());
        self.cursor += 1;
    }

    fn rewind(&mut self, offset: usize) {
        debug_assert!(offset <= self.cursor);
        self.cursor = offset;
    }

    fn clear(&mut self) {
        self.bytes.clear();
        self.cursor = 0;
    }
}

// ---------------------------------------------------------------------------
// Failure diagnostics
// ---------------------------------------------------------------------------

/// Where and why a session failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    /// Furthest input offset reached by any derivation.
    pub offset: usize,
    /// Literals that failed to match at `offset`, in the order they were
    /// tried.  Empty when a derivation completed at `offset` but more input
    /// followed.
    pub expected: Vec<Box<[u8]>>,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at byte {}: expected ", self.offset)?;
        if self.expected.is_empty() {
            return f.write_str("end of input");
        }
        if self.expected.len() > 1 {
            f.write_str("one of ")?;
        }
        for (i, literal) in self.expected.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "\"{}\"", literal.escape_ascii())?;
        }
        Ok(())
    }
}

/// Records the furthest offset at which a literal failed and which
/// literals failed there.
#[derive(Debug, Default)]
struct FailureTracker {
    offset: usize,
    expected: IndexSet<RuleIdx>,
}

impl FailureTracker {
    fn record(&mut self, offset: usize, rule: RuleIdx) {
        if offset > self.offset {
            self.offset = offset;
            self.expected.clear();
        }
        if offset == self.offset {
            self.expected.insert(rule);
        }
    }

    fn clear(&mut self) {
        self.offset = 0;
        self.expected.clear();
    }
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

/// Reusable memory for [`Matcher`].  Create once, call
/// [`matcher`](Self::matcher) for each session.
#[derive(Debug, Default)]
pub struct MatcherMemory {
    pool: StatePool,
    input: InputBuffer,
    failures: FailureTracker,
}

impl MatcherMemory {
    /// Start a new session matching against `grammar`.
    pub fn matcher<'a>(&'a mut self, grammar: &'a Grammar) -> Matcher<'a> {
        self.pool.reset();
        self.input.clear();
        self.failures.clear();

        let mut m = Matcher {
            rules: &grammar.rules,
            pool: &mut self.pool,
            input: &mut self.input,
            failures: &mut self.failures,
            pos: None,
            completed: false,
        };
        m.descend(grammar.root);
        m
    }

    /// Number of derivation-tree states currently allocated.  Returns to
    /// zero once a session is dropped.
    pub fn live_states(&self) -> usize {
        self.pool.live
    }
}

/// One matching session: an explicit derivation tree driven one byte at a
/// time.
///
/// Protocol: any number of [`feed`](Self::feed) calls, then one
/// [`stop`](Self::stop), after which [`succeeded`](Self::succeeded) is
/// authoritative.  Dropping the matcher at any point releases its whole
/// derivation tree.
#[derive(Debug)]
pub struct Matcher<'a> {
    rules: &'a [Rule],
    pool: &'a mut StatePool,
    input: &'a mut InputBuffer,
    failures: &'a mut FailureTracker,
    /// The active literal state, or `None` once the session is done.
    pos: Option<StateIdx>,
    /// Set when the root rule fully matched (as opposed to running out of
    /// alternatives).
    completed: bool,
}

impl Matcher<'_> {
    /// Instantiate `rule` at the cursor under the current position, then
    /// keep choosing the first child until a literal is reached.  That
    /// literal becomes the active position.
    fn descend(&mut self, mut rule: RuleIdx) {
        let rules = self.rules;
        let start = self.input.cursor;
        loop {
            let state = self.pool.alloc(rule, start, self.pos);
            if let Some(parent) = self.pos {
                let slot = self.pool[parent].progress;
                self.pool.set_child(parent, slot, state);
            }
            self.pos = Some(state);
            trace!(%rule, %state, start, "descend");
            match &rules[rule.idx()] {
                Rule::Literal(_) => return,
                Rule::Alternation(children) | Rule::Sequence(children) => rule = children[0],
            }
        }
    }

    /// The active literal is complete: move on to the next part of the
    /// closest sequence that still has parts left.  Completed states stay
    /// attached so that later backtracking can re-enter them.  Completing
    /// the root ends the session.
    fn advance(&mut self) {
        let rules = self.rules;
        while let Some(idx) = self.pos {
            let State {
                rule,
                progress,
                parent,
                ..
            } = self.pool[idx];
            if let Rule::Sequence(parts) = &rules[rule.idx()]
                && progress + 1 < parts.len()
            {
                self.pool[idx].progress += 1;
                trace!(%rule, %idx, part = progress + 1, "advance");
                self.descend(parts[progress + 1]);
                return;
            }
            self.pos = parent;
            if parent.is_none() {
                self.pool.free_tree(idx);
                self.completed = true;
                debug!(consumed = self.input.cursor, "root rule matched");
            }
        }
    }

    /// Abandon the current derivation and resume at the nearest choice
    /// point with an untried alternative.
    fn backtrack(&mut self) {
        let rules = self.rules;
        while let Some(idx) = self.pos {
            let State {
                rule,
                progress,
                start,
                parent,
                ..
            } = self.pool[idx];
            // The child in this slot has failed and was already freed.
            self.pool.clear_child(idx, progress);
            match &rules[rule.idx()] {
                Rule::Alternation(alts) if progress + 1 < alts.len() => {
                    self.pool[idx].progress += 1;
                    self.input.rewind(start);
                    trace!(%rule, %idx, alternative = progress + 1, start, "backtrack");
                    self.descend(alts[progress + 1]);
                    return;
                }
                Rule::Sequence(_) if progress > 0 => {
                    // Re-enter the previous part at its deepest state and
                    // keep backtracking from there.
                    self.pool[idx].progress -= 1;
                    self.pos = Some(self.deepest_live(idx));
                }
                _ => {
                    self.pos = parent;
                    self.pool.free_tree(idx);
                }
            }
        }
        debug!("all derivations exhausted");
    }

    /// Follow the active child of each state down from `idx`.
    fn deepest_live(&self, mut idx: StateIdx) -> StateIdx {
        while let Some(child) = self.pool.child(idx, self.pool[idx].progress) {
            idx = child;
        }
        idx
    }

    /// Compare the active literal against the byte under the cursor.
    fn step(&mut self) {
        let (Some(idx), Some(byte)) = (self.pos, self.input.pending()) else {
            return;
        };
        let state = &self.pool[idx];
        let Rule::Literal(bytes) = &self.rules[state.rule.idx()] else {
            unreachable!("active state {idx} is not a literal");
        };
        if bytes[state.progress] != byte {
            self.failures.record(self.input.cursor, state.rule);
            self.backtrack();
            return;
        }
        let len = bytes.len();
        self.input.consume();
        let state = &mut self.pool[idx];
        state.progress += 1;
        if state.progress == len {
            self.advance();
        }
    }

    /// Step until the buffered input is consumed or the session is done.
    /// Backtracking may rewind the cursor, so already-buffered bytes can be
    /// stepped over more than once.
    fn drain(&mut self) {
        while self.pos.is_some() && self.input.pending().is_some() {
            self.step();
        }
    }

    /// Append one byte of input and match as far as possible.
    ///
    /// Once the session is [`done`](Self::done) the byte is only recorded,
    /// so trailing input after a completed match makes it fail.
    pub fn feed(&mut self, byte: u8) {
        self.input.append(byte);
        self.drain();
    }

    /// Feed an entire byte slice through the matcher, one byte at a time.
    pub fn chunk(&mut self, input: &[u8]) {
        for &b in input {
            self.feed(b);
        }
    }

    /// Signal end of input.  The literal waiting for more bytes cannot
    /// match, so keep backtracking until a derivation consumes exactly the
    /// buffered input or none is left.
    pub fn stop(&mut self) {
        while let Some(idx) = self.pos {
            self.failures.record(self.input.cursor, self.pool[idx].rule);
            self.backtrack();
            self.drain();
        }
        debug!(
            succeeded = self.succeeded(),
            received = self.input.total(),
            "session stopped"
        );
    }

    /// Signal end of input and return the final verdict.
    pub fn finish(mut self) -> bool {
        self.stop();
        self.succeeded()
    }

    /// `true` once no derivation is in progress, either because the root
    /// matched or because every alternative was exhausted.
    pub fn done(&self) -> bool {
        self.pos.is_none()
    }

    /// `true` if the root rule matched the entire input received so far.
    ///
    /// Running out of alternatives is a failure even when the cursor
    /// happens to sit at the end of the input.
    pub fn succeeded(&self) -> bool {
        self.completed && self.input.cursor == self.input.total()
    }

    /// Bytes received so far.
    pub fn received(&self) -> usize {
        self.input.total()
    }

    /// Offset of the next byte to match.
    pub fn cursor(&self) -> usize {
        self.input.cursor
    }

    /// Why the session failed, or `None` if it has not (yet) failed.
    pub fn failure(&self) -> Option<Failure> {
        if !self.done() || self.succeeded() {
            return None;
        }
        if self.completed && self.input.cursor >= self.failures.offset {
            return Some(Failure {
                offset: self.input.cursor,
                expected: Vec::new(),
            });
        }
        let expected = self
            .failures
            .expected
            .iter()
            .filter_map(|&rule| match &self.rules[rule.idx()] {
                Rule::Literal(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect();
        Some(Failure {
            offset: self.failures.offset,
            expected,
        })
    }
}

impl Drop for Matcher<'_> {
    fn drop(&mut self) {
        if let Some(idx) = self.pos.take() {
            let root = self.pool.root_of(idx);
            self.pool.free_tree(root);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
