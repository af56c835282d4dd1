use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use backtrack_stream::{Grammar, MatcherMemory, grammars};

#[derive(Debug, Parser)]
#[command(name = "bts", version, about = "Match input against a stock grammar, one byte at a time")]
struct Cli {
    /// Log engine transitions (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Output DOT (Graphviz) representation of the grammar.
    Dot {
        #[arg(short, long, value_enum, default_value_t = Stock::Numbers)]
        grammar: Stock,
    },
    /// Match each input (or each line of stdin) against the grammar.
    Match {
        #[arg(short, long, value_enum, default_value_t = Stock::Numbers)]
        grammar: Stock,
        /// Feed input in chunks of N bytes (default: entire input at once).
        #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
        chunk_size: Option<u64>,
        /// Inputs to match; stdin is read line by line when omitted.
        inputs: Vec<String>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Stock {
    /// One or more `a` followed by `b`.
    APlusB,
    /// ("a" | "ab") ("bd" | "c").
    AbCd,
    /// Decimal digits.
    Number,
    /// Spaces and tabs.
    Spaces,
    /// Numbers separated by whitespace.
    Numbers,
    /// Binary trees of numbers, e.g. {1,{2,3}}.
    NumberTree,
}

impl Stock {
    fn grammar(self) -> &'static Grammar {
        match self {
            Self::APlusB => &grammars::A_PLUS_B,
            Self::AbCd => &grammars::AB_CD,
            Self::Number => &grammars::NUMBER,
            Self::Spaces => &grammars::SPACES,
            Self::Numbers => &grammars::NUMBERS,
            Self::NumberTree => &grammars::NUMBER_TREE,
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Run one session over `input`, printing the verdict.  Returns whether it
/// matched.
fn run_one(
    memory: &mut MatcherMemory,
    grammar: &Grammar,
    input: &[u8],
    chunk_size: Option<usize>,
    out: &mut impl Write,
) -> io::Result<bool> {
    let mut matcher = memory.matcher(grammar);
    match chunk_size {
        None => matcher.chunk(input),
        Some(cs) => {
            for chunk in input.chunks(cs) {
                matcher.chunk(chunk);
                tracing::debug!(
                    received = matcher.received(),
                    cursor = matcher.cursor(),
                    done = matcher.done(),
                    "chunk fed"
                );
            }
        }
    }
    matcher.stop();

    let shown = input.escape_ascii();
    if matcher.succeeded() {
        writeln!(out, "  \x1b[32mOK\x1b[0m    \"{shown}\"")?;
        return Ok(true);
    }
    match matcher.failure() {
        Some(failure) => writeln!(out, "  \x1b[31mFAIL\x1b[0m  \"{shown}\"  {failure}")?,
        None => writeln!(out, "  \x1b[31mFAIL\x1b[0m  \"{shown}\"")?,
    }
    Ok(false)
}

fn run_match(grammar: &Grammar, inputs: &[String], chunk_size: Option<usize>) -> io::Result<bool> {
    let mut memory = MatcherMemory::default();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut all_matched = true;

    if inputs.is_empty() {
        let stdin = io::stdin();
        let mut line = Vec::new();
        let mut input = stdin.lock();
        loop {
            line.clear();
            if input.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            all_matched &= run_one(&mut memory, grammar, &line, chunk_size, &mut out)?;
        }
    } else {
        for input in inputs {
            all_matched &= run_one(&mut memory, grammar, input.as_bytes(), chunk_size, &mut out)?;
        }
    }
    out.flush()?;
    Ok(all_matched)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Dot { grammar } => {
            let stdout = io::stdout();
            grammar.grammar().to_dot(stdout.lock()).map(|()| true)
        }
        Command::Match {
            grammar,
            chunk_size,
            inputs,
        } => run_match(grammar.grammar(), &inputs, chunk_size.map(|cs| cs as usize)),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}
