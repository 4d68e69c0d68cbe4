use regex::{Regex, RegexBuilder};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Duration, Instant, timeout_at};
use tracing::{trace, warn};

use worldsaver_core::{CoreError, Result};

/// Phrases that mean the console itself is unusable, whatever the caller waits for.
pub const KNOWN_ERRORS: &[&str] = &[
    "permission denied while trying to connect to the docker daemon",
    "error response from daemon",
    "the input device is not a tty",
];

#[derive(Debug, Clone)]
pub enum Pattern {
    /// Case-insensitive substring; stored lowercased.
    Text(String),
    Regex(Regex),
}

impl Pattern {
    pub fn text(text: &str) -> Self {
        Pattern::Text(text.to_lowercase())
    }

    pub fn regex(pattern: &str) -> Result<Self> {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map(Pattern::Regex)
            .map_err(|err| CoreError::config(format!("invalid pattern {pattern:?}: {err}")))
    }

    fn matches(&self, text: &str, lowered: &str) -> bool {
        match self {
            Pattern::Text(needle) => lowered.contains(needle.as_str()),
            Pattern::Regex(regex) => regex.is_match(text),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    Matched(usize),
    NoMatch,
}

#[derive(Debug, Clone)]
pub struct ExpectMatcher {
    known_errors: Vec<String>,
}

impl Default for ExpectMatcher {
    fn default() -> Self {
        Self::with_known_errors(KNOWN_ERRORS.iter().copied())
    }
}

impl ExpectMatcher {
    pub fn with_known_errors<'a>(phrases: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            known_errors: phrases.into_iter().map(str::to_lowercase).collect(),
        }
    }

    /// Waits until output received on `output` matches one of `candidates`.
    ///
    /// Text is matched across chunk boundaries within a line. Returns `NoMatch`
    /// when the deadline passes or the console goes away.
    pub async fn expect(
        &self,
        output: &mut broadcast::Receiver<String>,
        candidates: &[Pattern],
        timeout: Duration,
    ) -> Result<MatchResult> {
        let deadline = Instant::now() + timeout;
        let mut pending = String::new();

        loop {
            let chunk = match timeout_at(deadline, output.recv()).await {
                Err(_) => return Ok(MatchResult::NoMatch),
                Ok(Ok(chunk)) => chunk,
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "console output overflowed, some lines were skipped");
                    continue;
                }
                Ok(Err(RecvError::Closed)) => return Ok(MatchResult::NoMatch),
            };

            pending.push_str(&chunk);
            let lowered = pending.to_lowercase();

            if let Some(phrase) = self
                .known_errors
                .iter()
                .find(|phrase| lowered.contains(phrase.as_str()))
            {
                let line = pending
                    .lines()
                    .find(|line| line.to_lowercase().contains(phrase.as_str()))
                    .unwrap_or(phrase.as_str());
                return Err(CoreError::Console(line.trim().to_string()));
            }

            if let Some(index) = candidates
                .iter()
                .position(|candidate| candidate.matches(&pending, &lowered))
            {
                trace!(index, "console output matched");
                return Ok(MatchResult::Matched(index));
            }

            // candidates never span lines, so only the unterminated tail matters
            if let Some(newline) = pending.rfind('\n') {
                pending.drain(..=newline);
            }
        }
    }
}
