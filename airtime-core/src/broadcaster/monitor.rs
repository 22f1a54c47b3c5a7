//! Per-destination status inferred from the engine's diagnostic output.
//!
//! Each destination moves at most once, from `not_started` to either `started` or `failed`.
//! Lines are matched against an ordered rule list; the first rule that matches decides.

use futures::StreamExt;
use regex::Regex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::DiagnosticStream;
use super::types::{Destination, DestinationStatus};

const SLAVE_GROUP: &str = "slave";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleFamily {
    Failure,
    Progress,
}

impl RuleFamily {
    pub fn status(self) -> DestinationStatus {
        match self {
            RuleFamily::Failure => DestinationStatus::Failed,
            RuleFamily::Progress => DestinationStatus::Started,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierRule {
    name: String,
    pattern: Regex,
    family: RuleFamily,
    labelled_only: bool,
}

impl ClassifierRule {
    /// A pattern with a `slave` capture group attributes its match to the tee output at that
    /// position instead of relying on a URL in the line.
    pub fn new(name: impl Into<String>, pattern: &str, family: RuleFamily) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            pattern: Regex::new(pattern)?,
            family,
            labelled_only: false,
        })
    }

    /// Restricts the rule to lines that name a destination. Such a line never counts as
    /// unlabelled progress.
    pub fn labelled_only(mut self) -> Self {
        self.labelled_only = true;
        self
    }

    pub fn is_labelled_only(&self) -> bool {
        self.labelled_only
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family(&self) -> RuleFamily {
        self.family
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.pattern.is_match(line)
    }

    fn slave_position(&self, line: &str) -> Option<usize> {
        self.pattern
            .captures(line)
            .and_then(|captures| captures.name(SLAVE_GROUP))
            .and_then(|value| value.as_str().parse().ok())
    }
}

#[derive(Debug, Clone)]
pub struct LogClassifier {
    rules: Vec<ClassifierRule>,
}

impl Default for LogClassifier {
    fn default() -> Self {
        Self::default_rules()
    }
}

impl LogClassifier {
    pub fn new(rules: Vec<ClassifierRule>) -> Self {
        Self { rules }
    }

    pub fn default_rules() -> Self {
        let builtin = |name: &str, pattern: &str, family| {
            ClassifierRule::new(name, pattern, family).expect("valid regex")
        };
        Self::new(vec![
            builtin(
                "tee_slave_failed",
                r"Slave muxer #(?P<slave>\d+) failed",
                RuleFamily::Failure,
            ),
            builtin(
                "server_error",
                r"(?i)(?:server returned|http error)\s+[45]\d\d|\berror\s+5\d\d\b",
                RuleFamily::Failure,
            ),
            builtin("connection_refused", r"(?i)connection refused", RuleFamily::Failure),
            builtin(
                "not_found",
                r"(?i)not found|(?:^|[^=\s\d])\s*\b404\b",
                RuleFamily::Failure,
            ),
            builtin(
                "connect_failed",
                r"(?i)failed to connect|cannot open connection|connection timed out",
                RuleFamily::Failure,
            ),
            builtin(
                "encoding_progress",
                r"(?:frame|size)=\s*\S+.*\btime=",
                RuleFamily::Progress,
            ),
            builtin("stop_hint", r"Press \[q\] to stop", RuleFamily::Progress).labelled_only(),
        ])
    }

    pub fn rules(&self) -> &[ClassifierRule] {
        &self.rules
    }

    pub fn classify(&self, line: &str) -> Option<&ClassifierRule> {
        self.rules.iter().find(|rule| rule.is_match(line))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationEntry {
    pub destination: Destination,
    pub status: DestinationStatus,
}

/// Destinations in output order with their current status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DestinationTable {
    entries: Vec<DestinationEntry>,
}

impl DestinationTable {
    pub fn new(destinations: &[Destination]) -> Self {
        Self {
            entries: destinations
                .iter()
                .map(|destination| DestinationEntry {
                    destination: destination.clone(),
                    status: DestinationStatus::NotStarted,
                })
                .collect(),
        }
    }

    pub fn entries(&self) -> &[DestinationEntry] {
        &self.entries
    }

    pub fn status_of(&self, url: &str) -> Option<DestinationStatus> {
        self.entries
            .iter()
            .find(|entry| entry.destination.url() == url)
            .map(|entry| entry.status)
    }

    /// Moves a `not_started` destination to `status`. Any other move is ignored.
    pub fn apply(&mut self, position: usize, status: DestinationStatus) -> Option<DestinationStatus> {
        let entry = self.entries.get_mut(position)?;
        if entry.status.is_terminal() || !status.is_terminal() {
            return None;
        }
        let previous = entry.status;
        entry.status = status;
        Some(previous)
    }

    pub fn any_started(&self) -> bool {
        self.count(DestinationStatus::Started) > 0
    }

    pub fn count(&self, status: DestinationStatus) -> usize {
        self.entries.iter().filter(|entry| entry.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    pub position: usize,
    pub from: DestinationStatus,
    pub to: DestinationStatus,
    pub rule: String,
}

#[derive(Debug)]
pub struct DestinationMonitor {
    table: DestinationTable,
    classifier: LogClassifier,
    attribute_unlabelled_progress: bool,
}

impl DestinationMonitor {
    pub fn new(
        destinations: &[Destination],
        classifier: LogClassifier,
        attribute_unlabelled_progress: bool,
    ) -> Self {
        Self {
            table: DestinationTable::new(destinations),
            classifier,
            attribute_unlabelled_progress,
        }
    }

    pub fn table(&self) -> &DestinationTable {
        &self.table
    }

    pub fn into_table(self) -> DestinationTable {
        self.table
    }

    /// Classifies one diagnostic line and applies whatever transitions it implies.
    pub fn observe(&mut self, line: &str) -> Vec<StatusTransition> {
        let mut named: Vec<usize> = self
            .table
            .entries()
            .iter()
            .enumerate()
            .filter(|(_, entry)| mentions(line, entry.destination.url()))
            .map(|(position, _)| position)
            .collect();

        if !named.is_empty() {
            // Longest first, so a URL that prefixes another is not cut out of it.
            named.sort_by_key(|position| {
                std::cmp::Reverse(self.table.entries()[*position].destination.url().len())
            });
            let stripped = named.iter().fold(line.to_string(), |acc, position| {
                strip_mention(&acc, self.table.entries()[*position].destination.url())
            });
            let Some(rule) = self.classifier.classify(&stripped) else {
                return Vec::new();
            };
            let (name, status) = (rule.name().to_string(), rule.family().status());
            return named
                .into_iter()
                .filter_map(|position| self.transition(position, status, &name))
                .collect();
        }

        let Some(rule) = self.classifier.classify(line) else {
            return Vec::new();
        };
        let (name, family, labelled_only) =
            (rule.name().to_string(), rule.family(), rule.is_labelled_only());
        if let Some(position) = rule.slave_position(line) {
            return self
                .transition(position, family.status(), &name)
                .into_iter()
                .collect();
        }
        if family == RuleFamily::Progress && self.attribute_unlabelled_progress && !labelled_only {
            return (0..self.table.len())
                .filter_map(|position| self.transition(position, DestinationStatus::Started, &name))
                .collect();
        }
        Vec::new()
    }

    fn transition(&mut self, position: usize, to: DestinationStatus, rule: &str) -> Option<StatusTransition> {
        self.table.apply(position, to).map(|from| StatusTransition {
            position,
            from,
            to,
            rule: rule.to_string(),
        })
    }

    /// Consumes the diagnostic stream until it ends or `stop` fires, then hands the table back.
    ///
    /// `first_started` is signalled on the first `started` transition.
    pub fn spawn(
        mut self,
        mut lines: DiagnosticStream,
        stop: CancellationToken,
        mut first_started: Option<oneshot::Sender<()>>,
    ) -> JoinHandle<DestinationTable> {
        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    line = lines.next() => match line {
                        Some(line) => line,
                        None => break,
                    },
                };
                debug!(target: "airtime::engine", "{line}");
                for transition in self.observe(&line) {
                    let destination = &self.table.entries()[transition.position].destination;
                    match transition.to {
                        DestinationStatus::Failed => warn!(
                            destination = %destination,
                            rule = %transition.rule,
                            "destination failed"
                        ),
                        _ => info!(
                            destination = %destination,
                            rule = %transition.rule,
                            "destination started"
                        ),
                    }
                    if transition.to == DestinationStatus::Started {
                        if let Some(signal) = first_started.take() {
                            let _ = signal.send(());
                        }
                    }
                }
            }
            self.table
        })
    }
}

/// True when `url` occurs in `line` and is not just the prefix of a longer URL.
fn mentions(line: &str, url: &str) -> bool {
    line.match_indices(url)
        .any(|(start, _)| ends_at_boundary(line, start + url.len()))
}

fn strip_mention(line: &str, url: &str) -> String {
    let mut stripped = String::with_capacity(line.len());
    let mut last = 0;
    for (start, _) in line.match_indices(url) {
        let end = start + url.len();
        if ends_at_boundary(line, end) {
            stripped.push_str(&line[last..start]);
            last = end;
        }
    }
    stripped.push_str(&line[last..]);
    stripped
}

fn ends_at_boundary(line: &str, end: usize) -> bool {
    match line[end..].chars().next() {
        None => true,
        Some(next) => {
            next.is_whitespace() || matches!(next, '\'' | '"' | ':' | '|' | ']' | ')' | ',' | ';')
        }
    }
}
