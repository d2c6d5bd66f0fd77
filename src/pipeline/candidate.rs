use serde_json::Value;

/// A single article link produced by a listing source, before evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    link: String,
    title: String,
    summary: Option<String>,
    origin: Value,
}

impl Candidate {
    pub fn new(
        link: impl Into<String>,
        title: impl Into<String>,
        summary: Option<String>,
        origin: Value,
    ) -> Self {
        Self {
            link: link.into(),
            title: title.into(),
            summary,
            origin,
        }
    }

    /// Canonical identity of the candidate; duplicates are detected on this.
    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    /// Source metadata carried through to the result record unchanged.
    pub fn origin(&self) -> &Value {
        &self.origin
    }
}

/// One producer-yielded unit of work: a labelled, ordered run of candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateBatch {
    label: String,
    candidates: Vec<Candidate>,
}

impl CandidateBatch {
    pub fn new(label: impl Into<String>, candidates: Vec<Candidate>) -> Self {
        Self {
            label: label.into(),
            candidates,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn into_parts(self) -> (String, Vec<Candidate>) {
        (self.label, self.candidates)
    }
}

/// Token counts for a single model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input = self.input.saturating_add(other.input);
        self.output = self.output.saturating_add(other.output);
    }

    pub fn total(&self) -> u64 {
        self.input.saturating_add(self.output)
    }
}

/// Per-stage token accounting for one candidate.
///
/// A stage that did not run keeps its zero default, so the record always
/// reflects what was actually spent, including on failed items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageUsage {
    pub screening: TokenUsage,
    pub evaluation: TokenUsage,
}

impl StageUsage {
    pub fn total(&self) -> TokenUsage {
        let mut combined = self.screening;
        combined.add(self.evaluation);
        combined
    }
}

/// Terminal classification for one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Passed both stages.
    Matched {
        reason: String,
        analysis: Option<String>,
    },
    /// Full evaluation decided against the criteria.
    NotMatched { reason: String },
    /// The cheap screening stage rejected the summary; only reachable when
    /// screening actually ran.
    SummaryRejected { reason: String },
    /// Full content could not be retrieved.
    FetchFailed { reason: String },
    /// A stage reply could not be reduced to a decision, or an unexpected
    /// error ended the evaluation.
    EvaluationFailed { reason: String },
}

impl Verdict {
    /// Stable tag used in sink records and the final breakdown.
    pub fn status(&self) -> &'static str {
        match self {
            Verdict::Matched { .. } => "matched",
            Verdict::NotMatched { .. } => "not_matched",
            Verdict::SummaryRejected { .. } => "summary_rejected",
            Verdict::FetchFailed { .. } => "fetch_failed",
            Verdict::EvaluationFailed { .. } => "evaluation_failed",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Verdict::Matched { reason, .. }
            | Verdict::NotMatched { reason }
            | Verdict::SummaryRejected { reason }
            | Verdict::FetchFailed { reason }
            | Verdict::EvaluationFailed { reason } => reason,
        }
    }

    pub fn analysis(&self) -> Option<&str> {
        match self {
            Verdict::Matched { analysis, .. } => analysis.as_deref(),
            _ => None,
        }
    }

    pub fn is_matched(&self) -> bool {
        matches!(self, Verdict::Matched { .. })
    }
}

/// Finished evaluation of one candidate plus its token accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    candidate: Candidate,
    verdict: Verdict,
    usage: StageUsage,
}

impl Outcome {
    pub fn new(candidate: Candidate, verdict: Verdict, usage: StageUsage) -> Self {
        Self {
            candidate,
            verdict,
            usage,
        }
    }

    pub fn candidate(&self) -> &Candidate {
        &self.candidate
    }

    pub fn verdict(&self) -> &Verdict {
        &self.verdict
    }

    pub fn usage(&self) -> StageUsage {
        self.usage
    }
}
