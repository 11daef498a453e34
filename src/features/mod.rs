//! # Stage: Feature Extraction
//!
//! ## Responsibility
//! Turn raw prompt text into a small structured [`PromptFeatures`] set:
//! keyword-driven category tags, word/char counts, question and
//! code-request flags, a domain tag, an intent tag, and a complexity signal.
//!
//! ## Guarantees
//! - Deterministic: the same prompt always yields the same features.
//! - Total: never fails, never blocks; unrecognised text degrades to an empty
//!   category set with domain `general`.
//! - Pure: no I/O, no randomness, no shared state.
//!
//! ## NOT Responsible For
//! - Rejecting empty prompts (the engine does that before extraction)
//! - Scoring models (that belongs to `selection`)

pub mod complexity;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use complexity::ComplexityScorer;

/// Prompt category tags, in declaration order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Programming, debugging, algorithms.
    Coding,
    /// Stories, poems, imaginative writing.
    Creative,
    /// Explanations, analysis, logic.
    Reasoning,
    /// Definitions, dates, facts.
    Factual,
    /// Translating between languages.
    Translation,
    /// Emotion, tone, opinion.
    Sentiment,
}

impl Category {
    /// Every category, in declaration order.
    pub const ALL: [Category; 6] = [
        Category::Coding,
        Category::Creative,
        Category::Reasoning,
        Category::Factual,
        Category::Translation,
        Category::Sentiment,
    ];

    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coding => "coding",
            Self::Creative => "creative",
            Self::Reasoning => "reasoning",
            Self::Factual => "factual",
            Self::Translation => "translation",
            Self::Sentiment => "sentiment",
        }
    }

    fn keywords(&self) -> &'static [&'static str] {
        match self {
            Self::Coding => CODING_KEYWORDS,
            Self::Creative => CREATIVE_KEYWORDS,
            Self::Reasoning => REASONING_KEYWORDS,
            Self::Factual => FACTUAL_KEYWORDS,
            Self::Translation => TRANSLATION_KEYWORDS,
            Self::Sentiment => SENTIMENT_KEYWORDS,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse intent of the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Asks something.
    Question,
    /// Opens with an imperative verb.
    Instruction,
    /// Anything else.
    Statement,
}

/// Structured features derived from one prompt.
///
/// Ephemeral: created by [`FeatureExtractor`], consumed by the model selector,
/// never persisted beyond the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptFeatures {
    /// Whitespace-delimited word count.
    pub word_count: usize,
    /// Character count (Unicode scalar values).
    pub char_count: usize,
    /// Whether any code keyword matched.
    pub has_code_request: bool,
    /// Whether the prompt contains a question mark.
    pub has_question: bool,
    /// Matched category tags.
    pub categories: BTreeSet<Category>,
    /// Highest-priority matched category, or `"general"`.
    pub domain: String,
    /// Coarse intent tag.
    pub intent: Intent,
    /// Complexity signal in `[0.0, 1.0]`.
    pub complexity: f64,
}

impl PromptFeatures {
    /// Whether a given category matched.
    pub fn has_category(&self, category: Category) -> bool {
        self.categories.contains(&category)
    }
}

const CODING_KEYWORDS: &[&str] = &[
    "code",
    "function",
    "python",
    "rust",
    "javascript",
    "typescript",
    "java",
    "algorithm",
    "debug",
    "bug",
    "compile",
    "sql",
    "api",
    "class",
    "script",
    "program",
    "regex",
    "array",
    "sort",
];

const CODE_REQUEST_KEYWORDS: &[&str] = &[
    "code",
    "function",
    "implement",
    "script",
    "program",
    "algorithm",
    "debug",
    "refactor",
    "compile",
    "class",
    "method",
    "snippet",
    "python",
    "javascript",
    "rust",
    "sql",
];

const CREATIVE_KEYWORDS: &[&str] = &[
    "story",
    "poem",
    "creative",
    "imagine",
    "fiction",
    "novel",
    "lyrics",
    "haiku",
    "character",
    "plot",
    "song",
];

const REASONING_KEYWORDS: &[&str] = &[
    "why",
    "reason",
    "logic",
    "prove",
    "explain",
    "analyze",
    "analyse",
    "deduce",
    "puzzle",
    "step by step",
    "compare",
    "evaluate",
];

const FACTUAL_KEYWORDS: &[&str] = &[
    "what is",
    "who",
    "when",
    "where",
    "fact",
    "history",
    "define",
    "definition",
    "capital",
    "population",
];

const TRANSLATION_KEYWORDS: &[&str] = &[
    "translate",
    "translation",
    "french",
    "spanish",
    "german",
    "chinese",
    "japanese",
    "in english",
];

const SENTIMENT_KEYWORDS: &[&str] = &[
    "sentiment",
    "feel",
    "feeling",
    "emotion",
    "opinion",
    "mood",
    "tone",
    "positive",
    "negative",
];

const QUESTION_OPENERS: &[&str] = &[
    "what", "why", "how", "who", "when", "where", "which", "is", "are", "can", "does", "do",
];

const IMPERATIVE_OPENERS: &[&str] = &[
    "write",
    "create",
    "explain",
    "translate",
    "summarize",
    "implement",
    "build",
    "generate",
    "list",
    "describe",
    "fix",
    "sort",
    "analyze",
    "compare",
    "draft",
    "make",
    "give",
    "tell",
];

/// Order in which matched categories compete for the domain tag.
/// Specific categories win over generic ones.
const DOMAIN_PRIORITY: [Category; 6] = [
    Category::Coding,
    Category::Translation,
    Category::Sentiment,
    Category::Creative,
    Category::Reasoning,
    Category::Factual,
];

/// Lower-cased prompt plus its word set, shared by every keyword test.
///
/// Single-word keywords match whole words; multi-word keywords match as
/// substrings of the lower-cased text.
pub(crate) struct KeywordIndex {
    lower: String,
    words: HashSet<String>,
}

impl KeywordIndex {
    pub(crate) fn new(prompt: &str) -> Self {
        let lower = prompt.to_lowercase();
        let words = lower
            .split(|c: char| !(c.is_alphanumeric() || c == '+' || c == '#'))
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        Self { lower, words }
    }

    pub(crate) fn matches(&self, keyword: &str) -> bool {
        let keyword = keyword.trim();
        if keyword.contains(' ') {
            self.lower.contains(keyword)
        } else {
            self.words.contains(keyword)
        }
    }

    fn first_word(&self) -> Option<&str> {
        self.lower
            .split(|c: char| !c.is_alphanumeric())
            .find(|w| !w.is_empty())
    }
}

/// Deterministic keyword-based feature extractor.
#[derive(Debug, Clone, Default)]
pub struct FeatureExtractor {
    complexity: ComplexityScorer,
}

impl FeatureExtractor {
    /// Create an extractor with the default complexity scorer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract features from a prompt.
    ///
    /// # Example
    ///
    /// ```rust
    /// use critique_orchestrator::features::{Category, FeatureExtractor};
    /// let f = FeatureExtractor::new().extract("Write a Python function to sort an array");
    /// assert!(f.has_code_request);
    /// assert!(f.has_category(Category::Coding));
    /// ```
    pub fn extract(&self, prompt: &str) -> PromptFeatures {
        let index = KeywordIndex::new(prompt);

        let categories: BTreeSet<Category> = Category::ALL
            .iter()
            .copied()
            .filter(|c| c.keywords().iter().any(|kw| index.matches(kw)))
            .collect();

        let has_code_request =
            prompt.contains("```") || CODE_REQUEST_KEYWORDS.iter().any(|kw| index.matches(kw));
        let has_question = prompt.contains('?');

        let domain = DOMAIN_PRIORITY
            .iter()
            .find(|c| categories.contains(c))
            .map_or_else(|| "general".to_string(), |c| c.as_str().to_string());

        let first = index.first_word().unwrap_or("");
        let intent = if has_question || QUESTION_OPENERS.contains(&first) {
            Intent::Question
        } else if IMPERATIVE_OPENERS.contains(&first) {
            Intent::Instruction
        } else {
            Intent::Statement
        };

        PromptFeatures {
            word_count: prompt.split_whitespace().count(),
            char_count: prompt.chars().count(),
            has_code_request,
            has_question,
            categories,
            domain,
            intent,
            complexity: self.complexity.score(prompt),
        }
    }
}
