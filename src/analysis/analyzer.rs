//! Emotion and intent analyzer interfaces, plus the built-in heuristic
//! implementations used when no model-backed analyzer is wired in.
//!
//! The heuristics are lexicon and regex driven: cheap, deterministic, and
//! good enough to exercise the pipeline end to end.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::analysis::types::{
    Complexity, EmotionRequest, EmotionResult, IntentRequest, IntentResult, Sentiment, Urgency,
};
use crate::error::AnalysisError;

/// Produces an emotion result for one message.
#[async_trait]
pub trait EmotionAnalyzer: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(&self, request: EmotionRequest) -> Result<EmotionResult, AnalysisError>;
}

/// Produces an intent result for one message.
#[async_trait]
pub trait IntentAnalyzer: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(&self, request: IntentRequest) -> Result<IntentResult, AnalysisError>;
}

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Emotion ─────────────────────────────────────────────────────────

const POSITIVE_WORDS: &[&str] = &[
    "thanks", "thank", "great", "good", "excellent", "perfect", "love", "happy", "awesome",
    "helpful", "appreciate", "wonderful", "resolved", "works", "gracias", "merci", "danke",
    "grazie", "obrigado", "genial", "super",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "awful", "worst", "angry", "furious", "frustrated", "annoyed", "hate",
    "broken", "useless", "ridiculous", "unacceptable", "disappointed", "upset", "problem",
    "error", "wrong", "never", "waiting", "still", "sad", "worried", "scared", "can't",
    "cannot", "doesn't", "won't", "not",
];

/// Emotion label → trigger words. First label with the most hits wins.
const EMOTION_LEXICON: &[(&str, &[&str])] = &[
    ("anger", &["angry", "furious", "ridiculous", "unacceptable", "hate", "worst"]),
    ("frustration", &["frustrated", "annoyed", "still", "again", "waiting", "useless"]),
    ("sadness", &["sad", "disappointed", "unfortunately", "upset"]),
    ("fear", &["worried", "scared", "afraid", "nervous"]),
    ("joy", &["thanks", "thank", "great", "happy", "love", "perfect", "awesome", "appreciate"]),
];

/// Lexicon-based sentiment and emotion scorer.
#[derive(Debug, Default, Clone)]
pub struct LexiconEmotionAnalyzer;

impl LexiconEmotionAnalyzer {
    pub fn new() -> Self {
        Self
    }

    fn score(&self, request: &EmotionRequest) -> EmotionResult {
        let words = tokens(&request.text);
        let positive = words.iter().filter(|w| POSITIVE_WORDS.contains(&w.as_str())).count();
        let negative = words.iter().filter(|w| NEGATIVE_WORDS.contains(&w.as_str())).count();
        let hits = positive + negative;

        let (mut sentiment, mut confidence) = if hits == 0 {
            (Sentiment::Neutral, 0.7)
        } else {
            let net = positive as i64 - negative as i64;
            let sentiment = match net.signum() {
                1 => Sentiment::Positive,
                -1 => Sentiment::Negative,
                _ => Sentiment::Neutral,
            };
            let margin = net.unsigned_abs() as f32 / hits as f32;
            (sentiment, (0.55 + 0.4 * margin).min(0.95))
        };

        if confidence < request.options.min_confidence {
            sentiment = Sentiment::Neutral;
            confidence = request.options.min_confidence;
        }

        let primary_emotion = EMOTION_LEXICON
            .iter()
            .map(|(label, triggers)| {
                let hits = words.iter().filter(|w| triggers.contains(&w.as_str())).count();
                (*label, hits)
            })
            .filter(|(_, hits)| *hits > 0)
            .fold(None::<(&str, usize)>, |best, cur| match best {
                Some(b) if b.1 >= cur.1 => Some(b),
                _ => Some(cur),
            })
            .map(|(label, _)| label.to_string());

        let intensity = request.options.include_intensity.then(|| {
            let exclamations = request.text.matches('!').count();
            let density = hits as f32 / words.len().max(1) as f32;
            (density * 2.0 + exclamations as f32 * 0.15).min(1.0)
        });

        EmotionResult {
            sentiment,
            confidence,
            primary_emotion,
            intensity,
        }
    }
}

#[async_trait]
impl EmotionAnalyzer for LexiconEmotionAnalyzer {
    fn name(&self) -> &str {
        "lexicon"
    }

    async fn analyze(&self, request: EmotionRequest) -> Result<EmotionResult, AnalysisError> {
        Ok(self.score(&request))
    }
}

// ── Intent ──────────────────────────────────────────────────────────

/// Ordered intent rules; the first match is the primary intent.
static INTENT_RULES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        (
            "escalation",
            r"(?i)\b(manager|supervisor|escalate|speak (to|with) (a )?(human|person|someone))\b",
        ),
        ("cancellation", r"(?i)\b(cancel|unsubscribe|close my account|terminate)\b"),
        ("refund", r"(?i)\b(refund|money back|chargeback|reimburse)"),
        ("billing", r"(?i)\b(bill|billing|invoice|charged?|payment|subscription)\b"),
        (
            "technical_support",
            r"(?i)\b(error|crash(es|ed)?|bug|broken|not working|doesn't work|won't (load|start|open))\b",
        ),
        ("account", r"(?i)\b(password|log ?in|sign ?in|locked out|my account)\b"),
        ("order_status", r"(?i)\b(order|delivery|shipping|shipment|track(ing)?|package)\b"),
        ("complaint", r"(?i)\b(complain(t)?|terrible|awful|worst|unacceptable|ridiculous)\b"),
        (
            "resolution",
            r"(?i)\b(that (fixed|solved|worked)|(it'?s|is) (fixed|resolved|working)|all set|works now)\b",
        ),
        ("gratitude", r"(?i)\b(thank(s| you)?|appreciate)\b"),
        ("farewell", r"(?i)\b(bye|goodbye|have a (good|nice|great) day)\b"),
        ("help_request", r"(?i)\b(help|assist(ance)?|support|question)\b"),
        ("greeting", r"(?i)^\s*(hello|hi|hey|good (morning|afternoon|evening))\b"),
    ]
    .into_iter()
    .map(|(label, pattern)| (label, Regex::new(pattern).expect("valid intent regex")))
    .collect()
});

static CRITICAL_URGENCY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(emergency|outage|fraud|lawyer|lawsuit|security breach|hacked)\b")
        .expect("valid urgency regex")
});

static HIGH_URGENCY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(urgent(ly)?|asap|immediately|right now|now|today|can't wait)\b")
        .expect("valid urgency regex")
});

static MEDIUM_URGENCY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(soon|waiting|still|again|quickly)\b").expect("valid urgency regex")
});

static ENTITY_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("order", r"#?\b\d{5,}\b"),
        ("email", r"\b[\w.+-]+@[\w-]+\.[\w.-]+\b"),
        ("amount", r"[$€£]\s?\d+(?:[.,]\d{2})?"),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).expect("valid entity regex")))
    .collect()
});

const KEYWORD_STOP_WORDS: &[&str] = &[
    "about", "after", "again", "being", "could", "would", "should", "there", "their", "these",
    "those", "which", "while", "please", "thanks", "still", "really", "today",
];

/// Regex rule-based intent classifier.
#[derive(Debug, Default, Clone)]
pub struct KeywordIntentAnalyzer;

impl KeywordIntentAnalyzer {
    pub fn new() -> Self {
        Self
    }

    fn classify(&self, request: &IntentRequest) -> IntentResult {
        let text = request.text.as_str();
        let matched: Vec<&str> = INTENT_RULES
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(label, _)| *label)
            .collect();

        let (primary_intent, mut confidence) = match matched.first() {
            Some(label) => {
                let in_context = INTENT_RULES
                    .iter()
                    .find(|(l, _)| l == label)
                    .is_some_and(|(_, re)| request.context_window.iter().any(|c| re.is_match(c)));
                (label.to_string(), if in_context { 0.85 } else { 0.75 })
            }
            None => ("general_inquiry".to_string(), 0.5),
        };
        if matched.len() > 2 {
            confidence -= 0.1;
        }

        let mut urgency = if CRITICAL_URGENCY.is_match(text) {
            Urgency::Critical
        } else if HIGH_URGENCY.is_match(text) {
            Urgency::High
        } else if MEDIUM_URGENCY.is_match(text) {
            Urgency::Medium
        } else {
            Urgency::Low
        };
        if text.matches('!').count() >= 2 {
            urgency = urgency.max(Urgency::Medium);
        }
        if primary_intent == "escalation" {
            urgency = urgency.max(Urgency::High);
        }

        let word_count = text.split_whitespace().count();
        let complexity = if word_count > 60 || matched.len() >= 3 {
            Complexity::Complex
        } else if word_count > 25 || matched.len() == 2 || primary_intent == "technical_support" {
            Complexity::Moderate
        } else {
            Complexity::Simple
        };

        let entities = if request.options.include_entities {
            ENTITY_PATTERNS
                .iter()
                .flat_map(|(kind, re)| re.find_iter(text).map(move |m| format!("{kind}:{}", m.as_str())))
                .collect()
        } else {
            Vec::new()
        };

        let keywords = if request.options.include_context_keywords {
            let mut keywords: Vec<String> = Vec::new();
            for word in tokens(text) {
                if word.len() >= 5
                    && !KEYWORD_STOP_WORDS.contains(&word.as_str())
                    && !keywords.contains(&word)
                {
                    keywords.push(word);
                }
            }
            keywords.truncate(5);
            keywords
        } else {
            Vec::new()
        };

        IntentResult {
            primary_intent,
            urgency,
            complexity,
            confidence,
            entities,
            keywords,
        }
    }
}

#[async_trait]
impl IntentAnalyzer for KeywordIntentAnalyzer {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn analyze(&self, request: IntentRequest) -> Result<IntentResult, AnalysisError> {
        Ok(self.classify(&request))
    }
}
