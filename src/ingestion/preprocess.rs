//! Best-effort text preprocessing: cleaning, normalization, language detection.
//!
//! Nothing in here can fail ingestion. Problems are returned as
//! `PreprocessError`s and recorded on the message by the caller.

use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::error::PreprocessError;
use crate::ingestion::types::IngestedMessage;

static CONTROL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{Cc}&&[^\n\t]]").expect("valid control-char regex"));

static HORIZONTAL_WS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\u{00A0}\u{2000}-\u{200B}\u{3000}]+").expect("valid ws regex"));

static EXCESS_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ ]*\n[\n ]*").expect("valid newline regex"));

static SPACE_BEFORE_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+([,.!?;:])").expect("valid punctuation regex"));

static MISSING_SPACE_AFTER_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([,!?;])(\p{L})").expect("valid punctuation regex"));

/// Stop words per language, used for lexical scoring.
const STOP_WORDS: &[(&str, &[&str])] = &[
    (
        "en",
        &[
            "the", "and", "is", "are", "you", "i", "to", "of", "it", "that", "this", "with",
            "for", "my", "need", "help", "have", "not", "please", "what", "now", "can",
        ],
    ),
    (
        "es",
        &[
            "el", "los", "las", "que", "y", "es", "por", "para", "con", "una", "necesito",
            "ayuda", "mi", "gracias", "hola", "está", "pero", "muy", "tengo", "cuenta",
        ],
    ),
    (
        "fr",
        &[
            "le", "les", "et", "est", "je", "vous", "pour", "avec", "une", "pas", "mon", "merci",
            "bonjour", "besoin", "aide", "ne", "c'est", "mais", "très", "compte",
        ],
    ),
    (
        "de",
        &[
            "der", "die", "das", "und", "ist", "ich", "nicht", "sie", "mit", "für", "ein",
            "eine", "mein", "bitte", "danke", "hilfe", "brauche", "zu", "auf", "es",
        ],
    ),
    (
        "it",
        &[
            "il", "lo", "di", "che", "è", "per", "non", "mio", "grazie", "aiuto", "ho",
            "bisogno", "sono", "ciao", "questo", "della", "molto", "ma", "gli", "anche",
        ],
    ),
    (
        "pt",
        &[
            "os", "não", "meu", "obrigado", "obrigada", "ajuda", "preciso", "olá", "você",
            "com", "uma", "um", "para", "muito", "mas", "conta", "isso", "sim", "do", "da",
        ],
    ),
];

/// Strip control characters and collapse whitespace.
pub fn clean_text(text: &str) -> String {
    let without_controls = CONTROL_CHARS.replace_all(text, "");
    let collapsed = HORIZONTAL_WS.replace_all(&without_controls, " ");
    let paragraphs = EXCESS_NEWLINES.replace_all(&collapsed, "\n\n");
    paragraphs
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// NFC-normalize, fix punctuation spacing, and case-fold.
pub fn normalize_text(text: &str) -> String {
    let nfc: String = text.nfc().collect();
    let tightened = SPACE_BEFORE_PUNCT.replace_all(&nfc, "$1");
    let spaced = MISSING_SPACE_AFTER_PUNCT.replace_all(&tightened, "$1 $2");
    spaced.to_lowercase()
}

/// A language guess with a confidence in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct LanguageGuess {
    pub language: String,
    pub confidence: f32,
}

/// Guess the language of `text` by stop-word hits, restricted to `candidates`.
///
/// Returns `None` when no candidate scores a single hit.
pub fn detect_language(text: &str, candidates: &[String]) -> Option<LanguageGuess> {
    let lowered = text.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !(c.is_alphabetic() || c == '\''))
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return None;
    }

    let mut total_hits = 0usize;
    let mut best: Option<(&str, usize)> = None;
    for (language, words) in STOP_WORDS {
        if !candidates.iter().any(|c| c == language) {
            continue;
        }
        let hits = tokens.iter().filter(|t| words.contains(t)).count();
        total_hits += hits;
        if hits > best.map_or(0, |(_, h)| h) {
            best = Some((language, hits));
        }
    }

    best.map(|(language, hits)| LanguageGuess {
        language: language.to_string(),
        confidence: hits as f32 / total_hits.max(1) as f32,
    })
}

/// Primary subtag of a language tag, lowercased (`"en-US"` → `"en"`).
pub fn primary_subtag(language: &str) -> String {
    language
        .split(['-', '_'])
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase()
}

/// Run all preprocessing steps on `message` in place.
///
/// Returns the non-fatal problems encountered; the message's
/// `preprocessing` flags record which steps completed.
pub fn apply(
    message: &mut IngestedMessage,
    supported_languages: &[String],
    default_language: &str,
) -> Vec<PreprocessError> {
    let mut problems = Vec::new();

    if let Some(text) = message.content.text.take() {
        let cleaned = clean_text(&text);
        message.preprocessing.cleaned = true;
        if cleaned.is_empty() {
            problems.push(PreprocessError::EmptyAfterCleaning);
            message.content.text = Some(text);
        } else {
            message.normalized_text = Some(normalize_text(&cleaned));
            message.preprocessing.normalized = true;
            message.content.text = Some(cleaned);
        }
    }

    if message.metadata.language.is_none() {
        let detected = message
            .normalized_text
            .as_deref()
            .and_then(|t| detect_language(t, supported_languages));
        match detected {
            Some(guess) => {
                tracing::debug!(
                    message_id = %message.id,
                    language = %guess.language,
                    confidence = guess.confidence,
                    "Detected message language"
                );
                message.metadata.language = Some(guess.language);
                message.preprocessing.language_detected = true;
            }
            None => {
                if message.content.text.is_some() {
                    problems.push(PreprocessError::LanguageUndetected);
                }
                message.metadata.language = Some(default_language.to_string());
            }
        }
    }

    problems
}
