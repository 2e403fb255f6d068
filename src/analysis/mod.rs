//! Real-time analysis: analyzers, result cache, concurrency limiter, insights.

pub mod analyzer;
pub mod cache;
pub mod insights;
pub mod limiter;
pub mod processor;
pub mod types;

pub use analyzer::{EmotionAnalyzer, IntentAnalyzer, KeywordIntentAnalyzer, LexiconEmotionAnalyzer};
pub use processor::{ProcessorStats, RealTimeProcessor};
pub use types::{
    ConversationAnalysis, ConversationContext, ConversationInsights, EmotionResult, IntentResult,
    ProcessOptions, ProcessingResult,
};
