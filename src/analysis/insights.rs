//! Conversation-level insights and recommendations derived from results.

use std::time::Duration;

use crate::analysis::types::{
    Complexity, ConversationContext, ConversationInsights, ESCALATION_INTENT, FlowState,
    ProcessingResult, RESOLUTION_INTENTS, Sentiment, SentimentTrend, Urgency,
};

/// Minimum score change between halves of the series to call a trend.
const TREND_DELTA: f64 = 0.25;

#[derive(Debug, Clone, Copy)]
pub struct FlowThresholds {
    pub escalation_rate_per_minute: f64,
    pub stuck_rate_per_minute: f64,
    pub stuck_window: Duration,
}

/// Messages per minute over the context span (span floored to one minute).
pub fn message_rate(context: &ConversationContext) -> f64 {
    let minutes = (context.duration().num_milliseconds() as f64 / 60_000.0).max(1.0);
    context.messages.len() as f64 / minutes
}

pub fn classify_flow(
    context: &ConversationContext,
    result: &ProcessingResult,
    thresholds: &FlowThresholds,
) -> FlowState {
    let rate = message_rate(context);
    let span = context.duration().to_std().unwrap_or_default();

    if rate > thresholds.escalation_rate_per_minute {
        FlowState::Escalating
    } else if span >= thresholds.stuck_window && rate < thresholds.stuck_rate_per_minute {
        FlowState::Stuck
    } else if result
        .intent
        .as_ref()
        .is_some_and(|i| RESOLUTION_INTENTS.contains(&i.primary_intent.as_str()))
    {
        FlowState::Resolving
    } else {
        FlowState::Smooth
    }
}

/// Trend over a sentiment series, oldest first.
///
/// The series is split in half and the mean score of the newer half is
/// compared with the older one. A change beyond `TREND_DELTA` is improving or declining. Fewer
/// than two points is stable, which is also what a conversation with no
/// cached history reports.
pub fn sentiment_trend(series: &[Sentiment]) -> SentimentTrend {
    if series.len() < 2 {
        return SentimentTrend::Stable;
    }
    let mid = series.len() / 2;
    let mean = |s: &[Sentiment]| s.iter().map(|x| f64::from(x.score())).sum::<f64>() / s.len() as f64;
    let delta = mean(&series[mid..]) - mean(&series[..mid]);
    if delta > TREND_DELTA {
        SentimentTrend::Improving
    } else if delta < -TREND_DELTA {
        SentimentTrend::Declining
    } else {
        SentimentTrend::Stable
    }
}

pub fn derive_insights(
    context: &ConversationContext,
    result: &ProcessingResult,
    sentiment_history: &[Sentiment],
    thresholds: &FlowThresholds,
) -> ConversationInsights {
    ConversationInsights {
        flow: classify_flow(context, result, thresholds),
        sentiment_trend: sentiment_trend(sentiment_history),
        urgency: result.intent.as_ref().map_or(Urgency::Low, |i| i.urgency),
        complexity: result.intent.as_ref().map_or(Complexity::Simple, |i| i.complexity),
        message_rate: message_rate(context),
    }
}

/// Ordered recommendations for an agent or router.
pub fn recommendations(insights: &ConversationInsights, result: &ProcessingResult) -> Vec<String> {
    let mut out = Vec::new();

    match insights.flow {
        FlowState::Escalating => {
            out.push("Route the conversation to an experienced agent".to_string());
        }
        FlowState::Stuck => {
            out.push("Conversation appears stuck; suggest alternative solutions".to_string());
        }
        FlowState::Resolving | FlowState::Smooth => {}
    }

    if insights.urgency >= Urgency::High {
        out.push(format!("Prioritize the response ({} urgency)", insights.urgency));
    }

    let negative = result
        .emotion
        .as_ref()
        .is_some_and(|e| e.sentiment == Sentiment::Negative);
    if negative || insights.sentiment_trend == SentimentTrend::Declining {
        out.push("Customer sentiment is negative; respond with empathy".to_string());
    }

    if result
        .intent
        .as_ref()
        .is_some_and(|i| i.primary_intent == ESCALATION_INTENT)
    {
        out.push("Customer asked for escalation; involve a supervisor".to_string());
    }

    if insights.complexity == Complexity::Complex {
        out.push("Complex issue; consult the knowledge base or a specialist".to_string());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::types::{EmotionResult, IntentResult};
    use crate::ingestion::types::{
        Channel, IngestedMessage, MessageContent, MessageMetadata, MessageStatus,
        PreprocessingState,
    };
    use chrono::Utc;
    use uuid::Uuid;

    fn thresholds() -> FlowThresholds {
        FlowThresholds {
            escalation_rate_per_minute: 10.0,
            stuck_rate_per_minute: 0.5,
            stuck_window: Duration::from_secs(300),
        }
    }

    fn context_with(offsets_secs: &[i64]) -> ConversationContext {
        let now = Utc::now();
        let messages = offsets_secs
            .iter()
            .enumerate()
            .map(|(i, secs)| {
                let ts = now - chrono::Duration::seconds(*secs);
                IngestedMessage {
                    id: Uuid::new_v4(),
                    conversation_id: "c1".into(),
                    channel: Channel::Chat,
                    content: MessageContent::text("hi"),
                    normalized_text: None,
                    metadata: MessageMetadata {
                        timestamp: Some(ts),
                        ..MessageMetadata::default()
                    },
                    preprocessing: PreprocessingState::default(),
                    status: MessageStatus::Pending,
                    errors: Vec::new(),
                    retry_count: 0,
                    not_before: None,
                    sequence: i as u64,
                    created_at: ts,
                    claimed_at: None,
                    processed_at: None,
                }
            })
            .collect();
        ConversationContext::from_messages("c1", messages, 50)
    }

    fn result_with(sentiment: Sentiment, intent: &str, urgency: Urgency, complexity: Complexity) -> ProcessingResult {
        ProcessingResult {
            conversation_id: "c1".into(),
            message_id: Uuid::new_v4(),
            emotion: Some(EmotionResult {
                sentiment,
                confidence: 0.8,
                primary_emotion: None,
                intensity: None,
            }),
            intent: Some(IntentResult {
                primary_intent: intent.into(),
                urgency,
                complexity,
                confidence: 0.8,
                entities: Vec::new(),
                keywords: Vec::new(),
            }),
            processing_time_ms: 3,
            timestamp: Utc::now(),
            cached: false,
            cancelled: false,
            errors: Vec::new(),
        }
    }

    #[test]
    fn burst_of_messages_is_escalating() {
        let ctx = context_with(&[0; 12]);
        let r = result_with(Sentiment::Neutral, "help_request", Urgency::Low, Complexity::Simple);
        assert_eq!(classify_flow(&ctx, &r, &thresholds()), FlowState::Escalating);
    }

    #[test]
    fn sparse_long_conversation_is_stuck() {
        let ctx = context_with(&[1200, 0]);
        let r = result_with(Sentiment::Neutral, "help_request", Urgency::Low, Complexity::Simple);
        assert_eq!(classify_flow(&ctx, &r, &thresholds()), FlowState::Stuck);
    }

    #[test]
    fn farewell_is_resolving() {
        let ctx = context_with(&[30, 0]);
        let r = result_with(Sentiment::Positive, "farewell", Urgency::Low, Complexity::Simple);
        assert_eq!(classify_flow(&ctx, &r, &thresholds()), FlowState::Resolving);
    }

    #[test]
    fn ordinary_conversation_is_smooth() {
        let ctx = context_with(&[60, 30, 0]);
        let r = result_with(Sentiment::Neutral, "order_status", Urgency::Low, Complexity::Simple);
        assert_eq!(classify_flow(&ctx, &r, &thresholds()), FlowState::Smooth);
    }

    #[test]
    fn trend_needs_two_points() {
        assert_eq!(sentiment_trend(&[]), SentimentTrend::Stable);
        assert_eq!(sentiment_trend(&[Sentiment::Negative]), SentimentTrend::Stable);
        assert_eq!(
            sentiment_trend(&[Sentiment::Negative, Sentiment::Positive]),
            SentimentTrend::Improving
        );
        assert_eq!(
            sentiment_trend(&[Sentiment::Positive, Sentiment::Neutral, Sentiment::Negative]),
            SentimentTrend::Declining
        );
        assert_eq!(
            sentiment_trend(&[Sentiment::Neutral, Sentiment::Neutral]),
            SentimentTrend::Stable
        );
    }

    #[test]
    fn recommendations_follow_fixed_order() {
        let ctx = context_with(&[0; 12]);
        let r = result_with(Sentiment::Negative, "escalation", Urgency::Critical, Complexity::Complex);
        let insights = derive_insights(&ctx, &r, &[], &thresholds());
        let recs = recommendations(&insights, &r);
        assert_eq!(recs.len(), 5);
        assert!(recs[0].contains("experienced agent"));
        assert!(recs[1].contains("Prioritize"));
        assert!(recs[2].contains("empathy"));
        assert!(recs[3].contains("supervisor"));
        assert!(recs[4].contains("knowledge base"));
    }

    #[test]
    fn calm_conversation_has_no_recommendations() {
        let ctx = context_with(&[60, 0]);
        let r = result_with(Sentiment::Positive, "order_status", Urgency::Low, Complexity::Simple);
        let insights = derive_insights(&ctx, &r, &[Sentiment::Positive], &thresholds());
        assert!(recommendations(&insights, &r).is_empty());
        assert_eq!(insights.urgency, Urgency::Low);
    }
}
