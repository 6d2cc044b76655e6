//! Interview context supplied by the candidate, and the fixed prompts
//! derived from it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterviewMode {
    #[default]
    Voice,
    Text,
}

/// What the candidate filled in before starting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterviewSetup {
    pub jd_url: String,
    pub resume_url: String,
    pub jd_text: String,
    pub resume_text: String,
    pub mode: InterviewMode,
}

/// Structured close-out request sent as a TEXT turn.
pub const FEEDBACK_PROMPT: &str = "The candidate has requested to end the interview and receive feedback.

Please respond in TWO parts:

1. CONCLUSION: First, naturally conclude the interview. Thank them for their time and say goodbye.

2. FEEDBACK: Then provide structured feedback in this exact format:

**STRENGTHS:**
- [Strength 1]
- [Strength 2]

**AREAS FOR IMPROVEMENT:**
- [Area 1]
- [Area 2]

Keep the feedback professional, specific, and constructive.";

const NOT_PROVIDED: &str = "Not provided";

fn or_not_provided(text: &str) -> &str {
    if text.trim().is_empty() {
        NOT_PROVIDED
    } else {
        text
    }
}

/// Render the interviewer system instruction carried by `INITIAL_SETUP`.
pub fn interview_prompt(setup: &InterviewSetup) -> String {
    format!(
        "You are an experienced senior technical interviewer running a live interview.

### RULES
1. Speak only the words you would say to the candidate. Never narrate your reasoning or plans.
2. No meta-commentary about what you are doing.
3. Ask exactly one question per turn.

**Interview Context:**
Job Description:
{jd}

Candidate's Resume:
{resume}

**Guidelines:**
- Stay professional, friendly and encouraging.
- Keep each response to two or three sentences.
- Follow up on the candidate's most recent answer.
- Aim for a 30-45 minute interview covering technical skills, problem solving, and motivation.

Begin now with a warm greeting and a brief introduction.",
        jd = or_not_provided(&setup.jd_text),
        resume = or_not_provided(&setup.resume_text),
    )
}

/// Relay WebSocket URL for a page served from `host`.
///
/// Pages served over https must use `wss://`; plain http uses `ws://`.
pub fn relay_url(secure: bool, host: &str) -> String {
    let scheme = if secure { "wss" } else { "ws" };
    format!("{}://{}", scheme, host)
}
