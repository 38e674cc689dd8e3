use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;

use crate::config::ApiSettings;
use crate::models::FacultyProfile;

const PROMPT_INSTRUCTIONS: &str = "You are a research development assistant. Find current, \
open funding opportunities (RFPs) matching the faculty profile below. Present the results \
as a markdown table with the columns Funding Agency, Program Name, Deadline, Award Amount, \
and Link. Only include opportunities that are currently accepting proposals. ";

const PROMPT_REQUEST: &str = "Please list the best matching funding opportunities in the \
table format described above.";

/// Upstream content API failure, reported after the generator's own bounded
/// retries are exhausted.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("malformed API response: {0}")]
    Malformed(String),

    #[error("all {attempts} attempts failed, last error: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl GenerationError {
    /// Timeouts, connection failures, rate limiting and server errors are
    /// worth retrying; everything else fails the attempt immediately.
    fn is_transient(&self) -> bool {
        match self {
            GenerationError::Request(error) => error.is_timeout() || error.is_connect(),
            GenerationError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// A generated digest plus the cost accounting the ledger records.
#[derive(Debug, Clone)]
pub struct GeneratedDigest {
    pub content: String,
    pub tokens_used: i64,
    pub elapsed_seconds: f64,
}

/// The generation collaborator: faculty profile in, digest text out.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, profile: &FacultyProfile)
        -> Result<GeneratedDigest, GenerationError>;
}

/// Bounded exponential backoff wrapping each external generation call.
///
/// This layer is deliberately separate from the scheduler's own one-day
/// retry: exhausting it fails the attempt, and the schedule-level retry
/// takes over from there.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based): base, 2x base, 4x base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << attempt.saturating_sub(1).min(16))
    }

    /// `delay_for` plus up to 25% random jitter, so parallel workers do not
    /// retry in lockstep.
    fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        let jitter_cap = (delay.as_millis() / 4) as u64;
        if !self.jitter || jitter_cap == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap))
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    total_tokens: i64,
}

/// Production generator backed by a chat-completions style matching API.
pub struct MatchApiGenerator {
    client: reqwest::Client,
    settings: ApiSettings,
    retry: RetryPolicy,
}

impl MatchApiGenerator {
    pub fn from_settings(settings: &ApiSettings) -> anyhow::Result<Self> {
        if settings.key.trim().is_empty() {
            anyhow::bail!("MATCH_API_KEY is not configured");
        }
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self {
            client,
            settings: settings.clone(),
            retry: RetryPolicy {
                max_attempts: settings.max_attempts.max(1),
                base_delay: settings.retry_base_delay,
                jitter: settings.retry_jitter,
            },
        })
    }

    async fn request_once(&self, prompt: &str) -> Result<(String, i64), GenerationError> {
        let payload = serde_json::json!({
            "model": self.settings.model,
            "messages": [{"role": "user", "content": prompt}],
            "stream": false,
            "temperature": self.settings.temperature,
        });

        let response = self
            .client
            .post(&self.settings.url)
            .bearer_auth(&self.settings.key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Api {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let parsed: ApiResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| GenerationError::Malformed("response has no choices".to_string()))?;
        let tokens = parsed.usage.map(|usage| usage.total_tokens).unwrap_or(0);

        Ok((content, tokens))
    }
}

#[async_trait]
impl ContentGenerator for MatchApiGenerator {
    async fn generate(
        &self,
        profile: &FacultyProfile,
    ) -> Result<GeneratedDigest, GenerationError> {
        let started = Instant::now();
        let prompt = build_prompt(profile);
        let mut last_error: Option<GenerationError> = None;

        for attempt in 1..=self.retry.max_attempts {
            if attempt > 1 {
                let delay = self.retry.jittered_delay_for(attempt - 1);
                tracing::debug!(
                    email = %profile.email,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying generation request"
                );
                tokio::time::sleep(delay).await;
            }

            match self.request_once(&prompt).await {
                Ok((content, tokens_used)) => {
                    let elapsed_seconds = started.elapsed().as_secs_f64();
                    tracing::info!(
                        email = %profile.email,
                        tokens = tokens_used,
                        elapsed_seconds,
                        "generated digest content"
                    );
                    return Ok(GeneratedDigest {
                        content,
                        tokens_used,
                        elapsed_seconds,
                    });
                }
                Err(error) if error.is_transient() => {
                    tracing::warn!(
                        email = %profile.email,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        %error,
                        "transient generation failure"
                    );
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(GenerationError::Exhausted {
            attempts: self.retry.max_attempts,
            last: last_error
                .map(|error| error.to_string())
                .unwrap_or_else(|| "no error captured".to_string()),
        })
    }
}

/// Assemble the matching prompt from whichever profile fields are populated.
fn build_prompt(profile: &FacultyProfile) -> String {
    let mut parts = Vec::new();

    if !profile.research_area.is_empty() {
        parts.push(format!(
            "My research area of interest is {}",
            profile.research_area
        ));
    }
    if !profile.keywords.is_empty() {
        parts.push(format!("My keywords are {}", profile.keywords));
    }
    let constraints = profile.eligibility_constraints.trim();
    if !constraints.is_empty()
        && !matches!(
            constraints.to_lowercase().as_str(),
            "no" | "none" | "no constraints"
        )
    {
        parts.push(format!("My eligibility constraints are {constraints}"));
    }
    if !profile.early_career.is_empty() {
        parts.push(format!(
            "My early career faculty status is {}",
            profile.early_career
        ));
    }
    if !profile.funding_types.is_empty() {
        parts.push(format!(
            "The funding types I am interested in are {}",
            profile.funding_types
        ));
    }
    if !profile.award_size.is_empty() {
        parts.push(format!(
            "The award sizes I am interested in are {}",
            profile.award_size
        ));
    }
    if !profile.submission_timeline.is_empty() {
        parts.push(format!(
            "I would like to submit a proposal {}",
            profile.submission_timeline
        ));
    }
    if !profile.preferred_funding_sources.is_empty() {
        parts.push(format!(
            "Please consider funding sources including {}",
            profile.preferred_funding_sources
        ));
    }
    if !profile.additional_info.is_empty() {
        parts.push(format!("Additional context: {}", profile.additional_info));
    }

    if parts.is_empty() {
        format!("{PROMPT_INSTRUCTIONS}{PROMPT_REQUEST}")
    } else {
        format!("{PROMPT_INSTRUCTIONS}{}. {PROMPT_REQUEST}", parts.join(". "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Cadence;

    fn profile() -> FacultyProfile {
        FacultyProfile {
            email: "a@x.edu".to_string(),
            research_area: "computational materials science".to_string(),
            keywords: "alloys, phase fields".to_string(),
            eligibility_constraints: "none".to_string(),
            early_career: "Yes".to_string(),
            funding_types: String::new(),
            award_size: String::new(),
            submission_timeline: "within 6 months".to_string(),
            preferred_funding_sources: "NSF, DOE".to_string(),
            additional_info: String::new(),
            cadence: Cadence::Weekly,
            active: true,
            submitted_at: None,
        }
    }

    #[test]
    fn retry_delays_double_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn jittered_delay_stays_within_a_quarter_of_base() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            jitter: true,
        };
        for _ in 0..50 {
            let delay = policy.jittered_delay_for(1);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn transient_classification_covers_rate_limits_and_server_errors() {
        assert!(GenerationError::Api {
            status: 429,
            body: String::new()
        }
        .is_transient());
        assert!(GenerationError::Api {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(!GenerationError::Api {
            status: 401,
            body: String::new()
        }
        .is_transient());
        assert!(!GenerationError::Malformed("no choices".to_string()).is_transient());
    }

    #[test]
    fn prompt_includes_populated_fields_and_skips_empty_ones() {
        let prompt = build_prompt(&profile());
        assert!(prompt.contains("computational materials science"));
        assert!(prompt.contains("alloys, phase fields"));
        assert!(prompt.contains("within 6 months"));
        assert!(prompt.contains("NSF, DOE"));
        assert!(!prompt.contains("funding types I am interested in"));
    }

    #[test]
    fn prompt_omits_trivial_eligibility_constraints() {
        let prompt = build_prompt(&profile());
        assert!(!prompt.contains("eligibility constraints"));

        let mut constrained = profile();
        constrained.eligibility_constraints = "US citizens only".to_string();
        let prompt = build_prompt(&constrained);
        assert!(prompt.contains("My eligibility constraints are US citizens only"));
    }

    #[test]
    fn generator_requires_an_api_key() {
        let settings = ApiSettings {
            url: "https://api.example.com/chat/completions".to_string(),
            key: "  ".to_string(),
            model: "sonar-pro".to_string(),
            temperature: 0.2,
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_jitter: true,
        };
        assert!(MatchApiGenerator::from_settings(&settings).is_err());
    }
}
