use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::llm::{CompletionService, LlmError};
use crate::prompts::PromptTemplate;
use crate::quota::QuotaTracker;
use crate::record::Record;

/// Result of describing one record. Exactly one per record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Description(String),
    /// Identifying field was blank; no call was made.
    Skipped,
    Failed(String),
}

impl Outcome {
    /// The text written to the output row for this outcome.
    pub fn row_text(&self) -> String {
        match self {
            Outcome::Description(text) => text.clone(),
            Outcome::Skipped => String::new(),
            Outcome::Failed(message) => format!("Error: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub outcome: Outcome,
    /// Calls made, including rate-limited ones.
    pub attempts: u32,
    pub quota_waits: u32,
}

pub struct DescriptionGenerator<S> {
    service: S,
    template: PromptTemplate,
    retry: RetryConfig,
}

impl<S: CompletionService> DescriptionGenerator<S> {
    pub fn new(service: S, template: PromptTemplate, retry: RetryConfig) -> Self {
        Self {
            service,
            template,
            retry,
        }
    }

    #[cfg(test)]
    pub fn service(&self) -> &S {
        &self.service
    }

    /// Describe one record. Per-record failures are folded into the outcome.
    ///
    /// Rate-limit rejections are retried after `retry.schedule[attempt]`; any other
    /// error, or a rejection once the schedule is used up, fails the record.
    pub async fn generate(&self, row: u64, record: &Record, quota: &QuotaTracker) -> Generation {
        if record.is_unidentified() {
            debug!(row, "Skipping row with empty filename");
            return Generation {
                outcome: Outcome::Skipped,
                attempts: 0,
                quota_waits: 0,
            };
        }

        let filename = record.filename().trim();
        let request = self.template.build(record);
        let mut quota_waits = 0u32;
        let mut attempt = 0usize;

        loop {
            if quota.acquire().await {
                quota_waits += 1;
            }
            debug!(row, filename, attempt = attempt + 1, "Requesting description");

            let result =
                match tokio::time::timeout(self.retry.call_timeout, self.service.complete(&request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout(self.retry.call_timeout)),
                };
            let attempts = attempt as u32 + 1;

            match result {
                Ok(completion) => {
                    if let Some(usage) = completion.usage {
                        debug!(
                            row,
                            cache_created = usage.cache_created,
                            cache_read = usage.cache_read,
                            uncached = usage.uncached,
                            output = usage.output,
                            "Token usage"
                        );
                    }
                    info!(row, filename, attempt = attempts, "Description generated");
                    tokio::time::sleep(self.retry.call_delay).await;
                    return Generation {
                        outcome: Outcome::Description(completion.text),
                        attempts,
                        quota_waits,
                    };
                }
                Err(e) => match (e.is_rate_limited(), self.retry.schedule.get(attempt)) {
                    (true, Some(&delay)) => {
                        warn!(
                            row,
                            filename,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            "Rate limited, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    (rate_limited, _) => {
                        warn!(
                            row,
                            filename,
                            attempt = attempts,
                            rate_limited,
                            error = %e,
                            "Description failed"
                        );
                        return Generation {
                            outcome: Outcome::Failed(e.to_string()),
                            attempts,
                            quota_waits,
                        };
                    }
                },
            }
        }
    }
}
