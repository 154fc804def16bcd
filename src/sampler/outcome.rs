use std::time::{Duration, Instant, SystemTime};

use crate::sampler::classify;

/// Result of one sample operation, handed back to the harness. Timing
/// covers the sampling loop only, never channel setup, and is recorded
/// for failures too so latency statistics include failed attempts.
#[derive(Debug, Clone)]
pub struct SampleOutcome {
    pub label: String,
    pub success: bool,
    pub response_code: String,
    pub response_message: String,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    /// Newline-separated `Name: value` lines.
    pub request_headers: Option<String>,
    pub response_headers: Option<String>,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
    pub elapsed: Option<Duration>,
    started_at: Option<Instant>,
}

impl SampleOutcome {
    /// Starts out failed with the generic code; success is earned.
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            success: false,
            response_code: classify::RESPONSE_CODE_GENERIC.to_string(),
            response_message: String::new(),
            request_body: None,
            response_body: None,
            request_headers: None,
            response_headers: None,
            start_time: None,
            end_time: None,
            elapsed: None,
            started_at: None,
        }
    }

    pub fn sample_start(&mut self) {
        self.start_time = Some(SystemTime::now());
        self.started_at = Some(Instant::now());
    }

    pub fn sample_end(&mut self) {
        if self.end_time.is_none() {
            self.end_time = Some(SystemTime::now());
            self.elapsed = self.started_at.map(|s| s.elapsed());
        }
    }

    pub fn set_ok(&mut self) {
        self.response_code = classify::RESPONSE_CODE_OK.to_string();
        self.response_message = "OK".to_string();
        self.success = true;
    }

    pub fn fail(&mut self, code: &str, message: impl Into<String>) {
        self.success = false;
        self.response_code = code.to_string();
        self.response_message = message.into();
    }

    /// Failure keeping the preset response code.
    pub fn set_message(&mut self, message: impl Into<String>) {
        self.response_message = message.into();
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_failed_with_generic_code() {
        let outcome = SampleOutcome::new("test");
        assert!(!outcome.success);
        assert_eq!(outcome.response_code, "500");
        assert!(outcome.start_time.is_none());
    }

    #[test]
    fn ok_sets_code_and_message() {
        let mut outcome = SampleOutcome::new("test");
        outcome.set_ok();
        assert!(outcome.success);
        assert_eq!(outcome.response_code, "200");
        assert_eq!(outcome.response_message, "OK");
    }

    #[test]
    fn timing_recorded_between_start_and_end() {
        let mut outcome = SampleOutcome::new("test");
        outcome.sample_start();
        outcome.sample_end();
        assert!(outcome.start_time.is_some());
        assert!(outcome.end_time.is_some());
        assert!(outcome.elapsed.is_some());
    }

    #[test]
    fn second_end_does_not_overwrite() {
        let mut outcome = SampleOutcome::new("test");
        outcome.sample_start();
        outcome.sample_end();
        let first = outcome.end_time;
        outcome.sample_end();
        assert_eq!(outcome.end_time, first);
    }
}
