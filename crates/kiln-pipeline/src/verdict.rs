//! Test verdict from environment logs.
//!
//! The test image prints a sentinel line before each execution of the
//! payload. Only output after the last sentinel belongs to the current
//! run; without a sentinel the whole log is considered. Matching is
//! exact-substring and case-sensitive.

/// Outcome of evaluating a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// `excerpt` is the considered text that contained a failure marker.
    Fail { excerpt: String },
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

#[derive(Debug, Clone)]
pub struct VerdictEvaluator {
    sentinel: String,
    markers: Vec<String>,
}

impl Default for VerdictEvaluator {
    fn default() -> Self {
        Self::new(
            "Code updated, running...",
            vec!["Error".to_string(), "Traceback".to_string()],
        )
    }
}

impl VerdictEvaluator {
    pub fn new(sentinel: impl Into<String>, markers: Vec<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
            markers,
        }
    }

    /// The part of `log` produced by the most recent execution.
    pub fn considered<'a>(&self, log: &'a str) -> &'a str {
        if self.sentinel.is_empty() {
            return log;
        }
        log.rsplit_once(self.sentinel.as_str())
            .map(|(_, after)| after)
            .unwrap_or(log)
    }

    pub fn evaluate(&self, log: &str) -> Verdict {
        let considered = self.considered(log);
        let failed = self
            .markers
            .iter()
            .any(|marker| !marker.is_empty() && considered.contains(marker.as_str()));
        if failed {
            Verdict::Fail {
                excerpt: considered.to_string(),
            }
        } else {
            Verdict::Pass
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_run_after_sentinel_passes() {
        let eval = VerdictEvaluator::default();
        assert_eq!(eval.evaluate("Code updated, running...\nhello"), Verdict::Pass);
    }

    #[test]
    fn traceback_after_sentinel_fails() {
        let eval = VerdictEvaluator::default();
        let verdict = eval.evaluate("Code updated, running...\nTraceback (most recent call last)");
        assert_eq!(
            verdict,
            Verdict::Fail {
                excerpt: "\nTraceback (most recent call last)".to_string()
            }
        );
    }

    #[test]
    fn no_sentinel_considers_whole_log() {
        let eval = VerdictEvaluator::default();
        assert!(eval.evaluate("no marker, no failure text").passed());
        assert!(!eval.evaluate("no marker, contains Error").passed());
    }

    #[test]
    fn only_latest_run_counts() {
        let eval = VerdictEvaluator::default();
        let log = "Code updated, running...\nTraceback (most recent call last):\nValueError: x\n\
                   Code updated, running...\nall good\n";
        assert!(eval.evaluate(log).passed());

        let log = "Code updated, running...\nfine\nCode updated, running...\nNameError: y\n";
        assert_eq!(
            eval.evaluate(log),
            Verdict::Fail {
                excerpt: "\nNameError: y\n".to_string()
            }
        );
    }

    #[test]
    fn markers_are_case_sensitive() {
        let eval = VerdictEvaluator::default();
        assert!(eval.evaluate("Code updated, running...\nerror: lowercase\n").passed());
        assert!(eval.evaluate("Code updated, running...\nTRACEBACK\n").passed());
        // Substring match: any identifier containing the marker fails.
        assert!(!eval.evaluate("Code updated, running...\nErrorless\n").passed());
    }

    #[test]
    fn custom_sentinel_and_markers() {
        let eval = VerdictEvaluator::new("--- run ---", vec!["FAIL".to_string()]);
        assert!(eval.evaluate("FAIL\n--- run ---\nok\n").passed());
        assert!(!eval.evaluate("--- run ---\nFAIL: test_x\n").passed());
        assert_eq!(eval.considered("a--- run ---b--- run ---c"), "c");
    }
}
