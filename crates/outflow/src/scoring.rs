//! Confidence scoring and the approval gate policy.

/// Confidence floor: no generated email scores below this.
pub const CONFIDENCE_FLOOR: u8 = 50;
/// Baseline confidence before deductions.
pub const CONFIDENCE_BASE: i32 = 95;

/// Deterministic confidence score for a generated email.
///
/// Start at 95; subtract `5 × spam_score`; subtract 10 when no company
/// context was available; subtract 5 when the step number is past 3;
/// floor at 50. The result gates auto-approval — it is an input to policy,
/// not a suggestion.
pub fn confidence_score(spam_score: f64, has_company: bool, step_number: u32) -> u8 {
    let mut score = CONFIDENCE_BASE - (5.0 * spam_score).round() as i32;
    if !has_company {
        score -= 10;
    }
    if step_number > 3 {
        score -= 5;
    }
    score.clamp(CONFIDENCE_FLOOR as i32, 100) as u8
}

/// Policy deciding whether a pending email may skip manual review.
///
/// Auto-approval requires confidence at or above the threshold AND, when a
/// spam ceiling is set, a spam score at or below it. The ceiling keeps a
/// high-confidence draft with an egregious spam score in the manual queue;
/// confidence alone never overrides it. Manual approval remains available
/// for anything held back.
#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    /// Minimum confidence for auto-approval. Default: 90.
    pub auto_approve_threshold: u8,
    /// Maximum spam score tolerated by the auto path. Default: 5.0.
    pub spam_ceiling: Option<f64>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            auto_approve_threshold: 90,
            spam_ceiling: Some(5.0),
        }
    }
}

impl ApprovalPolicy {
    pub fn auto_approves(&self, confidence: u8, spam_score: f64) -> bool {
        if confidence < self.auto_approve_threshold {
            return false;
        }
        match self.spam_ceiling {
            Some(ceiling) => spam_score <= ceiling,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_early_step_with_company() {
        // spam 0, company present, step <= 3 -> 95
        assert_eq!(confidence_score(0.0, true, 1), 95);
        assert_eq!(confidence_score(0.0, true, 3), 95);
    }

    #[test]
    fn deductions_stack() {
        // 95 - 5*2 - 10 - 5 = 70
        assert_eq!(confidence_score(2.0, false, 4), 70);
    }

    #[test]
    fn no_company_deduction() {
        assert_eq!(confidence_score(0.0, false, 1), 85);
    }

    #[test]
    fn late_step_deduction() {
        assert_eq!(confidence_score(0.0, true, 4), 90);
        // Boundary: step 3 is not "late".
        assert_eq!(confidence_score(0.0, true, 3), 95);
    }

    #[test]
    fn floors_at_fifty() {
        assert_eq!(confidence_score(20.0, false, 9), 50);
    }

    #[test]
    fn default_policy_approves_at_threshold() {
        let policy = ApprovalPolicy::default();

        assert!(policy.auto_approves(90, 0.0));
        assert!(policy.auto_approves(95, 1.0));
        assert!(!policy.auto_approves(89, 0.0));
    }

    #[test]
    fn spam_ceiling_blocks_auto_approval() {
        let policy = ApprovalPolicy::default();

        assert!(!policy.auto_approves(100, 5.5));
        assert!(policy.auto_approves(100, 5.0));
    }

    #[test]
    fn no_ceiling_means_confidence_only() {
        let policy = ApprovalPolicy {
            spam_ceiling: None,
            ..ApprovalPolicy::default()
        };

        assert!(policy.auto_approves(92, 50.0));
    }
}
