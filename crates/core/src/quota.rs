use serde::{Deserialize, Serialize};

/// Outcome of checking a message against the sender's daily allowance.
///
/// Admission is all-or-nothing: a message that does not fit entirely is
/// rejected, never clipped to the remaining allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotaDecision {
    Admit,
    /// The sender already used the whole allowance for today.
    LimitReached { max: u64 },
    /// The message asks for more than what is left today.
    WouldExceed { requested: u64, remaining: u64 },
}

impl QuotaDecision {
    pub fn decide(given_today: u64, requested: u64, max_per_day: u64) -> Self {
        if given_today >= max_per_day {
            return Self::LimitReached { max: max_per_day };
        }
        let remaining = max_per_day - given_today;
        if requested > remaining {
            return Self::WouldExceed {
                requested,
                remaining,
            };
        }
        Self::Admit
    }

    pub fn is_admitted(self) -> bool {
        matches!(self, Self::Admit)
    }

    /// Channel notice for a rejected message; `None` when admitted.
    pub fn rejection_notice(self, sender: &str) -> Option<String> {
        match self {
            Self::Admit => None,
            Self::LimitReached { max } => Some(format!(
                "Sorry <@{sender}>, you have reached your daily limit of {max} beers."
            )),
            Self::WouldExceed {
                requested,
                remaining,
            } => Some(format!(
                "Sorry <@{sender}>, you are trying to give {requested} beers, but you only have {remaining} left for today."
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::QuotaDecision;

    #[test]
    fn admits_within_allowance() {
        assert_eq!(QuotaDecision::decide(9, 1, 10), QuotaDecision::Admit);
        assert_eq!(QuotaDecision::decide(0, 10, 10), QuotaDecision::Admit);
    }

    #[test]
    fn rejects_once_limit_is_reached() {
        assert_eq!(
            QuotaDecision::decide(10, 1, 10),
            QuotaDecision::LimitReached { max: 10 }
        );
        assert_eq!(
            QuotaDecision::decide(12, 1, 10),
            QuotaDecision::LimitReached { max: 10 }
        );
    }

    #[test]
    fn rejects_whole_message_instead_of_clipping() {
        assert_eq!(
            QuotaDecision::decide(8, 3, 10),
            QuotaDecision::WouldExceed {
                requested: 3,
                remaining: 2
            }
        );
    }

    #[test]
    fn notices_mention_the_sender() {
        let notice = QuotaDecision::decide(10, 1, 10).rejection_notice("U9").unwrap();
        assert!(notice.contains("<@U9>"));
        assert!(notice.contains("daily limit of 10"));
        let notice = QuotaDecision::decide(8, 3, 10).rejection_notice("U9").unwrap();
        assert!(notice.contains("only have 2 left"));
        assert!(QuotaDecision::Admit.rejection_notice("U9").is_none());
    }
}
