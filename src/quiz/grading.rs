use crate::domain::quiz::CorrectAnswer;
use crate::domain::session::ResponseAnswer;

/// Outcome of grading a single submitted answer against its question's
/// correct-answer record. Kept as a pure function of
/// `(correct_answer, answer, participation_points)` — spec.md §4.4 calls
/// for a time-bonus variant to be "out of scope but isolated behind a pure
/// scoring function so it can be swapped"; this is that seam.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradeOutcome {
    pub is_correct: Option<bool>,
    pub points_earned: i64,
}

/// All-or-nothing scoring (spec.md §4.4 point 6): correct answers earn the
/// question's full point value, incorrect answers earn zero, and polls
/// always earn the configured participation points with no correctness
/// verdict.
pub fn grade(correct: &CorrectAnswer, answer: &ResponseAnswer, question_points: u32) -> GradeOutcome {
    match (correct, answer) {
        (CorrectAnswer::MultipleChoice { answer: expected }, ResponseAnswer::MultipleChoice { selected: given }) => {
            let is_correct = expected == given;
            GradeOutcome {
                is_correct: Some(is_correct),
                points_earned: if is_correct { question_points as i64 } else { 0 },
            }
        }
        (CorrectAnswer::TrueFalse { answer: expected }, ResponseAnswer::TrueFalse { selected: given }) => {
            let is_correct = expected == given;
            GradeOutcome {
                is_correct: Some(is_correct),
                points_earned: if is_correct { question_points as i64 } else { 0 },
            }
        }
        (
            CorrectAnswer::ShortAnswer {
                answer: expected_text,
                keywords,
                min_keywords,
                case_sensitive,
            },
            ResponseAnswer::ShortAnswer { text: given },
        ) => {
            let case_sensitive = case_sensitive.unwrap_or(false);
            let is_correct = match (keywords, min_keywords) {
                (Some(keywords), Some(min_keywords)) if !keywords.is_empty() => {
                    let haystack = fold_case(given, case_sensitive);
                    let matched = keywords
                        .iter()
                        .filter(|kw| haystack.contains(&fold_case(kw, case_sensitive)))
                        .count();
                    matched >= *min_keywords
                }
                _ => {
                    let expected = expected_text.as_deref().unwrap_or("");
                    fold_case(expected, case_sensitive) == fold_case(given, case_sensitive)
                }
            };
            GradeOutcome {
                is_correct: Some(is_correct),
                points_earned: if is_correct { question_points as i64 } else { 0 },
            }
        }
        (CorrectAnswer::Poll { participation_points }, ResponseAnswer::Poll { .. }) => GradeOutcome {
            is_correct: None,
            points_earned: *participation_points,
        },
        // Question type and submitted-answer type disagree; the caller is
        // responsible for rejecting mismatched payloads before grading, so
        // this only triggers on a programming error upstream.
        _ => GradeOutcome {
            is_correct: Some(false),
            points_earned: 0,
        },
    }
}

fn fold_case(s: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        s.to_string()
    } else {
        s.to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_choice_correct() {
        let correct = CorrectAnswer::MultipleChoice { answer: "b".into() };
        let answer = ResponseAnswer::MultipleChoice { selected: "b".into() };
        let outcome = grade(&correct, &answer, 10);
        assert_eq!(outcome, GradeOutcome { is_correct: Some(true), points_earned: 10 });
    }

    #[test]
    fn multiple_choice_incorrect() {
        let correct = CorrectAnswer::MultipleChoice { answer: "b".into() };
        let answer = ResponseAnswer::MultipleChoice { selected: "a".into() };
        let outcome = grade(&correct, &answer, 10);
        assert_eq!(outcome, GradeOutcome { is_correct: Some(false), points_earned: 0 });
    }

    #[test]
    fn true_false() {
        let correct = CorrectAnswer::TrueFalse { answer: true };
        let answer = ResponseAnswer::TrueFalse { selected: true };
        assert_eq!(grade(&correct, &answer, 5).points_earned, 5);
        let answer = ResponseAnswer::TrueFalse { selected: false };
        assert_eq!(grade(&correct, &answer, 5).points_earned, 0);
    }

    // spec.md §8 S2: keyword short answer, min 2 of 3, case-insensitive.
    #[test]
    fn short_answer_keyword_match_case_insensitive() {
        let correct = CorrectAnswer::ShortAnswer {
            answer: None,
            keywords: Some(vec!["chlorophyll".into(), "sunlight".into(), "glucose".into()]),
            min_keywords: Some(2),
            case_sensitive: Some(false),
        };
        let answer = ResponseAnswer::ShortAnswer {
            text: "Plants use SUNLIGHT and chlorophyll to make food.".into(),
        };
        let outcome = grade(&correct, &answer, 10);
        assert_eq!(outcome, GradeOutcome { is_correct: Some(true), points_earned: 10 });
    }

    #[test]
    fn short_answer_keyword_below_threshold() {
        let correct = CorrectAnswer::ShortAnswer {
            answer: None,
            keywords: Some(vec!["chlorophyll".into(), "sunlight".into(), "glucose".into()]),
            min_keywords: Some(2),
            case_sensitive: Some(false),
        };
        let answer = ResponseAnswer::ShortAnswer { text: "Plants make food.".into() };
        assert_eq!(grade(&correct, &answer, 10).is_correct, Some(false));
    }

    #[test]
    fn short_answer_whole_string_equality_when_no_keywords() {
        let correct = CorrectAnswer::ShortAnswer {
            answer: Some("Paris".into()),
            keywords: None,
            min_keywords: None,
            case_sensitive: Some(false),
        };
        let answer = ResponseAnswer::ShortAnswer { text: "paris".into() };
        assert_eq!(grade(&correct, &answer, 10).is_correct, Some(true));
    }

    #[test]
    fn short_answer_case_sensitive_mismatch() {
        let correct = CorrectAnswer::ShortAnswer {
            answer: Some("Paris".into()),
            keywords: None,
            min_keywords: None,
            case_sensitive: Some(true),
        };
        let answer = ResponseAnswer::ShortAnswer { text: "paris".into() };
        assert_eq!(grade(&correct, &answer, 10).is_correct, Some(false));
    }

    #[test]
    fn poll_has_no_correctness_but_earns_participation_points() {
        let correct = CorrectAnswer::Poll { participation_points: 5 };
        let answer = ResponseAnswer::Poll { selected: "x".into() };
        let outcome = grade(&correct, &answer, 0);
        assert_eq!(outcome, GradeOutcome { is_correct: None, points_earned: 5 });
    }
}
