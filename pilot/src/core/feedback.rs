//! Reviewer feedback accumulated across convergence rounds.

/// Per-round rejection text for one convergence loop.
///
/// Rounds are kept in ascending order; recording twice for the same round
/// replaces the earlier text (the last reject of a round wins).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedbackLog {
    rounds: Vec<(u32, String)>,
}

impl FeedbackLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, round: u32, text: &str) {
        match self.rounds.iter_mut().find(|(existing, _)| *existing == round) {
            Some(entry) => entry.1 = text.to_string(),
            None => {
                self.rounds.push((round, text.to_string()));
                self.rounds.sort_by_key(|(round, _)| *round);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    /// Text exposed to the next children as `{{FEEDBACK}}`.
    ///
    /// A single round is returned raw. Two or more rounds get one section
    /// each, in ascending round order, headed by a markdown `### Round N`
    /// line and separated by blank lines so the prompt stays readable:
    ///
    /// ```text
    /// ### Round 1
    ///
    /// needs tests
    ///
    /// ### Round 2
    ///
    /// rename helper
    /// ```
    pub fn render(&self) -> Option<String> {
        match self.rounds.as_slice() {
            [] => None,
            [(_, only)] => Some(only.clone()),
            rounds => Some(
                rounds
                    .iter()
                    .map(|(round, text)| format!("### Round {round}\n\n{text}"))
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            ),
        }
    }
}
