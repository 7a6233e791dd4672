//! User defined state and alarm triggers.
//!
//! The plugin only ever raises trigger flags. Lowering them is left to the user.

pub(crate) const TRIGGER_SLOTS: usize = 4;

/// Item path of state trigger `n` (1-based).
pub(crate) fn state_flag(n: usize) -> String {
    format!("trigger.state_trigger_{n}")
}

pub(crate) fn state_pattern(n: usize) -> String {
    format!("trigger.state_trigger_{n}.state")
}

pub(crate) fn alarm_flag(n: usize) -> String {
    format!("trigger.alarm_trigger_{n}")
}

pub(crate) fn alarm_pattern(n: usize) -> String {
    format!("trigger.alarm_trigger_{n}.alarm")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Triggers {
    pub(crate) state: [String; TRIGGER_SLOTS],
    pub(crate) alarm: [String; TRIGGER_SLOTS],
}

impl Triggers {
    /// 1-based slots whose state pattern matches `code`.
    ///
    /// Patterns look like `00518-Mähe`; only the part before the first `-` is
    /// compared against the code zero-padded to five digits.
    pub(crate) fn match_state(&self, code: u32) -> Vec<usize> {
        let code = format!("{code:05}");
        self.state
            .iter()
            .enumerate()
            .filter(|(_, pattern)| pattern.split('-').next().map(str::trim) == Some(code.as_str()))
            .map(|(i, _)| i + 1)
            .collect()
    }

    /// 1-based slots whose alarm pattern occurs in `text`, ignoring case.
    pub(crate) fn match_alarm(&self, text: &str) -> Vec<usize> {
        let text = text.to_lowercase();
        self.alarm
            .iter()
            .enumerate()
            .filter(|(_, pattern)| !pattern.is_empty() && text.contains(&pattern.to_lowercase()))
            .map(|(i, _)| i + 1)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_patterns_compare_padded_codes() {
        let triggers = Triggers {
            state: [
                "00518-Mähe".into(),
                "00000".into(),
                "".into(),
                "00775 - Fertig".into(),
            ],
            ..Default::default()
        };
        assert_eq!(triggers.match_state(518), vec![1]);
        assert_eq!(triggers.match_state(0), vec![2]);
        assert_eq!(triggers.match_state(775), vec![4]);
        assert!(triggers.match_state(5180).is_empty());
    }

    #[test]
    fn alarm_patterns_are_case_insensitive() {
        let triggers = Triggers {
            alarm: ["blade".into(), "".into(), "SERVICE".into(), "rain".into()],
            ..Default::default()
        };
        assert_eq!(triggers.match_alarm("Blade worn Service"), vec![1, 3]);
        assert!(triggers.match_alarm("").is_empty());
    }

    #[test]
    fn item_paths() {
        assert_eq!(state_flag(1), "trigger.state_trigger_1");
        assert_eq!(alarm_pattern(4), "trigger.alarm_trigger_4.alarm");
    }
}
