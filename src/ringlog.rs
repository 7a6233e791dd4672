use std::collections::VecDeque;

/// Upper bound for both the communication log and the state log.
pub(crate) const RING_CAPACITY: usize = 500;

/// Newest-first bounded log of human readable lines.
#[derive(Debug)]
pub(crate) struct RingLog {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Default for RingLog {
    fn default() -> Self {
        Self::with_capacity(RING_CAPACITY)
    }
}

impl RingLog {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        while self.lines.len() >= self.capacity {
            self.lines.pop_back();
        }
        self.lines.push_front(line);
    }

    pub(crate) fn clear(&mut self) {
        self.lines.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.lines.len()
    }

    pub(crate) fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// Second-resolution UTC stamp used as the prefix of every log line.
pub(crate) fn stamp() -> String {
    let now = jiff::Timestamp::now();
    now.strftime("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_exceeds_capacity() {
        let mut log = RingLog::default();
        for i in 0..(RING_CAPACITY + 42) {
            log.push(format!("line {i}"));
        }
        assert_eq!(log.len(), RING_CAPACITY);
        assert_eq!(log.lines()[0], format!("line {}", RING_CAPACITY + 41));
    }

    #[test]
    fn newest_first() {
        let mut log = RingLog::with_capacity(2);
        log.push("a".into());
        log.push("b".into());
        log.push("c".into());
        assert_eq!(log.lines(), vec!["c".to_string(), "b".to_string()]);
    }
}
