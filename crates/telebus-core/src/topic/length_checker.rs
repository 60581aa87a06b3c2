//! Graded warnings for a consumer that falls behind.

/// Tracks queue length against a few warning thresholds.
///
/// Each threshold warns once; it re-arms after the queue shrinks to half of
/// the threshold below it.
#[derive(Debug, Clone)]
pub struct QueueLengthChecker {
    warn_lengths: Vec<usize>,
    warn_index: usize,
    reset_level: Option<usize>,
}

impl QueueLengthChecker {
    /// Minimum queue length that gets graded warnings.
    pub const MIN_QUEUE_LEN: usize = 10;

    /// Returns `None` when `queue_len` is below [`Self::MIN_QUEUE_LEN`].
    pub fn new(queue_len: usize) -> Option<Self> {
        if queue_len < Self::MIN_QUEUE_LEN {
            return None;
        }
        let mut warn_lengths = vec![(queue_len / 10).clamp(5, 10)];
        if queue_len >= 20 {
            warn_lengths.push(queue_len / 2);
        }
        warn_lengths.push(queue_len * 9 / 10);
        Some(Self {
            warn_lengths,
            warn_index: 0,
            reset_level: None,
        })
    }

    fn warn_level(&self) -> Option<usize> {
        self.warn_lengths.get(self.warn_index).copied()
    }

    /// Record the current length; returns false when a warning is due.
    pub fn length_ok(&mut self, length: usize) -> bool {
        match self.warn_level() {
            Some(level) if length >= level => {
                self.reset_level = Some(level / 2);
                self.warn_index += 1;
                return false;
            }
            _ => {}
        }
        if let Some(reset_level) = self.reset_level {
            if length <= reset_level {
                self.warn_index -= 1;
                self.reset_level = if self.warn_index > 0 {
                    Some(self.warn_lengths[self.warn_index - 1] / 2)
                } else {
                    None
                };
            }
        }
        true
    }
}
