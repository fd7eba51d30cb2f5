use crate::info;
use parking_lot::Mutex;
use std::collections::VecDeque;

const MAX_LINES: usize = 64;

/// Script output: logged, and the most recent lines kept for inspection.
#[derive(Default)]
pub struct Console {
    lines: Mutex<VecDeque<String>>,
}

impl Console {
    pub fn puts(&self, text: &str) {
        let line = text.trim_end_matches('\n');
        info!("[script] {line}");
        let mut lines = self.lines.lock();
        if lines.len() == MAX_LINES {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    /// Returns and forgets the recorded lines.
    pub fn take(&self) -> Vec<String> {
        self.lines.lock().drain(..).collect()
    }
}
