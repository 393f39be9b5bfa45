//! Bounded output accumulation for spawned commands.

/// Combined stdout/stderr of one process.
///
/// Once `max_chars` is exceeded the oldest quarter is dropped; `total_bytes`
/// keeps counting everything ever received.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    combined: String,
    max_chars: usize,
    total_bytes: usize,
}

impl OutputBuffer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            combined: String::new(),
            max_chars,
            total_bytes: 0,
        }
    }

    pub fn push(&mut self, text: &str) {
        self.total_bytes += text.len();
        self.combined.push_str(text);
        if self.combined.len() > self.max_chars {
            let keep = self.max_chars * 3 / 4;
            let mut boundary = self.combined.len() - keep;
            while boundary < self.combined.len() && !self.combined.is_char_boundary(boundary) {
                boundary += 1;
            }
            self.combined.drain(..boundary);
        }
    }

    pub fn as_str(&self) -> &str {
        &self.combined
    }

    pub fn len(&self) -> usize {
        self.combined.len()
    }

    pub fn is_empty(&self) -> bool {
        self.combined.is_empty()
    }

    /// Bytes received since the process started, including any already dropped.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Last `lines` lines.
    pub fn tail(&self, lines: usize) -> String {
        let all_lines: Vec<&str> = self.combined.lines().collect();
        if all_lines.len() <= lines {
            self.combined.clone()
        } else {
            all_lines[all_lines.len() - lines..].join("\n")
        }
    }

    /// Last `max` bytes, cut on a char boundary, with a marker when anything was cut.
    pub fn tail_chars(&self, max: usize) -> String {
        tail_chars(&self.combined, max)
    }
}

pub(crate) fn tail_chars(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[... {} earlier bytes omitted]\n{}", start, &text[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_tail_lines() {
        let mut buf = OutputBuffer::new(1000);
        buf.push("one\ntwo\n");
        buf.push("three\n");
        assert_eq!(buf.tail(2), "two\nthree");
        assert_eq!(buf.tail(10), "one\ntwo\nthree\n");
    }

    #[test]
    fn test_cap_drops_oldest_but_counts_total() {
        let mut buf = OutputBuffer::new(100);
        for _ in 0..10 {
            buf.push(&"x".repeat(30));
        }
        assert!(buf.len() <= 100);
        assert_eq!(buf.total_bytes(), 300);
    }

    #[test]
    fn test_cap_respects_char_boundaries() {
        let mut buf = OutputBuffer::new(10);
        buf.push("ééééééééé");
        assert!(buf.as_str().chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_tail_chars() {
        let mut buf = OutputBuffer::new(1000);
        buf.push("abcdefghij");
        assert_eq!(buf.tail_chars(20), "abcdefghij");
        let cut = buf.tail_chars(4);
        assert!(cut.ends_with("ghij"));
        assert!(cut.contains("6 earlier bytes omitted"));
    }
}
