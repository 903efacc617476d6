//! Output capture and truncation for supervised processes.

use std::borrow::Cow;
use std::io::{BufRead, BufReader, Read};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

pub(crate) const OUTPUT_CHAR_LIMIT: usize = 2_048;
pub(crate) const TRUNCATION_SUFFIX: &str = "… [truncated]";

/// Upper bound on retained output; older lines are discarded first.
const BUFFER_BYTE_LIMIT: usize = 64 * 1024;

/// Shared buffer collecting the interleaved stdout and stderr of a process.
#[derive(Debug, Clone, Default)]
pub(crate) struct OutputBuffer {
    inner: Arc<Mutex<String>>,
}

impl OutputBuffer {
    pub(crate) fn push_line(&self, line: &str) {
        let mut buffer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.push_str(line);
        buffer.push('\n');
        if buffer.len() > BUFFER_BYTE_LIMIT {
            let excess = buffer.len() - BUFFER_BYTE_LIMIT;
            let cut = buffer
                .char_indices()
                .map(|(idx, _)| idx)
                .find(|idx| *idx >= excess)
                .unwrap_or(buffer.len());
            buffer.replace_range(..cut, "");
        }
    }

    /// Returns everything captured so far.
    pub(crate) fn snapshot(&self) -> String {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the captured output truncated for diagnostics.
    pub(crate) fn rendered(&self) -> String {
        truncate_output(Cow::Owned(self.snapshot()))
    }

    /// Spawns a thread copying `stream` into the buffer line by line.
    pub(crate) fn drain<R>(&self, stream: R, label: &'static str) -> std::io::Result<JoinHandle<()>>
    where
        R: Read + Send + 'static,
    {
        let buffer = self.clone();
        thread::Builder::new()
            .name(format!("tiny-postgres-{label}"))
            .spawn(move || {
                for line in BufReader::new(stream).lines() {
                    match line {
                        Ok(line) => buffer.push_line(&line),
                        Err(_) => break,
                    }
                }
            })
    }
}

/// Renders stdout and stderr of a finished command for error messages.
pub(crate) fn render_streams(stdout: &[u8], stderr: &[u8]) -> String {
    let stdout = truncate_output(String::from_utf8_lossy(stdout));
    let stderr = truncate_output(String::from_utf8_lossy(stderr));
    format!("stdout: {stdout}\nstderr: {stderr}")
}

pub(crate) fn truncate_output(text: Cow<'_, str>) -> String {
    let mut out = String::with_capacity(OUTPUT_CHAR_LIMIT + TRUNCATION_SUFFIX.len());
    let mut chars = text.chars();
    for _ in 0..OUTPUT_CHAR_LIMIT {
        match chars.next() {
            Some(ch) => out.push(ch),
            None => return text.into_owned(),
        }
    }

    if chars.next().is_none() {
        return text.into_owned();
    }

    out.push_str(TRUNCATION_SUFFIX);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::short("ready", "ready")]
    #[case::exact(&"x".repeat(OUTPUT_CHAR_LIMIT), &"x".repeat(OUTPUT_CHAR_LIMIT))]
    fn truncate_output_leaves_short_text_alone(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(truncate_output(Cow::Borrowed(input)), expected);
    }

    #[rstest]
    fn truncate_output_marks_truncation_on_char_boundaries() {
        let input = "é".repeat(OUTPUT_CHAR_LIMIT + 5);
        let truncated = truncate_output(Cow::Owned(input));

        assert!(truncated.ends_with(TRUNCATION_SUFFIX));
        assert_eq!(
            truncated.chars().count(),
            OUTPUT_CHAR_LIMIT + TRUNCATION_SUFFIX.chars().count()
        );
    }

    #[rstest]
    fn buffer_discards_oldest_output_beyond_limit() {
        let buffer = OutputBuffer::default();
        let line = "a".repeat(1_023);
        for _ in 0..80 {
            buffer.push_line(&line);
        }
        buffer.push_line("LOG:  database system is ready to accept connections");

        let snapshot = buffer.snapshot();
        assert!(snapshot.len() <= BUFFER_BYTE_LIMIT);
        assert!(snapshot.ends_with("ready to accept connections\n"));
    }

    #[rstest]
    fn drain_collects_stream_lines() {
        let buffer = OutputBuffer::default();
        let handle = buffer
            .drain(&b"first\nsecond\n"[..], "test")
            .expect("spawn drain");
        handle.join().expect("drain thread");

        assert_eq!(buffer.snapshot(), "first\nsecond\n");
    }

    #[rstest]
    fn render_streams_labels_each_stream() {
        let rendered = render_streams(b"out", b"err");

        assert_eq!(rendered, "stdout: out\nstderr: err");
    }
}
