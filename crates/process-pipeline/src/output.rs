//! Output aggregation: chunk dispatch, line splitting, and lazy line streams
//!
//! Each stdio stream of a subprocess is routed through a [`Dispatch`] slot.
//! By default chunks accumulate in a buffer that feeds the whole-result
//! `stdout`/`stderr`/`output` fields. Claiming a stream for line iteration or
//! for piping switches the slot, and the two consumption paths stay mutually
//! exclusive: bytes consumed through iteration never reappear in the awaited
//! result.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_channel::{Receiver, Sender};
use futures::{FutureExt, Stream};

use crate::error::SubprocessError;
use crate::process::SharedDriver;

/// Which stdio stream a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// A raw chunk of output tagged with its source.
#[derive(Debug, Clone)]
pub(crate) struct OutputChunk {
    pub(crate) source: OutputSource,
    pub(crate) data: Vec<u8>,
}

/// Routing state for one stdio stream of one subprocess.
#[derive(Debug)]
pub(crate) enum Dispatch {
    /// Accumulate chunks for the whole-result fields (the default).
    Buffer(Vec<u8>),
    /// Stream claimed for line iteration; chunks go to the channel only.
    Stream(Sender<OutputChunk>),
    /// Stream feeding pipeline destinations or a caller-supplied sink.
    /// Chunks are broadcast to every sender and still buffered, so the
    /// source's own result keeps its output.
    Pipe {
        txs: Vec<Sender<Vec<u8>>>,
        buf: Vec<u8>,
    },
    /// The subprocess settled; late chunks and claims see an empty stream.
    Closed,
}

/// Split `data` into complete lines, carrying a partial line across calls.
///
/// `\n` and `\r\n` are both line separators; blank lines are preserved as
/// empty elements, and a trailing newline produces no extra element.
pub(crate) fn split_lines(partial: &mut Vec<u8>, data: &[u8], out: &mut VecDeque<String>) {
    let mut rest = data;
    while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
        partial.extend_from_slice(&rest[..pos]);
        if partial.last() == Some(&b'\r') {
            partial.pop();
        }
        out.push_back(String::from_utf8_lossy(partial).into_owned());
        partial.clear();
        rest = &rest[pos + 1..];
    }
    partial.extend_from_slice(rest);
}

/// Render a captured buffer as text, collapsing at most one trailing newline.
pub(crate) fn into_text(buf: Vec<u8>) -> String {
    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if text.ends_with('\n') {
        text.pop();
        if text.ends_with('\r') {
            text.pop();
        }
    }
    text
}

/// Combined output: stdout when stderr is empty, stderr when stdout is empty,
/// and the two joined with a single newline otherwise.
pub(crate) fn combined(stdout: &str, stderr: &str) -> String {
    match (stdout.is_empty(), stderr.is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{stdout}\n{stderr}"),
    }
}

/// Lazy stream of output lines from a subprocess.
///
/// Yields `Ok(line)` for each complete line. If the subprocess fails, the
/// stream yields the same [`SubprocessError`] the awaited result would carry,
/// after whatever lines were produced first, then ends.
pub struct LineStream {
    // Boxed and pinned so the stream stays `Unpin` even though the
    // receiver itself is not.
    rx: Option<Pin<Box<Receiver<OutputChunk>>>>,
    driver: SharedDriver,
    /// Driver outcome once observed; only the error matters here.
    done: Option<Result<(), SubprocessError>>,
    /// Partial-line carry, indexed by stream (stdout, stderr).
    partials: [Vec<u8>; 2],
    ready: VecDeque<String>,
    /// Claim-conflict error to yield before anything else.
    early: Option<SubprocessError>,
    finished: bool,
}

impl LineStream {
    pub(crate) fn new(rx: Option<Receiver<OutputChunk>>, driver: SharedDriver) -> Self {
        Self {
            rx: rx.map(Box::pin),
            driver,
            done: None,
            partials: [Vec::new(), Vec::new()],
            ready: VecDeque::new(),
            early: None,
            finished: false,
        }
    }

    /// A stream that yields a single claim-conflict error.
    pub(crate) fn failed(error: SubprocessError, driver: SharedDriver) -> Self {
        let mut stream = Self::new(None, driver);
        stream.done = Some(Ok(()));
        stream.early = Some(error);
        stream
    }

    fn partial_index(source: OutputSource) -> usize {
        match source {
            OutputSource::Stdout => 0,
            OutputSource::Stderr => 1,
        }
    }
}

impl Stream for LineStream {
    type Item = Result<String, SubprocessError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if let Some(err) = this.early.take() {
            this.finished = true;
            return Poll::Ready(Some(Err(err)));
        }
        loop {
            if let Some(line) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(line)));
            }

            // Keep the subprocess driven: nothing pumps the stdio streams
            // unless some consumer polls the shared driver.
            if this.done.is_none() {
                if let Poll::Ready(settled) = this.driver.poll_unpin(cx) {
                    this.done = Some(settled.map(|_| ()));
                }
            }

            match &mut this.rx {
                Some(rx) => match rx.as_mut().poll_next(cx) {
                    Poll::Ready(Some(chunk)) => {
                        let idx = Self::partial_index(chunk.source);
                        split_lines(&mut this.partials[idx], &chunk.data, &mut this.ready);
                    }
                    Poll::Ready(None) => {
                        this.rx = None;
                        for partial in &mut this.partials {
                            if !partial.is_empty() {
                                let tail = std::mem::take(partial);
                                this.ready
                                    .push_back(String::from_utf8_lossy(&tail).into_owned());
                            }
                        }
                    }
                    Poll::Pending => return Poll::Pending,
                },
                None => match this.done.take() {
                    Some(Err(err)) => {
                        this.finished = true;
                        return Poll::Ready(Some(Err(err)));
                    }
                    Some(Ok(())) => {
                        this.finished = true;
                        return Poll::Ready(None);
                    }
                    None => return Poll::Pending,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines_of(chunks: &[&[u8]]) -> Vec<String> {
        let mut partial = Vec::new();
        let mut out = VecDeque::new();
        for chunk in chunks {
            split_lines(&mut partial, chunk, &mut out);
        }
        if !partial.is_empty() {
            out.push_back(String::from_utf8_lossy(&partial).into_owned());
        }
        out.into_iter().collect()
    }

    #[test]
    fn splits_on_lf_and_crlf() {
        assert_eq!(lines_of(&[b"a\nb\r\nc\n"]), vec!["a", "b", "c"]);
    }

    #[test]
    fn preserves_blank_lines() {
        assert_eq!(lines_of(&[b"a\n\nb\n"]), vec!["a", "", "b"]);
        assert_eq!(lines_of(&[b"\nx\n"]), vec!["", "x"]);
    }

    #[test]
    fn trailing_newline_yields_no_extra_element() {
        assert_eq!(lines_of(&[b"foo\n"]), vec!["foo"]);
        assert_eq!(lines_of(&[b"foo"]), vec!["foo"]);
    }

    #[test]
    fn crlf_split_across_chunks() {
        assert_eq!(lines_of(&[b"a\r", b"\nb"]), vec!["a", "b"]);
    }

    #[test]
    fn into_text_collapses_one_trailing_newline() {
        assert_eq!(into_text(b"foo\n".to_vec()), "foo");
        assert_eq!(into_text(b"foo\r\n".to_vec()), "foo");
        assert_eq!(into_text(b"foo\n\n\n".to_vec()), "foo\n\n");
        assert_eq!(into_text(b"foo".to_vec()), "foo");
        assert_eq!(into_text(Vec::new()), "");
    }

    #[test]
    fn line_stream_is_unpin() {
        // The `Stream` impls here and on `Subprocess` rely on this.
        fn assert_unpin<T: Unpin>() {}
        assert_unpin::<LineStream>();
    }

    #[test]
    fn combined_join_rules() {
        assert_eq!(combined("out", ""), "out");
        assert_eq!(combined("", "err"), "err");
        assert_eq!(combined("out", "err"), "out\nerr");
        assert_eq!(combined("", ""), "");
    }
}
