//! Protocol adapters: wire-format mapping at the edge.
//!
//! Two adapters publish the OpenAI (`/v1`) and Ollama (`/api`) namespaces
//! against the same router; `system` carries the management endpoints.

pub mod ollama;
pub mod openai;
pub mod system;

use std::collections::VecDeque;

use axum::body::Bytes;
use futures::{Stream, StreamExt};

use crate::pool::SlotHandle;

/// Keep a slot checked out for as long as a response stream is alive.  The
/// handle is owned by the mapping closure, so dropping the stream (including
/// on client disconnect) releases the slot.
pub(crate) fn guard_stream<S, T>(stream: S, handle: SlotHandle) -> impl Stream<Item = T>
where
    S: Stream<Item = T>,
{
    let handle = Some(handle);
    stream.map(move |item| {
        let _keep = &handle;
        item
    })
}

/// Incrementally decode SSE `data:` payloads out of a byte stream.  Frames
/// arrive in chunk-sized pieces with no line alignment; this buffers across
/// chunk boundaries and yields one payload per `data:` line, including the
/// terminal `[DONE]` marker.
pub(crate) fn sse_data_frames<S>(
    stream: S,
) -> impl Stream<Item = Result<String, reqwest::Error>>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    struct State<S> {
        stream: S,
        buffer: String,
        queue: VecDeque<String>,
        finished: bool,
    }

    futures::stream::unfold(
        State {
            stream,
            buffer: String::new(),
            queue: VecDeque::new(),
            finished: false,
        },
        |mut st| async move {
            loop {
                if let Some(frame) = st.queue.pop_front() {
                    return Some((Ok(frame), st));
                }
                if st.finished {
                    return None;
                }
                match st.stream.next().await {
                    Some(Ok(chunk)) => {
                        st.buffer.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(pos) = st.buffer.find('\n') {
                            let line: String = st.buffer.drain(..=pos).collect();
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            let data = line
                                .strip_prefix("data: ")
                                .or_else(|| line.strip_prefix("data:"))
                                .unwrap_or(line)
                                .trim();
                            if !data.is_empty() {
                                st.queue.push_back(data.to_string());
                            }
                        }
                    }
                    Some(Err(e)) => {
                        st.finished = true;
                        return Some((Err(e), st));
                    }
                    None => {
                        st.finished = true;
                        let rest = st.buffer.trim();
                        if let Some(data) =
                            rest.strip_prefix("data: ").or_else(|| rest.strip_prefix("data:"))
                        {
                            let data = data.trim();
                            if !data.is_empty() {
                                st.queue.push_back(data.to_string());
                            }
                        }
                        st.buffer.clear();
                    }
                }
            }
        },
    )
}
