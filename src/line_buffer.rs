//! Line Buffer — chunks a byte stream into newline-terminated lines for the
//! logger. Used to forward worker stdout/stderr at line granularity.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Read `reader` line by line (trailing newline stripped), invoking
/// `on_line` for each complete line in order, including a final partial
/// line with no trailing newline when the stream closes.
pub async fn forward_lines<R, F>(reader: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => on_line(line),
            Ok(None) => break,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn splits_on_newlines_and_strips_them() {
        let data = b"first\nsecond\nthird\n".as_slice();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        forward_lines(data, move |line| seen_clone.lock().unwrap().push(line)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn delivers_partial_final_line_on_close() {
        let data = b"complete\nno-newline-yet".as_slice();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        forward_lines(data, move |line| seen_clone.lock().unwrap().push(line)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["complete", "no-newline-yet"]
        );
    }

    #[tokio::test]
    async fn empty_stream_produces_no_lines() {
        let data = b"".as_slice();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        forward_lines(data, move |line| seen_clone.lock().unwrap().push(line)).await;
        assert!(seen.lock().unwrap().is_empty());
    }
}
