//! Integration tests for stream reassembly
//!
//! Chunk boundaries never line up with SSE lines in practice, so most of
//! these tests re-split the same body in different ways and check that the
//! reassembled content does not change.

use interceptor_server::proxy::{StreamAccumulator, StreamFormat, Termination};
use interceptor_server::testing::{SSE_DONE, content_chunk, sse_body};

fn reassemble(format: StreamFormat, chunks: &[&[u8]]) -> (String, String, Termination) {
    let mut accumulator = StreamAccumulator::new(format);
    let mut deltas = String::new();
    for chunk in chunks {
        deltas.push_str(&accumulator.feed(chunk).delta);
    }
    let record = accumulator.finish();
    deltas.push_str(&record.flushed);
    (deltas, record.content, record.termination)
}

// =============================================================================
// Scenario Tests
// =============================================================================

mod scenario_tests {
    use super::*;

    #[test]
    fn test_hello_with_top_level_delta() {
        let chunks: [&[u8]; 3] = [
            b"data: {\"delta\":\"Hel\"}\n\n",
            b"data: {\"delta\":\"lo\"}\n\n",
            b"data: [DONE]\n\n",
        ];
        let (deltas, content, termination) = reassemble(StreamFormat::Sse, &chunks);

        assert_eq!(content, "Hello");
        assert_eq!(deltas, "Hello");
        assert_eq!(termination, Termination::Clean);
    }

    #[test]
    fn test_openai_body_with_role_and_finish_chunks() {
        let body = format!(
            "{}{}{}{}",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            content_chunk("Hi"),
            "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            SSE_DONE
        );
        let (_, content, termination) = reassemble(StreamFormat::Sse, &[body.as_bytes()]);

        assert_eq!(content, "Hi");
        assert_eq!(termination, Termination::Clean);
    }

    #[test]
    fn test_missing_done_is_truncated_not_fatal() {
        let body = content_chunk("partial");
        let (_, content, termination) = reassemble(StreamFormat::Sse, &[body.as_bytes()]);

        assert_eq!(content, "partial");
        assert_eq!(termination, Termination::Truncated);
    }

    #[test]
    fn test_update_reports_progress() {
        let mut accumulator = StreamAccumulator::new(StreamFormat::Sse);
        let update = accumulator.feed(content_chunk("abc").as_bytes());

        assert_eq!(update.delta, "abc");
        assert_eq!(update.events, 1);
        assert_eq!(update.chunk_count, 1);
        assert_eq!(update.content_len, 3);
        assert!(!update.done);
        assert_eq!(accumulator.content(), "abc");

        let update = accumulator.feed(SSE_DONE.as_bytes());
        assert!(update.done);
        assert!(update.is_meaningful());
        assert!(accumulator.is_done());
    }
}

// =============================================================================
// Property Tests
// =============================================================================

mod property_tests {
    use super::*;

    #[test]
    fn test_same_chunks_same_result() {
        let body = sse_body(&["The ", "quick ", "brown ", "fox"]);
        let chunks: Vec<&[u8]> = body.as_bytes().chunks(7).collect();

        let (_, first, _) = reassemble(StreamFormat::Sse, &chunks);
        let (_, second, _) = reassemble(StreamFormat::Sse, &chunks);
        assert_eq!(first, second);
        assert_eq!(first, "The quick brown fox");
    }

    #[test]
    fn test_deltas_concatenate_to_final_content() {
        let body = sse_body(&["alpha", " beta", " gamma"]);
        for size in [1, 3, 16, 64, body.len()] {
            let chunks: Vec<&[u8]> = body.as_bytes().chunks(size).collect();
            let (deltas, content, _) = reassemble(StreamFormat::Sse, &chunks);
            assert_eq!(deltas, content, "chunk size {size}");
        }
    }

    #[test]
    fn test_split_at_every_offset() {
        let body = sse_body(&["naïve ", "café ", "日本語"]);
        let bytes = body.as_bytes();
        let (_, whole, _) = reassemble(StreamFormat::Sse, &[bytes]);
        assert_eq!(whole, "naïve café 日本語");

        for offset in 0..=bytes.len() {
            let (head, tail) = bytes.split_at(offset);
            let (_, split, termination) = reassemble(StreamFormat::Sse, &[head, tail]);
            assert_eq!(split, whole, "split at byte {offset}");
            assert_eq!(termination, Termination::Clean);
        }
    }

    #[test]
    fn test_plain_split_at_every_offset() {
        let text = "plain ünïcödé text ✓";
        let bytes = text.as_bytes();

        for offset in 0..=bytes.len() {
            let (head, tail) = bytes.split_at(offset);
            let (deltas, content, _) = reassemble(StreamFormat::Plain, &[head, tail]);
            assert_eq!(content, text, "split at byte {offset}");
            assert_eq!(deltas, text);
        }
    }

    #[test]
    fn test_interleaved_garbage_is_skipped() {
        let body = format!(
            "{}data: {{broken\n\n{}{}",
            content_chunk("a"),
            content_chunk("b"),
            SSE_DONE
        );
        let mut accumulator = StreamAccumulator::new(StreamFormat::Sse);
        for chunk in body.as_bytes().chunks(5) {
            accumulator.feed(chunk);
        }
        let record = accumulator.finish();

        assert_eq!(record.content, "ab");
        assert_eq!(record.parse_skips, 1);
        assert_eq!(record.event_count, 4);
    }
}
