//! Transfer engine against the in-memory transport

use client::test_utils::MockTransport;
use client::{EngineConfig, TransferEngine};
use proptest::prelude::*;
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;

fn config(buffer_size: usize, pool_size: usize, exit_on_eof: bool) -> EngineConfig {
    EngineConfig {
        pool_size,
        buffer_size,
        event_timeout: Duration::from_millis(1),
        retry_delay: Duration::from_micros(10),
        exit_on_eof,
        shutdown_grace: Duration::from_millis(200),
    }
}

fn engine(transport: &Arc<MockTransport>, config: EngineConfig) -> TransferEngine<MockTransport> {
    TransferEngine::new(Arc::clone(transport), config, 0x81, 0x02, transport.token())
}

#[test]
fn test_outbound_splits_input_at_slot_capacity() {
    let input: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let transport = Arc::new(MockTransport::new(vec![]).keep_running());

    let stats = engine(&transport, config(8192, 8, true))
        .run(Cursor::new(input.clone()), Vec::new())
        .unwrap();

    assert_eq!(transport.outbound_sizes(), vec![8192, 8192, 3616]);
    assert_eq!(transport.outbound().concat(), input);
    assert_eq!(stats.outbound_submissions, 3);
    assert_eq!(stats.outbound_completions, 3);
    assert_eq!(stats.bytes_out, 20_000);
}

#[test]
fn test_outbound_waits_for_free_slots() {
    // Twice as many chunks as slots: every slot is reused
    let input = vec![7u8; 64 * 8];
    let transport = Arc::new(MockTransport::new(vec![]).keep_running());

    let stats = engine(&transport, config(64, 4, true))
        .run(Cursor::new(input), Vec::new())
        .unwrap();

    assert_eq!(transport.outbound_sizes(), vec![64; 8]);
    assert_eq!(stats.bytes_out, 512);
}

/// Input that stalls with WouldBlock before each chunk
struct Stuttering {
    inner: Cursor<Vec<u8>>,
    stalled: bool,
}

impl Read for Stuttering {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stalled = !self.stalled;
        if self.stalled {
            return Err(std::io::ErrorKind::WouldBlock.into());
        }
        self.inner.read(buf)
    }
}

#[test]
fn test_would_block_keeps_slot_and_retries() {
    let input = Stuttering {
        inner: Cursor::new(b"abcdefgh".to_vec()),
        stalled: false,
    };
    let transport = Arc::new(MockTransport::new(vec![]).keep_running());

    let stats = engine(&transport, config(4, 2, true))
        .run(input, Vec::new())
        .unwrap();

    assert_eq!(transport.outbound(), vec![b"abcd".to_vec(), b"efgh".to_vec()]);
    assert_eq!(stats.errors, 0);
}

#[test]
fn test_end_of_input_leaves_inbound_running() {
    let chunks = vec![b"hello ".to_vec(), b"from ".to_vec(), b"device".to_vec()];
    let transport = Arc::new(MockTransport::new(chunks));

    let mut out = Vec::new();
    let stats = engine(&transport, config(16, 2, false))
        .run(Cursor::new(Vec::new()), &mut out)
        .unwrap();

    assert_eq!(out, b"hello from device");
    assert_eq!(stats.bytes_in, 17);
    assert_eq!(stats.outbound_submissions, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_inbound_preserves_order_and_content(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..=64), 0..24),
        pool_size in 1usize..6,
    ) {
        let expected = chunks.concat();
        let transport = Arc::new(MockTransport::new(chunks));

        let mut out = Vec::new();
        let stats = engine(&transport, config(64, pool_size, false))
            .run(Cursor::new(Vec::new()), &mut out)
            .unwrap();

        prop_assert_eq!(&out, &expected);
        prop_assert_eq!(stats.bytes_in, expected.len() as u64);
        prop_assert_eq!(transport.max_inbound_pending(), pool_size);
    }
}
