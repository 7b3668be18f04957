use proptest::prelude::*;
use pty_session::ReplayBuffer;

proptest! {
    #[test]
    fn total_never_exceeds_cap(
        cap in 1usize..256,
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..64),
    ) {
        let mut buf = ReplayBuffer::new(cap);
        for chunk in chunks {
            buf.push(chunk);
            prop_assert!(buf.len_bytes() <= cap);
            prop_assert_eq!(buf.snapshot().len(), buf.len_bytes());
        }
    }

    #[test]
    fn snapshot_is_a_suffix_of_whole_chunks(
        cap in 1usize..256,
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..64),
    ) {
        let mut buf = ReplayBuffer::new(cap);
        for chunk in &chunks {
            buf.push(chunk.clone());
        }

        // The retained chunks must be the last `chunk_count` pushes, unmodified
        let kept = buf.chunk_count();
        let expected: Vec<u8> = chunks[chunks.len() - kept..].concat();
        prop_assert_eq!(buf.snapshot(), expected);

        // And one more chunk from before would not have fit
        if kept < chunks.len() {
            let previous = chunks[chunks.len() - kept - 1].len();
            prop_assert!(buf.len_bytes() + previous > cap);
        }
    }
}
