//! Test suite for the buffers submodule.
//!
//! Test categories:
//! 1. Construction and empty-state behavior
//! 2. Chunking of finished and unfinished episodes
//! 3. Episode rollback (abnormal steps, too-short episodes)
//! 4. `only_finished` flushing
//! 5. Property: emitted chunks reassemble the appended stream

use super::*;
use crate::core::transition::{TrajectoryChunk, Transition};

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

fn step(i: usize, done: bool) -> Transition<usize> {
    Transition::new(i, i as f32 * 0.1, done, 0)
}

/// Append `len` transitions numbered from `start`; the last one is `done`
/// when `finish` is set. Returns the value of `append` for the last step.
fn push_episode(
    buffer: &mut TransitionBuffer<usize>,
    env_id: usize,
    start: usize,
    len: usize,
    finish: bool,
) -> bool {
    let mut long_enough = true;
    for i in 0..len {
        let done = finish && i + 1 == len;
        long_enough = buffer.append(env_id, step(start + i, done));
    }
    long_enough
}

fn lens(chunks: &[TrajectoryChunk<usize>]) -> Vec<usize> {
    chunks.iter().map(|c| c.len()).collect()
}

fn terminals(chunks: &[TrajectoryChunk<usize>]) -> Vec<bool> {
    chunks.iter().map(|c| c.terminal).collect()
}

fn records(chunks: &[TrajectoryChunk<usize>]) -> Vec<usize> {
    chunks
        .iter()
        .flat_map(|c| c.iter().map(|t| t.record))
        .collect()
}

fn for_env(chunks: &[TrajectoryChunk<usize>], env_id: usize) -> Vec<TrajectoryChunk<usize>> {
    chunks.iter().filter(|c| c.env_id == env_id).cloned().collect()
}

// =============================================================================
// CONSTRUCTION
// =============================================================================

#[test]
fn test_new_buffer_is_empty() {
    let buffer: TransitionBuffer<usize> = TransitionBuffer::new(0, 4, 8);
    assert!(buffer.is_empty());
    assert_eq!(buffer.env_num(), 4);
    assert_eq!(buffer.unroll_len(), 8);
    assert_eq!(buffer.buffered_len(2), 0);
}

#[test]
#[should_panic(expected = "unroll_len must be > 0")]
fn test_zero_unroll_len_panics() {
    let _buffer: TransitionBuffer<usize> = TransitionBuffer::new(0, 1, 0);
}

#[test]
fn test_clear_newest_episode_on_fresh_buffer_is_noop() {
    let mut buffer: TransitionBuffer<usize> = TransitionBuffer::new(0, 2, 3);

    assert_eq!(buffer.clear_newest_episode(0, true), 0);
    assert_eq!(buffer.clear_newest_episode(0, false), 0);
    assert_eq!(buffer.clear_newest_episode(1, false), 0);
    // Out-of-range env ids are ignored as well
    assert_eq!(buffer.clear_newest_episode(9, false), 0);
    assert!(buffer.is_empty());
    assert!(buffer.to_trajectories(false).is_empty());
}

// =============================================================================
// CHUNKING
// =============================================================================

#[test]
fn test_finished_episode_splits_at_unroll_len() {
    let mut buffer = TransitionBuffer::new(0, 1, 3);
    assert!(push_episode(&mut buffer, 0, 0, 7, true));

    let chunks = buffer.to_trajectories(false);
    assert_eq!(lens(&chunks), vec![3, 3, 1]);
    assert_eq!(terminals(&chunks), vec![false, false, true]);
    assert_eq!(records(&chunks), (0..7).collect::<Vec<_>>());
    assert!(buffer.is_empty());
}

#[test]
fn test_exact_multiple_has_full_terminal_chunk() {
    let mut buffer = TransitionBuffer::new(0, 1, 3);
    assert!(push_episode(&mut buffer, 0, 0, 6, true));

    let chunks = buffer.to_trajectories(false);
    assert_eq!(lens(&chunks), vec![3, 3]);
    assert_eq!(terminals(&chunks), vec![false, true]);
}

#[test]
fn test_unfinished_episode_flushes_complete_chunks_only() {
    let mut buffer = TransitionBuffer::new(0, 1, 3);
    push_episode(&mut buffer, 0, 0, 5, false);

    let first = buffer.to_trajectories(false);
    assert_eq!(lens(&first), vec![3]);
    assert_eq!(terminals(&first), vec![false]);
    assert_eq!(buffer.buffered_len(0), 2);

    // Episode continues in the same buffer entry
    assert!(push_episode(&mut buffer, 0, 5, 2, true));
    assert_eq!(buffer.episode_count(0), 1);

    let second = buffer.to_trajectories(false);
    assert_eq!(lens(&second), vec![3, 1]);
    assert_eq!(terminals(&second), vec![false, true]);

    let mut all = first;
    all.extend(second);
    assert_eq!(records(&all), (0..7).collect::<Vec<_>>());
}

#[test]
fn test_unfinished_short_remainder_stays_buffered() {
    let mut buffer = TransitionBuffer::new(0, 1, 4);
    push_episode(&mut buffer, 0, 0, 3, false);

    assert!(buffer.to_trajectories(false).is_empty());
    assert_eq!(buffer.buffered_len(0), 3);
}

#[test]
fn test_append_after_done_opens_new_episode() {
    let mut buffer = TransitionBuffer::new(0, 1, 2);
    push_episode(&mut buffer, 0, 0, 2, true);
    push_episode(&mut buffer, 0, 2, 1, false);

    assert_eq!(buffer.episode_count(0), 2);
    assert_eq!(buffer.buffered_len(0), 3);
}

#[test]
fn test_chunks_are_tagged_with_env_and_policy() {
    let mut buffer = TransitionBuffer::new(3, 2, 2);
    push_episode(&mut buffer, 1, 0, 2, true);

    let chunks = buffer.to_trajectories(false);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].env_id, 1);
    assert_eq!(chunks[0].policy_id, 3);
    assert!(chunks[0].terminal);
}

#[test]
fn test_environments_are_independent() {
    let mut buffer = TransitionBuffer::new(0, 2, 2);
    buffer.append(0, step(0, false));
    buffer.append(1, step(100, false));
    buffer.append(0, step(1, false));
    buffer.append(1, step(101, true));

    let chunks = buffer.to_trajectories(false);
    assert_eq!(records(&for_env(&chunks, 0)), vec![0, 1]);
    assert_eq!(records(&for_env(&chunks, 1)), vec![100, 101]);
    assert!(!for_env(&chunks, 0)[0].terminal);
    assert!(for_env(&chunks, 1)[0].terminal);
}

// =============================================================================
// ROLLBACK
// =============================================================================

#[test]
fn test_short_episode_reports_not_long_enough() {
    let mut buffer = TransitionBuffer::new(0, 1, 3);
    assert!(!push_episode(&mut buffer, 0, 0, 2, true));

    assert_eq!(buffer.clear_newest_episode(0, false), 2);
    assert!(buffer.to_trajectories(false).is_empty());
    assert!(buffer.is_empty());
}

#[test]
fn test_episode_of_exactly_unroll_len_is_long_enough() {
    let mut buffer = TransitionBuffer::new(0, 1, 3);
    assert!(push_episode(&mut buffer, 0, 0, 3, true));
}

#[test]
fn test_non_final_steps_always_report_long_enough() {
    let mut buffer = TransitionBuffer::new(0, 1, 10);
    for i in 0..4 {
        assert!(buffer.append(0, step(i, false)));
    }
}

#[test]
fn test_before_append_keeps_finished_episode() {
    let mut buffer = TransitionBuffer::new(0, 1, 3);
    push_episode(&mut buffer, 0, 0, 3, true);

    assert_eq!(buffer.clear_newest_episode(0, true), 0);
    let chunks = buffer.to_trajectories(false);
    assert_eq!(lens(&chunks), vec![3]);
    assert!(chunks[0].terminal);
}

#[test]
fn test_after_append_drops_finished_episode() {
    let mut buffer = TransitionBuffer::new(0, 1, 3);
    push_episode(&mut buffer, 0, 0, 3, true);

    assert_eq!(buffer.clear_newest_episode(0, false), 3);
    assert!(buffer.to_trajectories(false).is_empty());
}

#[test]
fn test_abnormal_step_drops_only_in_flight_episode() {
    let mut buffer = TransitionBuffer::new(0, 1, 3);
    push_episode(&mut buffer, 0, 0, 3, true);
    push_episode(&mut buffer, 0, 3, 2, false);

    assert_eq!(buffer.clear_newest_episode(0, true), 2);
    let chunks = buffer.to_trajectories(false);
    assert_eq!(records(&chunks), vec![0, 1, 2]);
}

#[test]
fn test_finish_episode_closes_open_episode() {
    let mut buffer = TransitionBuffer::new(0, 1, 3);
    push_episode(&mut buffer, 0, 0, 4, false);

    assert_eq!(buffer.finish_episode(0), Some(true));
    // Next transition opens a new episode instead of extending this one
    buffer.append(0, step(4, false));
    assert_eq!(buffer.episode_count(0), 2);

    let chunks = buffer.to_trajectories(true);
    assert_eq!(lens(&chunks), vec![3, 1]);
    assert_eq!(terminals(&chunks), vec![false, true]);
    assert!(chunks[1].transitions[0].done);
    assert_eq!(buffer.buffered_len(0), 1);
}

#[test]
fn test_finish_short_episode_reports_not_long_enough() {
    let mut buffer = TransitionBuffer::new(0, 1, 3);
    push_episode(&mut buffer, 0, 0, 2, false);

    assert_eq!(buffer.finish_episode(0), Some(false));
    assert_eq!(buffer.clear_newest_episode(0, false), 2);
    assert!(buffer.is_empty());
}

#[test]
fn test_finish_episode_without_open_episode() {
    let mut buffer = TransitionBuffer::new(0, 2, 3);
    assert_eq!(buffer.finish_episode(0), None);
    assert_eq!(buffer.finish_episode(7), None);

    push_episode(&mut buffer, 1, 0, 3, true);
    assert_eq!(buffer.finish_episode(1), None);
    assert_eq!(buffer.episode_count(1), 1);
}

#[test]
fn test_finish_episode_counts_flushed_transitions() {
    let mut buffer = TransitionBuffer::new(0, 1, 3);
    push_episode(&mut buffer, 0, 0, 3, false);
    assert_eq!(lens(&buffer.to_trajectories(false)), vec![3]);

    // Nothing left to flag terminal, but the episode was long enough
    assert_eq!(buffer.finish_episode(0), Some(true));
    assert!(buffer.to_trajectories(false).is_empty());
    assert!(buffer.is_empty());
}

#[test]
fn test_clear_drops_everything() {
    let mut buffer = TransitionBuffer::new(0, 3, 2);
    push_episode(&mut buffer, 0, 0, 5, true);
    push_episode(&mut buffer, 1, 0, 1, false);
    push_episode(&mut buffer, 2, 0, 4, false);

    buffer.clear();
    assert!(buffer.is_empty());
    assert!(buffer.to_trajectories(false).is_empty());
}

// =============================================================================
// ONLY-FINISHED FLUSHING
// =============================================================================

#[test]
fn test_only_finished_leaves_unfinished_untouched() {
    let mut buffer = TransitionBuffer::new(0, 2, 3);
    push_episode(&mut buffer, 0, 0, 4, true);
    push_episode(&mut buffer, 1, 100, 5, false);

    let finished = buffer.to_trajectories(true);
    assert_eq!(lens(&for_env(&finished, 0)), vec![3, 1]);
    assert!(for_env(&finished, 1).is_empty());
    assert_eq!(buffer.buffered_len(1), 5);

    let rest = buffer.to_trajectories(false);
    assert_eq!(records(&rest), vec![100, 101, 102]);
    assert_eq!(buffer.buffered_len(1), 2);
}

#[test]
fn test_two_env_scenario_with_abnormal_env() {
    // env 0: 7 steps then done; env 1: 2 steps then an abnormal timestep
    let mut buffer = TransitionBuffer::new(0, 2, 3);
    assert!(push_episode(&mut buffer, 0, 0, 7, true));
    push_episode(&mut buffer, 1, 0, 2, false);
    buffer.clear_newest_episode(1, true);

    let chunks = buffer.to_trajectories(false);
    let env0 = for_env(&chunks, 0);
    assert_eq!(lens(&env0), vec![3, 3, 1]);
    assert_eq!(terminals(&env0), vec![false, false, true]);
    assert!(for_env(&chunks, 1).is_empty());
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

mod proptest_chunking {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Property: without rollbacks, the chunks of every episode reassemble
        /// it in order, cut at multiples of unroll_len, and only the last
        /// chunk of a finished episode is terminal.
        #[test]
        fn test_chunks_reassemble_stream(
            unroll_len in 1usize..6,
            extra in prop::collection::vec(0usize..12, 0..6),
            tail in 0usize..12,
            flush_every in 1usize..10,
        ) {
            let mut buffer = TransitionBuffer::new(0, 1, unroll_len);
            // Finished episodes are at least unroll_len long
            let finished: Vec<usize> = extra.iter().map(|e| unroll_len + e).collect();

            let mut appended = Vec::new();
            let mut chunks = Vec::new();
            let mut counter = 0usize;
            let episodes = finished
                .iter()
                .map(|&len| (len, true))
                .chain(std::iter::once((tail, false)));

            for (len, finish) in episodes {
                for i in 0..len {
                    let done = finish && i + 1 == len;
                    prop_assert!(buffer.append(0, step(counter, done)));
                    appended.push(counter);
                    counter += 1;
                    if counter % flush_every == 0 {
                        chunks.extend(buffer.to_trajectories(false));
                    }
                }
            }
            chunks.extend(buffer.to_trajectories(false));

            // Emitted stream is a prefix of the appended stream
            let emitted = records(&chunks);
            let leftover = tail % unroll_len;
            prop_assert_eq!(&emitted[..], &appended[..appended.len() - leftover]);
            prop_assert_eq!(buffer.buffered_len(0), leftover);

            // Chunk boundaries follow unroll_len within each episode
            let mut episode_lens = finished.clone();
            episode_lens.push(tail - leftover);
            let mut chunk_iter = chunks.iter();
            for (idx, &len) in episode_lens.iter().enumerate() {
                let is_finished = idx < finished.len();
                let mut covered = 0;
                while covered < len {
                    let chunk = chunk_iter.next().expect("missing chunk");
                    let expected = (len - covered).min(unroll_len);
                    covered += chunk.len();
                    prop_assert_eq!(chunk.len(), expected);
                    prop_assert_eq!(chunk.terminal, is_finished && covered == len);
                }
            }
            prop_assert!(chunk_iter.next().is_none());
        }
    }
}
