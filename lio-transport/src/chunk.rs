//! Chunked transfer bookkeeping shared by the connection types.
//!
//! A read or write of arbitrary size is carried out as a sequence of bounded
//! chunks, each at most [`ChunkPolicy::chunk_size`] bytes, going through a
//! fixed-size scratch buffer. [`ReadChain`] and [`WriteChain`] track one such
//! sequence. They never touch a socket: the connection performs the syscall
//! and reports back how many bytes moved, which keeps the accounting testable
//! on its own.
//!
//! ```text
//!            next_request / stage          complete_chunk / advance
//!   Idle ─────────────────────────> AwaitingChunk ─────────────────> Complete
//!     ^                                   │    │
//!     └──────── more bytes left ──────────┘    └── fail ──> Failed
//! ```

use std::num::NonZeroUsize;

/// Bounds how many bytes a single syscall may transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
  chunk_size: NonZeroUsize,
}

impl ChunkPolicy {
  /// # Panics
  ///
  /// Panics if `chunk_size` is zero.
  pub fn new(chunk_size: usize) -> Self {
    Self {
      chunk_size: NonZeroUsize::new(chunk_size)
        .expect("chunk size must be non-zero"),
    }
  }

  pub fn chunk_size(&self) -> usize {
    self.chunk_size.get()
  }

  /// Size of the next chunk when `remaining` bytes are still outstanding.
  pub fn next_len(&self, remaining: usize) -> usize {
    remaining.min(self.chunk_size.get())
  }

  /// Whether `len` bytes can move in one chunk.
  pub fn fits(&self, len: usize) -> bool {
    len <= self.chunk_size.get()
  }

  /// Number of chunks a transfer of `len` bytes takes if every syscall moves
  /// a full chunk.
  pub fn chunks_for(&self, len: usize) -> usize {
    len.div_ceil(self.chunk_size.get())
  }
}

/// Where a chain is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
  /// Created, or between chunks.
  Idle,
  /// A chunk has been requested and its completion not yet reported.
  AwaitingChunk,
  /// Every byte has been transferred.
  Complete,
  /// A chunk failed; the chain is abandoned.
  Failed,
}

/// Result of reporting a finished chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
  /// More chunks are needed.
  Continue,
  /// The chain is complete.
  Done,
}

/// Accumulates exactly `expected` bytes into `target`.
#[derive(Debug)]
pub struct ReadChain<B> {
  target: B,
  expected: usize,
  filled: usize,
  requested: usize,
  state: ChainState,
}

impl<B> ReadChain<B>
where
  B: AsMut<[u8]>,
{
  /// # Panics
  ///
  /// Panics if `target` is shorter than `expected`; callers validate first.
  pub fn new(mut target: B, expected: usize) -> Self {
    assert!(
      target.as_mut().len() >= expected,
      "read target holds {} bytes, {expected} requested",
      target.as_mut().len()
    );
    let state = if expected == 0 { ChainState::Complete } else { ChainState::Idle };
    Self { target, expected, filled: 0, requested: 0, state }
  }

  pub fn state(&self) -> ChainState {
    self.state
  }

  pub fn expected(&self) -> usize {
    self.expected
  }

  pub fn filled(&self) -> usize {
    self.filled
  }

  pub fn remaining(&self) -> usize {
    self.expected - self.filled
  }

  /// Length of the next receive, or `None` once nothing is outstanding.
  ///
  /// Calling this again before the chunk completes returns the same length;
  /// the request simply stays outstanding.
  pub fn next_request(&mut self, policy: &ChunkPolicy) -> Option<usize> {
    match self.state {
      ChainState::Complete | ChainState::Failed => None,
      ChainState::AwaitingChunk => Some(self.requested),
      ChainState::Idle => {
        self.requested = policy.next_len(self.remaining());
        self.state = ChainState::AwaitingChunk;
        Some(self.requested)
      }
    }
  }

  /// Copies a received chunk into the target at the current offset.
  ///
  /// # Panics
  ///
  /// Panics if no chunk was requested or `chunk` is longer than requested.
  pub fn complete_chunk(&mut self, chunk: &[u8]) -> Step {
    assert_eq!(self.state, ChainState::AwaitingChunk, "no chunk outstanding");
    assert!(
      chunk.len() <= self.requested,
      "received {} bytes for a {} byte chunk",
      chunk.len(),
      self.requested
    );

    let end = self.filled + chunk.len();
    self.target.as_mut()[self.filled..end].copy_from_slice(chunk);
    self.filled = end;

    if self.filled == self.expected {
      self.state = ChainState::Complete;
      Step::Done
    } else {
      self.state = ChainState::Idle;
      Step::Continue
    }
  }

  pub fn fail(&mut self) {
    self.state = ChainState::Failed;
  }

  pub fn target(&mut self) -> &mut [u8] {
    &mut self.target.as_mut()[..self.filled]
  }

  pub fn into_target(self) -> B {
    self.target
  }
}

/// Sends `source` in full, one staged chunk at a time.
#[derive(Debug)]
pub struct WriteChain<B> {
  source: B,
  sent: usize,
  staged: usize,
  state: ChainState,
}

impl<B> WriteChain<B>
where
  B: AsRef<[u8]>,
{
  pub fn new(source: B) -> Self {
    let state =
      if source.as_ref().is_empty() { ChainState::Complete } else { ChainState::Idle };
    Self { source, sent: 0, staged: 0, state }
  }

  pub fn state(&self) -> ChainState {
    self.state
  }

  pub fn total(&self) -> usize {
    self.source.as_ref().len()
  }

  pub fn sent(&self) -> usize {
    self.sent
  }

  pub fn remaining(&self) -> usize {
    self.total() - self.sent
  }

  /// Copies the next chunk of the unsent suffix into `scratch` and returns its
  /// length, or `None` if everything has been sent.
  ///
  /// While a staged chunk is outstanding the same length is returned and
  /// `scratch` is left as is, so a send interrupted by `EAGAIN` can simply be
  /// retried.
  pub fn stage(&mut self, policy: &ChunkPolicy, scratch: &mut [u8]) -> Option<usize> {
    match self.state {
      ChainState::Complete | ChainState::Failed => None,
      ChainState::AwaitingChunk => Some(self.staged),
      ChainState::Idle => {
        let len = policy.next_len(self.remaining()).min(scratch.len());
        scratch[..len].copy_from_slice(&self.source.as_ref()[self.sent..self.sent + len]);
        self.staged = len;
        self.state = ChainState::AwaitingChunk;
        Some(len)
      }
    }
  }

  /// Records that `sent` bytes of the staged chunk were accepted. A short
  /// send moves the cursor by what was actually transferred; the rest is
  /// staged again.
  ///
  /// # Panics
  ///
  /// Panics if nothing is staged or `sent` exceeds the staged length.
  pub fn advance(&mut self, sent: usize) -> Step {
    assert_eq!(self.state, ChainState::AwaitingChunk, "no chunk staged");
    assert!(sent <= self.staged, "sent {sent} bytes of a {} byte chunk", self.staged);

    self.sent += sent;
    if self.sent == self.total() {
      self.state = ChainState::Complete;
      Step::Done
    } else {
      self.state = ChainState::Idle;
      Step::Continue
    }
  }

  pub fn fail(&mut self) {
    self.state = ChainState::Failed;
  }

  pub fn source(&self) -> &[u8] {
    self.source.as_ref()
  }

  pub fn into_source(self) -> B {
    self.source
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn policy_bounds_each_chunk() {
    let policy = ChunkPolicy::new(1024);
    assert_eq!(policy.next_len(2500), 1024);
    assert_eq!(policy.next_len(452), 452);
    assert_eq!(policy.next_len(0), 0);
    assert!(policy.fits(1024));
    assert!(!policy.fits(1025));
    assert_eq!(policy.chunks_for(2500), 3);
    assert_eq!(policy.chunks_for(0), 0);
  }

  #[test]
  #[should_panic(expected = "chunk size must be non-zero")]
  fn zero_chunk_policy_panics() {
    let _ = ChunkPolicy::new(0);
  }

  #[test]
  fn zero_length_read_is_born_complete() {
    let mut chain = ReadChain::new(Vec::new(), 0);
    assert_eq!(chain.state(), ChainState::Complete);
    assert_eq!(chain.next_request(&ChunkPolicy::new(8)), None);
  }

  #[test]
  fn read_of_2500_with_1024_chunks() {
    let policy = ChunkPolicy::new(1024);
    let payload: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
    let mut chain = ReadChain::new(vec![0u8; 2500], 2500);

    let mut offset = 0;
    let mut requests = Vec::new();
    while let Some(len) = chain.next_request(&policy) {
      requests.push(len);
      let step = chain.complete_chunk(&payload[offset..offset + len]);
      offset += len;
      assert_eq!(step == Step::Done, offset == 2500);
    }

    assert_eq!(requests, [1024, 1024, 452]);
    assert_eq!(chain.state(), ChainState::Complete);
    assert_eq!(chain.into_target(), payload);
  }

  #[test]
  fn outstanding_request_is_stable() {
    let policy = ChunkPolicy::new(4);
    let mut chain = ReadChain::new(vec![0u8; 10], 10);
    assert_eq!(chain.next_request(&policy), Some(4));
    assert_eq!(chain.next_request(&policy), Some(4));
    chain.complete_chunk(b"ab");
    assert_eq!(chain.next_request(&policy), Some(4));
    assert_eq!(chain.remaining(), 8);
  }

  #[test]
  fn failed_read_stops_requesting() {
    let policy = ChunkPolicy::new(4);
    let mut chain = ReadChain::new(vec![0u8; 10], 10);
    chain.next_request(&policy);
    chain.complete_chunk(b"abcd");
    chain.fail();
    assert_eq!(chain.state(), ChainState::Failed);
    assert_eq!(chain.next_request(&policy), None);
    assert_eq!(chain.target(), b"abcd");
  }

  #[test]
  #[should_panic(expected = "received 5 bytes for a 4 byte chunk")]
  fn oversized_chunk_is_a_bug() {
    let mut chain = ReadChain::new(vec![0u8; 10], 10);
    chain.next_request(&ChunkPolicy::new(4));
    chain.complete_chunk(b"abcde");
  }

  #[test]
  fn short_sends_restage_the_rest() {
    let policy = ChunkPolicy::new(4);
    let mut scratch = [0u8; 4];
    let mut chain = WriteChain::new(b"abcdefghij".to_vec());

    assert_eq!(chain.stage(&policy, &mut scratch), Some(4));
    assert_eq!(&scratch, b"abcd");
    assert_eq!(chain.advance(1), Step::Continue);

    assert_eq!(chain.stage(&policy, &mut scratch), Some(4));
    assert_eq!(&scratch, b"bcde");
    assert_eq!(chain.advance(4), Step::Continue);

    assert_eq!(chain.stage(&policy, &mut scratch), Some(4));
    assert_eq!(chain.advance(4), Step::Continue);
    assert_eq!(chain.stage(&policy, &mut scratch), Some(1));
    assert_eq!(scratch[0], b'j');
    assert_eq!(chain.advance(1), Step::Done);
    assert_eq!(chain.stage(&policy, &mut scratch), None);
  }

  #[test]
  fn empty_write_is_born_complete() {
    let chain = WriteChain::new(Vec::new());
    assert_eq!(chain.state(), ChainState::Complete);
  }

  proptest! {
    #[test]
    fn any_fragmentation_reassembles_in_order(
      payload in proptest::collection::vec(any::<u8>(), 0..4096),
      chunk_size in 1usize..2048,
      cuts in proptest::collection::vec(1usize..512, 1..64),
    ) {
      let policy = ChunkPolicy::new(chunk_size);
      let mut chain = ReadChain::new(vec![0u8; payload.len()], payload.len());
      let mut offset = 0;
      let mut cut = cuts.iter().cycle();
      let mut completions = 0;

      while let Some(len) = chain.next_request(&policy) {
        // The kernel hands back anything from one byte up to the request.
        let got = (*cut.next().unwrap()).min(len);
        if chain.complete_chunk(&payload[offset..offset + got]) == Step::Done {
          completions += 1;
        }
        offset += got;
      }

      prop_assert_eq!(completions, usize::from(!payload.is_empty()));
      prop_assert_eq!(chain.into_target(), payload);
    }

    #[test]
    fn staged_sends_concatenate_to_payload(
      payload in proptest::collection::vec(any::<u8>(), 1..4096),
      chunk_size in 1usize..2048,
      accepts in proptest::collection::vec(0usize..700, 1..64),
    ) {
      let policy = ChunkPolicy::new(chunk_size);
      let mut scratch = vec![0u8; chunk_size];
      let mut chain = WriteChain::new(payload.clone());
      let mut wire = Vec::new();
      let mut accept = accepts.iter().cycle();
      let mut done = 0;

      while let Some(len) = chain.stage(&policy, &mut scratch) {
        prop_assert!(len <= chunk_size);
        // Zero-byte progress would loop forever; a real send blocks instead.
        let took = (*accept.next().unwrap()).clamp(1, len);
        wire.extend_from_slice(&scratch[..took]);
        if chain.advance(took) == Step::Done {
          done += 1;
        }
      }

      prop_assert_eq!(done, 1);
      prop_assert_eq!(wire, payload);
    }
  }
}
