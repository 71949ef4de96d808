//! Per-room OT state: the single-writer engine that integrates client ops
//! against history and advances the room's version.

use std::collections::VecDeque;

use crate::error::EngineError;
use crate::ot::{self, Operation};

/// Outcome returned to a late joiner requesting a sync.
pub enum HistorySince {
    /// The requested version is within the retained window; here's the tail.
    Ops(Vec<Operation>),
    /// The requested version predates the window; the caller should take a
    /// full [`OtEngine::snapshot`] instead.
    Resync,
}

/// Single-writer, per-room OT state.
///
/// This type assumes exclusive access from whichever task owns it (the
/// room's actor) and performs no locking of its own.
pub struct OtEngine {
    content: String,
    version: u64,
    history: VecDeque<Operation>,
    window: usize,
}

impl OtEngine {
    /// Construct a fresh engine for a new document, or one rehydrated from a
    /// persisted snapshot plus tail log.
    pub fn new(content: String, version: u64, window: usize) -> Self {
        Self {
            content,
            version,
            history: VecDeque::with_capacity(window.min(1024)),
            window,
        }
    }

    /// Replay a tail of already-accepted ops on top of a freshly loaded
    /// snapshot (used by [`crate::persistence`] on room open).
    ///
    /// Each op is already-accepted (no re-transforming against history is
    /// needed, unlike [`Self::integrate`]) but still has to be folded through
    /// [`ot::apply`] to bring `self.content` forward to match `self.version`
    /// — the snapshot alone only reflects content as of the *last* snapshot,
    /// not the tail log appended after it.
    pub fn replay(&mut self, ops: impl IntoIterator<Item = Operation>) {
        for op in ops {
            match ot::apply(&self.content, &op) {
                Ok(new_content) => self.content = new_content,
                Err(e) => {
                    tracing::error!(
                        op_id = %op.id,
                        error = %e,
                        "tail log op failed to apply during replay, content may be stale"
                    );
                }
            }
            self.history.push_back(op);
            if self.history.len() > self.window {
                self.history.pop_front();
            }
            self.version += 1;
        }
    }

    /// The version the oldest retained history entry was accepted at, or the
    /// current version if history is empty (i.e. nothing is stale yet).
    fn oldest_retained_version(&self) -> u64 {
        self.version - self.history.len() as u64
    }

    /// Integrate a client-submitted op carrying its logical (base) version in
    /// `op.version`. On success, returns the accepted op (with `version` set
    /// to the room version at acceptance) and the new document content.
    pub fn integrate(&mut self, mut op: Operation) -> Result<(Operation, String), EngineError> {
        let base_version = op.version;

        if base_version > self.version {
            return Err(EngineError::VersionAhead);
        }
        if base_version < self.oldest_retained_version() {
            return Err(EngineError::VersionStale);
        }

        let skip = (base_version - self.oldest_retained_version()) as usize;
        for history_op in self.history.iter().skip(skip) {
            op = ot::transform(&op, history_op);
        }

        let new_content = ot::apply(&self.content, &op).map_err(|_| EngineError::Precondition)?;

        op.version = self.version;
        self.history.push_back(op.clone());
        if self.history.len() > self.window {
            self.history.pop_front();
        }
        self.content = new_content.clone();
        self.version += 1;

        Ok((op, new_content))
    }

    /// A consistent read of `{content, version}`.
    pub fn snapshot(&self) -> (String, u64) {
        (self.content.clone(), self.version)
    }

    /// The current room version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The accepted ops with version in `[from, self.version)`, or a resync
    /// marker if `from` predates the retained window.
    pub fn history_since(&self, from: u64) -> HistorySince {
        if from > self.version {
            return HistorySince::Resync;
        }
        if from < self.oldest_retained_version() {
            return HistorySince::Resync;
        }
        let skip = (from - self.oldest_retained_version()) as usize;
        HistorySince::Ops(self.history.iter().skip(skip).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::OpKind;

    fn insert(id: &str, client: &str, base_version: u64, position: u64, payload: &str) -> Operation {
        Operation {
            id: id.into(),
            kind: OpKind::Insert,
            position,
            payload: payload.into(),
            client_id: client.into(),
            user_id: None,
            version: base_version,
        }
    }

    /// A single insert from one client is accepted and advances the version.
    #[test]
    fn single_insert_accepted() {
        let mut engine = OtEngine::new(String::new(), 0, 1024);
        let (accepted, content) = engine
            .integrate(insert("o1", "A", 0, 0, "Hello"))
            .unwrap();
        assert_eq!(accepted.version, 0);
        assert_eq!(content, "Hello");
        assert_eq!(engine.snapshot(), ("Hello".to_string(), 1));
    }

    /// Monotonic version: versions are assigned 0, 1, 2, ... with no gaps.
    #[test]
    fn versions_are_monotonic() {
        let mut engine = OtEngine::new(String::new(), 0, 1024);
        for i in 0..5u64 {
            let (accepted, _) = engine
                .integrate(insert(&format!("o{i}"), "A", i, i, "x"))
                .unwrap();
            assert_eq!(accepted.version, i);
        }
        assert_eq!(engine.version(), 5);
    }

    #[test]
    fn version_ahead_of_room_is_rejected() {
        let mut engine = OtEngine::new(String::new(), 0, 1024);
        let err = engine.integrate(insert("o1", "A", 1, 0, "x")).unwrap_err();
        assert_eq!(err, EngineError::VersionAhead);
    }

    #[test]
    fn stale_version_outside_window_is_rejected() {
        let mut engine = OtEngine::new(String::new(), 0, 2);
        for i in 0..5u64 {
            engine
                .integrate(insert(&format!("o{i}"), "A", i, 0, "x"))
                .unwrap();
        }
        // window = 2, so only versions 3, 4 are retained; version 0 is stale.
        let err = engine.integrate(insert("stale", "A", 0, 0, "y")).unwrap_err();
        assert_eq!(err, EngineError::VersionStale);
    }

    /// Three inserts against an empty room accumulate in order.
    #[test]
    fn history_accumulates_in_order() {
        let mut engine = OtEngine::new(String::new(), 0, 1024);
        for (i, ch) in ["a", "b", "c"].into_iter().enumerate() {
            engine
                .integrate(insert(&format!("o{i}"), "A", i as u64, i as u64, ch))
                .unwrap();
        }
        let (content, version) = engine.snapshot();
        assert_eq!(content, "abc");
        assert_eq!(version, 3);
    }

    /// Requesting history from a version inside the window returns exactly the tail ops.
    #[test]
    fn history_since_returns_tail() {
        let mut engine = OtEngine::new(String::new(), 0, 1024);
        for (i, ch) in ["a", "b", "c"].into_iter().enumerate() {
            engine
                .integrate(insert(&format!("o{i}"), "A", i as u64, i as u64, ch))
                .unwrap();
        }
        engine
            .integrate(insert("o3", "A", 3, 3, "d"))
            .unwrap();
        engine
            .integrate(insert("o4", "A", 4, 4, "e"))
            .unwrap();

        match engine.history_since(3) {
            HistorySince::Ops(ops) => {
                assert_eq!(ops.len(), 2);
                assert_eq!(ops[0].version, 3);
                assert_eq!(ops[1].version, 4);
            }
            HistorySince::Resync => panic!("expected ops, got resync marker"),
        }
    }

    /// Concurrent submit at the same base version transforms against history.
    #[test]
    fn concurrent_submission_is_transformed() {
        let mut engine = OtEngine::new("hello".to_string(), 0, 1024);
        engine
            .integrate(insert("a1", "A", 0, 5, " world"))
            .unwrap();

        // B submitted against version 0, unaware of A's insert.
        let op = Operation {
            id: "b1".into(),
            kind: OpKind::Delete,
            position: 2,
            payload: "ll".into(),
            client_id: "B".into(),
            user_id: None,
            version: 0,
        };
        let (accepted, content) = engine.integrate(op).unwrap();
        assert_eq!(accepted.version, 1);
        assert_eq!(content, "heo world");
    }

    /// Replaying a tail log on top of a loaded snapshot must fold each op's
    /// content change forward, not just bump the version counter — otherwise
    /// a reload after a crash (snapshot stale, tail non-empty) leaves
    /// `content` behind `version`.
    #[test]
    fn replay_applies_tail_ops_to_content() {
        let mut engine = OtEngine::new("ab".to_string(), 1, 1024);
        let tail = vec![
            insert("o1", "A", 1, 2, "c"),
            insert("o2", "A", 2, 3, "d"),
        ];
        engine.replay(tail);
        assert_eq!(engine.snapshot(), ("abcd".to_string(), 3));
    }
}
