use crate::db;
use crate::pass::PassRow;
use crate::queue::{self, QueueRow};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeSet;

/// Snapshot-level problems found while reloading. These describe durable state
/// that partially succeeded somewhere (a crashed client, a foreign writer) and
/// are surfaced separately from request failures.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum Inconsistency {
    #[serde(rename = "open_pass_and_queued")]
    OpenPassAndQueued {
        #[serde(rename = "studentName")]
        student_name: String,
        #[serde(rename = "passId")]
        pass_id: String,
        #[serde(rename = "entryId")]
        entry_id: String,
    },
    #[serde(rename = "position_gap")]
    PositionGap { positions: Vec<i64> },
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub passes: Vec<PassRow>,
    pub queue: Vec<QueueRow>,
    pub warnings: Vec<Inconsistency>,
}

/// One teacher's locally held view of passes and queue, kept current by two
/// independent paths: optimistic mutations staged ahead of their database
/// write, and change-feed polls that reload when a foreign writer touched the
/// workspace. Own writes are remembered by sequence number so a poll that sees
/// only them never reloads over (and never races) the optimistic state.
pub struct TeacherStore {
    teacher_id: String,
    snapshot: Snapshot,
    applied_seq: i64,
    own_seqs: BTreeSet<i64>,
}

/// The rows as they were before an optimistic mutation; handing this back to
/// `rollback` restores them byte-for-byte.
pub struct Staged {
    prev: Snapshot,
}

#[derive(Debug, Clone)]
pub enum Mutation {
    InsertPass(PassRow),
    ReplacePass(PassRow),
    RemovePass(String),
    AppendQueueEntry(QueueRow),
    RemoveQueueEntry(String),
}

fn compute_warnings(passes: &[PassRow], queue_rows: &[QueueRow]) -> Vec<Inconsistency> {
    let mut warnings = Vec::new();
    for entry in queue_rows {
        if let Some(open) = passes
            .iter()
            .find(|p| p.is_open() && p.student_name == entry.student_name)
        {
            warnings.push(Inconsistency::OpenPassAndQueued {
                student_name: entry.student_name.clone(),
                pass_id: open.id.clone(),
                entry_id: entry.id.clone(),
            });
        }
    }
    if !queue::positions_contiguous(queue_rows) {
        let mut positions: Vec<i64> = queue_rows.iter().map(|r| r.position).collect();
        positions.sort_unstable();
        warnings.push(Inconsistency::PositionGap { positions });
    }
    warnings
}

impl TeacherStore {
    pub fn open(conn: &Connection, teacher_id: &str) -> rusqlite::Result<Self> {
        let mut store = TeacherStore {
            teacher_id: teacher_id.to_string(),
            snapshot: Snapshot::default(),
            applied_seq: 0,
            own_seqs: BTreeSet::new(),
        };
        store.refresh(conn)?;
        Ok(store)
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Wholesale reload from the database; the snapshot becomes authoritative
    /// as of the feed's latest sequence number.
    pub fn refresh(&mut self, conn: &Connection) -> rusqlite::Result<()> {
        let passes = db::list_passes(conn, &self.teacher_id)?;
        let queue_rows = db::list_queue(conn, &self.teacher_id)?;
        self.applied_seq = db::latest_seq(conn, &self.teacher_id)?;
        self.own_seqs.clear();
        self.snapshot.warnings = compute_warnings(&passes, &queue_rows);
        self.snapshot.passes = passes;
        self.snapshot.queue = queue_rows;
        Ok(())
    }

    /// Reads change events past the last applied sequence and reloads if any
    /// of them came from another writer. Returns (events, reloaded).
    pub fn sync(&mut self, conn: &Connection) -> rusqlite::Result<(Vec<db::ChangeEvent>, bool)> {
        let events = db::changes_since(conn, &self.teacher_id, self.applied_seq)?;
        if events.is_empty() {
            return Ok((events, false));
        }
        let foreign = events.iter().any(|e| !self.own_seqs.contains(&e.seq));
        if foreign {
            self.refresh(conn)?;
        } else {
            // Nothing but our own acknowledged writes: the optimistic rows
            // already reflect them, so just advance the cursor.
            let last = events.last().map(|e| e.seq).unwrap_or(self.applied_seq);
            self.applied_seq = last;
            self.own_seqs = self.own_seqs.split_off(&(last + 1));
        }
        Ok((events, foreign))
    }

    /// Applies mutations to the local snapshot ahead of the database write.
    /// The returned [`Staged`] must be fed to `commit` or `rollback`.
    pub fn stage(&mut self, mutations: &[Mutation]) -> Staged {
        let prev = self.snapshot.clone();
        for m in mutations {
            self.apply(m);
        }
        self.snapshot.warnings = compute_warnings(&self.snapshot.passes, &self.snapshot.queue);
        Staged { prev }
    }

    fn apply(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::InsertPass(row) => {
                self.snapshot.passes.push(row.clone());
                self.snapshot
                    .passes
                    .sort_by(|a, b| (a.time_out, &a.id).cmp(&(b.time_out, &b.id)));
            }
            Mutation::ReplacePass(row) => {
                if let Some(existing) =
                    self.snapshot.passes.iter_mut().find(|p| p.id == row.id)
                {
                    *existing = row.clone();
                }
                self.snapshot
                    .passes
                    .sort_by(|a, b| (a.time_out, &a.id).cmp(&(b.time_out, &b.id)));
            }
            Mutation::RemovePass(id) => {
                self.snapshot.passes.retain(|p| p.id != *id);
            }
            Mutation::AppendQueueEntry(row) => {
                self.snapshot.queue.push(row.clone());
                self.snapshot.queue.sort_by_key(|r| r.position);
            }
            Mutation::RemoveQueueEntry(id) => {
                queue::remove_and_close_gap(&mut self.snapshot.queue, id);
            }
        }
    }

    /// Acknowledges the staged mutations: `seqs` are the change-feed sequence
    /// numbers of our own writes, remembered so the next `sync` does not treat
    /// them as foreign and reload over the optimistic rows.
    pub fn commit(&mut self, _staged: Staged, seqs: &[i64]) {
        self.own_seqs.extend(seqs.iter().copied());
    }

    /// Persistence failed: restore the rows exactly as they were before the
    /// optimistic mutation.
    pub fn rollback(&mut self, staged: Staged) {
        self.snapshot = staged.prev;
    }

    /// The database assigned a different position than the optimistic guess
    /// (another client appended concurrently); adopt the authoritative one.
    pub fn set_queue_position(&mut self, entry_id: &str, position: i64) {
        if let Some(entry) = self.snapshot.queue.iter_mut().find(|r| r.id == entry_id) {
            entry.position = position;
        }
        self.snapshot.queue.sort_by_key(|r| r.position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::parse_ts;
    use crate::pass::new_pass;
    use chrono::{DateTime, Utc};
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_workspace(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    fn ts(s: &str) -> DateTime<Utc> {
        parse_ts(s).expect("test timestamp")
    }

    fn sample_pass(name: &str) -> PassRow {
        new_pass(
            "t-1",
            None,
            name,
            Some("Restroom".to_string()),
            false,
            Some(ts("2025-03-10T09:00:00Z")),
            ts("2025-03-10T09:00:00Z"),
        )
        .expect("pass")
    }

    fn sample_entry(name: &str, position: i64) -> QueueRow {
        QueueRow {
            id: format!("q-{}", name),
            teacher_id: "t-1".to_string(),
            student_id: None,
            student_name: name.to_string(),
            destination: "Restroom".to_string(),
            position,
            time_joined: ts("2025-03-10T09:00:00Z"),
        }
    }

    #[test]
    fn rollback_restores_the_pre_mutation_snapshot() {
        let workspace = temp_workspace("hallpass-store-rollback");
        let conn = db::open_db(&workspace).expect("open db");
        let mut store = TeacherStore::open(&conn, "t-1").expect("store");

        let staged = store.stage(&[Mutation::InsertPass(sample_pass("Alice"))]);
        assert_eq!(store.snapshot().passes.len(), 1);

        store.rollback(staged);
        assert!(store.snapshot().passes.is_empty());
        assert!(store.snapshot().warnings.is_empty());
        let _ = std::fs::remove_dir_all(workspace);
    }

    #[test]
    fn own_write_does_not_trigger_a_reload() {
        let workspace = temp_workspace("hallpass-store-own-write");
        let conn = db::open_db(&workspace).expect("open db");
        let mut store = TeacherStore::open(&conn, "t-1").expect("store");

        let row = sample_pass("Alice");
        let staged = store.stage(&[Mutation::InsertPass(row.clone())]);
        db::insert_pass(&conn, &row).expect("insert");
        let seq = db::record_change(&conn, "t-1", "passes", "insert", &row.id, row.time_out)
            .expect("record change");
        store.commit(staged, &[seq]);

        let (events, reloaded) = store.sync(&conn).expect("sync");
        assert_eq!(events.len(), 1);
        assert!(!reloaded, "own acknowledged write must not reload");
        assert_eq!(store.snapshot().passes.len(), 1);
        let _ = std::fs::remove_dir_all(workspace);
    }

    #[test]
    fn foreign_write_reloads_the_snapshot() {
        let workspace = temp_workspace("hallpass-store-foreign");
        let conn = db::open_db(&workspace).expect("open db");
        let mut store = TeacherStore::open(&conn, "t-1").expect("store");

        // Another client writes without this store's involvement.
        let row = sample_pass("Bob");
        db::insert_pass(&conn, &row).expect("insert");
        db::record_change(&conn, "t-1", "passes", "insert", &row.id, row.time_out)
            .expect("record change");

        let (events, reloaded) = store.sync(&conn).expect("sync");
        assert_eq!(events.len(), 1);
        assert!(reloaded);
        assert_eq!(store.snapshot().passes.len(), 1);
        assert_eq!(store.snapshot().passes[0].student_name, "Bob");
        let _ = std::fs::remove_dir_all(workspace);
    }

    #[test]
    fn earlier_foreign_event_still_reloads_past_an_own_write() {
        let workspace = temp_workspace("hallpass-store-interleaved");
        let conn = db::open_db(&workspace).expect("open db");
        let mut store = TeacherStore::open(&conn, "t-1").expect("store");

        // Foreign write lands first but unseen.
        let foreign = sample_pass("Bob");
        db::insert_pass(&conn, &foreign).expect("insert");
        db::record_change(&conn, "t-1", "passes", "insert", &foreign.id, foreign.time_out)
            .expect("record change");

        // Own write afterwards, committed normally.
        let own = sample_pass("Alice");
        let staged = store.stage(&[Mutation::InsertPass(own.clone())]);
        db::insert_pass(&conn, &own).expect("insert");
        let seq = db::record_change(&conn, "t-1", "passes", "insert", &own.id, own.time_out)
            .expect("record change");
        store.commit(staged, &[seq]);

        let (_, reloaded) = store.sync(&conn).expect("sync");
        assert!(reloaded, "the unseen foreign event must force a reload");
        assert_eq!(store.snapshot().passes.len(), 2);
        let _ = std::fs::remove_dir_all(workspace);
    }

    #[test]
    fn reload_reports_open_pass_and_queued_duplicates() {
        let workspace = temp_workspace("hallpass-store-duplicate");
        let conn = db::open_db(&workspace).expect("open db");

        let open = sample_pass("Bob");
        db::insert_pass(&conn, &open).expect("insert pass");
        db::append_queue_entry(
            &conn,
            "q-bob",
            "t-1",
            None,
            "Bob",
            "Restroom",
            ts("2025-03-10T09:01:00Z"),
        )
        .expect("append");

        let store = TeacherStore::open(&conn, "t-1").expect("store");
        let warnings = &store.snapshot().warnings;
        assert_eq!(warnings.len(), 1);
        assert!(matches!(
            &warnings[0],
            Inconsistency::OpenPassAndQueued { student_name, .. } if student_name == "Bob"
        ));
        let _ = std::fs::remove_dir_all(workspace);
    }

    #[test]
    fn reload_reports_position_gaps() {
        let workspace = temp_workspace("hallpass-store-gap");
        let conn = db::open_db(&workspace).expect("open db");

        // Simulate a foreign writer that left a hole at position 2.
        for entry in [sample_entry("Bob", 1), sample_entry("Dev", 3)] {
            conn.execute(
                "INSERT INTO queue(id, teacher_id, student_id, student_name, destination, position, time_joined)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
                (
                    &entry.id,
                    &entry.teacher_id,
                    &entry.student_id,
                    &entry.student_name,
                    &entry.destination,
                    entry.position,
                    crate::calc::format_ts(entry.time_joined),
                ),
            )
            .expect("seed entry");
        }

        let store = TeacherStore::open(&conn, "t-1").expect("store");
        assert!(store
            .snapshot()
            .warnings
            .iter()
            .any(|w| matches!(w, Inconsistency::PositionGap { positions } if positions == &vec![1, 3])));
        let _ = std::fs::remove_dir_all(workspace);
    }

    #[test]
    fn staged_queue_removal_closes_the_gap_optimistically() {
        let workspace = temp_workspace("hallpass-store-queue-gap");
        let conn = db::open_db(&workspace).expect("open db");
        let mut store = TeacherStore::open(&conn, "t-1").expect("store");

        store.stage(&[
            Mutation::AppendQueueEntry(sample_entry("Bob", 1)),
            Mutation::AppendQueueEntry(sample_entry("Cara", 2)),
            Mutation::AppendQueueEntry(sample_entry("Dev", 3)),
        ]);
        store.stage(&[Mutation::RemoveQueueEntry("q-Cara".to_string())]);

        let queue_rows = &store.snapshot().queue;
        assert_eq!(
            queue_rows
                .iter()
                .map(|r| (r.student_name.as_str(), r.position))
                .collect::<Vec<_>>(),
            vec![("Bob", 1), ("Dev", 2)]
        );
        assert!(store.snapshot().warnings.is_empty());
        let _ = std::fs::remove_dir_all(workspace);
    }
}
