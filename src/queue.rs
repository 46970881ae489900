use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct QueueRow {
    pub id: String,
    pub teacher_id: String,
    pub student_id: Option<String>,
    pub student_name: String,
    pub destination: String,
    pub position: i64,
    pub time_joined: DateTime<Utc>,
}

/// Next append position: current max + 1, starting at 1 for an empty line.
/// Ordering is solely by position; `time_joined` never breaks ties.
pub fn next_position(rows: &[QueueRow]) -> i64 {
    rows.iter().map(|r| r.position).max().unwrap_or(0) + 1
}

/// Removes the entry from an in-memory line and decrements every later
/// position, keeping the remaining entries contiguous at 1..=N-1 in the same
/// relative order. Returns None (and touches nothing) for an unknown id.
pub fn remove_and_close_gap(rows: &mut Vec<QueueRow>, entry_id: &str) -> Option<QueueRow> {
    let idx = rows.iter().position(|r| r.id == entry_id)?;
    let removed = rows.remove(idx);
    for r in rows.iter_mut() {
        if r.position > removed.position {
            r.position -= 1;
        }
    }
    Some(removed)
}

/// True when positions form exactly 1..=N. Foreign writers (a crashed client,
/// a manual DB edit) can leave holes; callers surface those as warnings.
pub fn positions_contiguous(rows: &[QueueRow]) -> bool {
    let mut positions: Vec<i64> = rows.iter().map(|r| r.position).collect();
    positions.sort_unstable();
    positions
        .iter()
        .enumerate()
        .all(|(i, p)| *p == i as i64 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::parse_ts;

    fn entry(id: &str, name: &str, position: i64) -> QueueRow {
        QueueRow {
            id: id.to_string(),
            teacher_id: "t-1".to_string(),
            student_id: None,
            student_name: name.to_string(),
            destination: "Restroom".to_string(),
            position,
            time_joined: parse_ts("2025-03-10T09:00:00Z").expect("ts"),
        }
    }

    #[test]
    fn next_position_is_max_plus_one() {
        assert_eq!(next_position(&[]), 1);
        let line = vec![entry("a", "Bob", 1), entry("b", "Cara", 2)];
        assert_eq!(next_position(&line), 3);
    }

    #[test]
    fn removing_the_head_renumbers_to_contiguous() {
        let mut line = vec![
            entry("a", "Bob", 1),
            entry("b", "Cara", 2),
            entry("c", "Dev", 3),
        ];
        let removed = remove_and_close_gap(&mut line, "a").expect("removed");
        assert_eq!(removed.student_name, "Bob");
        assert_eq!(
            line.iter()
                .map(|r| (r.student_name.as_str(), r.position))
                .collect::<Vec<_>>(),
            vec![("Cara", 1), ("Dev", 2)]
        );
        assert!(positions_contiguous(&line));
    }

    #[test]
    fn removing_mid_line_never_reuses_a_stale_position() {
        let mut line = vec![
            entry("a", "Bob", 1),
            entry("b", "Cara", 2),
            entry("c", "Dev", 3),
        ];
        remove_and_close_gap(&mut line, "b").expect("removed");
        // Previous max was 3; after gap closure the next join lands there again,
        // not at a recycled middle slot.
        assert_eq!(next_position(&line), 3);
        assert!(positions_contiguous(&line));
    }

    #[test]
    fn removing_an_unknown_id_is_a_no_op() {
        let mut line = vec![entry("a", "Bob", 1), entry("b", "Cara", 2)];
        assert!(remove_and_close_gap(&mut line, "zz").is_none());
        assert_eq!(line.len(), 2);
        assert_eq!(line[0].position, 1);
        assert_eq!(line[1].position, 2);
    }

    #[test]
    fn contiguity_check_flags_holes() {
        let line = vec![entry("a", "Bob", 1), entry("b", "Cara", 3)];
        assert!(!positions_contiguous(&line));
    }
}
