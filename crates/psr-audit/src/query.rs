use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AuditAction, AuditEntry};

/// Read-side filters for the admin log viewer.
///
/// `tail` takes precedence over `offset`/`limit`: it returns the N most
/// recent matching entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditQuery {
    pub wpsd_id: Option<String>,
    pub action: Option<AuditAction>,
    /// Inclusive lower bound on `timestamp`.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `timestamp`.
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
    pub tail: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditPage {
    /// Number of entries matching the filters before pagination.
    pub total: usize,
    /// Newest first.
    pub entries: Vec<AuditEntry>,
}

impl AuditQuery {
    pub fn tail(n: usize) -> Self {
        Self {
            tail: Some(n),
            ..Self::default()
        }
    }

    pub fn matches(&self, e: &AuditEntry) -> bool {
        if let Some(want) = &self.wpsd_id {
            match &e.wpsd_id {
                Some(got) if got.eq_ignore_ascii_case(want) => {}
                _ => return false,
            }
        }
        if let Some(action) = self.action {
            if e.action != action {
                return false;
            }
        }
        if let Some(from) = self.from {
            if e.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if e.timestamp > to {
                return false;
            }
        }
        true
    }

    /// Filter then paginate an already newest-first sequence.
    pub(crate) fn apply(&self, newest_first: Vec<AuditEntry>) -> AuditPage {
        let matched: Vec<AuditEntry> = newest_first
            .into_iter()
            .filter(|e| self.matches(e))
            .collect();
        let total = matched.len();

        let entries = match self.tail {
            Some(n) => matched.into_iter().take(n).collect(),
            None => {
                let it = matched.into_iter().skip(self.offset);
                match self.limit {
                    Some(limit) => it.take(limit).collect(),
                    None => it.collect(),
                }
            }
        };

        AuditPage { total, entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entries() -> Vec<AuditEntry> {
        let t0 = Utc::now();
        // newest first
        (0..6)
            .map(|i| {
                let action = if i % 2 == 0 {
                    AuditAction::Updated
                } else {
                    AuditAction::Received
                };
                AuditEntry::new(action, format!("m{i}"))
                    .sensor(if i < 3 { "75E1CA81" } else { "11223344" })
                    .at(t0 - Duration::minutes(i))
            })
            .collect()
    }

    #[test]
    fn filters_compose() {
        let q = AuditQuery {
            wpsd_id: Some("75e1ca81".to_string()),
            action: Some(AuditAction::Updated),
            ..AuditQuery::default()
        };
        let page = q.apply(entries());
        assert_eq!(page.total, 2);
        assert_eq!(page.entries[0].message, "m0");
        assert_eq!(page.entries[1].message, "m2");
    }

    #[test]
    fn date_range_is_inclusive() {
        let all = entries();
        let q = AuditQuery {
            from: Some(all[3].timestamp),
            to: Some(all[1].timestamp),
            ..AuditQuery::default()
        };
        let page = q.apply(all);
        let msgs: Vec<_> = page.entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(msgs, ["m1", "m2", "m3"]);
    }

    #[test]
    fn offset_limit_and_tail() {
        let q = AuditQuery {
            offset: 2,
            limit: Some(2),
            ..AuditQuery::default()
        };
        let page = q.apply(entries());
        assert_eq!(page.total, 6);
        let msgs: Vec<_> = page.entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(msgs, ["m2", "m3"]);

        let page = AuditQuery::tail(3).apply(entries());
        let msgs: Vec<_> = page.entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(msgs, ["m0", "m1", "m2"]);
    }

    #[test]
    fn entries_without_sensor_do_not_match_sensor_filter() {
        let q = AuditQuery {
            wpsd_id: Some("75E1CA81".to_string()),
            ..AuditQuery::default()
        };
        let page = q.apply(vec![AuditEntry::new(AuditAction::Error, "boom")]);
        assert_eq!(page.total, 0);
    }
}
