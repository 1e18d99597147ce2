//! Master/exception grouping of parsed VEVENTs.
//!
//! Components are classified first, then grouped by UID in a second pass, so
//! document order never matters: an exception may appear before its master.

use chrono::{DateTime, Utc};

use crate::event::EventData;

/// What a VEVENT is within its UID group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentRole {
    Master,
    Exception { instance_time: DateTime<Utc> },
}

impl ComponentRole {
    pub fn of(data: &EventData) -> Self {
        match data.recurrence_id {
            Some(instance_time) => ComponentRole::Exception { instance_time },
            None => ComponentRole::Master,
        }
    }
}

/// All components sharing one UID.
#[derive(Debug, Clone, PartialEq)]
pub struct EventGroup {
    pub uid: String,
    /// `None` when the document only contained exceptions for this UID
    pub master: Option<EventData>,
    /// Ordered by instance time, at most one per instance
    pub exceptions: Vec<EventData>,
}

impl EventGroup {
    pub fn is_orphan(&self) -> bool {
        self.master.is_none()
    }
}

/// Recoverable anomalies found while parsing a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseIssue {
    /// Exceptions for a UID without its master
    MissingMaster { uid: String },
    /// More than one master for a UID; the highest SEQUENCE was kept
    DuplicateMaster { uid: String },
    /// More than one exception for the same instance; the highest SEQUENCE was kept
    DuplicateException {
        uid: String,
        instance_time: DateTime<Utc>,
    },
    /// A VEVENT that could not be interpreted and was skipped
    InvalidComponent { uid: Option<String>, reason: String },
}

impl ParseIssue {
    /// Whether the issue means part of the server's data was not applied.
    pub fn is_failure(&self) -> bool {
        matches!(self, ParseIssue::InvalidComponent { .. })
    }
}

/// Group parsed components by UID, resolving duplicates.
pub fn group_components(components: Vec<EventData>) -> (Vec<EventGroup>, Vec<ParseIssue>) {
    // Pass 1: classify, bucketing by UID in order of first appearance
    let mut buckets: Vec<(String, Vec<(ComponentRole, EventData)>)> = Vec::new();
    for data in components {
        let role = ComponentRole::of(&data);
        match buckets.iter_mut().find(|(uid, _)| *uid == data.uid) {
            Some((_, members)) => members.push((role, data)),
            None => buckets.push((data.uid.clone(), vec![(role, data)])),
        }
    }

    // Pass 2: pick one master and one exception per instance
    let mut groups = Vec::with_capacity(buckets.len());
    let mut issues = Vec::new();
    for (uid, members) in buckets {
        let mut master: Option<EventData> = None;
        let mut exceptions: Vec<EventData> = Vec::new();

        for (role, data) in members {
            match role {
                ComponentRole::Master => {
                    if let Some(existing) = &master {
                        issues.push(ParseIssue::DuplicateMaster { uid: uid.clone() });
                        if existing.sequence >= data.sequence {
                            continue;
                        }
                    }
                    master = Some(data);
                }
                ComponentRole::Exception { instance_time } => {
                    match exceptions
                        .iter_mut()
                        .find(|e| e.recurrence_id == Some(instance_time))
                    {
                        Some(existing) => {
                            issues.push(ParseIssue::DuplicateException {
                                uid: uid.clone(),
                                instance_time,
                            });
                            if data.sequence > existing.sequence {
                                *existing = data;
                            }
                        }
                        None => exceptions.push(data),
                    }
                }
            }
        }

        if master.is_none() {
            issues.push(ParseIssue::MissingMaster { uid: uid.clone() });
        }
        exceptions.sort_by_key(|e| e.recurrence_id);
        groups.push(EventGroup {
            uid,
            master,
            exceptions,
        });
    }

    (groups, issues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn component(uid: &str, instance: Option<i64>, sequence: i64) -> EventData {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let mut data = EventData::new(uid, "x", base, base + Duration::hours(1));
        data.recurrence_id = instance.map(|d| base + Duration::days(d));
        data.sequence = sequence;
        data
    }

    #[test]
    fn test_exception_before_master_still_groups() {
        let (groups, issues) = group_components(vec![
            component("a", Some(7), 0),
            component("b", None, 0),
            component("a", None, 0),
        ]);
        assert!(issues.is_empty());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].uid, "a");
        assert!(groups[0].master.is_some());
        assert_eq!(groups[0].exceptions.len(), 1);
    }

    #[test]
    fn test_orphan_and_duplicates_are_reported() {
        let (groups, issues) = group_components(vec![
            component("orphan", Some(1), 0),
            component("dup", None, 1),
            component("dup", None, 3),
            component("dup", Some(2), 5),
            component("dup", Some(2), 2),
        ]);

        assert!(groups[0].is_orphan());
        let dup = &groups[1];
        assert_eq!(dup.master.as_ref().map(|m| m.sequence), Some(3));
        assert_eq!(dup.exceptions.len(), 1);
        assert_eq!(dup.exceptions[0].sequence, 5);
        assert_eq!(issues.len(), 3);
        assert!(issues.contains(&ParseIssue::MissingMaster { uid: "orphan".into() }));
    }
}
