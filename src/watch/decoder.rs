//! Turns committed writes into client-facing watch events.
//!
//! The predicate is applied to the object before and after the write:
//!
//! | before | after | event |
//! |--------|-------|-------|
//! | no     | yes   | `Added` |
//! | yes    | no    | `Deleted` (previous body, new version) |
//! | yes    | yes   | `Modified` |
//! | no     | no    | suppressed |

use crate::storage::{Action, Entity, EntityMeta, SelectionPredicate};

use super::{WatchEvent, WatchEventType, WrittenEvent, INITIAL_EVENTS_END_ANNOTATION};

/// Whether decoding `event` needs the previous snapshot.
///
/// Only updates can change match status, and only a predicate that
/// actually filters can tell the two snapshots apart.
pub fn needs_previous(event: &WrittenEvent, predicate: &SelectionPredicate) -> bool {
    event.entity.action == Action::Updated
        && event.previous.is_none()
        && event.entity.previous_version > 0
        && *predicate != SelectionPredicate::everything()
}

/// Decode one write. `previous` overrides the snapshot carried by the
/// event; with neither, match status is assumed unchanged.
pub fn decode(
    event: &WrittenEvent,
    previous: Option<&Entity>,
    predicate: &SelectionPredicate,
) -> Option<WatchEvent> {
    let entity = &event.entity;
    let previous = previous.or(event.previous.as_ref());

    let (matched_before, matches_now) = match entity.action {
        Action::Created => (false, predicate.matches(entity)),
        // The deleted row carries the pre-delete body.
        Action::Deleted => (predicate.matches(entity), false),
        Action::Updated | Action::Unknown => {
            let now = predicate.matches(entity);
            let before = previous.map_or(now, |p| predicate.matches(p));
            (before, now)
        }
    };

    match (matched_before, matches_now) {
        (false, true) => Some(WatchEvent::new(WatchEventType::Added, entity.clone())),
        (true, true) => Some(WatchEvent {
            kind: WatchEventType::Modified,
            entity: entity.clone(),
            previous: previous.cloned(),
        }),
        (true, false) => {
            let mut gone = match (entity.action, previous) {
                (Action::Deleted, _) | (_, None) => entity.clone(),
                (_, Some(p)) => p.clone(),
            };
            gone.resource_version = entity.resource_version;
            Some(WatchEvent::new(WatchEventType::Deleted, gone))
        }
        (false, false) => None,
    }
}

/// Bookmark marking the end of the initial event list.
pub fn initial_events_end(
    group: &str,
    resource: &str,
    namespace: &str,
    resource_version: i64,
) -> WatchEvent {
    let entity = Entity {
        group: group.to_string(),
        resource: resource.to_string(),
        namespace: namespace.to_string(),
        resource_version,
        meta: EntityMeta::default().with_annotation(INITIAL_EVENTS_END_ANNOTATION, "true"),
        ..Default::default()
    };
    WatchEvent::new(WatchEventType::Bookmark, entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LabelSelector, Requirement};

    fn entity(action: Action, rv: i64, env: &str, body: &str) -> Entity {
        Entity {
            group: "g".into(),
            resource: "widgets".into(),
            namespace: "ns".into(),
            name: "a".into(),
            guid: "guid-a".into(),
            resource_version: rv,
            previous_version: rv - 1,
            action,
            body: body.as_bytes().to_vec(),
            meta: EntityMeta::default().with_label("env", env),
            ..Default::default()
        }
    }

    fn prod_only() -> SelectionPredicate {
        SelectionPredicate {
            labels: LabelSelector::everything().with(Requirement::equals("env", "prod")),
            ..Default::default()
        }
    }

    fn written(entity: Entity) -> WrittenEvent {
        WrittenEvent {
            entity,
            previous: None,
            timestamp: 0,
        }
    }

    #[test]
    fn test_created_matching_is_added() {
        let event = written(entity(Action::Created, 1, "prod", "v1"));
        let decoded = decode(&event, None, &prod_only()).unwrap();
        assert_eq!(decoded.kind, WatchEventType::Added);
        assert_eq!(decoded.entity.resource_version, 1);
    }

    #[test]
    fn test_never_matching_is_suppressed() {
        let event = written(entity(Action::Created, 1, "dev", "v1"));
        assert!(decode(&event, None, &prod_only()).is_none());

        let prev = entity(Action::Created, 1, "dev", "v1");
        let event = written(entity(Action::Updated, 2, "staging", "v2"));
        assert!(decode(&event, Some(&prev), &prod_only()).is_none());
    }

    #[test]
    fn test_leaving_the_filter_is_deleted_with_previous_body() {
        let prev = entity(Action::Created, 4, "prod", "old");
        let event = written(entity(Action::Updated, 5, "dev", "new"));

        let decoded = decode(&event, Some(&prev), &prod_only()).unwrap();
        assert_eq!(decoded.kind, WatchEventType::Deleted);
        assert_eq!(decoded.entity.body, b"old");
        assert_eq!(decoded.entity.resource_version, 5);
    }

    #[test]
    fn test_entering_the_filter_is_added() {
        let prev = entity(Action::Created, 1, "dev", "old");
        let event = written(entity(Action::Updated, 2, "prod", "new"));
        let decoded = decode(&event, Some(&prev), &prod_only()).unwrap();
        assert_eq!(decoded.kind, WatchEventType::Added);
        assert_eq!(decoded.entity.body, b"new");
    }

    #[test]
    fn test_still_matching_is_modified() {
        let prev = entity(Action::Created, 1, "prod", "old");
        let event = written(entity(Action::Updated, 2, "prod", "new"));
        let decoded = decode(&event, Some(&prev), &prod_only()).unwrap();
        assert_eq!(decoded.kind, WatchEventType::Modified);
        assert_eq!(decoded.previous.unwrap().body, b"old");
    }

    #[test]
    fn test_delete_of_matching_object() {
        let event = written(entity(Action::Deleted, 9, "prod", "last"));
        let decoded = decode(&event, None, &prod_only()).unwrap();
        assert_eq!(decoded.kind, WatchEventType::Deleted);
        assert_eq!(decoded.entity.body, b"last");
        assert_eq!(decoded.entity.resource_version, 9);

        let event = written(entity(Action::Deleted, 9, "dev", "last"));
        assert!(decode(&event, None, &prod_only()).is_none());
    }

    #[test]
    fn test_needs_previous() {
        let update = written(entity(Action::Updated, 2, "prod", "x"));
        assert!(needs_previous(&update, &prod_only()));
        assert!(!needs_previous(&update, &SelectionPredicate::everything()));

        let create = written(entity(Action::Created, 1, "prod", "x"));
        assert!(!needs_previous(&create, &prod_only()));

        let carried = WrittenEvent {
            previous: Some(entity(Action::Created, 1, "prod", "x")),
            ..update
        };
        assert!(!needs_previous(&carried, &prod_only()));
    }

    #[test]
    fn test_bookmark_annotation() {
        let bookmark = initial_events_end("g", "widgets", "ns", 42);
        assert_eq!(bookmark.kind, WatchEventType::Bookmark);
        assert!(bookmark.entity.body.is_empty());
        assert_eq!(bookmark.entity.resource_version, 42);
        assert_eq!(
            bookmark
                .entity
                .meta
                .annotations
                .get(INITIAL_EVENTS_END_ANNOTATION)
                .map(String::as_str),
            Some("true")
        );
    }
}
