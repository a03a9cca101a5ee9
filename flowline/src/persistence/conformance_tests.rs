//! Behaviour every store implementation must share.

use super::{FlowContextRepo, RetryRecord, RetryRepo};
use crate::core::{BatchKey, FlowContext, FlowStatus};
use crate::errors::FlowError;
use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use uuid::Uuid;

fn ids(contexts: &[FlowContext<Value>]) -> Vec<Uuid> {
    contexts.iter().map(|c| c.id).collect()
}

pub(crate) async fn context_repo_suite(repo: &dyn FlowContextRepo<Value>) {
    let trace = Uuid::new_v4();
    let batch = Uuid::new_v4();
    let first = FlowContext::new("s:1", trace, "state1", json!({"n": 1})).with_batch(batch);
    let second = FlowContext::new("s:1", trace, "state1", json!({"n": 2})).with_batch(batch);
    let other = FlowContext::new("s:1", Uuid::new_v4(), "state1", json!({"n": 3}));

    // save, and duplicates are skipped
    let saved = repo.save(&[first.clone(), second.clone(), other.clone()]).await.unwrap();
    assert_eq!(saved, 3);
    assert_eq!(repo.save(&[first.clone()]).await.unwrap(), 0);

    // find keeps insertion order and filters by trace
    let pending = repo.find("s:1", None, "state1", FlowStatus::Pending).await.unwrap();
    assert_eq!(ids(&pending), vec![first.id, second.id, other.id]);
    let in_trace = repo.find("s:1", Some(trace), "state1", FlowStatus::Pending).await.unwrap();
    assert_eq!(ids(&in_trace), vec![first.id, second.id]);
    assert!(repo.find("s:2", None, "state1", FlowStatus::Pending).await.unwrap().is_empty());

    // batch lookups distinguish a missing batch from a set one
    let key = BatchKey::new("s:1", "state1", Some(batch));
    let batched = repo.find_batch(&key, FlowStatus::Pending).await.unwrap();
    assert_eq!(ids(&batched), vec![first.id, second.id]);
    let unbatched = repo
        .find_batch(&BatchKey::new("s:1", "state1", None), FlowStatus::Pending)
        .await
        .unwrap();
    assert_eq!(ids(&unbatched), vec![other.id]);

    // update replaces status, data and error; read-your-writes
    let mut failed = first.clone();
    failed.transition(FlowStatus::Processing).unwrap();
    failed.fail(FlowStatus::Error, "boom").unwrap();
    failed.data = json!({"n": 10});
    assert_eq!(repo.update(&[failed.clone()]).await.unwrap(), 1);
    let reloaded = repo.find_by_ids(&[first.id]).await.unwrap();
    assert_eq!(reloaded.len(), 1);
    assert_eq!(reloaded[0].status, FlowStatus::Error);
    assert_eq!(reloaded[0].data, json!({"n": 10}));
    assert_eq!(reloaded[0].error.as_deref(), Some("boom"));

    // updating an unknown context touches nothing
    let ghost = FlowContext::new("s:1", trace, "state1", json!({}));
    assert_eq!(repo.update(&[ghost.clone()]).await.unwrap(), 0);

    // update_data_and_batch leaves status untouched
    let fresh = Uuid::new_v4();
    let mut resumed = second.clone().with_batch(fresh);
    resumed.data = json!({"n": 2, "approved": true});
    resumed.status = FlowStatus::Archived;
    assert_eq!(repo.update_data_and_batch(&[resumed, ghost]).await.unwrap(), 1);
    let reloaded = repo.find_by_ids(&[second.id]).await.unwrap();
    assert_eq!(reloaded[0].status, FlowStatus::Pending);
    assert_eq!(reloaded[0].to_batch, Some(fresh));
    assert_eq!(reloaded[0].data, json!({"n": 2, "approved": true}));

    // trace and id lookups
    let all = repo.find_all_by_trace(trace).await.unwrap();
    assert_eq!(ids(&all), vec![first.id, second.id]);
    assert!(repo.find_by_ids(&[Uuid::new_v4()]).await.unwrap().is_empty());

    // advance writes nothing when its fence fails
    let hop = Uuid::new_v4();
    let origin = FlowContext::new("s:1", hop, "state1", json!({"n": 4}));
    repo.save(&[origin.clone()]).await.unwrap();
    let mut archived = origin.clone();
    archived.transition(FlowStatus::Processing).unwrap();
    archived.transition(FlowStatus::Archived).unwrap();
    let successor = FlowContext::new("s:1", hop, "state2", json!({"n": 4}));
    let lost = repo
        .advance(&[successor.clone()], &[archived.clone()], &|| {
            Err(FlowError::LockLost {
                key: "s:1/state1".into(),
            })
        })
        .await;
    assert!(matches!(lost, Err(FlowError::LockLost { .. })));
    let untouched = repo.find_all_by_trace(hop).await.unwrap();
    assert_eq!(ids(&untouched), vec![origin.id]);
    assert_eq!(untouched[0].status, FlowStatus::Pending);

    // and both halves together when it holds
    let counts = repo
        .advance(&[successor.clone()], &[archived], &|| Ok(()))
        .await
        .unwrap();
    assert_eq!(counts, (1, 1));
    let moved = repo.find_all_by_trace(hop).await.unwrap();
    assert_eq!(ids(&moved), vec![origin.id, successor.id]);
    assert_eq!(moved[0].status, FlowStatus::Archived);
    assert_eq!(moved[1].status, FlowStatus::Pending);
}

pub(crate) async fn retry_repo_suite(repo: &dyn RetryRepo) {
    let batch = Uuid::new_v4();
    assert!(repo.get_by_id(batch).await.unwrap().is_none());
    assert!(!repo.is_max_retry_count(batch, 1).await.unwrap());
    assert!(repo.is_max_retry_count(batch, 0).await.unwrap());

    let now = Utc::now();
    let later = now + Duration::seconds(60);
    let record = RetryRecord::new(batch, "s:1", "state1")
        .with_next_retry_at(now)
        .with_error("down");
    assert_eq!(repo.increment(record.clone()).await.unwrap(), 1);
    assert_eq!(
        repo.increment(record.with_next_retry_at(later).with_error("still down"))
            .await
            .unwrap(),
        2
    );

    let stored = repo.get_by_id(batch).await.unwrap().unwrap();
    assert_eq!(stored.retry_count, 2);
    assert_eq!(stored.last_error.as_deref(), Some("still down"));
    assert_eq!(stored.batch_key(), BatchKey::new("s:1", "state1", Some(batch)));
    assert!(repo.is_max_retry_count(batch, 2).await.unwrap());
    assert!(!repo.is_max_retry_count(batch, 3).await.unwrap());

    // not due until its time has come
    assert!(repo.due(now, 10).await.unwrap().is_empty());
    let early = Uuid::new_v4();
    let overdue = RetryRecord::new(early, "s:1", "state2")
        .with_next_retry_at(now - Duration::seconds(5));
    repo.increment(overdue).await.unwrap();
    let due = repo.due(later, 10).await.unwrap();
    assert_eq!(due.iter().map(|r| r.batch_id).collect::<Vec<_>>(), vec![early, batch]);
    assert_eq!(repo.due(later, 1).await.unwrap().len(), 1);

    assert_eq!(repo.delete(batch).await.unwrap(), 1);
    assert_eq!(repo.delete(batch).await.unwrap(), 0);
    assert!(repo.get_by_id(batch).await.unwrap().is_none());
}
