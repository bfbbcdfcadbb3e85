use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use millrace_domain::{EntryFilter, EntryId, EntryStatus};
use millrace_runner::{
    FnProcessor, JsonCodec, Pipe, Processor, RunOptions, Runner, RunnerConfig, StageRunner,
    Verdict,
};
use millrace_store::{MemoryStore, QueueStore};
use serde_json::{json, Value};

use crate::error::PipelineError;
use crate::pipeline::Pipeline;

type ValueRunner = Runner<JsonCodec<Value, Value>>;

fn quick_config() -> RunnerConfig {
    RunnerConfig {
        max_retries: 3,
        process_timeout: Duration::from_millis(100),
        retry_delay: Some(Duration::from_millis(10)),
        ..RunnerConfig::default()
    }
}

fn stage(
    store: Arc<dyn QueueStore>,
    processor: Arc<dyn Processor<Value, Value>>,
) -> ValueRunner {
    Runner::new(store, JsonCodec::new(), processor, quick_config())
}

fn echo_processor() -> Arc<dyn Processor<Value, Value>> {
    Arc::new(FnProcessor::new(|request: Value| async move {
        Ok(Verdict::completed(request))
    }))
}

fn doubler() -> Arc<dyn Processor<Value, Value>> {
    Arc::new(FnProcessor::new(|request: Value| async move {
        let value = request["value"].clone();
        let doubled = match &value {
            Value::Number(n) => json!(n.as_i64().unwrap_or(0) * 2),
            Value::String(s) => json!(format!("{s}{s}")),
            other => other.clone(),
        };
        Ok(Verdict::completed(json!({ "value": value, "doubled": doubled })))
    }))
}

fn length_calc() -> Arc<dyn Processor<Value, Value>> {
    Arc::new(FnProcessor::new(|request: Value| async move {
        let length = match &request["doubled"] {
            Value::String(s) => s.len(),
            other => other.to_string().len(),
        };
        let mut output = request.clone();
        output["length"] = json!(length);
        Ok(Verdict::completed(output))
    }))
}

fn batch_counter() -> Arc<dyn Processor<Value, Value>> {
    Arc::new(FnProcessor::new(|request: Value| async move {
        let size = request.as_array().map(Vec::len).unwrap_or(0);
        Ok(Verdict::completed(json!({ "batched": size })))
    }))
}

async fn settle(pipeline: &Pipeline, cycles: u32) {
    for _ in 0..cycles {
        pipeline.run(RunOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        pipeline.maintain().await.unwrap();
    }
}

#[test]
fn empty_pipeline_is_rejected() {
    let stages: Vec<(&str, Arc<dyn StageRunner>)> = Vec::new();
    assert!(matches!(
        Pipeline::new(stages).unwrap_err(),
        PipelineError::Empty
    ));
}

#[tokio::test]
async fn two_stage_chain_carries_outputs_forward() {
    let store = Arc::new(MemoryStore::new());
    let first = Arc::new(stage(store.partition("double"), doubler()));
    let second = Arc::new(stage(store.partition("length"), length_calc()));

    let pipeline = Pipeline::new([
        ("double", first.clone() as Arc<dyn StageRunner>),
        ("length", second.clone() as Arc<dyn StageRunner>),
    ])
    .unwrap();
    pipeline.initialize().await.unwrap();

    let id = pipeline.add(&json!({ "value": "abc" })).await.unwrap();
    settle(&pipeline, 3).await;

    // The source entry moved on; the result stage completed under the same
    // id with both stages' work applied.
    assert_eq!(
        first.get(&id).await.unwrap().unwrap().status,
        EntryStatus::Moved
    );
    let done = pipeline.get(&id).await.unwrap().unwrap();
    assert_eq!(done.status, EntryStatus::Completed);
    assert_eq!(
        done.output,
        Some(json!({ "value": "abc", "doubled": "abcabc", "length": 6 }))
    );
    assert!(done.idempotent_keys.contains(id.as_str()));
}

#[tokio::test]
async fn query_and_stage_access() {
    let store = Arc::new(MemoryStore::new());
    let only = Arc::new(stage(store.partition("solo"), echo_processor()));
    let pipeline =
        Pipeline::new([("solo", only.clone() as Arc<dyn StageRunner>)]).unwrap();

    pipeline.add(&json!(1)).await.unwrap();
    pipeline.add(&json!(2)).await.unwrap();
    settle(&pipeline, 1).await;

    let completed = pipeline
        .query(EntryFilter::status(EntryStatus::Completed))
        .await
        .unwrap();
    assert_eq!(completed.len(), 2);

    assert!(pipeline.stage("solo").is_ok());
    assert!(matches!(
        pipeline.stage("missing").unwrap_err(),
        PipelineError::UnknownStage(_)
    ));
}

#[tokio::test]
async fn three_stage_pipeline_with_batched_tail() {
    let store = Arc::new(MemoryStore::new());
    let final_stage = Arc::new(stage(store.partition("final"), batch_counter()));
    let lengths = Arc::new(
        stage(store.partition("length"), length_calc())
            .with_pipe(Pipe::to(final_stage.clone()).batched(2, 2).shared_target()),
    );
    let doubles = Arc::new(stage(store.partition("double"), doubler()));

    let pipeline = Pipeline::new([
        ("double", doubles.clone() as Arc<dyn StageRunner>),
        ("length", lengths.clone() as Arc<dyn StageRunner>),
        ("final", final_stage.clone() as Arc<dyn StageRunner>),
    ])
    .unwrap();
    pipeline.initialize().await.unwrap();

    let mut ids = Vec::new();
    for value in [json!(10), json!("a"), json!("abc"), json!("defg"), json!("blah")] {
        ids.push(pipeline.add(&json!({ "value": value })).await.unwrap());
    }
    settle(&pipeline, 4).await;

    // Five completed mid-stage entries batch as two pairs; the odd one out
    // waits for a partner.
    let batches = pipeline
        .query(EntryFilter::status(EntryStatus::Completed))
        .await
        .unwrap();
    assert_eq!(batches.len(), 2);
    let mut batched_ids: BTreeSet<String> = BTreeSet::new();
    for batch in &batches {
        assert_eq!(batch.idempotent_keys.len(), 2);
        assert_eq!(batch.output, Some(json!({ "batched": 2 })));
        batched_ids.extend(batch.idempotent_keys.iter().cloned());
    }
    assert_eq!(batched_ids.len(), 4);
    let all_ids: BTreeSet<String> = ids.iter().map(|id| id.to_string()).collect();
    assert!(batched_ids.is_subset(&all_ids));

    let waiting: Vec<EntryId> = lengths
        .query(EntryFilter::status(EntryStatus::Completed))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(waiting.len(), 1);
    assert!(!batched_ids.contains(waiting[0].as_str()));

    // A sixth input pairs with the leftover into a third batch.
    let sixth = pipeline.add(&json!({ "value": "late" })).await.unwrap();
    settle(&pipeline, 4).await;

    let batches = pipeline
        .query(EntryFilter::status(EntryStatus::Completed))
        .await
        .unwrap();
    assert_eq!(batches.len(), 3);
    let mut batched_ids: BTreeSet<String> = BTreeSet::new();
    for batch in &batches {
        batched_ids.extend(batch.idempotent_keys.iter().cloned());
    }
    assert!(batched_ids.contains(waiting[0].as_str()));
    assert!(batched_ids.contains(sixth.as_str()));
    assert_eq!(batched_ids.len(), 6);
    assert!(lengths
        .query(EntryFilter::status(EntryStatus::Completed))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn destroy_forwards_to_stages() {
    let store = Arc::new(MemoryStore::new());
    let only = Arc::new(stage(store.partition("solo"), echo_processor()));
    let pipeline =
        Pipeline::new([("solo", only.clone() as Arc<dyn StageRunner>)]).unwrap();

    pipeline.destroy().await.unwrap();
    assert!(pipeline.add(&json!(1)).await.is_err());
}
