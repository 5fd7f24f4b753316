//! The step loop that drives one assessment.
//!
//! An [`AssessmentOrchestrator`] owns one environment and one participant for
//! the lifetime of a run. [`AssessmentOrchestrator::run`] turns the episode
//! into a lazy stream: progress events are yielded as each step completes and
//! exactly one artifact closes the stream, whichever way the episode ends.

use std::{pin::Pin, sync::Arc, time::Duration};

use async_stream::stream;
use chrono::Utc;
use futures_core::Stream;

use crate::{
    environment::{Environment, Invocation, Trace},
    error::TransportError,
    participant::Participant,
    protocol::{
        Artifact, AssessmentConfig, AssessmentEvent, ErrorKind, ErrorReport, EvaluationOutcome,
        EvaluationReport, ParticipantAction, RemoteMessage, TaskUpdate, Termination,
    },
};

pub type AssessmentStream = Pin<Box<dyn Stream<Item = AssessmentEvent> + Send>>;

pub struct AssessmentOrchestrator {
    assessment_id: String,
    config: AssessmentConfig,
    environment: Box<dyn Environment>,
    participant: Arc<dyn Participant>,
}

impl AssessmentOrchestrator {
    pub fn new(
        config: AssessmentConfig,
        environment: Box<dyn Environment>,
        participant: Arc<dyn Participant>,
    ) -> Self {
        Self {
            assessment_id: uuid::Uuid::new_v4().to_string(),
            config,
            environment,
            participant,
        }
    }

    pub fn assessment_id(&self) -> &str {
        &self.assessment_id
    }

    /// Runs the episode, yielding events as they happen.
    ///
    /// Nothing happens until the stream is polled. Dropping it cancels the
    /// in-flight exchange and releases the environment.
    pub fn run(self) -> AssessmentStream {
        let Self {
            assessment_id,
            config,
            mut environment,
            participant,
        } = self;
        let timeout = config.timeout();

        Box::pin(stream! {
            let mut guard = EpisodeGuard::new(&assessment_id);

            let reset = match environment.reset(&config).await {
                Ok(reset) => reset,
                Err(error) => {
                    tracing::warn!(assessment_id = %assessment_id, %error, "environment reset failed");
                    let report = ErrorReport::new(ErrorKind::Environment, error.to_string());
                    guard.complete();
                    yield failure(report, &assessment_id, None, None, 0);
                    return;
                }
            };

            let budget = reset.step_budget;
            let task_id = reset.task_id.clone();
            let subject_id = reset.subject_id.clone();
            tracing::info!(
                assessment_id = %assessment_id,
                task_id = %task_id,
                budget,
                participant = participant.endpoint(),
                "assessment started"
            );

            let mut start = TaskUpdate::new(0, budget, "Episode started")
                .with_metadata("assessment_id", assessment_id.clone())
                .with_metadata("task_id", task_id.clone())
                .with_metadata("subject_id", subject_id.clone());
            if budget == 0 {
                start = start
                    .done()
                    .with_metadata("termination", Termination::MaxStepsReached.as_str());
            }
            yield AssessmentEvent::TaskUpdate(start);

            let mut trace = Trace::new();
            let mut observation = reset.observation;
            let mut termination = Termination::MaxStepsReached;
            let mut total_steps = 0;

            for step in 1..=budget {
                let prompt = match environment.render_observation(&observation) {
                    Ok(prompt) => prompt,
                    Err(error) => {
                        tracing::warn!(assessment_id = %assessment_id, step, %error, "failed to render observation");
                        let report = ErrorReport::new(ErrorKind::Environment, error.to_string());
                        yield errored(step, budget, &report);
                        guard.complete();
                        yield failure(report, &assessment_id, Some(&task_id), subject_id.as_deref(), total_steps);
                        return;
                    }
                };

                let message = RemoteMessage::observation(prompt);
                let action = match exchange(participant.as_ref(), &message, timeout).await {
                    Ok(action) => action,
                    Err(error) => {
                        tracing::warn!(
                            assessment_id = %assessment_id,
                            step,
                            kind = error.kind(),
                            %error,
                            "participant exchange failed"
                        );
                        let report = ErrorReport::transport(&error);
                        yield errored(step, budget, &report);
                        guard.complete();
                        yield failure(report, &assessment_id, Some(&task_id), subject_id.as_deref(), total_steps);
                        return;
                    }
                };
                total_steps = step;

                match action {
                    ParticipantAction::CallTool { tool_name, arguments } => {
                        let invocation = Invocation::new(tool_name, arguments);
                        let result = environment.step(&invocation).await;
                        tracing::debug!(
                            assessment_id = %assessment_id,
                            step,
                            capability = %invocation.capability,
                            ok = result.outcome.is_ok(),
                            "capability invoked"
                        );

                        let mut update = TaskUpdate::new(
                            step,
                            budget,
                            format!("Step {step}: call_tool - {}", invocation.capability),
                        )
                        .with_metadata("action_type", "call_tool")
                        .with_metadata("tool_name", invocation.capability.clone());
                        update = match &result.outcome {
                            Ok(_) => update.with_metadata("outcome", "ok"),
                            Err(error) => update
                                .with_metadata("outcome", "error")
                                .with_metadata("error", error.to_string()),
                        };
                        if step == budget {
                            update = update
                                .done()
                                .with_metadata("termination", Termination::MaxStepsReached.as_str());
                        }

                        trace.record_invocation(invocation, &result.outcome);
                        observation = result.observation;
                        yield AssessmentEvent::TaskUpdate(update);
                    }
                    ParticipantAction::Finish { final_summary } => {
                        tracing::debug!(assessment_id = %assessment_id, step, "participant finished");
                        trace.record_finish(final_summary);
                        termination = Termination::Finished;
                        yield AssessmentEvent::TaskUpdate(
                            TaskUpdate::new(step, budget, format!("Step {step}: finish"))
                                .done()
                                .with_metadata("action_type", "finish")
                                .with_metadata("termination", Termination::Finished.as_str()),
                        );
                        break;
                    }
                }
            }

            if termination == Termination::MaxStepsReached {
                tracing::info!(assessment_id = %assessment_id, budget, "step budget exhausted without finish");
            }

            let artifact = match environment.evaluate(&trace).await {
                Ok(evaluation) => {
                    tracing::info!(
                        assessment_id = %assessment_id,
                        task_id = %task_id,
                        total_steps,
                        correct = evaluation.correct,
                        score = evaluation.score,
                        "assessment finished"
                    );
                    AssessmentEvent::Artifact(Artifact::result(EvaluationReport {
                        assessment_id: assessment_id.clone(),
                        task_id: task_id.clone(),
                        subject_id: subject_id.clone(),
                        total_steps,
                        evaluation: EvaluationOutcome {
                            correct: evaluation.correct,
                            extracted_answer: evaluation.extracted_answer,
                            error: evaluation.error,
                        },
                        final_summary: trace.final_summary().map(str::to_string),
                        summary: evaluation.summary,
                        termination,
                        score: evaluation.score,
                        timestamp: Utc::now(),
                    }))
                }
                Err(error) => {
                    tracing::warn!(assessment_id = %assessment_id, %error, "evaluation failed");
                    let report = ErrorReport::new(ErrorKind::Environment, error.to_string());
                    failure(report, &assessment_id, Some(&task_id), subject_id.as_deref(), total_steps)
                }
            };
            guard.complete();
            yield artifact;
        })
    }
}

/// One exchange, bounded by `timeout`. Never retried.
async fn exchange(
    participant: &dyn Participant,
    message: &RemoteMessage,
    timeout: Duration,
) -> Result<ParticipantAction, TransportError> {
    match tokio::time::timeout(timeout, participant.exchange(message)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            url: participant.endpoint().to_string(),
            after: timeout,
        }),
    }
}

/// Terminal progress event for a step that could not complete.
fn errored(step: u32, budget: u32, report: &ErrorReport) -> AssessmentEvent {
    let mut update = TaskUpdate::new(
        step,
        budget,
        format!("Step {step}: error - {}", report.error_kind.as_str()),
    )
    .done()
    .with_metadata("termination", Termination::Errored.as_str())
    .with_metadata("error_kind", report.error_kind.as_str())
    .with_metadata("error", report.error.clone());
    if let Some(failure) = &report.transport_failure {
        update = update.with_metadata("transport_failure", failure.clone());
    }
    AssessmentEvent::TaskUpdate(update)
}

fn failure(
    mut report: ErrorReport,
    assessment_id: &str,
    task_id: Option<&str>,
    subject_id: Option<&str>,
    total_steps: u32,
) -> AssessmentEvent {
    report.assessment_id = Some(assessment_id.to_string());
    report.task_id = task_id.map(str::to_string);
    report.subject_id = subject_id.map(str::to_string);
    report.total_steps = total_steps;
    AssessmentEvent::Artifact(Artifact::error(report))
}

/// Logs when a run is dropped before its artifact went out.
struct EpisodeGuard {
    assessment_id: String,
    completed: bool,
}

impl EpisodeGuard {
    fn new(assessment_id: &str) -> Self {
        Self {
            assessment_id: assessment_id.to_string(),
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for EpisodeGuard {
    fn drop(&mut self) {
        if !self.completed {
            tracing::info!(assessment_id = %self.assessment_id, "assessment abandoned before completion");
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use serde_json::{json, Map, Value};

    use super::*;
    use crate::{
        environment::{
            CapabilityRegistry, CapabilitySpec, Evaluation, Observation, Reset, StaticCapability,
            StepResult, Task, TaskCatalog, TaskEnvironment,
        },
        error::EnvironmentError,
        participant::{self, ScriptedParticipant},
        protocol::{ArtifactContent, ArtifactKind},
    };

    fn environment() -> Box<dyn Environment> {
        let catalog = TaskCatalog::new(vec![Task::new("task1", "What is the MRN of Peter Stafford?")
            .with_subject("S6534835")
            .with_expected_answer(vec![json!("S6534835")])]);
        let registry = CapabilityRegistry::new()
            .with_capability(Arc::new(StaticCapability::new(
                CapabilitySpec::new("find_patient", "Search patients by name"),
                r#"{"mrn":"S6534835"}"#,
            )))
            .unwrap();
        Box::new(TaskEnvironment::new(Arc::new(catalog), Arc::new(registry)))
    }

    fn config(value: Value) -> AssessmentConfig {
        AssessmentConfig::from_map(value.as_object().unwrap_or(&Map::new()))
    }

    async fn collect(orchestrator: AssessmentOrchestrator) -> Vec<AssessmentEvent> {
        orchestrator.run().collect().await
    }

    fn updates(events: &[AssessmentEvent]) -> Vec<&TaskUpdate> {
        events
            .iter()
            .filter_map(|event| match event {
                AssessmentEvent::TaskUpdate(update) => Some(update),
                AssessmentEvent::Artifact(_) => None,
            })
            .collect()
    }

    fn artifact(events: &[AssessmentEvent]) -> &Artifact {
        match events.last() {
            Some(AssessmentEvent::Artifact(artifact)) => artifact,
            other => panic!("stream did not end with an artifact: {other:?}"),
        }
    }

    fn assert_well_formed(events: &[AssessmentEvent]) {
        assert_eq!(events.iter().filter(|event| event.is_artifact()).count(), 1);
        assert!(events.last().map_or(false, AssessmentEvent::is_artifact));
        let steps: Vec<u32> = updates(events).iter().map(|update| update.step).collect();
        assert!(steps.windows(2).all(|pair| pair[0] < pair[1]), "steps {steps:?}");
        if let Some(first) = steps.first() {
            assert_eq!(*first, 0);
        }
        let updates = updates(events);
        if let Some((last, earlier)) = updates.split_last() {
            assert!(last.done, "last progress event is terminal");
            assert!(earlier.iter().all(|update| !update.done));
        }
        assert!(artifact(events).done);
    }

    #[tokio::test]
    async fn finish_at_step_k_reports_k_steps() {
        let participant = Arc::new(ScriptedParticipant::new([
            ParticipantAction::call_tool("find_patient", json!({ "name": "Peter Stafford" })),
            ParticipantAction::finish("[\"S6534835\"]"),
        ]));
        let orchestrator = AssessmentOrchestrator::new(
            config(json!({ "max_steps": 5 })),
            environment(),
            participant.clone(),
        );
        let assessment_id = orchestrator.assessment_id().to_string();
        let events = collect(orchestrator).await;

        assert_well_formed(&events);
        let updates = updates(&events);
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0].status, "Episode started");
        assert_eq!(updates[0].metadata["assessment_id"], json!(assessment_id));
        assert_eq!(updates[1].status, "Step 1: call_tool - find_patient");
        assert_eq!(updates[1].metadata["outcome"], "ok");
        assert!(!updates[1].done);
        assert_eq!(updates[2].status, "Step 2: finish");
        assert!(updates[2].done);
        assert_eq!(updates[2].metadata["termination"], "finished");

        let artifact = artifact(&events);
        assert_eq!(artifact.artifact_type, ArtifactKind::EvaluationResult);
        let ArtifactContent::Result(report) = &artifact.content else {
            panic!("expected an evaluation result");
        };
        assert_eq!(report.total_steps, 2);
        assert_eq!(report.termination, Termination::Finished);
        assert!(report.evaluation.correct);
        assert_eq!(report.score, 1.0);
        assert_eq!(report.summary, "[\"S6534835\"]");
        assert_eq!(report.assessment_id, assessment_id);
        assert_eq!(participant.exchanges(), 2);
    }

    #[tokio::test]
    async fn never_finishing_exhausts_the_budget() {
        let participant = Arc::new(ScriptedParticipant::new(
            (0..10).map(|_| ParticipantAction::call_tool("find_patient", json!({}))),
        ));
        let events = collect(AssessmentOrchestrator::new(
            config(json!({ "max_steps": 3 })),
            environment(),
            participant.clone(),
        ))
        .await;

        assert_well_formed(&events);
        assert_eq!(participant.exchanges(), 3);
        let updates = updates(&events);
        assert_eq!(updates.len(), 4);
        let last = updates[3];
        assert!(last.done);
        assert_eq!(last.metadata["termination"], "max_steps_reached");
        assert!(updates[..3].iter().all(|update| !update.done));

        let ArtifactContent::Result(report) = &artifact(&events).content else {
            panic!("expected an evaluation result");
        };
        assert_eq!(report.termination, Termination::MaxStepsReached);
        assert_eq!(report.total_steps, 3);
        assert_eq!(report.evaluation.error.as_deref(), Some("no_final_answer"));
        assert_eq!(report.final_summary, None);
        assert_eq!(report.summary, "Ran out of steps without a final answer");
        assert_eq!(report.score, 0.0);
    }

    #[tokio::test]
    async fn finish_on_last_step_counts_as_finish() {
        let participant = Arc::new(ScriptedParticipant::new([
            ParticipantAction::call_tool("find_patient", json!({})),
            ParticipantAction::finish("S6534835"),
        ]));
        let events = collect(AssessmentOrchestrator::new(
            config(json!({ "max_steps": 2 })),
            environment(),
            participant,
        ))
        .await;

        assert_well_formed(&events);
        let ArtifactContent::Result(report) = &artifact(&events).content else {
            panic!("expected an evaluation result");
        };
        assert_eq!(report.termination, Termination::Finished);
        assert_eq!(report.total_steps, 2);
        assert!(report.evaluation.correct);
    }

    #[tokio::test]
    async fn bad_capability_calls_are_recorded_and_the_episode_continues() {
        let participant = Arc::new(ScriptedParticipant::new([
            ParticipantAction::call_tool("find_patients", json!({})),
            ParticipantAction::finish("[\"S6534835\"]"),
        ]));
        let events = collect(AssessmentOrchestrator::new(
            config(json!({})),
            environment(),
            participant,
        ))
        .await;

        assert_well_formed(&events);
        let updates = updates(&events);
        assert_eq!(updates[1].metadata["outcome"], "error");
        assert!(updates[1].metadata["error"]
            .as_str()
            .unwrap_or_default()
            .contains("did you mean 'find_patient'"));
        assert_eq!(updates[0].max_steps, crate::protocol::DEFAULT_MAX_STEPS);
    }

    #[tokio::test]
    async fn transport_failure_ends_with_error_artifact() {
        let participant = Arc::new(ScriptedParticipant::new([ParticipantAction::call_tool(
            "find_patient",
            json!({}),
        )]));
        let events = collect(AssessmentOrchestrator::new(
            config(json!({ "max_steps": 4 })),
            environment(),
            participant.clone(),
        ))
        .await;

        assert_well_formed(&events);
        let updates = updates(&events);
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[2].step, 2);
        assert_eq!(updates[2].status, "Step 2: error - transport");
        assert_eq!(updates[2].metadata["termination"], "errored");
        assert_eq!(updates[2].metadata["transport_failure"], "malformed_response");
        assert_eq!(participant.exchanges(), 2);

        let artifact = artifact(&events);
        assert_eq!(artifact.artifact_type, ArtifactKind::EvaluationError);
        let ArtifactContent::Error(report) = &artifact.content else {
            panic!("expected an error report");
        };
        assert_eq!(report.error_kind, ErrorKind::Transport);
        assert_eq!(report.transport_failure.as_deref(), Some("malformed_response"));
        assert_eq!(report.total_steps, 1);
        assert_eq!(report.task_id.as_deref(), Some("task1"));
        assert_eq!(report.score, 0.0);
    }

    #[tokio::test]
    async fn slow_participant_times_out_after_one_attempt() {
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = attempts.clone();
        let slow = participant::from_fn("slow", move |_message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, TransportError>(ParticipantAction::finish("late"))
            }
        });
        let events = collect(AssessmentOrchestrator::new(
            config(json!({ "max_steps": 3, "timeout_secs": 1 })),
            environment(),
            Arc::new(slow),
        ))
        .await;

        assert_well_formed(&events);
        assert_eq!(updates(&events).len(), 2);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
        let ArtifactContent::Error(report) = &artifact(&events).content else {
            panic!("expected an error report");
        };
        assert_eq!(report.transport_failure.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn reset_failure_emits_only_the_artifact() {
        let participant = Arc::new(ScriptedParticipant::new(Vec::new()));
        let events = collect(AssessmentOrchestrator::new(
            config(json!({ "task_id": "task99" })),
            environment(),
            participant.clone(),
        ))
        .await;

        assert_eq!(events.len(), 1);
        assert!(artifact(&events).done);
        let ArtifactContent::Error(report) = &artifact(&events).content else {
            panic!("expected an error report");
        };
        assert_eq!(report.error_kind, ErrorKind::Environment);
        assert!(report.error.contains("task99"));
        assert_eq!(participant.exchanges(), 0);
    }

    #[tokio::test]
    async fn zero_budget_starts_done() {
        let participant = Arc::new(ScriptedParticipant::new(Vec::new()));
        let events = collect(AssessmentOrchestrator::new(
            config(json!({ "max_steps": 0 })),
            environment(),
            participant.clone(),
        ))
        .await;

        assert_eq!(events.len(), 2);
        let updates = updates(&events);
        assert!(updates[0].done);
        assert_eq!(updates[0].metadata["termination"], "max_steps_reached");
        assert_eq!(participant.exchanges(), 0);
    }

    struct BrokenEvaluation;

    #[async_trait]
    impl Environment for BrokenEvaluation {
        async fn reset(&mut self, _config: &AssessmentConfig) -> Result<Reset, EnvironmentError> {
            Ok(Reset {
                observation: Observation {
                    task_id: "t".into(),
                    task_description: "Task: nothing".into(),
                    step: 0,
                    max_steps: 1,
                    available_tools: vec![],
                    last_tool_call: None,
                    last_tool_result_brief: None,
                    done: false,
                },
                step_budget: 1,
                task_id: "t".into(),
                subject_id: None,
            })
        }

        async fn step(&mut self, _invocation: &Invocation) -> StepResult {
            unreachable!("no capability calls in this test")
        }

        async fn evaluate(&self, _trace: &Trace) -> Result<Evaluation, EnvironmentError> {
            Err(EnvironmentError::Evaluation("grader offline".into()))
        }
    }

    #[tokio::test]
    async fn evaluation_failure_becomes_error_artifact() {
        let participant = Arc::new(ScriptedParticipant::new([ParticipantAction::finish("done")]));
        let events = collect(AssessmentOrchestrator::new(
            config(json!({})),
            Box::new(BrokenEvaluation),
            participant,
        ))
        .await;

        assert_well_formed(&events);
        let ArtifactContent::Error(report) = &artifact(&events).content else {
            panic!("expected an error report");
        };
        assert_eq!(report.error_kind, ErrorKind::Environment);
        assert_eq!(report.total_steps, 1);
        assert!(report.error.contains("grader offline"));
    }

    #[tokio::test]
    async fn every_event_survives_a_json_round_trip() {
        let participant = Arc::new(ScriptedParticipant::new([
            ParticipantAction::call_tool("find_patient", json!({})),
            ParticipantAction::finish("[\"S6534835\"]"),
        ]));
        let events = collect(AssessmentOrchestrator::new(
            config(json!({})),
            environment(),
            participant,
        ))
        .await;

        for event in &events {
            let line = serde_json::to_string(event).unwrap();
            assert!(!line.contains('\n'));
            let parsed: AssessmentEvent = serde_json::from_str(&line).unwrap();
            assert_eq!(parsed.is_artifact(), event.is_artifact());
        }
    }

    #[tokio::test]
    async fn participant_receives_rendered_observations() {
        let participant = Arc::new(ScriptedParticipant::new([ParticipantAction::finish("x")]));
        collect(AssessmentOrchestrator::new(
            config(json!({})),
            environment(),
            participant.clone(),
        ))
        .await;

        let received = participant.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].role, "green_agent");
        assert_eq!(received[0].metadata["type"], "observation");
        assert!(received[0].content.contains("find_patient"));
    }
}
